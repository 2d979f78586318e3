//! Durable store: journal plus generation snapshots.
//!
//! # Why Generation-Based Compaction?
//!
//! "Write snapshot, then truncate journal" is not crash-safe: a crash between
//! the two replays records that the snapshot already contains. Instead:
//!
//! 1. Write `snapshot.<N+1>.json` (atomic)
//! 2. Open `journal.<N+1>.log`
//! 3. Write `generation` = N+1 (atomic); this is the commit point
//! 4. Start appending to `journal.<N+1>.log`
//! 5. Only then delete generation N files
//!
//! At any crash point the `generation` file names a complete snapshot and the
//! journal written after it. A compaction that fails before step 3 leaves
//! generation N live, and writes keep going to `journal.<N>.log`.
//!
//! # Recovery
//!
//! 1. Read `generation` (missing means 0)
//! 2. Load `snapshot.<N>.json` (generation 0 may have none)
//! 3. Replay `journal.<N>.log`, truncating a torn tail
//! 4. Remove files from other generations

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::types::{ChangeRecord, Entity, EntityId, Group, GroupId, Membership};

use super::durable::{
    journal_path, read_generation, remove_stale_generations, snapshot_path, write_generation,
};
use super::journal::Journal;
use super::snapshot::{PersistedSnapshot, save_snapshot, try_load_snapshot};
use super::state::{JournalRecord, StoreState};
use super::{Result, SnapshotStore, StoreCounts, StoreError};

/// Default number of journal records between compactions.
pub const DEFAULT_COMPACT_EVERY: usize = 1000;

/// A [`SnapshotStore`] persisted under a state directory.
#[derive(Debug)]
pub struct FileStore {
    inner: Mutex<FileInner>,
}

#[derive(Debug)]
struct FileInner {
    state_dir: PathBuf,
    generation: u64,
    state: StoreState,
    journal: Journal,
    since_compaction: usize,
    compact_every: usize,
}

impl FileStore {
    /// Opens the store at `state_dir`, recovering any existing state.
    pub fn open(state_dir: impl AsRef<Path>, compact_every: usize) -> Result<Self> {
        let state_dir = state_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&state_dir)?;

        let generation = read_generation(&state_dir)?;
        let (mut state, mut next_seq) =
            match try_load_snapshot(&snapshot_path(&state_dir, generation))? {
                Some(snapshot) => (snapshot.state, snapshot.next_seq),
                None if generation == 0 => (StoreState::new(), 0),
                None => {
                    return Err(StoreError::Unavailable(format!(
                        "snapshot for generation {} is missing",
                        generation
                    )));
                }
            };

        let entries = Journal::replay(journal_path(&state_dir, generation))?;
        let replayed = entries.len();
        for entry in entries {
            next_seq = next_seq.max(entry.seq + 1);
            state.apply(entry.record);
        }

        let removed = remove_stale_generations(&state_dir, generation)?;
        if removed > 0 {
            debug!(removed, "Removed stale generation files");
        }

        let journal = Journal::open(journal_path(&state_dir, generation), next_seq)?;

        info!(
            state_dir = %state_dir.display(),
            generation,
            replayed,
            entities = state.entities.len(),
            groups = state.groups.len(),
            "Opened file store"
        );

        Ok(FileStore {
            inner: Mutex::new(FileInner {
                state_dir,
                generation,
                state,
                journal,
                since_compaction: replayed,
                compact_every: compact_every.max(1),
            }),
        })
    }

    /// Forces a compaction into a new generation.
    pub async fn compact(&self) -> Result<()> {
        self.inner.lock().await.compact()
    }

    /// Current generation number.
    pub async fn generation(&self) -> u64 {
        self.inner.lock().await.generation
    }

    async fn write(&self, record: JournalRecord) -> Result<()> {
        self.inner.lock().await.write(record)
    }
}

impl FileInner {
    fn write(&mut self, record: JournalRecord) -> Result<()> {
        self.journal.append(record.clone())?;
        self.state.apply(record);
        self.since_compaction += 1;

        if self.since_compaction >= self.compact_every
            && let Err(e) = self.compact()
        {
            // The record is already durable in the current generation.
            warn!(error = %e, generation = self.generation, "Compaction failed");
        }
        Ok(())
    }

    fn compact(&mut self) -> Result<()> {
        let next = self.generation + 1;
        let next_seq = self.journal.next_seq();

        save_snapshot(
            &snapshot_path(&self.state_dir, next),
            &PersistedSnapshot::new(next, next_seq, self.state.clone()),
        )?;
        let journal = Journal::open(journal_path(&self.state_dir, next), next_seq)?;
        if let Err(e) = write_generation(&self.state_dir, next) {
            // The new generation file may have reached disk before the failure.
            if let Err(rollback) = write_generation(&self.state_dir, self.generation) {
                error!(error = %rollback, generation = self.generation, "Failed to restore generation file");
            }
            return Err(e);
        }

        self.journal = journal;
        self.generation = next;
        self.since_compaction = 0;

        remove_stale_generations(&self.state_dir, next)?;
        info!(generation = next, "Compacted store");
        Ok(())
    }
}

impl SnapshotStore for FileStore {
    async fn entity(&self, id: EntityId) -> Result<Option<Entity>> {
        Ok(self.inner.lock().await.state.entity(id))
    }

    async fn commit_entity(&self, entity: Entity, changes: Vec<ChangeRecord>) -> Result<()> {
        self.write(JournalRecord::EntityCommitted { entity, changes })
            .await
    }

    async fn group(&self, id: GroupId) -> Result<Option<Group>> {
        Ok(self.inner.lock().await.state.group(id))
    }

    async fn put_group(&self, group: Group) -> Result<()> {
        self.write(JournalRecord::GroupPut { group }).await
    }

    async fn groups(&self) -> Result<Vec<Group>> {
        Ok(self.inner.lock().await.state.groups())
    }

    async fn membership(
        &self,
        entity_id: EntityId,
        group_id: GroupId,
    ) -> Result<Option<Membership>> {
        Ok(self.inner.lock().await.state.membership(entity_id, group_id))
    }

    async fn put_membership(&self, membership: Membership) -> Result<()> {
        self.write(JournalRecord::MembershipPut { membership })
            .await
    }

    async fn memberships_of(&self, entity_id: EntityId) -> Result<Vec<Membership>> {
        Ok(self.inner.lock().await.state.memberships_of(entity_id))
    }

    async fn changes_of(&self, entity_id: EntityId, limit: usize) -> Result<Vec<ChangeRecord>> {
        Ok(self.inner.lock().await.state.changes_of(entity_id, limit))
    }

    async fn counts(&self) -> Result<StoreCounts> {
        Ok(self.inner.lock().await.state.counts())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Attribute, Attributes};
    use chrono::Utc;
    use std::fs;
    use std::io::Write;
    use tempfile::tempdir;

    fn entity(id: i64, first: &str) -> Entity {
        Entity::register(EntityId(id), &Attributes::named(first), Utc::now())
    }

    fn first_sight(id: i64, value: &str) -> ChangeRecord {
        ChangeRecord {
            entity_id: EntityId(id),
            attribute: Attribute::FirstName,
            old_value: String::new(),
            new_value: value.to_string(),
            observed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn commits_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::open(dir.path(), 100).unwrap();
            store
                .commit_entity(entity(42, "Alex"), vec![first_sight(42, "Alex")])
                .await
                .unwrap();
        }

        let store = FileStore::open(dir.path(), 100).unwrap();
        let loaded = store.entity(EntityId(42)).await.unwrap().unwrap();
        assert_eq!(loaded.display_name(), "Alex");
        assert_eq!(store.changes_of(EntityId(42), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn compaction_moves_to_next_generation_and_keeps_state() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::open(dir.path(), 2).unwrap();
            store.commit_entity(entity(1, "A"), vec![]).await.unwrap();
            store.commit_entity(entity(2, "B"), vec![]).await.unwrap();
            assert_eq!(store.generation().await, 1);
            store.commit_entity(entity(3, "C"), vec![]).await.unwrap();
        }

        assert!(dir.path().join("snapshot.1.json").exists());
        assert!(!dir.path().join("journal.0.log").exists());

        let store = FileStore::open(dir.path(), 2).unwrap();
        assert_eq!(store.generation().await, 1);
        assert_eq!(store.counts().await.unwrap().tracked_entities, 3);
    }

    #[tokio::test]
    async fn failed_compaction_keeps_writing_to_the_live_generation() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::open(dir.path(), 2).unwrap();
            // A directory in the way makes the next journal impossible to open.
            fs::create_dir(dir.path().join("journal.1.log")).unwrap();
            store.commit_entity(entity(1, "A"), vec![]).await.unwrap();
            store.commit_entity(entity(2, "B"), vec![]).await.unwrap();
            store.commit_entity(entity(3, "C"), vec![]).await.unwrap();
            assert_eq!(store.generation().await, 0);
        }
        assert_eq!(read_generation(dir.path()).unwrap(), 0);
        fs::remove_dir(dir.path().join("journal.1.log")).unwrap();

        let store = FileStore::open(dir.path(), 100).unwrap();
        assert_eq!(store.generation().await, 0);
        assert_eq!(store.counts().await.unwrap().tracked_entities, 3);
        assert!(!dir.path().join("snapshot.1.json").exists());
    }

    #[tokio::test]
    async fn torn_commit_is_discarded_on_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::open(dir.path(), 100).unwrap();
            store.commit_entity(entity(1, "A"), vec![]).await.unwrap();
        }
        {
            let mut file = fs::OpenOptions::new()
                .append(true)
                .open(dir.path().join("journal.0.log"))
                .unwrap();
            file.write_all(b"{\"seq\":1,\"ts\":\"2024-01-01T00:00:00Z\",\"type\":\"entity_co")
                .unwrap();
        }

        let store = FileStore::open(dir.path(), 100).unwrap();
        assert!(store.entity(EntityId(1)).await.unwrap().is_some());
        assert_eq!(store.counts().await.unwrap().tracked_entities, 1);

        // The journal is usable again after truncation.
        store.commit_entity(entity(2, "B"), vec![]).await.unwrap();
        drop(store);
        let store = FileStore::open(dir.path(), 100).unwrap();
        assert_eq!(store.counts().await.unwrap().tracked_entities, 2);
    }

    #[tokio::test]
    async fn missing_snapshot_for_nonzero_generation_is_an_error() {
        let dir = tempdir().unwrap();
        write_generation(dir.path(), 3).unwrap();
        assert!(matches!(
            FileStore::open(dir.path(), 100),
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn memberships_and_groups_persist() {
        let dir = tempdir().unwrap();
        let now = Utc::now();
        {
            let store = FileStore::open(dir.path(), 100).unwrap();
            store
                .put_group(Group {
                    id: GroupId(7),
                    name: "Seven".to_string(),
                    active: true,
                    registered_at: now,
                })
                .await
                .unwrap();
            store
                .put_membership(Membership {
                    entity_id: EntityId(42),
                    group_id: GroupId(7),
                    active: true,
                    added_at: now,
                    last_seen_at: now,
                })
                .await
                .unwrap();
        }

        let store = FileStore::open(dir.path(), 100).unwrap();
        assert_eq!(store.groups().await.unwrap().len(), 1);
        assert!(
            store
                .membership(EntityId(42), GroupId(7))
                .await
                .unwrap()
                .unwrap()
                .active
        );
    }
}
