//! Volatile store backed by in-process tables.

use tokio::sync::RwLock;

use crate::types::{ChangeRecord, Entity, EntityId, Group, GroupId, Membership};

use super::state::{JournalRecord, StoreState};
use super::{Result, SnapshotStore, StoreCounts};

/// A [`SnapshotStore`] that keeps everything in memory.
///
/// Each mutation is applied under a single write lock, which gives
/// `commit_entity` its atomicity.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with `state`.
    pub fn with_state(state: StoreState) -> Self {
        MemoryStore {
            state: RwLock::new(state),
        }
    }

    /// Returns a copy of the full state.
    pub async fn snapshot(&self) -> StoreState {
        self.state.read().await.clone()
    }

    async fn apply(&self, record: JournalRecord) -> Result<()> {
        self.state.write().await.apply(record);
        Ok(())
    }
}

impl SnapshotStore for MemoryStore {
    async fn entity(&self, id: EntityId) -> Result<Option<Entity>> {
        Ok(self.state.read().await.entity(id))
    }

    async fn commit_entity(&self, entity: Entity, changes: Vec<ChangeRecord>) -> Result<()> {
        self.apply(JournalRecord::EntityCommitted { entity, changes })
            .await
    }

    async fn group(&self, id: GroupId) -> Result<Option<Group>> {
        Ok(self.state.read().await.group(id))
    }

    async fn put_group(&self, group: Group) -> Result<()> {
        self.apply(JournalRecord::GroupPut { group }).await
    }

    async fn groups(&self) -> Result<Vec<Group>> {
        Ok(self.state.read().await.groups())
    }

    async fn membership(
        &self,
        entity_id: EntityId,
        group_id: GroupId,
    ) -> Result<Option<Membership>> {
        Ok(self.state.read().await.membership(entity_id, group_id))
    }

    async fn put_membership(&self, membership: Membership) -> Result<()> {
        self.apply(JournalRecord::MembershipPut { membership }).await
    }

    async fn memberships_of(&self, entity_id: EntityId) -> Result<Vec<Membership>> {
        Ok(self.state.read().await.memberships_of(entity_id))
    }

    async fn changes_of(&self, entity_id: EntityId, limit: usize) -> Result<Vec<ChangeRecord>> {
        Ok(self.state.read().await.changes_of(entity_id, limit))
    }

    async fn counts(&self) -> Result<StoreCounts> {
        Ok(self.state.read().await.counts())
    }
}
