//! Entity Reconciler: the compare-commit cycle for one observation.
//!
//! Any channel may observe the same real-world change zero, one, or many
//! times. The reconciler turns those redundant observations into exactly one
//! committed change:
//!
//! 1. Acquire the entity's serialization token
//! 2. Skip the entity if it has no active group
//! 3. Load the stored snapshot and run [`detect`]
//! 4. With no deltas on a registered entity, return [`ReconcileOutcome::NoChange`]
//!    without writing
//! 5. Otherwise commit the merged snapshot and one ledger entry per delta as
//!    a single store call
//! 6. Release the token and return the outcome
//!
//! A later caller for the same entity waits for the in-flight commit and then
//! detects against the committed snapshot, so a duplicate observation finds
//! nothing to report. The token is never held while a notification is
//! delivered; callers hand the outcome to the notifier after `reconcile`
//! returns.

mod locks;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::detect::{Delta, detect};
use crate::membership::active_groups;
use crate::store::{SnapshotStore, StoreError};
use crate::types::{Attributes, ChangeRecord, Entity, EntityId, Group, Observation};

pub use locks::{EntityGuard, EntityLocks};

/// Reconciliation failures.
///
/// A failed reconciliation is never "no change": the caller must retry the
/// observation later or the change may be lost.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

/// What a reconciliation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// First sight of the entity. Committed silently.
    Registered { entity: Entity },

    /// Reportable deltas were committed.
    Changed {
        /// The committed entity row.
        entity: Entity,
        /// Active groups at commit time, for the report.
        groups: Vec<Group>,
        /// Reportable deltas only, in attribute order.
        deltas: Vec<Delta>,
    },

    /// Only first-sight populations were committed. Nothing to report.
    Recorded,

    /// Already at the observed state. Nothing was written.
    NoChange,

    /// The entity has no active group. Nothing was read or written.
    OutOfScope,
}

impl ReconcileOutcome {
    /// True for outcomes that wrote the entity row.
    pub fn committed(&self) -> bool {
        matches!(
            self,
            ReconcileOutcome::Registered { .. }
                | ReconcileOutcome::Changed { .. }
                | ReconcileOutcome::Recorded
        )
    }
}

fn ledger(id: EntityId, deltas: &[Delta], observed_at: DateTime<Utc>) -> Vec<ChangeRecord> {
    deltas
        .iter()
        .map(|delta| ChangeRecord {
            entity_id: id,
            attribute: delta.attribute,
            old_value: delta.old.clone(),
            new_value: delta.new.clone(),
            observed_at,
        })
        .collect()
}

/// The only writer of entity rows.
#[derive(Debug)]
pub struct Reconciler<S> {
    store: Arc<S>,
    locks: EntityLocks,
}

impl<S: SnapshotStore> Reconciler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Reconciler {
            store,
            locks: EntityLocks::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The per-entity tokens. Membership writes take the same token.
    pub(crate) fn locks(&self) -> &EntityLocks {
        &self.locks
    }

    /// Reconciles one observation against the stored snapshot.
    #[instrument(skip(self, observation), fields(entity = %observation.entity_id, channel = %observation.channel))]
    pub async fn reconcile(
        &self,
        observation: &Observation,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let token = self.locks.lock(observation.entity_id).await;
        self.reconcile_held(&token, observation).await
    }

    /// [`Reconciler::reconcile`] for a caller that already holds the entity's
    /// token.
    pub(crate) async fn reconcile_held(
        &self,
        _token: &EntityGuard<'_>,
        observation: &Observation,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let id = observation.entity_id;
        let groups = active_groups(self.store.as_ref(), id).await?;
        if groups.is_empty() {
            debug!("Entity has no active group, skipping");
            return Ok(ReconcileOutcome::OutOfScope);
        }

        let now = Utc::now();
        let Some(stored) = self.store.entity(id).await? else {
            let deltas = detect(&Attributes::default(), &observation.attributes);
            let entity = Entity::register(id, &observation.attributes, now);
            self.store
                .commit_entity(entity.clone(), ledger(id, &deltas, now))
                .await?;
            info!(name = %entity.display_name(), "Registered entity");
            return Ok(ReconcileOutcome::Registered { entity });
        };

        let deltas = detect(&stored.attributes, &observation.attributes);
        if deltas.is_empty() {
            return Ok(ReconcileOutcome::NoChange);
        }

        let entity = Entity {
            attributes: stored.attributes.merged_with(&observation.attributes),
            last_reconciled_at: now,
            ..stored
        };
        self.store
            .commit_entity(entity.clone(), ledger(id, &deltas, now))
            .await?;

        let deltas: Vec<Delta> = deltas.into_iter().filter(Delta::is_reportable).collect();
        if deltas.is_empty() {
            debug!("Recorded first-sight attributes");
            return Ok(ReconcileOutcome::Recorded);
        }

        info!(changed = deltas.len(), "Committed attribute change");
        Ok(ReconcileOutcome::Changed {
            entity,
            groups,
            deltas,
        })
    }

    /// Sets the entity's `active` flag. Returns `false` if the entity is
    /// unknown or already in that state.
    #[instrument(skip(self))]
    pub async fn set_active(&self, id: EntityId, active: bool) -> Result<bool, ReconcileError> {
        let token = self.locks.lock(id).await;
        self.set_active_held(&token, id, active).await
    }

    pub(crate) async fn set_active_held(
        &self,
        _token: &EntityGuard<'_>,
        id: EntityId,
        active: bool,
    ) -> Result<bool, ReconcileError> {
        let Some(stored) = self.store.entity(id).await? else {
            return Ok(false);
        };
        if stored.active == active {
            return Ok(false);
        }

        self.store
            .commit_entity(Entity { active, ..stored }, Vec::new())
            .await?;
        info!(active, "Entity activity changed");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::test_utils::{FailingStore, membership, store_with_groups};
    use crate::types::{Attribute, Channel, GroupId};

    async fn in_group(entity: i64, group: i64) -> Arc<MemoryStore> {
        let store = store_with_groups(&[(group, "Group")]).await;
        store.put_membership(membership(entity, group)).await.unwrap();
        Arc::new(store)
    }

    fn observe(id: i64, attributes: Attributes) -> Observation {
        Observation::new(EntityId(id), attributes, Channel::Push)
    }

    // ─── Unit Tests ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn first_sight_registers_silently_with_ledger_entries() {
        let store = in_group(42, 7).await;
        let reconciler = Reconciler::new(store.clone());

        let outcome = reconciler
            .reconcile(&observe(42, Attributes::named("Alex").with_last("Kim")))
            .await
            .unwrap();

        assert!(matches!(outcome, ReconcileOutcome::Registered { .. }));
        let changes = store.changes_of(EntityId(42), 10).await.unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.old_value.is_empty()));
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let store = in_group(42, 7).await;
        let reconciler = Reconciler::new(store.clone());
        reconciler
            .reconcile(&observe(42, Attributes::named("Alex")))
            .await
            .unwrap();

        let first = reconciler
            .reconcile(&observe(42, Attributes::named("Alexis")))
            .await
            .unwrap();
        let second = reconciler
            .reconcile(&observe(42, Attributes::named("Alexis")))
            .await
            .unwrap();

        assert!(matches!(first, ReconcileOutcome::Changed { .. }));
        assert_eq!(second, ReconcileOutcome::NoChange);
    }

    #[tokio::test]
    async fn no_change_does_not_write() {
        let store = in_group(1, 1).await;
        let reconciler = Reconciler::new(store.clone());
        reconciler
            .reconcile(&observe(1, Attributes::named("A")))
            .await
            .unwrap();
        let before = store.entity(EntityId(1)).await.unwrap();

        reconciler
            .reconcile(&observe(1, Attributes::named(" A ")))
            .await
            .unwrap();

        assert_eq!(store.entity(EntityId(1)).await.unwrap(), before);
    }

    #[tokio::test]
    async fn changed_carries_groups_and_only_reportable_deltas() {
        let store = in_group(5, 3).await;
        let reconciler = Reconciler::new(store.clone());
        reconciler
            .reconcile(&observe(5, Attributes::named("Sam")))
            .await
            .unwrap();

        let outcome = reconciler
            .reconcile(&observe(5, Attributes::named("Samuel").with_handle("sam")))
            .await
            .unwrap();

        let ReconcileOutcome::Changed {
            entity,
            groups,
            deltas,
        } = outcome
        else {
            panic!("expected Changed, got {:?}", outcome);
        };
        assert_eq!(entity.attributes.handle.as_deref(), Some("sam"));
        assert_eq!(groups.iter().map(|g| g.id).collect::<Vec<_>>(), vec![GroupId(3)]);
        assert_eq!(deltas, vec![Delta::new(Attribute::FirstName, "Sam", "Samuel")]);
        // Both deltas are in the ledger, including the first-sight handle.
        assert_eq!(store.changes_of(EntityId(5), 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn first_sight_only_is_recorded_not_reported() {
        let store = in_group(5, 3).await;
        let reconciler = Reconciler::new(store.clone());
        reconciler
            .reconcile(&observe(5, Attributes::named("Sam")))
            .await
            .unwrap();

        let outcome = reconciler
            .reconcile(&observe(5, Attributes::named("Sam").with_phone("+1555")))
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Recorded);
        let stored = store.entity(EntityId(5)).await.unwrap().unwrap();
        assert_eq!(stored.attributes.phone.as_deref(), Some("+1555"));
    }

    #[tokio::test]
    async fn entity_without_active_group_is_out_of_scope() {
        let store = Arc::new(store_with_groups(&[(1, "G")]).await);
        let reconciler = Reconciler::new(store.clone());

        let outcome = reconciler
            .reconcile(&observe(9, Attributes::named("Nine")))
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::OutOfScope);
        assert!(store.entity(EntityId(9)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn persistence_failure_is_surfaced_and_state_untouched() {
        let inner = store_with_groups(&[(1, "G")]).await;
        inner.put_membership(membership(2, 1)).await.unwrap();
        let store = Arc::new(FailingStore::new(inner));
        let reconciler = Reconciler::new(store.clone());
        store.set_failing(true);

        let result = reconciler
            .reconcile(&observe(2, Attributes::named("Two")))
            .await;

        assert!(matches!(result, Err(ReconcileError::Persistence(_))));
        assert!(store.entity(EntityId(2)).await.unwrap().is_none());

        // The same observation succeeds once the store recovers.
        store.set_failing(false);
        let retried = reconciler
            .reconcile(&observe(2, Attributes::named("Two")))
            .await
            .unwrap();
        assert!(matches!(retried, ReconcileOutcome::Registered { .. }));
    }

    #[tokio::test]
    async fn set_active_toggles_only_on_change() {
        let store = in_group(1, 1).await;
        let reconciler = Reconciler::new(store.clone());
        reconciler
            .reconcile(&observe(1, Attributes::named("A")))
            .await
            .unwrap();

        assert!(!reconciler.set_active(EntityId(1), true).await.unwrap());
        assert!(reconciler.set_active(EntityId(1), false).await.unwrap());
        assert!(!store.entity(EntityId(1)).await.unwrap().unwrap().active);
        assert!(!reconciler.set_active(EntityId(404), false).await.unwrap());
    }

    // ─── Concurrency ──────────────────────────────────────────────────────────

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_duplicates_commit_once() {
        let store = in_group(42, 7).await;
        let reconciler = Arc::new(Reconciler::new(store.clone()));
        reconciler
            .reconcile(&observe(42, Attributes::named("Alex").with_last("Kim")))
            .await
            .unwrap();

        let n = 12;
        let mut tasks = Vec::new();
        for _ in 0..n {
            let reconciler = reconciler.clone();
            tasks.push(tokio::spawn(async move {
                reconciler
                    .reconcile(&observe(42, Attributes::named("Alexis").with_last("Kim")))
                    .await
                    .unwrap()
            }));
        }
        let mut outcomes = Vec::new();
        for task in tasks {
            outcomes.push(task.await.unwrap());
        }

        let changed = outcomes
            .iter()
            .filter(|o| matches!(o, ReconcileOutcome::Changed { .. }))
            .count();
        let unchanged = outcomes
            .iter()
            .filter(|o| **o == ReconcileOutcome::NoChange)
            .count();
        assert_eq!(changed, 1);
        assert_eq!(unchanged, n - 1);

        let renames: Vec<_> = store
            .changes_of(EntityId(42), 100)
            .await
            .unwrap()
            .into_iter()
            .filter(|c| c.new_value == "Alexis")
            .collect();
        assert_eq!(renames.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_sight_registers_once() {
        let store = in_group(3, 1).await;
        let reconciler = Arc::new(Reconciler::new(store.clone()));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let reconciler = reconciler.clone();
            tasks.push(tokio::spawn(async move {
                reconciler
                    .reconcile(&observe(3, Attributes::named("Three")))
                    .await
                    .unwrap()
            }));
        }
        let mut registered = 0;
        for task in tasks {
            if matches!(task.await.unwrap(), ReconcileOutcome::Registered { .. }) {
                registered += 1;
            }
        }

        assert_eq!(registered, 1);
        assert_eq!(store.changes_of(EntityId(3), 100).await.unwrap().len(), 1);
    }
}
