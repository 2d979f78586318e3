//! Membership Tracker: group rosters.
//!
//! Join and leave are structural events, not attribute deltas. A departure
//! flips `Membership.active` and keeps the row, so `last_seen_at` remains an
//! audit of when the entity was last present.
//!
//! Membership writes take the same per-entity token as the reconciler and
//! hold it across the entity's activation and reconciliation, so a join and
//! a leave for one entity never interleave.

mod groups;

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::reconcile::{ReconcileError, ReconcileOutcome, Reconciler};
use crate::store::{SnapshotStore, StoreError};
use crate::types::{Entity, EntityId, Group, GroupId, Membership, Observation};

pub use groups::{GroupRegistry, RegisterError, Registration};

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    /// The group is not registered, or has been deactivated.
    #[error("group {0} is not monitored")]
    UnmonitoredGroup(GroupId),
}

/// Groups where both the membership and the group are active, ordered by id.
///
/// An empty result means the entity is out of scope for change detection.
pub async fn active_groups<S: SnapshotStore>(
    store: &S,
    entity_id: EntityId,
) -> Result<Vec<Group>, StoreError> {
    let mut groups = Vec::new();
    for membership in store.memberships_of(entity_id).await? {
        if !membership.active {
            continue;
        }
        if let Some(group) = store.group(membership.group_id).await?
            && group.active
        {
            groups.push(group);
        }
    }
    Ok(groups)
}

/// Result of [`MembershipTracker::join`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// The membership was absent or inactive before this join.
    pub joined: bool,
    /// The entity row was reactivated by this join.
    pub reactivated: bool,
    /// Reconciliation of the observation that came with the join.
    pub reconcile: ReconcileOutcome,
}

/// Result of [`MembershipTracker::leave`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// An active membership was deactivated. `false` for repeated leaves.
    pub departed: bool,
    pub group: Group,
    /// The entity row, if it was ever registered.
    pub entity: Option<Entity>,
    /// Active groups after the departure.
    pub remaining: Vec<Group>,
    /// The entity row is inactive because no group remains.
    pub deactivated: bool,
}

#[derive(Debug)]
pub struct MembershipTracker<S> {
    reconciler: Arc<Reconciler<S>>,
    deactivate_on_last_leave: bool,
}

impl<S: SnapshotStore> MembershipTracker<S> {
    pub fn new(reconciler: Arc<Reconciler<S>>, deactivate_on_last_leave: bool) -> Self {
        MembershipTracker {
            reconciler,
            deactivate_on_last_leave,
        }
    }

    pub fn reconciler(&self) -> &Arc<Reconciler<S>> {
        &self.reconciler
    }

    fn store(&self) -> &S {
        self.reconciler.store().as_ref()
    }

    async fn monitored_group(&self, group_id: GroupId) -> Result<Group, MembershipError> {
        match self.store().group(group_id).await? {
            Some(group) if group.active => Ok(group),
            _ => Err(MembershipError::UnmonitoredGroup(group_id)),
        }
    }

    /// Records the entity as present in `group_id`, reactivates it, then
    /// reconciles the observation that came with the event. All three steps
    /// run under one hold of the entity's token.
    #[instrument(skip(self, observation), fields(entity = %observation.entity_id, group = %group_id))]
    pub async fn join(
        &self,
        observation: &Observation,
        group_id: GroupId,
    ) -> Result<JoinOutcome, MembershipError> {
        let entity_id = observation.entity_id;
        self.monitored_group(group_id).await?;

        let token = self.reconciler.locks().lock(entity_id).await;
        let now = Utc::now();
        let existing = self.store().membership(entity_id, group_id).await?;
        let joined = existing.as_ref().is_none_or(|m| !m.active);
        let membership = match existing {
            Some(m) => Membership {
                active: true,
                last_seen_at: now,
                ..m
            },
            None => Membership {
                entity_id,
                group_id,
                active: true,
                added_at: now,
                last_seen_at: now,
            },
        };
        self.store().put_membership(membership).await?;
        if joined {
            info!("Entity joined group");
        }

        let reactivated = self
            .reconciler
            .set_active_held(&token, entity_id, true)
            .await?;
        let reconcile = self.reconciler.reconcile_held(&token, observation).await?;

        Ok(JoinOutcome {
            joined,
            reactivated,
            reconcile,
        })
    }

    /// Records a departure. The membership row is kept with its last
    /// `last_seen_at`.
    ///
    /// Everything the departure decides (remaining groups, deactivation, the
    /// entity row for the report) is settled before the membership write,
    /// which is the last fallible step. A failed leave leaves the membership
    /// active, so retrying it is still a departure.
    #[instrument(skip(self))]
    pub async fn leave(
        &self,
        entity_id: EntityId,
        group_id: GroupId,
    ) -> Result<LeaveOutcome, MembershipError> {
        let group = self.monitored_group(group_id).await?;

        let token = self.reconciler.locks().lock(entity_id).await;
        let current = self
            .store()
            .membership(entity_id, group_id)
            .await?
            .filter(|m| m.active);
        let remaining: Vec<Group> = active_groups(self.store(), entity_id)
            .await?
            .into_iter()
            .filter(|g| g.id != group_id)
            .collect();

        let Some(membership) = current else {
            debug!("Leave for an inactive membership, ignoring");
            return Ok(LeaveOutcome {
                departed: false,
                group,
                entity: self.store().entity(entity_id).await?,
                remaining,
                deactivated: false,
            });
        };

        let deactivate = remaining.is_empty() && self.deactivate_on_last_leave;
        if deactivate {
            self.reconciler
                .set_active_held(&token, entity_id, false)
                .await?;
        }
        let entity = self.store().entity(entity_id).await?;
        self.store()
            .put_membership(Membership {
                active: false,
                ..membership
            })
            .await?;

        let deactivated = deactivate && entity.is_some();
        info!(remaining = remaining.len(), deactivated, "Entity left group");

        Ok(LeaveOutcome {
            departed: true,
            group,
            entity,
            remaining,
            deactivated,
        })
    }

    /// Bumps `last_seen_at` without changing `active`.
    ///
    /// Returns `false` if there is no membership row for the pair.
    #[instrument(skip(self))]
    pub async fn touch(&self, entity_id: EntityId, group_id: GroupId) -> Result<bool, MembershipError> {
        let _token = self.reconciler.locks().lock(entity_id).await;
        let Some(membership) = self.store().membership(entity_id, group_id).await? else {
            return Ok(false);
        };
        self.store()
            .put_membership(Membership {
                last_seen_at: Utc::now(),
                ..membership
            })
            .await?;
        Ok(true)
    }

    /// Whether the entity has an active membership in `group_id`.
    pub async fn is_member(
        &self,
        entity_id: EntityId,
        group_id: GroupId,
    ) -> Result<bool, MembershipError> {
        Ok(self
            .store()
            .membership(entity_id, group_id)
            .await?
            .is_some_and(|m| m.active))
    }

    /// See [`active_groups`].
    pub async fn active_groups(&self, entity_id: EntityId) -> Result<Vec<Group>, MembershipError> {
        Ok(active_groups(self.store(), entity_id).await?)
    }
}
