//! In-memory tables shared by every store implementation.
//!
//! [`StoreState`] holds the four tables and knows how to apply a
//! [`JournalRecord`]. Stores mutate state only through [`StoreState::apply`],
//! so the live path and journal replay cannot drift apart.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{ChangeRecord, Entity, EntityId, Group, GroupId, Membership};

use super::StoreCounts;

/// One durable mutation.
///
/// Serialized with internal tagging: `{"type": "entity_committed", ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JournalRecord {
    /// An entity row and the ledger entries produced by the same
    /// reconciliation. Applied as one unit.
    EntityCommitted {
        entity: Entity,
        changes: Vec<ChangeRecord>,
    },

    /// A group row was inserted or replaced.
    GroupPut { group: Group },

    /// A membership row was inserted or replaced.
    MembershipPut { membership: Membership },
}

/// The full persisted state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreState {
    pub entities: HashMap<EntityId, Entity>,
    pub groups: HashMap<GroupId, Group>,
    pub memberships: HashMap<EntityId, HashMap<GroupId, Membership>>,
    /// Append-only change ledger, in commit order.
    pub changes: Vec<ChangeRecord>,
}

impl StoreState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one mutation.
    pub fn apply(&mut self, record: JournalRecord) {
        match record {
            JournalRecord::EntityCommitted { entity, changes } => {
                self.entities.insert(entity.id, entity);
                self.changes.extend(changes);
            }
            JournalRecord::GroupPut { group } => {
                self.groups.insert(group.id, group);
            }
            JournalRecord::MembershipPut { membership } => {
                self.memberships
                    .entry(membership.entity_id)
                    .or_default()
                    .insert(membership.group_id, membership);
            }
        }
    }

    pub fn entity(&self, id: EntityId) -> Option<Entity> {
        self.entities.get(&id).cloned()
    }

    pub fn group(&self, id: GroupId) -> Option<Group> {
        self.groups.get(&id).cloned()
    }

    /// All groups, ordered by id.
    pub fn groups(&self) -> Vec<Group> {
        let mut groups: Vec<Group> = self.groups.values().cloned().collect();
        groups.sort_by_key(|g| g.id);
        groups
    }

    pub fn membership(&self, entity_id: EntityId, group_id: GroupId) -> Option<Membership> {
        self.memberships
            .get(&entity_id)
            .and_then(|by_group| by_group.get(&group_id))
            .cloned()
    }

    /// All membership rows of an entity, active or not, ordered by group id.
    pub fn memberships_of(&self, entity_id: EntityId) -> Vec<Membership> {
        let mut rows: Vec<Membership> = self
            .memberships
            .get(&entity_id)
            .map(|by_group| by_group.values().cloned().collect())
            .unwrap_or_default();
        rows.sort_by_key(|m| m.group_id);
        rows
    }

    /// Most recent ledger entries for an entity, newest first.
    pub fn changes_of(&self, entity_id: EntityId, limit: usize) -> Vec<ChangeRecord> {
        self.changes
            .iter()
            .rev()
            .filter(|c| c.entity_id == entity_id)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn counts(&self) -> StoreCounts {
        StoreCounts {
            tracked_entities: self.entities.values().filter(|e| e.active).count(),
            monitored_groups: self.groups.values().filter(|g| g.active).count(),
            change_records: self.changes.len(),
        }
    }
}
