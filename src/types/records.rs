//! Persisted rows: entities, groups, memberships, and the change ledger.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::attributes::{Attribute, Attributes};
use super::ids::{EntityId, GroupId};

/// One tracked identity.
///
/// Attribute values reflect the most recently committed observation. Rows
/// are never deleted; an identity that leaves every monitored group is
/// deactivated instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub attributes: Attributes,
    pub first_seen_at: DateTime<Utc>,
    pub last_reconciled_at: DateTime<Utc>,
    pub active: bool,
}

impl Entity {
    /// Creates a freshly registered entity from its first observation.
    pub fn register(id: EntityId, observed: &Attributes, now: DateTime<Utc>) -> Self {
        Entity {
            id,
            attributes: Attributes::default().merged_with(observed),
            first_seen_at: now,
            last_reconciled_at: now,
            active: true,
        }
    }

    pub fn display_name(&self) -> String {
        self.attributes.display_name()
    }
}

/// A monitored population.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    /// Non-empty once registered; never overwritten with an empty value.
    pub name: String,
    pub active: bool,
    pub registered_at: DateTime<Utc>,
}

/// Entity-to-group membership, keyed by `(entity_id, group_id)`.
///
/// `active = false` records a departure without deleting history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub entity_id: EntityId,
    pub group_id: GroupId,
    pub active: bool,
    pub added_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Immutable change-ledger entry, one per changed attribute.
///
/// Unset values are recorded as the empty string, so a first-sight
/// population has an empty `old_value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub entity_id: EntityId,
    pub attribute: Attribute,
    pub old_value: String,
    pub new_value: String,
    pub observed_at: DateTime<Utc>,
}

/// The ingress channel an observation came from. Used for logging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// A live join/leave/presence event.
    Membership,
    /// A live "attribute may have changed" push.
    Push,
    /// A periodic full-population scan.
    Scan,
    /// An on-demand scan requested by the operator.
    Manual,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Channel::Membership => "membership",
            Channel::Push => "push",
            Channel::Scan => "scan",
            Channel::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// An entity id plus a freshly seen attribute snapshot, from any channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub entity_id: EntityId,
    pub attributes: Attributes,
    pub channel: Channel,
}

impl Observation {
    pub fn new(entity_id: EntityId, attributes: Attributes, channel: Channel) -> Self {
        Observation {
            entity_id,
            attributes,
            channel,
        }
    }
}
