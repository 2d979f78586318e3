//! Ingress events pushed by the transport bridge.
//!
//! Every live signal the bridge forwards is one of four kinds. Name, handle,
//! profile, status and peer-settings pushes all arrive as `refresh`; messages
//! and service actions arrive as `seen`.
//!
//! ```json
//! {"kind":"joined","entity_id":42,"group_id":7,"attributes":{"first":"Alex"}}
//! {"kind":"left","entity_id":9,"group_id":3}
//! {"kind":"seen","entity_id":42,"group_id":7}
//! {"kind":"refresh","entity_id":42}
//! ```

use serde::{Deserialize, Serialize};

use crate::types::{Attributes, EntityId, GroupId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IngressEvent {
    /// The entity joined or was added to a group.
    Joined {
        entity_id: EntityId,
        group_id: GroupId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attributes: Option<Attributes>,
    },

    /// The entity left or was removed from a group.
    Left {
        entity_id: EntityId,
        group_id: GroupId,
    },

    /// The entity was active in a group (message, service action).
    Seen {
        entity_id: EntityId,
        group_id: GroupId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attributes: Option<Attributes>,
    },

    /// Something about the entity may have changed; re-fetch it.
    Refresh {
        entity_id: EntityId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attributes: Option<Attributes>,
    },
}

impl IngressEvent {
    pub fn entity_id(&self) -> EntityId {
        match self {
            IngressEvent::Joined { entity_id, .. }
            | IngressEvent::Left { entity_id, .. }
            | IngressEvent::Seen { entity_id, .. }
            | IngressEvent::Refresh { entity_id, .. } => *entity_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            IngressEvent::Joined { .. } => "joined",
            IngressEvent::Left { .. } => "left",
            IngressEvent::Seen { .. } => "seen",
            IngressEvent::Refresh { .. } => "refresh",
        }
    }
}
