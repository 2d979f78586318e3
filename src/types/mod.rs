//! Core domain types for identity watching.
//!
//! This module contains the identifiers, attribute snapshots, and persisted
//! rows shared by every other module.

pub mod attributes;
pub mod ids;
pub mod records;

// Re-export commonly used types at the module level
pub use attributes::{Attribute, Attributes};
pub use ids::{DeliveryId, EntityId, GroupId};
pub use records::{ChangeRecord, Channel, Entity, Group, Membership, Observation};
