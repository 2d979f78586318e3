//! Contracts of the remote collaborators.
//!
//! The session layer that talks to the remote network is out of process. It
//! pushes events to the webhook and answers lookups here:
//!
//! - [`Directory`]: entity and roster lookups, used by ingest and scans
//! - [`DeliveryChannel`]: outbound messages to the single observer
//!
//! Both may fail with a rate limit that carries the wait the remote side
//! requires. [`HttpBridge`] implements both over HTTP.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RateLimitSignal;
use crate::types::{Attributes, EntityId, GroupId};

pub mod http;

pub use http::HttpBridge;

/// Lookup failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// The remote side requires a wait before the next call.
    #[error("rate limited, retry after {}ms", .wait.as_millis())]
    RateLimited { wait: Duration },

    /// The entity or group no longer exists remotely.
    #[error("not found: {0}")]
    NotFound(String),

    /// Any other failure.
    #[error("lookup failed: {0}")]
    Failed(String),
}

impl RateLimitSignal for SourceError {
    fn rate_limit_wait(&self) -> Option<Duration> {
        match self {
            SourceError::RateLimited { wait } => Some(*wait),
            _ => None,
        }
    }
}

/// Outbound delivery failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("rate limited, retry after {}ms", .wait.as_millis())]
    RateLimited { wait: Duration },

    #[error("delivery failed: {0}")]
    Failed(String),
}

impl RateLimitSignal for DeliveryError {
    fn rate_limit_wait(&self) -> Option<Duration> {
        match self {
            DeliveryError::RateLimited { wait } => Some(*wait),
            DeliveryError::Failed(_) => None,
        }
    }
}

/// One row of a group roster.
///
/// Some rosters return stripped-down attributes; see
/// [`Attributes::is_complete`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub entity_id: EntityId,
    #[serde(default)]
    pub attributes: Attributes,
}

/// Entity and roster lookups.
pub trait Directory: Send + Sync + 'static {
    /// Fetches the current attributes of an entity.
    fn fetch_entity(
        &self,
        id: EntityId,
    ) -> impl Future<Output = Result<Attributes, SourceError>> + Send;

    /// Lists the current members of a group.
    fn list_group_members(
        &self,
        group: GroupId,
    ) -> impl Future<Output = Result<Vec<MemberRecord>, SourceError>> + Send;

    /// Fetches the display title of a group.
    fn group_title(
        &self,
        group: GroupId,
    ) -> impl Future<Output = Result<String, SourceError>> + Send;
}

/// The outbound channel to the observer.
pub trait DeliveryChannel: Send + Sync + 'static {
    fn deliver(&self, text: &str) -> impl Future<Output = Result<(), DeliveryError>> + Send;
}
