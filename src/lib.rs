//! Identity Watch - reports identity attribute changes across monitored groups.
//!
//! This library provides the change detector, the entity reconciler and the
//! services around them: membership tracking, periodic scans, live ingress,
//! notifications and the HTTP surface.

pub mod config;
pub mod detect;
pub mod diagnostics;
pub mod ingest;
pub mod membership;
pub mod notify;
pub mod reconcile;
pub mod retry;
pub mod scan;
pub mod server;
pub mod store;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;
