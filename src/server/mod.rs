//! HTTP server for the identity watcher.
//!
//! This module implements the HTTP server that:
//! - Accepts signed events from the transport bridge and queues them for the
//!   ingest task
//! - Provides the operator API: group registration, scans, status, history
//! - Provides health checks for liveness probes
//!
//! # Endpoints
//!
//! - `POST /webhook` - Accepts bridge deliveries (returns 202 Accepted)
//! - `POST /api/v1/groups` - Registers a group and scans it
//! - `DELETE /api/v1/groups/{id}` - Stops monitoring a group
//! - `POST /api/v1/scan` - Triggers a scan of one group or all of them
//! - `GET /api/v1/status` - Counts, notification totals and last errors
//! - `GET /api/v1/entities/{id}` - An entity, its groups and recent changes
//! - `GET /health` - Returns 200 if server is running
//!
//! Every `/api/v1` endpoint requires `Authorization: Bearer <admin token>`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::http::StatusCode;

pub mod admin;
pub mod signature;
pub mod webhook;

pub use admin::{
    ApiError, EntityHistory, StatusResponse, deactivate_group_handler, entity_handler,
    register_group_handler, scan_handler, status_handler,
};
pub use webhook::webhook_handler;

use crate::config::Config;
use crate::diagnostics::Diagnostics;
use crate::ingest::{IngestHandle, SeenDeliveries};
use crate::membership::{GroupRegistry, MembershipTracker};
use crate::scan::ScanHandle;
use crate::store::SnapshotStore;

/// Secrets and settings the handlers need.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Secret for HMAC-SHA256 signature verification of bridge deliveries.
    pub webhook_secret: Vec<u8>,
    /// Bearer token for the operator API.
    pub admin_token: String,
    /// Reported in the status view.
    pub scan_interval: Duration,
}

impl From<&Config> for ServerSettings {
    fn from(config: &Config) -> Self {
        ServerSettings {
            webhook_secret: config.webhook_secret.as_bytes().to_vec(),
            admin_token: config.admin_token.clone(),
            scan_interval: config.scan.interval,
        }
    }
}

/// Shared application state.
///
/// This is passed to all handlers via Axum's `State` extractor.
pub struct AppState<S> {
    inner: Arc<AppStateInner<S>>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        AppState {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct AppStateInner<S> {
    tracker: Arc<MembershipTracker<S>>,
    registry: Arc<GroupRegistry<S>>,
    ingest: IngestHandle,
    scans: ScanHandle,
    diagnostics: Arc<Diagnostics>,
    deliveries: Mutex<SeenDeliveries>,
    settings: ServerSettings,
}

impl<S: SnapshotStore> AppState<S> {
    pub fn new(
        tracker: Arc<MembershipTracker<S>>,
        registry: Arc<GroupRegistry<S>>,
        ingest: IngestHandle,
        scans: ScanHandle,
        diagnostics: Arc<Diagnostics>,
        settings: ServerSettings,
    ) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                tracker,
                registry,
                ingest,
                scans,
                diagnostics,
                deliveries: Mutex::new(SeenDeliveries::new()),
                settings,
            }),
        }
    }

    pub fn tracker(&self) -> &MembershipTracker<S> {
        &self.inner.tracker
    }

    pub fn store(&self) -> &S {
        self.inner.tracker.reconciler().store()
    }

    pub fn registry(&self) -> &GroupRegistry<S> {
        &self.inner.registry
    }

    pub fn ingest(&self) -> &IngestHandle {
        &self.inner.ingest
    }

    pub fn scans(&self) -> &ScanHandle {
        &self.inner.scans
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.inner.diagnostics
    }

    /// Delivery ids seen by the webhook.
    pub fn deliveries(&self) -> MutexGuard<'_, SeenDeliveries> {
        self.inner
            .deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.inner.settings
    }
}

/// Health check handler.
///
/// Returns 200 OK with the text "OK".
pub async fn health_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

/// Builds the axum Router with all endpoints.
pub fn build_router<S: SnapshotStore>(app_state: AppState<S>) -> axum::Router {
    use axum::routing::{delete, get, post};

    axum::Router::new()
        .route("/webhook", post(webhook_handler::<S>))
        .route("/api/v1/groups", post(register_group_handler::<S>))
        .route("/api/v1/groups/{id}", delete(deactivate_group_handler::<S>))
        .route("/api/v1/scan", post(scan_handler::<S>))
        .route("/api/v1/status", get(status_handler::<S>))
        .route("/api/v1/entities/{id}", get(entity_handler::<S>))
        .route("/health", get(health_handler))
        .with_state(app_state)
}
