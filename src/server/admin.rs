//! Operator API.
//!
//! All handlers take [`AdminAuth`], which rejects requests without the
//! configured bearer token before any handler code runs.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use super::AppState;
use crate::diagnostics::{Component, ErrorSummary, LastScan};
use crate::membership::{MembershipError, RegisterError};
use crate::scan::{ScanError, ScanTarget};
use crate::store::{SnapshotStore, StoreError};
use crate::types::{ChangeRecord, Entity, EntityId, Group, GroupId};

/// Recent ledger entries returned with an entity.
pub const HISTORY_LIMIT: usize = 10;

/// Errors returned by the operator API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing or invalid bearer token")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, self.to_string()).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<MembershipError> for ApiError {
    fn from(e: MembershipError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<RegisterError> for ApiError {
    fn from(e: RegisterError) -> Self {
        match e {
            RegisterError::EmptyName => ApiError::BadRequest(e.to_string()),
            RegisterError::NotFound(_) => ApiError::NotFound(e.to_string()),
            RegisterError::Persistence(e) => e.into(),
        }
    }
}

impl From<ScanError> for ApiError {
    fn from(e: ScanError) -> Self {
        ApiError::Unavailable(e.to_string())
    }
}

/// Proof that the request carried the admin bearer token.
#[derive(Debug)]
pub struct AdminAuth;

impl<S: SnapshotStore> FromRequestParts<AppState<S>> for AdminAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState<S>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        match token {
            Some(token) if token == state.settings().admin_token => Ok(AdminAuth),
            _ => {
                warn!(path = %parts.uri.path(), "Rejected operator request");
                Err(ApiError::Unauthorized)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterGroupRequest {
    pub group_id: GroupId,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterGroupResponse {
    pub group: Group,
    pub newly_active: bool,
}

/// Registers (or renames and reactivates) a group, then queues a scan of it.
///
/// The scan registers every current member silently, so later changes have a
/// baseline to compare against.
pub async fn register_group_handler<S: SnapshotStore>(
    State(app_state): State<AppState<S>>,
    _auth: AdminAuth,
    Json(request): Json<RegisterGroupRequest>,
) -> Result<Json<RegisterGroupResponse>, ApiError> {
    let registration = app_state
        .registry()
        .register_group(request.group_id, &request.name)
        .await?;

    if let Err(e) = app_state
        .scans()
        .trigger(ScanTarget::Group(request.group_id))
        .await
    {
        warn!(group = %request.group_id, error = %e, "Failed to queue initial scan");
        app_state
            .diagnostics()
            .record_error(Component::Registry, format!("group {}: {}", request.group_id, e));
    }

    Ok(Json(RegisterGroupResponse {
        group: registration.group,
        newly_active: registration.newly_active,
    }))
}

/// Stops monitoring a group. 204 whether or not it was active.
pub async fn deactivate_group_handler<S: SnapshotStore>(
    State(app_state): State<AppState<S>>,
    _auth: AdminAuth,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let was_active = app_state.registry().deactivate_group(GroupId(id)).await?;
    info!(group = id, was_active, "Group deactivated by operator");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
pub struct ScanRequestBody {
    #[serde(default)]
    pub group_id: Option<GroupId>,
}

/// Queues a scan of one group, or of every monitored group.
pub async fn scan_handler<S: SnapshotStore>(
    State(app_state): State<AppState<S>>,
    _auth: AdminAuth,
    Json(body): Json<ScanRequestBody>,
) -> Result<(StatusCode, &'static str), ApiError> {
    let target = match body.group_id {
        Some(id) => {
            let monitored = app_state.store().group(id).await?.is_some_and(|g| g.active);
            if !monitored {
                return Err(ApiError::NotFound(format!("group {} is not monitored", id)));
            }
            ScanTarget::Group(id)
        }
        None => ScanTarget::All,
    };
    app_state.scans().trigger(target).await?;
    Ok((StatusCode::ACCEPTED, "Accepted"))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub tracked_entity_count: usize,
    pub monitored_group_count: usize,
    pub scan_interval_secs: u64,
    pub notifications_sent: u64,
    pub notifications_dropped: u64,
    pub last_errors: BTreeMap<Component, ErrorSummary>,
    pub last_scans: Vec<LastScan>,
}

pub async fn status_handler<S: SnapshotStore>(
    State(app_state): State<AppState<S>>,
    _auth: AdminAuth,
) -> Result<Json<StatusResponse>, ApiError> {
    let counts = app_state.store().counts().await?;
    let diagnostics = app_state.diagnostics().snapshot();
    Ok(Json(StatusResponse {
        tracked_entity_count: counts.tracked_entities,
        monitored_group_count: counts.monitored_groups,
        scan_interval_secs: app_state.settings().scan_interval.as_secs(),
        notifications_sent: diagnostics.notifications_sent,
        notifications_dropped: diagnostics.notifications_dropped,
        last_errors: diagnostics.last_errors,
        last_scans: diagnostics.last_scans,
    }))
}

/// An entity row with its active groups and most recent changes.
#[derive(Debug, Serialize, Deserialize)]
pub struct EntityHistory {
    pub entity: Entity,
    pub groups: Vec<Group>,
    /// Most recent first.
    pub changes: Vec<ChangeRecord>,
}

pub async fn entity_handler<S: SnapshotStore>(
    State(app_state): State<AppState<S>>,
    _auth: AdminAuth,
    Path(id): Path<i64>,
) -> Result<Json<EntityHistory>, ApiError> {
    let id = EntityId(id);
    let entity = app_state
        .store()
        .entity(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("entity {} is not tracked", id)))?;
    let groups = app_state.tracker().active_groups(id).await?;
    let changes = app_state.store().changes_of(id, HISTORY_LIMIT).await?;

    Ok(Json(EntityHistory {
        entity,
        groups,
        changes,
    }))
}
