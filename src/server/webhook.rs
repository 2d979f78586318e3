//! Webhook endpoint handler.
//!
//! Accepts bridge deliveries, validates signatures, drops redeliveries and
//! queues the event before returning 202 Accepted. The actual processing
//! happens asynchronously on the ingest task.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::AppState;
use super::signature::verify_signature;
use crate::ingest::{IngressEvent, SubmitError};
use crate::store::SnapshotStore;
use crate::types::DeliveryId;

/// Header name for the delivery ID.
pub const HEADER_DELIVERY: &str = "x-bridge-delivery";
/// Header name for the body signature.
pub const HEADER_SIGNATURE: &str = "x-bridge-signature";

/// Errors that can occur when accepting a delivery.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// Missing required header.
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),

    /// Invalid signature.
    #[error("invalid signature")]
    InvalidSignature,

    /// The body is not a known event.
    #[error("invalid event: {0}")]
    InvalidEvent(#[from] serde_json::Error),

    /// The ingest task cannot take the event right now.
    #[error("{0}")]
    Unavailable(#[from] SubmitError),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::MissingHeader(_) | WebhookError::InvalidEvent(_) => {
                StatusCode::BAD_REQUEST
            }
            WebhookError::InvalidSignature => StatusCode::UNAUTHORIZED,
            WebhookError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        (status, self.to_string()).into_response()
    }
}

/// Webhook handler.
///
/// # Request
///
/// - Method: POST
/// - Required headers:
///   - `X-Bridge-Delivery`: Unique delivery ID
///   - `X-Bridge-Signature`: `sha256=<hex>` HMAC-SHA256 of the body
/// - Body: one JSON [`IngressEvent`]
///
/// # Response
///
/// - 202 Accepted: Event queued, or a redelivery of one already queued
/// - 400 Bad Request: Missing header or unknown event
/// - 401 Unauthorized: Invalid signature
/// - 503 Service Unavailable: Ingest queue full or stopped; redeliver later
pub async fn webhook_handler<S: SnapshotStore>(
    State(app_state): State<AppState<S>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, &'static str), WebhookError> {
    let delivery_id = DeliveryId::new(get_header(&headers, HEADER_DELIVERY)?);
    let signature_header = get_header(&headers, HEADER_SIGNATURE)?;

    if !verify_signature(&body, &signature_header, &app_state.settings().webhook_secret) {
        warn!(delivery_id = %delivery_id, "Invalid webhook signature");
        return Err(WebhookError::InvalidSignature);
    }

    let event: IngressEvent = serde_json::from_slice(&body)?;
    debug!(
        delivery_id = %delivery_id,
        kind = event.kind(),
        entity = %event.entity_id(),
        "Received event"
    );

    if app_state
        .deliveries()
        .check_and_mark(&delivery_id, Utc::now())
    {
        debug!(delivery_id = %delivery_id, "Duplicate delivery (idempotent)");
        return Ok((StatusCode::ACCEPTED, "Accepted (duplicate)"));
    }

    let kind = event.kind();
    if let Err(e) = app_state.ingest().submit(event) {
        // Not queued, so a redelivery must not count as a duplicate.
        app_state.deliveries().forget(&delivery_id);
        warn!(delivery_id = %delivery_id, error = %e, "Failed to queue event");
        return Err(e.into());
    }

    info!(delivery_id = %delivery_id, kind, "Event queued");
    Ok((StatusCode::ACCEPTED, "Accepted"))
}

/// Extracts a required header value as a string.
fn get_header(headers: &HeaderMap, name: &'static str) -> Result<String, WebhookError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or(WebhookError::MissingHeader(name))
}
