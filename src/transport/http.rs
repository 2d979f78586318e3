//! HTTP client for the transport bridge.
//!
//! Endpoints, relative to the configured base URL:
//!
//! | Call | Request |
//! |------|---------|
//! | `fetch_entity` | `GET /entities/{id}` → attributes object |
//! | `list_group_members` | `GET /groups/{id}/members` → `[{entity_id, attributes}]` |
//! | `group_title` | `GET /groups/{id}` → `{"title": ...}` |
//! | `deliver` | `POST /messages {"chat_id", "text"}` |
//!
//! HTTP 429 maps to a rate limit using the `Retry-After` header (seconds).

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{Attributes, EntityId, GroupId};

use super::{DeliveryChannel, DeliveryError, Directory, MemberRecord, SourceError};

/// Wait used when a 429 carries no usable `Retry-After`.
const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(1);

/// Request timeout for every bridge call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct GroupInfo {
    title: String,
}

#[derive(Debug, Serialize)]
struct OutboundMessage<'a> {
    chat_id: i64,
    text: &'a str,
}

/// A failed HTTP exchange, before it is mapped to a caller-facing error.
#[derive(Debug, PartialEq, Eq)]
enum Failure {
    RateLimited(Duration),
    NotFound,
    Other(String),
}

impl From<Failure> for SourceError {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::RateLimited(wait) => SourceError::RateLimited { wait },
            Failure::NotFound => SourceError::NotFound("bridge returned 404".to_string()),
            Failure::Other(msg) => SourceError::Failed(msg),
        }
    }
}

impl From<Failure> for DeliveryError {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::RateLimited(wait) => DeliveryError::RateLimited { wait },
            Failure::NotFound => DeliveryError::Failed("observer chat not found".to_string()),
            Failure::Other(msg) => DeliveryError::Failed(msg),
        }
    }
}

/// Parses `Retry-After` as whole seconds.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn classify(status: StatusCode, headers: &HeaderMap) -> Option<Failure> {
    if status.is_success() {
        None
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        Some(Failure::RateLimited(
            retry_after(headers).unwrap_or(DEFAULT_RATE_LIMIT_WAIT),
        ))
    } else if status == StatusCode::NOT_FOUND {
        Some(Failure::NotFound)
    } else {
        Some(Failure::Other(format!("bridge returned HTTP {}", status)))
    }
}

/// Client for the bridge. Cheap to clone.
#[derive(Debug, Clone)]
pub struct HttpBridge {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    observer_id: i64,
}

impl HttpBridge {
    /// Creates a client. `observer_id` is the chat that receives reports.
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        observer_id: i64,
    ) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SourceError::Failed(format!("building HTTP client: {}", e)))?;

        Ok(HttpBridge {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
            observer_id,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response, Failure> {
        let response = builder
            .send()
            .await
            .map_err(|e| Failure::Other(e.to_string()))?;
        match classify(response.status(), response.headers()) {
            Some(failure) => Err(failure),
            None => Ok(response),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, SourceError> {
        debug!(path, "Bridge GET");
        let response = self.send(self.request(Method::GET, path)).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| SourceError::Failed(format!("decoding {}: {}", path, e)))
    }
}

impl Directory for HttpBridge {
    async fn fetch_entity(&self, id: EntityId) -> Result<Attributes, SourceError> {
        self.get_json(&format!("/entities/{}", id)).await
    }

    async fn list_group_members(&self, group: GroupId) -> Result<Vec<MemberRecord>, SourceError> {
        self.get_json(&format!("/groups/{}/members", group)).await
    }

    async fn group_title(&self, group: GroupId) -> Result<String, SourceError> {
        let info: GroupInfo = self.get_json(&format!("/groups/{}", group)).await?;
        Ok(info.title)
    }
}

impl DeliveryChannel for HttpBridge {
    async fn deliver(&self, text: &str) -> Result<(), DeliveryError> {
        let body = OutboundMessage {
            chat_id: self.observer_id,
            text,
        };
        self.send(self.request(Method::POST, "/messages").json(&body))
            .await?;
        Ok(())
    }
}
