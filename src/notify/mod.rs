//! Notifier: delivers confirmed events to the observer.
//!
//! Producers enqueue a [`Notification`] through a [`NotifierHandle`] and move
//! on; delivery happens on the notifier task, so an outage of the delivery
//! channel never blocks a reconciliation.
//!
//! # Failure policy
//!
//! - Rate limited: retried once, after exactly the signaled wait
//! - Any other failure, or still rate limited after the retry: logged and
//!   dropped
//! - Queue full: dropped at enqueue time
//!
//! Nothing is retried indefinitely. A backlog that outlives an outage would
//! turn one outage into a delayed flood.

pub mod format;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::detect::Delta;
use crate::diagnostics::{Component, Diagnostics};
use crate::retry::{RetryPolicy, RetryResult, retry_rate_limited};
use crate::transport::DeliveryChannel;
use crate::types::{Entity, EntityId, Group};

/// Queue capacity between producers and the notifier task.
pub const NOTIFY_QUEUE_CAPACITY: usize = 1024;

/// An event for the observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Reportable attribute deltas were committed.
    Changed {
        entity: Entity,
        groups: Vec<Group>,
        deltas: Vec<Delta>,
    },

    /// An entity left a monitored group.
    Left {
        entity_id: EntityId,
        entity: Option<Entity>,
        group: Group,
        remaining: Vec<Group>,
    },

    /// The service started.
    Started {
        tracked_entities: usize,
        monitored_groups: usize,
    },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Changed { .. } => "changed",
            Notification::Left { .. } => "left",
            Notification::Started { .. } => "started",
        }
    }

    /// Renders the report text.
    pub fn render(&self) -> String {
        match self {
            Notification::Changed {
                entity,
                groups,
                deltas,
            } => format::format_change(entity, groups, deltas),
            Notification::Left {
                entity_id,
                entity,
                group,
                remaining,
            } => format::format_left(*entity_id, entity.as_ref(), group, remaining),
            Notification::Started {
                tracked_entities,
                monitored_groups,
            } => format::format_started(*tracked_entities, *monitored_groups),
        }
    }
}

/// Enqueues notifications. Cheap to clone.
#[derive(Debug, Clone)]
pub struct NotifierHandle {
    tx: mpsc::Sender<Notification>,
    diagnostics: Arc<Diagnostics>,
}

impl NotifierHandle {
    /// Enqueues without waiting. Returns `false` if the notification was
    /// dropped.
    pub fn notify(&self, notification: Notification) -> bool {
        match self.tx.try_send(notification) {
            Ok(()) => true,
            Err(TrySendError::Full(n)) => {
                warn!(kind = n.kind(), "Notification queue full, dropping");
                self.diagnostics.record_dropped();
                false
            }
            Err(TrySendError::Closed(n)) => {
                warn!(kind = n.kind(), "Notifier stopped, dropping");
                self.diagnostics.record_dropped();
                false
            }
        }
    }
}

/// Creates the notification queue and a handle that feeds it.
pub fn queue(
    diagnostics: Arc<Diagnostics>,
    capacity: usize,
) -> (NotifierHandle, mpsc::Receiver<Notification>) {
    let (tx, rx) = mpsc::channel(capacity);
    (NotifierHandle { tx, diagnostics }, rx)
}

/// The notifier task.
#[derive(Debug)]
pub struct Notifier<C> {
    channel: Arc<C>,
    diagnostics: Arc<Diagnostics>,
    policy: RetryPolicy,
}

impl<C: DeliveryChannel> Notifier<C> {
    pub fn new(channel: Arc<C>, diagnostics: Arc<Diagnostics>) -> Self {
        Notifier {
            channel,
            diagnostics,
            policy: RetryPolicy::ONCE,
        }
    }

    /// Delivers queued notifications until shutdown or until every handle
    /// is dropped.
    #[instrument(skip_all)]
    pub async fn run(self, mut rx: mpsc::Receiver<Notification>, shutdown: CancellationToken) {
        info!("Notifier started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping notifier");
                    break;
                }

                msg = rx.recv() => {
                    match msg {
                        Some(notification) => {
                            self.deliver(&notification, &shutdown).await;
                        }
                        None => {
                            info!("Notification channel closed");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Delivers one notification. Returns `true` if it reached the channel.
    #[instrument(skip_all, fields(kind = notification.kind()))]
    pub async fn deliver(&self, notification: &Notification, shutdown: &CancellationToken) -> bool {
        let text = notification.render();
        let result =
            retry_rate_limited(self.policy, shutdown, "deliver", || self.channel.deliver(&text))
                .await;

        match result {
            RetryResult::Success(()) => {
                info!("Notification delivered");
                self.diagnostics.record_sent();
                true
            }
            RetryResult::ExhaustedRetries { last_error, attempts } => {
                error!(error = %last_error, attempts, "Still rate limited, dropping notification");
                self.diagnostics.record_dropped();
                self.diagnostics.record_error(Component::Notifier, last_error);
                false
            }
            RetryResult::Failed(e) => {
                error!(error = %e, "Delivery failed, dropping notification");
                self.diagnostics.record_dropped();
                self.diagnostics.record_error(Component::Notifier, e);
                false
            }
            RetryResult::Cancelled => {
                warn!("Shutdown during delivery wait, dropping notification");
                self.diagnostics.record_dropped();
                false
            }
        }
    }
}
