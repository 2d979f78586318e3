//! Live ingress: turns bridge events into joins, leaves and reconciliations.
//!
//! Events are processed one at a time on the ingest task, in arrival order.
//! An event that cannot be processed right now is deferred on a timer instead
//! of blocking the queue:
//!
//! - Lookup rate limited: retried after exactly the signaled wait
//! - Persistence failure: retried after the retry interval, without limit
//! - Lookup failure: retried after the retry interval, at most
//!   [`MAX_LOOKUP_ATTEMPTS`] times
//! - Entity not found, or group not monitored: dropped
//!
//! While an entity has a deferred event, later events for the same entity
//! queue up behind it, so a join is never applied after the leave that
//! followed it.

mod dedupe;
mod event;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::diagnostics::{Component, Diagnostics};
use crate::membership::{MembershipError, MembershipTracker};
use crate::notify::{Notification, NotifierHandle};
use crate::reconcile::{ReconcileError, ReconcileOutcome};
use crate::store::SnapshotStore;
use crate::transport::{Directory, SourceError};
use crate::types::{Attributes, Channel, EntityId, GroupId, Observation};

pub use dedupe::{DEFAULT_DEDUPE_TTL_HOURS, SeenDeliveries};
pub use event::IngressEvent;

/// Queue capacity between the webhook and the ingest task.
pub const INGEST_QUEUE_CAPACITY: usize = 1024;

/// Delay before retrying an event after a non-rate-limit failure.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Attempts allowed for an event whose lookup keeps failing.
pub const MAX_LOOKUP_ATTEMPTS: u32 = 3;

/// Deferred events held at once. Beyond this, failing events are dropped.
const MAX_DEFERRED: usize = 4096;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("lookup failed: {0}")]
    Source(#[from] SourceError),

    #[error(transparent)]
    Membership(#[from] MembershipError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

impl IngestError {
    /// Delay before the next attempt, or `None` if the event should be
    /// dropped. `attempts` counts the attempts made so far.
    pub fn retry_delay(&self, retry_interval: Duration, attempts: u32) -> Option<Duration> {
        match self {
            IngestError::Source(SourceError::RateLimited { wait }) => Some(*wait),
            IngestError::Source(SourceError::NotFound(_)) => None,
            IngestError::Source(SourceError::Failed(_)) => {
                (attempts < MAX_LOOKUP_ATTEMPTS).then_some(retry_interval)
            }
            IngestError::Membership(MembershipError::UnmonitoredGroup(_)) => None,
            IngestError::Membership(_) | IngestError::Reconcile(_) => Some(retry_interval),
        }
    }

    /// Expected outcomes that are not worth an error summary.
    fn is_benign(&self) -> bool {
        matches!(
            self,
            IngestError::Source(SourceError::NotFound(_))
                | IngestError::Membership(MembershipError::UnmonitoredGroup(_))
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("ingest queue is full")]
    Full,
    #[error("ingest task is not running")]
    Closed,
}

/// Submits events to the ingest task. Cheap to clone.
#[derive(Debug, Clone)]
pub struct IngestHandle {
    tx: mpsc::Sender<IngressEvent>,
}

impl IngestHandle {
    /// Enqueues without waiting.
    pub fn submit(&self, event: IngressEvent) -> Result<(), SubmitError> {
        self.tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => SubmitError::Full,
            TrySendError::Closed(_) => SubmitError::Closed,
        })
    }
}

/// Creates the ingest queue and a handle that feeds it.
pub fn queue(capacity: usize) -> (IngestHandle, mpsc::Receiver<IngressEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    (IngestHandle { tx }, rx)
}

#[derive(Debug)]
struct Deferred {
    event: IngressEvent,
    due: Instant,
    attempts: u32,
    seq: u64,
}

/// Timers for events waiting to be retried.
#[derive(Debug, Default)]
struct DeferredQueue {
    items: Vec<Deferred>,
    next_seq: u64,
}

impl DeferredQueue {
    /// Wraps a freshly received event.
    fn admit(&mut self, event: IngressEvent) -> Deferred {
        let seq = self.next_seq;
        self.next_seq += 1;
        Deferred {
            event,
            due: Instant::now(),
            attempts: 0,
            seq,
        }
    }

    /// Schedules `item` at its `due` time. Later events for the same entity
    /// are pushed back so they never overtake it.
    fn push(&mut self, item: Deferred) {
        let entity = item.event.entity_id();
        for other in self.items.iter_mut() {
            if other.event.entity_id() == entity && other.due < item.due {
                other.due = item.due;
            }
        }
        self.items.push(item);
    }

    fn next_due(&self) -> Option<Instant> {
        self.items.iter().map(|d| d.due).min()
    }

    /// Latest due time among deferred events for `entity`.
    fn blocking(&self, entity: EntityId) -> Option<Instant> {
        self.items
            .iter()
            .filter(|d| d.event.entity_id() == entity)
            .map(|d| d.due)
            .max()
    }

    /// Removes the earliest due event, oldest first among equal due times.
    fn pop_due(&mut self, now: Instant) -> Option<Deferred> {
        let index = self
            .items
            .iter()
            .enumerate()
            .filter(|(_, d)| d.due <= now)
            .min_by_key(|(_, d)| (d.due, d.seq))
            .map(|(i, _)| i)?;
        Some(self.items.swap_remove(index))
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

async fn sleep_until_due(due: Option<Instant>) {
    match due {
        Some(due) => tokio::time::sleep_until(due).await,
        None => std::future::pending().await,
    }
}

/// The ingest task.
#[derive(Debug)]
pub struct Ingest<S, D> {
    tracker: Arc<MembershipTracker<S>>,
    directory: Arc<D>,
    notifier: NotifierHandle,
    diagnostics: Arc<Diagnostics>,
    retry_interval: Duration,
}

impl<S: SnapshotStore, D: Directory> Ingest<S, D> {
    pub fn new(
        tracker: Arc<MembershipTracker<S>>,
        directory: Arc<D>,
        notifier: NotifierHandle,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Ingest {
            tracker,
            directory,
            notifier,
            diagnostics,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Processes events until shutdown or until every handle is dropped.
    #[instrument(skip_all)]
    pub async fn run(self, mut rx: mpsc::Receiver<IngressEvent>, shutdown: CancellationToken) {
        info!("Ingest task started");
        let mut deferred = DeferredQueue::default();

        loop {
            let mut item = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping ingest task");
                    break;
                }

                msg = rx.recv() => match msg {
                    Some(event) => {
                        let mut item = deferred.admit(event);
                        if let Some(due) = deferred.blocking(item.event.entity_id()) {
                            debug!(entity = %item.event.entity_id(), "Entity has a deferred event, queueing behind it");
                            item.due = due;
                            deferred.push(item);
                            continue;
                        }
                        item
                    }
                    None => {
                        info!("Ingest channel closed");
                        break;
                    }
                },

                _ = sleep_until_due(deferred.next_due()) => {
                    let Some(item) = deferred.pop_due(Instant::now()) else {
                        continue;
                    };
                    item
                }
            };

            item.attempts += 1;
            if let Err(e) = self.handle(&item.event).await {
                self.defer_or_drop(&mut deferred, item, e);
            }
        }

        if !deferred.is_empty() {
            warn!(pending = deferred.len(), "Ingest stopped with deferred events");
        }
    }

    fn defer_or_drop(
        &self,
        deferred: &mut DeferredQueue,
        mut item: Deferred,
        e: IngestError,
    ) {
        let (event, attempts) = (&item.event, item.attempts);
        if e.is_benign() {
            debug!(kind = event.kind(), entity = %event.entity_id(), reason = %e, "Ignoring event");
            return;
        }

        match e.retry_delay(self.retry_interval, attempts) {
            Some(delay) if deferred.len() < MAX_DEFERRED => {
                warn!(
                    kind = event.kind(),
                    entity = %event.entity_id(),
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Event failed, retrying later"
                );
                item.due = Instant::now() + delay;
                deferred.push(item);
            }
            _ => {
                error!(
                    kind = event.kind(),
                    entity = %event.entity_id(),
                    attempts,
                    error = %e,
                    "Event failed, dropping"
                );
                self.diagnostics.record_error(
                    Component::Ingest,
                    format!("{} entity {}: {}", event.kind(), event.entity_id(), e),
                );
            }
        }
    }

    /// Applies one event.
    #[instrument(skip(self, event), fields(kind = event.kind(), entity = %event.entity_id()))]
    pub async fn handle(&self, event: &IngressEvent) -> Result<(), IngestError> {
        match event {
            IngressEvent::Joined {
                entity_id,
                group_id,
                attributes,
            } => self.join(*entity_id, *group_id, attributes.as_ref()).await,

            IngressEvent::Left {
                entity_id,
                group_id,
            } => {
                let outcome = self.tracker.leave(*entity_id, *group_id).await?;
                if outcome.departed {
                    self.notifier.notify(Notification::Left {
                        entity_id: *entity_id,
                        entity: outcome.entity,
                        group: outcome.group,
                        remaining: outcome.remaining,
                    });
                }
                Ok(())
            }

            IngressEvent::Seen {
                entity_id,
                group_id,
                attributes,
            } => {
                if !self.tracker.is_member(*entity_id, *group_id).await? {
                    return self.join(*entity_id, *group_id, attributes.as_ref()).await;
                }
                self.tracker.touch(*entity_id, *group_id).await?;
                if let Some(attributes) = attributes {
                    let observation =
                        Observation::new(*entity_id, attributes.clone(), Channel::Membership);
                    let outcome = self.tracker.reconciler().reconcile(&observation).await?;
                    self.report(outcome);
                }
                Ok(())
            }

            IngressEvent::Refresh {
                entity_id,
                attributes,
            } => {
                let observation = self
                    .observe(*entity_id, attributes.as_ref(), Channel::Push)
                    .await?;
                let outcome = self.tracker.reconciler().reconcile(&observation).await?;
                if outcome == ReconcileOutcome::OutOfScope {
                    debug!("Refresh for an entity outside every monitored group");
                }
                self.report(outcome);
                Ok(())
            }
        }
    }

    async fn join(
        &self,
        entity_id: EntityId,
        group_id: GroupId,
        attributes: Option<&Attributes>,
    ) -> Result<(), IngestError> {
        let monitored = self
            .tracker
            .reconciler()
            .store()
            .group(group_id)
            .await
            .map_err(MembershipError::from)?
            .is_some_and(|g| g.active);
        if !monitored {
            return Err(MembershipError::UnmonitoredGroup(group_id).into());
        }

        let observation = self
            .observe(entity_id, attributes, Channel::Membership)
            .await?;
        let outcome = self.tracker.join(&observation, group_id).await?;
        self.report(outcome.reconcile);
        Ok(())
    }

    /// Uses the embedded snapshot when it is complete, otherwise fetches the
    /// entity. The fetch is attempted once; a rate limit defers the event.
    async fn observe(
        &self,
        entity_id: EntityId,
        embedded: Option<&Attributes>,
        channel: Channel,
    ) -> Result<Observation, IngestError> {
        let attributes = match embedded {
            Some(attributes) if attributes.is_complete() => attributes.clone(),
            _ => self.directory.fetch_entity(entity_id).await?,
        };
        Ok(Observation::new(entity_id, attributes, channel))
    }

    fn report(&self, outcome: ReconcileOutcome) {
        if let ReconcileOutcome::Changed {
            entity,
            groups,
            deltas,
        } = outcome
        {
            self.notifier.notify(Notification::Changed {
                entity,
                groups,
                deltas,
            });
        }
    }
}
