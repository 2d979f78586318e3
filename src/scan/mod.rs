//! Scan Orchestrator: periodic and on-demand full-population scans.
//!
//! Each monitored group moves through `Idle → Scanning → Idle`. A scan lists
//! the group's roster and turns every member into one join plus one
//! reconciliation, paced by a fixed delay between members.
//!
//! # Rate limits
//!
//! Every group scan runs as its own task. A rate limit on a lookup suspends
//! that task for exactly the signaled wait and then retries the same call,
//! without limit: rate limits are routine during scans. Other groups keep
//! going. A group that fails for any other reason is logged and recorded in
//! diagnostics; it never affects another group's scan.
//!
//! Members missing from a roster are not treated as departures. Departures
//! come from leave events only.

mod report;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::diagnostics::{Component, Diagnostics};
use crate::membership::{GroupRegistry, MembershipError, MembershipTracker};
use crate::notify::{Notification, NotifierHandle};
use crate::reconcile::ReconcileOutcome;
use crate::retry::{RetryPolicy, RetryResult, retry_rate_limited, sleep_cancellable};
use crate::store::{SnapshotStore, StoreError};
use crate::transport::{Directory, SourceError};
use crate::types::{Channel, Group, GroupId, Observation};

pub use report::ScanReport;

/// Channel buffer size for scan requests.
const SCAN_CHANNEL_BUFFER: usize = 16;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("scan orchestrator is not running")]
    Stopped,
}

/// Which groups a scan covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanTarget {
    All,
    Group(GroupId),
}

/// Per-group scan state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanState {
    #[default]
    Idle,
    Scanning,
}

/// A queued scan request.
#[derive(Debug, Clone, Copy)]
pub struct ScanRequest {
    target: ScanTarget,
    channel: Channel,
}

impl ScanRequest {
    pub fn target(&self) -> ScanTarget {
        self.target
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }
}

/// Scan timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanConfig {
    /// Interval between periodic scans of every group.
    pub interval: Duration,
    /// Delay between two members of one group.
    pub member_interval: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            interval: Duration::from_secs(60),
            member_interval: Duration::from_millis(50),
        }
    }
}

/// Requests on-demand scans. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ScanHandle {
    tx: mpsc::Sender<ScanRequest>,
}

impl ScanHandle {
    /// Requests an immediate operator scan, out of band of the periodic
    /// timer.
    pub async fn trigger(&self, target: ScanTarget) -> Result<(), ScanError> {
        self.send(target, Channel::Manual).await
    }

    /// Requests an immediate scan on the service's own behalf, such as the
    /// one at startup.
    pub async fn schedule(&self, target: ScanTarget) -> Result<(), ScanError> {
        self.send(target, Channel::Scan).await
    }

    async fn send(&self, target: ScanTarget, channel: Channel) -> Result<(), ScanError> {
        self.tx
            .send(ScanRequest { target, channel })
            .await
            .map_err(|_| ScanError::Stopped)
    }
}

/// Creates the request queue and a handle that feeds it.
pub fn queue() -> (ScanHandle, mpsc::Receiver<ScanRequest>) {
    let (tx, rx) = mpsc::channel(SCAN_CHANNEL_BUFFER);
    (ScanHandle { tx }, rx)
}

/// Marks a group `Scanning` for as long as it lives.
struct ScanSlot {
    states: Arc<Mutex<HashMap<GroupId, ScanState>>>,
    group: GroupId,
}

impl Drop for ScanSlot {
    fn drop(&mut self) {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.group);
    }
}

#[derive(Debug)]
pub struct ScanOrchestrator<S, D> {
    tracker: Arc<MembershipTracker<S>>,
    registry: Arc<GroupRegistry<S>>,
    directory: Arc<D>,
    notifier: NotifierHandle,
    diagnostics: Arc<Diagnostics>,
    config: ScanConfig,
    states: Arc<Mutex<HashMap<GroupId, ScanState>>>,
}

impl<S: SnapshotStore, D: Directory> ScanOrchestrator<S, D> {
    pub fn new(
        tracker: Arc<MembershipTracker<S>>,
        registry: Arc<GroupRegistry<S>>,
        directory: Arc<D>,
        notifier: NotifierHandle,
        diagnostics: Arc<Diagnostics>,
        config: ScanConfig,
    ) -> Self {
        ScanOrchestrator {
            tracker,
            registry,
            directory,
            notifier,
            diagnostics,
            config,
            states: Arc::default(),
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn state(&self, group: GroupId) -> ScanState {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&group)
            .copied()
            .unwrap_or_default()
    }

    /// Moves `group` to `Scanning`. `None` if a scan is already running.
    fn claim(&self, group: GroupId) -> Option<ScanSlot> {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        if states.get(&group) == Some(&ScanState::Scanning) {
            return None;
        }
        states.insert(group, ScanState::Scanning);
        Some(ScanSlot {
            states: self.states.clone(),
            group,
        })
    }

    /// Runs the periodic timer and serves scan requests until shutdown.
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<ScanRequest>, shutdown: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Scan orchestrator started"
        );
        let start = tokio::time::Instant::now() + self.config.interval;
        let mut ticker = tokio::time::interval_at(start, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let request = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping scan orchestrator");
                    break;
                }

                _ = ticker.tick() => ScanRequest {
                    target: ScanTarget::All,
                    channel: Channel::Scan,
                },

                msg = rx.recv() => match msg {
                    Some(request) => request,
                    None => {
                        info!("Scan request channel closed");
                        break;
                    }
                },
            };

            self.start(request, &shutdown).await;
        }
    }

    /// Spawns one scan task per target group that is not already scanning.
    async fn start(self: &Arc<Self>, request: ScanRequest, shutdown: &CancellationToken) {
        let groups = match self.resolve(request.target).await {
            Ok(groups) => groups,
            Err(e) => {
                error!(error = %e, "Failed to list monitored groups");
                self.diagnostics.record_error(Component::Scan, &e);
                return;
            }
        };

        for group in groups {
            let Some(slot) = self.claim(group.id) else {
                debug!(group = %group.id, "Scan already in progress, skipping");
                continue;
            };
            let this = Arc::clone(self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let _slot = slot;
                this.scan_group(&group, request.channel, &shutdown).await;
            });
        }
    }

    async fn resolve(&self, target: ScanTarget) -> Result<Vec<Group>, StoreError> {
        let monitored = self.registry.monitored_groups().await?;
        Ok(match target {
            ScanTarget::All => monitored,
            ScanTarget::Group(id) => {
                let selected: Vec<Group> = monitored.into_iter().filter(|g| g.id == id).collect();
                if selected.is_empty() {
                    warn!(group = %id, "Scan requested for a group that is not monitored");
                }
                selected
            }
        })
    }

    /// Scans one group's roster to completion, or until shutdown.
    #[instrument(skip(self, group, shutdown), fields(group = %group.id))]
    pub async fn scan_group(
        &self,
        group: &Group,
        channel: Channel,
        shutdown: &CancellationToken,
    ) -> ScanReport {
        let mut report = ScanReport::default();
        info!(name = %group.name, %channel, "Scanning group");

        let listed = retry_rate_limited(RetryPolicy::UNBOUNDED, shutdown, "list_group_members", || {
            self.directory.list_group_members(group.id)
        })
        .await;
        let members = match listed {
            RetryResult::Success(members) => members,
            RetryResult::Failed(e) | RetryResult::ExhaustedRetries { last_error: e, .. } => {
                error!(error = %e, "Failed to list group members");
                self.diagnostics.record_error(
                    Component::Scan,
                    format!("group {}: {}", group.id, e),
                );
                report.errors += 1;
                self.diagnostics.record_scan(group.id, report);
                return report;
            }
            RetryResult::Cancelled => return report,
        };

        for (i, member) in members.into_iter().enumerate() {
            if i > 0 && !sleep_cancellable(self.config.member_interval, shutdown).await {
                break;
            }
            if shutdown.is_cancelled() {
                break;
            }
            report.members += 1;

            let attributes = if member.attributes.is_complete() {
                member.attributes
            } else {
                let fetched = retry_rate_limited(RetryPolicy::UNBOUNDED, shutdown, "fetch_entity", || {
                    self.directory.fetch_entity(member.entity_id)
                })
                .await;
                match fetched {
                    RetryResult::Success(attributes) => attributes,
                    RetryResult::Failed(SourceError::NotFound(_)) => {
                        debug!(entity = %member.entity_id, "Member vanished, skipping");
                        report.skipped += 1;
                        continue;
                    }
                    RetryResult::Failed(e) | RetryResult::ExhaustedRetries { last_error: e, .. } => {
                        warn!(entity = %member.entity_id, error = %e, "Failed to fetch member");
                        self.diagnostics.record_error(
                            Component::Scan,
                            format!("entity {}: {}", member.entity_id, e),
                        );
                        report.errors += 1;
                        continue;
                    }
                    RetryResult::Cancelled => break,
                }
            };

            let observation = Observation::new(member.entity_id, attributes, channel);
            match self.tracker.join(&observation, group.id).await {
                Ok(outcome) => {
                    report.record(&outcome.reconcile);
                    if let ReconcileOutcome::Changed {
                        entity,
                        groups,
                        deltas,
                    } = outcome.reconcile
                    {
                        self.notifier.notify(Notification::Changed {
                            entity,
                            groups,
                            deltas,
                        });
                    }
                }
                Err(MembershipError::UnmonitoredGroup(_)) => {
                    info!("Group was deactivated during scan, stopping");
                    break;
                }
                Err(e) => {
                    error!(entity = %member.entity_id, error = %e, "Failed to record member");
                    self.diagnostics.record_error(
                        Component::Scan,
                        format!("entity {}: {}", member.entity_id, e),
                    );
                    report.errors += 1;
                }
            }
        }

        info!(%report, "Group scan finished");
        self.diagnostics.record_scan(group.id, report);
        report
    }
}

#[cfg(test)]
mod tests;
