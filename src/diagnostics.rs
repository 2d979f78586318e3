//! Counters and last-error summaries for the operator surface.
//!
//! Every long-lived task records its failures here instead of propagating
//! them; a single observation's failure never stops the pipeline, and the
//! operator sees the most recent error per component.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::scan::ScanReport;
use crate::types::GroupId;

/// The component an error summary belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Ingest,
    Scan,
    Notifier,
    Registry,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Component::Ingest => "ingest",
            Component::Scan => "scan",
            Component::Notifier => "notifier",
            Component::Registry => "registry",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorSummary {
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastScan {
    pub group_id: GroupId,
    pub finished_at: DateTime<Utc>,
    pub report: ScanReport,
}

/// Point-in-time copy of all diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub notifications_sent: u64,
    pub notifications_dropped: u64,
    pub last_errors: BTreeMap<Component, ErrorSummary>,
    pub last_scans: Vec<LastScan>,
}

#[derive(Debug, Default)]
pub struct Diagnostics {
    notifications_sent: AtomicU64,
    notifications_dropped: AtomicU64,
    last_errors: Mutex<BTreeMap<Component, ErrorSummary>>,
    last_scans: Mutex<BTreeMap<GroupId, LastScan>>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self) {
        self.notifications_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.notifications_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Replaces the last error of `component`.
    pub fn record_error(&self, component: Component, message: impl fmt::Display) {
        let summary = ErrorSummary {
            message: message.to_string(),
            at: Utc::now(),
        };
        self.last_errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(component, summary);
    }

    pub fn record_scan(&self, group_id: GroupId, report: ScanReport) {
        let scan = LastScan {
            group_id,
            finished_at: Utc::now(),
            report,
        };
        self.last_scans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(group_id, scan);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            notifications_dropped: self.notifications_dropped.load(Ordering::Relaxed),
            last_errors: self
                .last_errors
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            last_scans: self
                .last_scans
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .cloned()
                .collect(),
        }
    }
}
