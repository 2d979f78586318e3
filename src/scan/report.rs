//! Per-group scan tallies.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::reconcile::ReconcileOutcome;

/// What one group scan did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    /// Members visited.
    pub members: usize,
    /// First sightings.
    pub registered: usize,
    /// Reportable changes committed (one notification each).
    pub changed: usize,
    /// Already up to date, or only first-sight populations.
    pub unchanged: usize,
    /// Vanished remotely or out of scope.
    pub skipped: usize,
    /// Lookup or persistence failures.
    pub errors: usize,
}

impl ScanReport {
    pub fn record(&mut self, outcome: &ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Registered { .. } => self.registered += 1,
            ReconcileOutcome::Changed { .. } => self.changed += 1,
            ReconcileOutcome::Recorded | ReconcileOutcome::NoChange => self.unchanged += 1,
            ReconcileOutcome::OutOfScope => self.skipped += 1,
        }
    }
}

impl fmt::Display for ScanReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} members: {} registered, {} changed, {} unchanged, {} skipped, {} errors",
            self.members, self.registered, self.changed, self.unchanged, self.skipped, self.errors
        )
    }
}
