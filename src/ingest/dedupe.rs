//! Delivery-id deduplication for webhook redeliveries.
//!
//! The bridge redelivers an event with the same delivery id when it did not
//! see an acknowledgement in time. Seen ids are kept with their first-seen
//! time and pruned after the retention period (default 24 hours). Pruning
//! runs from [`SeenDeliveries::check_and_mark`] at most once per
//! [`PRUNE_EVERY_MINUTES`].
//!
//! Redeliveries that slip past the window are harmless: reconciliation is
//! idempotent. The window only saves work.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::types::DeliveryId;

/// Default TTL for seen delivery ids (24 hours).
pub const DEFAULT_DEDUPE_TTL_HOURS: i64 = 24;

/// Minimum spacing between two automatic prunes.
pub const PRUNE_EVERY_MINUTES: i64 = 60;

#[derive(Debug)]
pub struct SeenDeliveries {
    seen: HashMap<DeliveryId, DateTime<Utc>>,
    ttl: chrono::Duration,
    last_pruned: Option<DateTime<Utc>>,
}

impl Default for SeenDeliveries {
    fn default() -> Self {
        Self::with_ttl_hours(DEFAULT_DEDUPE_TTL_HOURS)
    }
}

impl SeenDeliveries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl_hours(hours: i64) -> Self {
        SeenDeliveries {
            seen: HashMap::new(),
            ttl: chrono::Duration::hours(hours),
            last_pruned: None,
        }
    }

    /// Records `id` as seen at `now`. Returns `true` if it was already seen
    /// within the retention period.
    pub fn check_and_mark(&mut self, id: &DeliveryId, now: DateTime<Utc>) -> bool {
        if self
            .last_pruned
            .is_none_or(|at| now - at >= chrono::Duration::minutes(PRUNE_EVERY_MINUTES))
        {
            self.prune(now);
        }

        let cutoff = now - self.ttl;
        match self.seen.get(id) {
            Some(seen_at) if *seen_at > cutoff => true,
            _ => {
                self.seen.insert(id.clone(), now);
                false
            }
        }
    }

    /// Forgets `id`, so that a redelivery is processed again.
    pub fn forget(&mut self, id: &DeliveryId) {
        self.seen.remove(id);
    }

    /// Drops ids older than the retention period. Returns the number pruned.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.ttl;
        let before = self.seen.len();
        self.seen.retain(|_, seen_at| *seen_at > cutoff);
        self.last_pruned = Some(now);
        before - self.seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
