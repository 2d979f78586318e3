//! Per-entity serialization tokens.
//!
//! One async mutex per entity id, created on first use and removed when the
//! last holder releases it, so the table only holds entities with
//! reconciliations in flight. Different entities never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

use crate::types::EntityId;

type Slot = Arc<tokio::sync::Mutex<()>>;

#[derive(Debug, Default)]
pub struct EntityLocks {
    slots: Mutex<HashMap<EntityId, Slot>>,
}

/// Held while an entity is being reconciled. Releases on drop.
#[derive(Debug)]
pub struct EntityGuard<'a> {
    locks: &'a EntityLocks,
    id: EntityId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `id`.
    ///
    /// Waiters are served in FIFO order.
    pub async fn lock(&self, id: EntityId) -> EntityGuard<'_> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.entry(id).or_default().clone()
        };
        let guard = slot.lock_owned().await;
        EntityGuard {
            locks: self,
            id,
            guard: Some(guard),
        }
    }

    /// Number of entities with a holder or waiter.
    pub fn in_flight(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for EntityGuard<'_> {
    fn drop(&mut self) {
        let mut slots = self
            .locks
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // The table and this guard hold one reference each when nobody waits.
        if let Some(slot) = slots.get(&self.id)
            && Arc::strong_count(slot) <= 2
        {
            slots.remove(&self.id);
        }
        self.guard.take();
    }
}
