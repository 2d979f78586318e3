//! Generation snapshots of the full store state.
//!
//! A snapshot captures the complete state at the start of a generation, so
//! recovery only replays that generation's journal. Snapshots are written with
//! [`write_atomic`](super::durable::write_atomic), so readers never observe a
//! partial file.

use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::durable::write_atomic;
use super::state::StoreState;
use super::{Result, StoreError};

/// Current schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: u32 = 1;

/// The JSON structure stored at `<state_dir>/snapshot.<gen>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    /// Schema version for forward-compatible migrations.
    pub schema_version: u32,

    /// When this snapshot was written.
    pub snapshot_at: DateTime<Utc>,

    /// The generation this snapshot starts (matches the filename suffix).
    pub generation: u64,

    /// Next journal sequence number. Preserved across generations so that
    /// sequence numbers stay globally monotonic.
    pub next_seq: u64,

    pub state: StoreState,
}

impl PersistedSnapshot {
    pub fn new(generation: u64, next_seq: u64, state: StoreState) -> Self {
        PersistedSnapshot {
            schema_version: SCHEMA_VERSION,
            snapshot_at: Utc::now(),
            generation,
            next_seq,
            state,
        }
    }
}

/// Saves a snapshot atomically.
pub fn save_snapshot(path: &Path, snapshot: &PersistedSnapshot) -> Result<()> {
    let bytes = serde_json::to_vec(snapshot)?;
    write_atomic(path, &bytes)?;
    Ok(())
}

/// Loads a snapshot, checking its schema version.
pub fn load_snapshot(path: &Path) -> Result<PersistedSnapshot> {
    let bytes = std::fs::read(path)?;
    let snapshot: PersistedSnapshot = serde_json::from_slice(&bytes)?;

    if snapshot.schema_version != SCHEMA_VERSION {
        return Err(StoreError::SchemaMismatch {
            expected: SCHEMA_VERSION,
            got: snapshot.schema_version,
        });
    }

    Ok(snapshot)
}

/// Loads a snapshot, returning `None` if the file doesn't exist.
pub fn try_load_snapshot(path: &Path) -> Result<Option<PersistedSnapshot>> {
    match load_snapshot(path) {
        Ok(snapshot) => Ok(Some(snapshot)),
        Err(StoreError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
