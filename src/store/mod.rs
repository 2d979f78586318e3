//! Snapshot store: persisted entities, groups, memberships, and the change ledger.
//!
//! The store is pure storage. It holds no business rules; the reconciler and
//! the membership tracker are its only writers.
//!
//! # Implementations
//!
//! - [`MemoryStore`]: in-process tables, used in tests and dry runs.
//! - [`FileStore`]: crash-safe durable store. Every mutation is one JSON Lines
//!   journal record, periodically compacted into a generation snapshot.
//!
//! # File Layout
//!
//! ```text
//! <state_dir>/
//!   generation         # current generation number (single integer)
//!   snapshot.N.json    # full state at the start of generation N
//!   journal.N.log      # mutations since snapshot N (JSON Lines)
//! ```

use std::future::Future;
use std::io;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::types::{ChangeRecord, Entity, EntityId, Group, GroupId, Membership};

pub mod durable;
pub mod file;
pub mod journal;
pub mod memory;
pub mod snapshot;
pub mod state;

pub use file::{DEFAULT_COMPACT_EVERY, FileStore};
pub use memory::MemoryStore;
pub use state::{JournalRecord, StoreState};

/// Errors surfaced by a store. This is the persistence failure of the
/// error taxonomy: callers must not treat it as "no change".
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Snapshot schema version mismatch.
    #[error("schema version mismatch: expected {expected}, got {got}")]
    SchemaMismatch { expected: u32, got: u32 },

    /// A journal line other than the last one failed to parse.
    #[error("corrupt journal {path} at line {line}")]
    CorruptJournal { path: PathBuf, line: usize },

    /// The generation file does not hold a number.
    #[error("invalid generation number: {0}")]
    InvalidGeneration(String),

    /// The backing engine refused the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Row counts for the operator status view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    /// Active entities.
    pub tracked_entities: usize,
    /// Active groups.
    pub monitored_groups: usize,
    /// Ledger length.
    pub change_records: usize,
}

/// Get/put access to persisted rows.
///
/// `commit_entity` is the only way to change an entity row, and it writes the
/// row together with its ledger entries: either both are visible afterwards or
/// neither is.
pub trait SnapshotStore: Send + Sync + 'static {
    /// Loads an entity row.
    fn entity(&self, id: EntityId) -> impl Future<Output = Result<Option<Entity>>> + Send;

    /// Stores an entity row and appends its ledger entries atomically.
    fn commit_entity(
        &self,
        entity: Entity,
        changes: Vec<ChangeRecord>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Loads a group row.
    fn group(&self, id: GroupId) -> impl Future<Output = Result<Option<Group>>> + Send;

    /// Inserts or replaces a group row.
    fn put_group(&self, group: Group) -> impl Future<Output = Result<()>> + Send;

    /// All group rows, active or not, ordered by id.
    fn groups(&self) -> impl Future<Output = Result<Vec<Group>>> + Send;

    /// Loads one membership row.
    fn membership(
        &self,
        entity_id: EntityId,
        group_id: GroupId,
    ) -> impl Future<Output = Result<Option<Membership>>> + Send;

    /// Inserts or replaces a membership row.
    fn put_membership(&self, membership: Membership) -> impl Future<Output = Result<()>> + Send;

    /// Every membership row of an entity, ordered by group id.
    fn memberships_of(
        &self,
        entity_id: EntityId,
    ) -> impl Future<Output = Result<Vec<Membership>>> + Send;

    /// Most recent ledger entries of an entity, newest first.
    fn changes_of(
        &self,
        entity_id: EntityId,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<ChangeRecord>>> + Send;

    /// Row counts for status reporting.
    fn counts(&self) -> impl Future<Output = Result<StoreCounts>> + Send;
}
