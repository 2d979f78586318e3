//! Append-only mutation journal with crash-safe replay.
//!
//! The journal uses JSON Lines format: one JSON object per line. Every
//! record is fsynced before the append returns, because every record is a
//! committed state change that callers have been told succeeded.
//!
//! # Recovery
//!
//! A crash mid-append leaves at most one partial line at the end of the file.
//! [`Journal::replay`] drops and truncates that line. A malformed line that is
//! followed by valid lines is not a torn write, and replay refuses to guess.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::durable::fsync_file;
use super::state::JournalRecord;
use super::{Result, StoreError};

/// A journal line.
///
/// Example JSON:
/// ```json
/// {"seq":4,"ts":"2024-01-15T10:00:00Z","type":"group_put","group":{...}}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Monotonic sequence number, preserved across generations.
    pub seq: u64,

    /// When the record was appended (UTC).
    pub ts: DateTime<Utc>,

    #[serde(flatten)]
    pub record: JournalRecord,
}

/// An open journal file.
#[derive(Debug)]
pub struct Journal {
    file: File,
    next_seq: u64,
}

impl Journal {
    /// Opens or creates a journal for appending, starting at `next_seq`.
    pub fn open(path: impl AsRef<Path>, next_seq: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;

        Ok(Journal { file, next_seq })
    }

    /// Appends one record and fsyncs it.
    ///
    /// If the write fails part-way, the file is cut back to its previous
    /// length so that a later append cannot land after a torn line.
    pub fn append(&mut self, record: JournalRecord) -> Result<JournalEntry> {
        let entry = JournalEntry {
            seq: self.next_seq,
            ts: Utc::now(),
            record,
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let before = self.file.metadata()?.len();
        let written = self
            .file
            .write_all(&line)
            .and_then(|()| fsync_file(&self.file));

        if let Err(e) = written {
            // Best effort; replay truncates a torn tail anyway.
            let _ = self.file.set_len(before);
            return Err(e.into());
        }

        self.next_seq += 1;
        Ok(entry)
    }

    /// Next sequence number that will be assigned.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Reads every entry of a journal, truncating a torn final line.
    ///
    /// A missing file replays as empty.
    pub fn replay(path: impl AsRef<Path>) -> Result<Vec<JournalEntry>> {
        let path = path.as_ref();
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let file_len = file.metadata()?.len();

        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        let mut valid_len = 0u64;
        let mut position = 0u64;
        let mut torn_at: Option<(usize, u64)> = None;
        let mut line_no = 0usize;

        loop {
            let mut line = String::new();
            let bytes_read = reader.read_line(&mut line)?;
            if bytes_read == 0 {
                break;
            }
            line_no += 1;
            let line_start = position;
            position += bytes_read as u64;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                if torn_at.is_none() {
                    valid_len = position;
                }
                continue;
            }

            if let Some((bad_line, _)) = torn_at {
                // Valid-looking data after a bad line: not a torn tail.
                return Err(StoreError::CorruptJournal {
                    path: path.to_path_buf(),
                    line: bad_line,
                });
            }

            match serde_json::from_str::<JournalEntry>(trimmed) {
                Ok(entry) => {
                    entries.push(entry);
                    valid_len = position;
                }
                Err(_) => torn_at = Some((line_no, line_start)),
            }
        }

        if valid_len < file_len {
            tracing::warn!(
                path = %path.display(),
                kept = valid_len,
                len = file_len,
                "Truncating torn journal tail"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            fsync_file(&file)?;
        }

        Ok(entries)
    }
}
