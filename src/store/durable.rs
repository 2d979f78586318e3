//! Low-level durability helpers: fsync, atomic replace, generation files.
//!
//! On POSIX systems, creating or renaming a file updates the directory entry.
//! Without fsync on the directory, that entry may not survive a power loss
//! even if the file contents were synced, so every atomic replace syncs both.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use super::{Result, StoreError};

const GENERATION_FILE: &str = "generation";

/// Syncs a file's contents and metadata to disk.
pub fn fsync_file(file: &File) -> io::Result<()> {
    file.sync_all()
}

/// Syncs a directory so that entries created or renamed in it are durable.
pub fn fsync_dir(dir_path: &Path) -> io::Result<()> {
    let dir = OpenOptions::new().read(true).open(dir_path)?;
    dir.sync_all()
}

/// Replaces `path` with `bytes` atomically.
///
/// Writes `<path>.tmp`, fsyncs it, renames it over `path`, then fsyncs the
/// parent directory. Readers see either the old or the new contents.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(bytes)?;
        fsync_file(&file)?;
    }

    fs::rename(&tmp_path, path)?;

    if let Some(parent) = path.parent() {
        fsync_dir(parent)?;
    }

    Ok(())
}

/// Reads the current generation number. A missing or empty file is generation 0.
pub fn read_generation(state_dir: &Path) -> Result<u64> {
    match fs::read_to_string(state_dir.join(GENERATION_FILE)) {
        Ok(contents) => {
            let trimmed = contents.trim();
            if trimmed.is_empty() {
                return Ok(0);
            }
            trimmed
                .parse()
                .map_err(|_| StoreError::InvalidGeneration(trimmed.to_string()))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Writes the generation number atomically.
pub fn write_generation(state_dir: &Path, generation: u64) -> Result<()> {
    write_atomic(
        &state_dir.join(GENERATION_FILE),
        format!("{}\n", generation).as_bytes(),
    )?;
    Ok(())
}

/// Path of the snapshot for a generation.
pub fn snapshot_path(state_dir: &Path, generation: u64) -> PathBuf {
    state_dir.join(format!("snapshot.{}.json", generation))
}

/// Path of the journal for a generation.
pub fn journal_path(state_dir: &Path, generation: u64) -> PathBuf {
    state_dir.join(format!("journal.{}.log", generation))
}

/// Parses `snapshot.N.json` or `journal.N.log` into `N`.
fn parse_generation_file(filename: &str) -> Option<u64> {
    let rest = filename
        .strip_prefix("snapshot.")
        .and_then(|s| s.strip_suffix(".json"))
        .or_else(|| {
            filename
                .strip_prefix("journal.")
                .and_then(|s| s.strip_suffix(".log"))
        })?;
    rest.parse().ok()
}

/// Deletes snapshot and journal files that do not belong to `keep`.
///
/// Leftovers from an interrupted compaction are harmless but would otherwise
/// accumulate. Returns the number of files removed.
pub fn remove_stale_generations(state_dir: &Path, keep: u64) -> Result<usize> {
    let read_dir = match fs::read_dir(state_dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    for entry in read_dir {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let stale_tmp = name.ends_with(".tmp");
        let stale_gen = parse_generation_file(name).is_some_and(|g| g != keep);
        if stale_tmp || stale_gen {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }

    if removed > 0 {
        fsync_dir(state_dir)?;
    }
    Ok(removed)
}
