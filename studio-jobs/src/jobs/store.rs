//! Persistence of job events.
//!
//! The registry appends every event it applies and replays them on start,
//! so job history survives restarts and crashes.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::JobEvent;

/// Storage for job events. Implementations never fail the caller; IO
/// problems are logged.
pub trait JobEventStore: Send + Sync {
    /// All stored events, oldest first.
    fn load(&self) -> Vec<JobEvent>;
    fn append(&self, event: &JobEvent);
    /// Drop the live event log.
    fn clear(&self);
}

/// Size limits for [`JsonlJobEventStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonlStoreConfig {
    /// Rotate once the live file grows past this size. 0 disables rotation.
    pub max_bytes: u64,
    /// Number of rotated files kept next to the live one.
    pub max_archives: usize,
}

impl Default for JsonlStoreConfig {
    fn default() -> Self {
        Self {
            max_bytes: 5 * 1024 * 1024,
            max_archives: 5,
        }
    }
}

/// Append-only JSON-lines event log with numbered rotation.
///
/// `jobs_events.jsonl` is the live file; rotated files are
/// `jobs_events.1.jsonl` (newest) up to `jobs_events.<max_archives>.jsonl`.
pub struct JsonlJobEventStore {
    path: PathBuf,
    config: JsonlStoreConfig,
    write_lock: Mutex<()>,
}

impl JsonlJobEventStore {
    /// Open a store at `path`, creating the parent directory.
    pub fn open(path: impl Into<PathBuf>, config: JsonlStoreConfig) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| Error::io_path("creating directory", parent, e))?;
        }
        Ok(Self {
            path,
            config,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of rotated file number `n` (1-based).
    pub fn archive_path(&self, n: usize) -> PathBuf {
        archive_path(&self.path, n)
    }

    fn rotate_if_needed(&self) -> std::io::Result<()> {
        if self.config.max_bytes == 0 {
            return Ok(());
        }
        let size = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        if size <= self.config.max_bytes {
            return Ok(());
        }

        if self.config.max_archives == 0 {
            info!("Event log {} exceeded {} bytes, truncating", self.path.display(), self.config.max_bytes);
            return fs::remove_file(&self.path);
        }

        let oldest = self.archive_path(self.config.max_archives);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for n in (1..self.config.max_archives).rev() {
            let from = self.archive_path(n);
            if from.exists() {
                fs::rename(&from, self.archive_path(n + 1))?;
            }
        }
        fs::rename(&self.path, self.archive_path(1))?;
        info!(
            "Rotated event log {} ({} bytes)",
            self.path.display(),
            size
        );
        Ok(())
    }

    fn try_append(&self, event: &JobEvent) -> std::io::Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let _guard = self.write_lock.lock();
        self.rotate_if_needed()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())
    }
}

/// `jobs_events.jsonl` -> `jobs_events.<n>.jsonl`.
fn archive_path(path: &Path, n: usize) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}.{}.{}", stem, n, ext.to_string_lossy()),
        None => format!("{}.{}", stem, n),
    };
    path.with_file_name(name)
}

impl JobEventStore for JsonlJobEventStore {
    fn load(&self) -> Vec<JobEvent> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!("Failed to open event log {}: {}", self.path.display(), e);
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        let mut skipped = 0usize;
        for line in BufReader::new(file).lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!("Stopped reading event log {}: {}", self.path.display(), e);
                    break;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<JobEvent>(trimmed) {
                Ok(event) => events.push(event),
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            debug!(
                "Skipped {} malformed line(s) in {}",
                skipped,
                self.path.display()
            );
        }
        events
    }

    fn append(&self, event: &JobEvent) {
        if let Err(e) = self.try_append(event) {
            warn!(
                "Failed to persist job event to {}: {}",
                self.path.display(),
                e
            );
        }
    }

    fn clear(&self) {
        let _guard = self.write_lock.lock();
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to clear event log {}: {}", self.path.display(), e),
        }
    }
}
