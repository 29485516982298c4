//! Support bundle: job history, logs and a config snapshot in one zip.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use super::logging::LOG_FILE_PREFIX;
use super::panic_hook::PANIC_LOG_FILE;
use crate::config::{JOB_EVENTS_FILE, StudioPaths};
use crate::error::{Error, Result};

/// Inputs of [`create_crash_bundle`].
#[derive(Debug, Clone)]
pub struct CrashBundleOptions {
    /// Directory holding `jobs_events*.jsonl` and `logs/`.
    pub state_dir: PathBuf,
    /// Config file to snapshot, stored as `config/<file name>`.
    pub config_path: Option<PathBuf>,
    pub include_rotated_job_events: bool,
}

impl CrashBundleOptions {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            config_path: None,
            include_rotated_job_events: true,
        }
    }

    pub fn with_config(mut self, config_path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(config_path.into());
        self
    }
}

impl From<&StudioPaths> for CrashBundleOptions {
    fn from(paths: &StudioPaths) -> Self {
        Self::new(paths.state_dir()).with_config(paths.integrations_config_path())
    }
}

/// Sorted files in `dir` whose name satisfies `keep`.
fn matching_files(dir: &Path, keep: impl Fn(&str) -> bool) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(&keep)
        })
        .collect();
    files.sort();
    files
}

fn is_rotated_job_events(name: &str) -> bool {
    let stem = JOB_EVENTS_FILE.trim_end_matches(".jsonl");
    name.strip_prefix(stem)
        .and_then(|rest| rest.strip_prefix('.'))
        .and_then(|rest| rest.strip_suffix(".jsonl"))
        .is_some_and(|middle| !middle.is_empty())
}

/// Entries of the bundle as `(source, name inside the archive)`.
fn collect_entries(options: &CrashBundleOptions) -> Vec<(PathBuf, String)> {
    let state_dir = &options.state_dir;
    let mut entries = vec![(
        state_dir.join(JOB_EVENTS_FILE),
        format!("state/{}", JOB_EVENTS_FILE),
    )];

    if options.include_rotated_job_events {
        for path in matching_files(state_dir, is_rotated_job_events) {
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
            if let Some(name) = name {
                entries.push((path, format!("state/{}", name)));
            }
        }
    }

    let log_dir = state_dir.join("logs");
    for path in matching_files(&log_dir, |name| {
        name.starts_with(LOG_FILE_PREFIX) || name == PANIC_LOG_FILE
    }) {
        if let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) {
            entries.push((path, format!("logs/{}", name)));
        }
    }

    if let Some(config) = &options.config_path {
        if let Some(name) = config.file_name().map(|n| n.to_string_lossy().into_owned()) {
            entries.push((config.clone(), format!("config/{}", name)));
        }
    }

    entries
}

/// Write a deflate zip with the job event logs, application logs and the
/// config snapshot to `output_zip`.
///
/// Missing or unreadable inputs are skipped. Only failing to create or
/// write the archive itself is an error. Blocking; call it from
/// `spawn_blocking` inside async code.
pub fn create_crash_bundle(output_zip: &Path, options: &CrashBundleOptions) -> Result<PathBuf> {
    if let Some(parent) = output_zip.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| Error::io_path("creating directory", parent, e))?;
    }
    let file = fs::File::create(output_zip)
        .map_err(|e| Error::io_path("creating crash bundle", output_zip, e))?;

    let mut zip = ZipWriter::new(file);
    let zip_options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let mut added = 0usize;
    for (source, name) in collect_entries(options) {
        let data = match fs::read(&source) {
            Ok(data) => data,
            Err(e) => {
                debug!(path = %source.display(), error = %e, "Skipping crash bundle entry");
                continue;
            }
        };
        zip.start_file(name.as_str(), zip_options)?;
        zip.write_all(&data)?;
        added += 1;
    }

    let meta = format!(
        "created_utc: {}\nstate_dir: {}\ncrate_version: {}\n",
        Utc::now().format("%Y%m%d-%H%M%S"),
        options.state_dir.display(),
        env!("CARGO_PKG_VERSION"),
    );
    zip.start_file("meta.txt", zip_options)?;
    zip.write_all(meta.as_bytes())?;
    zip.finish()?;

    info!(
        path = %output_zip.display(),
        entries = added,
        "Created crash bundle"
    );
    Ok(output_zip.to_path_buf())
}
