//! Configuration: on-disk layout of the studio state directory and the
//! persisted job policy.

pub mod jobs_policy;

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub use jobs_policy::{JobsPolicyConfig, PolicyFloor};

/// Environment variable overriding the state directory.
pub const STATE_DIR_ENV: &str = "STUDIO_STATE_DIR";
/// State directory used when [`STATE_DIR_ENV`] is unset.
pub const DEFAULT_STATE_DIR: &str = ".studio";

pub const JOB_EVENTS_FILE: &str = "jobs_events.jsonl";
pub const INTEGRATIONS_CONFIG_FILE: &str = "integrations_config.json";

/// Paths the studio reads and writes, all derived from one state directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudioPaths {
    state_dir: PathBuf,
}

impl StudioPaths {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    /// Resolve the state directory from the environment (a `.env` file is
    /// honoured), falling back to [`DEFAULT_STATE_DIR`].
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let state_dir = std::env::var(STATE_DIR_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_STATE_DIR.to_string());
        Self::new(state_dir)
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn job_events_path(&self) -> PathBuf {
        self.state_dir.join(JOB_EVENTS_FILE)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.state_dir.join("config")
    }

    pub fn integrations_config_path(&self) -> PathBuf {
        self.config_dir().join(INTEGRATIONS_CONFIG_FILE)
    }

    /// Create the state, log and config directories.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.state_dir.clone(), self.log_dir(), self.config_dir()] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| Error::io_path("creating directory", &dir, e))?;
        }
        Ok(())
    }

    /// Job policy from the integrations config, defaults when absent.
    pub fn load_jobs_policy(&self) -> JobsPolicyConfig {
        JobsPolicyConfig::load(&self.integrations_config_path())
    }
}

impl Default for StudioPaths {
    fn default() -> Self {
        Self::new(DEFAULT_STATE_DIR)
    }
}
