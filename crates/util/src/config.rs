//! Runner configuration file.
//!
//! A small JSON document (`~/.config/rowpilot/config.json` on most platforms) holding the
//! runner-wide error defaults and orchestration tuning. A missing file yields defaults; a file
//! that fails to parse is reported and also yields defaults so a bad edit never blocks a run.

use std::fs;
use std::path::{Path, PathBuf};

use rowpilot_types::WorkflowSettings;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::path_processing::{app_file_path, expand_tilde};

/// Environment variable allowing callers to override the configuration file path.
pub const CONFIG_PATH_ENV: &str = "ROWPILOT_CONFIG_PATH";

/// Default filename for the JSON payload.
pub const CONFIG_FILE_NAME: &str = "config.json";

const DEFAULT_RESUME_DEDUP_WINDOW_MS: u64 = 2_000;
const DEFAULT_MAX_EXPANSION_DEPTH: usize = 32;

/// Error surfaced when reading or writing the configuration fails.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persisted runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerConfig {
    /// Error defaults merged under every workflow's own settings at dispatch.
    pub default_error_settings: WorkflowSettings,
    /// Window within which a repeated navigation resume for the same step is suppressed.
    pub resume_dedup_window_ms: u64,
    /// Maximum subworkflow nesting depth accepted by the expander.
    pub max_expansion_depth: usize,
    /// Optional override of the state store location.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_path: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_error_settings: WorkflowSettings::default(),
            resume_dedup_window_ms: DEFAULT_RESUME_DEDUP_WINDOW_MS,
            max_expansion_depth: DEFAULT_MAX_EXPANSION_DEPTH,
            state_path: None,
        }
    }
}

impl RunnerConfig {
    /// Loads the configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&default_config_path())
    }

    /// Loads the configuration from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(data) => match serde_json::from_str(&data) {
                Ok(config) => Ok(config),
                Err(error) => {
                    warn!(
                        path = %path.display(),
                        error = %error,
                        "Failed to parse runner config; using defaults"
                    );
                    Ok(Self::default())
                }
            },
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(error) => Err(ConfigError::Io(error)),
        }
    }

    /// Writes the configuration to `path`, creating parent directories as needed.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Resolved state store path, when overridden in the configuration.
    pub fn state_path(&self) -> Option<PathBuf> {
        self.state_path
            .as_deref()
            .filter(|path| !path.trim().is_empty())
            .map(expand_tilde)
    }
}

/// Location of the configuration file, honoring [`CONFIG_PATH_ENV`].
pub fn default_config_path() -> PathBuf {
    app_file_path(CONFIG_PATH_ENV, CONFIG_FILE_NAME)
}
