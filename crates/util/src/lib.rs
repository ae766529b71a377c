//! Persistence, configuration, and path helpers shared by the rowpilot engine and CLI.

pub mod config;
pub mod path_processing;
pub mod state_store;

pub use config::{ConfigError, RunnerConfig, default_config_path};
pub use path_processing::{app_file_path, expand_tilde};
pub use state_store::{InMemoryStateStore, JsonStateStore, StateStore, StateStoreError, read_value, write_value};
