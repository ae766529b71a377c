use std::env;
use std::path::PathBuf;

use dirs_next::{config_dir, home_dir};

/// Directory name used under the platform configuration directory.
pub const APP_DIR_NAME: &str = "rowpilot";

/// Expands a leading `~` (Unix or Windows separator) to the user's home directory.
pub fn expand_tilde(path: impl AsRef<str>) -> PathBuf {
    let trimmed = path.as_ref().trim();
    let home = || home_dir().unwrap_or_else(|| PathBuf::from("~"));

    if trimmed == "~" {
        return home();
    }
    match trimmed.strip_prefix("~/").or_else(|| trimmed.strip_prefix("~\\")) {
        Some(rest) => home().join(rest),
        None => PathBuf::from(trimmed),
    }
}

/// Resolves the location of an application file.
///
/// A non-blank value in `override_env` wins (with tilde expansion); otherwise the file lives in
/// `<config dir>/rowpilot/<file_name>`, falling back to the working directory when the platform
/// has no configuration directory.
pub fn app_file_path(override_env: &str, file_name: &str) -> PathBuf {
    if let Ok(path) = env::var(override_env)
        && !path.trim().is_empty()
    {
        return expand_tilde(path);
    }

    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
        .join(file_name)
}
