/// Canonical file paths for agent data files.
///
/// Everything lives under one application directory:
///   - config.toml    Operator-edited settings, read at startup.
///   - identity.json  Encrypted subject and machine identifiers.
///   - status.toml    Written by the agent for local inspection.
///   - logs/          Rotated log files.
use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

const APP_DIR_NAME: &str = "metrics-agent";
pub const HOME_ENV: &str = "HOSTWATCH_HOME";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const IDENTITY_FILE_NAME: &str = "identity.json";
pub const STATUS_FILE_NAME: &str = "status.toml";
pub const LOG_DIR_NAME: &str = "logs";

/// Returns the application data directory.
///
/// `HOSTWATCH_HOME` wins when set. Otherwise `%APPDATA%\metrics-agent` on
/// Windows and `$XDG_CONFIG_HOME/metrics-agent` (or `~/.config/metrics-agent`)
/// elsewhere.
pub fn app_data_dir() -> Result<PathBuf> {
    resolve_app_dir(|key| std::env::var_os(key).map(PathBuf::from))
}

fn resolve_app_dir(var: impl Fn(&str) -> Option<PathBuf>) -> Result<PathBuf> {
    if let Some(home) = var(HOME_ENV) {
        return Ok(home);
    }
    if cfg!(windows) {
        return match var("APPDATA") {
            Some(appdata) => Ok(appdata.join(APP_DIR_NAME)),
            None => bail!("APPDATA environment variable not set"),
        };
    }
    if let Some(xdg) = var("XDG_CONFIG_HOME") {
        return Ok(xdg.join(APP_DIR_NAME));
    }
    match var("HOME") {
        Some(home) => Ok(home.join(".config").join(APP_DIR_NAME)),
        None => bail!("neither {HOME_ENV}, XDG_CONFIG_HOME nor HOME is set"),
    }
}

pub fn config_file_path(app_dir: &Path) -> PathBuf {
    app_dir.join(CONFIG_FILE_NAME)
}

pub fn identity_file_path(app_dir: &Path) -> PathBuf {
    app_dir.join(IDENTITY_FILE_NAME)
}

pub fn status_file_path(app_dir: &Path) -> PathBuf {
    app_dir.join(STATUS_FILE_NAME)
}

pub fn log_dir(app_dir: &Path) -> PathBuf {
    app_dir.join(LOG_DIR_NAME)
}
