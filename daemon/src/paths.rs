/// Canonical file paths for dirwatch data files.
///
/// Both files live in the application directory:
///   - config.toml  Edited by the user or a UI, read and hot-reloaded by the daemon.
///   - status.toml  Written by the daemon, read by observers.
///
/// The directory is `$DIRWATCH_HOME` when set, otherwise `%APPDATA%\dirwatch` on
/// Windows and `$XDG_CONFIG_HOME/dirwatch` (or `$HOME/.config/dirwatch`) elsewhere.
use anyhow::{bail, Result};
use std::path::PathBuf;

const APP_DIR_NAME: &str = "dirwatch";
const HOME_OVERRIDE_VAR: &str = "DIRWATCH_HOME";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const STATUS_FILE_NAME: &str = "status.toml";

/// Returns the application data directory.
pub fn app_data_dir() -> Result<PathBuf> {
    resolve_app_dir(|key| std::env::var_os(key).map(PathBuf::from))
}

/// Returns the full path to the config file.
pub fn config_file_path() -> Result<PathBuf> {
    Ok(app_data_dir()?.join(CONFIG_FILE_NAME))
}

/// Returns the full path to the status file.
pub fn status_file_path() -> Result<PathBuf> {
    Ok(app_data_dir()?.join(STATUS_FILE_NAME))
}

fn resolve_app_dir(env: impl Fn(&str) -> Option<PathBuf>) -> Result<PathBuf> {
    let non_empty = |key: &str| env(key).filter(|p| !p.as_os_str().is_empty());

    if let Some(dir) = non_empty(HOME_OVERRIDE_VAR) {
        return Ok(dir);
    }
    if cfg!(windows) {
        if let Some(appdata) = non_empty("APPDATA") {
            return Ok(appdata.join(APP_DIR_NAME));
        }
    } else {
        if let Some(xdg) = non_empty("XDG_CONFIG_HOME") {
            return Ok(xdg.join(APP_DIR_NAME));
        }
        if let Some(home) = non_empty("HOME") {
            return Ok(home.join(".config").join(APP_DIR_NAME));
        }
    }
    bail!("cannot determine the application directory; set {HOME_OVERRIDE_VAR}")
}
