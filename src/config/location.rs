//! Settings file lookup

use crate::types::StoreError;
use std::ffi::OsString;
use std::path::PathBuf;
use tracing::debug;

/// Environment variable naming the settings file.
pub const STORE_PATH_ENV: &str = "CONFSTORE_FILE";

/// File name used inside the platform config directory.
pub const DEFAULT_FILE_NAME: &str = "settings.xml";

/// Resolve the settings file path from the argument, the environment and
/// the platform config directory, in that order.
pub fn resolve_store_path(explicit: Option<PathBuf>) -> Result<PathBuf, StoreError> {
    resolve_from(explicit, std::env::var_os(STORE_PATH_ENV), dirs::config_dir())
}

fn resolve_from(
    explicit: Option<PathBuf>,
    env_value: Option<OsString>,
    config_dir: Option<PathBuf>,
) -> Result<PathBuf, StoreError> {
    if let Some(path) = explicit {
        debug!("Using settings file from argument: {}", path.display());
        return Ok(path);
    }

    if let Some(value) = env_value.filter(|v| !v.is_empty()) {
        let path = PathBuf::from(value);
        debug!("Using settings file from {}: {}", STORE_PATH_ENV, path.display());
        return Ok(path);
    }

    if let Some(dir) = config_dir {
        let path = dir.join("confstore").join(DEFAULT_FILE_NAME);
        debug!("Using default settings file: {}", path.display());
        return Ok(path);
    }

    Err(StoreError::Config(format!(
        "no settings file given; pass --file or set {}",
        STORE_PATH_ENV
    )))
}
