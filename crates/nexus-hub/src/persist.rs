//! Write-through JSON persistence.
//!
//! Every mutable store (registry, process registry, tokens, users, roles)
//! flushes its full contents to its own JSON file on each mutation. Writes
//! go to a temporary file in the same directory followed by a rename, so a
//! crash mid-write leaves the previous file intact.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{HubError, HubResult};

/// Load a JSON file into `T`. A missing file yields `None`; a malformed
/// file is an error so corrupted state never silently resets.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> HubResult<Option<T>> {
    if !path.exists() {
        debug!("State file not found: {}", path.display());
        return Ok(None);
    }
    let contents = fs::read_to_string(path)?;
    let value = serde_json::from_str(&contents).map_err(|parse_error| {
        HubError::Persistence(format!(
            "Malformed state file {}: {parse_error}",
            path.display()
        ))
    })?;
    Ok(Some(value))
}

/// Replace the file's contents with the serialized value, atomically.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> HubResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let serialized = serde_json::to_string_pretty(value)?;
    let temp_path = temp_path_for(path);
    fs::write(&temp_path, serialized)?;
    fs::rename(&temp_path, path).map_err(|rename_error| {
        warn!("Failed to move state file into place: {rename_error}");
        HubError::Persistence(format!(
            "Failed to replace {}: {rename_error}",
            path.display()
        ))
    })?;
    debug!("Saved state file: {}", path.display());
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map_or_else(
        || std::ffi::OsString::from("state"),
        std::ffi::OsStr::to_os_string,
    );
    name.push(".tmp");
    path.with_file_name(name)
}
