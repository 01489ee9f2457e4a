//! Small JSON files written atomically.
//!
//! Used for the agent config and the session store. Writes go to a temp file
//! next to the target, are synced, then renamed over the target so a crash
//! never leaves a half-written file behind.

use crate::{BeaconError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::process;
use tracing::debug;

fn io_err(message: String, err: std::io::Error) -> BeaconError {
    BeaconError::Io {
        message: format!("{}: {}", message, err),
        source: Some(err),
    }
}

/// Read and parse a JSON file.
///
/// Returns `None` if the file doesn't exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(format!("Failed to read {}", path.display()), e)),
    };

    let data = serde_json::from_str(&contents).map_err(|e| BeaconError::Json {
        message: format!("Failed to parse {}: {}", path.display(), e),
        source: Some(e),
    })?;

    Ok(Some(data))
}

/// Write data to a JSON file atomically, creating parent directories.
pub fn write_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| {
                io_err(format!("Failed to create directory {}", parent.display()), e)
            })?;
        }
    }

    let temp_path = path.with_extension(format!("json.{}.tmp", process::id()));
    let serialized = serde_json::to_string_pretty(data)?;

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| {
                io_err(format!("Failed to create temp file {}", temp_path.display()), e)
            })?;

        file.write_all(serialized.as_bytes())
            .map_err(|e| io_err(format!("Failed to write {}", temp_path.display()), e))?;
        file.sync_all()
            .map_err(|e| io_err(format!("Failed to sync {}", temp_path.display()), e))?;
    }

    fs::rename(&temp_path, path).map_err(|e| {
        io_err(
            format!("Failed to rename {} to {}", temp_path.display(), path.display()),
            e,
        )
    })?;

    debug!("Atomically wrote {}", path.display());
    Ok(())
}

/// Remove a file, treating "already gone" as success.
pub fn remove_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(format!("Failed to remove {}", path.display()), e)),
    }
}
