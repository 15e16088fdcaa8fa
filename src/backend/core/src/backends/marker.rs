use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::error::{ErrorCode, ForgeError, Result};

pub const MARKER_FILE: &str = "installed.json";

/// `installed.json`: the only authoritative signal that a backend is installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledMarker {
    pub version: String,
    pub backend_id: String,
    pub cuda_version: Option<String>,
    pub asset_name: String,
    pub installed_date: DateTime<Utc>,
    pub platform: String,
    pub arch: String,
}

/// The marker in `dir`, if it parses and its `backend_id` names `dir`.
pub fn read_marker(dir: &Path) -> Option<InstalledMarker> {
    let path = dir.join(MARKER_FILE);
    let bytes = std::fs::read(&path).ok()?;
    let marker: InstalledMarker = match serde_json::from_slice(&bytes) {
        Ok(marker) => marker,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Unreadable backend marker");
            return None;
        }
    };
    let dir_name = dir.file_name().and_then(|n| n.to_str())?;
    if marker.backend_id != dir_name {
        debug!(
            path = %path.display(),
            backend_id = %marker.backend_id,
            "Backend marker names a different directory"
        );
        return None;
    }
    Some(marker)
}

/// Write the marker, then read it back; an install without a readable
/// marker is not an install.
pub(super) fn write_marker(dir: &Path, marker: &InstalledMarker) -> Result<InstalledMarker> {
    std::fs::write(dir.join(MARKER_FILE), serde_json::to_vec_pretty(marker)?)?;
    read_marker(dir).ok_or_else(|| {
        ForgeError::new(
            ErrorCode::MarkerInvalid,
            format!("Install marker for '{}' missing after install", marker.backend_id),
        )
    })
}
