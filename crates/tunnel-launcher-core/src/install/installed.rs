//! Install marker and lookup of the managed binary.
//!
//! The install directory looks like:
//!
//! ```text
//! <install_dir>/
//!   installed.json           marker for the active install
//!   sc-4.9.1/                one directory per installed version
//!     sc-4.9.1-linux/bin/sc
//! ```
//!
//! The marker is only written after the version directory is in place, so a
//! marker that exists always points at a complete install.

use crate::atomic::{atomic_read_json, atomic_write_json};
use crate::config::{DownloadConfig, PathsConfig};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Contents of `installed.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallMarker {
    pub version: String,
    /// Executable path relative to the install directory.
    pub executable: PathBuf,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub installed_at: DateTime<Utc>,
}

/// A proxy binary ready to be launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledBinary {
    pub executable: PathBuf,
    /// `None` for a caller-supplied executable.
    pub version: Option<String>,
    pub installed_at: Option<DateTime<Utc>>,
}

impl InstalledBinary {
    /// Wrap an executable that isn't managed by the install directory.
    pub fn external(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            version: None,
            installed_at: None,
        }
    }

    /// Read the active install under `install_dir`.
    ///
    /// Returns `None` when there is no marker or the marker points at a
    /// binary that no longer exists.
    pub fn read(install_dir: &Path) -> Result<Option<Self>> {
        let marker_path = marker_path(install_dir);
        let Some(marker) = atomic_read_json::<InstallMarker>(&marker_path)? else {
            debug!("No install marker at {}", marker_path.display());
            return Ok(None);
        };

        let executable = install_dir.join(&marker.executable);
        if !executable.is_file() {
            warn!(
                "Install marker points at missing binary {}",
                executable.display()
            );
            return Ok(None);
        }

        Ok(Some(Self {
            executable,
            version: Some(marker.version),
            installed_at: Some(marker.installed_at),
        }))
    }

    /// Whether this install satisfies a version request.
    pub fn satisfies(&self, requested: Option<&str>) -> bool {
        match (requested, self.version.as_deref()) {
            (None, _) => true,
            (Some(requested), Some(installed)) => {
                requested.trim_start_matches('v') == installed.trim_start_matches('v')
            }
            (Some(_), None) => false,
        }
    }
}

/// Path of the marker file under `install_dir`.
pub fn marker_path(install_dir: &Path) -> PathBuf {
    install_dir.join(DownloadConfig::MARKER_FILENAME)
}

/// Directory a given version is installed into.
pub fn version_dir(install_dir: &Path, version: &str) -> PathBuf {
    install_dir.join(format!("{}{}", PathsConfig::VERSION_DIR_PREFIX, version))
}

/// Atomically record `marker` as the active install.
pub fn write_marker(install_dir: &Path, marker: &InstallMarker) -> Result<()> {
    atomic_write_json(&marker_path(install_dir), marker)
}
