//! Platform abstraction layer.
//!
//! All `#[cfg]` blocks for OS-specific behaviour live here rather than being
//! scattered through the download and supervision code.
//!
//! - `permissions` - making extracted binaries executable
//! - `process` - liveness checks and signal delivery by pid

pub mod permissions;
pub mod process;

pub use permissions::set_executable;
pub use process::{force_kill, is_process_alive, request_terminate, SignalOutcome};

use std::fmt;

/// Archive container format for a published build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::TarGz => "tar.gz",
        }
    }

    /// Infer the format from a URL or file name.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        if name.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else {
            None
        }
    }
}

/// Platform identifier used in the release manifest and archive names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Linux,
    LinuxArm64,
    MacOs,
    Windows,
}

impl Platform {
    /// Detect the platform this process is running on.
    pub fn current() -> Option<Self> {
        match (std::env::consts::OS, std::env::consts::ARCH) {
            ("linux", "x86_64") => Some(Platform::Linux),
            ("linux", "aarch64") => Some(Platform::LinuxArm64),
            ("macos", _) => Some(Platform::MacOs),
            ("windows", _) => Some(Platform::Windows),
            _ => None,
        }
    }

    /// Identifier as published in the manifest (`linux`, `osx`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::LinuxArm64 => "linux-arm64",
            Platform::MacOs => "osx",
            Platform::Windows => "win32",
        }
    }

    pub fn archive_format(&self) -> ArchiveFormat {
        match self {
            Platform::Linux | Platform::LinuxArm64 => ArchiveFormat::TarGz,
            Platform::MacOs | Platform::Windows => ArchiveFormat::Zip,
        }
    }

    /// File name of the proxy executable inside the archive.
    pub fn binary_name(&self) -> &'static str {
        match self {
            Platform::Windows => "sc.exe",
            _ => "sc",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
