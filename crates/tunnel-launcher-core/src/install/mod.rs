//! Managed installation of the proxy binary.
//!
//! - `checksum` - streaming SHA-256 verification
//! - `archive` - zip/tar.gz extraction and binary discovery
//! - `installed` - the `installed.json` marker and install lookup
//! - `downloader` - the retrying download, verify, extract, promote pipeline

pub mod archive;
pub mod checksum;
mod downloader;
pub mod installed;

pub use downloader::Downloader;
pub use installed::{InstallMarker, InstalledBinary};
