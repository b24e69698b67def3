//! Network utilities for manifest resolution and archive downloads.
//!
//! This module provides:
//! - HTTP client built from explicit proxy settings
//! - Fixed-count retry for whole operations
//! - Archive catalog resolving a version to a download descriptor

mod catalog;
mod client;
mod retry;

pub use catalog::{ArchiveCatalog, ArchiveDescriptor, Manifest, ManifestEntry};
pub use client::HttpClient;
pub use retry::{retry_async, RetryConfig, RetryStats};
