//! Archive catalog: resolves a version selector to a downloadable archive.
//!
//! Unpinned requests read the release manifest, a JSON object keyed by
//! platform identifier:
//!
//! ```json
//! {
//!   "linux": { "version": "4.9.1", "url": "https://.../sc-4.9.1-linux.tar.gz", "checksum": "9f86d0..." },
//!   "osx":   { "version": "4.9.1", "url": "https://.../sc-4.9.1-osx.zip", "checksum": "60303a..." }
//! }
//! ```
//!
//! Pinned requests skip the manifest and build the archive URL from the
//! download base, which means no checksum is available for them.

use crate::error::{LauncherError, Result};
use crate::network::client::HttpClient;
use crate::platform::{ArchiveFormat, Platform};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

/// Everything needed to fetch and verify one platform archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveDescriptor {
    pub version: String,
    pub url: String,
    /// Lowercase hex SHA-256 of the archive, when published.
    pub checksum: Option<String>,
    pub format: ArchiveFormat,
}

/// One platform entry of the release manifest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ManifestEntry {
    pub version: String,
    #[serde(alias = "download_url")]
    pub url: String,
    #[serde(default, alias = "sha256")]
    pub checksum: Option<String>,
}

/// Parsed release manifest.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    entries: HashMap<String, ManifestEntry>,
}

impl Manifest {
    /// Parse a manifest body.
    pub fn parse(body: &str) -> Result<Self> {
        serde_json::from_str(body).map_err(|e| LauncherError::Parse {
            message: e.to_string(),
        })
    }

    pub fn entry(&self, platform: Platform) -> Option<&ManifestEntry> {
        self.entries.get(platform.as_str())
    }

    /// Select the archive for `platform`, optionally requiring a version.
    pub fn descriptor_for(
        &self,
        platform: Platform,
        requested: Option<&str>,
    ) -> Result<ArchiveDescriptor> {
        let entry = self.entry(platform).ok_or_else(|| LauncherError::NotFound {
            what: format!("platform {}", platform),
        })?;

        if let Some(requested) = requested {
            if !versions_match(requested, &entry.version) {
                return Err(LauncherError::NotFound {
                    what: format!("version {} on {}", requested, platform),
                });
            }
        }

        let url = url::Url::parse(&entry.url).map_err(|e| LauncherError::Parse {
            message: format!("Invalid archive URL {:?} for {}: {}", entry.url, platform, e),
        })?;
        let format = ArchiveFormat::from_name(url.path()).unwrap_or(platform.archive_format());
        let checksum = entry
            .checksum
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_ascii_lowercase);

        Ok(ArchiveDescriptor {
            version: entry.version.clone(),
            url: url.into(),
            checksum,
            format,
        })
    }
}

/// Compare versions semantically when both parse, textually otherwise.
fn versions_match(requested: &str, published: &str) -> bool {
    let requested = requested.trim_start_matches('v');
    let published = published.trim_start_matches('v');
    match (
        semver::Version::parse(requested),
        semver::Version::parse(published),
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => requested == published,
    }
}

/// Stateless resolver from version selector to [`ArchiveDescriptor`].
pub struct ArchiveCatalog<'a> {
    client: &'a HttpClient,
    manifest_url: &'a str,
    download_base_url: &'a str,
}

impl<'a> ArchiveCatalog<'a> {
    pub fn new(client: &'a HttpClient, manifest_url: &'a str, download_base_url: &'a str) -> Self {
        Self {
            client,
            manifest_url,
            download_base_url,
        }
    }

    /// Resolve `version` (or the latest published release) for `platform`.
    pub async fn resolve(
        &self,
        version: Option<&str>,
        platform: Platform,
    ) -> Result<ArchiveDescriptor> {
        match version {
            Some(version) => Ok(self.pinned(version, platform)),
            None => {
                let manifest = self.fetch_manifest().await?;
                let descriptor = manifest.descriptor_for(platform, None)?;
                info!(
                    "Latest proxy release for {} is {}",
                    platform, descriptor.version
                );
                Ok(descriptor)
            }
        }
    }

    /// Descriptor for a pinned version, built from the download base URL.
    pub fn pinned(&self, version: &str, platform: Platform) -> ArchiveDescriptor {
        let format = platform.archive_format();
        let url = format!(
            "{}/sc-{}-{}.{}",
            self.download_base_url.trim_end_matches('/'),
            version,
            platform.as_str(),
            format.extension()
        );
        debug!("Pinned version {} resolves to {}", version, url);
        ArchiveDescriptor {
            version: version.to_string(),
            url,
            checksum: None,
            format,
        }
    }

    /// Fetch and parse the release manifest.
    pub async fn fetch_manifest(&self) -> Result<Manifest> {
        let response = self.client.get_success(self.manifest_url).await?;
        let body = response.text().await.map_err(|e| {
            LauncherError::network(&format!("Failed to read {}", self.manifest_url), &e)
        })?;
        Manifest::parse(&body)
    }
}
