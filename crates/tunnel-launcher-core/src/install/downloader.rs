//! Download pipeline: resolve, stream, verify, extract, promote.
//!
//! Every attempt runs the whole pipeline from scratch and reports progress to
//! the caller's sink with a fixed set of notices. The archive is streamed
//! into a temp file inside the install directory so the final rename never
//! crosses filesystems.

use crate::cancel::CancellationToken;
use crate::config::{DownloadConfig, LaunchOptions, NetworkConfig};
use crate::error::{LauncherError, Result};
use crate::install::archive;
use crate::install::checksum::{self, Sha256Hasher};
use crate::install::installed::{self, InstallMarker, InstalledBinary};
use crate::network::{retry_async, ArchiveCatalog, ArchiveDescriptor, HttpClient, RetryConfig};
use crate::platform::{self, Platform};
use chrono::Utc;
use futures::StreamExt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Downloads and installs the proxy binary for one set of options.
pub struct Downloader<'a> {
    options: &'a LaunchOptions,
    cancel: CancellationToken,
}

impl<'a> Downloader<'a> {
    pub fn new(options: &'a LaunchOptions) -> Self {
        Self {
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort between chunks when `cancel` fires.
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Make sure a usable binary is present, downloading it if needed.
    ///
    /// An executable override is returned as-is without touching the disk
    /// or the network.
    pub async fn ensure(&self) -> Result<InstalledBinary> {
        if let Some(ref executable) = self.options.executable {
            debug!("Using executable override {}", executable.display());
            return Ok(InstalledBinary::external(executable.clone()));
        }

        let requested = self.options.version.as_deref();
        match InstalledBinary::read(&self.options.install_dir) {
            Ok(Some(existing)) if existing.satisfies(requested) => {
                debug!(
                    "Proxy {} already installed at {}",
                    existing.version.as_deref().unwrap_or("unknown"),
                    existing.executable.display()
                );
                return Ok(existing);
            }
            Ok(_) => {}
            // The marker is rewritten by the next successful install.
            Err(e) => warn!("Ignoring unreadable install marker: {}", e),
        }

        self.download().await
    }

    /// Download and install unconditionally, retrying the whole pipeline.
    pub async fn download(&self) -> Result<InstalledBinary> {
        let platform = Platform::current().ok_or_else(|| LauncherError::Config {
            message: format!(
                "Unsupported platform {}/{}",
                std::env::consts::OS,
                std::env::consts::ARCH
            ),
        })?;

        let config = RetryConfig::from_retries(self.options.download_retries);
        let (result, stats) = retry_async(
            &config,
            |attempt| self.attempt(platform, attempt),
            LauncherError::is_retryable,
        )
        .await;

        match result {
            Ok(installed) => {
                info!(
                    "Installed proxy {} after {} attempt(s)",
                    installed.version.as_deref().unwrap_or("unknown"),
                    stats.attempts
                );
                Ok(installed)
            }
            Err(e) => {
                warn!("Download failed after {} attempt(s): {}", stats.attempts, e);
                Err(e)
            }
        }
    }

    async fn attempt(&self, platform: Platform, attempt: u32) -> Result<InstalledBinary> {
        self.cancel.check()?;
        self.options
            .log("Missing Sauce Connect local proxy, downloading dependency");
        self.options.log("This will only happen once.");
        debug!("Download attempt {} for {}", attempt, platform);

        let client = HttpClient::with_timeout(&self.options.proxy, NetworkConfig::DOWNLOAD_TIMEOUT)?;
        let catalog = ArchiveCatalog::new(
            &client,
            &self.options.manifest_url,
            &self.options.download_base_url,
        );
        let descriptor = catalog
            .resolve(self.options.version.as_deref(), platform)
            .await?;

        let install_dir = &self.options.install_dir;
        std::fs::create_dir_all(install_dir)
            .map_err(|e| LauncherError::io_with_path(e, install_dir))?;

        let archive = self.fetch_archive(&client, &descriptor, install_dir).await?;
        let archive_path = archive.path().to_path_buf();

        self.options
            .log(&format!("Unzipping {}", archive_path.display()));
        let staging = tempfile::Builder::new()
            .prefix(DownloadConfig::STAGING_PREFIX)
            .tempdir_in(install_dir)
            .map_err(|e| LauncherError::io_with_path(e, install_dir))?;
        let relative = extract_in_background(
            archive_path.clone(),
            descriptor.format,
            staging.path().to_path_buf(),
            platform.binary_name(),
        )
        .await?;

        self.options
            .log(&format!("Removing {}", archive_path.display()));
        archive
            .close()
            .map_err(|e| LauncherError::io_with_path(e, &archive_path))?;

        let installed = promote(install_dir, staging.path(), &relative, &descriptor)?;
        self.options.log("Sauce Connect downloaded correctly");
        Ok(installed)
    }

    /// Stream the archive to a temp file, hashing as it arrives.
    async fn fetch_archive(
        &self,
        client: &HttpClient,
        descriptor: &ArchiveDescriptor,
        install_dir: &Path,
    ) -> Result<tempfile::NamedTempFile> {
        let response = client.get(&descriptor.url).await?;
        let status = response.status();
        if !status.is_success() {
            self.options
                .log(&format!("Invalid response status: {}", status.as_u16()));
            return Err(LauncherError::InvalidStatus {
                url: descriptor.url.clone(),
                status: status.as_u16(),
            });
        }
        self.options.log(&format!("Downloading {}", descriptor.url));

        let mut file = tempfile::Builder::new()
            .prefix(DownloadConfig::TEMP_PREFIX)
            .suffix(&format!(".{}", descriptor.format.extension()))
            .tempfile_in(install_dir)
            .map_err(|e| LauncherError::io_with_path(e, install_dir))?;

        let mut hasher = Sha256Hasher::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            self.cancel.check()?;
            let chunk = chunk.map_err(|e| {
                LauncherError::network(&format!("Error reading {}", descriptor.url), &e)
            })?;
            hasher.update(&chunk);
            file.write_all(&chunk)
                .map_err(|e| LauncherError::io_with_path(e, file.path()))?;
        }
        file.flush()
            .map_err(|e| LauncherError::io_with_path(e, file.path()))?;
        debug!("Downloaded {} bytes from {}", hasher.bytes(), descriptor.url);

        let actual = hasher.finalize_hex();
        match descriptor.checksum {
            Some(ref expected) => {
                checksum::verify(expected, &actual)?;
                self.options.log("Archive checksum verified.");
            }
            None => {
                self.options.log(&format!(
                    "Archive checksum not published for {}, skipping verification.",
                    descriptor.version
                ));
            }
        }

        Ok(file)
    }
}

/// Extract on the blocking pool and return the binary's path relative to
/// `staging`.
async fn extract_in_background(
    archive_path: PathBuf,
    format: platform::ArchiveFormat,
    staging: PathBuf,
    binary_name: &'static str,
) -> Result<PathBuf> {
    tokio::task::spawn_blocking(move || -> Result<PathBuf> {
        archive::extract(&archive_path, format, &staging)?;
        let binary = archive::find_binary(&staging, binary_name).ok_or_else(|| {
            LauncherError::NotFound {
                what: format!("{} in {}", binary_name, archive_path.display()),
            }
        })?;
        platform::set_executable(&binary)?;
        Ok(binary
            .strip_prefix(&staging)
            .map(Path::to_path_buf)
            .unwrap_or(binary))
    })
    .await
    .map_err(|e| LauncherError::Io {
        message: format!("Extraction task failed: {}", e),
        path: None,
        source: None,
    })?
}

/// Move the staging directory into place and record the marker.
fn promote(
    install_dir: &Path,
    staging: &Path,
    relative_binary: &Path,
    descriptor: &ArchiveDescriptor,
) -> Result<InstalledBinary> {
    let target = installed::version_dir(install_dir, &descriptor.version);
    if target.exists() {
        debug!("Replacing previous install at {}", target.display());
        std::fs::remove_dir_all(&target).map_err(|e| LauncherError::io_with_path(e, &target))?;
    }
    std::fs::rename(staging, &target).map_err(|e| LauncherError::io_with_path(e, &target))?;

    let dir_name = target
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(&descriptor.version));
    let installed_at = Utc::now();
    let marker = InstallMarker {
        version: descriptor.version.clone(),
        executable: dir_name.join(relative_binary),
        url: descriptor.url.clone(),
        checksum: descriptor.checksum.clone(),
        installed_at,
    };
    installed::write_marker(install_dir, &marker)?;

    let executable = target.join(relative_binary);
    info!("Installed {} at {}", descriptor.version, executable.display());
    Ok(InstalledBinary {
        executable,
        version: Some(descriptor.version.clone()),
        installed_at: Some(installed_at),
    })
}
