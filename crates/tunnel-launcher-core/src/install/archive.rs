//! Archive extraction and binary discovery.

use crate::error::{LauncherError, Result};
use crate::platform::ArchiveFormat;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Extract `archive_path` into `dest_dir` according to `format`.
pub fn extract(archive_path: &Path, format: ArchiveFormat, dest_dir: &Path) -> Result<()> {
    debug!(
        "Extracting {} ({}) into {}",
        archive_path.display(),
        format.extension(),
        dest_dir.display()
    );
    match format {
        ArchiveFormat::Zip => extract_zip(archive_path, dest_dir),
        ArchiveFormat::TarGz => extract_tarball(archive_path, dest_dir),
    }
}

/// Extract a zip archive, skipping entries that would escape `dest_dir`.
pub fn extract_zip(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let file = File::open(archive_path).map_err(|e| LauncherError::io_with_path(e, archive_path))?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file))
        .map_err(|e| archive_error(archive_path, "Failed to read zip", e))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| archive_error(archive_path, "Failed to read zip entry", e))?;

        let Some(relative) = entry.enclosed_name() else {
            debug!("Skipping unsafe zip entry {}", entry.name());
            continue;
        };
        let outpath = dest_dir.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&outpath)
                .map_err(|e| LauncherError::io_with_path(e, &outpath))?;
            continue;
        }

        if let Some(parent) = outpath.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LauncherError::io_with_path(e, parent))?;
        }
        let mut outfile =
            File::create(&outpath).map_err(|e| LauncherError::io_with_path(e, &outpath))?;
        std::io::copy(&mut entry, &mut outfile)
            .map_err(|e| LauncherError::io_with_path(e, &outpath))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                std::fs::set_permissions(&outpath, std::fs::Permissions::from_mode(mode & 0o777))
                    .map_err(|e| LauncherError::io_with_path(e, &outpath))?;
            }
        }
    }

    Ok(())
}

/// Extract a gzip-compressed tarball.
pub fn extract_tarball(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let file = File::open(archive_path).map_err(|e| LauncherError::io_with_path(e, archive_path))?;
    let decoder = flate2::read::GzDecoder::new(BufReader::new(file));
    let mut archive = tar::Archive::new(decoder);
    archive.unpack(dest_dir).map_err(|e| LauncherError::Io {
        message: format!("Failed to extract tarball: {}", e),
        path: Some(archive_path.to_path_buf()),
        source: Some(e),
    })
}

/// Find a regular file named `binary_name` anywhere under `dir`.
///
/// Archives nest the binary (`sc-4.9.1-linux/bin/sc`), so the shallowest
/// match wins.
pub fn find_binary(dir: &Path, binary_name: &str) -> Option<PathBuf> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file() && entry.file_name() == binary_name)
        .min_by_key(|entry| entry.depth())
        .map(|entry| entry.into_path())
}

fn archive_error(archive_path: &Path, context: &str, err: zip::result::ZipError) -> LauncherError {
    LauncherError::Io {
        message: format!("{}: {}", context, err),
        path: Some(archive_path.to_path_buf()),
        source: None,
    }
}
