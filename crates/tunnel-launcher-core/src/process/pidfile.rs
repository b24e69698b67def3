//! Pid files for detached proxies.
//!
//! A pid file holds the decimal pid and nothing else. A missing file means
//! the proxy is not running.

use crate::atomic::atomic_write;
use crate::error::{LauncherError, Result};
use crate::platform::{self, SignalOutcome};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Atomically record `pid` in `path`.
pub fn write_pid_file(path: &Path, pid: u32) -> Result<()> {
    atomic_write(path, pid.to_string().as_bytes())?;
    debug!("Wrote pid {} to {}", pid, path.display());
    Ok(())
}

/// Read a pid file. Returns `None` if it doesn't exist.
pub fn read_pid_file(path: &Path) -> Result<Option<u32>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(LauncherError::io_with_path(e, path)),
    };

    contents
        .trim()
        .parse::<u32>()
        .map(Some)
        .map_err(|e| LauncherError::Parse {
            message: format!("Invalid pid in {}: {}", path.display(), e),
        })
}

/// Remove a pid file, ignoring a file that is already gone.
pub fn remove_pid_file(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed pid file {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(LauncherError::io_with_path(e, path)),
    }
}

/// Stop the process recorded in a pid file and remove the file.
///
/// Sends a graceful terminate, waits up to `grace`, then force-kills.
/// Returns `false` if nothing was running.
pub async fn stop_by_pid_file(path: &Path, grace: Duration) -> Result<bool> {
    let Some(pid) = read_pid_file(path)? else {
        debug!("No pid file at {}", path.display());
        return Ok(false);
    };

    if !platform::is_process_alive(pid) {
        info!("Process {} from {} is not running", pid, path.display());
        remove_pid_file(path)?;
        return Ok(false);
    }

    if platform::request_terminate(pid)? == SignalOutcome::NotRunning {
        remove_pid_file(path)?;
        return Ok(false);
    }

    let poll = crate::config::SupervisorConfig::DETACHED_POLL_INTERVAL;
    if tokio::time::timeout(grace, platform::process::wait_for_exit(pid, poll))
        .await
        .is_err()
    {
        warn!(
            "Process {} did not exit within {:?}, force killing",
            pid, grace
        );
        platform::force_kill(pid)?;
        platform::process::wait_for_exit(pid, poll).await;
    }

    remove_pid_file(path)?;
    info!("Stopped process {}", pid);
    Ok(true)
}
