//! Platform-specific process signalling by pid.
//!
//! Detached proxies are only known by a recorded pid, so every operation here
//! works without a process-table handle and treats "no such process" as an
//! already-terminated process rather than an error.

use crate::error::{LauncherError, Result};
use std::time::Duration;
use tracing::{debug, warn};

/// Result of delivering a signal to a pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Delivered,
    /// The process was already gone.
    NotRunning,
}

/// Check if a process with the given PID is alive.
///
/// # Platform Behavior
/// - **Linux/macOS**: `kill(pid, 0)`; `EPERM` still means the process exists
/// - **Windows**: `tasklist` filtered by PID
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;

        let Some(nix_pid) = to_nix_pid(pid) else {
            return false;
        };
        match kill(nix_pid, None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(windows)]
    {
        std::process::Command::new("tasklist")
            .args(["/FI", &format!("PID eq {}", pid), "/NH"])
            .output()
            .map(|o| String::from_utf8_lossy(&o.stdout).contains(&pid.to_string()))
            .unwrap_or(false)
    }

    #[cfg(not(any(unix, windows)))]
    {
        warn!("Process alive check not implemented for this platform");
        true
    }
}

/// Ask a process to shut down gracefully.
///
/// # Platform Behavior
/// - **Linux/macOS**: SIGTERM
/// - **Windows**: `taskkill /PID {pid} /T` (no `/F`)
pub fn request_terminate(pid: u32) -> Result<SignalOutcome> {
    #[cfg(unix)]
    {
        send_unix_signal(pid, nix::sys::signal::Signal::SIGTERM)
    }

    #[cfg(windows)]
    {
        taskkill(pid, false)
    }

    #[cfg(not(any(unix, windows)))]
    {
        Err(LauncherError::Config {
            message: "Process termination not implemented for this platform".into(),
        })
    }
}

/// Terminate a process immediately.
///
/// # Platform Behavior
/// - **Linux/macOS**: SIGKILL
/// - **Windows**: `taskkill /PID {pid} /F /T`
pub fn force_kill(pid: u32) -> Result<SignalOutcome> {
    #[cfg(unix)]
    {
        send_unix_signal(pid, nix::sys::signal::Signal::SIGKILL)
    }

    #[cfg(windows)]
    {
        taskkill(pid, true)
    }

    #[cfg(not(any(unix, windows)))]
    {
        Err(LauncherError::Config {
            message: "Process termination not implemented for this platform".into(),
        })
    }
}

/// Wait until a pid disappears from the process table.
///
/// Polls at `interval`. On Unix a non-blocking `waitpid` runs on every tick
/// so a process that is still our child doesn't linger as a zombie.
pub async fn wait_for_exit(pid: u32, interval: Duration) {
    loop {
        #[cfg(unix)]
        reap(pid);

        if !is_process_alive(pid) {
            debug!("Process {} has exited", pid);
            return;
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(unix)]
fn to_nix_pid(pid: u32) -> Option<nix::unistd::Pid> {
    // 0 and values above i32::MAX would address process groups.
    i32::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .map(nix::unistd::Pid::from_raw)
}

#[cfg(unix)]
fn send_unix_signal(pid: u32, signal: nix::sys::signal::Signal) -> Result<SignalOutcome> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;

    let Some(nix_pid) = to_nix_pid(pid) else {
        return Ok(SignalOutcome::NotRunning);
    };

    debug!("Sending {} to process {}", signal, pid);
    match kill(nix_pid, signal) {
        Ok(()) => Ok(SignalOutcome::Delivered),
        Err(Errno::ESRCH) => {
            debug!("Process {} is not running", pid);
            Ok(SignalOutcome::NotRunning)
        }
        Err(e) => Err(LauncherError::Io {
            message: format!("Failed to send {} to process {}: {}", signal, pid, e),
            path: None,
            source: Some(std::io::Error::from(e)),
        }),
    }
}

#[cfg(unix)]
fn reap(pid: u32) {
    use nix::sys::wait::{waitpid, WaitPidFlag};

    if let Some(nix_pid) = to_nix_pid(pid) {
        // ECHILD just means we're not the parent; init reaps it instead.
        let _ = waitpid(nix_pid, Some(WaitPidFlag::WNOHANG));
    }
}

#[cfg(windows)]
fn taskkill(pid: u32, force: bool) -> Result<SignalOutcome> {
    use std::process::Command;

    let pid_arg = pid.to_string();
    let mut args = vec!["/PID", pid_arg.as_str(), "/T"];
    if force {
        args.push("/F");
    }

    let output = Command::new("taskkill").args(&args).output().map_err(|e| {
        LauncherError::Io {
            message: format!("Failed to run taskkill: {}", e),
            path: None,
            source: Some(e),
        }
    })?;

    if output.status.success() {
        return Ok(SignalOutcome::Delivered);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("not found") || stderr.contains("not running") {
        Ok(SignalOutcome::NotRunning)
    } else {
        warn!("taskkill failed for {}: {}", pid, stderr);
        Err(LauncherError::Io {
            message: format!("taskkill failed for {}: {}", pid, stderr.trim()),
            path: None,
            source: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_process_alive_self() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_is_process_alive_out_of_range() {
        // Must not be interpreted as a process group.
        assert!(!is_process_alive(4_000_000_000));
        assert!(!is_process_alive(0));
    }

    #[test]
    fn test_signal_nonexistent_process() {
        assert_eq!(
            request_terminate(4_000_000_000).unwrap(),
            SignalOutcome::NotRunning
        );
        assert_eq!(force_kill(4_000_000_000).unwrap(), SignalOutcome::NotRunning);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_and_wait_for_exit() {
        let child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        assert!(is_process_alive(pid));

        assert_eq!(request_terminate(pid).unwrap(), SignalOutcome::Delivered);
        tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_exit(pid, Duration::from_millis(20)),
        )
        .await
        .expect("process did not exit after SIGTERM");

        // Signalling a reaped pid is not an error.
        assert_eq!(force_kill(pid).unwrap(), SignalOutcome::NotRunning);
        drop(child);
    }
}
