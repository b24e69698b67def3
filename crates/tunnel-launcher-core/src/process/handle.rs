//! Handle to a running tunnel.
//!
//! State machine:
//!
//! ```text
//! Running --close()--> Closing --exit--> Terminated
//!    |                                      ^
//!    +----------- unexpected exit ----------+
//! ```
//!
//! Every live handle is also recorded in a process-wide registry so
//! [`kill_all`] can tear down tunnels whose handles were dropped.

use crate::config::LaunchOptions;
use crate::error::Result;
use crate::process::monitor::LogMonitor;
use crate::process::pidfile;
use crate::process::supervisor::{ExitInfo, ProcessAttempt, ProcessControl};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Lifecycle state of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Running,
    Closing,
    Terminated,
}

struct HandleInner {
    id: u64,
    tunnel_id: Option<String>,
    port: Option<u16>,
    detached: bool,
    pid_file: Option<PathBuf>,
    process: ProcessControl,
    state: Mutex<TunnelState>,
}

impl HandleInner {
    fn state(&self) -> MutexGuard<'_, TunnelState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mark_terminated(&self) {
        *self.state() = TunnelState::Terminated;
        unregister(self.id);
    }
}

/// A running tunnel proxy.
///
/// Cloning is cheap; all clones control the same process.
#[derive(Clone)]
pub struct TunnelHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("pid", &self.pid())
            .field("tunnel_id", &self.inner.tunnel_id)
            .field("detached", &self.inner.detached)
            .field("state", &self.state())
            .finish()
    }
}

impl TunnelHandle {
    /// Take over a successful attempt.
    ///
    /// Output keeps flowing to the caller's sink until the process exits.
    pub(crate) fn promote(attempt: ProcessAttempt, options: &LaunchOptions) -> Self {
        let (monitor, lines, process, pid_file) = attempt.into_parts();

        let inner = Arc::new(HandleInner {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            tunnel_id: monitor.tunnel_id().map(str::to_string),
            port: monitor.port(),
            detached: options.detached,
            pid_file,
            process,
            state: Mutex::new(TunnelState::Running),
        });
        register(inner.clone());
        spawn_output_drain(monitor, lines);

        // Move to Terminated on any exit, expected or not.
        let watched = inner.clone();
        tokio::spawn(async move {
            let mut process = watched.process.clone();
            let exit = process.wait().await;
            let previous = *watched.state();
            if previous == TunnelState::Running {
                warn!(
                    "Tunnel proxy {} exited unexpectedly with code {:?}",
                    process.pid(),
                    exit.code
                );
            }
            watched.mark_terminated();
        });

        info!(
            "Tunnel {} running (pid {})",
            inner.tunnel_id.as_deref().unwrap_or("<unknown>"),
            inner.process.pid()
        );
        Self { inner }
    }

    pub fn pid(&self) -> u32 {
        self.inner.process.pid()
    }

    /// Tunnel identifier reported by the proxy, if it printed one.
    pub fn tunnel_id(&self) -> Option<&str> {
        self.inner.tunnel_id.as_deref()
    }

    /// Local port the proxy reported listening on.
    pub fn port(&self) -> Option<u16> {
        self.inner.port
    }

    pub fn is_detached(&self) -> bool {
        self.inner.detached
    }

    pub fn state(&self) -> TunnelState {
        if self.inner.process.exit_info().is_some() {
            return TunnelState::Terminated;
        }
        *self.inner.state()
    }

    /// Gracefully stop the proxy and wait for it to exit.
    ///
    /// Safe to call more than once: a second call while closing waits for
    /// the same exit, and a call after termination returns immediately.
    pub async fn close(&self) -> Result<()> {
        let should_signal = {
            let mut state = self.inner.state();
            match *state {
                TunnelState::Terminated => return Ok(()),
                TunnelState::Closing => false,
                TunnelState::Running => {
                    *state = TunnelState::Closing;
                    true
                }
            }
        };

        if should_signal {
            debug!("Closing tunnel proxy {}", self.pid());
            if let Err(e) = self.inner.process.terminate() {
                *self.inner.state() = TunnelState::Running;
                return Err(e);
            }
        }

        self.exited().await;
        if let Some(ref path) = self.inner.pid_file {
            pidfile::remove_pid_file(path)?;
        }
        self.inner.mark_terminated();
        info!("Tunnel proxy {} closed", self.pid());
        Ok(())
    }

    /// Force the proxy down immediately without waiting.
    pub fn kill(&self) -> Result<()> {
        if self.state() == TunnelState::Terminated {
            return Ok(());
        }
        debug!("Killing tunnel proxy {}", self.pid());
        self.inner.process.kill()
    }

    /// Resolves when the proxy exits for any reason.
    pub async fn exited(&self) -> ExitInfo {
        let mut process = self.inner.process.clone();
        process.wait().await
    }
}

/// Keep reading the proxy's output after promotion.
fn spawn_output_drain(mut monitor: LogMonitor, mut lines: mpsc::Receiver<String>) {
    tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            monitor.observe(&line);
        }
    });
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

fn registry() -> MutexGuard<'static, HashMap<u64, Arc<HandleInner>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<u64, Arc<HandleInner>>>> = OnceLock::new();
    REGISTRY
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

fn register(inner: Arc<HandleInner>) {
    registry().insert(inner.id, inner);
}

fn unregister(id: u64) {
    registry().remove(&id);
}

/// Force-kill every tunnel started by this process that is still running.
///
/// Returns how many proxies were signalled.
pub fn kill_all() -> usize {
    let handles: Vec<_> = registry().values().cloned().collect();
    let mut killed = 0;
    for inner in handles {
        if inner.process.exit_info().is_some() {
            continue;
        }
        match inner.process.kill() {
            Ok(()) => killed += 1,
            Err(e) => warn!("Failed to kill proxy {}: {}", inner.process.pid(), e),
        }
    }
    if killed > 0 {
        info!("Killed {} tunnel proxies", killed);
    }
    killed
}
