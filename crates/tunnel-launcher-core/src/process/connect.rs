//! Connect phase: run supervised attempts until one establishes a tunnel.

use crate::cancel::CancellationToken;
use crate::config::{LaunchOptions, SupervisorConfig};
use crate::error::{LauncherError, Result};
use crate::install::InstalledBinary;
use crate::network::{retry_async, RetryConfig};
use crate::process::handle::TunnelHandle;
use crate::process::monitor::LogMarkers;
use crate::process::supervisor::{ProcessAttempt, ProcessSupervisor};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Drives up to `connect_retries + 1` launch attempts.
pub struct ConnectRetryController {
    options: Arc<LaunchOptions>,
    supervisor: ProcessSupervisor,
    cancel: CancellationToken,
}

impl ConnectRetryController {
    pub fn new(options: Arc<LaunchOptions>, markers: Arc<LogMarkers>) -> Self {
        Self {
            supervisor: ProcessSupervisor::new(options.clone(), markers),
            options,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Launch `binary` and return a handle once the tunnel is established.
    ///
    /// The last attempt's error is returned unchanged when all attempts fail.
    pub async fn connect(&self, binary: &InstalledBinary) -> Result<TunnelHandle> {
        let config = RetryConfig::from_retries(self.options.connect_retries);
        let max_attempts = config.max_attempts;
        let (result, stats) = retry_async(
            &config,
            |attempt| self.attempt(binary, attempt, max_attempts),
            LauncherError::is_retryable,
        )
        .await;

        match result {
            Ok(handle) => {
                self.options.log("Testing tunnel ready");
                info!(
                    "Tunnel ready after {} attempt(s), pid {}",
                    stats.attempts,
                    handle.pid()
                );
                Ok(handle)
            }
            Err(e) => {
                warn!("Tunnel failed after {} attempt(s): {}", stats.attempts, e);
                Err(e)
            }
        }
    }

    async fn attempt(
        &self,
        binary: &InstalledBinary,
        attempt: u32,
        max_attempts: u32,
    ) -> Result<TunnelHandle> {
        self.cancel.check()?;
        debug!("Connect attempt {}/{}", attempt, max_attempts);

        let mut process = self.supervisor.spawn(binary).await?;
        match process
            .wait_established(self.options.connect_timeout, &self.cancel)
            .await
        {
            Ok(()) => Ok(TunnelHandle::promote(process, &self.options)),
            Err(e) => {
                if matches!(
                    e,
                    LauncherError::PrematureExit { .. } | LauncherError::Timeout(_)
                ) {
                    self.report_output_tail(&process);
                }
                process.abort().await;
                if e.is_retryable() && attempt < max_attempts {
                    self.options.log(&format!(
                        "Failed to start Sauce Connect (attempt {} of {}): {}, retrying",
                        attempt, max_attempts, e
                    ));
                } else {
                    self.options
                        .log(&format!("Failed to start Sauce Connect: {}", e));
                }
                Err(e)
            }
        }
    }

    /// Show the last lines the proxy printed before it exited or stalled.
    fn report_output_tail(&self, process: &ProcessAttempt) {
        let tail = process.output_tail(SupervisorConfig::FAILURE_TAIL_LINES);
        warn!(
            "Proxy {} gave up after {:?}, last output: {:?}",
            process.pid(),
            process.elapsed(),
            tail
        );
        if !tail.is_empty() {
            self.options
                .log(&format!("Last output before failure: {}", tail.join(" | ")));
        }
    }
}
