//! Tunnel Launcher - download, launch and supervise a secure-tunnel proxy.
//!
//! The proxy binary (Sauce Connect by default) is installed on first use,
//! started as a child process, and watched line by line until it reports
//! that the tunnel is up. No fixed sleeps are involved: readiness comes
//! entirely from the proxy's own output.
//!
//! # Example
//!
//! ```rust,ignore
//! use tunnel_launcher::LaunchOptions;
//!
//! #[tokio::main]
//! async fn main() -> tunnel_launcher::Result<()> {
//!     let options = LaunchOptions::new("alice", "access-key")
//!         .with_connect_retries(2)
//!         .with_logger(|line| println!("{}", line));
//!
//!     let tunnel = tunnel_launcher::launch(options).await?;
//!     println!("Tunnel {:?} is up", tunnel.tunnel_id());
//!
//!     // ... run tests ...
//!
//!     tunnel.close().await?;
//!     Ok(())
//! }
//! ```

pub mod atomic;
pub mod cancel;
pub mod config;
pub mod error;
pub mod install;
pub mod network;
pub mod platform;
pub mod process;

pub use cancel::CancellationToken;
pub use config::{FlagValue, LaunchOptions, LogSink, ProxySettings};
pub use error::{LauncherError, Result};
pub use install::{Downloader, InstalledBinary};
pub use network::ArchiveDescriptor;
pub use process::{
    kill_all, stop_by_pid_file, ExitInfo, LogMarkers, TunnelHandle, TunnelState,
};

use process::ConnectRetryController;
use std::sync::Arc;
use tracing::{debug, info};

/// Entry point holding one immutable set of options.
///
/// `launch` is sequential: the binary is made available first, then the
/// connect attempts run. Independent launchers share no state.
pub struct Launcher {
    options: Arc<LaunchOptions>,
    markers: Arc<LogMarkers>,
    cancel: CancellationToken,
}

impl Launcher {
    /// Create a launcher with the default Sauce Connect log markers.
    pub fn new(options: LaunchOptions) -> Result<Self> {
        Ok(Self {
            options: Arc::new(options),
            markers: Arc::new(LogMarkers::sauce_connect()?),
            cancel: CancellationToken::new(),
        })
    }

    /// Use a custom marker set for a proxy with different output.
    pub fn with_markers(mut self, markers: LogMarkers) -> Self {
        self.markers = Arc::new(markers);
        self
    }

    /// Abort the download or the current connect attempt when `cancel` fires.
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn options(&self) -> &LaunchOptions {
        &self.options
    }

    /// Make sure the proxy binary is installed.
    pub async fn download(&self) -> Result<InstalledBinary> {
        Downloader::new(&self.options)
            .with_cancel_token(self.cancel.clone())
            .ensure()
            .await
    }

    /// Install if needed, then start the proxy and wait for the tunnel.
    pub async fn launch(&self) -> Result<TunnelHandle> {
        let binary = self.download().await?;
        debug!("Launching {}", binary.executable.display());

        let handle = ConnectRetryController::new(self.options.clone(), self.markers.clone())
            .with_cancel_token(self.cancel.clone())
            .connect(&binary)
            .await?;
        info!("Tunnel established (pid {})", handle.pid());
        Ok(handle)
    }
}

/// Download if needed, then launch the proxy and wait for the tunnel.
pub async fn launch(options: LaunchOptions) -> Result<TunnelHandle> {
    Launcher::new(options)?.launch().await
}

/// Make sure the proxy binary is installed without launching it.
pub async fn download(options: &LaunchOptions) -> Result<InstalledBinary> {
    Downloader::new(options).ensure().await
}
