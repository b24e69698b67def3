//! Process supervision for the tunnel proxy.
//!
//! - `monitor` - readiness classification of proxy output
//! - `supervisor` - spawning and scoring one attempt
//! - `connect` - retrying attempts until the tunnel is up
//! - `handle` - the running tunnel and process-wide teardown
//! - `pidfile` - pid files for detached proxies

pub mod connect;
pub mod handle;
pub mod monitor;
pub mod pidfile;
pub mod supervisor;

pub use connect::ConnectRetryController;
pub use handle::{kill_all, TunnelHandle, TunnelState};
pub use monitor::{Classification, LogMarkers, LogMonitor, ReadinessState};
pub use pidfile::{read_pid_file, remove_pid_file, stop_by_pid_file, write_pid_file};
pub use supervisor::{build_args, ExitInfo, ProcessAttempt, ProcessSupervisor};
