//! Spawning the proxy and scoring one launch attempt.
//!
//! A [`ProcessAttempt`] owns everything about a single try: the merged output
//! stream, the monitor classifying it, and the control side of the process
//! watcher. The attempt resolves in one `select!` over the next output line,
//! the process exit, the deadline, and cancellation.
//!
//! Attached proxies write into pipes. A detached proxy writes into a log file
//! instead, which is followed for classification; a pipe would close with
//! the launching process and take the proxy down on its next write.

use crate::cancel::CancellationToken;
use crate::config::{FlagValue, LaunchOptions, SupervisorConfig};
use crate::error::{LauncherError, Result};
use crate::install::InstalledBinary;
use crate::platform;
use crate::process::monitor::{Classification, LogMarkers, LogMonitor};
use crate::process::pidfile;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Buffered output lines between the reader tasks and the attempt.
const LINE_CHANNEL_CAPACITY: usize = 256;

/// How the proxy process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// `None` when killed by a signal.
    pub code: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    Terminate,
    Kill,
}

/// Signalling and exit observation for a spawned proxy.
///
/// Attached processes are signalled through the watcher task that owns the
/// child. Detached processes are signalled by pid only.
#[derive(Debug, Clone)]
pub(crate) struct ProcessControl {
    pid: u32,
    control: Option<mpsc::UnboundedSender<Control>>,
    exit: watch::Receiver<Option<ExitInfo>>,
}

impl ProcessControl {
    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    /// Request a graceful shutdown.
    pub(crate) fn terminate(&self) -> Result<()> {
        self.signal(Control::Terminate)
    }

    /// Force an immediate shutdown.
    pub(crate) fn kill(&self) -> Result<()> {
        self.signal(Control::Kill)
    }

    fn signal(&self, control: Control) -> Result<()> {
        if self.exit_info().is_some() {
            return Ok(());
        }
        match self.control {
            // A closed channel means the watcher already saw the exit.
            Some(ref tx) => {
                let _ = tx.send(control);
                Ok(())
            }
            None => {
                let outcome = match control {
                    Control::Terminate => platform::request_terminate(self.pid)?,
                    Control::Kill => platform::force_kill(self.pid)?,
                };
                debug!("{:?} of detached process {}: {:?}", control, self.pid, outcome);
                Ok(())
            }
        }
    }

    pub(crate) fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    /// Wait for the process to exit.
    pub(crate) async fn wait(&mut self) -> ExitInfo {
        match self.exit.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).unwrap_or(ExitInfo { code: None }),
            // Watcher gone without publishing; treat as gone.
            Err(_) => ExitInfo { code: None },
        }
    }
}

/// Build the proxy's argument list.
///
/// Credentials and tunnel name come first, then named flags in name order,
/// then raw extra arguments.
pub fn build_args(options: &LaunchOptions) -> Vec<String> {
    let mut args = Vec::new();

    if let Some(ref user) = options.username {
        args.push("--user".to_string());
        args.push(user.clone());
    }
    if let Some(ref key) = options.access_key {
        args.push("--api-key".to_string());
        args.push(key.clone());
    }
    if let Some(ref name) = options.tunnel_name {
        args.push("--tunnel-name".to_string());
        args.push(name.clone());
    }

    for (name, value) in &options.flags {
        let flag = format!("--{}", kebab_case(name));
        match value {
            FlagValue::Bool(true) => args.push(flag),
            FlagValue::Bool(false) => {}
            FlagValue::Text(text) => {
                args.push(flag);
                args.push(text.clone());
            }
            FlagValue::List(items) => {
                args.push(flag);
                args.push(items.join(","));
            }
        }
    }

    args.extend(options.extra_args.iter().cloned());
    args
}

/// `tunnelDomains` -> `tunnel-domains`. Leading dashes are dropped.
fn kebab_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.trim_start_matches('-').chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('-');
            }
            out.push(c.to_ascii_lowercase());
        } else if c == '_' {
            out.push('-');
        } else {
            out.push(c);
        }
    }
    out
}

/// Starts proxy processes for one set of options.
pub struct ProcessSupervisor {
    options: Arc<LaunchOptions>,
    markers: Arc<LogMarkers>,
}

impl ProcessSupervisor {
    pub fn new(options: Arc<LaunchOptions>, markers: Arc<LogMarkers>) -> Self {
        Self { options, markers }
    }

    fn command(&self, binary: &InstalledBinary) -> Command {
        let mut cmd = Command::new(&binary.executable);
        cmd.args(build_args(&self.options))
            .envs(&self.options.env)
            .stdin(Stdio::null());

        if let Some(ref http) = self.options.proxy.http {
            cmd.env("HTTP_PROXY", http);
        }
        if let Some(ref https) = self.options.proxy.https {
            cmd.env("HTTPS_PROXY", https);
        }

        if self.options.detached {
            #[cfg(unix)]
            {
                cmd.process_group(0);
            }
            #[cfg(windows)]
            {
                const DETACHED_PROCESS: u32 = 0x0000_0008;
                const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
                cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
            }
        }

        cmd
    }

    /// Spawn the proxy and start watching it.
    pub async fn spawn(&self, binary: &InstalledBinary) -> Result<ProcessAttempt> {
        info!(
            "Starting {} (detached: {})",
            binary.executable.display(),
            self.options.detached
        );

        let mut cmd = self.command(binary);
        let log_path = if self.options.detached {
            let path = self.options.detached_log_path();
            redirect_to_log(&mut cmd, &path)?;
            Some(path)
        } else {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            None
        };

        let mut child = cmd.spawn().map_err(|source| LauncherError::Spawn {
            executable: binary.executable.clone(),
            source,
        })?;

        let pid = child.id().ok_or_else(|| LauncherError::PrematureExit { code: None })?;
        debug!("Proxy started with pid {}", pid);

        let (line_tx, line_rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, line_tx.clone());
        }

        let process = spawn_watcher(child, pid, self.options.detached);
        if let Some(path) = log_path {
            spawn_log_follower(path, line_tx, process.exit.clone());
        }

        let pid_file = self.options.pid_file.clone();
        if let Some(ref path) = pid_file {
            if let Err(e) = pidfile::write_pid_file(path, pid) {
                warn!("Failed to write pid file: {}", e);
                let _ = process.kill();
                return Err(e);
            }
        }

        Ok(ProcessAttempt {
            pid,
            started_at: Utc::now(),
            monitor: LogMonitor::new(self.markers.clone(), self.options.logger.clone()),
            lines: line_rx,
            process,
            pid_file,
        })
    }
}

/// Point stdout and stderr at a fresh log file shared by both streams.
fn redirect_to_log(cmd: &mut Command, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| LauncherError::io_with_path(e, parent))?;
    }
    let stdout = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|e| LauncherError::io_with_path(e, path))?;
    // A duplicated handle shares the write offset, so the streams interleave.
    let stderr = stdout
        .try_clone()
        .map_err(|e| LauncherError::io_with_path(e, path))?;
    debug!("Detached proxy output goes to {}", path.display());
    cmd.stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));
    Ok(())
}

/// Take one complete line out of `buf`, decoded lossily.
fn take_line(buf: &mut Vec<u8>) -> String {
    while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
        buf.pop();
    }
    let line = String::from_utf8_lossy(buf).into_owned();
    buf.clear();
    line
}

/// Forward lines from one pipe into the shared channel.
///
/// Bytes are decoded lossily so a stray invalid sequence doesn't end the
/// stream.
fn spawn_line_reader<R>(pipe: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(take_line(&mut buf)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Stopped reading proxy output: {}", e);
                    break;
                }
            }
        }
    });
}

/// Follow a detached proxy's log file until the proxy exits.
///
/// A partial line at the end of the file is held back until its newline
/// arrives or the proxy is gone.
fn spawn_log_follower(
    path: PathBuf,
    tx: mpsc::Sender<String>,
    mut exit: watch::Receiver<Option<ExitInfo>>,
) {
    tokio::spawn(async move {
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                warn!("Failed to open proxy log {}: {}", path.display(), e);
                return;
            }
        };
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        loop {
            match reader.read_until(b'\n', &mut buf).await {
                Ok(_) if buf.last() == Some(&b'\n') => {
                    if tx.send(take_line(&mut buf)).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {
                    // Caught up with the writer.
                    let exited = exit.borrow().is_some();
                    if exited {
                        if !buf.is_empty() {
                            let _ = tx.send(take_line(&mut buf)).await;
                        }
                        break;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(SupervisorConfig::DETACHED_POLL_INTERVAL) => {}
                        _ = exit.changed() => {}
                    }
                }
                Err(e) => {
                    debug!("Stopped following {}: {}", path.display(), e);
                    break;
                }
            }
        }
    });
}

/// Own the child until it exits and publish the exit.
fn spawn_watcher(mut child: Child, pid: u32, detached: bool) -> ProcessControl {
    let (exit_tx, exit_rx) = watch::channel(None);
    let (control_tx, mut control_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                Some(control) = control_rx.recv() => match control {
                    Control::Terminate => {
                        if let Err(e) = platform::request_terminate(pid) {
                            warn!("Failed to terminate proxy {}: {}", pid, e);
                        }
                    }
                    Control::Kill => {
                        if let Err(e) = child.start_kill() {
                            debug!("Kill of proxy {} failed: {}", pid, e);
                        }
                    }
                },
            }
        };

        let code = match status {
            Ok(status) => status.code(),
            Err(e) => {
                warn!("Failed to wait for proxy {}: {}", pid, e);
                None
            }
        };
        info!("Proxy {} exited with code {:?}", pid, code);
        let _ = exit_tx.send(Some(ExitInfo { code }));
    });

    ProcessControl {
        pid,
        control: if detached { None } else { Some(control_tx) },
        exit: exit_rx,
    }
}

/// One launch attempt, from spawn until a terminal outcome.
pub struct ProcessAttempt {
    pid: u32,
    started_at: DateTime<Utc>,
    monitor: LogMonitor,
    lines: mpsc::Receiver<String>,
    process: ProcessControl,
    pid_file: Option<PathBuf>,
}

impl ProcessAttempt {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn monitor(&self) -> &LogMonitor {
        &self.monitor
    }

    /// Time since the process was started.
    pub fn elapsed(&self) -> Duration {
        (Utc::now() - self.started_at).to_std().unwrap_or_default()
    }

    /// The last `count` retained output lines, oldest first.
    pub fn output_tail(&self, count: usize) -> Vec<String> {
        let lines: Vec<&str> = self.monitor.recent_lines().collect();
        let skip = lines.len().saturating_sub(count);
        lines[skip..].iter().map(|l| l.to_string()).collect()
    }

    /// Wait until the tunnel is established or the attempt fails.
    ///
    /// `timeout` bounds the whole wait. Lines that arrived before the process
    /// exited are always classified before the exit is acted on.
    pub async fn wait_established(
        &mut self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut lines_open = true;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Attempt for proxy {} cancelled", self.pid);
                    return Err(LauncherError::Cancelled);
                }
                line = self.lines.recv(), if lines_open => match line {
                    Some(line) => {
                        if let Some(result) = self.score(&line) {
                            return result;
                        }
                    }
                    None => lines_open = false,
                },
                exit = self.process.wait() => {
                    return self.after_exit(exit).await;
                }
                _ = sleep_until_deadline(deadline) => {
                    let timeout = timeout.unwrap_or_default();
                    warn!("Proxy {} not established within {:?}", self.pid, timeout);
                    return Err(LauncherError::Timeout(timeout));
                }
            }
        }
    }

    fn score(&mut self, line: &str) -> Option<Result<()>> {
        match self.monitor.observe(line) {
            Classification::Established if self.monitor.tunnel_id().is_none() => {
                warn!("Proxy {} established before reporting a tunnel id", self.pid);
                Some(Err(LauncherError::MissingTunnelId {
                    line: line.to_string(),
                }))
            }
            Classification::Established => Some(Ok(())),
            Classification::Fatal(line) => Some(Err(LauncherError::FatalLog { line })),
            _ => None,
        }
    }

    /// The process is gone; read what it left in the pipes, then fail.
    async fn after_exit(&mut self, exit: ExitInfo) -> Result<()> {
        let drain = async {
            while let Some(line) = self.lines.recv().await {
                if let Some(Err(e)) = self.score(&line) {
                    return Some(e);
                }
            }
            None
        };
        match tokio::time::timeout(SupervisorConfig::EXIT_DRAIN_TIMEOUT, drain).await {
            Ok(Some(fatal)) => Err(fatal),
            _ => Err(LauncherError::PrematureExit { code: exit.code }),
        }
    }

    /// Kill and reap a failed attempt and clear its pid file.
    pub async fn abort(mut self) {
        if let Err(e) = self.process.kill() {
            warn!("Failed to kill proxy {}: {}", self.pid, e);
        }
        self.process.wait().await;
        if let Some(ref path) = self.pid_file {
            if let Err(e) = pidfile::remove_pid_file(path) {
                warn!("Failed to remove pid file: {}", e);
            }
        }
    }

    pub(crate) fn into_parts(
        self,
    ) -> (LogMonitor, mpsc::Receiver<String>, ProcessControl, Option<PathBuf>) {
        (self.monitor, self.lines, self.process, self.pid_file)
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_kebab_case() {
        assert_eq!(kebab_case("tunnelDomains"), "tunnel-domains");
        assert_eq!(kebab_case("noSslBumpDomains"), "no-ssl-bump-domains");
        assert_eq!(kebab_case("verbose"), "verbose");
        assert_eq!(kebab_case("--already-kebab"), "already-kebab");
        assert_eq!(kebab_case("shared_tunnel"), "shared-tunnel");
    }

    #[test]
    fn test_build_args() {
        let options = LaunchOptions::new("alice", "secret")
            .with_tunnel_name("ci-42")
            .with_flag("verbose", true)
            .with_flag("doctor", false)
            .with_flag("tunnelDomains", vec!["a.com".to_string(), "b.com".to_string()])
            .with_flag("se-port", "4446")
            .with_arg("--no-remove-colliding-tunnels");

        assert_eq!(
            build_args(&options),
            vec![
                "--user",
                "alice",
                "--api-key",
                "secret",
                "--tunnel-name",
                "ci-42",
                "--se-port",
                "4446",
                "--tunnel-domains",
                "a.com,b.com",
                "--verbose",
                "--no-remove-colliding-tunnels",
            ]
        );
    }

    #[test]
    fn test_build_args_empty() {
        let options = LaunchOptions {
            flags: BTreeMap::new(),
            ..LaunchOptions::default()
        };
        assert!(build_args(&options).is_empty());
    }

    #[tokio::test]
    async fn test_spawn_missing_executable() {
        let options = Arc::new(LaunchOptions::default());
        let supervisor =
            ProcessSupervisor::new(options, Arc::new(LogMarkers::sauce_connect().unwrap()));
        let result = supervisor
            .spawn(&InstalledBinary::external("not-found"))
            .await;

        match result {
            Err(LauncherError::Spawn { executable, source }) => {
                assert_eq!(executable, PathBuf::from("not-found"));
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("spawn of a missing executable succeeded"),
        }
    }
}
