//! Configuration for the tunnel launcher.
//!
//! Constants are grouped by concern the same way the rest of the crate is
//! split (network, download, supervisor, paths). [`LaunchOptions`] is the
//! caller-supplied configuration; it is cloned into an `Arc` when a launch
//! starts and never mutated afterwards.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Network-related configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);
    pub const USER_AGENT: &'static str = "tunnel-launcher/0.3";
    pub const MANIFEST_URL: &'static str = "https://saucelabs.com/versions.json";
    pub const DOWNLOAD_BASE_URL: &'static str = "https://saucelabs.com/downloads";
}

/// Download and install configuration.
pub struct DownloadConfig;

impl DownloadConfig {
    pub const DEFAULT_RETRIES: u32 = 0;
    pub const TEMP_PREFIX: &'static str = ".sc-download-";
    pub const STAGING_PREFIX: &'static str = ".sc-staging-";
    pub const MARKER_FILENAME: &'static str = "installed.json";
}

/// Process supervision configuration.
pub struct SupervisorConfig;

impl SupervisorConfig {
    pub const DEFAULT_CONNECT_RETRIES: u32 = 0;
    /// Lines of proxy output kept per attempt for diagnostics.
    pub const RETAINED_LOG_LINES: usize = 200;
    /// How long to keep reading output after the proxy exits.
    pub const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
    /// Poll interval for detached processes and their log files.
    pub const DETACHED_POLL_INTERVAL: Duration = Duration::from_millis(100);
    /// Output lines reported when an attempt exits or times out.
    pub const FAILURE_TAIL_LINES: usize = 5;
    /// Log file name for detached proxies without a pid file.
    pub const DETACHED_LOG_NAME: &'static str = "sc.log";
}

/// Shared directory and path configuration.
pub struct PathsConfig;

impl PathsConfig {
    pub const INSTALL_DIR_NAME: &'static str = "tunnel-launcher";
    pub const VERSION_DIR_PREFIX: &'static str = "sc-";
}

/// Caller-provided sink that receives one human-readable line at a time.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Value of a flag forwarded to the proxy binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlagValue {
    /// `true` renders as a bare `--flag`; `false` omits the flag.
    Bool(bool),
    Text(String),
    /// Rendered as a single comma-joined argument.
    List(Vec<String>),
}

impl From<bool> for FlagValue {
    fn from(value: bool) -> Self {
        FlagValue::Bool(value)
    }
}

impl From<&str> for FlagValue {
    fn from(value: &str) -> Self {
        FlagValue::Text(value.to_string())
    }
}

impl From<String> for FlagValue {
    fn from(value: String) -> Self {
        FlagValue::Text(value)
    }
}

impl From<Vec<String>> for FlagValue {
    fn from(value: Vec<String>) -> Self {
        FlagValue::List(value)
    }
}

/// Explicit proxy settings for HTTP traffic.
///
/// The launcher never reads `http_proxy`/`https_proxy` from its own
/// environment; callers that want that behaviour use [`ProxySettings::from_env`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxySettings {
    pub http: Option<String>,
    pub https: Option<String>,
    pub no_proxy: Option<String>,
}

impl ProxySettings {
    /// Read the conventional proxy variables from the process environment.
    pub fn from_env() -> Self {
        fn var(names: &[&str]) -> Option<String> {
            names
                .iter()
                .find_map(|name| std::env::var(name).ok())
                .filter(|v| !v.is_empty())
        }

        Self {
            http: var(&["http_proxy", "HTTP_PROXY"]),
            https: var(&["https_proxy", "HTTPS_PROXY"]),
            no_proxy: var(&["no_proxy", "NO_PROXY"]),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.http.is_none() && self.https.is_none()
    }
}

/// Configuration for downloading and launching the tunnel proxy.
#[derive(Clone)]
pub struct LaunchOptions {
    /// Use this executable instead of the managed install. Disables downloading.
    pub executable: Option<PathBuf>,
    /// Pinned proxy version; `None` follows the manifest's latest.
    pub version: Option<String>,
    /// Directory holding managed installs.
    pub install_dir: PathBuf,
    /// Additional connect attempts after the first failure.
    pub connect_retries: u32,
    /// Additional download attempts after the first failure.
    pub download_retries: u32,
    /// Per-attempt deadline for the tunnel to become established.
    pub connect_timeout: Option<Duration>,
    /// Run the proxy in its own process group, tracked only by pid.
    pub detached: bool,
    /// Where to record the proxy's pid.
    pub pid_file: Option<PathBuf>,
    /// Where a detached proxy writes its output. Defaults to the pid file
    /// with a `.log` extension.
    pub log_file: Option<PathBuf>,
    pub username: Option<String>,
    pub access_key: Option<String>,
    pub tunnel_name: Option<String>,
    /// Named flags forwarded to the binary as `--kebab-case value`.
    pub flags: BTreeMap<String, FlagValue>,
    /// Raw arguments appended verbatim after the named flags.
    pub extra_args: Vec<String>,
    /// Extra environment for the proxy process.
    pub env: HashMap<String, String>,
    pub proxy: ProxySettings,
    pub manifest_url: String,
    pub download_base_url: String,
    pub logger: Option<LogSink>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            executable: None,
            version: None,
            install_dir: default_install_dir(),
            connect_retries: SupervisorConfig::DEFAULT_CONNECT_RETRIES,
            download_retries: DownloadConfig::DEFAULT_RETRIES,
            connect_timeout: None,
            detached: false,
            pid_file: None,
            log_file: None,
            username: None,
            access_key: None,
            tunnel_name: None,
            flags: BTreeMap::new(),
            extra_args: Vec::new(),
            env: HashMap::new(),
            proxy: ProxySettings::default(),
            manifest_url: NetworkConfig::MANIFEST_URL.to_string(),
            download_base_url: NetworkConfig::DOWNLOAD_BASE_URL.to_string(),
            logger: None,
        }
    }
}

impl fmt::Debug for LaunchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchOptions")
            .field("executable", &self.executable)
            .field("version", &self.version)
            .field("install_dir", &self.install_dir)
            .field("connect_retries", &self.connect_retries)
            .field("download_retries", &self.download_retries)
            .field("connect_timeout", &self.connect_timeout)
            .field("detached", &self.detached)
            .field("pid_file", &self.pid_file)
            .field("log_file", &self.log_file)
            .field("username", &self.username)
            .field("access_key", &self.access_key.as_ref().map(|_| "<redacted>"))
            .field("tunnel_name", &self.tunnel_name)
            .field("flags", &self.flags)
            .field("extra_args", &self.extra_args)
            .field("proxy", &self.proxy)
            .field("manifest_url", &self.manifest_url)
            .field("logger", &self.logger.is_some())
            .finish()
    }
}

impl LaunchOptions {
    /// Create options with defaults and the given credentials.
    pub fn new(username: impl Into<String>, access_key: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            access_key: Some(access_key.into()),
            ..Self::default()
        }
    }

    /// Use a specific executable and skip the managed install.
    pub fn with_executable(mut self, path: impl AsRef<Path>) -> Self {
        self.executable = Some(path.as_ref().to_path_buf());
        self
    }

    /// Pin the proxy version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_install_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.install_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_connect_retries(mut self, retries: u32) -> Self {
        self.connect_retries = retries;
        self
    }

    pub fn with_download_retries(mut self, retries: u32) -> Self {
        self.download_retries = retries;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Run detached and record the pid in `pid_file`.
    pub fn detached(mut self, pid_file: impl AsRef<Path>) -> Self {
        self.detached = true;
        self.pid_file = Some(pid_file.as_ref().to_path_buf());
        self
    }

    pub fn with_pid_file(mut self, pid_file: impl AsRef<Path>) -> Self {
        self.pid_file = Some(pid_file.as_ref().to_path_buf());
        self
    }

    /// Send a detached proxy's output to `log_file`.
    pub fn with_log_file(mut self, log_file: impl AsRef<Path>) -> Self {
        self.log_file = Some(log_file.as_ref().to_path_buf());
        self
    }

    pub fn with_tunnel_name(mut self, name: impl Into<String>) -> Self {
        self.tunnel_name = Some(name.into());
        self
    }

    /// Forward a named flag to the proxy binary.
    pub fn with_flag(mut self, name: impl Into<String>, value: impl Into<FlagValue>) -> Self {
        self.flags.insert(name.into(), value.into());
        self
    }

    /// Append a raw argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_proxy(mut self, proxy: ProxySettings) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_manifest_url(mut self, url: impl Into<String>) -> Self {
        self.manifest_url = url.into();
        self
    }

    pub fn with_download_base_url(mut self, url: impl Into<String>) -> Self {
        self.download_base_url = url.into();
        self
    }

    /// Receive download notices and proxy output, one line per call.
    pub fn with_logger(mut self, logger: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.logger = Some(Arc::new(logger));
        self
    }

    /// File a detached proxy's stdout and stderr are written to.
    pub(crate) fn detached_log_path(&self) -> PathBuf {
        if let Some(ref path) = self.log_file {
            return path.clone();
        }
        match self.pid_file {
            Some(ref pid_file) => pid_file.with_extension("log"),
            None => self.install_dir.join(SupervisorConfig::DETACHED_LOG_NAME),
        }
    }

    /// Send a line to the caller's sink, if any.
    pub(crate) fn log(&self, message: &str) {
        if let Some(ref logger) = self.logger {
            logger(message);
        }
    }
}

/// Default install location: `<cache dir>/tunnel-launcher`.
pub fn default_install_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(PathsConfig::INSTALL_DIR_NAME)
}
