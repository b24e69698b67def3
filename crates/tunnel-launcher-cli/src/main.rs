//! Command-line front end for the tunnel launcher.
//!
//! ```text
//! tunnel-launcher download
//! tunnel-launcher launch --tunnel-name ci-42 --flag tunnel-domains=example.com
//! tunnel-launcher launch --detached --pid-file /tmp/sc.pid
//! tunnel-launcher stop --pid-file /tmp/sc.pid
//! ```

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use tunnel_launcher::{LaunchOptions, Launcher, ProxySettings};

#[derive(Parser, Debug)]
#[command(name = "tunnel-launcher")]
#[command(about = "Download, launch and supervise the Sauce Connect tunnel proxy")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Install the proxy binary if it is missing
    Download(InstallArgs),
    /// Start the proxy and keep it running until interrupted
    Launch(LaunchArgs),
    /// Stop a detached proxy recorded in a pid file
    Stop {
        #[arg(long)]
        pid_file: PathBuf,

        /// Seconds to wait after SIGTERM before killing
        #[arg(long, default_value = "10")]
        grace: u64,
    },
}

#[derive(Args, Debug)]
struct InstallArgs {
    /// Proxy version to install (defaults to the latest release)
    #[arg(long)]
    version: Option<String>,

    /// Directory holding managed installs
    #[arg(long)]
    install_dir: Option<PathBuf>,

    /// Use this binary instead of downloading one
    #[arg(long)]
    executable: Option<PathBuf>,

    /// Additional download attempts
    #[arg(long, default_value = "0")]
    download_retries: u32,

    /// Release manifest location
    #[arg(long)]
    manifest_url: Option<String>,
}

#[derive(Args, Debug)]
struct LaunchArgs {
    #[command(flatten)]
    install: InstallArgs,

    #[arg(long, env = "SAUCE_USERNAME")]
    user: String,

    #[arg(long, env = "SAUCE_ACCESS_KEY", hide_env_values = true)]
    access_key: String,

    #[arg(long)]
    tunnel_name: Option<String>,

    /// Additional connect attempts
    #[arg(long, default_value = "0")]
    connect_retries: u32,

    /// Seconds to wait for the tunnel on each attempt
    #[arg(long)]
    connect_timeout: Option<u64>,

    /// Leave the proxy running in its own process group and exit
    #[arg(long, requires = "pid_file")]
    detached: bool,

    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Output file for a detached proxy (defaults to the pid file with `.log`)
    #[arg(long, requires = "detached")]
    log_file: Option<PathBuf>,

    /// Proxy flag as `name=value`, or `name` for a switch (repeatable)
    #[arg(long = "flag", value_name = "NAME[=VALUE]")]
    flags: Vec<String>,

    /// Raw arguments passed to the proxy after `--`
    #[arg(last = true)]
    extra: Vec<String>,
}

impl InstallArgs {
    fn apply(&self, mut options: LaunchOptions) -> LaunchOptions {
        if let Some(ref version) = self.version {
            options = options.with_version(version.clone());
        }
        if let Some(ref dir) = self.install_dir {
            options = options.with_install_dir(dir);
        }
        if let Some(ref executable) = self.executable {
            options = options.with_executable(executable);
        }
        if let Some(ref url) = self.manifest_url {
            options = options.with_manifest_url(url.clone());
        }
        options
            .with_download_retries(self.download_retries)
            .with_proxy(ProxySettings::from_env())
            .with_logger(|line| info!("{}", line))
    }
}

impl LaunchArgs {
    fn options(&self) -> Result<LaunchOptions> {
        let mut options = self
            .install
            .apply(LaunchOptions::new(self.user.clone(), self.access_key.clone()))
            .with_connect_retries(self.connect_retries);

        if let Some(ref name) = self.tunnel_name {
            options = options.with_tunnel_name(name.clone());
        }
        if let Some(secs) = self.connect_timeout {
            options = options.with_connect_timeout(Duration::from_secs(secs));
        }
        match (self.detached, &self.pid_file) {
            (true, Some(pid_file)) => options = options.detached(pid_file),
            (false, Some(pid_file)) => options = options.with_pid_file(pid_file),
            (true, None) => bail!("--detached needs --pid-file"),
            (false, None) => {}
        }
        if let Some(ref log_file) = self.log_file {
            options = options.with_log_file(log_file);
        }
        for flag in &self.flags {
            options = match flag.split_once('=') {
                Some(("", _)) => bail!("Invalid flag: {}", flag),
                Some((name, value)) => options.with_flag(name, value),
                None => options.with_flag(flag.as_str(), true),
            };
        }
        for arg in &self.extra {
            options = options.with_arg(arg.clone());
        }
        Ok(options)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match cli.command {
        Command::Download(args) => {
            let options = args.apply(LaunchOptions::default());
            let installed = tunnel_launcher::download(&options).await?;
            println!("{}", installed.executable.display());
        }
        Command::Launch(args) => launch(args).await?,
        Command::Stop { pid_file, grace } => {
            let stopped =
                tunnel_launcher::stop_by_pid_file(&pid_file, Duration::from_secs(grace))
                    .await
                    .with_context(|| format!("Failed to stop {}", pid_file.display()))?;
            if !stopped {
                warn!("No running proxy recorded in {}", pid_file.display());
            }
        }
    }

    Ok(())
}

async fn launch(args: LaunchArgs) -> Result<()> {
    let launcher = Launcher::new(args.options()?)?;
    let tunnel = launcher.launch().await?;

    // Intentional stdout so wrapping scripts can read the tunnel identity.
    println!(
        "TUNNEL_ID={} PID={}",
        tunnel.tunnel_id().unwrap_or(""),
        tunnel.pid()
    );

    if tunnel.is_detached() {
        info!("Proxy left running in the background");
        return Ok(());
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutdown signal received, closing tunnel");
            tunnel.close().await?;
        }
        exit = tunnel.exited() => {
            bail!("Tunnel proxy exited unexpectedly with code {:?}", exit.code);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_launch_args_to_options() {
        let cli = parse(&[
            "tunnel-launcher",
            "launch",
            "--user",
            "alice",
            "--access-key",
            "secret",
            "--version",
            "4.9.1",
            "--flag",
            "tunnelDomains=a.com",
            "--flag",
            "noSslBumpDomains",
            "--",
            "--verbose",
        ]);
        let Command::Launch(args) = cli.command else {
            panic!("expected launch");
        };
        let options = args.options().unwrap();
        assert_eq!(options.version.as_deref(), Some("4.9.1"));
        assert_eq!(
            tunnel_launcher::process::build_args(&options),
            vec![
                "--user",
                "alice",
                "--api-key",
                "secret",
                "--no-ssl-bump-domains",
                "--tunnel-domains",
                "a.com",
                "--verbose",
            ]
        );
    }

    #[test]
    fn test_detached_requires_pid_file() {
        let result = Cli::try_parse_from([
            "tunnel-launcher",
            "launch",
            "--user",
            "alice",
            "--access-key",
            "secret",
            "--detached",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_detached_log_file() {
        let cli = parse(&[
            "tunnel-launcher",
            "launch",
            "--user",
            "alice",
            "--access-key",
            "secret",
            "--detached",
            "--pid-file",
            "/tmp/sc.pid",
            "--log-file",
            "/tmp/sc.out",
        ]);
        let Command::Launch(args) = cli.command else {
            panic!("expected launch");
        };
        let options = args.options().unwrap();
        assert!(options.detached);
        assert_eq!(options.log_file, Some(PathBuf::from("/tmp/sc.out")));
    }

    #[test]
    fn test_stop_defaults() {
        match parse(&["tunnel-launcher", "stop", "--pid-file", "/tmp/sc.pid"]).command {
            Command::Stop { pid_file, grace } => {
                assert_eq!(pid_file, PathBuf::from("/tmp/sc.pid"));
                assert_eq!(grace, 10);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
