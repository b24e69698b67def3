//! Launch and supervision with shell scripts standing in for the proxy.
#![cfg(unix)]

mod common;

use common::{start_count, write_proxy_script, FixtureServer, LogCapture, HAPPY_PROXY};
use std::time::Duration;
use tempfile::TempDir;
use tunnel_launcher::platform::is_process_alive;
use tunnel_launcher::process::read_pid_file;
use tunnel_launcher::{
    launch, stop_by_pid_file, CancellationToken, LaunchOptions, LauncherError, Launcher,
    TunnelState,
};

/// Options for a script proxy with no reachable download server.
fn script_options(dir: &TempDir, script: &str, logs: &LogCapture) -> LaunchOptions {
    let executable = write_proxy_script(dir.path(), script);
    LaunchOptions::new("alice", "secret")
        .with_executable(executable)
        .with_install_dir(dir.path().join("install"))
        .with_manifest_url(format!(
            "http://127.0.0.1:{}/versions.json",
            common::unused_port()
        ))
        .with_logger(logs.sink())
}

async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("operation did not finish in time")
}

#[tokio::test]
async fn test_launch_missing_executable() {
    let dir = TempDir::new().unwrap();
    let logs = LogCapture::new();
    let options = LaunchOptions::new("alice", "secret")
        .with_executable("not-found")
        .with_install_dir(dir.path().join("install"))
        .with_connect_retries(3)
        .with_logger(logs.sink());

    match launch(options).await {
        Err(LauncherError::Spawn { executable, source }) => {
            assert_eq!(executable, std::path::PathBuf::from("not-found"));
            assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            assert!(source.to_string().contains("No such file or directory"));
        }
        other => panic!("unexpected result: {other:?}"),
    }

    // Nothing was downloaded.
    assert!(!dir.path().join("install").exists());
    assert!(!logs.contains("downloading dependency"));
}

#[tokio::test]
async fn test_launch_and_close() {
    let dir = TempDir::new().unwrap();
    let logs = LogCapture::new();
    let options = script_options(&dir, HAPPY_PROXY, &logs)
        .with_tunnel_name("ci-42")
        .with_flag("tunnelDomains", vec!["a.com".to_string(), "b.com".to_string()])
        .with_env("SC_TEST_ENV", "from-launcher");

    let tunnel = within(launch(options)).await.unwrap();
    assert_eq!(tunnel.tunnel_id(), Some("abc123"));
    assert_eq!(tunnel.port(), Some(4445));
    assert_eq!(tunnel.state(), TunnelState::Running);
    assert!(is_process_alive(tunnel.pid()));

    assert!(logs.contains("Testing tunnel ready"));
    // Echoed marker text is forwarded but not mistaken for readiness.
    assert!(logs.contains("Please wait for 'you may start your tests'"));

    let args = std::fs::read_to_string(dir.path().join("args.txt")).unwrap();
    assert_eq!(
        args.trim(),
        "--user alice --api-key secret --tunnel-name ci-42 --tunnel-domains a.com,b.com"
    );
    let env = std::fs::read_to_string(dir.path().join("env.txt")).unwrap();
    assert_eq!(env.trim(), "from-launcher");

    within(tunnel.close()).await.unwrap();
    assert_eq!(tunnel.state(), TunnelState::Terminated);
    assert_eq!(tunnel.exited().await.code, Some(0));

    // Closing again is a no-op.
    within(tunnel.close()).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_close_waits_for_same_exit() {
    let dir = TempDir::new().unwrap();
    let logs = LogCapture::new();
    let tunnel = within(launch(script_options(&dir, HAPPY_PROXY, &logs)))
        .await
        .unwrap();

    let other = tunnel.clone();
    let (a, b) = within(async { tokio::join!(tunnel.close(), other.close()) }).await;
    a.unwrap();
    b.unwrap();
    assert_eq!(tunnel.state(), TunnelState::Terminated);
    assert_eq!(other.state(), TunnelState::Terminated);
    assert_eq!(tunnel.exited().await.code, Some(0));
}

#[tokio::test]
async fn test_kill_is_immediate() {
    let dir = TempDir::new().unwrap();
    let logs = LogCapture::new();
    let script = r#"
trap '' TERM
echo "Tunnel ID: unkillable"
echo "Sauce Connect is up, you may start your tests."
while true; do sleep 0.1; done
"#;
    let tunnel = within(launch(script_options(&dir, script, &logs)))
        .await
        .unwrap();

    tunnel.kill().unwrap();
    let exit = within(tunnel.exited()).await;
    assert_eq!(exit.code, None);
    assert_eq!(tunnel.state(), TunnelState::Terminated);

    // Killing or closing a terminated tunnel does nothing.
    tunnel.kill().unwrap();
    within(tunnel.close()).await.unwrap();
}

#[tokio::test]
async fn test_fatal_log_exhausts_retries() {
    let dir = TempDir::new().unwrap();
    let logs = LogCapture::new();
    let script = r#"
echo x >> "$(dirname "$0")/count"
echo "20 Oct 10:00:00 - Sauce Connect 4.9.1, build 5381 39a8e2b"
echo "20 Oct 10:00:01 - Error: Unable to authenticate."
while true; do sleep 0.1; done
"#;
    let options = script_options(&dir, script, &logs).with_connect_retries(2);

    match within(launch(options)).await {
        Err(LauncherError::FatalLog { line }) => {
            assert_eq!(line, "20 Oct 10:00:01 - Error: Unable to authenticate.")
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(start_count(dir.path()), 3);
    assert_eq!(logs.count("retrying"), 2);
    assert!(!logs.contains("Testing tunnel ready"));
}

#[tokio::test]
async fn test_retry_succeeds_on_second_attempt() {
    let dir = TempDir::new().unwrap();
    let logs = LogCapture::new();
    let script = r#"
dir=$(dirname "$0")
echo x >> "$dir/count"
if [ "$(wc -l < "$dir/count")" -lt 2 ]; then
  echo "Sauce Connect could not establish a connection."
  exit 1
fi
echo "Tunnel ID: second"
echo "Sauce Connect is up, you may start your tests."
while true; do sleep 0.1; done
"#;
    let options = script_options(&dir, script, &logs).with_connect_retries(1);

    let tunnel = within(launch(options)).await.unwrap();
    assert_eq!(tunnel.tunnel_id(), Some("second"));
    assert_eq!(start_count(dir.path()), 2);
    assert!(logs.contains("Testing tunnel ready"));
    within(tunnel.close()).await.unwrap();
}

#[tokio::test]
async fn test_established_without_tunnel_id_fails() {
    let dir = TempDir::new().unwrap();
    let logs = LogCapture::new();
    let script = r#"
echo x >> "$(dirname "$0")/count"
echo "Sauce Connect is up, you may start your tests."
while true; do sleep 0.1; done
"#;
    let options = script_options(&dir, script, &logs).with_connect_retries(1);

    match within(launch(options)).await {
        Err(LauncherError::MissingTunnelId { line }) => {
            assert_eq!(line, "Sauce Connect is up, you may start your tests.")
        }
        other => panic!("unexpected result: {other:?}"),
    }
    // Retried once, then given up.
    assert_eq!(start_count(dir.path()), 2);
    assert!(!logs.contains("Testing tunnel ready"));
}

#[tokio::test]
async fn test_premature_exit() {
    let dir = TempDir::new().unwrap();
    let logs = LogCapture::new();
    let script = r#"
echo "20 Oct 10:00:00 - Sauce Connect 4.9.1, build 5381 39a8e2b"
exit 3
"#;

    match within(launch(script_options(&dir, script, &logs))).await {
        Err(LauncherError::PrematureExit { code }) => assert_eq!(code, Some(3)),
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(logs.contains(
        "Last output before failure: 20 Oct 10:00:00 - Sauce Connect 4.9.1, build 5381 39a8e2b"
    ));
}

#[tokio::test]
async fn test_output_before_exit_is_classified() {
    let dir = TempDir::new().unwrap();
    let logs = LogCapture::new();
    let script = r#"
echo "Fatal: proxy configuration is invalid"
exit 1
"#;

    match within(launch(script_options(&dir, script, &logs))).await {
        Err(LauncherError::FatalLog { line }) => {
            assert_eq!(line, "Fatal: proxy configuration is invalid")
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_connect_timeout() {
    let dir = TempDir::new().unwrap();
    let logs = LogCapture::new();
    let script = r#"
echo x >> "$(dirname "$0")/count"
echo "Selenium listener started on port 4445."
while true; do sleep 0.1; done
"#;
    let options = script_options(&dir, script, &logs)
        .with_connect_timeout(Duration::from_millis(300))
        .with_connect_retries(1);

    match within(launch(options)).await {
        Err(LauncherError::Timeout(timeout)) => {
            assert_eq!(timeout, Duration::from_millis(300))
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(start_count(dir.path()), 2);
    assert_eq!(
        logs.count("Last output before failure: Selenium listener started on port 4445."),
        2
    );
}

#[tokio::test]
async fn test_cancel_stops_retrying() {
    let dir = TempDir::new().unwrap();
    let logs = LogCapture::new();
    let script = r#"
echo x >> "$(dirname "$0")/count"
while true; do sleep 0.1; done
"#;
    let options = script_options(&dir, script, &logs).with_connect_retries(3);
    let cancel = CancellationToken::new();
    let launcher = Launcher::new(options)
        .unwrap()
        .with_cancel_token(cancel.clone());

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
    });

    let result = within(launcher.launch()).await;
    assert!(matches!(result, Err(LauncherError::Cancelled)), "{result:?}");
    assert_eq!(start_count(dir.path()), 1);
    canceller.await.unwrap();
}

#[tokio::test]
async fn test_detached_launch_writes_pid_file() {
    let dir = TempDir::new().unwrap();
    let logs = LogCapture::new();
    let pid_file = dir.path().join("run").join("sc.pid");
    let options = script_options(&dir, HAPPY_PROXY, &logs).detached(&pid_file);

    let tunnel = within(launch(options)).await.unwrap();
    assert!(tunnel.is_detached());
    assert_eq!(tunnel.tunnel_id(), Some("abc123"));
    assert_eq!(read_pid_file(&pid_file).unwrap(), Some(tunnel.pid()));

    // Output lands in the log file and still reaches the sink.
    let log = std::fs::read_to_string(pid_file.with_extension("log")).unwrap();
    assert!(log.contains("Tunnel ID: abc123"), "{log}");
    assert!(logs.contains("Tunnel ID: abc123"));

    within(tunnel.close()).await.unwrap();
    assert!(!pid_file.exists());
    assert!(!is_process_alive(tunnel.pid()));
    assert_eq!(read_pid_file(&pid_file).unwrap(), None);
}

#[test]
fn test_detached_proxy_outlives_launcher() {
    let dir = TempDir::new().unwrap();
    let logs = LogCapture::new();
    let pid_file = dir.path().join("sc.pid");
    let script = r#"
echo "Tunnel ID: detached"
echo "Sauce Connect is up, you may start your tests."
trap 'exit 0' TERM
while true; do echo "heartbeat"; sleep 0.1; done
"#;
    let options = script_options(&dir, script, &logs).detached(&pid_file);

    let runtime = tokio::runtime::Runtime::new().unwrap();
    let pid = runtime.block_on(async { within(launch(options)).await.unwrap().pid() });
    drop(runtime);

    // The proxy keeps writing after everything that launched it is gone.
    std::thread::sleep(Duration::from_secs(1));
    assert!(is_process_alive(pid), "detached proxy stopped with its launcher");
    assert_eq!(read_pid_file(&pid_file).unwrap(), Some(pid));
    let log = std::fs::read_to_string(pid_file.with_extension("log")).unwrap();
    assert!(log.matches("heartbeat").count() > 5, "{log}");

    // The pid file alone is enough to stop it.
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let stopped = runtime
        .block_on(stop_by_pid_file(&pid_file, Duration::from_secs(5)))
        .unwrap();
    assert!(stopped);
    assert!(!pid_file.exists());
    assert!(!is_process_alive(pid));
}

#[tokio::test]
async fn test_unexpected_exit_terminates_handle() {
    let dir = TempDir::new().unwrap();
    let logs = LogCapture::new();
    let script = r#"
echo "Tunnel ID: short-lived"
echo "Sauce Connect is up, you may start your tests."
sleep 0.2
exit 5
"#;
    let tunnel = within(launch(script_options(&dir, script, &logs)))
        .await
        .unwrap();

    let exit = within(tunnel.exited()).await;
    assert_eq!(exit.code, Some(5));
    assert_eq!(tunnel.state(), TunnelState::Terminated);
    within(tunnel.close()).await.unwrap();
}

#[tokio::test]
async fn test_launch_downloads_then_starts() {
    let server = FixtureServer::start(HAPPY_PROXY).await;
    let install_dir = TempDir::new().unwrap();
    let logs = LogCapture::new();
    let options = server.options(&install_dir, &logs);

    let tunnel = within(launch(options)).await.unwrap();
    assert_eq!(tunnel.tunnel_id(), Some("abc123"));

    let lines = logs.lines();
    let downloaded = lines
        .iter()
        .position(|l| l == "Sauce Connect downloaded correctly")
        .expect("download notice missing");
    let ready = lines
        .iter()
        .position(|l| l == "Testing tunnel ready")
        .expect("ready notice missing");
    assert!(downloaded < ready);

    within(tunnel.close()).await.unwrap();
}
