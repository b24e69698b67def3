//! Shared fixtures for integration tests.
//!
//! - an in-process HTTP server serving a release manifest and archives
//! - archive builders for the current platform
//! - shell-script stand-ins for the proxy binary
//! - a log sink that records every line

#![allow(dead_code)]

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tunnel_launcher::install::checksum::Sha256Hasher;
use tunnel_launcher::platform::{ArchiveFormat, Platform};
use tunnel_launcher::LaunchOptions;

pub const VERSION: &str = "4.9.1";

/// Proxy script that establishes a tunnel and exits cleanly on SIGTERM.
pub const HAPPY_PROXY: &str = r#"
dir=$(dirname "$0")
echo "$@" > "$dir/args.txt"
echo "$SC_TEST_ENV" > "$dir/env.txt"
echo "20 Oct 10:00:00 - Sauce Connect 4.9.1, build 5381 39a8e2b"
echo "20 Oct 10:00:00 - Please wait for 'you may start your tests' to start your tests."
echo "20 Oct 10:00:01.250 - Selenium listener started on port 4445."
echo "20 Oct 10:00:02 - Tunnel ID: abc123"
echo "20 Oct 10:00:03 - Sauce Connect is up, you may start your tests."
trap 'echo "20 Oct 10:00:09 - Goodbye."; exit 0' TERM
while true; do sleep 0.1; done
"#;

pub fn platform() -> Platform {
    Platform::current().expect("tests need a supported platform")
}

pub fn archive_name(version: &str) -> String {
    let platform = platform();
    format!(
        "sc-{}-{}.{}",
        version,
        platform.as_str(),
        platform.archive_format().extension()
    )
}

/// Build an archive laid out like a real release:
/// `sc-<version>-<platform>/bin/<binary>`.
pub fn build_archive(version: &str, script: &str) -> Vec<u8> {
    let platform = platform();
    let entry = format!(
        "sc-{}-{}/bin/{}",
        version,
        platform.as_str(),
        platform.binary_name()
    );
    let contents = format!("#!/bin/sh\n{}", script);

    match platform.archive_format() {
        ArchiveFormat::TarGz => {
            let encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder
                .append_data(&mut header, &entry, contents.as_bytes())
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap()
        }
        ArchiveFormat::Zip => {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
            let options = zip::write::SimpleFileOptions::default().unix_permissions(0o755);
            writer.start_file(entry, options).unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
            writer.finish().unwrap().into_inner()
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256Hasher::new();
    hasher.update(bytes);
    hasher.finalize_hex()
}

#[derive(Clone)]
struct FixtureState {
    manifest: Arc<Value>,
    archives: Arc<HashMap<String, Vec<u8>>>,
    manifest_hits: Arc<AtomicUsize>,
    archive_hits: Arc<AtomicUsize>,
}

/// HTTP server with `/versions.json` and `/downloads/<archive>`.
pub struct FixtureServer {
    pub base_url: String,
    manifest_hits: Arc<AtomicUsize>,
    archive_hits: Arc<AtomicUsize>,
}

impl FixtureServer {
    /// Serve one release of `script`, advertised with its real checksum.
    pub async fn start(script: &str) -> Self {
        Self::start_with(script, None).await
    }

    /// Serve one release, optionally advertising a wrong checksum.
    pub async fn start_with(script: &str, checksum_override: Option<&str>) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let archive = build_archive(VERSION, script);
        let name = archive_name(VERSION);
        let checksum = checksum_override
            .map(str::to_string)
            .unwrap_or_else(|| sha256_hex(&archive));
        let mut entries = serde_json::Map::new();
        entries.insert(
            platform().as_str().to_string(),
            json!({
                "version": VERSION,
                "url": format!("{}/downloads/{}", base_url, name),
                "checksum": checksum,
            }),
        );
        let manifest = Value::Object(entries);

        let manifest_hits = Arc::new(AtomicUsize::new(0));
        let archive_hits = Arc::new(AtomicUsize::new(0));
        let state = FixtureState {
            manifest: Arc::new(manifest),
            archives: Arc::new(HashMap::from([(name, archive)])),
            manifest_hits: manifest_hits.clone(),
            archive_hits: archive_hits.clone(),
        };

        let app = Router::new()
            .route("/versions.json", get(serve_manifest))
            .route("/downloads/:name", get(serve_archive))
            .with_state(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            manifest_hits,
            archive_hits,
        }
    }

    pub fn manifest_url(&self) -> String {
        format!("{}/versions.json", self.base_url)
    }

    pub fn download_base_url(&self) -> String {
        format!("{}/downloads", self.base_url)
    }

    pub fn manifest_hits(&self) -> usize {
        self.manifest_hits.load(Ordering::SeqCst)
    }

    pub fn archive_hits(&self) -> usize {
        self.archive_hits.load(Ordering::SeqCst)
    }

    /// Options pointed at this server and a fresh install dir.
    pub fn options(&self, install_dir: &TempDir, logs: &LogCapture) -> LaunchOptions {
        LaunchOptions::new("alice", "secret")
            .with_install_dir(install_dir.path())
            .with_manifest_url(self.manifest_url())
            .with_download_base_url(self.download_base_url())
            .with_logger(logs.sink())
    }
}

async fn serve_manifest(State(state): State<FixtureState>) -> Json<Value> {
    state.manifest_hits.fetch_add(1, Ordering::SeqCst);
    Json((*state.manifest).clone())
}

async fn serve_archive(State(state): State<FixtureState>, Path(name): Path<String>) -> Response {
    match state.archives.get(&name) {
        Some(bytes) => {
            state.archive_hits.fetch_add(1, Ordering::SeqCst);
            bytes.clone().into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// A port with nothing listening on it.
pub fn unused_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Records every line sent to the launcher's sink.
#[derive(Clone, Default)]
pub struct LogCapture {
    lines: Arc<Mutex<Vec<String>>>,
}

impl LogCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sink(&self) -> impl Fn(&str) + Send + Sync + 'static {
        let lines = self.lines.clone();
        move |line: &str| lines.lock().unwrap().push(line.to_string())
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }

    pub fn count(&self, needle: &str) -> usize {
        self.lines().iter().filter(|l| l.contains(needle)).count()
    }
}

/// Write an executable `/bin/sh` script standing in for the proxy.
#[cfg(unix)]
pub fn write_proxy_script(dir: &std::path::Path, body: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("sc");
    std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Lines appended to `dir/count`, one per proxy start.
pub fn start_count(dir: &std::path::Path) -> usize {
    std::fs::read_to_string(dir.join("count"))
        .map(|s| s.lines().count())
        .unwrap_or(0)
}
