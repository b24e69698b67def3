//! Readiness classification of the proxy's output.
//!
//! The monitor sees every line of merged stdout/stderr in arrival order. Each
//! line is matched against an ordered list of markers, first match wins:
//!
//! | Order | Marker      | Effect                              |
//! |-------|-------------|-------------------------------------|
//! | 1     | ready       | local listener is up, keep waiting  |
//! | 2     | tunnel id   | remember the id, keep waiting       |
//! | 3     | established | terminal success                    |
//! | 4     | fatal       | terminal failure                    |
//! | 5     | banner      | benign                              |
//! | -     | otherwise   | info                                |
//!
//! Markers are anchored at the start of the line. The only thing allowed in
//! front of one is the proxy's own timestamp (`20 Oct 10:00:00.123 - `), so
//! a line that merely quotes a marker phrase never matches.

use crate::config::{LogSink, SupervisorConfig};
use crate::error::{LauncherError, Result};
use regex::Regex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Optional timestamp the proxy prints before every message.
const TIMESTAMP_PREFIX: &str = r"^(?:\d{1,2} \w{3} \d{2}:\d{2}:\d{2}(?:\.\d+)? - )?";

/// Compiled marker set.
#[derive(Debug, Clone)]
pub struct LogMarkers {
    ready: Regex,
    tunnel_id: Regex,
    established: Regex,
    fatal: Vec<Regex>,
    banner: Regex,
}

impl LogMarkers {
    /// Compile a marker set from unanchored patterns.
    ///
    /// `ready` may capture a port and `tunnel_id` must capture the id in its
    /// first group.
    pub fn new(
        ready: &str,
        tunnel_id: &str,
        established: &str,
        fatal: &[&str],
        banner: &str,
    ) -> Result<Self> {
        Ok(Self {
            ready: anchored(ready)?,
            tunnel_id: anchored(tunnel_id)?,
            established: anchored(established)?,
            fatal: fatal.iter().map(|p| anchored(p)).collect::<Result<_>>()?,
            banner: anchored(banner)?,
        })
    }

    /// Markers for Sauce Connect 4.x output.
    pub fn sauce_connect() -> Result<Self> {
        Self::new(
            r"(?:Selenium listener started on port|Started scproxy on port) (\d+)",
            r"Tunnel ID: ([A-Za-z0-9_-]+)",
            r"Sauce Connect is up, you may start your tests\.",
            &[
                r"Error: ",
                r"Fatal",
                r"Sauce Connect could not establish a connection",
                r"Goodbye\.",
            ],
            r"Sauce Connect \d+\.\d+",
        )
    }

    /// Classify a single line.
    pub fn classify(&self, line: &str) -> Classification {
        if let Some(captures) = self.ready.captures(line) {
            let port = captures.get(1).and_then(|m| m.as_str().parse().ok());
            return Classification::Ready { port };
        }
        if let Some(id) = self
            .tunnel_id
            .captures(line)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
        {
            return Classification::TunnelId(id);
        }
        if self.established.is_match(line) {
            return Classification::Established;
        }
        if self.fatal.iter().any(|re| re.is_match(line)) {
            return Classification::Fatal(line.to_string());
        }
        if self.banner.is_match(line) {
            return Classification::Banner;
        }
        Classification::Info
    }
}

fn anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("{}(?:{})", TIMESTAMP_PREFIX, pattern)).map_err(|e| {
        LauncherError::Config {
            message: format!("Invalid log marker {:?}: {}", pattern, e),
        }
    })
}

/// What a single line means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Ready { port: Option<u16> },
    TunnelId(String),
    Established,
    Fatal(String),
    Banner,
    Info,
}

impl Classification {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Classification::Established | Classification::Fatal(_))
    }
}

/// Readiness of one launch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessState {
    Starting,
    /// Local listener is accepting connections; tunnel not yet up.
    Listening,
    Established,
    Failed { line: String },
}

/// Per-attempt state machine over the proxy's output.
pub struct LogMonitor {
    markers: Arc<LogMarkers>,
    state: ReadinessState,
    tunnel_id: Option<String>,
    port: Option<u16>,
    lines: VecDeque<String>,
    capacity: usize,
    sink: Option<LogSink>,
}

impl LogMonitor {
    pub fn new(markers: Arc<LogMarkers>, sink: Option<LogSink>) -> Self {
        Self::with_capacity(markers, sink, SupervisorConfig::RETAINED_LOG_LINES)
    }

    pub fn with_capacity(markers: Arc<LogMarkers>, sink: Option<LogSink>, capacity: usize) -> Self {
        Self {
            markers,
            state: ReadinessState::Starting,
            tunnel_id: None,
            port: None,
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            sink,
        }
    }

    /// Feed one line and advance the state machine.
    ///
    /// Once a terminal state is reached it sticks; later lines are still
    /// retained and forwarded but can't change the outcome.
    pub fn observe(&mut self, line: &str) -> Classification {
        trace!("proxy: {}", line);
        if let Some(ref sink) = self.sink {
            sink(line);
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());

        let classification = self.markers.classify(line);
        if self.is_terminal() {
            return classification;
        }

        match classification {
            Classification::Ready { port } => {
                debug!("Proxy listener ready on port {:?}", port);
                self.port = port;
                self.state = ReadinessState::Listening;
            }
            Classification::TunnelId(ref id) => {
                debug!("Tunnel id {}", id);
                self.tunnel_id = Some(id.clone());
            }
            Classification::Established => {
                debug!("Tunnel established");
                self.state = ReadinessState::Established;
            }
            Classification::Fatal(ref line) => {
                warn!("Proxy reported fatal error: {}", line);
                self.state = ReadinessState::Failed { line: line.clone() };
            }
            Classification::Banner | Classification::Info => {}
        }
        classification
    }

    pub fn state(&self) -> &ReadinessState {
        &self.state
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            ReadinessState::Established | ReadinessState::Failed { .. }
        )
    }

    pub fn tunnel_id(&self) -> Option<&str> {
        self.tunnel_id.as_deref()
    }

    /// Local port reported by the ready marker, if any.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Most recent lines, oldest first.
    pub fn recent_lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }
}
