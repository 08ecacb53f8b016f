//! Readiness state machines fed one line at a time by the supervisor.
//!
//! Trackers are driven from a single task, so a line is extracted and merged
//! without interleaving. Lines from different processes may arrive in any
//! order; conductor markers are attributed per process, by creation order
//! and the ordinal they carry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use hc_spin_error::SpinError;

use crate::launch::{LocalServices, Transport};
use crate::markers::{self, Marker, MarkerError};

/// A consumer of child output that eventually produces a ready value.
pub trait ReadinessTracker: Send {
    type Ready: Send;

    /// Feeds one stdout line from `process`. Returns the ready value exactly
    /// once, on the line that completes the set.
    fn ingest(&mut self, process: &str, line: &str) -> Result<Option<Self::Ready>, SpinError>;

    /// Human readable description of what is still outstanding.
    fn awaiting(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessState {
    Collecting,
    Complete,
    Failed,
}

/// Connection parameters of one ready conductor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConductorEndpoint {
    pub ordinal: u32,
    pub admin_port: u16,
    pub app_ports: Vec<u16>,
    pub directory: PathBuf,
    pub keystore_url: String,
}

#[derive(Debug, Default, Clone)]
struct PartialEndpoint {
    admin_port: Option<u16>,
    app_ports: Vec<u16>,
    directory: Option<PathBuf>,
    keystore_url: Option<String>,
}

impl PartialEndpoint {
    fn finish(&self, ordinal: u32) -> Option<ConductorEndpoint> {
        Some(ConductorEndpoint {
            ordinal,
            admin_port: self.admin_port?,
            app_ports: self.app_ports.clone(),
            directory: self.directory.clone()?,
            keystore_url: self.keystore_url.clone()?,
        })
    }
}

#[derive(Debug, Default, Clone)]
struct Launch {
    admin_port: Option<u16>,
    app_ports: Vec<u16>,
}

/// Everything one process printed about the conductors it runs.
#[derive(Debug, Default)]
struct ProcessOutput {
    /// Creation order
    directories: Vec<PathBuf>,
    /// Arrival order
    keystore_urls: Vec<String>,
    launched: BTreeMap<u32, Launch>,
    last_ordinal: Option<u32>,
}

impl ProcessOutput {
    fn merge(&mut self, marker: Marker) {
        match marker {
            Marker::ConductorLaunched { ordinal, ports } => {
                self.launched.insert(
                    ordinal,
                    Launch {
                        admin_port: Some(ports.admin_port),
                        app_ports: ports.app_ports,
                    },
                );
                self.last_ordinal = Some(ordinal);
            }
            Marker::LegacyConductorRunning { admin_port } => {
                let ordinal = self.last_ordinal.unwrap_or(0);
                let launch = self.launched.entry(ordinal).or_default();
                if let Some(port) = admin_port {
                    launch.admin_port = Some(port);
                }
                self.last_ordinal = Some(ordinal);
            }
            Marker::DirectoryCreated { path } => {
                if !self.directories.contains(&path) {
                    self.directories.push(path);
                }
            }
            Marker::KeystoreUrl { url } => self.keystore_urls.push(url),
            _ => {}
        }
    }

    /// Latest keystore URL whose socket lives inside `directory`.
    fn keystore_in(&self, directory: &Path) -> Option<&String> {
        self.keystore_urls
            .iter()
            .rev()
            .find(|url| keystore_under(url, directory))
    }

    /// The k-th lowest launched ordinal owns the k-th created directory.
    ///
    /// A keystore URL pointing into that directory belongs to it. URLs that
    /// point into no known directory are handed out in arrival order.
    fn endpoints(&self) -> Vec<(u32, PartialEndpoint)> {
        let mut unclaimed = self.keystore_urls.iter().filter(|url| {
            !self
                .directories
                .iter()
                .any(|directory| keystore_under(url, directory))
        });
        let mut endpoints = Vec::with_capacity(self.launched.len());
        for (slot, (ordinal, launch)) in self.launched.iter().enumerate() {
            let directory = self.directories.get(slot);
            let keystore_url = directory
                .and_then(|directory| self.keystore_in(directory))
                .or_else(|| unclaimed.next());
            endpoints.push((
                *ordinal,
                PartialEndpoint {
                    admin_port: launch.admin_port,
                    app_ports: launch.app_ports.clone(),
                    directory: directory.cloned(),
                    keystore_url: keystore_url.cloned(),
                },
            ));
        }
        endpoints
    }
}

fn keystore_under(url: &str, directory: &Path) -> bool {
    Url::parse(url)
        .map(|url| Path::new(url.path()).starts_with(directory))
        .unwrap_or(false)
}

fn malformed(process: &str, err: MarkerError) -> SpinError {
    SpinError::MalformedMarker {
        process: process.to_string(),
        marker: err.marker.to_string(),
        message: err.message,
    }
}

/// Aggregates `hc sandbox` output into one [`ConductorEndpoint`] per conductor.
///
/// One process may run every conductor of a batch. Its directories are
/// paired with its launched ordinals in creation order, whatever order the
/// launch lines arrive in. Ordinals may start at 0 or 1. A repeated keystore
/// URL for the same directory overwrites the earlier one, also after launch.
#[derive(Debug)]
pub struct ConductorReadiness {
    expected: usize,
    processes: BTreeMap<String, ProcessOutput>,
    state: ReadinessState,
}

impl ConductorReadiness {
    pub fn new(expected: usize) -> Self {
        Self {
            expected: expected.max(1),
            processes: BTreeMap::new(),
            state: ReadinessState::Collecting,
        }
    }

    pub fn state(&self) -> ReadinessState {
        self.state
    }

    pub fn complete_count(&self) -> usize {
        self.assemble()
            .iter()
            .filter(|(ordinal, partial)| partial.finish(**ordinal).is_some())
            .count()
    }

    fn assemble(&self) -> BTreeMap<u32, PartialEndpoint> {
        self.processes
            .values()
            .flat_map(ProcessOutput::endpoints)
            .collect()
    }

    /// Every ordinal of a 1-based or 0-based batch of `expected` complete.
    fn resolved(&self) -> Option<Vec<ConductorEndpoint>> {
        let endpoints = self.assemble();
        let expected = self.expected as u32;
        [1u32, 0].into_iter().find_map(|base| {
            (base..base + expected)
                .map(|ordinal| endpoints.get(&ordinal)?.finish(ordinal))
                .collect::<Option<Vec<_>>>()
        })
    }
}

impl ReadinessTracker for ConductorReadiness {
    type Ready = Vec<ConductorEndpoint>;

    fn ingest(&mut self, process: &str, line: &str) -> Result<Option<Self::Ready>, SpinError> {
        if self.state != ReadinessState::Collecting {
            return Ok(None);
        }
        let marker = match markers::extract(line) {
            Ok(Some(marker)) => marker,
            Ok(None) => return Ok(None),
            Err(err) => {
                self.state = ReadinessState::Failed;
                return Err(malformed(process, err));
            }
        };
        self.processes
            .entry(process.to_string())
            .or_default()
            .merge(marker);
        match self.resolved() {
            Some(endpoints) => {
                self.state = ReadinessState::Complete;
                Ok(Some(endpoints))
            }
            None => Ok(None),
        }
    }

    fn awaiting(&self) -> String {
        format!(
            "{} of {} conductors to report ready",
            self.expected.saturating_sub(self.complete_count()),
            self.expected
        )
    }
}

/// URLs reported by the local bootstrap/signal service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceUrls {
    pub bootstrap_url: String,
    pub signal_url: String,
}

/// Waits for the local bootstrap/signal service to report both endpoints.
#[derive(Debug)]
pub struct ServicesReadiness {
    flavor: LocalServices,
    transport: Transport,
    bootstrap_url: Option<String>,
    signal_url: Option<String>,
    bootstrap_running: bool,
    signal_running: bool,
    state: ReadinessState,
}

impl ServicesReadiness {
    pub fn new(flavor: LocalServices, transport: Transport) -> Self {
        Self {
            flavor,
            transport,
            bootstrap_url: None,
            signal_url: None,
            bootstrap_running: false,
            signal_running: false,
            state: ReadinessState::Collecting,
        }
    }

    pub fn state(&self) -> ReadinessState {
        self.state
    }

    fn merge(&mut self, marker: Marker) {
        match (self.flavor, marker) {
            (LocalServices::Kitsune2, Marker::BootstrapListening { addr }) => {
                let signal_scheme = match self.transport {
                    Transport::Quic => "http",
                    Transport::Webrtc => "ws",
                };
                self.bootstrap_url = Some(format!("http://{addr}"));
                self.signal_url = Some(format!("{signal_scheme}://{addr}"));
            }
            (LocalServices::Kitsune2, Marker::BootstrapRunning) => {
                self.bootstrap_running = true;
                self.signal_running = true;
            }
            (LocalServices::Legacy, Marker::LegacyBootstrapAddr { url }) => {
                self.bootstrap_url = Some(url);
            }
            (LocalServices::Legacy, Marker::LegacySignalAddr { url }) => {
                self.signal_url = Some(with_ws_scheme(&url));
            }
            (LocalServices::Legacy, Marker::LegacyBootstrapRunning) => {
                self.bootstrap_running = true;
            }
            (LocalServices::Legacy, Marker::LegacySignalRunning) => {
                self.signal_running = true;
            }
            _ => {}
        }
    }

    fn resolved(&self) -> Option<ServiceUrls> {
        if !(self.bootstrap_running && self.signal_running) {
            return None;
        }
        Some(ServiceUrls {
            bootstrap_url: self.bootstrap_url.clone()?,
            signal_url: self.signal_url.clone()?,
        })
    }
}

impl ReadinessTracker for ServicesReadiness {
    type Ready = ServiceUrls;

    fn ingest(&mut self, process: &str, line: &str) -> Result<Option<Self::Ready>, SpinError> {
        if self.state != ReadinessState::Collecting {
            return Ok(None);
        }
        let marker = match markers::extract(line) {
            Ok(Some(marker)) => marker,
            Ok(None) => return Ok(None),
            Err(err) => {
                self.state = ReadinessState::Failed;
                return Err(malformed(process, err));
            }
        };
        self.merge(marker);
        match self.resolved() {
            Some(urls) => {
                self.state = ReadinessState::Complete;
                Ok(Some(urls))
            }
            None => Ok(None),
        }
    }

    fn awaiting(&self) -> String {
        let mut missing = Vec::new();
        if self.bootstrap_url.is_none() {
            missing.push("bootstrap address");
        }
        if self.signal_url.is_none() {
            missing.push("signal address");
        }
        if !self.bootstrap_running {
            missing.push("bootstrap running");
        }
        if !self.signal_running {
            missing.push("signal running");
        }
        format!("local services ({})", missing.join(", "))
    }
}

fn with_ws_scheme(url: &str) -> String {
    match url.split_once("://") {
        Some((_, rest)) => format!("ws://{rest}"),
        None => format!("ws://{url}"),
    }
}
