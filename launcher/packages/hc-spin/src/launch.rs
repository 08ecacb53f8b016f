//! Launch configuration and its validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use hc_spin_error::SpinError;

pub const DEFAULT_NUM_AGENTS: usize = 2;
pub const DEFAULT_READY_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_RPC_TIMEOUT_SECS: u64 = 60;
/// Passphrase the sandbox keystores are created with
pub const KEYSTORE_PASSPHRASE: &str = "pass";

/// Network transport handed to `hc sandbox ... network`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Quic,
    Webrtc,
}

impl Transport {
    pub fn as_arg(&self) -> &'static str {
        match self {
            Transport::Quic => "quic",
            Transport::Webrtc => "webrtc",
        }
    }
}

/// Which local bootstrap/signal service to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LocalServices {
    #[default]
    Kitsune2,
    Legacy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleKind {
    Happ,
    Webhapp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type", content = "value")]
pub enum UiSource {
    Path(PathBuf),
    Port(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// One `hc sandbox` conductor per agent, spawned as one batch
    ConductorPerAgent,
    /// Every agent installed on a single conductor
    SingleConductor,
}

/// External executables the launcher drives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tools {
    pub hc: String,
    pub bootstrap_srv: String,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            hc: "hc".to_string(),
            bootstrap_srv: "kitsune2-bootstrap-srv".to_string(),
        }
    }
}

/// Unvalidated launch options, as collected from the command line.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub paths: Vec<PathBuf>,
    pub app_id: Option<String>,
    pub bootstrap_url: Option<String>,
    pub signaling_url: Option<String>,
    pub holochain_path: Option<PathBuf>,
    pub num_agents: Option<usize>,
    pub network_seed: Option<String>,
    pub network_seeds: Vec<String>,
    pub single_conductor: bool,
    pub target_arc_factor: Option<f64>,
    pub ui_path: Option<PathBuf>,
    pub ui_port: Option<u16>,
    pub open_devtools: bool,
    pub transport: Transport,
    pub local_services: LocalServices,
    pub tools: Tools,
    pub ready_timeout_secs: Option<u64>,
    pub rpc_timeout_secs: Option<u64>,
    pub bridge_port: u16,
}

/// Immutable description of one launch session.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRequest {
    pub bundle_path: PathBuf,
    pub bundle_kind: BundleKind,
    pub app_id: String,
    pub num_agents: usize,
    pub network_seed: Option<String>,
    pub network_seeds: Vec<String>,
    pub topology: Topology,
    pub target_arc_factor: Option<f64>,
    pub bootstrap_url: Option<String>,
    pub signaling_url: Option<String>,
    pub holochain_path: Option<PathBuf>,
    pub ui_source: UiSource,
    pub open_devtools: bool,
    pub transport: Transport,
    pub local_services: LocalServices,
    pub tools: Tools,
    pub ready_timeout: Duration,
    pub rpc_timeout: Duration,
    pub bridge_port: u16,
}

impl LaunchRequest {
    /// Network seed for a 1-based agent number.
    pub fn network_seed_for(&self, agent: usize) -> Option<&str> {
        agent
            .checked_sub(1)
            .and_then(|idx| self.network_seeds.get(idx))
            .filter(|seed| !seed.is_empty())
            .or(self.network_seed.as_ref())
            .map(String::as_str)
    }

    /// Installed app id for a 1-based agent number on a shared conductor.
    pub fn agent_app_id(&self, agent: usize) -> String {
        if agent <= 1 {
            self.app_id.clone()
        } else {
            format!("{}-agent-{}", self.app_id, agent)
        }
    }

    pub fn window_title(&self, agent: usize) -> String {
        format!("Agent {} - {}", agent, self.app_id)
    }

    /// Directory a `.webhapp` is unpacked into.
    pub fn app_dir(&self, data_root: &Path) -> PathBuf {
        data_root.join("apps").join(&self.app_id)
    }

    /// Path of the `.happ` that gets installed.
    pub fn happ_path(&self, data_root: &Path) -> PathBuf {
        match self.bundle_kind {
            BundleKind::Happ => self.bundle_path.clone(),
            BundleKind::Webhapp => self
                .app_dir(data_root)
                .join(format!("{}.happ", self.app_id)),
        }
    }
}

/// Turns raw options into a [`LaunchRequest`], rejecting bad combinations
/// before anything is spawned.
pub fn validate(options: LaunchOptions, data_root: &Path) -> Result<LaunchRequest, SpinError> {
    let LaunchOptions {
        paths,
        app_id,
        bootstrap_url,
        signaling_url,
        holochain_path,
        num_agents,
        network_seed,
        network_seeds,
        single_conductor,
        target_arc_factor,
        ui_path,
        ui_port,
        open_devtools,
        transport,
        local_services,
        tools,
        ready_timeout_secs,
        rpc_timeout_secs,
        bridge_port,
    } = options;

    let bundle_path = match paths.as_slice() {
        [path] => path.clone(),
        other => {
            return Err(SpinError::invalid_config(format!(
                "hc spin takes exactly one argument (the path to the .happ or .webhapp file) but got {} arguments",
                other.len()
            )))
        }
    };

    let bundle_kind = match bundle_path.extension().and_then(|ext| ext.to_str()) {
        Some("happ") => BundleKind::Happ,
        Some("webhapp") => BundleKind::Webhapp,
        _ => {
            return Err(SpinError::invalid_config(format!(
                "The path passed to hc spin must either be a .happ or a .webhapp file but got path '{}'",
                bundle_path.display()
            )))
        }
    };

    if !bundle_path.exists() {
        return Err(SpinError::invalid_config(format!(
            "Path to .happ or .webhapp file passed as argument does not exist: {}",
            bundle_path.display()
        )));
    }

    if bundle_kind == BundleKind::Happ && ui_path.is_none() && ui_port.is_none() {
        return Err(SpinError::invalid_config(
            "If you pass a .happ file as argument, you must also provide either the --ui-port or the --ui-path option pointing to the UI assets.",
        ));
    }
    if ui_path.is_some() && ui_port.is_some() {
        return Err(SpinError::invalid_config(
            "Only one of --ui-port and --ui-path is allowed at the same time but got values for both.",
        ));
    }

    let num_agents = num_agents.unwrap_or(DEFAULT_NUM_AGENTS);
    if num_agents == 0 {
        return Err(SpinError::invalid_config(
            "The --num-agents (-n) option must be at least 1.",
        ));
    }

    let network_seeds = split_seeds(network_seeds);
    if network_seeds.len() > num_agents {
        return Err(SpinError::invalid_config(format!(
            "Got {} network seeds for {} agents. Pass at most one network seed per agent.",
            network_seeds.len(),
            num_agents
        )));
    }

    let app_id = match app_id {
        Some(app_id) if !app_id.is_empty() => app_id,
        _ => bundle_path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                SpinError::invalid_config(format!(
                    "Could not derive an app id from {}",
                    bundle_path.display()
                ))
            })?,
    };

    let ui_source = match (ui_path, ui_port) {
        (Some(path), _) => UiSource::Path(path),
        (None, Some(port)) => UiSource::Port(port),
        (None, None) => UiSource::Path(data_root.join("apps").join(&app_id).join("ui")),
    };

    Ok(LaunchRequest {
        bundle_path,
        bundle_kind,
        app_id,
        num_agents,
        network_seed,
        network_seeds,
        topology: if single_conductor {
            Topology::SingleConductor
        } else {
            Topology::ConductorPerAgent
        },
        target_arc_factor,
        bootstrap_url,
        signaling_url,
        holochain_path,
        ui_source,
        open_devtools,
        transport,
        local_services,
        tools,
        ready_timeout: Duration::from_secs(ready_timeout_secs.unwrap_or(DEFAULT_READY_TIMEOUT_SECS)),
        rpc_timeout: Duration::from_secs(rpc_timeout_secs.unwrap_or(DEFAULT_RPC_TIMEOUT_SECS)),
        bridge_port,
    })
}

/// Seeds may be passed space separated (one per flag value) or comma separated.
fn split_seeds(raw: Vec<String>) -> Vec<String> {
    raw.iter()
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|seed| !seed.is_empty())
        .map(str::to_string)
        .collect()
}
