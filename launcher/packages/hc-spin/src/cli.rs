use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use hc_spin_error::SpinError;

use crate::bridge::{Bridge, BrowserWindowHost, Opener};
use crate::gate::CallAuthorizationGate;
use crate::launch::{
    self, LaunchOptions, LaunchRequest, LocalServices, Tools, Transport, DEFAULT_NUM_AGENTS,
    DEFAULT_READY_TIMEOUT_SECS, DEFAULT_RPC_TIMEOUT_SECS, KEYSTORE_PASSPHRASE,
};
use crate::orchestrator::{interrupted, Collaborators, Session, SessionEnd};
use crate::sandbox::{cleanup_command, HcSandbox};
use crate::signer::LairSignerConnector;
use crate::supervisor::Supervisor;
use crate::workdir::{sweep_abandoned, SessionDir};
use crate::ws::WsConductorConnector;

#[derive(Parser, Debug)]
#[command(name = "hc-spin")]
#[command(about = "CLI to run Holochain apps during development.", version)]
pub struct Cli {
    /// Path to the .webhapp or .happ file to launch. A .happ also needs --ui-path or --ui-port.
    pub paths: Vec<PathBuf>,

    /// Install the app with this app id instead of the bundle's file name
    #[arg(long)]
    pub app_id: Option<String>,

    /// Bootstrap server to use instead of the local one
    #[arg(long)]
    pub bootstrap_url: Option<String>,

    /// Signaling server to use instead of the local one
    #[arg(long)]
    pub signaling_url: Option<String>,

    /// Path to the holochain binary
    #[arg(long)]
    pub holochain_path: Option<PathBuf>,

    /// How many agents to spawn the app for
    #[arg(short = 'n', long, default_value_t = DEFAULT_NUM_AGENTS)]
    pub num_agents: usize,

    #[arg(long)]
    pub network_seed: Option<String>,

    /// One network seed per agent, comma or space separated
    #[arg(long, num_args = 1..)]
    pub network_seeds: Vec<String>,

    /// Install all agents on one conductor
    #[arg(long)]
    pub single_conductor: bool,

    /// Target arc factor for all conductors. 0 makes zero-arc nodes.
    #[arg(short = 't', long)]
    pub target_arc_factor: Option<f64>,

    /// Folder containing the index.html of the UI
    #[arg(long)]
    pub ui_path: Option<PathBuf>,

    /// Port of a localhost dev server that serves the UI
    #[arg(long)]
    pub ui_port: Option<u16>,

    #[arg(long)]
    pub open_devtools: bool,

    #[arg(long, value_enum, default_value_t = Transport::Quic)]
    pub transport: Transport,

    #[arg(long, value_enum, default_value_t = LocalServices::Kitsune2)]
    pub local_services: LocalServices,

    #[arg(long, default_value = "hc")]
    pub hc_path: String,

    #[arg(long, default_value = "kitsune2-bootstrap-srv")]
    pub bootstrap_srv_path: String,

    #[arg(long, default_value_t = DEFAULT_READY_TIMEOUT_SECS)]
    pub ready_timeout_secs: u64,

    #[arg(long, default_value_t = DEFAULT_RPC_TIMEOUT_SECS)]
    pub rpc_timeout_secs: u64,

    /// Port of the local UI bridge, 0 picks a free one
    #[arg(long, default_value_t = 0)]
    pub bridge_port: u16,
}

impl Cli {
    pub fn into_options(self) -> LaunchOptions {
        LaunchOptions {
            paths: self.paths,
            app_id: self.app_id,
            bootstrap_url: self.bootstrap_url,
            signaling_url: self.signaling_url,
            holochain_path: self.holochain_path,
            num_agents: Some(self.num_agents),
            network_seed: self.network_seed,
            network_seeds: self.network_seeds,
            single_conductor: self.single_conductor,
            target_arc_factor: self.target_arc_factor,
            ui_path: self.ui_path,
            ui_port: self.ui_port,
            open_devtools: self.open_devtools,
            transport: self.transport,
            local_services: self.local_services,
            tools: Tools {
                hc: self.hc_path,
                bootstrap_srv: self.bootstrap_srv_path,
            },
            ready_timeout_secs: Some(self.ready_timeout_secs),
            rpc_timeout_secs: Some(self.rpc_timeout_secs),
            bridge_port: self.bridge_port,
        }
    }
}

/// Runs one launch session to completion and returns the process exit code.
pub fn run(cli: Cli) -> Result<i32, SpinError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_session(cli.into_options()))
}

async fn run_session(options: LaunchOptions) -> Result<i32, SpinError> {
    let temp_root = std::env::temp_dir();
    match sweep_abandoned(&temp_root).await {
        Ok(0) => {}
        Ok(removed) => tracing::info!(removed, "removed abandoned session directories"),
        Err(err) => tracing::warn!(error = %err, "failed to sweep abandoned session directories"),
    }

    let dir = SessionDir::create_in(&temp_root).await?;
    let request = match launch::validate(options, dir.path()) {
        Ok(request) => request,
        Err(err) => {
            dir.mark_abandoned().await?;
            return Err(err);
        }
    };

    let gate = CallAuthorizationGate::shared();
    let bridge = Bridge::start(request.bridge_port, gate.clone(), &request.ui_source).await?;
    let collaborators = collaborators(&request, &bridge);
    let session = Session::new(request, dir, collaborators, gate);

    let result = match session.launch_until(interrupted()).await {
        Ok(Some(_)) => {
            let end = session.wait().await;
            session.shutdown().await;
            Ok(end.exit_code())
        }
        Ok(None) => Ok(SessionEnd::Interrupted.exit_code()),
        Err(err) => Err(err),
    };
    bridge.shutdown();
    result
}

fn collaborators(request: &LaunchRequest, bridge: &Bridge) -> Collaborators {
    let supervisor = Arc::new(Supervisor::new(Some(cleanup_command(&request.tools))));
    Collaborators {
        launcher: Arc::new(HcSandbox::new(
            supervisor,
            request.tools.clone(),
            request.local_services,
            request.transport,
            request.ready_timeout,
        )),
        connector: Arc::new(WsConductorConnector::new(request.rpc_timeout)),
        signers: Arc::new(LairSignerConnector::new(
            KEYSTORE_PASSPHRASE,
            request.rpc_timeout,
        )),
        windows: Arc::new(BrowserWindowHost::new(bridge, Some(Opener::platform()))),
    }
}
