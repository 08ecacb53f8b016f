//! Drives the `hc sandbox` and local bootstrap/signal binaries.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use hc_spin_error::SpinError;

use crate::launch::{LocalServices, Tools, Transport, KEYSTORE_PASSPHRASE};
use crate::readiness::{ConductorEndpoint, ConductorReadiness, ServiceUrls, ServicesReadiness};
use crate::supervisor::{ChildExit, CleanupCommand, SpawnSpec, Supervisor};

pub const CONDUCTOR_CONFIG_FILE: &str = "conductor-config.yaml";
const CONNECTION_URL_KEY: &str = "connection_url";

/// Everything `hc sandbox generate` needs for one batch of conductors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxPlan {
    pub happ_path: PathBuf,
    pub app_id: String,
    /// One pre-allocated app interface port per conductor
    pub app_ports: Vec<u16>,
    pub network_seed: Option<String>,
    pub target_arc_factor: Option<f64>,
    pub bootstrap_url: String,
    pub signal_url: String,
    pub transport: Transport,
    pub holochain_path: Option<PathBuf>,
}

impl SandboxPlan {
    pub fn conductor_count(&self) -> usize {
        self.app_ports.len()
    }
}

/// Starts the external processes a session depends on.
#[async_trait]
pub trait ConductorLauncher: Send + Sync {
    /// Starts the local bootstrap/signal service and waits for its URLs.
    async fn start_local_services(&self) -> Result<ServiceUrls, SpinError>;

    /// Spawns one conductor per planned app port and waits until all of them are ready.
    async fn launch_conductors(&self, plan: &SandboxPlan) -> Result<Vec<ConductorEndpoint>, SpinError>;

    /// Keystore connection URL recorded in a ready conductor's directory.
    async fn keystore_url(&self, endpoint: &ConductorEndpoint) -> Result<String, SpinError>;

    /// Resolves when any launched process exits.
    async fn wait_for_exit(&self) -> Option<ChildExit>;

    /// Terminates everything that was launched. Safe to call more than once.
    async fn shutdown(&self);
}

/// Builds the `hc` arguments for a batch of sandboxed conductors.
pub fn sandbox_args(plan: &SandboxPlan) -> Vec<String> {
    let mut args = vec!["sandbox".to_string()];
    if let Some(holochain_path) = &plan.holochain_path {
        args.push("--holochain-path".to_string());
        args.push(holochain_path.display().to_string());
    }
    args.extend([
        "--piped".to_string(),
        "generate".to_string(),
        "--num-sandboxes".to_string(),
        plan.conductor_count().to_string(),
        "--app-id".to_string(),
        plan.app_id.clone(),
        "--run".to_string(),
        plan.app_ports
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(","),
    ]);
    if let Some(seed) = &plan.network_seed {
        args.push("--network-seed".to_string());
        args.push(seed.clone());
    }
    args.push(plan.happ_path.display().to_string());
    args.push("network".to_string());
    if let Some(factor) = plan.target_arc_factor {
        args.push("--target-arc-factor".to_string());
        args.push(factor.to_string());
    }
    args.extend([
        "--bootstrap".to_string(),
        plan.bootstrap_url.clone(),
        plan.transport.as_arg().to_string(),
        plan.signal_url.clone(),
    ]);
    args
}

pub fn local_services_spec(flavor: LocalServices, tools: &Tools) -> SpawnSpec {
    match flavor {
        LocalServices::Kitsune2 => {
            SpawnSpec::new("kitsune2-bootstrap-srv", tools.bootstrap_srv.clone(), vec![])
        }
        LocalServices::Legacy => SpawnSpec::new(
            "hc run-local-services",
            tools.hc.clone(),
            vec!["run-local-services".to_string()],
        ),
    }
}

pub fn cleanup_command(tools: &Tools) -> CleanupCommand {
    CleanupCommand {
        program: tools.hc.clone(),
        args: vec!["sandbox".to_string(), "clean".to_string()],
    }
}

/// Reads the keystore URL out of `<dir>/conductor-config.yaml`.
///
/// The file format belongs to `hc sandbox`; only the first line mentioning
/// `connection_url` is looked at.
pub async fn read_keystore_url(directory: &Path) -> Result<String, SpinError> {
    let path = directory.join(CONDUCTOR_CONFIG_FILE);
    let contents = tokio::fs::read_to_string(&path).await?;
    contents
        .lines()
        .find(|line| line.contains(CONNECTION_URL_KEY))
        .and_then(|line| line.split_once("connection_url:"))
        .map(|(_, url)| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .ok_or_else(|| SpinError::MalformedMarker {
            process: path.display().to_string(),
            marker: CONNECTION_URL_KEY.to_string(),
            message: "no keystore connection url found".to_string(),
        })
}

/// [`ConductorLauncher`] backed by the real `hc` tooling.
pub struct HcSandbox {
    supervisor: Arc<Supervisor>,
    tools: Tools,
    local_services: LocalServices,
    transport: Transport,
    ready_timeout: Duration,
}

impl HcSandbox {
    pub fn new(
        supervisor: Arc<Supervisor>,
        tools: Tools,
        local_services: LocalServices,
        transport: Transport,
        ready_timeout: Duration,
    ) -> Self {
        Self {
            supervisor,
            tools,
            local_services,
            transport,
            ready_timeout,
        }
    }
}

#[async_trait]
impl ConductorLauncher for HcSandbox {
    async fn start_local_services(&self) -> Result<ServiceUrls, SpinError> {
        let spec = local_services_spec(self.local_services, &self.tools);
        let mut batch = self.supervisor.spawn(spec).await?;
        let mut tracker = ServicesReadiness::new(self.local_services, self.transport);
        let urls = batch.await_ready(&mut tracker, self.ready_timeout).await?;
        tracing::info!(
            bootstrap_url = %urls.bootstrap_url,
            signal_url = %urls.signal_url,
            "local services ready"
        );
        Ok(urls)
    }

    async fn launch_conductors(&self, plan: &SandboxPlan) -> Result<Vec<ConductorEndpoint>, SpinError> {
        let spec = SpawnSpec::new("hc sandbox", self.tools.hc.clone(), sandbox_args(plan))
            .with_stdin(KEYSTORE_PASSPHRASE);
        let mut batch = self.supervisor.spawn(spec).await?;
        let mut tracker = ConductorReadiness::new(plan.conductor_count());
        let endpoints = batch.await_ready(&mut tracker, self.ready_timeout).await?;
        for endpoint in &endpoints {
            tracing::info!(
                ordinal = endpoint.ordinal,
                admin_port = endpoint.admin_port,
                app_ports = ?endpoint.app_ports,
                directory = %endpoint.directory.display(),
                "conductor ready"
            );
        }
        Ok(endpoints)
    }

    async fn keystore_url(&self, endpoint: &ConductorEndpoint) -> Result<String, SpinError> {
        read_keystore_url(&endpoint.directory).await
    }

    async fn wait_for_exit(&self) -> Option<ChildExit> {
        self.supervisor.wait_for_exit().await
    }

    async fn shutdown(&self) {
        self.supervisor.kill_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> SandboxPlan {
        SandboxPlan {
            happ_path: PathBuf::from("/work/forum.happ"),
            app_id: "forum".to_string(),
            app_ports: vec![4001, 4002],
            network_seed: None,
            target_arc_factor: None,
            bootstrap_url: "http://127.0.0.1:3000".to_string(),
            signal_url: "http://127.0.0.1:3000".to_string(),
            transport: Transport::Quic,
            holochain_path: None,
        }
    }

    #[test]
    fn test_minimal_sandbox_args() {
        assert_eq!(
            sandbox_args(&plan()),
            vec![
                "sandbox",
                "--piped",
                "generate",
                "--num-sandboxes",
                "2",
                "--app-id",
                "forum",
                "--run",
                "4001,4002",
                "/work/forum.happ",
                "network",
                "--bootstrap",
                "http://127.0.0.1:3000",
                "quic",
                "http://127.0.0.1:3000",
            ]
        );
    }

    #[test]
    fn test_optional_sandbox_args() {
        let plan = SandboxPlan {
            network_seed: Some("seed".to_string()),
            target_arc_factor: Some(0.0),
            holochain_path: Some(PathBuf::from("/bin/holochain")),
            transport: Transport::Webrtc,
            ..plan()
        };
        let args = sandbox_args(&plan);
        assert_eq!(&args[..3], ["sandbox", "--holochain-path", "/bin/holochain"]);
        let seed = args.iter().position(|arg| arg == "--network-seed").unwrap();
        assert_eq!(args[seed + 1], "seed");
        assert!(seed < args.iter().position(|arg| arg == "/work/forum.happ").unwrap());
        let arc = args.iter().position(|arg| arg == "--target-arc-factor").unwrap();
        assert_eq!(args[arc + 1], "0");
        assert_eq!(args[args.len() - 2], "webrtc");
    }

    #[test]
    fn test_local_services_specs() {
        let tools = Tools::default();
        let spec = local_services_spec(LocalServices::Kitsune2, &tools);
        assert_eq!(spec.program, "kitsune2-bootstrap-srv");
        assert!(spec.args.is_empty());
        let spec = local_services_spec(LocalServices::Legacy, &tools);
        assert_eq!(spec.program, "hc");
        assert_eq!(spec.args, vec!["run-local-services"]);
        assert_eq!(cleanup_command(&tools).args, vec!["sandbox", "clean"]);
    }

    #[tokio::test]
    async fn test_read_keystore_url() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONDUCTOR_CONFIG_FILE),
            "---\ndata_root_path: /tmp/x\nkeystore:\n  type: lair_server\n  connection_url: unix:///tmp/x/keystore/socket?k=abc\n  other_connection_url: unix:///ignored\n",
        )
        .unwrap();
        assert_eq!(
            read_keystore_url(dir.path()).await.unwrap(),
            "unix:///tmp/x/keystore/socket?k=abc"
        );
    }

    #[tokio::test]
    async fn test_read_keystore_url_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONDUCTOR_CONFIG_FILE), "keystore:\n  type: danger_test_keystore\n").unwrap();
        let err = read_keystore_url(dir.path()).await.unwrap_err();
        assert!(matches!(err, SpinError::MalformedMarker { .. }));

        let empty = tempfile::tempdir().unwrap();
        let err = read_keystore_url(empty.path()).await.unwrap_err();
        assert!(matches!(err, SpinError::Io(_)));
    }
}
