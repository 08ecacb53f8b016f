#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::{Signer as _, SigningKey};

use hc_spin::conductor::{
    AdminApi, AgentPubKey, AppApi, AppAuthToken, AppInfo, ConductorConnector, InstallApp,
};
use hc_spin::gate::CallAuthorizationGate;
use hc_spin::launch::{self, LaunchOptions, LaunchRequest};
use hc_spin::orchestrator::{Collaborators, Session};
use hc_spin::readiness::{ConductorEndpoint, ServiceUrls};
use hc_spin::sandbox::{ConductorLauncher, SandboxPlan};
use hc_spin::signer::{SharedSigner, SignerConnector, ZomeCallSigner};
use hc_spin::supervisor::ChildExit;
use hc_spin::window::{PendingWindow, RegisteredWindow, SurfaceId, WindowHost, WindowRequest};
use hc_spin::workdir::SessionDir;
use hc_spin::zome_call::SignedZomeCall;
use hc_spin_error::{SignRejection, SpinError};

pub fn key_for_port(port: u16) -> AgentPubKey {
    let mut bytes = [0u8; 32];
    bytes[..2].copy_from_slice(&port.to_be_bytes());
    bytes[31] = 0xAA;
    AgentPubKey::from_ed25519(bytes)
}

pub fn key_for_seed(seed: u8) -> AgentPubKey {
    AgentPubKey::from_ed25519([seed; 32])
}

#[derive(Default)]
pub struct FakeLauncher {
    pub plans: Mutex<Vec<SandboxPlan>>,
    pub shutdowns: AtomicUsize,
    pub fail_launch: bool,
    /// Never report the conductors ready
    pub hang_launch: bool,
    pub exit: Mutex<Option<ChildExit>>,
}

#[async_trait]
impl ConductorLauncher for FakeLauncher {
    async fn start_local_services(&self) -> Result<ServiceUrls, SpinError> {
        Ok(ServiceUrls {
            bootstrap_url: "http://127.0.0.1:3000".to_string(),
            signal_url: "http://127.0.0.1:3000".to_string(),
        })
    }

    async fn launch_conductors(&self, plan: &SandboxPlan) -> Result<Vec<ConductorEndpoint>, SpinError> {
        self.plans.lock().unwrap().push(plan.clone());
        if self.hang_launch {
            std::future::pending::<()>().await;
        }
        if self.fail_launch {
            return Err(SpinError::ProcessExited {
                process: "hc sandbox".to_string(),
                status: "exit status: 1".to_string(),
                exit_code: Some(1),
            });
        }
        Ok(plan
            .app_ports
            .iter()
            .enumerate()
            .map(|(idx, port)| ConductorEndpoint {
                ordinal: idx as u32 + 1,
                admin_port: 9000 + idx as u16,
                app_ports: vec![*port],
                directory: PathBuf::from(format!("/fake/conductor-{}", idx + 1)),
                keystore_url: format!("unix:///fake/keystore-{}", idx + 1),
            })
            .collect())
    }

    async fn keystore_url(&self, endpoint: &ConductorEndpoint) -> Result<String, SpinError> {
        Ok(endpoint.keystore_url.clone())
    }

    async fn wait_for_exit(&self) -> Option<ChildExit> {
        let exit = self.exit.lock().unwrap().take();
        match exit {
            Some(exit) => Some(exit),
            None => std::future::pending().await,
        }
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Shared state of every fake admin connection.
#[derive(Default)]
pub struct AdminLog {
    pub calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    next_seed: AtomicUsize,
    next_port: AtomicUsize,
    installed: Mutex<HashMap<String, AgentPubKey>>,
    app_ports: Mutex<HashMap<u16, AgentPubKey>>,
}

impl AdminLog {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    async fn call(&self, name: String) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().unwrap().push(name);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn key_for_app(&self, app_id: &str) -> AgentPubKey {
        let mut installed = self.installed.lock().unwrap();
        installed
            .entry(app_id.to_string())
            .or_insert_with(|| key_for_seed(1))
            .clone()
    }
}

pub struct FakeAdmin {
    log: Arc<AdminLog>,
}

#[async_trait]
impl AdminApi for FakeAdmin {
    async fn generate_agent_pub_key(&self) -> Result<AgentPubKey, SpinError> {
        self.log.call("generate_agent_pub_key".to_string()).await;
        let seed = self.log.next_seed.fetch_add(1, Ordering::SeqCst) as u8 + 2;
        Ok(key_for_seed(seed))
    }

    async fn install_app(&self, request: InstallApp) -> Result<AppInfo, SpinError> {
        self.log
            .call(format!("install_app:{}", request.installed_app_id))
            .await;
        self.log
            .installed
            .lock()
            .unwrap()
            .insert(request.installed_app_id.clone(), request.agent_key.clone());
        Ok(AppInfo {
            installed_app_id: request.installed_app_id,
            agent_pub_key: request.agent_key,
        })
    }

    async fn enable_app(&self, installed_app_id: &str) -> Result<(), SpinError> {
        self.log.call(format!("enable_app:{installed_app_id}")).await;
        Ok(())
    }

    async fn attach_app_interface(&self, installed_app_id: &str) -> Result<u16, SpinError> {
        self.log
            .call(format!("attach_app_interface:{installed_app_id}"))
            .await;
        let port = 7000 + self.log.next_port.fetch_add(1, Ordering::SeqCst) as u16;
        let key = self.log.key_for_app(installed_app_id);
        self.log.app_ports.lock().unwrap().insert(port, key);
        Ok(port)
    }

    async fn issue_app_token(&self, installed_app_id: &str) -> Result<AppAuthToken, SpinError> {
        self.log.call(format!("issue_app_token:{installed_app_id}")).await;
        Ok(AppAuthToken(installed_app_id.as_bytes().to_vec()))
    }

    async fn list_apps(&self) -> Result<Vec<AppInfo>, SpinError> {
        self.log.call("list_apps".to_string()).await;
        let mut apps: Vec<AppInfo> = self
            .log
            .installed
            .lock()
            .unwrap()
            .iter()
            .map(|(id, key)| AppInfo {
                installed_app_id: id.clone(),
                agent_pub_key: key.clone(),
            })
            .collect();
        apps.sort_by(|a, b| a.installed_app_id.cmp(&b.installed_app_id));
        Ok(apps)
    }

    async fn close(&self) -> Result<(), SpinError> {
        Ok(())
    }
}

pub struct FakeApp {
    info: AppInfo,
}

#[async_trait]
impl AppApi for FakeApp {
    async fn app_info(&self) -> Result<Option<AppInfo>, SpinError> {
        Ok(Some(self.info.clone()))
    }

    async fn call_zome(&self, _call: SignedZomeCall) -> Result<Vec<u8>, SpinError> {
        Ok(Vec::new())
    }

    async fn close(&self) -> Result<(), SpinError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeConnector {
    pub log: Arc<AdminLog>,
    pub admin_connections: AtomicUsize,
}

#[async_trait]
impl ConductorConnector for FakeConnector {
    async fn connect_admin(&self, _port: u16) -> Result<Box<dyn AdminApi>, SpinError> {
        self.admin_connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeAdmin {
            log: self.log.clone(),
        }))
    }

    async fn connect_app(&self, port: u16, token: &AppAuthToken) -> Result<Box<dyn AppApi>, SpinError> {
        let key = self
            .log
            .app_ports
            .lock()
            .unwrap()
            .get(&port)
            .cloned()
            .unwrap_or_else(|| key_for_port(port));
        Ok(Box::new(FakeApp {
            info: AppInfo {
                installed_app_id: String::from_utf8_lossy(&token.0).to_string(),
                agent_pub_key: key,
            },
        }))
    }
}

/// Signer that counts calls and signs hashes with one ed25519 key per agent seed.
#[derive(Default)]
pub struct CountingSigner {
    pub calls: AtomicUsize,
    keys: Mutex<HashMap<Vec<u8>, SigningKey>>,
}

impl CountingSigner {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Agent key whose signatures this signer can produce.
    pub fn agent_for(&self, seed: u8) -> AgentPubKey {
        let signing = SigningKey::from_bytes(&[seed; 32]);
        let agent = AgentPubKey::from_ed25519(signing.verifying_key().to_bytes());
        self.keys
            .lock()
            .unwrap()
            .insert(agent.as_bytes().to_vec(), signing);
        agent
    }
}

#[async_trait]
impl ZomeCallSigner for CountingSigner {
    fn is_ready(&self) -> bool {
        true
    }

    async fn sign(&self, hash: &[u8], agent: &AgentPubKey) -> Result<Vec<u8>, SignRejection> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let keys = self.keys.lock().unwrap();
        match keys.get(agent.as_bytes()) {
            Some(key) => Ok(key.sign(hash).to_bytes().to_vec()),
            None => Ok(vec![0u8; 64]),
        }
    }
}

#[derive(Default)]
pub struct FakeSignerConnector {
    pub signer: Arc<CountingSigner>,
    pub urls: Mutex<Vec<String>>,
}

#[async_trait]
impl SignerConnector for FakeSignerConnector {
    async fn connect(&self, keystore_url: &str) -> Result<SharedSigner, SpinError> {
        self.urls.lock().unwrap().push(keystore_url.to_string());
        Ok(self.signer.clone())
    }
}

/// Window host that records the order of create and load, and whether the
/// surface was already bound when it loaded.
pub struct FakeWindows {
    pub gate: Arc<CallAuthorizationGate>,
    pub events: Mutex<Vec<String>>,
    pub bound_at_load: Mutex<Vec<bool>>,
}

impl FakeWindows {
    pub fn new(gate: Arc<CallAuthorizationGate>) -> Self {
        Self {
            gate,
            events: Mutex::new(Vec::new()),
            bound_at_load: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl WindowHost for FakeWindows {
    async fn create_window(&self, request: WindowRequest) -> Result<PendingWindow, SpinError> {
        let surface = SurfaceId::new(format!("surface-{}", request.agent));
        self.events
            .lock()
            .unwrap()
            .push(format!("create:{}", request.title));
        Ok(PendingWindow::new(surface, request))
    }

    async fn load_window(&self, window: RegisteredWindow) -> Result<(), SpinError> {
        let bound = self.gate.is_bound(window.surface()).await;
        self.bound_at_load.lock().unwrap().push(bound);
        self.events
            .lock()
            .unwrap()
            .push(format!("load:{}", window.surface()));
        Ok(())
    }
}

pub struct Harness {
    pub session: Session,
    pub launcher: Arc<FakeLauncher>,
    pub connector: Arc<FakeConnector>,
    pub signers: Arc<FakeSignerConnector>,
    pub windows: Arc<FakeWindows>,
    pub gate: Arc<CallAuthorizationGate>,
    pub root: tempfile::TempDir,
    pub session_dir: PathBuf,
}

pub fn happ_request(dir: &Path, num_agents: usize, single_conductor: bool) -> LaunchRequest {
    let happ = dir.join("forum.happ");
    std::fs::write(&happ, b"happ").unwrap();
    launch::validate(
        LaunchOptions {
            paths: vec![happ],
            num_agents: Some(num_agents),
            single_conductor,
            ui_port: Some(5173),
            ..Default::default()
        },
        dir,
    )
    .unwrap()
}

pub async fn harness(num_agents: usize, single_conductor: bool, launcher: FakeLauncher) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let dir = SessionDir::create_in(root.path()).await.unwrap();
    let session_dir = dir.path().to_path_buf();
    let request = happ_request(root.path(), num_agents, single_conductor);

    let gate = CallAuthorizationGate::shared();
    let launcher = Arc::new(launcher);
    let connector = Arc::new(FakeConnector::default());
    let signers = Arc::new(FakeSignerConnector::default());
    let windows = Arc::new(FakeWindows::new(gate.clone()));
    let session = Session::new(
        request,
        dir,
        Collaborators {
            launcher: launcher.clone(),
            connector: connector.clone(),
            signers: signers.clone(),
            windows: windows.clone(),
        },
        gate.clone(),
    );
    Harness {
        session,
        launcher,
        connector,
        signers,
        windows,
        gate,
        root,
        session_dir,
    }
}
