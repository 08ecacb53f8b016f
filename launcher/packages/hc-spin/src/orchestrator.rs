//! Session orchestration: local services, conductors, app setup and one
//! window per agent.

use std::future::Future;
use std::sync::Arc;

use hc_spin_error::SpinError;

use crate::conductor::{
    AdminApi, AgentInstallation, AppInfo, ConductorConnector, InstallApp,
};
use crate::gate::CallAuthorizationGate;
use crate::launch::{BundleKind, LaunchRequest, Topology};
use crate::ports::allocate_ports;
use crate::readiness::{ConductorEndpoint, ServiceUrls};
use crate::sandbox::{ConductorLauncher, SandboxPlan};
use crate::signer::{SharedSigner, SignerConnector};
use crate::supervisor::ChildExit;
use crate::webhapp;
use crate::window::{SurfaceId, WindowHost, WindowRequest};
use crate::workdir::SessionDir;

/// An agent with its app installed and its window loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedAgent {
    pub installation: AgentInstallation,
    pub surface: SurfaceId,
}

/// Why a running session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    Interrupted,
    ChildExited(ChildExit),
}

impl SessionEnd {
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionEnd::Interrupted => 0,
            SessionEnd::ChildExited(exit) => exit.exit_code.unwrap_or(1),
        }
    }
}

/// External collaborators a session drives
#[derive(Clone)]
pub struct Collaborators {
    pub launcher: Arc<dyn ConductorLauncher>,
    pub connector: Arc<dyn ConductorConnector>,
    pub signers: Arc<dyn SignerConnector>,
    pub windows: Arc<dyn WindowHost>,
}

pub struct Session {
    request: LaunchRequest,
    dir: SessionDir,
    collaborators: Collaborators,
    gate: Arc<CallAuthorizationGate>,
}

impl Session {
    pub fn new(
        request: LaunchRequest,
        dir: SessionDir,
        collaborators: Collaborators,
        gate: Arc<CallAuthorizationGate>,
    ) -> Self {
        Self {
            request,
            dir,
            collaborators,
            gate,
        }
    }

    pub fn request(&self) -> &LaunchRequest {
        &self.request
    }

    pub fn gate(&self) -> &Arc<CallAuthorizationGate> {
        &self.gate
    }

    /// Brings every agent up. On failure the session is torn down before
    /// the error is returned.
    pub async fn launch(&self) -> Result<Vec<LaunchedAgent>, SpinError> {
        match self.launch_inner().await {
            Ok(agents) => Ok(agents),
            Err(err) => {
                tracing::error!(error = %err, "launch failed, tearing down session");
                self.shutdown().await;
                Err(err)
            }
        }
    }

    /// Like [`Session::launch`], but shuts the session down and returns
    /// `None` if `interrupt` resolves before every agent is up.
    pub async fn launch_until<F>(&self, interrupt: F) -> Result<Option<Vec<LaunchedAgent>>, SpinError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.launch() => result.map(Some),
            () = interrupt => {
                tracing::info!("interrupted during launch, shutting down");
                self.shutdown().await;
                Ok(None)
            }
        }
    }

    async fn launch_inner(&self) -> Result<Vec<LaunchedAgent>, SpinError> {
        if self.request.bundle_kind == BundleKind::Webhapp {
            let app_dir = self.request.app_dir(self.dir.path());
            webhapp::unpack(
                &self.request.bundle_path,
                &self.request.happ_path(self.dir.path()),
                &app_dir.join("ui"),
            )
            .await?;
        }

        let services = self.collaborators.launcher.start_local_services().await?;
        let urls = ServiceUrls {
            bootstrap_url: self
                .request
                .bootstrap_url
                .clone()
                .unwrap_or(services.bootstrap_url),
            signal_url: self
                .request
                .signaling_url
                .clone()
                .unwrap_or(services.signal_url),
        };

        let agents = match self.request.topology {
            Topology::ConductorPerAgent => self.launch_conductor_per_agent(&urls).await?,
            Topology::SingleConductor => self.launch_single_conductor(&urls).await?,
        };
        tracing::info!(agents = agents.len(), app_id = %self.request.app_id, "all agents launched");
        Ok(agents)
    }

    fn plan(&self, urls: &ServiceUrls, app_ports: Vec<u16>, network_seed: Option<String>) -> SandboxPlan {
        SandboxPlan {
            happ_path: self.request.happ_path(self.dir.path()),
            app_id: self.request.app_id.clone(),
            app_ports,
            network_seed,
            target_arc_factor: self.request.target_arc_factor,
            bootstrap_url: urls.bootstrap_url.clone(),
            signal_url: urls.signal_url.clone(),
            transport: self.request.transport,
            holochain_path: self.request.holochain_path.clone(),
        }
    }

    async fn launch_conductor_per_agent(&self, urls: &ServiceUrls) -> Result<Vec<LaunchedAgent>, SpinError> {
        let ports = allocate_ports(self.request.num_agents)?;
        let plan = self.plan(urls, ports.clone(), self.request.network_seed.clone());
        let endpoints = self.collaborators.launcher.launch_conductors(&plan).await?;

        let mut agents = Vec::with_capacity(endpoints.len());
        for (idx, endpoint) in endpoints.iter().enumerate() {
            let agent = idx + 1;
            let app_port = endpoint
                .app_ports
                .first()
                .copied()
                .or_else(|| ports.get(idx).copied())
                .ok_or_else(|| SpinError::rpc("app_ports", format!("conductor #{} has no app port", endpoint.ordinal)))?;
            let keystore_url = self.collaborators.launcher.keystore_url(endpoint).await?;
            let signer = self.collaborators.signers.connect(&keystore_url).await?;
            let installation = self.sandboxed_installation(agent, endpoint, app_port).await?;
            agents.push(self.open_window(installation, signer).await?);
        }
        Ok(agents)
    }

    /// Reads the agent of the app that `hc sandbox` installed on `endpoint`.
    async fn sandboxed_installation(
        &self,
        agent: usize,
        endpoint: &ConductorEndpoint,
        app_port: u16,
    ) -> Result<AgentInstallation, SpinError> {
        let admin = self.collaborators.connector.connect_admin(endpoint.admin_port).await?;
        let app_id = self.request.app_id.clone();
        let token = admin.issue_app_token(&app_id).await?;
        admin.close().await?;

        let app = self.collaborators.connector.connect_app(app_port, &token).await?;
        let info = app.app_info().await?;
        app.close().await?;
        let info = require_app_info(info, &app_id)?;

        Ok(AgentInstallation {
            agent,
            installed_app_id: app_id,
            agent_pub_key: info.agent_pub_key,
            app_port,
            token,
        })
    }

    async fn launch_single_conductor(&self, urls: &ServiceUrls) -> Result<Vec<LaunchedAgent>, SpinError> {
        let ports = allocate_ports(1)?;
        let seed = self.request.network_seed_for(1).map(str::to_string);
        let plan = self.plan(urls, ports, seed);
        let endpoints = self.collaborators.launcher.launch_conductors(&plan).await?;
        let endpoint = endpoints
            .first()
            .ok_or_else(|| SpinError::rpc("launch", "conductor reported no endpoint"))?;
        let keystore_url = self.collaborators.launcher.keystore_url(endpoint).await?;

        let admin = self.collaborators.connector.connect_admin(endpoint.admin_port).await?;
        let result = self.install_all_agents(admin.as_ref(), &keystore_url).await;
        let closed = admin.close().await;
        let agents = result?;
        closed?;
        Ok(agents)
    }

    async fn install_all_agents(
        &self,
        admin: &dyn AdminApi,
        keystore_url: &str,
    ) -> Result<Vec<LaunchedAgent>, SpinError> {
        let mut installations = Vec::with_capacity(self.request.num_agents);
        installations.push(self.first_agent_installation(admin).await?);
        // one admin connection, one install at a time
        for agent in 2..=self.request.num_agents {
            installations.push(self.install_additional_agent(admin, agent).await?);
        }

        let apps = admin.list_apps().await?;
        let ids: Vec<&str> = apps.iter().map(|app| app.installed_app_id.as_str()).collect();
        tracing::info!(apps = ?ids, "installed apps");

        let signer = self.collaborators.signers.connect(keystore_url).await?;
        let mut agents = Vec::with_capacity(installations.len());
        for installation in installations {
            agents.push(self.open_window(installation, signer.clone()).await?);
        }
        Ok(agents)
    }

    async fn first_agent_installation(&self, admin: &dyn AdminApi) -> Result<AgentInstallation, SpinError> {
        let app_id = self.request.agent_app_id(1);
        admin.enable_app(&app_id).await?;
        let app_port = admin.attach_app_interface(&app_id).await?;
        let token = admin.issue_app_token(&app_id).await?;

        let app = self.collaborators.connector.connect_app(app_port, &token).await?;
        let info = app.app_info().await?;
        app.close().await?;
        let info = require_app_info(info, &app_id)?;

        Ok(AgentInstallation {
            agent: 1,
            installed_app_id: app_id,
            agent_pub_key: info.agent_pub_key,
            app_port,
            token,
        })
    }

    async fn install_additional_agent(
        &self,
        admin: &dyn AdminApi,
        agent: usize,
    ) -> Result<AgentInstallation, SpinError> {
        let installed_app_id = self.request.agent_app_id(agent);
        let agent_pub_key = admin.generate_agent_pub_key().await?;
        admin
            .install_app(InstallApp {
                happ_path: self.request.happ_path(self.dir.path()),
                agent_key: agent_pub_key.clone(),
                installed_app_id: installed_app_id.clone(),
                network_seed: self.request.network_seed_for(agent).map(str::to_string),
            })
            .await?;
        admin.enable_app(&installed_app_id).await?;
        let app_port = admin.attach_app_interface(&installed_app_id).await?;
        let token = admin.issue_app_token(&installed_app_id).await?;
        tracing::info!(agent, app_id = %installed_app_id, app_port, "installed additional agent");

        Ok(AgentInstallation {
            agent,
            installed_app_id,
            agent_pub_key,
            app_port,
            token,
        })
    }

    /// Creates the window, binds it in the gate, and only then loads it.
    async fn open_window(
        &self,
        installation: AgentInstallation,
        signer: SharedSigner,
    ) -> Result<LaunchedAgent, SpinError> {
        let request = WindowRequest {
            agent: installation.agent,
            title: self.request.window_title(installation.agent),
            installed_app_id: installation.installed_app_id.clone(),
            app_port: installation.app_port,
            token: installation.token.clone(),
            ui_source: self.request.ui_source.clone(),
            open_devtools: self.request.open_devtools,
        };
        let pending = self.collaborators.windows.create_window(request).await?;
        let registered = self
            .gate
            .register(pending, installation.agent_pub_key.clone(), signer)
            .await?;
        let surface = registered.surface().clone();
        self.collaborators.windows.load_window(registered).await?;
        Ok(LaunchedAgent {
            installation,
            surface,
        })
    }

    /// Waits for Ctrl-C or for any launched process to exit.
    pub async fn wait(&self) -> SessionEnd {
        self.wait_until(interrupted()).await
    }

    pub async fn wait_until<F>(&self, interrupt: F) -> SessionEnd
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            () = interrupt => {
                tracing::info!("interrupted, shutting down");
                SessionEnd::Interrupted
            }
            exit = self.collaborators.launcher.wait_for_exit() => match exit {
                Some(exit) => {
                    tracing::warn!(process = %exit.process, status = %exit.status, "child process exited");
                    SessionEnd::ChildExited(exit)
                }
                None => SessionEnd::Interrupted,
            },
        }
    }

    /// Marks the session directory abandoned and stops every child process.
    pub async fn shutdown(&self) {
        if let Err(err) = self.dir.mark_abandoned().await {
            tracing::warn!(error = %err, path = %self.dir.path().display(), "failed to mark session directory abandoned");
        }
        self.collaborators.launcher.shutdown().await;
    }
}

/// Resolves on Ctrl-C. Never resolves if the handler cannot be installed.
pub async fn interrupted() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

fn require_app_info(info: Option<AppInfo>, app_id: &str) -> Result<AppInfo, SpinError> {
    info.ok_or_else(|| SpinError::rpc("app_info", format!("no app info returned for {app_id}")))
}
