//! Local HTTP bridge between UI surfaces and the launcher.
//!
//! Every surface gets a URL prefix `/surfaces/:surface`. Sign requests are
//! routed through the [`CallAuthorizationGate`], so a surface can only ever
//! obtain signatures for the agent it is bound to.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::header::{CONTENT_TYPE, ORIGIN};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tower::ServiceExt;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::Span;
use url::Url;

use hc_spin_error::{SignRejection, SpinError};

use crate::gate::CallAuthorizationGate;
use crate::launch::UiSource;
use crate::window::{PendingWindow, RegisteredWindow, SurfaceId, WindowHost, WindowRequest};
use crate::zome_call::{SignedZomeCall, ZomeCallRequest};

const DEV_SERVER_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
/// Query parameter that tells a dev-server UI where its bridge surface lives
pub const BRIDGE_QUERY_PARAM: &str = "hc-spin-bridge";

/// Environment a UI surface reads to find its app interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LauncherEnv {
    #[serde(rename = "APP_INTERFACE_PORT")]
    pub app_interface_port: u16,
    #[serde(rename = "INSTALLED_APP_ID")]
    pub installed_app_id: String,
    #[serde(
        rename = "APP_INTERFACE_TOKEN",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub app_interface_token: Option<Vec<u8>>,
    #[serde(rename = "FRAMEWORK")]
    pub framework: String,
}

impl LauncherEnv {
    pub fn for_request(request: &WindowRequest) -> Self {
        Self {
            app_interface_port: request.app_port,
            installed_app_id: request.installed_app_id.clone(),
            app_interface_token: Some(request.token.0.clone()),
            framework: "electron".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct SurfaceEntry {
    env: LauncherEnv,
    ui_dir: Option<PathBuf>,
}

#[derive(Debug)]
pub struct BridgeState {
    gate: Arc<CallAuthorizationGate>,
    surfaces: RwLock<HashMap<SurfaceId, SurfaceEntry>>,
    origins: Vec<HeaderValue>,
}

impl BridgeState {
    pub fn new(gate: Arc<CallAuthorizationGate>) -> Self {
        Self {
            gate,
            surfaces: RwLock::new(HashMap::new()),
            origins: Vec::new(),
        }
    }

    /// Browser origins allowed to call the bridge.
    pub fn with_origins(mut self, origins: impl IntoIterator<Item = String>) -> Self {
        for origin in origins {
            match HeaderValue::from_str(&origin) {
                Ok(value) => self.origins.push(value),
                Err(err) => tracing::warn!(origin = %origin, error = %err, "ignoring invalid ui origin"),
            }
        }
        self
    }

    pub fn origins(&self) -> &[HeaderValue] {
        &self.origins
    }

    /// Browser requests carry an `Origin`; only UI origins get through.
    fn check_origin(&self, headers: &HeaderMap) -> Result<(), SignRejection> {
        match headers.get(ORIGIN) {
            Some(origin) if !self.origins.contains(origin) => Err(SignRejection::ForeignOrigin {
                origin: String::from_utf8_lossy(origin.as_bytes()).into_owned(),
            }),
            _ => Ok(()),
        }
    }

    pub fn gate(&self) -> &Arc<CallAuthorizationGate> {
        &self.gate
    }

    async fn insert_surface(&self, surface: SurfaceId, request: &WindowRequest) {
        let ui_dir = match &request.ui_source {
            UiSource::Path(dir) => Some(dir.clone()),
            UiSource::Port(_) => None,
        };
        self.surfaces.write().await.insert(
            surface,
            SurfaceEntry {
                env: LauncherEnv::for_request(request),
                ui_dir,
            },
        );
    }

    /// Surface entry, only once the gate has a binding for it.
    async fn bound_entry(&self, surface: &SurfaceId) -> Result<SurfaceEntry, SignRejection> {
        let unbound = || SignRejection::UnboundSurface {
            surface: surface.to_string(),
        };
        if !self.gate.is_bound(surface).await {
            return Err(unbound());
        }
        self.surfaces
            .read()
            .await
            .get(surface)
            .cloned()
            .ok_or_else(unbound)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Spin(#[from] SpinError),
}

impl From<SignRejection> for ApiError {
    fn from(rejection: SignRejection) -> Self {
        Self::Spin(SpinError::Rejected(rejection))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem = match &self {
            ApiError::Spin(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

/// Origins a UI may be served from: the bridge itself and, for a dev
/// server, `localhost:<ui-port>`.
pub fn ui_origins(ui_source: &UiSource, bridge: SocketAddr) -> Vec<String> {
    let mut ports = vec![bridge.port()];
    if let UiSource::Port(ui_port) = ui_source {
        ports.push(*ui_port);
    }
    ports
        .into_iter()
        .flat_map(|port| [format!("http://localhost:{port}"), format!("http://127.0.0.1:{port}")])
        .collect()
}

pub fn build_router(state: Arc<BridgeState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(state.origins().to_vec()))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE]);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request<_>| {
            tracing::info_span!("http.request", method = %req.method(), uri = %req.uri())
        })
        .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
            tracing::info!(
                parent: span,
                status = %res.status(),
                latency_ms = latency.as_millis()
            );
        });

    Router::new()
        .route("/surfaces/:surface/sign-zome-call", post(sign_zome_call))
        .route("/surfaces/:surface/env", get(surface_env))
        .route("/surfaces/:surface/ui/*path", get(surface_ui))
        .with_state(state)
        .layer(cors)
        .layer(trace_layer)
}

async fn sign_zome_call(
    State(state): State<Arc<BridgeState>>,
    Path(surface): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ZomeCallRequest>,
) -> Result<Json<SignedZomeCall>, ApiError> {
    state.check_origin(&headers)?;
    let surface = SurfaceId::new(surface);
    let signed = state.gate.authorize_and_sign(&surface, request).await?;
    Ok(Json(signed))
}

async fn surface_env(
    State(state): State<Arc<BridgeState>>,
    Path(surface): Path<String>,
    headers: HeaderMap,
) -> Result<Json<LauncherEnv>, ApiError> {
    state.check_origin(&headers)?;
    let entry = state.bound_entry(&SurfaceId::new(surface)).await?;
    Ok(Json(entry.env))
}

async fn surface_ui(
    State(state): State<Arc<BridgeState>>,
    Path((surface, _path)): Path<(String, String)>,
    mut req: Request,
) -> Result<Response, ApiError> {
    let entry = state.bound_entry(&SurfaceId::new(surface.as_str())).await?;
    let Some(dir) = entry.ui_dir else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };

    let prefix = format!("/surfaces/{surface}/ui");
    let rest = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .and_then(|pq| pq.strip_prefix(prefix.as_str()))
        .filter(|rest| rest.starts_with('/'))
        .unwrap_or("/")
        .to_string();
    *req.uri_mut() = Uri::builder()
        .path_and_query(rest)
        .build()
        .map_err(|err| SpinError::StreamError {
            message: format!("invalid ui path: {err}"),
        })?;

    let response = match ServeDir::new(dir).oneshot(req).await {
        Ok(response) => response,
        Err(never) => match never {},
    };
    Ok(response.map(Body::new))
}

/// The running bridge server.
#[derive(Debug)]
pub struct Bridge {
    addr: SocketAddr,
    state: Arc<BridgeState>,
    task: JoinHandle<()>,
}

impl Bridge {
    /// Binds 127.0.0.1:`port` (0 picks a free port) and starts serving.
    pub async fn start(
        port: u16,
        gate: Arc<CallAuthorizationGate>,
        ui_source: &UiSource,
    ) -> Result<Self, SpinError> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(BridgeState::new(gate).with_origins(ui_origins(ui_source, addr)));
        let router = build_router(state.clone());
        tracing::info!(addr = %addr, "ui bridge listening");
        let task = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router).await {
                tracing::error!(error = %err, "ui bridge stopped");
            }
        });
        Ok(Self { addr, state, task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> Arc<BridgeState> {
        self.state.clone()
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

/// Command that opens a URL in the user's browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opener {
    pub program: String,
    pub args: Vec<String>,
}

impl Opener {
    pub fn platform() -> Self {
        if cfg!(target_os = "windows") {
            Self {
                program: "cmd".to_string(),
                args: vec!["/C".to_string(), "start".to_string(), String::new()],
            }
        } else if cfg!(target_os = "macos") {
            Self {
                program: "open".to_string(),
                args: Vec::new(),
            }
        } else {
            Self {
                program: "xdg-open".to_string(),
                args: Vec::new(),
            }
        }
    }
}

/// Window host that shows each surface as a browser tab served through the bridge.
#[derive(Debug)]
pub struct BrowserWindowHost {
    state: Arc<BridgeState>,
    bridge_addr: SocketAddr,
    opener: Option<Opener>,
    http: reqwest::Client,
}

impl BrowserWindowHost {
    /// `opener: None` only logs the URL of each window.
    pub fn new(bridge: &Bridge, opener: Option<Opener>) -> Self {
        Self::with_state(bridge.state(), bridge.addr(), opener)
    }

    pub fn with_state(state: Arc<BridgeState>, bridge_addr: SocketAddr, opener: Option<Opener>) -> Self {
        Self {
            state,
            bridge_addr,
            opener,
            http: reqwest::Client::new(),
        }
    }

    pub fn surface_url(&self, surface: &SurfaceId, source: &UiSource) -> String {
        let port = self.bridge_addr.port();
        match source {
            UiSource::Port(ui_port) => {
                let base = format!("http://localhost:{ui_port}/");
                let bridge = format!("http://127.0.0.1:{port}/surfaces/{surface}");
                match Url::parse_with_params(&base, [(BRIDGE_QUERY_PARAM, bridge.as_str())]) {
                    Ok(url) => url.to_string(),
                    Err(_) => format!("{base}?{BRIDGE_QUERY_PARAM}={bridge}"),
                }
            }
            UiSource::Path(_) => {
                format!("http://127.0.0.1:{port}/surfaces/{surface}/ui/index.html")
            }
        }
    }

    async fn check_dev_server(&self, ui_port: u16) {
        let url = format!("http://localhost:{ui_port}/index.html");
        let reply = self.http.get(&url).timeout(DEV_SERVER_CHECK_TIMEOUT).send().await;
        match reply {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                tracing::warn!(url = %url, status = %response.status(), "ui dev server answered with an error");
            }
            Err(err) => {
                tracing::warn!(url = %url, error = %err, "ui dev server is not reachable");
            }
        }
    }

    async fn open(&self, url: &str) -> Result<(), SpinError> {
        let Some(opener) = &self.opener else {
            tracing::info!(url = %url, "window ready");
            return Ok(());
        };
        let status = tokio::process::Command::new(&opener.program)
            .args(&opener.args)
            .arg(url)
            .status()
            .await
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    SpinError::ExecutableNotFound {
                        program: opener.program.clone(),
                    }
                } else {
                    SpinError::SpawnFailed {
                        program: opener.program.clone(),
                        message: err.to_string(),
                    }
                }
            })?;
        if !status.success() {
            tracing::warn!(program = %opener.program, status = %status, url = %url, "browser opener failed");
        }
        Ok(())
    }
}

#[async_trait]
impl WindowHost for BrowserWindowHost {
    async fn create_window(&self, request: WindowRequest) -> Result<PendingWindow, SpinError> {
        let surface = SurfaceId::random();
        self.state.insert_surface(surface.clone(), &request).await;
        tracing::info!(surface = %surface, title = %request.title, "created window");
        Ok(PendingWindow::new(surface, request))
    }

    async fn load_window(&self, window: RegisteredWindow) -> Result<(), SpinError> {
        let request = window.request();
        if let UiSource::Port(ui_port) = request.ui_source {
            self.check_dev_server(ui_port).await;
        }
        if request.open_devtools {
            tracing::info!(surface = %window.surface(), "devtools are opened from the browser");
        }
        let url = self.surface_url(window.surface(), &request.ui_source);
        tracing::info!(surface = %window.surface(), title = %request.title, url = %url, "loading window");
        self.open(&url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conductor::AppAuthToken;

    fn host() -> BrowserWindowHost {
        let state = Arc::new(BridgeState::new(CallAuthorizationGate::shared()));
        BrowserWindowHost::with_state(state, "127.0.0.1:8888".parse().unwrap(), None)
    }

    #[test]
    fn test_surface_urls() {
        let host = host();
        let surface = SurfaceId::new("abc");
        assert_eq!(
            host.surface_url(&surface, &UiSource::Port(5173)),
            "http://localhost:5173/?hc-spin-bridge=http%3A%2F%2F127.0.0.1%3A8888%2Fsurfaces%2Fabc"
        );
        assert_eq!(
            host.surface_url(&surface, &UiSource::Path(PathBuf::from("/tmp/ui"))),
            "http://127.0.0.1:8888/surfaces/abc/ui/index.html"
        );
    }

    #[test]
    fn test_env_field_names() {
        let env = LauncherEnv::for_request(&WindowRequest {
            agent: 2,
            title: "Agent 2 - forum".to_string(),
            installed_app_id: "forum-agent-2".to_string(),
            app_port: 4100,
            token: AppAuthToken(vec![7, 8]),
            ui_source: UiSource::Port(5173),
            open_devtools: false,
        });
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["APP_INTERFACE_PORT"], 4100);
        assert_eq!(json["INSTALLED_APP_ID"], "forum-agent-2");
        assert_eq!(json["APP_INTERFACE_TOKEN"], serde_json::json!([7, 8]));
        assert_eq!(json["FRAMEWORK"], "electron");
    }

    #[test]
    fn test_rejection_status_codes() {
        let response = ApiError::from(SignRejection::UnauthorizedAgent).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let response = ApiError::from(SignRejection::MissingProvenance).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let response = ApiError::from(SignRejection::SignerNotReady).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
