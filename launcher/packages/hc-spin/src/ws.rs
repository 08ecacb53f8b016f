//! Websocket client for conductor admin and app interfaces.
//!
//! Frames are msgpack-encoded [`WireMessage`]s. Requests and responses are
//! correlated by id; a background task routes every response frame to the
//! caller waiting on it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use hc_spin_error::SpinError;

use crate::conductor::{
    AdminApi, AgentPubKey, AppApi, AppAuthToken, AppInfo, ConductorConnector, InstallApp,
};
use crate::zome_call::SignedZomeCall;

/// Origin header the launcher identifies itself with
pub const ORIGIN: &str = "hc-spin";
/// Lifetime of app interface tokens issued for windows
pub const TOKEN_EXPIRY_SECONDS: u64 = 999_999;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingMap = Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<Result<Vec<u8>, String>>>>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    Authenticate {
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    Request {
        id: u64,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    Response {
        id: u64,
        #[serde(default)]
        data: Option<serde_bytes::ByteBuf>,
    },
    Signal {
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
enum BundleSource<'a> {
    Path(&'a std::path::Path),
}

#[derive(Debug, Serialize)]
struct InstallAppPayload<'a> {
    source: BundleSource<'a>,
    agent_key: &'a AgentPubKey,
    installed_app_id: &'a str,
    network_seed: Option<&'a str>,
    roles_settings: Option<()>,
    ignore_genesis_failure: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
enum AdminRequest<'a> {
    GenerateAgentPubKey,
    InstallApp(InstallAppPayload<'a>),
    EnableApp {
        installed_app_id: &'a str,
    },
    AttachAppInterface {
        port: Option<u16>,
        allowed_origins: &'a str,
        installed_app_id: Option<&'a str>,
    },
    IssueAppAuthenticationToken {
        installed_app_id: &'a str,
        expiry_seconds: u64,
        single_use: bool,
    },
    ListApps {
        status_filter: Option<()>,
    },
}

impl AdminRequest<'_> {
    fn name(&self) -> &'static str {
        match self {
            Self::GenerateAgentPubKey => "generate_agent_pub_key",
            Self::InstallApp(_) => "install_app",
            Self::EnableApp { .. } => "enable_app",
            Self::AttachAppInterface { .. } => "attach_app_interface",
            Self::IssueAppAuthenticationToken { .. } => "issue_app_authentication_token",
            Self::ListApps { .. } => "list_apps",
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
enum AppRequest<'a> {
    AppInfo,
    CallZome(&'a SignedZomeCall),
}

#[derive(Debug, Serialize)]
struct AuthenticatePayload<'a> {
    token: &'a [u8],
}

/// `{type, value}` envelope of every response
#[derive(Debug, Deserialize)]
struct Tagged<T> {
    #[serde(rename = "type")]
    kind: String,
    value: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ErrorValue {
    #[serde(rename = "type")]
    kind: String,
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AttachedInterface {
    port: u16,
}

#[derive(Debug, Deserialize)]
struct IssuedToken {
    token: AppAuthToken,
}

/// Decodes a `{type, value}` response, turning `error` responses and
/// unexpected types into [`SpinError::Rpc`].
fn decode_response<T: DeserializeOwned>(call: &str, expected: &str, data: &[u8]) -> Result<Option<T>, SpinError> {
    let head: Tagged<IgnoredAny> =
        rmp_serde::from_slice(data).map_err(|err| SpinError::rpc(call, format!("undecodable response: {err}")))?;
    if head.kind == "error" {
        let message = rmp_serde::from_slice::<Tagged<ErrorValue>>(data)
            .ok()
            .and_then(|tagged| tagged.value)
            .map(|err| match err.value {
                Some(value) => format!("{}: {}", err.kind, value),
                None => err.kind,
            })
            .unwrap_or_else(|| "conductor returned an error".to_string());
        return Err(SpinError::rpc(call, message));
    }
    if head.kind != expected {
        return Err(SpinError::rpc(
            call,
            format!("unexpected response type `{}`, wanted `{}`", head.kind, expected),
        ));
    }
    let tagged: Tagged<T> =
        rmp_serde::from_slice(data).map_err(|err| SpinError::rpc(call, format!("undecodable response: {err}")))?;
    Ok(tagged.value)
}

fn required<T>(call: &str, value: Option<T>) -> Result<T, SpinError> {
    value.ok_or_else(|| SpinError::rpc(call, "response carried no value"))
}

/// One websocket connection with request/response correlation.
struct WsClient {
    url: String,
    sink: Mutex<SplitSink<WsStream, Message>>,
    pending: PendingMap,
    next_id: AtomicU64,
    rpc_timeout: Duration,
    reader: JoinHandle<()>,
}

impl WsClient {
    async fn connect(port: u16, rpc_timeout: Duration) -> Result<Self, SpinError> {
        let url = format!("ws://localhost:{port}");
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| SpinError::rpc("connect", err))?;
        request
            .headers_mut()
            .insert("Origin", HeaderValue::from_static(ORIGIN));

        let (socket, _) = tokio::time::timeout(rpc_timeout, connect_async(request))
            .await
            .map_err(|_| SpinError::Timeout {
                what: format!("websocket connection to {url}"),
                secs: rpc_timeout.as_secs(),
            })?
            .map_err(|err| SpinError::rpc("connect", format!("{url}: {err}")))?;
        tracing::debug!(url = %url, "websocket connected");

        let (sink, mut stream) = socket.split();
        let pending: PendingMap = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let reader_pending = pending.clone();
        let reader_url = url.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let data = match frame {
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        tracing::warn!(url = %reader_url, error = %err, "websocket read failed");
                        break;
                    }
                };
                match rmp_serde::from_slice::<WireMessage>(&data) {
                    Ok(WireMessage::Response { id, data }) => {
                        let waiter = reader_pending.lock().ok().and_then(|mut map| map.remove(&id));
                        if let Some(waiter) = waiter {
                            let _ = waiter.send(Ok(data.map(|d| d.into_vec()).unwrap_or_default()));
                        }
                    }
                    Ok(WireMessage::Signal { .. }) => {}
                    Ok(other) => tracing::debug!(url = %reader_url, message = ?other, "ignoring websocket message"),
                    Err(err) => tracing::warn!(url = %reader_url, error = %err, "undecodable websocket frame"),
                }
            }
            if let Ok(mut map) = reader_pending.lock() {
                for (_, waiter) in map.drain() {
                    let _ = waiter.send(Err("connection closed".to_string()));
                }
            }
        });

        Ok(Self {
            url,
            sink: Mutex::new(sink),
            pending,
            next_id: AtomicU64::new(0),
            rpc_timeout,
            reader,
        })
    }

    async fn send_wire(&self, call: &str, message: &WireMessage) -> Result<(), SpinError> {
        let frame = rmp_serde::to_vec_named(message).map_err(|err| SpinError::rpc(call, err))?;
        self.sink
            .lock()
            .await
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|err| SpinError::rpc(call, err))
    }

    async fn request<R: Serialize>(&self, call: &str, request: &R) -> Result<Vec<u8>, SpinError> {
        let data = rmp_serde::to_vec_named(request).map_err(|err| SpinError::rpc(call, err))?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| SpinError::rpc(call, "request table poisoned"))?
            .insert(id, tx);

        if let Err(err) = self.send_wire(call, &WireMessage::Request { id, data }).await {
            self.forget(id);
            return Err(err);
        }

        match tokio::time::timeout(self.rpc_timeout, rx).await {
            Ok(Ok(Ok(data))) => Ok(data),
            Ok(Ok(Err(message))) => Err(SpinError::rpc(call, message)),
            Ok(Err(_)) => Err(SpinError::rpc(call, "connection closed")),
            Err(_) => {
                self.forget(id);
                Err(SpinError::Timeout {
                    what: format!("`{call}` response from {}", self.url),
                    secs: self.rpc_timeout.as_secs(),
                })
            }
        }
    }

    fn forget(&self, id: u64) {
        if let Ok(mut map) = self.pending.lock() {
            map.remove(&id);
        }
    }

    async fn close(&self) -> Result<(), SpinError> {
        let result = self.sink.lock().await.close().await;
        self.reader.abort();
        result.map_err(|err| SpinError::rpc("close", err))
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

pub struct WsAdmin {
    client: WsClient,
}

impl WsAdmin {
    async fn call<T: DeserializeOwned>(&self, request: AdminRequest<'_>, expected: &str) -> Result<Option<T>, SpinError> {
        let call = request.name();
        let data = self.client.request(call, &request).await?;
        decode_response(call, expected, &data)
    }
}

#[async_trait]
impl AdminApi for WsAdmin {
    async fn generate_agent_pub_key(&self) -> Result<AgentPubKey, SpinError> {
        let key = self
            .call(AdminRequest::GenerateAgentPubKey, "agent_pub_key_generated")
            .await?;
        required("generate_agent_pub_key", key)
    }

    async fn install_app(&self, request: InstallApp) -> Result<AppInfo, SpinError> {
        let payload = InstallAppPayload {
            source: BundleSource::Path(&request.happ_path),
            agent_key: &request.agent_key,
            installed_app_id: &request.installed_app_id,
            network_seed: request.network_seed.as_deref(),
            roles_settings: None,
            ignore_genesis_failure: false,
        };
        let info = self.call(AdminRequest::InstallApp(payload), "app_installed").await?;
        required("install_app", info)
    }

    async fn enable_app(&self, installed_app_id: &str) -> Result<(), SpinError> {
        self.call::<IgnoredAny>(AdminRequest::EnableApp { installed_app_id }, "app_enabled")
            .await?;
        Ok(())
    }

    async fn attach_app_interface(&self, installed_app_id: &str) -> Result<u16, SpinError> {
        let request = AdminRequest::AttachAppInterface {
            port: None,
            allowed_origins: "*",
            installed_app_id: Some(installed_app_id),
        };
        let attached: Option<AttachedInterface> = self.call(request, "app_interface_attached").await?;
        Ok(required("attach_app_interface", attached)?.port)
    }

    async fn issue_app_token(&self, installed_app_id: &str) -> Result<AppAuthToken, SpinError> {
        let request = AdminRequest::IssueAppAuthenticationToken {
            installed_app_id,
            expiry_seconds: TOKEN_EXPIRY_SECONDS,
            single_use: false,
        };
        let issued: Option<IssuedToken> = self
            .call(request, "app_authentication_token_issued")
            .await?;
        Ok(required("issue_app_authentication_token", issued)?.token)
    }

    async fn list_apps(&self) -> Result<Vec<AppInfo>, SpinError> {
        let apps = self
            .call(AdminRequest::ListApps { status_filter: None }, "apps_listed")
            .await?;
        Ok(apps.unwrap_or_default())
    }

    async fn close(&self) -> Result<(), SpinError> {
        self.client.close().await
    }
}

pub struct WsApp {
    client: WsClient,
}

#[async_trait]
impl AppApi for WsApp {
    async fn app_info(&self) -> Result<Option<AppInfo>, SpinError> {
        let data = self.client.request("app_info", &AppRequest::AppInfo).await?;
        decode_response("app_info", "app_info", &data)
    }

    async fn call_zome(&self, call: SignedZomeCall) -> Result<Vec<u8>, SpinError> {
        let data = self
            .client
            .request("call_zome", &AppRequest::CallZome(&call))
            .await?;
        let result: Option<serde_bytes::ByteBuf> = decode_response("call_zome", "zome_called", &data)?;
        Ok(result.map(|bytes| bytes.into_vec()).unwrap_or_default())
    }

    async fn close(&self) -> Result<(), SpinError> {
        self.client.close().await
    }
}

/// Connects to conductors on localhost over websockets.
#[derive(Debug, Clone)]
pub struct WsConductorConnector {
    rpc_timeout: Duration,
}

impl WsConductorConnector {
    pub fn new(rpc_timeout: Duration) -> Self {
        Self { rpc_timeout }
    }
}

#[async_trait]
impl ConductorConnector for WsConductorConnector {
    async fn connect_admin(&self, port: u16) -> Result<Box<dyn AdminApi>, SpinError> {
        let client = WsClient::connect(port, self.rpc_timeout).await?;
        Ok(Box::new(WsAdmin { client }))
    }

    async fn connect_app(&self, port: u16, token: &AppAuthToken) -> Result<Box<dyn AppApi>, SpinError> {
        let client = WsClient::connect(port, self.rpc_timeout).await?;
        let data = rmp_serde::to_vec_named(&AuthenticatePayload { token: &token.0 })
            .map_err(|err| SpinError::rpc("authenticate", err))?;
        client
            .send_wire("authenticate", &WireMessage::Authenticate { data })
            .await?;
        Ok(Box::new(WsApp { client }))
    }
}
