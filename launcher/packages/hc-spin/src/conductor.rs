//! Admin and app interfaces of a running conductor, as used by the launcher.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use hc_spin_error::SpinError;

use crate::zome_call::SignedZomeCall;

/// Length of an agent public key: 3 prefix bytes, 32 key bytes, 4 location bytes.
pub const AGENT_PUB_KEY_LEN: usize = 39;
pub const AGENT_PUB_KEY_PREFIX: [u8; 3] = [0x84, 0x20, 0x24];

#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentPubKey(#[serde(with = "serde_bytes")] Vec<u8>);

impl AgentPubKey {
    pub fn from_raw_39(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Wraps a raw 32-byte ed25519 key, adding prefix and location bytes.
    pub fn from_ed25519(key: [u8; 32]) -> Self {
        let mut bytes = Vec::with_capacity(AGENT_PUB_KEY_LEN);
        bytes.extend_from_slice(&AGENT_PUB_KEY_PREFIX);
        bytes.extend_from_slice(&key);
        bytes.extend_from_slice(&location_bytes(&key));
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The 32 key bytes, when this is a well-formed agent key.
    pub fn ed25519_bytes(&self) -> Option<[u8; 32]> {
        if self.0.len() != AGENT_PUB_KEY_LEN || self.0[..3] != AGENT_PUB_KEY_PREFIX {
            return None;
        }
        self.0[3..35].try_into().ok()
    }
}

fn location_bytes(key: &[u8; 32]) -> [u8; 4] {
    let mut loc = [0u8; 4];
    for (i, byte) in key.iter().enumerate() {
        loc[i % 4] ^= byte;
    }
    loc
}

impl fmt::Debug for AgentPubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentPubKey({self})")
    }
}

impl fmt::Display for AgentPubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DnaHash(#[serde(with = "serde_bytes")] pub Vec<u8>);

/// `[dna_hash, agent_pub_key]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellId(pub DnaHash, pub AgentPubKey);

/// Token an app interface accepts when a client authenticates.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppAuthToken(#[serde(deserialize_with = "serde_bytes::deserialize")] pub Vec<u8>);

impl fmt::Debug for AppAuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AppAuthToken(<{} bytes>)", self.0.len())
    }
}

/// Subset of the conductor's app info that the launcher reads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    pub installed_app_id: String,
    pub agent_pub_key: AgentPubKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallApp {
    pub happ_path: PathBuf,
    pub agent_key: AgentPubKey,
    pub installed_app_id: String,
    pub network_seed: Option<String>,
}

/// One app installed for one agent, ready to get a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInstallation {
    pub agent: usize,
    pub installed_app_id: String,
    pub agent_pub_key: AgentPubKey,
    pub app_port: u16,
    pub token: AppAuthToken,
}

/// Control-plane calls against a conductor's admin interface.
#[async_trait]
pub trait AdminApi: Send + Sync {
    async fn generate_agent_pub_key(&self) -> Result<AgentPubKey, SpinError>;
    async fn install_app(&self, request: InstallApp) -> Result<AppInfo, SpinError>;
    async fn enable_app(&self, installed_app_id: &str) -> Result<(), SpinError>;
    /// Attaches a new app interface and returns the port it listens on.
    async fn attach_app_interface(&self, installed_app_id: &str) -> Result<u16, SpinError>;
    async fn issue_app_token(&self, installed_app_id: &str) -> Result<AppAuthToken, SpinError>;
    async fn list_apps(&self) -> Result<Vec<AppInfo>, SpinError>;
    async fn close(&self) -> Result<(), SpinError>;
}

/// Data-plane calls against an authenticated app interface.
#[async_trait]
pub trait AppApi: Send + Sync {
    async fn app_info(&self) -> Result<Option<AppInfo>, SpinError>;
    /// Sends an already signed zome call and returns the encoded result.
    async fn call_zome(&self, call: SignedZomeCall) -> Result<Vec<u8>, SpinError>;
    async fn close(&self) -> Result<(), SpinError>;
}

/// Opens admin and app connections to conductors on localhost.
#[async_trait]
pub trait ConductorConnector: Send + Sync {
    async fn connect_admin(&self, port: u16) -> Result<Box<dyn AdminApi>, SpinError>;
    async fn connect_app(&self, port: u16, token: &AppAuthToken) -> Result<Box<dyn AppApi>, SpinError>;
}
