//! Signing capability backed by a conductor's lair keystore.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lair_keystore_api::dependencies::sodoken;
use lair_keystore_api::ipc_keystore::ipc_keystore_connect;
use lair_keystore_api::prelude::{Ed25519PubKey, LairClient};
use url::Url;

use hc_spin_error::{SignRejection, SpinError};

use crate::conductor::AgentPubKey;

pub const SIGNATURE_LEN: usize = 64;

/// Produces signatures over zome call hashes for agents in one keystore.
#[async_trait]
pub trait ZomeCallSigner: Send + Sync {
    fn is_ready(&self) -> bool;

    /// Signs `hash` (SHA-512 of the encoded call) as `agent`.
    async fn sign(&self, hash: &[u8], agent: &AgentPubKey) -> Result<Vec<u8>, SignRejection>;
}

pub type SharedSigner = Arc<dyn ZomeCallSigner>;

/// Opens a signer for a keystore connection URL.
#[async_trait]
pub trait SignerConnector: Send + Sync {
    async fn connect(&self, keystore_url: &str) -> Result<SharedSigner, SpinError>;
}

/// Lair's key type for an agent, which must be a 39-byte ed25519 agent key.
pub fn lair_pub_key(agent: &AgentPubKey) -> Result<Ed25519PubKey, SignRejection> {
    agent
        .ed25519_bytes()
        .map(Ed25519PubKey::from)
        .ok_or_else(|| SignRejection::Signing {
            message: format!("{agent} is not an ed25519 agent key"),
        })
}

/// Parses a keystore connection URL as scraped from `conductor-config.yaml`.
pub fn parse_keystore_url(keystore_url: &str) -> Result<Url, SpinError> {
    Url::parse(keystore_url).map_err(|err| {
        SpinError::invalid_config(format!("invalid keystore url `{keystore_url}`: {err}"))
    })
}

/// [`ZomeCallSigner`] holding an open lair client connection.
pub struct LairSigner {
    keystore_url: Url,
    client: LairClient,
    timeout: Duration,
}

impl LairSigner {
    pub async fn connect(
        keystore_url: &str,
        passphrase: &str,
        timeout: Duration,
    ) -> Result<Self, SpinError> {
        let url = parse_keystore_url(keystore_url)?;
        let passphrase = Arc::new(Mutex::new(sodoken::LockedArray::from(
            passphrase.as_bytes().to_vec(),
        )));
        let client = match tokio::time::timeout(timeout, ipc_keystore_connect(url.clone(), passphrase)).await {
            Ok(Ok(client)) => client,
            Ok(Err(err)) => return Err(SpinError::rpc("keystore connect", err)),
            Err(_) => {
                return Err(SpinError::Timeout {
                    what: format!("keystore at {url}"),
                    secs: timeout.as_secs(),
                })
            }
        };
        tracing::info!(keystore_url = %url, "connected to keystore");
        Ok(Self {
            keystore_url: url,
            client,
            timeout,
        })
    }

    pub fn keystore_url(&self) -> &Url {
        &self.keystore_url
    }
}

#[async_trait]
impl ZomeCallSigner for LairSigner {
    fn is_ready(&self) -> bool {
        true
    }

    async fn sign(&self, hash: &[u8], agent: &AgentPubKey) -> Result<Vec<u8>, SignRejection> {
        let pub_key = lair_pub_key(agent)?;
        let data: Arc<[u8]> = Arc::from(hash);
        let signing = self.client.sign_by_pub_key(pub_key, None, data);
        let signature = match tokio::time::timeout(self.timeout, signing).await {
            Ok(Ok(signature)) => signature,
            Ok(Err(err)) => {
                return Err(SignRejection::Signing {
                    message: err.to_string(),
                })
            }
            Err(_) => {
                return Err(SignRejection::Signing {
                    message: format!("keystore did not answer within {}s", self.timeout.as_secs()),
                })
            }
        };
        let signature = signature.to_vec();
        if signature.len() != SIGNATURE_LEN {
            return Err(SignRejection::Signing {
                message: format!("signature has {} bytes, expected {SIGNATURE_LEN}", signature.len()),
            });
        }
        Ok(signature)
    }
}

/// Opens one [`LairSigner`] per keystore URL.
#[derive(Debug, Clone)]
pub struct LairSignerConnector {
    passphrase: String,
    timeout: Duration,
}

impl LairSignerConnector {
    pub fn new(passphrase: impl Into<String>, timeout: Duration) -> Self {
        Self {
            passphrase: passphrase.into(),
            timeout,
        }
    }
}

#[async_trait]
impl SignerConnector for LairSignerConnector {
    async fn connect(&self, keystore_url: &str) -> Result<SharedSigner, SpinError> {
        let signer = LairSigner::connect(keystore_url, &self.passphrase, self.timeout).await?;
        Ok(Arc::new(signer))
    }
}
