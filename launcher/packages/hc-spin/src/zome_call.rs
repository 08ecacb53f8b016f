//! Canonical zome call payload that gets hashed and signed.

use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use time::OffsetDateTime;

use hc_spin_error::{SignRejection, SpinError};

use crate::conductor::{AgentPubKey, CellId};

/// How long a signed call stays valid
pub const CALL_EXPIRY: Duration = Duration::from_secs(5 * 60);
pub const NONCE_LEN: usize = 32;

/// Unsigned zome call as a UI surface submits it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZomeCallRequest {
    pub cell_id: CellId,
    pub zome_name: String,
    pub fn_name: String,
    /// Call arguments, msgpack-encoded before signing
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Arguments the client already msgpack-encoded. Used verbatim instead
    /// of `payload`, so binary arguments stay `bin`.
    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub encoded_payload: Option<Vec<u8>>,
    #[serde(default)]
    pub provenance: Option<AgentPubKey>,
}

/// The exact structure whose encoding is hashed and signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZomeCallParams {
    pub cell_id: CellId,
    pub zome_name: String,
    pub fn_name: String,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    pub provenance: AgentPubKey,
    #[serde(with = "serde_bytes")]
    pub nonce: Vec<u8>,
    /// Microseconds since the unix epoch
    pub expires_at: i64,
}

/// Encoded call plus the signature over its hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedZomeCall {
    #[serde(with = "serde_bytes")]
    pub bytes: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

/// Encoded params ready to be handed to a signer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedCall {
    pub bytes: Vec<u8>,
    pub hash: Vec<u8>,
}

impl PreparedCall {
    pub fn into_signed(self, signature: Vec<u8>) -> SignedZomeCall {
        SignedZomeCall {
            bytes: self.bytes,
            signature,
        }
    }
}

pub fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Expiry timestamp in microseconds, `CALL_EXPIRY` from now.
pub fn expiry_from_now() -> i64 {
    let now_micros = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000;
    (now_micros + CALL_EXPIRY.as_micros() as i128) as i64
}

pub fn hash_bytes(bytes: &[u8]) -> Vec<u8> {
    Sha512::digest(bytes).to_vec()
}

/// Builds and encodes the params for `request` with a fresh nonce and expiry.
pub fn prepare(request: &ZomeCallRequest) -> Result<PreparedCall, SpinError> {
    prepare_with(request, random_nonce(), expiry_from_now())
}

pub fn prepare_with(
    request: &ZomeCallRequest,
    nonce: [u8; NONCE_LEN],
    expires_at: i64,
) -> Result<PreparedCall, SpinError> {
    let provenance = request
        .provenance
        .clone()
        .ok_or(SignRejection::MissingProvenance)?;
    let payload = match &request.encoded_payload {
        Some(encoded) => encoded.clone(),
        None => rmp_serde::to_vec_named(&request.payload).map_err(|err| SignRejection::Signing {
            message: format!("failed to encode call payload: {err}"),
        })?,
    };
    let params = ZomeCallParams {
        cell_id: request.cell_id.clone(),
        zome_name: request.zome_name.clone(),
        fn_name: request.fn_name.clone(),
        payload,
        provenance,
        nonce: nonce.to_vec(),
        expires_at,
    };
    let bytes = rmp_serde::to_vec_named(&params).map_err(|err| SignRejection::Signing {
        message: format!("failed to encode zome call: {err}"),
    })?;
    let hash = hash_bytes(&bytes);
    Ok(PreparedCall { bytes, hash })
}
