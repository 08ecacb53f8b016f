//! Error types shared by the hc-spin launcher crates.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Exit code used when the launch configuration is rejected before anything is spawned.
pub const CONFIG_EXIT_CODE: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidConfig,
    ExecutableNotFound,
    SpawnFailed,
    ProcessExited,
    MalformedMarker,
    Timeout,
    StreamError,
    Rpc,
    Bundle,
    Io,
    Rejected,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidConfig => "urn:hc-spin:error:invalid_config",
            Self::ExecutableNotFound => "urn:hc-spin:error:executable_not_found",
            Self::SpawnFailed => "urn:hc-spin:error:spawn_failed",
            Self::ProcessExited => "urn:hc-spin:error:process_exited",
            Self::MalformedMarker => "urn:hc-spin:error:malformed_marker",
            Self::Timeout => "urn:hc-spin:error:timeout",
            Self::StreamError => "urn:hc-spin:error:stream_error",
            Self::Rpc => "urn:hc-spin:error:rpc",
            Self::Bundle => "urn:hc-spin:error:bundle",
            Self::Io => "urn:hc-spin:error:io",
            Self::Rejected => "urn:hc-spin:error:sign_rejected",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidConfig => "Invalid Configuration",
            Self::ExecutableNotFound => "Executable Not Found",
            Self::SpawnFailed => "Spawn Failed",
            Self::ProcessExited => "Process Exited",
            Self::MalformedMarker => "Malformed Marker",
            Self::Timeout => "Timed Out",
            Self::StreamError => "Stream Error",
            Self::Rpc => "Conductor Call Failed",
            Self::Bundle => "Bundle Error",
            Self::Io => "I/O Error",
            Self::Rejected => "Sign Request Rejected",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidConfig => 400,
            Self::Rejected => 403,
            Self::Timeout => 504,
            Self::Rpc => 502,
            _ => 500,
        }
    }
}

/// RFC 7807 problem body returned by the UI bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Reasons a sign request from a UI surface is refused.
///
/// The `Display` text is what the requesting surface receives, so it is part
/// of the surface-facing contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignRejection {
    #[error("Call zome request has provenance field not set. This should be set by the js-client.")]
    MissingProvenance,
    #[error("Agent public key unauthorized.")]
    UnauthorizedAgent,
    #[error("Surface {surface} is not bound to any agent.")]
    UnboundSurface { surface: String },
    #[error("Zome call signer is not ready yet.")]
    SignerNotReady,
    #[error("Surface {surface} is already bound to an agent.")]
    AlreadyBound { surface: String },
    #[error("Failed to sign zome call: {message}")]
    Signing { message: String },
    #[error("Origin {origin} may not use this surface.")]
    ForeignOrigin { origin: String },
}

impl SignRejection {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::MissingProvenance => 400,
            Self::UnauthorizedAgent | Self::UnboundSurface { .. } | Self::ForeignOrigin { .. } => {
                403
            }
            Self::AlreadyBound { .. } => 409,
            Self::SignerNotReady => 503,
            Self::Signing { .. } => 502,
        }
    }
}

#[derive(Debug, Error)]
pub enum SpinError {
    #[error("invalid launch configuration: {message}")]
    InvalidConfig { message: String },
    #[error("executable not found: {program}")]
    ExecutableNotFound { program: String },
    #[error("failed to spawn {program}: {message}")]
    SpawnFailed { program: String, message: String },
    #[error("{process} exited before it was ready ({status})")]
    ProcessExited {
        process: String,
        status: String,
        exit_code: Option<i32>,
    },
    #[error("{process} printed a malformed {marker} marker: {message}")]
    MalformedMarker {
        process: String,
        marker: String,
        message: String,
    },
    #[error("timed out after {secs}s waiting for {what}")]
    Timeout { what: String, secs: u64 },
    #[error("stream error: {message}")]
    StreamError { message: String },
    #[error("conductor call `{call}` failed: {message}")]
    Rpc { call: String, message: String },
    #[error("bundle error: {message}")]
    Bundle { message: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Rejected(#[from] SignRejection),
}

impl SpinError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidConfig { .. } => ErrorType::InvalidConfig,
            Self::ExecutableNotFound { .. } => ErrorType::ExecutableNotFound,
            Self::SpawnFailed { .. } => ErrorType::SpawnFailed,
            Self::ProcessExited { .. } => ErrorType::ProcessExited,
            Self::MalformedMarker { .. } => ErrorType::MalformedMarker,
            Self::Timeout { .. } => ErrorType::Timeout,
            Self::StreamError { .. } => ErrorType::StreamError,
            Self::Rpc { .. } => ErrorType::Rpc,
            Self::Bundle { .. } => ErrorType::Bundle,
            Self::Io(_) => ErrorType::Io,
            Self::Rejected(_) => ErrorType::Rejected,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let error_type = self.error_type();
        let status = match self {
            Self::Rejected(rejection) => rejection.status_code(),
            _ => error_type.status_code(),
        };
        ProblemDetails {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status,
            detail: Some(self.to_string()),
        }
    }

    /// Process exit code for a launcher that stops on this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidConfig { .. } => CONFIG_EXIT_CODE,
            Self::ProcessExited {
                exit_code: Some(code),
                ..
            } if *code != 0 => *code,
            _ => 1,
        }
    }

    pub fn rpc(call: impl Into<String>, message: impl ToString) -> Self {
        Self::Rpc {
            call: call.into(),
            message: message.to_string(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}
