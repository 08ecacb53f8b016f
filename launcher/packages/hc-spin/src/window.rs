//! UI windows and the states they move through.
//!
//! A window host creates a [`PendingWindow`], which cannot load anything.
//! Only [`crate::gate::CallAuthorizationGate::register`] turns it into a
//! [`RegisteredWindow`], and only a registered window can be loaded. A window
//! therefore never shows content before its agent binding exists.

use std::fmt;

use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use hc_spin_error::SpinError;

use crate::conductor::AppAuthToken;
use crate::launch::UiSource;

/// Opaque handle of one UI surface
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SurfaceId(String);

impl SurfaceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// 128 random bits, hex encoded.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes.iter().map(|b| format!("{b:02x}")).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a window needs to show one agent's UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRequest {
    pub agent: usize,
    pub title: String,
    pub installed_app_id: String,
    pub app_port: u16,
    pub token: AppAuthToken,
    pub ui_source: UiSource,
    pub open_devtools: bool,
}

/// A created window that is not yet allowed to load content.
#[derive(Debug)]
pub struct PendingWindow {
    surface: SurfaceId,
    request: WindowRequest,
}

impl PendingWindow {
    pub fn new(surface: SurfaceId, request: WindowRequest) -> Self {
        Self { surface, request }
    }

    pub fn surface(&self) -> &SurfaceId {
        &self.surface
    }

    pub fn request(&self) -> &WindowRequest {
        &self.request
    }
}

/// A window whose surface has an agent binding and may now load.
#[derive(Debug)]
pub struct RegisteredWindow {
    surface: SurfaceId,
    request: WindowRequest,
}

impl RegisteredWindow {
    pub(crate) fn from_pending(pending: PendingWindow) -> Self {
        Self {
            surface: pending.surface,
            request: pending.request,
        }
    }

    pub fn surface(&self) -> &SurfaceId {
        &self.surface
    }

    pub fn request(&self) -> &WindowRequest {
        &self.request
    }
}

/// Creates and loads UI windows.
#[async_trait]
pub trait WindowHost: Send + Sync {
    async fn create_window(&self, request: WindowRequest) -> Result<PendingWindow, SpinError>;

    async fn load_window(&self, window: RegisteredWindow) -> Result<(), SpinError>;
}
