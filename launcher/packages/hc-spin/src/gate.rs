//! Call Authorization Gate - binds each UI surface to the one agent it was
//! created for and signs zome calls only on that agent's behalf.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use hc_spin_error::{SignRejection, SpinError};

use crate::conductor::AgentPubKey;
use crate::signer::SharedSigner;
use crate::window::{PendingWindow, RegisteredWindow, SurfaceId};
use crate::zome_call::{self, SignedZomeCall, ZomeCallRequest};

/// Identity and signing capability authorized for one surface
#[derive(Clone)]
pub struct WindowBinding {
    pub agent: AgentPubKey,
    pub signer: SharedSigner,
}

impl std::fmt::Debug for WindowBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowBinding")
            .field("agent", &self.agent)
            .field("signer_ready", &self.signer.is_ready())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct CallAuthorizationGate {
    bindings: RwLock<HashMap<SurfaceId, WindowBinding>>,
}

impl CallAuthorizationGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Binds the pending window's surface to `agent`, returning the window in
    /// a state that may load content. An existing binding is never replaced.
    pub async fn register(
        &self,
        window: PendingWindow,
        agent: AgentPubKey,
        signer: SharedSigner,
    ) -> Result<RegisteredWindow, SpinError> {
        let surface = window.surface().clone();
        let mut bindings = self.bindings.write().await;
        if bindings.contains_key(&surface) {
            tracing::warn!(surface = %surface, "refusing to rebind surface");
            return Err(SignRejection::AlreadyBound {
                surface: surface.to_string(),
            }
            .into());
        }
        tracing::info!(surface = %surface, agent = %agent, "registered window binding");
        bindings.insert(surface, WindowBinding { agent, signer });
        Ok(RegisteredWindow::from_pending(window))
    }

    pub async fn binding(&self, surface: &SurfaceId) -> Option<WindowBinding> {
        self.bindings.read().await.get(surface).cloned()
    }

    pub async fn is_bound(&self, surface: &SurfaceId) -> bool {
        self.bindings.read().await.contains_key(surface)
    }

    pub async fn len(&self) -> usize {
        self.bindings.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.bindings.read().await.is_empty()
    }

    /// Signs `request` for `surface` if its claimed provenance is exactly the
    /// bound agent. Nothing reaches the signer otherwise.
    pub async fn authorize_and_sign(
        &self,
        surface: &SurfaceId,
        request: ZomeCallRequest,
    ) -> Result<SignedZomeCall, SignRejection> {
        let result = self.check_and_sign(surface, request).await;
        if let Err(rejection) = &result {
            tracing::warn!(surface = %surface, reason = %rejection, "rejected sign request");
        }
        result
    }

    async fn check_and_sign(
        &self,
        surface: &SurfaceId,
        request: ZomeCallRequest,
    ) -> Result<SignedZomeCall, SignRejection> {
        let binding = self
            .binding(surface)
            .await
            .ok_or_else(|| SignRejection::UnboundSurface {
                surface: surface.to_string(),
            })?;
        let provenance = request
            .provenance
            .as_ref()
            .ok_or(SignRejection::MissingProvenance)?;
        if provenance.as_bytes() != binding.agent.as_bytes() {
            return Err(SignRejection::UnauthorizedAgent);
        }
        if !binding.signer.is_ready() {
            return Err(SignRejection::SignerNotReady);
        }

        let prepared = zome_call::prepare(&request).map_err(|err| match err {
            SpinError::Rejected(rejection) => rejection,
            other => SignRejection::Signing {
                message: other.to_string(),
            },
        })?;
        let signature = binding.signer.sign(&prepared.hash, &binding.agent).await?;
        Ok(prepared.into_signed(signature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::conductor::{AppAuthToken, CellId, DnaHash};
    use crate::launch::UiSource;
    use crate::signer::ZomeCallSigner;
    use crate::window::WindowRequest;

    #[derive(Default)]
    struct CountingSigner {
        calls: AtomicUsize,
        not_ready: bool,
    }

    #[async_trait]
    impl ZomeCallSigner for CountingSigner {
        fn is_ready(&self) -> bool {
            !self.not_ready
        }

        async fn sign(&self, hash: &[u8], _agent: &AgentPubKey) -> Result<Vec<u8>, SignRejection> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(hash[..64].to_vec())
        }
    }

    fn pending(surface: &str) -> PendingWindow {
        PendingWindow::new(
            SurfaceId::new(surface),
            WindowRequest {
                agent: 1,
                title: "Agent 1 - forum".to_string(),
                installed_app_id: "forum".to_string(),
                app_port: 4000,
                token: AppAuthToken(vec![1]),
                ui_source: UiSource::Port(5173),
                open_devtools: false,
            },
        )
    }

    fn call(provenance: Option<AgentPubKey>) -> ZomeCallRequest {
        ZomeCallRequest {
            cell_id: CellId(DnaHash(vec![0u8; 39]), AgentPubKey::from_ed25519([1u8; 32])),
            zome_name: "posts".to_string(),
            fn_name: "get_posts".to_string(),
            payload: serde_json::Value::Null,
            encoded_payload: None,
            provenance,
        }
    }

    #[tokio::test]
    async fn test_matching_agent_signs_once() {
        let gate = CallAuthorizationGate::new();
        let signer = Arc::new(CountingSigner::default());
        let agent = AgentPubKey::from_ed25519([1u8; 32]);
        let window = gate
            .register(pending("s1"), agent.clone(), signer.clone())
            .await
            .unwrap();
        assert_eq!(window.surface().as_str(), "s1");

        let signed = gate
            .authorize_and_sign(&SurfaceId::new("s1"), call(Some(agent)))
            .await
            .unwrap();
        assert_eq!(signer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(signed.signature, zome_call::hash_bytes(&signed.bytes));
    }

    #[tokio::test]
    async fn test_rejections_never_reach_signer() {
        let gate = CallAuthorizationGate::new();
        let signer = Arc::new(CountingSigner::default());
        let agent = AgentPubKey::from_ed25519([1u8; 32]);
        gate.register(pending("s1"), agent.clone(), signer.clone())
            .await
            .unwrap();

        let err = gate
            .authorize_and_sign(&SurfaceId::new("unknown"), call(Some(agent.clone())))
            .await
            .unwrap_err();
        assert!(matches!(err, SignRejection::UnboundSurface { .. }));

        let err = gate
            .authorize_and_sign(&SurfaceId::new("s1"), call(None))
            .await
            .unwrap_err();
        assert_eq!(err, SignRejection::MissingProvenance);

        let mut other = agent.as_bytes().to_vec();
        other[20] ^= 1;
        let err = gate
            .authorize_and_sign(&SurfaceId::new("s1"), call(Some(AgentPubKey::from_raw_39(other))))
            .await
            .unwrap_err();
        assert_eq!(err, SignRejection::UnauthorizedAgent);
        assert_eq!(err.to_string(), "Agent public key unauthorized.");

        assert_eq!(signer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_signer_not_ready() {
        let gate = CallAuthorizationGate::new();
        let signer = Arc::new(CountingSigner {
            not_ready: true,
            ..Default::default()
        });
        let agent = AgentPubKey::from_ed25519([1u8; 32]);
        gate.register(pending("s1"), agent.clone(), signer.clone())
            .await
            .unwrap();
        let err = gate
            .authorize_and_sign(&SurfaceId::new("s1"), call(Some(agent)))
            .await
            .unwrap_err();
        assert_eq!(err, SignRejection::SignerNotReady);
        assert_eq!(signer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_double_registration_keeps_first_binding() {
        let gate = CallAuthorizationGate::new();
        let signer: SharedSigner = Arc::new(CountingSigner::default());
        let first = AgentPubKey::from_ed25519([1u8; 32]);
        let second = AgentPubKey::from_ed25519([2u8; 32]);
        gate.register(pending("s1"), first.clone(), signer.clone())
            .await
            .unwrap();
        let err = gate
            .register(pending("s1"), second, signer)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SpinError::Rejected(SignRejection::AlreadyBound { .. })
        ));
        assert_eq!(gate.binding(&SurfaceId::new("s1")).await.unwrap().agent, first);
        assert_eq!(gate.len().await, 1);
    }
}
