mod common;

use std::sync::Arc;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use hc_spin::conductor::{AgentPubKey, AppAuthToken, CellId, DnaHash};
use hc_spin::gate::CallAuthorizationGate;
use hc_spin::launch::UiSource;
use hc_spin::window::{PendingWindow, SurfaceId, WindowRequest};
use hc_spin::zome_call::{self, ZomeCallParams, ZomeCallRequest, NONCE_LEN};
use hc_spin_error::SignRejection;

use common::CountingSigner;

fn pending(surface: &str) -> PendingWindow {
    PendingWindow::new(
        SurfaceId::new(surface),
        WindowRequest {
            agent: 1,
            title: "Agent 1 - forum".to_string(),
            installed_app_id: "forum".to_string(),
            app_port: 4000,
            token: AppAuthToken(vec![1, 2, 3]),
            ui_source: UiSource::Port(5173),
            open_devtools: false,
        },
    )
}

fn request(provenance: Option<AgentPubKey>) -> ZomeCallRequest {
    ZomeCallRequest {
        cell_id: CellId(DnaHash(vec![7u8; 39]), AgentPubKey::from_ed25519([5u8; 32])),
        zome_name: "posts".to_string(),
        fn_name: "create_post".to_string(),
        payload: serde_json::json!({"title": "hello", "tags": ["a", "b"]}),
        encoded_payload: None,
        provenance,
    }
}

#[tokio::test]
async fn signed_envelope_verifies_under_bound_agent() {
    let gate = CallAuthorizationGate::new();
    let signer = Arc::new(CountingSigner::default());
    let agent = signer.agent_for(11);
    gate.register(pending("window"), agent.clone(), signer.clone())
        .await
        .unwrap();

    let signed = gate
        .authorize_and_sign(&SurfaceId::new("window"), request(Some(agent.clone())))
        .await
        .unwrap();
    assert_eq!(signer.calls(), 1);

    let key = VerifyingKey::from_bytes(&agent.ed25519_bytes().unwrap()).unwrap();
    let signature = Signature::from_slice(&signed.signature).unwrap();
    key.verify(&zome_call::hash_bytes(&signed.bytes), &signature)
        .unwrap();

    let params: ZomeCallParams = rmp_serde::from_slice(&signed.bytes).unwrap();
    assert_eq!(params.provenance, agent);
    assert_eq!(params.fn_name, "create_post");
    assert_eq!(params.nonce.len(), NONCE_LEN);
    assert!(params.expires_at > zome_call::expiry_from_now() - 60_000_000);
}

#[tokio::test]
async fn any_single_byte_difference_is_rejected() {
    let gate = CallAuthorizationGate::new();
    let signer = Arc::new(CountingSigner::default());
    let agent = signer.agent_for(3);
    gate.register(pending("window"), agent.clone(), signer.clone())
        .await
        .unwrap();

    for idx in 0..agent.as_bytes().len() {
        let mut bytes = agent.as_bytes().to_vec();
        bytes[idx] = bytes[idx].wrapping_add(1);
        let err = gate
            .authorize_and_sign(
                &SurfaceId::new("window"),
                request(Some(AgentPubKey::from_raw_39(bytes))),
            )
            .await
            .unwrap_err();
        assert_eq!(err, SignRejection::UnauthorizedAgent, "byte {idx}");
    }
    assert_eq!(signer.calls(), 0);
}

#[tokio::test]
async fn unbound_and_missing_identity_fail_closed() {
    let gate = CallAuthorizationGate::new();
    let signer = Arc::new(CountingSigner::default());
    let agent = signer.agent_for(4);

    let err = gate
        .authorize_and_sign(&SurfaceId::new("window"), request(Some(agent.clone())))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        SignRejection::UnboundSurface {
            surface: "window".to_string()
        }
    );

    gate.register(pending("window"), agent, signer.clone())
        .await
        .unwrap();
    let err = gate
        .authorize_and_sign(&SurfaceId::new("window"), request(None))
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Call zome request has provenance field not set. This should be set by the js-client."
    );
    assert_eq!(signer.calls(), 0);
}
