mod common;

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::time::Duration;

use hc_spin::conductor::{CellId, DnaHash};
use hc_spin::launch::Topology;
use hc_spin::orchestrator::SessionEnd;
use hc_spin::sandbox::sandbox_args;
use hc_spin::supervisor::ChildExit;
use hc_spin::workdir::{ABANDONED_MARKER, ABANDONED_TEXT};
use hc_spin::zome_call::ZomeCallRequest;
use hc_spin_error::SignRejection;

use common::{harness, key_for_seed, FakeLauncher};

fn call_as(provenance: hc_spin::conductor::AgentPubKey) -> ZomeCallRequest {
    ZomeCallRequest {
        cell_id: CellId(DnaHash(vec![0u8; 39]), provenance.clone()),
        zome_name: "posts".to_string(),
        fn_name: "create_post".to_string(),
        payload: serde_json::json!({"title": "hi"}),
        encoded_payload: None,
        provenance: Some(provenance),
    }
}

#[tokio::test]
async fn conductor_per_agent_preallocates_distinct_ports() {
    let h = harness(3, false, FakeLauncher::default()).await;
    assert_eq!(h.session.request().topology, Topology::ConductorPerAgent);

    let agents = h.session.launch().await.unwrap();
    assert_eq!(agents.len(), 3);

    let plans = h.launcher.plans.lock().unwrap().clone();
    assert_eq!(plans.len(), 1, "all conductors are spawned in one batch");
    let ports = &plans[0].app_ports;
    assert_eq!(ports.len(), 3);
    assert!(ports.iter().all(|port| *port != 0));
    assert_eq!(ports.iter().collect::<HashSet<_>>().len(), 3);

    let app_ports: Vec<u16> = agents.iter().map(|agent| agent.installation.app_port).collect();
    assert_eq!(&app_ports, ports);

    let mut args = sandbox_args(&plans[0]);
    let joined = ports.iter().map(u16::to_string).collect::<Vec<_>>().join(",");
    for arg in args.iter_mut() {
        if *arg == joined {
            *arg = "<app-ports>".to_string();
        }
        if arg.ends_with("forum.happ") {
            *arg = "<happ>".to_string();
        }
    }
    insta::assert_debug_snapshot!(args, @r###"
    [
        "sandbox",
        "--piped",
        "generate",
        "--num-sandboxes",
        "3",
        "--app-id",
        "forum",
        "--run",
        "<app-ports>",
        "<happ>",
        "network",
        "--bootstrap",
        "http://127.0.0.1:3000",
        "quic",
        "http://127.0.0.1:3000",
    ]
    "###);

    let urls = h.signers.urls.lock().unwrap().clone();
    assert_eq!(
        urls,
        vec![
            "unix:///fake/keystore-1",
            "unix:///fake/keystore-2",
            "unix:///fake/keystore-3"
        ]
    );
}

#[tokio::test]
async fn single_conductor_installs_extra_agents_serially() {
    let h = harness(3, true, FakeLauncher::default()).await;
    let agents = h.session.launch().await.unwrap();

    let plans = h.launcher.plans.lock().unwrap().clone();
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].conductor_count(), 1, "exactly one conductor is spawned");
    assert_eq!(h.connector.admin_connections.load(Ordering::SeqCst), 1);

    let calls = h.connector.log.calls();
    let installs: Vec<&String> = calls.iter().filter(|c| c.starts_with("install_app:")).collect();
    assert_eq!(installs, vec!["install_app:forum-agent-2", "install_app:forum-agent-3"]);
    assert_eq!(
        calls.iter().filter(|c| *c == "generate_agent_pub_key").count(),
        2
    );
    assert_eq!(h.connector.log.max_in_flight.load(Ordering::SeqCst), 1);

    let ids: Vec<&str> = agents
        .iter()
        .map(|agent| agent.installation.installed_app_id.as_str())
        .collect();
    assert_eq!(ids, vec!["forum", "forum-agent-2", "forum-agent-3"]);
    let keys: HashSet<_> = agents
        .iter()
        .map(|agent| agent.installation.agent_pub_key.clone())
        .collect();
    assert_eq!(keys.len(), 3);
    assert_eq!(agents[0].installation.agent_pub_key, key_for_seed(1));

    // one signer shared by every agent of the conductor
    assert_eq!(h.signers.urls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn windows_are_bound_before_they_load() {
    let h = harness(2, false, FakeLauncher::default()).await;
    h.session.launch().await.unwrap();

    let events = h.windows.events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            "create:Agent 1 - forum",
            "load:surface-1",
            "create:Agent 2 - forum",
            "load:surface-2",
        ]
    );
    assert_eq!(*h.windows.bound_at_load.lock().unwrap(), vec![true, true]);
    assert_eq!(h.gate.len().await, 2);
}

#[tokio::test]
async fn sign_request_for_another_agent_never_reaches_signer() {
    let h = harness(2, true, FakeLauncher::default()).await;
    let agents = h.session.launch().await.unwrap();
    let first = &agents[0];
    let second = &agents[1];
    assert_ne!(
        first.installation.agent_pub_key,
        second.installation.agent_pub_key
    );

    let err = h
        .gate
        .authorize_and_sign(&first.surface, call_as(second.installation.agent_pub_key.clone()))
        .await
        .unwrap_err();
    assert_eq!(err, SignRejection::UnauthorizedAgent);
    assert_eq!(h.signers.signer.calls(), 0);

    h.gate
        .authorize_and_sign(&first.surface, call_as(first.installation.agent_pub_key.clone()))
        .await
        .unwrap();
    assert_eq!(h.signers.signer.calls(), 1);
}

#[tokio::test]
async fn failed_launch_tears_session_down() {
    let launcher = FakeLauncher {
        fail_launch: true,
        ..Default::default()
    };
    let h = harness(2, false, launcher).await;
    let err = h.session.launch().await.unwrap_err();
    assert_eq!(err.exit_code(), 1);
    assert_eq!(h.launcher.shutdowns.load(Ordering::SeqCst), 1);
    let marker = std::fs::read_to_string(h.session_dir.join(ABANDONED_MARKER)).unwrap();
    assert_eq!(marker, ABANDONED_TEXT);
    assert!(h.gate.is_empty().await);
}

#[tokio::test]
async fn child_exit_code_ends_the_session() {
    let launcher = FakeLauncher::default();
    *launcher.exit.lock().unwrap() = Some(ChildExit {
        process: "hc sandbox".to_string(),
        index: 2,
        exit_code: Some(42),
        status: "exit status: 42".to_string(),
    });
    let h = harness(1, false, launcher).await;
    h.session.launch().await.unwrap();

    let end = h.session.wait().await;
    assert!(matches!(end, SessionEnd::ChildExited(_)));
    assert_eq!(end.exit_code(), 42);

    h.session.shutdown().await;
    assert!(h.session_dir.join(ABANDONED_MARKER).exists());
}

#[tokio::test]
async fn interrupt_while_conductors_start_tears_session_down() {
    let launcher = FakeLauncher {
        hang_launch: true,
        ..Default::default()
    };
    let h = harness(2, false, launcher).await;
    let outcome = h
        .session
        .launch_until(tokio::time::sleep(Duration::from_millis(200)))
        .await
        .unwrap();
    assert!(outcome.is_none());
    assert_eq!(h.launcher.plans.lock().unwrap().len(), 1);
    assert_eq!(h.launcher.shutdowns.load(Ordering::SeqCst), 1);
    let marker = std::fs::read_to_string(h.session_dir.join(ABANDONED_MARKER)).unwrap();
    assert_eq!(marker, ABANDONED_TEXT);
    assert!(h.gate.is_empty().await);
}

#[tokio::test]
async fn interrupt_after_launch_ends_the_session_cleanly() {
    let h = harness(1, false, FakeLauncher::default()).await;
    let agents = h
        .session
        .launch_until(std::future::pending())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(agents.len(), 1);
    let end = h.session.wait_until(async {}).await;
    assert_eq!(end, SessionEnd::Interrupted);
    assert_eq!(end.exit_code(), 0);
}
