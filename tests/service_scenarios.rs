mod common;

use std::time::Duration;

use common::{node, node_with, FakeEngine, NodeBuilder};
use moriod::ca::{CertificateRequest, IssuedTo};
use moriod::cluster::JoinRequest;
use moriod::config::RawSettings;
use moriod::container::{LifecycleOp, ObservedState};
use moriod::resolver::model::{DeploymentMode, NodeRole};
use moriod::service::ServiceError;

fn three() -> RawSettings {
    RawSettings::with_brokers(
        "lab",
        &["a.example.com", "b.example.com", "c.example.com"],
        Some("lab.example.com"),
    )
}

fn request(cn: &str, c: &str) -> CertificateRequest {
    CertificateRequest {
        cn: cn.to_string(),
        c: c.to_string(),
        st: "X".to_string(),
        l: "Y".to_string(),
        o: "Z".to_string(),
        ou: "W".to_string(),
        san: vec![format!("{}.local", cn)],
        lifetime: None,
        issued_to: IssuedTo::Operator("ops".to_string()),
    }
}

#[test_log::test(tokio::test)]
async fn empty_node_is_set_up_then_grows_into_a_cluster() {
    let node = node("a.example.com").await;
    assert_eq!(node.service.status().await.unwrap().code, 1);

    let setup = node
        .service
        .setup(RawSettings::standalone("lab", "a.example.com"))
        .await
        .unwrap();
    assert_eq!(setup.config.version, 1);
    assert_eq!(setup.config.mode, DeploymentMode::Standalone);
    assert!(setup.propagation.is_none());
    assert_eq!(
        setup.config.node("a.example.com").unwrap().certificate_fingerprint,
        Some(setup.node_fingerprint.clone())
    );

    let status = node.service.status().await.unwrap();
    assert_eq!(status.code, 0);
    assert_eq!(status.config_version, Some(1));

    let deployed = node.service.deploy(three()).await.unwrap();
    let config = &deployed.config;
    assert_eq!(config.version, 2);
    assert_eq!(config.mode, DeploymentMode::Clustered);
    assert_eq!(config.nodes.len(), 3);
    assert_eq!(config.leader().map(|n| n.hostname.as_str()), Some("a.example.com"));
    assert_eq!(
        config.nodes.iter().filter(|n| n.role == NodeRole::Leader).count(),
        1
    );

    let propagation = deployed.propagation.unwrap();
    assert!(propagation.is_complete());
    let mut synced = node.peers.synced.lock().unwrap().clone();
    synced.sort();
    assert_eq!(
        synced,
        vec![("b.example.com".to_string(), 2), ("c.example.com".to_string(), 2)]
    );

    let again = node.service.setup(three()).await.unwrap_err();
    assert!(matches!(again, ServiceError::AlreadySetUp));
    assert_eq!(again.error_code(), "morio.core.ephemeral.required");
}

#[tokio::test]
async fn settings_for_other_nodes_are_refused_at_setup() {
    let node = node("a.example.com").await;
    let err = node
        .service
        .setup(RawSettings::standalone("lab", "x.example.com"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "morio.core.settings.fqdn.mismatch");

    let status = node.service.status().await.unwrap();
    assert_eq!(status.code, 1);
    assert_eq!(status.config_version, None);
}

#[tokio::test]
async fn deploy_needs_a_node_that_was_set_up() {
    let node = node("a.example.com").await;
    let err = node
        .service
        .deploy(RawSettings::standalone("lab", "a.example.com"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "morio.core.ephemeral.prohibited");
}

#[tokio::test]
async fn certificate_serials_follow_the_previous_maximum() {
    let node = node("a.example.com").await;
    node.service
        .setup(RawSettings::standalone("lab", "a.example.com"))
        .await
        .unwrap();

    let first = node.service.issue_certificate(request("node-a", "US")).await.unwrap();
    assert!(first.record.not_after > first.record.not_before);

    let err = node
        .service
        .issue_certificate(request("node-b", "USA"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "morio.core.ca.request.invalid");
    assert!(!err.is_retryable());

    let second = node.service.issue_certificate(request("node-c", "US")).await.unwrap();
    assert_eq!(second.record.serial, first.record.serial + 1);

    let revoked = node.service.revoke_certificate(second.record.serial).await.unwrap();
    assert_eq!(revoked.serial, second.record.serial);
}

#[tokio::test]
async fn pausing_twice_changes_nothing_the_second_time() {
    let node = node("a.example.com").await;
    node.service
        .setup(RawSettings::standalone("lab", "a.example.com"))
        .await
        .unwrap();

    // Let reconciliation bring the broker up first
    tokio::time::timeout(Duration::from_secs(10), async {
        while node.engine.state_of("broker") != Some(ObservedState::Running) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let started = node.service.apply("broker", LifecycleOp::Start).await.unwrap();
    assert_eq!(started.observed_state, ObservedState::Running);

    let paused = node.service.apply("broker", LifecycleOp::Pause).await.unwrap();
    let again = node.service.apply("broker", LifecycleOp::Pause).await.unwrap();
    assert_eq!(paused.observed_state, ObservedState::Paused);
    assert_eq!(again, paused);
    assert_eq!(node.engine.state_of("broker"), Some(ObservedState::Paused));
}

#[tokio::test]
async fn services_only_run_with_their_tls_material() {
    let node = node("a.example.com").await;
    node.service
        .setup(RawSettings::standalone("lab", "a.example.com"))
        .await
        .unwrap();

    node.service.apply("broker", LifecycleOp::Start).await.unwrap();
    let dir = node.dir.path().join("etc").join("broker");
    for file in ["tls-cert.pem", "tls-key.pem", "tls-ca.pem"] {
        assert!(dir.join(file).exists(), "missing {}", file);
    }
}

#[tokio::test]
async fn start_timing_out_degrades_the_node_but_not_the_config() {
    let engine = FakeEngine::new();
    engine.hang_on_start("broker");
    let node = node_with("a.example.com", engine).await;
    node.service
        .setup(RawSettings::standalone("lab", "a.example.com"))
        .await
        .unwrap();

    let err = node
        .service
        .apply("broker", LifecycleOp::Start)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "morio.core.engine.retries.exhausted");
    assert!(err.is_escalation());

    let status = node.service.status().await.unwrap();
    assert_eq!(status.code, 10);
    assert_eq!(status.config_version, Some(1));
    assert!(status.failures.iter().any(|f| f.component == "service:broker" && f.code == Some(13)));
}

#[tokio::test]
async fn the_leader_admits_and_propagates_to_new_brokers() {
    let node = node("a.example.com").await;
    let setup = node.service.setup(three()).await.unwrap();
    assert_eq!(setup.propagation.map(|p| p.delivered.len()), Some(2));

    let outcome = node
        .service
        .join(JoinRequest {
            hostname: "d.example.com".to_string(),
            morio_version: "0.1.0".to_string(),
            fingerprint: None,
        })
        .await
        .unwrap();
    assert_eq!(outcome.config.version, 2);
    assert_eq!(outcome.node.serial, 4);
    assert!(outcome.propagation.delivered.contains(&"d.example.com".to_string()));

    let err = node
        .service
        .join(JoinRequest {
            hostname: "e.example.com".to_string(),
            morio_version: "9.9.9".to_string(),
            fingerprint: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "morio.core.cluster.version.mismatch");

    node.service.transfer_leadership("b.example.com").await.unwrap();
    let status = node.service.status().await.unwrap();
    assert_eq!(status.leader.as_deref(), Some("b.example.com"));
    assert_eq!(status.config_version, Some(3));

    node.service.shutdown().await.unwrap();
}

#[tokio::test]
async fn status_answers_while_a_propagation_is_pending() {
    let node = NodeBuilder::new("a.example.com").hanging_peers(30_000).build().await;
    let setup = node.service.setup(three());
    tokio::pin!(setup);

    let published = async {
        loop {
            let status = tokio::time::timeout(Duration::from_secs(1), node.service.status())
                .await
                .expect("status waited behind the setup")
                .unwrap();
            if status.config_version == Some(1) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };

    tokio::select! {
        _ = &mut setup => panic!("setup finished although no peer answers"),
        status = tokio::time::timeout(Duration::from_secs(10), published) => {
            let status = status.unwrap();
            assert_eq!(status.mode, Some(DeploymentMode::Clustered));
            assert_eq!(status.leader.as_deref(), Some("a.example.com"));
        }
    }

    // Shutdown gives up on the pending deliveries
    node.service.shutdown().await.unwrap();
    let outcome = setup.await.unwrap();
    assert_eq!(outcome.config.version, 1);
    let propagation = outcome.propagation.unwrap();
    assert!(propagation.delivered.is_empty());
    assert_eq!(propagation.failed.len(), 2);
}

#[tokio::test]
async fn concurrent_deploys_let_exactly_one_through() {
    let node = NodeBuilder::new("a.example.com")
        .slow_commits(Duration::from_millis(300))
        .build()
        .await;
    node.service
        .setup(RawSettings::standalone("lab", "a.example.com"))
        .await
        .unwrap();

    let settings = RawSettings::standalone("lab", "a.example.com");
    let (first, second) = tokio::join!(
        node.service.deploy(settings.clone()),
        node.service.deploy(settings)
    );

    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        outcomes
            .iter()
            .filter_map(|r| r.as_ref().err())
            .filter(|e| e.error_code() == "morio.core.resolution.in_progress")
            .count(),
        1
    );
    assert_eq!(node.service.status().await.unwrap().config_version, Some(2));
}
