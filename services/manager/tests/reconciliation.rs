//! Integration tests for the reconciliation flow.
//!
//! These tests drive the engine the way the manager does:
//! 1. A document is published to the channel (or handed over directly)
//! 2. The engine plans against its running workers
//! 3. The launcher starts and terminates processes
//!
//! Uses MockLauncher to record process lifecycle without spawning anything.

use std::sync::Arc;
use std::time::Duration;

use flotilla_channel::{ConfigChannel, ConfigClient, MemoryChannel};
use flotilla_manager::{
    EmptyDocumentPolicy, EngineConfig, LaunchEvent, MockLauncher, PluginRegistry,
    ReconciliationEngine,
};
use flotilla_reconcile::{DesiredConfigDocument, WorkerConfig, WorkerSpec};
use serde_json::json;

fn settings(output: &str) -> WorkerConfig {
    let mut config = WorkerConfig::new();
    config.insert("output".to_string(), json!(output));
    config
}

fn echo(id: &str, output: &str) -> WorkerSpec {
    WorkerSpec::new(id, "EchoWorker", settings(output)).unwrap()
}

fn doc(specs: Vec<WorkerSpec>) -> DesiredConfigDocument {
    DesiredConfigDocument::from_workers(specs).unwrap()
}

struct Harness {
    launcher: MockLauncher,
    channel: Arc<MemoryChannel>,
    engine: Arc<ReconciliationEngine>,
}

fn harness_with(launcher: MockLauncher, policy: EmptyDocumentPolicy) -> Harness {
    let channel = Arc::new(MemoryChannel::new());
    let engine = Arc::new(ReconciliationEngine::new(
        Arc::new(PluginRegistry::with_builtins()),
        Arc::new(launcher.clone()),
        channel.clone(),
        EngineConfig {
            empty_document: policy,
        },
    ));
    Harness {
        launcher,
        channel,
        engine,
    }
}

fn harness() -> Harness {
    harness_with(MockLauncher::new(), EmptyDocumentPolicy::StopAll)
}

/// Poll until the launcher's live ids match `expected`.
async fn wait_for_live(launcher: &MockLauncher, expected: &[&str]) {
    let expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if launcher.live_ids() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(
        result.is_ok(),
        "timed out waiting for live ids {:?}, have {:?}",
        expected,
        launcher.live_ids()
    );
}

#[tokio::test]
async fn test_pass_starts_every_resolvable_worker() {
    let h = harness();

    let report = h
        .engine
        .on_config_changed(&doc(vec![echo("w1", "o1"), echo("w2", "o2")]))
        .await;

    assert_eq!(report.started, vec!["w1".to_string(), "w2".to_string()]);
    assert_eq!(h.launcher.live_ids(), vec!["w1", "w2"]);
    assert_eq!(h.engine.running_ids().await, vec!["w1", "w2"]);

    // The worker receives its entry minus the id.
    let config = h.engine.worker_config("w1").await.unwrap();
    assert_eq!(config.get("output"), Some(&json!("o1")));
    assert_eq!(config.get("worker_cls"), Some(&json!("EchoWorker")));
    assert!(config.get("id").is_none());
}

#[tokio::test]
async fn test_repeated_pass_is_noop() {
    let h = harness();
    let desired = doc(vec![echo("w1", "o1"), echo("w2", "o2")]);

    h.engine.on_config_changed(&desired).await;
    h.launcher.clear_events();

    let report = h.engine.on_config_changed(&desired).await;
    assert!(report.is_noop());
    assert_eq!(report.unchanged.len(), 2);
    assert!(h.launcher.events().is_empty());
}

#[tokio::test]
async fn test_changed_config_restarts_only_that_worker() {
    let h = harness();
    h.engine
        .on_config_changed(&doc(vec![echo("w1", "o1"), echo("w2", "o2")]))
        .await;
    h.launcher.clear_events();

    let report = h
        .engine
        .on_config_changed(&doc(vec![echo("w1", "o1-new"), echo("w2", "o2")]))
        .await;

    assert_eq!(report.restarted, vec!["w1".to_string()]);
    assert_eq!(report.unchanged, vec!["w2".to_string()]);

    // Terminate precedes the replacement start.
    let events = h.launcher.events();
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], LaunchEvent::Terminated { worker_id } if worker_id == "w1"));
    assert!(matches!(
        &events[1],
        LaunchEvent::Started { worker_id, config }
            if worker_id == "w1" && config.get("output") == Some(&json!("o1-new"))
    ));
    assert_eq!(h.launcher.terminations_for("w2"), 0);
    assert_eq!(h.launcher.max_live_per_id(), 1);
}

#[tokio::test]
async fn test_removed_worker_is_stopped() {
    let h = harness();
    h.engine
        .on_config_changed(&doc(vec![echo("w1", "o1"), echo("w2", "o2")]))
        .await;

    let report = h.engine.on_config_changed(&doc(vec![echo("w2", "o2")])).await;

    assert_eq!(report.stopped, vec!["w1".to_string()]);
    assert_eq!(h.launcher.live_ids(), vec!["w2"]);
    assert_eq!(h.engine.running_ids().await, vec!["w2"]);
}

#[tokio::test]
async fn test_unknown_class_is_skipped() {
    let h = harness();
    let unknown = WorkerSpec::new("w2", "NoSuchWorker", settings("o2")).unwrap();

    let report = h
        .engine
        .on_config_changed(&doc(vec![echo("w1", "o1"), unknown]))
        .await;

    assert_eq!(report.started, vec!["w1".to_string()]);
    assert_eq!(report.unresolved, vec!["w2".to_string()]);
    assert_eq!(h.launcher.starts_for("w2"), 0);
    assert_eq!(h.engine.running_ids().await, vec!["w1"]);
}

#[tokio::test]
async fn test_worker_switched_to_unknown_class_is_stopped() {
    let h = harness();
    h.engine.on_config_changed(&doc(vec![echo("w1", "o1")])).await;

    let switched = WorkerSpec::new("w1", "NoSuchWorker", settings("o1")).unwrap();
    let report = h.engine.on_config_changed(&doc(vec![switched])).await;

    assert_eq!(report.stopped, vec!["w1".to_string()]);
    assert_eq!(report.unresolved, vec!["w1".to_string()]);
    assert!(h.launcher.live_ids().is_empty());
}

#[tokio::test]
async fn test_malformed_document_changes_nothing() {
    let h = harness();
    h.engine.on_config_changed(&doc(vec![echo("w1", "o1")])).await;
    h.launcher.clear_events();

    for text in ["not json", r#"{"other": 1}"#, r#"{"workers": [{"id": "x"}]}"#] {
        assert!(h.engine.on_raw_document(text).await.is_none(), "{text}");
    }

    assert!(h.launcher.events().is_empty());
    assert_eq!(h.engine.running_ids().await, vec!["w1"]);
}

#[tokio::test]
async fn test_empty_list_stops_all_by_default() {
    let h = harness();
    h.engine
        .on_config_changed(&doc(vec![echo("w1", "o1"), echo("w2", "o2")]))
        .await;

    let report = h.engine.on_raw_document(r#"{"workers": []}"#).await.unwrap();

    assert_eq!(report.stopped.len(), 2);
    assert!(h.launcher.live_ids().is_empty());
    assert!(h.engine.running_ids().await.is_empty());
}

#[tokio::test]
async fn test_empty_list_ignored_by_policy() {
    let h = harness_with(MockLauncher::new(), EmptyDocumentPolicy::Ignore);
    h.engine.on_config_changed(&doc(vec![echo("w1", "o1")])).await;

    let report = h.engine.on_raw_document(r#"{"workers": []}"#).await.unwrap();

    assert!(report.is_noop());
    assert_eq!(h.launcher.live_ids(), vec!["w1"]);
}

#[tokio::test]
async fn test_failed_start_is_retried_on_next_pass() {
    let h = harness();
    h.launcher.fail_starts_for("w1");
    let desired = doc(vec![echo("w1", "o1"), echo("w2", "o2")]);

    let report = h.engine.on_config_changed(&desired).await;
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].worker_id, "w1");
    assert_eq!(report.started, vec!["w2".to_string()]);
    assert_eq!(h.engine.running_ids().await, vec!["w2"]);

    h.launcher.clear_start_failures();
    let report = h.engine.on_config_changed(&desired).await;
    assert_eq!(report.started, vec!["w1".to_string()]);
    assert_eq!(h.launcher.live_ids(), vec!["w1", "w2"]);
}

#[tokio::test]
async fn test_terminate_errors_do_not_abort_pass() {
    let h = harness();
    h.engine
        .on_config_changed(&doc(vec![echo("w1", "o1"), echo("w2", "o2")]))
        .await;
    h.launcher.fail_terminates(true);

    let report = h
        .engine
        .on_config_changed(&doc(vec![echo("w2", "o2-new"), echo("w3", "o3")]))
        .await;

    assert_eq!(report.stopped, vec!["w1".to_string()]);
    assert_eq!(report.restarted, vec!["w2".to_string()]);
    assert_eq!(report.started, vec!["w3".to_string()]);
    assert_eq!(h.engine.running_ids().await, vec!["w2", "w3"]);
}

#[tokio::test]
async fn test_crashed_worker_is_not_restarted_until_changed() {
    let h = harness();
    h.engine.on_config_changed(&doc(vec![echo("w1", "o1")])).await;
    h.launcher.crash("w1");

    let status = h.engine.running_workers().await;
    assert_eq!(status.len(), 1);
    assert!(!status[0].alive);

    let report = h.engine.on_config_changed(&doc(vec![echo("w1", "o1")])).await;
    assert!(report.is_noop());
    assert_eq!(h.launcher.starts_for("w1"), 1);

    let report = h.engine.on_config_changed(&doc(vec![echo("w1", "o1b")])).await;
    assert_eq!(report.restarted, vec!["w1".to_string()]);
    assert_eq!(h.launcher.live_ids(), vec!["w1"]);
}

#[tokio::test]
async fn test_concurrent_passes_never_double_start() {
    let h = harness_with(
        MockLauncher::with_start_delay(Duration::from_millis(20)),
        EmptyDocumentPolicy::StopAll,
    );
    let first = doc(vec![echo("w1", "o1"), echo("w2", "o2")]);
    let second = doc(vec![echo("w1", "o1-new"), echo("w2", "o2")]);

    let (a, b) = tokio::join!(
        h.engine.on_config_changed(&first),
        h.engine.on_config_changed(&second),
    );
    assert!(a.failed.is_empty() && b.failed.is_empty());

    assert_eq!(h.launcher.max_live_per_id(), 1);
    assert_eq!(h.launcher.live_ids(), vec!["w1", "w2"]);
    assert_eq!(h.engine.running_ids().await, vec!["w1", "w2"]);
}

#[tokio::test]
async fn test_initialize_applies_current_document() {
    let h = harness();
    h.channel
        .write(&doc(vec![echo("w1", "o1")]).to_json().unwrap())
        .await
        .unwrap();

    let follower = h.engine.initialize().await.unwrap();
    assert_eq!(h.launcher.live_ids(), vec!["w1"]);

    follower.abort();
}

#[tokio::test]
async fn test_initialize_on_empty_channel_starts_nothing() {
    let h = harness();
    let follower = h.engine.initialize().await.unwrap();

    assert!(h.launcher.events().is_empty());
    follower.abort();
}

#[tokio::test]
async fn test_client_changes_reach_running_workers() {
    let h = harness();
    let follower = h.engine.initialize().await.unwrap();
    let client = ConfigClient::new(h.channel.clone());

    client.add_worker("w1", settings("o1"), "EchoWorker").await.unwrap();
    wait_for_live(&h.launcher, &["w1"]).await;

    client.add_worker("w2", settings("o2"), "EchoWorker").await.unwrap();
    wait_for_live(&h.launcher, &["w1", "w2"]).await;

    client.update_worker("w1", settings("o1-new")).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.launcher.starts_for("w1") < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(
        h.engine.worker_config("w1").await.unwrap().get("output"),
        Some(&json!("o1-new"))
    );

    client.remove_worker("w2").await.unwrap();
    wait_for_live(&h.launcher, &["w1"]).await;

    follower.abort();
}

#[tokio::test]
async fn test_shutdown_stops_every_worker() {
    let h = harness();
    h.engine
        .on_config_changed(&doc(vec![echo("w1", "o1"), echo("w2", "o2")]))
        .await;

    assert_eq!(h.engine.shutdown().await, 2);
    assert!(h.launcher.live_ids().is_empty());
    assert!(h.engine.running_ids().await.is_empty());
    assert_eq!(h.engine.shutdown().await, 0);
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_restart() {
    let h = harness_with(
        MockLauncher::new().with_terminate_delay(Duration::from_millis(200)),
        EmptyDocumentPolicy::StopAll,
    );
    let follower = h.engine.initialize().await.unwrap();

    h.channel
        .write(&doc(vec![echo("w1", "o1")]).to_json().unwrap())
        .await
        .unwrap();
    wait_for_live(&h.launcher, &["w1"]).await;

    // Shut down while the follower is still stopping the o1 process.
    h.channel
        .write(&doc(vec![echo("w1", "o2")]).to_json().unwrap())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.engine.shutdown().await, 1);
    tokio::time::timeout(Duration::from_secs(5), follower)
        .await
        .unwrap()
        .unwrap();

    assert!(h.launcher.live_ids().is_empty());
    assert_eq!(h.launcher.max_live_per_id(), 1);
    assert!(h.engine.running_ids().await.is_empty());
}

#[tokio::test]
async fn test_no_pass_runs_after_shutdown() {
    let h = harness();
    let follower = h.engine.initialize().await.unwrap();
    assert_eq!(h.engine.shutdown().await, 0);
    tokio::time::timeout(Duration::from_secs(5), follower)
        .await
        .unwrap()
        .unwrap();

    let report = h.engine.on_config_changed(&doc(vec![echo("w1", "o1")])).await;
    assert!(report.is_noop());

    h.channel
        .write(&doc(vec![echo("w2", "o2")]).to_json().unwrap())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.launcher.events().is_empty());
}

#[tokio::test]
async fn test_notification_backlog_only_moves_forward() {
    let h = harness_with(
        MockLauncher::with_start_delay(Duration::from_millis(20)),
        EmptyDocumentPolicy::StopAll,
    );
    let follower = h.engine.initialize().await.unwrap();

    // Far more writes than the notification queue holds.
    for n in 0..40 {
        h.channel
            .write(&doc(vec![echo("w1", &format!("o{n}"))]).to_json().unwrap())
            .await
            .unwrap();
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let output = h.engine.worker_config("w1").await.and_then(|c| c.get("output").cloned());
            if output == Some(json!("o39")) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started: Vec<u32> = h
        .launcher
        .events()
        .into_iter()
        .filter_map(|event| match event {
            LaunchEvent::Started { config, .. } => config
                .get("output")
                .and_then(|v| v.as_str())
                .and_then(|s| s.trim_start_matches('o').parse().ok()),
            LaunchEvent::Terminated { .. } => None,
        })
        .collect();
    assert_eq!(started.last(), Some(&39));
    assert!(
        started.windows(2).all(|pair| pair[0] < pair[1]),
        "started configs went backwards: {started:?}"
    );
    assert_eq!(h.launcher.live_ids(), vec!["w1"]);

    h.engine.shutdown().await;
    follower.await.unwrap();
}

#[tokio::test]
async fn test_worker_lifecycle_scenario() {
    let h = harness();

    // {w1: o1}
    h.engine
        .on_raw_document(r#"{"workers":[{"id":"w1","worker_cls":"EchoWorker","output":"o1"}]}"#)
        .await
        .unwrap();
    assert_eq!(h.launcher.live_ids(), vec!["w1"]);

    // {w1: o1, w2: o2}: only w2 starts.
    h.launcher.clear_events();
    h.engine
        .on_raw_document(
            r#"{"workers":[
                {"id":"w1","worker_cls":"EchoWorker","output":"o1"},
                {"id":"w2","worker_cls":"EchoWorker","output":"o2"}]}"#,
        )
        .await
        .unwrap();
    assert_eq!(h.launcher.starts_for("w2"), 1);
    assert_eq!(h.launcher.starts_for("w1"), 0);

    // w1 changes: only w1 restarts.
    h.launcher.clear_events();
    h.engine
        .on_raw_document(
            r#"{"workers":[
                {"id":"w1","worker_cls":"EchoWorker","output":"o1b"},
                {"id":"w2","worker_cls":"EchoWorker","output":"o2"}]}"#,
        )
        .await
        .unwrap();
    assert_eq!(h.launcher.terminations_for("w1"), 1);
    assert_eq!(h.launcher.starts_for("w1"), 1);
    assert_eq!(h.launcher.terminations_for("w2"), 0);

    // w2 removed.
    h.engine
        .on_raw_document(r#"{"workers":[{"id":"w1","worker_cls":"EchoWorker","output":"o1b"}]}"#)
        .await
        .unwrap();
    assert_eq!(h.launcher.live_ids(), vec!["w1"]);

    // Empty list.
    h.engine.on_raw_document(r#"{"workers":[]}"#).await.unwrap();
    assert!(h.launcher.live_ids().is_empty());
}
