#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use condwatch_core::{Change, ChangeKind, Condition, SourceRef};
use condwatch_emit::{ApplyEmitter, Emit, EventStore, EVENT_NAME_PREFIX};
use condwatch_pipeline::Dispatcher;

#[derive(Default, Clone)]
struct MockEmit {
    calls: Arc<Mutex<Vec<(Vec<Condition>, SourceRef)>>>,
}

#[async_trait]
impl Emit for MockEmit {
    async fn emit(&self, conditions: &[Condition], source: &SourceRef) {
        self.calls.lock().unwrap().push((conditions.to_vec(), source.clone()));
    }
}

fn change(kind: ChangeKind, raw: serde_json::Value) -> Change {
    Change { kind, raw }
}

fn cluster(name: &str, ns: &str, conditions: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "cluster.x-k8s.io/v1beta1",
        "kind": "Cluster",
        "metadata": {
            "name": name,
            "namespace": ns,
            "uid": format!("uid-{}", name),
            "resourceVersion": "1",
        },
        "status": { "conditions": conditions },
    })
}

#[tokio::test]
async fn objects_without_status_emit_nothing() {
    let emit = MockEmit::default();
    let mut d = Dispatcher::new(Box::new(emit.clone()), Duration::ZERO);
    d.dispatch(&change(
        ChangeKind::Applied,
        serde_json::json!({ "metadata": { "name": "bare", "uid": "u0" } }),
    ))
    .await;
    assert!(emit.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn empty_condition_lists_emit_nothing() {
    let emit = MockEmit::default();
    let mut d = Dispatcher::new(Box::new(emit.clone()), Duration::ZERO);
    d.dispatch(&change(ChangeKind::Applied, cluster("a", "ns", serde_json::json!([]))))
        .await;
    d.dispatch(&change(
        ChangeKind::Applied,
        serde_json::json!({ "metadata": { "uid": "u1" }, "status": { "phase": "Pending" } }),
    ))
    .await;
    assert!(emit.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn all_conditions_are_forwarded_in_order() {
    let emit = MockEmit::default();
    let mut d = Dispatcher::new(Box::new(emit.clone()), Duration::ZERO);
    d.dispatch(&change(
        ChangeKind::Applied,
        cluster(
            "prod",
            "default",
            serde_json::json!([
                { "type": "Ready", "status": "True", "reason": "Healthy", "message": "all good" },
                { "type": "Degraded", "status": "False", "reason": "NodeDown", "message": "node-3 unreachable" },
                { "type": "Paused", "status": "Unknown" },
            ]),
        ),
    ))
    .await;
    let calls = emit.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    let (conds, source) = &calls[0];
    assert_eq!(conds.len(), 3);
    assert_eq!(conds[0].type_, "Ready");
    assert_eq!(conds[1].type_, "Degraded");
    assert_eq!(conds[2].type_, "Paused");
    assert_eq!(source.display_name(), "default/prod");
}

#[tokio::test]
async fn malformed_status_does_not_poison_the_loop() {
    let emit = MockEmit::default();
    let mut d = Dispatcher::new(Box::new(emit.clone()), Duration::ZERO);
    d.dispatch(&change(
        ChangeKind::Applied,
        serde_json::json!({
            "metadata": { "name": "bad", "uid": "u-bad" },
            "status": "definitely not an object",
        }),
    ))
    .await;
    // The next notification is processed normally.
    d.dispatch(&change(
        ChangeKind::Applied,
        cluster("ok", "ns", serde_json::json!([{ "type": "Ready", "status": "True" }])),
    ))
    .await;
    let calls = emit.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1.name, "ok");
}

#[tokio::test]
async fn resync_of_an_unchanged_object_emits_again() {
    // Duplicate records across resyncs are the documented trade-off of the
    // apply strategy, not a bug.
    let emit = MockEmit::default();
    let mut d = Dispatcher::new(Box::new(emit.clone()), Duration::ZERO);
    let raw = cluster("prod", "default", serde_json::json!([{ "type": "Ready", "status": "True" }]));
    d.dispatch(&change(ChangeKind::Applied, raw.clone())).await;
    d.dispatch(&change(ChangeKind::Resynced, raw)).await;
    assert_eq!(emit.calls.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn throttle_suppresses_resync_repeats_per_condition_type() {
    let emit = MockEmit::default();
    let mut d = Dispatcher::new(Box::new(emit.clone()), Duration::from_secs(3600));
    let raw = cluster(
        "prod",
        "default",
        serde_json::json!([
            { "type": "Ready", "status": "True" },
            { "type": "Degraded", "status": "False" },
        ]),
    );
    d.dispatch(&change(ChangeKind::Applied, raw.clone())).await;
    d.dispatch(&change(ChangeKind::Resynced, raw)).await;
    // Second pass is fully suppressed; a different object still goes through.
    d.dispatch(&change(
        ChangeKind::Applied,
        cluster("other", "default", serde_json::json!([{ "type": "Ready", "status": "True" }])),
    ))
    .await;
    let calls = emit.calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].0.len(), 2);
    assert_eq!(calls[1].1.name, "other");
}

#[tokio::test]
async fn deleting_an_object_clears_its_throttle_state() {
    let emit = MockEmit::default();
    let mut d = Dispatcher::new(Box::new(emit.clone()), Duration::from_secs(3600));
    let raw = cluster("prod", "default", serde_json::json!([{ "type": "Ready", "status": "True" }]));
    d.dispatch(&change(ChangeKind::Applied, raw.clone())).await;
    // Still inside the period, so the delete notification is suppressed,
    // but it must also drop the pair's state.
    d.dispatch(&change(ChangeKind::Deleted, raw.clone())).await;
    // Same uid reappears (object recreated): emitted without waiting out
    // the old entry.
    d.dispatch(&change(ChangeKind::Applied, raw)).await;
    let calls = emit.calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
}

// End-to-end through the real apply emitter against a recording store.

#[derive(Default)]
struct RecordingStore {
    calls: Arc<Mutex<Vec<(String, String, serde_json::Value)>>>,
}

#[async_trait]
impl EventStore for RecordingStore {
    async fn apply(
        &self,
        namespace: &str,
        name: &str,
        body: &serde_json::Value,
    ) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push((namespace.to_string(), name.to_string(), body.clone()));
        Ok(())
    }
}

#[tokio::test]
async fn end_to_end_two_conditions_become_two_records() {
    let store = RecordingStore::default();
    let calls = Arc::clone(&store.calls);
    let mut d = Dispatcher::new(Box::new(ApplyEmitter::with_store(store)), Duration::ZERO);

    d.dispatch(&change(
        ChangeKind::Applied,
        cluster(
            "prod",
            "default",
            serde_json::json!([
                { "type": "Ready", "status": "True", "reason": "Healthy", "message": "all good" },
                { "type": "Degraded", "status": "False", "reason": "NodeDown", "message": "node-3 unreachable" },
            ]),
        ),
    ))
    .await;

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    for (ns, name, body) in calls.iter() {
        assert_eq!(ns, "default");
        assert!(name.starts_with(EVENT_NAME_PREFIX));
        assert_eq!(body["involvedObject"]["name"], "prod");
        assert_eq!(body["involvedObject"]["namespace"], "default");
    }
    assert_eq!(calls[0].2["type"], "Normal");
    assert_eq!(calls[0].2["reason"], "Healthy");
    assert_eq!(calls[1].2["type"], "Warning");
    assert_eq!(calls[1].2["message"], "node-3 unreachable");
}
