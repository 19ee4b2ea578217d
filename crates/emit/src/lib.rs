//! condwatch emit – turn observed conditions into durable v1/Event records

#![forbid(unsafe_code)]

pub mod shortid;

use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Event as CoreEvent, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::{
    api::{Api, Patch, PatchParams},
    core::{ApiResource, DynamicObject, ObjectMeta},
    runtime::events::{Event as EventRecord, EventType, Recorder, Reporter},
    Client,
};
use metrics::{counter, histogram};
use tracing::{debug, error, warn};

use condwatch_core::{Condition, SourceRef};

pub use shortid::ShortId;

/// Field manager identity for server-side apply writes.
pub const FIELD_MANAGER: &str = "condwatch";
/// Label stamped on every event created by strategy A.
pub const CREATED_BY_LABEL: &str = "condwatch.dev/created-by";
/// Name prefix for strategy-A events; the suffix is a fresh short id.
pub const EVENT_NAME_PREFIX: &str = "condwatch-event";

const EVENT_ACTION: &str = "StatusConditionReported";

/// Emission strategy selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitStrategy {
    /// Direct idempotent create-or-update of named event records.
    Apply,
    /// Delegate naming/aggregation to the cluster event recorder.
    Recorder,
}

/// Classify a condition for the event record. The event type space is only
/// Normal/Warning, so Unknown lands on Warning.
pub fn event_type(cond: &Condition) -> EventType {
    if cond.status.is_healthy() {
        EventType::Normal
    } else {
        EventType::Warning
    }
}

fn event_type_str(cond: &Condition) -> &'static str {
    match event_type(cond) {
        EventType::Normal => "Normal",
        EventType::Warning => "Warning",
    }
}

fn object_ref(source: &SourceRef) -> ObjectReference {
    let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
    ObjectReference {
        uid: non_empty(&source.uid),
        kind: non_empty(&source.kind),
        name: non_empty(&source.name),
        namespace: source.namespace.clone(),
        api_version: non_empty(&source.api_version),
        resource_version: non_empty(&source.resource_version),
        field_path: None,
    }
}

/// One emission attempt per condition, in the conditions' order. Failures are
/// logged and never propagated; durability past the write call belongs to the
/// event store.
#[async_trait]
pub trait Emit: Send + Sync {
    async fn emit(&self, conditions: &[Condition], source: &SourceRef);
}

pub fn emitter_for(strategy: EmitStrategy, client: Client) -> Box<dyn Emit> {
    match strategy {
        EmitStrategy::Apply => Box::new(ApplyEmitter::new(client)),
        EmitStrategy::Recorder => Box::new(RecorderEmitter::new(client)),
    }
}

/// Write seam under strategy A; mocked in tests.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn apply(&self, namespace: &str, name: &str, body: &serde_json::Value) -> Result<()>;
}

/// Real store: SSA apply of v1/Event through the dynamic API.
pub struct KubeEventStore {
    client: Client,
    ar: ApiResource,
}

impl KubeEventStore {
    pub fn new(client: Client) -> Self {
        let ar = ApiResource::erase::<CoreEvent>(&());
        Self { client, ar }
    }
}

#[async_trait]
impl EventStore for KubeEventStore {
    async fn apply(&self, namespace: &str, name: &str, body: &serde_json::Value) -> Result<()> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &self.ar);
        let pp = PatchParams::apply(FIELD_MANAGER);
        api.patch(name, &pp, &Patch::Apply(body)).await?;
        Ok(())
    }
}

/// Encode seam under strategy A: turns one condition into the event body the
/// store writes. Fallible so tests can drive the abort-on-encode-failure
/// path.
pub trait EncodeEvent: Send + Sync {
    fn encode(
        &self,
        name: &str,
        namespace: &str,
        source: &SourceRef,
        cond: &Condition,
    ) -> Result<serde_json::Value>;
}

/// Production encoder: typed `v1/Event` body stamped with the creator label.
#[derive(Default)]
pub struct EventBodyEncoder;

impl EncodeEvent for EventBodyEncoder {
    fn encode(
        &self,
        name: &str,
        namespace: &str,
        source: &SourceRef,
        cond: &Condition,
    ) -> Result<serde_json::Value> {
        let ev = CoreEvent {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([(
                    CREATED_BY_LABEL.to_string(),
                    FIELD_MANAGER.to_string(),
                )])),
                ..Default::default()
            },
            involved_object: object_ref(source),
            reason: Some(cond.reason.clone()),
            message: Some(cond.message.clone()),
            type_: Some(event_type_str(cond).to_string()),
            action: Some(EVENT_ACTION.to_string()),
            event_time: Some(MicroTime(Utc::now())),
            reporting_component: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let mut body = serde_json::to_value(&ev)?;
        // The typed Event serializes without its group/version coordinates,
        // and server-side apply refuses a patch that lacks them.
        body["apiVersion"] = serde_json::Value::String("v1".to_string());
        body["kind"] = serde_json::Value::String("Event".to_string());
        Ok(body)
    }
}

/// Strategy A: a freshly named record per condition, applied idempotently.
///
/// Names are fresh per call, so resyncs of an unchanged object produce new
/// records rather than being deduplicated: history completeness over
/// storage economy.
pub struct ApplyEmitter<S = KubeEventStore, E = EventBodyEncoder> {
    store: S,
    encoder: E,
    sid: ShortId,
}

impl ApplyEmitter<KubeEventStore> {
    pub fn new(client: Client) -> Self {
        Self::with_store(KubeEventStore::new(client))
    }
}

impl<S: EventStore> ApplyEmitter<S> {
    pub fn with_store(store: S) -> Self {
        Self::with_store_and_encoder(store, EventBodyEncoder)
    }
}

impl<S: EventStore, E: EncodeEvent> ApplyEmitter<S, E> {
    pub fn with_store_and_encoder(store: S, encoder: E) -> Self {
        Self { store, encoder, sid: ShortId::default() }
    }
}

#[async_trait]
impl<S: EventStore, E: EncodeEvent> Emit for ApplyEmitter<S, E> {
    async fn emit(&self, conditions: &[Condition], source: &SourceRef) {
        // Events are namespaced; records for cluster-scoped sources land in
        // "default".
        let namespace = source.namespace.clone().unwrap_or_else(|| "default".to_string());
        for cond in conditions {
            let name = format!("{}.{}", EVENT_NAME_PREFIX, self.sid.generate());
            let body = match self.encoder.encode(&name, &namespace, source, cond) {
                Ok(body) => body,
                Err(e) => {
                    counter!("emit_encode_failures_total", 1u64);
                    error!(error = %e, event = %name, object = %source.display_name(),
                        "encoding event; dropping remaining conditions for this object");
                    return;
                }
            };
            let t0 = Instant::now();
            match self.store.apply(&namespace, &name, &body).await {
                Ok(()) => {
                    histogram!("emit_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                    counter!("conditions_emitted_total", 1u64);
                    debug!(event = %name, object = %source.display_name(),
                        condition = %cond.type_, "event applied");
                }
                Err(e) => {
                    counter!("emit_failures_total", 1u64);
                    error!(error = %e, event = %name, object = %source.display_name(),
                        condition = %cond.type_, "writing event");
                }
            }
        }
    }
}

/// Strategy B: hand each condition to the cluster event recorder, which owns
/// naming and may aggregate repeats into a counted record.
pub struct RecorderEmitter {
    client: Client,
    reporter: Reporter,
}

impl RecorderEmitter {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter { controller: FIELD_MANAGER.to_string(), instance: None };
        Self { client, reporter }
    }
}

#[async_trait]
impl Emit for RecorderEmitter {
    async fn emit(&self, conditions: &[Condition], source: &SourceRef) {
        let recorder =
            Recorder::new(self.client.clone(), self.reporter.clone(), object_ref(source));
        for cond in conditions {
            let record = EventRecord {
                type_: event_type(cond),
                reason: cond.reason.clone(),
                note: (!cond.message.is_empty()).then(|| cond.message.clone()),
                action: EVENT_ACTION.to_string(),
                secondary: None,
            };
            match recorder.publish(record).await {
                Ok(()) => counter!("conditions_emitted_total", 1u64),
                Err(e) => {
                    counter!("emit_failures_total", 1u64);
                    warn!(error = %e, object = %source.display_name(),
                        condition = %cond.type_, "publishing event");
                }
            }
        }
    }
}
