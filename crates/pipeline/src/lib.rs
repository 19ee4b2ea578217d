//! condwatch pipeline – wires watch notifications through extraction to emission

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use kube::Client;
use metrics::counter;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use condwatch_core::{extract_status, Change, ChangeKind, Condition, ResourceCoordinate, SourceRef};
use condwatch_emit::{emitter_for, Emit, EmitStrategy};
use condwatch_hub::WatchHub;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub coordinate: ResourceCoordinate,
    pub resync: Duration,
    /// Minimum spacing between emissions for one (object, condition type)
    /// pair. Zero disables throttling, which also means resyncs re-emit
    /// duplicates of unchanged conditions; that is accepted behavior.
    pub throttle: Duration,
    pub sync_timeout: Duration,
    pub strategy: EmitStrategy,
    pub queue_cap: usize,
}

impl PipelineConfig {
    pub fn new(coordinate: ResourceCoordinate) -> Self {
        Self {
            coordinate,
            resync: Duration::from_secs(60),
            throttle: Duration::ZERO,
            sync_timeout: Duration::from_secs(30),
            strategy: EmitStrategy::Apply,
            queue_cap: 2048,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("timed out waiting for the initial cache sync")]
    SyncTimeout,
    #[error(transparent)]
    Setup(#[from] anyhow::Error),
}

/// Per-(object uid, condition type) rate limit. A zero period admits
/// everything and keeps no state.
///
/// Entries expire with the period: a sweep on admit drops anything old
/// enough to admit again anyway, so the map tracks live pairs only instead
/// of growing with every object ever seen.
pub struct Throttle {
    period: Duration,
    last: FxHashMap<(String, String), Instant>,
    last_sweep: Instant,
}

impl Throttle {
    pub fn new(period: Duration) -> Self {
        Self { period, last: FxHashMap::default(), last_sweep: Instant::now() }
    }

    pub fn admit(&mut self, uid: &str, cond_type: &str, now: Instant) -> bool {
        if self.period.is_zero() {
            return true;
        }
        if now.duration_since(self.last_sweep) >= self.period {
            self.last.retain(|_, prev| now.duration_since(*prev) < self.period);
            self.last_sweep = now;
        }
        let key = (uid.to_string(), cond_type.to_string());
        match self.last.get(&key) {
            Some(prev) if now.duration_since(*prev) < self.period => false,
            _ => {
                self.last.insert(key, now);
                true
            }
        }
    }

    /// Drop all state for one object; nothing is left to throttle once the
    /// object is gone.
    pub fn forget(&mut self, uid: &str) {
        self.last.retain(|(u, _), _| u != uid);
    }
}

/// Takes one change through extract -> throttle -> emit. Everything that can
/// go wrong here is local to the notification: log, count, move on.
pub struct Dispatcher {
    emitter: Box<dyn Emit>,
    throttle: Throttle,
}

impl Dispatcher {
    pub fn new(emitter: Box<dyn Emit>, throttle_period: Duration) -> Self {
        Self { emitter, throttle: Throttle::new(throttle_period) }
    }

    pub async fn dispatch(&mut self, change: &Change) {
        let source = SourceRef::from_raw(&change.raw);
        self.process(change, &source).await;
        if matches!(change.kind, ChangeKind::Deleted) {
            self.throttle.forget(&source.uid);
        }
    }

    async fn process(&mut self, change: &Change, source: &SourceRef) {
        let status = match extract_status(&change.raw) {
            Ok(Some(status)) => status,
            Ok(None) => return,
            Err(e) => {
                counter!("extract_failures_total", 1u64);
                warn!(error = %e,
                    api_version = %source.api_version, kind = %source.kind,
                    name = %source.name, namespace = ?source.namespace,
                    "extracting status; dropping notification");
                return;
            }
        };
        if status.conditions.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut admitted: Vec<Condition> = Vec::with_capacity(status.conditions.len());
        for cond in status.conditions {
            if self.throttle.admit(&source.uid, &cond.type_, now) {
                admitted.push(cond);
            } else {
                counter!("conditions_throttled_total", 1u64);
            }
        }
        if admitted.is_empty() {
            return;
        }
        self.emitter.emit(&admitted, source).await;
    }
}

/// Owns the run/stop lifecycle of the whole watch -> extract -> emit chain.
///
/// `new` performs all fatal setup (resource discovery); `run` consumes the
/// pipeline, so a stopped pipeline is never resumed. Build a new one.
pub struct Pipeline {
    hub: WatchHub,
    dispatcher: Dispatcher,
    sync_timeout: Duration,
    queue_cap: usize,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl Pipeline {
    pub async fn new(client: Client, cfg: PipelineConfig) -> Result<Self, PipelineError> {
        let hub = WatchHub::new(client.clone(), cfg.coordinate.clone(), cfg.resync).await?;
        let emitter = emitter_for(cfg.strategy, client);
        let (ready_tx, ready_rx) = watch::channel(false);
        Ok(Self {
            hub,
            dispatcher: Dispatcher::new(emitter, cfg.throttle),
            sync_timeout: cfg.sync_timeout,
            queue_cap: cfg.queue_cap,
            ready_tx,
            ready_rx,
        })
    }

    /// Readiness gate for the bootstrap layer: flips to true once the initial
    /// list has been reconciled (the "caches synced" condition).
    pub fn subscribe_ready(&self) -> watch::Receiver<bool> {
        self.ready_rx.clone()
    }

    /// Block until `stop` fires. Notifications are consumed one at a time and
    /// each emission completes before the next notification is taken; a slow
    /// event store therefore stalls the whole loop. Resync re-delivers
    /// whatever gets dropped along the way.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> Result<(), PipelineError> {
        let (tx, mut rx) = mpsc::channel::<Change>(self.queue_cap);
        let (synced_tx, mut synced_rx) = watch::channel(false);
        let hub = self.hub;
        let hub_task = tokio::spawn(async move {
            if let Err(e) = hub.run(tx, synced_tx).await {
                error!(error = %e, "watch hub failed");
            }
        });

        // Sync barrier: no notification is processed before the initial list
        // has landed in the mirror, and the caller gets a hard error if that
        // never happens.
        let deadline = Instant::now() + self.sync_timeout;
        while !*synced_rx.borrow() {
            let now = Instant::now();
            if now >= deadline {
                error!(timeout = ?self.sync_timeout, "timed out waiting for caches to sync");
                hub_task.abort();
                return Err(PipelineError::SyncTimeout);
            }
            let rem = deadline.duration_since(now).min(Duration::from_secs(2));
            tokio::select! {
                changed = tokio::time::timeout(rem, synced_rx.changed()) => {
                    if let Ok(Err(_)) = changed {
                        // Hub dropped the sender without ever syncing.
                        error!("watch hub ended before the initial sync");
                        return Err(PipelineError::SyncTimeout);
                    }
                }
                _ = stop.changed() => {
                    info!("stop signal during sync wait; shutting down");
                    hub_task.abort();
                    return Ok(());
                }
            }
        }
        let _ = self.ready_tx.send(true);
        info!("caches synced; pipeline live");

        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(change) => self.dispatcher.dispatch(&change).await,
                    None => {
                        warn!("change channel closed; watch hub ended");
                        break;
                    }
                },
                _ = stop.changed() => {
                    info!("stop signal received; shutting down pipeline");
                    break;
                }
            }
        }
        hub_task.abort();
        Ok(())
    }
}
