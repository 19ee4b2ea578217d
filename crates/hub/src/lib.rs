//! condwatch hub – discovery and watcher wiring for the configured resource

#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::TryStreamExt;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use condwatch_core::{Change, ChangeKind, ResourceCoordinate};

/// Kube client from the ambient environment (kubeconfig or in-cluster).
pub async fn get_kube_client() -> Result<Client> {
    Ok(Client::try_default().await?)
}

/// Resolve a `{group, version, resource}` coordinate to a concrete API
/// resource via server discovery. The coordinate names the plural resource,
/// so we match on `plural`, not kind.
async fn find_api_resource(
    client: Client,
    coord: &ResourceCoordinate,
) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        if group.name() != coord.group {
            continue;
        }
        for (ar, caps) in group.versioned_resources(&coord.version) {
            if ar.plural == coord.resource {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar, namespaced));
            }
        }
    }
    Err(anyhow!("resource not served by the cluster: {}", coord))
}

/// Cluster-wide list+watch for one resource type, mirrored locally and
/// periodically re-delivered.
///
/// Construction resolves the coordinate through discovery; failure there is
/// fatal and surfaces before anything starts running.
pub struct WatchHub {
    client: Client,
    ar: ApiResource,
    coordinate: ResourceCoordinate,
    resync: Duration,
}

impl WatchHub {
    pub async fn new(
        client: Client,
        coordinate: ResourceCoordinate,
        resync: Duration,
    ) -> Result<Self> {
        let (ar, namespaced) = find_api_resource(client.clone(), &coordinate).await?;
        info!(coordinate = %coordinate, kind = %ar.kind, namespaced, "resolved watched resource");
        Ok(Self { client, ar, coordinate, resync })
    }

    pub fn api_resource(&self) -> &ApiResource {
        &self.ar
    }

    /// Drive the watch loop until the change receiver goes away.
    ///
    /// Every observed add/update/delete is forwarded as one `Change`. The
    /// local mirror is rebuilt on each watch (re)list, and a ticker replays
    /// the whole mirror as synthetic `Resynced` changes once per resync
    /// interval, which is the pipeline's implicit retry for anything dropped.
    ///
    /// `synced` flips to true once the initial full list has been reconciled
    /// into the mirror.
    pub async fn run(
        self,
        changes: mpsc::Sender<Change>,
        synced: watch::Sender<bool>,
    ) -> Result<()> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &self.ar);
        let stream = watcher::watcher(api, watcher::Config::default());
        futures::pin_mut!(stream);

        let mut mirror: FxHashMap<String, serde_json::Value> = FxHashMap::default();
        let mut resync = tokio::time::interval_at(
            tokio::time::Instant::now() + self.resync,
            self.resync,
        );
        resync.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(coordinate = %self.coordinate, resync = ?self.resync, "watch hub started");
        loop {
            tokio::select! {
                ev = stream.try_next() => match ev {
                    Ok(Some(Event::Applied(obj))) => {
                        let Some((uid, raw)) = mirror_entry(&obj) else { continue };
                        mirror.insert(uid, raw.clone());
                        if !forward(&changes, ChangeKind::Applied, raw).await {
                            break;
                        }
                    }
                    Ok(Some(Event::Deleted(obj))) => {
                        let Some((uid, raw)) = mirror_entry(&obj) else { continue };
                        mirror.remove(&uid);
                        if !forward(&changes, ChangeKind::Deleted, raw).await {
                            break;
                        }
                    }
                    Ok(Some(Event::Restarted(list))) => {
                        debug!(count = list.len(), "watch (re)list");
                        mirror.clear();
                        let mut batch = Vec::with_capacity(list.len());
                        for obj in &list {
                            let Some((uid, raw)) = mirror_entry(obj) else { continue };
                            mirror.insert(uid, raw.clone());
                            batch.push(raw);
                        }
                        // The cache is reconciled; readiness does not wait for
                        // the notifications below to drain.
                        let _ = synced.send(true);
                        let mut stop = false;
                        for raw in batch {
                            if !forward(&changes, ChangeKind::Applied, raw).await {
                                stop = true;
                                break;
                            }
                        }
                        if stop {
                            break;
                        }
                    }
                    Ok(None) => {
                        warn!("watch stream ended");
                        break;
                    }
                    Err(e) => {
                        // watcher re-establishes the session itself; the next
                        // relist will reconcile whatever was missed.
                        warn!(error = %e, "watch stream error; continuing");
                    }
                },
                _ = resync.tick() => {
                    counter!("watch_resync_total", 1u64);
                    debug!(count = mirror.len(), "resync replay");
                    let mut stop = false;
                    for raw in mirror.values() {
                        if !forward(&changes, ChangeKind::Resynced, raw.clone()).await {
                            stop = true;
                            break;
                        }
                    }
                    if stop {
                        break;
                    }
                }
            }
        }
        info!("watch hub stopped");
        Ok(())
    }
}

/// Returns false when the receiving side is gone (shutdown).
async fn forward(changes: &mpsc::Sender<Change>, kind: ChangeKind, raw: serde_json::Value) -> bool {
    counter!("watch_changes_total", 1u64);
    changes.send(Change { kind, raw }).await.is_ok()
}

/// Raw JSON plus mirror key for one object. Objects without a uid cannot be
/// mirrored; they are logged and skipped rather than killing the loop.
fn mirror_entry(obj: &DynamicObject) -> Option<(String, serde_json::Value)> {
    let Some(uid) = obj.metadata.uid.clone() else {
        warn!(name = ?obj.metadata.name, "object missing metadata.uid; skipping");
        return None;
    };
    match serde_json::to_value(obj) {
        Ok(mut raw) => {
            strip_managed_fields(&mut raw);
            Some((uid, raw))
        }
        Err(e) => {
            warn!(error = %e, name = ?obj.metadata.name, "serializing object; skipping");
            None
        }
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}
