//! Kubernetes feed for steward: discovery plus a list+watch adapter that
//! turns kube watcher events into the generic [`FeedEvent`] stream consumed
//! by the store ingest loop.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use kube::{
    api::Api,
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use serde::{Deserialize, Serialize};
use steward_core::{FeedEvent, ObjectRef, ResourceSnapshot};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Discover served resources (incl. CRDs) using kube Discovery.
pub async fn discover() -> Result<Vec<DiscoveredResource>> {
    let client = Client::try_default().await?;
    let discovery = Discovery::new(client).run().await?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            let namespaced = matches!(caps.scope, Scope::Namespaced);
            out.push(DiscoveredResource {
                group: ar.group.clone(),
                version: ar.version.clone(),
                kind: ar.kind.clone(),
                namespaced,
            });
        }
    }
    // Stable-ish order
    out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    Ok(out)
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() }),
        [group, version, kind] => Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(kube::core::ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn object_ref(obj: &DynamicObject) -> Result<ObjectRef> {
    let name = obj
        .metadata
        .name
        .clone()
        .ok_or_else(|| anyhow!("object missing metadata.name"))?;
    Ok(ObjectRef { namespace: obj.metadata.namespace.clone(), name })
}

fn snapshot_from(obj: &DynamicObject) -> Result<ResourceSnapshot> {
    let meta = object_ref(obj)?;
    let resource_version = obj.metadata.resource_version.clone();
    let mut raw = serde_json::to_value(obj).context("serializing watched object")?;
    strip_managed_fields(&mut raw);
    Ok(ResourceSnapshot { meta, resource_version, raw })
}

/// Start list+watch for a given GVK key and send feed events into the
/// provided channel. The first relist the watcher delivers becomes
/// `FeedEvent::Restarted`, which is what flips the cache sync flag.
pub async fn start_watcher(gvk_key: &str, namespace: Option<&str>, tx: mpsc::Sender<FeedEvent>) -> Result<()> {
    let client = Client::try_default().await?;
    let gvk = parse_gvk_key(gvk_key)?;
    let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;

    let api: Api<DynamicObject> = if namespaced {
        match namespace {
            Some(ns) => Api::namespaced_with(client.clone(), ns, &ar),
            None => Api::all_with(client.clone(), &ar),
        }
    } else {
        Api::all_with(client.clone(), &ar)
    };

    let cfg = watcher::Config::default();
    let stream = watcher::watcher(api, cfg);
    futures::pin_mut!(stream);
    info!(gvk = %gvk_key, ns = ?namespace, "watcher started");
    while let Some(ev) = stream.try_next().await? {
        match ev {
            Event::Applied(o) => {
                let snap = snapshot_from(&o)?;
                let _ = tx.send(FeedEvent::Applied(snap)).await;
            }
            Event::Deleted(o) => {
                let tombstone = object_ref(&o)?;
                let _ = tx.send(FeedEvent::Deleted(tombstone)).await;
            }
            Event::Restarted(list) => {
                debug!(count = list.len(), "watch restart");
                let mut snaps = Vec::with_capacity(list.len());
                for o in list.iter() {
                    snaps.push(snapshot_from(o)?);
                }
                let _ = tx.send(FeedEvent::Restarted(snaps)).await;
            }
        }
    }
    warn!("watcher stream ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dynamic(raw: serde_json::Value) -> DynamicObject {
        serde_json::from_value(raw).expect("valid DynamicObject json")
    }

    #[test]
    fn gvk_key_roundtrip() {
        let core = parse_gvk_key("v1/Pod").unwrap();
        assert_eq!(core.group, "");
        assert_eq!(core.kind, "Pod");
        let grouped = parse_gvk_key("apps/v1/Deployment").unwrap();
        assert_eq!(grouped.group, "apps");
        assert!(parse_gvk_key("too/many/parts/here").is_err());
    }

    #[test]
    fn snapshot_carries_key_and_drops_managed_fields() {
        let obj = dynamic(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "pod-a",
                "namespace": "ns1",
                "resourceVersion": "7",
                "managedFields": [{"manager": "kubelet"}]
            }
        }));
        let snap = snapshot_from(&obj).unwrap();
        assert_eq!(snap.key().as_str(), "ns1/pod-a");
        assert_eq!(snap.resource_version.as_deref(), Some("7"));
        assert!(snap.raw["metadata"].get("managedFields").is_none());
    }

    #[test]
    fn nameless_objects_are_rejected() {
        let obj = dynamic(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "namespace": "ns1" }
        }));
        assert!(object_ref(&obj).is_err());
    }
}
