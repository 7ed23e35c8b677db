//! Steward core types: keys, snapshots, feed events and the reconcile contract.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity of a watched object. Carries just enough to compute the key,
/// so it doubles as the deletion tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self { namespace: Some(namespace.to_string()), name: name.to_string() }
    }

    pub fn cluster(name: &str) -> Self {
        Self { namespace: None, name: name.to_string() }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::from(self)
    }
}

/// `namespace/name` for namespaced objects, bare `name` for cluster-scoped
/// ones. Stable for the lifetime of a resource and computable from both a
/// live object and a tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&ObjectRef> for ResourceKey {
    fn from(r: &ObjectRef) -> Self {
        match r.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => ResourceKey(format!("{}/{}", ns, r.name)),
            _ => ResourceKey(r.name.clone()),
        }
    }
}

impl From<&str> for ResourceKey {
    fn from(s: &str) -> Self {
        ResourceKey(s.to_string())
    }
}

impl From<String> for ResourceKey {
    fn from(s: String) -> Self {
        ResourceKey(s)
    }
}

/// Last-observed full state of one resource. Handed to readers as
/// `Arc<ResourceSnapshot>` out of an immutable map, never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub meta: ObjectRef,
    /// Opaque version from the remote store, when it provides one.
    pub resource_version: Option<String>,
    pub raw: serde_json::Value,
}

impl ResourceSnapshot {
    pub fn key(&self) -> ResourceKey {
        self.meta.key()
    }
}

/// One observation from the upstream list+watch feed.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// Object created or modified (level-triggered: the delta is irrelevant).
    Applied(ResourceSnapshot),
    /// Object removed; only the tombstone survives.
    Deleted(ObjectRef),
    /// Full relist. The first one observed marks the cache as synced.
    Restarted(Vec<ResourceSnapshot>),
}

/// Error taxonomy for reconcile actions.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Concurrent modification detected while reading or writing remote
    /// state. Retried inline a bounded number of times before it counts
    /// as a failure.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Anything else; requeued with backoff by the work queue.
    #[error(transparent)]
    Fail(#[from] anyhow::Error),
}

impl ReconcileError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, ReconcileError::Conflict(_))
    }
}

/// The pluggable reconcile action. Implementations must be idempotent:
/// redundant invocations for an unchanged resource are expected, and the
/// same key may be handed back after a crash without any dedup help.
#[async_trait::async_trait]
pub trait Reconcile: Send + Sync {
    /// `obj` is `None` when the resource no longer exists; that is the
    /// deletion branch, not an error.
    async fn reconcile(
        &self,
        key: &ResourceKey,
        obj: Option<Arc<ResourceSnapshot>>,
    ) -> Result<(), ReconcileError>;
}

pub mod prelude {
    pub use super::{FeedEvent, ObjectRef, Reconcile, ReconcileError, ResourceKey, ResourceSnapshot};
}
