//! The cluster seam.
//!
//! Every pipeline stage talks to Kubernetes through [`ClusterHandle`].
//! [`live::KubeCluster`] backs it with a live API server and
//! [`memory::MemoryCluster`] with an in-process object store.

pub mod live;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::bundle::{Manifest, ObjectRef, string_map};

pub use self::live::KubeCluster;
pub use self::memory::MemoryCluster;

/// Failures reported by a cluster backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("cluster unavailable: {0}")]
    Unavailable(String),
}

/// Server-side apply settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyParams {
    pub field_manager: String,
    pub force: bool,
}

impl ApplyParams {
    pub fn new(field_manager: impl Into<String>) -> Self {
        Self {
            field_manager: field_manager.into(),
            force: true,
        }
    }
}

/// An object as the server returned it.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveObject {
    pub body: Value,
}

impl LiveObject {
    pub fn new(body: Value) -> Self {
        Self { body }
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        string_map(self.body.pointer("/metadata/labels"))
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.body
            .pointer("/metadata/annotations")
            .and_then(|a| a.get(key))
            .and_then(Value::as_str)
    }

    /// Rollout counters of a Deployment or StatefulSet.
    pub fn rollout_status(&self) -> RolloutStatus {
        let int = |pointer: &str| self.body.pointer(pointer).and_then(Value::as_i64).unwrap_or(0);
        RolloutStatus {
            generation: int("/metadata/generation"),
            observed_generation: int("/status/observedGeneration"),
            desired: self
                .body
                .pointer("/spec/replicas")
                .and_then(Value::as_i64)
                .unwrap_or(1),
            updated: int("/status/updatedReplicas"),
            ready: int("/status/readyReplicas"),
            available: int("/status/availableReplicas"),
        }
    }

    /// Label selector of a workload.
    pub fn selector(&self) -> BTreeMap<String, String> {
        string_map(self.body.pointer("/spec/selector/matchLabels"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RolloutStatus {
    pub generation: i64,
    pub observed_generation: i64,
    pub desired: i64,
    pub updated: i64,
    pub ready: i64,
    pub available: i64,
}

impl RolloutStatus {
    pub fn is_complete(&self) -> bool {
        self.observed_generation >= self.generation
            && self.updated == self.desired
            && self.ready == self.desired
            && self.available == self.desired
    }
}

/// A container stuck in a waiting state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitingContainer {
    pub container: String,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSnapshot {
    pub name: String,
    pub waiting: Vec<WaitingContainer>,
}

/// A Secret read or written as raw bytes. `resource_version` is `None` for
/// a Secret that does not exist yet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoredSecret {
    pub namespace: String,
    pub name: String,
    pub type_: String,
    pub labels: BTreeMap<String, String>,
    pub data: BTreeMap<String, Vec<u8>>,
    pub resource_version: Option<String>,
}

impl StoredSecret {
    /// Data entries that are valid UTF-8.
    pub fn string_data(&self) -> BTreeMap<String, String> {
        self.data
            .iter()
            .filter_map(|(k, v)| String::from_utf8(v.clone()).ok().map(|s| (k.clone(), s)))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NamespaceInfo {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

/// Operations the pipeline needs from a cluster.
#[async_trait]
pub trait ClusterHandle: Send + Sync {
    /// Name of the kube context this handle talks to.
    fn context(&self) -> String;

    async fn get(&self, target: &ObjectRef) -> Result<Option<LiveObject>, ClusterError>;

    /// Server-side apply of a full object.
    async fn apply(
        &self,
        manifest: &Manifest,
        params: &ApplyParams,
    ) -> Result<LiveObject, ClusterError>;

    async fn delete(&self, target: &ObjectRef) -> Result<(), ClusterError>;

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PodSnapshot>, ClusterError>;

    async fn read_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StoredSecret>, ClusterError>;

    /// Create the Secret when it has no resource version, otherwise replace
    /// it with the version as precondition; a stale version is `Conflict`.
    async fn write_secret(&self, secret: &StoredSecret) -> Result<StoredSecret, ClusterError>;

    async fn get_namespace(&self, name: &str) -> Result<Option<NamespaceInfo>, ClusterError>;

    async fn ensure_namespace(&self, namespace: &NamespaceInfo) -> Result<(), ClusterError>;

    async fn list_namespaces(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<NamespaceInfo>, ClusterError>;

    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError>;
}

/// Render a label selector as `k=v,k2=v2`.
pub fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rollout_complete_requires_all_counters() {
        let live = LiveObject::new(json!({
            "metadata": {"generation": 2},
            "spec": {"replicas": 3},
            "status": {
                "observedGeneration": 2,
                "updatedReplicas": 3,
                "readyReplicas": 3,
                "availableReplicas": 2
            }
        }));
        let status = live.rollout_status();
        assert_eq!(status.desired, 3);
        assert!(!status.is_complete());
    }

    #[test]
    fn stale_observed_generation_is_incomplete() {
        let status = RolloutStatus {
            generation: 3,
            observed_generation: 2,
            desired: 1,
            updated: 1,
            ready: 1,
            available: 1,
        };
        assert!(!status.is_complete());
    }

    #[test]
    fn selector_string_joins_pairs() {
        let selector = BTreeMap::from([
            ("app".to_string(), "shop".to_string()),
            ("tier".to_string(), "web".to_string()),
        ]);
        assert_eq!(selector_string(&selector), "app=shop,tier=web");
    }
}
