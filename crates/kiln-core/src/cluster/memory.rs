//! In-process [`ClusterHandle`].
//!
//! Keeps namespaces and objects in memory, reports workloads as rolled out
//! unless told otherwise, and derives pods from workload replica counts.
//! Failures, stalled rollouts, crashing pods and write conflicts can be
//! injected.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};

use super::{
    ApplyParams, ClusterError, ClusterHandle, LiveObject, NamespaceInfo, PodSnapshot,
    StoredSecret, WaitingContainer,
};
use crate::bundle::fingerprint::semantic_body;
use crate::bundle::{Kind, Manifest, ObjectRef, string_map};

#[derive(Debug, Clone)]
struct StoredObject {
    body: Value,
    field_manager: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    namespaces: BTreeMap<String, NamespaceInfo>,
    objects: BTreeMap<ObjectRef, StoredObject>,
    revision: u64,
    apply_failures: BTreeMap<ObjectRef, ClusterError>,
    stalled: BTreeSet<ObjectRef>,
    pod_failures: BTreeMap<ObjectRef, (String, String)>,
    secret_conflicts: usize,
    applied: Vec<ObjectRef>,
    deleted: Vec<ObjectRef>,
}

impl State {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }
}

/// In-memory cluster with failure injection.
#[derive(Debug)]
pub struct MemoryCluster {
    context: String,
    state: Mutex<State>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self {
            context: "memory".to_string(),
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_namespace(self, name: &str) -> Self {
        self.create_namespace(name);
        self
    }

    pub fn create_namespace(&self, name: &str) {
        self.state.lock().namespaces.insert(
            name.to_string(),
            NamespaceInfo {
                name: name.to_string(),
                ..Default::default()
            },
        );
    }

    /// Make every apply of `target` fail with `error`.
    pub fn fail_apply(&self, target: ObjectRef, error: ClusterError) {
        self.state.lock().apply_failures.insert(target, error);
    }

    /// Keep `workload` at zero ready replicas.
    pub fn stall_rollout(&self, workload: ObjectRef) {
        self.state.lock().stalled.insert(workload);
    }

    /// Report the pods of `workload` as waiting with `reason`.
    pub fn inject_pod_failure(&self, workload: ObjectRef, reason: &str, message: &str) {
        self.state
            .lock()
            .pod_failures
            .insert(workload, (reason.to_string(), message.to_string()));
    }

    /// Fail the next `count` Secret writes with a conflict.
    pub fn conflict_next_secret_writes(&self, count: usize) {
        self.state.lock().secret_conflicts = count;
    }

    /// Store an object as if someone else created it.
    pub fn insert_foreign(&self, manifest: &Manifest) {
        let mut state = self.state.lock();
        let rv = state.next_revision();
        let mut body = manifest.body.clone();
        stamp_server_fields(&mut body, &rv, 1);
        state.objects.insert(
            manifest.object_ref(),
            StoredObject {
                body,
                field_manager: None,
            },
        );
    }

    /// Every successful apply in call order.
    pub fn applied(&self) -> Vec<ObjectRef> {
        self.state.lock().applied.clone()
    }

    /// Every successful delete in call order.
    pub fn deleted(&self) -> Vec<ObjectRef> {
        self.state.lock().deleted.clone()
    }

    pub fn contains(&self, target: &ObjectRef) -> bool {
        self.state.lock().objects.contains_key(target)
    }

    /// Stored body of an object, without computed status.
    pub fn object(&self, target: &ObjectRef) -> Option<Value> {
        self.state.lock().objects.get(target).map(|o| o.body.clone())
    }

    /// Field manager that last applied `target`.
    pub fn field_manager(&self, target: &ObjectRef) -> Option<String> {
        self.state
            .lock()
            .objects
            .get(target)
            .and_then(|o| o.field_manager.clone())
    }

    pub fn object_refs(&self) -> Vec<ObjectRef> {
        self.state.lock().objects.keys().cloned().collect()
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.state.lock().namespaces.contains_key(name)
    }

    fn with_status(state: &State, target: &ObjectRef, stored: &StoredObject) -> LiveObject {
        let mut body = stored.body.clone();
        if target.kind.is_workload() {
            let generation = body
                .pointer("/metadata/generation")
                .and_then(Value::as_i64)
                .unwrap_or(1);
            let desired = body
                .pointer("/spec/replicas")
                .and_then(Value::as_i64)
                .unwrap_or(1);
            let healthy = !state.stalled.contains(target) && !state.pod_failures.contains_key(target);
            let ready = if healthy { desired } else { 0 };
            body["status"] = json!({
                "observedGeneration": generation,
                "replicas": desired,
                "updatedReplicas": ready,
                "readyReplicas": ready,
                "availableReplicas": ready,
            });
        }
        LiveObject::new(body)
    }
}

fn stamp_server_fields(body: &mut Value, resource_version: &str, generation: i64) {
    if let Some(metadata) = body.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.insert("resourceVersion".into(), json!(resource_version));
        metadata.insert("generation".into(), json!(generation));
        metadata
            .entry("uid")
            .or_insert_with(|| json!(format!("uid-{}", resource_version)));
        metadata
            .entry("creationTimestamp")
            .or_insert_with(|| json!(chrono::Utc::now().to_rfc3339()));
    }
}

fn spec_of(body: &Value) -> Value {
    let mut semantic = semantic_body(body);
    if let Some(root) = semantic.as_object_mut() {
        root.remove("metadata");
    }
    semantic
}

fn secret_body(secret: &StoredSecret) -> Value {
    let data: Map<String, Value> = secret
        .data
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(BASE64.encode(v))))
        .collect();
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {
            "name": secret.name,
            "namespace": secret.namespace,
            "labels": secret.labels,
        },
        "type": secret.type_,
        "data": data,
    })
}

fn secret_from_body(namespace: &str, name: &str, body: &Value) -> StoredSecret {
    let data = body
        .get("data")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| {
                    let decoded = BASE64.decode(v.as_str()?).ok()?;
                    Some((k.clone(), decoded))
                })
                .collect()
        })
        .unwrap_or_default();
    StoredSecret {
        namespace: namespace.to_string(),
        name: name.to_string(),
        type_: body
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("Opaque")
            .to_string(),
        labels: string_map(body.pointer("/metadata/labels")),
        data,
        resource_version: body
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

fn not_found_namespace(namespace: &str) -> ClusterError {
    ClusterError::NotFound(format!("namespaces \"{}\" not found", namespace))
}

#[async_trait]
impl ClusterHandle for MemoryCluster {
    fn context(&self) -> String {
        self.context.clone()
    }

    async fn get(&self, target: &ObjectRef) -> Result<Option<LiveObject>, ClusterError> {
        let state = self.state.lock();
        Ok(state
            .objects
            .get(target)
            .map(|stored| Self::with_status(&state, target, stored)))
    }

    async fn apply(
        &self,
        manifest: &Manifest,
        params: &ApplyParams,
    ) -> Result<LiveObject, ClusterError> {
        let target = manifest.object_ref();
        let mut state = self.state.lock();

        if let Some(error) = state.apply_failures.get(&target) {
            return Err(error.clone());
        }
        if !state.namespaces.contains_key(&manifest.namespace) {
            return Err(not_found_namespace(&manifest.namespace));
        }
        if manifest.body.get("kind").and_then(Value::as_str) != Some(manifest.kind.as_str()) {
            return Err(ClusterError::Invalid(format!(
                "{}: kind does not match body",
                target
            )));
        }

        let generation = match state.objects.get(&target) {
            Some(existing) => {
                let current = existing
                    .body
                    .pointer("/metadata/generation")
                    .and_then(Value::as_i64)
                    .unwrap_or(1);
                if spec_of(&existing.body) == spec_of(&manifest.body) {
                    current
                } else {
                    current + 1
                }
            }
            None => 1,
        };

        let rv = state.next_revision();
        let mut body = manifest.body.clone();
        if let Some(existing) = state.objects.get(&target) {
            for field in ["uid", "creationTimestamp"] {
                if let Some(value) = existing.body.pointer(&format!("/metadata/{}", field)) {
                    body["metadata"][field] = value.clone();
                }
            }
        }
        stamp_server_fields(&mut body, &rv, generation);

        let stored = StoredObject {
            body,
            field_manager: Some(params.field_manager.clone()),
        };
        let live = Self::with_status(&state, &target, &stored);
        state.objects.insert(target.clone(), stored);
        state.applied.push(target);
        Ok(live)
    }

    async fn delete(&self, target: &ObjectRef) -> Result<(), ClusterError> {
        let mut state = self.state.lock();
        if state.objects.remove(target).is_none() {
            return Err(ClusterError::NotFound(target.to_string()));
        }
        state.deleted.push(target.clone());
        Ok(())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PodSnapshot>, ClusterError> {
        let state = self.state.lock();
        let mut pods = Vec::new();

        for (target, stored) in &state.objects {
            if !target.kind.is_workload() || target.namespace != namespace {
                continue;
            }
            let labels = string_map(stored.body.pointer("/spec/template/metadata/labels"));
            if !selector.iter().all(|(k, v)| labels.get(k) == Some(v)) {
                continue;
            }

            let desired = stored
                .body
                .pointer("/spec/replicas")
                .and_then(Value::as_i64)
                .unwrap_or(1);
            let failure = state.pod_failures.get(target);
            let count = if failure.is_some() { desired.max(1) } else { desired };
            let container = stored
                .body
                .pointer("/spec/template/spec/containers/0/name")
                .and_then(Value::as_str)
                .unwrap_or(&target.name)
                .to_string();

            for i in 0..count {
                let name = match target.kind {
                    Kind::StatefulSet => format!("{}-{}", target.name, i),
                    _ => format!("{}-5d8c7b9f6-{}", target.name, i),
                };
                let waiting = failure
                    .map(|(reason, message)| {
                        vec![WaitingContainer {
                            container: container.clone(),
                            reason: reason.clone(),
                            message: message.clone(),
                        }]
                    })
                    .unwrap_or_default();
                pods.push(PodSnapshot { name, waiting });
            }
        }
        Ok(pods)
    }

    async fn read_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StoredSecret>, ClusterError> {
        let state = self.state.lock();
        let key = ObjectRef::new(Kind::Secret, namespace, name);
        Ok(state
            .objects
            .get(&key)
            .map(|stored| secret_from_body(namespace, name, &stored.body)))
    }

    async fn write_secret(&self, secret: &StoredSecret) -> Result<StoredSecret, ClusterError> {
        let mut state = self.state.lock();
        if state.secret_conflicts > 0 {
            state.secret_conflicts -= 1;
            return Err(ClusterError::Conflict(format!(
                "secrets \"{}\": the object has been modified",
                secret.name
            )));
        }
        if !state.namespaces.contains_key(&secret.namespace) {
            return Err(not_found_namespace(&secret.namespace));
        }

        let key = ObjectRef::new(Kind::Secret, secret.namespace.clone(), secret.name.clone());
        let current = state.objects.get(&key).and_then(|o| {
            o.body
                .pointer("/metadata/resourceVersion")
                .and_then(Value::as_str)
                .map(str::to_string)
        });
        match (&secret.resource_version, &current) {
            (None, Some(_)) => {
                return Err(ClusterError::Conflict(format!(
                    "secrets \"{}\" already exists",
                    secret.name
                )));
            }
            (Some(_), None) => {
                return Err(ClusterError::NotFound(format!(
                    "secrets \"{}\" not found",
                    secret.name
                )));
            }
            (Some(expected), Some(actual)) if expected != actual => {
                return Err(ClusterError::Conflict(format!(
                    "secrets \"{}\": the object has been modified",
                    secret.name
                )));
            }
            _ => {}
        }

        let rv = state.next_revision();
        let mut body = secret_body(secret);
        stamp_server_fields(&mut body, &rv, 1);
        let written = secret_from_body(&secret.namespace, &secret.name, &body);
        state.objects.insert(
            key,
            StoredObject {
                body,
                field_manager: None,
            },
        );
        Ok(written)
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<NamespaceInfo>, ClusterError> {
        Ok(self.state.lock().namespaces.get(name).cloned())
    }

    async fn ensure_namespace(&self, namespace: &NamespaceInfo) -> Result<(), ClusterError> {
        self.state
            .lock()
            .namespaces
            .entry(namespace.name.clone())
            .or_insert_with(|| namespace.clone());
        Ok(())
    }

    async fn list_namespaces(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<NamespaceInfo>, ClusterError> {
        Ok(self
            .state
            .lock()
            .namespaces
            .values()
            .filter(|ns| selector.iter().all(|(k, v)| ns.labels.get(k) == Some(v)))
            .cloned()
            .collect())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError> {
        let mut state = self.state.lock();
        if state.namespaces.remove(name).is_none() {
            return Err(not_found_namespace(name));
        }
        state.objects.retain(|key, _| key.namespace != name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::base_labels;

    fn deployment(replicas: i64) -> Manifest {
        Manifest::new(
            Kind::Deployment,
            "default",
            "web",
            &base_labels("web"),
            &BTreeMap::new(),
        )
        .with_field(
            "spec",
            json!({
                "replicas": replicas,
                "selector": {"matchLabels": {"app": "web"}},
                "template": {
                    "metadata": {"labels": {"app": "web"}},
                    "spec": {"containers": [{"name": "web", "image": "web:1"}]}
                }
            }),
        )
    }

    #[tokio::test]
    async fn apply_bumps_generation_only_on_spec_change() {
        let cluster = MemoryCluster::new().with_namespace("default");
        let params = ApplyParams::new("kiln");

        let first = cluster.apply(&deployment(2), &params).await.expect("apply");
        assert_eq!(first.rollout_status().generation, 1);
        let same = cluster.apply(&deployment(2), &params).await.expect("apply");
        assert_eq!(same.rollout_status().generation, 1);
        let scaled = cluster.apply(&deployment(3), &params).await.expect("apply");
        assert_eq!(scaled.rollout_status().generation, 2);
        assert!(scaled.rollout_status().is_complete());
    }

    #[tokio::test]
    async fn apply_into_missing_namespace_is_not_found() {
        let cluster = MemoryCluster::new();
        let err = cluster
            .apply(&deployment(1), &ApplyParams::new("kiln"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NotFound(_)));
    }

    #[tokio::test]
    async fn pods_follow_selector_and_failures() {
        let cluster = MemoryCluster::new().with_namespace("default");
        cluster
            .apply(&deployment(2), &ApplyParams::new("kiln"))
            .await
            .expect("apply");
        let target = ObjectRef::new(Kind::Deployment, "default", "web");
        cluster.inject_pod_failure(target, "ImagePullBackOff", "pull access denied");

        let selector = BTreeMap::from([("app".to_string(), "web".to_string())]);
        let pods = cluster.list_pods("default", &selector).await.expect("list");
        assert_eq!(pods.len(), 2);
        assert_eq!(pods[0].waiting[0].reason, "ImagePullBackOff");

        let other = BTreeMap::from([("app".to_string(), "api".to_string())]);
        assert!(cluster.list_pods("default", &other).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn secret_writes_check_resource_version() {
        let cluster = MemoryCluster::new().with_namespace("default");
        let mut secret = StoredSecret {
            namespace: "default".into(),
            name: "record".into(),
            type_: "Opaque".into(),
            data: BTreeMap::from([("k".to_string(), b"v1".to_vec())]),
            ..Default::default()
        };
        let written = cluster.write_secret(&secret).await.expect("create");
        assert!(written.resource_version.is_some());

        // Creating again without a version races with the first writer.
        let err = cluster.write_secret(&secret).await.unwrap_err();
        assert!(matches!(err, ClusterError::Conflict(_)));

        secret.resource_version = written.resource_version.clone();
        secret.data.insert("k".into(), b"v2".to_vec());
        cluster.write_secret(&secret).await.expect("replace");

        let err = cluster.write_secret(&secret).await.unwrap_err();
        assert!(matches!(err, ClusterError::Conflict(_)), "stale version must conflict");

        let read = cluster
            .read_secret("default", "record")
            .await
            .expect("read")
            .expect("exists");
        assert_eq!(read.data["k"], b"v2".to_vec());
    }
}
