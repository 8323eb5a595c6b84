//! Rendered cluster objects.
//!
//! A [`Bundle`] is an ordered set of [`Manifest`]s keyed by [`ObjectRef`].
//! Iteration follows apply order because [`Kind`] orders by stage.

pub mod diff;
pub mod fingerprint;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{KilnError, Result};
use crate::labels::{FINGERPRINT_ANNOTATION, OBJECT_HASH_ANNOTATION};

pub use diff::summarize;
pub use fingerprint::{bundle_fingerprint, object_hash};

/// Object kinds kiln renders, in apply order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Kind {
    PersistentVolumeClaim,
    ConfigMap,
    Secret,
    Service,
    StatefulSet,
    Deployment,
    Ingress,
    Job,
    CronJob,
}

impl Kind {
    pub const ALL: [Kind; 9] = [
        Kind::PersistentVolumeClaim,
        Kind::ConfigMap,
        Kind::Secret,
        Kind::Service,
        Kind::StatefulSet,
        Kind::Deployment,
        Kind::Ingress,
        Kind::Job,
        Kind::CronJob,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PersistentVolumeClaim => "PersistentVolumeClaim",
            Self::ConfigMap => "ConfigMap",
            Self::Secret => "Secret",
            Self::Service => "Service",
            Self::StatefulSet => "StatefulSet",
            Self::Deployment => "Deployment",
            Self::Ingress => "Ingress",
            Self::Job => "Job",
            Self::CronJob => "CronJob",
        }
    }

    pub fn group(&self) -> &'static str {
        match self {
            Self::PersistentVolumeClaim | Self::ConfigMap | Self::Secret | Self::Service => "",
            Self::StatefulSet | Self::Deployment => "apps",
            Self::Ingress => "networking.k8s.io",
            Self::Job | Self::CronJob => "batch",
        }
    }

    pub fn version(&self) -> &'static str {
        "v1"
    }

    pub fn api_version(&self) -> String {
        match self.group() {
            "" => self.version().to_string(),
            group => format!("{}/{}", group, self.version()),
        }
    }

    pub fn plural(&self) -> &'static str {
        match self {
            Self::PersistentVolumeClaim => "persistentvolumeclaims",
            Self::ConfigMap => "configmaps",
            Self::Secret => "secrets",
            Self::Service => "services",
            Self::StatefulSet => "statefulsets",
            Self::Deployment => "deployments",
            Self::Ingress => "ingresses",
            Self::Job => "jobs",
            Self::CronJob => "cronjobs",
        }
    }

    /// Apply stage, 0 through 7. ConfigMaps and Secrets share stage 1.
    pub fn stage(&self) -> u8 {
        match self {
            Self::PersistentVolumeClaim => 0,
            Self::ConfigMap | Self::Secret => 1,
            Self::Service => 2,
            Self::StatefulSet => 3,
            Self::Deployment => 4,
            Self::Ingress => 5,
            Self::Job => 6,
            Self::CronJob => 7,
        }
    }

    /// Failures in storage, configuration and service stages abort at once.
    pub fn is_critical(&self) -> bool {
        self.stage() <= 2
    }

    /// Kinds the rollout watcher waits on.
    pub fn is_workload(&self) -> bool {
        matches!(self, Self::Deployment | Self::StatefulSet)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| KilnError::invalid("kind", format!("unsupported object kind '{}'", s)))
    }
}

/// Identity of an object: `(kind, namespace, name)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: Kind,
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(kind: Kind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// One rendered object. `body` is the full JSON document sent to the server.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub kind: Kind,
    pub namespace: String,
    pub name: String,
    pub body: Value,
}

impl Manifest {
    /// Skeleton with apiVersion, kind and metadata filled in.
    pub fn new(
        kind: Kind,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> Self {
        let mut metadata = json!({
            "name": name,
            "namespace": namespace,
            "labels": labels,
        });
        if !annotations.is_empty() {
            metadata["annotations"] = json!(annotations);
        }
        Self {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
            body: json!({
                "apiVersion": kind.api_version(),
                "kind": kind.as_str(),
                "metadata": metadata,
            }),
        }
    }

    /// Parse a full object document, reading identity from its metadata.
    pub fn from_value(body: Value) -> Result<Self> {
        let kind: Kind = body
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| KilnError::invalid("kind", "object has no kind"))?
            .parse()?;
        let name = body
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .ok_or_else(|| KilnError::invalid("metadata.name", format!("{} has no name", kind)))?
            .to_string();
        let namespace = body
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .unwrap_or("default")
            .to_string();
        Ok(Self {
            kind,
            namespace,
            name,
            body,
        })
    }

    /// Set a top-level field such as `spec` or `data`.
    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        if let Value::Object(map) = &mut self.body {
            map.insert(key.to_string(), value);
        }
        self
    }

    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(self.kind, self.namespace.clone(), self.name.clone())
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        string_map(self.body.pointer("/metadata/labels"))
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        string_map(self.body.pointer("/metadata/annotations"))
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.body
            .pointer("/metadata/annotations")
            .and_then(|a| a.get(key))
            .and_then(Value::as_str)
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        let Some(metadata) = self.body.get_mut("metadata").and_then(Value::as_object_mut) else {
            return;
        };
        let annotations = metadata
            .entry("annotations")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = annotations {
            map.insert(key.to_string(), Value::String(value.to_string()));
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(&self.body)
            .map_err(|e| KilnError::internal(format!("serialize {}: {}", self.object_ref(), e)))
    }
}

/// Read a JSON object of strings into a map, skipping non-string values.
pub(crate) fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// The render output for one app.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bundle {
    app: String,
    objects: BTreeMap<ObjectRef, Manifest>,
    fingerprint: String,
}

impl Bundle {
    pub fn new(app: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            objects: BTreeMap::new(),
            fingerprint: String::new(),
        }
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    /// Revision fingerprint; empty until [`Bundle::seal`] runs.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Add an object, rejecting a second object with the same identity.
    pub fn insert(&mut self, manifest: Manifest) -> Result<()> {
        let key = manifest.object_ref();
        if self.objects.contains_key(&key) {
            return Err(KilnError::invalid(
                "bundle",
                format!("{} would be rendered twice", key),
            ));
        }
        self.objects.insert(key, manifest);
        Ok(())
    }

    pub fn get(&self, key: &ObjectRef) -> Option<&Manifest> {
        self.objects.get(key)
    }

    pub fn contains(&self, key: &ObjectRef) -> bool {
        self.objects.contains_key(key)
    }

    /// Objects in apply order.
    pub fn iter(&self) -> impl Iterator<Item = &Manifest> {
        self.objects.values()
    }

    pub fn refs(&self) -> BTreeSet<ObjectRef> {
        self.objects.keys().cloned().collect()
    }

    pub fn of_kind(&self, kind: Kind) -> impl Iterator<Item = &Manifest> {
        self.objects.values().filter(move |m| m.kind == kind)
    }

    pub fn workloads(&self) -> impl Iterator<Item = &Manifest> {
        self.objects.values().filter(|m| m.kind.is_workload())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Compute the fingerprint and stamp it, plus each object's own hash,
    /// onto every object.
    pub fn seal(&mut self) -> &str {
        let fingerprint = bundle_fingerprint(self);
        for manifest in self.objects.values_mut() {
            let hash = object_hash(manifest);
            manifest.set_annotation(OBJECT_HASH_ANNOTATION, &hash);
            manifest.set_annotation(FINGERPRINT_ANNOTATION, &fingerprint);
        }
        self.fingerprint = fingerprint;
        &self.fingerprint
    }

    /// Multi-document YAML stream in apply order.
    pub fn to_yaml(&self) -> Result<String> {
        let mut docs = Vec::with_capacity(self.objects.len());
        for manifest in self.objects.values() {
            docs.push(manifest.to_yaml()?);
        }
        Ok(docs.join("---\n"))
    }

    /// Rebuild a bundle from a YAML stream produced by [`Bundle::to_yaml`].
    pub fn from_yaml(app: impl Into<String>, yaml: &str) -> Result<Self> {
        let mut bundle = Bundle::new(app);
        for document in serde_yaml::Deserializer::from_str(yaml) {
            let value = Value::deserialize(document)
                .map_err(|e| KilnError::internal(format!("decode stored bundle: {}", e)))?;
            if value.is_null() {
                continue;
            }
            bundle.insert(Manifest::from_value(value)?)?;
        }
        bundle.fingerprint = bundle_fingerprint(&bundle);
        Ok(bundle)
    }

    /// Check the cross-object invariants of a rendered bundle.
    ///
    /// Workload selectors must match their pod template labels, every
    /// Service must select some workload template in the bundle and every
    /// StatefulSet must name a Service in the bundle.
    pub fn check_integrity(&self) -> Result<()> {
        let mut templates = Vec::new();
        for workload in self.workloads() {
            let selector = string_map(workload.body.pointer("/spec/selector/matchLabels"));
            let template = string_map(workload.body.pointer("/spec/template/metadata/labels"));
            if selector.is_empty() || !is_subset(&selector, &template) {
                return Err(KilnError::internal(format!(
                    "{} selector does not match its pod template",
                    workload.object_ref()
                )));
            }
            if workload.kind == Kind::StatefulSet {
                let service = workload
                    .body
                    .pointer("/spec/serviceName")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let key = ObjectRef::new(Kind::Service, workload.namespace.clone(), service);
                if !self.contains(&key) {
                    return Err(KilnError::internal(format!(
                        "{} references missing service '{}'",
                        workload.object_ref(),
                        service
                    )));
                }
            }
            templates.push(template);
        }

        for service in self.of_kind(Kind::Service) {
            let selector = string_map(service.body.pointer("/spec/selector"));
            if !templates.iter().any(|t| is_subset(&selector, t)) {
                return Err(KilnError::internal(format!(
                    "{} selects no workload in the bundle",
                    service.object_ref()
                )));
            }
        }
        Ok(())
    }
}

fn is_subset(selector: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}
