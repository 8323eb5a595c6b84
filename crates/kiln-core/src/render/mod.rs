//! Renderer: [`AppModel`] to [`Bundle`].
//!
//! Rendering validates the model first, then synthesizes configuration,
//! workloads, services, ingress, storage, jobs and dependency backends, and
//! finally seals the bundle with its revision fingerprint.

mod dependency;
mod workload;

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};

use crate::bundle::{Bundle, Kind, Manifest};
use crate::error::Result;
use crate::labels::{OWNER_ANNOTATION, component_labels};
use crate::model::envfile::read_env_file;
use crate::model::{AppModel, Topology, validate};

pub use dependency::{DependencyProfile, derive_password, profile};

/// Inputs to a render beyond the model itself.
#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    /// Target namespace; overrides the model's namespace when set.
    pub namespace: Option<String>,
    /// Decoded data of Secrets already in the cluster, keyed by name.
    pub existing_secrets: BTreeMap<String, BTreeMap<String, String>>,
    /// Salt for dependency passwords that do not exist yet.
    /// A random salt is drawn when unset.
    pub salt: Option<String>,
}

impl RenderContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_salt(mut self, salt: impl Into<String>) -> Self {
        self.salt = Some(salt.into());
        self
    }

    pub fn with_existing_secret(
        mut self,
        name: impl Into<String>,
        data: BTreeMap<String, String>,
    ) -> Self {
        self.existing_secrets.insert(name.into(), data);
        self
    }
}

/// Render a validated, sealed bundle for `model`.
pub fn render(model: &AppModel, ctx: &RenderContext) -> Result<Bundle> {
    validate(model)?;

    let mut model = model.clone();
    if let Some(namespace) = &ctx.namespace {
        model.namespace = namespace.clone();
    }
    let secret_values = collect_secret_values(&model)?;

    let renderer = Renderer {
        model: &model,
        annotations: BTreeMap::from([(OWNER_ANNOTATION.to_string(), model.name.clone())]),
    };
    let mut bundle = Bundle::new(model.name.clone());

    let sources = renderer.config_sources(&secret_values, &mut bundle)?;

    for service in &model.services {
        bundle.insert(renderer.deployment(service, &sources))?;
        bundle.insert(renderer.service(service))?;
    }
    for volume in &model.volumes {
        bundle.insert(renderer.volume_claim(volume))?;
    }
    for rule in &model.ingress {
        bundle.insert(renderer.ingress(rule))?;
    }
    for job in &model.jobs {
        bundle.insert(renderer.job(job, &sources))?;
    }
    for dep in &model.dependencies {
        for manifest in renderer.dependency(dep, ctx) {
            bundle.insert(manifest)?;
        }
    }

    bundle.check_integrity()?;
    let fingerprint = bundle.seal().to_string();
    tracing::debug!(
        app = %model.name,
        namespace = %model.namespace,
        objects = bundle.len(),
        fingerprint = %fingerprint,
        "rendered bundle"
    );
    Ok(bundle)
}

/// Names of the credential Secrets a render of `model` would reuse.
pub fn dependency_secret_names(model: &AppModel) -> Vec<String> {
    model
        .dependencies
        .iter()
        .filter(|dep| profile(dep.kind).credentialed)
        .map(|dep| model.dependency_name(dep.kind))
        .collect()
}

/// Literal secrets first, then the env file; later keys win.
fn collect_secret_values(model: &AppModel) -> Result<BTreeMap<String, String>> {
    let mut values = model.secrets.literal.clone();
    if let Some(path) = &model.secrets.env_file {
        for (key, value) in read_env_file(path)? {
            values.insert(key, value);
        }
    }
    Ok(values)
}

/// ConfigMaps and Secrets a workload container pulls in with `envFrom`.
#[derive(Debug, Default)]
struct ConfigSources {
    shared_config: Option<String>,
    service_configs: BTreeMap<String, String>,
    secret: Option<String>,
}

struct Renderer<'a> {
    model: &'a AppModel,
    annotations: BTreeMap<String, String>,
}

impl Renderer<'_> {
    fn manifest(&self, kind: Kind, name: &str, component: &str) -> Manifest {
        Manifest::new(
            kind,
            &self.model.namespace,
            name,
            &component_labels(&self.model.name, component),
            &self.annotations,
        )
    }

    /// Render the env ConfigMaps and the app Secret into `bundle`.
    fn config_sources(
        &self,
        secret_values: &BTreeMap<String, String>,
        bundle: &mut Bundle,
    ) -> Result<ConfigSources> {
        let model = self.model;
        let mut sources = ConfigSources::default();

        let mut shared = model.env.clone();
        if model.topology == Topology::Single {
            shared.extend(model.services.iter().flat_map(|s| s.env.iter().cloned()));
        }
        if let Some(data) = env_data(&shared) {
            let name = model.config_map_name();
            bundle.insert(self.manifest(Kind::ConfigMap, &name, "config").with_field("data", data))?;
            sources.shared_config = Some(name);
        }

        if model.topology == Topology::Multi {
            for service in &model.services {
                if let Some(data) = env_data(&service.env) {
                    let name = format!("{}-config", model.workload_name(&service.name));
                    bundle.insert(
                        self.manifest(Kind::ConfigMap, &name, &service.name)
                            .with_field("data", data),
                    )?;
                    sources.service_configs.insert(service.name.clone(), name);
                }
            }
        }

        if !secret_values.is_empty() {
            let name = model.secret_name();
            let data: serde_json::Map<String, Value> = secret_values
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(BASE64.encode(v))))
                .collect();
            bundle.insert(
                self.manifest(Kind::Secret, &name, "secrets")
                    .with_field("type", json!("Opaque"))
                    .with_field("data", Value::Object(data)),
            )?;
            sources.secret = Some(name);
        }

        Ok(sources)
    }

    fn ingress(&self, rule: &crate::model::IngressRule) -> Manifest {
        let model = self.model;
        let target = rule
            .service
            .as_deref()
            .and_then(|name| model.service(name))
            .or_else(|| model.primary());
        let (backend_name, backend_port) = match target {
            Some(service) => (model.workload_name(&service.name), service.port),
            None => (model.name.clone(), 80),
        };

        let mut spec = json!({
            "rules": [{
                "host": rule.host,
                "http": {
                    "paths": [{
                        "path": rule.path,
                        "pathType": "Prefix",
                        "backend": {
                            "service": {
                                "name": backend_name,
                                "port": {"number": backend_port},
                            }
                        }
                    }]
                }
            }]
        });
        if let Some(class) = &model.ingress_class {
            spec["ingressClassName"] = json!(class);
        }
        if let Some(secret) = &rule.tls_secret {
            spec["tls"] = json!([{"hosts": [rule.host], "secretName": secret}]);
        }

        let name = model.ingress_name(&rule.host);
        self.manifest(Kind::Ingress, &name, "ingress").with_field("spec", spec)
    }

    fn volume_claim(&self, volume: &crate::model::VolumeModel) -> Manifest {
        let mut spec = json!({
            "accessModes": ["ReadWriteOnce"],
            "resources": {"requests": {"storage": volume.size}},
        });
        if let Some(class) = &volume.storage_class {
            spec["storageClassName"] = json!(class);
        }
        let name = self.model.volume_claim_name(&volume.name);
        self.manifest(Kind::PersistentVolumeClaim, &name, "storage")
            .with_field("spec", spec)
    }
}

/// ConfigMap `data` for an env list, or `None` when empty.
fn env_data(env: &[crate::model::EnvVar]) -> Option<Value> {
    if env.is_empty() {
        return None;
    }
    let mut data = serde_json::Map::new();
    for var in env {
        data.insert(var.name.clone(), Value::String(var.value.clone()));
    }
    Some(Value::Object(data))
}

/// `my-service` to `MY_SERVICE`.
fn upper_snake(name: &str) -> String {
    name.chars()
        .map(|c| if c == '-' { '_' } else { c.to_ascii_uppercase() })
        .collect()
}
