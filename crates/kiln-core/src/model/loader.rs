//! Loading app definitions from `kiln.yaml`.
//!
//! Two document kinds are accepted under `apiVersion: kiln.dev/v1`:
//! `App` for a single workload and `Stack` for several services.
//! An optional `environments` block overlays namespace, image, replicas
//! and env for a named environment.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

use crate::error::{KilnError, Result};
use crate::model::{
    AppModel, Dependency, DependencyKind, EnvVar, IngressRule, JobModel, Resources,
    SecretSources, ServiceModel, Topology, VolumeModel,
};

pub const API_VERSION: &str = "kiln.dev/v1";

/// Read and normalize the app definition at `path`.
pub fn load_model(path: &Path, environment: Option<&str>) -> Result<AppModel> {
    let contents = fs::read_to_string(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => KilnError::MissingFile {
            path: path.to_path_buf(),
        },
        _ => KilnError::invalid(path.display().to_string(), e.to_string()),
    })?;

    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let model = parse_model_str(&contents, base_dir, environment)?;
    tracing::debug!(
        path = %path.display(),
        app = %model.name,
        services = model.services.len(),
        "loaded app definition"
    );
    Ok(model)
}

/// Parse an app definition; relative paths resolve against `base_dir`.
pub fn parse_model_str(
    contents: &str,
    base_dir: &Path,
    environment: Option<&str>,
) -> Result<AppModel> {
    let doc: Document = serde_yaml::from_str(contents)
        .map_err(|e| KilnError::invalid("document", e.to_string()))?;

    if doc.api_version != API_VERSION {
        return Err(KilnError::invalid(
            "apiVersion",
            format!("expected '{}', got '{}'", API_VERSION, doc.api_version),
        ));
    }

    let Document {
        kind,
        metadata,
        mut spec,
        ..
    } = doc;

    let mut namespace = metadata.namespace.unwrap_or_else(|| "default".to_string());
    if let Some(env_name) = environment {
        let overlay = spec.environments.remove(env_name).ok_or_else(|| {
            let known: Vec<&str> = spec.environments.keys().map(String::as_str).collect();
            KilnError::invalid(
                "environments",
                format!(
                    "unknown environment '{}' (defined: {})",
                    env_name,
                    if known.is_empty() { "none".to_string() } else { known.join(", ") }
                ),
            )
        })?;
        if let Some(ns) = &overlay.namespace {
            namespace = ns.clone();
        }
        spec.apply_overlay(&kind, overlay)?;
    }

    let topology = match kind.as_str() {
        "App" => Topology::Single,
        "Stack" => Topology::Multi,
        other => {
            return Err(KilnError::invalid(
                "kind",
                format!("expected 'App' or 'Stack', got '{}'", other),
            ));
        }
    };

    let services = match topology {
        Topology::Single => vec![spec.single_service(&metadata.name)?],
        Topology::Multi => spec.stack_services()?,
    };

    let secrets = spec.secrets.unwrap_or_default();
    let env_file = secrets.env_file.map(|p| {
        if p.is_absolute() {
            p
        } else {
            base_dir.join(p)
        }
    });

    Ok(AppModel {
        name: metadata.name,
        namespace,
        topology,
        services,
        env: spec.env.into_vars(),
        secrets: SecretSources {
            literal: secrets.literal.0.into_iter().collect(),
            env_file,
        },
        dependencies: spec
            .dependencies
            .into_iter()
            .map(|d| Dependency {
                kind: d.kind,
                version: d.version,
                storage: d.storage,
            })
            .collect(),
        ingress: spec
            .ingress
            .into_iter()
            .map(|i| IngressRule {
                host: i.host,
                path: i.path.unwrap_or_else(|| "/".to_string()),
                service: i.service,
                tls_secret: i.tls_secret,
            })
            .collect(),
        ingress_class: spec.ingress_class,
        volumes: spec
            .volumes
            .into_iter()
            .map(|v| VolumeModel {
                name: v.name,
                size: v.size,
                mount_path: v.mount_path,
                storage_class: v.storage_class,
                service: v.service,
            })
            .collect(),
        jobs: spec
            .jobs
            .into_iter()
            .map(|j| JobModel {
                name: j.name,
                command: j.command,
                image: j.image,
                schedule: j.schedule,
            })
            .collect(),
    })
}

// ============================================================================
// Document shape
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct Document {
    api_version: String,
    kind: String,
    metadata: Metadata,
    spec: Spec,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Metadata {
    name: String,
    #[serde(default)]
    namespace: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct Spec {
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    replicas: Option<i32>,
    #[serde(default)]
    env: EnvMap,
    #[serde(default)]
    health: Option<HealthDoc>,
    #[serde(default)]
    resources: Option<Resources>,
    #[serde(default)]
    services: Vec<ServiceDoc>,
    #[serde(default)]
    dependencies: Vec<DependencyDoc>,
    #[serde(default)]
    secrets: Option<SecretsDoc>,
    #[serde(default)]
    ingress: Vec<IngressDoc>,
    #[serde(default)]
    ingress_class: Option<String>,
    #[serde(default)]
    volumes: Vec<VolumeDoc>,
    #[serde(default)]
    jobs: Vec<JobDoc>,
    #[serde(default)]
    environments: BTreeMap<String, Overlay>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HealthDoc {
    path: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct ServiceDoc {
    name: String,
    image: String,
    port: u16,
    #[serde(default)]
    replicas: Option<i32>,
    #[serde(default)]
    env: EnvMap,
    #[serde(default)]
    health: Option<HealthDoc>,
    #[serde(default)]
    resources: Option<Resources>,
    #[serde(default)]
    depends_on: Vec<String>,
}

impl ServiceDoc {
    fn into_model(self) -> ServiceModel {
        ServiceModel {
            name: self.name,
            image: self.image,
            port: self.port,
            replicas: self.replicas.unwrap_or(1),
            env: self.env.into_vars(),
            health_path: self.health.map(|h| h.path),
            resources: self.resources,
            depends_on: self.depends_on,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DependencyDoc {
    #[serde(rename = "type")]
    kind: DependencyKind,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    storage: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct SecretsDoc {
    #[serde(default)]
    literal: EnvMap,
    #[serde(default)]
    env_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct IngressDoc {
    host: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    service: Option<String>,
    #[serde(default)]
    tls_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct VolumeDoc {
    name: String,
    size: String,
    mount_path: String,
    #[serde(default)]
    storage_class: Option<String>,
    #[serde(default)]
    service: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct JobDoc {
    name: String,
    command: Vec<String>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    schedule: Option<String>,
}

/// Per-environment overrides.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Overlay {
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    replicas: Option<i32>,
    #[serde(default)]
    resources: Option<Resources>,
    #[serde(default)]
    env: EnvMap,
    #[serde(default)]
    services: BTreeMap<String, ServiceOverlay>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServiceOverlay {
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    replicas: Option<i32>,
    #[serde(default)]
    resources: Option<Resources>,
    #[serde(default)]
    env: EnvMap,
}

impl Spec {
    fn apply_overlay(&mut self, kind: &str, overlay: Overlay) -> Result<()> {
        if overlay.image.is_some() {
            self.image = overlay.image;
        }
        if overlay.replicas.is_some() {
            self.replicas = overlay.replicas;
        }
        if overlay.resources.is_some() {
            self.resources = overlay.resources;
        }
        self.env.merge(overlay.env);

        for (name, service_overlay) in overlay.services {
            let Some(service) = self.services.iter_mut().find(|s| s.name == name) else {
                return Err(KilnError::invalid(
                    format!("environments.services.{}", name),
                    format!("{} has no service named '{}'", kind, name),
                ));
            };
            if let Some(image) = service_overlay.image {
                service.image = image;
            }
            if service_overlay.replicas.is_some() {
                service.replicas = service_overlay.replicas;
            }
            if service_overlay.resources.is_some() {
                service.resources = service_overlay.resources;
            }
            service.env.merge(service_overlay.env);
        }
        Ok(())
    }

    fn single_service(&mut self, app: &str) -> Result<ServiceModel> {
        if !self.services.is_empty() {
            return Err(KilnError::invalid(
                "spec.services",
                "kind App cannot declare services; use kind Stack",
            ));
        }
        let image = self
            .image
            .take()
            .ok_or_else(|| KilnError::invalid("spec.image", "image is required"))?;
        let port = self
            .port
            .ok_or_else(|| KilnError::invalid("spec.port", "port is required"))?;

        Ok(ServiceModel {
            name: app.to_string(),
            image,
            port,
            replicas: self.replicas.unwrap_or(1),
            env: Vec::new(),
            health_path: self.health.take().map(|h| h.path),
            resources: self.resources.take(),
            depends_on: Vec::new(),
        })
    }

    fn stack_services(&mut self) -> Result<Vec<ServiceModel>> {
        for (field, present) in [
            ("spec.image", self.image.is_some()),
            ("spec.port", self.port.is_some()),
            ("spec.replicas", self.replicas.is_some()),
            ("spec.health", self.health.is_some()),
            ("spec.resources", self.resources.is_some()),
        ] {
            if present {
                return Err(KilnError::invalid(
                    field,
                    "kind Stack sets this per service under spec.services",
                ));
            }
        }
        if self.services.is_empty() {
            return Err(KilnError::invalid(
                "spec.services",
                "kind Stack needs at least one service",
            ));
        }
        Ok(std::mem::take(&mut self.services)
            .into_iter()
            .map(ServiceDoc::into_model)
            .collect())
    }
}

// ============================================================================
// Ordered env maps
// ============================================================================

/// A YAML mapping of scalar values kept in document order.
#[derive(Debug, Default)]
struct EnvMap(Vec<(String, String)>);

impl EnvMap {
    /// Overlay entries replace existing keys in place and append new ones.
    fn merge(&mut self, other: EnvMap) {
        for (key, value) in other.0 {
            match self.0.iter_mut().find(|(k, _)| *k == key) {
                Some(entry) => entry.1 = value,
                None => self.0.push((key, value)),
            }
        }
    }

    fn into_vars(self) -> Vec<EnvVar> {
        self.0
            .into_iter()
            .map(|(name, value)| EnvVar { name, value })
            .collect()
    }
}

impl<'de> Deserialize<'de> for EnvMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mapping = serde_yaml::Mapping::deserialize(deserializer)?;
        let mut entries = Vec::with_capacity(mapping.len());
        for (key, value) in mapping {
            let key = scalar_to_string(&key)
                .ok_or_else(|| D::Error::custom("env keys must be scalars"))?;
            let value = scalar_to_string(&value)
                .ok_or_else(|| D::Error::custom(format!("value of '{}' must be a scalar", key)))?;
            entries.push((key, value));
        }
        Ok(EnvMap(entries))
    }
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Null => Some(String::new()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_keeps_document_order_and_stringifies_scalars() {
        let yaml = r#"
apiVersion: kiln.dev/v1
kind: App
metadata:
  name: shop
spec:
  image: nginx:alpine
  port: 8080
  env:
    ZED: last
    ALPHA: 1
    DEBUG: true
"#;
        let model = parse_model_str(yaml, Path::new("."), None).expect("parse should succeed");
        let names: Vec<&str> = model.env.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["ZED", "ALPHA", "DEBUG"]);
        assert_eq!(model.env[1].value, "1");
        assert_eq!(model.env[2].value, "true");
    }

    #[test]
    fn overlay_merge_replaces_in_place() {
        let mut base = EnvMap(vec![
            ("A".into(), "1".into()),
            ("B".into(), "2".into()),
        ]);
        base.merge(EnvMap(vec![("B".into(), "20".into()), ("C".into(), "3".into())]));
        assert_eq!(
            base.0,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "20".to_string()),
                ("C".to_string(), "3".to_string()),
            ]
        );
    }
}
