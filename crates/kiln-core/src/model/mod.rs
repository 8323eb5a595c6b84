//! Normalized application model consumed by the renderer.
//!
//! An [`AppModel`] is either a single workload named after the app or a
//! stack of sub-services wired together with `dependsOn` edges. Both shapes
//! share app-level env, secrets, dependencies, ingress, volumes and jobs.

pub mod envfile;
pub mod loader;
pub mod quantity;
pub mod validate;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use loader::{load_model, parse_model_str};
pub use validate::validate;

/// How the services of an app are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Topology {
    /// One workload whose objects are named after the app.
    Single,
    /// Several workloads named `<app>-<service>`.
    Multi,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// CPU and memory quantities for one side of a resource block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceValues {
    #[serde(default)]
    pub cpu: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
}

impl ResourceValues {
    pub fn is_empty(&self) -> bool {
        self.cpu.is_none() && self.memory.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Resources {
    #[serde(default)]
    pub requests: ResourceValues,
    #[serde(default)]
    pub limits: ResourceValues,
}

/// One deployable workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceModel {
    pub name: String,
    pub image: String,
    pub port: u16,
    pub replicas: i32,
    pub env: Vec<EnvVar>,
    pub health_path: Option<String>,
    pub resources: Option<Resources>,
    pub depends_on: Vec<String>,
}

impl ServiceModel {
    pub fn new(name: impl Into<String>, image: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            port,
            replicas: 1,
            env: Vec::new(),
            health_path: None,
            resources: None,
            depends_on: Vec::new(),
        }
    }

    pub fn with_replicas(mut self, replicas: i32) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push(EnvVar::new(name, value));
        self
    }

    pub fn with_health_path(mut self, path: impl Into<String>) -> Self {
        self.health_path = Some(path.into());
        self
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn depends_on(mut self, service: impl Into<String>) -> Self {
        self.depends_on.push(service.into());
        self
    }
}

/// Backing services kiln knows how to run next to an app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    Postgres,
    Mysql,
    Redis,
    Mongodb,
    Rabbitmq,
}

impl DependencyKind {
    pub const ALL: [DependencyKind; 5] = [
        DependencyKind::Postgres,
        DependencyKind::Mysql,
        DependencyKind::Redis,
        DependencyKind::Mongodb,
        DependencyKind::Rabbitmq,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
            Self::Redis => "redis",
            Self::Mongodb => "mongodb",
            Self::Rabbitmq => "rabbitmq",
        }
    }
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DependencyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = Self::ALL.iter().map(|k| k.as_str()).collect();
                format!("unknown dependency type '{}', expected one of {}", s, known.join(", "))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub kind: DependencyKind,
    pub version: Option<String>,
    pub storage: Option<String>,
}

impl Dependency {
    pub fn new(kind: DependencyKind) -> Self {
        Self {
            kind,
            version: None,
            storage: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_storage(mut self, storage: impl Into<String>) -> Self {
        self.storage = Some(storage.into());
        self
    }
}

/// Where secret values come from. Literal entries are applied first, then
/// the env file, so file entries win on key collisions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretSources {
    pub literal: BTreeMap<String, String>,
    pub env_file: Option<PathBuf>,
}

impl SecretSources {
    pub fn is_empty(&self) -> bool {
        self.literal.is_empty() && self.env_file.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    pub host: String,
    pub path: String,
    /// Target service in multi-service mode; the first service otherwise.
    pub service: Option<String>,
    pub tls_secret: Option<String>,
}

impl IngressRule {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            path: "/".to_string(),
            service: None,
            tls_secret: None,
        }
    }

    pub fn with_tls_secret(mut self, secret: impl Into<String>) -> Self {
        self.tls_secret = Some(secret.into());
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeModel {
    pub name: String,
    pub size: String,
    pub mount_path: String,
    pub storage_class: Option<String>,
    /// Service that mounts the claim; required in multi-service mode.
    pub service: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobModel {
    pub name: String,
    pub command: Vec<String>,
    pub image: Option<String>,
    /// Cron schedule; turns the job into a CronJob.
    pub schedule: Option<String>,
}

/// The normalized input to the renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppModel {
    pub name: String,
    pub namespace: String,
    pub topology: Topology,
    pub services: Vec<ServiceModel>,
    /// App-level env shared by every workload.
    pub env: Vec<EnvVar>,
    pub secrets: SecretSources,
    pub dependencies: Vec<Dependency>,
    pub ingress: Vec<IngressRule>,
    pub ingress_class: Option<String>,
    pub volumes: Vec<VolumeModel>,
    pub jobs: Vec<JobModel>,
}

impl AppModel {
    /// Single-workload app.
    pub fn single(name: impl Into<String>, image: impl Into<String>, port: u16) -> Self {
        let name = name.into();
        Self {
            services: vec![ServiceModel::new(name.clone(), image, port)],
            name,
            namespace: "default".to_string(),
            topology: Topology::Single,
            env: Vec::new(),
            secrets: SecretSources::default(),
            dependencies: Vec::new(),
            ingress: Vec::new(),
            ingress_class: None,
            volumes: Vec::new(),
            jobs: Vec::new(),
        }
    }

    /// Multi-service app.
    pub fn stack(name: impl Into<String>, services: Vec<ServiceModel>) -> Self {
        Self {
            name: name.into(),
            namespace: "default".to_string(),
            topology: Topology::Multi,
            services,
            env: Vec::new(),
            secrets: SecretSources::default(),
            dependencies: Vec::new(),
            ingress: Vec::new(),
            ingress_class: None,
            volumes: Vec::new(),
            jobs: Vec::new(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push(EnvVar::new(name, value));
        self
    }

    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.literal.insert(name.into(), value.into());
        self
    }

    pub fn with_env_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.secrets.env_file = Some(path.into());
        self
    }

    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_ingress(mut self, rule: IngressRule) -> Self {
        self.ingress.push(rule);
        self
    }

    pub fn with_volume(mut self, volume: VolumeModel) -> Self {
        self.volumes.push(volume);
        self
    }

    pub fn with_job(mut self, job: JobModel) -> Self {
        self.jobs.push(job);
        self
    }

    /// Mutable access to the single workload (or the first service).
    pub fn primary_mut(&mut self) -> Option<&mut ServiceModel> {
        self.services.first_mut()
    }

    pub fn primary(&self) -> Option<&ServiceModel> {
        self.services.first()
    }

    pub fn service(&self, name: &str) -> Option<&ServiceModel> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Object name of a service's Deployment and Service.
    pub fn workload_name(&self, service: &str) -> String {
        match self.topology {
            Topology::Single => self.name.clone(),
            Topology::Multi => format!("{}-{}", self.name, service),
        }
    }

    pub fn config_map_name(&self) -> String {
        format!("{}-config", self.name)
    }

    pub fn secret_name(&self) -> String {
        format!("{}-secrets", self.name)
    }

    pub fn dependency_name(&self, kind: DependencyKind) -> String {
        format!("{}-{}", self.name, kind)
    }

    /// `app.example.com` on app `shop` gives `shop-app-example-com`.
    pub fn ingress_name(&self, host: &str) -> String {
        format!("{}-{}", self.name, host.replace('.', "-"))
    }

    pub fn volume_claim_name(&self, volume: &str) -> String {
        format!("{}-{}", self.name, volume)
    }

    pub fn release_record_name(&self) -> String {
        release_record_name(&self.name)
    }
}

/// Name of the Secret holding an app's release history.
pub fn release_record_name(app: &str) -> String {
    format!("{}-releases", app)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_mode_names_objects_after_app() {
        let model = AppModel::single("shop", "nginx:alpine", 8080);
        assert_eq!(model.workload_name("shop"), "shop");
        assert_eq!(model.config_map_name(), "shop-config");
        assert_eq!(model.dependency_name(DependencyKind::Postgres), "shop-postgres");
    }

    #[test]
    fn multi_mode_prefixes_service_names() {
        let model = AppModel::stack(
            "shop",
            vec![ServiceModel::new("api", "api:1", 8080)],
        );
        assert_eq!(model.workload_name("api"), "shop-api");
    }

    #[test]
    fn dependency_kind_parses_known_names() {
        assert_eq!("redis".parse::<DependencyKind>(), Ok(DependencyKind::Redis));
        let err = "cassandra".parse::<DependencyKind>().unwrap_err();
        assert!(err.contains("postgres"));
    }
}
