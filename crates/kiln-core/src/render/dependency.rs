//! Backing services declared as dependencies.
//!
//! Each dependency renders a headless Service and a single-replica
//! StatefulSet named `<app>-<dep>`. Credentialed dependencies also get a
//! Secret of the same name whose password survives re-renders.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::{Value, json};

use super::{RenderContext, Renderer};
use crate::bundle::{Kind, Manifest};
use crate::labels::{APP_LABEL, component_labels};
use crate::model::{Dependency, DependencyKind};

const DEFAULT_STORAGE: &str = "1Gi";
const PASSWORD_CONTEXT: &str = "kiln dependency password v1";
const SALT_KEY: &str = "salt";

/// Catalog entry for a dependency type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyProfile {
    pub image: &'static str,
    pub default_tag: &'static str,
    pub port: u16,
    pub data_path: &'static str,
    pub credentialed: bool,
    /// Secret key holding the password, named after the variable the
    /// backend image reads it from.
    pub password_key: &'static str,
}

pub fn profile(kind: DependencyKind) -> DependencyProfile {
    match kind {
        DependencyKind::Postgres => DependencyProfile {
            image: "postgres",
            default_tag: "16",
            port: 5432,
            data_path: "/var/lib/postgresql/data",
            credentialed: true,
            password_key: "POSTGRES_PASSWORD",
        },
        DependencyKind::Mysql => DependencyProfile {
            image: "mysql",
            default_tag: "8.4",
            port: 3306,
            data_path: "/var/lib/mysql",
            credentialed: true,
            password_key: "MYSQL_PASSWORD",
        },
        DependencyKind::Redis => DependencyProfile {
            image: "redis",
            default_tag: "7-alpine",
            port: 6379,
            data_path: "/data",
            credentialed: false,
            password_key: "",
        },
        DependencyKind::Mongodb => DependencyProfile {
            image: "mongo",
            default_tag: "7",
            port: 27017,
            data_path: "/data/db",
            credentialed: true,
            password_key: "MONGO_INITDB_ROOT_PASSWORD",
        },
        DependencyKind::Rabbitmq => DependencyProfile {
            image: "rabbitmq",
            default_tag: "3.13-management-alpine",
            port: 5672,
            data_path: "/var/lib/rabbitmq",
            credentialed: true,
            password_key: "RABBITMQ_DEFAULT_PASS",
        },
    }
}

/// Deterministic password for `(app, dep, salt)`, 32 hex characters.
pub fn derive_password(app: &str, kind: DependencyKind, salt: &str) -> String {
    let material = format!("{}\0{}\0{}", app, kind, salt);
    let key = blake3::derive_key(PASSWORD_CONTEXT, material.as_bytes());
    hex::encode(&key[..16])
}

fn random_salt() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

/// Database and user identifier derived from the app name.
fn db_identifier(app: &str) -> String {
    app.replace('-', "_")
}

impl Renderer<'_> {
    /// Headless Service, StatefulSet and, when credentialed, the Secret.
    pub(super) fn dependency(&self, dep: &Dependency, ctx: &RenderContext) -> Vec<Manifest> {
        let model = self.model;
        let profile = profile(dep.kind);
        let name = model.dependency_name(dep.kind);
        let component = dep.kind.as_str();
        let mut objects = Vec::new();

        let service_spec = json!({
            "clusterIP": "None",
            "selector": {APP_LABEL: name},
            "ports": [{
                "name": component,
                "port": profile.port,
                "targetPort": profile.port,
                "protocol": "TCP",
            }],
        });
        objects.push(self.manifest(Kind::Service, &name, component).with_field("spec", service_spec));

        if profile.credentialed {
            let existing = ctx.existing_secrets.get(&name);
            let salt = existing
                .and_then(|data| data.get(SALT_KEY).cloned())
                .or_else(|| ctx.salt.clone())
                .unwrap_or_else(random_salt);
            let password = existing
                .and_then(|data| data.get(profile.password_key).cloned())
                .unwrap_or_else(|| derive_password(&model.name, dep.kind, &salt));

            let data = BTreeMap::from([(profile.password_key, password), (SALT_KEY, salt)]);
            let encoded: serde_json::Map<String, Value> = data
                .into_iter()
                .map(|(k, v)| (k.to_string(), Value::String(BASE64.encode(v))))
                .collect();
            objects.push(
                self.manifest(Kind::Secret, &name, component)
                    .with_field("type", json!("Opaque"))
                    .with_field("data", Value::Object(encoded)),
            );
        }

        let tag = dep.version.as_deref().unwrap_or(profile.default_tag);
        let storage = dep.storage.as_deref().unwrap_or(DEFAULT_STORAGE);
        let mut pod_labels = component_labels(&model.name, component);
        pod_labels.insert(APP_LABEL.to_string(), name.clone());

        let mut container = json!({
            "name": component,
            "image": format!("{}:{}", profile.image, tag),
            "ports": [{"name": component, "containerPort": profile.port, "protocol": "TCP"}],
            "volumeMounts": [{"name": "data", "mountPath": profile.data_path}],
        });
        let env = self.backend_env(dep.kind, &name);
        if !env.is_empty() {
            container["env"] = Value::Array(env);
        }

        let spec = json!({
            "serviceName": name,
            "replicas": 1,
            "selector": {"matchLabels": {APP_LABEL: name}},
            "template": {
                "metadata": {"labels": pod_labels},
                "spec": {"containers": [container]},
            },
            "volumeClaimTemplates": [{
                "metadata": {"name": "data"},
                "spec": {
                    "accessModes": ["ReadWriteOnce"],
                    "resources": {"requests": {"storage": storage}},
                },
            }],
        });
        objects.push(self.manifest(Kind::StatefulSet, &name, component).with_field("spec", spec));

        objects
    }

    /// Variables the backend container itself needs to initialize.
    fn backend_env(&self, kind: DependencyKind, secret: &str) -> Vec<Value> {
        let user = db_identifier(&self.model.name);
        let password = secret_ref(secret, profile(kind).password_key);
        match kind {
            DependencyKind::Postgres => vec![
                json!({"name": "POSTGRES_USER", "value": user}),
                json!({"name": "POSTGRES_DB", "value": user}),
                json!({"name": "POSTGRES_PASSWORD", "valueFrom": password}),
                json!({"name": "PGDATA", "value": format!("{}/pgdata", profile(kind).data_path)}),
            ],
            DependencyKind::Mysql => vec![
                json!({"name": "MYSQL_USER", "value": user}),
                json!({"name": "MYSQL_DATABASE", "value": user}),
                json!({"name": "MYSQL_PASSWORD", "valueFrom": password}),
                json!({"name": "MYSQL_ROOT_PASSWORD", "valueFrom": password}),
            ],
            DependencyKind::Redis => Vec::new(),
            DependencyKind::Mongodb => vec![
                json!({"name": "MONGO_INITDB_ROOT_USERNAME", "value": user}),
                json!({"name": "MONGO_INITDB_ROOT_PASSWORD", "valueFrom": password}),
            ],
            DependencyKind::Rabbitmq => vec![
                json!({"name": "RABBITMQ_DEFAULT_USER", "value": user}),
                json!({"name": "RABBITMQ_DEFAULT_PASS", "valueFrom": password}),
            ],
        }
    }

    /// Connection variables injected into app containers, in `$(VAR)`
    /// expansion order. Passwords always come from the Secret.
    pub(super) fn dependency_env(&self, kind: DependencyKind) -> Vec<Value> {
        let host = self.model.dependency_name(kind);
        let port = profile(kind).port;
        let user = db_identifier(&self.model.name);
        let password = secret_ref(&host, profile(kind).password_key);

        match kind {
            DependencyKind::Postgres => vec![
                json!({"name": "PGHOST", "value": host}),
                json!({"name": "PGPORT", "value": port.to_string()}),
                json!({"name": "PGUSER", "value": user}),
                json!({"name": "PGDATABASE", "value": user}),
                json!({"name": "PGPASSWORD", "valueFrom": password}),
                json!({
                    "name": "DATABASE_URL",
                    "value": format!("postgres://$(PGUSER):$(PGPASSWORD)@{}:{}/$(PGDATABASE)", host, port),
                }),
            ],
            DependencyKind::Mysql => vec![
                json!({"name": "MYSQL_HOST", "value": host}),
                json!({"name": "MYSQL_PORT", "value": port.to_string()}),
                json!({"name": "MYSQL_USER", "value": user}),
                json!({"name": "MYSQL_DATABASE", "value": user}),
                json!({"name": "MYSQL_PASSWORD", "valueFrom": password}),
                json!({
                    "name": "DATABASE_URL",
                    "value": format!("mysql://$(MYSQL_USER):$(MYSQL_PASSWORD)@{}:{}/$(MYSQL_DATABASE)", host, port),
                }),
            ],
            DependencyKind::Redis => vec![
                json!({"name": "REDIS_HOST", "value": host}),
                json!({"name": "REDIS_PORT", "value": port.to_string()}),
                json!({"name": "REDIS_URL", "value": format!("redis://{}:{}", host, port)}),
            ],
            DependencyKind::Mongodb => vec![
                json!({"name": "MONGO_HOST", "value": host}),
                json!({"name": "MONGO_PORT", "value": port.to_string()}),
                json!({"name": "MONGO_USER", "value": user}),
                json!({"name": "MONGO_PASSWORD", "valueFrom": password}),
                json!({
                    "name": "MONGODB_URL",
                    "value": format!("mongodb://$(MONGO_USER):$(MONGO_PASSWORD)@{}:{}", host, port),
                }),
            ],
            DependencyKind::Rabbitmq => vec![
                json!({"name": "RABBITMQ_HOST", "value": host}),
                json!({"name": "RABBITMQ_PORT", "value": port.to_string()}),
                json!({"name": "RABBITMQ_USER", "value": user}),
                json!({"name": "RABBITMQ_PASSWORD", "valueFrom": password}),
                json!({
                    "name": "AMQP_URL",
                    "value": format!("amqp://$(RABBITMQ_USER):$(RABBITMQ_PASSWORD)@{}:{}", host, port),
                }),
            ],
        }
    }
}

fn secret_ref(secret: &str, key: &str) -> Value {
    json!({"secretKeyRef": {"name": secret, "key": key}})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_is_stable_and_salted() {
        let a = derive_password("shop", DependencyKind::Postgres, "s1");
        assert_eq!(a, derive_password("shop", DependencyKind::Postgres, "s1"));
        assert_eq!(a.len(), 32);
        assert_ne!(a, derive_password("shop", DependencyKind::Postgres, "s2"));
        assert_ne!(a, derive_password("shop", DependencyKind::Mysql, "s1"));
    }

    #[test]
    fn random_salts_differ() {
        assert_ne!(random_salt(), random_salt());
    }
}
