//! Deployments, Services, Jobs and CronJobs for the app's own workloads.

use std::collections::BTreeSet;

use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use super::{ConfigSources, Renderer, upper_snake};
use crate::bundle::fingerprint::canonical_json;
use crate::bundle::{Kind, Manifest};
use crate::labels::{APP_LABEL, component_labels};
use crate::model::{JobModel, Resources, ServiceModel, Topology};

impl Renderer<'_> {
    /// Pod selector value for a service.
    fn selector(&self, service: &ServiceModel) -> String {
        self.model.workload_name(&service.name)
    }

    fn component(&self, service: &ServiceModel) -> String {
        match self.model.topology {
            Topology::Single => "app".to_string(),
            Topology::Multi => service.name.clone(),
        }
    }

    fn pod_labels(&self, component: &str, selector: &str) -> Value {
        let mut labels = component_labels(&self.model.name, component);
        labels.insert(APP_LABEL.to_string(), selector.to_string());
        json!(labels)
    }

    pub(super) fn deployment(&self, service: &ServiceModel, sources: &ConfigSources) -> Manifest {
        let model = self.model;
        let name = model.workload_name(&service.name);
        let selector = self.selector(service);
        let component = self.component(service);

        let mut container = json!({
            "name": service.name,
            "image": service.image,
            "ports": [{"name": "http", "containerPort": service.port, "protocol": "TCP"}],
        });
        self.attach_env(&mut container, Some(service), sources);

        if let Some(path) = &service.health_path {
            container["readinessProbe"] = http_probe(path, service.port, 5);
            container["livenessProbe"] = http_probe(path, service.port, 15);
        }
        if let Some(resources) = service.resources.as_ref().and_then(resources_block) {
            container["resources"] = resources;
        }

        let mut pod_spec = json!({});
        let mounts: Vec<_> = model
            .volumes
            .iter()
            .filter(|v| match &v.service {
                Some(owner) => *owner == service.name,
                None => model.topology == Topology::Single,
            })
            .collect();
        if !mounts.is_empty() {
            container["volumeMounts"] = mounts
                .iter()
                .map(|v| json!({"name": v.name, "mountPath": v.mount_path}))
                .collect();
            pod_spec["volumes"] = mounts
                .iter()
                .map(|v| {
                    json!({
                        "name": v.name,
                        "persistentVolumeClaim": {"claimName": model.volume_claim_name(&v.name)},
                    })
                })
                .collect();
        }
        pod_spec["containers"] = json!([container]);

        let spec = json!({
            "replicas": service.replicas,
            "selector": {"matchLabels": {APP_LABEL: selector}},
            "template": {
                "metadata": {"labels": self.pod_labels(&component, &selector)},
                "spec": pod_spec,
            },
        });
        self.manifest(Kind::Deployment, &name, &component)
            .with_field("spec", spec)
    }

    pub(super) fn service(&self, service: &ServiceModel) -> Manifest {
        let name = self.model.workload_name(&service.name);
        let spec = json!({
            "type": "ClusterIP",
            "selector": {APP_LABEL: self.selector(service)},
            "ports": [{
                "name": "http",
                "port": service.port,
                "targetPort": service.port,
                "protocol": "TCP",
            }],
        });
        self.manifest(Kind::Service, &name, &self.component(service))
            .with_field("spec", spec)
    }

    /// A Job, or a CronJob when the job has a schedule.
    pub(super) fn job(&self, job: &JobModel, sources: &ConfigSources) -> Manifest {
        let model = self.model;
        let image = job
            .image
            .clone()
            .or_else(|| model.primary().map(|s| s.image.clone()))
            .unwrap_or_default();
        let selector = format!("{}-{}", model.name, job.name);

        let mut container = json!({
            "name": job.name,
            "image": image,
            "command": job.command,
        });
        self.attach_env(&mut container, None, sources);

        let job_spec = json!({
            "backoffLimit": 2,
            "template": {
                "metadata": {"labels": self.pod_labels("job", &selector)},
                "spec": {
                    "restartPolicy": "Never",
                    "containers": [container],
                },
            },
        });

        match &job.schedule {
            Some(schedule) => {
                let spec = json!({
                    "schedule": schedule,
                    "concurrencyPolicy": "Forbid",
                    "jobTemplate": {"spec": job_spec},
                });
                self.manifest(Kind::CronJob, &selector, "job")
                    .with_field("spec", spec)
            }
            None => {
                // Job templates are immutable, so the name tracks the content.
                let digest = hex::encode(Sha256::digest(canonical_json(&job_spec).as_bytes()));
                let name = format!("{}-{}", selector, &digest[..8]);
                self.manifest(Kind::Job, &name, "job").with_field("spec", job_spec)
            }
        }
    }

    /// Wire envFrom sources, dependency variables and service URLs into a
    /// container. `service` is `None` for jobs.
    fn attach_env(
        &self,
        container: &mut Value,
        service: Option<&ServiceModel>,
        sources: &ConfigSources,
    ) {
        let mut env_from = Vec::new();
        if let Some(name) = &sources.shared_config {
            env_from.push(json!({"configMapRef": {"name": name}}));
        }
        if let Some(name) = service.and_then(|s| sources.service_configs.get(&s.name)) {
            env_from.push(json!({"configMapRef": {"name": name}}));
        }
        if let Some(name) = &sources.secret {
            env_from.push(json!({"secretRef": {"name": name}}));
        }

        let mut env = Vec::new();
        let mut seen = BTreeSet::new();
        let mut push = |entry: Value| {
            let name = entry["name"].as_str().unwrap_or_default().to_string();
            if seen.insert(name) {
                env.push(entry);
            }
        };

        for dep in &self.model.dependencies {
            for entry in self.dependency_env(dep.kind) {
                push(entry);
            }
        }
        if let Some(service) = service {
            for target in &service.depends_on {
                if let Some(other) = self.model.service(target) {
                    push(json!({
                        "name": format!("{}_URL", upper_snake(&other.name)),
                        "value": format!(
                            "http://{}:{}",
                            self.model.workload_name(&other.name),
                            other.port
                        ),
                    }));
                }
            }
        }

        if !env_from.is_empty() {
            container["envFrom"] = Value::Array(env_from);
        }
        if !env.is_empty() {
            container["env"] = Value::Array(env);
        }
    }
}

fn http_probe(path: &str, port: u16, initial_delay: u32) -> Value {
    json!({
        "httpGet": {"path": path, "port": port},
        "initialDelaySeconds": initial_delay,
        "periodSeconds": 10,
    })
}

/// Container resources, omitting empty sides.
fn resources_block(resources: &Resources) -> Option<Value> {
    let mut block = serde_json::Map::new();
    for (key, values) in [("requests", &resources.requests), ("limits", &resources.limits)] {
        if values.is_empty() {
            continue;
        }
        let mut side = serde_json::Map::new();
        if let Some(cpu) = &values.cpu {
            side.insert("cpu".to_string(), json!(cpu));
        }
        if let Some(memory) = &values.memory {
            side.insert("memory".to_string(), json!(memory));
        }
        block.insert(key.to_string(), Value::Object(side));
    }
    if block.is_empty() {
        None
    } else {
        Some(Value::Object(block))
    }
}
