#![allow(dead_code)]

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;

use kiln_core::bundle::{Kind, ObjectRef};
use kiln_core::cluster::MemoryCluster;
use kiln_core::model::AppModel;
use kiln_core::pipeline::{DeployOptions, DeployReport, Pipeline};
use kiln_core::rollout::RolloutOptions;

pub fn cluster() -> MemoryCluster {
    MemoryCluster::new().with_namespace("default")
}

/// Rollout settings that keep stalled tests short.
pub fn fast_rollout() -> RolloutOptions {
    RolloutOptions::new()
        .with_timeout(Duration::from_millis(300))
        .with_poll_interval(Duration::from_millis(10))
        .with_jitter(Duration::ZERO)
}

pub fn options() -> DeployOptions {
    DeployOptions {
        rollout: fast_rollout(),
        author: "tester".to_string(),
        salt: Some("fixed-salt".to_string()),
        ..Default::default()
    }
}

pub fn pruning_options() -> DeployOptions {
    let mut options = options();
    options.apply = options.apply.with_prune(true);
    options
}

pub async fn deploy(cluster: &MemoryCluster, model: &AppModel) -> DeployReport {
    deploy_with(cluster, model, options()).await
}

pub async fn deploy_with(
    cluster: &MemoryCluster,
    model: &AppModel,
    options: DeployOptions,
) -> DeployReport {
    Pipeline::new(cluster, options)
        .deploy(model, &mut Vec::new())
        .await
}

pub fn obj(kind: Kind, name: &str) -> ObjectRef {
    ObjectRef::new(kind, "default", name)
}

/// Decoded value of `key` in a stored Secret body.
pub fn secret_value(body: &Value, key: &str) -> Option<String> {
    let encoded = body.get("data")?.get(key)?.as_str()?;
    let bytes = BASE64.decode(encoded).ok()?;
    String::from_utf8(bytes).ok()
}
