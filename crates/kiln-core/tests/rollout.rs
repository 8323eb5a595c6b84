//! Waiting for workloads to become ready.

mod support;

use std::time::{Duration, Instant};

use kiln_core::apply::{Applier, ApplyOptions};
use kiln_core::bundle::{Bundle, Kind};
use kiln_core::cancel::CancelSource;
use kiln_core::cluster::MemoryCluster;
use kiln_core::error::KilnError;
use kiln_core::model::{AppModel, Dependency, DependencyKind};
use kiln_core::render::{RenderContext, render};
use kiln_core::rollout::RolloutWatcher;

use support::{cluster, fast_rollout, obj};

async fn applied_bundle(cluster: &MemoryCluster) -> Bundle {
    let model = AppModel::single("app", "nginx:alpine", 8080)
        .with_dependency(Dependency::new(DependencyKind::Redis));
    let bundle = render(&model, &RenderContext::new()).unwrap();
    let report = Applier::new(cluster, ApplyOptions::new()).apply(&bundle).await;
    assert!(report.is_success());
    bundle
}

#[tokio::test]
async fn ready_workloads_are_reported() {
    let cluster = cluster();
    let bundle = applied_bundle(&cluster).await;

    let ready = RolloutWatcher::new(&cluster, fast_rollout())
        .watch(&bundle)
        .await
        .unwrap();

    let mut targets: Vec<String> = ready.iter().map(|w| w.target.to_string()).collect();
    targets.sort();
    assert_eq!(targets, vec!["Deployment/app", "StatefulSet/app-redis"]);
}

#[tokio::test]
async fn stalled_workload_times_out() {
    let cluster = cluster();
    let bundle = applied_bundle(&cluster).await;
    cluster.stall_rollout(obj(Kind::StatefulSet, "app-redis"));

    let started = Instant::now();
    let err = RolloutWatcher::new(&cluster, fast_rollout())
        .watch(&bundle)
        .await
        .unwrap_err();

    match err {
        KilnError::RolloutTimeout { workload, waited } => {
            assert_eq!(workload, "StatefulSet/app-redis");
            assert!(waited >= Duration::from_millis(300));
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn crash_looping_pod_fails_fast() {
    let cluster = cluster();
    let bundle = applied_bundle(&cluster).await;
    cluster.inject_pod_failure(
        obj(Kind::Deployment, "app"),
        "CrashLoopBackOff",
        "back-off 10s restarting failed container",
    );

    let options = fast_rollout().with_timeout(Duration::from_secs(30));
    let started = Instant::now();
    let err = RolloutWatcher::new(&cluster, options)
        .watch(&bundle)
        .await
        .unwrap_err();

    assert_eq!(
        err,
        KilnError::PodFailure {
            pod: "app-5d8c7b9f6-0".to_string(),
            reason: "CrashLoopBackOff".to_string(),
            message: "back-off 10s restarting failed container".to_string(),
        }
    );
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn cancellation_interrupts_the_wait() {
    let cluster = cluster();
    let bundle = applied_bundle(&cluster).await;
    cluster.stall_rollout(obj(Kind::Deployment, "app"));

    let source = CancelSource::new();
    let watcher = RolloutWatcher::new(&cluster, fast_rollout().with_timeout(Duration::from_secs(30)))
        .with_cancel(source.token());

    let (result, _) = tokio::join!(watcher.watch(&bundle), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        source.cancel();
    });

    assert_eq!(result.unwrap_err(), KilnError::Cancelled);
}

#[tokio::test]
async fn bundle_without_workloads_is_ready_at_once() {
    let cluster = cluster();
    let ready = RolloutWatcher::new(&cluster, fast_rollout())
        .watch(&Bundle::new("empty"))
        .await
        .unwrap();
    assert!(ready.is_empty());
}
