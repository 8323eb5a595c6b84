//! Release history stored in the cluster.

mod support;

use std::collections::BTreeMap;

use kiln_core::bundle::Bundle;
use kiln_core::cluster::{ClusterHandle, MemoryCluster, StoredSecret};
use kiln_core::error::KilnError;
use kiln_core::labels::{MANAGED_BY_LABEL, TOOL_NAME};
use kiln_core::model::AppModel;
use kiln_core::render::{RenderContext, render};
use kiln_core::revision::{RECORD_KEY, RevisionOptions, RevisionStore};

use support::cluster;

fn bundle(version: &str) -> Bundle {
    let model = AppModel::single("app", "nginx:alpine", 8080).with_env("VERSION", version);
    render(&model, &RenderContext::new()).unwrap()
}

fn store(cluster: &MemoryCluster) -> RevisionStore<'_> {
    RevisionStore::new(cluster, "default", RevisionOptions::default())
}

#[tokio::test]
async fn indices_increase_from_one() {
    let cluster = cluster();
    let store = store(&cluster);

    assert_eq!(store.record("app", &bundle("v1"), "alice").await.unwrap(), 1);
    assert_eq!(store.record("app", &bundle("v2"), "bob").await.unwrap(), 2);
    assert_eq!(store.record("app", &bundle("v3"), "alice").await.unwrap(), 3);

    let history = store.list("app").await.unwrap();
    let indices: Vec<u64> = history.iter().map(|r| r.index).collect();
    assert_eq!(indices, vec![1, 2, 3]);
    assert_eq!(history[1].author, "bob");
    assert!(history[0].summary.starts_with("initial release"));
    assert!(history[1].summary.contains("ConfigMap/app-config"));
}

#[tokio::test]
async fn recording_the_latest_fingerprint_again_is_a_no_op() {
    let cluster = cluster();
    let store = store(&cluster);

    store.record("app", &bundle("v1"), "alice").await.unwrap();
    let again = store.record("app", &bundle("v1"), "bob").await.unwrap();

    assert_eq!(again, 1);
    assert_eq!(store.list("app").await.unwrap().len(), 1);
}

#[tokio::test]
async fn retention_keeps_newest_and_indices_keep_growing() {
    let cluster = cluster();
    let store = RevisionStore::new(&cluster, "default", RevisionOptions::default().with_retention(2));

    for version in ["v1", "v2", "v3", "v4"] {
        store.record("app", &bundle(version), "ci").await.unwrap();
    }

    let indices: Vec<u64> = store.list("app").await.unwrap().iter().map(|r| r.index).collect();
    assert_eq!(indices, vec![3, 4]);
    assert_eq!(store.record("app", &bundle("v5"), "ci").await.unwrap(), 5);
}

#[tokio::test]
async fn stored_bundle_round_trips_with_fingerprint() {
    let cluster = cluster();
    let store = store(&cluster);
    let original = bundle("v1");
    store.record("app", &original, "alice").await.unwrap();

    let revision = store.get("app", 1).await.unwrap();
    let restored = revision.bundle("app").unwrap();

    assert_eq!(revision.fingerprint, original.fingerprint());
    assert_eq!(restored.fingerprint(), original.fingerprint());
    assert_eq!(restored.refs(), original.refs());
}

#[tokio::test]
async fn rollback_defaults_to_previous_revision() {
    let cluster = cluster();
    let store = store(&cluster);
    let v1 = bundle("v1");
    store.record("app", &v1, "ci").await.unwrap();
    store.record("app", &bundle("v2"), "ci").await.unwrap();

    let target = store.rollback_target("app", None).await.unwrap();
    assert_eq!(target.index, 1);
    let restored = store.rollback("app", None).await.unwrap();
    assert_eq!(restored.fingerprint(), v1.fingerprint());
    assert_eq!(store.list("app").await.unwrap().len(), 2, "rollback lookup writes nothing");
}

#[tokio::test]
async fn unknown_revisions_are_reported() {
    let cluster = cluster();
    let store = store(&cluster);

    assert_eq!(
        store.rollback_target("app", None).await.unwrap_err(),
        KilnError::UnknownRevision {
            app: "app".to_string(),
            index: 0
        }
    );

    store.record("app", &bundle("v1"), "ci").await.unwrap();
    assert!(matches!(
        store.get("app", 9).await,
        Err(KilnError::UnknownRevision { index: 9, .. })
    ));
}

#[tokio::test]
async fn conflicts_are_retried() {
    let cluster = cluster();
    let store = store(&cluster);
    cluster.conflict_next_secret_writes(3);

    let index = store.record("app", &bundle("v1"), "ci").await.unwrap();

    assert_eq!(index, 1);
    assert_eq!(store.list("app").await.unwrap().len(), 1);
}

#[tokio::test]
async fn persistent_conflicts_give_up() {
    let cluster = cluster();
    let store = store(&cluster);
    cluster.conflict_next_secret_writes(4);

    let err = store.record("app", &bundle("v1"), "ci").await.unwrap_err();

    assert_eq!(
        err,
        KilnError::RevisionConflict {
            app: "app".to_string(),
            attempts: 4
        }
    );
    assert!(store.list("app").await.unwrap().is_empty());
}

#[tokio::test]
async fn compact_drops_oldest() {
    let cluster = cluster();
    let store = store(&cluster);
    for version in ["v1", "v2", "v3"] {
        store.record("app", &bundle(version), "ci").await.unwrap();
    }

    assert_eq!(store.compact("app", 1).await.unwrap(), 2);
    assert_eq!(store.compact("app", 1).await.unwrap(), 0);
    let remaining = store.list("app").await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].index, 3);
}

#[tokio::test]
async fn record_in_missing_namespace() {
    let cluster = MemoryCluster::new();
    let err = store(&cluster)
        .record("app", &bundle("v1"), "ci")
        .await
        .unwrap_err();
    assert_eq!(
        err,
        KilnError::NamespaceMissing {
            namespace: "default".to_string()
        }
    );
}

#[tokio::test]
async fn unmanaged_record_secret_is_refused() {
    let cluster = cluster();
    cluster
        .write_secret(&StoredSecret {
            namespace: "default".to_string(),
            name: "app-releases".to_string(),
            type_: "Opaque".to_string(),
            data: BTreeMap::from([(RECORD_KEY.to_string(), b"{}".to_vec())]),
            ..Default::default()
        })
        .await
        .unwrap();

    let err = store(&cluster).list("app").await.unwrap_err();
    assert!(matches!(err, KilnError::AdoptionRefused { .. }));
}

#[tokio::test]
async fn record_secret_of_another_type_is_refused_before_writing() {
    let cluster = cluster();
    cluster
        .write_secret(&StoredSecret {
            namespace: "default".to_string(),
            name: "app-releases".to_string(),
            type_: "Opaque".to_string(),
            labels: BTreeMap::from([(MANAGED_BY_LABEL.to_string(), TOOL_NAME.to_string())]),
            data: BTreeMap::from([(RECORD_KEY.to_string(), b"{}".to_vec())]),
            ..Default::default()
        })
        .await
        .unwrap();

    let err = store(&cluster).record("app", &bundle("v1"), "ci").await.unwrap_err();
    assert!(matches!(err, KilnError::AdoptionRefused { .. }));

    let stored = cluster.read_secret("default", "app-releases").await.unwrap().unwrap();
    assert_eq!(stored.type_, "Opaque");
}

#[tokio::test]
async fn apps_keep_separate_histories() {
    let cluster = cluster();
    let store = store(&cluster);
    store.record("app", &bundle("v1"), "ci").await.unwrap();

    let other = render(
        &AppModel::single("other", "nginx:alpine", 8080),
        &RenderContext::new(),
    )
    .unwrap();
    assert_eq!(store.record("other", &other, "ci").await.unwrap(), 1);
    assert_eq!(store.list("app").await.unwrap().len(), 1);
}
