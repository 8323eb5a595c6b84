//! Throwaway preview namespaces, one per app and preview id.

use std::collections::BTreeMap;

use chrono::Utc;

use crate::cluster::{ClusterError, ClusterHandle, NamespaceInfo};
use crate::error::{KilnError, Result};
use crate::labels::{
    MANAGED_BY_LABEL, PREVIEW_CREATED_ANNOTATION, PREVIEW_LABEL, TOOL_NAME, is_managed,
};
use crate::model::validate::is_dns_label;

pub fn preview_namespace(app: &str, id: &str) -> String {
    format!("{}-preview-{}", app, id)
}

pub struct PreviewManager<'a> {
    cluster: &'a dyn ClusterHandle,
}

impl<'a> PreviewManager<'a> {
    pub fn new(cluster: &'a dyn ClusterHandle) -> Self {
        Self { cluster }
    }

    /// Ensure the preview namespace exists and return it. An existing
    /// namespace of the same name must already be a preview of `app`.
    pub async fn up(&self, app: &str, id: &str) -> Result<NamespaceInfo> {
        let name = preview_namespace(app, id);
        if !is_dns_label(&name) {
            return Err(KilnError::invalid(
                "preview id",
                format!("'{}' is not a valid namespace name", name),
            ));
        }

        if let Some(existing) = self.cluster.get_namespace(&name).await.map_err(cluster_error)? {
            if !is_preview_of(&existing, app) {
                return Err(KilnError::AdoptionRefused {
                    target: format!("Namespace/{}", name),
                });
            }
            tracing::info!(namespace = %name, "preview exists");
            return Ok(existing);
        }

        let namespace = NamespaceInfo {
            name: name.clone(),
            labels: BTreeMap::from([
                (MANAGED_BY_LABEL.to_string(), TOOL_NAME.to_string()),
                (PREVIEW_LABEL.to_string(), app.to_string()),
            ]),
            annotations: BTreeMap::from([(
                PREVIEW_CREATED_ANNOTATION.to_string(),
                Utc::now().to_rfc3339(),
            )]),
        };
        self.cluster
            .ensure_namespace(&namespace)
            .await
            .map_err(cluster_error)?;
        tracing::info!(namespace = %name, "preview created");
        Ok(namespace)
    }

    /// Preview namespaces of `app`, sorted by name.
    pub async fn list(&self, app: &str) -> Result<Vec<NamespaceInfo>> {
        let selector = BTreeMap::from([
            (MANAGED_BY_LABEL.to_string(), TOOL_NAME.to_string()),
            (PREVIEW_LABEL.to_string(), app.to_string()),
        ]);
        let mut namespaces = self
            .cluster
            .list_namespaces(&selector)
            .await
            .map_err(cluster_error)?;
        namespaces.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(namespaces)
    }

    /// Delete the preview namespace. `Ok(false)` when it did not exist.
    pub async fn down(&self, app: &str, id: &str) -> Result<bool> {
        let name = preview_namespace(app, id);
        let Some(existing) = self.cluster.get_namespace(&name).await.map_err(cluster_error)? else {
            return Ok(false);
        };
        if !is_preview_of(&existing, app) {
            return Err(KilnError::AdoptionRefused {
                target: format!("Namespace/{}", name),
            });
        }
        match self.cluster.delete_namespace(&name).await {
            Ok(()) => {
                tracing::info!(namespace = %name, "preview deleted");
                Ok(true)
            }
            Err(ClusterError::NotFound(_)) => Ok(false),
            Err(err) => Err(cluster_error(err)),
        }
    }
}

fn is_preview_of(namespace: &NamespaceInfo, app: &str) -> bool {
    is_managed(&namespace.labels)
        && namespace.labels.get(PREVIEW_LABEL).map(String::as_str) == Some(app)
}

fn cluster_error(err: ClusterError) -> KilnError {
    match err {
        ClusterError::Forbidden(message) => KilnError::Forbidden {
            target: "namespaces".to_string(),
            message,
        },
        other => KilnError::internal(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemoryCluster;

    #[tokio::test]
    async fn up_list_down() {
        let cluster = MemoryCluster::new();
        let previews = PreviewManager::new(&cluster);

        let ns = previews.up("shop", "pr-12").await.expect("preview up");
        assert_eq!(ns.name, "shop-preview-pr-12");
        assert!(cluster.has_namespace("shop-preview-pr-12"));

        let listed = previews.list("shop").await.expect("list");
        assert_eq!(listed.len(), 1);

        assert!(previews.down("shop", "pr-12").await.expect("down"));
        assert!(!cluster.has_namespace("shop-preview-pr-12"));
        assert!(!previews.down("shop", "pr-12").await.expect("second down"));
    }

    #[tokio::test]
    async fn down_refuses_unlabelled_namespace() {
        let cluster = MemoryCluster::new();
        cluster.create_namespace("shop-preview-manual");
        let previews = PreviewManager::new(&cluster);

        let err = previews.down("shop", "manual").await.unwrap_err();
        assert_eq!(err.class(), "AdoptionRefused");
        assert!(cluster.has_namespace("shop-preview-manual"));
    }

    #[tokio::test]
    async fn down_refuses_another_apps_preview() {
        let cluster = MemoryCluster::new();
        let previews = PreviewManager::new(&cluster);

        // `a-preview-b` + `c` and `a` + `b-preview-c` share a namespace name.
        let ns = previews.up("a-preview-b", "c").await.expect("preview up");
        assert_eq!(ns.name, preview_namespace("a", "b-preview-c"));

        let err = previews.down("a", "b-preview-c").await.unwrap_err();
        assert_eq!(err.class(), "AdoptionRefused");
        assert!(cluster.has_namespace(&ns.name));
    }

    #[tokio::test]
    async fn invalid_id_is_rejected() {
        let cluster = MemoryCluster::new();
        let err = PreviewManager::new(&cluster)
            .up("shop", "Bad_ID")
            .await
            .unwrap_err();
        assert_eq!(err.class(), "InvalidModel");
    }
}
