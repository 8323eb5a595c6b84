//! [`ClusterHandle`] backed by a Kubernetes API server.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use super::{
    ApplyParams, ClusterError, ClusterHandle, LiveObject, NamespaceInfo, PodSnapshot,
    StoredSecret, WaitingContainer, selector_string,
};
use crate::bundle::{Kind, Manifest, ObjectRef};

/// Live cluster reached through the local kubeconfig or in-cluster config.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    context: String,
}

impl KubeCluster {
    /// Connect using `context`, or the kubeconfig's current context.
    pub async fn connect(context: Option<&str>) -> Result<Self, ClusterError> {
        let config = match context {
            Some(name) => {
                let options = KubeConfigOptions {
                    context: Some(name.to_string()),
                    ..Default::default()
                };
                Config::from_kubeconfig(&options)
                    .await
                    .map_err(|e| ClusterError::Unavailable(e.to_string()))?
            }
            None => Config::infer()
                .await
                .map_err(|e| ClusterError::Unavailable(e.to_string()))?,
        };
        let client =
            Client::try_from(config).map_err(|e| ClusterError::Unavailable(e.to_string()))?;

        let context = match context {
            Some(name) => name.to_string(),
            None => Kubeconfig::read()
                .ok()
                .and_then(|kc| kc.current_context)
                .unwrap_or_else(|| "in-cluster".to_string()),
        };
        tracing::debug!(context = %context, "connected to cluster");
        Ok(Self { client, context })
    }

    fn dynamic_api(&self, kind: Kind, namespace: &str) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk(kind.group(), kind.version(), kind.as_str());
        let resource = ApiResource::from_gvk_with_plural(&gvk, kind.plural());
        Api::namespaced_with(self.client.clone(), namespace, &resource)
    }
}

fn map_error(err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(response) => match response.code {
            404 => ClusterError::NotFound(response.message),
            403 => ClusterError::Forbidden(response.message),
            409 => ClusterError::Conflict(response.message),
            400 | 422 => ClusterError::Invalid(response.message),
            _ => ClusterError::Unavailable(format!("{}: {}", response.reason, response.message)),
        },
        other => ClusterError::Unavailable(other.to_string()),
    }
}

fn to_live(object: &DynamicObject) -> Result<LiveObject, ClusterError> {
    serde_json::to_value(object)
        .map(LiveObject::new)
        .map_err(|e| ClusterError::Unavailable(format!("decode response: {}", e)))
}

fn namespace_info(ns: Namespace) -> NamespaceInfo {
    NamespaceInfo {
        name: ns.metadata.name.unwrap_or_default(),
        labels: ns.metadata.labels.unwrap_or_default(),
        annotations: ns.metadata.annotations.unwrap_or_default(),
    }
}

fn stored_secret(secret: Secret) -> StoredSecret {
    StoredSecret {
        namespace: secret.metadata.namespace.unwrap_or_default(),
        name: secret.metadata.name.unwrap_or_default(),
        type_: secret.type_.unwrap_or_default(),
        labels: secret.metadata.labels.unwrap_or_default(),
        data: secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect(),
        resource_version: secret.metadata.resource_version,
    }
}

#[async_trait]
impl ClusterHandle for KubeCluster {
    fn context(&self) -> String {
        self.context.clone()
    }

    async fn get(&self, target: &ObjectRef) -> Result<Option<LiveObject>, ClusterError> {
        let api = self.dynamic_api(target.kind, &target.namespace);
        match api.get_opt(&target.name).await.map_err(map_error)? {
            Some(object) => Ok(Some(to_live(&object)?)),
            None => Ok(None),
        }
    }

    async fn apply(
        &self,
        manifest: &Manifest,
        params: &ApplyParams,
    ) -> Result<LiveObject, ClusterError> {
        let api = self.dynamic_api(manifest.kind, &manifest.namespace);
        let mut patch_params = PatchParams::apply(&params.field_manager);
        if params.force {
            patch_params = patch_params.force();
        }
        let applied = api
            .patch(&manifest.name, &patch_params, &Patch::Apply(&manifest.body))
            .await
            .map_err(map_error)?;
        to_live(&applied)
    }

    async fn delete(&self, target: &ObjectRef) -> Result<(), ClusterError> {
        let api = self.dynamic_api(target.kind, &target.namespace);
        api.delete(&target.name, &DeleteParams::background())
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PodSnapshot>, ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&selector_string(selector));
        let pods = api.list(&params).await.map_err(map_error)?;

        Ok(pods
            .items
            .into_iter()
            .map(|pod| {
                let name = pod.metadata.name.unwrap_or_default();
                let status = pod.status.unwrap_or_default();
                let waiting = status
                    .init_container_statuses
                    .unwrap_or_default()
                    .into_iter()
                    .chain(status.container_statuses.unwrap_or_default())
                    .filter_map(|cs| {
                        let waiting = cs.state?.waiting?;
                        Some(WaitingContainer {
                            container: cs.name,
                            reason: waiting.reason.unwrap_or_default(),
                            message: waiting.message.unwrap_or_default(),
                        })
                    })
                    .collect();
                PodSnapshot { name, waiting }
            })
            .collect())
    }

    async fn read_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StoredSecret>, ClusterError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await.map_err(map_error)?.map(stored_secret))
    }

    async fn write_secret(&self, secret: &StoredSecret) -> Result<StoredSecret, ClusterError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &secret.namespace);
        let object = Secret {
            metadata: ObjectMeta {
                name: Some(secret.name.clone()),
                namespace: Some(secret.namespace.clone()),
                labels: Some(secret.labels.clone()),
                resource_version: secret.resource_version.clone(),
                ..Default::default()
            },
            type_: Some(secret.type_.clone()),
            data: Some(
                secret
                    .data
                    .iter()
                    .map(|(k, v)| (k.clone(), ByteString(v.clone())))
                    .collect(),
            ),
            ..Default::default()
        };

        let written = match &secret.resource_version {
            None => api.create(&PostParams::default(), &object).await,
            Some(_) => api.replace(&secret.name, &PostParams::default(), &object).await,
        }
        .map_err(map_error)?;
        Ok(stored_secret(written))
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<NamespaceInfo>, ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await.map_err(map_error)?.map(namespace_info))
    }

    async fn ensure_namespace(&self, namespace: &NamespaceInfo) -> Result<(), ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        if api.get_opt(&namespace.name).await.map_err(map_error)?.is_some() {
            return Ok(());
        }
        let object = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.name.clone()),
                labels: Some(namespace.labels.clone()),
                annotations: Some(namespace.annotations.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &object).await {
            Ok(_) => Ok(()),
            Err(e) => match map_error(e) {
                ClusterError::Conflict(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn list_namespaces(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<NamespaceInfo>, ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&selector_string(selector));
        let list = api.list(&params).await.map_err(map_error)?;
        Ok(list.items.into_iter().map(namespace_info).collect())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::background())
            .await
            .map_err(map_error)?;
        Ok(())
    }
}
