use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    core::NamespaceResourceScope,
    Client, Resource,
};
use mesh_ingress_controller_core::CONTROLLER_NAME;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

/// Namespaced objects the reconcilers read and write.
pub trait Managed:
    Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> Managed for K where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// The cluster operations a reconcile performs.
#[async_trait]
pub trait ClusterApi: Send + Sync + 'static {
    async fn get<K: Managed>(&self, ns: &str, name: &str) -> Result<Option<K>, kube::Error>;

    async fn create<K: Managed>(&self, obj: &K) -> Result<K, kube::Error>;

    /// Replaces an object. `obj` must carry the resource version it was
    /// derived from.
    async fn replace<K: Managed>(&self, obj: &K) -> Result<K, kube::Error>;

    async fn delete<K: Managed>(&self, ns: &str, name: &str) -> Result<(), kube::Error>;

    /// Merge-patches the status subresource with `{"status": status}`.
    async fn patch_status<K: Managed>(
        &self,
        ns: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<(), kube::Error>;
}

/// A [`ClusterApi`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

// === impl KubeClusterApi ===

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: Managed>(&self, ns: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), ns)
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(CONTROLLER_NAME.to_string()),
            ..Default::default()
        }
    }
}

impl fmt::Debug for KubeClusterApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeClusterApi").finish_non_exhaustive()
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get<K: Managed>(&self, ns: &str, name: &str) -> Result<Option<K>, kube::Error> {
        self.api::<K>(ns).get_opt(name).await
    }

    async fn create<K: Managed>(&self, obj: &K) -> Result<K, kube::Error> {
        let ns = obj.meta().namespace.as_deref().unwrap_or_default();
        self.api::<K>(ns).create(&Self::post_params(), obj).await
    }

    async fn replace<K: Managed>(&self, obj: &K) -> Result<K, kube::Error> {
        let meta = obj.meta();
        let ns = meta.namespace.as_deref().unwrap_or_default();
        let name = meta.name.as_deref().unwrap_or_default();
        self.api::<K>(ns)
            .replace(name, &Self::post_params(), obj)
            .await
    }

    async fn delete<K: Managed>(&self, ns: &str, name: &str) -> Result<(), kube::Error> {
        match self.api::<K>(ns).delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn patch_status<K: Managed>(
        &self,
        ns: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<(), kube::Error> {
        let patch = serde_json::json!({ "status": status });
        self.api::<K>(ns)
            .patch_status(
                name,
                &PatchParams {
                    field_manager: Some(CONTROLLER_NAME.to_string()),
                    ..Default::default()
                },
                &Patch::Merge(patch),
            )
            .await?;
        Ok(())
    }
}
