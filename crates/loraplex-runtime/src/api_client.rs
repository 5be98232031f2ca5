use crate::error::{Result, RuntimeError};
use crate::traits::ClusterApi;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use loraplex_core::{ModelAdapter, MODEL_LABEL};
use serde_json::json;
use tracing::debug;

/// `ClusterApi` backed by a kube-rs client
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn adapters(&self, namespace: &str) -> Api<ModelAdapter> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Merge-patch the finalizer list, pinned to the observed resourceVersion
    async fn patch_finalizers(&self, adapter: &ModelAdapter, finalizers: Vec<String>) -> Result<()> {
        let name = adapter.name_any();
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": adapter.resource_version(),
            }
        });

        match self
            .adapters(&adapter.namespace_or_default())
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                Err(RuntimeError::conflict(adapter.key()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list_adapters(&self) -> Result<Vec<ModelAdapter>> {
        let api: Api<ModelAdapter> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        debug!("Listed {} ModelAdapters", list.items.len());
        Ok(list.items)
    }

    async fn get_adapter(&self, namespace: &str, name: &str) -> Result<Option<ModelAdapter>> {
        Ok(self.adapters(namespace).get_opt(name).await?)
    }

    async fn replace_adapter_status(&self, adapter: &ModelAdapter) -> Result<()> {
        let name = adapter.name_any();
        let data = serde_json::to_vec(adapter).map_err(|e| {
            RuntimeError::internal_error(format!("Failed to serialize ModelAdapter: {}", e))
        })?;

        debug!("PUT status for ModelAdapter {}", adapter.key());
        match self
            .adapters(&adapter.namespace_or_default())
            .replace_status(&name, &PostParams::default(), data)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                Err(RuntimeError::conflict(adapter.key()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn add_finalizer(&self, adapter: &ModelAdapter, finalizer: &str) -> Result<()> {
        if adapter.has_finalizer(finalizer) {
            return Ok(());
        }
        let mut finalizers = adapter.finalizers().to_vec();
        finalizers.push(finalizer.to_string());
        self.patch_finalizers(adapter, finalizers).await
    }

    async fn remove_finalizer(&self, adapter: &ModelAdapter, finalizer: &str) -> Result<()> {
        if !adapter.has_finalizer(finalizer) {
            return Ok(());
        }
        let finalizers: Vec<String> = adapter
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != finalizer)
            .cloned()
            .collect();

        match self.patch_finalizers(adapter, finalizers).await {
            // Already gone: nothing left to release
            Err(RuntimeError::KubeError(kube::Error::Api(ae))) if ae.code == 404 => Ok(()),
            other => other,
        }
    }

    async fn list_serving_pods(&self) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default().labels(MODEL_LABEL)).await?;
        debug!("Listed {} pods with label '{}'", list.items.len(), MODEL_LABEL);
        Ok(list.items)
    }

    async fn get_secret_value(&self, namespace: &str, name: &str, key: &str) -> Result<String> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api
            .get_opt(name)
            .await?
            .ok_or_else(|| RuntimeError::secret_not_found(namespace, name))?;

        let bytes = secret
            .data
            .as_ref()
            .and_then(|data| data.get(key))
            .map(|v| v.0.clone())
            .ok_or_else(|| RuntimeError::secret_key_missing(name, key))?;

        String::from_utf8(bytes).map_err(|_| RuntimeError::secret_key_missing(name, key))
    }
}
