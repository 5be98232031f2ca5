use crate::error::Result;
use crate::types::{LoadLoraRequest, LoadOutcome, ModelCard, PodEndpoint, UnloadLoraRequest};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use loraplex_core::ModelAdapter;

/// Access to the cluster API used by the adapter controller
///
/// Abstracts the handful of reads and writes the controller performs so
/// reconciliation can be exercised against `MockCluster` without an API server.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    // --- ModelAdapter ---

    /// List ModelAdapters in every namespace
    async fn list_adapters(&self) -> Result<Vec<ModelAdapter>>;

    /// Fetch one ModelAdapter; `None` if it no longer exists
    async fn get_adapter(&self, namespace: &str, name: &str) -> Result<Option<ModelAdapter>>;

    /// Replace the status subresource.
    ///
    /// The object's `resourceVersion` guards the write; a stale version
    /// surfaces as `RuntimeError::Conflict`.
    async fn replace_adapter_status(&self, adapter: &ModelAdapter) -> Result<()>;

    /// Add a finalizer if absent
    async fn add_finalizer(&self, adapter: &ModelAdapter, finalizer: &str) -> Result<()>;

    /// Remove a finalizer if present
    async fn remove_finalizer(&self, adapter: &ModelAdapter, finalizer: &str) -> Result<()>;

    // --- Serving pods ---

    /// List every pod carrying the `model` label, in list order
    async fn list_serving_pods(&self) -> Result<Vec<Pod>>;

    // --- Secrets ---

    /// Read one UTF-8 value out of a Secret
    async fn get_secret_value(&self, namespace: &str, name: &str, key: &str) -> Result<String>;
}

/// Client for the adapter control endpoints exposed by serving pods
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// GET /v1/models
    async fn list_models(
        &self,
        endpoint: &PodEndpoint,
        api_key: Option<&str>,
    ) -> Result<Vec<ModelCard>>;

    /// POST /v1/load_lora_adapter
    ///
    /// An "already loaded" rejection is reported as `LoadOutcome::AlreadyLoaded`.
    async fn load_adapter(
        &self,
        endpoint: &PodEndpoint,
        request: &LoadLoraRequest,
        api_key: Option<&str>,
    ) -> Result<LoadOutcome>;

    /// POST /v1/unload_lora_adapter
    async fn unload_adapter(
        &self,
        endpoint: &PodEndpoint,
        request: &UnloadLoraRequest,
        api_key: Option<&str>,
    ) -> Result<()>;
}
