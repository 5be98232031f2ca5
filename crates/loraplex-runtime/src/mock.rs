use crate::error::{Result, RuntimeError};
use crate::traits::{ClusterApi, ControlPlane};
use crate::types::{LoadLoraRequest, LoadOutcome, ModelCard, PodEndpoint, UnloadLoraRequest};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, Pod, PodCondition, PodSpec, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::ResourceExt;
use loraplex_core::{
    pod_key, AdapterSource, AdapterSourceType, DeploymentConfig, ModelAdapter, ModelAdapterSpec,
    PodRef, DEFAULT_PORT_NAME, DEFAULT_SERVING_PORT, MODEL_LABEL,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

fn not_found(what: &str) -> RuntimeError {
    RuntimeError::KubeError(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} not found", what),
        reason: "NotFound".to_string(),
        code: 404,
    }))
}

/// In-memory cluster for testing the controller without an API server
///
/// Tracks resourceVersions so stale writes conflict the way the API server
/// would, and garbage-collects deleting adapters once their last finalizer
/// is removed.
pub struct MockCluster {
    adapters: Arc<RwLock<BTreeMap<String, ModelAdapter>>>,
    pods: Arc<RwLock<Vec<Pod>>>,
    secrets: Arc<RwLock<HashMap<String, BTreeMap<String, String>>>>,
    next_version: AtomicU64,
    injected_conflicts: AtomicU32,
    status_writes: AtomicU32,
    unavailable: AtomicBool,
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCluster {
    pub fn new() -> Self {
        Self {
            adapters: Arc::new(RwLock::new(BTreeMap::new())),
            pods: Arc::new(RwLock::new(Vec::new())),
            secrets: Arc::new(RwLock::new(HashMap::new())),
            next_version: AtomicU64::new(1),
            injected_conflicts: AtomicU32::new(0),
            status_writes: AtomicU32::new(0),
            unavailable: AtomicBool::new(false),
        }
    }

    fn bump(&self, adapter: &mut ModelAdapter) {
        let rv = self.next_version.fetch_add(1, Ordering::SeqCst);
        adapter.metadata.resource_version = Some(rv.to_string());
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RuntimeError::internal_error("mock API server unavailable"));
        }
        Ok(())
    }

    /// Store an adapter, defaulting generation to 1
    pub async fn insert_adapter(&self, mut adapter: ModelAdapter) {
        if adapter.metadata.generation.is_none() {
            adapter.metadata.generation = Some(1);
        }
        self.bump(&mut adapter);
        self.adapters.write().await.insert(adapter.key(), adapter);
    }

    /// Snapshot of a stored adapter
    pub async fn adapter(&self, namespace: &str, name: &str) -> Option<ModelAdapter> {
        self.adapters
            .read()
            .await
            .get(&pod_key(namespace, name))
            .cloned()
    }

    /// Apply a spec edit, bumping the generation
    pub async fn update_spec(
        &self,
        namespace: &str,
        name: &str,
        edit: impl FnOnce(&mut ModelAdapterSpec),
    ) {
        let mut adapters = self.adapters.write().await;
        if let Some(adapter) = adapters.get_mut(&pod_key(namespace, name)) {
            edit(&mut adapter.spec);
            adapter.metadata.generation = Some(adapter.metadata.generation.unwrap_or(0) + 1);
            let rv = self.next_version.fetch_add(1, Ordering::SeqCst);
            adapter.metadata.resource_version = Some(rv.to_string());
        }
    }

    /// Delete the way the API server does: mark if finalizers remain, else remove
    pub async fn delete_adapter(&self, namespace: &str, name: &str) {
        let key = pod_key(namespace, name);
        let mut adapters = self.adapters.write().await;
        let Some(adapter) = adapters.get_mut(&key) else {
            return;
        };

        if adapter.finalizers().is_empty() {
            adapters.remove(&key);
            debug!("Mock: adapter {} removed", key);
        } else {
            adapter.metadata.deletion_timestamp = Some(Time(Utc::now()));
            let rv = self.next_version.fetch_add(1, Ordering::SeqCst);
            adapter.metadata.resource_version = Some(rv.to_string());
            debug!("Mock: adapter {} marked for deletion", key);
        }
    }

    pub async fn set_pods(&self, pods: Vec<Pod>) {
        *self.pods.write().await = pods;
    }

    /// Insert or replace a pod by namespace/name, keeping list position
    pub async fn upsert_pod(&self, pod: Pod) {
        let mut pods = self.pods.write().await;
        let key = PodRef::from_pod(&pod).map(|p| p.key());
        match pods
            .iter_mut()
            .find(|p| PodRef::from_pod(p).map(|r| r.key()) == key)
        {
            Some(existing) => *existing = pod,
            None => pods.push(pod),
        }
    }

    pub async fn remove_pod(&self, namespace: &str, name: &str) {
        let key = pod_key(namespace, name);
        self.pods
            .write()
            .await
            .retain(|p| PodRef::from_pod(p).map(|r| r.key()).as_deref() != Some(key.as_str()));
    }

    pub async fn insert_secret(&self, namespace: &str, name: &str, key: &str, value: &str) {
        self.secrets
            .write()
            .await
            .entry(pod_key(namespace, name))
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    /// Fail the next `n` status writes with a conflict
    pub fn inject_status_conflicts(&self, n: u32) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    /// Number of status writes that were accepted
    pub fn status_writes(&self) -> u32 {
        self.status_writes.load(Ordering::SeqCst)
    }

    /// Make list calls fail, simulating an API outage
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    async fn edit_finalizers(
        &self,
        adapter: &ModelAdapter,
        edit: impl FnOnce(&mut Vec<String>),
    ) -> Result<()> {
        let key = adapter.key();
        let mut adapters = self.adapters.write().await;
        let stored = adapters.get_mut(&key).ok_or_else(|| not_found(&key))?;

        if stored.metadata.resource_version != adapter.metadata.resource_version {
            return Err(RuntimeError::conflict(&key));
        }

        let mut finalizers = stored.metadata.finalizers.clone().unwrap_or_default();
        edit(&mut finalizers);
        stored.metadata.finalizers = Some(finalizers.clone());
        let rv = self.next_version.fetch_add(1, Ordering::SeqCst);
        stored.metadata.resource_version = Some(rv.to_string());

        if finalizers.is_empty() && stored.metadata.deletion_timestamp.is_some() {
            adapters.remove(&key);
            debug!("Mock: adapter {} garbage-collected", key);
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for MockCluster {
    async fn list_adapters(&self) -> Result<Vec<ModelAdapter>> {
        self.check_available()?;
        Ok(self.adapters.read().await.values().cloned().collect())
    }

    async fn get_adapter(&self, namespace: &str, name: &str) -> Result<Option<ModelAdapter>> {
        self.check_available()?;
        Ok(self.adapter(namespace, name).await)
    }

    async fn replace_adapter_status(&self, adapter: &ModelAdapter) -> Result<()> {
        let key = adapter.key();
        if self
            .injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            debug!("Mock: injected status conflict for {}", key);
            return Err(RuntimeError::conflict(&key));
        }

        let mut adapters = self.adapters.write().await;
        let stored = adapters.get_mut(&key).ok_or_else(|| not_found(&key))?;
        if stored.metadata.resource_version != adapter.metadata.resource_version {
            return Err(RuntimeError::conflict(&key));
        }

        stored.status = adapter.status.clone();
        let rv = self.next_version.fetch_add(1, Ordering::SeqCst);
        stored.metadata.resource_version = Some(rv.to_string());
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn add_finalizer(&self, adapter: &ModelAdapter, finalizer: &str) -> Result<()> {
        self.edit_finalizers(adapter, |finalizers| {
            if !finalizers.iter().any(|f| f == finalizer) {
                finalizers.push(finalizer.to_string());
            }
        })
        .await
    }

    async fn remove_finalizer(&self, adapter: &ModelAdapter, finalizer: &str) -> Result<()> {
        self.edit_finalizers(adapter, |finalizers| finalizers.retain(|f| f != finalizer))
            .await
    }

    async fn list_serving_pods(&self) -> Result<Vec<Pod>> {
        self.check_available()?;
        Ok(self
            .pods
            .read()
            .await
            .iter()
            .filter(|p| loraplex_core::model_label(p).is_some())
            .cloned()
            .collect())
    }

    async fn get_secret_value(&self, namespace: &str, name: &str, key: &str) -> Result<String> {
        let secrets = self.secrets.read().await;
        let data = secrets
            .get(&pod_key(namespace, name))
            .ok_or_else(|| RuntimeError::secret_not_found(namespace, name))?;
        data.get(key)
            .cloned()
            .ok_or_else(|| RuntimeError::secret_key_missing(name, key))
    }
}

/// One call received by `MockControlPlane`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPlaneCall {
    ListModels {
        pod: String,
    },
    Load {
        pod: String,
        lora_name: String,
        lora_path: String,
        api_key: Option<String>,
    },
    Unload {
        pod: String,
        lora_name: String,
        api_key: Option<String>,
    },
}

#[derive(Debug, Clone)]
struct MockServer {
    base_model: String,
    adapters: BTreeMap<String, String>,
    reachable: bool,
    reject_loads: bool,
}

/// In-memory serving processes keyed by base URL
///
/// Behaves like the HTTP client after response normalization: a duplicate
/// load reports `AlreadyLoaded`, unloading an unknown adapter is a 404
/// rejection, and unreachable servers fail every call.
#[derive(Default)]
pub struct MockControlPlane {
    servers: Arc<RwLock<HashMap<String, MockServer>>>,
    calls: Arc<RwLock<Vec<ControlPlaneCall>>>,
}

impl MockControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_server(&self, base_url: &str, base_model: &str) {
        self.servers.write().await.insert(
            base_url.to_string(),
            MockServer {
                base_model: base_model.to_string(),
                adapters: BTreeMap::new(),
                reachable: true,
                reject_loads: false,
            },
        );
    }

    pub async fn set_reachable(&self, base_url: &str, reachable: bool) {
        if let Some(server) = self.servers.write().await.get_mut(base_url) {
            server.reachable = reachable;
        }
    }

    /// Make loads on this server fail with a 500
    pub async fn set_reject_loads(&self, base_url: &str, reject: bool) {
        if let Some(server) = self.servers.write().await.get_mut(base_url) {
            server.reject_loads = reject;
        }
    }

    /// Register an adapter without going through the load endpoint
    pub async fn preload(&self, base_url: &str, lora_name: &str, lora_path: &str) {
        if let Some(server) = self.servers.write().await.get_mut(base_url) {
            server
                .adapters
                .insert(lora_name.to_string(), lora_path.to_string());
        }
    }

    /// Adapter names registered on a server
    pub async fn adapters_on(&self, base_url: &str) -> Vec<String> {
        self.servers
            .read()
            .await
            .get(base_url)
            .map(|s| s.adapters.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn calls(&self) -> Vec<ControlPlaneCall> {
        self.calls.read().await.clone()
    }

    /// Load and unload calls only
    pub async fn mutating_calls(&self) -> Vec<ControlPlaneCall> {
        self.calls
            .read()
            .await
            .iter()
            .filter(|c| !matches!(c, ControlPlaneCall::ListModels { .. }))
            .cloned()
            .collect()
    }

    pub async fn clear_calls(&self) {
        self.calls.write().await.clear();
    }

    async fn record(&self, call: ControlPlaneCall) {
        self.calls.write().await.push(call);
    }
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    async fn list_models(
        &self,
        endpoint: &PodEndpoint,
        _api_key: Option<&str>,
    ) -> Result<Vec<ModelCard>> {
        self.record(ControlPlaneCall::ListModels {
            pod: endpoint.pod.key(),
        })
        .await;

        let servers = self.servers.read().await;
        let server = servers
            .get(&endpoint.base_url)
            .filter(|s| s.reachable)
            .ok_or_else(|| RuntimeError::pod_unreachable(endpoint.pod.key(), "connection refused"))?;

        let base = ModelCard {
            id: server.base_model.clone(),
            object: "model".to_string(),
            created: 0,
            owned_by: "vllm".to_string(),
            root: Some(server.base_model.clone()),
            parent: None,
        };
        let adapters = server.adapters.iter().map(|(name, path)| ModelCard {
            id: name.clone(),
            object: "model".to_string(),
            created: 0,
            owned_by: "vllm".to_string(),
            root: Some(path.clone()),
            parent: Some(server.base_model.clone()),
        });
        Ok(std::iter::once(base).chain(adapters).collect())
    }

    async fn load_adapter(
        &self,
        endpoint: &PodEndpoint,
        request: &LoadLoraRequest,
        api_key: Option<&str>,
    ) -> Result<LoadOutcome> {
        self.record(ControlPlaneCall::Load {
            pod: endpoint.pod.key(),
            lora_name: request.lora_name.clone(),
            lora_path: request.lora_path.clone(),
            api_key: api_key.map(str::to_string),
        })
        .await;

        let mut servers = self.servers.write().await;
        let server = servers
            .get_mut(&endpoint.base_url)
            .filter(|s| s.reachable)
            .ok_or_else(|| RuntimeError::pod_unreachable(endpoint.pod.key(), "connection refused"))?;

        if server.reject_loads {
            return Err(RuntimeError::control_plane_rejected(
                endpoint.pod.key(),
                format!("load of {}", request.lora_name),
                500,
                "internal error",
            ));
        }
        if server.adapters.contains_key(&request.lora_name) {
            return Ok(LoadOutcome::AlreadyLoaded);
        }
        server
            .adapters
            .insert(request.lora_name.clone(), request.lora_path.clone());
        Ok(LoadOutcome::Loaded)
    }

    async fn unload_adapter(
        &self,
        endpoint: &PodEndpoint,
        request: &UnloadLoraRequest,
        api_key: Option<&str>,
    ) -> Result<()> {
        self.record(ControlPlaneCall::Unload {
            pod: endpoint.pod.key(),
            lora_name: request.lora_name.clone(),
            api_key: api_key.map(str::to_string),
        })
        .await;

        let mut servers = self.servers.write().await;
        let server = servers
            .get_mut(&endpoint.base_url)
            .filter(|s| s.reachable)
            .ok_or_else(|| RuntimeError::pod_unreachable(endpoint.pod.key(), "connection refused"))?;

        match server.adapters.remove(&request.lora_name) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::control_plane_rejected(
                endpoint.pod.key(),
                format!("unload of {}", request.lora_name),
                404,
                "adapter not found",
            )),
        }
    }
}

/// Base URL the fixtures give a pod with this IP
pub fn endpoint_url(ip: &str) -> String {
    format!("http://{}:{}", ip, DEFAULT_SERVING_PORT)
}

/// Serving pod fixture with a named `http` port and a Ready condition
pub fn serving_pod(namespace: &str, name: &str, model: &str, ip: Option<&str>, ready: bool) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(MODEL_LABEL.to_string(), model.to_string())])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "vllm".to_string(),
                ports: Some(vec![ContainerPort {
                    name: Some(DEFAULT_PORT_NAME.to_string()),
                    container_port: i32::from(DEFAULT_SERVING_PORT),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            pod_ip: ip.map(str::to_string),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// ModelAdapter fixture using a local source
pub fn model_adapter(
    namespace: &str,
    name: &str,
    base_model: &str,
    lora_name: &str,
    path: Option<&str>,
) -> ModelAdapter {
    let mut adapter = ModelAdapter::new(
        name,
        ModelAdapterSpec {
            base_model: base_model.to_string(),
            adapter_source: AdapterSource {
                source_type: AdapterSourceType::Local,
                adapter_name: lora_name.to_string(),
                adapter_path: path.map(str::to_string),
                credentials_ref: None,
                pattern: None,
                repository: None,
                max_adapters: None,
            },
            deployment_config: DeploymentConfig::default(),
            api_key_config: None,
        },
    );
    adapter.metadata.namespace = Some(namespace.to_string());
    adapter.metadata.generation = Some(1);
    adapter
}

#[cfg(test)]
mod tests {
    use super::*;
    use loraplex_core::ADAPTER_FINALIZER;

    #[tokio::test]
    async fn test_stale_status_write_conflicts() {
        let cluster = MockCluster::new();
        cluster
            .insert_adapter(model_adapter("default", "a", "base", "a", Some("/a")))
            .await;

        let first = cluster.adapter("default", "a").await.unwrap();
        cluster.replace_adapter_status(&first).await.unwrap();

        // Same snapshot again: resourceVersion is now stale
        let err = cluster.replace_adapter_status(&first).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(cluster.status_writes(), 1);
    }

    #[tokio::test]
    async fn test_delete_with_finalizer_marks_then_collects() {
        let cluster = MockCluster::new();
        cluster
            .insert_adapter(model_adapter("default", "a", "base", "a", Some("/a")))
            .await;
        let snapshot = cluster.adapter("default", "a").await.unwrap();
        cluster.add_finalizer(&snapshot, ADAPTER_FINALIZER).await.unwrap();

        cluster.delete_adapter("default", "a").await;
        let deleting = cluster.adapter("default", "a").await.unwrap();
        assert!(deleting.is_deleting());

        cluster
            .remove_finalizer(&deleting, ADAPTER_FINALIZER)
            .await
            .unwrap();
        assert!(cluster.adapter("default", "a").await.is_none());
    }

    #[tokio::test]
    async fn test_mock_control_plane_load_semantics() {
        let cp = MockControlPlane::new();
        let url = endpoint_url("10.0.0.1");
        cp.add_server(&url, "base").await;
        let endpoint = PodEndpoint::new(PodRef::new("default", "p"), url.clone());
        let req = LoadLoraRequest {
            lora_name: "a".to_string(),
            lora_path: "/a".to_string(),
        };

        assert_eq!(cp.load_adapter(&endpoint, &req, None).await.unwrap(), LoadOutcome::Loaded);
        assert_eq!(
            cp.load_adapter(&endpoint, &req, None).await.unwrap(),
            LoadOutcome::AlreadyLoaded
        );
        assert_eq!(cp.adapters_on(&url).await, vec!["a"]);

        cp.set_reachable(&url, false).await;
        assert!(matches!(
            cp.list_models(&endpoint, None).await,
            Err(RuntimeError::PodUnreachable { .. })
        ));
    }
}
