//! Registration discovery.
//!
//! Asks every ready serving pod which adapters it currently holds. The
//! serving processes are the source of truth for loadings; the
//! `loadedAdapters` status field is only a report of what was seen here.

use crate::error::{Result, RuntimeError};
use crate::traits::{ClusterApi, ControlPlane};
use crate::types::PodEndpoint;
use chrono::{DateTime, Utc};
use loraplex_core::{is_pod_ready, model_label, pod_endpoint, ModelAdapter, PodRef};
use loraplex_scheduler::PlacementCandidate;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How pod control endpoints are located
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Container port name carrying the control endpoints
    pub port_name: String,
    /// Port used when no container port is named
    pub default_port: u16,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port_name: loraplex_core::DEFAULT_PORT_NAME.to_string(),
            default_port: loraplex_core::DEFAULT_SERVING_PORT,
        }
    }
}

/// A `model`-labelled pod as listed
#[derive(Debug, Clone)]
pub struct ServingPod {
    pub pod: PodRef,
    pub model: Option<String>,
    pub ready: bool,
    /// `None` until the pod has an IP
    pub endpoint: Option<PodEndpoint>,
}

/// One (adapter, pod) loading reported by a serving process
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterLoading {
    /// Adapter id as registered
    pub adapter: String,
    /// Path the adapter was loaded from, as reported
    pub path: String,
    /// Base model the adapter is attached to
    pub parent: String,
    pub endpoint: PodEndpoint,
}

impl AdapterLoading {
    pub fn pod(&self) -> &PodRef {
        &self.endpoint.pod
    }
}

/// Snapshot of serving pods and their loadings
#[derive(Debug, Clone)]
pub struct ObservedState {
    /// Every listed pod, in list order
    pub pods: Vec<ServingPod>,
    /// Loadings reported by reachable ready pods
    pub loadings: Vec<AdapterLoading>,
    /// Ready pods that could not be queried
    pub unreachable: Vec<PodRef>,
    pub observed_at: DateTime<Utc>,
}

impl ObservedState {
    /// Loadings of one adapter name across all pods
    pub fn loadings_for(&self, lora_name: &str) -> Vec<AdapterLoading> {
        self.loadings
            .iter()
            .filter(|l| l.adapter == lora_name)
            .cloned()
            .collect()
    }

    /// Loadings that belong to `adapter`.
    ///
    /// Adapter names are only unique per base model, so a loading counts when
    /// the pod serves the adapter's base model or the adapter's own status
    /// already records it there (a relabelled pod still has to be drained).
    pub fn loadings_of(&self, adapter: &ModelAdapter) -> Vec<AdapterLoading> {
        let recorded: HashSet<String> = recorded_pods(adapter).iter().map(PodRef::key).collect();
        let base_model = adapter.spec.base_model.as_str();
        self.loadings_for(adapter.lora_name())
            .into_iter()
            .filter(|l| {
                let key = l.pod().key();
                recorded.contains(&key) || self.model_of(&key) == Some(base_model)
            })
            .collect()
    }

    /// Pods from `pods` that still exist but were not successfully queried,
    /// so whether they hold an adapter is unknown
    pub fn unverified(&self, pods: &[PodRef]) -> Vec<PodRef> {
        pods.iter()
            .filter(|pod| {
                let key = pod.key();
                match self.pods.iter().find(|p| p.pod.key() == key) {
                    None => false,
                    Some(serving) => {
                        !serving.ready
                            || serving.endpoint.is_none()
                            || self.unreachable.iter().any(|u| u.key() == key)
                    }
                }
            })
            .cloned()
            .collect()
    }

    fn model_of(&self, pod_key: &str) -> Option<&str> {
        self.pods
            .iter()
            .find(|p| p.pod.key() == pod_key)
            .and_then(|p| p.model.as_deref())
    }

    /// Scheduler input. A ready pod without an IP cannot be called, so it is
    /// offered as not ready.
    pub fn candidates(&self) -> Vec<PlacementCandidate> {
        self.pods
            .iter()
            .map(|p| {
                PlacementCandidate::new(
                    p.pod.clone(),
                    p.model.clone(),
                    p.ready && p.endpoint.is_some(),
                )
            })
            .collect()
    }

    /// Control endpoint for a pod key
    pub fn endpoint_for(&self, pod_key: &str) -> Option<&PodEndpoint> {
        self.pods
            .iter()
            .find(|p| p.pod.key() == pod_key)
            .and_then(|p| p.endpoint.as_ref())
    }
}

/// Pods the adapter's status reports as holding it
pub fn recorded_pods(adapter: &ModelAdapter) -> Vec<PodRef> {
    adapter
        .status
        .iter()
        .flat_map(|s| s.loaded_adapters.iter())
        .map(|l| PodRef::new(&l.pod_assignment.namespace, &l.pod_assignment.pod_name))
        .collect()
}

/// Builds an `ObservedState` from the cluster and the serving pods
pub struct RegistrationDiscovery {
    cluster: Arc<dyn ClusterApi>,
    control_plane: Arc<dyn ControlPlane>,
    config: DiscoveryConfig,
}

impl RegistrationDiscovery {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        control_plane: Arc<dyn ControlPlane>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            cluster,
            control_plane,
            config,
        }
    }

    /// List serving pods and query each ready one for its adapters.
    ///
    /// Unreachable pods and unparsable responses are skipped with a warning;
    /// only a failure to list pods fails the whole discovery.
    pub async fn discover(
        &self,
        api_key: Option<&str>,
        token: &CancellationToken,
    ) -> Result<ObservedState> {
        let listed = self.cluster.list_serving_pods().await?;

        let pods: Vec<ServingPod> = listed
            .iter()
            .filter_map(|pod| {
                let pod_ref = PodRef::from_pod(pod)?;
                let endpoint =
                    pod_endpoint(pod, &self.config.port_name, self.config.default_port)
                        .map(|url| PodEndpoint::new(pod_ref.clone(), url));
                Some(ServingPod {
                    pod: pod_ref,
                    model: model_label(pod).map(str::to_string),
                    ready: is_pod_ready(pod),
                    endpoint,
                })
            })
            .collect();

        let mut loadings = Vec::new();
        let mut unreachable = Vec::new();

        for serving in pods.iter().filter(|p| p.ready) {
            if token.is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }

            let Some(endpoint) = &serving.endpoint else {
                warn!("Ready pod {} has no IP yet, skipping", serving.pod);
                continue;
            };

            match self.control_plane.list_models(endpoint, api_key).await {
                Ok(cards) => {
                    for card in cards {
                        let Some(parent) = card.parent else {
                            continue;
                        };
                        loadings.push(AdapterLoading {
                            path: card.root.unwrap_or_default(),
                            adapter: card.id,
                            parent,
                            endpoint: endpoint.clone(),
                        });
                    }
                }
                Err(e) => {
                    warn!("Skipping pod {} during discovery: {}", serving.pod, e);
                    unreachable.push(serving.pod.clone());
                }
            }
        }

        debug!(
            "Discovered {} loadings across {} pods ({} unreachable)",
            loadings.len(),
            pods.len(),
            unreachable.len()
        );

        Ok(ObservedState {
            pods,
            loadings,
            unreachable,
            observed_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{endpoint_url, model_adapter, serving_pod, MockCluster, MockControlPlane};
    use crate::status::loaded_adapters_from;
    use loraplex_core::ModelAdapterStatus;

    async fn setup() -> (Arc<MockCluster>, Arc<MockControlPlane>, RegistrationDiscovery) {
        let cluster = Arc::new(MockCluster::new());
        let cp = Arc::new(MockControlPlane::new());
        let discovery =
            RegistrationDiscovery::new(cluster.clone(), cp.clone(), DiscoveryConfig::default());
        (cluster, cp, discovery)
    }

    #[tokio::test]
    async fn test_discovers_loadings_on_ready_pods() {
        let (cluster, cp, discovery) = setup().await;
        cluster
            .set_pods(vec![
                serving_pod("default", "a", "base", Some("10.0.0.1"), true),
                serving_pod("default", "b", "base", Some("10.0.0.2"), false),
            ])
            .await;
        for ip in ["10.0.0.1", "10.0.0.2"] {
            cp.add_server(&endpoint_url(ip), "base").await;
            cp.preload(&endpoint_url(ip), "sql-lora", "/models/sql-lora").await;
        }

        let observed = discovery
            .discover(None, &CancellationToken::new())
            .await
            .unwrap();

        // Not-ready pod is listed but never queried
        assert_eq!(observed.pods.len(), 2);
        assert_eq!(observed.loadings.len(), 1);
        let loading = &observed.loadings[0];
        assert_eq!(loading.adapter, "sql-lora");
        assert_eq!(loading.path, "/models/sql-lora");
        assert_eq!(loading.parent, "base");
        assert_eq!(loading.pod().key(), "default/a");
    }

    #[tokio::test]
    async fn test_unreachable_pod_is_skipped() {
        let (cluster, cp, discovery) = setup().await;
        cluster
            .set_pods(vec![
                serving_pod("default", "a", "base", Some("10.0.0.1"), true),
                serving_pod("default", "b", "base", Some("10.0.0.2"), true),
            ])
            .await;
        cp.add_server(&endpoint_url("10.0.0.1"), "base").await;
        cp.preload(&endpoint_url("10.0.0.1"), "x", "/x").await;
        cp.add_server(&endpoint_url("10.0.0.2"), "base").await;
        cp.set_reachable(&endpoint_url("10.0.0.2"), false).await;

        let observed = discovery
            .discover(None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(observed.loadings.len(), 1);
        assert_eq!(observed.unreachable, vec![PodRef::new("default", "b")]);
        // Still offered to the scheduler
        assert!(observed.candidates().iter().all(|c| c.ready));
    }

    #[tokio::test]
    async fn test_ready_pod_without_ip_is_not_a_ready_candidate() {
        let (cluster, _cp, discovery) = setup().await;
        cluster
            .set_pods(vec![serving_pod("default", "a", "base", None, true)])
            .await;

        let observed = discovery
            .discover(None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(observed.loadings.is_empty());
        assert!(!observed.candidates()[0].ready);
    }

    #[tokio::test]
    async fn test_pod_list_failure_fails_discovery() {
        let (cluster, _cp, discovery) = setup().await;
        cluster.set_unavailable(true);
        assert!(discovery
            .discover(None, &CancellationToken::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_cancelled_discovery() {
        let (cluster, cp, discovery) = setup().await;
        cluster
            .set_pods(vec![serving_pod("default", "a", "base", Some("10.0.0.1"), true)])
            .await;
        cp.add_server(&endpoint_url("10.0.0.1"), "base").await;

        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            discovery.discover(None, &token).await,
            Err(RuntimeError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_loadings_for_filters_by_name() {
        let (cluster, cp, discovery) = setup().await;
        cluster
            .set_pods(vec![serving_pod("default", "a", "base", Some("10.0.0.1"), true)])
            .await;
        let url = endpoint_url("10.0.0.1");
        cp.add_server(&url, "base").await;
        cp.preload(&url, "one", "/one").await;
        cp.preload(&url, "two", "/two").await;

        let observed = discovery
            .discover(None, &CancellationToken::new())
            .await
            .unwrap();
        let ones = observed.loadings_for("one");
        assert_eq!(ones.len(), 1);
        assert_eq!(ones[0].path, "/one");
        assert_eq!(
            observed.endpoint_for("default/a").map(|e| e.base_url.as_str()),
            Some(url.as_str())
        );
    }

    #[tokio::test]
    async fn test_loadings_of_scopes_to_base_model_and_recorded_pods() {
        let (cluster, cp, discovery) = setup().await;
        cluster
            .set_pods(vec![
                serving_pod("default", "a", "base", Some("10.0.0.1"), true),
                serving_pod("default", "b", "other", Some("10.0.0.2"), true),
                serving_pod("default", "c", "other", Some("10.0.0.3"), true),
            ])
            .await;
        for (ip, model) in [("10.0.0.1", "base"), ("10.0.0.2", "other"), ("10.0.0.3", "other")] {
            cp.add_server(&endpoint_url(ip), model).await;
            cp.preload(&endpoint_url(ip), "x", "/x").await;
        }

        let observed = discovery
            .discover(None, &CancellationToken::new())
            .await
            .unwrap();
        let mut adapter = model_adapter("default", "x-on-base", "base", "x", Some("/x"));
        let pods: Vec<String> = observed
            .loadings_of(&adapter)
            .iter()
            .map(|l| l.pod().key())
            .collect();
        assert_eq!(pods, vec!["default/a"]);

        // A pod relabelled away still belongs to the adapter that recorded it
        let recorded: Vec<AdapterLoading> = observed
            .loadings_for("x")
            .into_iter()
            .filter(|l| l.pod().name == "c")
            .collect();
        adapter.status = Some(ModelAdapterStatus {
            loaded_adapters: loaded_adapters_from(&recorded, &[], Utc::now()),
            ..Default::default()
        });
        let pods: Vec<String> = observed
            .loadings_of(&adapter)
            .iter()
            .map(|l| l.pod().key())
            .collect();
        assert_eq!(pods, vec!["default/a", "default/c"]);
    }

    #[tokio::test]
    async fn test_unverified_pods() {
        let (cluster, cp, discovery) = setup().await;
        cluster
            .set_pods(vec![
                serving_pod("default", "up", "base", Some("10.0.0.1"), true),
                serving_pod("default", "down", "base", Some("10.0.0.2"), true),
                serving_pod("default", "starting", "base", Some("10.0.0.3"), false),
            ])
            .await;
        cp.add_server(&endpoint_url("10.0.0.1"), "base").await;
        cp.add_server(&endpoint_url("10.0.0.2"), "base").await;
        cp.set_reachable(&endpoint_url("10.0.0.2"), false).await;

        let observed = discovery
            .discover(None, &CancellationToken::new())
            .await
            .unwrap();
        let unverified = observed.unverified(&[
            PodRef::new("default", "up"),
            PodRef::new("default", "down"),
            PodRef::new("default", "starting"),
            PodRef::new("default", "deleted"),
        ]);
        assert_eq!(
            unverified,
            vec![PodRef::new("default", "down"), PodRef::new("default", "starting")]
        );
    }
}
