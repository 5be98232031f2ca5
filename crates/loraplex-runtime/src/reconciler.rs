use crate::discovery::{AdapterLoading, ObservedState};
use crate::error::{Result, RuntimeError};
use crate::traits::ControlPlane;
use crate::types::{LoadLoraRequest, LoadOutcome, PodEndpoint, UnloadLoraRequest};
use loraplex_core::{ModelAdapter, PodRef};
use loraplex_scheduler::PodPlacement;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Calls needed to turn the current loadings into the desired placement
#[derive(Debug, Clone, Default)]
pub struct ReconcilePlan {
    /// Desired pods not yet holding the adapter
    pub to_load: Vec<PodEndpoint>,
    /// Pods holding the adapter that are no longer desired
    pub to_unload: Vec<PodEndpoint>,
    /// Desired pods whose endpoint is unknown
    pub unresolved: Vec<PodRef>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.to_load.is_empty() && self.to_unload.is_empty()
    }
}

/// Diff current loadings against the desired placement, keyed by `namespace/podName`
pub fn plan(
    current: &[AdapterLoading],
    desired: &[PodPlacement],
    observed: &ObservedState,
) -> ReconcilePlan {
    let current_keys: HashSet<String> = current.iter().map(|l| l.pod().key()).collect();
    let desired_keys: HashSet<String> = desired.iter().map(|p| p.key()).collect();

    let mut result = ReconcilePlan::default();

    for placement in desired {
        let key = placement.key();
        if current_keys.contains(&key) {
            continue;
        }
        match observed.endpoint_for(&key) {
            Some(endpoint) => result.to_load.push(endpoint.clone()),
            None => result
                .unresolved
                .push(PodRef::new(&placement.namespace, &placement.pod_name)),
        }
    }

    let mut seen = HashSet::new();
    for loading in current {
        let key = loading.pod().key();
        if !desired_keys.contains(&key) && seen.insert(key) {
            result.to_unload.push(loading.endpoint.clone());
        }
    }

    result
}

/// Kind of call that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodOperation {
    Load,
    Unload,
}

impl fmt::Display for PodOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PodOperation::Load => write!(f, "load"),
            PodOperation::Unload => write!(f, "unload"),
        }
    }
}

/// A per-pod failure; never aborts the rest of the plan
#[derive(Debug, Clone)]
pub struct PodFailure {
    pub pod: PodRef,
    pub operation: PodOperation,
    pub message: String,
}

/// What applying a plan actually did
#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    pub loaded: Vec<PodRef>,
    pub already_loaded: Vec<PodRef>,
    pub unloaded: Vec<PodRef>,
    pub failures: Vec<PodFailure>,
}

impl ReconcileOutcome {
    /// Whether any serving process changed state
    pub fn changed(&self) -> bool {
        !self.loaded.is_empty() || !self.unloaded.is_empty()
    }
}

/// Issues the load and unload calls of a plan
pub struct StateReconciler {
    control_plane: Arc<dyn ControlPlane>,
}

impl StateReconciler {
    pub fn new(control_plane: Arc<dyn ControlPlane>) -> Self {
        Self { control_plane }
    }

    /// Apply a plan for one adapter.
    ///
    /// Loads run before unloads so the adapter stays available while it
    /// moves. The source is only resolved when something must be loaded; a
    /// resolution failure returns before any call is made.
    pub async fn apply(
        &self,
        adapter: &ModelAdapter,
        plan: &ReconcilePlan,
        api_key: Option<&str>,
        token: &CancellationToken,
    ) -> Result<ReconcileOutcome> {
        let mut outcome = ReconcileOutcome::default();
        let adapter_key = adapter.key();

        for pod in &plan.unresolved {
            warn!(
                "Adapter {}: desired pod {} has no endpoint, skipping load",
                adapter_key, pod
            );
        }

        if !plan.to_load.is_empty() {
            let resolved = adapter.spec.adapter_source.resolve()?;
            let request = LoadLoraRequest {
                lora_name: resolved.lora_name,
                lora_path: resolved.lora_path,
            };

            for endpoint in &plan.to_load {
                if token.is_cancelled() {
                    return Err(RuntimeError::Cancelled);
                }
                match self
                    .control_plane
                    .load_adapter(endpoint, &request, api_key)
                    .await
                {
                    Ok(LoadOutcome::Loaded) => outcome.loaded.push(endpoint.pod.clone()),
                    Ok(LoadOutcome::AlreadyLoaded) => {
                        debug!(
                            "Adapter {} already present on {}",
                            adapter_key, endpoint.pod
                        );
                        outcome.already_loaded.push(endpoint.pod.clone())
                    }
                    Err(e) => {
                        error!(
                            "Failed to load adapter {} on pod {}: {}",
                            adapter_key, endpoint.pod, e
                        );
                        outcome.failures.push(PodFailure {
                            pod: endpoint.pod.clone(),
                            operation: PodOperation::Load,
                            message: e.to_string(),
                        });
                    }
                }
            }
        }

        let request = UnloadLoraRequest {
            lora_name: adapter.lora_name().to_string(),
        };
        for endpoint in &plan.to_unload {
            if token.is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }
            match self
                .control_plane
                .unload_adapter(endpoint, &request, api_key)
                .await
            {
                Ok(()) => outcome.unloaded.push(endpoint.pod.clone()),
                Err(e) => {
                    error!(
                        "Failed to unload adapter {} from pod {}: {}",
                        adapter_key, endpoint.pod, e
                    );
                    outcome.failures.push(PodFailure {
                        pod: endpoint.pod.clone(),
                        operation: PodOperation::Unload,
                        message: e.to_string(),
                    });
                }
            }
        }

        if outcome.changed() || !outcome.failures.is_empty() {
            info!(
                "Adapter {}: {} loaded, {} unloaded, {} failed",
                adapter_key,
                outcome.loaded.len(),
                outcome.unloaded.len(),
                outcome.failures.len()
            );
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{endpoint_url, model_adapter, ControlPlaneCall, MockControlPlane};
    use crate::discovery::ServingPod;
    use chrono::Utc;

    fn endpoint(name: &str, ip: &str) -> PodEndpoint {
        PodEndpoint::new(PodRef::new("default", name), endpoint_url(ip))
    }

    fn observed(pods: &[(&str, &str)]) -> ObservedState {
        ObservedState {
            pods: pods
                .iter()
                .map(|(name, ip)| ServingPod {
                    pod: PodRef::new("default", *name),
                    model: Some("base".to_string()),
                    ready: true,
                    endpoint: Some(endpoint(name, ip)),
                })
                .collect(),
            loadings: Vec::new(),
            unreachable: Vec::new(),
            observed_at: Utc::now(),
        }
    }

    fn loading(name: &str, ip: &str) -> AdapterLoading {
        AdapterLoading {
            adapter: "sql-lora".to_string(),
            path: "/models/sql-lora".to_string(),
            parent: "base".to_string(),
            endpoint: endpoint(name, ip),
        }
    }

    fn placement(name: &str) -> PodPlacement {
        PodPlacement {
            pod_name: name.to_string(),
            namespace: "default".to_string(),
        }
    }

    #[test]
    fn test_plan_diffs_by_pod_key() {
        let state = observed(&[("a", "10.0.0.1"), ("b", "10.0.0.2"), ("c", "10.0.0.3")]);
        let current = vec![loading("a", "10.0.0.1"), loading("c", "10.0.0.3")];
        let desired = vec![placement("a"), placement("b")];

        let plan = plan(&current, &desired, &state);
        let loads: Vec<_> = plan.to_load.iter().map(|e| e.pod.key()).collect();
        let unloads: Vec<_> = plan.to_unload.iter().map(|e| e.pod.key()).collect();
        assert_eq!(loads, vec!["default/b"]);
        assert_eq!(unloads, vec!["default/c"]);
    }

    #[test]
    fn test_plan_converged_is_empty() {
        let state = observed(&[("a", "10.0.0.1")]);
        let plan = plan(&[loading("a", "10.0.0.1")], &[placement("a")], &state);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_plan_unknown_endpoint_is_unresolved() {
        let state = observed(&[]);
        let plan = plan(&[], &[placement("ghost")], &state);
        assert!(plan.to_load.is_empty());
        assert_eq!(plan.unresolved, vec![PodRef::new("default", "ghost")]);
    }

    #[tokio::test]
    async fn test_apply_loads_before_unloads() {
        let cp = Arc::new(MockControlPlane::new());
        cp.add_server(&endpoint_url("10.0.0.1"), "base").await;
        cp.add_server(&endpoint_url("10.0.0.2"), "base").await;
        cp.preload(&endpoint_url("10.0.0.2"), "sql-lora", "/models/sql-lora")
            .await;

        let reconciler = StateReconciler::new(cp.clone());
        let adapter = model_adapter("default", "sql", "base", "sql-lora", Some("/models/sql-lora"));
        let plan = ReconcilePlan {
            to_load: vec![endpoint("a", "10.0.0.1")],
            to_unload: vec![endpoint("b", "10.0.0.2")],
            unresolved: vec![],
        };

        let outcome = reconciler
            .apply(&adapter, &plan, Some("key"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.loaded, vec![PodRef::new("default", "a")]);
        assert_eq!(outcome.unloaded, vec![PodRef::new("default", "b")]);

        let calls = cp.mutating_calls().await;
        assert_eq!(
            calls,
            vec![
                ControlPlaneCall::Load {
                    pod: "default/a".to_string(),
                    lora_name: "sql-lora".to_string(),
                    lora_path: "/models/sql-lora".to_string(),
                    api_key: Some("key".to_string()),
                },
                ControlPlaneCall::Unload {
                    pod: "default/b".to_string(),
                    lora_name: "sql-lora".to_string(),
                    api_key: Some("key".to_string()),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_apply_isolates_pod_failures() {
        let cp = Arc::new(MockControlPlane::new());
        cp.add_server(&endpoint_url("10.0.0.1"), "base").await;
        cp.add_server(&endpoint_url("10.0.0.2"), "base").await;
        cp.set_reject_loads(&endpoint_url("10.0.0.1"), true).await;

        let reconciler = StateReconciler::new(cp.clone());
        let adapter = model_adapter("default", "sql", "base", "sql-lora", Some("/m"));
        let plan = ReconcilePlan {
            to_load: vec![endpoint("a", "10.0.0.1"), endpoint("b", "10.0.0.2")],
            ..Default::default()
        };

        let outcome = reconciler
            .apply(&adapter, &plan, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].pod, PodRef::new("default", "a"));
        assert_eq!(outcome.failures[0].operation, PodOperation::Load);
        assert_eq!(outcome.loaded, vec![PodRef::new("default", "b")]);
    }

    #[tokio::test]
    async fn test_unresolvable_source_makes_no_calls() {
        let cp = Arc::new(MockControlPlane::new());
        cp.add_server(&endpoint_url("10.0.0.1"), "base").await;
        let reconciler = StateReconciler::new(cp.clone());
        let adapter = model_adapter("default", "sql", "base", "sql-lora", None);
        let plan = ReconcilePlan {
            to_load: vec![endpoint("a", "10.0.0.1")],
            ..Default::default()
        };

        let err = reconciler
            .apply(&adapter, &plan, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::CoreError(_)));
        assert!(cp.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_unload_only_plan_skips_source_resolution() {
        let cp = Arc::new(MockControlPlane::new());
        let url = endpoint_url("10.0.0.1");
        cp.add_server(&url, "base").await;
        cp.preload(&url, "sql-lora", "/m").await;
        let reconciler = StateReconciler::new(cp.clone());
        // No path: resolution would fail if attempted
        let adapter = model_adapter("default", "sql", "base", "sql-lora", None);
        let plan = ReconcilePlan {
            to_unload: vec![endpoint("a", "10.0.0.1")],
            ..Default::default()
        };

        let outcome = reconciler
            .apply(&adapter, &plan, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.unloaded.len(), 1);
        assert!(cp.adapters_on(&url).await.is_empty());
    }
}
