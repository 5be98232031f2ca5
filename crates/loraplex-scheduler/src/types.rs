use loraplex_core::{pod_key, DeploymentAlgorithm, ModelAdapter, PodRef};

/// Placement inputs taken from one ModelAdapter
#[derive(Debug, Clone)]
pub struct PlacementContext {
    /// Adapter `namespace/name`, for logging
    pub adapter: String,
    /// Required value of the pod `model` label
    pub base_model: String,
    /// Selection algorithm
    pub algorithm: DeploymentAlgorithm,
    /// Requested replica count; `None` or negative means every eligible pod
    pub replicas: Option<i32>,
}

impl PlacementContext {
    /// Build the context from an adapter spec
    pub fn from_adapter(adapter: &ModelAdapter) -> Self {
        Self {
            adapter: adapter.key(),
            base_model: adapter.spec.base_model.clone(),
            algorithm: adapter.spec.deployment_config.algorithm,
            replicas: adapter.spec.deployment_config.replicas,
        }
    }
}

/// A serving pod as seen by the scheduler, in discovery order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementCandidate {
    /// Pod identity
    pub pod: PodRef,
    /// Value of the `model` label
    pub model: Option<String>,
    /// Whether the Ready condition is True
    pub ready: bool,
}

impl PlacementCandidate {
    pub fn new(pod: PodRef, model: Option<String>, ready: bool) -> Self {
        Self { pod, model, ready }
    }
}

/// One desired (adapter, pod) pair. Computed every pass, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodPlacement {
    pub pod_name: String,
    pub namespace: String,
}

impl PodPlacement {
    /// Normalized `namespace/podName` key
    pub fn key(&self) -> String {
        pod_key(&self.namespace, &self.pod_name)
    }
}

impl From<&PodRef> for PodPlacement {
    fn from(pod: &PodRef) -> Self {
        Self {
            pod_name: pod.name.clone(),
            namespace: pod.namespace.clone(),
        }
    }
}

/// Result of filtering a candidate
#[derive(Debug, Clone)]
pub struct FilterResult {
    /// Pod key
    pub pod_key: String,
    /// Whether the pod passed the filter
    pub passed: bool,
    /// Reason for failure (if any)
    pub reason: Option<String>,
}

impl FilterResult {
    /// Create a passing filter result
    pub fn pass(pod_key: String) -> Self {
        Self {
            pod_key,
            passed: true,
            reason: None,
        }
    }

    /// Create a failing filter result
    pub fn fail(pod_key: String, reason: String) -> Self {
        Self {
            pod_key,
            passed: false,
            reason: Some(reason),
        }
    }
}
