//! Loraplex Core - Resource types shared by the adapter controller
//!
//! This crate provides:
//! - The `ModelAdapter` custom resource and its status types
//! - Adapter source resolution
//! - Serving pod helpers (model label, readiness, control endpoint)
//! - Error types with miette diagnostics

// Allow unused assignments for diagnostic fields - they're used by the thiserror/miette macros
#![allow(unused_assignments)]

pub mod crd;
pub mod error;
pub mod pod;
pub mod source;

// Re-export commonly used types
pub use crd::{
    AdapterPhase, AdapterSource, AdapterSourceType, ApiKeyConfig, Condition, ConditionStatus,
    DeploymentAlgorithm, DeploymentConfig, LoadedAdapter, ModelAdapter, ModelAdapterSpec,
    ModelAdapterStatus, PodAssignment, SecretKeyRef, SecretRef, ADAPTER_FINALIZER,
    LOADED_STATUS_RUNNING,
};
pub use error::{CoreError, Result};
pub use pod::{
    is_pod_ready, model_label, pod_endpoint, pod_key, PodRef, DEFAULT_PORT_NAME,
    DEFAULT_SERVING_PORT, MODEL_LABEL,
};
pub use source::ResolvedAdapter;

// Re-export k8s-openapi types for convenience
pub use k8s_openapi;
pub use k8s_openapi::api::core::v1::Pod;

/// Render the ModelAdapter CRD as YAML
pub fn crd_yaml() -> Result<String> {
    use kube::CustomResourceExt;

    serde_yaml::to_string(&ModelAdapter::crd()).map_err(|e| {
        CoreError::serialization_error(
            format!("Failed to serialize CRD to YAML: {}", e),
            Some(Box::new(e)),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crd_yaml_contains_schema() {
        let yaml = crd_yaml().unwrap();
        assert!(yaml.contains("modeladapters.loraplex.io"));
        assert!(yaml.contains("baseModel"));
        assert!(yaml.contains("Base Model"));
    }
}
