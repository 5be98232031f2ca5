use crate::types::{FilterResult, PlacementCandidate, PlacementContext};

/// Filter predicate trait
pub trait FilterPredicate: Send + Sync {
    /// Filter a candidate pod for the given adapter
    fn filter(&self, context: &PlacementContext, candidate: &PlacementCandidate) -> FilterResult;

    /// Name of the filter
    fn name(&self) -> &str;
}

/// Pod must serve the adapter's base model
pub struct ServesBaseModel;

impl FilterPredicate for ServesBaseModel {
    fn filter(&self, context: &PlacementContext, candidate: &PlacementCandidate) -> FilterResult {
        let pod_key = candidate.pod.key();

        match candidate.model.as_deref() {
            Some(model) if model == context.base_model => FilterResult::pass(pod_key),
            Some(model) => FilterResult::fail(
                pod_key,
                format!("serves model '{}', want '{}'", model, context.base_model),
            ),
            None => FilterResult::fail(pod_key, "pod has no model label".to_string()),
        }
    }

    fn name(&self) -> &str {
        "ServesBaseModel"
    }
}

/// Pod must report Ready
pub struct PodReady;

impl FilterPredicate for PodReady {
    fn filter(&self, _context: &PlacementContext, candidate: &PlacementCandidate) -> FilterResult {
        if candidate.ready {
            FilterResult::pass(candidate.pod.key())
        } else {
            FilterResult::fail(candidate.pod.key(), "pod is not Ready".to_string())
        }
    }

    fn name(&self) -> &str {
        "PodReady"
    }
}

/// Get default filter predicates
pub fn default_filters() -> Vec<Box<dyn FilterPredicate>> {
    vec![Box::new(ServesBaseModel), Box::new(PodReady)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use loraplex_core::{DeploymentAlgorithm, PodRef};

    fn context() -> PlacementContext {
        PlacementContext {
            adapter: "default/sql-lora".to_string(),
            base_model: "llama-2-7b".to_string(),
            algorithm: DeploymentAlgorithm::Default,
            replicas: None,
        }
    }

    #[test]
    fn test_serves_base_model() {
        let filter = ServesBaseModel;
        let ok = PlacementCandidate::new(
            PodRef::new("default", "a"),
            Some("llama-2-7b".to_string()),
            true,
        );
        let other = PlacementCandidate::new(
            PodRef::new("default", "b"),
            Some("mistral-7b".to_string()),
            true,
        );
        let unlabeled = PlacementCandidate::new(PodRef::new("default", "c"), None, true);

        assert!(filter.filter(&context(), &ok).passed);
        let result = filter.filter(&context(), &other);
        assert!(!result.passed);
        assert!(result.reason.unwrap().contains("mistral-7b"));
        assert!(!filter.filter(&context(), &unlabeled).passed);
    }

    #[test]
    fn test_pod_ready() {
        let filter = PodReady;
        let ready = PlacementCandidate::new(
            PodRef::new("default", "a"),
            Some("llama-2-7b".to_string()),
            true,
        );
        let not_ready = PlacementCandidate::new(
            PodRef::new("default", "b"),
            Some("llama-2-7b".to_string()),
            false,
        );

        assert!(filter.filter(&context(), &ready).passed);
        assert!(!filter.filter(&context(), &not_ready).passed);
    }
}
