use crate::algorithm::algorithm_for;
use crate::filter::{default_filters, FilterPredicate};
use crate::types::{PlacementCandidate, PlacementContext, PodPlacement};
use crate::{Result, SchedulerError};
use tracing::{debug, info};

/// Placement scheduler: decides which pods should hold an adapter
pub struct PlacementScheduler {
    filters: Vec<Box<dyn FilterPredicate>>,
}

impl Default for PlacementScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PlacementScheduler {
    /// Create a scheduler with the default filters
    pub fn new() -> Self {
        Self {
            filters: default_filters(),
        }
    }

    /// Compute the desired placement for one adapter.
    ///
    /// Zero eligible pods is an error, not an empty placement.
    pub fn schedule(
        &self,
        context: &PlacementContext,
        candidates: &[PlacementCandidate],
    ) -> Result<Vec<PodPlacement>> {
        // Phase 1: Filter candidates
        let mut eligible = Vec::new();

        for candidate in candidates {
            let mut passed = true;

            for filter in &self.filters {
                let result = filter.filter(context, candidate);
                if !result.passed {
                    debug!(
                        "Pod {} filtered out for adapter {} by {}: {}",
                        result.pod_key,
                        context.adapter,
                        filter.name(),
                        result.reason.unwrap_or_default()
                    );
                    passed = false;
                    break;
                }
            }

            if passed {
                eligible.push(candidate.clone());
            }
        }

        if eligible.is_empty() {
            return Err(SchedulerError::no_valid_pods(&context.base_model));
        }

        // Phase 2: Select
        let algorithm = algorithm_for(context.algorithm)?;
        let placements = algorithm.place(context, &eligible)?;

        info!(
            "Adapter {} placed on {}/{} eligible pods using '{}'",
            context.adapter,
            placements.len(),
            eligible.len(),
            algorithm.name()
        );

        Ok(placements)
    }
}
