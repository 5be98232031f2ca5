use crate::types::{PlacementCandidate, PlacementContext, PodPlacement};
use crate::{Result, SchedulerError};
use loraplex_core::DeploymentAlgorithm;

/// Picks the desired pods from the already-filtered candidates.
///
/// Candidates arrive in discovery order and are never empty.
pub trait PlacementAlgorithm: Send + Sync {
    fn place(
        &self,
        context: &PlacementContext,
        eligible: &[PlacementCandidate],
    ) -> Result<Vec<PodPlacement>>;

    fn name(&self) -> &str;
}

/// First N eligible pods in discovery order
pub struct FirstReplicas;

impl PlacementAlgorithm for FirstReplicas {
    fn place(
        &self,
        context: &PlacementContext,
        eligible: &[PlacementCandidate],
    ) -> Result<Vec<PodPlacement>> {
        let count = target_count(context.replicas, eligible.len());
        Ok(eligible
            .iter()
            .take(count)
            .map(|c| PodPlacement::from(&c.pod))
            .collect())
    }

    fn name(&self) -> &str {
        "default"
    }
}

/// Number of pods to place on; unset or negative replicas selects everything
pub fn target_count(replicas: Option<i32>, available: usize) -> usize {
    match replicas {
        Some(n) if n >= 0 => (n as usize).min(available),
        _ => available,
    }
}

/// Resolve the algorithm named in the deployment config
pub fn algorithm_for(kind: DeploymentAlgorithm) -> Result<Box<dyn PlacementAlgorithm>> {
    match kind {
        DeploymentAlgorithm::Default => Ok(Box::new(FirstReplicas)),
        DeploymentAlgorithm::Ordered | DeploymentAlgorithm::Equalized => {
            Err(SchedulerError::algorithm_not_implemented(kind.to_string()))
        }
    }
}
