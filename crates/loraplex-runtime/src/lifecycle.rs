use crate::discovery::{recorded_pods, RegistrationDiscovery};
use crate::error::{Result, RuntimeError};
use crate::reconciler::{plan, ReconcileOutcome, StateReconciler};
use crate::traits::ClusterApi;
use kube::ResourceExt;
use loraplex_core::ModelAdapter;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where an adapter is in its finalizer-guarded lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Live, finalizer not yet added
    Unguarded,
    /// Live and guarded
    Active,
    /// Deletion requested; loadings must be drained before release
    Draining,
    /// Deletion requested and nothing left for us to do
    Released,
}

impl LifecycleState {
    pub fn of(adapter: &ModelAdapter, finalizer: &str) -> Self {
        match (adapter.is_deleting(), adapter.has_finalizer(finalizer)) {
            (false, false) => LifecycleState::Unguarded,
            (false, true) => LifecycleState::Active,
            (true, true) => LifecycleState::Draining,
            (true, false) => LifecycleState::Released,
        }
    }
}

/// Result of a successful drain
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    /// Pods the adapter was unloaded from
    pub unloaded: usize,
}

/// Adds the finalizer and drains loadings before release
pub struct LifecycleManager {
    cluster: Arc<dyn ClusterApi>,
    finalizer: String,
}

impl LifecycleManager {
    pub fn new(cluster: Arc<dyn ClusterApi>, finalizer: impl Into<String>) -> Self {
        Self {
            cluster,
            finalizer: finalizer.into(),
        }
    }

    pub fn finalizer(&self) -> &str {
        &self.finalizer
    }

    pub fn state(&self, adapter: &ModelAdapter) -> LifecycleState {
        LifecycleState::of(adapter, &self.finalizer)
    }

    /// Add the finalizer if missing. Returns whether it was added.
    pub async fn ensure_finalizer(&self, adapter: &ModelAdapter) -> Result<bool> {
        if adapter.has_finalizer(&self.finalizer) {
            return Ok(false);
        }
        let Some(latest) = self
            .cluster
            .get_adapter(&adapter.namespace_or_default(), &adapter.name_any())
            .await?
        else {
            return Ok(false);
        };
        if latest.is_deleting() || latest.has_finalizer(&self.finalizer) {
            return Ok(false);
        }

        self.cluster.add_finalizer(&latest, &self.finalizer).await?;
        info!("Added finalizer {} to {}", self.finalizer, adapter.key());
        Ok(true)
    }

    /// Unload the adapter from every pod holding it, then drop the finalizer.
    ///
    /// The finalizer is kept unless every unload succeeded and every pod the
    /// status records as holding the adapter was either queried or is gone.
    /// The next pass retries the remaining pods.
    pub async fn finalize(
        &self,
        adapter: &ModelAdapter,
        discovery: &RegistrationDiscovery,
        reconciler: &StateReconciler,
        api_key: Option<&str>,
        token: &CancellationToken,
    ) -> Result<DrainReport> {
        let key = adapter.key();
        let observed = discovery.discover(api_key, token).await?;
        let current = observed.loadings_of(adapter);
        let unverified = observed.unverified(&recorded_pods(adapter));
        info!(
            "Draining adapter {} from {} pod(s) before deletion",
            key,
            current.len()
        );

        let drain_plan = plan(&current, &[], &observed);
        let outcome: ReconcileOutcome = reconciler
            .apply(adapter, &drain_plan, api_key, token)
            .await?;

        for pod in &unverified {
            warn!(
                "Adapter {} may still be loaded on {}, which could not be queried",
                key, pod
            );
        }
        let remaining = outcome.failures.len() + unverified.len();
        if remaining > 0 {
            warn!(
                "Adapter {} drain incomplete: {} pod(s) may still hold it",
                key, remaining
            );
            return Err(RuntimeError::drain_incomplete(key, remaining));
        }

        let Some(latest) = self
            .cluster
            .get_adapter(&adapter.namespace_or_default(), &adapter.name_any())
            .await?
        else {
            debug!("Adapter {} already gone after drain", key);
            return Ok(DrainReport {
                unloaded: outcome.unloaded.len(),
            });
        };

        self.cluster.remove_finalizer(&latest, &self.finalizer).await?;
        info!(
            "Adapter {} drained from {} pod(s), finalizer removed",
            key,
            outcome.unloaded.len()
        );
        Ok(DrainReport {
            unloaded: outcome.unloaded.len(),
        })
    }
}
