use crate::discovery::AdapterLoading;
use crate::error::{Result, RuntimeError};
use crate::traits::ClusterApi;
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use loraplex_core::{
    AdapterPhase, Condition, LoadedAdapter, ModelAdapter, ModelAdapterStatus, PodAssignment,
    LOADED_STATUS_RUNNING,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy for status writes
#[derive(Debug, Clone)]
pub struct StatusRetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Sleep after failed attempt `n` is `backoff_step * n`
    pub backoff_step: Duration,
}

impl Default for StatusRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step: Duration::from_secs(1),
        }
    }
}

/// What a reconcile step wants the status to say
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    /// `None` keeps the stored phase
    pub phase: Option<AdapterPhase>,
    pub message: Option<String>,
    /// This adapter's loadings from the latest discovery; `None` keeps the
    /// previously reported list
    pub loadings: Option<Vec<AdapterLoading>>,
    pub observed_at: DateTime<Utc>,
    pub conditions: Vec<Condition>,
}

impl StatusUpdate {
    pub fn observed(loadings: Vec<AdapterLoading>, observed_at: DateTime<Utc>) -> Self {
        Self {
            phase: None,
            message: None,
            loadings: Some(loadings),
            observed_at,
            conditions: Vec::new(),
        }
    }

    /// Update that leaves `loadedAdapters` untouched
    pub fn unobserved() -> Self {
        Self {
            phase: None,
            message: None,
            loadings: None,
            observed_at: Utc::now(),
            conditions: Vec::new(),
        }
    }

    pub fn with_phase(mut self, phase: AdapterPhase, message: impl Into<String>) -> Self {
        self.phase = Some(phase);
        self.message = Some(message.into());
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Write this update onto a status computed from `generation`
    pub fn apply_to(&self, status: &mut ModelAdapterStatus, generation: Option<i64>) {
        if let Some(loadings) = &self.loadings {
            status.loaded_adapters =
                loaded_adapters_from(loadings, &status.loaded_adapters, self.observed_at);
        }
        status.observed_generation = generation.unwrap_or(0);
        if let Some(phase) = self.phase {
            status.phase = phase;
        }
        if let Some(message) = &self.message {
            status.message = message.clone();
        }
        for condition in &self.conditions {
            status.set_condition(condition.clone().with_generation(generation));
        }
    }
}

/// Build status entries from observed loadings.
///
/// `loadTime` carries over for a pod that already held the adapter;
/// new pods get the discovery time.
pub fn loaded_adapters_from(
    loadings: &[AdapterLoading],
    previous: &[LoadedAdapter],
    observed_at: DateTime<Utc>,
) -> Vec<LoadedAdapter> {
    let previous: HashMap<String, &LoadedAdapter> =
        previous.iter().map(|l| (l.pod_assignment.key(), l)).collect();

    loadings
        .iter()
        .map(|loading| {
            let pod = loading.pod();
            let load_time = previous
                .get(&pod.key())
                .filter(|p| p.name == loading.adapter)
                .map(|p| p.load_time)
                .unwrap_or(observed_at);
            LoadedAdapter {
                name: loading.adapter.clone(),
                path: loading.path.clone(),
                load_time,
                status: LOADED_STATUS_RUNNING.to_string(),
                pod_assignment: PodAssignment {
                    pod_name: pod.name.clone(),
                    namespace: pod.namespace.clone(),
                },
            }
        })
        .collect()
}

/// Publishes `ModelAdapterStatus` with optimistic-concurrency retries
pub struct StatusReporter {
    cluster: Arc<dyn ClusterApi>,
    config: StatusRetryConfig,
}

impl StatusReporter {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: StatusRetryConfig) -> Self {
        Self { cluster, config }
    }

    /// Re-read the adapter, apply the update and write it back.
    ///
    /// A vanished adapter is not an error. Unchanged statuses are not written.
    pub async fn publish(&self, adapter: &ModelAdapter, update: &StatusUpdate) -> Result<()> {
        let namespace = adapter.namespace_or_default();
        let name = adapter.name_any();
        let key = adapter.key();
        let attempts = self.config.max_attempts.max(1);

        for attempt in 1..=attempts {
            let Some(latest) = self.cluster.get_adapter(&namespace, &name).await? else {
                debug!("ModelAdapter {} is gone, skipping status update", key);
                return Ok(());
            };

            let mut status = latest.status.clone().unwrap_or_default();
            update.apply_to(&mut status, latest.metadata.generation);
            if latest.status.as_ref() == Some(&status) {
                debug!("Status of {} unchanged", key);
                return Ok(());
            }

            let mut next = latest;
            next.status = Some(status);

            match self.cluster.replace_adapter_status(&next).await {
                Ok(()) => {
                    debug!("Published status for {}", key);
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    if attempt == attempts {
                        break;
                    }
                    let delay = self.config.backoff_step * attempt;
                    warn!(
                        "Status conflict for {} (attempt {}/{}), retrying in {:?}",
                        key, attempt, attempts, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(RuntimeError::status_retries_exhausted(key, attempts))
    }
}
