use crate::discovery::{AdapterLoading, DiscoveryConfig, RegistrationDiscovery};
use crate::error::{Result, RuntimeError};
use crate::event_router::ReconcileTrigger;
use crate::lifecycle::{LifecycleManager, LifecycleState};
use crate::reconciler::{plan, ReconcileOutcome, StateReconciler};
use crate::status::{StatusReporter, StatusRetryConfig, StatusUpdate};
use crate::traits::{ClusterApi, ControlPlane};
use loraplex_core::{
    AdapterPhase, ApiKeyConfig, Condition, ConditionStatus, ModelAdapter, ADAPTER_FINALIZER,
};
use loraplex_scheduler::{PlacementContext, PlacementScheduler, PodPlacement, SchedulerError};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Periodic resync interval
pub const REQUEUE_INTERVAL: Duration = Duration::from_secs(300);

/// First retry delay after a failed pass
pub const ERROR_BACKOFF: Duration = Duration::from_secs(5);

pub const CONDITION_INITIALIZED: &str = "Initialized";
pub const CONDITION_SCHEDULED: &str = "Scheduled";
pub const CONDITION_READY: &str = "Ready";

/// Configuration for the adapter controller
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Time between full passes when nothing goes wrong
    pub resync_interval: Duration,
    /// Initial delay after a failed pass, doubled up to `resync_interval`
    pub error_backoff: Duration,
    /// Finalizer guarding adapter deletion
    pub finalizer: String,
    pub discovery: DiscoveryConfig,
    pub status_retry: StatusRetryConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            resync_interval: REQUEUE_INTERVAL,
            error_backoff: ERROR_BACKOFF,
            finalizer: ADAPTER_FINALIZER.to_string(),
            discovery: DiscoveryConfig::default(),
            status_retry: StatusRetryConfig::default(),
        }
    }
}

/// What a reconcile did to one adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Placement reconciled; carries the published phase
    Reconciled(AdapterPhase),
    /// Drained and finalizer removed
    Finalized { unloaded: usize },
    /// Deleting without our finalizer; nothing to do
    Released,
}

/// Counts from one full pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub adapters: usize,
    pub reconciled: usize,
    pub finalized: usize,
    pub failed: usize,
}

/// Phase and Ready condition derived from a reconcile
#[derive(Debug, Clone)]
struct Assessment {
    phase: AdapterPhase,
    message: String,
}

/// Doubling delay after failed passes
#[derive(Debug, Clone)]
pub struct PassBackoff {
    base: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl PassBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: None,
        }
    }

    /// Delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.base,
            Some(d) => (d * 2).min(self.max),
        };
        self.current = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

/// Adapter controller
///
/// Each pass lists every ModelAdapter and drives it through discovery,
/// placement, load/unload reconciliation and status publication. Passes
/// run on a timer and whenever a watch trigger arrives.
pub struct AdapterController {
    cluster: Arc<dyn ClusterApi>,
    discovery: RegistrationDiscovery,
    scheduler: PlacementScheduler,
    reconciler: StateReconciler,
    lifecycle: LifecycleManager,
    status: StatusReporter,
    config: ControllerConfig,
    ready: Arc<AtomicBool>,
}

impl AdapterController {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        control_plane: Arc<dyn ControlPlane>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            discovery: RegistrationDiscovery::new(
                cluster.clone(),
                control_plane.clone(),
                config.discovery.clone(),
            ),
            scheduler: PlacementScheduler::new(),
            reconciler: StateReconciler::new(control_plane),
            lifecycle: LifecycleManager::new(cluster.clone(), config.finalizer.clone()),
            status: StatusReporter::new(cluster.clone(), config.status_retry.clone()),
            cluster,
            config,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag set once the first pass has completed
    pub fn readiness(&self) -> Arc<AtomicBool> {
        self.ready.clone()
    }

    /// Run passes until `token` is cancelled
    pub async fn run(
        &self,
        mut triggers: mpsc::Receiver<ReconcileTrigger>,
        token: CancellationToken,
    ) -> Result<()> {
        info!(
            "Starting adapter controller (resync every {:?})",
            self.config.resync_interval
        );

        let mut backoff = PassBackoff::new(self.config.error_backoff, self.config.resync_interval);
        let mut next_pass = Instant::now();
        let mut triggers_open = true;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Adapter controller shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep_until(next_pass) => {
                    debug!("Periodic pass");
                }
                trigger = triggers.recv(), if triggers_open => match trigger {
                    Some(trigger) => {
                        info!("Pass triggered: {}", trigger);
                        let mut coalesced = 0;
                        while triggers.try_recv().is_ok() {
                            coalesced += 1;
                        }
                        if coalesced > 0 {
                            debug!("Coalesced {} further triggers", coalesced);
                        }
                    }
                    None => {
                        warn!("Trigger channel closed, continuing with periodic passes only");
                        triggers_open = false;
                        continue;
                    }
                },
            }

            let delay = match self.reconcile_all(&token).await {
                Ok(summary) if summary.failed == 0 => {
                    backoff.reset();
                    self.config.resync_interval
                }
                Ok(_) => backoff.next_delay(),
                Err(RuntimeError::Cancelled) => continue,
                Err(e) => {
                    error!("Adapter controller pass failed: {}", e);
                    backoff.next_delay()
                }
            };
            next_pass = Instant::now() + delay;
            debug!("Next pass in {:?}", delay);
        }
    }

    /// Reconcile every ModelAdapter once.
    ///
    /// Per-adapter failures are logged and counted; only a failure to list
    /// adapters fails the pass.
    pub async fn reconcile_all(&self, token: &CancellationToken) -> Result<PassSummary> {
        let adapters = self.cluster.list_adapters().await?;
        let mut summary = PassSummary {
            adapters: adapters.len(),
            ..Default::default()
        };

        for adapter in &adapters {
            if token.is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }
            match self.reconcile_adapter(adapter, token).await {
                Ok(ReconcileAction::Finalized { .. }) => summary.finalized += 1,
                Ok(_) => summary.reconciled += 1,
                Err(RuntimeError::Cancelled) => return Err(RuntimeError::Cancelled),
                Err(e) => {
                    error!("Failed to reconcile adapter {}: {}", adapter.key(), e);
                    summary.failed += 1;
                }
            }
        }

        self.ready.store(true, Ordering::SeqCst);
        info!(
            "Pass complete: {} adapters, {} reconciled, {} finalized, {} failed",
            summary.adapters, summary.reconciled, summary.finalized, summary.failed
        );
        Ok(summary)
    }

    /// Reconcile one adapter.
    ///
    /// Discovery runs once before the diff and, when any call was made, once
    /// more afterwards so the published status reflects what the pods report.
    /// Each run lists every serving pod.
    pub async fn reconcile_adapter(
        &self,
        adapter: &ModelAdapter,
        token: &CancellationToken,
    ) -> Result<ReconcileAction> {
        let key = adapter.key();

        match self.lifecycle.state(adapter) {
            LifecycleState::Released => {
                debug!("Adapter {} is deleting without our finalizer", key);
                return Ok(ReconcileAction::Released);
            }
            LifecycleState::Draining => {
                let api_key = self.resolve_api_key(adapter).await?;
                let report = self
                    .lifecycle
                    .finalize(
                        adapter,
                        &self.discovery,
                        &self.reconciler,
                        api_key.as_deref(),
                        token,
                    )
                    .await?;
                return Ok(ReconcileAction::Finalized {
                    unloaded: report.unloaded,
                });
            }
            LifecycleState::Unguarded => {
                self.lifecycle.ensure_finalizer(adapter).await?;
            }
            LifecycleState::Active => {}
        }

        let api_key = match self.resolve_api_key(adapter).await {
            Ok(api_key) => api_key,
            Err(e) => {
                self.publish_failure(adapter, StatusUpdate::unobserved(), "ApiKeyUnavailable", &e)
                    .await;
                return Err(e);
            }
        };
        let api_key = api_key.as_deref();

        // Step 1: what is loaded right now
        let observed = match self.discovery.discover(api_key, token).await {
            Ok(observed) => observed,
            Err(RuntimeError::Cancelled) => return Err(RuntimeError::Cancelled),
            Err(e) => {
                self.publish_failure(adapter, StatusUpdate::unobserved(), "DiscoveryFailed", &e)
                    .await;
                return Err(e);
            }
        };
        let current = observed.loadings_of(adapter);

        self.status
            .publish(
                adapter,
                &StatusUpdate::observed(current.clone(), observed.observed_at)
                    .with_condition(initialized()),
            )
            .await?;

        // Step 2: where it should be
        let context = PlacementContext::from_adapter(adapter);
        let desired = match self.scheduler.schedule(&context, &observed.candidates()) {
            Ok(desired) => desired,
            Err(e) => {
                let reason = match &e {
                    SchedulerError::NoValidPods { .. } => "NoValidPods",
                    SchedulerError::AlgorithmNotImplemented { .. } => "AlgorithmNotImplemented",
                    SchedulerError::InternalError { .. } => "SchedulingFailed",
                };
                let err = RuntimeError::from(e);
                let update = StatusUpdate::observed(current, observed.observed_at)
                    .with_condition(Condition::new(
                        CONDITION_SCHEDULED,
                        ConditionStatus::False,
                        reason,
                        err.to_string(),
                    ));
                self.publish_failure(adapter, update, reason, &err).await;
                return Err(err);
            }
        };

        // Step 3: converge
        let reconcile_plan = plan(&current, &desired, &observed);
        let outcome = match self
            .reconciler
            .apply(adapter, &reconcile_plan, api_key, token)
            .await
        {
            Ok(outcome) => outcome,
            Err(RuntimeError::Cancelled) => return Err(RuntimeError::Cancelled),
            Err(e) => {
                let update = StatusUpdate::observed(current, observed.observed_at);
                self.publish_failure(adapter, update, "SourceUnresolved", &e)
                    .await;
                return Err(e);
            }
        };

        // Step 4: observe the result
        let (loadings, observed_at) = if reconcile_plan.is_empty() {
            (current, observed.observed_at)
        } else {
            match self.discovery.discover(api_key, token).await {
                Ok(after) => (after.loadings_of(adapter), after.observed_at),
                Err(RuntimeError::Cancelled) => return Err(RuntimeError::Cancelled),
                Err(e) => {
                    self.publish_failure(
                        adapter,
                        StatusUpdate::unobserved(),
                        "DiscoveryFailed",
                        &e,
                    )
                    .await;
                    return Err(e);
                }
            }
        };

        let assessment = assess(&desired, &loadings, &outcome);
        let ready = if assessment.phase == AdapterPhase::Ready {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        };
        let update = StatusUpdate::observed(loadings, observed_at)
            .with_phase(assessment.phase, assessment.message.clone())
            .with_condition(Condition::new(
                CONDITION_SCHEDULED,
                ConditionStatus::True,
                "Scheduled",
                format!("Placed on {} pod(s)", desired.len()),
            ))
            .with_condition(Condition::new(
                CONDITION_READY,
                ready,
                assessment.phase.to_string(),
                assessment.message,
            ));
        self.status.publish(adapter, &update).await?;

        if !outcome.failures.is_empty() {
            return Err(RuntimeError::pod_operations_failed(
                key,
                outcome.failures.len(),
            ));
        }
        Ok(ReconcileAction::Reconciled(assessment.phase))
    }

    /// Resolve the bearer token, reading the Secret at call time
    async fn resolve_api_key(&self, adapter: &ModelAdapter) -> Result<Option<String>> {
        match &adapter.spec.api_key_config {
            None => Ok(None),
            Some(ApiKeyConfig::Value(value)) if value.is_empty() => Ok(None),
            Some(ApiKeyConfig::Value(value)) => Ok(Some(value.clone())),
            Some(ApiKeyConfig::SecretRef(secret)) => self
                .cluster
                .get_secret_value(&adapter.namespace_or_default(), &secret.name, &secret.key)
                .await
                .map(Some),
        }
    }

    /// Best-effort Failed status; the original error is what gets returned
    async fn publish_failure(
        &self,
        adapter: &ModelAdapter,
        update: StatusUpdate,
        reason: &str,
        err: &RuntimeError,
    ) {
        let update = update
            .with_phase(AdapterPhase::Failed, err.to_string())
            .with_condition(Condition::new(
                CONDITION_READY,
                ConditionStatus::False,
                reason,
                err.to_string(),
            ));
        if let Err(e) = self.status.publish(adapter, &update).await {
            warn!(
                "Failed to record failure status for {}: {}",
                adapter.key(),
                e
            );
        }
    }
}

fn initialized() -> Condition {
    Condition::new(
        CONDITION_INITIALIZED,
        ConditionStatus::True,
        "Discovered",
        "Registration discovery completed",
    )
}

/// Derive the phase from desired pods, observed loadings and per-pod failures
fn assess(
    desired: &[PodPlacement],
    loadings: &[AdapterLoading],
    outcome: &ReconcileOutcome,
) -> Assessment {
    let loaded: HashSet<String> = loadings.iter().map(|l| l.pod().key()).collect();
    let holding = desired.iter().filter(|p| loaded.contains(&p.key())).count();
    let failed = outcome.failures.len();

    let (phase, message) = if failed == 0 {
        if holding == desired.len() {
            (
                AdapterPhase::Ready,
                format!("Loaded on {}/{} desired pods", holding, desired.len()),
            )
        } else {
            (
                AdapterPhase::Loading,
                format!(
                    "Loaded on {}/{} desired pods, waiting for the rest",
                    holding,
                    desired.len()
                ),
            )
        }
    } else if holding > 0 {
        (
            AdapterPhase::PartialFailure,
            format!(
                "Loaded on {}/{} desired pods, {} pod operation(s) failed",
                holding,
                desired.len(),
                failed
            ),
        )
    } else {
        (
            AdapterPhase::Failed,
            format!("{} pod operation(s) failed, no desired pod holds the adapter", failed),
        )
    };

    Assessment { phase, message }
}
