//! Watch-driven reconcile triggers.
//!
//! Pod readiness changes and deletions map to the adapters whose base model
//! the pod serves. Adapter spec changes and deletions map to the adapter
//! itself. Triggers only shorten the wait for the next pass; the periodic
//! resync is what guarantees convergence.

use crate::error::{Result, RuntimeError};
use crate::traits::ClusterApi;
use futures_util::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher;
use loraplex_core::{is_pod_ready, model_label, ModelAdapter, PodRef};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A pod event worth reconciling for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodTransition {
    BecameReady { pod: PodRef, model: String },
    Deleted { pod: PodRef, model: String },
}

impl PodTransition {
    pub fn model(&self) -> &str {
        match self {
            PodTransition::BecameReady { model, .. } | PodTransition::Deleted { model, .. } => {
                model
            }
        }
    }
}

/// Why the controller should run a pass now
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileTrigger {
    PodReady { pod: String, adapters: Vec<String> },
    PodDeleted { pod: String, adapters: Vec<String> },
    AdapterChanged { adapter: String },
}

impl fmt::Display for ReconcileTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileTrigger::PodReady { pod, adapters } => {
                write!(f, "pod {} became ready ({} adapters)", pod, adapters.len())
            }
            ReconcileTrigger::PodDeleted { pod, adapters } => {
                write!(f, "pod {} deleted ({} adapters)", pod, adapters.len())
            }
            ReconcileTrigger::AdapterChanged { adapter } => {
                write!(f, "adapter {} changed", adapter)
            }
        }
    }
}

#[derive(Debug, Clone)]
struct PodSnapshot {
    pod: PodRef,
    ready: bool,
    model: Option<String>,
}

/// Readiness cache turning raw pod watch events into transitions.
///
/// Creation alone is not a transition. After a reconnect the relist is
/// diffed against the cache, so readiness flips and deletions that
/// happened while disconnected are still reported.
#[derive(Debug, Default)]
pub struct PodEventRouter {
    pods: HashMap<String, PodSnapshot>,
    relist: Option<HashSet<String>>,
    synced: bool,
}

impl PodEventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, event: watcher::Event<Pod>) -> Vec<PodTransition> {
        match event {
            watcher::Event::Init => {
                self.relist = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(pod) => {
                if let (Some(seen), Some(pod_ref)) = (self.relist.as_mut(), PodRef::from_pod(&pod))
                {
                    seen.insert(pod_ref.key());
                }
                self.apply(&pod).into_iter().collect()
            }
            watcher::Event::InitDone => {
                let seen = self.relist.take().unwrap_or_default();
                let vanished: Vec<String> = self
                    .pods
                    .keys()
                    .filter(|k| !seen.contains(*k))
                    .cloned()
                    .collect();
                self.synced = true;
                vanished
                    .into_iter()
                    .filter_map(|key| self.pods.remove(&key))
                    .filter_map(|snap| {
                        Some(PodTransition::Deleted {
                            model: snap.model?,
                            pod: snap.pod,
                        })
                    })
                    .collect()
            }
            watcher::Event::Apply(pod) => self.apply(&pod).into_iter().collect(),
            watcher::Event::Delete(pod) => self.delete(&pod).into_iter().collect(),
        }
    }

    fn apply(&mut self, pod: &Pod) -> Option<PodTransition> {
        let pod_ref = PodRef::from_pod(pod)?;
        let snapshot = PodSnapshot {
            pod: pod_ref.clone(),
            ready: is_pod_ready(pod),
            model: model_label(pod).map(str::to_string),
        };
        let ready = snapshot.ready;
        let model = snapshot.model.clone();
        let previous = self.pods.insert(pod_ref.key(), snapshot);

        let became_ready = match previous {
            Some(prev) => !prev.ready && ready,
            // Only a pod that appeared ready while we were disconnected counts
            None => ready && self.synced && self.relist.is_some(),
        };
        if !became_ready {
            return None;
        }
        Some(PodTransition::BecameReady {
            pod: pod_ref,
            model: model?,
        })
    }

    fn delete(&mut self, pod: &Pod) -> Option<PodTransition> {
        let pod_ref = PodRef::from_pod(pod)?;
        let cached = self.pods.remove(&pod_ref.key());
        let model = model_label(pod)
            .map(str::to_string)
            .or_else(|| cached.and_then(|c| c.model))?;
        Some(PodTransition::Deleted {
            pod: pod_ref,
            model,
        })
    }
}

/// Adapters whose base model matches the transition's pod
pub fn affected_adapters(transition: &PodTransition, adapters: &[ModelAdapter]) -> Vec<String> {
    adapters
        .iter()
        .filter(|a| a.spec.base_model == transition.model())
        .map(|a| a.key())
        .collect()
}

/// Whether an adapter event should trigger a pass
pub fn adapter_needs_reconcile(adapter: &ModelAdapter) -> bool {
    if adapter.is_deleting() {
        return true;
    }
    match &adapter.status {
        None => true,
        Some(status) => adapter.metadata.generation.unwrap_or(0) != status.observed_generation,
    }
}

/// Forwards watch streams to the controller as `ReconcileTrigger`s
pub struct EventRouter {
    cluster: Arc<dyn ClusterApi>,
    triggers: mpsc::Sender<ReconcileTrigger>,
}

impl EventRouter {
    pub fn new(cluster: Arc<dyn ClusterApi>, triggers: mpsc::Sender<ReconcileTrigger>) -> Self {
        Self { cluster, triggers }
    }

    /// Consume a pod watch stream until it ends or `token` is cancelled
    pub async fn route_pod_events<S>(&self, events: S, token: CancellationToken) -> Result<()>
    where
        S: Stream<Item = std::result::Result<watcher::Event<Pod>, watcher::Error>> + Send,
    {
        let mut events = std::pin::pin!(events);
        let mut router = PodEventRouter::new();
        info!("Pod event router started");

        loop {
            let next = tokio::select! {
                _ = token.cancelled() => break,
                next = events.next() => next,
            };
            let Some(item) = next else {
                warn!("Pod watch stream ended");
                break;
            };

            match item {
                Ok(event) => {
                    for transition in router.observe(event) {
                        self.dispatch_pod(transition).await?;
                    }
                }
                Err(e) => warn!("Pod watch error: {}", e),
            }
        }

        info!("Pod event router stopped");
        Ok(())
    }

    /// Consume a ModelAdapter watch stream until it ends or `token` is cancelled
    pub async fn route_adapter_events<S>(&self, events: S, token: CancellationToken) -> Result<()>
    where
        S: Stream<Item = std::result::Result<watcher::Event<ModelAdapter>, watcher::Error>>
            + Send,
    {
        let mut events = std::pin::pin!(events);
        info!("Adapter event router started");

        loop {
            let next = tokio::select! {
                _ = token.cancelled() => break,
                next = events.next() => next,
            };
            let Some(item) = next else {
                warn!("Adapter watch stream ended");
                break;
            };

            match item {
                Ok(watcher::Event::Apply(adapter)) | Ok(watcher::Event::InitApply(adapter)) => {
                    if adapter_needs_reconcile(&adapter) {
                        self.send(ReconcileTrigger::AdapterChanged {
                            adapter: adapter.key(),
                        })
                        .await?;
                    }
                }
                Ok(watcher::Event::Delete(adapter)) => {
                    debug!("Adapter {} removed", adapter.key());
                }
                Ok(_) => {}
                Err(e) => warn!("Adapter watch error: {}", e),
            }
        }

        info!("Adapter event router stopped");
        Ok(())
    }

    async fn dispatch_pod(&self, transition: PodTransition) -> Result<()> {
        let adapters = match self.cluster.list_adapters().await {
            Ok(adapters) => adapters,
            Err(e) => {
                warn!("Cannot map pod event to adapters: {}", e);
                return Ok(());
            }
        };

        let affected = affected_adapters(&transition, &adapters);
        if affected.is_empty() {
            debug!("No adapters affected by {:?}", transition);
            return Ok(());
        }

        let trigger = match transition {
            PodTransition::BecameReady { pod, .. } => ReconcileTrigger::PodReady {
                pod: pod.key(),
                adapters: affected,
            },
            PodTransition::Deleted { pod, .. } => ReconcileTrigger::PodDeleted {
                pod: pod.key(),
                adapters: affected,
            },
        };
        self.send(trigger).await
    }

    async fn send(&self, trigger: ReconcileTrigger) -> Result<()> {
        debug!("Trigger: {}", trigger);
        self.triggers
            .send(trigger)
            .await
            .map_err(|_| RuntimeError::internal_error("reconcile trigger channel closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{model_adapter, serving_pod, MockCluster};
    use futures_util::stream;
    use loraplex_core::ModelAdapterStatus;

    fn pod(name: &str, ready: bool) -> Pod {
        serving_pod("default", name, "base", Some("10.0.0.1"), ready)
    }

    #[test]
    fn test_creation_is_not_a_transition() {
        let mut router = PodEventRouter::new();
        assert!(router.observe(watcher::Event::Apply(pod("a", false))).is_empty());
    }

    #[test]
    fn test_not_ready_to_ready_is_a_transition() {
        let mut router = PodEventRouter::new();
        router.observe(watcher::Event::Apply(pod("a", false)));

        let transitions = router.observe(watcher::Event::Apply(pod("a", true)));
        assert_eq!(
            transitions,
            vec![PodTransition::BecameReady {
                pod: PodRef::new("default", "a"),
                model: "base".to_string(),
            }]
        );

        // Staying ready is not another transition
        assert!(router.observe(watcher::Event::Apply(pod("a", true))).is_empty());
    }

    #[test]
    fn test_delete_is_a_transition() {
        let mut router = PodEventRouter::new();
        router.observe(watcher::Event::Apply(pod("a", true)));
        let transitions = router.observe(watcher::Event::Delete(pod("a", true)));
        assert!(matches!(&transitions[..], [PodTransition::Deleted { .. }]));
    }

    #[test]
    fn test_initial_list_does_not_trigger() {
        let mut router = PodEventRouter::new();
        let mut all = Vec::new();
        all.extend(router.observe(watcher::Event::Init));
        all.extend(router.observe(watcher::Event::InitApply(pod("a", true))));
        all.extend(router.observe(watcher::Event::InitApply(pod("b", false))));
        all.extend(router.observe(watcher::Event::InitDone));
        assert!(all.is_empty());
    }

    #[test]
    fn test_relist_reports_missed_changes() {
        let mut router = PodEventRouter::new();
        router.observe(watcher::Event::Init);
        router.observe(watcher::Event::InitApply(pod("a", false)));
        router.observe(watcher::Event::InitApply(pod("gone", true)));
        router.observe(watcher::Event::InitDone);

        // Reconnect: "a" became ready, "gone" vanished, "new" appeared ready
        let mut all = Vec::new();
        all.extend(router.observe(watcher::Event::Init));
        all.extend(router.observe(watcher::Event::InitApply(pod("a", true))));
        all.extend(router.observe(watcher::Event::InitApply(pod("new", true))));
        all.extend(router.observe(watcher::Event::InitDone));

        assert_eq!(all.len(), 3);
        assert!(all.contains(&PodTransition::BecameReady {
            pod: PodRef::new("default", "a"),
            model: "base".to_string(),
        }));
        assert!(all.contains(&PodTransition::BecameReady {
            pod: PodRef::new("default", "new"),
            model: "base".to_string(),
        }));
        assert!(all.contains(&PodTransition::Deleted {
            pod: PodRef::new("default", "gone"),
            model: "base".to_string(),
        }));
    }

    #[test]
    fn test_affected_adapters_match_base_model() {
        let adapters = vec![
            model_adapter("default", "one", "base", "one", Some("/1")),
            model_adapter("team", "two", "other", "two", Some("/2")),
            model_adapter("team", "three", "base", "three", Some("/3")),
        ];
        let transition = PodTransition::Deleted {
            pod: PodRef::new("default", "a"),
            model: "base".to_string(),
        };
        assert_eq!(
            affected_adapters(&transition, &adapters),
            vec!["default/one", "team/three"]
        );
    }

    #[test]
    fn test_adapter_needs_reconcile() {
        let mut adapter = model_adapter("default", "one", "base", "one", Some("/1"));
        assert!(adapter_needs_reconcile(&adapter));

        adapter.status = Some(ModelAdapterStatus {
            observed_generation: 1,
            ..Default::default()
        });
        assert!(!adapter_needs_reconcile(&adapter));

        adapter.metadata.generation = Some(2);
        assert!(adapter_needs_reconcile(&adapter));
    }

    #[tokio::test]
    async fn test_route_pod_events_sends_triggers() {
        let cluster = Arc::new(MockCluster::new());
        cluster
            .insert_adapter(model_adapter("default", "one", "base", "one", Some("/1")))
            .await;
        cluster
            .insert_adapter(model_adapter("default", "two", "other", "two", Some("/2")))
            .await;

        let (tx, mut rx) = mpsc::channel(16);
        let router = EventRouter::new(cluster, tx);
        let events: Vec<std::result::Result<watcher::Event<Pod>, watcher::Error>> = vec![
            Ok(watcher::Event::Apply(pod("a", false))),
            Ok(watcher::Event::Apply(pod("a", true))),
            Ok(watcher::Event::Delete(pod("a", true))),
        ];

        router
            .route_pod_events(stream::iter(events), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            ReconcileTrigger::PodReady {
                pod: "default/a".to_string(),
                adapters: vec!["default/one".to_string()],
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            ReconcileTrigger::PodDeleted {
                pod: "default/a".to_string(),
                adapters: vec!["default/one".to_string()],
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_route_adapter_events_only_for_stale_generation() {
        let cluster = Arc::new(MockCluster::new());
        let (tx, mut rx) = mpsc::channel(16);
        let router = EventRouter::new(cluster, tx);

        let fresh = model_adapter("default", "new", "base", "new", Some("/n"));
        let mut settled = model_adapter("default", "settled", "base", "s", Some("/s"));
        settled.status = Some(ModelAdapterStatus {
            observed_generation: 1,
            ..Default::default()
        });

        let events: Vec<std::result::Result<watcher::Event<ModelAdapter>, watcher::Error>> = vec![
            Ok(watcher::Event::Apply(fresh)),
            Ok(watcher::Event::Apply(settled)),
        ];
        router
            .route_adapter_events(stream::iter(events), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            ReconcileTrigger::AdapterChanged {
                adapter: "default/new".to_string()
            }
        );
        assert!(rx.try_recv().is_err());
    }
}
