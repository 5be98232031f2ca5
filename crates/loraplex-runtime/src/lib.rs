//! Loraplex Runtime - Adapter reconciliation against live serving pods
//!
//! This crate provides:
//! - `ClusterApi` / `ControlPlane` traits with kube-rs, reqwest and in-memory implementations
//! - Registration discovery of adapters loaded on serving pods
//! - Load/unload reconciliation, finalizer-guarded draining and status publication
//! - The periodic adapter controller and its watch-driven triggers

// Allow unused assignments for diagnostic fields - they're used by the thiserror/miette macros
#![allow(unused_assignments)]

pub mod api_client;
pub mod control_plane;
pub mod controller;
pub mod discovery;
pub mod error;
pub mod event_router;
pub mod lifecycle;
pub mod mock;
pub mod reconciler;
pub mod status;
pub mod traits;
pub mod types;

// Re-export primary types
pub use api_client::KubeClusterApi;
pub use control_plane::{ControlPlaneConfig, HttpControlPlane};
pub use controller::{AdapterController, ControllerConfig, PassSummary, ReconcileAction};
pub use discovery::{AdapterLoading, DiscoveryConfig, ObservedState, RegistrationDiscovery};
pub use error::{Result, RuntimeError};
pub use event_router::{EventRouter, PodEventRouter, PodTransition, ReconcileTrigger};
pub use lifecycle::{LifecycleManager, LifecycleState};
pub use mock::{MockCluster, MockControlPlane};
pub use reconciler::{ReconcileOutcome, ReconcilePlan, StateReconciler};
pub use status::{StatusReporter, StatusRetryConfig, StatusUpdate};
pub use traits::{ClusterApi, ControlPlane};
pub use types::{LoadOutcome, ModelCard, PodEndpoint};
