//! Loraplex Scheduler - Adapter to pod placement
//!
//! This crate provides:
//! - Candidate filter predicates (base model match, readiness)
//! - Placement algorithms (first-N in discovery order)
//! - The placement scheduler that ties them together

pub mod algorithm;
pub mod error;
pub mod filter;
pub mod scheduler;
pub mod types;

// Re-export commonly used types
pub use algorithm::{algorithm_for, target_count, PlacementAlgorithm};
pub use error::{Result, SchedulerError};
pub use scheduler::PlacementScheduler;
pub use types::{FilterResult, PlacementCandidate, PlacementContext, PodPlacement};
