// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Scheduler error type
#[derive(Error, Debug, Diagnostic)]
pub enum SchedulerError {
    /// No ready pod serves the base model
    #[error("No valid pods for base model {base_model}")]
    #[diagnostic(
        code(scheduler::no_valid_pods),
        help("Check that serving pods carry the label model={base_model} and report Ready")
    )]
    NoValidPods {
        base_model: String,
    },

    /// Algorithm is reserved but has no implementation
    #[error("Placement algorithm '{algorithm}' is not implemented")]
    #[diagnostic(
        code(scheduler::algorithm_not_implemented),
        help("Use deploymentConfig.algorithm: default")
    )]
    AlgorithmNotImplemented {
        algorithm: String,
    },

    /// Internal error
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(scheduler::internal_error),
        help("This is likely a bug. Please report it")
    )]
    InternalError {
        message: String,
    },
}

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

impl SchedulerError {
    /// Create a NoValidPods error
    pub fn no_valid_pods(base_model: impl Into<String>) -> Self {
        Self::NoValidPods {
            base_model: base_model.into(),
        }
    }

    /// Create an AlgorithmNotImplemented error
    pub fn algorithm_not_implemented(algorithm: impl Into<String>) -> Self {
        Self::AlgorithmNotImplemented {
            algorithm: algorithm.into(),
        }
    }

    /// Create an InternalError
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }
}
