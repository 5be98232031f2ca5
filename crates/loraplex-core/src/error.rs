// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Core error type for adapter resource handling
#[derive(Error, Debug, Diagnostic)]
pub enum CoreError {
    /// Adapter source type is declared but has no resolver
    #[error("Adapter source type '{source_type}' is not implemented")]
    #[diagnostic(
        code(loraplex::source_not_implemented),
        help("Only the 'local' adapter source is supported. Stage the adapter weights on the serving pods and use type: local")
    )]
    SourceNotImplemented {
        #[allow(unused)]
        source_type: String,
    },

    /// Local source without a path
    #[error("Adapter '{adapter}' has no adapterPath")]
    #[diagnostic(
        code(loraplex::missing_adapter_path),
        help("Set spec.adapterSource.adapterPath to the location of the adapter weights inside the serving container")
    )]
    MissingAdapterPath {
        #[allow(unused)]
        adapter: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(
        code(loraplex::serialization_error),
        help("Ensure the resource format is valid JSON or YAML")
    )]
    SerializationError {
        #[allow(unused)]
        message: String,
        #[source]
        #[allow(unused)]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Internal error
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(loraplex::internal_error),
        help("This is likely a bug. Please report it with the full error details")
    )]
    InternalError {
        #[allow(unused)]
        message: String,
    },
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Create a SourceNotImplemented error
    pub fn source_not_implemented(source_type: impl Into<String>) -> Self {
        Self::SourceNotImplemented {
            source_type: source_type.into(),
        }
    }

    /// Create a MissingAdapterPath error
    pub fn missing_adapter_path(adapter: impl Into<String>) -> Self {
        Self::MissingAdapterPath {
            adapter: adapter.into(),
        }
    }

    /// Create a SerializationError
    pub fn serialization_error(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::SerializationError {
            message: message.into(),
            source,
        }
    }

    /// Create an InternalError
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = CoreError::source_not_implemented("s3");
        assert!(matches!(err, CoreError::SourceNotImplemented { .. }));
        assert_eq!(err.to_string(), "Adapter source type 's3' is not implemented");
    }

    #[test]
    fn test_missing_path_names_adapter() {
        let err = CoreError::missing_adapter_path("sql-lora");
        assert!(err.to_string().contains("sql-lora"));
    }
}
