//! Adapter source resolution.
//!
//! Turns an `AdapterSource` into the `lora_name`/`lora_path` pair sent to a
//! serving pod. Remote backends are declared in the schema but fail closed
//! until a resolver exists for them.

use crate::crd::{AdapterSource, AdapterSourceType};
use crate::error::{CoreError, Result};

/// Adapter artifact ready to hand to a serving pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAdapter {
    pub lora_name: String,
    pub lora_path: String,
}

impl AdapterSource {
    /// Resolve the path the serving process should load the adapter from
    pub fn resolve(&self) -> Result<ResolvedAdapter> {
        match self.source_type {
            AdapterSourceType::Local => {
                let path = self
                    .adapter_path
                    .as_deref()
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| CoreError::missing_adapter_path(&self.adapter_name))?;

                Ok(ResolvedAdapter {
                    lora_name: self.adapter_name.clone(),
                    lora_path: path.to_string(),
                })
            }
            AdapterSourceType::S3 | AdapterSourceType::Http | AdapterSourceType::Huggingface => {
                Err(CoreError::source_not_implemented(self.source_type.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(source_type: AdapterSourceType, path: Option<&str>) -> AdapterSource {
        AdapterSource {
            source_type,
            adapter_name: "sql-lora".to_string(),
            adapter_path: path.map(str::to_string),
            credentials_ref: None,
            pattern: None,
            repository: None,
            max_adapters: None,
        }
    }

    #[test]
    fn test_local_source_resolves_path() {
        let resolved = source(AdapterSourceType::Local, Some("/models/sql-lora"))
            .resolve()
            .unwrap();
        assert_eq!(resolved.lora_name, "sql-lora");
        assert_eq!(resolved.lora_path, "/models/sql-lora");
    }

    #[test]
    fn test_local_source_without_path_fails() {
        let err = source(AdapterSourceType::Local, None).resolve().unwrap_err();
        assert!(matches!(err, CoreError::MissingAdapterPath { .. }));

        let err = source(AdapterSourceType::Local, Some("  ")).resolve().unwrap_err();
        assert!(matches!(err, CoreError::MissingAdapterPath { .. }));
    }

    #[test]
    fn test_remote_sources_fail_closed() {
        for source_type in [
            AdapterSourceType::S3,
            AdapterSourceType::Http,
            AdapterSourceType::Huggingface,
        ] {
            let err = source(source_type, Some("s3://bucket/adapter"))
                .resolve()
                .unwrap_err();
            match err {
                CoreError::SourceNotImplemented { source_type: t } => {
                    assert_eq!(t, source_type.to_string())
                }
                other => panic!("unexpected error: {}", other),
            }
        }
    }
}
