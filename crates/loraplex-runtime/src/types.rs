use loraplex_core::PodRef;
use serde::{Deserialize, Serialize};

/// Error type reported by vLLM when input validation fails
pub const INVALID_USER_INPUT: &str = "InvalidUserInput";

/// Message fragment vLLM uses when a LoRA name is already registered
pub const ALREADY_LOADED_MARKER: &str = "has already been loaded";

/// Control endpoint of one serving pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodEndpoint {
    pub pod: PodRef,
    /// Base URL without a trailing slash, e.g. `http://10.0.0.5:8000`
    pub base_url: String,
}

impl PodEndpoint {
    pub fn new(pod: PodRef, base_url: impl Into<String>) -> Self {
        Self {
            pod,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Join a path onto the base URL
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Response body of GET /v1/models
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelList {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub data: Vec<ModelCard>,
}

/// One registered model, base or adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCard {
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub owned_by: String,
    /// For adapters, the path they were loaded from
    #[serde(default)]
    pub root: Option<String>,
    /// Set for adapters; names the base model
    #[serde(default)]
    pub parent: Option<String>,
}

impl ModelCard {
    /// Whether this entry is an adapter rather than a base model
    pub fn is_adapter(&self) -> bool {
        self.parent.is_some()
    }
}

/// Body of POST /v1/load_lora_adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadLoraRequest {
    pub lora_name: String,
    pub lora_path: String,
}

/// Body of POST /v1/unload_lora_adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnloadLoraRequest {
    pub lora_name: String,
}

/// Successful result of a load call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    /// The pod already had an adapter registered under this name
    AlreadyLoaded,
}

/// Error payload returned by the serving process
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ControlPlaneErrorBody {
    #[serde(rename = "type", default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    /// Newer vLLM releases wrap the payload in an `error` object
    #[serde(default)]
    pub error: Option<Box<ControlPlaneErrorBody>>,
}

impl ControlPlaneErrorBody {
    fn innermost(&self) -> &ControlPlaneErrorBody {
        match &self.error {
            Some(inner) => inner.innermost(),
            None => self,
        }
    }
}

/// Whether a 400 body means the adapter is already registered
pub fn is_already_loaded(body: &str) -> bool {
    let Ok(parsed) = serde_json::from_str::<ControlPlaneErrorBody>(body) else {
        return false;
    };
    let err = parsed.innermost();

    err.error_type.as_deref() == Some(INVALID_USER_INPUT)
        && err
            .message
            .as_deref()
            .is_some_and(|m| m.contains(ALREADY_LOADED_MARKER))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_loaded_detection() {
        let body = r#"{"object":"error","message":"The lora adapter 'sql-lora' has already been loaded.","type":"InvalidUserInput","code":400}"#;
        assert!(is_already_loaded(body));

        let nested = r#"{"error":{"message":"The lora adapter 'sql-lora' has already been loaded.","type":"InvalidUserInput"}}"#;
        assert!(is_already_loaded(nested));
    }

    #[test]
    fn test_other_rejections_are_not_already_loaded() {
        let wrong_type = r#"{"message":"The lora adapter 'x' has already been loaded.","type":"BadRequestError"}"#;
        assert!(!is_already_loaded(wrong_type));

        let wrong_message = r#"{"message":"No adapter found at path /nope","type":"InvalidUserInput"}"#;
        assert!(!is_already_loaded(wrong_message));

        assert!(!is_already_loaded("not json"));
        assert!(!is_already_loaded(""));
    }

    #[test]
    fn test_model_card_parsing() {
        let body = r#"{
            "object": "list",
            "data": [
                {"id": "llama-2-7b", "object": "model", "created": 1, "owned_by": "vllm", "root": "meta-llama/Llama-2-7b-hf", "parent": null},
                {"id": "sql-lora", "object": "model", "created": 2, "owned_by": "vllm", "root": "/models/sql-lora", "parent": "llama-2-7b"}
            ]
        }"#;
        let list: ModelList = serde_json::from_str(body).unwrap();
        assert_eq!(list.data.len(), 2);
        assert!(!list.data[0].is_adapter());
        assert!(list.data[1].is_adapter());
        assert_eq!(list.data[1].root.as_deref(), Some("/models/sql-lora"));
    }

    #[test]
    fn test_endpoint_url() {
        let ep = PodEndpoint::new(PodRef::new("default", "vllm-0"), "http://10.0.0.1:8000/");
        assert_eq!(ep.url("/v1/models"), "http://10.0.0.1:8000/v1/models");
    }
}
