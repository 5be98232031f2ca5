//! ModelAdapter custom resource definition.
//!
//! A ModelAdapter declares one LoRA adapter that should be loaded into the
//! serving pods of a base model. The controller owns `status`; everything under
//! `spec` is operator input.

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Finalizer guarding adapter deletion until every pod has been drained
pub const ADAPTER_FINALIZER: &str = "loraplex.io/adapter-drain";

/// Value of `LoadedAdapter::status` for a loading observed on a live pod
pub const LOADED_STATUS_RUNNING: &str = "Running";

/// ModelAdapter is the Schema for the modeladapters API.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "loraplex.io",
    version = "v1alpha1",
    kind = "ModelAdapter",
    plural = "modeladapters",
    shortname = "ma",
    namespaced,
    status = "ModelAdapterStatus",
    printcolumn = r#"{"name":"Base Model", "type":"string", "jsonPath":".spec.baseModel"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ModelAdapterSpec {
    /// Value of the `model` label carried by eligible serving pods
    pub base_model: String,

    /// Where the adapter weights come from
    pub adapter_source: AdapterSource,

    /// How many pods should load the adapter, and how they are picked
    #[serde(default)]
    pub deployment_config: DeploymentConfig,

    /// Bearer credential presented to the serving pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_config: Option<ApiKeyConfig>,
}

/// Adapter artifact location
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdapterSource {
    /// Source backend
    #[serde(rename = "type")]
    pub source_type: AdapterSourceType,

    /// Name the adapter is registered under inside the serving process
    pub adapter_name: String,

    /// Path of the adapter weights (required for `local`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter_path: Option<String>,

    /// Secret holding credentials for remote sources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_ref: Option<SecretRef>,

    /// Object pattern for remote sources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    /// Repository for remote sources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,

    /// Upper bound on adapters pulled from a remote source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_adapters: Option<i32>,
}

/// Adapter source backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AdapterSourceType {
    /// Weights already present on the serving pod's filesystem
    Local,
    /// S3-compatible object store
    S3,
    /// Plain HTTP download
    Http,
    /// Hugging Face hub repository
    Huggingface,
}

impl fmt::Display for AdapterSourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterSourceType::Local => write!(f, "local"),
            AdapterSourceType::S3 => write!(f, "s3"),
            AdapterSourceType::Http => write!(f, "http"),
            AdapterSourceType::Huggingface => write!(f, "huggingface"),
        }
    }
}

/// Reference to a Secret in the adapter's namespace
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    /// Secret name
    pub name: String,
    /// Key inside the secret, when only one entry is needed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Reference to a single key of a Secret in the adapter's namespace
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    /// Secret name
    pub name: String,
    /// Key inside the secret
    pub key: String,
}

/// Placement configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfig {
    /// Pod selection algorithm
    #[serde(default)]
    pub algorithm: DeploymentAlgorithm,

    /// Number of pods to load the adapter on; unset means every eligible pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

/// Pod selection algorithm
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentAlgorithm {
    /// First N eligible pods in discovery order
    #[default]
    Default,
    /// Reserved
    Ordered,
    /// Reserved
    Equalized,
}

impl fmt::Display for DeploymentAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentAlgorithm::Default => write!(f, "default"),
            DeploymentAlgorithm::Ordered => write!(f, "ordered"),
            DeploymentAlgorithm::Equalized => write!(f, "equalized"),
        }
    }
}

/// Bearer credential for the serving pods' control endpoints
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ApiKeyConfig {
    /// Literal key
    Value(String),
    /// Key stored in a Secret
    SecretRef(SecretKeyRef),
}

/// Observed state of a ModelAdapter
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelAdapterStatus {
    /// Lifecycle phase
    #[serde(default)]
    pub phase: AdapterPhase,

    /// Loadings observed by the most recent discovery
    #[serde(default)]
    pub loaded_adapters: Vec<LoadedAdapter>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation the status was computed from
    #[serde(default)]
    pub observed_generation: i64,

    /// Human-readable summary of the last reconcile
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Adapter lifecycle phase
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum AdapterPhase {
    /// Not reconciled yet
    #[default]
    Pending,
    /// Loads issued but not yet observed on every desired pod
    Loading,
    /// Every desired pod holds the adapter
    Ready,
    /// Discovery, scheduling or source resolution failed
    Failed,
    /// Some desired pods failed while others hold the adapter
    PartialFailure,
}

impl fmt::Display for AdapterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterPhase::Pending => write!(f, "Pending"),
            AdapterPhase::Loading => write!(f, "Loading"),
            AdapterPhase::Ready => write!(f, "Ready"),
            AdapterPhase::Failed => write!(f, "Failed"),
            AdapterPhase::PartialFailure => write!(f, "PartialFailure"),
        }
    }
}

/// One adapter loading observed on a serving pod
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoadedAdapter {
    /// Adapter name as registered in the serving process
    pub name: String,
    /// Path the adapter was loaded from
    #[serde(default)]
    pub path: String,
    /// When the loading was first observed
    pub load_time: DateTime<Utc>,
    /// Loading state
    pub status: String,
    /// Pod holding the adapter
    pub pod_assignment: PodAssignment,
}

/// Pod identity inside a status entry
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodAssignment {
    /// Pod name
    pub pod_name: String,
    /// Pod namespace
    pub namespace: String,
}

impl PodAssignment {
    /// Normalized `namespace/podName` key
    pub fn key(&self) -> String {
        crate::pod::pod_key(&self.namespace, &self.pod_name)
    }
}

/// Condition status values
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition holds
    True,
    /// Condition does not hold
    False,
    /// Not determined
    Unknown,
}

/// Status condition
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (Initialized, Scheduled, Ready)
    #[serde(rename = "type")]
    pub type_: String,
    /// Condition status
    pub status: ConditionStatus,
    /// Machine-readable reason
    pub reason: String,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
    /// Last time the status flipped
    pub last_transition_time: DateTime<Utc>,
    /// Generation the condition was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new condition stamped with the current time
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
            observed_generation: None,
        }
    }

    /// Attach the generation this condition describes
    pub fn with_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }
}

impl ModelAdapterStatus {
    /// Insert or replace a condition by type.
    ///
    /// `lastTransitionTime` is carried over when the status value is unchanged.
    pub fn set_condition(&mut self, mut condition: Condition) {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.type_ == condition.type_)
        {
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time;
                }
                *existing = condition;
            }
            None => self.conditions.push(condition),
        }
    }

    /// Look up a condition by type
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

impl ModelAdapter {
    /// `namespace/name` identifier used in logs and triggers
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.namespace().unwrap_or_else(|| "default".to_string()),
            self.name_any()
        )
    }

    /// Namespace, defaulting the way the API server does
    pub fn namespace_or_default(&self) -> String {
        self.namespace().unwrap_or_else(|| "default".to_string())
    }

    /// Name the adapter is registered under inside serving processes
    pub fn lora_name(&self) -> &str {
        &self.spec.adapter_source.adapter_name
    }

    /// Whether the resource has been marked for deletion
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the given finalizer is present
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers().iter().any(|f| f == finalizer)
    }

    /// Generation recorded in the last published status
    pub fn observed_generation(&self) -> Option<i64> {
        self.status.as_ref().map(|s| s.observed_generation)
    }

    /// Current phase, `Pending` when no status has been written yet
    pub fn phase(&self) -> AdapterPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }
}
