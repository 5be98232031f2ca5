use miette::Diagnostic;
use thiserror::Error;

/// Runtime error type for discovery, control-plane calls and reconciliation
#[derive(Error, Debug, Diagnostic)]
pub enum RuntimeError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    #[diagnostic(
        code(loraplex::runtime::kube_error),
        help("Check API server connectivity and that the controller's service account can list pods, read secrets and update modeladapters/status")
    )]
    KubeError(#[from] kube::Error),

    /// Optimistic-concurrency conflict
    #[error("Conflict writing {resource}: the object was modified concurrently")]
    #[diagnostic(
        code(loraplex::runtime::conflict),
        help("Re-read the object and retry with the latest resourceVersion")
    )]
    Conflict {
        #[allow(unused)]
        resource: String,
    },

    /// Status update kept conflicting
    #[error("Status update for {adapter} failed after {attempts} attempts")]
    #[diagnostic(
        code(loraplex::runtime::status_retries_exhausted),
        help("Another writer keeps modifying this ModelAdapter. The next reconcile pass will retry")
    )]
    StatusRetriesExhausted {
        #[allow(unused)]
        adapter: String,
        #[allow(unused)]
        attempts: u32,
    },

    /// Serving pod could not be reached
    #[error("Serving pod {pod} is unreachable: {message}")]
    #[diagnostic(
        code(loraplex::runtime::pod_unreachable),
        help("Verify the pod IP and control port are reachable from the controller, and that the serving process is up")
    )]
    PodUnreachable {
        #[allow(unused)]
        pod: String,
        #[allow(unused)]
        message: String,
    },

    /// Serving pod answered with an error status
    #[error("Serving pod {pod} rejected {operation} with status {status}: {body}")]
    #[diagnostic(
        code(loraplex::runtime::control_plane_rejected),
        help("Check the serving process logs. Runtime LoRA updates must be enabled (VLLM_ALLOW_RUNTIME_LORA_UPDATING=True for vLLM)")
    )]
    ControlPlaneRejected {
        #[allow(unused)]
        pod: String,
        #[allow(unused)]
        operation: String,
        #[allow(unused)]
        status: u16,
        #[allow(unused)]
        body: String,
    },

    /// Serving pod answered with a body that could not be parsed
    #[error("Malformed response from serving pod {pod}: {message}")]
    #[diagnostic(
        code(loraplex::runtime::malformed_response),
        help("The pod is expected to serve an OpenAI-compatible /v1/models endpoint")
    )]
    MalformedResponse {
        #[allow(unused)]
        pod: String,
        #[allow(unused)]
        message: String,
    },

    /// Referenced secret does not exist
    #[error("Secret {namespace}/{name} not found")]
    #[diagnostic(
        code(loraplex::runtime::secret_not_found),
        help("Create the secret referenced by spec.apiKeyConfig.secretRef in the adapter's namespace")
    )]
    SecretNotFound {
        #[allow(unused)]
        namespace: String,
        #[allow(unused)]
        name: String,
    },

    /// Referenced secret lacks the key
    #[error("Secret {name} has no usable key '{key}'")]
    #[diagnostic(
        code(loraplex::runtime::secret_key_missing),
        help("Add the key to the secret, or point spec.apiKeyConfig.secretRef.key at an existing UTF-8 entry")
    )]
    SecretKeyMissing {
        #[allow(unused)]
        name: String,
        #[allow(unused)]
        key: String,
    },

    /// Some pods failed during a reconcile
    #[error("Adapter {adapter}: {failed} pod operation(s) failed")]
    #[diagnostic(
        code(loraplex::runtime::pod_operations_failed),
        help("See the preceding log lines for the failing pods. The adapter will be retried with backoff")
    )]
    PodOperationsFailed {
        #[allow(unused)]
        adapter: String,
        #[allow(unused)]
        failed: usize,
    },

    /// Deletion cannot proceed until every pod is drained
    #[error("Adapter {adapter} is still loaded on {remaining} pod(s); keeping finalizer")]
    #[diagnostic(
        code(loraplex::runtime::drain_incomplete),
        help("Unload failed on at least one pod. Deletion resumes automatically once the pods are reachable")
    )]
    DrainIncomplete {
        #[allow(unused)]
        adapter: String,
        #[allow(unused)]
        remaining: usize,
    },

    /// Work stopped because shutdown was requested
    #[error("Reconcile cancelled")]
    #[diagnostic(code(loraplex::runtime::cancelled))]
    Cancelled,

    /// Core library error
    #[error(transparent)]
    #[diagnostic(transparent)]
    CoreError(#[from] loraplex_core::CoreError),

    /// Scheduler error
    #[error(transparent)]
    #[diagnostic(transparent)]
    SchedulerError(#[from] loraplex_scheduler::SchedulerError),

    /// Internal error
    #[error("Internal runtime error: {message}")]
    #[diagnostic(
        code(loraplex::runtime::internal_error),
        help("This is likely a bug in loraplex-runtime. Please report it with the full error details")
    )]
    InternalError {
        #[allow(unused)]
        message: String,
    },
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

impl RuntimeError {
    pub fn conflict(resource: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
        }
    }

    pub fn status_retries_exhausted(adapter: impl Into<String>, attempts: u32) -> Self {
        Self::StatusRetriesExhausted {
            adapter: adapter.into(),
            attempts,
        }
    }

    pub fn pod_unreachable(pod: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PodUnreachable {
            pod: pod.into(),
            message: message.into(),
        }
    }

    pub fn control_plane_rejected(
        pod: impl Into<String>,
        operation: impl Into<String>,
        status: u16,
        body: impl Into<String>,
    ) -> Self {
        Self::ControlPlaneRejected {
            pod: pod.into(),
            operation: operation.into(),
            status,
            body: body.into(),
        }
    }

    pub fn malformed_response(pod: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            pod: pod.into(),
            message: message.into(),
        }
    }

    pub fn secret_not_found(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::SecretNotFound {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn secret_key_missing(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self::SecretKeyMissing {
            name: name.into(),
            key: key.into(),
        }
    }

    pub fn pod_operations_failed(adapter: impl Into<String>, failed: usize) -> Self {
        Self::PodOperationsFailed {
            adapter: adapter.into(),
            failed,
        }
    }

    pub fn drain_incomplete(adapter: impl Into<String>, remaining: usize) -> Self {
        Self::DrainIncomplete {
            adapter: adapter.into(),
            remaining,
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Whether the error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict { .. } => true,
            Self::KubeError(kube::Error::Api(ae)) => ae.code == 409,
            _ => false,
        }
    }
}
