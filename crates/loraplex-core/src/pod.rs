//! Helpers for reading serving pods.
//!
//! Serving pods are produced by an external Deployment controller. The
//! contract relied on here: a `model` label naming the base model, a named
//! container port for the control endpoints, and the standard Ready condition.

use k8s_openapi::api::core::v1::{ContainerPort, Pod};
use std::fmt;

/// Label carrying the base model a pod serves
pub const MODEL_LABEL: &str = "model";

/// Name of the container port exposing the control endpoints
pub const DEFAULT_PORT_NAME: &str = "http";

/// Port used when no container port is named
pub const DEFAULT_SERVING_PORT: u16 = 8000;

/// Normalized `namespace/podName` key
pub fn pod_key(namespace: &str, pod_name: &str) -> String {
    format!("{}/{}", namespace, pod_name)
}

/// Identity of a serving pod
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
}

impl PodRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Build from pod metadata; `None` if the pod has no name
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        let name = pod.metadata.name.clone()?;
        let namespace = pod
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        Some(Self { namespace, name })
    }

    pub fn key(&self) -> String {
        pod_key(&self.namespace, &self.name)
    }
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Value of the `model` label, if any
pub fn model_label(pod: &Pod) -> Option<&str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(MODEL_LABEL))
        .map(String::as_str)
}

/// Whether the pod's Ready condition is True
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"))
        .is_some_and(|c| c.status == "True")
}

/// Resolve the base URL of a pod's control endpoints.
///
/// Prefers the container port named `port_name`, then the first named
/// container port, then `default_port`. Returns `None` until the pod has been
/// assigned an IP.
pub fn pod_endpoint(pod: &Pod, port_name: &str, default_port: u16) -> Option<String> {
    let ip = pod
        .status
        .as_ref()
        .and_then(|s| s.pod_ip.as_deref())
        .filter(|ip| !ip.is_empty())?;

    let ports: Vec<&ContainerPort> = pod
        .spec
        .as_ref()
        .into_iter()
        .flat_map(|spec| spec.containers.iter())
        .flat_map(|c| c.ports.iter().flatten())
        .collect();

    let port = ports
        .iter()
        .find(|p| p.name.as_deref() == Some(port_name))
        .or_else(|| {
            ports
                .iter()
                .find(|p| p.name.as_deref().is_some_and(|n| !n.is_empty()))
        })
        .and_then(|p| u16::try_from(p.container_port).ok())
        .unwrap_or(default_port);

    // IPv6 literals need brackets in URLs
    if ip.contains(':') {
        Some(format!("http://[{}]:{}", ip, port))
    } else {
        Some(format!("http://{}:{}", ip, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodCondition, PodSpec, PodStatus};
    use std::collections::BTreeMap;

    fn make_pod(ready: &str, ip: Option<&str>, ports: Vec<ContainerPort>) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some("vllm-0".to_string());
        pod.metadata.namespace = Some("serving".to_string());
        pod.metadata.labels = Some(BTreeMap::from([(
            MODEL_LABEL.to_string(),
            "llama-2-7b".to_string(),
        )]));
        pod.spec = Some(PodSpec {
            containers: vec![Container {
                name: "vllm".to_string(),
                ports: Some(ports),
                ..Default::default()
            }],
            ..Default::default()
        });
        pod.status = Some(PodStatus {
            pod_ip: ip.map(str::to_string),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: ready.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        pod
    }

    #[test]
    fn test_pod_ref_key() {
        let pod = make_pod("True", Some("10.0.0.5"), vec![]);
        let pod_ref = PodRef::from_pod(&pod).unwrap();
        assert_eq!(pod_ref.key(), "serving/vllm-0");
        assert_eq!(pod_ref.to_string(), "serving/vllm-0");
    }

    #[test]
    fn test_model_label_and_readiness() {
        let pod = make_pod("True", Some("10.0.0.5"), vec![]);
        assert_eq!(model_label(&pod), Some("llama-2-7b"));
        assert!(is_pod_ready(&pod));

        let pod = make_pod("False", Some("10.0.0.5"), vec![]);
        assert!(!is_pod_ready(&pod));

        assert!(!is_pod_ready(&Pod::default()));
        assert_eq!(model_label(&Pod::default()), None);
    }

    #[test]
    fn test_endpoint_uses_named_port() {
        let pod = make_pod(
            "True",
            Some("10.0.0.5"),
            vec![
                ContainerPort {
                    name: Some("metrics".to_string()),
                    container_port: 9090,
                    ..Default::default()
                },
                ContainerPort {
                    name: Some("http".to_string()),
                    container_port: 8080,
                    ..Default::default()
                },
            ],
        );
        assert_eq!(
            pod_endpoint(&pod, DEFAULT_PORT_NAME, DEFAULT_SERVING_PORT),
            Some("http://10.0.0.5:8080".to_string())
        );
    }

    #[test]
    fn test_endpoint_defaults_port_when_unnamed() {
        let pod = make_pod(
            "True",
            Some("10.0.0.5"),
            vec![ContainerPort {
                container_port: 9000,
                ..Default::default()
            }],
        );
        assert_eq!(
            pod_endpoint(&pod, DEFAULT_PORT_NAME, DEFAULT_SERVING_PORT),
            Some("http://10.0.0.5:8000".to_string())
        );
    }

    #[test]
    fn test_endpoint_falls_back_to_first_named_port() {
        let pod = make_pod(
            "True",
            Some("10.0.0.5"),
            vec![ContainerPort {
                name: Some("container-port".to_string()),
                container_port: 8080,
                ..Default::default()
            }],
        );
        assert_eq!(
            pod_endpoint(&pod, DEFAULT_PORT_NAME, DEFAULT_SERVING_PORT),
            Some("http://10.0.0.5:8080".to_string())
        );
    }

    #[test]
    fn test_endpoint_requires_ip() {
        let pod = make_pod("True", None, vec![]);
        assert_eq!(pod_endpoint(&pod, DEFAULT_PORT_NAME, DEFAULT_SERVING_PORT), None);
    }

    #[test]
    fn test_endpoint_brackets_ipv6() {
        let pod = make_pod("True", Some("fd00::12"), vec![]);
        assert_eq!(
            pod_endpoint(&pod, DEFAULT_PORT_NAME, DEFAULT_SERVING_PORT),
            Some("http://[fd00::12]:8000".to_string())
        );
    }
}
