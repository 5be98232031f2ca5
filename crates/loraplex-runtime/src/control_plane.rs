use crate::error::{Result, RuntimeError};
use crate::traits::ControlPlane;
use crate::types::{
    is_already_loaded, LoadLoraRequest, LoadOutcome, ModelCard, ModelList, PodEndpoint,
    UnloadLoraRequest,
};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use std::time::Duration;
use tracing::{debug, info};

pub const MODELS_PATH: &str = "/v1/models";
pub const LOAD_PATH: &str = "/v1/load_lora_adapter";
pub const UNLOAD_PATH: &str = "/v1/unload_lora_adapter";

/// Settings for talking to serving pods
#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// HTTP client for the vLLM-compatible adapter endpoints
pub struct HttpControlPlane {
    client: Client,
}

impl HttpControlPlane {
    pub fn new(config: &ControlPlaneConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| {
                RuntimeError::internal_error(format!("Failed to build HTTP client: {}", e))
            })?;
        Ok(Self { client })
    }

    fn request(
        &self,
        method: Method,
        endpoint: &PodEndpoint,
        path: &str,
        api_key: Option<&str>,
    ) -> RequestBuilder {
        let url = endpoint.url(path);
        debug!("{} {}", method, url);

        let builder = self
            .client
            .request(method, url)
            .header(CONTENT_TYPE, "application/json");
        match api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn send(&self, endpoint: &PodEndpoint, builder: RequestBuilder) -> Result<(StatusCode, String)> {
        let resp = builder
            .send()
            .await
            .map_err(|e| RuntimeError::pod_unreachable(endpoint.pod.key(), e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| RuntimeError::pod_unreachable(endpoint.pod.key(), e.to_string()))?;
        Ok((status, body))
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn list_models(
        &self,
        endpoint: &PodEndpoint,
        api_key: Option<&str>,
    ) -> Result<Vec<ModelCard>> {
        let builder = self.request(Method::GET, endpoint, MODELS_PATH, api_key);
        let (status, body) = self.send(endpoint, builder).await?;

        if status != StatusCode::OK {
            return Err(RuntimeError::control_plane_rejected(
                endpoint.pod.key(),
                "list models",
                status.as_u16(),
                body,
            ));
        }

        let list: ModelList = serde_json::from_str(&body).map_err(|e| {
            RuntimeError::malformed_response(endpoint.pod.key(), format!("/v1/models: {}", e))
        })?;
        Ok(list.data)
    }

    async fn load_adapter(
        &self,
        endpoint: &PodEndpoint,
        request: &LoadLoraRequest,
        api_key: Option<&str>,
    ) -> Result<LoadOutcome> {
        let builder = self
            .request(Method::POST, endpoint, LOAD_PATH, api_key)
            .json(request);
        let (status, body) = self.send(endpoint, builder).await?;

        match status {
            StatusCode::OK => {
                info!(
                    "Loaded adapter {} on pod {} from {}",
                    request.lora_name, endpoint.pod, request.lora_path
                );
                Ok(LoadOutcome::Loaded)
            }
            StatusCode::BAD_REQUEST if is_already_loaded(&body) => {
                debug!(
                    "Adapter {} already loaded on pod {}",
                    request.lora_name, endpoint.pod
                );
                Ok(LoadOutcome::AlreadyLoaded)
            }
            _ => Err(RuntimeError::control_plane_rejected(
                endpoint.pod.key(),
                format!("load of {}", request.lora_name),
                status.as_u16(),
                body,
            )),
        }
    }

    async fn unload_adapter(
        &self,
        endpoint: &PodEndpoint,
        request: &UnloadLoraRequest,
        api_key: Option<&str>,
    ) -> Result<()> {
        let builder = self
            .request(Method::POST, endpoint, UNLOAD_PATH, api_key)
            .json(request);
        let (status, body) = self.send(endpoint, builder).await?;

        if status != StatusCode::OK {
            return Err(RuntimeError::control_plane_rejected(
                endpoint.pod.key(),
                format!("unload of {}", request.lora_name),
                status.as_u16(),
                body,
            ));
        }

        info!("Unloaded adapter {} from pod {}", request.lora_name, endpoint.pod);
        Ok(())
    }
}
