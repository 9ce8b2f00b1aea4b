//! Serverless REST backend implementing endpoint, job and volume management.
//!
//! Management calls (endpoints, network volumes) go to the REST API; job
//! calls go to the per-endpoint job API. Both authenticate with a bearer
//! token. Request validation happens before any network traffic.

mod error;
mod types;

use std::sync::LazyLock;
use std::time::Duration;

use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::backend::{BackendFuture, ComputeBackend, Endpoint, EndpointHealth, EndpointSpec, Job};
use crate::config::AppConfig;
use crate::volume::{NetworkVolume, VolumeBackend, VolumeRequest};
use types::{
    CreateEndpointPayload, CreateVolumePayload, HealthResponse, JobInput, JobResponse,
    RestEndpoint, RestVolume, SubmitResponse,
};

pub use error::RunpodError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const REST_API_BASE: &str = "https://rest.runpod.io/v1";
const JOB_API_BASE: &str = "https://api.runpod.ai/v2";
/// Extra client-side allowance on top of the server-side `runsync` wait.
const RUNSYNC_GRACE: Duration = Duration::from_secs(30);

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Backend that talks to the serverless provider over HTTPS.
#[derive(Clone)]
pub struct RunpodBackend {
    api_key: String,
}

impl RunpodBackend {
    /// Creates a backend authenticating with `key`.
    ///
    /// # Errors
    ///
    /// Returns [`RunpodError::Config`] when the key is blank.
    pub fn new(key: impl Into<String>) -> Result<Self, RunpodError> {
        let api_key = key.into().trim().to_owned();
        if api_key.is_empty() {
            return Err(RunpodError::Config(String::from(
                "serverless API key must not be empty",
            )));
        }
        Ok(Self { api_key })
    }

    /// Creates a backend from the resolved application configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RunpodError::Config`] when no credential is configured.
    pub fn from_config(config: &AppConfig) -> Result<Self, RunpodError> {
        Self::new(config.runpod_key()?)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        HTTP_CLIENT.request(method, url).bearer_auth(&self.api_key)
    }

    async fn execute(
        action: &'static str,
        url: &str,
        request: RequestBuilder,
    ) -> Result<Vec<u8>, RunpodError> {
        let transport = |err: reqwest::Error| RunpodError::Transport {
            url: url.to_owned(),
            message: err.to_string(),
        };
        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        let body = response.bytes().await.map_err(transport)?;
        debug!(action, status = status.as_u16(), "provider responded");
        if !status.is_success() {
            return Err(RunpodError::Api {
                action,
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(body.to_vec())
    }

    async fn execute_json<T: DeserializeOwned>(
        action: &'static str,
        url: &str,
        request: RequestBuilder,
    ) -> Result<T, RunpodError> {
        let body = Self::execute(action, url, request).await?;
        serde_json::from_slice(&body).map_err(|err| RunpodError::Decode {
            action,
            message: err.to_string(),
        })
    }

    fn job_url(endpoint_id: &str, path: &str) -> String {
        format!("{JOB_API_BASE}/{endpoint_id}/{path}")
    }
}

impl ComputeBackend for RunpodBackend {
    type Error = RunpodError;

    fn list_endpoints(&self) -> BackendFuture<'_, Vec<Endpoint>, Self::Error> {
        Box::pin(async move {
            let url = format!("{REST_API_BASE}/endpoints");
            let endpoints: Vec<RestEndpoint> =
                Self::execute_json("list endpoints", &url, self.request(Method::GET, &url))
                    .await?;
            Ok(endpoints.into_iter().map(Endpoint::from).collect())
        })
    }

    fn create_endpoint<'a>(
        &'a self,
        spec: &'a EndpointSpec,
    ) -> BackendFuture<'a, Endpoint, Self::Error> {
        Box::pin(async move {
            spec.validate()?;
            let url = format!("{REST_API_BASE}/endpoints");
            let request = self
                .request(Method::POST, &url)
                .json(&CreateEndpointPayload::from(spec));
            let created: RestEndpoint =
                Self::execute_json("create endpoint", &url, request).await?;
            let mut endpoint = Endpoint::from(created);
            if endpoint.name.is_empty() {
                endpoint.name.clone_from(&spec.name);
            }
            if endpoint.compute_classes.is_empty() {
                endpoint.compute_classes.clone_from(&spec.compute_classes);
            }
            Ok(endpoint)
        })
    }

    fn delete_endpoint<'a>(&'a self, endpoint_id: &'a str) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let url = format!("{REST_API_BASE}/endpoints/{endpoint_id}");
            Self::execute("delete endpoint", &url, self.request(Method::DELETE, &url)).await?;
            Ok(())
        })
    }

    fn submit_job<'a>(
        &'a self,
        endpoint_id: &'a str,
        input: &'a Value,
    ) -> BackendFuture<'a, String, Self::Error> {
        Box::pin(async move {
            let url = Self::job_url(endpoint_id, "run");
            let request = self
                .request(Method::POST, &url)
                .json(&JobInput { input });
            let submitted: SubmitResponse = Self::execute_json("submit job", &url, request).await?;
            Ok(submitted.id)
        })
    }

    fn job_status<'a>(
        &'a self,
        endpoint_id: &'a str,
        job_id: &'a str,
    ) -> BackendFuture<'a, Job, Self::Error> {
        Box::pin(async move {
            let url = Self::job_url(endpoint_id, &format!("status/{job_id}"));
            let response: JobResponse =
                Self::execute_json("job status", &url, self.request(Method::GET, &url)).await?;
            Ok(response.into_job(job_id))
        })
    }

    fn run_sync<'a>(
        &'a self,
        endpoint_id: &'a str,
        input: &'a Value,
        timeout: Duration,
    ) -> BackendFuture<'a, Job, Self::Error> {
        Box::pin(async move {
            let url = Self::job_url(
                endpoint_id,
                &format!("runsync?wait={}", timeout.as_millis()),
            );
            let request = self
                .request(Method::POST, &url)
                .timeout(timeout.saturating_add(RUNSYNC_GRACE))
                .json(&JobInput { input });
            let response: JobResponse = Self::execute_json("run job", &url, request).await?;
            Ok(response.into_job(""))
        })
    }

    fn cancel_job<'a>(
        &'a self,
        endpoint_id: &'a str,
        job_id: &'a str,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let url = Self::job_url(endpoint_id, &format!("cancel/{job_id}"));
            Self::execute("cancel job", &url, self.request(Method::POST, &url)).await?;
            Ok(())
        })
    }

    fn endpoint_health<'a>(
        &'a self,
        endpoint_id: &'a str,
    ) -> BackendFuture<'a, EndpointHealth, Self::Error> {
        Box::pin(async move {
            let url = Self::job_url(endpoint_id, "health");
            let health: HealthResponse =
                Self::execute_json("endpoint health", &url, self.request(Method::GET, &url))
                    .await?;
            Ok(EndpointHealth::from(health))
        })
    }
}

impl VolumeBackend for RunpodBackend {
    fn list_volumes(&self) -> BackendFuture<'_, Vec<NetworkVolume>, Self::Error> {
        Box::pin(async move {
            let url = format!("{REST_API_BASE}/networkvolumes");
            let volumes: Vec<RestVolume> =
                Self::execute_json("list volumes", &url, self.request(Method::GET, &url)).await?;
            Ok(volumes.into_iter().map(NetworkVolume::from).collect())
        })
    }

    fn get_volume<'a>(
        &'a self,
        volume_id: &'a str,
    ) -> BackendFuture<'a, NetworkVolume, Self::Error> {
        Box::pin(async move {
            let url = format!("{REST_API_BASE}/networkvolumes/{volume_id}");
            let volume: RestVolume =
                Self::execute_json("get volume", &url, self.request(Method::GET, &url)).await?;
            Ok(NetworkVolume::from(volume))
        })
    }

    fn create_volume<'a>(
        &'a self,
        request: &'a VolumeRequest,
    ) -> BackendFuture<'a, NetworkVolume, Self::Error> {
        Box::pin(async move {
            request.validate()?;
            let url = format!("{REST_API_BASE}/networkvolumes");
            let builder = self
                .request(Method::POST, &url)
                .json(&CreateVolumePayload::from(request));
            let created: RestVolume = Self::execute_json("create volume", &url, builder).await?;
            let mut volume = NetworkVolume::from(created);
            if volume.name.is_empty() {
                volume.name.clone_from(&request.name);
            }
            if volume.size_gb == 0 {
                volume.size_gb = request.size_gb;
            }
            if volume.data_center_id.is_empty() {
                volume.data_center_id.clone_from(&request.data_center_id);
            }
            Ok(volume)
        })
    }

    fn delete_volume<'a>(&'a self, volume_id: &'a str) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let url = format!("{REST_API_BASE}/networkvolumes/{volume_id}");
            Self::execute("delete volume", &url, self.request(Method::DELETE, &url)).await?;
            Ok(())
        })
    }
}
