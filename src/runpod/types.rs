//! Wire types for the serverless REST and job APIs.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::{Endpoint, EndpointHealth, EndpointSpec, Job, JobStatus};
use crate::volume::{NetworkVolume, VolumeRequest};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RestEndpoint {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    gpu_type_ids: Option<Vec<String>>,
    #[serde(default)]
    workers_min: Option<u32>,
    #[serde(default)]
    workers_max: Option<u32>,
    #[serde(default)]
    network_volume_id: Option<String>,
    #[serde(default)]
    network_volume_ids: Option<Vec<String>>,
}

impl From<RestEndpoint> for Endpoint {
    fn from(value: RestEndpoint) -> Self {
        let mut volume_ids: Vec<String> = value
            .network_volume_id
            .into_iter()
            .filter(|id| !id.is_empty())
            .collect();
        for id in value.network_volume_ids.unwrap_or_default() {
            if !id.is_empty() && !volume_ids.contains(&id) {
                volume_ids.push(id);
            }
        }
        Self {
            id: value.id,
            name: value.name,
            compute_classes: value.gpu_type_ids.unwrap_or_default(),
            workers_min: value.workers_min.unwrap_or_default(),
            workers_max: value.workers_max.unwrap_or_default(),
            volume_ids,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateEndpointPayload<'a> {
    name: &'a str,
    template_id: &'a str,
    #[serde(skip_serializing_if = "is_empty_list")]
    gpu_type_ids: &'a [String],
    gpu_count: u32,
    #[serde(skip_serializing_if = "is_empty_list")]
    data_center_ids: &'a [String],
    workers_min: u32,
    workers_max: u32,
    idle_timeout: u32,
    flashboot: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    network_volume_id: Option<&'a str>,
}

fn is_empty_list(values: &&[String]) -> bool {
    values.is_empty()
}

impl<'a> From<&'a EndpointSpec> for CreateEndpointPayload<'a> {
    fn from(spec: &'a EndpointSpec) -> Self {
        Self {
            name: &spec.name,
            template_id: &spec.template_id,
            gpu_type_ids: &spec.compute_classes,
            gpu_count: spec.gpu_count,
            data_center_ids: &spec.data_centers,
            workers_min: spec.workers_min,
            workers_max: spec.workers_max,
            idle_timeout: spec.idle_timeout_secs,
            flashboot: spec.flashboot,
            network_volume_id: spec.volume_id.as_deref(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RestVolume {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    size: u32,
    #[serde(default)]
    data_center_id: String,
    #[serde(default)]
    status: Option<String>,
}

impl From<RestVolume> for NetworkVolume {
    fn from(value: RestVolume) -> Self {
        Self {
            id: value.id,
            name: value.name,
            size_gb: value.size,
            data_center_id: value.data_center_id,
            status: value.status,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateVolumePayload<'a> {
    name: &'a str,
    size: u32,
    data_center_id: &'a str,
}

impl<'a> From<&'a VolumeRequest> for CreateVolumePayload<'a> {
    fn from(request: &'a VolumeRequest) -> Self {
        Self {
            name: &request.name,
            size: request.size_gb,
            data_center_id: &request.data_center_id,
        }
    }
}

#[derive(Debug, Serialize)]
pub(super) struct JobInput<'a> {
    pub(super) input: &'a Value,
}

#[derive(Debug, Deserialize)]
pub(super) struct SubmitResponse {
    pub(super) id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct JobResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    delay_time: Option<u64>,
    #[serde(default)]
    execution_time: Option<u64>,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

impl JobResponse {
    /// Converts the wire shape, using `fallback_id` when the body omits it.
    pub(super) fn into_job(self, fallback_id: &str) -> Job {
        let error = self.error.and_then(|value| match value {
            Value::Null => None,
            Value::String(message) if message.is_empty() => None,
            Value::String(message) => Some(message),
            other => Some(other.to_string()),
        });
        Job {
            id: self
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| fallback_id.to_owned()),
            status: parse_status(&self.status),
            delay_time: Duration::from_millis(self.delay_time.unwrap_or_default()),
            execution_time: Duration::from_millis(self.execution_time.unwrap_or_default()),
            output: self.output.filter(|value| !value.is_null()),
            error,
        }
    }
}

/// Maps provider status strings onto [`JobStatus`]. Unknown values are
/// treated as still queued so the poll loop keeps waiting.
pub(super) fn parse_status(raw: &str) -> JobStatus {
    match raw.trim().to_ascii_uppercase().as_str() {
        "IN_PROGRESS" => JobStatus::InProgress,
        "COMPLETED" => JobStatus::Completed,
        "FAILED" | "CANCELLED" | "TIMED_OUT" => JobStatus::Failed,
        _ => JobStatus::Queued,
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HealthWorkers {
    #[serde(default)]
    idle: u32,
    #[serde(default)]
    running: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HealthJobs {
    #[serde(default)]
    in_queue: u32,
    #[serde(default)]
    in_progress: u32,
    #[serde(default)]
    completed: u32,
    #[serde(default)]
    failed: u32,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct HealthResponse {
    #[serde(default)]
    workers: HealthWorkers,
    #[serde(default)]
    jobs: HealthJobs,
}

impl From<HealthResponse> for EndpointHealth {
    fn from(value: HealthResponse) -> Self {
        Self {
            workers_idle: value.workers.idle,
            workers_running: value.workers.running,
            jobs_in_queue: value.jobs.in_queue,
            jobs_in_progress: value.jobs.in_progress,
            jobs_completed: value.jobs.completed,
            jobs_failed: value.jobs.failed,
        }
    }
}
