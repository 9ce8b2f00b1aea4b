//! Core library for the mediarelay media processing tool.
//!
//! Operations run on the local media engine or on remote GPU providers: a
//! serverless endpoint fed inline or through a network volume, or a hosted
//! prediction API for upscaling. The [`router`] picks the path, the
//! [`batch`] engine drives it over a directory, and [`metrics`] prices the
//! result.

pub mod backend;
pub mod batch;
pub mod cancel;
pub mod config;
pub mod cost;
pub mod endpoint;
pub mod engine;
pub mod janitor;
pub mod job;
pub mod media;
pub mod metrics;
pub mod object_store;
pub mod operation;
pub mod prediction;
pub mod router;
pub mod runpod;
pub mod telemetry;
pub mod test_support;
pub mod volume;
pub mod workflow;

pub use backend::{ComputeBackend, Endpoint, EndpointHealth, EndpointSpec, Job, JobStatus};
pub use batch::{BatchEngine, BatchError, BatchOptions, BatchPlan, FileJob, FileProcessor};
pub use config::{AppConfig, ConfigError};
pub use cost::BillingMode;
pub use endpoint::{EndpointError, EndpointManager};
pub use engine::{LocalEngine, MediaRunner, ProcessRunner};
pub use janitor::{Janitor, JanitorConfig, JanitorError, SweepPlan, SweepSummary};
pub use job::{JobClient, JobError};
pub use metrics::{BatchMetrics, BatchReport};
pub use object_store::{ObjectStoreError, ObjectTransfer, S3Transfer};
pub use operation::{Operation, OperationError, Transform, parse_pipeline};
pub use prediction::{PredictionBackend, ReplicateClient};
pub use router::{ExecutionOutcome, ExecutionRouter, Provider, ProviderSelection, RouteError};
pub use runpod::{RunpodBackend, RunpodError};
pub use volume::{NetworkVolume, VolumeBackend, VolumeRequest};
pub use workflow::{VolumeRef, VolumeWorkflow, WorkflowError};
