//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::future::ready;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use opendal::{Operator, services};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::backend::{
    BackendFuture, ComputeBackend, Endpoint, EndpointHealth, EndpointSpec, Job, JobStatus,
};
use crate::engine::{CommandOutput, EngineError, MediaRunner};
use crate::object_store::{
    ObjectStoreError, ObjectTransfer, StoreLocation, download_file, upload_file,
};
use crate::prediction::{Prediction, PredictionBackend, PredictionStatus};
use crate::volume::{NetworkVolume, VolumeBackend, VolumeRequest};

fn locked<T>(mutex: &StdMutex<T>) -> StdMutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<StdMutex<VecDeque<CommandOutput>>>,
    invocations: Arc<StdMutex<Vec<CommandInvocation>>>,
    write_outputs: bool,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes successful invocations write a small file at their output
    /// argument (`-o <path>` or the final argument), mimicking an encoder.
    #[must_use]
    pub const fn writing_outputs(mut self) -> Self {
        self.write_outputs = true;
        self
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        locked(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        locked(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }

    fn respond(&self, program: &str, args: &[String]) -> Result<CommandOutput, EngineError> {
        locked(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        let output = locked(&self.responses)
            .pop_front()
            .ok_or_else(|| EngineError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })?;
        if self.write_outputs && output.is_success() {
            let target_arg = args
                .iter()
                .position(|arg| arg == "-o")
                .and_then(|index| args.get(index.saturating_add(1)))
                .or_else(|| args.last());
            if let Some(target) = target_arg {
                std::fs::write(target, b"scripted output").map_err(|err| EngineError::Io {
                    path: Utf8PathBuf::from(target.as_str()),
                    message: err.to_string(),
                })?;
            }
        }
        Ok(output)
    }
}

impl MediaRunner for ScriptedRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [String],
        cancel: &'a CancellationToken,
    ) -> BackendFuture<'a, CommandOutput, EngineError> {
        if cancel.is_cancelled() {
            return Box::pin(ready(Err(EngineError::Cancelled)));
        }
        Box::pin(ready(self.respond(program, args)))
    }
}

/// Error returned by [`ScriptedCompute`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{0}")]
pub struct ScriptedError(String);

impl ScriptedError {
    /// Creates an error carrying `message`.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Shared, ordered record of calls made against the scripted doubles.
///
/// Cloning shares the log, so one log can interleave compute and transfer
/// calls for ordering assertions.
#[derive(Clone, Debug, Default)]
pub struct CallLog(Arc<StdMutex<Vec<String>>>);

impl CallLog {
    /// Appends an entry.
    pub fn push(&self, entry: impl Into<String>) {
        locked(&self.0).push(entry.into());
    }

    /// Returns a snapshot of every entry.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        locked(&self.0).clone()
    }

    /// Index of the first entry starting with `prefix`.
    #[must_use]
    pub fn position(&self, prefix: &str) -> Option<usize> {
        locked(&self.0)
            .iter()
            .position(|entry| entry.starts_with(prefix))
    }
}

#[derive(Debug, Default)]
struct ComputeState {
    endpoints: Vec<Endpoint>,
    volumes: Vec<NetworkVolume>,
    inputs: Vec<Value>,
    statuses: VecDeque<Result<Job, ScriptedError>>,
    syncs: VecDeque<Result<Job, ScriptedError>>,
    list_failures: u32,
    fail_endpoint_creation: bool,
    fail_volume_deletion: bool,
    next_id: u32,
}

impl ComputeState {
    fn next_id(&mut self, kind: &str) -> String {
        self.next_id = self.next_id.saturating_add(1);
        format!("{kind}-{}", self.next_id)
    }
}

/// In-memory compute and volume provider that records every call.
///
/// Endpoints and volumes created through it persist for later listings.
/// Job status and blocking-call results are popped from FIFO scripts; when
/// a script is empty the job completes immediately.
#[derive(Clone, Debug, Default)]
pub struct ScriptedCompute {
    state: Arc<StdMutex<ComputeState>>,
    log: CallLog,
}

impl ScriptedCompute {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an existing endpoint.
    #[must_use]
    pub fn with_endpoint(self, endpoint: Endpoint) -> Self {
        locked(&self.state).endpoints.push(endpoint);
        self
    }

    /// Seeds an existing volume.
    #[must_use]
    pub fn with_volume(self, volume: NetworkVolume) -> Self {
        locked(&self.state).volumes.push(volume);
        self
    }

    /// Makes the next `count` endpoint listings fail.
    pub fn fail_next_lists(&self, count: u32) {
        locked(&self.state).list_failures = count;
    }

    /// Makes every endpoint creation fail.
    pub fn fail_endpoint_creation(&self) {
        locked(&self.state).fail_endpoint_creation = true;
    }

    /// Makes every volume deletion fail.
    pub fn fail_volume_deletion(&self) {
        locked(&self.state).fail_volume_deletion = true;
    }

    /// Queues a result for the next status check.
    pub fn push_status(&self, result: Result<Job, ScriptedError>) {
        locked(&self.state).statuses.push_back(result);
    }

    /// Queues a result for the next blocking call.
    pub fn push_sync(&self, result: Result<Job, ScriptedError>) {
        locked(&self.state).syncs.push_back(result);
    }

    /// Returns the recorded calls, e.g. `create_endpoint:<name>`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.log.entries()
    }

    /// Returns a handle to the call log for sharing with other doubles.
    #[must_use]
    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    /// Returns the endpoints currently known.
    #[must_use]
    pub fn endpoints(&self) -> Vec<Endpoint> {
        locked(&self.state).endpoints.clone()
    }

    /// Returns the volumes currently known.
    #[must_use]
    pub fn volumes(&self) -> Vec<NetworkVolume> {
        locked(&self.state).volumes.clone()
    }

    /// Returns every job input submitted so far.
    #[must_use]
    pub fn inputs(&self) -> Vec<Value> {
        locked(&self.state).inputs.clone()
    }

    fn record(&self, call: String) -> StdMutexGuard<'_, ComputeState> {
        self.log.push(call);
        locked(&self.state)
    }
}

fn completed_job(id: String) -> Job {
    Job {
        execution_time: Duration::from_secs(2),
        delay_time: Duration::from_millis(500),
        ..Job::pending(id, JobStatus::Completed)
    }
}

impl ComputeBackend for ScriptedCompute {
    type Error = ScriptedError;

    fn list_endpoints(&self) -> BackendFuture<'_, Vec<Endpoint>, Self::Error> {
        let mut state = self.record(String::from("list_endpoints"));
        let result = if state.list_failures > 0 {
            state.list_failures = state.list_failures.saturating_sub(1);
            Err(ScriptedError::new("scripted list failure"))
        } else {
            Ok(state.endpoints.clone())
        };
        Box::pin(ready(result))
    }

    fn create_endpoint<'a>(
        &'a self,
        spec: &'a EndpointSpec,
    ) -> BackendFuture<'a, Endpoint, Self::Error> {
        let mut state = self.record(format!("create_endpoint:{}", spec.name));
        let result = if state.fail_endpoint_creation {
            Err(ScriptedError::new("scripted create failure"))
        } else {
            let endpoint = Endpoint {
                id: state.next_id("ep"),
                name: spec.name.clone(),
                compute_classes: spec.compute_classes.clone(),
                workers_min: spec.workers_min,
                workers_max: spec.workers_max,
                volume_ids: spec.volume_id.iter().cloned().collect(),
            };
            state.endpoints.push(endpoint.clone());
            Ok(endpoint)
        };
        Box::pin(ready(result))
    }

    fn delete_endpoint<'a>(&'a self, endpoint_id: &'a str) -> BackendFuture<'a, (), Self::Error> {
        let mut state = self.record(format!("delete_endpoint:{endpoint_id}"));
        let before = state.endpoints.len();
        state.endpoints.retain(|endpoint| endpoint.id != endpoint_id);
        let result = if state.endpoints.len() == before {
            Err(ScriptedError::new(format!("endpoint {endpoint_id} not found")))
        } else {
            Ok(())
        };
        Box::pin(ready(result))
    }

    fn submit_job<'a>(
        &'a self,
        endpoint_id: &'a str,
        input: &'a Value,
    ) -> BackendFuture<'a, String, Self::Error> {
        let mut state = self.record(format!("submit_job:{endpoint_id}"));
        state.inputs.push(input.clone());
        let id = state.next_id("job");
        Box::pin(ready(Ok(id)))
    }

    fn job_status<'a>(
        &'a self,
        endpoint_id: &'a str,
        job_id: &'a str,
    ) -> BackendFuture<'a, Job, Self::Error> {
        let mut state = self.record(format!("job_status:{endpoint_id}"));
        let result = state
            .statuses
            .pop_front()
            .unwrap_or_else(|| Ok(completed_job(job_id.to_owned())));
        Box::pin(ready(result))
    }

    fn run_sync<'a>(
        &'a self,
        endpoint_id: &'a str,
        input: &'a Value,
        _timeout: Duration,
    ) -> BackendFuture<'a, Job, Self::Error> {
        let mut state = self.record(format!("run_sync:{endpoint_id}"));
        state.inputs.push(input.clone());
        let result = match state.syncs.pop_front() {
            Some(scripted) => scripted,
            None => Ok(completed_job(state.next_id("job"))),
        };
        Box::pin(ready(result))
    }

    fn cancel_job<'a>(
        &'a self,
        endpoint_id: &'a str,
        job_id: &'a str,
    ) -> BackendFuture<'a, (), Self::Error> {
        drop(self.record(format!("cancel_job:{endpoint_id}:{job_id}")));
        Box::pin(ready(Ok(())))
    }

    fn endpoint_health<'a>(
        &'a self,
        endpoint_id: &'a str,
    ) -> BackendFuture<'a, EndpointHealth, Self::Error> {
        drop(self.record(format!("endpoint_health:{endpoint_id}")));
        Box::pin(ready(Ok(EndpointHealth {
            workers_idle: 1,
            ..EndpointHealth::default()
        })))
    }
}

impl VolumeBackend for ScriptedCompute {
    fn list_volumes(&self) -> BackendFuture<'_, Vec<NetworkVolume>, Self::Error> {
        let state = self.record(String::from("list_volumes"));
        Box::pin(ready(Ok(state.volumes.clone())))
    }

    fn get_volume<'a>(
        &'a self,
        volume_id: &'a str,
    ) -> BackendFuture<'a, NetworkVolume, Self::Error> {
        let state = self.record(format!("get_volume:{volume_id}"));
        let result = state
            .volumes
            .iter()
            .find(|volume| volume.id == volume_id)
            .cloned()
            .ok_or_else(|| ScriptedError::new(format!("volume {volume_id} not found")));
        Box::pin(ready(result))
    }

    fn create_volume<'a>(
        &'a self,
        request: &'a VolumeRequest,
    ) -> BackendFuture<'a, NetworkVolume, Self::Error> {
        let mut state = self.record(format!("create_volume:{}", request.name));
        let result = match request.validate() {
            Ok(()) => {
                let volume = NetworkVolume {
                    id: state.next_id("vol"),
                    name: request.name.clone(),
                    size_gb: request.size_gb,
                    data_center_id: request.data_center_id.clone(),
                    status: Some(String::from("READY")),
                };
                state.volumes.push(volume.clone());
                Ok(volume)
            }
            Err(err) => Err(ScriptedError::new(err.to_string())),
        };
        Box::pin(ready(result))
    }

    fn delete_volume<'a>(&'a self, volume_id: &'a str) -> BackendFuture<'a, (), Self::Error> {
        let mut state = self.record(format!("delete_volume:{volume_id}"));
        let result = if state.fail_volume_deletion {
            Err(ScriptedError::new("scripted volume deletion failure"))
        } else {
            state.volumes.retain(|volume| volume.id != volume_id);
            Ok(())
        };
        Box::pin(ready(result))
    }
}

/// Object transfer backed by `opendal`'s in-memory service.
///
/// Buckets are namespaced as key prefixes inside one shared store. Every
/// transfer is appended to the [`CallLog`] as `upload:<bucket>/<key>` or
/// `download:<bucket>/<key>`.
#[derive(Clone, Debug)]
pub struct MemoryTransfer {
    operator: Operator,
    log: CallLog,
    fail_uploads: Arc<StdMutex<bool>>,
    stall_downloads: Arc<StdMutex<bool>>,
}

impl Default for MemoryTransfer {
    fn default() -> Self {
        Self::with_log(CallLog::default())
    }
}

impl MemoryTransfer {
    /// Creates a store with its own log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that records into `log`.
    ///
    /// # Panics
    ///
    /// Panics if the in-memory service cannot be initialised.
    #[must_use]
    pub fn with_log(log: CallLog) -> Self {
        let operator = Operator::new(services::Memory::default())
            .map(|builder| builder.finish())
            .unwrap_or_else(|err| panic!("in-memory object store: {err}"));
        Self {
            operator,
            log,
            fail_uploads: Arc::default(),
            stall_downloads: Arc::default(),
        }
    }

    /// Makes every upload fail.
    pub fn fail_uploads(&self) {
        *locked(&self.fail_uploads) = true;
    }

    /// Makes every download write a few bytes and then never finish.
    pub fn stall_downloads(&self) {
        *locked(&self.stall_downloads) = true;
    }

    /// Stores `bytes` under `key` in `bucket`.
    ///
    /// # Panics
    ///
    /// Panics if the in-memory write fails.
    pub async fn seed(&self, bucket: &str, key: &str, bytes: &[u8]) {
        self.operator
            .write(&format!("{bucket}/{key}"), bytes.to_vec())
            .await
            .unwrap_or_else(|err| panic!("seed {bucket}/{key}: {err}"));
    }

    /// Returns whether `key` exists in `bucket`.
    pub async fn contains(&self, bucket: &str, key: &str) -> bool {
        self.operator
            .exists(&format!("{bucket}/{key}"))
            .await
            .unwrap_or(false)
    }
}

impl ObjectTransfer for MemoryTransfer {
    fn upload<'a>(
        &'a self,
        location: &'a StoreLocation,
        local: &'a Utf8Path,
        key: &'a str,
    ) -> BackendFuture<'a, u64, ObjectStoreError> {
        Box::pin(async move {
            let object = format!("{}/{key}", location.bucket);
            self.log.push(format!("upload:{object}"));
            if *locked(&self.fail_uploads) {
                return Err(ObjectStoreError::Upload {
                    key: key.to_owned(),
                    message: String::from("scripted upload failure"),
                });
            }
            upload_file(&self.operator, local, &object).await
        })
    }

    fn download<'a>(
        &'a self,
        location: &'a StoreLocation,
        key: &'a str,
        local: &'a Utf8Path,
    ) -> BackendFuture<'a, u64, ObjectStoreError> {
        Box::pin(async move {
            let object = format!("{}/{key}", location.bucket);
            self.log.push(format!("download:{object}"));
            if *locked(&self.stall_downloads) {
                write_then_stall(local).await;
            }
            download_file(&self.operator, &object, local).await
        })
    }
}

#[derive(Debug, Default)]
struct PredictorState {
    responses: VecDeque<Result<Prediction, ScriptedError>>,
    requests: Vec<(String, Value)>,
    fetched: Vec<String>,
    stall_fetches: bool,
}

/// Prediction service double.
///
/// Responses pop in FIFO order; an empty script succeeds with a single
/// output URL. Fetching writes `b"predicted output"` to the destination.
#[derive(Clone, Debug, Default)]
pub struct ScriptedPredictor {
    state: Arc<StdMutex<PredictorState>>,
}

impl ScriptedPredictor {
    /// Creates an empty double.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the next create-call result.
    pub fn push(&self, response: Result<Prediction, ScriptedError>) {
        locked(&self.state).responses.push_back(response);
    }

    /// Returns `(model_path, input)` for every create call.
    #[must_use]
    pub fn requests(&self) -> Vec<(String, Value)> {
        locked(&self.state).requests.clone()
    }

    /// Makes every fetch write a few bytes and then never finish.
    pub fn stall_fetches(&self) {
        locked(&self.state).stall_fetches = true;
    }

    /// Returns every URL fetched.
    #[must_use]
    pub fn fetched(&self) -> Vec<String> {
        locked(&self.state).fetched.clone()
    }
}

impl PredictionBackend for ScriptedPredictor {
    type Error = ScriptedError;

    fn predict<'a>(
        &'a self,
        model_path: &'a str,
        input: &'a Value,
    ) -> BackendFuture<'a, Prediction, Self::Error> {
        let mut state = locked(&self.state);
        state.requests.push((model_path.to_owned(), input.clone()));
        let result = state.responses.pop_front().unwrap_or_else(|| {
            Ok(
                Prediction::new("prediction-1", PredictionStatus::Succeeded, Duration::from_secs(2))
                    .with_output(Value::String(String::from("https://cdn.invalid/output.png"))),
            )
        });
        Box::pin(ready(result))
    }

    fn fetch<'a>(
        &'a self,
        url: &'a str,
        destination: &'a Utf8Path,
    ) -> BackendFuture<'a, u64, Self::Error> {
        let stall = {
            let mut state = locked(&self.state);
            state.fetched.push(url.to_owned());
            state.stall_fetches
        };
        if stall {
            return Box::pin(async move {
                write_then_stall(destination).await;
                Ok(0)
            });
        }
        let payload = b"predicted output";
        let result = std::fs::write(destination, payload)
            .map(|()| u64::try_from(payload.len()).unwrap_or(u64::MAX))
            .map_err(|err| ScriptedError::new(err.to_string()));
        Box::pin(ready(result))
    }
}

/// Leaves a partial file at `local` and waits forever, like a transfer that
/// hangs mid-stream.
async fn write_then_stall(local: &Utf8Path) {
    if let Err(err) = tokio::fs::write(local, b"partial").await {
        panic!("write partial {local}: {err}");
    }
    std::future::pending::<()>().await;
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }

    /// Removes variables for the guard's lifetime, restoring them on drop.
    pub async fn unset_vars(keys: &[&str]) -> Self {
        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(keys.len());
        for key in keys {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::remove_var(key) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
