//! Hosted prediction API used as an alternative remote upscaler.
//!
//! A prediction is created with the image inlined as a data URI and the
//! service asked to hold the response until the model finishes. There is no
//! polling: anything other than a terminal status in that single response is
//! an error. The output is a URL which is streamed to disk.

use std::sync::LazyLock;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use camino::Utf8Path;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::BackendFuture;
use crate::cancel::cancellable;
use crate::config::AppConfig;
use crate::endpoint::DEFAULT_IMAGE_MODEL;
use crate::media;
use crate::object_store::discard_partial;

const API_BASE: &str = "https://api.replicate.com/v1/models";
/// Model path used for the default image model.
pub const DEFAULT_MODEL_PATH: &str = "nightmareai/real-esrgan";
/// Upper bound on the held-open create call.
const HTTP_TIMEOUT: Duration = Duration::from_secs(120);
/// Upper bound on streaming an output file, which can dwarf the create call.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Terminal and non-terminal prediction states.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum PredictionStatus {
    /// Waiting for a worker.
    Starting,
    /// Running.
    Processing,
    /// Finished with output.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Cancelled by the owner.
    Canceled,
}

impl PredictionStatus {
    /// Lower-case wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
struct PredictionMetrics {
    #[serde(default)]
    predict_time: f64,
}

/// Prediction as returned by the create call.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Prediction {
    /// Service identifier.
    pub id: String,
    /// Latest status.
    pub status: PredictionStatus,
    /// Model output: a URL or a list of URLs.
    #[serde(default)]
    pub output: Option<Value>,
    /// Error message for failed predictions.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    metrics: PredictionMetrics,
}

impl Prediction {
    /// Builds a prediction value, mainly for doubles.
    #[must_use]
    pub fn new(id: impl Into<String>, status: PredictionStatus, predict_time: Duration) -> Self {
        Self {
            id: id.into(),
            status,
            output: None,
            error: None,
            metrics: PredictionMetrics {
                predict_time: predict_time.as_secs_f64(),
            },
        }
    }

    /// Sets the output payload.
    #[must_use]
    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    /// Sets the error message.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// First output URL: the output itself when it is a string, else the
    /// first element of an array.
    #[must_use]
    pub fn output_url(&self) -> Option<&str> {
        let url = match self.output.as_ref()? {
            Value::String(url) => Some(url.as_str()),
            Value::Array(items) => items.first()?.as_str(),
            _ => None,
        };
        url.filter(|candidate| !candidate.is_empty())
    }

    /// Billable model time reported by the service.
    #[must_use]
    pub fn predict_time(&self) -> Duration {
        Duration::try_from_secs_f64(self.metrics.predict_time).unwrap_or(Duration::ZERO)
    }
}

/// Errors raised by the prediction HTTP client.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PredictionError {
    /// Raised when the credential is missing.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when the request cannot be sent or the body read.
    #[error("request to {url} failed: {message}")]
    Transport {
        /// Target URL.
        url: String,
        /// Transport error message.
        message: String,
    },
    /// Raised for an unexpected HTTP status.
    #[error("prediction API returned status {status}: {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },
    /// Raised when the response cannot be parsed.
    #[error("failed to parse prediction response: {0}")]
    Decode(String),
    /// Raised when the downloaded output cannot be written.
    #[error("failed to write {path}: {message}")]
    Io {
        /// Destination path.
        path: String,
        /// Underlying error message.
        message: String,
    },
}

/// Operations required from a prediction service.
pub trait PredictionBackend: Send + Sync {
    /// Provider specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Creates a prediction for `model_path` and waits for it to finish.
    fn predict<'a>(
        &'a self,
        model_path: &'a str,
        input: &'a Value,
    ) -> BackendFuture<'a, Prediction, Self::Error>;

    /// Streams `url` into `destination`, returning the bytes written.
    fn fetch<'a>(
        &'a self,
        url: &'a str,
        destination: &'a Utf8Path,
    ) -> BackendFuture<'a, u64, Self::Error>;
}

/// HTTP client for the hosted prediction API.
#[derive(Clone)]
pub struct ReplicateClient {
    api_key: String,
}

impl std::fmt::Debug for ReplicateClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicateClient")
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl ReplicateClient {
    /// Creates a client authenticating with `key`.
    ///
    /// # Errors
    ///
    /// Returns [`PredictionError::Config`] when the key is blank.
    pub fn new(key: impl Into<String>) -> Result<Self, PredictionError> {
        let api_key = key.into().trim().to_owned();
        if api_key.is_empty() {
            return Err(PredictionError::Config(String::from(
                "prediction API key must not be empty",
            )));
        }
        Ok(Self { api_key })
    }

    /// Creates a client from the resolved configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PredictionError::Config`] when no credential is configured.
    pub fn from_config(config: &AppConfig) -> Result<Self, PredictionError> {
        let key = config
            .replicate_key()
            .map_err(|err| PredictionError::Config(err.to_string()))?;
        Self::new(key)
    }

    async fn write_body(
        mut response: reqwest::Response,
        url: &str,
        destination: &Utf8Path,
    ) -> Result<u64, PredictionError> {
        let io_error = |err: std::io::Error| PredictionError::Io {
            path: destination.to_string(),
            message: err.to_string(),
        };
        if let Some(parent) = destination.parent().filter(|dir| !dir.as_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        let mut file = fs::File::create(destination).await.map_err(io_error)?;
        let mut written = 0_u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|err| PredictionError::Transport {
                url: url.to_owned(),
                message: err.to_string(),
            })?
        {
            file.write_all(&chunk).await.map_err(io_error)?;
            written = written.saturating_add(u64::try_from(chunk.len()).unwrap_or(u64::MAX));
        }
        file.flush().await.map_err(io_error)?;
        Ok(written)
    }
}

impl PredictionBackend for ReplicateClient {
    type Error = PredictionError;

    fn predict<'a>(
        &'a self,
        model_path: &'a str,
        input: &'a Value,
    ) -> BackendFuture<'a, Prediction, Self::Error> {
        Box::pin(async move {
            let url = format!("{API_BASE}/{model_path}/predictions");
            let transport = |err: reqwest::Error| PredictionError::Transport {
                url: url.clone(),
                message: err.to_string(),
            };
            let response = HTTP_CLIENT
                .post(&url)
                .header("Authorization", format!("Token {}", self.api_key))
                .header("Prefer", "wait")
                .json(&json!({ "input": input }))
                .send()
                .await
                .map_err(transport)?;
            let status = response.status();
            let body = response.bytes().await.map_err(transport)?;
            debug!(status = status.as_u16(), "prediction API responded");
            if !status.is_success() {
                return Err(PredictionError::Api {
                    status: status.as_u16(),
                    body: String::from_utf8_lossy(&body).into_owned(),
                });
            }
            serde_json::from_slice(&body).map_err(|err| PredictionError::Decode(err.to_string()))
        })
    }

    fn fetch<'a>(
        &'a self,
        url: &'a str,
        destination: &'a Utf8Path,
    ) -> BackendFuture<'a, u64, Self::Error> {
        Box::pin(async move {
            let response = download_request(url)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|err| PredictionError::Transport {
                    url: url.to_owned(),
                    message: err.to_string(),
                })?;
            let result = Self::write_body(response, url, destination).await;
            if result.is_err() {
                discard_partial(destination).await;
            }
            result
        })
    }
}

fn download_request(url: &str) -> reqwest::RequestBuilder {
    HTTP_CLIENT.get(url).timeout(DOWNLOAD_TIMEOUT)
}

/// Maps a model name to the service's `owner/name` path.
///
/// # Errors
///
/// Returns a message naming the model when it is neither the default image
/// model nor an explicit `owner/name` path.
pub fn model_path(model: &str) -> Result<String, String> {
    match model {
        "" | DEFAULT_IMAGE_MODEL => Ok(DEFAULT_MODEL_PATH.to_owned()),
        explicit if explicit.contains('/') => Ok(explicit.to_owned()),
        other => Err(format!(
            "model '{other}' is not available on the prediction API; use '{DEFAULT_IMAGE_MODEL}' or an owner/name path"
        )),
    }
}

/// Encodes `bytes` as a data URI with the MIME type implied by `ext`.
#[must_use]
pub fn data_uri(ext: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", media::image_mime(ext), STANDARD.encode(bytes))
}

/// Result of a completed upscale prediction.
#[derive(Clone, Debug, PartialEq)]
pub struct PredictionOutcome {
    /// Service identifier.
    pub prediction_id: String,
    /// Billable model time.
    pub predict_time: Duration,
    /// Bytes written to the destination.
    pub bytes_written: u64,
}

/// Errors raised while running an upscale prediction.
#[derive(Debug, Error)]
pub enum UpscaleError<E>
where
    E: std::error::Error + 'static,
{
    /// Raised when the input cannot be read.
    #[error("failed to read {path}: {message}")]
    Input {
        /// Input path.
        path: String,
        /// Underlying error message.
        message: String,
    },
    /// Raised when the create call fails.
    #[error("prediction request failed: {0}")]
    Request(#[source] E),
    /// Raised when the service reports failure.
    #[error("prediction {id} failed: {message}")]
    Failed {
        /// Service identifier.
        id: String,
        /// Service error message, passed through verbatim.
        message: String,
    },
    /// Raised when the held-open call returns before a terminal status.
    #[error("prediction {id} did not finish in time (status: {status})")]
    Incomplete {
        /// Service identifier.
        id: String,
        /// Last reported status.
        status: &'static str,
    },
    /// Raised when a successful prediction carries no URL.
    #[error("prediction {0} returned no output URL")]
    NoOutput(String),
    /// Raised when the output cannot be downloaded.
    #[error("failed to download prediction output: {0}")]
    Download(#[source] E),
    /// Raised when the caller cancels.
    #[error("prediction cancelled")]
    Cancelled,
}

/// Runs upscale predictions against a [`PredictionBackend`].
#[derive(Clone, Debug)]
pub struct PredictionUpscaler<P> {
    backend: P,
}

impl<P: PredictionBackend> PredictionUpscaler<P> {
    /// Wraps `backend`.
    #[must_use]
    pub const fn new(backend: P) -> Self {
        Self { backend }
    }

    /// Upscales `input` by `scale` with `model_path`, writing `output`.
    ///
    /// # Errors
    ///
    /// Returns an [`UpscaleError`] describing the first failing step.
    pub async fn upscale(
        &self,
        model_path: &str,
        input: &Utf8Path,
        output: &Utf8Path,
        scale: u32,
        cancel: &CancellationToken,
    ) -> Result<PredictionOutcome, UpscaleError<P::Error>> {
        let bytes = fs::read(input).await.map_err(|err| UpscaleError::Input {
            path: input.to_string(),
            message: err.to_string(),
        })?;
        let ext = media::extension_lowercase(input).unwrap_or_default();
        let request = json!({
            "image": data_uri(&ext, &bytes),
            "scale": scale,
        });

        let prediction = cancellable(
            cancel,
            async {
                self.backend
                    .predict(model_path, &request)
                    .await
                    .map_err(UpscaleError::Request)
            },
            || UpscaleError::Cancelled,
        )
        .await?;
        match prediction.status {
            PredictionStatus::Succeeded => {}
            PredictionStatus::Failed | PredictionStatus::Canceled => {
                return Err(UpscaleError::Failed {
                    message: prediction
                        .error
                        .clone()
                        .filter(|message| !message.is_empty())
                        .unwrap_or_else(|| String::from("unknown error")),
                    id: prediction.id,
                });
            }
            other => {
                return Err(UpscaleError::Incomplete {
                    id: prediction.id,
                    status: other.as_str(),
                });
            }
        }
        let url = prediction
            .output_url()
            .ok_or_else(|| UpscaleError::NoOutput(prediction.id.clone()))?;

        let fetched = cancellable(
            cancel,
            async {
                self.backend
                    .fetch(url, output)
                    .await
                    .map_err(UpscaleError::Download)
            },
            || UpscaleError::Cancelled,
        )
        .await;
        let bytes_written = match fetched {
            Ok(bytes_written) => bytes_written,
            Err(err) => {
                discard_partial(output).await;
                return Err(err);
            }
        };
        info!(prediction_id = %prediction.id, bytes = bytes_written, "prediction output saved");
        Ok(PredictionOutcome {
            predict_time: prediction.predict_time(),
            prediction_id: prediction.id,
            bytes_written,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedPredictor;
    use rstest::rstest;

    #[rstest]
    #[case(json!("https://cdn.example/out.png"), Some("https://cdn.example/out.png"))]
    #[case(json!(["https://cdn.example/a.png", "https://cdn.example/b.png"]), Some("https://cdn.example/a.png"))]
    #[case(json!([]), None)]
    #[case(json!({"url": "x"}), None)]
    fn output_url_accepts_string_or_list(#[case] output: Value, #[case] expected: Option<&str>) {
        let prediction = Prediction::new("p-1", PredictionStatus::Succeeded, Duration::ZERO)
            .with_output(output);
        assert_eq!(prediction.output_url(), expected);
    }

    #[rstest]
    #[case("", DEFAULT_MODEL_PATH)]
    #[case("real-esrgan", DEFAULT_MODEL_PATH)]
    #[case("owner/custom", "owner/custom")]
    fn model_paths_resolve(#[case] model: &str, #[case] expected: &str) {
        assert_eq!(model_path(model).ok().as_deref(), Some(expected));
    }

    #[test]
    fn unknown_bare_model_is_rejected() {
        let err = model_path("gfpgan").expect_err("bare names are not routable");
        assert!(err.contains("gfpgan"), "unexpected message: {err}");
    }

    #[test]
    fn output_download_outlives_create_timeout() {
        let request = download_request("https://cdn.example/out.png")
            .build()
            .unwrap_or_else(|err| panic!("build request: {err}"));
        assert_eq!(request.timeout(), Some(&DOWNLOAD_TIMEOUT));
        assert!(DOWNLOAD_TIMEOUT > HTTP_TIMEOUT);
    }

    #[test]
    fn data_uri_carries_mime_type() {
        assert_eq!(data_uri("JPG", b"hi"), "data:image/jpeg;base64,aGk=");
    }

    #[test]
    fn decodes_service_response() {
        let prediction: Prediction = serde_json::from_value(json!({
            "id": "abc",
            "status": "succeeded",
            "output": "https://cdn.example/out.png",
            "metrics": {"predict_time": 1.5}
        }))
        .unwrap_or_else(|err| panic!("decode: {err}"));
        assert_eq!(prediction.predict_time(), Duration::from_millis(1500));
        assert_eq!(prediction.status, PredictionStatus::Succeeded);
    }

    #[tokio::test]
    async fn upscale_sends_data_uri_and_downloads_output() {
        let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("temp dir: {err}"));
        let root = Utf8Path::from_path(dir.path()).unwrap_or_else(|| panic!("utf8 temp dir"));
        let input = root.join("photo.jpg");
        std::fs::write(&input, b"hi").unwrap_or_else(|err| panic!("write input: {err}"));
        let predictor = ScriptedPredictor::new();
        predictor.push(Ok(Prediction::new(
            "p-1",
            PredictionStatus::Succeeded,
            Duration::from_secs(3),
        )
        .with_output(json!(["https://cdn.example/out.png"]))));

        let outcome = PredictionUpscaler::new(predictor.clone())
            .upscale(
                DEFAULT_MODEL_PATH,
                &input,
                &root.join("photo_out.png"),
                4,
                &CancellationToken::new(),
            )
            .await
            .unwrap_or_else(|err| panic!("upscale should succeed: {err}"));

        assert_eq!(outcome.predict_time, Duration::from_secs(3));
        assert_eq!(
            predictor.requests(),
            vec![(
                String::from(DEFAULT_MODEL_PATH),
                json!({"image": "data:image/jpeg;base64,aGk=", "scale": 4})
            )]
        );
        assert_eq!(predictor.fetched(), vec![String::from("https://cdn.example/out.png")]);
        assert!(root.join("photo_out.png").exists());
    }

    #[tokio::test]
    async fn failed_prediction_passes_message_through() {
        let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("temp dir: {err}"));
        let root = Utf8Path::from_path(dir.path()).unwrap_or_else(|| panic!("utf8 temp dir"));
        let input = root.join("photo.png");
        std::fs::write(&input, b"x").unwrap_or_else(|err| panic!("write input: {err}"));
        let predictor = ScriptedPredictor::new();
        predictor.push(Ok(Prediction::new("p-2", PredictionStatus::Failed, Duration::ZERO)
            .with_error("image too large")));

        let err = PredictionUpscaler::new(predictor.clone())
            .upscale(DEFAULT_MODEL_PATH, &input, &root.join("o.png"), 2, &CancellationToken::new())
            .await
            .expect_err("failed prediction");
        assert_eq!(err.to_string(), "prediction p-2 failed: image too large");
        assert!(predictor.fetched().is_empty());
    }

    #[tokio::test]
    async fn unfinished_prediction_is_incomplete() {
        let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("temp dir: {err}"));
        let root = Utf8Path::from_path(dir.path()).unwrap_or_else(|| panic!("utf8 temp dir"));
        let input = root.join("photo.png");
        std::fs::write(&input, b"x").unwrap_or_else(|err| panic!("write input: {err}"));
        let predictor = ScriptedPredictor::new();
        predictor.push(Ok(Prediction::new("p-3", PredictionStatus::Processing, Duration::ZERO)));

        let err = PredictionUpscaler::new(predictor)
            .upscale(DEFAULT_MODEL_PATH, &input, &root.join("o.png"), 2, &CancellationToken::new())
            .await
            .expect_err("still processing");
        assert!(
            matches!(err, UpscaleError::Incomplete { status: "processing", .. }),
            "unexpected: {err:?}"
        );
    }

    #[tokio::test]
    async fn cancelled_download_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("temp dir: {err}"));
        let root = Utf8Path::from_path(dir.path()).unwrap_or_else(|| panic!("utf8 temp dir"));
        let input = root.join("photo.png");
        let output = root.join("photo_out.png");
        std::fs::write(&input, b"x").unwrap_or_else(|err| panic!("write input: {err}"));
        let predictor = ScriptedPredictor::new();
        predictor.stall_fetches();
        let cancel = CancellationToken::new();
        let canceller = tokio::spawn({
            let cancel = cancel.clone();
            let output = output.clone();
            async move {
                while !output.exists() {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                cancel.cancel();
            }
        });

        let err = PredictionUpscaler::new(predictor)
            .upscale(DEFAULT_MODEL_PATH, &input, &output, 2, &cancel)
            .await
            .expect_err("cancelled mid-download");
        canceller
            .await
            .unwrap_or_else(|err| panic!("canceller task: {err}"));

        assert!(matches!(err, UpscaleError::Cancelled), "unexpected: {err:?}");
        assert!(!output.exists());
    }

    #[test]
    fn blank_key_is_rejected() {
        let err = ReplicateClient::new("  ").expect_err("blank key");
        assert!(matches!(err, PredictionError::Config(_)));
    }
}
