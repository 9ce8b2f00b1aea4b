//! Configuration loading via `ortho-config`.

use std::env;

use crate::engine::EngineBinaries;
use crate::router::Provider;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Environment variable consulted when `runpod_api_key` is unset.
pub const RUNPOD_KEY_ENV: &str = "RUNPOD_API_KEY";
/// Environment variable consulted when `replicate_api_key` is unset.
pub const REPLICATE_KEY_ENV: &str = "REPLICATE_API_KEY";

/// Application configuration derived from defaults, configuration files and
/// environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "MEDIARELAY")]
pub struct AppConfig {
    /// Serverless compute credential. Falls back to `RUNPOD_API_KEY`.
    pub runpod_api_key: Option<String>,
    /// Prediction API credential. Falls back to `REPLICATE_API_KEY`.
    pub replicate_api_key: Option<String>,
    /// Compute class used when provisioning without `--gpu`.
    #[ortho_config(default = "NVIDIA RTX A4000".to_owned())]
    pub default_gpu: String,
    /// Data centre for new endpoints and volumes.
    #[ortho_config(default = "EU-RO-1".to_owned())]
    pub default_datacenter: String,
    /// Media engine binary.
    #[ortho_config(default = "ffmpeg".to_owned())]
    pub ffmpeg_bin: String,
    /// Media prober binary.
    #[ortho_config(default = "ffprobe".to_owned())]
    pub ffprobe_bin: String,
    /// Super-resolution binary.
    #[ortho_config(default = "realesrgan-ncnn-vulkan".to_owned())]
    pub upscaler_bin: String,
    /// Prefix applied to every endpoint and volume this tool creates.
    #[ortho_config(default = "mediarelay".to_owned())]
    pub endpoint_prefix: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to [{}] in mediarelay.toml",
            self.description, self.env_var, self.toml_key, self.section
        ))
    }
}

const RUNPOD_KEY: FieldMetadata = FieldMetadata::new(
    "serverless API key",
    RUNPOD_KEY_ENV,
    "runpod_api_key",
    "mediarelay",
);
const REPLICATE_KEY: FieldMetadata = FieldMetadata::new(
    "prediction API key",
    REPLICATE_KEY_ENV,
    "replicate_api_key",
    "mediarelay",
);

impl AppConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(metadata.missing());
        }
        Ok(())
    }

    fn credential(
        configured: Option<&str>,
        metadata: &FieldMetadata,
    ) -> Result<String, ConfigError> {
        configured
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
            .or_else(|| {
                env::var(metadata.env_var)
                    .ok()
                    .map(|value| value.trim().to_owned())
                    .filter(|value| !value.is_empty())
            })
            .ok_or_else(|| metadata.missing())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("mediarelay")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Resolves the serverless credential.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming `RUNPOD_API_KEY` and the
    /// TOML key when neither source provides a value.
    pub fn runpod_key(&self) -> Result<String, ConfigError> {
        Self::credential(self.runpod_api_key.as_deref(), &RUNPOD_KEY)
    }

    /// Resolves the prediction API credential.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when neither source provides a
    /// value.
    pub fn replicate_key(&self) -> Result<String, ConfigError> {
        Self::credential(self.replicate_api_key.as_deref(), &REPLICATE_KEY)
    }

    /// Binaries the local engine should invoke.
    #[must_use]
    pub fn engine_binaries(&self) -> EngineBinaries {
        EngineBinaries {
            ffmpeg: self.ffmpeg_bin.clone(),
            ffprobe: self.ffprobe_bin.clone(),
            upscaler: self.upscaler_bin.clone(),
        }
    }

    /// Checks the fields `provider` depends on so configuration problems are
    /// reported before any network call or subprocess.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for the first empty field.
    pub fn validate_for(&self, provider: Provider) -> Result<(), ConfigError> {
        Self::require_field(
            &self.endpoint_prefix,
            &FieldMetadata::new(
                "endpoint prefix",
                "MEDIARELAY_ENDPOINT_PREFIX",
                "endpoint_prefix",
                "mediarelay",
            ),
        )?;
        match provider {
            Provider::LocalCpu | Provider::LocalGpu => {
                Self::require_field(
                    &self.ffmpeg_bin,
                    &FieldMetadata::new(
                        "media engine binary",
                        "MEDIARELAY_FFMPEG_BIN",
                        "ffmpeg_bin",
                        "mediarelay",
                    ),
                )?;
                Self::require_field(
                    &self.upscaler_bin,
                    &FieldMetadata::new(
                        "upscaler binary",
                        "MEDIARELAY_UPSCALER_BIN",
                        "upscaler_bin",
                        "mediarelay",
                    ),
                )
            }
            Provider::RemoteServerless => {
                self.runpod_key()?;
                Self::require_field(
                    &self.default_datacenter,
                    &FieldMetadata::new(
                        "data centre",
                        "MEDIARELAY_DEFAULT_DATACENTER",
                        "default_datacenter",
                        "mediarelay",
                    ),
                )
            }
            Provider::RemotePrediction => self.replicate_key().map(drop),
        }
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// Raised when the provider cannot run the requested model or operation.
    #[error("unsupported combination: {0}")]
    Unsupported(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
