//! Configuration loading and per-provider validation.

use mediarelay::config::{AppConfig, ConfigError, REPLICATE_KEY_ENV, RUNPOD_KEY_ENV};
use mediarelay::router::Provider;
use mediarelay::test_support::EnvGuard;
use rstest::*;

#[fixture]
fn base_config() -> AppConfig {
    AppConfig {
        runpod_api_key: None,
        replicate_api_key: None,
        default_gpu: String::from("NVIDIA RTX A4000"),
        default_datacenter: String::from("EU-RO-1"),
        ffmpeg_bin: String::from("ffmpeg"),
        ffprobe_bin: String::from("ffprobe"),
        upscaler_bin: String::from("realesrgan-ncnn-vulkan"),
        endpoint_prefix: String::from("mediarelay"),
    }
}

fn assert_actionable(error: &ConfigError, env_var: &str, toml_key: &str) {
    let ConfigError::MissingField(message) = error else {
        panic!("expected MissingField error, got {error:?}");
    };
    assert!(message.contains(env_var), "error should mention {env_var}: {message}");
    assert!(message.contains(toml_key), "error should mention {toml_key}: {message}");
    assert!(
        message.contains("mediarelay.toml"),
        "error should mention the config file: {message}"
    );
}

#[rstest]
#[tokio::test]
async fn serverless_without_credential_names_env_and_key(base_config: AppConfig) {
    let _guard = EnvGuard::unset_vars(&[RUNPOD_KEY_ENV]).await;

    let error = base_config
        .validate_for(Provider::RemoteServerless)
        .expect_err("credential is required");

    assert_actionable(&error, RUNPOD_KEY_ENV, "runpod_api_key");
}

#[rstest]
#[tokio::test]
async fn prediction_without_credential_names_env_and_key(base_config: AppConfig) {
    let _guard = EnvGuard::unset_vars(&[REPLICATE_KEY_ENV]).await;

    let error = base_config
        .validate_for(Provider::RemotePrediction)
        .expect_err("credential is required");

    assert_actionable(&error, REPLICATE_KEY_ENV, "replicate_api_key");
}

#[rstest]
#[tokio::test]
async fn credential_falls_back_to_provider_env(base_config: AppConfig) {
    let _guard = EnvGuard::set_vars(&[(RUNPOD_KEY_ENV, "  rp-key  ")]).await;

    assert_eq!(
        base_config
            .runpod_key()
            .unwrap_or_else(|err| panic!("env key: {err}")),
        "rp-key"
    );
    assert!(base_config.validate_for(Provider::RemoteServerless).is_ok());
}

#[rstest]
#[tokio::test]
async fn configured_credential_wins_over_env(base_config: AppConfig) {
    let _guard = EnvGuard::set_vars(&[(REPLICATE_KEY_ENV, "from-env")]).await;
    let config = AppConfig {
        replicate_api_key: Some(String::from("from-file")),
        ..base_config
    };

    assert_eq!(
        config
            .replicate_key()
            .unwrap_or_else(|err| panic!("configured key: {err}")),
        "from-file"
    );
}

#[rstest]
#[tokio::test]
async fn blank_configured_credential_is_ignored(base_config: AppConfig) {
    let _guard = EnvGuard::unset_vars(&[RUNPOD_KEY_ENV]).await;
    let config = AppConfig {
        runpod_api_key: Some(String::from("   ")),
        ..base_config
    };

    assert!(matches!(
        config.runpod_key(),
        Err(ConfigError::MissingField(_))
    ));
}

#[rstest]
fn local_providers_need_no_credentials(base_config: AppConfig) {
    assert!(base_config.validate_for(Provider::LocalCpu).is_ok());
    assert!(base_config.validate_for(Provider::LocalGpu).is_ok());
}

#[rstest]
#[case::prefix(|cfg: &mut AppConfig| cfg.endpoint_prefix.clear(), "MEDIARELAY_ENDPOINT_PREFIX", "endpoint_prefix")]
#[case::engine(|cfg: &mut AppConfig| cfg.ffmpeg_bin = String::from(" "), "MEDIARELAY_FFMPEG_BIN", "ffmpeg_bin")]
#[case::upscaler(|cfg: &mut AppConfig| cfg.upscaler_bin.clear(), "MEDIARELAY_UPSCALER_BIN", "upscaler_bin")]
fn local_validation_reports_empty_fields(
    base_config: AppConfig,
    #[case] mutate: fn(&mut AppConfig),
    #[case] env_var: &str,
    #[case] toml_key: &str,
) {
    let mut config = base_config;
    mutate(&mut config);

    let error = config
        .validate_for(Provider::LocalCpu)
        .expect_err("empty field should fail");

    assert_actionable(&error, env_var, toml_key);
}

#[rstest]
#[tokio::test]
async fn empty_datacenter_fails_serverless_validation(base_config: AppConfig) {
    let config = AppConfig {
        runpod_api_key: Some(String::from("rp-key")),
        default_datacenter: String::new(),
        ..base_config
    };

    let error = config
        .validate_for(Provider::RemoteServerless)
        .expect_err("data centre is required");

    assert_actionable(&error, "MEDIARELAY_DEFAULT_DATACENTER", "default_datacenter");
}

#[tokio::test]
async fn environment_overrides_defaults() {
    let _guard = EnvGuard::set_vars(&[
        ("MEDIARELAY_DEFAULT_DATACENTER", "US-TX-3"),
        ("MEDIARELAY_ENDPOINT_PREFIX", "studio"),
    ])
    .await;

    let config = AppConfig::load_without_cli_args()
        .unwrap_or_else(|err| panic!("config should load: {err}"));

    assert_eq!(config.default_datacenter, "US-TX-3");
    assert_eq!(config.endpoint_prefix, "studio");
    assert_eq!(config.default_gpu, "NVIDIA RTX A4000");
}

#[rstest]
fn engine_binaries_follow_configuration(base_config: AppConfig) {
    let config = AppConfig {
        ffmpeg_bin: String::from("/opt/ffmpeg/bin/ffmpeg"),
        ..base_config
    };

    let binaries = config.engine_binaries();

    assert_eq!(binaries.ffmpeg, "/opt/ffmpeg/bin/ffmpeg");
    assert_eq!(binaries.upscaler, "realesrgan-ncnn-vulkan");
}
