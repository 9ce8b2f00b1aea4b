//! Unit tests for the local engine.

use super::*;
use crate::operation::DenoisePreset;
use crate::test_support::ScriptedRunner;
use rstest::rstest;

fn engine(runner: &ScriptedRunner, platform: HostPlatform) -> LocalEngine<ScriptedRunner> {
    LocalEngine::new(runner.clone(), EngineBinaries::default()).with_platform(platform)
}

fn scale_op() -> Operation {
    Operation::new(
        Transform::Scale {
            width: 1280,
            height: 720,
        },
        "in.mp4",
        "out.mp4",
    )
}

fn probe_json(video_codec: &str, width: u32, audio_codec: &str, duration: &str) -> String {
    format!(
        concat!(
            "{{\"streams\":[",
            "{{\"codec_type\":\"video\",\"codec_name\":\"{}\",\"width\":{},\"height\":720}},",
            "{{\"codec_type\":\"audio\",\"codec_name\":\"{}\"}}",
            "],\"format\":{{\"duration\":\"{}\"}}}}"
        ),
        video_codec, width, audio_codec, duration
    )
}

#[test]
fn cpu_filter_invocation_has_no_acceleration_flags() {
    let runner = ScriptedRunner::new();
    let args = engine(&runner, HostPlatform::Other).ffmpeg_args(&scale_op(), Acceleration::Cpu);
    assert_eq!(
        args.join(" "),
        "-hide_banner -loglevel error -i in.mp4 \
         -vf scale=1280:720:force_original_aspect_ratio=decrease -y out.mp4"
    );
}

#[test]
fn gpu_on_linux_uses_cuda_and_npp_filters() {
    let runner = ScriptedRunner::new();
    let args = engine(&runner, HostPlatform::Other)
        .ffmpeg_args(&scale_op(), Acceleration::Gpu)
        .join(" ");
    assert!(
        args.contains("-hwaccel cuda -hwaccel_output_format cuda -i in.mp4"),
        "args: {args}"
    );
    assert!(args.contains("-vf scale_npp=1280:720"), "args: {args}");
    assert!(
        args.contains("-c:v h264_nvenc -preset p4 -tune hq"),
        "args: {args}"
    );
}

#[test]
fn gpu_on_macos_uses_videotoolbox_and_plain_filters() {
    let runner = ScriptedRunner::new();
    let args = engine(&runner, HostPlatform::MacOs)
        .ffmpeg_args(&scale_op(), Acceleration::Gpu)
        .join(" ");
    assert!(args.contains("-hwaccel videotoolbox -i in.mp4"), "args: {args}");
    assert!(args.contains("-vf scale=1280:720"), "args: {args}");
    assert!(args.contains("-c:v h264_videotoolbox"), "args: {args}");
}

#[test]
fn gpu_image_output_skips_video_encoder() {
    let runner = ScriptedRunner::new();
    let op = Operation::new(Transform::Denoise(DenoisePreset::Weak), "a.png", "b.png");
    let args = engine(&runner, HostPlatform::Other)
        .ffmpeg_args(&op, Acceleration::Gpu)
        .join(" ");
    assert!(!args.contains("nvenc"), "args: {args}");
}

#[rstest]
#[case(Acceleration::Cpu, HostPlatform::Other, "av1", "-preset 6 -c:v libsvtav1")]
#[case(Acceleration::Cpu, HostPlatform::MacOs, "hevc", "-c:v libx265")]
#[case(Acceleration::Gpu, HostPlatform::Other, "hevc", "-preset p4 -tune hq -c:v hevc_nvenc")]
#[case(Acceleration::Gpu, HostPlatform::MacOs, "h264", "-c:v h264_videotoolbox")]
#[case(Acceleration::Cpu, HostPlatform::Other, "prores_ks", "-c:v prores_ks")]
fn transcode_resolves_encoders(
    #[case] acceleration: Acceleration,
    #[case] platform: HostPlatform,
    #[case] codec: &str,
    #[case] expected: &str,
) {
    let runner = ScriptedRunner::new();
    let op = Operation::new(
        Transform::Transcode(TranscodeOptions {
            video_codec: Some(codec.to_owned()),
            crf: Some(28),
            ..TranscodeOptions::default()
        }),
        "in.mov",
        "out.mp4",
    );
    let args = engine(&runner, platform)
        .ffmpeg_args(&op, acceleration)
        .join(" ");
    assert!(args.contains(expected), "args: {args}");
    assert!(args.contains("-c:a copy -crf 28"), "args: {args}");
}

#[test]
fn transcode_defaults_to_stream_copy() {
    let runner = ScriptedRunner::new();
    let op = Operation::new(
        Transform::Transcode(TranscodeOptions::default()),
        "in.mkv",
        "out.mp4",
    );
    let args = engine(&runner, HostPlatform::Other)
        .ffmpeg_args(&op, Acceleration::Cpu)
        .join(" ");
    assert!(args.ends_with("-i in.mkv -c:v copy -c:a copy -y out.mp4"), "args: {args}");
}

#[test]
fn combine_places_framerate_before_input() {
    let runner = ScriptedRunner::new();
    let op = Operation::new(Transform::Combine { fps: 24 }, "frames/%05d.png", "out.mp4");
    let args = engine(&runner, HostPlatform::Other)
        .ffmpeg_args(&op, Acceleration::Cpu)
        .join(" ");
    assert!(
        args.contains("-framerate 24 -i frames/%05d.png -c:v libx264 -pix_fmt yuv420p"),
        "args: {args}"
    );
}

#[test]
fn stack_uses_filter_complex_over_both_inputs() {
    let runner = ScriptedRunner::new();
    let op = Operation::new(
        Transform::Stack {
            other: Utf8PathBuf::from("b.mp4"),
            axis: StackAxis::Horizontal,
        },
        "a.mp4",
        "out.mp4",
    );
    let args = engine(&runner, HostPlatform::Other)
        .ffmpeg_args(&op, Acceleration::Cpu)
        .join(" ");
    assert!(
        args.contains("-i a.mp4 -i b.mp4 -filter_complex [0:v][1:v]hstack=inputs=2[v] -map [v]"),
        "args: {args}"
    );
}

#[tokio::test]
async fn failed_run_removes_partial_output() {
    let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
        .unwrap_or_else(|path| panic!("non-UTF-8 tempdir {path:?}"));
    let destination = root.join("nested/out.mp4");
    let runner = ScriptedRunner::new();
    runner.push_failure(1);
    let op = Operation::new(Transform::Mute, root.join("in.mp4"), destination.clone());

    tokio::fs::create_dir_all(root.join("nested"))
        .await
        .unwrap_or_else(|err| panic!("mkdir: {err}"));
    tokio::fs::write(&destination, b"partial")
        .await
        .unwrap_or_else(|err| panic!("write: {err}"));

    let err = engine(&runner, HostPlatform::Other)
        .execute(&op, Acceleration::Cpu, &CancellationToken::new())
        .await
        .expect_err("scripted failure should surface");
    assert!(
        matches!(err, EngineError::Failed { ref status, acceleration: Acceleration::Cpu, .. } if status == "1"),
        "unexpected error: {err:?}"
    );
    assert!(!destination.exists(), "partial output should be removed");
}

#[tokio::test]
async fn execute_creates_destination_parent() {
    let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
        .unwrap_or_else(|path| panic!("non-UTF-8 tempdir {path:?}"));
    let runner = ScriptedRunner::new();
    runner.push_success();
    let op = Operation::new(Transform::Mute, root.join("in.mp4"), root.join("a/b/out.mp4"));

    engine(&runner, HostPlatform::Other)
        .execute(&op, Acceleration::Cpu, &CancellationToken::new())
        .await
        .unwrap_or_else(|err| panic!("execute should succeed: {err}"));
    assert!(root.join("a/b").is_dir());
}

#[tokio::test]
async fn upscale_invokes_upscaler_with_scale_and_format() {
    let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
        .unwrap_or_else(|path| panic!("non-UTF-8 tempdir {path:?}"));
    let runner = ScriptedRunner::new();
    runner.push_success();
    let op = Operation::new(
        Transform::Upscale { scale: 2 },
        root.join("in.jpg"),
        root.join("out.png"),
    );

    engine(&runner, HostPlatform::Other)
        .execute(&op, Acceleration::Gpu, &CancellationToken::new())
        .await
        .unwrap_or_else(|err| panic!("execute should succeed: {err}"));

    let calls = runner.invocations();
    let [call] = calls.as_slice() else {
        panic!("expected one invocation, got {calls:?}");
    };
    assert_eq!(call.program, DEFAULT_UPSCALER_BIN);
    assert!(
        call.command_string().ends_with("-s 2 -f png"),
        "command: {}",
        call.command_string()
    );
}

#[tokio::test]
async fn execute_rejects_invalid_parameters_before_running() {
    let runner = ScriptedRunner::new();
    let op = Operation::new(Transform::Upscale { scale: 9 }, "in.png", "out.png");
    let err = engine(&runner, HostPlatform::Other)
        .execute(&op, Acceleration::Cpu, &CancellationToken::new())
        .await
        .expect_err("scale 9 is out of range");
    assert!(matches!(err, EngineError::Operation(_)), "unexpected error: {err:?}");
    assert!(runner.invocations().is_empty());
}

#[tokio::test]
async fn concat_rejects_mismatched_codecs_before_joining() {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(0), probe_json("h264", 1280, "aac", "4.0"), "");
    runner.push_output(Some(0), probe_json("hevc", 1280, "aac", "4.0"), "");
    let op = Operation::new(
        Transform::Concat {
            rest: vec![Utf8PathBuf::from("b.mp4")],
        },
        "a.mp4",
        "joined.mp4",
    );

    let err = engine(&runner, HostPlatform::Other)
        .execute(&op, Acceleration::Cpu, &CancellationToken::new())
        .await
        .expect_err("codecs differ");
    assert!(matches!(err, EngineError::Incompatible(_)), "unexpected error: {err:?}");
    assert_eq!(runner.invocations().len(), 2, "only the probes should run");
}

#[tokio::test]
async fn concat_joins_compatible_inputs_through_list_file() {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(0), probe_json("h264", 1280, "aac", "4.0"), "");
    runner.push_output(Some(0), probe_json("h264", 1280, "aac", "6.0"), "");
    runner.push_success();
    let op = Operation::new(
        Transform::Concat {
            rest: vec![Utf8PathBuf::from("b.mp4")],
        },
        "a.mp4",
        "joined.mp4",
    );

    engine(&runner, HostPlatform::Other)
        .execute(&op, Acceleration::Cpu, &CancellationToken::new())
        .await
        .unwrap_or_else(|err| panic!("concat should succeed: {err}"));

    let calls = runner.invocations();
    let join = calls
        .last()
        .unwrap_or_else(|| panic!("expected a join invocation"))
        .command_string();
    assert!(join.contains("-f concat -safe 0 -i "), "command: {join}");
    assert!(join.ends_with("-c copy -y joined.mp4"), "command: {join}");
}

#[tokio::test]
async fn chunk_by_count_divides_probed_duration() {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(0), probe_json("h264", 1280, "aac", "10.0"), "");
    runner.push_success();
    let op = Operation::new(
        Transform::Chunk(ChunkSpec::Count(4)),
        "in.mp4",
        "part_%03d.mp4",
    );

    engine(&runner, HostPlatform::Other)
        .execute(&op, Acceleration::Cpu, &CancellationToken::new())
        .await
        .unwrap_or_else(|err| panic!("chunk should succeed: {err}"));

    let calls = runner.invocations();
    let split = calls
        .last()
        .unwrap_or_else(|| panic!("expected a split invocation"))
        .command_string();
    assert!(
        split.contains("-f segment -segment_time 2.500000 -reset_timestamps 1"),
        "command: {split}"
    );
}

#[test]
fn probe_duration_rejects_missing_value() {
    let probe = MediaProbe::parse(Utf8Path::new("a.mp4"), "{\"streams\":[]}")
        .unwrap_or_else(|err| panic!("parse: {err}"));
    let err = probe.duration().expect_err("no duration present");
    assert!(matches!(err, EngineError::Probe { .. }), "unexpected error: {err:?}");
}

#[tokio::test]
async fn process_runner_honours_cancelled_token() {
    let token = CancellationToken::new();
    token.cancel();
    let err = ProcessRunner
        .run("sleep", &[String::from("5")], &token)
        .await
        .expect_err("cancelled before start");
    assert!(matches!(err, EngineError::Cancelled), "unexpected error: {err:?}");
}

#[tokio::test]
async fn process_runner_reports_missing_program() {
    let err = ProcessRunner
        .run(
            "mediarelay-definitely-missing-binary",
            &[],
            &CancellationToken::new(),
        )
        .await
        .expect_err("program does not exist");
    assert!(matches!(err, EngineError::Spawn { .. }), "unexpected error: {err:?}");
}
