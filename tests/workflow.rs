//! Stage ordering and cleanup behaviour of the volume workflow.

#[path = "common/constants.rs"]
mod constants;
#[path = "workflow/test_doubles.rs"]
mod test_doubles;

use std::time::Duration;

use mediarelay::backend::{Job, JobStatus};
use mediarelay::test_support::ScriptedCompute;
use mediarelay::workflow::{VolumeRef, WorkflowError};
use rstest::rstest;
use serde_json::json;
use tempfile::TempDir;
use test_doubles::{
    doubles, endpoint_with_volume, input_job, position, settings, sized, volume, workflow,
};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn fresh_volume_runs_stages_in_order_and_is_deleted() {
    let compute = ScriptedCompute::new();
    let (transfer, log) = doubles(&compute);
    transfer.seed("vol-1", "out_clip.mp4", b"processed").await;
    let dir = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
    let job = input_job(&dir);

    let mut stages = Vec::new();
    let outcome = workflow(&compute, &transfer)
        .run(
            &job,
            &settings(sized(20)),
            &mut |stage, _| stages.push(stage.to_owned()),
            &CancellationToken::new(),
        )
        .await
        .unwrap_or_else(|err| panic!("workflow should succeed: {err}"));

    assert_eq!(outcome.volume_id, "vol-1");
    assert_eq!(outcome.bytes_uploaded, 16);
    assert_eq!(outcome.bytes_downloaded, 9);
    let create = position(&log, "create_volume:");
    let region = position(&log, "get_volume:vol-1");
    let upload = position(&log, "upload:vol-1/clip.mov");
    let endpoint = position(&log, "create_endpoint:");
    let run = position(&log, "run_sync:");
    let download = position(&log, "download:vol-1/out_clip.mp4");
    let delete = position(&log, "delete_volume:vol-1");
    assert!(create < region && region < upload, "log: {:?}", log.entries());
    assert!(upload < endpoint && endpoint < run, "log: {:?}", log.entries());
    assert!(run < download && download < delete, "log: {:?}", log.entries());
    assert_eq!(
        stages,
        vec![
            "resolve_volume",
            "resolve_region",
            "upload",
            "resolve_endpoint",
            "queued",
            "completed",
            "submit",
            "download",
            "cleanup"
        ]
    );
    let written = std::fs::read(&job.output).unwrap_or_else(|err| panic!("read output: {err}"));
    assert_eq!(written, b"processed");
}

#[tokio::test]
async fn job_input_references_mounted_paths() {
    let compute = ScriptedCompute::new().with_volume(volume("vol-a"));
    let (transfer, _) = doubles(&compute);
    transfer.seed("vol-a", "out_clip.mp4", b"x").await;
    let dir = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
    let explicit = VolumeRef {
        id: Some(String::from("vol-a")),
        ..VolumeRef::default()
    };

    let outcome = workflow(&compute, &transfer)
        .run(
            &input_job(&dir),
            &settings(explicit),
            &mut |_, _| {},
            &CancellationToken::new(),
        )
        .await
        .unwrap_or_else(|err| panic!("workflow should succeed: {err}"));

    assert_eq!(
        compute.inputs(),
        vec![json!({
            "input_path": "/runpod-volume/clip.mov",
            "output_path": "/runpod-volume/out_clip.mp4",
            "ffmpeg_args": "-vf,hflip"
        })]
    );
    assert_eq!(outcome.endpoint.volume_ids, vec![String::from("vol-a")]);
    assert!(
        !compute.calls().iter().any(|call| call.starts_with("delete_volume")),
        "explicit volumes are never deleted: {:?}",
        compute.calls()
    );
}

#[tokio::test]
async fn volume_is_discovered_from_existing_endpoint() {
    let compute = ScriptedCompute::new()
        .with_volume(volume("vol-attached"))
        .with_endpoint(endpoint_with_volume("ep-existing", "vol-attached"));
    let (transfer, log) = doubles(&compute);
    transfer.seed("vol-attached", "out_clip.mp4", b"x").await;
    let dir = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
    let discover = VolumeRef {
        auto_discover: true,
        ..VolumeRef::default()
    };

    let outcome = workflow(&compute, &transfer)
        .run(
            &input_job(&dir),
            &settings(discover),
            &mut |_, _| {},
            &CancellationToken::new(),
        )
        .await
        .unwrap_or_else(|err| panic!("workflow should succeed: {err}"));

    assert_eq!(outcome.volume_id, "vol-attached");
    assert_eq!(outcome.endpoint.id, "ep-existing");
    assert!(log.position("create_volume").is_none());
    assert!(log.position("create_endpoint").is_none());
}

#[tokio::test]
async fn missing_volume_source_is_rejected() {
    let compute = ScriptedCompute::new();
    let (transfer, log) = doubles(&compute);
    let dir = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
    let discover = VolumeRef {
        auto_discover: true,
        ..VolumeRef::default()
    };

    let err = workflow(&compute, &transfer)
        .run(
            &input_job(&dir),
            &settings(discover),
            &mut |_, _| {},
            &CancellationToken::new(),
        )
        .await
        .expect_err("nothing to stage on");
    assert!(matches!(err, WorkflowError::NoVolume { .. }), "unexpected: {err:?}");
    assert!(log.position("upload").is_none());
}

#[tokio::test]
async fn upload_failure_aborts_before_endpoint_resolution() {
    let compute = ScriptedCompute::new();
    let (transfer, log) = doubles(&compute);
    transfer.fail_uploads();
    let dir = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));

    let err = workflow(&compute, &transfer)
        .run(
            &input_job(&dir),
            &settings(sized(20)),
            &mut |_, _| {},
            &CancellationToken::new(),
        )
        .await
        .expect_err("upload fails");

    assert!(matches!(err, WorkflowError::Transfer(_)), "unexpected: {err:?}");
    assert!(log.position("create_endpoint").is_none(), "log: {:?}", log.entries());
    assert!(log.position("run_sync").is_none());
    assert!(log.position("delete_volume:vol-1").is_some());
}

#[rstest]
#[case::kept(true, false)]
#[case::removed(false, true)]
#[tokio::test]
async fn failed_job_cleanup_honours_keep_on_failure(
    #[case] keep_on_failure: bool,
    #[case] expect_delete: bool,
) {
    let compute = ScriptedCompute::new();
    compute.push_sync(Ok(Job {
        error: Some(String::from("encoder crashed")),
        ..Job::pending("job-x", JobStatus::Failed)
    }));
    let (transfer, log) = doubles(&compute);
    let dir = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
    let mut run_settings = settings(sized(20));
    run_settings.keep_on_failure = keep_on_failure;

    let err = workflow(&compute, &transfer)
        .run(
            &input_job(&dir),
            &run_settings,
            &mut |_, _| {},
            &CancellationToken::new(),
        )
        .await
        .expect_err("job fails");

    assert_eq!(err.to_string(), "job job-x failed: encoder crashed");
    assert_eq!(log.position("delete_volume").is_some(), expect_delete);
    assert!(log.position("download").is_none());
}

#[tokio::test]
async fn cleanup_failure_does_not_change_success() {
    let compute = ScriptedCompute::new();
    compute.fail_volume_deletion();
    let (transfer, log) = doubles(&compute);
    transfer.seed("vol-1", "out_clip.mp4", b"ok").await;
    let dir = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));

    let outcome = workflow(&compute, &transfer)
        .run(
            &input_job(&dir),
            &settings(sized(20)),
            &mut |_, _| {},
            &CancellationToken::new(),
        )
        .await;

    assert!(outcome.is_ok(), "cleanup errors are only logged: {outcome:?}");
    assert!(log.position("delete_volume:vol-1").is_some());
}

#[tokio::test]
async fn output_path_reported_by_job_is_downloaded() {
    let compute = ScriptedCompute::new();
    compute.push_sync(Ok(Job {
        output: Some(json!({"output_path": "/runpod-volume/renamed.mp4"})),
        ..Job::pending("job-y", JobStatus::Completed)
    }));
    let (transfer, log) = doubles(&compute);
    transfer.seed("vol-1", "renamed.mp4", b"renamed").await;
    let dir = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));

    workflow(&compute, &transfer)
        .run(
            &input_job(&dir),
            &settings(sized(20)),
            &mut |_, _| {},
            &CancellationToken::new(),
        )
        .await
        .unwrap_or_else(|err| panic!("workflow should succeed: {err}"));

    assert!(log.position("download:vol-1/renamed.mp4").is_some());
}

#[tokio::test]
async fn region_lookup_failure_is_fatal() {
    let compute = ScriptedCompute::new();
    let (transfer, log) = doubles(&compute);
    let dir = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
    let explicit = VolumeRef {
        id: Some(String::from("vol-gone")),
        ..VolumeRef::default()
    };

    let err = workflow(&compute, &transfer)
        .run(
            &input_job(&dir),
            &settings(explicit),
            &mut |_, _| {},
            &CancellationToken::new(),
        )
        .await
        .expect_err("unknown volume");

    assert!(
        matches!(err, WorkflowError::ResolveRegion { ref volume_id, .. } if volume_id == "vol-gone"),
        "unexpected: {err:?}"
    );
    assert!(log.position("upload").is_none());
}

#[tokio::test]
async fn cancelled_run_still_cleans_up_created_volume() {
    let compute = ScriptedCompute::new();
    let (transfer, log) = doubles(&compute);
    let dir = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();

    let err = workflow(&compute, &transfer)
        .run(
            &input_job(&dir),
            &settings(sized(20)),
            &mut |stage, _| {
                if stage == "upload" {
                    trigger.cancel();
                }
            },
            &cancel,
        )
        .await
        .expect_err("cancelled");

    assert!(matches!(err, WorkflowError::Cancelled), "unexpected: {err:?}");
    assert!(log.position("run_sync").is_none());
    assert!(log.position("delete_volume:vol-1").is_some());
}

#[tokio::test]
async fn cancelled_download_leaves_no_output() {
    let compute = ScriptedCompute::new();
    let (transfer, log) = doubles(&compute);
    transfer.seed("vol-1", "out_clip.mp4", b"processed").await;
    transfer.stall_downloads();
    let dir = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
    let job = input_job(&dir);
    let cancel = CancellationToken::new();
    let canceller = tokio::spawn({
        let cancel = cancel.clone();
        let output = job.output.clone();
        async move {
            while !output.exists() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            cancel.cancel();
        }
    });

    let err = workflow(&compute, &transfer)
        .run(&job, &settings(sized(20)), &mut |_, _| {}, &cancel)
        .await
        .expect_err("cancelled mid-download");
    canceller
        .await
        .unwrap_or_else(|err| panic!("canceller task: {err}"));

    assert!(matches!(err, WorkflowError::Cancelled), "unexpected: {err:?}");
    assert!(!job.output.exists());
    assert!(log.position("delete_volume:vol-1").is_some());
}
