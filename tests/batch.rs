//! Planning, skip policy and failure policy of the batch engine.

#[path = "common/constants.rs"]
mod constants;
#[path = "batch/test_helpers.rs"]
mod test_helpers;

use mediarelay::batch::{BatchEngine, BatchError, BatchOptions, plan};
use mediarelay::operation::{FlipAxis, Transform};
use mediarelay::router::{Provider, ProviderSelection, RoutedTransform};
use rstest::rstest;
use test_helpers::{BatchContext, batch_context};
use tokio_util::sync::CancellationToken;

const FILES: [&str; 5] = ["a.png", "b.png", "c.png", "d.png", "e.png"];

fn seed_five(ctx: &BatchContext) {
    for name in FILES {
        ctx.input(name);
    }
}

fn script_third_failure(ctx: &BatchContext) {
    ctx.runner.push_success();
    ctx.runner.push_success();
    ctx.runner.push_failure(1);
    ctx.runner.push_success();
    ctx.runner.push_success();
}

#[rstest]
#[case::abort_on_failure(false, 2, 1, 3)]
#[case::continue_on_error(true, 4, 1, 5)]
#[tokio::test]
async fn third_file_failure_follows_policy(
    batch_context: BatchContext,
    #[case] continue_on_error: bool,
    #[case] succeeded: usize,
    #[case] failed: usize,
    #[case] attempted: usize,
) {
    let ctx = batch_context;
    seed_five(&ctx);
    script_third_failure(&ctx);
    let options = BatchOptions {
        continue_on_error,
        ..BatchOptions::default()
    };
    let planned = plan(&ctx.input_dir(), None, &options)
        .unwrap_or_else(|err| panic!("plan: {err}"));
    let router = ctx.router();
    let processor = RoutedTransform::new(
        &router,
        Transform::Flip(FlipAxis::Horizontal),
        ProviderSelection::new(Provider::LocalCpu),
    );

    let metrics = BatchEngine::new(processor, continue_on_error)
        .run(&planned, &CancellationToken::new())
        .await;

    assert_eq!(metrics.succeeded, succeeded);
    assert_eq!(metrics.failed, failed);
    assert_eq!(metrics.files.len(), attempted);
    assert_eq!(ctx.runner.invocations().len(), attempted);
    let failure = metrics
        .files
        .iter()
        .find(|file| !file.success)
        .unwrap_or_else(|| panic!("one file should fail"));
    assert_eq!(failure.name, "c.png");
    assert!(matches!(
        metrics.ensure_success(),
        Err(BatchError::Failed { failed: 1, .. })
    ));
}

#[rstest]
#[tokio::test]
async fn second_run_over_same_directory_processes_nothing(batch_context: BatchContext) {
    let ctx = batch_context;
    seed_five(&ctx);
    for _ in FILES {
        ctx.runner.push_success();
    }
    let options = BatchOptions::default();
    let router = ctx.router();
    let engine = BatchEngine::new(
        RoutedTransform::new(
            &router,
            Transform::Flip(FlipAxis::Vertical),
            ProviderSelection::new(Provider::LocalCpu),
        ),
        false,
    );

    let first = plan(&ctx.input_dir(), None, &options).unwrap_or_else(|err| panic!("plan: {err}"));
    let metrics = engine.run(&first, &CancellationToken::new()).await;
    assert_eq!(metrics.succeeded, 5);
    assert!(metrics.ensure_success().is_ok());

    let second = plan(&ctx.input_dir(), None, &options).unwrap_or_else(|err| panic!("plan: {err}"));
    assert!(second.all_processed());
    assert_eq!(second.skipped, 5);
    let rerun = engine.run(&second, &CancellationToken::new()).await;
    assert_eq!(rerun.succeeded + rerun.failed, 0);
    assert_eq!(ctx.runner.invocations().len(), 5);
}

#[rstest]
fn overwrite_replans_existing_outputs(batch_context: BatchContext) {
    let ctx = batch_context;
    ctx.input("a.png");
    let output = ctx.root().join("input_out");
    std::fs::create_dir_all(&output).unwrap_or_else(|err| panic!("mkdir: {err}"));
    std::fs::write(output.join("a.png"), b"done").unwrap_or_else(|err| panic!("write: {err}"));

    let skipping = plan(&ctx.input_dir(), None, &BatchOptions::default())
        .unwrap_or_else(|err| panic!("plan: {err}"));
    let overwriting = plan(
        &ctx.input_dir(),
        None,
        &BatchOptions {
            overwrite: true,
            ..BatchOptions::default()
        },
    )
    .unwrap_or_else(|err| panic!("plan: {err}"));

    assert!(skipping.jobs.is_empty());
    assert_eq!(overwriting.jobs.len(), 1);
    assert_eq!(overwriting.skipped, 0);
}

#[rstest]
#[case::flat(false, 1)]
#[case::recursive(true, 2)]
fn recursion_controls_enumeration(
    batch_context: BatchContext,
    #[case] recursive: bool,
    #[case] expected: usize,
) {
    let ctx = batch_context;
    ctx.input("top.jpg");
    ctx.input("nested/deeper.png");
    ctx.input("notes.txt");

    let planned = plan(
        &ctx.input_dir(),
        None,
        &BatchOptions {
            recursive,
            ..BatchOptions::default()
        },
    )
    .unwrap_or_else(|err| panic!("plan: {err}"));

    assert_eq!(planned.jobs.len(), expected);
    if recursive {
        let nested = planned
            .jobs
            .iter()
            .find(|job| job.source.ends_with("nested/deeper.png"))
            .unwrap_or_else(|| panic!("nested file planned: {:?}", planned.jobs));
        assert_eq!(nested.destination, ctx.root().join("input_out/nested/deeper.png"));
    }
}

#[rstest]
fn recursive_plan_ignores_output_nested_in_input(batch_context: BatchContext) {
    let ctx = batch_context;
    ctx.input("a.png");
    ctx.input("processed/a.png");
    let output = ctx.input_dir().join("processed");

    let planned = plan(
        &ctx.input_dir(),
        Some(&output),
        &BatchOptions {
            recursive: true,
            overwrite: true,
            ..BatchOptions::default()
        },
    )
    .unwrap_or_else(|err| panic!("plan: {err}"));

    let sources: Vec<_> = planned.jobs.iter().map(|job| job.source.clone()).collect();
    assert_eq!(sources, vec![ctx.input_dir().join("a.png")]);
    assert_eq!(planned.jobs.first().map(|job| job.destination.clone()), Some(output.join("a.png")));
}

#[rstest]
fn format_override_renames_destinations(batch_context: BatchContext) {
    let ctx = batch_context;
    ctx.input("photo.jpeg");

    let planned = plan(
        &ctx.input_dir(),
        None,
        &BatchOptions {
            output_format: Some(String::from("webp")),
            ..BatchOptions::default()
        },
    )
    .unwrap_or_else(|err| panic!("plan: {err}"));

    let job = planned.jobs.first().unwrap_or_else(|| panic!("one job"));
    assert_eq!(job.format, "webp");
    assert_eq!(job.destination, ctx.root().join("input_out/photo.webp"));
}

#[rstest]
fn single_file_defaults_beside_input(batch_context: BatchContext) {
    let ctx = batch_context;
    let source = ctx.input("clip.mov");

    let planned =
        plan(&source, None, &BatchOptions::default()).unwrap_or_else(|err| panic!("plan: {err}"));

    let job = planned.jobs.first().unwrap_or_else(|| panic!("one job"));
    assert_eq!(job.destination, ctx.input_dir().join("clip_out.mov"));
}

#[rstest]
fn unsupported_single_file_is_rejected(batch_context: BatchContext) {
    let ctx = batch_context;
    let source = ctx.input("notes.txt");

    let err = plan(&source, None, &BatchOptions::default()).expect_err("not media");

    assert!(matches!(err, BatchError::UnsupportedInput { .. }), "unexpected: {err:?}");
}

#[rstest]
fn empty_directory_is_an_error(batch_context: BatchContext) {
    let ctx = batch_context;
    ctx.input("readme.md");

    let err = plan(&ctx.input_dir(), None, &BatchOptions::default()).expect_err("nothing to do");

    assert!(matches!(err, BatchError::Empty { .. }), "unexpected: {err:?}");
}
