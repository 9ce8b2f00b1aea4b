//! Unit tests for the janitor module.

use super::*;
use crate::backend::Endpoint;
use crate::test_support::ScriptedCompute;
use crate::volume::NetworkVolume;
use rstest::rstest;

fn endpoint(id: &str, name: &str) -> Endpoint {
    Endpoint {
        id: id.to_owned(),
        name: name.to_owned(),
        ..Endpoint::default()
    }
}

fn volume(id: &str, name: &str) -> NetworkVolume {
    NetworkVolume {
        id: id.to_owned(),
        name: name.to_owned(),
        size_gb: 10,
        data_center_id: String::from("EU-RO-1"),
        status: None,
    }
}

fn compute() -> ScriptedCompute {
    ScriptedCompute::new()
        .with_endpoint(endpoint("ep-a", "mediarelay-ffmpeg"))
        .with_endpoint(endpoint("ep-b", "other-tool"))
        .with_volume(volume("vol-a", "mediarelay-vol-1700000000"))
        .with_volume(volume("vol-b", "keep-me"))
}

#[rstest]
fn janitor_config_trims_prefix() {
    let cfg = JanitorConfig::new(" mediarelay ", false).unwrap_or_else(|err| panic!("config: {err}"));
    assert_eq!(cfg.prefix, "mediarelay");
    assert!(!cfg.include_volumes);
}

#[rstest]
#[case::empty("")]
#[case::whitespace("  ")]
fn janitor_config_rejects_blank_prefix(#[case] prefix: &str) {
    assert_eq!(
        JanitorConfig::new(prefix, false),
        Err(InvalidConfig {
            field: String::from("prefix")
        })
    );
}

#[tokio::test]
async fn plan_selects_only_prefixed_resources() {
    let cfg = JanitorConfig::new("mediarelay", true).unwrap_or_else(|err| panic!("config: {err}"));
    let janitor = Janitor::new(cfg, compute());

    let plan = janitor
        .plan(&CancellationToken::new())
        .await
        .unwrap_or_else(|err| panic!("plan: {err}"));

    assert_eq!(plan.endpoint_ids(), vec!["ep-a"]);
    assert_eq!(plan.volume_ids(), vec!["vol-a"]);
}

#[tokio::test]
async fn sweep_deletes_endpoints_before_volumes() {
    let backend = compute();
    let cfg = JanitorConfig::new("mediarelay", true).unwrap_or_else(|err| panic!("config: {err}"));
    let janitor = Janitor::new(cfg, backend.clone());
    let cancel = CancellationToken::new();
    let plan = janitor
        .plan(&cancel)
        .await
        .unwrap_or_else(|err| panic!("plan: {err}"));

    let summary = janitor
        .sweep(&plan, &cancel)
        .await
        .unwrap_or_else(|err| panic!("sweep: {err}"));

    assert_eq!(
        summary,
        SweepSummary {
            deleted_endpoints: 1,
            deleted_volumes: 1
        }
    );
    let log = backend.log();
    let endpoint_delete = log.position("delete_endpoint:ep-a");
    let volume_delete = log.position("delete_volume:vol-a");
    assert!(endpoint_delete < volume_delete, "log: {:?}", log.entries());
    assert_eq!(backend.endpoints().len(), 1);
    assert_eq!(backend.volumes().len(), 1);
}

#[tokio::test]
async fn volumes_are_left_alone_unless_requested() {
    let backend = compute();
    let cfg = JanitorConfig::new("mediarelay", false).unwrap_or_else(|err| panic!("config: {err}"));
    let janitor = Janitor::new(cfg, backend.clone());
    let cancel = CancellationToken::new();
    let plan = janitor
        .plan(&cancel)
        .await
        .unwrap_or_else(|err| panic!("plan: {err}"));

    janitor
        .sweep(&plan, &cancel)
        .await
        .unwrap_or_else(|err| panic!("sweep: {err}"));

    assert!(!backend.calls().iter().any(|call| call.starts_with("list_volumes")));
    assert_eq!(backend.volumes().len(), 2);
}

#[tokio::test]
async fn sweep_errors_when_resources_remain() {
    let backend = compute();
    backend.fail_volume_deletion();
    let cfg = JanitorConfig::new("mediarelay", true).unwrap_or_else(|err| panic!("config: {err}"));
    let janitor = Janitor::new(cfg, backend);
    let cancel = CancellationToken::new();
    let plan = janitor
        .plan(&cancel)
        .await
        .unwrap_or_else(|err| panic!("plan: {err}"));

    let err = janitor
        .sweep(&plan, &cancel)
        .await
        .expect_err("volume survives");

    let JanitorError::NotClean { message } = err else {
        panic!("expected NotClean, got {err:?}");
    };
    assert!(message.contains("vol-a"), "expected remaining volume, got: {message}");
}

#[tokio::test]
async fn listing_failures_surface() {
    let backend = compute();
    backend.fail_next_lists(1);
    let cfg = JanitorConfig::new("mediarelay", true).unwrap_or_else(|err| panic!("config: {err}"));
    let janitor = Janitor::new(cfg, backend);

    let err = janitor
        .plan(&CancellationToken::new())
        .await
        .expect_err("listing fails");

    assert!(
        matches!(err, JanitorError::List { resource: "endpoints", .. }),
        "unexpected: {err:?}"
    );
}

#[tokio::test]
async fn cancelled_sweep_deletes_nothing() {
    let backend = compute();
    let cfg = JanitorConfig::new("mediarelay", true).unwrap_or_else(|err| panic!("config: {err}"));
    let janitor = Janitor::new(cfg, backend.clone());
    let plan = janitor
        .plan(&CancellationToken::new())
        .await
        .unwrap_or_else(|err| panic!("plan: {err}"));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = janitor.sweep(&plan, &cancel).await.expect_err("cancelled");

    assert!(matches!(err, JanitorError::Cancelled), "unexpected: {err:?}");
    assert_eq!(backend.endpoints().len(), 2);
}
