//! Doubles and fixtures for volume workflow tests.

use std::time::Duration;

use camino::Utf8PathBuf;
use mediarelay::backend::Endpoint;
use mediarelay::endpoint::{FFMPEG_MODEL, endpoint_name_for_model, provision_spec};
use mediarelay::test_support::{CallLog, MemoryTransfer, ScriptedCompute};
use mediarelay::volume::NetworkVolume;
use mediarelay::workflow::{VolumeJob, VolumeRef, VolumeWorkflow, WorkflowSettings};
use tempfile::TempDir;

use crate::constants::{DATA_CENTER, PREFIX};

/// Object store double sharing the compute double's call log.
pub fn doubles(compute: &ScriptedCompute) -> (MemoryTransfer, CallLog) {
    let log = compute.log();
    (MemoryTransfer::with_log(log.clone()), log)
}

pub fn workflow(
    compute: &ScriptedCompute,
    transfer: &MemoryTransfer,
) -> VolumeWorkflow<ScriptedCompute, MemoryTransfer> {
    VolumeWorkflow::new(compute.clone(), transfer.clone()).with_volume_settle(Duration::ZERO)
}

pub fn position(log: &CallLog, prefix: &str) -> usize {
    log.position(prefix)
        .unwrap_or_else(|| panic!("expected a call starting with {prefix}: {:?}", log.entries()))
}

pub fn sized(size_gb: u32) -> VolumeRef {
    VolumeRef {
        size_gb: Some(size_gb),
        ..VolumeRef::default()
    }
}

pub fn settings(volume: VolumeRef) -> WorkflowSettings {
    WorkflowSettings {
        endpoint_prefix: endpoint_name_for_model(PREFIX, FFMPEG_MODEL),
        provision: Some(
            provision_spec(PREFIX, FFMPEG_MODEL, None, vec![DATA_CENTER.to_owned()], 0)
                .unwrap_or_else(|err| panic!("provision spec: {err}")),
        ),
        volume,
        data_center: DATA_CENTER.to_owned(),
        volume_name_prefix: format!("{PREFIX}-vol"),
        keep_on_failure: false,
    }
}

pub fn volume(id: &str) -> NetworkVolume {
    NetworkVolume {
        id: id.to_owned(),
        name: format!("{id}-name"),
        size_gb: 20,
        data_center_id: DATA_CENTER.to_owned(),
        status: Some(String::from("READY")),
    }
}

pub fn endpoint_with_volume(id: &str, volume_id: &str) -> Endpoint {
    Endpoint {
        id: id.to_owned(),
        name: endpoint_name_for_model(PREFIX, FFMPEG_MODEL),
        compute_classes: vec![String::from("NVIDIA RTX A4000")],
        workers_min: 0,
        workers_max: 1,
        volume_ids: vec![volume_id.to_owned()],
    }
}

/// Writes a small input clip into a fresh directory.
pub fn input_job(dir: &TempDir) -> VolumeJob {
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
        .unwrap_or_else(|path| panic!("temp dir is not UTF-8: {}", path.display()));
    let input = root.join("clip.mov");
    std::fs::write(&input, b"input clip bytes")
        .unwrap_or_else(|err| panic!("write input: {err}"));
    VolumeJob {
        input,
        output: root.join("clip_out.mp4"),
        model: FFMPEG_MODEL.to_owned(),
        engine_args: String::from("-vf,hflip"),
        output_format: Some(String::from("mp4")),
        scale: None,
    }
}
