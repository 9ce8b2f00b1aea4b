//! Shared fixtures for batch engine tests.

use camino::{Utf8Path, Utf8PathBuf};
use mediarelay::engine::{EngineBinaries, LocalEngine};
use mediarelay::router::ExecutionRouter;
use mediarelay::test_support::{MemoryTransfer, ScriptedCompute, ScriptedPredictor, ScriptedRunner};
use rstest::fixture;
use tempfile::TempDir;

use crate::constants::{DATA_CENTER, PREFIX};

pub type LocalRouter =
    ExecutionRouter<ScriptedRunner, ScriptedCompute, MemoryTransfer, ScriptedPredictor>;

pub struct BatchContext {
    pub runner: ScriptedRunner,
    pub dir: TempDir,
}

#[fixture]
pub fn batch_context() -> BatchContext {
    BatchContext {
        runner: ScriptedRunner::new().writing_outputs(),
        dir: TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}")),
    }
}

impl BatchContext {
    pub fn root(&self) -> Utf8PathBuf {
        Utf8Path::from_path(self.dir.path())
            .unwrap_or_else(|| panic!("temp dir is not UTF-8"))
            .to_path_buf()
    }

    /// Creates `relative` under the input directory with placeholder bytes.
    pub fn input(&self, relative: &str) -> Utf8PathBuf {
        let path = self.root().join("input").join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap_or_else(|err| panic!("mkdir: {err}"));
        }
        std::fs::write(&path, b"pixels").unwrap_or_else(|err| panic!("write input: {err}"));
        path
    }

    pub fn input_dir(&self) -> Utf8PathBuf {
        self.root().join("input")
    }

    pub fn router(&self) -> LocalRouter {
        ExecutionRouter::new(
            LocalEngine::new(self.runner.clone(), EngineBinaries::default()),
            PREFIX,
            DATA_CENTER,
        )
    }
}
