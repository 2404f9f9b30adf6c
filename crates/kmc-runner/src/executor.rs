//! Launching the external simulator on prepared run directories.

use crate::RunnerError;
use kmc_common::TrajectorySegment;
use kmc_model::RunConfig;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// Something that turns a run configuration into a trajectory.
///
/// Implementations are shared between the worker threads of a batch.
pub trait Simulator: Sync {
    fn simulate(&self, config: &RunConfig) -> Result<TrajectorySegment, RunnerError>;
}

/// Run `executable` inside `workdir` and wait for it to exit.
pub fn execute_run(executable: &Path, workdir: &Path) -> Result<(), RunnerError> {
    debug!(executable = %executable.display(), workdir = %workdir.display(), "launching simulator");
    let output = Command::new(executable)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| RunnerError::ExternalProcess {
            workdir: workdir.to_path_buf(),
            message: format!("cannot launch {}: {e}", executable.display()),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(RunnerError::ExternalProcess {
            workdir: workdir.to_path_buf(),
            message: format!("exited with {}: {}", output.status, stderr.trim()),
        });
    }
    Ok(())
}

/// Runs the Zacros executable once per replicate.
#[derive(Debug, Clone)]
pub struct ZacrosSimulator {
    pub executable: PathBuf,
}

impl ZacrosSimulator {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

impl Simulator for ZacrosSimulator {
    fn simulate(&self, config: &RunConfig) -> Result<TrajectorySegment, RunnerError> {
        if config.workdir.exists() {
            std::fs::remove_dir_all(&config.workdir)?;
        }
        config.write_inputs()?;
        info!(replicate = config.replicate + 1, seed = config.seed, "starting run");
        execute_run(&self.executable, &config.workdir)?;
        Ok(kmc_output::load_run_result(&config.workdir)?)
    }
}
