//! Update seam — hands changed targets to the external rule generator.
//!
//! BUILD-file generation itself is not done here. The daemon only decides
//! *which* targets need regenerating and calls an [`Updater`].

use std::fmt;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::UpdateConfig;
use crate::error::{BazelleError, Result};

pub trait Updater: Send + Sync + fmt::Debug {
    /// Regenerate build files for `targets` (e.g. `//src:all`, `//...`).
    fn update(&self, workspace: &Path, targets: &[String]) -> Result<()>;
}

/// Logs the targets and does nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopUpdater;

impl Updater for NoopUpdater {
    fn update(&self, workspace: &Path, targets: &[String]) -> Result<()> {
        info!(workspace = %workspace.display(), ?targets, "no update command configured");
        Ok(())
    }
}

/// Runs a configured command with the targets appended as arguments.
#[derive(Debug, Clone)]
pub struct CommandUpdater {
    program: String,
    args: Vec<String>,
}

impl CommandUpdater {
    /// `None` when `command` is empty.
    pub fn new(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl Updater for CommandUpdater {
    fn update(&self, workspace: &Path, targets: &[String]) -> Result<()> {
        debug!(program = %self.program, ?targets, "running update command");
        let output = Command::new(&self.program)
            .args(&self.args)
            .args(targets)
            .current_dir(workspace)
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BazelleError::UpdateFailed(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        info!(program = %self.program, targets = targets.len(), "update command finished");
        Ok(())
    }
}

/// Pick the updater described by `[update]`.
pub fn from_config(config: &UpdateConfig) -> Arc<dyn Updater> {
    match CommandUpdater::new(&config.command) {
        Some(cmd) => Arc::new(cmd),
        None => Arc::new(NoopUpdater),
    }
}
