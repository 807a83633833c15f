//! Store — durable persistence of the tracking baseline.
//!
//! The baseline is JSON (`state.json`). Writes are atomic: write a `.tmp`
//! sibling, fsync, then rename over the old file.

use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::index::{Index, INDEX_VERSION};
use crate::error::Result;

/// Baseline file name inside the daemon directory.
pub const STATE_FILE: &str = "state.json";

#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
}

impl Store {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `<dir>/state.json`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(STATE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the baseline. An absent file or a different format version
    /// yields an empty index.
    pub fn load(&self) -> Result<Index> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Index::new()),
            Err(e) => return Err(e.into()),
        };
        let index: Index = serde_json::from_slice(&bytes)?;
        if index.version != INDEX_VERSION {
            warn!(
                path = %self.path.display(),
                found = index.version,
                expected = INDEX_VERSION,
                "ignoring baseline with different version"
            );
            return Ok(Index::new());
        }
        debug!(path = %self.path.display(), files = index.len(), "baseline loaded");
        Ok(index)
    }

    /// Atomically replace the baseline.
    pub fn save(&self, index: &Index) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let bytes = serde_json::to_vec_pretty(index)?;

        let tmp_path = self.path.with_extension("json.tmp");
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
        fs::rename(&tmp_path, &self.path)?;

        info!(path = %self.path.display(), files = index.len(), "baseline saved");
        Ok(())
    }

    /// Delete the baseline. Absent is not an error.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
