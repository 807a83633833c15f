//! Daemon file layout.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::config::DEFAULT_DIR_NAME;
use crate::error::Result;
use crate::incremental::STATE_FILE;

pub const SOCKET_FILE: &str = "daemon.sock";
pub const PID_FILE: &str = "daemon.pid";
pub const LOG_FILE: &str = "daemon.log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub dir: PathBuf,
    pub socket: PathBuf,
    pub pid: PathBuf,
    pub log: PathBuf,
}

impl Paths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            socket: dir.join(SOCKET_FILE),
            pid: dir.join(PID_FILE),
            log: dir.join(LOG_FILE),
            dir,
        }
    }

    /// `<workspace>/.bazelle`
    pub fn for_workspace(workspace: &Path) -> Self {
        Self::new(workspace.join(DEFAULT_DIR_NAME))
    }

    /// `~/.bazelle`, or `None` without a home directory.
    pub fn global() -> Option<Self> {
        dirs::home_dir().map(|home| Self::new(home.join(DEFAULT_DIR_NAME)))
    }

    /// Tracker baseline.
    pub fn state(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    /// Create the directory and restrict it to the owner (0700).
    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_layout() {
        let paths = Paths::for_workspace(Path::new("/ws"));
        assert_eq!(paths.dir, PathBuf::from("/ws/.bazelle"));
        assert_eq!(paths.socket, PathBuf::from("/ws/.bazelle/daemon.sock"));
        assert_eq!(paths.pid, PathBuf::from("/ws/.bazelle/daemon.pid"));
        assert_eq!(paths.log, PathBuf::from("/ws/.bazelle/daemon.log"));
        assert_eq!(paths.state(), PathBuf::from("/ws/.bazelle/state.json"));
    }

    #[test]
    fn test_ensure_dir_is_owner_only() {
        let tmp = tempdir().unwrap();
        let paths = Paths::new(tmp.path().join("a/b"));
        paths.ensure_dir().unwrap();
        paths.ensure_dir().unwrap();

        let mode = fs::metadata(&paths.dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
