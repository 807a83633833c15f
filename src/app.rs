//! Application context.
//!
//! One `App` is built at startup and shared as `Arc<App>` by the server,
//! the handler and every watcher. It owns the config, the language table,
//! the daemon paths and the updater.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{Config, DEFAULT_DIR_NAME};
use crate::daemon::paths::Paths;
use crate::error::Result;
use crate::incremental::{ScanOptions, Scanner, Store, Tracker};
use crate::language::LanguageRegistry;
use crate::update::{self, Updater};
use crate::VERSION;

#[derive(Debug, Clone)]
pub struct App {
    pub workspace: PathBuf,
    pub paths: Paths,
    pub config: Config,
    pub languages: LanguageRegistry,
    pub updater: Arc<dyn Updater>,
    pub version: String,
}

impl App {
    /// Canonicalize `workspace` and read its `bazelle.toml`.
    pub fn load(workspace: &Path) -> Result<Self> {
        let workspace = workspace.canonicalize()?;
        let config = Config::load(&workspace)?;
        Ok(Self::new(workspace, config))
    }

    pub fn new(workspace: PathBuf, config: Config) -> Self {
        let dir = match &config.daemon.dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => workspace.join(dir),
            None => workspace.join(DEFAULT_DIR_NAME),
        };
        let languages = LanguageRegistry::builtin().with_overrides(&config.languages);
        let updater = update::from_config(&config.update);

        Self {
            workspace,
            paths: Paths::new(dir),
            config,
            languages,
            updater,
            version: VERSION.to_string(),
        }
    }

    pub fn with_paths(mut self, paths: Paths) -> Self {
        self.paths = paths;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_updater(mut self, updater: Arc<dyn Updater>) -> Self {
        self.updater = updater;
        self
    }

    /// Scan options for `languages`; empty falls back to `[watch] languages`,
    /// and an empty config list means every language.
    pub fn scan_options(&self, languages: &[String]) -> Result<ScanOptions> {
        let selected = if languages.is_empty() {
            &self.config.watch.languages
        } else {
            languages
        };
        Ok(ScanOptions {
            ignore_prefixes: self.config.watch.ignore.clone(),
            extensions: self.languages.extensions_for(selected)?,
        })
    }

    /// Tracker over the whole workspace with the baseline in the daemon dir.
    pub fn tracker(&self, languages: &[String]) -> Result<Tracker> {
        let scanner = Scanner::new(&self.workspace, self.scan_options(languages)?);
        Ok(Tracker::new(scanner, Store::in_dir(&self.paths.dir)))
    }
}
