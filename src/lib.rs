//! # Bazelle
//!
//! Background daemon that keeps Bazel build files in sync with a source tree.
//!
//! The daemon watches the workspace, works out which directories changed
//! since the last baseline and hands the affected targets to a rule
//! generator. Short-lived clients talk to it over a Unix socket.
//!
//! ## Key Features
//!
//! - **Incremental**: a lazy diff only hashes files whose size or mtime moved
//! - **Debounced**: bursts of filesystem events become one update
//! - **Robust lifecycle**: stale PID/socket cleanup and graceful-then-forced stop
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bazelle::{App, Tracker};
//! use std::path::Path;
//!
//! let app = App::load(Path::new(".")).unwrap();
//! let tracker: Tracker = app.tracker(&[]).unwrap();
//! let changes = tracker.status().unwrap();
//! println!("targets to regenerate: {:?}", changes.as_targets());
//! ```

pub mod app;
pub mod config;
pub mod daemon;
pub mod error;
pub mod incremental;
pub mod language;
pub mod update;
pub mod watcher;

pub use app::App;
pub use config::Config;
pub use error::{BazelleError, Result};
pub use incremental::{ChangeSet, Index, ScanMode, Scanner, Store, Tracker};
pub use language::LanguageRegistry;
pub use update::{CommandUpdater, NoopUpdater, Updater};

/// Crate version, reported by `ping`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
