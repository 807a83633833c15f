//! Incremental change detection.
//!
//! A [`Scanner`] turns the workspace into an [`Index`], the [`Store`] keeps
//! one index on disk as the baseline, and the [`Tracker`] diffs the two.
//! The diff is lazy: files whose size and mtime match the baseline are not
//! read at all. A rewrite that keeps both is therefore not detected; that is
//! the price of not hashing the whole tree on every query.

pub mod hash;
pub mod index;
pub mod scanner;
pub mod store;
pub mod tracker;

pub use hash::{hash_bytes, hash_file};
pub use index::{diff, dirs_to_targets, ChangeSet, Diff, Entry, Index, ALL_TARGETS, INDEX_VERSION};
pub use scanner::{ScanMode, ScanOptions, Scanner};
pub use store::{Store, STATE_FILE};
pub use tracker::{Snapshot, Tracker};
