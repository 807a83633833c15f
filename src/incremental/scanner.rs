//! Scanner — walks the workspace and builds an [`Index`].
//!
//! A fast scan records only size and mtime. A full scan also hashes every
//! file, in parallel. Directories whose name starts with an ignored prefix
//! are pruned together with their whole subtree.

use ignore::WalkBuilder;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::fs::Metadata;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::debug;

use super::hash::hash_file;
use super::index::{Entry, Index};
use crate::error::{BazelleError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Metadata only.
    Fast,
    /// Metadata plus content hash.
    Full,
}

/// What a scan records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOptions {
    /// Entry-name prefixes to skip (e.g. `bazel-`, `.git`).
    pub ignore_prefixes: Vec<String>,
    /// Lowercase extensions without the dot.
    pub extensions: BTreeSet<String>,
}

impl ScanOptions {
    pub fn is_ignored_name(&self, name: &str) -> bool {
        self.ignore_prefixes
            .iter()
            .any(|prefix| !prefix.is_empty() && name.starts_with(prefix.as_str()))
    }

    /// True if any component of `rel` is ignored.
    pub fn is_ignored_path(&self, rel: &Path) -> bool {
        rel.components().any(|c| match c {
            Component::Normal(name) => self.is_ignored_name(&name.to_string_lossy()),
            _ => false,
        })
    }

    pub fn matches_extension(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| self.extensions.contains(&ext.to_string_lossy().to_ascii_lowercase()))
            .unwrap_or(false)
    }

    /// A file the scanner would record, given its workspace-relative path.
    pub fn tracks(&self, rel: &Path) -> bool {
        self.matches_extension(rel) && !self.is_ignored_path(rel)
    }
}

#[derive(Debug, Clone)]
pub struct Scanner {
    root: PathBuf,
    options: ScanOptions,
}

impl Scanner {
    pub fn new(root: impl Into<PathBuf>, options: ScanOptions) -> Self {
        Self {
            root: root.into(),
            options,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    pub fn scan(&self, mode: ScanMode) -> Result<Index> {
        let mut entries = self.walk()?;

        if mode == ScanMode::Full {
            let hashes = entries
                .par_iter()
                .map(|entry| self.try_hash_path(&entry.path))
                .collect::<Result<Vec<_>>>()?;
            // Files removed between the walk and the hash drop out.
            entries = entries
                .into_iter()
                .zip(hashes)
                .filter_map(|(mut entry, hash)| {
                    entry.hash = hash?;
                    Some(entry)
                })
                .collect();
        }

        debug!(root = %self.root.display(), files = entries.len(), ?mode, "scan complete");

        let mut index = Index::new();
        for entry in entries {
            index.insert(entry);
        }
        Ok(index)
    }

    pub fn fast_scan(&self) -> Result<Index> {
        self.scan(ScanMode::Fast)
    }

    pub fn full_scan(&self) -> Result<Index> {
        self.scan(ScanMode::Full)
    }

    /// Hash one workspace-relative path.
    pub fn hash_path(&self, rel: &str) -> Result<String> {
        let path = self.root.join(rel);
        hash_file(&path).map_err(|source| BazelleError::Scan { path, source })
    }

    /// Like [`hash_path`](Self::hash_path), but a file that no longer exists
    /// yields `None` instead of an error.
    pub fn try_hash_path(&self, rel: &str) -> Result<Option<String>> {
        match self.hash_path(rel) {
            Ok(hash) => Ok(Some(hash)),
            Err(BazelleError::Scan { source, .. }) if source.kind() == ErrorKind::NotFound => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Collect metadata-only entries. Unreadable entries fail the scan.
    fn walk(&self) -> Result<Vec<Entry>> {
        let options = self.options.clone();
        let walker = WalkBuilder::new(&self.root)
            .standard_filters(false)
            .follow_links(false)
            .filter_entry(move |entry| {
                entry.depth() == 0 || !options.is_ignored_name(&entry.file_name().to_string_lossy())
            })
            .build();

        let mut entries = Vec::new();
        for result in walker {
            let dent = result?;
            if !dent.file_type().map_or(false, |ft| ft.is_file()) {
                continue;
            }
            if !self.options.matches_extension(dent.path()) {
                continue;
            }
            let metadata = dent.metadata()?;
            let rel = relative_path(&self.root, dent.path());
            entries.push(entry_from_metadata(rel, &metadata));
        }
        Ok(entries)
    }
}

fn entry_from_metadata(path: String, metadata: &Metadata) -> Entry {
    Entry {
        path,
        hash: String::new(),
        mod_time: mod_time_nanos(metadata),
        size: metadata.len(),
    }
}

/// Modification time in nanoseconds; pre-epoch times are negative.
fn mod_time_nanos(metadata: &Metadata) -> i64 {
    match metadata.modified() {
        Ok(t) => match t.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_nanos() as i64,
            Err(e) => -(e.duration().as_nanos() as i64),
        },
        Err(_) => 0,
    }
}

/// `/`-joined path of `path` relative to `root`.
pub fn relative_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}
