//! Index snapshots and the ChangeSet diff between two of them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::error::Result;

/// On-disk format version of `state.json`.
pub const INDEX_VERSION: u32 = 1;

/// Target pattern covering the whole workspace.
pub const ALL_TARGETS: &str = "//...";

/// One tracked file. `path` is workspace-relative with `/` separators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub path: String,
    #[serde(default)]
    pub hash: String,
    /// Modification time in nanoseconds since the Unix epoch.
    pub mod_time: i64,
    pub size: u64,
}

impl Entry {
    /// Same size and same mtime. The lazy diff treats this as "unchanged"
    /// without reading the file, so a rewrite that preserves both is missed.
    pub fn same_metadata(&self, other: &Entry) -> bool {
        self.mod_time == other.mod_time && self.size == other.size
    }
}

/// A snapshot of tracked files keyed by relative path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    pub entries: BTreeMap<String, Entry>,
}

impl Index {
    pub fn new() -> Self {
        Self {
            version: INDEX_VERSION,
            updated_at: Utc::now(),
            entries: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, entry: Entry) {
        self.entries.insert(entry.path.clone(), entry);
    }

    pub fn get(&self, path: &str) -> Option<&Entry> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of the entries whose path satisfies `keep`.
    pub fn select<F>(&self, mut keep: F) -> Index
    where
        F: FnMut(&str) -> bool,
    {
        Index {
            version: self.version,
            updated_at: self.updated_at,
            entries: self
                .entries
                .iter()
                .filter(|(path, _)| keep(path))
                .map(|(path, entry)| (path.clone(), entry.clone()))
                .collect(),
        }
    }

    /// Compare two fully hashed snapshots.
    pub fn compare(&self, new: &Index) -> ChangeSet {
        let mut changes = ChangeSet::default();
        for (path, entry) in &new.entries {
            match self.entries.get(path) {
                None => changes.added.push(path.clone()),
                Some(old) if old.hash != entry.hash => changes.modified.push(path.clone()),
                Some(_) => {}
            }
        }
        for path in self.entries.keys() {
            if !new.entries.contains_key(path) {
                changes.deleted.push(path.clone());
            }
        }
        changes.normalize();
        changes
    }
}

impl Default for Index {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of [`diff`]: the changes plus the snapshot they were computed from.
///
/// `current` carries the baseline hash for unchanged files and the fresh hash
/// for rehashed ones. Added files are left unhashed; [`Tracker::snapshot`]
/// fills them in before the snapshot is committed.
///
/// [`Tracker::snapshot`]: super::tracker::Tracker::snapshot
#[derive(Debug, Clone, Default)]
pub struct Diff {
    pub changes: ChangeSet,
    pub current: Index,
}

/// Lazy three-way diff between a hashed `baseline` and a metadata-only `current`.
///
/// Paths whose size and mtime match the baseline are skipped without I/O.
/// The rest are hashed through `rehash` and reported as modified only if
/// the content hash actually differs. `rehash` returns `None` for a file
/// that disappeared after the scan; it is reported as deleted.
pub fn diff<F>(baseline: &Index, current: &Index, mut rehash: F) -> Result<Diff>
where
    F: FnMut(&str) -> Result<Option<String>>,
{
    let mut changes = ChangeSet::default();
    let mut snapshot = Index::new();

    for (path, entry) in &current.entries {
        let mut entry = entry.clone();
        match baseline.entries.get(path) {
            None => changes.added.push(path.clone()),
            Some(old) if old.same_metadata(&entry) => entry.hash = old.hash.clone(),
            Some(old) => match rehash(path)? {
                Some(hash) => {
                    if hash != old.hash {
                        changes.modified.push(path.clone());
                    }
                    entry.hash = hash;
                }
                None => continue,
            },
        }
        snapshot.insert(entry);
    }

    for path in baseline.entries.keys() {
        if !snapshot.entries.contains_key(path) {
            changes.deleted.push(path.clone());
        }
    }

    changes.normalize();
    Ok(Diff {
        changes,
        current: snapshot,
    })
}

/// Paths added, modified and deleted between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub modified: Vec<String>,
    #[serde(default)]
    pub deleted: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }

    /// Sort and deduplicate all three lists.
    pub fn normalize(&mut self) {
        for list in [&mut self.added, &mut self.modified, &mut self.deleted] {
            list.sort();
            list.dedup();
        }
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.added
            .iter()
            .chain(self.modified.iter())
            .chain(self.deleted.iter())
    }

    /// Sorted, deduplicated parent directories of every changed path.
    /// Files at the workspace root map to `"."`.
    pub fn affected_dirs(&self) -> Vec<String> {
        let dirs: BTreeSet<String> = self.paths().map(|p| parent_dir(p)).collect();
        dirs.into_iter().collect()
    }

    /// Build target patterns for the affected directories.
    pub fn as_targets(&self) -> Vec<String> {
        dirs_to_targets(&self.affected_dirs())
    }
}

/// Workspace-relative parent directory of a `/`-separated path.
pub fn parent_dir(path: &str) -> String {
    match Path::new(path).parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_string_lossy().into_owned(),
        _ => ".".to_string(),
    }
}

/// Map directories to target patterns: `"."` is everything, any other
/// directory is that package's `:all`.
pub fn dirs_to_targets(dirs: &[String]) -> Vec<String> {
    let mut targets: Vec<String> = dirs
        .iter()
        .map(|dir| {
            if dir == "." || dir.is_empty() {
                ALL_TARGETS.to_string()
            } else {
                format!("//{}:all", dir.trim_end_matches('/'))
            }
        })
        .collect();
    targets.sort();
    targets.dedup();
    targets
}
