//! Tracker — "what changed since the baseline", and committing a new one.

use chrono::Utc;
use std::path::Path;
use tracing::{debug, info};

use super::index::{diff, ChangeSet, Diff, Index};
use super::scanner::Scanner;
use super::store::Store;
use crate::error::Result;

/// Changes plus the hashed index they describe.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub changes: ChangeSet,
    pub index: Index,
}

#[derive(Debug, Clone)]
pub struct Tracker {
    scanner: Scanner,
    store: Store,
}

impl Tracker {
    pub fn new(scanner: Scanner, store: Store) -> Self {
        Self { scanner, store }
    }

    pub fn root(&self) -> &Path {
        self.scanner.root()
    }

    pub fn scanner(&self) -> &Scanner {
        &self.scanner
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn has_baseline(&self) -> bool {
        self.store.exists()
    }

    pub fn baseline(&self) -> Result<Index> {
        self.store.load()
    }

    /// Changes since the baseline. Does not touch the stored state.
    ///
    /// Uses a fast scan and only hashes files whose size or mtime moved.
    /// Baseline entries outside this tracker's selection are ignored.
    pub fn status(&self) -> Result<ChangeSet> {
        Ok(self.compute()?.changes)
    }

    /// Like [`status`](Self::status), but also returns the fully hashed
    /// index the changes were computed from, ready for [`commit`](Self::commit).
    pub fn snapshot(&self) -> Result<Snapshot> {
        let Diff {
            mut changes,
            current,
        } = self.compute()?;

        let mut index = Index::new();
        for (path, mut entry) in current.entries {
            if entry.hash.is_empty() {
                match self.scanner.try_hash_path(&path)? {
                    Some(hash) => entry.hash = hash,
                    None => {
                        changes.added.retain(|p| p != &path);
                        continue;
                    }
                }
            }
            index.insert(entry);
        }
        Ok(Snapshot { changes, index })
    }

    /// Fold a snapshot into the stored baseline. Files changed after the
    /// snapshot was taken are still reported by the next status.
    pub fn commit(&self, snapshot: &Snapshot) -> Result<()> {
        self.merge(&snapshot.index)?;
        debug!(files = snapshot.index.len(), "snapshot committed");
        Ok(())
    }

    /// Full scan of the selection, merged into the baseline. Returns what
    /// changed within the selection relative to the old baseline.
    pub fn refresh(&self) -> Result<ChangeSet> {
        let previous = self.selected(&self.store.load()?);
        let current = self.scanner.full_scan()?;
        let changes = previous.compare(&current);
        self.merge(&current)?;
        info!(
            root = %self.scanner.root().display(),
            files = current.len(),
            changed = changes.len(),
            "baseline refreshed"
        );
        Ok(changes)
    }

    /// Drop the baseline; the next status reports every file as added.
    pub fn clear(&self) -> Result<()> {
        self.store.clear()
    }

    fn compute(&self) -> Result<Diff> {
        let baseline = self.selected(&self.store.load()?);
        let current = self.scanner.fast_scan()?;
        let result = diff(&baseline, &current, |path| self.scanner.try_hash_path(path))?;
        debug!(
            added = result.changes.added.len(),
            modified = result.changes.modified.len(),
            deleted = result.changes.deleted.len(),
            "tracker status"
        );
        Ok(result)
    }

    /// Baseline entries this tracker's options would scan.
    fn selected(&self, baseline: &Index) -> Index {
        let options = self.scanner.options();
        baseline.select(|path| options.tracks(Path::new(path)))
    }

    /// Replace the selected part of the stored baseline with `current` and
    /// keep everything else.
    fn merge(&self, current: &Index) -> Result<()> {
        let options = self.scanner.options();
        let mut baseline = self.store.load()?;
        baseline
            .entries
            .retain(|path, _| !options.tracks(Path::new(path)));
        for entry in current.entries.values() {
            baseline.insert(entry.clone());
        }
        baseline.updated_at = Utc::now();
        self.store.save(&baseline)
    }
}
