//! Memoized modification-time lookups.
//!
//! Every `stat` performed during resolution goes through [`TimestampCache`],
//! so a file is queried at most once per run unless it is explicitly
//! invalidated (after it has been recompiled or relinked).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Cache of last-modified times keyed by canonical path.
///
/// A missing file is cached as `None`; that answer is also dropped by
/// [`invalidate`](Self::invalidate), so an artifact produced later in the run
/// is picked up.
#[derive(Debug, Default)]
pub struct TimestampCache {
    entries: HashMap<PathBuf, Option<SystemTime>>,
    /// Spelling as requested → canonical path, for paths that existed.
    aliases: HashMap<PathBuf, PathBuf>,
}

impl TimestampCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last-modified time of `path`, or `None` if it does not exist.
    pub fn modified(&mut self, path: &Path) -> Option<SystemTime> {
        let key = self.cache_key(path);
        if let Some(cached) = self.entries.get(&key) {
            return *cached;
        }
        let mtime = file_mtime(path);
        self.entries.insert(key, mtime);
        mtime
    }

    /// Forget the cached time of `path`.
    pub fn invalidate(&mut self, path: &Path) {
        let key = self.cache_key(path);
        self.entries.remove(&key);
    }

    /// Canonical form of `path` when it exists, the path itself otherwise.
    ///
    /// Successful canonicalizations are remembered. Artifacts that have not
    /// been produced yet are retried on every lookup; they are always built
    /// from canonical directories so the raw path is stable.
    fn cache_key(&mut self, path: &Path) -> PathBuf {
        if let Some(canonical) = self.aliases.get(path) {
            return canonical.clone();
        }
        match fs::canonicalize(path) {
            Ok(canonical) => {
                self.aliases.insert(path.to_path_buf(), canonical.clone());
                canonical
            }
            Err(_) => path.to_path_buf(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Uncached mtime of a file.
fn file_mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).ok()?.modified().ok()
}
