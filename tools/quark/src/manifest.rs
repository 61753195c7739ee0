//! Build manifest recording how each object artifact was produced.
//!
//! Timestamps alone cannot tell that an object was built with different
//! flags. The manifest stores a SHA-256 hash of the compile command line per
//! object, persisted as JSON in the build directory. An object whose
//! recorded hash differs from the current command is stale; an object with
//! no entry falls back to the timestamp check alone.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Current schema version. Bump when the manifest format changes.
const MANIFEST_VERSION: u32 = 1;

/// Manifest filename within the build directory.
const MANIFEST_FILE: &str = "quark-manifest.json";

/// Result of a freshness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FreshResult {
    Fresh,
    /// Needs rebuilding, with a human-readable reason.
    Stale(String),
}

impl FreshResult {
    #[cfg(test)]
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh)
    }
}

/// Per-object record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectEntry {
    /// SHA-256 of the compile command line.
    pub command_hash: String,
    /// Source the object was compiled from.
    pub source: PathBuf,
}

/// Persisted manifest, keyed by object path.
#[derive(Debug, Serialize, Deserialize)]
pub struct BuildManifest {
    pub version: u32,
    pub objects: BTreeMap<PathBuf, ObjectEntry>,
}

impl Default for BuildManifest {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildManifest {
    pub fn new() -> Self {
        Self {
            version: MANIFEST_VERSION,
            objects: BTreeMap::new(),
        }
    }

    /// Load `<build_dir>/quark-manifest.json`.
    ///
    /// Returns `None` if the file is missing, corrupt, or from another schema
    /// version.
    pub fn load(build_dir: &Path) -> Option<Self> {
        let data = fs::read_to_string(build_dir.join(MANIFEST_FILE)).ok()?;
        let manifest: Self = serde_json::from_str(&data).ok()?;
        (manifest.version == MANIFEST_VERSION).then_some(manifest)
    }

    /// Load, or start empty.
    pub fn load_or_default(build_dir: &Path) -> Self {
        Self::load(build_dir).unwrap_or_default()
    }

    /// Save atomically (write to tmp, then rename).
    pub fn save(&self, build_dir: &Path) -> Result<()> {
        fs::create_dir_all(build_dir)?;

        let path = build_dir.join(MANIFEST_FILE);
        let tmp_path = build_dir.join(format!("{MANIFEST_FILE}.tmp"));

        let json = serde_json::to_string_pretty(self).context("failed to serialize build manifest")?;
        fs::write(&tmp_path, json).context("failed to write temporary build manifest")?;
        fs::rename(&tmp_path, &path).context("failed to atomically replace build manifest")?;
        Ok(())
    }

    /// Compare the recorded command hash for `object` against `command_hash`.
    pub fn check(&self, object: &Path, command_hash: &str) -> FreshResult {
        match self.objects.get(object) {
            Some(entry) if entry.command_hash != command_hash => {
                FreshResult::Stale("compile command changed".into())
            }
            _ => FreshResult::Fresh,
        }
    }

    /// Record a successful compilation.
    pub fn record(&mut self, object: PathBuf, source: PathBuf, command_hash: String) {
        self.objects.insert(
            object,
            ObjectEntry {
                command_hash,
                source,
            },
        );
    }

    /// Drop the entry for an object that was removed or failed to build.
    pub fn forget(&mut self, object: &Path) {
        self.objects.remove(object);
    }
}

/// SHA-256 of a command line, as hex.
pub fn hash_command(command_line: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(command_line.as_bytes());
    format!("{:x}", hasher.finalize())
}
