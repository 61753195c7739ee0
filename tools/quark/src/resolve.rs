//! Dependency resolution: from build targets to the sets of units that must
//! be compiled and executables that must be linked.
//!
//! A target is a directory (walked recursively), a source or header file, or
//! the bare name of an executable. Staleness of every object is decided here
//! from the registry's transitive timestamps and the build manifest.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use walkdir::{DirEntry, WalkDir};

use crate::compile::{compile_task, display_label};
use crate::link::publish_output;
use crate::manifest::{BuildManifest, FreshResult};
use crate::registry::{Registry, ResolveError};
use crate::unit::{FileKind, UnitId};
use crate::verbose::vprintln;

/// Version-control metadata directories never descended into.
const VCS_DIRS: &[&str] = &[".git", ".hg", ".svn", "CVS", "_darcs"];

#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    /// Treat every object as stale.
    pub force: bool,
    /// Produce a shared artifact for every source instead of executables.
    pub shared: bool,
}

/// Outcome of resolving one or more targets.
#[derive(Debug, Default)]
pub struct Resolution {
    pub to_compile: BTreeSet<UnitId>,
    /// Executables whose output must be (re)linked.
    pub to_link: BTreeSet<UnitId>,
    pub executables: BTreeSet<UnitId>,
    /// Link set of every executable, in link order.
    pub link_sets: HashMap<UnitId, Vec<UnitId>>,
    /// Executables whose output is already current.
    pub up_to_date: Vec<UnitId>,
    pub warnings: Vec<String>,
    /// Per-file failures that did not stop the rest of the walk.
    pub errors: Vec<(PathBuf, ResolveError)>,
}

impl Resolution {
    /// Fold the resolution of another target into this one.
    pub fn merge(&mut self, other: Resolution) {
        self.to_compile.extend(other.to_compile);
        self.to_link.extend(other.to_link);
        self.executables.extend(other.executables);
        self.link_sets.extend(other.link_sets);
        for id in other.up_to_date {
            if !self.up_to_date.contains(&id) {
                self.up_to_date.push(id);
            }
        }
        self.warnings.extend(other.warnings);
        self.errors.extend(other.errors);
    }
}

pub struct Resolver<'r, 'a> {
    registry: &'r mut Registry<'a>,
    manifest: &'r BuildManifest,
    options: ResolveOptions,
    stale: HashMap<UnitId, bool>,
}

impl<'r, 'a> Resolver<'r, 'a> {
    pub fn new(
        registry: &'r mut Registry<'a>,
        manifest: &'r BuildManifest,
        options: ResolveOptions,
    ) -> Self {
        Self {
            registry,
            manifest,
            options,
            stale: HashMap::new(),
        }
    }

    /// Resolve a single target.
    ///
    /// A directory target never fails as a whole: per-file errors are
    /// collected in [`Resolution::errors`]. A name that matches no file and
    /// no executable only produces a warning.
    pub fn resolve(&mut self, target: &Path) -> Result<Resolution, ResolveError> {
        let mut resolution = Resolution::default();
        if target.is_dir() {
            self.resolve_dir(target, &mut resolution);
        } else if target.exists() {
            self.resolve_file(target, &mut resolution)?;
        } else if let Some(path) = self.find_executable(target) {
            self.resolve_file(&path, &mut resolution)?;
        } else {
            resolution
                .warnings
                .push(format!("{}: no such file or executable; skipped", target.display()));
        }
        Ok(resolution)
    }

    fn resolve_dir(&mut self, dir: &Path, resolution: &mut Resolution) {
        let config = self.registry.config();
        let root = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
        let walker = WalkDir::new(&root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !(is_vcs_or_hidden(e) || config.is_build_output(e.path())));
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    resolution.warnings.push(format!("skipping unreadable entry: {e}"));
                    continue;
                }
            };
            if entry.file_type().is_dir() || FileKind::of(entry.path()) != Some(FileKind::Source) {
                continue;
            }
            if let Err(e) = self.resolve_file(entry.path(), resolution) {
                resolution.errors.push((entry.path().to_path_buf(), e));
            }
        }
    }

    fn resolve_file(&mut self, path: &Path, resolution: &mut Resolution) -> Result<(), ResolveError> {
        let Some(kind) = FileKind::of(path) else {
            resolution
                .warnings
                .push(format!("{}: not a source or header file; skipped", path.display()));
            return Ok(());
        };
        let mut id = self.registry.get(path)?;
        if kind == FileKind::Header {
            match self.registry.unit(id).corresponding_source {
                Some(source) => id = source,
                None => {
                    resolution
                        .warnings
                        .push(format!("{}: header has no corresponding source; skipped", path.display()));
                    return Ok(());
                }
            }
        }
        self.consider_source(id, resolution)
    }

    fn consider_source(&mut self, id: UnitId, resolution: &mut Resolution) -> Result<(), ResolveError> {
        let unit = self.registry.unit(id);
        if !unit.has_entry_point && !self.options.shared {
            if self.is_stale(id) {
                resolution.to_compile.insert(id);
            }
            return Ok(());
        }

        // Nothing lands in `resolution` unless the whole link set resolved.
        let link_set = self.link_set(id)?;
        let stale: Vec<UnitId> = link_set.iter().copied().filter(|&m| self.is_stale(m)).collect();

        if stale.is_empty() && self.output_is_current(id, &link_set) {
            let config = self.registry.config();
            let label = display_label(&config.root, &self.registry.unit(id).path);
            vprintln!("  {label} is up to date");
            if let Some(output) = self.registry.unit(id).link_output_path(&config.build_dir, self.options.shared) {
                if let Err(e) = publish_output(config, &output) {
                    resolution.warnings.push(format!("{e:#}"));
                }
            }
            if !resolution.up_to_date.contains(&id) {
                resolution.up_to_date.push(id);
            }
        } else {
            resolution.to_link.insert(id);
        }
        resolution.to_compile.extend(stale);
        resolution.executables.insert(id);
        resolution.link_sets.insert(id, link_set);
        Ok(())
    }

    /// Whether the link output exists and is at least as new as every object.
    fn output_is_current(&mut self, id: UnitId, link_set: &[UnitId]) -> bool {
        let config = self.registry.config();
        let Some(output) = self.registry.unit(id).link_output_path(&config.build_dir, self.options.shared) else {
            return false;
        };
        let Some(output_mtime) = self.registry.modified(&output) else {
            return false;
        };
        link_set.iter().all(|&member| {
            let object = self.registry.unit(member).object_path.clone();
            self.registry.modified(&object).is_some_and(|m| m <= output_mtime)
        })
    }

    /// Transitive closure of units linked into `exe`, starting with `exe`.
    ///
    /// Sources are taken as they are; headers contribute their corresponding
    /// source. Sources of compile-as-source libraries triggered anywhere in
    /// the closure are folded in until no new library appears.
    pub fn link_set(&mut self, exe: UnitId) -> Result<Vec<UnitId>, ResolveError> {
        let mut visited = HashSet::new();
        let mut order = Vec::new();
        self.collect(exe, &mut visited, &mut order);

        let config = self.registry.config();
        let mut folded = BTreeSet::new();
        loop {
            let mut triggered = BTreeSet::new();
            for &id in &order {
                triggered.extend(self.registry.transitive_libraries(id));
            }
            let fresh: Vec<usize> = triggered
                .into_iter()
                .filter(|&idx| config.libraries[idx].compile_as_source && folded.insert(idx))
                .collect();
            if fresh.is_empty() {
                break;
            }
            for idx in fresh {
                for source in &config.libraries[idx].sources {
                    let id = self.registry.get(source)?;
                    self.collect(id, &mut visited, &mut order);
                }
            }
        }
        Ok(order)
    }

    fn collect(&self, id: UnitId, visited: &mut HashSet<UnitId>, order: &mut Vec<UnitId>) {
        if !visited.insert(id) {
            return;
        }
        let unit = self.registry.unit(id);
        if unit.is_source() {
            order.push(id);
        } else if let Some(source) = unit.corresponding_source {
            self.collect(source, visited, order);
        }
        for &inc in &unit.included_units {
            self.collect(inc, visited, order);
        }
    }

    /// Whether the unit's object must be rebuilt. Memoized per run.
    pub fn is_stale(&mut self, id: UnitId) -> bool {
        if let Some(&stale) = self.stale.get(&id) {
            return stale;
        }
        let reason = self.stale_reason(id);
        if let Some(reason) = &reason {
            let config = self.registry.config();
            vprintln!(
                "  {} is stale: {reason}",
                display_label(&config.root, &self.registry.unit(id).path)
            );
        }
        self.stale.insert(id, reason.is_some());
        reason.is_some()
    }

    fn stale_reason(&mut self, id: UnitId) -> Option<String> {
        if self.options.force {
            return Some("forced".into());
        }
        let object = self.registry.unit(id).object_path.clone();
        let Some(object_mtime) = self.registry.modified(&object) else {
            return Some("object missing".into());
        };
        if object_mtime < self.registry.transitive_last_modified(id) {
            return Some("dependencies changed".into());
        }
        let task = compile_task(self.registry, id);
        match self.manifest.check(&object, &task.command_hash) {
            FreshResult::Fresh => None,
            FreshResult::Stale(reason) => Some(reason),
        }
    }

    /// Find `<name>.<source ext>` in the source directories, then the root.
    fn find_executable(&self, name: &Path) -> Option<PathBuf> {
        let config = self.registry.config();
        let name = name.to_str()?;
        config
            .source_dirs
            .iter()
            .chain(std::iter::once(&config.root))
            .flat_map(|dir| {
                FileKind::source_extensions()
                    .iter()
                    .map(move |ext| dir.join(format!("{name}.{ext}")))
            })
            .find(|candidate| candidate.is_file())
    }
}

fn is_vcs_or_hidden(entry: &DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || VCS_DIRS.contains(&name.as_ref())
}
