//! Compilation unit registry.
//!
//! Owns every [`CompilationUnit`] in an arena indexed by [`UnitId`], with a
//! lookup table keyed by canonical path. A file is read and scanned exactly
//! once, the first time it is requested; its includes are resolved and
//! registered recursively. Transitive queries (latest mtime, triggered
//! libraries) are memoized per unit and are safe on include cycles.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::command::{self, quote_path};
use crate::config::{BuildConfig, Generator};
use crate::scan::{self, IncludeStyle};
use crate::timestamps::TimestampCache;
use crate::unit::{CompilationUnit, FileKind, UnitId, object_path_for};
use crate::verbose::vprintln;

/// Errors that abort resolution of the current target.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported file kind: {}", .0.display())]
    UnsupportedFileKind(PathBuf),
    #[error("generator '{name}' failed for {}: {detail}", input.display())]
    Generator {
        name: String,
        input: PathBuf,
        detail: String,
    },
}

/// Arena of compilation units for one build run.
pub struct Registry<'a> {
    config: &'a BuildConfig,
    units: Vec<CompilationUnit>,
    by_path: HashMap<PathBuf, UnitId>,
    timestamps: TimestampCache,
}

impl<'a> Registry<'a> {
    pub fn new(config: &'a BuildConfig) -> Self {
        Self {
            config,
            units: Vec::new(),
            by_path: HashMap::new(),
            timestamps: TimestampCache::new(),
        }
    }

    pub fn config(&self) -> &'a BuildConfig {
        self.config
    }

    pub fn unit(&self, id: UnitId) -> &CompilationUnit {
        &self.units[id.0]
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Look up or create the unit for `path`.
    ///
    /// Idempotent: any spelling of the same file yields the same [`UnitId`].
    pub fn get(&mut self, path: &Path) -> Result<UnitId, ResolveError> {
        let kind = FileKind::of(path)
            .ok_or_else(|| ResolveError::UnsupportedFileKind(path.to_path_buf()))?;
        self.get_as(path, kind)
    }

    /// Existing unit for `path`, without creating one.
    #[cfg(test)]
    pub fn lookup(&self, path: &Path) -> Option<UnitId> {
        let canonical = std::fs::canonicalize(path).ok()?;
        self.by_path.get(&lookup_key(&canonical)).copied()
    }

    fn get_as(&mut self, path: &Path, kind: FileKind) -> Result<UnitId, ResolveError> {
        let canonical = std::fs::canonicalize(path).map_err(|source| ResolveError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = self.config;
        let key = lookup_key(&canonical);
        if let Some(&id) = self.by_path.get(&key) {
            return Ok(id);
        }

        let text = std::fs::read(&canonical).map_err(|source| ResolveError::Io {
            path: canonical.clone(),
            source,
        })?;
        let text = String::from_utf8_lossy(&text);

        // Register before resolving includes so cycles find this entry.
        let id = UnitId(self.units.len());
        let object_path = object_path_for(&config.root, &config.build_dir, &canonical);
        self.units.push(CompilationUnit::new(canonical.clone(), kind, object_path));
        self.by_path.insert(key, id);

        if let Err(e) = self.fill(id, &canonical, kind, &text) {
            self.roll_back(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Scan a freshly registered unit and resolve everything it pulls in.
    fn fill(&mut self, id: UnitId, canonical: &Path, kind: FileKind, text: &str) -> Result<(), ResolveError> {
        let config = self.config;
        let scanned = scan::scan(text);
        if scanned.conditionals > 0 {
            vprintln!(
                "  {}: {} conditional directive(s), every include counted",
                canonical.display(),
                scanned.conditionals
            );
        }
        let dir = canonical.parent().unwrap_or(Path::new("/")).to_path_buf();

        let mut included = Vec::new();
        let mut triggered = BTreeSet::new();
        let mut include_names = Vec::with_capacity(scanned.includes.len());
        for include in &scanned.includes {
            for (idx, lib) in config.libraries.iter().enumerate() {
                if lib.is_triggered_by(&include.name) {
                    triggered.insert(idx);
                }
            }
            include_names.push(include.name.clone());

            let Some(found) = self.find_include(&dir, &include.name, include.style) else {
                vprintln!("  unresolved include <{}> in {}", include.name, canonical.display());
                continue;
            };
            let inc_kind = FileKind::of(&found).unwrap_or(FileKind::Header);
            let inc_id = self.get_as(&found, inc_kind)?;
            if inc_id != id && !included.contains(&inc_id) {
                included.push(inc_id);
            }
        }

        let mut generated = Vec::new();
        for generator in &config.generators {
            if scan::contains_token(text, &generator.trigger) {
                let output = self.run_generator(generator, canonical)?;
                let gen_kind = FileKind::of(&output).unwrap_or(FileKind::Source);
                let gen_id = self.get_as(&output, gen_kind)?;
                if gen_id != id && !included.contains(&gen_id) {
                    included.push(gen_id);
                }
                generated.push(gen_id);
            }
        }

        let corresponding = if kind == FileKind::Header {
            self.find_sibling_source(canonical)?
        } else {
            None
        };

        let unit = &mut self.units[id.0];
        unit.include_names = include_names;
        unit.included_units = included;
        unit.triggered_libraries = triggered;
        unit.has_entry_point = kind == FileKind::Source && scanned.has_entry_point;
        unit.generated_units = generated;
        unit.corresponding_source = corresponding;
        Ok(())
    }

    /// Drop `first` and every unit registered after it.
    ///
    /// Units are only handed out once their whole include tree resolved, so
    /// everything from `first` on belongs to the failed request.
    fn roll_back(&mut self, first: UnitId) {
        self.units.truncate(first.0);
        self.by_path.retain(|_, id| id.0 < first.0);
    }

    /// Resolve an include name against the including directory (quoted
    /// includes only) and the configured source directories.
    fn find_include(&self, dir: &Path, name: &str, style: IncludeStyle) -> Option<PathBuf> {
        let own_dir = (style == IncludeStyle::Quoted).then_some(dir);
        own_dir
            .into_iter()
            .chain(self.config.source_dirs.iter().map(PathBuf::as_path))
            .map(|d| d.join(name))
            .find(|candidate| candidate.is_file())
    }

    fn find_sibling_source(&mut self, header: &Path) -> Result<Option<UnitId>, ResolveError> {
        for ext in FileKind::source_extensions() {
            let candidate = header.with_extension(ext);
            if candidate.is_file() {
                return self.get_as(&candidate, FileKind::Source).map(Some);
            }
        }
        Ok(None)
    }

    /// Run a code generator once for `input`, unless its output is current.
    fn run_generator(&mut self, generator: &Generator, input: &Path) -> Result<PathBuf, ResolveError> {
        let gen_dir = self.config.build_dir.join("gen");
        let output = gen_dir.join(generator.output_file_name(input));
        let input_mtime = self.timestamps.modified(input);
        let output_mtime = self.timestamps.modified(&output);
        if matches!((output_mtime, input_mtime), (Some(o), Some(i)) if o >= i) {
            return Ok(output);
        }

        let fail = |detail: String| ResolveError::Generator {
            name: generator.name.clone(),
            input: input.to_path_buf(),
            detail,
        };
        std::fs::create_dir_all(&gen_dir).map_err(|e| fail(e.to_string()))?;
        let command_line = command::expand(
            &generator.command,
            &[("input", &quote_path(input)), ("output", &quote_path(&output))],
        );
        vprintln!("  generating {} ({})", output.display(), generator.name);
        let result = command::run_shell(&command_line, &self.config.root)
            .map_err(|e| fail(format!("{e:#}")))?;
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let detail = match stderr.trim() {
                "" => result.status.to_string(),
                text => format!("{}: {text}", result.status),
            };
            return Err(fail(detail));
        }
        self.timestamps.invalidate(&output);
        if self.timestamps.modified(&output).is_none() {
            return Err(fail(format!("{} was not produced", output.display())));
        }
        Ok(output)
    }

    /// Own last-modified time of a unit's file.
    pub fn last_modified(&mut self, id: UnitId) -> Option<SystemTime> {
        let path = self.units[id.0].path.clone();
        self.timestamps.modified(&path)
    }

    /// Cached mtime of an arbitrary path (objects, link outputs).
    pub fn modified(&mut self, path: &Path) -> Option<SystemTime> {
        self.timestamps.modified(path)
    }

    /// Drop the cached mtime of `path` after it was rewritten.
    pub fn invalidate(&mut self, path: &Path) {
        self.timestamps.invalidate(path);
    }

    /// Latest mtime over the unit and everything it transitively includes.
    ///
    /// A unit reached again while its own value is still being computed (an
    /// include cycle) contributes only its own mtime.
    pub fn transitive_last_modified(&mut self, id: UnitId) -> SystemTime {
        let mut on_stack = HashSet::new();
        let (latest, _) = self.transitive_mtime_inner(id, &mut on_stack);
        self.units[id.0].transitive_mtime = Some(latest);
        latest
    }

    /// Returns the value and whether a back edge was cut below `id`. Values
    /// computed under a cut are partial and only the outermost call caches.
    fn transitive_mtime_inner(
        &mut self,
        id: UnitId,
        on_stack: &mut HashSet<UnitId>,
    ) -> (SystemTime, bool) {
        if let Some(cached) = self.units[id.0].transitive_mtime {
            return (cached, false);
        }
        let own = self.last_modified(id).unwrap_or(UNIX_EPOCH);
        if !on_stack.insert(id) {
            return (own, true);
        }
        let mut latest = own;
        let mut cut = false;
        for inc in self.units[id.0].included_units.clone() {
            let (time, inc_cut) = self.transitive_mtime_inner(inc, on_stack);
            latest = latest.max(time);
            cut |= inc_cut;
        }
        on_stack.remove(&id);
        if !cut {
            self.units[id.0].transitive_mtime = Some(latest);
        }
        (latest, cut)
    }

    /// Libraries triggered by the unit or anything it transitively includes,
    /// as registry indices (iteration order is declaration order).
    pub fn transitive_libraries(&mut self, id: UnitId) -> BTreeSet<usize> {
        let mut on_stack = HashSet::new();
        let (libs, _) = self.transitive_libraries_inner(id, &mut on_stack);
        self.units[id.0].transitive_libraries = Some(libs.clone());
        libs
    }

    fn transitive_libraries_inner(
        &mut self,
        id: UnitId,
        on_stack: &mut HashSet<UnitId>,
    ) -> (BTreeSet<usize>, bool) {
        if let Some(cached) = &self.units[id.0].transitive_libraries {
            return (cached.clone(), false);
        }
        let mut libs = self.units[id.0].triggered_libraries.clone();
        if !on_stack.insert(id) {
            return (libs, true);
        }
        let mut cut = false;
        for inc in self.units[id.0].included_units.clone() {
            let (inc_libs, inc_cut) = self.transitive_libraries_inner(inc, on_stack);
            libs.extend(inc_libs);
            cut |= inc_cut;
        }
        on_stack.remove(&id);
        if !cut {
            self.units[id.0].transitive_libraries = Some(libs.clone());
        }
        (libs, cut)
    }
}

/// Lookup-table key: the canonical path, case-folded where the filesystem
/// is case-insensitive.
#[cfg(any(target_os = "macos", windows))]
fn lookup_key(canonical: &Path) -> PathBuf {
    PathBuf::from(canonical.to_string_lossy().to_lowercase())
}

#[cfg(not(any(target_os = "macos", windows)))]
fn lookup_key(canonical: &Path) -> PathBuf {
    canonical.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::time::Duration;

    fn write(dir: &Path, rel: &str, contents: &str) -> PathBuf {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
        path
    }

    fn set_mtime(path: &Path, time: SystemTime) {
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(time)
            .unwrap();
    }

    #[test]
    fn get_is_idempotent_and_canonicalizing() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/a.cc", "int x;\n");
        let config = BuildConfig::load(dir.path()).unwrap();
        let mut registry = Registry::new(&config);

        let a = registry.get(&dir.path().join("src/a.cc")).unwrap();
        let b = registry.get(&dir.path().join("src/../src/a.cc")).unwrap();
        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unsupported_kind_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "notes.txt", "");
        let config = BuildConfig::load(dir.path()).unwrap();
        let mut registry = Registry::new(&config);

        assert!(matches!(
            registry.get(&dir.path().join("notes.txt")),
            Err(ResolveError::UnsupportedFileKind(_))
        ));
        assert!(matches!(
            registry.get(&dir.path().join("gone.cc")),
            Err(ResolveError::Io { .. })
        ));
    }

    #[test]
    fn includes_resolve_against_own_dir_then_source_dirs() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "quark.toml",
            "[project]\nsource-dirs = [\"include\"]\n",
        );
        let main = write(
            dir.path(),
            "src/main.cc",
            "#include \"local.h\"\n#include <shared.h>\n#include <vector>\nint main() {}\n",
        );
        write(dir.path(), "src/local.h", "");
        write(dir.path(), "include/shared.h", "");

        let config = BuildConfig::load(dir.path()).unwrap();
        let mut registry = Registry::new(&config);
        let id = registry.get(&main).unwrap();
        let unit = registry.unit(id);

        assert!(unit.has_entry_point);
        assert_eq!(unit.include_names, ["local.h", "shared.h", "vector"]);
        let included: Vec<_> = unit
            .included_units
            .iter()
            .map(|&i| registry.unit(i).path.file_name().unwrap().to_owned())
            .collect();
        assert_eq!(included, ["local.h", "shared.h"]);
    }

    #[test]
    fn header_finds_sibling_source() {
        let dir = tempfile::tempdir().unwrap();
        let header = write(dir.path(), "util.h", "int util();\n");
        write(dir.path(), "util.cc", "#include \"util.h\"\nint util() { return 1; }\n");
        let config = BuildConfig::load(dir.path()).unwrap();
        let mut registry = Registry::new(&config);

        let h = registry.get(&header).unwrap();
        let source = registry.unit(h).corresponding_source.unwrap();
        assert!(registry.unit(source).is_source());
        assert!(!registry.unit(source).has_entry_point);
        // The source includes the header back; same unit.
        assert_eq!(registry.unit(source).included_units, vec![h]);
    }

    #[test]
    fn transitive_mtime_handles_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a.h", "#include \"b.h\"\n");
        let b = write(dir.path(), "b.h", "#include \"a.h\"\n");
        let main = write(dir.path(), "main.cc", "#include \"a.h\"\nint main() {}\n");

        let base = SystemTime::now() - Duration::from_secs(1000);
        set_mtime(&main, base);
        set_mtime(&a, base + Duration::from_secs(10));
        set_mtime(&b, base + Duration::from_secs(20));

        let config = BuildConfig::load(dir.path()).unwrap();
        let mut registry = Registry::new(&config);
        let id = registry.get(&main).unwrap();
        assert_eq!(
            registry.transitive_last_modified(id),
            base + Duration::from_secs(20)
        );
    }

    #[test]
    fn cycle_members_are_not_cached_partially() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a.h", "#include \"b.h\"\n#include \"c.h\"\n");
        let b = write(dir.path(), "b.h", "#include \"a.h\"\n");
        let c = write(dir.path(), "c.h", "");
        let main = write(dir.path(), "main.cc", "#include \"a.h\"\nint main() {}\n");

        let base = SystemTime::now() - Duration::from_secs(1000);
        set_mtime(&main, base);
        set_mtime(&a, base);
        set_mtime(&b, base);
        set_mtime(&c, base + Duration::from_secs(30));

        let config = BuildConfig::load(dir.path()).unwrap();
        let mut registry = Registry::new(&config);
        let main_id = registry.get(&main).unwrap();
        let b_id = registry.get(&b).unwrap();
        assert_eq!(registry.transitive_last_modified(main_id), base + Duration::from_secs(30));
        // b.h reaches c.h only through a.h, which was on the stack above.
        assert_eq!(registry.transitive_last_modified(b_id), base + Duration::from_secs(30));
    }

    #[test]
    fn libraries_propagate_through_includes() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "quark.toml",
            r#"
            [[library]]
            name = "zlib"
            triggers = ["zlib.h"]
            link-flags = ["-lz"]

            [[library]]
            name = "m"
            triggers = ["math.h", "cmath"]
            link-flags = ["-lm"]
            "#,
        );
        let main = write(dir.path(), "main.cc", "#include \"io.h\"\n#include <cmath>\nint main() {}\n");
        write(dir.path(), "io.h", "#include <zlib.h>\n");

        let config = BuildConfig::load(dir.path()).unwrap();
        let mut registry = Registry::new(&config);
        let id = registry.get(&main).unwrap();
        assert_eq!(registry.unit(id).triggered_libraries, BTreeSet::from([1]));
        assert_eq!(registry.transitive_libraries(id), BTreeSet::from([0, 1]));
    }

    #[test]
    fn generator_output_is_folded_in_as_include() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "quark.toml",
            r#"
            [[generator]]
            name = "moc"
            trigger = "Q_OBJECT"
            command = "echo '// generated' > {output}"
            "#,
        );
        let header = write(dir.path(), "widget.h", "class Widget { Q_OBJECT };\n");

        let config = BuildConfig::load(dir.path()).unwrap();
        let mut registry = Registry::new(&config);
        let id = registry.get(&header).unwrap();
        let unit = registry.unit(id);
        assert_eq!(unit.generated_units.len(), 1);
        let generated = registry.unit(unit.generated_units[0]);
        assert!(generated.is_source());
        assert!(generated.path.ends_with("gen/moc_widget.cc"));
        assert!(unit.included_units.contains(&unit.generated_units[0]));
    }

    #[test]
    fn failing_generator_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "quark.toml",
            "[[generator]]\nname = \"moc\"\ntrigger = \"Q_OBJECT\"\ncommand = \"false {input} {output}\"\n",
        );
        let header = write(dir.path(), "widget.h", "Q_OBJECT\n");
        let config = BuildConfig::load(dir.path()).unwrap();
        let mut registry = Registry::new(&config);
        let err = registry.get(&header).unwrap_err();
        assert!(matches!(err, ResolveError::Generator { .. }));
        assert!(err.to_string().contains("exit status"), "{err}");
    }

    #[test]
    fn failed_unit_is_not_left_half_registered() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "quark.toml",
            "[[generator]]\nname = \"moc\"\ntrigger = \"Q_OBJECT\"\ncommand = \"false {input} {output}\"\n",
        );
        let widget = write(dir.path(), "widget.h", "#include \"base.h\"\nQ_OBJECT\n");
        let base = write(dir.path(), "base.h", "int base();\n");
        let main = write(dir.path(), "main.cc", "#include \"base.h\"\nint main() {}\n");
        let config = BuildConfig::load(dir.path()).unwrap();
        let mut registry = Registry::new(&config);

        assert!(registry.get(&widget).is_err());
        assert_eq!(registry.len(), 0);
        assert!(registry.lookup(&widget).is_none());
        assert!(registry.lookup(&base).is_none());
        // Asking again reports the failure again instead of a truncated unit.
        assert!(registry.get(&widget).is_err());

        // A sibling sharing the header still sees its full include tree.
        let id = registry.get(&main).unwrap();
        let included = &registry.unit(id).included_units;
        assert_eq!(included.len(), 1);
        assert_eq!(registry.unit(included[0]).path, fs::canonicalize(&base).unwrap());
    }
}
