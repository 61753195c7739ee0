//! Compilation units: one per canonical source or header path.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Index of a unit in the registry arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub(crate) usize);

/// Whether a file is compiled on its own or only included.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Source,
    Header,
}

const SOURCE_EXTENSIONS: &[&str] = &["c", "cc", "cpp", "cxx", "c++", "C", "m", "mm"];
const HEADER_EXTENSIONS: &[&str] = &["h", "hh", "hpp", "hxx", "h++", "H", "inl", "tcc"];

impl FileKind {
    /// Classify a path by extension. `None` for anything quark does not build.
    pub fn of(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        if SOURCE_EXTENSIONS.contains(&ext) {
            Some(Self::Source)
        } else if HEADER_EXTENSIONS.contains(&ext) {
            Some(Self::Header)
        } else {
            None
        }
    }

    /// Extensions tried when looking for a header's sibling source.
    pub fn source_extensions() -> &'static [&'static str] {
        SOURCE_EXTENSIONS
    }
}

/// A single source or header file tracked by canonical path.
#[derive(Debug)]
pub struct CompilationUnit {
    pub path: PathBuf,
    pub kind: FileKind,
    /// Include names as written, in directive order.
    pub include_names: Vec<String>,
    /// Directly included units that were found on disk, in order, no duplicates.
    pub included_units: Vec<UnitId>,
    pub has_entry_point: bool,
    pub object_path: PathBuf,
    /// Indices into the library registry whose triggers matched an include.
    pub triggered_libraries: BTreeSet<usize>,
    /// For headers: the sibling source with the same stem.
    pub corresponding_source: Option<UnitId>,
    /// Units produced by code generators for this file (also in `included_units`).
    pub generated_units: Vec<UnitId>,
    pub(crate) transitive_mtime: Option<SystemTime>,
    pub(crate) transitive_libraries: Option<BTreeSet<usize>>,
}

impl CompilationUnit {
    pub(crate) fn new(path: PathBuf, kind: FileKind, object_path: PathBuf) -> Self {
        Self {
            path,
            kind,
            include_names: Vec::new(),
            included_units: Vec::new(),
            has_entry_point: false,
            object_path,
            triggered_libraries: BTreeSet::new(),
            corresponding_source: None,
            generated_units: Vec::new(),
            transitive_mtime: None,
            transitive_libraries: None,
        }
    }

    pub fn is_source(&self) -> bool {
        self.kind == FileKind::Source
    }

    /// File stem, used to name link outputs.
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Link output path: set only for entry points or shared artifacts.
    pub fn link_output_path(&self, build_dir: &Path, shared: bool) -> Option<PathBuf> {
        if shared {
            Some(build_dir.join("lib").join(format!("lib{}.so", self.stem())))
        } else if self.has_entry_point {
            Some(build_dir.join("bin").join(self.stem()))
        } else {
            None
        }
    }
}

/// Object artifact location for a source at `path`.
///
/// Mirrors the path relative to the project root under `<build>/obj`, keeping
/// the source extension so `a.c` and `a.cc` do not collide. Files outside
/// the root are placed under `<build>/obj/_ext`.
pub fn object_path_for(root: &Path, build_dir: &Path, path: &Path) -> PathBuf {
    let rel: PathBuf = match path.strip_prefix(root) {
        Ok(rel) => rel.to_path_buf(),
        Err(_) => {
            let mut rel = PathBuf::from("_ext");
            rel.extend(path.components().filter(|c| {
                matches!(c, std::path::Component::Normal(_))
            }));
            rel
        }
    };
    let mut name = build_dir.join("obj").join(rel).into_os_string();
    name.push(".o");
    PathBuf::from(name)
}
