//! Configuration loading and validation.
//!
//! Parses `quark.toml` from the project root into a [`BuildConfig`]: one
//! immutable value, with absolute paths and validated templates, that is
//! handed to the resolver, scheduler and linker. A project without a
//! `quark.toml` builds with the defaults below.

use anyhow::{Context, Result, bail, ensure};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::unit::FileKind;

/// Configuration file name looked up in the project root.
pub const CONFIG_FILE: &str = "quark.toml";

const DEFAULT_COMPILE_COMMAND: &str = "{compiler} {flags} -c {input} -o {output}";
const DEFAULT_LINK_COMMAND: &str = "{linker} {objects} {flags} -o {output}";

// ===========================================================================
// Raw (file) representation
// ===========================================================================

/// Top-level layout of `quark.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    project: RawProject,
    #[serde(default)]
    compile: RawCompile,
    #[serde(default)]
    link: RawLink,
    #[serde(default)]
    remote: RawRemote,
    #[serde(default)]
    classify: RawClassify,
    #[serde(default, rename = "library")]
    libraries: Vec<RawLibrary>,
    #[serde(default, rename = "generator")]
    generators: Vec<RawGenerator>,
    /// `[overrides."src/file.cc"]` tables of option name -> literal value.
    #[serde(default)]
    overrides: BTreeMap<String, BTreeMap<String, String>>,
}

/// `[project]` section.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawProject {
    #[serde(default = "default_source_dirs")]
    source_dirs: Vec<String>,
    #[serde(default = "default_build_dir")]
    build_dir: String,
}

impl Default for RawProject {
    fn default() -> Self {
        Self {
            source_dirs: default_source_dirs(),
            build_dir: default_build_dir(),
        }
    }
}

fn default_source_dirs() -> Vec<String> {
    vec![".".into()]
}
fn default_build_dir() -> String {
    "build".into()
}

/// `[compile]` section.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawCompile {
    #[serde(default = "default_compile_command")]
    command: String,
    #[serde(default = "default_compiler")]
    compiler: String,
    #[serde(default)]
    flags: Vec<String>,
}

impl Default for RawCompile {
    fn default() -> Self {
        Self {
            command: default_compile_command(),
            compiler: default_compiler(),
            flags: Vec::new(),
        }
    }
}

fn default_compile_command() -> String {
    DEFAULT_COMPILE_COMMAND.into()
}
fn default_compiler() -> String {
    "c++".into()
}

/// `[link]` section.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawLink {
    #[serde(default = "default_link_command")]
    command: String,
    #[serde(default = "default_compiler")]
    linker: String,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default = "default_shared_flags")]
    shared_flags: Vec<String>,
    #[serde(default)]
    publish_dir: Option<String>,
    #[serde(default = "default_settle_timeout_ms")]
    settle_timeout_ms: u64,
    #[serde(default = "default_settle_poll_ms")]
    settle_poll_ms: u64,
}

impl Default for RawLink {
    fn default() -> Self {
        Self {
            command: default_link_command(),
            linker: default_compiler(),
            flags: Vec::new(),
            shared_flags: default_shared_flags(),
            publish_dir: None,
            settle_timeout_ms: default_settle_timeout_ms(),
            settle_poll_ms: default_settle_poll_ms(),
        }
    }
}

fn default_link_command() -> String {
    DEFAULT_LINK_COMMAND.into()
}
fn default_shared_flags() -> Vec<String> {
    vec!["-shared".into()]
}
fn default_settle_timeout_ms() -> u64 {
    10_000
}
fn default_settle_poll_ms() -> u64 {
    100
}

/// `[remote]` section.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawRemote {
    #[serde(default = "default_shell")]
    shell: String,
    #[serde(default = "default_shell_flags")]
    flags: Vec<String>,
    #[serde(default)]
    niceness: Option<i32>,
    #[serde(default = "default_max_retries")]
    max_retries: u32,
    #[serde(default)]
    hosts_file: Option<String>,
    #[serde(default = "default_still_waiting_secs")]
    still_waiting_secs: u64,
}

impl Default for RawRemote {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            flags: default_shell_flags(),
            niceness: None,
            max_retries: default_max_retries(),
            hosts_file: None,
            still_waiting_secs: default_still_waiting_secs(),
        }
    }
}

fn default_shell() -> String {
    "ssh".into()
}
fn default_shell_flags() -> Vec<String> {
    vec!["-x".into(), "-o".into(), "BatchMode=yes".into()]
}
fn default_max_retries() -> u32 {
    3
}
fn default_still_waiting_secs() -> u64 {
    30
}

/// `[classify]` section: substrings used by the failure classifier.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawClassify {
    #[serde(default = "default_connection_patterns")]
    connection_patterns: Vec<String>,
    #[serde(default = "default_home_dir_patterns")]
    home_dir_patterns: Vec<String>,
}

impl Default for RawClassify {
    fn default() -> Self {
        Self {
            connection_patterns: default_connection_patterns(),
            home_dir_patterns: default_home_dir_patterns(),
        }
    }
}

fn default_connection_patterns() -> Vec<String> {
    [
        "connection refused",
        "connection closed",
        "connection reset",
        "connection timed out",
        "lost connection",
        "no route to host",
        "could not resolve hostname",
        "connect to host",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_home_dir_patterns() -> Vec<String> {
    [
        "could not chdir to home directory",
        "no home directory",
        "home directory unavailable",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// `[[library]]` entry.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawLibrary {
    name: String,
    #[serde(default)]
    triggers: Vec<String>,
    #[serde(default)]
    compile_flags: Vec<String>,
    #[serde(default)]
    link_flags: Vec<String>,
    #[serde(default)]
    compile_as_source: bool,
    #[serde(default)]
    sources: Vec<String>,
}

/// `[[generator]]` entry.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawGenerator {
    name: String,
    trigger: String,
    command: String,
    #[serde(default = "default_generator_output")]
    output: String,
}

fn default_generator_output() -> String {
    "{name}_{stem}.cc".into()
}

// ===========================================================================
// Resolved configuration
// ===========================================================================

/// Fully resolved, immutable build configuration.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Canonical project root.
    pub root: PathBuf,
    /// Absolute source directories searched for includes, in order.
    pub source_dirs: Vec<PathBuf>,
    /// Absolute build output directory.
    pub build_dir: PathBuf,
    pub compile: CompileConfig,
    pub link: LinkConfig,
    pub remote: RemoteConfig,
    pub classify: ClassifyConfig,
    /// Optional-library registry, in declaration order.
    pub libraries: Vec<Library>,
    pub generators: Vec<Generator>,
    /// Per-file compile overrides, keyed by canonical path.
    pub overrides: HashMap<PathBuf, FileOverride>,
}

#[derive(Debug, Clone)]
pub struct CompileConfig {
    pub command: String,
    pub compiler: String,
    pub flags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub command: String,
    pub linker: String,
    pub flags: Vec<String>,
    pub shared_flags: Vec<String>,
    /// Directory receiving a symlink per linked output, if any.
    pub publish_dir: Option<PathBuf>,
    pub settle_timeout: Duration,
    pub settle_poll: Duration,
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Remote shell program (`ssh`, `rsh`, ...).
    pub shell: String,
    pub flags: Vec<String>,
    /// Default niceness for hosts that do not set their own.
    pub niceness: Option<i32>,
    pub max_retries: u32,
    pub hosts_file: Option<PathBuf>,
    pub still_waiting: Duration,
}

#[derive(Debug, Clone)]
pub struct ClassifyConfig {
    pub connection_patterns: Vec<String>,
    pub home_dir_patterns: Vec<String>,
}

/// An optional library enabled by include-name triggers.
#[derive(Debug, Clone)]
pub struct Library {
    pub name: String,
    pub triggers: Vec<glob::Pattern>,
    pub compile_flags: Vec<String>,
    pub link_flags: Vec<String>,
    /// Library sources are compiled and linked into every executable that
    /// triggers it.
    pub compile_as_source: bool,
    pub sources: Vec<PathBuf>,
}

impl Library {
    /// Whether an include name (as written in the directive) triggers this library.
    ///
    /// Patterns are tried against the full name and against its last path
    /// component, so `zlib.h` matches `#include <zlib.h>` and
    /// `#include "third_party/zlib.h"`.
    pub fn is_triggered_by(&self, include: &str) -> bool {
        let file_name = include.rsplit('/').next().unwrap_or(include);
        self.triggers
            .iter()
            .any(|p| p.matches(include) || p.matches(file_name))
    }
}

/// A code generator run on files containing a trigger token.
#[derive(Debug, Clone)]
pub struct Generator {
    pub name: String,
    pub trigger: String,
    /// Shell command with `{input}` and `{output}` placeholders.
    pub command: String,
    /// Output file name pattern with `{name}` and `{stem}` placeholders.
    pub output: String,
}

impl Generator {
    /// File name of the unit generated from `input`.
    pub fn output_file_name(&self, input: &Path) -> String {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.output.replace("{name}", &self.name).replace("{stem}", &stem)
    }
}

/// Structured per-file compile override.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileOverride {
    /// Replacement compiler.
    pub compiler: Option<String>,
    /// Replacement for the configured flag list.
    pub flags: Option<Vec<String>>,
    /// Flags appended after everything else.
    pub extra_flags: Vec<String>,
}

impl FileOverride {
    fn from_table(file: &str, table: &BTreeMap<String, String>) -> Result<Self> {
        let mut over = Self::default();
        for (key, value) in table {
            match key.as_str() {
                "compiler" => over.compiler = Some(value.clone()),
                "flags" => over.flags = Some(split_flags(value)),
                "extra-flags" => over.extra_flags = split_flags(value),
                other => bail!(
                    "override for '{file}': unknown option '{other}' (expected compiler, flags or extra-flags)"
                ),
            }
        }
        Ok(over)
    }
}

fn split_flags(value: &str) -> Vec<String> {
    value.split_whitespace().map(String::from).collect()
}

impl BuildConfig {
    /// Load `quark.toml` from `root`, or defaults when it does not exist.
    pub fn load(root: &Path) -> Result<Self> {
        let toml_path = root.join(CONFIG_FILE);
        let raw = if toml_path.exists() {
            let contents = std::fs::read_to_string(&toml_path)
                .with_context(|| format!("failed to read {}", toml_path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", toml_path.display()))?
        } else {
            RawConfig::default()
        };
        Self::from_raw(raw, root)
    }

    /// Parse configuration text directly (used by tests).
    #[cfg(test)]
    pub fn from_toml(contents: &str, root: &Path) -> Result<Self> {
        let raw: RawConfig = toml::from_str(contents).context("failed to parse config")?;
        Self::from_raw(raw, root)
    }

    fn from_raw(raw: RawConfig, root: &Path) -> Result<Self> {
        let root = std::fs::canonicalize(root)
            .with_context(|| format!("project root {} does not exist", root.display()))?;

        let source_dirs = raw
            .project
            .source_dirs
            .iter()
            .map(|d| absolutize(&root, d))
            .collect();
        let build_dir = absolutize(&root, &raw.project.build_dir);

        for placeholder in ["{input}", "{output}"] {
            ensure!(
                raw.compile.command.contains(placeholder),
                "compile command must contain {placeholder}: `{}`",
                raw.compile.command
            );
        }
        for placeholder in ["{objects}", "{output}"] {
            ensure!(
                raw.link.command.contains(placeholder),
                "link command must contain {placeholder}: `{}`",
                raw.link.command
            );
        }
        ensure!(raw.remote.max_retries >= 1, "remote.max-retries must be at least 1");
        ensure!(raw.link.settle_poll_ms > 0, "link.settle-poll-ms must be positive");

        let mut libraries = Vec::with_capacity(raw.libraries.len());
        for lib in raw.libraries {
            let triggers = lib
                .triggers
                .iter()
                .map(|t| {
                    glob::Pattern::new(t)
                        .with_context(|| format!("library '{}': invalid trigger '{t}'", lib.name))
                })
                .collect::<Result<Vec<_>>>()?;
            let mut sources = Vec::with_capacity(lib.sources.len());
            for src in &lib.sources {
                let path = absolutize(&root, src);
                ensure!(
                    path.is_file(),
                    "library '{}': source {} does not exist",
                    lib.name,
                    path.display()
                );
                ensure!(
                    FileKind::of(&path) == Some(FileKind::Source),
                    "library '{}': source {} is not a compilable source file",
                    lib.name,
                    path.display()
                );
                sources.push(path);
            }
            ensure!(
                !lib.compile_as_source || !sources.is_empty(),
                "library '{}' is compile-as-source but lists no sources",
                lib.name
            );
            libraries.push(Library {
                name: lib.name,
                triggers,
                compile_flags: lib.compile_flags,
                link_flags: lib.link_flags,
                compile_as_source: lib.compile_as_source,
                sources,
            });
        }

        let mut generators = Vec::with_capacity(raw.generators.len());
        for generator in raw.generators {
            ensure!(
                !generator.trigger.is_empty(),
                "generator '{}' has an empty trigger",
                generator.name
            );
            for placeholder in ["{input}", "{output}"] {
                ensure!(
                    generator.command.contains(placeholder),
                    "generator '{}' command must contain {placeholder}",
                    generator.name
                );
            }
            generators.push(Generator {
                name: generator.name,
                trigger: generator.trigger,
                command: generator.command,
                output: generator.output,
            });
        }

        let mut overrides = HashMap::new();
        for (file, table) in &raw.overrides {
            let path = absolutize(&root, file);
            let canonical = std::fs::canonicalize(&path).with_context(|| {
                format!("override refers to missing file {}", path.display())
            })?;
            overrides.insert(canonical, FileOverride::from_table(file, table)?);
        }

        Ok(Self {
            source_dirs,
            build_dir,
            compile: CompileConfig {
                command: raw.compile.command,
                compiler: raw.compile.compiler,
                flags: raw.compile.flags,
            },
            link: LinkConfig {
                command: raw.link.command,
                linker: raw.link.linker,
                flags: raw.link.flags,
                shared_flags: raw.link.shared_flags,
                publish_dir: raw.link.publish_dir.map(|d| absolutize(&root, &d)),
                settle_timeout: Duration::from_millis(raw.link.settle_timeout_ms),
                settle_poll: Duration::from_millis(raw.link.settle_poll_ms),
            },
            remote: RemoteConfig {
                shell: raw.remote.shell,
                flags: raw.remote.flags,
                niceness: raw.remote.niceness,
                max_retries: raw.remote.max_retries,
                hosts_file: raw.remote.hosts_file.map(|f| absolutize(&root, &f)),
                still_waiting: Duration::from_secs(raw.remote.still_waiting_secs),
            },
            classify: ClassifyConfig {
                connection_patterns: raw.classify.connection_patterns,
                home_dir_patterns: raw.classify.home_dir_patterns,
            },
            libraries,
            generators,
            overrides,
            root,
        })
    }

    /// Whether `path` lies inside the build directory.
    pub fn is_build_output(&self, path: &Path) -> bool {
        path.starts_with(&self.build_dir)
    }
}

fn absolutize(root: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw);
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    std::fs::canonicalize(&joined).unwrap_or(joined)
}

/// Walk up from `start` to the nearest directory containing `quark.toml`.
///
/// Falls back to `start` itself when no ancestor has one.
pub fn find_project_root(start: &Path) -> PathBuf {
    let mut dir = start.to_path_buf();
    loop {
        if dir.join(CONFIG_FILE).exists() {
            return dir;
        }
        if !dir.pop() {
            return start.to_path_buf();
        }
    }
}
