//! Compile-task assembly.
//!
//! Builds the compiler command line for a unit from the configured template,
//! the flags of every library its includes trigger, and any per-file
//! override, and packages it with the paths the scheduler needs.

use std::path::PathBuf;

use crate::command::CompileCommandBuilder;
use crate::manifest::hash_command;
use crate::registry::Registry;
use crate::unit::UnitId;

/// Everything needed to compile one unit on any host.
#[derive(Debug, Clone)]
pub struct CompileTask {
    pub unit: UnitId,
    /// Display name (path relative to the project root).
    pub label: String,
    /// Directory the command runs in (the source's own directory).
    pub dir: PathBuf,
    pub source: PathBuf,
    pub object: PathBuf,
    pub command_line: String,
    pub command_hash: String,
}

/// Assemble the compile task for a source unit.
///
/// Flag order: configured flags (or the override's replacement), then the
/// compile flags of triggered libraries in registry order, then the
/// override's extra flags.
pub fn compile_task(registry: &mut Registry<'_>, id: UnitId) -> CompileTask {
    let config = registry.config();
    let libraries = registry.transitive_libraries(id);
    let unit = registry.unit(id);
    let over = config.overrides.get(&unit.path);

    let mut builder = CompileCommandBuilder::new(&config.compile.command, &config.compile.compiler);
    if let Some(compiler) = over.and_then(|o| o.compiler.as_deref()) {
        builder.compiler(compiler);
    }
    match over.and_then(|o| o.flags.as_ref()) {
        Some(flags) => builder.flags(flags.iter().cloned()),
        None => builder.flags(config.compile.flags.iter().cloned()),
    };
    for idx in &libraries {
        builder.flags(config.libraries[*idx].compile_flags.iter().cloned());
    }
    if let Some(over) = over {
        builder.flags(over.extra_flags.iter().cloned());
    }
    builder.input(&unit.path).output(&unit.object_path);
    let command_line = builder.build();

    CompileTask {
        unit: id,
        label: display_label(&config.root, &unit.path),
        dir: unit.path.parent().map(PathBuf::from).unwrap_or_else(|| config.root.clone()),
        source: unit.path.clone(),
        object: unit.object_path.clone(),
        command_hash: hash_command(&command_line),
        command_line,
    }
}

/// Path relative to the project root when possible.
pub fn display_label(root: &std::path::Path, path: &std::path::Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .display()
        .to_string()
}
