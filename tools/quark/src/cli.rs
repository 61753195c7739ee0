//! Command-line interface definitions for quark.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Incremental, distributed build driver for C and C++ projects.
#[derive(Parser)]
#[command(name = "quark", version, about)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Suppress progress lines; show only warnings, errors and the summary.
    #[arg(long, short = 'q', global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Show commands, stale reasons, retries and phase timings.
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Run as if started in this directory.
    #[arg(short = 'C', global = true, value_name = "DIR")]
    pub directory: Option<PathBuf>,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Compile and link the given targets.
    Build(BuildArgs),
    /// Show what a build of TARGET would compile and link.
    Deps(DepsArgs),
    /// Remove the build directory.
    Clean,
}

/// Arguments for the `build` subcommand.
#[derive(Parser)]
pub struct BuildArgs {
    /// Directories, source or header files, or executable names.
    #[arg(default_value = ".")]
    pub targets: Vec<PathBuf>,

    /// Recompile everything, ignoring timestamps and the manifest.
    #[arg(long, short = 'f')]
    pub force: bool,

    /// Link every source into a shared library instead of executables.
    #[arg(long)]
    pub shared: bool,

    /// Number of local compile slots when no hosts file is used
    /// (default: available parallelism).
    #[arg(long, short = 'j')]
    pub jobs: Option<usize>,

    /// Hosts file listing compile hosts (overrides `remote.hosts-file`).
    #[arg(long, value_name = "FILE")]
    pub hosts: Option<PathBuf>,

    /// Attempts per unit for transient failures (overrides `remote.max-retries`).
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub retries: Option<u32>,
}

/// Arguments for the `deps` subcommand.
#[derive(Parser)]
pub struct DepsArgs {
    /// Directory, file or executable name to resolve.
    pub target: PathBuf,

    /// Resolve as a shared-library build.
    #[arg(long)]
    pub shared: bool,
}
