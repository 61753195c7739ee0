//! quark: incremental, distributed build driver for C and C++ projects.
//!
//! Scans sources for includes and entry points, works out which objects are
//! stale from transitive timestamps, compiles them across a pool of local
//! and remote hosts, and links every executable whose objects all built.
//!
//! Pipeline: load quark.toml → resolve targets → schedule compile jobs →
//!           update manifest → link → summary.

mod classify;
mod cli;
mod command;
mod compile;
mod config;
mod hosts;
mod link;
mod manifest;
mod registry;
mod report;
mod resolve;
mod scan;
mod scheduler;
mod timestamps;
mod unit;
mod verbose;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, ensure};
use clap::Parser;

use classify::PatternClassifier;
use compile::{CompileTask, compile_task, display_label};
use config::BuildConfig;
use hosts::HostPool;
use link::Linker;
use manifest::BuildManifest;
use registry::Registry;
use report::Summary;
use resolve::{Resolution, ResolveOptions, Resolver};
use scheduler::{FinalStatus, Scheduler, SchedulerOptions, ShellLauncher, link_eligible};
use unit::UnitId;
use verbose::{Progress, vprintln, wprintln};

fn main() -> Result<ExitCode> {
    let cli = cli::Cli::parse();
    verbose::init(cli.quiet, cli.verbose);

    if let Some(dir) = &cli.directory {
        std::env::set_current_dir(dir)
            .with_context(|| format!("cannot change directory to {}", dir.display()))?;
    }

    match cli.command {
        cli::Command::Build(ref args) => cmd_build(args),
        cli::Command::Deps(ref args) => cmd_deps(args),
        cli::Command::Clean => cmd_clean(),
    }
}

/// Locate the project root and load its configuration.
fn load_config() -> Result<BuildConfig> {
    let cwd = std::env::current_dir().context("cannot determine current directory")?;
    let root = config::find_project_root(&cwd);
    BuildConfig::load(&root)
}

// ===========================================================================
// Commands
// ===========================================================================

/// Compile and link the requested targets.
fn cmd_build(args: &cli::BuildArgs) -> Result<ExitCode> {
    let config = load_config()?;
    let mut hosts = host_pool(&config, args)?;
    let options = ResolveOptions {
        force: args.force,
        shared: args.shared,
    };
    let mut manifest = BuildManifest::load_or_default(&config.build_dir);
    let mut registry = Registry::new(&config);

    let resolution = verbose::timed("dependency resolution", || {
        resolve_targets(&mut registry, &manifest, options, &args.targets)
    });
    for warning in &resolution.warnings {
        wprintln!("{warning}");
    }

    let mut summary = Summary {
        up_to_date: resolution.up_to_date.len(),
        resolve_errors: resolution
            .errors
            .iter()
            .map(|(path, e)| format!("{}: {e}", path.display()))
            .collect(),
        ..Summary::default()
    };

    let tasks: Vec<CompileTask> = resolution
        .to_compile
        .iter()
        .map(|&id| compile_task(&mut registry, id))
        .collect();

    let reports = if tasks.is_empty() {
        BTreeMap::new()
    } else {
        vprintln!("Compiling {} unit(s) on {} slot(s)...", tasks.len(), hosts.len());
        let mut scheduler_options = SchedulerOptions::from_config(&config.remote);
        if let Some(retries) = args.retries {
            scheduler_options.max_retries = retries;
        }
        let scheduler = Scheduler::new(
            ShellLauncher::new(&config.remote),
            PatternClassifier::new(&config.classify),
            scheduler_options,
        );
        verbose::timed("compilation", || scheduler.run(&tasks, &mut hosts))?
    };

    for task in &tasks {
        registry.invalidate(&task.object);
        match reports.get(&task.unit) {
            Some(report) if report.status == FinalStatus::Succeeded => {
                manifest.record(task.object.clone(), task.source.clone(), task.command_hash.clone());
                summary.compiled += 1;
            }
            Some(report) => {
                manifest.forget(&task.object);
                let host = report.host.as_ref().map(|h| format!(" on {h}")).unwrap_or_default();
                summary.failed_units.push((
                    format!("{} (attempt {}{host})", task.label, report.attempts),
                    report.output.clone(),
                ));
            }
            None => {}
        }
    }
    manifest
        .save(&config.build_dir)
        .context("failed to save build manifest")?;

    let labels: HashMap<UnitId, String> = resolution
        .link_sets
        .values()
        .flatten()
        .map(|&id| (id, display_label(&config.root, &registry.unit(id).path)))
        .collect();
    let label = |id: UnitId| labels.get(&id).cloned().unwrap_or_default();

    verbose::timed("linking", || {
        let mut linker = Linker::new(&mut registry, args.shared);
        for &exe in &resolution.to_link {
            let link_set = resolution.link_sets.get(&exe).map(Vec::as_slice).unwrap_or(&[]);
            if !link_eligible(link_set, &reports) {
                let failed = link_set
                    .iter()
                    .filter(|&&id| reports.get(&id).is_some_and(|r| r.status != FinalStatus::Succeeded))
                    .map(|&id| label(id))
                    .collect();
                summary.skipped_links.push((label(exe), failed));
                continue;
            }
            match linker.link(exe, link_set) {
                Ok(output) => {
                    let output = display_label(&config.root, &output);
                    verbose::progress(Progress::Linked { output: &output });
                    summary.linked += 1;
                }
                Err(e) => summary.link_failures.push((label(exe), format!("{e:#}"))),
            }
        }
    });

    println!("{summary}");
    Ok(if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Print the resolution of one target without building anything.
fn cmd_deps(args: &cli::DepsArgs) -> Result<ExitCode> {
    let config = load_config()?;
    let manifest = BuildManifest::load_or_default(&config.build_dir);
    let mut registry = Registry::new(&config);
    let options = ResolveOptions {
        force: false,
        shared: args.shared,
    };
    let resolution = Resolver::new(&mut registry, &manifest, options)
        .resolve(&args.target)
        .with_context(|| format!("cannot resolve {}", args.target.display()))?;
    for warning in &resolution.warnings {
        wprintln!("{warning}");
    }

    let name = |id: UnitId| display_label(&config.root, &registry.unit(id).path);
    let section = |title: &str, ids: Vec<UnitId>| {
        println!("{title}:");
        if ids.is_empty() {
            println!("  (none)");
        }
        for id in ids {
            println!("  {}", name(id));
        }
    };
    section("To compile", resolution.to_compile.iter().copied().collect());
    section("To link", resolution.to_link.iter().copied().collect());
    section("Up to date", resolution.up_to_date.clone());

    println!("Link sets:");
    for exe in &resolution.executables {
        let Some(link_set) = resolution.link_sets.get(exe) else {
            continue;
        };
        let members: Vec<String> = link_set.iter().map(|&id| name(id)).collect();
        println!("  {}: {}", name(*exe), members.join(" "));
    }
    if verbose::is_verbose() {
        println!("Includes:");
        let mut seen = BTreeSet::new();
        for id in resolution.link_sets.values().flatten() {
            if !seen.insert(*id) {
                continue;
            }
            let unit = registry.unit(*id);
            println!("  {}: {}", name(*id), unit.include_names.join(" "));
            for &generated in &unit.generated_units {
                println!("    generated: {}", name(generated));
            }
        }
    }
    for (path, e) in &resolution.errors {
        eprintln!("error: {}: {e}", path.display());
    }
    Ok(if resolution.errors.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Remove build artifacts.
fn cmd_clean() -> Result<ExitCode> {
    let config = load_config()?;
    if config.build_dir.exists() {
        std::fs::remove_dir_all(&config.build_dir)
            .with_context(|| format!("failed to remove {}", config.build_dir.display()))?;
        println!("Removed {}", config.build_dir.display());
    } else {
        println!("Nothing to clean.");
    }
    Ok(ExitCode::SUCCESS)
}

// ===========================================================================
// Helpers
// ===========================================================================

fn resolve_targets(
    registry: &mut Registry<'_>,
    manifest: &BuildManifest,
    options: ResolveOptions,
    targets: &[PathBuf],
) -> Resolution {
    let mut resolver = Resolver::new(registry, manifest, options);
    let mut all = Resolution::default();
    for target in targets {
        match resolver.resolve(target) {
            Ok(resolution) => all.merge(resolution),
            Err(e) => all.errors.push((target.clone(), e)),
        }
    }
    all
}

/// Hosts file from the command line or config, else `-j N` local slots.
fn host_pool(config: &BuildConfig, args: &cli::BuildArgs) -> Result<HostPool> {
    let niceness = config.remote.niceness;
    if let Some(path) = args.hosts.as_deref().or(config.remote.hosts_file.as_deref()) {
        return HostPool::load(path, niceness);
    }
    let jobs = args.jobs.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1)
    });
    ensure!(jobs > 0, "--jobs must be at least 1");
    Ok(HostPool::local(jobs, niceness))
}
