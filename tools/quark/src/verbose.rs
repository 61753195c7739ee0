//! Console output for quark.
//!
//! One process-wide [`Level`] is chosen from `-q`/`-v` before any work
//! starts. Free-form detail goes through `vprintln!` (verbose only) and
//! `wprintln!` (always, on stderr). Build progress is reported as typed
//! [`Progress`] events, which know both their bracketed wire form and the
//! level they belong to:
//!
//! | Event                          | Level   |
//! |--------------------------------|---------|
//! | `[ LAUNCHED unit on host ]`    | normal  |
//! | `[ FINISHED unit on host ]`    | normal  |
//! | `[ STILL WAITING FOR: ... ]`   | normal  |
//! | `[ LINKED output ]`            | normal  |
//! | `[ RETRYING unit (attempt n) ]`| verbose |
//! | `[ EVICTED host ]`             | verbose |

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use crate::hosts::Host;

/// How much quark prints.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// Warnings, errors and the summary.
    Quiet,
    /// Plus build progress.
    Normal,
    /// Plus commands, stale reasons, retries, evictions and phase timings.
    Verbose,
}

impl Level {
    fn from_flags(quiet: bool, verbose: bool) -> Self {
        match (quiet, verbose) {
            (true, _) => Self::Quiet,
            (false, true) => Self::Verbose,
            (false, false) => Self::Normal,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Quiet,
            2 => Self::Verbose,
            _ => Self::Normal,
        }
    }
}

static LEVEL: AtomicU8 = AtomicU8::new(Level::Normal as u8);

/// Select the output level from the command-line flags.
pub fn init(quiet: bool, verbose: bool) {
    LEVEL.store(Level::from_flags(quiet, verbose) as u8, Ordering::Relaxed);
}

/// Whether output at `level` is shown.
pub fn enabled(level: Level) -> bool {
    Level::from_u8(LEVEL.load(Ordering::Relaxed)) >= level
}

pub fn is_verbose() -> bool {
    enabled(Level::Verbose)
}

/// Verbose-only detail line.
macro_rules! vprintln {
    ($($arg:tt)*) => {
        if $crate::verbose::enabled($crate::verbose::Level::Verbose) {
            println!($($arg)*);
        }
    };
}

pub(crate) use vprintln;

/// Warning on stderr, shown at every level.
macro_rules! wprintln {
    ($($arg:tt)*) => {
        eprintln!("warning: {}", format_args!($($arg)*));
    };
}

pub(crate) use wprintln;

/// A build progress event.
#[derive(Debug, Clone, Copy)]
pub enum Progress<'a> {
    Launched { unit: &'a str, host: &'a Host },
    Finished { unit: &'a str, host: &'a Host },
    Retrying { unit: &'a str, attempt: u32 },
    Evicted { host: &'a Host },
    /// Jobs still running after a quiet interval, as `unit on host`.
    StillWaiting(&'a [String]),
    Linked { output: &'a str },
}

impl Progress<'_> {
    pub fn level(&self) -> Level {
        match self {
            Self::Retrying { .. } | Self::Evicted { .. } => Level::Verbose,
            Self::Launched { .. } | Self::Finished { .. } | Self::StillWaiting(_) | Self::Linked { .. } => {
                Level::Normal
            }
        }
    }
}

impl fmt::Display for Progress<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Launched { unit, host } => write!(f, "[ LAUNCHED {unit} on {host} ]"),
            Self::Finished { unit, host } => write!(f, "[ FINISHED {unit} on {host} ]"),
            Self::Retrying { unit, attempt } => write!(f, "[ RETRYING {unit} (attempt {attempt}) ]"),
            Self::Evicted { host } => write!(f, "[ EVICTED {host} ]"),
            Self::StillWaiting(jobs) => write!(f, "[ STILL WAITING FOR: {} ]", jobs.join(", ")),
            Self::Linked { output } => write!(f, "[ LINKED {output} ]"),
        }
    }
}

/// Print a progress event if its level is enabled.
pub fn progress(event: Progress<'_>) {
    if enabled(event.level()) {
        println!("{event}");
    }
}

/// Run `phase`, printing how long it took in verbose mode.
pub fn timed<T>(label: &str, phase: impl FnOnce() -> T) -> T {
    let started = Instant::now();
    let value = phase();
    vprintln!("  {label}: {:.1?}", started.elapsed());
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_map_to_levels() {
        assert_eq!(Level::from_flags(true, false), Level::Quiet);
        assert_eq!(Level::from_flags(true, true), Level::Quiet);
        assert_eq!(Level::from_flags(false, true), Level::Verbose);
        assert_eq!(Level::from_flags(false, false), Level::Normal);
        for level in [Level::Quiet, Level::Normal, Level::Verbose] {
            assert_eq!(Level::from_u8(level as u8), level);
        }
    }

    #[test]
    fn progress_lines() {
        let box1 = Host::Remote("box1".into());
        let launched = Progress::Launched { unit: "util.cc", host: &box1 };
        assert_eq!(launched.to_string(), "[ LAUNCHED util.cc on box1 ]");
        assert_eq!(launched.level(), Level::Normal);

        let local = Host::Local;
        let finished = Progress::Finished { unit: "main.cc", host: &local };
        assert_eq!(finished.to_string(), "[ FINISHED main.cc on localhost ]");

        let jobs = ["a.cc on box1".to_string(), "b.cc on localhost".to_string()];
        assert_eq!(
            Progress::StillWaiting(&jobs).to_string(),
            "[ STILL WAITING FOR: a.cc on box1, b.cc on localhost ]"
        );

        let retry = Progress::Retrying { unit: "a.cc", attempt: 2 };
        assert_eq!(retry.to_string(), "[ RETRYING a.cc (attempt 2) ]");
        assert_eq!(retry.level(), Level::Verbose);
        assert_eq!(Progress::Evicted { host: &box1 }.level(), Level::Verbose);
        assert_eq!(Progress::Linked { output: "bin/main" }.to_string(), "[ LINKED bin/main ]");
    }
}
