//! End-of-run summary.

use std::fmt;

/// What a build run did and what went wrong.
#[derive(Debug, Default)]
pub struct Summary {
    pub compiled: usize,
    pub linked: usize,
    pub up_to_date: usize,
    /// Units that failed for good: label and captured output.
    pub failed_units: Vec<(String, String)>,
    /// Executables not linked because part of their link set failed, with
    /// the labels of the failed units.
    pub skipped_links: Vec<(String, Vec<String>)>,
    /// Executables whose link command failed.
    pub link_failures: Vec<(String, String)>,
    /// Targets that could not be resolved.
    pub resolve_errors: Vec<String>,
}

impl Summary {
    pub fn is_success(&self) -> bool {
        self.failed_units.is_empty()
            && self.skipped_links.is_empty()
            && self.link_failures.is_empty()
            && self.resolve_errors.is_empty()
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for error in &self.resolve_errors {
            writeln!(f, "error: {error}")?;
        }
        for (label, output) in &self.failed_units {
            writeln!(f, "FAILED: {label}")?;
            for line in output.lines() {
                writeln!(f, "    {line}")?;
            }
        }
        for (exe, because) in &self.skipped_links {
            writeln!(f, "NOT LINKED: {exe} (failed: {})", because.join(", "))?;
        }
        for (exe, error) in &self.link_failures {
            writeln!(f, "LINK FAILED: {exe}")?;
            for line in error.lines() {
                writeln!(f, "    {line}")?;
            }
        }
        let outcome = if self.is_success() { "Build complete" } else { "Build failed" };
        write!(
            f,
            "{outcome}. ({} compiled, {} linked, {} up to date",
            self.compiled, self.linked, self.up_to_date
        )?;
        let problems = self.failed_units.len() + self.link_failures.len();
        if problems > 0 {
            write!(f, ", {problems} failed")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_run() {
        let summary = Summary {
            compiled: 2,
            linked: 1,
            ..Summary::default()
        };
        assert!(summary.is_success());
        assert_eq!(
            summary.to_string(),
            "Build complete. (2 compiled, 1 linked, 0 up to date)"
        );
    }

    #[test]
    fn failures_are_listed_with_output() {
        let summary = Summary {
            compiled: 1,
            failed_units: vec![("util.cc".into(), "util.cc:10: error: boom".into())],
            skipped_links: vec![("main.cc".into(), vec!["util.cc".into()])],
            ..Summary::default()
        };
        assert!(!summary.is_success());
        let text = summary.to_string();
        assert!(text.contains("FAILED: util.cc\n    util.cc:10: error: boom\n"));
        assert!(text.contains("NOT LINKED: main.cc (failed: util.cc)"));
        assert!(text.ends_with("Build failed. (1 compiled, 0 linked, 0 up to date, 1 failed)"));
    }
}
