//! Classification of finished compile jobs.

use crate::config::ClassifyConfig;

/// What to do with a finished job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    /// Genuine failure; report it and do not retry.
    FailedPermanent,
    /// Transient failure; retry, optionally after evicting the host.
    FailedRetryable { evict_host: bool },
}

/// Captured output of one job, with the status marker line removed.
#[derive(Debug, Clone, Default)]
pub struct JobOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit status echoed by the job wrapper, if the line arrived.
    pub status: Option<i32>,
}

impl JobOutput {
    /// Split raw stream captures, pulling the status marker out of stdout.
    pub fn from_streams(stdout: &[u8], stderr: &[u8]) -> Self {
        let stdout = String::from_utf8_lossy(stdout);
        let mut status = None;
        let mut kept = String::with_capacity(stdout.len());
        for line in stdout.lines() {
            match crate::command::parse_status_line(line) {
                Some(code) => status = Some(code),
                None => {
                    kept.push_str(line);
                    kept.push('\n');
                }
            }
        }
        Self {
            stdout: kept,
            stderr: String::from_utf8_lossy(stderr).into_owned(),
            status,
        }
    }

    /// First non-empty line of stderr, or of stdout when stderr is empty.
    pub fn first_line(&self) -> &str {
        match first_nonempty(&self.stderr) {
            "" => first_nonempty(&self.stdout),
            line => line,
        }
    }

    /// Non-empty lines across both streams.
    pub fn line_count(&self) -> usize {
        self.stderr
            .lines()
            .chain(self.stdout.lines())
            .filter(|l| !l.trim().is_empty())
            .count()
    }

    /// Both streams, stderr first, trimmed.
    pub fn combined(&self) -> String {
        let mut text = String::new();
        for part in [self.stderr.trim_end(), self.stdout.trim_end()] {
            if !part.is_empty() {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(part);
            }
        }
        text
    }
}

fn first_nonempty(s: &str) -> &str {
    s.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("")
}

/// Decides whether a finished job succeeded, failed for good, or should be
/// retried.
pub trait FailureClassifier {
    fn classify(&self, output: &JobOutput) -> Outcome;
}

/// Default classifier: lowercase substring patterns for connection and
/// home-directory failures, and a `file:line:` check for diagnostics.
#[derive(Debug, Clone)]
pub struct PatternClassifier {
    connection: Vec<String>,
    home_dir: Vec<String>,
}

impl PatternClassifier {
    pub fn new(config: &ClassifyConfig) -> Self {
        let lower = |v: &[String]| -> Vec<String> { v.iter().map(|p| p.to_lowercase()).collect() };
        Self {
            connection: lower(&config.connection_patterns),
            home_dir: lower(&config.home_dir_patterns),
        }
    }
}

impl FailureClassifier for PatternClassifier {
    fn classify(&self, output: &JobOutput) -> Outcome {
        let Some(status) = output.status else {
            // The wrapper never reported back: blame the host if it looks
            // like a connection or login problem.
            let first = output.first_line().to_lowercase();
            let matches = |patterns: &[String]| patterns.iter().any(|p| first.contains(p.as_str()));
            if matches(&self.connection) || matches(&self.home_dir) {
                return Outcome::FailedRetryable { evict_host: true };
            }
            return Outcome::FailedPermanent;
        };
        if status == 0 {
            return Outcome::Succeeded;
        }
        if output.line_count() <= 2 && !has_diagnostic(&output.combined()) {
            return Outcome::FailedRetryable { evict_host: false };
        }
        Outcome::FailedPermanent
    }
}

/// Whether `text` contains a `file:line:` location.
pub fn has_diagnostic(text: &str) -> bool {
    let bytes = text.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b != b':' || i == 0 || bytes[i - 1].is_ascii_whitespace() || bytes[i - 1] == b':' {
            continue;
        }
        let digits = bytes[i + 1..].iter().take_while(|c| c.is_ascii_digit()).count();
        if digits > 0 && bytes.get(i + 1 + digits) == Some(&b':') {
            return true;
        }
    }
    false
}
