//! Worker hosts and the pool the scheduler draws slots from.
//!
//! The pool is an ordered list of slots. A host listed N times provides N
//! concurrent compilation slots. The only mutation is eviction: once a host
//! has been found unreachable it loses every slot for the rest of the run.

use anyhow::{Context, Result, bail};
use std::fmt;
use std::path::Path;

/// A machine that can run a compilation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Host {
    Local,
    Remote(String),
}

impl Host {
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }

    fn parse(name: &str) -> Self {
        match name {
            "local" | "localhost" => Self::Local,
            other => Self::Remote(other.to_string()),
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("localhost"),
            Self::Remote(name) => f.write_str(name),
        }
    }
}

/// One slot of the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSlot {
    pub host: Host,
    /// Priority forwarded as `nice -n <niceness>`.
    pub niceness: Option<i32>,
}

/// Ordered pool of host slots, shrinking only by eviction.
#[derive(Debug, Clone, Default)]
pub struct HostPool {
    slots: Vec<HostSlot>,
}

impl HostPool {
    /// `count` local slots.
    pub fn local(count: usize, niceness: Option<i32>) -> Self {
        let slots = (0..count)
            .map(|_| HostSlot {
                host: Host::Local,
                niceness,
            })
            .collect();
        Self { slots }
    }

    /// Read a hosts file.
    pub fn load(path: &Path, default_niceness: Option<i32>) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read hosts file {}", path.display()))?;
        Self::parse(&text, default_niceness)
            .with_context(|| format!("invalid hosts file {}", path.display()))
    }

    /// Parse hosts-file text.
    ///
    /// One host per line, optionally followed by `nice=<n>`. `#` starts a
    /// comment. `local`/`localhost` name the machine running quark.
    pub fn parse(text: &str, default_niceness: Option<i32>) -> Result<Self> {
        let mut slots = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let Some(name) = fields.next() else { continue };
            let mut niceness = default_niceness;
            for field in fields {
                match field.strip_prefix("nice=") {
                    Some(value) => {
                        niceness = Some(value.parse().with_context(|| {
                            format!("line {}: invalid niceness '{value}'", lineno + 1)
                        })?);
                    }
                    None => bail!("line {}: unexpected field '{field}'", lineno + 1),
                }
            }
            slots.push(HostSlot {
                host: Host::parse(name),
                niceness,
            });
        }
        if slots.is_empty() {
            bail!("no hosts listed");
        }
        Ok(Self { slots })
    }

    pub fn slots(&self) -> &[HostSlot] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[cfg(test)]
    pub fn contains(&self, host: &Host) -> bool {
        self.slots.iter().any(|s| &s.host == host)
    }

    /// Number of slots `host` still owns.
    #[cfg(test)]
    pub fn slot_count(&self, host: &Host) -> usize {
        self.slots.iter().filter(|s| &s.host == host).count()
    }

    /// Remove every slot of `host`. Returns how many were removed.
    pub fn evict(&mut self, host: &Host) -> usize {
        let before = self.slots.len();
        self.slots.retain(|s| &s.host != host);
        before - self.slots.len()
    }
}
