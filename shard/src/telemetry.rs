//! Host telemetry for heartbeats
//!
//! Collection is best-effort: a probe that cannot read the host reports
//! nothing and the heartbeat goes out without a `stats` block.

use shared::Stats;
use std::fs;
use std::path::PathBuf;

/// Source of the `stats` block attached to heartbeats
pub trait HostProbe: Send + Sync {
    fn sample(&self) -> Option<Stats>;
}

/// Reads load average and available memory from a procfs mount
#[derive(Debug, Clone)]
pub struct ProcProbe {
    root: PathBuf,
}

impl ProcProbe {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read(&self, name: &str) -> Option<String> {
        fs::read_to_string(self.root.join(name)).ok()
    }
}

impl Default for ProcProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HostProbe for ProcProbe {
    fn sample(&self) -> Option<Stats> {
        let cpu_usage = parse_loadavg(&self.read("loadavg")?)?;
        let free_ram = parse_meminfo(&self.read("meminfo")?)?;
        Some(Stats {
            free_ram,
            cpu_usage,
        })
    }
}

/// Probe for hosts without telemetry
#[derive(Debug, Clone, Copy, Default)]
pub struct Unavailable;

impl HostProbe for Unavailable {
    fn sample(&self) -> Option<Stats> {
        None
    }
}

/// One-minute load average
fn parse_loadavg(contents: &str) -> Option<f64> {
    contents.split_whitespace().next()?.parse().ok()
}

/// Available memory in bytes, preferring `MemAvailable` over `MemFree`
fn parse_meminfo(contents: &str) -> Option<f64> {
    let field = |name: &str| {
        contents.lines().find_map(|line| {
            let rest = line.strip_prefix(name)?.strip_prefix(':')?;
            let kib: f64 = rest.split_whitespace().next()?.parse().ok()?;
            Some(kib * 1024.0)
        })
    };
    field("MemAvailable").or_else(|| field("MemFree"))
}
