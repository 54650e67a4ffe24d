// SPDX-License-Identifier: GPL-2.0
//
// Per-CPU idle time accounting from /proc/stat.

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use std::fs;
use std::path::{Path, PathBuf};

use crate::clock::{Clock, Monotonic};

/// Idle-time source. Returns `(idle_us, wall_us)` where `wall_us` is the
/// monotonic timestamp the sample was taken at. When `iowait_is_idle` is set,
/// time spent waiting on I/O counts as idle; the governors pass `gpu_idle`
/// here so that a quiet GPU biases the estimate toward power savings.
pub trait CpuStat: Send + Sync {
    fn idle_time_us(&self, cpu: usize, iowait_is_idle: bool) -> Result<(u64, u64)>;
}

static USER_HZ: Lazy<u64> = Lazy::new(|| {
    // SAFETY: sysconf is async-signal-safe and has no memory preconditions.
    let tck = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if tck > 0 {
        tck as u64
    } else {
        100
    }
});

/// /proc/stat-backed production source.
pub struct ProcStat {
    stat_path: PathBuf,
    clock: Monotonic,
}

impl ProcStat {
    pub fn new(proc_root: &Path) -> Self {
        Self {
            stat_path: proc_root.join("stat"),
            clock: Monotonic,
        }
    }

    fn jiffies_to_us(jiffies: u64) -> u64 {
        jiffies * 1_000_000 / *USER_HZ
    }
}

/// Parse one `cpuN ...` line: columns are user nice system idle iowait irq
/// softirq steal [guest guest_nice], in USER_HZ ticks.
fn parse_idle_jiffies(line: &str, iowait_is_idle: bool) -> Result<u64> {
    let mut fields = line.split_whitespace().skip(1);
    let mut col = |name: &str| -> Result<u64> {
        fields
            .next()
            .with_context(|| format!("truncated /proc/stat line, missing {}", name))?
            .parse::<u64>()
            .with_context(|| format!("bad {} column in /proc/stat", name))
    };
    let _user = col("user")?;
    let _nice = col("nice")?;
    let _system = col("system")?;
    let idle = col("idle")?;
    let iowait = col("iowait")?;
    Ok(if iowait_is_idle { idle + iowait } else { idle })
}

impl CpuStat for ProcStat {
    fn idle_time_us(&self, cpu: usize, iowait_is_idle: bool) -> Result<(u64, u64)> {
        let raw = fs::read_to_string(&self.stat_path)
            .with_context(|| format!("failed to read {}", self.stat_path.display()))?;
        let wall = self.clock.now_us();
        let prefix = format!("cpu{} ", cpu);
        for line in raw.lines() {
            if line.starts_with(&prefix) {
                let idle = parse_idle_jiffies(line, iowait_is_idle)?;
                return Ok((ProcStat::jiffies_to_us(idle), wall));
            }
        }
        bail!("cpu{} not present in {}", cpu, self.stat_path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const LINE: &str = "cpu1 1000 5 200 30000 400 10 20 0 0 0";

    #[test]
    fn idle_excludes_iowait_by_default() {
        assert_eq!(parse_idle_jiffies(LINE, false).unwrap(), 30000);
    }

    #[test]
    fn idle_includes_iowait_when_asked() {
        assert_eq!(parse_idle_jiffies(LINE, true).unwrap(), 30400);
    }

    #[test]
    fn truncated_line_is_an_error() {
        assert!(parse_idle_jiffies("cpu1 1 2 3", false).is_err());
    }

    #[test]
    fn reads_requested_cpu() {
        let root = tempfile::tempdir().unwrap();
        fs::write(
            root.path().join("stat"),
            "cpu 9 9 9 9 9 9 9 9 9 9\ncpu0 1 1 1 100 0 0 0 0 0 0\ncpu1 1000 5 200 30000 400 10 20 0 0 0\n",
        )
        .unwrap();
        let stat = ProcStat::new(root.path());
        let (idle, wall) = stat.idle_time_us(1, false).unwrap();
        assert_eq!(idle, ProcStat::jiffies_to_us(30000));
        assert!(wall > 0);
        assert!(stat.idle_time_us(5, false).is_err());
    }
}
