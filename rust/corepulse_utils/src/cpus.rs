// SPDX-License-Identifier: GPL-2.0
//
// CPU hot-plug primitives via /sys/devices/system/cpu.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::cpu_list::parse_cpu_list;
use crate::misc::{read_trimmed, write_str};

/// Online/offline control over the CPU population. Both `cpu_up` and
/// `cpu_down` are blocking and may fail; callers are expected to log and
/// carry on.
pub trait CpuOnline: Send + Sync {
    fn nr_possible(&self) -> usize;
    fn is_online(&self, cpu: usize) -> bool;
    fn online_cpus(&self) -> Vec<usize>;
    fn cpu_up(&self, cpu: usize) -> Result<()>;
    fn cpu_down(&self, cpu: usize) -> Result<()>;
}

pub struct SysfsCpus {
    cpu_dir: PathBuf,
    nr_possible: usize,
}

impl SysfsCpus {
    pub fn new(sysfs_root: &Path) -> Self {
        let cpu_dir = sysfs_root.join("devices/system/cpu");
        let nr_possible = crate::nr_cpu_ids_from(&cpu_dir);
        Self {
            cpu_dir,
            nr_possible,
        }
    }

    fn online_file(&self, cpu: usize) -> PathBuf {
        self.cpu_dir.join(format!("cpu{}/online", cpu))
    }
}

impl CpuOnline for SysfsCpus {
    fn nr_possible(&self) -> usize {
        self.nr_possible
    }

    fn is_online(&self, cpu: usize) -> bool {
        // The boot CPU has no `online` file; it is always up.
        match read_trimmed(&self.online_file(cpu)) {
            Ok(v) => v == "1",
            Err(_) => cpu == 0,
        }
    }

    fn online_cpus(&self) -> Vec<usize> {
        read_trimmed(&self.cpu_dir.join("online"))
            .ok()
            .and_then(|mask| parse_cpu_list(&mask).ok())
            .unwrap_or_else(|| (0..self.nr_possible).filter(|&c| self.is_online(c)).collect())
    }

    fn cpu_up(&self, cpu: usize) -> Result<()> {
        write_str(&self.online_file(cpu), "1").with_context(|| format!("cpu_up({}) failed", cpu))
    }

    fn cpu_down(&self, cpu: usize) -> Result<()> {
        write_str(&self.online_file(cpu), "0").with_context(|| format!("cpu_down({}) failed", cpu))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fixture() -> (tempfile::TempDir, SysfsCpus) {
        let root = tempfile::tempdir().unwrap();
        let cpu_dir = root.path().join("devices/system/cpu");
        for cpu in 0..4 {
            fs::create_dir_all(cpu_dir.join(format!("cpu{}", cpu))).unwrap();
        }
        for cpu in 1..4 {
            fs::write(cpu_dir.join(format!("cpu{}/online", cpu)), "1\n").unwrap();
        }
        fs::write(cpu_dir.join("possible"), "0-3\n").unwrap();
        fs::write(cpu_dir.join("online"), "0-3\n").unwrap();
        let cpus = SysfsCpus::new(root.path());
        (root, cpus)
    }

    #[test]
    fn boot_cpu_is_always_online() {
        let (_root, cpus) = fixture();
        assert_eq!(cpus.nr_possible(), 4);
        assert!(cpus.is_online(0));
    }

    #[test]
    fn up_down_toggle_the_online_file() {
        let (root, cpus) = fixture();
        cpus.cpu_down(3).unwrap();
        assert!(!cpus.is_online(3));
        cpus.cpu_up(3).unwrap();
        assert!(cpus.is_online(3));
        drop(root);
    }

    #[test]
    fn online_mask_is_preferred() {
        let (root, cpus) = fixture();
        fs::write(
            root.path().join("devices/system/cpu/online"),
            "0,2\n",
        )
        .unwrap();
        assert_eq!(cpus.online_cpus(), vec![0, 2]);
    }
}
