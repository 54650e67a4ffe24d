// SPDX-License-Identifier: GPL-2.0
//
// cpufreq policy access through /sys/devices/system/cpu/cpufreq.
//
// A "policy" is a group of CPUs whose frequency is set together. The driver
// exposes a discrete table of kHz steps; requests are quantized to the table
// with an explicit rounding relation, the same contract the kernel's
// cpufreq_frequency_table_target() provides.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::misc::{read_trimmed, read_u32, write_str};

/// Rounding mode for quantizing a frequency request to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// Lowest table frequency at or above the request.
    Low,
    /// Highest table frequency at or below the request.
    High,
    /// Table frequency closest to the request.
    Close,
}

/// Ascending list of the discrete frequencies (kHz) a policy supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreqTable {
    freqs: Vec<u32>,
}

impl FreqTable {
    pub fn new(mut freqs: Vec<u32>) -> Result<Self> {
        if freqs.is_empty() {
            bail!("empty frequency table");
        }
        freqs.sort_unstable();
        freqs.dedup();
        Ok(Self { freqs })
    }

    pub fn freqs(&self) -> &[u32] {
        &self.freqs
    }

    pub fn min(&self) -> u32 {
        self.freqs[0]
    }

    pub fn max(&self) -> u32 {
        *self.freqs.last().unwrap()
    }

    /// Quantize `target_khz` to a table entry within the `[min_khz, max_khz]`
    /// policy band. The request is clamped to the band first, so a lookup
    /// only fails when the band excludes the whole table.
    pub fn target(&self, target_khz: u32, relation: Relation, min_khz: u32, max_khz: u32) -> Result<u32> {
        let band: Vec<u32> = self
            .freqs
            .iter()
            .copied()
            .filter(|&f| f >= min_khz && f <= max_khz)
            .collect();
        if band.is_empty() {
            bail!(
                "no table entry within policy band [{}, {}] kHz",
                min_khz,
                max_khz
            );
        }

        let lo = band[0];
        let hi = *band.last().unwrap();
        let req = target_khz.clamp(lo, hi);

        Ok(match relation {
            Relation::Low => *band.iter().find(|&&f| f >= req).unwrap(),
            Relation::High => *band.iter().rev().find(|&&f| f <= req).unwrap(),
            Relation::Close => *band
                .iter()
                .min_by_key(|&&f| f.abs_diff(req))
                .unwrap(),
        })
    }
}

/// Frequency-table driver interface. The production implementation talks to
/// sysfs; tests substitute a mock.
pub trait FreqDriver: Send + Sync {
    /// Ids of the policies present on the system.
    fn policies(&self) -> Result<Vec<usize>>;
    /// CPUs whose frequency is tied to this policy.
    fn related_cpus(&self, policy: usize) -> Result<Vec<usize>>;
    fn freq_table(&self, policy: usize) -> Result<FreqTable>;
    /// Current (min, max) kHz bounds of the policy.
    fn limits_khz(&self, policy: usize) -> Result<(u32, u32)>;
    fn cur_khz(&self, policy: usize) -> Result<u32>;
    /// Live frequency ceiling, re-read on every call: platform thermal
    /// management may pull it below the policy maximum at any time.
    fn ceiling_khz(&self, policy: usize) -> Result<u32>;
    /// Ask the hardware for `target_khz`. The driver clamps to its table and
    /// limits; the frequency actually programmed is returned.
    fn set_khz(&self, policy: usize, target_khz: u32, relation: Relation) -> Result<u32>;
}

/// sysfs-backed driver. All paths are relative to `root` so the whole tree
/// can be redirected at a fixture directory.
pub struct SysfsCpufreq {
    cpufreq_dir: PathBuf,
}

impl SysfsCpufreq {
    pub fn new(sysfs_root: &Path) -> Self {
        Self {
            cpufreq_dir: sysfs_root.join("devices/system/cpu/cpufreq"),
        }
    }

    fn policy_dir(&self, policy: usize) -> PathBuf {
        self.cpufreq_dir.join(format!("policy{}", policy))
    }

    fn attr(&self, policy: usize, name: &str) -> PathBuf {
        self.policy_dir(policy).join(name)
    }

    /// Switch the policy to the `userspace` kernel governor so that
    /// `scaling_setspeed` writes take effect.
    pub fn claim_userspace(&self, policy: usize) -> Result<()> {
        write_str(&self.attr(policy, "scaling_governor"), "userspace")
            .with_context(|| format!("policy{}: cannot claim userspace governor", policy))
    }
}

impl FreqDriver for SysfsCpufreq {
    fn policies(&self) -> Result<Vec<usize>> {
        let mut out = Vec::new();
        let entries = fs::read_dir(&self.cpufreq_dir)
            .with_context(|| format!("failed to enumerate {}", self.cpufreq_dir.display()))?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_prefix("policy") {
                if let Ok(id) = id.parse::<usize>() {
                    out.push(id);
                }
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    fn related_cpus(&self, policy: usize) -> Result<Vec<usize>> {
        let raw = read_trimmed(&self.attr(policy, "related_cpus"))?;
        let mut cpus = Vec::new();
        for tok in raw.split_whitespace() {
            cpus.push(
                tok.parse::<usize>()
                    .with_context(|| format!("policy{}: bad related_cpus entry {:?}", policy, tok))?,
            );
        }
        if cpus.is_empty() {
            bail!("policy{}: empty related_cpus", policy);
        }
        Ok(cpus)
    }

    fn freq_table(&self, policy: usize) -> Result<FreqTable> {
        let raw = read_trimmed(&self.attr(policy, "scaling_available_frequencies"))?;
        let mut freqs = Vec::new();
        for tok in raw.split_whitespace() {
            freqs.push(
                tok.parse::<u32>()
                    .with_context(|| format!("policy{}: bad table entry {:?}", policy, tok))?,
            );
        }
        FreqTable::new(freqs).with_context(|| format!("policy{}: invalid frequency table", policy))
    }

    fn limits_khz(&self, policy: usize) -> Result<(u32, u32)> {
        let min = read_u32(&self.attr(policy, "scaling_min_freq"))?;
        let max = read_u32(&self.attr(policy, "scaling_max_freq"))?;
        Ok((min, max))
    }

    fn cur_khz(&self, policy: usize) -> Result<u32> {
        read_u32(&self.attr(policy, "scaling_cur_freq"))
    }

    fn ceiling_khz(&self, policy: usize) -> Result<u32> {
        read_u32(&self.attr(policy, "scaling_max_freq"))
    }

    fn set_khz(&self, policy: usize, target_khz: u32, relation: Relation) -> Result<u32> {
        let table = self.freq_table(policy)?;
        let (min, max) = self.limits_khz(policy)?;
        let khz = table.target(target_khz, relation, min, max)?;
        write_str(&self.attr(policy, "scaling_setspeed"), &khz.to_string())?;
        Ok(khz)
    }
}
