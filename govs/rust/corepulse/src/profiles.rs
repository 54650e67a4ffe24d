// SPDX-License-Identifier: GPL-2.0
//
// Tuning profiles. `busy` and `idle` carry the full knob set; `boost` only
// carries a target-load table and borrows everything else from `busy`.

use anyhow::{bail, Result};
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64};
use std::sync::Arc;

/// A load→frequency step function stored as an odd-length list
/// `[load0, boundary0, load1, boundary1, ..., loadN]`: `load_i` applies to
/// frequencies in `[boundary_{i-1}, boundary_i)`. Writers swap the whole
/// vector; readers snapshot it, so a lookup never observes a torn table.
pub struct TargetLoads {
    loads: ArcSwap<Vec<u32>>,
}

impl TargetLoads {
    pub fn new(defaults: &[u32]) -> Self {
        Self {
            loads: ArcSwap::from_pointee(defaults.to_vec()),
        }
    }

    #[allow(dead_code)]
    pub fn snapshot(&self) -> Arc<Vec<u32>> {
        self.loads.load_full()
    }

    /// Target load for `khz`: scan boundary pairs until the frequency falls
    /// below the next boundary or a zero load terminates the list early.
    pub fn freq_to_targetload(&self, khz: u32) -> u32 {
        let tl = self.loads.load();
        let mut i = 0;
        while i + 2 < tl.len() && khz >= tl[i + 1] && tl[i + 2] != 0 {
            i += 2;
        }
        tl[i]
    }

    /// Parse and install a new table. Tokens are separated by spaces or
    /// colons; the count must be odd. Boundaries must ascend and loads must
    /// not decrease (a non-monotone table would let the frequency chooser
    /// oscillate between two entries). Any rejection leaves the previous
    /// table in place.
    pub fn store(&self, input: &str) -> Result<()> {
        let mut vals = Vec::new();
        for tok in input.split(|c| c == ' ' || c == ':' || c == '\n' || c == '\t') {
            if tok.is_empty() {
                continue;
            }
            match tok.parse::<u32>() {
                Ok(v) => vals.push(v),
                Err(_) => bail!("invalid target_loads token {:?}", tok),
            }
        }
        Self::validate(&vals)?;
        self.loads.store(Arc::new(vals));
        Ok(())
    }

    fn validate(vals: &[u32]) -> Result<()> {
        if vals.is_empty() || vals.len() % 2 == 0 {
            bail!("target_loads wants an odd number of tokens, got {}", vals.len());
        }
        let loads: Vec<u32> = vals.iter().copied().step_by(2).collect();
        let bounds: Vec<u32> = vals.iter().copied().skip(1).step_by(2).collect();
        if loads.iter().any(|&l| l == 0 || l > 100) {
            bail!("target loads must be within 1..=100");
        }
        if loads.windows(2).any(|w| w[0] > w[1]) {
            bail!("target loads must not decrease with frequency");
        }
        if bounds.windows(2).any(|w| w[0] >= w[1]) || bounds.first().is_some_and(|&b| b == 0) {
            bail!("frequency boundaries must be positive and ascending");
        }
        Ok(())
    }

    pub fn format(&self) -> String {
        let tl = self.loads.load();
        tl.iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Knob set of one tuning profile. All fields are single-word atomics so the
/// attribute surface can retune a running governor without a lock.
pub struct ProfileValues {
    /// Frequency to bump to from low speed on a load burst, kHz.
    pub hispeed_freq: AtomicU32,
    /// Jump to hispeed when load is at or above this, percent.
    pub go_hispeed_load: AtomicU64,
    /// Minimum time at a frequency before ramping below the floor, µs.
    pub min_sample_time_us: AtomicU64,
    /// Per-core sampling period, µs.
    pub timer_rate_us: AtomicU64,
    /// Wait before raising speed above hispeed again, µs.
    pub above_hispeed_delay_us: AtomicU64,
    /// Extra idle wakeup budget beyond timer_rate, µs, or -1 to disable the
    /// slack wakeup.
    pub timer_slack_us: AtomicI64,
    pub target_loads: TargetLoads,
}

pub struct ProfileDefaults {
    pub hispeed_freq: u32,
    pub go_hispeed_load: u64,
    pub min_sample_time_us: u64,
    pub timer_rate_us: u64,
    pub above_hispeed_delay_us: u64,
    pub timer_slack_us: i64,
    pub target_loads: &'static [u32],
}

pub const BUSY_DEFAULTS: ProfileDefaults = ProfileDefaults {
    hispeed_freq: 1_350_000,
    go_hispeed_load: 93,
    min_sample_time_us: 60_000,
    timer_rate_us: 20_000,
    above_hispeed_delay_us: 30_000,
    timer_slack_us: 40_000,
    target_loads: &[40, 702_000, 50, 1_026_000, 60, 1_350_000, 70],
};

pub const IDLE_DEFAULTS: ProfileDefaults = ProfileDefaults {
    hispeed_freq: 702_000,
    go_hispeed_load: 99,
    min_sample_time_us: 20_000,
    timer_rate_us: 30_000,
    above_hispeed_delay_us: 150_000,
    timer_slack_us: -1,
    target_loads: &[60, 702_000, 70, 1_026_000, 80, 1_350_000, 90],
};

pub const BOOST_TARGET_LOADS: &[u32] = &[30, 702_000, 40, 1_026_000, 50, 1_350_000, 65];

impl ProfileValues {
    fn new(d: &ProfileDefaults) -> Self {
        Self {
            hispeed_freq: AtomicU32::new(d.hispeed_freq),
            go_hispeed_load: AtomicU64::new(d.go_hispeed_load),
            min_sample_time_us: AtomicU64::new(d.min_sample_time_us),
            timer_rate_us: AtomicU64::new(d.timer_rate_us),
            above_hispeed_delay_us: AtomicU64::new(d.above_hispeed_delay_us),
            timer_slack_us: AtomicI64::new(d.timer_slack_us),
            target_loads: TargetLoads::new(d.target_loads),
        }
    }
}

pub struct Profiles {
    pub busy: ProfileValues,
    pub idle: ProfileValues,
    pub boost: TargetLoads,
}

impl Default for Profiles {
    fn default() -> Self {
        Self {
            busy: ProfileValues::new(&BUSY_DEFAULTS),
            idle: ProfileValues::new(&IDLE_DEFAULTS),
            boost: TargetLoads::new(BOOST_TARGET_LOADS),
        }
    }
}
