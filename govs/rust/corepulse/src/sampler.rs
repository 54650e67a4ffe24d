// SPDX-License-Identifier: GPL-2.0
//
// Per-core load sampling from idle-time deltas. One LoadSample sits behind
// each core's load lock; all arithmetic is O(1) so the lock is only ever held
// briefly.

use anyhow::Result;

use corepulse_utils::CpuStat;

/// Accumulators for one core. `cputime_speedadj` integrates
/// `active_time × current_freq` since its timestamp, which is what lets the
/// governor recover an average active frequency per sample window.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoadSample {
    pub time_in_idle_us: u64,
    pub time_in_idle_ts_us: u64,
    pub cputime_speedadj: u64,
    pub cputime_speedadj_ts_us: u64,
}

impl LoadSample {
    /// Restart accounting from the current instant: fresh idle baseline,
    /// cleared speed-adjusted accumulator.
    pub fn reanchor(&mut self, cpu: usize, stat: &dyn CpuStat, iowait_is_idle: bool) -> Result<()> {
        let (idle, wall) = stat.idle_time_us(cpu, iowait_is_idle)?;
        self.time_in_idle_us = idle;
        self.time_in_idle_ts_us = wall;
        self.cputime_speedadj = 0;
        self.cputime_speedadj_ts_us = wall;
        Ok(())
    }

    /// Fold the active time since the previous sample into the accumulator,
    /// weighted by the frequency the hardware ran at. A wall delta of zero or
    /// one smaller than the idle delta contributes zero active time, which
    /// guards against counter glitches and sampling across a suspension.
    pub fn update(
        &mut self,
        cpu: usize,
        cur_khz: u32,
        stat: &dyn CpuStat,
        iowait_is_idle: bool,
    ) -> Result<u64> {
        let (now_idle, now) = stat.idle_time_us(cpu, iowait_is_idle)?;
        let delta_idle = now_idle.saturating_sub(self.time_in_idle_us);
        let delta_time = now.saturating_sub(self.time_in_idle_ts_us);
        let active_time = delta_time.saturating_sub(delta_idle);
        self.cputime_speedadj += active_time * cur_khz as u64;

        self.time_in_idle_us = now_idle;
        self.time_in_idle_ts_us = now;
        Ok(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockClock, MockStat};
    use std::sync::Arc;

    #[test]
    fn update_accumulates_active_times_freq() {
        let clock = Arc::new(MockClock::default());
        let stat = MockStat::new(1, clock.clone());

        let mut ls = LoadSample::default();
        ls.reanchor(0, &stat, false).unwrap();

        // 20 ms window, 5 ms idle -> 15 ms active at 1,026,000 kHz.
        clock.advance_us(20_000);
        stat.add_idle_us(0, 5_000);
        let now = ls.update(0, 1_026_000, &stat, false).unwrap();

        assert_eq!(now, ls.time_in_idle_ts_us);
        assert_eq!(ls.cputime_speedadj, 15_000 * 1_026_000);
    }

    #[test]
    fn idle_exceeding_wall_counts_as_zero_active() {
        let clock = Arc::new(MockClock::default());
        let stat = MockStat::new(1, clock.clone());

        let mut ls = LoadSample::default();
        ls.reanchor(0, &stat, false).unwrap();

        clock.advance_us(1_000);
        stat.add_idle_us(0, 50_000);
        ls.update(0, 1_350_000, &stat, false).unwrap();
        assert_eq!(ls.cputime_speedadj, 0);
    }

    #[test]
    fn reanchor_clears_the_accumulator() {
        let clock = Arc::new(MockClock::default());
        let stat = MockStat::new(1, clock.clone());

        let mut ls = LoadSample::default();
        ls.reanchor(0, &stat, false).unwrap();
        clock.advance_us(10_000);
        ls.update(0, 702_000, &stat, false).unwrap();
        assert!(ls.cputime_speedadj > 0);

        clock.advance_us(3_000);
        ls.reanchor(0, &stat, false).unwrap();
        assert_eq!(ls.cputime_speedadj, 0);
        assert_eq!(ls.cputime_speedadj_ts_us, ls.time_in_idle_ts_us);
    }
}
