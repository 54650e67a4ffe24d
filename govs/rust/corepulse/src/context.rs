// SPDX-License-Identifier: GPL-2.0
//
// Process-wide controller state: the coupling signals shared by the frequency
// governor and the hot-plug decider, the tuning profiles, and the metrics
// counters. One instance lives behind an Arc for the lifetime of the daemon.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use corepulse_utils::Clock;

use crate::profiles::Profiles;

/// Saturation point of the hot-plug hysteresis counters.
pub const DEFAULT_COUNTER: i32 = 50;
/// Window after a hot-plug action during which reversal is damped, in ms.
pub const BOOST_TIME_MS: u64 = 3000;
/// Cores kept online while a touch boost is active.
pub const DEFAULT_CORES_ON_TOUCH: u32 = 2;
/// Ceiling on the managed core population.
pub const ACTIVE_CORES: usize = 4;
/// Touch-boost window default, in ms.
pub const DEFAULT_BOOSTPULSE_DURATION_MS: u64 = 1500;

/// Event counters exported through the stats server. All monotonic except
/// where noted.
#[derive(Default)]
pub struct Counters {
    pub timer_ticks: AtomicU64,
    pub freq_changes: AtomicU64,
    pub hispeed_jumps: AtomicU64,
    pub above_hispeed_deferred: AtomicU64,
    pub floor_deferred: AtomicU64,
    pub sample_glitches: AtomicU64,
    pub table_lookup_errors: AtomicU64,
    pub plug_ticks: AtomicU64,
    pub cores_onlined: AtomicU64,
    pub cores_offlined: AtomicU64,
    pub offline_deferred: AtomicU64,
    /// Gauge: average normalized load seen by the last decider tick.
    pub last_avg_load: AtomicU64,
}

pub struct Context {
    /// Published by the GPU monitor; selects the idle tuning profile and the
    /// gentler hot-plug deltas.
    pub gpu_idle: AtomicBool,
    /// Monotonic ms deadline of the touch boost, poked by the input monitor.
    pub boostpulse_endtime_ms: AtomicU64,
    /// Monotonic ms deadline set by the decider after a hot-plug action.
    pub coreboost_endtime_ms: AtomicU64,
    pub boostpulse_duration_ms: AtomicU64,
    pub cores_on_touch: AtomicU32,
    /// Up-hysteresis accumulator, clamped to [-DEFAULT_COUNTER, DEFAULT_COUNTER].
    pub first_counter: AtomicI32,
    /// Down-hysteresis accumulator, same clamp.
    pub third_counter: AtomicI32,
    /// Mirrors the last screen_state attribute write.
    pub screen_on: AtomicBool,
    pub profiles: Profiles,
    pub counters: Counters,
    pub clock: Arc<dyn Clock>,
}

impl Context {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            gpu_idle: AtomicBool::new(false),
            boostpulse_endtime_ms: AtomicU64::new(0),
            coreboost_endtime_ms: AtomicU64::new(0),
            boostpulse_duration_ms: AtomicU64::new(DEFAULT_BOOSTPULSE_DURATION_MS),
            cores_on_touch: AtomicU32::new(DEFAULT_CORES_ON_TOUCH),
            first_counter: AtomicI32::new(0),
            third_counter: AtomicI32::new(0),
            screen_on: AtomicBool::new(true),
            profiles: Profiles::default(),
            counters: Counters::default(),
            clock,
        }
    }

    /// Touch-driven poke: extend the boost window from now.
    pub fn boostpulse(&self) {
        let until = self.clock.now_ms() + self.boostpulse_duration_ms.load(Ordering::Relaxed);
        self.boostpulse_endtime_ms.store(until, Ordering::Relaxed);
    }

    pub fn boost_active(&self, now_ms: u64) -> bool {
        self.boostpulse_endtime_ms.load(Ordering::Relaxed) > now_ms
    }

    pub fn reset_plug_counters(&self) {
        self.first_counter.store(0, Ordering::Relaxed);
        self.third_counter.store(0, Ordering::Relaxed);
    }
}
