// SPDX-License-Identifier: GPL-2.0
//
// Mode selection: resolves which tuning profile and hot-plug deltas apply
// given the GPU-idle flag and the touch-boost deadline.

use std::sync::atomic::Ordering;

use crate::context::Context;
use crate::profiles::ProfileValues;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Idle,
    Busy,
    Boost,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Idle => "idle",
            Mode::Busy => "busy",
            Mode::Boost => "boost",
        }
    }
}

/// Profile used for target-load lookups. Touch boost only ever shifts the
/// load table, and never while the GPU is idle.
pub fn freq_mode(ctx: &Context) -> Mode {
    if ctx.gpu_idle.load(Ordering::Relaxed) {
        Mode::Idle
    } else if ctx.boost_active(ctx.clock.now_ms()) {
        Mode::Boost
    } else {
        Mode::Busy
    }
}

/// Knob set for everything except target loads (timer rate, hispeed gate,
/// floor hold, slack). The boost profile carries no knobs, so this resolves
/// to idle or busy only.
pub fn timer_values(ctx: &Context) -> &ProfileValues {
    if ctx.gpu_idle.load(Ordering::Relaxed) {
        &ctx.profiles.idle
    } else {
        &ctx.profiles.busy
    }
}

pub fn freq_to_targetload(ctx: &Context, khz: u32) -> u32 {
    match freq_mode(ctx) {
        Mode::Idle => ctx.profiles.idle.target_loads.freq_to_targetload(khz),
        Mode::Boost => ctx.profiles.boost.freq_to_targetload(khz),
        Mode::Busy => ctx.profiles.busy.target_loads.freq_to_targetload(khz),
    }
}

/// Per-tick hysteresis deltas for the hot-plug decider: `(up_val, down_val)`.
pub fn plug_deltas(ctx: &Context, online: usize, now_ms: u64) -> (i32, i32) {
    if ctx.gpu_idle.load(Ordering::Relaxed) {
        (3, 6)
    } else if ctx.boost_active(now_ms)
        && online < ctx.cores_on_touch.load(Ordering::Relaxed) as usize
    {
        (15, 7)
    } else {
        (10, 5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockClock;
    use std::sync::Arc;

    fn ctx_at(ms: u64) -> Context {
        let clock = Arc::new(MockClock::default());
        clock.set_ms(ms);
        Context::new(clock)
    }

    #[test]
    fn gpu_idle_wins_over_boost() {
        let ctx = ctx_at(1000);
        ctx.gpu_idle.store(true, Ordering::Relaxed);
        ctx.boostpulse_endtime_ms.store(5000, Ordering::Relaxed);
        assert_eq!(freq_mode(&ctx), Mode::Idle);
        assert_eq!(plug_deltas(&ctx, 1, 1000), (3, 6));
    }

    #[test]
    fn boost_applies_until_deadline() {
        let ctx = ctx_at(1000);
        ctx.boostpulse_endtime_ms.store(1500, Ordering::Relaxed);
        assert_eq!(freq_mode(&ctx), Mode::Boost);
        // Boosted target loads, busy knobs.
        assert_eq!(freq_to_targetload(&ctx, 800_000), 40);
        assert_eq!(
            timer_values(&ctx).hispeed_freq.load(Ordering::Relaxed),
            1_350_000
        );
    }

    #[test]
    fn busy_is_the_fallback() {
        let ctx = ctx_at(2000);
        ctx.boostpulse_endtime_ms.store(1500, Ordering::Relaxed);
        assert_eq!(freq_mode(&ctx), Mode::Busy);
        assert_eq!(freq_to_targetload(&ctx, 800_000), 50);
    }

    #[test]
    fn touch_deltas_need_room_to_grow() {
        let ctx = ctx_at(1000);
        ctx.boostpulse_endtime_ms.store(1500, Ordering::Relaxed);
        // Below cores_on_touch: aggressive up deltas.
        assert_eq!(plug_deltas(&ctx, 1, 1000), (15, 7));
        // At or above cores_on_touch: plain busy deltas.
        assert_eq!(plug_deltas(&ctx, 2, 1000), (10, 5));
        // Expired boost: busy deltas regardless.
        assert_eq!(plug_deltas(&ctx, 1, 2000), (10, 5));
    }
}
