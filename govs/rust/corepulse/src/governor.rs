// SPDX-License-Identifier: GPL-2.0
//
// The per-core interactive frequency governor. Each online core samples its
// own load on a pinned timer, converts the speed-adjusted active time into a
// target frequency, and hands cluster-wide application to the speed-change
// worker. Steady state takes only try-lock reads of the per-core enable
// gate; lifecycle transitions take the write side.

use anyhow::{Context as _, Result};
use arc_swap::ArcSwapOption;
use log::{info, warn};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use corepulse_utils::{warn_once, CpuStat, FreqDriver, FreqTable, Relation};

use crate::context::Context;
use crate::modes;
use crate::sampler::LoadSample;
use crate::speedchange::SpeedChange;
use crate::timer::CpuTimer;

/// A group of cores whose frequency the hardware sets together.
pub struct Policy {
    pub id: usize,
    pub cpus: Vec<usize>,
    pub table: FreqTable,
    pub min_khz: AtomicU32,
    pub max_khz: AtomicU32,
    /// Last frequency the speed-change worker programmed.
    pub cur_khz: AtomicU32,
}

impl Policy {
    /// Quantize a request to the table within the current policy band.
    pub fn table_target(&self, khz: u32, relation: Relation) -> Result<u32> {
        self.table.target(
            khz,
            relation,
            self.min_khz.load(Ordering::Relaxed),
            self.max_khz.load(Ordering::Relaxed),
        )
    }
}

/// Per-core governor state. One record per possible CPU, allocated once and
/// stable for the life of the process.
pub struct CpuState {
    pub cpu: usize,
    pub policy: ArcSwapOption<Policy>,
    /// The enable gate: timer bodies and the worker take the read side with
    /// try-lock only; start/stop transitions block on the write side.
    pub enabled: RwLock<bool>,
    /// Protects the four sampling accumulators.
    pub load: Mutex<LoadSample>,
    pub target_freq: AtomicU32,
    pub floor_freq: AtomicU32,
    pub floor_validate_time_us: AtomicU64,
    pub hispeed_validate_time_us: AtomicU64,
    pub timer: CpuTimer,
}

impl CpuState {
    fn new(cpu: usize) -> Self {
        Self {
            cpu,
            policy: ArcSwapOption::empty(),
            enabled: RwLock::new(false),
            load: Mutex::new(LoadSample::default()),
            target_freq: AtomicU32::new(0),
            floor_freq: AtomicU32::new(0),
            floor_validate_time_us: AtomicU64::new(0),
            hispeed_validate_time_us: AtomicU64::new(0),
            timer: CpuTimer::default(),
        }
    }
}

pub struct Interactive {
    pub ctx: Arc<Context>,
    driver: Arc<dyn FreqDriver>,
    stat: Arc<dyn CpuStat>,
    cpus: Vec<Arc<CpuState>>,
    speedchange: Arc<SpeedChange>,
    /// Serializes start/stop across policies; the guarded value is the number
    /// of policies currently running this governor.
    gov_lock: Mutex<usize>,
    active_policies: AtomicUsize,
}

impl Interactive {
    pub fn new(
        ctx: Arc<Context>,
        driver: Arc<dyn FreqDriver>,
        stat: Arc<dyn CpuStat>,
        nr_cpus: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            driver,
            stat,
            cpus: (0..nr_cpus).map(|c| Arc::new(CpuState::new(c))).collect(),
            speedchange: Arc::new(SpeedChange::default()),
            gov_lock: Mutex::new(0),
            active_policies: AtomicUsize::new(0),
        })
    }

    /// Spawn the per-CPU timer threads and the real-time speed-change worker.
    /// Unit tests skip this and crank the tick bodies directly.
    pub fn spawn_workers(self: &Arc<Self>) -> Result<()> {
        for state in &self.cpus {
            let weak = Arc::downgrade(self);
            let cpu = state.cpu;
            state.timer.spawn(cpu, move || {
                if let Some(gov) = weak.upgrade() {
                    gov.timer_tick(cpu);
                }
            });
        }
        self.speedchange.spawn(Arc::downgrade(self))?;
        Ok(())
    }

    pub fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }

    #[allow(dead_code)]
    pub fn cpu_state(&self, cpu: usize) -> &Arc<CpuState> {
        &self.cpus[cpu]
    }

    pub fn active_policies(&self) -> usize {
        self.active_policies.load(Ordering::Relaxed)
    }

    /// Assemble a Policy from what the driver reports today.
    pub fn policy_from_driver(&self, policy_id: usize) -> Result<Arc<Policy>> {
        let cpus = self.driver.related_cpus(policy_id)?;
        let table = self.driver.freq_table(policy_id)?;
        let (min, max) = self.driver.limits_khz(policy_id)?;
        let cur = self.driver.cur_khz(policy_id)?;
        Ok(Arc::new(Policy {
            id: policy_id,
            cpus,
            table,
            min_khz: AtomicU32::new(min),
            max_khz: AtomicU32::new(max),
            cur_khz: AtomicU32::new(cur),
        }))
    }

    /// Governor START for one policy. Returns the active-policy count after
    /// the transition so the caller can bring up the shared surfaces on 0→1.
    pub fn start(&self, policy: &Arc<Policy>) -> Result<usize> {
        let mut active = self.gov_lock.lock().unwrap();

        let cur = self
            .driver
            .cur_khz(policy.id)
            .with_context(|| format!("policy{}: cannot read current frequency", policy.id))?;
        policy.cur_khz.store(cur, Ordering::Relaxed);

        let now_us = self.ctx.clock.now_us();
        let gpu_idle = self.ctx.gpu_idle.load(Ordering::Relaxed);
        // START always arms with the idle profile's cadence; the first tick
        // re-evaluates against the live mode.
        let rate = self.ctx.profiles.idle.timer_rate_us.load(Ordering::Relaxed);
        let slack = self.ctx.profiles.idle.timer_slack_us.load(Ordering::Relaxed);

        for &cpu in &policy.cpus {
            let state = &self.cpus[cpu];
            state.policy.store(Some(Arc::clone(policy)));
            state.target_freq.store(cur, Ordering::SeqCst);
            state.floor_freq.store(cur, Ordering::Relaxed);
            state.floor_validate_time_us.store(now_us, Ordering::Relaxed);
            state.hispeed_validate_time_us.store(now_us, Ordering::Relaxed);
            if let Err(e) = state.load.lock().unwrap().reanchor(cpu, &*self.stat, gpu_idle) {
                warn!("cpu{}: initial load anchor failed: {:#}", cpu, e);
            }

            let mut enabled = state.enabled.write().unwrap();
            let deadline = Instant::now() + Duration::from_micros(rate);
            let slack_deadline =
                (slack >= 0).then(|| deadline + Duration::from_micros(slack as u64));
            state.timer.arm(deadline, slack_deadline);
            *enabled = true;
        }

        *active += 1;
        self.active_policies.store(*active, Ordering::Relaxed);
        info!(
            "governor started for policy{} (cpus {:?}, cur {} kHz)",
            policy.id, policy.cpus, cur
        );
        Ok(*active)
    }

    /// Governor STOP. Returns the remaining active-policy count so the caller
    /// can tear down shared surfaces on 1→0.
    pub fn stop(&self, policy: &Policy) -> usize {
        let mut active = self.gov_lock.lock().unwrap();
        for &cpu in &policy.cpus {
            let state = &self.cpus[cpu];
            // An in-flight tick holds the read gate, so the write acquisition
            // waits it out; whatever fires afterwards sees the cleared flag.
            let mut enabled = state.enabled.write().unwrap();
            *enabled = false;
            state.timer.cancel_sync();
        }
        *active = active.saturating_sub(1);
        self.active_policies.store(*active, Ordering::Relaxed);
        info!("governor stopped for policy{}", policy.id);
        *active
    }

    /// Governor LIMITS: install a new band and clamp the running frequency
    /// into it right away.
    pub fn apply_limits(&self, policy: &Arc<Policy>, min_khz: u32, max_khz: u32) {
        policy.min_khz.store(min_khz, Ordering::Relaxed);
        policy.max_khz.store(max_khz, Ordering::Relaxed);
        let cur = policy.cur_khz.load(Ordering::Relaxed);
        if max_khz < cur {
            self.set_policy_freq(policy, max_khz, Relation::High);
        } else if min_khz > cur {
            self.set_policy_freq(policy, min_khz, Relation::Low);
        }
    }

    /// One governor tick for `cpu`. Runs on the core's timer thread; also
    /// invoked inline by the idle-end hook when the timer had already
    /// expired.
    pub fn timer_tick(&self, cpu: usize) {
        let state = &self.cpus[cpu];
        let Ok(gate) = state.enabled.try_read() else {
            return;
        };
        if !*gate {
            return;
        }
        let Some(policy) = state.policy.load_full() else {
            return;
        };
        let ctx = &self.ctx;
        let gpu_idle = ctx.gpu_idle.load(Ordering::Relaxed);
        ctx.counters.timer_ticks.fetch_add(1, Ordering::Relaxed);

        let (now, delta_time, cputime_speedadj) = {
            let mut load = state.load.lock().unwrap();
            let now = match load.update(
                cpu,
                policy.cur_khz.load(Ordering::Relaxed),
                &*self.stat,
                gpu_idle,
            ) {
                Ok(now) => now,
                Err(e) => {
                    warn_once!("cpu{}: idle time source failed: {:#}", cpu, e);
                    ctx.counters.sample_glitches.fetch_add(1, Ordering::Relaxed);
                    self.rearm(state);
                    return;
                }
            };
            let delta_time = now.saturating_sub(load.cputime_speedadj_ts_us);
            let adj = load.cputime_speedadj;
            load.cputime_speedadj = 0;
            load.cputime_speedadj_ts_us = now;
            (now, delta_time, adj)
        };

        if delta_time == 0 {
            warn_once!("cpu{}: zero-width sample window, skipping tick", cpu);
            ctx.counters.sample_glitches.fetch_add(1, Ordering::Relaxed);
            self.rearm(state);
            return;
        }

        let values = modes::timer_values(ctx);
        let hispeed = values.hispeed_freq.load(Ordering::Relaxed);
        let go_hispeed = values.go_hispeed_load.load(Ordering::Relaxed);

        // Average active frequency over the window, scaled by 100 so that
        // dividing by a frequency yields a percentage.
        let loadadjfreq = (cputime_speedadj / delta_time) * 100;
        let target = state.target_freq.load(Ordering::SeqCst);
        let cpu_load = loadadjfreq / target.max(1) as u64;

        let chosen = if cpu_load >= go_hispeed {
            if target < hispeed {
                ctx.counters.hispeed_jumps.fetch_add(1, Ordering::Relaxed);
                Ok(hispeed)
            } else {
                self.choose_freq(&policy, loadadjfreq).map(|f| f.max(hispeed))
            }
        } else {
            self.choose_freq(&policy, loadadjfreq)
        };
        let new_freq = match chosen {
            Ok(f) => f,
            Err(e) => {
                warn_once!("cpu{}: frequency table lookup failed: {:#}", cpu, e);
                ctx.counters.table_lookup_errors.fetch_add(1, Ordering::Relaxed);
                self.rearm(state);
                return;
            }
        };

        // Ramping further above hispeed is rate-limited.
        if target >= hispeed
            && new_freq > target
            && now.saturating_sub(state.hispeed_validate_time_us.load(Ordering::Relaxed))
                < values.above_hispeed_delay_us.load(Ordering::Relaxed)
        {
            ctx.counters
                .above_hispeed_deferred
                .fetch_add(1, Ordering::Relaxed);
            self.rearm(state);
            return;
        }
        state.hispeed_validate_time_us.store(now, Ordering::Relaxed);

        let new_freq = match policy.table_target(new_freq, Relation::Low) {
            Ok(f) => f,
            Err(e) => {
                warn_once!("cpu{}: frequency table lookup failed: {:#}", cpu, e);
                ctx.counters.table_lookup_errors.fetch_add(1, Ordering::Relaxed);
                self.rearm(state);
                return;
            }
        };

        // Do not scale below the floor until it has been held for the
        // minimum sample time. A permitted drop takes the floor down with
        // it, so the floor never exceeds the target.
        if new_freq < state.floor_freq.load(Ordering::Relaxed) {
            if now.saturating_sub(state.floor_validate_time_us.load(Ordering::Relaxed))
                < values.min_sample_time_us.load(Ordering::Relaxed)
            {
                ctx.counters.floor_deferred.fetch_add(1, Ordering::Relaxed);
                self.rearm(state);
                return;
            }
            state.floor_freq.store(new_freq, Ordering::Relaxed);
            state.floor_validate_time_us.store(now, Ordering::Relaxed);
        }

        // A speed above hispeed raises the floor; a hispeed boost itself does
        // not, so it can drop as soon as the pulse ends.
        if new_freq > hispeed {
            state.floor_freq.store(new_freq, Ordering::Relaxed);
            state.floor_validate_time_us.store(now, Ordering::Relaxed);
        }

        if target != new_freq {
            state.target_freq.store(new_freq, Ordering::SeqCst);
            self.speedchange.request(cpu);
        }

        // At the policy maximum there is nothing further to re-evaluate;
        // wait for the idle hook to rearm.
        if state.target_freq.load(Ordering::SeqCst) == policy.max_khz.load(Ordering::Relaxed) {
            return;
        }
        self.rearm(state);
    }

    fn rearm(&self, state: &Arc<CpuState>) {
        if !state.timer.pending() {
            self.timer_resched(state);
        }
    }

    /// Arm the core's timers for the next period and re-anchor its sampling
    /// baseline.
    fn timer_resched(&self, state: &Arc<CpuState>) {
        let ctx = &self.ctx;
        let values = modes::timer_values(ctx);
        let rate = values.timer_rate_us.load(Ordering::Relaxed);
        let slack = values.timer_slack_us.load(Ordering::Relaxed);
        let deadline = Instant::now() + Duration::from_micros(rate);
        let min_khz = state
            .policy
            .load_full()
            .map(|p| p.min_khz.load(Ordering::Relaxed))
            .unwrap_or(0);
        let slack_deadline = (slack >= 0
            && state.target_freq.load(Ordering::SeqCst) > min_khz)
            .then(|| deadline + Duration::from_micros(slack as u64));
        state.timer.arm(deadline, slack_deadline);

        let gpu_idle = ctx.gpu_idle.load(Ordering::Relaxed);
        if let Err(e) = state
            .load
            .lock()
            .unwrap()
            .reanchor(state.cpu, &*self.stat, gpu_idle)
        {
            warn_once!("cpu{}: load re-anchor failed: {:#}", state.cpu, e);
        }
    }

    /// Converge on the lowest table frequency whose target load the observed
    /// `loadadjfreq` does not exceed, bracketing from the current frequency.
    fn choose_freq(&self, policy: &Policy, loadadjfreq: u64) -> Result<u32> {
        let mut freq = policy.cur_khz.load(Ordering::Relaxed);
        let mut freqmin = 0u32;
        let mut freqmax = u32::MAX;

        loop {
            let prevfreq = freq;
            let tl = modes::freq_to_targetload(&self.ctx, freq) as u64;
            let req = (loadadjfreq / tl.max(1)).min(u32::MAX as u64) as u32;

            // Lowest frequency where the computed load stays at or under the
            // target load.
            freq = policy.table_target(req, Relation::Low)?;

            if freq > prevfreq {
                // The previous frequency is too low.
                freqmin = prevfreq;
                if freq >= freqmax {
                    freq = policy.table_target(freqmax - 1, Relation::High)?;
                    if freq == freqmin {
                        // The first entry below freqmax is already known to
                        // be too slow; freqmax is the answer.
                        freq = freqmax;
                        break;
                    }
                }
            } else if freq < prevfreq {
                // The previous frequency is high enough.
                freqmax = prevfreq;
                if freq <= freqmin {
                    freq = policy.table_target(freqmin + 1, Relation::Low)?;
                    if freq == freqmax {
                        break;
                    }
                }
            }

            if freq == prevfreq {
                break;
            }
        }
        Ok(freq)
    }

    /// IDLE_START hook: an idling core that is not at the policy minimum
    /// keeps its timer running so it cannot pin the cluster speed up
    /// indefinitely. No userspace event source delivers idle transitions;
    /// the hooks stay as the integration point for platforms that do.
    #[allow(dead_code)]
    pub fn idle_start(&self, cpu: usize) {
        let state = &self.cpus[cpu];
        let Ok(gate) = state.enabled.try_read() else {
            return;
        };
        if !*gate {
            return;
        }
        let min_khz = state
            .policy
            .load_full()
            .map(|p| p.min_khz.load(Ordering::Relaxed))
            .unwrap_or(0);
        if state.target_freq.load(Ordering::SeqCst) != min_khz && !state.timer.pending() {
            self.timer_resched(state);
        }
    }

    /// IDLE_END hook: make sure a tick happens soon; if the deadline already
    /// passed while the core slept, run the tick body inline.
    #[allow(dead_code)]
    pub fn idle_end(&self, cpu: usize) {
        let state = &self.cpus[cpu];
        let run_inline = {
            let Ok(gate) = state.enabled.try_read() else {
                return;
            };
            if !*gate {
                return;
            }
            match state.timer.deadline() {
                None => {
                    self.timer_resched(state);
                    false
                }
                Some(deadline) if deadline <= Instant::now() => {
                    state.timer.cancel();
                    true
                }
                Some(_) => false,
            }
        };
        if run_inline {
            self.timer_tick(cpu);
        }
    }

    /// Speed-change worker body for one queued CPU: apply the maximum target
    /// frequency across the policy so the fastest-requesting member wins.
    pub(crate) fn apply_speed(&self, cpu: usize) {
        let state = &self.cpus[cpu];
        let Ok(gate) = state.enabled.try_read() else {
            return;
        };
        if !*gate {
            return;
        }
        let Some(policy) = state.policy.load_full() else {
            return;
        };
        let cluster_max = policy
            .cpus
            .iter()
            .map(|&j| self.cpus[j].target_freq.load(Ordering::SeqCst))
            .max()
            .unwrap_or(0);
        if cluster_max != policy.cur_khz.load(Ordering::Relaxed) {
            self.set_policy_freq(&policy, cluster_max, Relation::High);
        }
    }

    /// Drive the hardware and publish the change. The driver is
    /// authoritative: on failure the governor tolerates the divergence and
    /// the next tick re-evaluates.
    fn set_policy_freq(&self, policy: &Arc<Policy>, khz: u32, relation: Relation) {
        match self.driver.set_khz(policy.id, khz, relation) {
            Ok(actual) => {
                policy.cur_khz.store(actual, Ordering::Relaxed);
                self.ctx.counters.freq_changes.fetch_add(1, Ordering::Relaxed);
                self.freq_postchange(policy);
            }
            Err(e) => {
                warn!("policy{}: set {} kHz failed: {:#}", policy.id, khz, e);
            }
        }
    }

    /// POSTCHANGE pass: re-anchor every sibling's accumulators so further
    /// active time is weighted by the frequency the hardware now runs at.
    fn freq_postchange(&self, policy: &Arc<Policy>) {
        let gpu_idle = self.ctx.gpu_idle.load(Ordering::Relaxed);
        for &cpu in &policy.cpus {
            let state = &self.cpus[cpu];
            let Ok(gate) = state.enabled.try_read() else {
                continue;
            };
            if !*gate {
                continue;
            }
            let mut load = state.load.lock().unwrap();
            let _ = load.update(cpu, policy.cur_khz.load(Ordering::Relaxed), &*self.stat, gpu_idle);
        }
    }

    /// Per-CPU `(cpu, target_freq)` snapshot of the enabled cores.
    pub fn target_snapshot(&self) -> Vec<(usize, u32)> {
        self.cpus
            .iter()
            .filter(|s| s.enabled.try_read().map(|g| *g).unwrap_or(false))
            .map(|s| (s.cpu, s.target_freq.load(Ordering::SeqCst)))
            .collect()
    }

    /// Stop every worker thread. Only called on daemon shutdown.
    pub fn shutdown(&self) {
        for state in &self.cpus {
            state.timer.stop();
        }
        self.speedchange.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockClock, MockFreqDriver, MockStat};

    struct Rig {
        clock: Arc<MockClock>,
        stat: Arc<MockStat>,
        driver: Arc<MockFreqDriver>,
        gov: Arc<Interactive>,
        policy: Arc<Policy>,
    }

    /// One policy over `nr` cpus, governor started, worker threads NOT
    /// spawned so ticks are cranked by hand.
    fn rig(nr: usize) -> Rig {
        let clock = Arc::new(MockClock::default());
        clock.set_ms(100_000);
        let stat = Arc::new(MockStat::new(nr, Arc::clone(&clock)));
        let driver = Arc::new(MockFreqDriver::new((0..nr).collect()));
        let ctx = Arc::new(Context::new(clock.clone()));
        let gov = Interactive::new(Arc::clone(&ctx), driver.clone(), stat.clone(), nr);
        let policy = gov.policy_from_driver(0).unwrap();
        gov.start(&policy).unwrap();
        Rig {
            clock,
            stat,
            driver,
            gov,
            policy,
        }
    }

    /// Let `window_us` elapse with the core idle for `idle_us` of it, then
    /// run the tick the way an expiring timer would: the pending deadline is
    /// consumed before the body runs.
    fn run_window(r: &Rig, cpu: usize, window_us: u64, idle_us: u64) {
        r.clock.advance_us(window_us);
        r.stat.add_idle_us(cpu, idle_us);
        r.gov.cpu_state(cpu).timer.cancel();
        r.gov.timer_tick(cpu);
        // The worker thread is not running; drain its queue inline.
        for c in r.gov.speedchange.drain_for_test() {
            r.gov.apply_speed(c);
        }
    }

    #[test]
    fn saturated_core_jumps_to_hispeed() {
        // Scenario A: busy load ~99% at the minimum frequency jumps straight
        // to hispeed and the hardware follows.
        let r = rig(1);
        let st = r.gov.cpu_state(0);
        assert_eq!(st.target_freq.load(Ordering::SeqCst), 384_000);

        run_window(&r, 0, 20_000, 200);
        assert_eq!(st.target_freq.load(Ordering::SeqCst), 1_350_000);
        assert_eq!(r.driver.cur_khz.load(Ordering::SeqCst), 1_350_000);
        assert!(st.timer.pending());
    }

    #[test]
    fn above_hispeed_ramp_is_rate_limited() {
        // Scenario B: at hispeed with a saturated load, a further ramp within
        // above_hispeed_delay is rejected and the timer rearms.
        let r = rig(1);
        let st = r.gov.cpu_state(0);
        run_window(&r, 0, 20_000, 200);
        assert_eq!(st.target_freq.load(Ordering::SeqCst), 1_350_000);

        // 10 ms later (< 30 ms busy above_hispeed_delay), still saturated.
        run_window(&r, 0, 10_000, 0);
        assert_eq!(st.target_freq.load(Ordering::SeqCst), 1_350_000);
        assert!(st.timer.pending());

        // Past the delay the ramp goes through.
        run_window(&r, 0, 40_000, 0);
        assert_eq!(st.target_freq.load(Ordering::SeqCst), 1_512_000);
    }

    #[test]
    fn floor_holds_until_min_sample_time() {
        // Scenario C: a frequency above hispeed sets the floor; a light load
        // cannot drop below it until min_sample_time has passed.
        let r = rig(1);
        let st = r.gov.cpu_state(0);

        // Saturate long enough to reach the table top and raise the floor.
        run_window(&r, 0, 20_000, 200);
        run_window(&r, 0, 40_000, 0);
        assert_eq!(st.target_freq.load(Ordering::SeqCst), 1_512_000);
        assert_eq!(st.floor_freq.load(Ordering::Relaxed), 1_512_000);

        // 30 ms of near-idle: below min_sample_time (60 ms), no drop.
        run_window(&r, 0, 30_000, 29_000);
        assert_eq!(st.target_freq.load(Ordering::SeqCst), 1_512_000);

        // Another 40 ms of near-idle: the floor hold expires, speed drops.
        run_window(&r, 0, 40_000, 39_000);
        assert!(st.target_freq.load(Ordering::SeqCst) < 1_512_000);
    }

    #[test]
    fn target_stays_in_table_and_above_floor() {
        // Invariants 1 and 2 across a mixed workload.
        let r = rig(1);
        let st = r.gov.cpu_state(0);
        let windows = [
            (20_000u64, 0u64),
            (20_000, 5_000),
            (20_000, 19_000),
            (30_000, 29_500),
            (20_000, 1_000),
            (50_000, 50_000),
            (20_000, 10_000),
        ];
        for (window, idle) in windows {
            run_window(&r, 0, window, idle);
            let target = st.target_freq.load(Ordering::SeqCst);
            assert!(r.policy.table.freqs().contains(&target));
            assert!(st.floor_freq.load(Ordering::Relaxed) <= target);
        }
    }

    #[test]
    fn speedadj_timestamps_stay_in_sync() {
        // Invariant 3: after the sampling step of each tick, both timestamps
        // agree.
        let r = rig(1);
        run_window(&r, 0, 20_000, 4_000);
        let load = r.gov.cpu_state(0).load.lock().unwrap().clone();
        assert_eq!(load.cputime_speedadj_ts_us, load.time_in_idle_ts_us);
    }

    #[test]
    fn cluster_tracks_fastest_member() {
        let r = rig(2);
        // CPU 1 idles, CPU 0 saturates: the shared policy follows CPU 0.
        r.clock.advance_us(20_000);
        r.stat.add_idle_us(1, 20_000);
        r.gov.timer_tick(0);
        r.gov.timer_tick(1);
        for c in r.gov.speedchange.drain_for_test() {
            r.gov.apply_speed(c);
        }
        assert_eq!(r.driver.cur_khz.load(Ordering::SeqCst), 1_350_000);
        assert!(
            r.gov.cpu_state(1).target_freq.load(Ordering::SeqCst)
                < r.gov.cpu_state(0).target_freq.load(Ordering::SeqCst)
        );
    }

    #[test]
    fn set_frequency_failure_is_tolerated() {
        let r = rig(1);
        r.driver.fail_set.store(true, Ordering::SeqCst);
        run_window(&r, 0, 20_000, 0);
        // Target moved, hardware did not; next tick re-evaluates.
        assert_eq!(
            r.gov.cpu_state(0).target_freq.load(Ordering::SeqCst),
            1_350_000
        );
        assert_eq!(r.driver.cur_khz.load(Ordering::SeqCst), 384_000);
        assert!(r.gov.cpu_state(0).timer.pending());
    }

    #[test]
    fn disabled_core_ignores_ticks() {
        let r = rig(1);
        r.gov.stop(&r.policy);
        let before = r.gov.ctx.counters.timer_ticks.load(Ordering::Relaxed);
        r.clock.advance_us(20_000);
        r.gov.timer_tick(0);
        assert_eq!(r.gov.ctx.counters.timer_ticks.load(Ordering::Relaxed), before);
        assert!(!r.gov.cpu_state(0).timer.pending());
    }

    #[test]
    fn start_stop_counts_active_policies() {
        let r = rig(1);
        assert_eq!(r.gov.active_policies(), 1);
        assert_eq!(r.gov.stop(&r.policy), 0);
        assert_eq!(r.gov.start(&r.policy).unwrap(), 1);
    }

    #[test]
    fn choose_freq_is_idempotent() {
        let r = rig(1);
        for loadadj in [10_000_000u64, 40_000_000, 70_000_000, 120_000_000] {
            let a = r.gov.choose_freq(&r.policy, loadadj).unwrap();
            let b = r.gov.choose_freq(&r.policy, loadadj).unwrap();
            assert_eq!(a, b, "choose_freq unstable at loadadjfreq {}", loadadj);
        }
    }

    #[test]
    fn choose_freq_picks_lowest_satisfying_frequency() {
        let r = rig(1);
        // Busy table: 40% below 702 MHz. An average active frequency of
        // 200,000 kHz needs freq >= 200000*100/40 = 500,000 -> 702,000.
        assert_eq!(r.gov.choose_freq(&r.policy, 20_000_000).unwrap(), 702_000);
        // 60,000 kHz average: 60000*100/40 = 150,000 -> lowest entry.
        assert_eq!(r.gov.choose_freq(&r.policy, 6_000_000).unwrap(), 384_000);
        // Saturation at the top of the table.
        assert_eq!(
            r.gov.choose_freq(&r.policy, 160_000_000).unwrap(),
            1_512_000
        );
    }

    #[test]
    fn max_frequency_parks_the_timer_until_idle_end() {
        let r = rig(1);
        let st = r.gov.cpu_state(0);
        run_window(&r, 0, 20_000, 0);
        run_window(&r, 0, 40_000, 0);
        assert_eq!(st.target_freq.load(Ordering::SeqCst), 1_512_000);
        // At policy max the tick does not rearm.
        assert!(!st.timer.pending());

        // IDLE_END brings it back.
        r.clock.advance_us(5_000);
        r.gov.idle_end(0);
        assert!(st.timer.pending());
    }

    #[test]
    fn idle_start_arms_timer_when_above_min() {
        let r = rig(1);
        let st = r.gov.cpu_state(0);
        run_window(&r, 0, 20_000, 0);
        run_window(&r, 0, 40_000, 0);
        assert!(!st.timer.pending());
        r.gov.idle_start(0);
        assert!(st.timer.pending());

        // At the minimum, idle-start leaves the timer alone.
        st.timer.cancel();
        st.target_freq.store(384_000, Ordering::SeqCst);
        r.gov.idle_start(0);
        assert!(!st.timer.pending());
    }

    #[test]
    fn limits_clamp_running_frequency() {
        let r = rig(1);
        run_window(&r, 0, 20_000, 0);
        assert_eq!(r.policy.cur_khz.load(Ordering::Relaxed), 1_350_000);

        r.driver.max_khz.store(1_026_000, Ordering::SeqCst);
        r.gov.apply_limits(&r.policy, 384_000, 1_026_000);
        assert_eq!(r.policy.cur_khz.load(Ordering::Relaxed), 1_026_000);

        r.driver.max_khz.store(1_512_000, Ordering::SeqCst);
        r.gov.apply_limits(&r.policy, 702_000, 1_512_000);
        assert_eq!(r.policy.cur_khz.load(Ordering::Relaxed), 1_026_000);
    }
}
