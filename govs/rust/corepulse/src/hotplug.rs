// SPDX-License-Identifier: GPL-2.0
//
// Cluster-wide hot-plug control. A single decider thread ticks every 30 ms,
// averages a frequency-normalized load over the online cores, and walks two
// hysteresis counters toward a bring-up or tear-down decision. A companion
// worker handles the screen-off/screen-on lifecycle.

use anyhow::{Context as _, Result};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{info, warn};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use corepulse_utils::{warn_once, CpuOnline, CpuStat, FreqDriver};

use crate::context::{Context, ACTIVE_CORES, BOOST_TIME_MS, DEFAULT_COUNTER};
use crate::modes;

pub const PLUG_TICK: Duration = Duration::from_millis(30);
/// First decider tick after daemon start. The original waited out the boot;
/// a daemon starts late enough that a short settle suffices.
pub const STARTUP_DELAY: Duration = Duration::from_secs(2);
pub const RESUME_DELAY: Duration = Duration::from_secs(1);

/// `(down, up)` load thresholds, indexed by `[gpu_busy][online - 1]`. The
/// down entry for a single core is inert: core 0 is never offlined.
const PLUG_THRESHOLDS: [[(u32, u32); ACTIVE_CORES]; 2] = [
    // GPU idle
    [(0, 80), (40, 85), (50, 90), (60, 100)],
    // GPU busy
    [(0, 60), (30, 60), (30, 65), (40, 100)],
];

fn threshold_row(gpu_idle: bool, online: usize) -> (u32, u32) {
    let mode = if gpu_idle { 0 } else { 1 };
    PLUG_THRESHOLDS[mode][online.clamp(1, ACTIVE_CORES) - 1]
}

pub fn up_threshold(gpu_idle: bool, online: usize) -> u32 {
    threshold_row(gpu_idle, online).1
}

pub fn down_threshold(gpu_idle: bool, online: usize) -> u32 {
    threshold_row(gpu_idle, online).0
}

/// Decider-private idle accumulators, one per possible CPU. Kept separate
/// from the governor's sampler so the two loops cannot steal each other's
/// deltas.
#[derive(Default, Clone, Copy)]
struct PlugLoad {
    prev_idle_us: u64,
    prev_wall_us: u64,
}

/// The decider state machine, separated from its thread so tests can crank
/// ticks directly.
pub struct DeciderCore {
    ctx: Arc<Context>,
    driver: Arc<dyn FreqDriver>,
    stat: Arc<dyn CpuStat>,
    cpus: Arc<dyn CpuOnline>,
    /// Policy id per CPU, fixed at startup.
    cpu_policy: Vec<Option<usize>>,
    loads: Vec<PlugLoad>,
}

impl DeciderCore {
    pub fn new(
        ctx: Arc<Context>,
        driver: Arc<dyn FreqDriver>,
        stat: Arc<dyn CpuStat>,
        cpus: Arc<dyn CpuOnline>,
        cpu_policy: Vec<Option<usize>>,
    ) -> Self {
        let nr = cpus.nr_possible();
        Self {
            ctx,
            driver,
            stat,
            cpus,
            cpu_policy,
            loads: vec![PlugLoad::default(); nr],
        }
    }

    /// Take a baseline sample on every possible CPU so the first real tick
    /// sees sane deltas instead of counters-since-boot.
    pub fn prime(&mut self) {
        let gpu_idle = self.ctx.gpu_idle.load(Ordering::Relaxed);
        for cpu in 0..self.loads.len() {
            if let Ok((idle, wall)) = self.stat.idle_time_us(cpu, gpu_idle) {
                self.loads[cpu].prev_idle_us = idle;
                self.loads[cpu].prev_wall_us = wall;
            }
        }
    }

    /// One decider pass.
    pub fn tick(&mut self) {
        let now = self.ctx.clock.now_ms();
        let online = self.cpus.online_cpus();
        if online.is_empty() {
            return;
        }
        let n = online.len();
        self.ctx.counters.plug_ticks.fetch_add(1, Ordering::Relaxed);

        let mut sum = 0u64;
        for &cpu in &online {
            sum += self.normalized_load(cpu) as u64;
        }
        let avg = (sum / n as u64) as u32;
        self.ctx
            .counters
            .last_avg_load
            .store(avg as u64, Ordering::Relaxed);

        let gpu_idle = self.ctx.gpu_idle.load(Ordering::Relaxed);
        let (up_val, down_val) = modes::plug_deltas(&self.ctx, n, now);
        let first = self.ctx.first_counter.load(Ordering::Relaxed);
        let third = self.ctx.third_counter.load(Ordering::Relaxed);

        if avg >= up_threshold(gpu_idle, n) {
            self.ctx
                .coreboost_endtime_ms
                .store(now + BOOST_TIME_MS, Ordering::Relaxed);
            let first = (first + up_val).min(DEFAULT_COUNTER);
            self.ctx.first_counter.store(first, Ordering::Relaxed);
            if third > 0 {
                self.ctx
                    .third_counter
                    .store((third - up_val).max(0), Ordering::Relaxed);
            }
            if first >= DEFAULT_COUNTER {
                self.online_core(n, now);
            }
        } else if avg <= down_threshold(gpu_idle, n) {
            let third = (third + down_val).min(DEFAULT_COUNTER);
            self.ctx.third_counter.store(third, Ordering::Relaxed);
            if first > 0 {
                self.ctx
                    .first_counter
                    .store((first - down_val).max(0), Ordering::Relaxed);
            }
            if third >= DEFAULT_COUNTER {
                self.offline_core(n, now);
            }
        } else {
            // Between the bands: keep a half boost window alive and decay
            // both counters toward zero.
            if now + BOOST_TIME_MS / 2 > self.ctx.coreboost_endtime_ms.load(Ordering::Relaxed) {
                self.ctx
                    .coreboost_endtime_ms
                    .store(now + BOOST_TIME_MS / 2, Ordering::Relaxed);
            }
            if first > 0 {
                self.ctx
                    .first_counter
                    .store((first - down_val).max(0), Ordering::Relaxed);
            }
            if third > 0 {
                self.ctx
                    .third_counter
                    .store((third - down_val).max(0), Ordering::Relaxed);
            }
        }
    }

    /// Utilization scaled by how close the core runs to its achievable
    /// maximum: `100 * active/wall * cur/max`. A thermal ceiling below the
    /// policy maximum substitutes for it, with the current frequency clamped
    /// accordingly.
    fn normalized_load(&mut self, cpu: usize) -> u32 {
        let gpu_idle = self.ctx.gpu_idle.load(Ordering::Relaxed);
        let (idle, wall) = match self.stat.idle_time_us(cpu, gpu_idle) {
            Ok(v) => v,
            Err(e) => {
                warn_once!("cpu{}: decider idle sample failed: {:#}", cpu, e);
                return 0;
            }
        };
        let pl = &mut self.loads[cpu];
        let delta_wall = wall.saturating_sub(pl.prev_wall_us);
        let delta_idle = idle.saturating_sub(pl.prev_idle_us);
        pl.prev_wall_us = wall;
        pl.prev_idle_us = idle;
        if delta_wall == 0 || delta_wall < delta_idle {
            return 0;
        }
        let util = (100 * (delta_wall - delta_idle) / delta_wall) as u32;

        let Some(policy) = self.cpu_policy.get(cpu).copied().flatten() else {
            return util;
        };
        let (Ok((_, policy_max)), Ok(cur)) =
            (self.driver.limits_khz(policy), self.driver.cur_khz(policy))
        else {
            return util;
        };
        let ceiling = self.driver.ceiling_khz(policy).unwrap_or(policy_max);
        let (max_khz, cur_khz) = if ceiling >= policy_max {
            (policy_max, cur)
        } else {
            (ceiling, cur.min(ceiling))
        };
        if max_khz == 0 {
            return util;
        }
        (util as u64 * cur_khz as u64 / max_khz as u64) as u32
    }

    /// Bring the lowest-numbered offline CPU up; tolerate failure. Counters
    /// are reset either way, and the core-boost window damps an immediate
    /// reversal.
    fn online_core(&self, online: usize, now: u64) {
        if online >= ACTIVE_CORES {
            return;
        }
        for cpu in 0..self.cpus.nr_possible() {
            if !self.cpus.is_online(cpu) {
                match self.cpus.cpu_up(cpu) {
                    Ok(()) => {
                        info!("onlined cpu{}", cpu);
                        self.ctx.counters.cores_onlined.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => warn!("cpu_up({}) failed: {:#}", cpu, e),
                }
                break;
            }
        }
        self.ctx
            .coreboost_endtime_ms
            .store(now + BOOST_TIME_MS, Ordering::Relaxed);
        self.ctx.first_counter.store(0, Ordering::Relaxed);
        self.ctx
            .third_counter
            .store(-DEFAULT_COUNTER, Ordering::Relaxed);
    }

    /// Take the highest-numbered online CPU down, never CPU 0, and never
    /// while a touch boost pins the population at cores_on_touch.
    fn offline_core(&self, online: usize, now: u64) {
        if online <= 1 {
            return;
        }
        if online == self.ctx.cores_on_touch.load(Ordering::Relaxed) as usize
            && self.ctx.coreboost_endtime_ms.load(Ordering::Relaxed) > now
        {
            self.ctx
                .counters
                .offline_deferred
                .fetch_add(1, Ordering::Relaxed);
            return;
        }
        for cpu in (1..self.cpus.nr_possible()).rev() {
            if self.cpus.is_online(cpu) {
                match self.cpus.cpu_down(cpu) {
                    Ok(()) => {
                        info!("offlined cpu{}", cpu);
                        self.ctx
                            .counters
                            .cores_offlined
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => warn!("cpu_down({}) failed: {:#}", cpu, e),
                }
                break;
            }
        }
        self.ctx
            .coreboost_endtime_ms
            .store(now + BOOST_TIME_MS, Ordering::Relaxed);
        self.ctx.first_counter.store(0, Ordering::Relaxed);
        self.ctx.third_counter.store(0, Ordering::Relaxed);
    }
}

enum PlugCmd {
    Schedule(Duration),
    CancelFlush(Sender<()>),
    Stop,
}

/// Cloneable control endpoint for the decider thread.
#[derive(Clone)]
pub struct DeciderHandle {
    tx: Sender<PlugCmd>,
}

impl DeciderHandle {
    pub fn schedule(&self, delay: Duration) {
        let _ = self.tx.send(PlugCmd::Schedule(delay));
    }

    /// Cancel any pending tick and wait until the decider has acknowledged:
    /// the single command loop guarantees no tick is in flight once the ack
    /// arrives.
    pub fn cancel_flush(&self) {
        let (ack_tx, ack_rx) = unbounded();
        if self.tx.send(PlugCmd::CancelFlush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }
}

/// The decider thread: exactly one tick in flight, re-queued 30 ms after
/// each pass.
pub struct Decider {
    handle: DeciderHandle,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Decider {
    pub fn spawn(mut core: DeciderCore, first_delay: Duration) -> Result<Self> {
        let (tx, rx) = unbounded();
        let handle = DeciderHandle { tx };
        let thread = std::thread::Builder::new()
            .name("cp-hotplug".to_string())
            .spawn(move || {
                core.prime();
                decider_loop(&mut core, rx, first_delay);
            })
            .context("failed to spawn hot-plug decider")?;
        Ok(Self {
            handle,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn handle(&self) -> DeciderHandle {
        self.handle.clone()
    }

    pub fn stop(&self) {
        let _ = self.handle.tx.send(PlugCmd::Stop);
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

fn decider_loop(core: &mut DeciderCore, rx: Receiver<PlugCmd>, first_delay: Duration) {
    let mut next: Option<Instant> = Some(Instant::now() + first_delay);
    loop {
        let cmd = match next {
            Some(deadline) => {
                match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                    Ok(cmd) => Some(cmd),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match rx.recv() {
                Ok(cmd) => Some(cmd),
                Err(_) => break,
            },
        };
        match cmd {
            Some(PlugCmd::Schedule(delay)) => next = Some(Instant::now() + delay),
            Some(PlugCmd::CancelFlush(ack)) => {
                next = None;
                let _ = ack.send(());
            }
            Some(PlugCmd::Stop) => break,
            None => {
                core.tick();
                next = Some(Instant::now() + PLUG_TICK);
            }
        }
    }
}

pub enum ScreenEvent {
    On,
    Off,
}

enum PmMsg {
    Screen(ScreenEvent),
    Stop,
}

/// Suspend/resume worker: screen events run here, ordered, off the caller's
/// thread.
pub struct PmWorker {
    tx: Sender<PmMsg>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PmWorker {
    pub fn spawn(
        ctx: Arc<Context>,
        cpus: Arc<dyn CpuOnline>,
        decider: DeciderHandle,
        on_resume: Box<dyn Fn() + Send>,
    ) -> Result<Self> {
        let (tx, rx) = unbounded::<PmMsg>();
        let thread = std::thread::Builder::new()
            .name("cp-pm".to_string())
            .spawn(move || {
                for msg in rx {
                    match msg {
                        PmMsg::Screen(ScreenEvent::Off) => suspend(&ctx, &*cpus, &decider),
                        PmMsg::Screen(ScreenEvent::On) => {
                            resume(&ctx, &*cpus, &decider);
                            on_resume();
                        }
                        PmMsg::Stop => break,
                    }
                }
            })
            .context("failed to spawn suspend/resume worker")?;
        Ok(Self {
            tx,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn screen(&self, ev: ScreenEvent) {
        let _ = self.tx.send(PmMsg::Screen(ev));
    }

    pub fn stop(&self) {
        let _ = self.tx.send(PmMsg::Stop);
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

/// Screen off: quiesce the decider, park every secondary core, forget the
/// accumulated hysteresis. Governor timers die down naturally as their CPUs
/// go away.
pub fn suspend(ctx: &Context, cpus: &dyn CpuOnline, decider: &DeciderHandle) {
    decider.cancel_flush();
    info!("screen off: parking secondary cores");
    for cpu in 1..cpus.nr_possible() {
        if let Err(e) = cpus.cpu_down(cpu) {
            warn!("cpu_down({}) on suspend failed: {:#}", cpu, e);
        }
    }
    ctx.reset_plug_counters();
}

/// Screen on: restore the busy profile bias, open both boost windows, bring
/// two cores up and let the decider take over after a settle.
pub fn resume(ctx: &Context, cpus: &dyn CpuOnline, decider: &DeciderHandle) {
    let now = ctx.clock.now_ms();
    ctx.gpu_idle.store(false, Ordering::Relaxed);
    ctx.coreboost_endtime_ms
        .store(now + BOOST_TIME_MS, Ordering::Relaxed);
    ctx.boostpulse_endtime_ms.store(
        now + ctx.boostpulse_duration_ms.load(Ordering::Relaxed),
        Ordering::Relaxed,
    );

    let mut onlined = 0;
    for cpu in 1..cpus.nr_possible() {
        if let Err(e) = cpus.cpu_up(cpu) {
            warn!("cpu_up({}) on resume failed: {:#}", cpu, e);
        }
        onlined += 1;
        if onlined == 2 {
            break;
        }
    }

    info!("screen on: resuming hot-plug work");
    decider.schedule(RESUME_DELAY);
}
