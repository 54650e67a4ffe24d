// SPDX-License-Identifier: GPL-2.0
//
// Mock platform backends for driving the control loops in tests.

use anyhow::{bail, Result};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use corepulse_utils::{Clock, CpuOnline, CpuStat, FreqDriver, FreqTable, Relation};

pub const TEST_TABLE: &[u32] = &[384_000, 702_000, 1_026_000, 1_350_000, 1_512_000];

/// Hand-cranked monotonic clock.
#[derive(Default)]
pub struct MockClock {
    us: AtomicU64,
}

impl MockClock {
    pub fn set_ms(&self, ms: u64) {
        self.us.store(ms * 1000, Ordering::SeqCst);
    }

    pub fn advance_us(&self, us: u64) {
        self.us.fetch_add(us, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance_us(ms * 1000);
    }
}

impl Clock for MockClock {
    fn now_us(&self) -> u64 {
        self.us.load(Ordering::SeqCst)
    }
}

/// Idle counters that only move when a test says so; wall time comes from the
/// shared mock clock.
pub struct MockStat {
    idle_us: Vec<AtomicU64>,
    iowait_us: Vec<AtomicU64>,
    clock: Arc<MockClock>,
}

impl MockStat {
    pub fn new(nr_cpus: usize, clock: Arc<MockClock>) -> Self {
        Self {
            idle_us: (0..nr_cpus).map(|_| AtomicU64::new(0)).collect(),
            iowait_us: (0..nr_cpus).map(|_| AtomicU64::new(0)).collect(),
            clock,
        }
    }

    pub fn add_idle_us(&self, cpu: usize, us: u64) {
        self.idle_us[cpu].fetch_add(us, Ordering::SeqCst);
    }

    pub fn add_iowait_us(&self, cpu: usize, us: u64) {
        self.iowait_us[cpu].fetch_add(us, Ordering::SeqCst);
    }
}

impl CpuStat for MockStat {
    fn idle_time_us(&self, cpu: usize, iowait_is_idle: bool) -> Result<(u64, u64)> {
        if cpu >= self.idle_us.len() {
            bail!("cpu{} out of range", cpu);
        }
        let mut idle = self.idle_us[cpu].load(Ordering::SeqCst);
        if iowait_is_idle {
            idle += self.iowait_us[cpu].load(Ordering::SeqCst);
        }
        Ok((idle, self.clock.now_us()))
    }
}

/// Single-policy frequency driver with a scripted failure switch and a call
/// log.
pub struct MockFreqDriver {
    pub cpus: Vec<usize>,
    table: FreqTable,
    pub min_khz: AtomicU32,
    pub max_khz: AtomicU32,
    pub cur_khz: AtomicU32,
    pub ceiling_khz: AtomicU32,
    pub fail_set: AtomicBool,
    pub set_calls: Mutex<Vec<(u32, Relation)>>,
}

impl MockFreqDriver {
    pub fn new(cpus: Vec<usize>) -> Self {
        let table = FreqTable::new(TEST_TABLE.to_vec()).unwrap();
        Self {
            cpus,
            table,
            min_khz: AtomicU32::new(384_000),
            max_khz: AtomicU32::new(1_512_000),
            cur_khz: AtomicU32::new(384_000),
            ceiling_khz: AtomicU32::new(1_512_000),
            fail_set: AtomicBool::new(false),
            set_calls: Mutex::new(Vec::new()),
        }
    }
}

impl FreqDriver for MockFreqDriver {
    fn policies(&self) -> Result<Vec<usize>> {
        Ok(vec![0])
    }

    fn related_cpus(&self, _policy: usize) -> Result<Vec<usize>> {
        Ok(self.cpus.clone())
    }

    fn freq_table(&self, _policy: usize) -> Result<FreqTable> {
        Ok(self.table.clone())
    }

    fn limits_khz(&self, _policy: usize) -> Result<(u32, u32)> {
        Ok((
            self.min_khz.load(Ordering::SeqCst),
            self.max_khz.load(Ordering::SeqCst),
        ))
    }

    fn cur_khz(&self, _policy: usize) -> Result<u32> {
        Ok(self.cur_khz.load(Ordering::SeqCst))
    }

    fn ceiling_khz(&self, _policy: usize) -> Result<u32> {
        Ok(self.ceiling_khz.load(Ordering::SeqCst))
    }

    fn set_khz(&self, _policy: usize, target_khz: u32, relation: Relation) -> Result<u32> {
        if self.fail_set.load(Ordering::SeqCst) {
            bail!("injected set_khz failure");
        }
        let (min, max) = self.limits_khz(0)?;
        let khz = self.table.target(target_khz, relation, min, max)?;
        self.set_calls.lock().unwrap().push((target_khz, relation));
        self.cur_khz.store(khz, Ordering::SeqCst);
        Ok(khz)
    }
}

/// Hot-pluggable CPU population with scripted failures.
pub struct MockCpus {
    online: Vec<AtomicBool>,
    pub fail_up: AtomicBool,
    pub fail_down: AtomicBool,
}

impl MockCpus {
    pub fn new(nr: usize, online: &[usize]) -> Self {
        let cpus = Self {
            online: (0..nr).map(|_| AtomicBool::new(false)).collect(),
            fail_up: AtomicBool::new(false),
            fail_down: AtomicBool::new(false),
        };
        for &cpu in online {
            cpus.online[cpu].store(true, Ordering::SeqCst);
        }
        cpus
    }
}

impl CpuOnline for MockCpus {
    fn nr_possible(&self) -> usize {
        self.online.len()
    }

    fn is_online(&self, cpu: usize) -> bool {
        self.online.get(cpu).is_some_and(|o| o.load(Ordering::SeqCst))
    }

    fn online_cpus(&self) -> Vec<usize> {
        (0..self.online.len()).filter(|&c| self.is_online(c)).collect()
    }

    fn cpu_up(&self, cpu: usize) -> Result<()> {
        if self.fail_up.load(Ordering::SeqCst) {
            bail!("injected cpu_up failure");
        }
        self.online[cpu].store(true, Ordering::SeqCst);
        Ok(())
    }

    fn cpu_down(&self, cpu: usize) -> Result<()> {
        if self.fail_down.load(Ordering::SeqCst) {
            bail!("injected cpu_down failure");
        }
        self.online[cpu].store(false, Ordering::SeqCst);
        Ok(())
    }
}
