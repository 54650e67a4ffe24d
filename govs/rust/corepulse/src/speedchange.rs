// SPDX-License-Identifier: GPL-2.0
//
// The speed-change worker: a single real-time thread that drains the set of
// CPUs with a pending target-frequency change and drives the hardware with
// the cluster maximum. Runs SCHED_FIFO at the highest priority so bursty
// drivers cannot starve frequency ramps; the set has its own lock, disjoint
// from every per-CPU lock, and the worker never holds it across a driver
// call.

use anyhow::{Context as _, Result};
use libc::{sched_get_priority_max, sched_param, sched_setscheduler, SCHED_FIFO};
use log::{info, warn};
use rustc_hash::FxHashSet;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;

use crate::governor::Interactive;

#[derive(Default)]
struct Inner {
    cpus: FxHashSet<usize>,
    stop: bool,
}

#[derive(Default)]
pub struct SpeedChange {
    inner: Mutex<Inner>,
    cond: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SpeedChange {
    /// Queue `cpu` for frequency application and wake the worker. The
    /// caller's target_freq store happens before the insert, so the worker
    /// always observes the matching target.
    pub fn request(&self, cpu: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.cpus.insert(cpu);
        self.cond.notify_one();
    }

    pub fn spawn(self: &Arc<Self>, gov: Weak<Interactive>) -> Result<()> {
        let sc = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("cp-speedchange".to_string())
            .spawn(move || sc.worker_loop(gov))
            .context("failed to spawn speed-change worker")?;
        *self.thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn worker_loop(&self, gov: Weak<Interactive>) {
        set_rt_fifo();
        loop {
            let batch: Vec<usize> = {
                let mut inner = self.inner.lock().unwrap();
                while inner.cpus.is_empty() && !inner.stop {
                    inner = self.cond.wait(inner).unwrap();
                }
                if inner.stop && inner.cpus.is_empty() {
                    break;
                }
                inner.cpus.drain().collect()
            };
            let Some(gov) = gov.upgrade() else {
                break;
            };
            for cpu in batch {
                gov.apply_speed(cpu);
            }
        }
    }

    /// Signal the worker to finish once the set is drained, then join it.
    pub fn stop(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.stop = true;
            self.cond.notify_all();
        }
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    #[cfg(test)]
    pub(crate) fn drain_for_test(&self) -> Vec<usize> {
        self.inner.lock().unwrap().cpus.drain().collect()
    }
}

fn set_rt_fifo() {
    // SAFETY: plain syscalls on the current thread with a stack parameter
    // block; no pointers outlive the calls.
    unsafe {
        let prio = sched_get_priority_max(SCHED_FIFO);
        let param = sched_param {
            sched_priority: if prio > 0 { prio } else { 1 },
        };
        if sched_setscheduler(0, SCHED_FIFO, &param) != 0 {
            warn!(
                "speed-change worker stays SCHED_OTHER: {}",
                std::io::Error::last_os_error()
            );
        } else {
            info!("speed-change worker running SCHED_FIFO/{}", param.sched_priority);
        }
    }
}
