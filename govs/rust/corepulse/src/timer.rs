// SPDX-License-Identifier: GPL-2.0
//
// Per-core timers, rendered as one pinned thread per possible CPU that
// sleeps until the next deadline. Two deadlines are tracked: the main one
// fires the governor tick; the slack one is a bare wakeup (its kernel
// counterpart is a nop timer whose only job is to pull the CPU out of a long
// idle so the deferrable main timer gets to run).

use log::debug;
use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

#[derive(Default)]
struct TimerInner {
    deadline: Option<Instant>,
    slack_deadline: Option<Instant>,
    running: bool,
    stop: bool,
}

struct TimerShared {
    inner: Mutex<TimerInner>,
    cond: Condvar,
}

pub struct CpuTimer {
    sh: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Default for CpuTimer {
    fn default() -> Self {
        Self {
            sh: Arc::new(TimerShared {
                inner: Mutex::new(TimerInner::default()),
                cond: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }
}

impl CpuTimer {
    /// Spawn the backing thread. Until this is called, arm/cancel only do
    /// deadline bookkeeping, which is what the unit tests drive.
    pub fn spawn<F>(&self, cpu: usize, mut body: F)
    where
        F: FnMut() + Send + 'static,
    {
        let sh = Arc::clone(&self.sh);
        let handle = std::thread::Builder::new()
            .name(format!("cp-timer/{}", cpu))
            .spawn(move || {
                pin_to_cpu(cpu);
                let mut inner = sh.inner.lock().unwrap();
                loop {
                    if inner.stop {
                        break;
                    }
                    let now = Instant::now();
                    if inner.deadline.is_some_and(|d| d <= now) {
                        inner.deadline = None;
                        inner.running = true;
                        drop(inner);
                        body();
                        inner = sh.inner.lock().unwrap();
                        inner.running = false;
                        sh.cond.notify_all();
                        continue;
                    }
                    if inner.slack_deadline.is_some_and(|d| d <= now) {
                        // Wakeup only; the main timer does the work.
                        inner.slack_deadline = None;
                        continue;
                    }
                    let next = match (inner.deadline, inner.slack_deadline) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (Some(a), None) => Some(a),
                        (None, Some(b)) => Some(b),
                        (None, None) => None,
                    };
                    inner = match next {
                        None => sh.cond.wait(inner).unwrap(),
                        Some(t) => {
                            sh.cond
                                .wait_timeout(inner, t.saturating_duration_since(now))
                                .unwrap()
                                .0
                        }
                    };
                }
            })
            .expect("failed to spawn per-cpu timer thread");
        *self.thread.lock().unwrap() = Some(handle);
    }

    /// Arm (or re-arm) the deadlines; replaces whatever was pending.
    pub fn arm(&self, deadline: Instant, slack_deadline: Option<Instant>) {
        let mut inner = self.sh.inner.lock().unwrap();
        inner.deadline = Some(deadline);
        inner.slack_deadline = slack_deadline;
        self.sh.cond.notify_all();
    }

    pub fn pending(&self) -> bool {
        self.sh.inner.lock().unwrap().deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.sh.inner.lock().unwrap().deadline
    }

    /// Drop both deadlines without waiting for an in-flight callback.
    pub fn cancel(&self) {
        let mut inner = self.sh.inner.lock().unwrap();
        inner.deadline = None;
        inner.slack_deadline = None;
    }

    /// Drop both deadlines and wait out any callback currently executing.
    /// Must not be called from the timer's own thread.
    pub fn cancel_sync(&self) {
        let mut inner = self.sh.inner.lock().unwrap();
        inner.deadline = None;
        inner.slack_deadline = None;
        while inner.running {
            inner = self.sh.cond.wait(inner).unwrap();
        }
    }

    /// Stop and join the backing thread.
    pub fn stop(&self) {
        {
            let mut inner = self.sh.inner.lock().unwrap();
            inner.stop = true;
            inner.deadline = None;
            inner.slack_deadline = None;
            self.sh.cond.notify_all();
        }
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// Best effort: an offline CPU rejects the affinity call, and the timer keeps
/// working unpinned until the next spawn.
fn pin_to_cpu(cpu: usize) {
    let mut set = CpuSet::new();
    if set.set(cpu).is_ok() {
        if let Err(e) = sched_setaffinity(Pid::from_raw(0), &set) {
            debug!("cpu{}: timer thread not pinned: {}", cpu, e);
        }
    }
}
