// SPDX-License-Identifier: GPL-2.0

pub mod clock;
pub mod cpu_list;
pub mod cpufreq;
pub mod cpus;
pub mod cpustat;
mod misc;

pub use clock::{Clock, Monotonic};
pub use cpu_list::parse_cpu_list;
pub use cpufreq::{FreqDriver, FreqTable, Relation, SysfsCpufreq};
pub use cpus::{CpuOnline, SysfsCpus};
pub use cpustat::{CpuStat, ProcStat};
pub use misc::{read_trimmed, read_u64, write_str};

use once_cell::sync::Lazy;
use std::path::Path;

/// Number of possible CPU ids on this host, as reported by
/// /sys/devices/system/cpu/possible (max id + 1). Falls back to the
/// configured processor count when the mask is unreadable.
pub static NR_CPU_IDS: Lazy<usize> = Lazy::new(|| {
    nr_cpu_ids_from(Path::new("/sys/devices/system/cpu"))
});

pub fn nr_cpu_ids_from(cpu_root: &Path) -> usize {
    if let Ok(mask) = misc::read_trimmed(&cpu_root.join("possible")) {
        if let Ok(cpus) = cpu_list::parse_cpu_list(&mask) {
            if let Some(max) = cpus.iter().max() {
                return max + 1;
            }
        }
    }
    // SAFETY: sysconf is async-signal-safe and has no memory preconditions.
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    if n > 0 {
        n as usize
    } else {
        1
    }
}

/// Log a warning the first time a call site is hit, then stay quiet.
#[macro_export]
macro_rules! warn_once {
    ($($arg:tt)*) => {{
        static ONCE: ::std::sync::Once = ::std::sync::Once::new();
        ONCE.call_once(|| log::warn!($($arg)*));
    }};
}
