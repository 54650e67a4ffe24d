// SPDX-License-Identifier: GPL-2.0
//
// corepulse: dynamic CPU frequency and core-count controller.
//
// Couples a per-core interactive frequency governor with a cluster-wide
// hot-plug decider. Per-core timers estimate load from idle-time deltas and
// pick a target frequency; a real-time worker applies the cluster maximum to
// the hardware; a 30 ms decider walks hysteresis counters to grow or shrink
// the core population, biased by GPU activity and user input.

mod attrs;
mod context;
mod governor;
mod gpu;
mod hotplug;
mod input;
mod modes;
mod profiles;
mod sampler;
mod speedchange;
mod stats;
#[cfg(test)]
mod testutil;
mod timer;

use anyhow::{bail, Context as _, Result};
use clap::Parser;
use log::{info, warn};
use scx_stats::prelude::*;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use corepulse_utils::{CpuOnline, FreqDriver, Monotonic, ProcStat, SysfsCpufreq, SysfsCpus};

use crate::attrs::AttrGroup;
use crate::context::Context;
use crate::governor::Interactive;
use crate::hotplug::{Decider, DeciderCore, PmWorker, STARTUP_DELAY};

const DAEMON_NAME: &str = "corepulse";

#[derive(Debug, Clone, clap::Parser)]
#[command(
    name = "corepulse",
    version,
    disable_version_flag = true,
    about = "Dynamic CPU frequency and core-count controller."
)]
struct Opts {
    /// Root of the sysfs tree. Point at a fixture directory to dry-run the
    /// controller against a fake machine.
    #[clap(long, default_value = "/sys")]
    sysfs_root: PathBuf,

    /// Root of the procfs tree.
    #[clap(long, default_value = "/proc")]
    proc_root: PathBuf,

    /// Directory for the tunable attribute files.
    #[clap(long, default_value = "/run/corepulse")]
    attrs_dir: PathBuf,

    /// Number of cores kept online while a touch boost is active.
    #[clap(long, default_value = "2")]
    cores_on_touch: u32,

    /// Disable the evdev input monitor (touch boost).
    #[clap(long, action = clap::ArgAction::SetTrue)]
    no_input: bool,

    /// Disable the GPU activity monitor (gpu_idle stays false).
    #[clap(long, action = clap::ArgAction::SetTrue)]
    no_gpu: bool,

    /// GPU busy gauge poll interval in milliseconds.
    #[clap(long, default_value = "100")]
    gpu_poll_ms: u64,

    /// GPU busy percentage below which a sample counts as quiet.
    #[clap(long, default_value = "10")]
    gpu_busy_threshold: u64,

    /// Enable stats monitoring with the specified interval.
    #[clap(long)]
    stats: Option<f64>,

    /// Run in stats monitoring mode with the specified interval. The
    /// controller is not launched.
    #[clap(long)]
    monitor: Option<f64>,

    /// Show descriptions for statistics.
    #[clap(long)]
    help_stats: bool,

    /// Enable verbose output.
    #[clap(short = 'v', long, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    /// Print version and exit.
    #[clap(short = 'V', long, action = clap::ArgAction::SetTrue)]
    version: bool,
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if opts.version {
        println!("{} {}", DAEMON_NAME, env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    if opts.help_stats {
        stats::server_data().describe_meta(&mut std::io::stdout(), None)?;
        return Ok(());
    }

    let loglevel = if opts.verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_offset_to_local()
        .expect("Failed to set local time offset")
        .set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        loglevel,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    if let Some(intv) = opts.monitor {
        return stats::monitor(Duration::from_secs_f64(intv), shutdown);
    }

    run(&opts, shutdown)
}

fn run(opts: &Opts, shutdown: Arc<AtomicBool>) -> Result<()> {
    let ctx = Arc::new(Context::new(Arc::new(Monotonic)));
    ctx.cores_on_touch.store(opts.cores_on_touch, Ordering::Relaxed);

    let driver = Arc::new(SysfsCpufreq::new(&opts.sysfs_root));
    let stat = Arc::new(ProcStat::new(&opts.proc_root));
    let cpus = Arc::new(SysfsCpus::new(&opts.sysfs_root));
    let nr_cpus = cpus.nr_possible();

    let policy_ids = driver
        .policies()
        .with_context(|| format!("cannot enumerate cpufreq policies under {}", opts.sysfs_root.display()))?;
    if policy_ids.is_empty() {
        bail!("no cpufreq policies found; nothing to govern");
    }

    info!(
        "{} {}: {} possible cpus, policies {:?}",
        DAEMON_NAME,
        env!("CARGO_PKG_VERSION"),
        nr_cpus,
        policy_ids
    );
    info!("options: {}", std::env::args().collect::<Vec<_>>().join(" "));

    let gov = Interactive::new(Arc::clone(&ctx), driver.clone(), stat.clone(), nr_cpus);
    gov.spawn_workers()?;

    // Start the governor on every policy. The frequency table driver keeps
    // authority over the actual transitions; we only claim the set-speed
    // interface.
    let mut policies = Vec::new();
    let mut cpu_policy: Vec<Option<usize>> = vec![None; nr_cpus];
    for id in policy_ids {
        if let Err(e) = driver.claim_userspace(id) {
            warn!("{:#}; frequency writes may be refused", e);
        }
        let policy = gov
            .policy_from_driver(id)
            .with_context(|| format!("policy{} is unusable", id))?;
        for &cpu in &policy.cpus {
            if cpu < nr_cpus {
                cpu_policy[cpu] = Some(id);
            }
        }
        gov.start(&policy)?;
        policies.push(policy);
    }
    info!("{} policies under governor control", gov.active_policies());

    // The shared surfaces ride the 0→1 policy transition.
    let decider = Decider::spawn(
        DeciderCore::new(
            Arc::clone(&ctx),
            driver.clone(),
            stat.clone(),
            cpus.clone(),
            cpu_policy,
        ),
        STARTUP_DELAY,
    )?;

    let pm = {
        let gov = Arc::clone(&gov);
        let driver = Arc::clone(&driver);
        let policies = policies.clone();
        let on_resume = Box::new(move || {
            // Thermal limits may have moved while the screen was off.
            for policy in &policies {
                match driver.limits_khz(policy.id) {
                    Ok((min, max)) => gov.apply_limits(policy, min, max),
                    Err(e) => warn!("policy{}: cannot refresh limits: {:#}", policy.id, e),
                }
            }
        });
        Arc::new(PmWorker::spawn(
            Arc::clone(&ctx),
            cpus.clone(),
            decider.handle(),
            on_resume,
        )?)
    };

    let attr_watcher = {
        let pm = Arc::clone(&pm);
        let group = AttrGroup::create(
            &opts.attrs_dir,
            Arc::clone(&ctx),
            Box::new(move |ev| pm.screen(ev)),
        )?;
        group.spawn_watcher(shutdown.clone())?
    };

    let input_thread = if opts.no_input {
        None
    } else {
        Some(input::spawn(Arc::clone(&ctx), shutdown.clone())?)
    };

    let gpu_thread = if opts.no_gpu {
        None
    } else {
        gpu::spawn(
            Arc::clone(&ctx),
            &opts.sysfs_root,
            Duration::from_millis(opts.gpu_poll_ms.max(1)),
            opts.gpu_busy_threshold,
            shutdown.clone(),
        )
    };

    let stats_server = StatsServer::new(stats::server_data()).launch()?;
    let (stats_response_tx, stats_request_rx) = stats_server.channels();

    let stats_thread = opts.stats.map(|intv| {
        let shutdown_copy = shutdown.clone();
        std::thread::spawn(move || {
            let stats_interval = Duration::from_secs_f64(intv);
            if let Err(e) = stats::monitor(stats_interval, shutdown_copy) {
                log::warn!("stats monitor thread finished because of an error {}", e);
            }
        })
    });

    // Service stats requests until told to stop.
    while !shutdown.load(Ordering::Relaxed) {
        while stats_request_rx.try_recv().is_ok() {
            let metrics = stats::Metrics::read(&ctx, &gov, &*cpus);
            stats_response_tx.send(metrics)?;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    info!("shutting down");
    drop(stats_server);
    if let Some(handle) = stats_thread {
        let _ = handle.join();
    }
    if let Some(handle) = input_thread {
        let _ = handle.join();
    }
    if let Some(handle) = gpu_thread {
        let _ = handle.join();
    }
    let _ = attr_watcher.join();
    pm.stop();
    decider.stop();
    for policy in &policies {
        gov.stop(policy);
    }
    gov.shutdown();
    Ok(())
}
