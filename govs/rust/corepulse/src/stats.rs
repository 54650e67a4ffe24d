// SPDX-License-Identifier: GPL-2.0
//
// Stats reporting over the scx_stats Unix-socket protocol. The server hands
// interval deltas of the controller counters to any connected monitor.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use scx_stats::prelude::*;
use scx_stats::StatsClient;
use scx_stats_derive::Stats;
use serde::Deserialize;
use serde::Serialize;

use corepulse_utils::CpuOnline;

use crate::context::Context;
use crate::governor::Interactive;
use crate::modes;

#[derive(Clone, Debug, Default, Serialize, Deserialize, Stats)]
#[serde(default)]
#[stat(top)]
pub struct Metrics {
    #[stat(desc = "Per-core governor ticks in interval")]
    pub timer_ticks: u64,
    #[stat(desc = "Hardware frequency changes in interval")]
    pub freq_changes: u64,
    #[stat(desc = "Jumps to hispeed_freq in interval")]
    pub hispeed_jumps: u64,
    #[stat(desc = "Ramps rejected by above_hispeed_delay in interval")]
    pub above_hispeed_deferred: u64,
    #[stat(desc = "Drops rejected by the frequency floor in interval")]
    pub floor_deferred: u64,
    #[stat(desc = "Sampling glitches skipped in interval")]
    pub sample_glitches: u64,
    #[stat(desc = "Frequency table lookup failures in interval")]
    pub table_lookup_errors: u64,
    #[stat(desc = "Hot-plug decider passes in interval")]
    pub plug_ticks: u64,
    #[stat(desc = "Cores brought online in interval")]
    pub cores_onlined: u64,
    #[stat(desc = "Cores taken offline in interval")]
    pub cores_offlined: u64,
    #[stat(desc = "Tear-downs deferred by the touch window in interval")]
    pub offline_deferred: u64,
    #[stat(desc = "Average normalized load at the last decider pass")]
    pub avg_load: u64,
    #[stat(desc = "Online CPU count")]
    pub online_cpus: u64,
    #[stat(desc = "Up-hysteresis counter")]
    pub first_counter: i64,
    #[stat(desc = "Down-hysteresis counter")]
    pub third_counter: i64,
    #[stat(desc = "Active tuning profile")]
    pub mode: String,
    #[stat(desc = "Per-core target frequencies, kHz")]
    pub target_freqs: Vec<u32>,
}

impl Metrics {
    /// Snapshot the live controller state.
    pub fn read(ctx: &Context, gov: &Interactive, cpus: &dyn CpuOnline) -> Self {
        let c = &ctx.counters;
        let mut target_freqs = vec![0u32; gov.nr_cpus()];
        for (cpu, khz) in gov.target_snapshot() {
            target_freqs[cpu] = khz;
        }
        Self {
            timer_ticks: c.timer_ticks.load(Ordering::Relaxed),
            freq_changes: c.freq_changes.load(Ordering::Relaxed),
            hispeed_jumps: c.hispeed_jumps.load(Ordering::Relaxed),
            above_hispeed_deferred: c.above_hispeed_deferred.load(Ordering::Relaxed),
            floor_deferred: c.floor_deferred.load(Ordering::Relaxed),
            sample_glitches: c.sample_glitches.load(Ordering::Relaxed),
            table_lookup_errors: c.table_lookup_errors.load(Ordering::Relaxed),
            plug_ticks: c.plug_ticks.load(Ordering::Relaxed),
            cores_onlined: c.cores_onlined.load(Ordering::Relaxed),
            cores_offlined: c.cores_offlined.load(Ordering::Relaxed),
            offline_deferred: c.offline_deferred.load(Ordering::Relaxed),
            avg_load: c.last_avg_load.load(Ordering::Relaxed),
            online_cpus: cpus.online_cpus().len() as u64,
            first_counter: ctx.first_counter.load(Ordering::Relaxed) as i64,
            third_counter: ctx.third_counter.load(Ordering::Relaxed) as i64,
            mode: modes::freq_mode(ctx).as_str().to_string(),
            target_freqs,
        }
    }

    /// Interval delta: event counters subtract, gauges carry the new value.
    fn delta(&self, prev: &Self) -> Self {
        Self {
            timer_ticks: self.timer_ticks.saturating_sub(prev.timer_ticks),
            freq_changes: self.freq_changes.saturating_sub(prev.freq_changes),
            hispeed_jumps: self.hispeed_jumps.saturating_sub(prev.hispeed_jumps),
            above_hispeed_deferred: self
                .above_hispeed_deferred
                .saturating_sub(prev.above_hispeed_deferred),
            floor_deferred: self.floor_deferred.saturating_sub(prev.floor_deferred),
            sample_glitches: self.sample_glitches.saturating_sub(prev.sample_glitches),
            table_lookup_errors: self
                .table_lookup_errors
                .saturating_sub(prev.table_lookup_errors),
            plug_ticks: self.plug_ticks.saturating_sub(prev.plug_ticks),
            cores_onlined: self.cores_onlined.saturating_sub(prev.cores_onlined),
            cores_offlined: self.cores_offlined.saturating_sub(prev.cores_offlined),
            offline_deferred: self.offline_deferred.saturating_sub(prev.offline_deferred),
            ..self.clone()
        }
    }

    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(
            w,
            "[{}] cpus {} avg {:>3}% | ticks {} set {} hi {} defer {}/{} | plug {} +{} -{} hold {} | ctr {}/{} | {}",
            self.mode,
            self.online_cpus,
            self.avg_load,
            self.timer_ticks,
            self.freq_changes,
            self.hispeed_jumps,
            self.above_hispeed_deferred,
            self.floor_deferred,
            self.plug_ticks,
            self.cores_onlined,
            self.cores_offlined,
            self.offline_deferred,
            self.first_counter,
            self.third_counter,
            self.target_freqs
                .iter()
                .map(|khz| format!("{}", khz / 1000))
                .collect::<Vec<_>>()
                .join("/"),
        )?;
        Ok(())
    }
}

pub fn server_data() -> StatsServerData<(), Metrics> {
    let open: Box<dyn StatsOpener<(), Metrics>> = Box::new(move |(req_ch, res_ch)| {
        req_ch.send(())?;
        let mut prev = res_ch.recv()?;

        let read: Box<dyn StatsReader<(), Metrics>> = Box::new(move |_args, (req_ch, res_ch)| {
            req_ch.send(())?;
            let cur = res_ch.recv()?;
            let delta = cur.delta(&prev);
            prev = cur;
            delta.to_json()
        });

        Ok(read)
    });

    StatsServerData::new()
        .add_meta(Metrics::meta())
        .add_ops("top", StatsOps { open, close: None })
}

/// Standalone monitor: poll the daemon's stats socket and print interval
/// deltas until shut down.
pub fn monitor(intv: Duration, shutdown: Arc<AtomicBool>) -> Result<()> {
    let mut client = StatsClient::new().connect(None)?;
    while !shutdown.load(Ordering::Relaxed) {
        match client.request::<Metrics>("stat", vec![("target".into(), "top".into())]) {
            Ok(metrics) => {
                let mut stdout = std::io::stdout();
                metrics.format(&mut stdout)?;
            }
            Err(e) => {
                log::warn!("stats request failed: {:#}", e);
                // The daemon may be restarting; reconnect on the next lap.
                client = StatsClient::new().connect(None)?;
            }
        }
        std::thread::sleep(intv);
    }
    Ok(())
}
