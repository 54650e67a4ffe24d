// SPDX-License-Identifier: GPL-2.0
//
// The tunable attribute surface: a directory of plain files, one per
// attribute, kept in sync both ways. The daemon writes canonical values at
// startup; an inotify watcher parses user writes back through per-attribute
// store functions. A rejected write leaves the previous value and the file
// is restored to it, so readers always see the live setting.

use anyhow::{anyhow, bail, Context as _, Result};
use inotify::{Inotify, WatchMask};
use log::{debug, info, warn};
use std::fs;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::context::Context;
use crate::hotplug::ScreenEvent;
use crate::profiles::TargetLoads;

type ScreenFn = Box<dyn Fn(ScreenEvent) + Send + Sync>;

pub struct Attr {
    pub name: &'static str,
    show: Box<dyn Fn(&Context) -> String + Send + Sync>,
    store: Box<dyn Fn(&Context, &str) -> Result<()> + Send + Sync>,
}

fn parse_u64(name: &str, input: &str) -> Result<u64> {
    input
        .trim()
        .parse::<u64>()
        .map_err(|_| anyhow!("{}: expected an unsigned integer, got {:?}", name, input.trim()))
}

fn u64_attr(name: &'static str, field: for<'a> fn(&'a Context) -> &'a AtomicU64) -> Attr {
    Attr {
        name,
        show: Box::new(move |ctx| field(ctx).load(Ordering::Relaxed).to_string()),
        store: Box::new(move |ctx, input| {
            field(ctx).store(parse_u64(name, input)?, Ordering::Relaxed);
            Ok(())
        }),
    }
}

/// Like u64_attr but refuses zero: a zero timer rate would spin the
/// sampling threads.
fn rate_attr(name: &'static str, field: for<'a> fn(&'a Context) -> &'a AtomicU64) -> Attr {
    Attr {
        name,
        show: Box::new(move |ctx| field(ctx).load(Ordering::Relaxed).to_string()),
        store: Box::new(move |ctx, input| {
            let v = parse_u64(name, input)?;
            if v == 0 {
                bail!("{}: zero rate rejected", name);
            }
            field(ctx).store(v, Ordering::Relaxed);
            Ok(())
        }),
    }
}

fn load_pct_attr(name: &'static str, field: for<'a> fn(&'a Context) -> &'a AtomicU64) -> Attr {
    Attr {
        name,
        show: Box::new(move |ctx| field(ctx).load(Ordering::Relaxed).to_string()),
        store: Box::new(move |ctx, input| {
            let v = parse_u64(name, input)?;
            if v > 100 {
                bail!("{}: load percentage above 100", name);
            }
            field(ctx).store(v, Ordering::Relaxed);
            Ok(())
        }),
    }
}

fn khz_attr(
    name: &'static str,
    field: for<'a> fn(&'a Context) -> &'a std::sync::atomic::AtomicU32,
) -> Attr {
    Attr {
        name,
        show: Box::new(move |ctx| field(ctx).load(Ordering::Relaxed).to_string()),
        store: Box::new(move |ctx, input| {
            let v = parse_u64(name, input)?;
            if v == 0 || v > u32::MAX as u64 {
                bail!("{}: frequency out of range", name);
            }
            field(ctx).store(v as u32, Ordering::Relaxed);
            Ok(())
        }),
    }
}

fn slack_attr(name: &'static str, field: for<'a> fn(&'a Context) -> &'a AtomicI64) -> Attr {
    Attr {
        name,
        show: Box::new(move |ctx| field(ctx).load(Ordering::Relaxed).to_string()),
        store: Box::new(move |ctx, input| {
            let v = input
                .trim()
                .parse::<i64>()
                .map_err(|_| anyhow!("{}: expected an integer, got {:?}", name, input.trim()))?;
            field(ctx).store(v, Ordering::Relaxed);
            Ok(())
        }),
    }
}

fn target_loads_attr(
    name: &'static str,
    field: for<'a> fn(&'a Context) -> &'a TargetLoads,
) -> Attr {
    Attr {
        name,
        show: Box::new(move |ctx| field(ctx).format()),
        store: Box::new(move |ctx, input| field(ctx).store(input)),
    }
}

/// The attribute group of the controller. Each store goes to its own
/// profile; the original implementation cross-wired the two min_sample_time
/// stores and that is deliberately not reproduced here.
pub fn attributes() -> Vec<Attr> {
    vec![
        khz_attr("busy_hispeed_freq", |ctx| &ctx.profiles.busy.hispeed_freq),
        khz_attr("idle_hispeed_freq", |ctx| &ctx.profiles.idle.hispeed_freq),
        load_pct_attr("busy_go_hispeed_load", |ctx| &ctx.profiles.busy.go_hispeed_load),
        load_pct_attr("idle_go_hispeed_load", |ctx| &ctx.profiles.idle.go_hispeed_load),
        u64_attr("busy_min_sample_time", |ctx| &ctx.profiles.busy.min_sample_time_us),
        u64_attr("idle_min_sample_time", |ctx| &ctx.profiles.idle.min_sample_time_us),
        rate_attr("busy_timer_rate", |ctx| &ctx.profiles.busy.timer_rate_us),
        rate_attr("idle_timer_rate", |ctx| &ctx.profiles.idle.timer_rate_us),
        u64_attr("busy_above_hispeed_delay", |ctx| {
            &ctx.profiles.busy.above_hispeed_delay_us
        }),
        u64_attr("idle_above_hispeed_delay", |ctx| {
            &ctx.profiles.idle.above_hispeed_delay_us
        }),
        slack_attr("busy_timer_slack", |ctx| &ctx.profiles.busy.timer_slack_us),
        slack_attr("idle_timer_slack", |ctx| &ctx.profiles.idle.timer_slack_us),
        target_loads_attr("boost_target_loads", |ctx| &ctx.profiles.boost),
        target_loads_attr("busy_target_loads", |ctx| &ctx.profiles.busy.target_loads),
        target_loads_attr("idle_target_loads", |ctx| &ctx.profiles.idle.target_loads),
        u64_attr("boostpulse_duration", |ctx| &ctx.boostpulse_duration_ms),
        // Manual stand-in for the touch driver: any write opens the boost
        // window. No frequency is injected synchronously.
        Attr {
            name: "boostpulse",
            show: Box::new(|_| String::new()),
            store: Box::new(|ctx, input| {
                if !input.trim().is_empty() {
                    ctx.boostpulse();
                }
                Ok(())
            }),
        },
    ]
}

pub struct AttrGroup {
    dir: PathBuf,
    ctx: Arc<Context>,
    attrs: Vec<Attr>,
    screen: ScreenFn,
}

impl AttrGroup {
    /// Create the directory and publish every attribute's current value.
    pub fn create(dir: &Path, ctx: Arc<Context>, screen: ScreenFn) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("cannot create attribute dir {}", dir.display()))?;
        let group = Self {
            dir: dir.to_path_buf(),
            ctx,
            attrs: attributes(),
            screen,
        };
        for attr in &group.attrs {
            group.publish(attr.name, &(attr.show)(&group.ctx))?;
        }
        let screen_now = if group.ctx.screen_on.load(Ordering::Relaxed) {
            "1"
        } else {
            "0"
        };
        group.publish("screen_state", screen_now)?;
        info!("attribute group at {}", group.dir.display());
        Ok(group)
    }

    fn publish(&self, name: &str, value: &str) -> Result<()> {
        let mut out = value.to_string();
        out.push('\n');
        fs::write(self.dir.join(name), out)
            .with_context(|| format!("cannot publish attribute {}", name))
    }

    /// Apply one (possibly user-modified) attribute file. Returns false for
    /// files that are not attributes.
    pub fn apply(&self, name: &str) -> bool {
        if name == "screen_state" {
            self.apply_screen_state();
            return true;
        }
        let Some(attr) = self.attrs.iter().find(|a| a.name == name) else {
            return false;
        };
        let content = fs::read_to_string(self.dir.join(name)).unwrap_or_default();
        if let Err(e) = (attr.store)(&self.ctx, &content) {
            warn!("attribute {} rejected: {:#}", name, e);
        }
        // Restore the canonical rendering unless the file already matches;
        // this both undoes rejected writes and normalizes accepted ones
        // without re-triggering forever.
        let canonical = (attr.show)(&self.ctx);
        if content.trim_end() != canonical {
            if let Err(e) = self.publish(name, &canonical) {
                warn!("attribute {}: {:#}", name, e);
            }
        }
        true
    }

    fn apply_screen_state(&self) {
        let content = fs::read_to_string(self.dir.join("screen_state")).unwrap_or_default();
        let parsed = match content.trim() {
            "1" => Some(true),
            "0" => Some(false),
            _ => None,
        };
        match parsed {
            Some(on) => {
                if self.ctx.screen_on.swap(on, Ordering::Relaxed) != on {
                    (self.screen)(if on { ScreenEvent::On } else { ScreenEvent::Off });
                }
            }
            None => {
                warn!("screen_state rejected: {:?}", content.trim());
                let cur = if self.ctx.screen_on.load(Ordering::Relaxed) {
                    "1"
                } else {
                    "0"
                };
                let _ = self.publish("screen_state", cur);
            }
        }
    }

    /// Watch the directory and apply attribute writes as they land.
    pub fn spawn_watcher(self, shutdown: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
        let mut inotify = Inotify::init().context("inotify init failed")?;
        // Non-blocking reads so shutdown cannot hang the watcher.
        // SAFETY: plain fcntl flag manipulation on an fd we own.
        unsafe {
            let fd = inotify.as_raw_fd();
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags >= 0 {
                let _ = libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
        inotify
            .watches()
            .add(&self.dir, WatchMask::CLOSE_WRITE | WatchMask::MOVED_TO)
            .with_context(|| format!("cannot watch {}", self.dir.display()))?;

        let handle = std::thread::Builder::new()
            .name("cp-attrs".to_string())
            .spawn(move || {
                let mut inotify = inotify;
                let mut buffer = [0u8; 4096];
                while !shutdown.load(Ordering::Relaxed) {
                    match inotify.read_events(&mut buffer) {
                        Ok(events) => {
                            for event in events {
                                if let Some(name) = event.name.and_then(|n| n.to_str()) {
                                    if !self.apply(name) {
                                        debug!("ignoring stray file {:?}", name);
                                    }
                                }
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                        Err(e) => {
                            warn!("attribute watcher read failed: {}", e);
                            break;
                        }
                    }
                    std::thread::sleep(Duration::from_millis(200));
                }
            })
            .context("failed to spawn attribute watcher")?;
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockClock;
    use corepulse_utils::Clock;
    use std::sync::Mutex;

    fn group_with_events() -> (tempfile::TempDir, AttrGroup, Arc<Mutex<Vec<bool>>>, Arc<MockClock>) {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(MockClock::default());
        clock.set_ms(5_000);
        let ctx = Arc::new(Context::new(clock.clone()));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let group = AttrGroup::create(
            dir.path(),
            ctx,
            Box::new(move |ev| sink.lock().unwrap().push(matches!(ev, ScreenEvent::On))),
        )
        .unwrap();
        (dir, group, events, clock)
    }

    fn write_attr(dir: &Path, name: &str, value: &str) {
        fs::write(dir.join(name), value).unwrap();
    }

    #[test]
    fn create_publishes_defaults() {
        let (dir, _group, _ev, _clock) = group_with_events();
        let read = |n: &str| fs::read_to_string(dir.path().join(n)).unwrap();
        assert_eq!(read("busy_hispeed_freq"), "1350000\n");
        assert_eq!(read("idle_timer_slack"), "-1\n");
        assert_eq!(read("busy_target_loads"), "40 702000 50 1026000 60 1350000 70\n");
        assert_eq!(read("boostpulse_duration"), "1500\n");
        assert_eq!(read("screen_state"), "1\n");
    }

    #[test]
    fn store_updates_its_own_profile() {
        let (dir, group, _ev, _clock) = group_with_events();
        write_attr(dir.path(), "idle_min_sample_time", "12345\n");
        assert!(group.apply("idle_min_sample_time"));
        // The idle store must hit the idle profile, not busy.
        assert_eq!(
            group.ctx.profiles.idle.min_sample_time_us.load(Ordering::Relaxed),
            12345
        );
        assert_eq!(
            group.ctx.profiles.busy.min_sample_time_us.load(Ordering::Relaxed),
            60_000
        );
    }

    #[test]
    fn rejected_write_restores_previous_value() {
        let (dir, group, _ev, _clock) = group_with_events();
        write_attr(dir.path(), "busy_go_hispeed_load", "banana\n");
        group.apply("busy_go_hispeed_load");
        assert_eq!(
            group.ctx.profiles.busy.go_hispeed_load.load(Ordering::Relaxed),
            93
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("busy_go_hispeed_load")).unwrap(),
            "93\n"
        );

        write_attr(dir.path(), "busy_go_hispeed_load", "120\n");
        group.apply("busy_go_hispeed_load");
        assert_eq!(
            group.ctx.profiles.busy.go_hispeed_load.load(Ordering::Relaxed),
            93
        );
    }

    #[test]
    fn zero_timer_rate_is_rejected() {
        let (dir, group, _ev, _clock) = group_with_events();
        write_attr(dir.path(), "busy_timer_rate", "0\n");
        group.apply("busy_timer_rate");
        assert_eq!(
            group.ctx.profiles.busy.timer_rate_us.load(Ordering::Relaxed),
            20_000
        );
    }

    #[test]
    fn target_loads_round_trip_and_rejection() {
        let (dir, group, _ev, _clock) = group_with_events();
        write_attr(dir.path(), "boost_target_loads", "20 702000:35 1026000 45\n");
        group.apply("boost_target_loads");
        assert_eq!(
            group.ctx.profiles.boost.format(),
            "20 702000 35 1026000 45"
        );
        // Canonical form replaces the colon-separated input.
        assert_eq!(
            fs::read_to_string(dir.path().join("boost_target_loads")).unwrap(),
            "20 702000 35 1026000 45\n"
        );

        write_attr(dir.path(), "boost_target_loads", "20 702000\n");
        group.apply("boost_target_loads");
        assert_eq!(
            group.ctx.profiles.boost.format(),
            "20 702000 35 1026000 45"
        );
    }

    #[test]
    fn boostpulse_pokes_the_deadline() {
        let (dir, group, _ev, clock) = group_with_events();
        assert!(!group.ctx.boost_active(clock.now_ms()));
        write_attr(dir.path(), "boostpulse", "1\n");
        group.apply("boostpulse");
        assert!(group.ctx.boost_active(clock.now_ms()));
    }

    #[test]
    fn screen_state_fires_transitions_once() {
        let (dir, group, events, _clock) = group_with_events();
        write_attr(dir.path(), "screen_state", "0\n");
        group.apply("screen_state");
        write_attr(dir.path(), "screen_state", "0\n");
        group.apply("screen_state");
        write_attr(dir.path(), "screen_state", "1\n");
        group.apply("screen_state");
        assert_eq!(*events.lock().unwrap(), vec![false, true]);

        // Garbage restores the current state.
        write_attr(dir.path(), "screen_state", "maybe\n");
        group.apply("screen_state");
        assert_eq!(
            fs::read_to_string(dir.path().join("screen_state")).unwrap(),
            "1\n"
        );
    }

    #[test]
    fn unknown_files_are_ignored() {
        let (_dir, group, _ev, _clock) = group_with_events();
        assert!(!group.apply("README"));
    }

    #[test]
    fn watcher_applies_external_writes() {
        let (dir, group, _ev, _clock) = group_with_events();
        let ctx = Arc::clone(&group.ctx);
        let shutdown = Arc::new(AtomicBool::new(false));
        let watcher = group.spawn_watcher(Arc::clone(&shutdown)).unwrap();

        write_attr(dir.path(), "busy_hispeed_freq", "1026000\n");
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while ctx.profiles.busy.hispeed_freq.load(Ordering::Relaxed) != 1_026_000 {
            assert!(std::time::Instant::now() < deadline, "watcher never applied the write");
            std::thread::sleep(Duration::from_millis(50));
        }

        shutdown.store(true, Ordering::Relaxed);
        watcher.join().unwrap();
    }
}
