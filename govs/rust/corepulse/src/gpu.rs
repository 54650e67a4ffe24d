// SPDX-License-Identifier: GPL-2.0
//
// GPU activity monitor. Polls the DRM busy gauge and publishes the gpu_idle
// coupling signal: a run of consecutive quiet samples flips it on, the first
// busy sample flips it off.

use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use corepulse_utils::read_u64;

use crate::context::Context;

/// Consecutive below-threshold samples before the GPU counts as idle.
const IDLE_SAMPLES: u32 = 10;

/// First card exposing a busy gauge, e.g. amdgpu's gpu_busy_percent.
fn find_busy_gauge(sysfs_root: &Path) -> Option<PathBuf> {
    let drm = sysfs_root.join("class/drm");
    let entries = std::fs::read_dir(&drm).ok()?;
    let mut cards: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("card") && !n.contains('-'))
        })
        .collect();
    cards.sort();
    cards
        .into_iter()
        .map(|card| card.join("device/gpu_busy_percent"))
        .find(|p| p.exists())
}

/// Spawn the poller, or return None when no gauge exists; gpu_idle then
/// stays false and the controller keeps its busy bias.
pub fn spawn(
    ctx: Arc<Context>,
    sysfs_root: &Path,
    poll: Duration,
    busy_threshold: u64,
    shutdown: Arc<AtomicBool>,
) -> Option<JoinHandle<()>> {
    let Some(gauge) = find_busy_gauge(sysfs_root) else {
        info!("no GPU busy gauge found; staying in busy profile");
        return None;
    };
    info!("GPU monitor reading {}", gauge.display());

    let handle = std::thread::Builder::new()
        .name("cp-gpu".to_string())
        .spawn(move || {
            let mut idle_counter = 0u32;
            while !shutdown.load(Ordering::Relaxed) {
                match read_u64(&gauge) {
                    Ok(busy) if busy < busy_threshold => {
                        idle_counter = idle_counter.saturating_add(1);
                        if idle_counter >= IDLE_SAMPLES {
                            ctx.gpu_idle.store(true, Ordering::Relaxed);
                        }
                    }
                    Ok(_) => {
                        idle_counter = 0;
                        ctx.gpu_idle.store(false, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!("GPU busy gauge unreadable, monitor exiting: {:#}", e);
                        ctx.gpu_idle.store(false, Ordering::Relaxed);
                        break;
                    }
                }
                std::thread::sleep(poll);
            }
        })
        .expect("failed to spawn GPU monitor thread");
    Some(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockClock;
    use std::fs;

    fn fake_card(root: &Path, busy: &str) -> PathBuf {
        let dev = root.join("class/drm/card0/device");
        fs::create_dir_all(&dev).unwrap();
        let gauge = dev.join("gpu_busy_percent");
        fs::write(&gauge, busy).unwrap();
        gauge
    }

    #[test]
    fn finds_the_gauge() {
        let root = tempfile::tempdir().unwrap();
        assert!(find_busy_gauge(root.path()).is_none());
        let gauge = fake_card(root.path(), "55\n");
        assert_eq!(find_busy_gauge(root.path()).unwrap(), gauge);
    }

    #[test]
    fn connector_dirs_are_not_cards() {
        let root = tempfile::tempdir().unwrap();
        let dev = root.path().join("class/drm/card0-HDMI-A-1/device");
        fs::create_dir_all(&dev).unwrap();
        fs::write(dev.join("gpu_busy_percent"), "0\n").unwrap();
        assert!(find_busy_gauge(root.path()).is_none());
    }

    #[test]
    fn quiet_run_flips_idle_and_busy_sample_clears_it() {
        let root = tempfile::tempdir().unwrap();
        let gauge = fake_card(root.path(), "2\n");
        let ctx = Arc::new(Context::new(Arc::new(MockClock::default())));
        let shutdown = Arc::new(AtomicBool::new(false));

        let handle = spawn(
            Arc::clone(&ctx),
            root.path(),
            Duration::from_millis(1),
            10,
            Arc::clone(&shutdown),
        )
        .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !ctx.gpu_idle.load(Ordering::Relaxed) {
            assert!(std::time::Instant::now() < deadline, "gpu never went idle");
            std::thread::sleep(Duration::from_millis(5));
        }

        fs::write(&gauge, "90\n").unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while ctx.gpu_idle.load(Ordering::Relaxed) {
            assert!(std::time::Instant::now() < deadline, "gpu never woke up");
            std::thread::sleep(Duration::from_millis(5));
        }

        shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }
}
