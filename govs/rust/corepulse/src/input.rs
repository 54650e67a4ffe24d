// SPDX-License-Identifier: GPL-2.0
//
// Touch/input monitor: the userspace stand-in for the touch driver poking
// the boost deadline. Watches every usable evdev node through epoll and
// extends boostpulse_endtime on real user activity.

use anyhow::{Context as _, Result};
use evdev::EventType;
use log::{info, warn};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::context::Context;

/// Keys, touch positions, and non-zero relative motion count as activity;
/// SYN markers and zero-delta noise do not.
fn is_activity(event_type: EventType, value: i32) -> bool {
    match event_type {
        EventType::KEY => true,
        EventType::RELATIVE => value != 0,
        EventType::ABSOLUTE => true,
        _ => false,
    }
}

fn wants_device(dev: &evdev::Device) -> bool {
    let supported = dev.supported_events();
    supported.contains(EventType::KEY)
        || supported.contains(EventType::RELATIVE)
        || supported.contains(EventType::ABSOLUTE)
}

fn scan_devices(input_dir: &Path) -> Vec<evdev::Device> {
    let mut devs = Vec::new();
    let Ok(entries) = std::fs::read_dir(input_dir) else {
        return devs;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with("event") {
            continue;
        }
        match evdev::Device::open(&path) {
            Ok(dev) if wants_device(&dev) => {
                info!(
                    "boost input source: {} ({})",
                    dev.name().unwrap_or("unknown"),
                    path.display()
                );
                devs.push(dev);
            }
            Ok(_) => {}
            Err(e) => {
                // Usually a permissions problem; the daemon still works,
                // just without that source.
                warn!("cannot open {}: {}", path.display(), e);
            }
        }
    }
    devs
}

pub fn spawn(ctx: Arc<Context>, shutdown: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("cp-input".to_string())
        .spawn(move || monitor_loop(ctx, shutdown))
        .context("failed to spawn input monitor")
}

fn monitor_loop(ctx: Arc<Context>, shutdown: Arc<AtomicBool>) {
    let mut devs = scan_devices(Path::new("/dev/input"));
    if devs.is_empty() {
        info!("no input devices usable for touch boost");
        return;
    }

    let epoll = match Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC) {
        Ok(ep) => ep,
        Err(e) => {
            warn!("input monitor: epoll_create failed: {}", e);
            return;
        }
    };
    for (idx, dev) in devs.iter().enumerate() {
        let fd = dev.as_raw_fd();
        // SAFETY: plain flag twiddling on an fd owned by `dev`, which
        // outlives the loop.
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags >= 0 {
                let _ = libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
        // SAFETY: the BorrowedFd only lives for this add call and `dev`
        // keeps the fd open for the life of the loop.
        let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
        if let Err(e) = epoll.add(bfd, EpollEvent::new(EpollFlags::EPOLLIN, idx as u64)) {
            warn!("input monitor: epoll add failed: {}", e);
        }
    }

    let mut events = [EpollEvent::empty(); 16];
    while !shutdown.load(Ordering::Relaxed) {
        let n = match epoll.wait(&mut events, Some(500u16)) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                warn!("input monitor: epoll_wait failed: {}", e);
                break;
            }
        };

        let mut activity = false;
        for ev in &events[..n] {
            let idx = ev.data() as usize;
            let Some(dev) = devs.get_mut(idx) else {
                continue;
            };
            match dev.fetch_events() {
                Ok(fetched) => {
                    for event in fetched {
                        if is_activity(event.event_type(), event.value()) {
                            activity = true;
                        }
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => warn!("input monitor: read failed: {}", e),
            }
        }
        if activity {
            ctx.boostpulse();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_and_touches_are_activity() {
        assert!(is_activity(EventType::KEY, 1));
        assert!(is_activity(EventType::KEY, 0));
        assert!(is_activity(EventType::ABSOLUTE, 123));
    }

    #[test]
    fn sensor_noise_is_not_activity() {
        assert!(!is_activity(EventType::RELATIVE, 0));
        assert!(is_activity(EventType::RELATIVE, -3));
        assert!(!is_activity(EventType::SYNCHRONIZATION, 0));
    }
}
