//! Power-key monitor
//!
//! Watches evdev input devices for the power button (identified by the
//! "pwrbutton" substring in its `EVIOCGNAME` response) and requests
//! shutdown after a long press, through the normal engine-gated
//! `ShutdownReq` path (so USB-mount denial and debounce rules still
//! apply -- this component never bypasses them).

use crate::bus::{Bus, Message};
use crate::config::DsmeConfig;
use crate::timer::{TimerEngine, TimerHandle, TimerKind, TimerPriority};
use async_trait::async_trait;
use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Raw Linux `struct input_event` layout (`linux/input.h`), 64-bit
/// `timeval`. Field order/width must match exactly for the
/// `ptr::read` below to make sense of the bytes off the wire.
#[repr(C)]
struct RawInputEvent {
    tv_sec: i64,
    tv_usec: i64,
    kind: u16,
    code: u16,
    value: i32,
}

const EV_KEY: u16 = 0x01;
const KEY_POWER: u16 = 116;

/// Abstracts the evdev source so the monitor is testable without real
/// `/dev/input` access.
#[async_trait]
pub trait PowerKeySource: Send {
    /// Await the next press/release edge; `true` = pressed.
    async fn next_edge(&mut self) -> Option<bool>;
}

/// Fake source for tests and non-Linux dev environments.
pub struct FakePowerKeySource {
    edges: std::collections::VecDeque<bool>,
}

impl FakePowerKeySource {
    pub fn new(edges: Vec<bool>) -> Self {
        Self { edges: edges.into() }
    }
}

#[async_trait]
impl PowerKeySource for FakePowerKeySource {
    async fn next_edge(&mut self) -> Option<bool> {
        self.edges.pop_front()
    }
}

/// Scans `/dev/input/event*` for a device whose name contains
/// "pwrbutton" and reports its key-press edges.
pub struct EvdevPowerKeySource {
    device: Option<File>,
}

impl EvdevPowerKeySource {
    pub fn discover() -> Self {
        let device_path = std::fs::read_dir("/dev/input")
            .ok()
            .into_iter()
            .flatten()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| p.to_string_lossy().contains("event"));

        let device = device_path.and_then(|p| match File::open(&p) {
            Ok(f) => Some(f),
            Err(e) => {
                warn!(path = %p.display(), error = %e, "failed to open power-key input device");
                None
            }
        });
        Self { device }
    }
}

/// Blocking read of one `input_event` off `fd`, returning `Some(pressed)`
/// for a `KEY_POWER` event and `None` for any other event (repeat,
/// sync, other keys) or a read error. Blocks on the read(2) syscall
/// itself rather than polling first -- the device node is opened in
/// its default blocking mode, so a plain read already waits for data.
fn read_power_key_edge(fd: RawFd) -> Option<bool> {
    let mut buf = [0u8; std::mem::size_of::<RawInputEvent>()];
    loop {
        let n = match nix::unistd::read(fd, &mut buf) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "power-key device read failed");
                return None;
            }
        };
        if n < buf.len() {
            return None;
        }
        // SAFETY: buf is exactly size_of::<RawInputEvent>() bytes read
        // straight off the device fd, and RawInputEvent is repr(C) with
        // no padding-sensitive fields (all accesses are through a
        // pointer read, not a reference, so field alignment of the
        // stack buffer doesn't matter).
        let ev: RawInputEvent = unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const RawInputEvent) };
        if ev.kind == EV_KEY && ev.code == KEY_POWER {
            return Some(ev.value != 0);
        }
        // Non-power-key event (repeat, sync, other key); keep reading.
    }
}

#[async_trait]
impl PowerKeySource for EvdevPowerKeySource {
    async fn next_edge(&mut self) -> Option<bool> {
        let fd = self.device.as_ref()?.as_raw_fd();
        tokio::task::spawn_blocking(move || read_power_key_edge(fd)).await.unwrap_or(None)
    }
}

pub struct PowerKeyMonitor {
    longpress_timer: Option<TimerHandle>,
}

impl PowerKeyMonitor {
    pub fn new() -> Self {
        Self { longpress_timer: None }
    }

    #[instrument(skip(self, timers, cfg))]
    pub fn handle_press(&mut self, timers: &mut TimerEngine, cfg: &DsmeConfig) {
        if self.longpress_timer.is_none() {
            let handle = timers.create(Duration::from_secs(cfg.powerkey_longpress_secs), TimerKind::PowerkeyLongpress, TimerPriority::Normal);
            self.longpress_timer = Some(handle);
        }
    }

    pub fn handle_release(&mut self, timers: &mut TimerEngine) {
        if let Some(h) = self.longpress_timer.take() {
            timers.destroy(h);
        }
    }

    pub fn handle_timer(&mut self, kind: TimerKind, bus: &Bus) -> bool {
        if kind == TimerKind::PowerkeyLongpress {
            self.longpress_timer = None;
            info!("power key long press detected, requesting shutdown");
            bus.publish(Message::ShutdownReq);
            true
        } else {
            false
        }
    }

    /// Drive the monitor loop against any [`PowerKeySource`].
    pub async fn run(&mut self, mut source: impl PowerKeySource, timers_tx: tokio::sync::mpsc::Sender<PowerKeyEdge>) {
        while let Some(pressed) = source.next_edge().await {
            let edge = if pressed { PowerKeyEdge::Pressed } else { PowerKeyEdge::Released };
            if timers_tx.send(edge).await.is_err() {
                break;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerKeyEdge {
    Pressed,
    Released,
}

impl Default for PowerKeyMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn press_arms_longpress_timer_once() {
        let mut monitor = PowerKeyMonitor::new();
        let mut timers = TimerEngine::new();
        let cfg = DsmeConfig::default();
        monitor.handle_press(&mut timers, &cfg);
        let first = monitor.longpress_timer;
        monitor.handle_press(&mut timers, &cfg);
        assert_eq!(monitor.longpress_timer, first);
    }

    #[test]
    fn release_cancels_pending_timer() {
        let mut monitor = PowerKeyMonitor::new();
        let mut timers = TimerEngine::new();
        let cfg = DsmeConfig::default();
        monitor.handle_press(&mut timers, &cfg);
        monitor.handle_release(&mut timers);
        assert!(monitor.longpress_timer.is_none());
    }

    #[test]
    fn longpress_timer_requests_shutdown() {
        let mut monitor = PowerKeyMonitor::new();
        let bus = Bus::new();
        let mut rx = bus.subscribe();
        assert!(monitor.handle_timer(TimerKind::PowerkeyLongpress, &bus));
        assert!(matches!(rx.try_recv().unwrap(), Message::ShutdownReq));
    }

    #[tokio::test]
    async fn fake_source_replays_configured_edges() {
        let mut source = FakePowerKeySource::new(vec![true, false]);
        assert_eq!(source.next_edge().await, Some(true));
        assert_eq!(source.next_edge().await, Some(false));
        assert_eq!(source.next_edge().await, None);
    }

    fn raw_event_bytes(kind: u16, code: u16, value: i32) -> Vec<u8> {
        let ev = RawInputEvent { tv_sec: 0, tv_usec: 0, kind, code, value };
        let ptr = &ev as *const RawInputEvent as *const u8;
        unsafe { std::slice::from_raw_parts(ptr, std::mem::size_of::<RawInputEvent>()).to_vec() }
    }

    #[test]
    fn read_power_key_edge_skips_non_power_events_then_parses_a_press() {
        let (read_fd, write_fd) = nix::unistd::pipe().unwrap();
        let mut other = raw_event_bytes(EV_KEY, KEY_POWER + 1, 1);
        let mut press = raw_event_bytes(EV_KEY, KEY_POWER, 1);
        other.append(&mut press);
        nix::unistd::write(&write_fd, &other).unwrap();

        let edge = read_power_key_edge(read_fd.as_raw_fd());
        assert_eq!(edge, Some(true));
    }

    #[test]
    fn read_power_key_edge_parses_a_release() {
        let (read_fd, write_fd) = nix::unistd::pipe().unwrap();
        let bytes = raw_event_bytes(EV_KEY, KEY_POWER, 0);
        nix::unistd::write(&write_fd, &bytes).unwrap();

        let edge = read_power_key_edge(read_fd.as_raw_fd());
        assert_eq!(edge, Some(false));
    }
}
