//! Watchdog kicker

use crate::bus::{Bus, Message};
use crate::config::DsmeConfig;
use crate::timer::{TimerEngine, TimerHandle, TimerKind, TimerPriority};
use std::time::Duration;
use tracing::{instrument, warn};

/// Hardware watchdog kick sink. Implementations write to the character
/// device(s); tests use a counting stub.
pub trait WatchdogDevice: Send + Sync {
    fn kick(&mut self);
 /// One-shot, best-effort `mlockall`-equivalent.
    fn lock_memory(&mut self) -> bool;
}

/// No-op watchdog for environments without hardware access.
#[derive(Default)]
pub struct NullWatchdogDevice {
    pub kicks: u64,
}

impl WatchdogDevice for NullWatchdogDevice {
    fn kick(&mut self) {
        self.kicks += 1;
    }
    fn lock_memory(&mut self) -> bool {
        true
    }
}

pub struct WatchdogKicker {
    device: Box<dyn WatchdogDevice>,
    timer: Option<TimerHandle>,
    memory_locked: bool,
}

impl WatchdogKicker {
    pub fn new(device: Box<dyn WatchdogDevice>) -> Self {
        Self { device, timer: None, memory_locked: false }
    }

    /// Arm the periodic HIGH-priority kick timer.
    #[instrument(skip(self, timers, cfg))]
    pub fn start(&mut self, timers: &mut TimerEngine, cfg: &DsmeConfig) {
        let handle = timers.create(Duration::from_secs(cfg.watchdog_period_secs), TimerKind::WatchdogKick, TimerPriority::High);
        self.timer = Some(handle);
    }

    /// Fired on the periodic timer (or an `HWWD_KICK` message): kick,
    /// broadcast HEARTBEAT, reset the period.
    #[instrument(skip(self, timers, bus, cfg))]
    pub fn kick(&mut self, timers: &mut TimerEngine, bus: &Bus, cfg: &DsmeConfig) {
        if !self.memory_locked {
            self.memory_locked = self.device.lock_memory();
            if !self.memory_locked {
                warn!("failed to lock process memory for watchdog kicker");
            }
        }
        self.device.kick();
        bus.publish(Message::Heartbeat);

        if let Some(h) = self.timer.take() {
            timers.destroy(h);
        }
        self.start(timers, cfg);
    }

    /// Dispatch an expired timer; returns `true` if it belonged to this
    /// component.
    pub fn handle_timer(&mut self, kind: TimerKind, timers: &mut TimerEngine, bus: &Bus, cfg: &DsmeConfig) -> bool {
        if kind == TimerKind::WatchdogKick {
            self.timer = None;
            self.kick(timers, bus, cfg);
            true
        } else {
            false
        }
    }

    /// `HWWD_KICK` message: force an immediate kick and reset the
 /// period.
    pub fn handle_hwwd_kick(&mut self, timers: &mut TimerEngine, bus: &Bus, cfg: &DsmeConfig) {
        self.kick(timers, bus, cfg);
    }
}
