//! Alarm tracker
//!
//! Derives the `alarm_set` condition bit from a persisted "next alarm"
//! head timestamp. The D-Bus signal that actually carries the value is
//! treated as an external collaborator producing typed inbound
//! messages; this module only consumes the resulting
//! [`Message::SetAlarmState`]-shaped input via
//! [`AlarmTracker::set_head`] and persists/derives from there.

use crate::bus::{Bus, Message};
use crate::error::DsmeResult;
use crate::timer::{TimerEngine, TimerHandle, TimerKind, TimerPriority};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{instrument, warn};

/// Seconds before an alarm during which it is considered "soon" enough
/// to be internally alarm-set.
const SNOOZE_WINDOW_SECS: u64 = 120;

pub struct AlarmTracker {
    head: Option<u64>,
    internal_alarm_set: bool,
    external_alarm_set: bool,
    reeval_timer: Option<TimerHandle>,
    head_path: PathBuf,
}

impl AlarmTracker {
    pub fn new(head_path: impl Into<PathBuf>) -> Self {
        Self {
            head: None,
            internal_alarm_set: false,
            external_alarm_set: false,
            reeval_timer: None,
            head_path: head_path.into(),
        }
    }

    /// Load the persisted head timestamp at startup, if any.
    #[instrument(skip(self))]
    pub fn load(&mut self) {
        match read_head(&self.head_path) {
            Ok(Some(head)) => self.head = Some(head),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to read alarm head file, starting with no alarm"),
        }
    }

    pub fn external_alarm_set(&self) -> bool {
        self.external_alarm_set
    }

    pub fn internal_alarm_set(&self) -> bool {
        self.internal_alarm_set
    }

    /// Update the head timestamp (zero means "no alarm"). Persists via
    /// write-temp-then-rename and re-derives both alarm-set booleans.
    #[instrument(skip(self, timers, bus, now))]
    pub fn set_head(&mut self, head: u64, timers: &mut TimerEngine, bus: &Bus, now: u64) {
        self.head = if head == 0 { None } else { Some(head) };
        if let Err(e) = persist_head(&self.head_path, self.head) {
            warn!(error = %e, "failed to persist alarm head");
        }
        self.reevaluate(timers, bus, now);
    }

    fn reevaluate(&mut self, timers: &mut TimerEngine, bus: &Bus, now: u64) {
        if let Some(h) = self.reeval_timer.take() {
            timers.destroy(h);
        }

        let new_external = self.head.is_some();
        let new_internal = match self.head {
            Some(head) if head.saturating_sub(now) <= SNOOZE_WINDOW_SECS => true,
            Some(head) => {
                let delay = head - now - SNOOZE_WINDOW_SECS;
                let handle = timers.create(Duration::from_secs(delay), TimerKind::AlarmSnooze, TimerPriority::Normal);
                self.reeval_timer = Some(handle);
                false
            }
            None => false,
        };

        if new_internal != self.internal_alarm_set {
            self.internal_alarm_set = new_internal;
            bus.publish(Message::SetAlarmState { set: new_internal });
        }
        if new_external != self.external_alarm_set {
            self.external_alarm_set = new_external;
        }
    }

    /// Fired by the event loop when the snooze re-evaluation timer
    /// expires.
    pub fn handle_timer(&mut self, kind: TimerKind, timers: &mut TimerEngine, bus: &Bus, now: u64) -> bool {
        if kind == TimerKind::AlarmSnooze {
            self.reeval_timer = None;
            self.reevaluate(timers, bus, now);
            true
        } else {
            false
        }
    }
}

fn read_head(path: &Path) -> DsmeResult<Option<u64>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content.trim().parse::<u64>().ok().filter(|v| *v != 0)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(crate::error::DsmeError::Persistence(e)),
    }
}

fn persist_head(path: &Path, head: Option<u64>) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&tmp_path)?;
        writeln!(f, "{}", head.unwrap_or(0))?;
        f.sync_all()?;
    }
    fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn head_within_snooze_window_sets_internal_immediately() {
        let dir = tempdir().unwrap();
        let mut tracker = AlarmTracker::new(dir.path().join("alarm_queue_head"));
        let mut timers = TimerEngine::new();
        let bus = Bus::new();
        tracker.set_head(1_000, &mut timers, &bus, 900); // 100s out, within 120s window
        assert!(tracker.internal_alarm_set());
        assert!(tracker.external_alarm_set());
    }

    #[test]
    fn head_far_out_schedules_reevaluation_without_internal_set() {
        let dir = tempdir().unwrap();
        let mut tracker = AlarmTracker::new(dir.path().join("alarm_queue_head"));
        let mut timers = TimerEngine::new();
        let bus = Bus::new();
        tracker.set_head(10_000, &mut timers, &bus, 0); // far in the future
        assert!(!tracker.internal_alarm_set());
        assert!(tracker.external_alarm_set());
        assert!(timers.next_deadline().is_some());
    }

    #[test]
    fn zero_head_clears_both_bits() {
        let dir = tempdir().unwrap();
        let mut tracker = AlarmTracker::new(dir.path().join("alarm_queue_head"));
        let mut timers = TimerEngine::new();
        let bus = Bus::new();
        tracker.set_head(1_000, &mut timers, &bus, 900);
        tracker.set_head(0, &mut timers, &bus, 901);
        assert!(!tracker.internal_alarm_set());
        assert!(!tracker.external_alarm_set());
    }

    #[test]
    fn persisted_head_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alarm_queue_head");
        let mut tracker = AlarmTracker::new(&path);
        let mut timers = TimerEngine::new();
        let bus = Bus::new();
        tracker.set_head(5_000, &mut timers, &bus, 0);

        let mut reloaded = AlarmTracker::new(&path);
        reloaded.load();
        assert_eq!(reloaded.head, Some(5_000));
    }
}
