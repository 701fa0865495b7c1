//! Battery tracker

use crate::bus::{Bus, Message};
use crate::config::{BucketThreshold, DsmeConfig};
use crate::engine::ChargerState;
use crate::timer::{TimerEngine, TimerHandle, TimerKind, TimerPriority};
use std::time::Duration;
use tracing::{instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Full,
    Normal,
    Low,
    Warning,
    Empty,
}

/// Classify a battery percent into a [`Bucket`] using descending
/// thresholds ( defaults: ≥80 FULL, ≥20 NORMAL, ≥10 LOW,
/// ≥3 WARNING, ≥0 EMPTY). Pure and config-driven so it's directly
/// unit-testable.
pub fn classify(percent: u8, buckets: &[BucketThreshold]) -> Bucket {
    let mut sorted: Vec<&BucketThreshold> = buckets.iter().collect();
    sorted.sort_by(|a, b| b.min_level.cmp(&a.min_level));
    for (idx, b) in sorted.iter().enumerate() {
        if percent >= b.min_level {
            return match idx {
                0 => Bucket::Full,
                1 => Bucket::Normal,
                2 => Bucket::Low,
                3 => Bucket::Warning,
                _ => Bucket::Empty,
            };
        }
    }
    Bucket::Empty
}

/// The descending-sorted threshold row backing a given bucket, used to
/// pick its (polling_time, wakeup_during_suspend) profile.
fn threshold_for_bucket<'a>(bucket: Bucket, buckets: &'a [BucketThreshold]) -> Option<&'a BucketThreshold> {
    let mut sorted: Vec<&BucketThreshold> = buckets.iter().collect();
    sorted.sort_by(|a, b| b.min_level.cmp(&a.min_level));
    let idx = match bucket {
        Bucket::Full => 0,
        Bucket::Normal => 1,
        Bucket::Low => 2,
        Bucket::Warning => 3,
        Bucket::Empty => 4,
    };
    sorted.get(idx).copied()
}

pub struct BatteryTracker {
    last_bucket: Option<Bucket>,
    warned: bool,
    empty_sent: bool,
    alarm_hold: Option<TimerHandle>,
}

impl BatteryTracker {
    pub fn new() -> Self {
        Self { last_bucket: None, warned: false, empty_sent: false, alarm_hold: None }
    }

 /// Handle a WAKEUP-triggered battery reading.
    /// `current_state` / `charger` / `alarm_active` come from the state
    /// engine's condition bits, which this component reads but does
    /// not own.
    #[instrument(skip(self, timers, bus, cfg))]
    pub fn handle_reading(
        &mut self,
        percent: u8,
        is_charging: bool,
        valid: bool,
        current_state: crate::engine::State,
        alarm_active: bool,
        timers: &mut TimerEngine,
        bus: &Bus,
        cfg: &DsmeConfig,
    ) {
        bus.publish(Message::SetBattery { percent, is_charging, valid });
        if !valid {
            self.schedule_next_wakeup(None, timers, cfg);
            return;
        }

        let bucket = classify(percent, &cfg.battery_buckets);

        if bucket == Bucket::Warning && !self.warned {
            self.warned = true;
            warn!(percent, "battery low");
        } else if bucket != Bucket::Warning && bucket != Bucket::Empty {
            self.warned = false;
        }

        self.apply_empty_policy(bucket, percent, is_charging, current_state, alarm_active, timers, bus, cfg);

        self.last_bucket = Some(bucket);
        self.schedule_next_wakeup(Some(bucket), timers, cfg);
    }

    fn apply_empty_policy(
        &mut self,
        bucket: Bucket,
        percent: u8,
        is_charging: bool,
        current_state: crate::engine::State,
        alarm_active: bool,
        timers: &mut TimerEngine,
        bus: &Bus,
        cfg: &DsmeConfig,
    ) {
        use crate::engine::State;

        if bucket != Bucket::Empty {
            if self.empty_sent {
                self.empty_sent = false;
                bus.publish(Message::SetBattery { percent, is_charging, valid: true });
            }
            if let Some(h) = self.alarm_hold.take() {
                timers.destroy(h);
            }
            return;
        }

        // In ACTDEAD while charging, never shut down on EMPTY.
        if current_state == State::Actdead && is_charging {
            return;
        }

        // In USER while charging, only force shutdown below 1%.
        if current_state == State::User && is_charging && percent >= 1 {
            return;
        }

        if current_state == State::Actdead && alarm_active && !is_charging {
            if self.alarm_hold.is_none() {
                let handle = timers.create(Duration::from_secs(cfg.alarm_hold_secs), TimerKind::AlarmHold, TimerPriority::Normal);
                self.alarm_hold = Some(handle);
            }
            return;
        }

        if !self.empty_sent {
            self.empty_sent = true;
            bus.publish(Message::BatteryEmpty);
        }
    }

    /// Fired when the alarm-hold timer expires without the alarm
    /// clearing: send `battery_empty` now.
    pub fn handle_timer(&mut self, kind: TimerKind, bus: &Bus) -> bool {
        if kind == TimerKind::AlarmHold {
            self.alarm_hold = None;
            if !self.empty_sent {
                self.empty_sent = true;
                bus.publish(Message::BatteryEmpty);
            }
            true
        } else {
            false
        }
    }

    /// Called when the alarm clears while an alarm-hold is pending: the
    /// empty status is sent immediately rather than waiting out the
 /// remaining hold window.
    pub fn handle_alarm_cleared(&mut self, timers: &mut TimerEngine, bus: &Bus) {
        if let Some(h) = self.alarm_hold.take() {
            timers.destroy(h);
            if !self.empty_sent {
                self.empty_sent = true;
                bus.publish(Message::BatteryEmpty);
            }
        }
    }

    fn schedule_next_wakeup(&self, bucket: Option<Bucket>, timers: &mut TimerEngine, cfg: &DsmeConfig) {
        let secs = match bucket {
            Some(b) => threshold_for_bucket(b, &cfg.battery_buckets)
                .map(|t| t.polling_time_secs as u64)
                .unwrap_or(cfg.battery_default_poll_secs.1 as u64),
 // Data stale: default 30..60s.
            None => cfg.battery_default_poll_secs.0 as u64,
        };
        let _ = timers.create(Duration::from_secs(secs), TimerKind::IphbResume, TimerPriority::High);
    }
}

impl Default for BatteryTracker {
    fn default() -> Self {
        Self::new()
    }
}
