//! State engine: fuses condition bits into a [`State`],
//! drives the shutdown/actdead/user delayed timers and the debounce
//! timers, and emits [`Message`]s for the rest of the system to act on.
//!
//! The engine owns its [`ConditionBits`] and current [`State`]
//! exclusively — no locking; mutated only through its own methods, the
//! same way a single owner task holds process supervision state
//! elsewhere in this crate.

pub mod bits;
pub mod bootstate;

pub use bits::{select_state, state_to_runlevel, ChargerState, ConditionBits, MalfInfo, Runlevel, State, ThermalStatus};
pub use bootstate::{parse_bootstate, ParsedBootstate};

use crate::bus::{Bus, Message};
use crate::config::DsmeConfig;
use crate::error::{DsmeError, DsmeResult};
use crate::timer::{TimerEngine, TimerHandle, TimerKind, TimerPriority};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};
use utoipa::ToSchema;

/// Serializable snapshot of the engine's visible state, used by the
/// `/api/v1/state` endpoint and the WebSocket greeting frame.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub current: State,
    pub runlevel: Runlevel,
    pub bits: ConditionBits,
}

/// Which of the three mutually-exclusive delayed transition timers is
/// pending, if any -- at most one of {shutdown, actdead, user} timer is
/// ever active at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingTransition {
    Shutdown,
    Actdead,
    User,
}

/// The state engine: a single `EngineState` record owned by the event
/// loop, consolidating condition bits, current state and pending-timer
/// bookkeeping in one place.
pub struct StateEngine {
    bits: ConditionBits,
    current: State,
    init_completed: bool,

    pending: Option<(PendingTransition, TimerHandle)>,
    overheat_debounce: Option<TimerHandle>,
    charger_disconnect_debounce: Option<TimerHandle>,
    battery_empty_debounce: Option<TimerHandle>,
    malf_shutdown: Option<TimerHandle>,

    /// Cached from the battery tracker's `SetBattery` messages; needed
    /// for the ACTDEAD->USER low-battery refusal check (battery level
    /// is owned by a separate component).
    last_battery_percent: Option<u8>,
}

impl StateEngine {
    pub fn new() -> Self {
        Self {
            bits: ConditionBits::default(),
            current: State::NotSet,
            init_completed: false,
            pending: None,
            overheat_debounce: None,
            charger_disconnect_debounce: None,
            battery_empty_debounce: None,
            malf_shutdown: None,
            last_battery_percent: None,
        }
    }

    pub fn current(&self) -> State {
        self.current
    }

    pub fn bits(&self) -> &ConditionBits {
        &self.bits
    }

    /// A cheap, cloneable view of the engine for the observability API
    /// and the `/events` snapshot sent to new WebSocket subscribers.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            current: self.current,
            runlevel: state_to_runlevel(self.current),
            bits: self.bits.clone(),
        }
    }

    /// Initialize condition bits from the boot environment.
    #[instrument(skip(self, timers, bus, cfg))]
    pub fn start(&mut self, bootstate: &str, timers: &mut TimerEngine, bus: &Bus, cfg: &DsmeConfig) {
        let parsed = parse_bootstate(bootstate, cfg.rnd_mode);
        self.bits = parsed.bits;
        if let Some(info) = parsed.malf_info {
            info!(reason = %info.reason, component = %info.component, "boot malf reason");
        }
        self.reselect(timers, bus, cfg);
    }

    /// Cancel whichever of {shutdown, actdead, user} timer is pending.
    fn cancel_pending(&mut self, timers: &mut TimerEngine) {
        if let Some((_, handle)) = self.pending.take() {
            timers.destroy(handle);
        }
    }

    fn cancel_all_debounces(&mut self, timers: &mut TimerEngine) {
        if let Some(h) = self.overheat_debounce.take() {
            timers.destroy(h);
        }
        if let Some(h) = self.charger_disconnect_debounce.take() {
            timers.destroy(h);
        }
        if let Some(h) = self.battery_empty_debounce.take() {
            timers.destroy(h);
        }
    }

    /// Re-run the selector against current bits and drive whatever
    /// transition it implies.
    fn reselect(&mut self, timers: &mut TimerEngine, bus: &Bus, cfg: &DsmeConfig) {
        let next = select_state(&self.bits, self.current);
        self.apply_transition(next, timers, bus, cfg);
    }

    fn apply_transition(&mut self, next: State, timers: &mut TimerEngine, bus: &Bus, cfg: &DsmeConfig) {
        if next == self.current {
            return;
        }

        match next {
            State::Shutdown | State::Reboot => {
                self.cancel_pending(timers);
                bus.publish(Message::SaveDataInd);
                bus.publish(Message::StateChangeInd(next));
                self.current = next;
                self.start_delayed(
                    PendingTransition::Shutdown,
                    Duration::from_secs(cfg.shutdown_grace_secs),
                    TimerKind::ShutdownGrace,
                    timers,
                );
            }
            State::User | State::Actdead => {
                self.transition_user_actdead(next, timers, bus, cfg);
            }
            State::Test | State::Local => {
                if self.current == State::NotSet {
                    self.cancel_pending(timers);
                    bus.publish(Message::StateChangeInd(next));
                    self.current = next;
                }
                // TEST/LOCAL permitted only from NOT_SET; otherwise ignored.
            }
            State::Malf => {
                self.cancel_pending(timers);
                bus.publish(Message::StateChangeInd(next));
                self.current = next;
                if !cfg.rnd_mode {
                    let handle = timers.create(Duration::from_secs(cfg.malf_shutdown_secs), TimerKind::MalfShutdown, TimerPriority::Normal);
                    self.malf_shutdown = Some(handle);
                }
            }
            State::NotSet | State::Boot => {
                // Never a selector output; nothing to do.
            }
        }
    }

    fn transition_user_actdead(&mut self, next: State, timers: &mut TimerEngine, bus: &Bus, cfg: &DsmeConfig) {
        if self.current == State::NotSet {
            self.cancel_pending(timers);
            bus.publish(Message::StateChangeInd(next));
            self.current = next;
            return;
        }

        if !cfg.direct_user_actdead {
            // Builds without direct USER<->ACTDEAD support force the
 // opposite terminal transition.
            let forced = if next == State::User { State::Reboot } else { State::Shutdown };
            self.apply_transition(forced, timers, bus, cfg);
            return;
        }

        if self.current == State::Actdead && next == State::User {
            if let Some(percent) = self.last_battery_percent {
                if percent < cfg.min_battery_percent_for_user {
                    self.bits.shutdown_requested = true;
                    warn!(percent, "refusing ACTDEAD->USER: battery too low");
                    return;
                }
            }
            let secs = if self.init_completed { cfg.user_actdead_min_secs } else { cfg.user_actdead_max_secs };
            self.start_delayed(PendingTransition::User, Duration::from_secs(secs), TimerKind::UserTimer, timers);
            return;
        }

        if self.current == State::User && next == State::Actdead {
            let secs = if self.init_completed { cfg.user_actdead_min_secs } else { cfg.user_actdead_max_secs };
            self.start_delayed(PendingTransition::Actdead, Duration::from_secs(secs), TimerKind::ActdeadTimer, timers);
        }
    }

    fn start_delayed(&mut self, which: PendingTransition, after: Duration, kind: TimerKind, timers: &mut TimerEngine) {
        self.cancel_pending(timers);
        let handle = timers.create(after, kind, TimerPriority::Normal);
        self.pending = Some((which, handle));
    }

    /// Handle an inbound message relevant to the engine. Returns
    /// `Ok(())` even on a denied/logged-and-ignored request -- errors
    /// are never thrown through the event-loop boundary.
    #[instrument(skip(self, msg, timers, bus, cfg), fields(current = ?self.current))]
    pub fn handle_message(&mut self, msg: &Message, timers: &mut TimerEngine, bus: &Bus, cfg: &DsmeConfig) -> DsmeResult<()> {
        match msg {
            Message::SetCharger(state) => {
                let prior = self.bits.charger;
                self.bits.charger = *state;
                if *state == ChargerState::Connected {
                    if let Some(h) = self.charger_disconnect_debounce.take() {
                        timers.destroy(h);
                    }
                } else if *state == ChargerState::Disconnected
                    && self.current == State::Actdead
                    && prior != ChargerState::Unknown
                    && prior != ChargerState::Disconnected
                    && self.charger_disconnect_debounce.is_none()
                {
                    let handle = timers.create(
                        Duration::from_secs(cfg.charger_disconnect_debounce_secs),
                        TimerKind::ChargerDisconnectDebounce,
                        TimerPriority::Normal,
                    );
                    self.charger_disconnect_debounce = Some(handle);
                }
                self.reselect(timers, bus, cfg);
            }
            Message::SetAlarm { .. } => {
                // Raw D-Bus alarm notification; the alarm tracker turns
                // this into a head timestamp and derives the debounced
                // `alarm_set` bit via `Message::SetAlarmState`.
            }
            Message::SetAlarmState { set } => {
                self.bits.alarm_set = *set;
                self.reselect(timers, bus, cfg);
            }
            Message::SetThermal(status) => {
                match status {
                    ThermalStatus::Overheated if self.overheat_debounce.is_none() => {
                        let handle = timers.create(Duration::from_secs(cfg.overheat_debounce_secs), TimerKind::OverheatDebounce, TimerPriority::Normal);
                        self.overheat_debounce = Some(handle);
                    }
                    // NORMAL/LOWTEMP never clear an already-latched
                    // device_overheated bit (monotonic towards
 // OVERHEATED, ).
                    _ => {}
                }
            }
            Message::SetEmergencyCall(active) => {
                self.bits.emergency_call = *active;
                if *active {
                    self.cancel_pending(timers);
                    self.cancel_all_debounces(timers);
                }
                self.reselect(timers, bus, cfg);
            }
            Message::SetUsb { mounted } => {
                self.bits.mounted_to_pc = *mounted;
            }
            Message::SetBattery { percent, is_charging: _, valid } => {
                if *valid {
                    self.last_battery_percent = Some(*percent);
                }
            }
            Message::BatteryEmpty => {
                if self.battery_empty_debounce.is_none() {
                    let handle = timers.create(Duration::from_secs(cfg.battery_empty_debounce_secs), TimerKind::BatteryEmptyDebounce, TimerPriority::Normal);
                    self.battery_empty_debounce = Some(handle);
                }
            }
            Message::ShutdownReq => {
                if self.bits.mounted_to_pc {
                    bus.publish(Message::StateReqDenied { state: "SHUTDOWN".to_string(), reason: "usb".to_string() });
                    return Ok(());
                }
                self.bits.shutdown_requested = true;
                self.reselect(timers, bus, cfg);
            }
            Message::RebootReq => {
                if self.bits.mounted_to_pc {
                    bus.publish(Message::StateReqDenied { state: "REBOOT".to_string(), reason: "usb".to_string() });
                    return Ok(());
                }
                self.bits.reboot_requested = true;
                self.reselect(timers, bus, cfg);
            }
            Message::PowerupReq => {
                self.bits.shutdown_requested = false;
                self.bits.actdead_requested = false;
                self.bits.reboot_requested = false;
                self.reselect(timers, bus, cfg);
            }
            Message::Telinit { name } => {
                self.handle_telinit(name, timers, bus, cfg)?;
            }
            Message::StateQuery => {
                bus.publish(Message::StateChangeInd(self.current));
            }
            Message::DbusConnect | Message::DbusDisconnect => {
 // Lifecycle only; no condition-bit effect (                // "treat as an adapter producing typed inbound
                // messages ... connect/disconnect are ordinary
                // lifecycle messages").
            }
            Message::RunlevelSwitchDone { runlevel } => {
                self.handle_runlevel_switch_done(*runlevel, timers, bus, cfg);
            }
            Message::BaseBootDone => {
                self.init_completed = true;
            }
            Message::SetMalf(set) => {
                self.bits.malf = *set;
                self.reselect(timers, bus, cfg);
            }
            Message::ForceShutdown => {
                // Bypasses the USB-mount denial rule: used only for the
 // irrecoverable security-violation path,
                // where the enter_malf helper itself failed to run.
                self.bits.shutdown_requested = true;
                self.reselect(timers, bus, cfg);
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_telinit(&mut self, name: &str, timers: &mut TimerEngine, bus: &Bus, cfg: &DsmeConfig) -> DsmeResult<()> {
        match name {
            "SHUTDOWN" => {
                self.handle_message(&Message::ShutdownReq, timers, bus, cfg)?;
            }
            "REBOOT" => {
                self.handle_message(&Message::RebootReq, timers, bus, cfg)?;
            }
            "ACTDEAD" => {
                if self.bits.mounted_to_pc {
                    bus.publish(Message::StateReqDenied { state: "ACTDEAD".to_string(), reason: "usb".to_string() });
                    return Ok(());
                }
                self.bits.actdead_requested = true;
                self.reselect(timers, bus, cfg);
            }
            "USER" => {
                self.bits.shutdown_requested = false;
                self.bits.actdead_requested = false;
                self.reselect(timers, bus, cfg);
            }
            other => {
                warn!(telinit = %other, "invalid telinit request, ignored");
                return Err(DsmeError::InvalidTelinit(other.to_string()));
            }
        }
        Ok(())
    }

    fn handle_runlevel_switch_done(&mut self, runlevel: i32, timers: &mut TimerEngine, bus: &Bus, cfg: &DsmeConfig) {
        let is_actdead_runlevel = runlevel == Runlevel::Actdead.code();
        let is_user_runlevel = runlevel == Runlevel::User.code();

        if is_actdead_runlevel {
            self.bits.actdead_switch_done = true;
            if let Some((PendingTransition::Actdead, handle)) = self.pending {
                timers.destroy(handle);
                self.pending = None;
                self.fire_timer(TimerKind::ActdeadTimer, timers, bus, cfg);
            }
        } else if is_user_runlevel {
            self.bits.user_switch_done = true;
            if let Some((PendingTransition::User, handle)) = self.pending {
                timers.destroy(handle);
                self.pending = None;
                self.fire_timer(TimerKind::UserTimer, timers, bus, cfg);
            }
        }
    }

    /// Dispatch an expired timer owned by this engine. Returns `true`
    /// if the kind belonged to the engine (caller should not look
    /// further).
    #[instrument(skip(self, timers, bus, cfg))]
    pub fn handle_timer(&mut self, kind: TimerKind, timers: &mut TimerEngine, bus: &Bus, cfg: &DsmeConfig) -> bool {
        match kind {
            TimerKind::ShutdownGrace => {
                self.pending = None;
                bus.publish(Message::HwwdKick);
                bus.publish(Message::Shutdown(state_to_runlevel(self.current)));
                true
            }
            TimerKind::UserTimer | TimerKind::ActdeadTimer => {
                self.fire_timer(kind, timers, bus, cfg);
                true
            }
            TimerKind::OverheatDebounce => {
                self.overheat_debounce = None;
                self.bits.device_overheated = true;
                self.reselect(timers, bus, cfg);
                true
            }
            TimerKind::ChargerDisconnectDebounce => {
                self.charger_disconnect_debounce = None;
                self.bits.charger = ChargerState::Disconnected;
                self.reselect(timers, bus, cfg);
                true
            }
            TimerKind::BatteryEmptyDebounce => {
                self.battery_empty_debounce = None;
                self.bits.battery_empty = true;
                self.reselect(timers, bus, cfg);
                true
            }
            TimerKind::MalfShutdown => {
                self.malf_shutdown = None;
                self.bits.shutdown_requested = true;
                self.reselect(timers, bus, cfg);
                true
            }
            _ => false,
        }
    }

    fn fire_timer(&mut self, kind: TimerKind, _timers: &mut TimerEngine, bus: &Bus, _cfg: &DsmeConfig) {
        self.pending = None;
        match kind {
            TimerKind::UserTimer => {
                self.current = State::User;
                bus.publish(Message::StateChangeInd(State::User));
                bus.publish(Message::ChangeRunlevel(State::User));
            }
            TimerKind::ActdeadTimer => {
                self.current = State::Actdead;
                bus.publish(Message::StateChangeInd(State::Actdead));
                bus.publish(Message::ChangeRunlevel(State::Actdead));
            }
            _ => {}
        }
    }
}

impl Default for StateEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DsmeConfig;

    fn harness() -> (StateEngine, TimerEngine, Bus, DsmeConfig) {
        (StateEngine::new(), TimerEngine::new(), Bus::new(), DsmeConfig::default())
    }

    #[test]
    fn actdead_cold_boot_with_alarm_has_no_shutdown_timer() {
        let (mut engine, mut timers, bus, cfg) = harness();
        engine.start("ACT_DEAD", &mut timers, &bus, &cfg);
        engine.handle_message(&Message::SetAlarmState { set: true }, &mut timers, &bus, &cfg).unwrap();

        assert_eq!(engine.current(), State::Actdead);
        assert!(engine.bits().shutdown_requested);
        assert!(engine.bits().alarm_set);
        assert!(engine.pending.is_none());
    }

    #[test]
    fn usb_mounted_denies_shutdown_telinit() {
        let (mut engine, mut timers, bus, cfg) = harness();
        engine.start("USER", &mut timers, &bus, &cfg);
        engine.handle_message(&Message::SetUsb { mounted: true }, &mut timers, &bus, &cfg).unwrap();
        let mut rx = bus.subscribe();
        engine.handle_message(&Message::Telinit { name: "SHUTDOWN".to_string() }, &mut timers, &bus, &cfg).unwrap();

        assert_eq!(engine.current(), State::User);
        assert!(engine.pending.is_none());
        let received = rx.try_recv().unwrap();
        matches!(received, Message::StateReqDenied { .. });
    }

    #[test]
    fn overheat_sets_bit_only_after_debounce_fires() {
        let (mut engine, mut timers, bus, cfg) = harness();
        engine.start("USER", &mut timers, &bus, &cfg);
        engine.handle_message(&Message::SetThermal(ThermalStatus::Overheated), &mut timers, &bus, &cfg).unwrap();
        assert!(!engine.bits().device_overheated);

        engine.handle_timer(TimerKind::OverheatDebounce, &mut timers, &bus, &cfg);
        assert!(engine.bits().device_overheated);
        assert_eq!(engine.current(), State::Shutdown);
        assert!(engine.pending.is_some());
    }

    #[test]
    fn emergency_call_freezes_state_and_cancels_timers() {
        let (mut engine, mut timers, bus, cfg) = harness();
        engine.start("USER", &mut timers, &bus, &cfg);
        engine.handle_message(&Message::ShutdownReq, &mut timers, &bus, &cfg).unwrap();
        assert!(engine.pending.is_some());

        engine.handle_message(&Message::SetEmergencyCall(true), &mut timers, &bus, &cfg).unwrap();
        assert_eq!(engine.current(), State::User);
        assert!(engine.pending.is_none());
    }

    #[test]
    fn invalid_telinit_is_logged_and_returns_err_without_panicking() {
        let (mut engine, mut timers, bus, cfg) = harness();
        engine.start("USER", &mut timers, &bus, &cfg);
        let result = engine.handle_message(&Message::Telinit { name: "BOGUS".to_string() }, &mut timers, &bus, &cfg);
        assert!(result.is_err());
        assert_eq!(engine.current(), State::User);
    }

    #[test]
    fn low_battery_refuses_actdead_to_user() {
        let (mut engine, mut timers, bus, mut cfg) = harness();
        cfg.min_battery_percent_for_user = 3;
        engine.start("ACT_DEAD", &mut timers, &bus, &cfg);
        engine.handle_message(&Message::SetBattery { percent: 1, is_charging: false, valid: true }, &mut timers, &bus, &cfg).unwrap();
        engine.handle_message(&Message::Telinit { name: "USER".to_string() }, &mut timers, &bus, &cfg).unwrap();

        assert_eq!(engine.current(), State::Actdead);
        assert!(engine.bits().shutdown_requested);
    }
}
