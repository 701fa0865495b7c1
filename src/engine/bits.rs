//! State/Runlevel/condition-bit data model

use serde::Serialize;
use utoipa::ToSchema;

/// Device state. Integer codes match exactly so any external
/// tooling speaking the legacy wire codes keeps working.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum State {
    NotSet = -1,
    Shutdown = 0,
    User = 2,
    Actdead = 5,
    Reboot = 6,
    Test = 7,
    Local = 8,
    Malf = 9,
    Boot = 10,
}

impl State {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Unix runlevel. The legacy `state2runlevel` had a missing `break`
/// after LOCAL that fell through into ACTDEAD; this implementation
/// picks the non-bug semantics -- LOCAL maps to its own runlevel (10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Runlevel {
    Shutdown = 0,
    User = 2,
    Actdead = 5,
    Reboot = 6,
    Test = 7,
    Malf = 8,
    Local = 10,
}

impl Runlevel {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Map a [`State`] to its [`Runlevel`]; unmapped states (`NOT_SET`,
/// `BOOT`) default to SHUTDOWN.
pub fn state_to_runlevel(state: State) -> Runlevel {
    match state {
        State::Shutdown => Runlevel::Shutdown,
        State::User => Runlevel::User,
        State::Actdead => Runlevel::Actdead,
        State::Reboot => Runlevel::Reboot,
        State::Test => Runlevel::Test,
        State::Local => Runlevel::Local,
        State::Malf => Runlevel::Malf,
        State::NotSet | State::Boot => Runlevel::Shutdown,
    }
}

/// Charger condition bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChargerState {
    Unknown,
    Connected,
    Disconnected,
}

/// Thermal status; monotonic towards `Overheated` (no downgrade once hit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ThermalStatus {
    Normal,
    Lowtemp,
    Overheated,
}

/// Every process-wide state-selector input bit. All start
/// false/unknown.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ConditionBits {
    pub charger: ChargerState,
    pub alarm_set: bool,
    pub device_overheated: bool,
    pub emergency_call: bool,
    pub mounted_to_pc: bool,
    pub battery_empty: bool,
    pub shutdown_requested: bool,
    pub actdead_requested: bool,
    pub reboot_requested: bool,
    pub test: bool,
    pub malf: bool,
    pub actdead_switch_done: bool,
    pub user_switch_done: bool,
}

impl Default for ConditionBits {
    fn default() -> Self {
        Self {
            charger: ChargerState::Unknown,
            alarm_set: false,
            device_overheated: false,
            emergency_call: false,
            mounted_to_pc: false,
            battery_empty: false,
            shutdown_requested: false,
            actdead_requested: false,
            reboot_requested: false,
            test: false,
            malf: false,
            actdead_switch_done: false,
            user_switch_done: false,
        }
    }
}

/// The state-selection function: priority ordered, first
/// match wins. Pure and deterministic — no IO, no clock access — so it
/// is unit-testable the same way a restart-policy decision function
/// is kept pure elsewhere in this crate.
pub fn select_state(bits: &ConditionBits, current: State) -> State {
    if bits.emergency_call {
        return current;
    }
    if bits.malf {
        return State::Malf;
    }
    if bits.test {
        return State::Test;
    }
    if bits.battery_empty {
        return State::Shutdown;
    }
    if bits.device_overheated {
        return State::Shutdown;
    }
    if bits.actdead_requested {
        return State::Actdead;
    }
    if bits.shutdown_requested && bits.charger == ChargerState::Disconnected && !bits.alarm_set {
        return State::Shutdown;
    }
    if bits.reboot_requested {
        return State::Reboot;
    }
    if bits.shutdown_requested || bits.reboot_requested {
        return State::Actdead;
    }
    State::User
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emergency_call_freezes_current() {
        let mut bits = ConditionBits::default();
        bits.emergency_call = true;
        bits.battery_empty = true; // would otherwise force SHUTDOWN
        assert_eq!(select_state(&bits, State::User), State::User);
        assert_eq!(select_state(&bits, State::Actdead), State::Actdead);
    }

    #[test]
    fn priority_order_malf_beats_test() {
        let mut bits = ConditionBits::default();
        bits.malf = true;
        bits.test = true;
        assert_eq!(select_state(&bits, State::NotSet), State::Malf);
    }

    #[test]
    fn shutdown_requires_charger_disconnected_and_no_alarm() {
        let mut bits = ConditionBits::default();
        bits.shutdown_requested = true;
        bits.charger = ChargerState::Connected;
        assert_eq!(select_state(&bits, State::User), State::Actdead);

        bits.charger = ChargerState::Disconnected;
        assert_eq!(select_state(&bits, State::User), State::Shutdown);

        bits.alarm_set = true;
        assert_eq!(select_state(&bits, State::User), State::Actdead);
    }

    #[test]
    fn default_is_user() {
        let bits = ConditionBits::default();
        assert_eq!(select_state(&bits, State::NotSet), State::User);
    }

    #[test]
    fn local_maps_to_its_own_runlevel_not_actdead() {
        assert_eq!(state_to_runlevel(State::Local), Runlevel::Local);
        assert_ne!(state_to_runlevel(State::Local), Runlevel::Actdead);
    }

    #[test]
    fn unmapped_states_default_to_shutdown_runlevel() {
        assert_eq!(state_to_runlevel(State::NotSet), Runlevel::Shutdown);
        assert_eq!(state_to_runlevel(State::Boot), Runlevel::Shutdown);
    }
}
