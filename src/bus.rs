//! In-process typed publish/subscribe bus
//!
//! Every component talks to every other component only through
//! [`Message`]s posted here: every inbound/outbound signal the state
//! engine and its satellite components exchange.
//!
//! A broadcast sent from inside a handler must not be delivered
//! re-entrantly: `Bus::publish` only ever queues onto a
//! `tokio::sync::broadcast` channel, whose receivers drain on their own
//! task's next poll, so the current handler always returns before any
//! subscriber observes the message.

use crate::engine::{ChargerState, Runlevel, State, ThermalStatus};
use serde::Serialize;
use tokio::sync::broadcast;

/// Maximum buffered messages per subscriber before lagging drops occur.
const BUS_CAPACITY: usize = 1024;

/// Reason a supervised process exited.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitReason {
    Signal(i32),
    Return(i32),
    Status(i32),
}

/// Lifeguard notice kinds, published alongside `PROCESS_EXITED` handling.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LgNotice {
    ProcessRestart,
    ProcessFailed,
    Reset,
}

/// Every message type the core consumes or emits.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    // ---- condition-bit setters (inbound from adapters) ----
    SetCharger(ChargerState),
    SetAlarm { set: bool },
    SetThermal(ThermalStatus),
    SetEmergencyCall(bool),
    SetUsb { mounted: bool },
    SetBattery { percent: u8, is_charging: bool, valid: bool },
    BatteryReading { percent: u8, is_charging: bool, valid: bool },
    BatteryEmpty,

    // ---- lifecycle requests (inbound) ----
    ShutdownReq,
    PowerupReq,
    RebootReq,
    Telinit { name: String },
    StateQuery,
    DbusConnect,
    DbusDisconnect,
    RunlevelSwitchDone { runlevel: i32 },
    BaseBootDone,
    EnterMalf { reason: String },
    SetMalf(bool),
    ForceShutdown,

    // ---- state engine outputs ----
    StateChangeInd(State),
    SaveDataInd,
    ChangeRunlevel(State),
    Shutdown(Runlevel),
    StateReqDenied { state: String, reason: String },
    SetAlarmState { set: bool },
    AlarmQueryInd { external_alarm_set: bool },

    // ---- watchdog / heartbeat ----
    HwwdKick,
    Heartbeat,
    Wakeup,

    // ---- lifeguard ----
    ProcessStart {
        command: String,
        action: String,
        uid: u32,
        gid: u32,
        nice: i32,
        restart_limit: u32,
        restart_period_secs: u64,
        caller_uid: u32,
    },
    ProcessStop { command: String, signal: i32, caller_uid: u32 },
    ProcessExited { pid: i32, reason: ExitReason },
    ProcessStartStatus { pid: Option<i32>, status: i32 },
    ProcessStopStatus { killed: bool, info: String },
    StateChangeIndForLifeguard { is_shutdown_or_reboot: bool, caller_uid: u32 },
    LgNotice { command: String, notice: LgNotice },

    // ---- ambient ----
    LogLine { level: String, target: String, message: String },
}

/// Shared publish/subscribe bus. Cheap to clone (wraps a
/// `broadcast::Sender`), same ergonomics as `QemuSupervisor::subscribe`.
#[derive(Debug, Clone)]
pub struct Bus {
    tx: broadcast::Sender<Message>,
}

impl Bus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish a message to all current subscribers. Never blocks; a
    /// send with no receivers is not an error.
    pub fn publish(&self, message: Message) {
        let _ = self.tx.send(message);
    }

    /// Subscribe to the bus. Each subscriber gets its own lag-tolerant
    /// receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.tx.subscribe()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}
