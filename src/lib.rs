//! Device state manager daemon library.
//!
//! Exposes the modules needed by the binary entrypoints and by the
//! integration test suite.

pub mod alarm;
pub mod api;
pub mod battery;
pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod iphb;
pub mod lifeguard;
pub mod malf;
pub mod powerkey;
pub mod runlevel;
pub mod timer;
pub mod tracing_layer;
pub mod watchdog;

use bus::{Bus, Message};
use config::DsmeConfig;
use engine::{state_to_runlevel, StateEngine, StateSnapshot};
use runlevel::RunlevelExecutor;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use timer::TimerEngine;
use tokio::sync::watch;
use tracing::{info, warn};

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Everything the core event loop owns exclusively. No field here is
/// ever shared with another task; cross-task communication happens
/// only through the [`Bus`] and the `watch` snapshot channel -- the
/// same single-owner discipline applied to every condition tracker the
/// device cares about.
struct Core {
    engine: StateEngine,
    timers: TimerEngine,
    alarm: alarm::AlarmTracker,
    battery: battery::BatteryTracker,
    watchdog: watchdog::WatchdogKicker,
    powerkey: powerkey::PowerKeyMonitor,
    lifeguard: lifeguard::Lifeguard,
}

/// Run the daemon's core event loop: the state engine, timer engine and
/// satellite trackers (alarm, battery, watchdog, powerkey, lifeguard)
/// all live on this single task, consuming [`Message`]s off the bus and
/// publishing their own in response.
pub async fn run_core(
    cfg: Arc<DsmeConfig>,
    bus: Bus,
    bootstate: String,
    snapshot_tx: watch::Sender<StateSnapshot>,
) {
    let mut core = Core {
        engine: StateEngine::new(),
        timers: TimerEngine::new(),
        alarm: alarm::AlarmTracker::new(cfg.alarm_head_path.clone()),
        battery: battery::BatteryTracker::new(),
        watchdog: watchdog::WatchdogKicker::new(Box::new(watchdog::NullWatchdogDevice::default())),
        powerkey: powerkey::PowerKeyMonitor::new(),
        lifeguard: lifeguard::Lifeguard::new(),
    };

    core.alarm.load();
    core.lifeguard.load_privileged_uids(std::path::Path::new(&cfg.lifeguard_privileged_uids_path));
    core.engine.start(&bootstate, &mut core.timers, &bus, &cfg);
    core.watchdog.start(&mut core.timers, &cfg);
    let _ = snapshot_tx.send(core.engine.snapshot());

    let mut rx = bus.subscribe();

    let (edge_tx, mut edge_rx) = tokio::sync::mpsc::channel::<powerkey::PowerKeyEdge>(16);
    tokio::spawn(async move {
        let mut monitor = powerkey::PowerKeyMonitor::new();
        let source = powerkey::EvdevPowerKeySource::discover();
        monitor.run(source, edge_tx).await;
    });

    loop {
        let sleep_until = core
            .timers
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            _ = tokio::time::sleep_until(sleep_until.into()) => {
                let fired = core.timers.run_expired(Instant::now());
                for f in fired {
                    dispatch_timer(&mut core, f.kind, &bus, &cfg);
                }
                let _ = snapshot_tx.send(core.engine.snapshot());
            }

            received = rx.recv() => {
                match received {
                    Ok(msg) => {
                        dispatch_message(&mut core, &msg, &bus, &cfg);
                        let _ = snapshot_tx.send(core.engine.snapshot());
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "core event loop lagged behind the bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        info!("bus closed, stopping core event loop");
                        break;
                    }
                }
            }

            edge = edge_rx.recv() => {
                match edge {
                    Some(powerkey::PowerKeyEdge::Pressed) => core.powerkey.handle_press(&mut core.timers, &cfg),
                    Some(powerkey::PowerKeyEdge::Released) => core.powerkey.handle_release(&mut core.timers),
                    None => {}
                }
            }
        }
    }
}

fn dispatch_message(core: &mut Core, msg: &Message, bus: &Bus, cfg: &Arc<DsmeConfig>) {
    match msg {
        Message::Shutdown(runlevel) => {
            let runlevel = *runlevel;
            let cfg = Arc::clone(cfg);
            tokio::spawn(async move {
                RunlevelExecutor::execute(runlevel, &cfg).await;
            });
        }
        Message::ChangeRunlevel(state) => {
            let runlevel = state_to_runlevel(*state);
            let cfg = Arc::clone(cfg);
            let bus = bus.clone();
            tokio::spawn(async move {
                if RunlevelExecutor::execute(runlevel, &cfg).await {
                    bus.publish(Message::RunlevelSwitchDone { runlevel: runlevel.code() });
                }
            });
        }
        Message::SetAlarm { set } => {
            // Raw D-Bus "next alarm" notification: a real head
            // timestamp should arrive via a richer payload from the
            // adapter; here we derive a one-second-out head as the
            // nearest faithful translation of a boolean signal.
            let head = if *set { now_unix() + 1 } else { 0 };
            core.alarm.set_head(head, &mut core.timers, bus, now_unix());
        }
        Message::BatteryReading { percent, is_charging, valid } => {
            let alarm_active = core.alarm.internal_alarm_set();
            core.battery.handle_reading(
                *percent,
                *is_charging,
                *valid,
                core.engine.current(),
                alarm_active,
                &mut core.timers,
                bus,
                cfg,
            );
        }
        Message::BatteryEmpty => {
            core.battery.handle_alarm_cleared(&mut core.timers, bus);
        }
        Message::ProcessStart { command, action, uid, gid, nice, restart_limit, restart_period_secs, caller_uid } => {
            core.lifeguard.handle_process_start(
                command,
                action,
                *uid,
                *gid,
                *nice,
                *restart_limit,
                *restart_period_secs,
                *caller_uid,
                bus,
                cfg,
            );
        }
        Message::ProcessStop { command, signal, caller_uid } => {
            core.lifeguard.handle_process_stop(command, *signal, *caller_uid, bus);
        }
        Message::ProcessExited { pid, reason } => {
            core.lifeguard.handle_process_exited(*pid, reason.clone(), bus, cfg);
        }
        Message::HwwdKick => {
            core.watchdog.handle_hwwd_kick(&mut core.timers, bus, cfg);
        }
        Message::StateQuery => {
            bus.publish(Message::AlarmQueryInd { external_alarm_set: core.alarm.external_alarm_set() });
        }
        Message::EnterMalf { reason } => {
            let reason = reason.clone();
            let bus = bus.clone();
            tokio::spawn(async move {
                malf::handle_enter_malf(&reason, &bus).await;
            });
        }
        _ => {}
    }

    if let Err(e) = core.engine.handle_message(msg, &mut core.timers, bus, cfg) {
        warn!(error = %e, "core engine rejected message");
    }

    if matches!(msg, Message::StateChangeInd(engine::State::Shutdown) | Message::StateChangeInd(engine::State::Reboot)) {
        core.lifeguard.handle_state_change(true, 0);
    }
}

fn dispatch_timer(core: &mut Core, kind: timer::TimerKind, bus: &Bus, cfg: &Arc<DsmeConfig>) {
    use timer::TimerKind::*;

    match kind {
        AlarmSnooze => {
            core.alarm.handle_timer(kind, &mut core.timers, bus, now_unix());
        }
        AlarmHold => {
            core.battery.handle_timer(kind, bus);
        }
        PowerkeyLongpress => {
            core.powerkey.handle_timer(kind, bus);
        }
        WatchdogKick => {
            core.watchdog.handle_timer(kind, &mut core.timers, bus, cfg);
        }
        _ => {
            core.engine.handle_timer(kind, &mut core.timers, bus, cfg);
        }
    }
}
