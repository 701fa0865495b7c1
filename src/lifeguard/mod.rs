//! Lifeguard process supervisor

pub mod proto;
pub mod socket;
pub mod spawn;
pub mod stats;

use crate::bus::{Bus, ExitReason, LgNotice, Message};
use crate::config::DsmeConfig;
use std::collections::HashSet;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, instrument, warn};

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Once,
    Respawn,
    RespawnFail,
    Reset,
}

impl Action {
    fn parse(s: &str) -> Action {
        match s {
            "RESPAWN" => Action::Respawn,
            "RESPAWN_FAIL" => Action::RespawnFail,
            "RESET" => Action::Reset,
            _ => Action::Once,
        }
    }
}

/// A supervised process.
#[derive(Debug, Clone)]
pub struct SupervisedProcess {
    pub command: String,
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
    pub nice: i32,
    pub action: Action,
    pub restart_limit: u32,
    pub restart_period_secs: u64,
    pub first_restart_time: u64,
    pub restart_count: u32,
    pub caller_uid: u32,
}

/// Outcome of [`SupervisedProcess::record_exit`]: a pure, `now`-
/// parameterized decision, using fixed-window (not sliding) restart-
/// count semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartOutcome {
    Remove,
    Respawn { notice: LgNotice },
    RemoveAndReboot { notice: LgNotice },
    RemoveAfterFailure { notice: LgNotice },
}

impl SupervisedProcess {
 /// Apply PROCESS_EXITED policy. Privileged callers
    /// get the REBOOT_REQ escalation on budget exhaustion / RESET;
    /// non-privileged callers are simply dropped with PROCESS_FAILED.
    pub fn record_exit(&mut self, now: u64, caller_is_privileged: bool) -> RestartOutcome {
        match self.action {
            Action::Once => RestartOutcome::Remove,
            Action::Respawn | Action::RespawnFail => {
                let within_window = self.restart_count > 0 && self.first_restart_time + self.restart_period_secs >= now;
                if !within_window {
                    self.first_restart_time = now;
                    self.restart_count = 0;
                }

                if self.restart_count >= self.restart_limit {
                    if self.action == Action::Respawn && caller_is_privileged {
                        RestartOutcome::RemoveAndReboot { notice: LgNotice::Reset }
                    } else {
                        RestartOutcome::RemoveAfterFailure { notice: LgNotice::ProcessFailed }
                    }
                } else {
                    self.restart_count += 1;
                    RestartOutcome::Respawn { notice: LgNotice::ProcessRestart }
                }
            }
            Action::Reset => {
                if caller_is_privileged {
                    RestartOutcome::RemoveAndReboot { notice: LgNotice::Reset }
                } else {
                    RestartOutcome::RemoveAfterFailure { notice: LgNotice::ProcessFailed }
                }
            }
        }
    }
}

/// Supervisor state: linear collection of supervised processes plus the
/// privileged-uid allowlist. Owned exclusively by the
/// event loop -- no locking.
pub struct Lifeguard {
    processes: Vec<SupervisedProcess>,
    privileged_uids: HashSet<u32>,
}

impl Lifeguard {
    pub fn new() -> Self {
        Self { processes: Vec::new(), privileged_uids: HashSet::new() }
    }

 /// Load the privileged-UID allowlist. "treat
    /// mandatory-list files as optional (if absent, any security
    /// violation triggers MALF; if present, only listed files trigger
    /// MALF)" -- an absent file here just means an empty allowlist,
    /// logged at WARNING rather than treated as fatal.
    pub fn load_privileged_uids(&mut self, path: &Path) {
        let Ok(content) = std::fs::read_to_string(path) else {
            warn!(path = %path.display(), "privileged uid list absent, treating as empty");
            return;
        };
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Ok(uid) = line.parse::<u32>() {
                self.privileged_uids.insert(uid);
            }
        }
    }

    pub fn is_privileged(&self, uid: u32) -> bool {
        uid == 0 || self.privileged_uids.contains(&uid)
    }

    pub fn find_by_command(&self, command: &str) -> Option<&SupervisedProcess> {
        self.processes.iter().find(|p| p.command == command)
    }

    /// Bump the `COMMAND : N *` entry in `<stats_dir>/<file>`, logging
    /// (not propagating) any IO failure -- a stats write never blocks
    /// the restart/reset decision it's recording.
    fn record_stats(&self, file: &str, command: &str, cfg: &DsmeConfig) {
        let path = Path::new(&cfg.lifeguard_stats_dir).join(file);
        if let Err(e) = stats::record_event(&path, command, cfg.lifeguard_stats_max_bytes) {
            warn!(error = %e, command, file, "failed to record lifeguard stats");
        }
    }

    #[instrument(skip(self, bus, cfg))]
    #[allow(clippy::too_many_arguments)]
    pub fn handle_process_start(
        &mut self,
        command: &str,
        action: &str,
        uid: u32,
        gid: u32,
        nice: i32,
        restart_limit: u32,
        restart_period_secs: u64,
        caller_uid: u32,
        bus: &Bus,
        cfg: &DsmeConfig,
    ) {
        if self.find_by_command(command).is_some() {
            bus.publish(Message::ProcessStartStatus { pid: None, status: libc::EEXIST });
            return;
        }

        let mut requested_action = Action::parse(action);
        if requested_action == Action::Reset && !self.is_privileged(caller_uid) {
            bus.publish(Message::ProcessStartStatus { pid: None, status: libc::EPERM });
            return;
        }
 // Non-root callers can only downgrade privileges.
        let (uid, gid) = if caller_uid != 0 { (caller_uid.max(uid), gid) } else { (uid, gid) };
        if requested_action == Action::Reset && !self.is_privileged(uid) {
            requested_action = Action::RespawnFail;
        }

        let env = spawn::read_environ(std::process::id() as i32).unwrap_or_default();
        match spawn::spawn_supervised(command, uid, gid, nice, &env) {
            Ok((pid, exit_rx)) => {
                self.processes.push(SupervisedProcess {
                    command: command.to_string(),
                    pid,
                    uid,
                    gid,
                    nice,
                    action: requested_action,
                    restart_limit,
                    restart_period_secs,
                    first_restart_time: now_secs(),
                    restart_count: 0,
                    caller_uid,
                });
                bus.publish(Message::ProcessStartStatus { pid: Some(pid), status: 0 });

                let bus2 = bus.clone();
                let command_owned = command.to_string();
                tokio::spawn(async move {
                    if let Ok(reason) = exit_rx.await {
                        bus2.publish(Message::ProcessExited { pid, reason });
                        let _ = command_owned;
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, command, "spawn failed");
                bus.publish(Message::ProcessStartStatus { pid: None, status: -1 });
            }
        }
        let _ = cfg;
    }

    #[instrument(skip(self, bus))]
    pub fn handle_process_stop(&mut self, command: &str, signal: i32, caller_uid: u32, bus: &Bus) {
        let mut killed = false;
        for p in self.processes.iter_mut().filter(|p| p.command == command) {
            match spawn::signal_as_uid(p.pid, signal, caller_uid) {
                Ok(()) => {
                    p.action = Action::Once;
                    killed = true;
                }
                Err(e) => {
                    bus.publish(Message::ProcessStopStatus { killed: false, info: e.to_string() });
                    return;
                }
            }
        }
        bus.publish(Message::ProcessStopStatus { killed, info: String::new() });
    }

    #[instrument(skip(self, bus, cfg))]
    pub fn handle_process_exited(&mut self, pid: i32, reason: ExitReason, bus: &Bus, cfg: &DsmeConfig) {
        let Some(idx) = self.processes.iter().position(|p| p.pid == pid) else {
            return;
        };
        let caller_uid = self.processes[idx].caller_uid;
        let privileged = self.is_privileged(caller_uid);
        let command = self.processes[idx].command.clone();
        let outcome = self.processes[idx].record_exit(now_secs(), privileged);

        match outcome {
            RestartOutcome::Remove => {
                self.processes.remove(idx);
            }
            RestartOutcome::Respawn { notice } => {
                self.record_stats("restart_count", &command, cfg);
                bus.publish(Message::LgNotice { command: command.clone(), notice });
                let env = spawn::read_environ(std::process::id() as i32).unwrap_or_default();
                let process = self.processes[idx].clone();
                match spawn::spawn_supervised(&process.command, process.uid, process.gid, process.nice, &env) {
                    Ok((new_pid, exit_rx)) => {
                        self.processes[idx].pid = new_pid;
                        let bus2 = bus.clone();
                        tokio::spawn(async move {
                            if let Ok(r) = exit_rx.await {
                                bus2.publish(Message::ProcessExited { pid: new_pid, reason: r });
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, command, "respawn failed");
                        self.processes.remove(idx);
                    }
                }
            }
            RestartOutcome::RemoveAndReboot { notice } => {
                self.processes.remove(idx);
                self.record_stats("reset_count", &command, cfg);
                bus.publish(Message::LgNotice { command: command.clone(), notice });
                if cfg.lifeguard_reboot_enabled && !Path::new(&cfg.lifeguard_no_reboot_sentinel).exists() {
                    bus.publish(Message::RebootReq);
                }
            }
            RestartOutcome::RemoveAfterFailure { notice } => {
                self.processes.remove(idx);
                self.record_stats("reset_count", &command, cfg);
                bus.publish(Message::LgNotice { command, notice });
            }
        }
    }

    /// STATE_CHANGE_IND(SHUTDOWN|REBOOT): freeze every action to ONCE so
 /// nothing is respawned during shutdown (; sender must
    /// be uid=0).
    pub fn handle_state_change(&mut self, is_shutdown_or_reboot: bool, caller_uid: u32) {
        if is_shutdown_or_reboot && caller_uid == 0 {
            for p in self.processes.iter_mut() {
                p.action = Action::Once;
            }
            info!("lifeguard froze all processes to ONCE for shutdown");
        }
    }
}

impl Default for Lifeguard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process(limit: u32, period: u64) -> SupervisedProcess {
        SupervisedProcess {
            command: "watchme".to_string(),
            pid: 123,
            uid: 0,
            gid: 0,
            nice: 0,
            action: Action::Respawn,
            restart_limit: limit,
            restart_period_secs: period,
            first_restart_time: 0,
            restart_count: 0,
            caller_uid: 0,
        }
    }

    #[test]
    fn rate_limit_scenario_privileged_reboots_on_fourth_exit() {
        // Scenario 6: restart_limit=3, restart_period=10, four exits
        // within 10s from a privileged uid -> three restarts then RESET.
        let mut p = process(3, 10);
        assert_eq!(p.record_exit(1, true), RestartOutcome::Respawn { notice: LgNotice::ProcessRestart });
        assert_eq!(p.record_exit(2, true), RestartOutcome::Respawn { notice: LgNotice::ProcessRestart });
        assert_eq!(p.record_exit(3, true), RestartOutcome::Respawn { notice: LgNotice::ProcessRestart });
        assert_eq!(p.record_exit(4, true), RestartOutcome::RemoveAndReboot { notice: LgNotice::Reset });
    }

    #[test]
    fn rate_limit_scenario_non_privileged_drops_without_reboot() {
        let mut p = process(3, 10);
        p.record_exit(1, false);
        p.record_exit(2, false);
        p.record_exit(3, false);
        assert_eq!(p.record_exit(4, false), RestartOutcome::RemoveAfterFailure { notice: LgNotice::ProcessFailed });
    }

    #[test]
    fn window_resets_after_restart_period_elapses() {
        let mut p = process(2, 5);
        p.record_exit(0, true);
        // second exit well after the window: counter resets rather than accumulating
        let outcome = p.record_exit(100, true);
        assert_eq!(outcome, RestartOutcome::Respawn { notice: LgNotice::ProcessRestart });
    }

    #[test]
    fn reset_action_privileged_reboots_immediately() {
        let mut p = process(99, 10);
        p.action = Action::Reset;
        assert_eq!(p.record_exit(1, true), RestartOutcome::RemoveAndReboot { notice: LgNotice::Reset });
    }

    #[test]
    fn once_action_is_removed_without_respawn() {
        let mut p = process(99, 10);
        p.action = Action::Once;
        assert_eq!(p.record_exit(1, true), RestartOutcome::Remove);
    }

    #[test]
    fn privileged_uid_list_includes_root_implicitly() {
        let lg = Lifeguard::new();
        assert!(lg.is_privileged(0));
        assert!(!lg.is_privileged(1000));
    }
}
