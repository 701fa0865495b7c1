//! Scenario-driven coverage for the lifeguard process supervisor,
//! driving `Lifeguard`'s public API end to end with real short-lived
//! child processes rather than only the pure
//! `SupervisedProcess::record_exit` unit tests in `src/lifeguard/mod.rs`.

use dsmed::bus::{Bus, ExitReason, LgNotice, Message};
use dsmed::config::DsmeConfig;
use dsmed::lifeguard::Lifeguard;
use std::io::Write;

async fn wait_for_exit(rx: &mut tokio::sync::broadcast::Receiver<Message>, pid: i32) -> ExitReason {
    loop {
        match rx.recv().await.unwrap() {
            Message::ProcessExited { pid: p, reason } if p == pid => return reason,
            _ => continue,
        }
    }
}

#[test]
fn privileged_uid_allowlist_loads_from_file_and_always_includes_root() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "# allowlist").unwrap();
    writeln!(file, "1000").unwrap();
    writeln!(file).unwrap();
    writeln!(file, "2000").unwrap();

    let mut lg = Lifeguard::new();
    lg.load_privileged_uids(file.path());

    assert!(lg.is_privileged(0));
    assert!(lg.is_privileged(1000));
    assert!(lg.is_privileged(2000));
    assert!(!lg.is_privileged(3000));
}

#[test]
fn missing_allowlist_file_leaves_only_root_privileged() {
    let mut lg = Lifeguard::new();
    lg.load_privileged_uids(std::path::Path::new("/nonexistent/lifeguard_privileged_uids"));
    assert!(lg.is_privileged(0));
    assert!(!lg.is_privileged(1000));
}

#[tokio::test]
async fn privileged_respawn_budget_exhausted_escalates_to_reboot() {
    let cfg = DsmeConfig::default();
    let bus = Bus::new();
    let mut rx = bus.subscribe();
    let mut lg = Lifeguard::new();

    // restart_limit=1 so the second exit exhausts the budget: one
    // respawn, then RESET on the next exit -- the minimum budget that
    // still exercises escalation.
    lg.handle_process_start("exit 1", "RESPAWN", 0, 0, 0, 1, 60, 0, &bus, &cfg);

    let mut pid = match rx.recv().await.unwrap() {
        Message::ProcessStartStatus { pid: Some(pid), status: 0 } => pid,
        other => panic!("unexpected start status: {other:?}"),
    };

    // First exit: still within budget, respawned.
    let reason = wait_for_exit(&mut rx, pid).await;
    lg.handle_process_exited(pid, reason, &bus, &cfg);
    match rx.recv().await.unwrap() {
        Message::LgNotice { notice: LgNotice::ProcessRestart, .. } => {}
        other => panic!("expected ProcessRestart notice, got {other:?}"),
    }
    assert!(lg.find_by_command("exit 1").is_some());
    pid = lg.find_by_command("exit 1").unwrap().pid;

    // Second exit: budget exhausted, privileged caller escalates to reboot.
    let reason = wait_for_exit(&mut rx, pid).await;
    lg.handle_process_exited(pid, reason, &bus, &cfg);
    match rx.recv().await.unwrap() {
        Message::LgNotice { notice: LgNotice::Reset, .. } => {}
        other => panic!("expected Reset notice, got {other:?}"),
    }
    match rx.recv().await.unwrap() {
        Message::RebootReq => {}
        other => panic!("expected RebootReq, got {other:?}"),
    }
    assert!(lg.find_by_command("exit 1").is_none());
}

#[tokio::test]
async fn non_privileged_caller_is_dropped_without_reboot_on_respawn_fail() {
    let cfg = DsmeConfig::default();
    let bus = Bus::new();
    let mut rx = bus.subscribe();
    let mut lg = Lifeguard::new();

    // RESPAWN_FAIL never escalates to reboot regardless of privilege:
    // the very first exit already hits restart_limit=0.
    lg.handle_process_start("exit 1", "RESPAWN_FAIL", 1000, 1000, 0, 0, 60, 1000, &bus, &cfg);

    let pid = match rx.recv().await.unwrap() {
        Message::ProcessStartStatus { pid: Some(pid), status: 0 } => pid,
        other => panic!("unexpected start status: {other:?}"),
    };

    let reason = wait_for_exit(&mut rx, pid).await;
    lg.handle_process_exited(pid, reason, &bus, &cfg);
    match rx.recv().await.unwrap() {
        Message::LgNotice { notice: LgNotice::ProcessFailed, .. } => {}
        other => panic!("expected ProcessFailed notice, got {other:?}"),
    }
    assert!(lg.find_by_command("exit 1").is_none());
}

#[tokio::test]
async fn duplicate_command_start_is_rejected_with_eexist() {
    let cfg = DsmeConfig::default();
    let bus = Bus::new();
    let mut rx = bus.subscribe();
    let mut lg = Lifeguard::new();

    lg.handle_process_start("sleep 5", "ONCE", 0, 0, 0, 0, 60, 0, &bus, &cfg);
    match rx.recv().await.unwrap() {
        Message::ProcessStartStatus { pid: Some(_), status: 0 } => {}
        other => panic!("unexpected first start status: {other:?}"),
    }

    lg.handle_process_start("sleep 5", "ONCE", 0, 0, 0, 0, 60, 0, &bus, &cfg);
    match rx.recv().await.unwrap() {
        Message::ProcessStartStatus { pid: None, status } => assert_eq!(status, libc::EEXIST),
        other => panic!("unexpected duplicate start status: {other:?}"),
    }

    lg.handle_process_stop("sleep 5", libc::SIGTERM, 0, &bus);
    match rx.recv().await.unwrap() {
        Message::ProcessStopStatus { killed: true, .. } => {}
        other => panic!("unexpected stop status: {other:?}"),
    }
}

#[tokio::test]
async fn respawn_and_reset_outcomes_are_recorded_to_their_stats_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = DsmeConfig::default();
    cfg.lifeguard_stats_dir = dir.path().to_string_lossy().to_string();
    let bus = Bus::new();
    let mut rx = bus.subscribe();
    let mut lg = Lifeguard::new();

    // restart_limit=1: first exit respawns (restart_count bumped),
    // second exhausts the budget and resets (reset_count bumped).
    lg.handle_process_start("exit 1", "RESPAWN", 0, 0, 0, 1, 60, 0, &bus, &cfg);
    let mut pid = match rx.recv().await.unwrap() {
        Message::ProcessStartStatus { pid: Some(pid), status: 0 } => pid,
        other => panic!("unexpected start status: {other:?}"),
    };

    let reason = wait_for_exit(&mut rx, pid).await;
    lg.handle_process_exited(pid, reason, &bus, &cfg);
    let _ = rx.recv().await.unwrap(); // ProcessRestart notice
    pid = lg.find_by_command("exit 1").unwrap().pid;

    let reason = wait_for_exit(&mut rx, pid).await;
    lg.handle_process_exited(pid, reason, &bus, &cfg);
    let _ = rx.recv().await.unwrap(); // Reset notice
    let _ = rx.recv().await.unwrap(); // RebootReq

    let restart_stats = std::fs::read_to_string(dir.path().join("restart_count")).unwrap();
    assert!(restart_stats.contains("exit 1 : 1 *"));

    let reset_stats = std::fs::read_to_string(dir.path().join("reset_count")).unwrap();
    assert!(reset_stats.contains("exit 1 : 1 *"));
}

#[tokio::test]
async fn shutdown_state_change_freezes_every_action_to_once() {
    let cfg = DsmeConfig::default();
    let bus = Bus::new();
    let mut rx = bus.subscribe();
    let mut lg = Lifeguard::new();

    lg.handle_process_start("sleep 5", "RESPAWN", 0, 0, 0, 5, 60, 0, &bus, &cfg);
    let _ = rx.recv().await.unwrap();
    assert!(matches!(lg.find_by_command("sleep 5").unwrap().action, dsmed::lifeguard::Action::Respawn));

    lg.handle_state_change(true, 0);
    assert!(matches!(lg.find_by_command("sleep 5").unwrap().action, dsmed::lifeguard::Action::Once));

    lg.handle_process_stop("sleep 5", libc::SIGKILL, 0, &bus);
    let _ = rx.recv().await.unwrap();
}
