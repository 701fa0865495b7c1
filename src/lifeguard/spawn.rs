//! Process spawn helper
//!
//! Wraps `tokio::process::Command` so the core only ever consumes a pid
//! plus an exit notification: fork/exec wrapped in a spawn service that
//! returns a pid and a future-like exit notification. Privilege drop
//! (uid/gid/nice) is applied via `pre_exec`, following
//! `std::os::unix::process::CommandExt`'s documented pattern, built on
//! the `nix`/`libc` crates already used elsewhere for process control.

use crate::bus::ExitReason;
use crate::error::{DsmeError, DsmeResult};
use std::os::unix::process::CommandExt;
use std::path::Path;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{instrument, warn};

/// Read a `/proc/<pid>/environ` snapshot (NUL-separated `KEY=VALUE`
/// entries) into a list of `(key, value)` pairs.
pub fn read_environ(pid: i32) -> DsmeResult<Vec<(String, String)>> {
    let path = format!("/proc/{pid}/environ");
    let raw = std::fs::read(Path::new(&path)).map_err(DsmeError::Persistence)?;
    Ok(raw
        .split(|b| *b == 0)
        .filter(|chunk| !chunk.is_empty())
        .filter_map(|chunk| {
            let s = String::from_utf8_lossy(chunk);
            s.split_once('=').map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect())
}

/// Spawn `command` (a full shell-invoked string, matching lifeguard's
/// legacy `/bin/sh -c` semantics) under the given uid/gid/nice, with
/// `env` applied on top of the caller's snapshot. Returns the child pid
/// immediately and a receiver fired with its [`ExitReason`] once it
/// exits.
#[instrument(skip(env))]
pub fn spawn_supervised(
    command: &str,
    uid: u32,
    gid: u32,
    nice: i32,
    env: &[(String, String)],
) -> DsmeResult<(i32, oneshot::Receiver<ExitReason>)> {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c").arg(command);
    cmd.env_clear();
    for (k, v) in env {
        cmd.env(k, v);
    }
    cmd.uid(uid);
    cmd.gid(gid);

    unsafe {
        cmd.pre_exec(move || {
            if nice != 0 {
                // Best-effort: a failed renice is not fatal to the spawn.
                let _ = libc::nice(nice);
            }
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|e| DsmeError::SpawnFailed {
        command: command.to_string(),
        errno: e.raw_os_error().unwrap_or(-1),
    })?;

    let pid = child.id().ok_or_else(|| DsmeError::SpawnFailed { command: command.to_string(), errno: -1 })? as i32;

    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => {
                let reason = classify_exit(status);
                let _ = tx.send(reason);
            }
            Err(e) => {
                warn!(error = %e, "failed to wait on supervised child");
                let _ = tx.send(ExitReason::Status(-1));
            }
        }
    });

    Ok((pid, rx))
}

fn classify_exit(status: std::process::ExitStatus) -> ExitReason {
    use std::os::unix::process::ExitStatusExt;
    if let Some(sig) = status.signal() {
        ExitReason::Signal(sig)
    } else if let Some(code) = status.code() {
        ExitReason::Return(code)
    } else {
        ExitReason::Status(-1)
    }
}

/// Send `signal` to `pid` while transiently running as `caller_uid`:
/// set euid to the caller's uid, send the signal, restore euid.
pub fn signal_as_uid(pid: i32, signal: i32, caller_uid: u32) -> DsmeResult<()> {
    use nix::unistd::{seteuid, Uid};
    let original = Uid::current();
    seteuid(Uid::from_raw(caller_uid)).map_err(|e| DsmeError::PermissionDenied(e.to_string()))?;
    let result = unsafe { libc::kill(pid, signal) };
    let _ = seteuid(original);
    if result == 0 {
        Ok(())
    } else {
        Err(DsmeError::PermissionDenied(format!("kill({pid}, {signal}) failed")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nul_separated_environ() {
        // Can't rely on /proc/<pid>/environ in a sandboxed test runner,
        // so exercise the splitting logic directly.
        let raw = b"FOO=bar\0BAZ=qux\0";
        let pairs: Vec<(String, String)> = raw
            .split(|b| *b == 0)
            .filter(|c| !c.is_empty())
            .filter_map(|c| {
                let s = String::from_utf8_lossy(c);
                s.split_once('=').map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect();
        assert_eq!(pairs, vec![("FOO".to_string(), "bar".to_string()), ("BAZ".to_string(), "qux".to_string())]);
    }
}
