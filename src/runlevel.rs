//! Runlevel executor: translates `CHANGE_RUNLEVEL`/
//! `SHUTDOWN` into an OS action via a systemd/telinit/fallback cascade.

use crate::config::DsmeConfig;
use crate::engine::Runlevel;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{instrument, warn};

const SYSTEMCTL_PATHS: &[&str] = &["/usr/bin/systemctl", "/bin/systemctl"];
const TELINIT_PATHS: &[&str] = &["/sbin/telinit", "/usr/sbin/telinit"];

fn find_binary(candidates: &[&str]) -> Option<&'static str> {
    candidates.iter().find(|p| Path::new(p).exists()).copied()
}

/// Executes a runlevel/shutdown action, trying systemd first, then
/// telinit, then a raw remount+exec fallback. Each
/// branch's retry windows are the only blocking sleeps permitted by
/// 
pub struct RunlevelExecutor;

impl RunlevelExecutor {
    #[instrument(skip(cfg))]
    pub async fn execute(runlevel: Runlevel, cfg: &DsmeConfig) -> bool {
        if let Some(systemctl) = find_binary(SYSTEMCTL_PATHS) {
            if runlevel != Runlevel::Malf {
                let action = systemd_action(runlevel);
                if run_and_check(systemctl, &["--no-block", action]).await {
                    return true;
                }
                warn!(action, "systemctl invocation failed, falling back");
            }
        }

        if let Some(telinit) = find_binary(TELINIT_PATHS) {
            let n = runlevel.code().to_string();
            if run_and_check(telinit, &[&n]).await {
                return true;
            }
            tokio::time::sleep(Duration::from_secs(cfg.lifeguard_reboot_retry_secs)).await;
            if run_and_check(telinit, &[&n]).await {
                return true;
            }
            warn!(runlevel = %n, "telinit failed twice, falling back");
        }

        Self::fallback(runlevel, cfg).await
    }

    async fn fallback(runlevel: Runlevel, cfg: &DsmeConfig) -> bool {
        let _ = run_and_check("/bin/sync", &[]).await;
        remount_mmc_readonly().await;

        let bin = match runlevel {
            Runlevel::Reboot => "/sbin/reboot",
            _ => "/sbin/poweroff",
        };

        if run_and_check(bin, &[]).await {
            return true;
        }
        tokio::time::sleep(Duration::from_secs(cfg.runlevel_retry_secs)).await;
        if run_and_check(bin, &[]).await {
            return true;
        }
        warn!(bin, "fallback shutdown/reboot failed after retry, exiting non-zero");
        false
    }
}

fn systemd_action(runlevel: Runlevel) -> &'static str {
    if runlevel == Runlevel::Reboot {
        "reboot"
    } else {
        "poweroff"
    }
}

async fn run_and_check(bin: &str, args: &[&str]) -> bool {
    Command::new(bin).args(args).status().await.map(|s| s.success()).unwrap_or(false)
}

/// Parse `/proc/mounts` for `mmcblk*` mounts and remount each read-only
///.
async fn remount_mmc_readonly() {
    let Ok(mounts) = tokio::fs::read_to_string("/proc/mounts").await else {
        return;
    };
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let Some(device) = fields.next() else { continue };
        let Some(mountpoint) = fields.next() else { continue };
        if device.contains("mmcblk") {
            let _ = run_and_check("/bin/mount", &["-o", "remount,ro", mountpoint]).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn systemd_action_picks_reboot_or_poweroff() {
        assert_eq!(systemd_action(Runlevel::Reboot), "reboot");
        assert_eq!(systemd_action(Runlevel::Shutdown), "poweroff");
        assert_eq!(systemd_action(Runlevel::Actdead), "poweroff");
    }

    #[test]
    fn find_binary_returns_none_when_absent() {
        assert!(find_binary(&["/definitely/not/a/real/path"]).is_none());
    }
}
