//! Daemon configuration
//!
//! Defaults hold every timeout this crate uses; each is overridable by
//! a `DSME_*` environment variable.

use serde::Serialize;
use utoipa::ToSchema;

/// Battery bucket threshold row, parsed from the five-line config file
/// format `min_level, polling_time[, wakeup]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, ToSchema)]
pub struct BucketThreshold {
    /// Minimum percent (inclusive) for this bucket.
    pub min_level: u8,
    /// IPHB polling interval while in this bucket, in seconds.
    pub polling_time_secs: u32,
    /// Whether IPHB should wake during suspend for this bucket.
    pub wakeup_during_suspend: bool,
}

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DsmeConfig {
    /// Shutdown grace period after a state publish (seconds).
    pub shutdown_grace_secs: u64,
    /// Charger disconnect debounce while in ACTDEAD (seconds).
    pub charger_disconnect_debounce_secs: u64,
    /// Overheat debounce (seconds).
    pub overheat_debounce_secs: u64,
    /// Battery-empty debounce (seconds).
    pub battery_empty_debounce_secs: u64,
    /// ACTDEAD<->USER minimum transition delay (seconds), used once
    /// init has signaled completion.
    pub user_actdead_min_secs: u64,
    /// ACTDEAD<->USER maximum transition delay (seconds), used before
    /// init has signaled completion.
    pub user_actdead_max_secs: u64,
    /// Alarm snooze window (seconds).
    pub alarm_snooze_secs: u64,
    /// Alarm-hold window while battery is empty in ACTDEAD (seconds).
    pub alarm_hold_secs: u64,
    /// Power-key long-press threshold before requesting shutdown (seconds).
    pub powerkey_longpress_secs: u64,
    /// MALF auto-shutdown delay outside R&D mode (seconds).
    pub malf_shutdown_secs: u64,
    /// Lifeguard reboot retry delay on telinit failure (seconds).
    pub lifeguard_reboot_retry_secs: u64,
    /// Runlevel executor retry delay on poweroff/reboot failure (seconds).
    pub runlevel_retry_secs: u64,
    /// Minimum battery percent below which ACTDEAD->USER is refused.
    pub min_battery_percent_for_user: u8,

    /// Watchdog kick period (seconds).
    pub watchdog_period_secs: u64,

    /// IPHB Unix-domain socket path.
    pub iphb_socket_path: String,
    /// Default IPHB sleep when no client is waiting (seconds).
    pub iphb_default_sleep_secs: u64,
    /// Misbehaving-window ratio threshold: warn if
    /// `mintime/(maxtime-mintime) < this` and `mintime > 0`.
    pub iphb_misbehaving_ratio: f64,

    /// Lifeguard Unix-domain socket path.
    pub lifeguard_socket_path: String,
    /// Path to the privileged-UID allowlist file.
    pub lifeguard_privileged_uids_path: String,
    /// Directory holding the restart/reset stats files.
    pub lifeguard_stats_dir: String,
    /// Stats file rotation threshold in bytes.
    pub lifeguard_stats_max_bytes: u64,
    /// Sentinel file that disables lifeguard-triggered reboots.
    pub lifeguard_no_reboot_sentinel: String,

    /// Alarm head persistence file.
    pub alarm_head_path: String,

    /// Battery bucket thresholds, descending by `min_level`.
    pub battery_buckets: Vec<BucketThreshold>,
    /// Default battery poll interval when data is stale (seconds).
    pub battery_default_poll_secs: (u32, u32),

    /// Whether the device is running in R&D mode (relaxes MALF policy).
    pub rnd_mode: bool,
    /// Whether reboot-on-lifeguard-reset is enabled at all.
    pub lifeguard_reboot_enabled: bool,
    /// Whether this build supports direct USER<->ACTDEAD transitions.
    pub direct_user_actdead: bool,
}

fn default_battery_buckets() -> Vec<BucketThreshold> {
    vec![
        BucketThreshold { min_level: 80, polling_time_secs: 60, wakeup_during_suspend: false },
        BucketThreshold { min_level: 20, polling_time_secs: 30, wakeup_during_suspend: false },
        BucketThreshold { min_level: 10, polling_time_secs: 20, wakeup_during_suspend: true },
        BucketThreshold { min_level: 3, polling_time_secs: 10, wakeup_during_suspend: true },
        BucketThreshold { min_level: 0, polling_time_secs: 10, wakeup_during_suspend: true },
    ]
}

impl Default for DsmeConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_secs: 2,
            charger_disconnect_debounce_secs: 15,
            overheat_debounce_secs: 8,
            battery_empty_debounce_secs: 8,
            user_actdead_min_secs: 2,
            user_actdead_max_secs: 45,
            alarm_snooze_secs: 120,
            alarm_hold_secs: 60,
            powerkey_longpress_secs: 5,
            malf_shutdown_secs: 120,
            lifeguard_reboot_retry_secs: 2,
            runlevel_retry_secs: 3,
            min_battery_percent_for_user: 3,

            watchdog_period_secs: 10,

            iphb_socket_path: "/var/run/dsme/iphb".to_string(),
            iphb_default_sleep_secs: 3600,
            iphb_misbehaving_ratio: 5.0,

            lifeguard_socket_path: "/var/run/dsme/lifeguard".to_string(),
            lifeguard_privileged_uids_path: "/etc/dsme/lifeguard_privileged_uids".to_string(),
            lifeguard_stats_dir: "/var/lib/dsme".to_string(),
            lifeguard_stats_max_bytes: 1024,
            lifeguard_no_reboot_sentinel: "/etc/no_lg_reboots".to_string(),

            alarm_head_path: "/var/lib/dsme/alarm_queue_head".to_string(),

            battery_buckets: default_battery_buckets(),
            battery_default_poll_secs: (30, 60),

            rnd_mode: false,
            lifeguard_reboot_enabled: true,
            direct_user_actdead: true,
        }
    }
}

impl DsmeConfig {
    /// Build configuration from environment variables, falling back to
    /// [`Default`] for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        macro_rules! env_secs {
            ($var:literal, $field:ident) => {
                if let Ok(v) = std::env::var($var) {
                    if let Ok(parsed) = v.parse() {
                        config.$field = parsed;
                    }
                }
            };
        }

        env_secs!("DSME_SHUTDOWN_GRACE_SECS", shutdown_grace_secs);
        env_secs!("DSME_CHARGER_DISCONNECT_DEBOUNCE_SECS", charger_disconnect_debounce_secs);
        env_secs!("DSME_OVERHEAT_DEBOUNCE_SECS", overheat_debounce_secs);
        env_secs!("DSME_BATTERY_EMPTY_DEBOUNCE_SECS", battery_empty_debounce_secs);
        env_secs!("DSME_USER_ACTDEAD_MIN_SECS", user_actdead_min_secs);
        env_secs!("DSME_USER_ACTDEAD_MAX_SECS", user_actdead_max_secs);
        env_secs!("DSME_ALARM_SNOOZE_SECS", alarm_snooze_secs);
        env_secs!("DSME_ALARM_HOLD_SECS", alarm_hold_secs);
        env_secs!("DSME_POWERKEY_LONGPRESS_SECS", powerkey_longpress_secs);
        env_secs!("DSME_MALF_SHUTDOWN_SECS", malf_shutdown_secs);
        env_secs!("DSME_LIFEGUARD_REBOOT_RETRY_SECS", lifeguard_reboot_retry_secs);
        env_secs!("DSME_RUNLEVEL_RETRY_SECS", runlevel_retry_secs);
        env_secs!("DSME_MIN_BATTERY_PERCENT_FOR_USER", min_battery_percent_for_user);
        env_secs!("DSME_WATCHDOG_PERIOD_SECS", watchdog_period_secs);
        env_secs!("DSME_IPHB_DEFAULT_SLEEP_SECS", iphb_default_sleep_secs);

        if let Ok(path) = std::env::var("DSME_IPHB_SOCKET_PATH") {
            config.iphb_socket_path = path;
        }
        if let Ok(path) = std::env::var("DSME_LIFEGUARD_SOCKET_PATH") {
            config.lifeguard_socket_path = path;
        }
        if let Ok(v) = std::env::var("DSME_RND_MODE") {
            config.rnd_mode = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("DSME_LIFEGUARD_REBOOT_ENABLED") {
            config.lifeguard_reboot_enabled = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        if let Ok(v) = std::env::var("DSME_DIRECT_USER_ACTDEAD") {
            config.direct_user_actdead = v != "0" && !v.eq_ignore_ascii_case("false");
        }

        config
    }
}
