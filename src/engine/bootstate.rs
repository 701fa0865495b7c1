//! `BOOTSTATE` environment string parsing

use super::bits::ConditionBits;

/// Parsed MALF reason, grounded on the "reason component details" triple
/// says a MALF bootstate carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalfInfo {
    pub reason: String,
    pub component: String,
    pub details: String,
}

impl MalfInfo {
    fn synthesized_unknown() -> Self {
        Self {
            reason: "SOFTWARE".to_string(),
            component: "bootloader".to_string(),
            details: "unknown bootreason".to_string(),
        }
    }

    /// Parse the space-separated "reason component details" triple that
    /// follows a "MALF" bootstate token. Missing trailing fields are left
    /// empty rather than rejected -- the boot environment is not always
    /// complete.
    fn parse_trailer(trailer: &str) -> Self {
        let mut parts = trailer.trim().splitn(3, ' ');
        let reason = parts.next().unwrap_or("").to_string();
        let component = parts.next().unwrap_or("").to_string();
        let details = parts.next().unwrap_or("").to_string();
        if reason.is_empty() {
            Self::synthesized_unknown()
        } else {
            Self { reason, component, details }
        }
    }
}

/// Result of parsing `BOOTSTATE`: the condition bits it seeds, plus a
/// MALF reason if the bootstate implies entering MALF.
#[derive(Debug, Clone, Default)]
pub struct ParsedBootstate {
    pub bits: ConditionBits,
    pub malf_info: Option<MalfInfo>,
}

/// Parse the `BOOTSTATE` environment string. Missing
/// value defaults to "USER", which callers handle by
/// passing `"USER"` explicitly rather than this function guessing an
/// absent variable. A `"USER"` bootstate carrying a trailing MALF
/// reason (e.g. `"USER MALF SOFTWARE ..."`) still triggers MALF unless
/// `rnd_mode` is set, in which case the trailer is ignored.
pub fn parse_bootstate(raw: &str, rnd_mode: bool) -> ParsedBootstate {
    let mut bits = ConditionBits::default();
    let upper = raw.trim();

    if upper == "SHUTDOWN" {
        bits.charger = super::bits::ChargerState::Disconnected;
        bits.shutdown_requested = true;
        return ParsedBootstate { bits, malf_info: None };
    }

    if let Some(rest) = upper.strip_prefix("USER") {
        if let Some(trailer) = rest.trim_start().strip_prefix("MALF") {
            if rnd_mode {
                return ParsedBootstate { bits, malf_info: None };
            }
            bits.malf = true;
            let info = MalfInfo::parse_trailer(trailer);
            return ParsedBootstate { bits, malf_info: Some(info) };
        }
        return ParsedBootstate { bits, malf_info: None };
    }

    if upper.starts_with("ACT_DEAD") {
        bits.shutdown_requested = true;
        return ParsedBootstate { bits, malf_info: None };
    }

    if upper == "BOOT" {
        bits.reboot_requested = true;
        return ParsedBootstate { bits, malf_info: None };
    }

    if upper == "LOCAL" || upper == "TEST" || upper == "FLASH" {
        bits.test = true;
        return ParsedBootstate { bits, malf_info: None };
    }

    if let Some(trailer) = upper.strip_prefix("MALF") {
        bits.malf = true;
        let info = MalfInfo::parse_trailer(trailer);
        return ParsedBootstate { bits, malf_info: Some(info) };
    }

    bits.malf = true;
    ParsedBootstate { bits, malf_info: Some(MalfInfo::synthesized_unknown()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::bits::ChargerState;

    #[test]
    fn shutdown_bootstate_sets_charger_and_shutdown_request() {
        let parsed = parse_bootstate("SHUTDOWN", false);
        assert_eq!(parsed.bits.charger, ChargerState::Disconnected);
        assert!(parsed.bits.shutdown_requested);
        assert!(parsed.malf_info.is_none());
    }

    #[test]
    fn user_variants_are_noop() {
        let parsed = parse_bootstate("USER", false);
        assert!(!parsed.bits.shutdown_requested);
        assert!(!parsed.bits.malf);

        let parsed2 = parse_bootstate("USER_FOO", false);
        assert!(!parsed2.bits.malf);
    }

    #[test]
    fn user_bootstate_with_trailing_malf_info_still_triggers_malf() {
        let parsed = parse_bootstate("USER MALF HARDWARE emmc \"bad sector\"", false);
        assert!(parsed.bits.malf);
        let info = parsed.malf_info.unwrap();
        assert_eq!(info.reason, "HARDWARE");
        assert_eq!(info.component, "emmc");
    }

    #[test]
    fn user_bootstate_with_trailing_malf_info_is_ignored_in_rnd_mode() {
        let parsed = parse_bootstate("USER MALF HARDWARE emmc \"bad sector\"", true);
        assert!(!parsed.bits.malf);
        assert!(parsed.malf_info.is_none());
    }

    #[test]
    fn act_dead_sets_shutdown_requested() {
        let parsed = parse_bootstate("ACT_DEAD", false);
        assert!(parsed.bits.shutdown_requested);

        let parsed2 = parse_bootstate("ACT_DEAD_CHARGER", false);
        assert!(parsed2.bits.shutdown_requested);
    }

    #[test]
    fn boot_sets_reboot_requested() {
        let parsed = parse_bootstate("BOOT", false);
        assert!(parsed.bits.reboot_requested);
    }

    #[test]
    fn local_test_flash_set_test_bit() {
        for s in ["LOCAL", "TEST", "FLASH"] {
            let parsed = parse_bootstate(s, false);
            assert!(parsed.bits.test, "{s} should set test bit");
        }
    }

    #[test]
    fn malf_trailer_is_parsed() {
        let parsed = parse_bootstate("MALF HARDWARE emmc \"bad sector\"", false);
        assert!(parsed.bits.malf);
        let info = parsed.malf_info.unwrap();
        assert_eq!(info.reason, "HARDWARE");
        assert_eq!(info.component, "emmc");
    }

    #[test]
    fn malf_with_no_trailer_synthesizes_unknown() {
        let parsed = parse_bootstate("MALF", false);
        let info = parsed.malf_info.unwrap();
        assert_eq!(info.reason, "SOFTWARE");
        assert_eq!(info.component, "bootloader");
        assert_eq!(info.details, "unknown bootreason");
    }

    #[test]
    fn unknown_bootstate_synthesizes_malf() {
        let parsed = parse_bootstate("garbage-value", false);
        assert!(parsed.bits.malf);
        let info = parsed.malf_info.unwrap();
        assert_eq!(info.reason, "SOFTWARE");
        assert_eq!(info.details, "unknown bootreason");
    }
}
