//! Malf handler
//!
//! Receives an `ENTER_MALF` request (raised by the validator listener,
//! an external collaborator) and either invokes the `enter_malf` helper
//! binary or, if that fails, force-shutdowns -- the irrecoverable-
//! security-violation branch of the error taxonomy, which explicitly
//! bypasses the USB-mount denial rule.

use crate::bus::{Bus, Message};
use tokio::process::Command;
use tracing::{instrument, warn};

#[instrument]
pub async fn handle_enter_malf(reason: &str, bus: &Bus) {
    match Command::new("/usr/sbin/enter_malf").arg(reason).status().await {
        Ok(status) if status.success() => {
            bus.publish(Message::SetMalf(true));
        }
        Ok(status) => {
            warn!(code = ?status.code(), reason, "enter_malf helper exited non-zero, forcing shutdown");
            bus.publish(Message::ForceShutdown);
        }
        Err(e) => {
            warn!(error = %e, reason, "enter_malf helper failed to spawn, forcing shutdown");
            bus.publish(Message::ForceShutdown);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_helper_binary_forces_shutdown() {
        let bus = Bus::new();
        let mut rx = bus.subscribe();
        handle_enter_malf("HARDWARE emmc bad-sector", &bus).await;
        let received = rx.try_recv().unwrap();
        assert!(matches!(received, Message::ForceShutdown));
    }
}
