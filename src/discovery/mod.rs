//! Printer discovery: two UDP broadcast dialects probed concurrently.
//!
//! Grounded on the UDP-broadcast discovery pattern in `KittyCAD-machine-api`'s
//! Bambu SSDP listener (bind an any-interface socket, parse line-oriented
//! replies, dedupe by serial) adapted to Elegoo's two dialects (§4.2, §6.1).

mod cc2;
mod legacy;

use crate::identity::Identity;
use std::collections::HashMap;
use std::time::Duration;

pub use cc2::probe_cc2;
pub use legacy::probe_legacy;

/// Per-probe timeout ceiling for a directed (single-IP) discovery request.
pub const DIRECTED_PROBE_TIMEOUT: Duration = Duration::from_secs(3);
/// Per-probe timeout ceiling for a broadcast discovery sweep.
pub const BROADCAST_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs both discovery dialects concurrently and returns the deduplicated,
/// merged identity list. Never errors: an empty result means no printers
/// answered within `timeout`, reported to the caller as [`crate::error::ConnectError::DiscoveryEmpty`]
/// by higher layers that require at least one printer.
pub async fn discover(timeout: Duration) -> Vec<Identity> {
    let timeout = timeout.min(BROADCAST_PROBE_TIMEOUT);
    let (legacy_result, cc2_result) =
        tokio::join!(probe_legacy(timeout), probe_cc2(timeout));

    let mut by_serial: HashMap<String, Identity> = HashMap::new();
    for identity in legacy_result.into_iter().chain(cc2_result) {
        by_serial.entry(identity.serial.clone()).or_insert(identity);
    }
    by_serial.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{PrinterFamily, ProtocolKind};

    fn sample(serial: &str) -> Identity {
        Identity {
            name: "printer".into(),
            model: "Saturn 4 Ultra".into(),
            serial: serial.into(),
            ip_address: "127.0.0.1".parse().unwrap(),
            firmware: "1.0".into(),
            protocol_version: "1".into(),
            protocol_kind: ProtocolKind::WebsocketSdcp,
            printer_family: PrinterFamily::Resin,
            capabilities: Default::default(),
            legacy_broker_port: None,
        }
    }

    #[test]
    fn dedupe_prefers_first_seen_dialect() {
        let mut by_serial: HashMap<String, Identity> = HashMap::new();
        for identity in [sample("ABC"), sample("ABC"), sample("DEF")] {
            by_serial.entry(identity.serial.clone()).or_insert(identity);
        }
        assert_eq!(by_serial.len(), 2);
    }
}
