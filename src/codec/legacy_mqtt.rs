//! Legacy-MQTT dialect (CC1 and older): the legacy WebSocket frame shape
//! re-wrapped in MQTT topics, after the printer has been redirected to the
//! host's embedded broker via the discovery-phase `M66666` command (§4.1,
//! §4.3).

use super::ws_sdcp;
use super::InboundFrame;
use crate::model::CommandEnvelope;

/// Default bind port for the embedded host broker legacy printers get
/// redirected to, absent an explicit override in configuration.
pub const DEFAULT_LEGACY_BROKER_PORT: u16 = 18830;

/// The discovery-phase directive that redirects a legacy printer to connect
/// to the host's embedded MQTT broker instead of its own WebSocket server.
pub fn redirect_directive(host_ip: &str, broker_port: u16) -> String {
    format!("M66666 {host_ip}:{broker_port}")
}

pub fn topic_command(mainboard_id: &str) -> String {
    format!("sdcp/request/{mainboard_id}")
}

pub fn topic_response(mainboard_id: &str) -> String {
    format!("sdcp/response/{mainboard_id}")
}

pub fn topic_status(mainboard_id: &str) -> String {
    format!("sdcp/status/{mainboard_id}")
}

/// Legacy-MQTT frames use the exact WS-SDCP JSON shape; only the transport
/// (topics vs. a single socket) differs, so encoding/decoding is a thin
/// pass-through to the WS-SDCP codec.
pub fn encode_command(cmd: &CommandEnvelope, mainboard_id: &str) -> Vec<u8> {
    ws_sdcp::encode_command(cmd, mainboard_id).into_bytes()
}

pub fn decode_inbound(payload: &[u8]) -> InboundFrame {
    match std::str::from_utf8(payload) {
        Ok(text) => ws_sdcp::decode_inbound(text),
        Err(_) => InboundFrame::Malformed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_directive_has_expected_shape() {
        assert_eq!(
            redirect_directive("192.168.1.10", DEFAULT_LEGACY_BROKER_PORT),
            "M66666 192.168.1.10:18830"
        );
    }

    #[test]
    fn topics_are_scoped_by_mainboard_id() {
        assert_eq!(topic_command("ABC"), "sdcp/request/ABC");
        assert_eq!(topic_response("ABC"), "sdcp/response/ABC");
        assert_eq!(topic_status("ABC"), "sdcp/status/ABC");
    }
}
