//! Legacy/WebSocket discovery dialect: UDP broadcast `M99999` on port 3000.
//!
//! The same probe answers for two dialects (§3, §4.2): printers on
//! `ProtocolVersion` v3+ speak WS-SDCP directly, while older boards need the
//! `M66666` redirect (§4.1, §4.3) to connect to the host's embedded MQTT
//! broker instead. This module classifies the reply and, for the legacy
//! case, sends that redirect right away — discovery-refresh-scoped per
//! §9(b), not repeated on every reconnect.

use crate::codec::legacy_mqtt;
use crate::identity::{infer_family, Identity, ProtocolKind};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

pub const LEGACY_DISCOVERY_PORT: u16 = 3000;
const PROBE_PAYLOAD: &[u8] = b"M99999";

#[derive(Debug, Deserialize)]
struct LegacyReply {
    #[serde(rename = "Data")]
    data: LegacyReplyData,
}

#[derive(Debug, Deserialize)]
struct LegacyReplyData {
    #[serde(rename = "Attributes")]
    attributes: LegacyAttributes,
}

#[derive(Debug, Deserialize)]
struct LegacyAttributes {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "MachineName")]
    machine_name: String,
    #[serde(rename = "MainboardIP")]
    mainboard_ip: String,
    #[serde(rename = "MainboardID")]
    mainboard_id: String,
    #[serde(rename = "ProtocolVersion")]
    protocol_version: String,
    #[serde(rename = "FirmwareVersion")]
    firmware_version: String,
}

/// Broadcasts `M99999` on :3000 and collects replies until `deadline`.
pub async fn probe_legacy(deadline: Duration) -> Vec<Identity> {
    let mut identities = Vec::new();
    let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
        Ok(socket) => socket,
        Err(_) => return identities,
    };
    if socket.set_broadcast(true).is_err() {
        return identities;
    }
    let broadcast_addr: SocketAddr = ([255, 255, 255, 255], LEGACY_DISCOVERY_PORT).into();
    if socket.send_to(PROBE_PAYLOAD, broadcast_addr).await.is_err() {
        return identities;
    }

    let mut buf = [0u8; 4096];
    let deadline = tokio::time::Instant::now() + deadline;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((n, _from))) => {
                if let Some(mut identity) = parse_reply(&buf[..n]) {
                    if identity.protocol_kind == ProtocolKind::MqttLegacy {
                        identity.legacy_broker_port = Some(legacy_mqtt::DEFAULT_LEGACY_BROKER_PORT);
                        send_redirect(&identity).await;
                    }
                    identities.push(identity);
                }
            }
            _ => break,
        }
    }
    identities
}

/// Classifies the probe reply's dialect from its firmware-reported
/// `ProtocolVersion` (§3): v3 and up speak WS-SDCP directly, anything older
/// or unparseable needs the `M66666` MQTT redirect.
fn classify_protocol_kind(protocol_version: &str) -> ProtocolKind {
    let major = protocol_version
        .trim_start_matches(|c: char| !c.is_ascii_digit())
        .split('.')
        .next()
        .and_then(|segment| segment.parse::<u32>().ok());
    match major {
        Some(major) if major >= 3 => ProtocolKind::WebsocketSdcp,
        _ => ProtocolKind::MqttLegacy,
    }
}

/// Learns which local address the host would use to reach `peer`, by
/// "connecting" an unbound UDP socket to it — no packet is sent, the OS just
/// picks the outgoing interface — then reads that socket's own address back.
fn local_ip_facing(peer: IpAddr) -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect((peer, LEGACY_DISCOVERY_PORT)).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

/// Unicasts the `M66666` redirect so the legacy printer connects to the
/// host's embedded MQTT broker instead of its own WebSocket server.
async fn send_redirect(identity: &Identity) -> Option<()> {
    let broker_port = identity.legacy_broker_port?;
    let host_ip = local_ip_facing(identity.ip_address)?;
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await.ok()?;
    let directive = legacy_mqtt::redirect_directive(&host_ip.to_string(), broker_port);
    let target: SocketAddr = (identity.ip_address, LEGACY_DISCOVERY_PORT).into();
    socket.send_to(directive.as_bytes(), target).await.ok()?;
    Some(())
}

fn parse_reply(payload: &[u8]) -> Option<Identity> {
    let reply: LegacyReply = serde_json::from_slice(payload).ok()?;
    let attrs = reply.data.attributes;
    let ip_address: IpAddr = attrs.mainboard_ip.parse().ok()?;
    let model = attrs.machine_name;
    let protocol_kind = classify_protocol_kind(&attrs.protocol_version);
    Some(Identity {
        name: attrs.name,
        printer_family: infer_family(&model),
        model,
        serial: attrs.mainboard_id,
        ip_address,
        firmware: attrs.firmware_version,
        protocol_version: attrs.protocol_version,
        protocol_kind,
        capabilities: Default::default(),
        legacy_broker_port: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_reply() {
        let payload = serde_json::json!({
            "Data": {
                "Attributes": {
                    "Name": "My Saturn",
                    "MachineName": "Saturn 4 Ultra",
                    "MainboardIP": "192.168.1.42",
                    "MainboardID": "ABC123",
                    "ProtocolVersion": "V3.0.0",
                    "FirmwareVersion": "V1.2.3",
                }
            }
        });
        let identity = parse_reply(payload.to_string().as_bytes()).expect("parses");
        assert_eq!(identity.serial, "ABC123");
        assert_eq!(identity.name, "My Saturn");
        assert_eq!(identity.ip_address, "192.168.1.42".parse::<IpAddr>().unwrap());
        assert_eq!(identity.protocol_kind, ProtocolKind::WebsocketSdcp);
    }

    #[test]
    fn rejects_malformed_payload() {
        assert!(parse_reply(b"not json").is_none());
        assert!(parse_reply(b"{}").is_none());
    }

    #[test]
    fn pre_v3_firmware_classifies_as_mqtt_legacy() {
        let payload = serde_json::json!({
            "Data": {
                "Attributes": {
                    "Name": "Old Mars",
                    "MachineName": "Mars 3",
                    "MainboardIP": "192.168.1.43",
                    "MainboardID": "DEF456",
                    "ProtocolVersion": "V2.1.0",
                    "FirmwareVersion": "V1.0.0",
                }
            }
        });
        let identity = parse_reply(payload.to_string().as_bytes()).expect("parses");
        assert_eq!(identity.protocol_kind, ProtocolKind::MqttLegacy);
        assert_eq!(identity.legacy_broker_port, None);
    }

    #[test]
    fn classify_protocol_kind_handles_unparseable_version() {
        assert_eq!(classify_protocol_kind(""), ProtocolKind::MqttLegacy);
        assert_eq!(classify_protocol_kind("unknown"), ProtocolKind::MqttLegacy);
        assert_eq!(classify_protocol_kind("V4.2.1"), ProtocolKind::WebsocketSdcp);
    }
}
