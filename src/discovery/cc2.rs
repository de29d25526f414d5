//! CC2 discovery dialect: UDP broadcast `{"id":0,"method":7000}` on port 52700.

use crate::identity::{
    infer_family, Capability, Identity, ProtocolKind, CAP_CLOUD_ONLY, CAP_REQUIRES_ACCESS_CODE,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

pub const CC2_DISCOVERY_PORT: u16 = 52700;

#[derive(Debug, serde::Serialize)]
struct Cc2Probe {
    id: u32,
    method: u32,
}

#[derive(Debug, Deserialize)]
struct Cc2Reply {
    result: Cc2ReplyResult,
}

#[derive(Debug, Deserialize)]
struct Cc2ReplyResult {
    host_name: String,
    machine_model: String,
    sn: String,
    #[serde(default)]
    token_status: u8,
    #[serde(default)]
    lan_status: u8,
}

/// Broadcasts the CC2 discovery method on :52700 and collects replies until `deadline`.
pub async fn probe_cc2(deadline: Duration) -> Vec<Identity> {
    let mut identities = Vec::new();
    let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
        Ok(socket) => socket,
        Err(_) => return identities,
    };
    if socket.set_broadcast(true).is_err() {
        return identities;
    }
    let payload = match serde_json::to_vec(&Cc2Probe { id: 0, method: 7000 }) {
        Ok(payload) => payload,
        Err(_) => return identities,
    };
    let broadcast_addr: SocketAddr = ([255, 255, 255, 255], CC2_DISCOVERY_PORT).into();
    if socket.send_to(&payload, broadcast_addr).await.is_err() {
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
            Ok(Ok((n, from))) => {
                if let Some(identity) = parse_reply(&buf[..n], from) {
                    identities.push(identity);
                }
            }
            _ => break,
        }
    }
    identities
}

fn parse_reply(payload: &[u8], from: SocketAddr) -> Option<Identity> {
    let reply: Cc2Reply = serde_json::from_slice(payload).ok()?;
    let result = reply.result;
    let mut capabilities: std::collections::BTreeSet<Capability> = Default::default();
    if result.lan_status == 0 {
        capabilities.insert(CAP_CLOUD_ONLY.to_string());
    }
    if result.token_status == 1 {
        capabilities.insert(CAP_REQUIRES_ACCESS_CODE.to_string());
    }
    Some(Identity {
        name: result.host_name,
        printer_family: infer_family(&result.machine_model),
        model: result.machine_model,
        serial: result.sn,
        ip_address: from.ip(),
        firmware: String::new(),
        protocol_version: String::new(),
        protocol_kind: ProtocolKind::MqttCc2,
        capabilities,
        legacy_broker_port: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload(lan_status: u8) -> Vec<u8> {
        serde_json::json!({
            "id": 0,
            "result": {
                "host_name": "Centauri",
                "machine_model": "Centauri Carbon 2",
                "sn": "CC2XYZ",
                "token_status": 1,
                "lan_status": lan_status,
            }
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn cloud_only_printers_are_tagged() {
        let from: SocketAddr = "192.168.1.99:52700".parse().unwrap();
        let identity = parse_reply(&sample_payload(0), from).expect("parses");
        assert!(identity.is_cloud_only());
    }

    #[test]
    fn lan_capable_printers_are_not_tagged() {
        let from: SocketAddr = "192.168.1.99:52700".parse().unwrap();
        let identity = parse_reply(&sample_payload(1), from).expect("parses");
        assert!(!identity.is_cloud_only());
    }

    #[test]
    fn token_status_drives_access_code_requirement() {
        let from: SocketAddr = "192.168.1.99:52700".parse().unwrap();
        let identity = parse_reply(&sample_payload(1), from).expect("parses");
        assert!(identity.requires_access_code());
    }
}
