//! CC2-MQTT dialect: `{"id":..,"method":..,"params":..}` / `{"id":..,"method":..,"result":..}`
//! published to the per-client topics in §6.2.

use super::method;
use super::InboundFrame;
use crate::model::{CommandEnvelope, ResponseEnvelope};
use serde_json::{json, Map, Value};

pub fn topic_register(serial: &str) -> String {
    format!("elegoo/{serial}/api_register")
}

pub fn topic_register_response(serial: &str, request_id: &str) -> String {
    format!("elegoo/{serial}/{request_id}/register_response")
}

pub fn topic_request(serial: &str, client_id: &str) -> String {
    format!("elegoo/{serial}/{client_id}/api_request")
}

pub fn topic_response(serial: &str, client_id: &str) -> String {
    format!("elegoo/{serial}/{client_id}/api_response")
}

pub fn topic_status(serial: &str) -> String {
    format!("elegoo/{serial}/api_status")
}

/// Encodes a command as a CC2-MQTT JSON payload. The "brightness" parameter
/// documented for light control is wrong on real firmware; callers building
/// a `SET_LIGHT` command must pass `{"power": 0|1}` (§4.4), which this
/// function does not rewrite — it is the caller's job to build `params`
/// correctly, this just serializes the envelope.
pub fn encode_command(cmd: &CommandEnvelope) -> Vec<u8> {
    json!({
        "id": cmd.request_id.to_string(),
        "method": cmd.method,
        "params": cmd.params,
    })
    .to_string()
    .into_bytes()
}

pub fn encode_heartbeat() -> Vec<u8> {
    json!({"type": "PING"}).to_string().into_bytes()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    Ok,
    SlotExhausted,
    Other(String),
}

/// Decodes a `register_response` payload.
pub fn decode_register_response(payload: &[u8]) -> Option<RegisterOutcome> {
    let value: Value = serde_json::from_slice(payload).ok()?;
    let error = value.get("error")?.as_str()?;
    Some(match error {
        "ok" => RegisterOutcome::Ok,
        "too many clients" => RegisterOutcome::SlotExhausted,
        other => RegisterOutcome::Other(other.to_string()),
    })
}

/// Decodes a payload arriving on the per-client response topic: either a
/// command response, a PONG heartbeat reply (ignored upstream), or a status
/// event (never arrives here — that's `api_status` — but decoded the same
/// way for uniformity if firmware ever merges the topics).
pub fn decode_inbound(payload: &[u8]) -> InboundFrame {
    let value: Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(_) => return InboundFrame::Malformed,
    };

    if value.get("type").and_then(|v| v.as_str()) == Some("PONG") {
        return InboundFrame::UnknownMethod { method: -1, tree: None };
    }

    let request_id = value
        .get("id")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<u64>().ok());
    let method_code = value.get("method").and_then(|v| v.as_i64());

    match (request_id, method_code) {
        (Some(request_id), Some(method_code)) if method_code != method::STATUS_EVENT => {
            let result = value.get("result").cloned().unwrap_or(Value::Null);
            let error_code = result
                .get("error_code")
                .or_else(|| value.get("error_code"))
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            InboundFrame::Response(ResponseEnvelope {
                request_id,
                method: method_code,
                error_code,
                result,
            })
        }
        (_, Some(method_code)) if method_code == method::STATUS_EVENT => {
            decode_status_event(&value)
        }
        (_, Some(method_code)) => InboundFrame::UnknownMethod {
            method: method_code,
            tree: value.get("params").and_then(|v| v.as_object()).cloned(),
        },
        _ => InboundFrame::Malformed,
    }
}

/// Decodes a payload on `elegoo/<sn>/api_status` (always method 6000).
pub fn decode_status_event(value: &Value) -> InboundFrame {
    let update_id = value
        .get("params")
        .and_then(|p| p.get("update_id"))
        .or_else(|| value.get("update_id"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let tree = value
        .get("params")
        .and_then(|p| p.get("status"))
        .and_then(|s| s.as_object())
        .cloned()
        .unwrap_or_else(|| {
            value
                .get("params")
                .and_then(|p| p.as_object())
                .cloned()
                .unwrap_or_default()
        });
    InboundFrame::StatusEvent { update_id, tree }
}

/// Builds the `SET_LIGHT` param object with the firmware-correct `power`
/// field rather than the documented-but-wrong `brightness` field (§4.4).
pub fn light_params(on: bool) -> Value {
    json!({"power": if on { 1 } else { 0 }})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_ok_registration() {
        let payload = json!({"error": "ok"}).to_string();
        assert_eq!(
            decode_register_response(payload.as_bytes()),
            Some(RegisterOutcome::Ok)
        );
    }

    #[test]
    fn decodes_slot_exhausted_registration() {
        let payload = json!({"error": "too many clients"}).to_string();
        assert_eq!(
            decode_register_response(payload.as_bytes()),
            Some(RegisterOutcome::SlotExhausted)
        );
    }

    #[test]
    fn decodes_status_event_with_update_id() {
        let payload = json!({
            "id": "0",
            "method": method::STATUS_EVENT,
            "params": {"update_id": 42, "status": {"extruder": {"temp": 200.0}}}
        })
        .to_string();
        match decode_inbound(payload.as_bytes()) {
            InboundFrame::StatusEvent { update_id, tree } => {
                assert_eq!(update_id, 42);
                assert_eq!(tree["extruder"]["temp"], json!(200.0));
            }
            other => panic!("expected status event, got {other:?}"),
        }
    }

    #[test]
    fn light_params_use_power_not_brightness() {
        let params = light_params(true);
        assert_eq!(params, json!({"power": 1}));
        assert!(params.get("brightness").is_none());
    }
}
