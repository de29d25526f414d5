//! WebSocket-SDCP dialect: `{"Id":..,"Data":{"Cmd":..,"Data":..,"RequestID":..}}`
//! for commands; `sdcp/status/<mainboardId>`-shaped pushes for events.

use super::method;
use super::InboundFrame;
use crate::model::{CommandEnvelope, ResponseEnvelope};
use serde_json::{json, Map, Value};

/// Encodes a command as a WS-SDCP text frame.
pub fn encode_command(cmd: &CommandEnvelope, mainboard_id: &str) -> String {
    json!({
        "Id": mainboard_id,
        "Data": {
            "Cmd": cmd.method,
            "Data": cmd.params,
            "RequestID": cmd.request_id.to_string(),
        }
    })
    .to_string()
}

/// Decodes an inbound WS-SDCP text frame (either a command response or a
/// status push).
pub fn decode_inbound(raw: &str) -> InboundFrame {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(_) => return InboundFrame::Malformed,
    };
    let Some(data) = value.get("Data") else {
        return InboundFrame::Malformed;
    };

    // Status pushes carry a `Status` object and a `TimeStamp`/`MainboardID`
    // pair instead of a `Cmd`+`RequestID` response shape.
    if let Some(status) = data.get("Status").and_then(|s| s.as_object()) {
        let update_id = data
            .get("TimeStamp")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        return InboundFrame::StatusEvent {
            update_id,
            tree: status.clone(),
        };
    }

    let request_id = data
        .get("RequestID")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<u64>().ok());
    let method_code = data.get("Cmd").and_then(|v| v.as_i64());

    match (request_id, method_code) {
        (Some(request_id), Some(method_code)) => {
            let error_code = data
                .get("Data")
                .and_then(|d| d.get("ErrorCode"))
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            let result = data.get("Data").cloned().unwrap_or(Value::Null);
            InboundFrame::Response(ResponseEnvelope {
                request_id,
                method: method_code,
                error_code,
                result,
            })
        }
        (None, Some(method_code)) if method_code == method::STATUS_EVENT => {
            let tree = data
                .get("Data")
                .and_then(|d| d.as_object())
                .cloned()
                .unwrap_or_default();
            InboundFrame::StatusEvent { update_id: 0, tree }
        }
        (None, Some(method_code)) => InboundFrame::UnknownMethod {
            method: method_code,
            tree: data.get("Data").and_then(|d| d.as_object()).cloned(),
        },
        _ => InboundFrame::Malformed,
    }
}

/// Returns the full status tree out of a `GET_STATUS` response's `result`.
pub fn status_tree_from_result(result: &Value) -> Option<Map<String, Value>> {
    result
        .get("Status")
        .and_then(|v| v.as_object())
        .cloned()
        .or_else(|| result.as_object().cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CommandEnvelope;
    use std::time::SystemTime;

    #[test]
    fn encodes_command_envelope() {
        let cmd = CommandEnvelope {
            request_id: 7,
            method: method::GET_STATUS,
            params: json!({}),
            issued_at: SystemTime::now(),
        };
        let frame = encode_command(&cmd, "ABC123");
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["Id"], "ABC123");
        assert_eq!(value["Data"]["RequestID"], "7");
        assert_eq!(value["Data"]["Cmd"], method::GET_STATUS);
    }

    #[test]
    fn decodes_response_frame() {
        let raw = json!({
            "Id": "ABC123",
            "Data": {
                "Cmd": method::GET_STATUS,
                "RequestID": "7",
                "Data": {"ErrorCode": 0, "Status": {"machineStatus": "IDLE"}},
            }
        })
        .to_string();
        match decode_inbound(&raw) {
            InboundFrame::Response(response) => {
                assert_eq!(response.request_id, 7);
                assert!(response.is_success());
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn decodes_status_push_frame() {
        let raw = json!({
            "Id": "ABC123",
            "Data": {
                "TimeStamp": 42,
                "Status": {"extruder": {"temp": 200.0}},
            }
        })
        .to_string();
        match decode_inbound(&raw) {
            InboundFrame::StatusEvent { update_id, tree } => {
                assert_eq!(update_id, 42);
                assert_eq!(tree["extruder"]["temp"], json!(200.0));
            }
            other => panic!("expected status event, got {other:?}"),
        }
    }

    #[test]
    fn malformed_frames_are_reported_as_such() {
        assert!(matches!(decode_inbound("not json"), InboundFrame::Malformed));
        assert!(matches!(decode_inbound("{}"), InboundFrame::Malformed));
    }
}
