//! Control-plane proxy (§4.6 item 1): a local WebSocket server at
//! `/websocket` on `proxyWsPort` letting many downstream consumers share
//! one upstream [`Session`]. A downstream's own request id is remembered
//! per call and stamped back onto the reply; the upstream id is whatever
//! [`Session::invoke`] assigns internally, so there is no separate mapping
//! table to maintain. Status/event frames from upstream are broadcast
//! unmodified to every downstream (§4.6).

use crate::error::{ConnectError, Result};
use crate::session::Session;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;

/// Bounded per-downstream outbound queue (§4.6's backpressure rule).
pub const DOWNSTREAM_QUEUE_CAPACITY: usize = 64;
/// A downstream whose write stalls this long is disconnected with
/// `SlowConsumer` rather than letting the queue (and memory) grow unbounded.
pub const SLOW_CONSUMER_STALL: Duration = Duration::from_secs(2);

#[derive(Clone)]
struct ControlState {
    session: Session,
}

/// Serves the control-plane WebSocket on `bind_port` until the process
/// exits or the listener errors. One call per proxied device.
pub async fn serve(session: Session, bind_port: u16) -> Result<()> {
    let state = ControlState { session };
    let app = Router::new()
        .route("/websocket", get(upgrade))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", bind_port))
        .await
        .map_err(|e| ConnectError::ProtocolError(format!("proxy control bind failed: {e}")))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| ConnectError::ProtocolError(format!("proxy control serve failed: {e}")))
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<ControlState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_downstream(socket, state.session))
}

async fn handle_downstream(socket: WebSocket, session: Session) {
    let (mut sink, mut stream) = socket.split();
    let (queue_tx, mut queue_rx) = mpsc::channel::<Message>(DOWNSTREAM_QUEUE_CAPACITY);

    // Latest-wins status fan-out: a downstream that falls behind just
    // misses intermediate snapshots, exactly as a direct `Subscribe()`
    // caller would (§4.5), so the upstream is never slowed by a slow
    // downstream.
    let mut snapshot_rx = session.subscribe();
    let broadcast_queue = queue_tx.clone();
    let broadcaster = tokio::spawn(async move {
        loop {
            if snapshot_rx.changed().await.is_err() {
                break;
            }
            let snapshot = snapshot_rx.borrow().clone();
            let frame = json!({
                "method": crate::codec::method::STATUS_EVENT,
                "result": snapshot.tree,
            });
            if broadcast_queue
                .send(Message::Text(frame.to_string()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    // Single writer draining the queue into the socket, so replies and
    // broadcasts never interleave out of order on the wire (§4.6's
    // single-writer discipline).
    let writer = tokio::spawn(async move {
        while let Some(message) = queue_rx.recv().await {
            match tokio::time::timeout(SLOW_CONSUMER_STALL, sink.send(message)).await {
                Ok(Ok(())) => {}
                _ => {
                    tracing::warn!(
                        "downstream write stalled past {:?}, disconnecting as SlowConsumer",
                        SLOW_CONSUMER_STALL
                    );
                    break;
                }
            }
        }
        let _ = sink.close().await;
    });

    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(request) = serde_json::from_str::<Value>(&text) else {
            tracing::debug!("dropping unparseable downstream frame");
            continue;
        };
        let session = session.clone();
        let queue_tx = queue_tx.clone();
        tokio::spawn(forward_request(session, request, queue_tx));
    }

    broadcaster.abort();
    writer.abort();
}

/// Forwards one downstream request to the Session and stamps its reply with
/// the caller's own request id before enqueueing it for delivery.
async fn forward_request(session: Session, request: Value, queue_tx: mpsc::Sender<Message>) {
    let downstream_id = request
        .get("RequestID")
        .or_else(|| request.get("requestId"))
        .or_else(|| request.get("id"))
        .cloned()
        .unwrap_or(Value::Null);

    let Some(method) = request
        .get("method")
        .or_else(|| request.get("Method"))
        .and_then(|v| v.as_i64())
    else {
        tracing::debug!("dropping downstream frame with no method code");
        return;
    };
    let params = request
        .get("params")
        .or_else(|| request.get("Data"))
        .cloned()
        .unwrap_or_else(|| json!({}));

    let reply = match session.invoke(method, params, None).await {
        Ok(response) => json!({
            "RequestID": downstream_id,
            "method": response.method,
            "error_code": response.error_code,
            "result": response.result,
        }),
        Err(error) => json!({
            "RequestID": downstream_id,
            "method": method,
            "error_code": -1,
            "error": error.to_string(),
        }),
    };
    let _ = queue_tx.send(Message::Text(reply.to_string())).await;
}
