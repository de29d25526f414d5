//! The session's single background task: owns the Link, the in-flight
//! request table, the snapshot, and continuity tracking. This is the
//! "reader task" of §5 — the sole writer of each of those three
//! structures, so no locking is needed across them.

use super::{
    ActorCommand, SessionOptions, DEGRADED_GRACE, HEARTBEAT_INTERVAL, HEARTBEAT_TIMEOUT,
    REGISTER_TIMEOUT,
};
use crate::codec::{cc2_mqtt, legacy_mqtt, method, ws_sdcp, InboundFrame};
use crate::error::ConnectError;
use crate::identity::{Identity, ProtocolKind};
use crate::model::{CommandEnvelope, Continuity, StatusSnapshot};
use crate::transport::mqtt::{host_broker::HostBroker, MqttTransport, PrinterBrokerAuth};
use crate::transport::websocket::WebSocketTransport;
use crate::transport::{Backoff, Frame, Transport, TransportEvent};
use crate::session::SessionState;

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

struct InFlight {
    reply: oneshot::Sender<crate::error::Result<crate::model::ResponseEnvelope>>,
}

enum Link {
    Ws {
        transport: WebSocketTransport,
        mainboard_id: String,
    },
    Cc2Mqtt {
        transport: MqttTransport,
        serial: String,
    },
    LegacyMqtt {
        transport: MqttTransport,
        mainboard_id: String,
        #[allow(dead_code)]
        broker: HostBroker,
    },
}

impl Link {
    async fn open(&mut self) -> crate::error::Result<()> {
        match self {
            Link::Ws { transport, .. } => transport.open().await,
            Link::Cc2Mqtt { transport, .. } => transport.open().await,
            Link::LegacyMqtt { transport, .. } => transport.open().await,
        }
    }

    async fn close(&mut self) {
        match self {
            Link::Ws { transport, .. } => transport.close().await,
            Link::Cc2Mqtt { transport, .. } => transport.close().await,
            Link::LegacyMqtt { transport, .. } => transport.close().await,
        }
    }

    async fn send_command(&self, cmd: &CommandEnvelope) -> crate::error::Result<()> {
        match self {
            Link::Ws { transport, mainboard_id } => {
                transport
                    .send(Frame::Text(ws_sdcp::encode_command(cmd, mainboard_id)))
                    .await
            }
            Link::Cc2Mqtt { transport, serial } => {
                transport
                    .send(Frame::Publish {
                        topic: cc2_mqtt::topic_request(serial, transport.client_id()),
                        payload: cc2_mqtt::encode_command(cmd),
                    })
                    .await
            }
            Link::LegacyMqtt {
                transport,
                mainboard_id,
                ..
            } => {
                transport
                    .send(Frame::Publish {
                        topic: legacy_mqtt::topic_command(mainboard_id),
                        payload: legacy_mqtt::encode_command(cmd, mainboard_id),
                    })
                    .await
            }
        }
    }

    async fn send_heartbeat(&self) -> crate::error::Result<()> {
        match self {
            Link::Cc2Mqtt { transport, serial } => {
                transport
                    .send(Frame::Publish {
                        topic: cc2_mqtt::topic_request(serial, transport.client_id()),
                        payload: cc2_mqtt::encode_heartbeat(),
                    })
                    .await
            }
            // WS-SDCP and legacy-MQTT have no documented heartbeat; liveness
            // there is inferred from the periodic coordinator poll instead.
            _ => Ok(()),
        }
    }
}

/// Spawns the actor and returns a channel that resolves once the initial
/// connect (and CC2 registration) settles, matching §4.3's blocking
/// `Open()` contract.
pub fn spawn(
    identity: Identity,
    options: SessionOptions,
    command_rx: mpsc::Receiver<ActorCommand>,
    state_tx: watch::Sender<SessionState>,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    request_id_counter: Arc<AtomicU64>,
) -> oneshot::Receiver<crate::error::Result<()>> {
    let (ready_tx, ready_rx) = oneshot::channel();
    tokio::spawn(run(
        identity,
        options,
        command_rx,
        state_tx,
        snapshot_tx,
        request_id_counter,
        ready_tx,
    ));
    ready_rx
}

/// Runs the whole session lifetime, including reconnection. The Link is
/// rebuilt and reopened in place on every transport failure rather than
/// ending the task: since this actor is already the sole owner of the Link,
/// the in-flight table, and the snapshot (§5's single-writer rule), having
/// it also own the reconnect loop avoids a second type that would need to
/// reach back into those same structures from outside.
async fn run(
    identity: Identity,
    options: SessionOptions,
    mut command_rx: mpsc::Receiver<ActorCommand>,
    state_tx: watch::Sender<SessionState>,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    request_id: Arc<AtomicU64>,
    ready_tx: oneshot::Sender<crate::error::Result<()>>,
) {
    let mut in_flight: HashMap<u64, InFlight> = HashMap::new();
    let mut continuity = Continuity::default();
    let mut snapshot = StatusSnapshot::default();
    let mut logged_unknown_methods: std::collections::HashSet<i64> = std::collections::HashSet::new();
    let heartbeat_enabled = matches!(identity.protocol_kind, ProtocolKind::MqttCc2);
    let mut backoff = Backoff::default();
    let mut ready_tx = Some(ready_tx);

    'reconnect: loop {
        let (events_tx, mut events_rx) = mpsc::channel::<TransportEvent>(128);

        let _ = state_tx.send(SessionState::Connecting);
        let mut link = match build_link(&identity, &options, events_tx.clone()) {
            Ok(link) => link,
            Err(error) => {
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Err(error));
                    return;
                }
                tracing::warn!(%error, "failed to rebuild link, backing off");
                tokio::time::sleep(backoff.next_delay()).await;
                continue 'reconnect;
            }
        };

        if let Err(error) = link.open().await {
            if let Some(tx) = ready_tx.take() {
                let _ = tx.send(Err(error));
                return;
            }
            tracing::warn!(%error, "reconnect attempt failed, backing off");
            tokio::time::sleep(backoff.next_delay()).await;
            continue 'reconnect;
        }

        // CC2 registration handshake (§4.4); WS-SDCP and legacy-MQTT skip it.
        if let Link::Cc2Mqtt { transport, serial } = &link {
            let _ = state_tx.send(SessionState::Registering);
            if let Err(error) = register(transport, serial, &mut events_rx).await {
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Err(error));
                    return;
                }
                link.close().await;
                tracing::warn!(%error, "re-registration failed, backing off");
                tokio::time::sleep(backoff.next_delay()).await;
                continue 'reconnect;
            }
        }

        backoff.reset();
        snapshot.stale = false;
        let _ = state_tx.send(SessionState::Ready);

        let mut heartbeat_tick = tokio::time::interval(HEARTBEAT_INTERVAL);
        let mut last_pong = tokio::time::Instant::now();
        let mut degraded_since: Option<tokio::time::Instant> = None;

        // Seed (or re-seed, after a reconnect) the snapshot with a full
        // GET_STATUS before signalling ready.
        if let Err(error) = issue_full_status(&link, &request_id, &mut in_flight).await {
            tracing::warn!(%error, "GET_STATUS failed, continuing with prior snapshot");
        }

        if let Some(tx) = ready_tx.take() {
            let _ = tx.send(Ok(()));
        }

        'session: loop {
            tokio::select! {
                _ = heartbeat_tick.tick(), if heartbeat_enabled => {
                    let _ = link.send_heartbeat().await;
                    let elapsed = last_pong.elapsed();
                    if elapsed >= HEARTBEAT_TIMEOUT {
                        match degraded_since {
                            None => {
                                degraded_since = Some(tokio::time::Instant::now());
                                let _ = state_tx.send(SessionState::Degraded);
                            }
                            Some(since) if since.elapsed() >= DEGRADED_GRACE => {
                                let _ = state_tx.send(SessionState::Reconnecting);
                                cancel_in_flight(&mut in_flight, ConnectError::TransportReset("heartbeat timeout".into()));
                                snapshot.stale = true;
                                let _ = snapshot_tx.send(snapshot.clone());
                                link.close().await;
                                break 'session;
                            }
                            Some(_) => {}
                        }
                    }
                }

                command = command_rx.recv() => {
                    match command {
                        Some(ActorCommand::Invoke { request_id: id, method, params, reply }) => {
                            let cmd = CommandEnvelope { request_id: id, method, params, issued_at: std::time::SystemTime::now() };
                            in_flight.insert(id, InFlight { reply });
                            if let Err(error) = link.send_command(&cmd).await {
                                if let Some(slot) = in_flight.remove(&id) {
                                    let _ = slot.reply.send(Err(error));
                                }
                            }
                        }
                        Some(ActorCommand::Forget { request_id: id }) => {
                            // The caller's own timeout already fired; drop the
                            // slot so a late response has nowhere to land.
                            in_flight.remove(&id);
                        }
                        Some(ActorCommand::Close) | None => {
                            cancel_in_flight(&mut in_flight, ConnectError::SessionClosed);
                            link.close().await;
                            let _ = state_tx.send(SessionState::Closed);
                            return;
                        }
                    }
                }

                event = events_rx.recv() => {
                    match event {
                        Some(TransportEvent::Connected) => {
                            degraded_since = None;
                            last_pong = tokio::time::Instant::now();
                        }
                        Some(TransportEvent::Disconnected) => {
                            let _ = state_tx.send(SessionState::Reconnecting);
                            cancel_in_flight(&mut in_flight, ConnectError::TransportReset("transport disconnected".into()));
                            snapshot.stale = true;
                            let _ = snapshot_tx.send(snapshot.clone());
                            link.close().await;
                            break 'session;
                        }
                        Some(TransportEvent::Inbound(frame)) => {
                            last_pong = tokio::time::Instant::now();
                            degraded_since = None;
                            if matches!(*state_tx.borrow(), SessionState::Degraded) {
                                let _ = state_tx.send(SessionState::Ready);
                            }
                            handle_inbound(
                                &identity,
                                &link,
                                frame,
                                &mut in_flight,
                                &mut continuity,
                                &mut snapshot,
                                &snapshot_tx,
                                &request_id,
                                &mut logged_unknown_methods,
                            ).await;
                        }
                        None => {
                            cancel_in_flight(&mut in_flight, ConnectError::TransportReset("transport task exited".into()));
                            let _ = state_tx.send(SessionState::Reconnecting);
                            snapshot.stale = true;
                            let _ = snapshot_tx.send(snapshot.clone());
                            link.close().await;
                            break 'session;
                        }
                    }
                }
            }
        }

        tokio::time::sleep(backoff.next_delay()).await;
    }
}

fn build_link(
    identity: &Identity,
    options: &SessionOptions,
    events_tx: mpsc::Sender<TransportEvent>,
) -> crate::error::Result<Link> {
    match identity.protocol_kind {
        ProtocolKind::WebsocketSdcp => Ok(Link::Ws {
            transport: WebSocketTransport::new(identity.ip_address, events_tx),
            mainboard_id: identity.serial.clone(),
        }),
        ProtocolKind::MqttCc2 => {
            let auth = PrinterBrokerAuth {
                access_code: options.access_code.clone(),
            };
            Ok(Link::Cc2Mqtt {
                transport: MqttTransport::printer_broker(
                    identity.ip_address,
                    &identity.serial,
                    auth,
                    events_tx,
                ),
                serial: identity.serial.clone(),
            })
        }
        ProtocolKind::MqttLegacy => {
            let bind_port = identity.legacy_broker_port.or(options.legacy_broker_port).ok_or_else(|| {
                ConnectError::ProtocolError("legacy dialect requires a broker port".to_string())
            })?;
            let broker = HostBroker::spawn(bind_port)?;
            let auto_subscribe = vec![
                legacy_mqtt::topic_status(&identity.serial),
                legacy_mqtt::topic_response(&identity.serial),
            ];
            Ok(Link::LegacyMqtt {
                transport: MqttTransport::host_broker_client(bind_port, auto_subscribe, events_tx),
                mainboard_id: identity.serial.clone(),
                broker,
            })
        }
    }
}

async fn register(
    transport: &MqttTransport,
    serial: &str,
    events_rx: &mut mpsc::Receiver<TransportEvent>,
) -> crate::error::Result<()> {
    let request_id = random_register_id();
    let reply_topic = cc2_mqtt::topic_register_response(serial, &request_id);
    transport.subscribe(&reply_topic).await?;

    let payload = json!({"client_id": transport.client_id(), "request_id": request_id}).to_string();
    transport
        .send(Frame::Publish {
            topic: cc2_mqtt::topic_register(serial),
            payload: payload.into_bytes(),
        })
        .await?;

    let deadline = tokio::time::Instant::now() + REGISTER_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(ConnectError::RegistrationFailed("timed out".to_string()));
        }
        match tokio::time::timeout(remaining, events_rx.recv()).await {
            Ok(Some(TransportEvent::Inbound(Frame::Publish { topic, payload }))) if topic == reply_topic => {
                return match cc2_mqtt::decode_register_response(&payload) {
                    Some(cc2_mqtt::RegisterOutcome::Ok) => Ok(()),
                    Some(cc2_mqtt::RegisterOutcome::SlotExhausted) => Err(ConnectError::SlotExhausted),
                    Some(cc2_mqtt::RegisterOutcome::Other(reason)) => Err(ConnectError::RegistrationFailed(reason)),
                    None => Err(ConnectError::RegistrationFailed("malformed register response".to_string())),
                };
            }
            Ok(Some(_)) => continue,
            Ok(None) => return Err(ConnectError::TransportReset("transport closed during registration".to_string())),
            Err(_) => return Err(ConnectError::RegistrationFailed("timed out".to_string())),
        }
    }
}

/// 16 random hex chars + hex of current millis, per §4.3.
fn random_register_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let random_part: String = (0..16)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap())
        .collect();
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("{random_part}{millis:x}")
}

async fn issue_full_status(
    link: &Link,
    request_id: &AtomicU64,
    in_flight: &mut HashMap<u64, InFlight>,
) -> crate::error::Result<()> {
    let id = request_id.fetch_add(1, Ordering::Relaxed);
    let cmd = CommandEnvelope {
        request_id: id,
        method: method::GET_STATUS,
        params: Value::Object(Default::default()),
        issued_at: std::time::SystemTime::now(),
    };
    // Registered like any other outstanding request so its reply lands on
    // the normal Response arm in `handle_inbound` and folds into the
    // snapshot there; nothing reads the oneshot itself since there's no
    // external caller waiting on this one.
    let (reply, _rx) = oneshot::channel();
    in_flight.insert(id, InFlight { reply });
    if let Err(error) = link.send_command(&cmd).await {
        in_flight.remove(&id);
        return Err(error);
    }
    Ok(())
}

async fn handle_inbound(
    identity: &Identity,
    link: &Link,
    frame: Frame,
    in_flight: &mut HashMap<u64, InFlight>,
    continuity: &mut Continuity,
    snapshot: &mut StatusSnapshot,
    snapshot_tx: &watch::Sender<StatusSnapshot>,
    request_id: &AtomicU64,
    logged_unknown_methods: &mut std::collections::HashSet<i64>,
) {
    let decoded = match (&frame, identity.protocol_kind) {
        (Frame::Text(text), ProtocolKind::WebsocketSdcp) => ws_sdcp::decode_inbound(text),
        (Frame::Publish { topic, payload }, ProtocolKind::MqttCc2) => {
            if topic == &cc2_mqtt::topic_status(&identity.serial) {
                cc2_mqtt::decode_status_event(
                    &serde_json::from_slice(payload).unwrap_or(Value::Null),
                )
            } else {
                cc2_mqtt::decode_inbound(payload)
            }
        }
        (Frame::Publish { payload, .. }, ProtocolKind::MqttLegacy) => {
            legacy_mqtt::decode_inbound(payload)
        }
        _ => InboundFrame::Malformed,
    };

    match decoded {
        InboundFrame::Response(response) => {
            if let Some(slot) = in_flight.remove(&response.request_id) {
                if response.is_success() && response.method == method::GET_STATUS {
                    if let Some(tree) = ws_sdcp::status_tree_from_result(&response.result)
                        .or_else(|| response.result.as_object().cloned())
                    {
                        snapshot.replace_full(tree, snapshot.last_update_id);
                        let _ = snapshot_tx.send(snapshot.clone());
                    }
                } else if response.is_success() && response.method == method::GET_FILE_DETAIL {
                    // §4.4 total-layer recovery: fold the recovered count
                    // into the snapshot's `print` object without disturbing
                    // anything else there.
                    if let Some(total_layer) = response
                        .result
                        .get("total_layer")
                        .or_else(|| response.result.get("TotalLayers"))
                        .and_then(|v| v.as_u64())
                    {
                        snapshot.merge_total_layer(total_layer);
                        let _ = snapshot_tx.send(snapshot.clone());
                    }
                }
                let result = if response.is_success() {
                    Ok(response)
                } else {
                    Err(ConnectError::from_app_error_code(
                        response.error_code,
                        "command response",
                    ))
                };
                let _ = slot.reply.send(result);
            } else {
                tracing::debug!(request_id = response.request_id, "orphan response dropped");
            }
        }
        InboundFrame::StatusEvent { update_id, tree } => {
            let needs_refresh = continuity.observe(update_id, snapshot.last_update_id);
            snapshot.merge_delta(&tree, update_id);
            if snapshot.check_printing_invariant() {
                tracing::warn!("printing invariant violated, forcing status refresh");
                let _ = issue_full_status(link, request_id, in_flight).await;
            } else if snapshot.print_total_layer() == 0
                && snapshot.machine_status() == Some(crate::model::MachineStatus::Printing)
            {
                let id = request_id.fetch_add(1, Ordering::Relaxed);
                let cmd = CommandEnvelope {
                    request_id: id,
                    method: method::GET_FILE_DETAIL,
                    params: json!({"filename": snapshot.print_filename().unwrap_or_default()}),
                    issued_at: std::time::SystemTime::now(),
                };
                let (reply, _rx) = oneshot::channel();
                in_flight.insert(id, InFlight { reply });
                if link.send_command(&cmd).await.is_err() {
                    in_flight.remove(&id);
                }
            }
            if needs_refresh {
                let _ = issue_full_status(link, request_id, in_flight).await;
            }
            let _ = snapshot_tx.send(snapshot.clone());
        }
        InboundFrame::UnknownMethod { method: code, tree } => {
            if logged_unknown_methods.insert(code) {
                tracing::warn!(method = code, "unknown method code on inbound frame");
            }
            if let Some(tree) = tree {
                snapshot.merge_delta(&tree, snapshot.last_update_id);
                let _ = snapshot_tx.send(snapshot.clone());
            }
        }
        InboundFrame::Malformed => {
            tracing::debug!("dropped malformed inbound frame");
        }
    }
}

fn cancel_in_flight(in_flight: &mut HashMap<u64, InFlight>, error: ConnectError) {
    for (_, slot) in in_flight.drain() {
        let _ = slot.reply.send(Err(error.clone()));
    }
}

