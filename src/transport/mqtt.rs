//! MQTT transport: two modes sharing one `Transport` impl shape.
//!
//! - **Printer-broker** (CC2): the printer hosts the broker at
//!   `<ip>:1883`; we connect to it with [`rumqttc`], exactly as the
//!   teacher's `mqtt.rs` connects outward to a Bambu printer's broker,
//!   minus the TLS layer (CC2 uses a plain TCP listener, §4.3).
//! - **Host-broker** (legacy/CC1): we run the broker ourselves with an
//!   embedded [`rumqttd`] instance and redirect the printer to it via the
//!   discovery-phase `M66666` directive (§4.1, §6.3).

use super::{Frame, Transport, TransportEvent};
use crate::codec::cc2_mqtt;
use crate::error::{ConnectError, Result};
use rand::Rng;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const MQTT_PORT: u16 = 1883;
const KEEPALIVE: Duration = Duration::from_secs(60);
const MQTT_EVENT_QUEUE_CAPACITY: usize = 10;
const DEFAULT_PRINTER_BROKER_USERNAME: &str = "elegoo";
const DEFAULT_PRINTER_BROKER_PASSWORD: &str = "123456";

/// Generates a 10-character client id: `"0cli"` + 5 hex chars of the
/// current epoch millis + 1-3 random hex chars, per §6.2.
pub fn generate_client_id() -> String {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let millis_hex = format!("{millis:x}");
    let tail: String = millis_hex.chars().rev().take(5).collect();
    let tail: String = tail.chars().rev().collect();
    let mut rng = rand::thread_rng();
    let entropy: String = (0..3)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap())
        .collect();
    let mut id = format!("0cli{tail}{entropy}");
    id.truncate(10);
    while id.len() < 10 {
        id.push('0');
    }
    id
}

/// Credentials for the printer-broker (CC2) connection. An access code is
/// required only when discovery reported `token_status == 1` (§4.1).
#[derive(Debug, Clone)]
pub struct PrinterBrokerAuth {
    pub access_code: Option<String>,
}

impl PrinterBrokerAuth {
    fn username_password(&self) -> (String, String) {
        match &self.access_code {
            Some(code) => (DEFAULT_PRINTER_BROKER_USERNAME.to_string(), code.clone()),
            None => (
                DEFAULT_PRINTER_BROKER_USERNAME.to_string(),
                DEFAULT_PRINTER_BROKER_PASSWORD.to_string(),
            ),
        }
    }
}

/// Printer-broker mode: connects outward to the CC2 printer's own MQTT
/// listener. Mirrors the teacher's `MqttClient::connect` event-loop task,
/// minus TLS and with the registration handshake layered on by
/// [`crate::session`], not here.
pub struct MqttTransport {
    host: String,
    port: u16,
    client_id: String,
    auth: Option<PrinterBrokerAuth>,
    /// Topics re-subscribed on every ConnAck (clean_session drops them on
    /// reconnect). Printer-broker mode fixes these at construction since
    /// the serial/client-id are known up front; host-broker mode starts
    /// empty and the session subscribes dynamically once topics are built
    /// from the mainboard id.
    auto_subscribe: Vec<String>,
    events_tx: mpsc::Sender<TransportEvent>,
    client: Option<AsyncClient>,
    event_loop_task: Option<JoinHandle<()>>,
}

impl MqttTransport {
    /// Printer-broker (CC2) mode: connects outward to `<ip>:1883`.
    pub fn printer_broker(
        ip: IpAddr,
        serial: &str,
        auth: PrinterBrokerAuth,
        events_tx: mpsc::Sender<TransportEvent>,
    ) -> Self {
        let client_id = generate_client_id();
        let auto_subscribe = vec![
            cc2_mqtt::topic_status(serial),
            cc2_mqtt::topic_response(serial, &client_id),
        ];
        Self {
            host: ip.to_string(),
            port: MQTT_PORT,
            client_id,
            auth: Some(auth),
            auto_subscribe,
            events_tx,
            client: None,
            event_loop_task: None,
        }
    }

    /// Host-broker (legacy) mode: connects to the embedded broker the
    /// session itself is running, at `127.0.0.1:<bind_port>`.
    pub fn host_broker_client(
        bind_port: u16,
        auto_subscribe: Vec<String>,
        events_tx: mpsc::Sender<TransportEvent>,
    ) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: bind_port,
            client_id: format!("connect-host-{}", std::process::id()),
            auth: None,
            auto_subscribe,
            events_tx,
            client: None,
            event_loop_task: None,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Subscribes to a topic outside the fixed auto-subscribe set, used
    /// for the per-registration `register_response` topic (§4.4) which is
    /// only known once a request id has been generated.
    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| ConnectError::TransportReset("mqtt client not open".to_string()))?;
        client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| ConnectError::TransportReset(e.to_string()))
    }
}

#[async_trait::async_trait]
impl Transport for MqttTransport {
    async fn open(&mut self) -> Result<()> {
        let mut options = MqttOptions::new(&self.client_id, self.host.clone(), self.port);
        if let Some(auth) = &self.auth {
            let (username, password) = auth.username_password();
            options.set_credentials(username, password);
        }
        options.set_keep_alive(KEEPALIVE);

        let (client, mut event_loop) = AsyncClient::new(options, MQTT_EVENT_QUEUE_CAPACITY);

        let auto_subscribe = self.auto_subscribe.clone();
        let events_tx = self.events_tx.clone();
        let subscribe_client = client.clone();

        let task = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        // clean_session drops subscriptions across reconnects,
                        // so every ConnAck needs a fresh subscribe.
                        for topic in &auto_subscribe {
                            let _ = subscribe_client.subscribe(topic, QoS::AtMostOnce).await;
                        }
                        let _ = events_tx.send(TransportEvent::Connected).await;
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let _ = events_tx
                            .send(TransportEvent::Inbound(Frame::Publish {
                                topic: publish.topic.clone(),
                                payload: publish.payload.to_vec(),
                            }))
                            .await;
                    }
                    Ok(_) => {}
                    Err(_) => {
                        let _ = events_tx.send(TransportEvent::Disconnected).await;
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        self.client = Some(client);
        self.event_loop_task = Some(task);
        Ok(())
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        let Frame::Publish { topic, payload } = frame else {
            return Err(ConnectError::ProtocolError(
                "MqttTransport only carries Publish frames".to_string(),
            ));
        };
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| ConnectError::TransportReset("mqtt client not open".to_string()))?;
        client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| ConnectError::TransportReset(e.to_string()))
    }

    async fn close(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = tokio::time::timeout(Duration::from_secs(2), client.disconnect()).await;
        }
        if let Some(task) = self.event_loop_task.take() {
            task.abort();
        }
    }
}

/// Host-broker mode: an embedded broker the host runs for legacy (CC1)
/// printers, which get redirected to it via `M66666` during discovery
/// (§4.1, §9 open question (b): redirection is re-issued only when
/// discovery refreshes the printer's address, not on every reconnect).
pub mod host_broker {
    use super::*;
    use rumqttd::{Broker, Config as BrokerConfig};

    /// Spawns an embedded broker on `bind_port` and returns a handle that
    /// keeps it alive until dropped. Configuration is built programmatically
    /// rather than from a file, mirroring how the teacher builds
    /// `MqttOptions` in code rather than loading a client config file.
    pub struct HostBroker {
        _task: JoinHandle<()>,
    }

    impl HostBroker {
        pub fn spawn(bind_port: u16) -> Result<Self> {
            let config = build_config(bind_port);
            let task = tokio::task::spawn_blocking(move || {
                let mut broker = Broker::new(config);
                if let Err(error) = broker.start() {
                    tracing::error!(%error, "embedded mqtt broker exited");
                }
            });
            Ok(Self {
                _task: task,
            })
        }
    }

    fn build_config(bind_port: u16) -> BrokerConfig {
        // rumqttd's Config is assembled from its own builder types in real
        // deployments (TOML-loaded); here we construct the minimal single-
        // listener, no-TLS, no-ACL shape a local redirection target needs.
        let listen_addr = format!("0.0.0.0:{bind_port}").parse().expect("valid bind address");
        BrokerConfig {
            id: 0,
            router: rumqttd::RouterConfig {
                max_connections: 16,
                max_outgoing_packet_count: 200,
                max_segment_size: 1024 * 1024,
                max_segment_count: 10,
                ..Default::default()
            },
            v4: Some(
                [(
                    "redirect".to_string(),
                    rumqttd::ServerSettings {
                        name: "redirect".to_string(),
                        listen: listen_addr,
                        tls: None,
                        next_connection_delay_ms: 1,
                        connections: rumqttd::ConnectionSettings {
                            connection_timeout_ms: 5000,
                            max_payload_size: 1024 * 1024,
                            max_inflight_count: 100,
                            auth: None,
                            external_auth: None,
                            dynamic_filters: false,
                        },
                    },
                )]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_is_exactly_ten_chars_and_prefixed() {
        let id = generate_client_id();
        assert_eq!(id.len(), 10);
        assert!(id.starts_with("0cli"));
    }

    #[test]
    fn auth_falls_back_to_default_credentials_without_access_code() {
        let auth = PrinterBrokerAuth { access_code: None };
        let (user, pass) = auth.username_password();
        assert_eq!(user, DEFAULT_PRINTER_BROKER_USERNAME);
        assert_eq!(pass, DEFAULT_PRINTER_BROKER_PASSWORD);
    }

    #[test]
    fn auth_uses_access_code_as_password_when_present() {
        let auth = PrinterBrokerAuth {
            access_code: Some("9f81a2".to_string()),
        };
        let (_, pass) = auth.username_password();
        assert_eq!(pass, "9f81a2");
    }
}
