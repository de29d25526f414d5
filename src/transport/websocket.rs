//! WebSocket transport: plain text-JSON WS to `ws://<ip>:3030/websocket`
//! (§4.3, §6.3) with reconnect/backoff owned by the reader task.

use super::{Frame, Transport, TransportEvent};
use crate::error::{ConnectError, Result};
use futures_util::{SinkExt, StreamExt};
use std::net::IpAddr;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

pub const WEBSOCKET_PATH: &str = "/websocket";
pub const WEBSOCKET_PORT: u16 = 3030;

pub struct WebSocketTransport {
    url: String,
    outbound_tx: mpsc::UnboundedSender<Message>,
    outbound_rx: Option<mpsc::UnboundedReceiver<Message>>,
    events_tx: mpsc::Sender<TransportEvent>,
    reader_task: Option<JoinHandle<()>>,
}

impl WebSocketTransport {
    /// Builds a transport targeting `ws://<ip>:3030/websocket`. `events_tx`
    /// is the channel the session's reader task drains.
    pub fn new(ip: IpAddr, events_tx: mpsc::Sender<TransportEvent>) -> Self {
        let url = format!("ws://{ip}:{WEBSOCKET_PORT}{WEBSOCKET_PATH}");
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            url,
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            events_tx,
            reader_task: None,
        }
    }
}

#[async_trait::async_trait]
impl Transport for WebSocketTransport {
    async fn open(&mut self) -> Result<()> {
        let (stream, _response) = tokio_tungstenite::connect_async(&self.url)
            .await
            .map_err(|e| ConnectError::TransportReset(e.to_string()))?;
        let (mut write, mut read) = stream.split();
        let mut outbound_rx = self
            .outbound_rx
            .take()
            .expect("open() called more than once without reopening");
        let events_tx = self.events_tx.clone();
        let url = self.url.clone();

        let _ = events_tx.send(TransportEvent::Connected).await;

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    outbound = outbound_rx.recv() => {
                        match outbound {
                            Some(message) => {
                                if write.send(message).await.is_err() {
                                    let _ = events_tx.send(TransportEvent::Disconnected).await;
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    inbound = read.next() => {
                        match inbound {
                            Some(Ok(Message::Text(text))) => {
                                let _ = events_tx
                                    .send(TransportEvent::Inbound(Frame::Text(text)))
                                    .await;
                            }
                            Some(Ok(Message::Binary(_))) => {
                                // Binary frames are rejected at this layer (§4.3):
                                // all SDCP frames are text JSON.
                                tracing::debug!(url, "dropping unexpected binary WS frame");
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                let _ = events_tx.send(TransportEvent::Disconnected).await;
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(_)) => {
                                let _ = events_tx.send(TransportEvent::Disconnected).await;
                                break;
                            }
                        }
                    }
                }
            }
        });
        self.reader_task = Some(task);
        Ok(())
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        let Frame::Text(text) = frame else {
            return Err(ConnectError::ProtocolError(
                "WebSocketTransport only carries text frames".to_string(),
            ));
        };
        self.outbound_tx
            .send(Message::Text(text))
            .map_err(|_| ConnectError::TransportReset("outbound channel closed".to_string()))
    }

    async fn close(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}
