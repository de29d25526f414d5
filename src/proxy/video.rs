//! Video-plane proxy (§4.6 item 2, §6.5): serves `GET /?action=stream` on
//! `proxyVideoPort`, pulling the printer's own MJPEG stream at most once and
//! fanning it out to every attached downstream.
//!
//! Grounded on `Jackzmc-flashforge-api-server`'s `Printer::subscribe_camera`
//! (`examples/Jackzmc-flashforge-api-server/src/printer.rs`): a lazily
//! started upstream task pulls `multipart/x-mixed-replace` parts via
//! `reqwest` + `multipart_stream::parse` and republishes them on a
//! `tokio::sync::broadcast` channel every downstream subscribes to.

use crate::error::{ConnectError, Result};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures_util::StreamExt;
use multipart_stream::Part;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

const UPSTREAM_PORT: u16 = 8080;
const UPSTREAM_PATH: &str = "/?action=stream";
/// §4.6: the upstream MJPEG connection is closed this long after the last
/// downstream disconnects, not immediately (avoids thrashing on a quick
/// reconnect).
const UPSTREAM_IDLE_GRACE: Duration = Duration::from_secs(5);
/// Ring depth per downstream (§4.6): only the latest frame or two matter for
/// a live feed, so the broadcast channel itself is the ring — a lagging
/// receiver just skips ahead rather than backing anything up.
const DOWNSTREAM_RING_DEPTH: usize = 2;
const PROXY_BOUNDARY: &str = "elegoo-connect-proxy";

struct UpstreamPump {
    tx: broadcast::Sender<Part>,
    task: JoinHandle<()>,
}

#[derive(Clone)]
struct VideoState {
    printer_ip: IpAddr,
    pump: Arc<Mutex<Option<UpstreamPump>>>,
    downstream_count: Arc<AtomicUsize>,
}

/// Serves the video-plane HTTP endpoint on `bind_port` until the process
/// exits or the listener errors. One call per proxied device.
pub async fn serve(printer_ip: IpAddr, bind_port: u16) -> Result<()> {
    let state = VideoState {
        printer_ip,
        pump: Arc::new(Mutex::new(None)),
        downstream_count: Arc::new(AtomicUsize::new(0)),
    };
    let app = Router::new().route("/", get(handle_stream)).with_state(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", bind_port))
        .await
        .map_err(|e| ConnectError::ProtocolError(format!("proxy video bind failed: {e}")))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| ConnectError::ProtocolError(format!("proxy video serve failed: {e}")))
}

async fn handle_stream(State(state): State<VideoState>) -> Response {
    let mut rx = match ensure_upstream(&state).await {
        Ok(rx) => rx,
        Err(error) => {
            tracing::warn!(%error, "could not start upstream mjpeg pull");
            return (StatusCode::BAD_GATEWAY, error.to_string()).into_response();
        }
    };

    state.downstream_count.fetch_add(1, Ordering::SeqCst);
    let state_for_drop = state.clone();

    let body = Body::from_stream(async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(part) => yield Ok::<Bytes, std::io::Error>(encode_part(&part)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        on_downstream_disconnect(state_for_drop).await;
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={PROXY_BOUNDARY}"),
        )
        .body(body)
        .expect("static response parts are always valid")
}

async fn on_downstream_disconnect(state: VideoState) {
    if state.downstream_count.fetch_sub(1, Ordering::SeqCst) != 1 {
        return;
    }
    // We were the last downstream; wait out the idle grace, then tear the
    // upstream pump down if nobody reconnected in the meantime.
    tokio::time::sleep(UPSTREAM_IDLE_GRACE).await;
    if state.downstream_count.load(Ordering::SeqCst) == 0 {
        if let Some(pump) = state.pump.lock().await.take() {
            pump.task.abort();
        }
    }
}

async fn ensure_upstream(state: &VideoState) -> Result<broadcast::Receiver<Part>> {
    let mut guard = state.pump.lock().await;
    if let Some(pump) = guard.as_ref() {
        if !pump.task.is_finished() {
            return Ok(pump.tx.subscribe());
        }
    }

    let (tx, rx) = broadcast::channel(DOWNSTREAM_RING_DEPTH);
    let url = format!("http://{}:{UPSTREAM_PORT}{UPSTREAM_PATH}", state.printer_ip);
    let pump_tx = tx.clone();
    let task = tokio::spawn(async move {
        if let Err(error) = pump_upstream(url, pump_tx).await {
            tracing::warn!(%error, "upstream mjpeg pull ended");
        }
    });
    *guard = Some(UpstreamPump { tx: tx.clone(), task });
    Ok(rx)
}

async fn pump_upstream(url: String, tx: broadcast::Sender<Part>) -> Result<()> {
    let response = reqwest::get(&url)
        .await
        .map_err(|e| ConnectError::TransportReset(format!("mjpeg connect failed: {e}")))?;

    // §9 open question (c): the upstream's actual boundary is whatever its
    // own Content-Type reports, not a value we hardcode.
    let boundary = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|content_type| content_type.split("boundary=").nth(1))
        .map(|b| b.trim_matches('"').to_string())
        .ok_or_else(|| {
            ConnectError::ProtocolError("mjpeg response missing boundary parameter".to_string())
        })?;

    let byte_stream = response.bytes_stream();
    let mut parts = multipart_stream::parse(byte_stream, &boundary);
    while let Some(part) = parts.next().await {
        let part = part.map_err(|e| ConnectError::ProtocolError(format!("mjpeg demux error: {e}")))?;
        if tx.send(part).is_err() {
            break; // no subscribers left; the idle-grace task will reap us
        }
    }
    Ok(())
}

/// Re-wraps a demuxed part as a `multipart/x-mixed-replace` chunk using the
/// proxy's own boundary, since downstreams never see the printer's boundary
/// directly (§6.5).
fn encode_part(part: &Part) -> Bytes {
    let mut out = Vec::with_capacity(part.body.len() + 128);
    out.extend_from_slice(format!("--{PROXY_BOUNDARY}\r\n").as_bytes());
    out.extend_from_slice(b"Content-Type: image/jpeg\r\n");
    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", part.body.len()).as_bytes());
    out.extend_from_slice(&part.body);
    out.extend_from_slice(b"\r\n");
    Bytes::from(out)
}
