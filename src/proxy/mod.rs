//! Local multiplexing proxy (§4.6): a dual-endpoint service — control-plane
//! WebSocket and video-plane MJPEG HTTP — that lets several downstream
//! consumers share one upstream [`crate::session::Session`] / printer
//! connection. An enabled proxy substitutes `ip=localhost`,
//! `ws-port=proxyWsPort`, `video-port=proxyVideoPort` from the caller's
//! perspective, freeing the real upstream slot for other tools.

pub mod control;
pub mod video;

use crate::error::Result;
use crate::session::Session;
use std::net::IpAddr;

/// Runs both proxy endpoints concurrently until either errors or the process
/// exits. The two endpoints are independent services with no shared state
/// beyond the `Session`/printer IP they each read from.
pub async fn run(
    session: Session,
    printer_ip: IpAddr,
    control_port: u16,
    video_port: u16,
) -> Result<()> {
    let control = control::serve(session, control_port);
    let video = video::serve(printer_ip, video_port);
    tokio::try_join!(control, video)?;
    Ok(())
}
