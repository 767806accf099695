//! TCP server implementation
//!
//! One listener per provisioned device. Every accepted socket runs its own
//! task: read into a buffer, decode frames, hand payloads to the `Session`,
//! write back replies. Decode errors drop the whole receive buffer and the
//! connection carries on from the next bytes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::protocol::frame;
use crate::registry::DeviceRegistry;
use crate::session::{AppState, Session};
use crate::telemetry::{events, now_ts, Severity, TelemetrySink};

/// A socket with no inbound bytes for this long is destroyed.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_millis(2000);

/// Run listeners for every provisioned device until ctrl-c.
pub async fn run(registry: Arc<DeviceRegistry>, sink: Arc<dyn TelemetrySink>) -> Result<()> {
    let state = Arc::new(AppState::new(sink.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut accept_tasks = Vec::new();
    for device in registry.list_provisioned_devices() {
        let addr = format!("0.0.0.0:{}", device.port);
        match TcpListener::bind(&addr).await {
            Ok(listener) => {
                info!("Listening for {} on {}", device.device_id, addr);
                accept_tasks.push(tokio::spawn(accept_loop(
                    listener,
                    device.device_id.clone(),
                    state.clone(),
                    shutdown_rx.clone(),
                )));
            }
            Err(e) => {
                error!("Failed to bind {} for {}: {}", addr, device.device_id, e);
                let _ = sink.record_log(
                    &device.device_id,
                    Severity::Error,
                    events::LISTENER_BIND_ERROR,
                    &format!("bind {addr} failed: {e}"),
                    now_ts(),
                );
            }
        }
    }

    if accept_tasks.is_empty() {
        warn!("No device listener is active");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, closing sessions...");
    let _ = shutdown_tx.send(true);
    for task in accept_tasks {
        let _ = task.await;
    }
    Ok(())
}

/// Accept connections for one device until shutdown is signalled.
pub async fn accept_loop(
    listener: TcpListener,
    device_id: String,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            result = listener.accept() => match result {
                Ok((stream, addr)) => {
                    let state = state.clone();
                    let device_id = device_id.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, addr, device_id, state, shutdown).await;
                    });
                }
                Err(e) => {
                    error!("Accept error for {}: {}", device_id, e);
                }
            }
        }
    }
}

/// Handle a single device connection until it closes, errors, times out or
/// the server shuts down.
async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    device_id: String,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("New connection for {} from {}", device_id, addr);
    let sink = state.sink.clone();
    log_event(
        &*sink,
        &device_id,
        Severity::Information,
        events::CONNECTION_ATTEMPT,
        &format!("connection from {addr}"),
    );

    let mut session = Session::new(device_id.clone(), state);
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("Closing connection to {} for shutdown", device_id);
                log_event(
                    &*sink,
                    &device_id,
                    Severity::Information,
                    events::CONNECTION_CLOSED,
                    "server shutting down",
                );
                break;
            }
            read = tokio::time::timeout(INACTIVITY_TIMEOUT, stream.read_buf(&mut buf)) => {
                match read {
                    Err(_) => {
                        warn!("Connection to {} timed out", device_id);
                        log_event(
                            &*sink,
                            &device_id,
                            Severity::Warning,
                            events::CONNECTION_TIMEOUT,
                            "no data for 2000 ms",
                        );
                        break;
                    }
                    Ok(Ok(0)) => {
                        info!("Device {} disconnected", device_id);
                        log_event(
                            &*sink,
                            &device_id,
                            Severity::Information,
                            events::CONNECTION_CLOSED,
                            "peer closed the connection",
                        );
                        break;
                    }
                    Ok(Ok(_)) => {
                        if !drain_frames(&mut stream, &mut buf, &mut session, &*sink).await {
                            break;
                        }
                    }
                    Ok(Err(e)) => {
                        error!("Socket error on connection to {}: {}", device_id, e);
                        log_event(
                            &*sink,
                            &device_id,
                            Severity::Error,
                            events::CONNECTION_ERROR,
                            &format!("socket error: {e}"),
                        );
                        break;
                    }
                }
            }
        }
    }
}

/// Decode and handle every complete frame in the buffer. Returns `false`
/// when the connection must close.
async fn drain_frames(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    session: &mut Session,
    sink: &dyn TelemetrySink,
) -> bool {
    loop {
        match frame::decode(&buf[..]) {
            Ok(None) => return true,
            Ok(Some(decoded)) => {
                buf.advance(decoded.consumed);
                let handled = session.handle_payload(&decoded.payload);
                if let Some(reply) = handled.reply {
                    if let Err(e) = stream.write_all(&reply).await {
                        error!(
                            "Write error on connection to {}: {}",
                            session.device_id(),
                            e
                        );
                        log_event(
                            sink,
                            session.device_id(),
                            Severity::Error,
                            events::CONNECTION_ERROR,
                            &format!("write error: {e}"),
                        );
                        return false;
                    }
                }
                if handled.close {
                    log_event(
                        sink,
                        session.device_id(),
                        Severity::Information,
                        events::CONNECTION_CLOSED,
                        "session closed by protocol",
                    );
                    return false;
                }
            }
            Err(e) => {
                error!("Invalid frame from {}: {}", session.device_id(), e);
                log_event(
                    sink,
                    session.device_id(),
                    Severity::Error,
                    events::INVALID_FRAME,
                    &format!("{e}"),
                );
                // Resynchronize by discarding everything buffered.
                buf.clear();
                return true;
            }
        }
    }
}

fn log_event(
    sink: &dyn TelemetrySink,
    device_id: &str,
    severity: Severity,
    event_type: &str,
    message: &str,
) {
    if let Err(e) = sink.record_log(device_id, severity, event_type, message, now_ts()) {
        error!("Telemetry sink error for {}: {}", device_id, e);
    }
}
