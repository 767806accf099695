//! Outbound action dispatcher
//!
//! The client role of the wire protocol. The operator surface calls
//! [`ActionDispatcher::dispatch_action`], which applies the state-transition
//! policy, connects to the device listener, authenticates, sends the command
//! and returns the correlated reply. The first REGULAR message after the
//! command goes out is treated as its reply.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::crypto::mac;
use crate::protocol::frame::{self, FrameError};
use crate::protocol::handshake::{ChallengePayload, ClientHandshake, HandshakeError};
use crate::protocol::{
    commands, pack_application, pack_presentation, pack_session, unpack_application,
    unpack_presentation, unpack_session, CodecError, ControlAction, DeviceState, MessageType,
};
use crate::registry::DeviceRegistry;
use crate::telemetry::{now_ts, TelemetrySink};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const HOP_TIMEOUT: Duration = Duration::from_millis(500);
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE_LINGER: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("device {0} is not provisioned")]
    DeviceNotProvisioned(String),
    #[error("no recorded state for device {0}")]
    UnknownDeviceState(String),
    #[error("action {action} is not permitted in state {state}")]
    InvalidTransition {
        action: OperatorAction,
        state: DeviceState,
    },
    #[error("connect to the device listener timed out")]
    ConnectTimeout,
    #[error("handshake timed out")]
    AuthTimeout,
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("unexpected message type 0x{0:02X} during handshake")]
    UnexpectedMessage(u8),
    #[error("timed out waiting for the device reply")]
    ReplyTimeout,
    #[error("connection closed before the reply arrived")]
    ConnectionClosed,
    #[error("device rejected the command: {0}")]
    DeviceRejected(String),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("malformed reply: {0}")]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Operator intents accepted by the action façade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorAction {
    Start,
    Stop,
    Home,
    AckError,
}

impl OperatorAction {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "start" => Some(OperatorAction::Start),
            "stop" => Some(OperatorAction::Stop),
            "home" => Some(OperatorAction::Home),
            "ackerror" => Some(OperatorAction::AckError),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperatorAction::Start => "start",
            OperatorAction::Stop => "stop",
            OperatorAction::Home => "home",
            OperatorAction::AckError => "ackerror",
        }
    }

    /// Operator-facing pre-condition table. The device remains the authority;
    /// this only rejects requests that cannot possibly apply.
    pub fn permitted_in(self, state: DeviceState) -> bool {
        use DeviceState::*;
        use OperatorAction::*;
        matches!(
            (state, self),
            (StationCharging, Start)
                | (StationChargingCompleted, Start)
                | (Mowing, Stop)
                | (Mowing, Home)
                | (ReturningToStation, Stop)
                | (Paused, Start)
                | (Paused, Home)
                | (Error, AckError)
        )
    }

    /// Wire command and body for this action.
    pub fn wire(self) -> (u8, Vec<u8>) {
        match self {
            OperatorAction::Start => (
                commands::CONTROL_DEVICE,
                vec![ControlAction::Start.as_byte()],
            ),
            OperatorAction::Stop => (
                commands::CONTROL_DEVICE,
                vec![ControlAction::Stop.as_byte()],
            ),
            OperatorAction::Home => (
                commands::CONTROL_DEVICE,
                vec![ControlAction::Home.as_byte()],
            ),
            OperatorAction::AckError => (commands::ACK_ERROR, Vec::new()),
        }
    }

    /// State persisted once the device confirms the action.
    pub fn expected_state(self) -> DeviceState {
        match self {
            OperatorAction::Start => DeviceState::Mowing,
            OperatorAction::Stop => DeviceState::Paused,
            OperatorAction::Home => DeviceState::ReturningToStation,
            OperatorAction::AckError => DeviceState::Paused,
        }
    }
}

impl std::fmt::Display for OperatorAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reply returned by the device for a dispatched command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolReply {
    pub iin: u16,
    pub command: u8,
    pub body: Vec<u8>,
}

/// Result of a successful `dispatch_action`
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub previous_state: DeviceState,
    pub new_state: DeviceState,
    pub ts: u64,
    pub reply: ProtocolReply,
}

/// Outbound command client with a per-instance IIN counter starting at 1.
pub struct ActionDispatcher {
    registry: Arc<DeviceRegistry>,
    sink: Arc<dyn TelemetrySink>,
    next_iin: AtomicU16,
}

impl ActionDispatcher {
    pub fn new(registry: Arc<DeviceRegistry>, sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            registry,
            sink,
            next_iin: AtomicU16::new(1),
        }
    }

    fn take_iin(&self) -> u16 {
        self.next_iin.fetch_add(1, Ordering::Relaxed)
    }

    /// Send one raw command to a device and return the correlated reply.
    pub async fn dispatch(
        &self,
        device_id: &str,
        command: u8,
        body: &[u8],
    ) -> Result<ProtocolReply, DispatchError> {
        let port = self
            .registry
            .get_device(device_id)
            .ok_or_else(|| DispatchError::DeviceNotProvisioned(device_id.to_string()))?
            .port;

        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(("127.0.0.1", port)))
            .await
            .map_err(|_| DispatchError::ConnectTimeout)??;
        let mut buf = BytesMut::with_capacity(1024);

        let shared = timeout(HANDSHAKE_TIMEOUT, authenticate(&mut stream, &mut buf))
            .await
            .map_err(|_| DispatchError::AuthTimeout)??;
        debug!("Authenticated against {} listener", device_id);

        let iin = self.take_iin();
        let pres = pack_presentation(iin, &pack_application(command, body));
        let session = pack_session(mac(shared, &pres), MessageType::Regular.as_byte(), &pres);
        stream.write_all(&frame::encode(&session)?).await?;

        let reply = timeout(REPLY_TIMEOUT, await_regular(&mut stream, &mut buf))
            .await
            .map_err(|_| DispatchError::ReplyTimeout)??;

        // Graceful close: stop writing, give the peer a moment, then drop.
        let _ = stream.shutdown().await;
        tokio::time::sleep(CLOSE_LINGER).await;
        drop(stream);

        Ok(reply)
    }

    /// Apply the operator pre-condition table, forward the action, and on
    /// success persist the expected state change.
    pub async fn dispatch_action(
        &self,
        device_id: &str,
        action: OperatorAction,
    ) -> Result<ActionOutcome, DispatchError> {
        let previous_state = self
            .sink
            .latest_state(device_id)
            .ok_or_else(|| DispatchError::UnknownDeviceState(device_id.to_string()))?;

        if !action.permitted_in(previous_state) {
            return Err(DispatchError::InvalidTransition {
                action,
                state: previous_state,
            });
        }

        let (command, body) = action.wire();
        let reply = self.dispatch(device_id, command, &body).await?;
        if reply.command == commands::ERROR_RESPONSE {
            return Err(DispatchError::DeviceRejected(
                String::from_utf8_lossy(&reply.body).into_owned(),
            ));
        }

        let new_state = action.expected_state();
        let ts = now_ts();
        if let Err(e) = self.sink.record_state(device_id, new_state, ts) {
            tracing::error!("Telemetry sink error for {}: {}", device_id, e);
        }
        info!(
            "Action {} on {}: {} -> {}",
            action, device_id, previous_state, new_state
        );

        Ok(ActionOutcome {
            previous_state,
            new_state,
            ts,
            reply,
        })
    }
}

/// Client-side handshake: HELLO out, CHALLENGE in (verified), CLIENT_AUTH
/// out. Returns the derived shared secret.
async fn authenticate(stream: &mut TcpStream, buf: &mut BytesMut) -> Result<u32, DispatchError> {
    let hs = ClientHandshake::new(&mut rand::thread_rng());
    let hello = pack_session(0, MessageType::Hello.as_byte(), &hs.hello());
    stream.write_all(&frame::encode(&hello)?).await?;

    let payload = timeout(HOP_TIMEOUT, read_frame(stream, buf))
        .await
        .map_err(|_| DispatchError::AuthTimeout)??;
    let msg = unpack_session(&payload)?;
    if msg.msg_type != MessageType::Challenge.as_byte() {
        return Err(DispatchError::UnexpectedMessage(msg.msg_type));
    }
    // The challenge rides in a presentation wrapper with IIN 0.
    let (_, challenge_body) = unpack_presentation(msg.body)?;
    let challenge = ChallengePayload::parse(challenge_body)?;
    let (client_auth, shared) = hs.answer_challenge(&challenge)?;

    let auth = pack_session(
        0,
        MessageType::ClientAuth.as_byte(),
        &client_auth.to_be_bytes(),
    );
    stream.write_all(&frame::encode(&auth)?).await?;
    Ok(shared)
}

/// Read one complete frame payload from the stream.
async fn read_frame(stream: &mut TcpStream, buf: &mut BytesMut) -> Result<Vec<u8>, DispatchError> {
    loop {
        if let Some(decoded) = frame::decode(&buf[..])? {
            buf.advance(decoded.consumed);
            return Ok(decoded.payload);
        }
        if stream.read_buf(buf).await? == 0 {
            // Distinguish a mid-frame close from a clean one.
            frame::decode_eof(&buf[..])?;
            return Err(DispatchError::ConnectionClosed);
        }
    }
}

/// Read frames until the first REGULAR message and unpack it as the reply.
async fn await_regular(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
) -> Result<ProtocolReply, DispatchError> {
    loop {
        let payload = read_frame(stream, buf).await?;
        let msg = unpack_session(&payload)?;
        if msg.msg_type != MessageType::Regular.as_byte() {
            debug!(
                "Skipping message type 0x{:02X} while awaiting the reply",
                msg.msg_type
            );
            continue;
        }
        let (iin, app) = unpack_presentation(msg.body)?;
        let (command, body) = unpack_application(app)?;
        return Ok(ProtocolReply {
            iin,
            command,
            body: body.to_vec(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Device;
    use crate::server::accept_loop;
    use crate::session::AppState;
    use crate::telemetry::InMemoryTelemetry;
    use tokio::net::TcpListener;
    use tokio::sync::watch;

    #[test]
    fn test_precondition_table() {
        use DeviceState::*;
        use OperatorAction::*;

        let allowed = [
            (StationCharging, Start),
            (StationChargingCompleted, Start),
            (Mowing, Stop),
            (Mowing, Home),
            (ReturningToStation, Stop),
            (Paused, Start),
            (Paused, Home),
            (Error, AckError),
        ];
        for (state, action) in allowed {
            assert!(action.permitted_in(state), "{action} in {state}");
        }

        assert!(!Start.permitted_in(Mowing));
        assert!(!Home.permitted_in(StationCharging));
        assert!(!AckError.permitted_in(Paused));
        assert!(!Stop.permitted_in(Error));
    }

    #[test]
    fn test_wire_mapping() {
        assert_eq!(OperatorAction::Start.wire(), (0x01, vec![0x01]));
        assert_eq!(OperatorAction::Stop.wire(), (0x01, vec![0x00]));
        assert_eq!(OperatorAction::Home.wire(), (0x01, vec![0x02]));
        assert_eq!(OperatorAction::AckError.wire(), (0x02, vec![]));

        assert_eq!(OperatorAction::parse("home"), Some(OperatorAction::Home));
        assert_eq!(OperatorAction::parse("fly"), None);
    }

    struct Fixture {
        registry: Arc<DeviceRegistry>,
        sink: Arc<InMemoryTelemetry>,
        _shutdown: watch::Sender<bool>,
    }

    /// Bind a device listener on an ephemeral port and run its accept loop.
    async fn start_listener(device_id: &str) -> Fixture {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let registry = Arc::new(DeviceRegistry::from_devices(vec![Device {
            device_id: device_id.to_string(),
            display_name: "Test mower".into(),
            serial: "SN-TEST".into(),
            port,
        }]));
        let sink = Arc::new(InMemoryTelemetry::new());
        let state = Arc::new(AppState::new(sink.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(accept_loop(
            listener,
            device_id.to_string(),
            state,
            shutdown_rx,
        ));

        Fixture {
            registry,
            sink,
            _shutdown: shutdown_tx,
        }
    }

    #[tokio::test]
    async fn test_dispatch_action_start() {
        let fx = start_listener("mower-01").await;
        fx.sink
            .seed_state("mower-01", DeviceState::StationCharging, 1);

        let dispatcher = ActionDispatcher::new(fx.registry.clone(), fx.sink.clone());
        let outcome = dispatcher
            .dispatch_action("mower-01", OperatorAction::Start)
            .await
            .unwrap();

        assert_eq!(outcome.previous_state, DeviceState::StationCharging);
        assert_eq!(outcome.new_state, DeviceState::Mowing);
        assert_eq!(outcome.reply.command, 0x81);
        assert_eq!(outcome.reply.iin, 1);
        assert_eq!(fx.sink.latest_state("mower-01"), Some(DeviceState::Mowing));
    }

    #[tokio::test]
    async fn test_dispatch_action_rejects_invalid_transition() {
        let fx = start_listener("mower-02").await;
        fx.sink.seed_state("mower-02", DeviceState::Mowing, 1);

        let dispatcher = ActionDispatcher::new(fx.registry.clone(), fx.sink.clone());
        let err = dispatcher
            .dispatch_action("mower-02", OperatorAction::Start)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidTransition { .. }));
        // The state stays untouched.
        assert_eq!(fx.sink.latest_state("mower-02"), Some(DeviceState::Mowing));
    }

    #[tokio::test]
    async fn test_dispatch_unknown_device() {
        let fx = start_listener("mower-03").await;
        let dispatcher = ActionDispatcher::new(fx.registry.clone(), fx.sink.clone());

        let err = dispatcher
            .dispatch("mower-99", commands::HEARTBEAT, b"")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::DeviceNotProvisioned(_)));
    }

    #[tokio::test]
    async fn test_heartbeat_roundtrip_echoes_body() {
        let fx = start_listener("mower-04").await;
        let dispatcher = ActionDispatcher::new(fx.registry.clone(), fx.sink.clone());

        let reply = dispatcher
            .dispatch("mower-04", commands::HEARTBEAT, b"ping")
            .await
            .unwrap();
        assert_eq!(reply.command, 0x80);
        assert_eq!(reply.body, b"ping");
    }

    #[tokio::test]
    async fn test_iin_counter_advances_per_dispatch() {
        let fx = start_listener("mower-05").await;
        let dispatcher = ActionDispatcher::new(fx.registry.clone(), fx.sink.clone());

        for expected_iin in 1..=3u16 {
            let reply = dispatcher
                .dispatch("mower-05", commands::HEARTBEAT, &[])
                .await
                .unwrap();
            assert_eq!(reply.iin, expected_iin);
        }
    }

    #[tokio::test]
    async fn test_many_heartbeats_on_one_connection() {
        let fx = start_listener("mower-06").await;
        let port = fx.registry.get_device("mower-06").unwrap().port;

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = BytesMut::with_capacity(1024);
        let shared = authenticate(&mut stream, &mut buf).await.unwrap();

        for iin in 1..=100u16 {
            let pres = pack_presentation(iin, &pack_application(commands::HEARTBEAT, &[0xAB]));
            let session = pack_session(mac(shared, &pres), MessageType::Regular.as_byte(), &pres);
            stream.write_all(&frame::encode(&session).unwrap()).await.unwrap();

            let reply = await_regular(&mut stream, &mut buf).await.unwrap();
            assert_eq!(reply.iin, iin);
            assert_eq!(reply.command, 0x80);
            assert_eq!(reply.body, vec![0xAB]);
        }
    }

    #[tokio::test]
    async fn test_garbage_then_valid_frame_recovers() {
        let fx = start_listener("mower-07").await;
        let port = fx.registry.get_device("mower-07").unwrap().port;

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        // Garbage with a bad SOF: the server drops its buffer and keeps the
        // connection alive.
        stream.write_all(&[0x00, 0x01, 0x02]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut buf = BytesMut::with_capacity(1024);
        let shared = authenticate(&mut stream, &mut buf).await.unwrap();
        assert_ne!(shared, 0);
    }
}
