//! Per-connection session management
//!
//! A `Session` owns the protocol state for one accepted socket: the
//! authentication phase, the handshake material, and the shared secret that
//! keys post-handshake traffic. The socket loop in `server.rs` feeds it one
//! frame payload at a time and writes back whatever it returns.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::crypto::mac;
use crate::protocol::frame;
use crate::protocol::handshake::{parse_client_auth, parse_hello, AuthPhase, ServerHandshake};
use crate::protocol::{
    commands, notifications, pack_application, pack_presentation, pack_session,
    unpack_application, unpack_presentation, unpack_session, ControlAction, DeviceState,
    MessageType, BYPASS_HMAC,
};
use crate::telemetry::{events, now_ts, Severity, SinkError, TelemetrySink};

/// Shared application state handed to every session
pub struct AppState {
    pub sink: Arc<dyn TelemetrySink>,
}

impl AppState {
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        Self { sink }
    }
}

/// What the socket loop should do after a payload was handled.
#[derive(Debug, Default)]
pub struct Handled {
    pub reply: Option<Vec<u8>>,
    pub close: bool,
}

impl Handled {
    fn none() -> Self {
        Self::default()
    }

    fn reply(frame: Vec<u8>) -> Self {
        Self {
            reply: Some(frame),
            close: false,
        }
    }

    fn close() -> Self {
        Self {
            reply: None,
            close: true,
        }
    }
}

/// Per-connection session
pub struct Session {
    device_id: String,
    state: Arc<AppState>,
    phase: AuthPhase,
    handshake: Option<ServerHandshake>,
    shared_secret: Option<u32>,
}

impl Session {
    pub fn new(device_id: String, state: Arc<AppState>) -> Self {
        Self {
            device_id,
            state,
            phase: AuthPhase::AwaitingHello,
            handshake: None,
            shared_secret: None,
        }
    }

    pub fn phase(&self) -> AuthPhase {
        self.phase
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Handle one decoded frame payload, returning the reply frame (if any)
    /// and whether the connection must close.
    pub fn handle_payload(&mut self, payload: &[u8]) -> Handled {
        let msg = match unpack_session(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!("Unparseable session message from {}: {}", self.device_id, e);
                self.log_event(
                    Severity::Warning,
                    events::UNKNOWN_MESSAGE_TYPE,
                    &format!("unparseable session message: {e}"),
                );
                return Handled::none();
            }
        };

        match MessageType::from_byte(msg.msg_type) {
            // Notifications are device-originated telemetry and are accepted
            // in every phase.
            Some(MessageType::Notification) => {
                self.handle_notification(msg.body);
                Handled::none()
            }
            Some(MessageType::Hello) => self.handle_hello(msg.body),
            Some(MessageType::ClientAuth) => self.handle_client_auth(msg.body),
            Some(MessageType::Regular) => self.handle_regular(msg.hmac, msg.body),
            Some(MessageType::Challenge) => {
                warn!("Unexpected CHALLENGE from {}", self.device_id);
                self.log_event(
                    Severity::Warning,
                    events::UNKNOWN_MESSAGE_TYPE,
                    "unexpected CHALLENGE from device",
                );
                Handled::none()
            }
            None => {
                warn!(
                    "Unknown message type 0x{:02X} from {}",
                    msg.msg_type, self.device_id
                );
                self.log_event(
                    Severity::Warning,
                    events::UNKNOWN_MESSAGE_TYPE,
                    &format!("message type 0x{:02X}", msg.msg_type),
                );
                Handled::none()
            }
        }
    }

    fn handle_hello(&mut self, body: &[u8]) -> Handled {
        if self.phase != AuthPhase::AwaitingHello {
            warn!("HELLO from {} in phase {:?}", self.device_id, self.phase);
            return Handled::none();
        }

        let client_public = match parse_hello(body) {
            Ok(p) => p,
            Err(e) => {
                error!("Malformed HELLO from {}: {}", self.device_id, e);
                self.log_event(Severity::Error, events::AUTH_FAILED, &format!("{e}"));
                self.phase = AuthPhase::Closed;
                return Handled::close();
            }
        };

        let hs = ServerHandshake::start(client_public, &mut rand::thread_rng());
        let pres = pack_presentation(0, &hs.challenge().to_bytes());
        let session = pack_session(0, MessageType::Challenge.as_byte(), &pres);
        self.handshake = Some(hs);
        self.phase = AuthPhase::AwaitingClientAuth;

        debug!("Challenging {}", self.device_id);
        self.log_event(
            Severity::Information,
            events::AUTH_CHALLENGE_SENT,
            "authentication challenge sent",
        );

        match frame::encode(&session) {
            Ok(f) => Handled::reply(f),
            Err(e) => {
                error!("Failed to encode challenge for {}: {}", self.device_id, e);
                Handled::close()
            }
        }
    }

    fn handle_client_auth(&mut self, body: &[u8]) -> Handled {
        if self.phase != AuthPhase::AwaitingClientAuth {
            warn!("CLIENT_AUTH from {} in phase {:?}", self.device_id, self.phase);
            return Handled::none();
        }
        let Some(hs) = self.handshake.as_ref() else {
            return Handled::none();
        };

        let auth = match parse_client_auth(body) {
            Ok(a) => a,
            Err(e) => {
                error!("Malformed CLIENT_AUTH from {}: {}", self.device_id, e);
                self.log_event(Severity::Error, events::AUTH_FAILED, &format!("{e}"));
                self.phase = AuthPhase::Closed;
                return Handled::close();
            }
        };

        match hs.verify_client_auth(auth) {
            Ok(shared) => {
                self.shared_secret = Some(shared);
                self.phase = AuthPhase::Authenticated;
                info!("Device {} authenticated", self.device_id);
                self.log_event(
                    Severity::Information,
                    events::AUTH_SUCCESS,
                    "device authenticated",
                );
                Handled::none()
            }
            Err(e) => {
                error!("Authentication failed for {}: {}", self.device_id, e);
                self.log_event(
                    Severity::Error,
                    events::AUTH_FAILED,
                    "client authenticator mismatch",
                );
                self.phase = AuthPhase::Closed;
                Handled::close()
            }
        }
    }

    fn handle_regular(&mut self, hmac: u32, body: &[u8]) -> Handled {
        if self.phase != AuthPhase::Authenticated && hmac != BYPASS_HMAC {
            warn!(
                "REGULAR message from unauthenticated {} dropped",
                self.device_id
            );
            self.log_event(
                Severity::Warning,
                events::UNAUTHENTICATED_MESSAGE,
                "REGULAR message before authentication",
            );
            return Handled::none();
        }

        let (iin, app) = match unpack_presentation(body) {
            Ok(v) => v,
            Err(e) => {
                warn!("Malformed presentation from {}: {}", self.device_id, e);
                self.log_event(
                    Severity::Warning,
                    events::UNKNOWN_MESSAGE_TYPE,
                    &format!("{e}"),
                );
                return Handled::none();
            }
        };
        let (command, cmd_body) = match unpack_application(app) {
            Ok(v) => v,
            Err(e) => {
                warn!("Malformed application message from {}: {}", self.device_id, e);
                self.log_event(
                    Severity::Warning,
                    events::UNKNOWN_MESSAGE_TYPE,
                    &format!("{e}"),
                );
                return Handled::none();
            }
        };

        match command {
            commands::HEARTBEAT => {
                debug!("Heartbeat from {}", self.device_id);
                self.log_event(
                    Severity::Information,
                    events::HEARTBEAT_RESPONSE,
                    "heartbeat echoed",
                );
                self.build_reply(iin, commands::HEARTBEAT | commands::RESPONSE_FLAG, cmd_body)
            }

            commands::CONTROL_DEVICE => {
                match cmd_body.first().and_then(|&b| ControlAction::from_byte(b)) {
                    Some(action) => {
                        let new_state = action.resulting_state();
                        info!(
                            "Control command {:?} for {} -> {}",
                            action, self.device_id, new_state
                        );
                        self.record_state(new_state);
                        self.log_event(
                            Severity::Information,
                            events::CONTROL_COMMAND,
                            &format!("{action:?} confirmed, state {new_state}"),
                        );
                        self.build_reply(
                            iin,
                            commands::CONTROL_DEVICE | commands::RESPONSE_FLAG,
                            &[],
                        )
                    }
                    None => {
                        warn!("Invalid control command body from {}", self.device_id);
                        self.build_reply(
                            iin,
                            commands::ERROR_RESPONSE,
                            b"Invalid control command",
                        )
                    }
                }
            }

            commands::ACK_ERROR => {
                info!("Error acknowledged for {}", self.device_id);
                self.record_state(DeviceState::Paused);
                self.log_event(
                    Severity::Information,
                    events::ACK_ERROR,
                    "error acknowledged, state Paused",
                );
                self.build_reply(iin, commands::ACK_ERROR | commands::RESPONSE_FLAG, &[])
            }

            commands::RESET_BLADE_TIME => {
                info!("Blade time reset for {}", self.device_id);
                self.guard(self.state.sink.record_blade_reset(&self.device_id, now_ts()));
                self.log_event(
                    Severity::Information,
                    events::RESET_BLADE_TIME,
                    "blade time reset",
                );
                self.build_reply(
                    iin,
                    commands::RESET_BLADE_TIME | commands::RESPONSE_FLAG,
                    &[],
                )
            }

            other => {
                warn!("Unknown command 0x{:02X} from {}", other, self.device_id);
                self.log_event(
                    Severity::Warning,
                    events::UNKNOWN_COMMAND,
                    &format!("command 0x{other:02X}"),
                );
                Handled::none()
            }
        }
    }

    fn handle_notification(&self, body: &[u8]) {
        let Some((&ntype, rest)) = body.split_first() else {
            warn!("Empty notification from {}", self.device_id);
            self.log_event(
                Severity::Warning,
                events::UNKNOWN_NOTIFICATION,
                "empty notification body",
            );
            return;
        };

        match ntype {
            notifications::DEVICE_STATUS => {
                if rest.len() < 6 {
                    warn!(
                        "Truncated status notification from {} ({} bytes)",
                        self.device_id,
                        rest.len()
                    );
                    self.log_event(
                        Severity::Warning,
                        events::STATUS_UPDATE,
                        "truncated status notification dropped",
                    );
                    return;
                }
                let battery = rest[0] as f32 / 2.0;
                let blade_seconds = u32::from_be_bytes([rest[1], rest[2], rest[3], rest[4]]);
                let Some(state) = DeviceState::from_code(rest[5]) else {
                    warn!(
                        "Unknown state code 0x{:02X} from {}",
                        rest[5], self.device_id
                    );
                    self.log_event(
                        Severity::Warning,
                        events::STATUS_UPDATE,
                        &format!("unknown state code 0x{:02X}", rest[5]),
                    );
                    return;
                };

                let ts = now_ts();
                self.guard(self.state.sink.record_battery(&self.device_id, battery, ts));
                self.guard(self.state.sink.record_state(&self.device_id, state, ts));
                debug!(
                    "Status from {}: battery {}% state {} blade {}s",
                    self.device_id, battery, state, blade_seconds
                );
                self.log_event(
                    Severity::Information,
                    events::STATUS_UPDATE,
                    &format!("battery {battery}%, state {state}, blade {blade_seconds}s"),
                );
            }

            notifications::POSITION_UPDATE => {
                if rest.len() < 12 {
                    warn!(
                        "Truncated position notification from {} ({} bytes)",
                        self.device_id,
                        rest.len()
                    );
                    self.log_event(
                        Severity::Warning,
                        events::POSITION_UPDATE,
                        "truncated position notification dropped",
                    );
                    return;
                }
                let ts = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as u64;
                let latitude = f32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]);
                let longitude = f32::from_be_bytes([rest[8], rest[9], rest[10], rest[11]]);

                self.guard(
                    self.state
                        .sink
                        .record_position(&self.device_id, latitude, longitude, ts),
                );
                debug!(
                    "Position from {}: {:.5}, {:.5}",
                    self.device_id, latitude, longitude
                );
                self.log_event(
                    Severity::Information,
                    events::POSITION_UPDATE,
                    &format!("position {latitude:.5}, {longitude:.5}"),
                );
            }

            other => {
                warn!(
                    "Unknown notification 0x{:02X} from {}",
                    other, self.device_id
                );
                self.log_event(
                    Severity::Warning,
                    events::UNKNOWN_NOTIFICATION,
                    &format!("notification 0x{other:02X}"),
                );
            }
        }
    }

    /// Build a response frame with the request's IIN. On an authenticated
    /// connection the HMAC keys with the shared secret; otherwise the message
    /// was admitted through the bypass constant and the reply carries it too.
    fn build_reply(&self, iin: u16, command: u8, body: &[u8]) -> Handled {
        let pres = pack_presentation(iin, &pack_application(command, body));
        let hmac = match self.shared_secret {
            Some(secret) if self.phase == AuthPhase::Authenticated => mac(secret, &pres),
            _ => BYPASS_HMAC,
        };
        let session = pack_session(hmac, MessageType::Regular.as_byte(), &pres);
        match frame::encode(&session) {
            Ok(f) => Handled::reply(f),
            Err(e) => {
                error!("Failed to encode reply for {}: {}", self.device_id, e);
                Handled::none()
            }
        }
    }

    fn record_state(&self, state: DeviceState) {
        self.guard(self.state.sink.record_state(&self.device_id, state, now_ts()));
    }

    /// Sink failures are logged and swallowed; they never tear down the
    /// connection.
    fn guard(&self, result: Result<(), SinkError>) {
        if let Err(e) = result {
            error!("Telemetry sink error for {}: {}", self.device_id, e);
        }
    }

    fn log_event(&self, severity: Severity, event_type: &str, message: &str) {
        self.guard(self.state.sink.record_log(
            &self.device_id,
            severity,
            event_type,
            message,
            now_ts(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;
    use crate::protocol::handshake::{ChallengePayload, ClientHandshake};
    use crate::telemetry::InMemoryTelemetry;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn new_session(sink: Arc<InMemoryTelemetry>) -> Session {
        Session::new("mower-01".into(), Arc::new(AppState::new(sink)))
    }

    /// Drive the handshake to Authenticated, returning the shared secret as
    /// derived on the client side.
    fn authenticate(session: &mut Session) -> u32 {
        let mut rng = StdRng::seed_from_u64(42);
        let client = ClientHandshake::new(&mut rng);

        let hello = pack_session(0, MessageType::Hello.as_byte(), &client.hello());
        let handled = session.handle_payload(&hello);
        let challenge_frame = handled.reply.expect("challenge reply");

        let decoded = frame::decode(&challenge_frame).unwrap().unwrap();
        let msg = unpack_session(&decoded.payload).unwrap();
        assert_eq!(msg.msg_type, MessageType::Challenge.as_byte());
        assert_eq!(msg.hmac, 0);
        let (iin, challenge_body) = unpack_presentation(msg.body).unwrap();
        assert_eq!(iin, 0);

        let challenge = ChallengePayload::parse(challenge_body).unwrap();
        let (client_auth, shared) = client.answer_challenge(&challenge).unwrap();

        let auth = pack_session(
            0,
            MessageType::ClientAuth.as_byte(),
            &client_auth.to_be_bytes(),
        );
        let handled = session.handle_payload(&auth);
        assert!(!handled.close);
        assert_eq!(session.phase(), AuthPhase::Authenticated);
        shared
    }

    #[test]
    fn test_handshake_reaches_authenticated() {
        let sink = Arc::new(InMemoryTelemetry::new());
        let mut session = new_session(sink.clone());
        authenticate(&mut session);

        let logged: Vec<String> = sink
            .logs("mower-01")
            .iter()
            .map(|l| l.event_type.clone())
            .collect();
        assert!(logged.contains(&events::AUTH_CHALLENGE_SENT.to_string()));
        assert!(logged.contains(&events::AUTH_SUCCESS.to_string()));
    }

    #[test]
    fn test_bad_client_auth_closes_connection() {
        let sink = Arc::new(InMemoryTelemetry::new());
        let mut session = new_session(sink.clone());

        let mut rng = StdRng::seed_from_u64(5);
        let client = ClientHandshake::new(&mut rng);
        let hello = pack_session(0, MessageType::Hello.as_byte(), &client.hello());
        session.handle_payload(&hello);

        let auth = pack_session(0, MessageType::ClientAuth.as_byte(), &[0, 0, 0, 1]);
        let handled = session.handle_payload(&auth);
        assert!(handled.close);
        assert_eq!(session.phase(), AuthPhase::Closed);
        assert!(sink
            .logs("mower-01")
            .iter()
            .any(|l| l.event_type == events::AUTH_FAILED));
    }

    #[test]
    fn test_unauthenticated_regular_is_dropped() {
        let sink = Arc::new(InMemoryTelemetry::new());
        let mut session = new_session(sink.clone());

        let pres = pack_presentation(1, &pack_application(commands::HEARTBEAT, b"hi"));
        let regular = pack_session(0x1234_5678, MessageType::Regular.as_byte(), &pres);
        let handled = session.handle_payload(&regular);
        assert!(handled.reply.is_none());
        assert!(!handled.close);
        assert!(sink
            .logs("mower-01")
            .iter()
            .any(|l| l.event_type == events::UNAUTHENTICATED_MESSAGE));
    }

    #[test]
    fn test_bypass_heartbeat_echo_vector() {
        let sink = Arc::new(InMemoryTelemetry::new());
        let mut session = new_session(sink);

        let request = vec![
            0xFA, 0xDE, 0xDB, 0xED, // bypass hmac
            0x00, // REGULAR
            0x00, 0x01, // IIN 1
            0x00, // heartbeat
            0xDE, 0xAD, 0xBE, 0xEF, // echo body
        ];
        let handled = session.handle_payload(&request);
        let reply_frame = handled.reply.expect("echo reply");
        let decoded = frame::decode(&reply_frame).unwrap().unwrap();
        assert_eq!(
            decoded.payload,
            vec![0xFA, 0xDE, 0xDB, 0xED, 0x00, 0x00, 0x01, 0x80, 0xDE, 0xAD, 0xBE, 0xEF]
        );
    }

    #[test]
    fn test_authenticated_start_command_vector() {
        let sink = Arc::new(InMemoryTelemetry::new());
        let mut session = new_session(sink.clone());
        let shared = authenticate(&mut session);

        // START with IIN 1: presentation bytes 00 01 01 01.
        let pres = vec![0x00, 0x01, 0x01, 0x01];
        let request = pack_session(
            crypto::mac(shared, &pres),
            MessageType::Regular.as_byte(),
            &pres,
        );
        let handled = session.handle_payload(&request);
        let reply_frame = handled.reply.expect("control reply");

        let decoded = frame::decode(&reply_frame).unwrap().unwrap();
        let msg = unpack_session(&decoded.payload).unwrap();
        assert_eq!(msg.body, &[0x00, 0x01, 0x81]);
        assert_eq!(msg.hmac, crypto::mac(shared, &[0x00, 0x01, 0x81]));
        assert_eq!(sink.latest_state("mower-01"), Some(DeviceState::Mowing));
    }

    #[test]
    fn test_malformed_control_body_gets_error_response() {
        let sink = Arc::new(InMemoryTelemetry::new());
        let mut session = new_session(sink);
        let shared = authenticate(&mut session);

        let pres = pack_presentation(7, &pack_application(commands::CONTROL_DEVICE, &[]));
        let request = pack_session(
            crypto::mac(shared, &pres),
            MessageType::Regular.as_byte(),
            &pres,
        );
        let handled = session.handle_payload(&request);
        let decoded = frame::decode(&handled.reply.unwrap()).unwrap().unwrap();
        let msg = unpack_session(&decoded.payload).unwrap();
        let (iin, app) = unpack_presentation(msg.body).unwrap();
        let (cmd, body) = unpack_application(app).unwrap();
        assert_eq!(iin, 7);
        assert_eq!(cmd, commands::ERROR_RESPONSE);
        assert_eq!(body, b"Invalid control command");
    }

    #[test]
    fn test_ack_error_and_blade_reset() {
        let sink = Arc::new(InMemoryTelemetry::new());
        let mut session = new_session(sink.clone());
        let shared = authenticate(&mut session);

        let pres = pack_presentation(2, &pack_application(commands::ACK_ERROR, &[]));
        let request = pack_session(
            crypto::mac(shared, &pres),
            MessageType::Regular.as_byte(),
            &pres,
        );
        session.handle_payload(&request);
        assert_eq!(sink.latest_state("mower-01"), Some(DeviceState::Paused));

        let pres = pack_presentation(3, &pack_application(commands::RESET_BLADE_TIME, &[]));
        let request = pack_session(
            crypto::mac(shared, &pres),
            MessageType::Regular.as_byte(),
            &pres,
        );
        let handled = session.handle_payload(&request);
        assert!(handled.reply.is_some());
        assert_eq!(sink.blade_resets("mower-01"), 1);
    }

    #[test]
    fn test_unknown_command_gets_no_response() {
        let sink = Arc::new(InMemoryTelemetry::new());
        let mut session = new_session(sink.clone());
        let shared = authenticate(&mut session);

        let pres = pack_presentation(4, &pack_application(0x42, &[]));
        let request = pack_session(
            crypto::mac(shared, &pres),
            MessageType::Regular.as_byte(),
            &pres,
        );
        let handled = session.handle_payload(&request);
        assert!(handled.reply.is_none());
        assert!(sink
            .logs("mower-01")
            .iter()
            .any(|l| l.event_type == events::UNKNOWN_COMMAND));
    }

    #[test]
    fn test_status_notification_vector() {
        let sink = Arc::new(InMemoryTelemetry::new());
        let mut session = new_session(sink.clone());

        // battery 200/2 = 100%, blade 0x04B0 = 1200 s, state Mowing.
        let body = [
            notifications::DEVICE_STATUS,
            0xC8,
            0x00,
            0x00,
            0x04,
            0xB0,
            0x02,
        ];
        let payload = pack_session(0, MessageType::Notification.as_byte(), &body);
        let handled = session.handle_payload(&payload);
        assert!(handled.reply.is_none());

        assert_eq!(sink.latest_battery("mower-01").unwrap().1, 100.0);
        assert_eq!(sink.latest_state("mower-01"), Some(DeviceState::Mowing));
    }

    #[test]
    fn test_position_notification() {
        let sink = Arc::new(InMemoryTelemetry::new());
        let mut session = new_session(sink.clone());

        let mut body = vec![notifications::POSITION_UPDATE];
        body.extend_from_slice(&1_700_000_000u32.to_be_bytes());
        body.extend_from_slice(&47.05_f32.to_be_bytes());
        body.extend_from_slice(&8.31_f32.to_be_bytes());

        let payload = pack_session(0, MessageType::Notification.as_byte(), &body);
        session.handle_payload(&payload);

        let (ts, lat, lon) = sink.latest_position("mower-01").unwrap();
        assert_eq!(ts, 1_700_000_000);
        assert_eq!(lat, 47.05);
        assert_eq!(lon, 8.31);
    }

    #[test]
    fn test_short_notification_dropped_with_warning() {
        let sink = Arc::new(InMemoryTelemetry::new());
        let mut session = new_session(sink.clone());

        let body = [notifications::DEVICE_STATUS, 0xC8, 0x00];
        let payload = pack_session(0, MessageType::Notification.as_byte(), &body);
        session.handle_payload(&payload);

        assert!(sink.latest_battery("mower-01").is_none());
        assert!(sink
            .logs("mower-01")
            .iter()
            .any(|l| l.severity == Severity::Warning));
    }

    #[test]
    fn test_notification_accepted_before_auth() {
        let sink = Arc::new(InMemoryTelemetry::new());
        let mut session = new_session(sink.clone());
        assert_eq!(session.phase(), AuthPhase::AwaitingHello);

        let body = [notifications::DEVICE_STATUS, 0x64, 0x00, 0x00, 0x00, 0x3C, 0x04];
        let payload = pack_session(0, MessageType::Notification.as_byte(), &body);
        session.handle_payload(&payload);

        assert_eq!(sink.latest_battery("mower-01").unwrap().1, 50.0);
        assert_eq!(sink.latest_state("mower-01"), Some(DeviceState::Paused));
    }
}
