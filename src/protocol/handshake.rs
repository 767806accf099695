//! Mutual authentication handshake
//!
//! Message flow (device is the client, backend is the server):
//!
//! ```text
//! client                          server
//!   | -- HELLO(client_pub) -------> |  AwaitingHello
//!   | <-- CHALLENGE(server_pub,    |
//!   |       nonce, auth_s) ------- |  AwaitingClientAuth
//!   | -- CLIENT_AUTH(auth_c) ----> |
//!   |                              |  Authenticated
//! ```
//!
//! Both authenticators are PSK-keyed MACs over `(sender_pub, receiver_pub,
//! nonce)`; the shared secret derived afterwards keys every REGULAR message.

use rand::Rng;
use thiserror::Error;

use crate::crypto::{auth_tag, dh_public, dh_shared};

/// Length of a CHALLENGE payload: server_pub(4) + nonce(8) + auth(4)
pub const CHALLENGE_LEN: usize = 16;

/// Per-connection authentication phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    AwaitingHello,
    AwaitingClientAuth,
    Authenticated,
    Closed,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("hello body too short: {0} bytes")]
    MalformedHello(usize),
    #[error("challenge body is not {CHALLENGE_LEN} bytes: {0}")]
    MalformedChallenge(usize),
    #[error("client-auth body too short: {0} bytes")]
    MalformedClientAuth(usize),
    #[error("peer authenticator mismatch")]
    VerifyFailed,
}

/// Parse a HELLO body: the client's public key, big-endian.
pub fn parse_hello(body: &[u8]) -> Result<u32, HandshakeError> {
    if body.len() < 4 {
        return Err(HandshakeError::MalformedHello(body.len()));
    }
    Ok(u32::from_be_bytes([body[0], body[1], body[2], body[3]]))
}

/// Parse a CLIENT_AUTH body: the client's authenticator, big-endian.
pub fn parse_client_auth(body: &[u8]) -> Result<u32, HandshakeError> {
    if body.len() < 4 {
        return Err(HandshakeError::MalformedClientAuth(body.len()));
    }
    Ok(u32::from_be_bytes([body[0], body[1], body[2], body[3]]))
}

/// The CHALLENGE payload sent by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChallengePayload {
    pub server_public: u32,
    pub nonce: u64,
    pub auth: u32,
}

impl ChallengePayload {
    pub fn to_bytes(&self) -> [u8; CHALLENGE_LEN] {
        let mut out = [0u8; CHALLENGE_LEN];
        out[0..4].copy_from_slice(&self.server_public.to_be_bytes());
        out[4..12].copy_from_slice(&self.nonce.to_be_bytes());
        out[12..16].copy_from_slice(&self.auth.to_be_bytes());
        out
    }

    pub fn parse(body: &[u8]) -> Result<Self, HandshakeError> {
        if body.len() < CHALLENGE_LEN {
            return Err(HandshakeError::MalformedChallenge(body.len()));
        }
        Ok(Self {
            server_public: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
            nonce: u64::from_be_bytes([
                body[4], body[5], body[6], body[7], body[8], body[9], body[10], body[11],
            ]),
            auth: u32::from_be_bytes([body[12], body[13], body[14], body[15]]),
        })
    }
}

/// Server-side handshake state, created when a HELLO arrives.
#[derive(Debug)]
pub struct ServerHandshake {
    server_secret: u16,
    pub server_public: u32,
    pub client_public: u32,
    pub nonce: u64,
}

impl ServerHandshake {
    /// Start a handshake for the given client public key with a fresh
    /// 16-bit secret and 64-bit nonce.
    pub fn start<R: Rng>(client_public: u32, rng: &mut R) -> Self {
        let server_secret: u16 = rng.gen_range(1..=u16::MAX);
        Self {
            server_secret,
            server_public: dh_public(server_secret),
            client_public,
            nonce: rng.gen::<u64>(),
        }
    }

    /// Build the CHALLENGE payload answering the client's HELLO.
    pub fn challenge(&self) -> ChallengePayload {
        ChallengePayload {
            server_public: self.server_public,
            nonce: self.nonce,
            auth: auth_tag(self.server_public, self.client_public, self.nonce),
        }
    }

    /// Verify the client's authenticator. On success returns the derived
    /// shared secret; the caller moves the connection to Authenticated.
    pub fn verify_client_auth(&self, client_auth: u32) -> Result<u32, HandshakeError> {
        let expected = auth_tag(self.client_public, self.server_public, self.nonce);
        if client_auth != expected {
            return Err(HandshakeError::VerifyFailed);
        }
        Ok(dh_shared(self.client_public, self.server_secret))
    }
}

/// Client-side handshake state, used by the outbound dispatcher.
#[derive(Debug)]
pub struct ClientHandshake {
    client_secret: u16,
    pub client_public: u32,
}

impl ClientHandshake {
    pub fn new<R: Rng>(rng: &mut R) -> Self {
        let client_secret: u16 = rng.gen_range(1..=u16::MAX);
        Self {
            client_secret,
            client_public: dh_public(client_secret),
        }
    }

    /// HELLO body: our public key, big-endian.
    pub fn hello(&self) -> [u8; 4] {
        self.client_public.to_be_bytes()
    }

    /// Verify the server's authenticator and answer it. Returns our
    /// CLIENT_AUTH authenticator and the derived shared secret.
    pub fn answer_challenge(
        &self,
        challenge: &ChallengePayload,
    ) -> Result<(u32, u32), HandshakeError> {
        let expected = auth_tag(challenge.server_public, self.client_public, challenge.nonce);
        if challenge.auth != expected {
            return Err(HandshakeError::VerifyFailed);
        }
        let client_auth = auth_tag(self.client_public, challenge.server_public, challenge.nonce);
        let shared = dh_shared(challenge.server_public, self.client_secret);
        Ok((client_auth, shared))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_full_handshake_agrees_on_secret() {
        let mut rng = StdRng::seed_from_u64(7);

        let client = ClientHandshake::new(&mut rng);
        let server = ServerHandshake::start(parse_hello(&client.hello()).unwrap(), &mut rng);

        let challenge = server.challenge();
        let parsed = ChallengePayload::parse(&challenge.to_bytes()).unwrap();
        assert_eq!(parsed, challenge);

        let (client_auth, client_shared) = client.answer_challenge(&parsed).unwrap();
        let server_shared = server.verify_client_auth(client_auth).unwrap();
        assert_eq!(client_shared, server_shared);
    }

    #[test]
    fn test_tampered_challenge_rejected() {
        let mut rng = StdRng::seed_from_u64(8);

        let client = ClientHandshake::new(&mut rng);
        let server = ServerHandshake::start(client.client_public, &mut rng);

        let mut challenge = server.challenge();
        challenge.auth ^= 1;
        assert_eq!(
            client.answer_challenge(&challenge),
            Err(HandshakeError::VerifyFailed)
        );
    }

    #[test]
    fn test_wrong_client_auth_rejected() {
        let mut rng = StdRng::seed_from_u64(9);

        let client = ClientHandshake::new(&mut rng);
        let server = ServerHandshake::start(client.client_public, &mut rng);
        let (client_auth, _) = client.answer_challenge(&server.challenge()).unwrap();

        assert_eq!(
            server.verify_client_auth(client_auth ^ 0x8000_0000),
            Err(HandshakeError::VerifyFailed)
        );
    }

    #[test]
    fn test_hello_frame_layout() {
        // Client secret 0x1234: the HELLO session message is
        // hmac 00000000, type 0x01, body = clientPub BE (9 bytes total).
        let client_public = crate::crypto::dh_public(0x1234);
        let session = crate::protocol::pack_session(0, 0x01, &client_public.to_be_bytes());
        assert_eq!(session.len(), 9);
        let frame = crate::protocol::frame::encode(&session).unwrap();
        assert_eq!(frame[0], 0xAA);
        assert_eq!(frame[1], 0x09);

        let challenge = ServerHandshake::start(client_public, &mut StdRng::seed_from_u64(1))
            .challenge()
            .to_bytes();
        // Wrapped as presentation with IIN 0 before the session layer.
        let pres = crate::protocol::pack_presentation(0, &challenge);
        assert_eq!(&pres[..2], &[0x00, 0x00]);
        assert_eq!(pres.len(), 2 + CHALLENGE_LEN);
    }
}
