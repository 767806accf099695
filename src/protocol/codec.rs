//! Session / presentation / application layer wrap and unwrap
//!
//! Three thin, stateless layers nested inside a frame payload:
//!
//! ```text
//! session:      [hmac: 4 BE] [type: 1] [body]
//! presentation: [iin: 2 BE] [body]
//! application:  [command: 1] [body]
//! ```

use thiserror::Error;

/// Minimum session message size: hmac(4) + type(1)
pub const SESSION_HEADER_LEN: usize = 5;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    #[error("session message too short: {0} bytes")]
    SessionTooShort(usize),
    #[error("presentation message too short: {0} bytes")]
    PresentationTooShort(usize),
    #[error("application message is empty")]
    ApplicationEmpty,
}

/// An unpacked session-layer message borrowing the frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionMessage<'a> {
    pub hmac: u32,
    pub msg_type: u8,
    pub body: &'a [u8],
}

pub fn pack_session(hmac: u32, msg_type: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SESSION_HEADER_LEN + body.len());
    out.extend_from_slice(&hmac.to_be_bytes());
    out.push(msg_type);
    out.extend_from_slice(body);
    out
}

pub fn unpack_session(bytes: &[u8]) -> Result<SessionMessage<'_>, CodecError> {
    if bytes.len() < SESSION_HEADER_LEN {
        return Err(CodecError::SessionTooShort(bytes.len()));
    }
    Ok(SessionMessage {
        hmac: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        msg_type: bytes[4],
        body: &bytes[SESSION_HEADER_LEN..],
    })
}

pub fn pack_presentation(iin: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + body.len());
    out.extend_from_slice(&iin.to_be_bytes());
    out.extend_from_slice(body);
    out
}

pub fn unpack_presentation(bytes: &[u8]) -> Result<(u16, &[u8]), CodecError> {
    if bytes.len() < 2 {
        return Err(CodecError::PresentationTooShort(bytes.len()));
    }
    Ok((u16::from_be_bytes([bytes[0], bytes[1]]), &bytes[2..]))
}

pub fn pack_application(command: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(command);
    out.extend_from_slice(body);
    out
}

pub fn unpack_application(bytes: &[u8]) -> Result<(u8, &[u8]), CodecError> {
    match bytes.split_first() {
        Some((&command, body)) => Ok((command, body)),
        None => Err(CodecError::ApplicationEmpty),
    }
}
