//! LCP framing: fixed-width little-endian header, response and body codecs.

use crate::identity::{UserId, USER_ID_LEN};

/// The LCP port: UDP control and TCP bulk share it.
pub const LCP_PORT: u16 = 9990;

/// Bytes of the header actually carrying data.
const HEADER_DATA_LEN: usize = 2 * USER_ID_LEN + 1 + 1 + 8;

/// Width of a header frame on the wire. The default frame is 50 bytes;
/// the `reserved-tail` feature emits the LCP v1.0 documented 100-byte
/// frame (50 data + 50 reserved zeros) instead.
pub const HEADER_LEN: usize = if cfg!(feature = "reserved-tail") {
    HEADER_DATA_LEN + 50
} else {
    HEADER_DATA_LEN
};

/// Width of a response frame: status, responder id, 4 reserved bytes.
pub const RESPONSE_LEN: usize = 1 + USER_ID_LEN + 4;

/// Operation carried by a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Echo = 0,
    Message = 1,
    File = 2,
}

impl TryFrom<u8> for OpCode {
    type Error = WireError;

    fn try_from(v: u8) -> Result<Self, WireError> {
        match v {
            0 => Ok(OpCode::Echo),
            1 => Ok(OpCode::Message),
            2 => Ok(OpCode::File),
            other => Err(WireError::UnknownOpCode(other)),
        }
    }
}

/// Response status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    BadRequest = 1,
    InternalError = 2,
}

impl TryFrom<u8> for Status {
    type Error = WireError;

    fn try_from(v: u8) -> Result<Self, WireError> {
        match v {
            0 => Ok(Status::Ok),
            1 => Ok(Status::BadRequest),
            2 => Ok(Status::InternalError),
            other => Err(WireError::UnknownStatus(other)),
        }
    }
}

/// A decoded LCP header.
/// Layout: `from[20] ‖ to[20] ‖ op[1] ‖ body_id[1] ‖ body_len[8 LE]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub from: UserId,
    pub to: UserId,
    pub op: OpCode,
    pub body_id: u8,
    pub body_len: u64,
}

/// A decoded LCP response.
/// Layout: `status[1] ‖ responder[20] ‖ reserved[4]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub responder: UserId,
}

/// Error decoding a frame off the wire.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame too short: {got} bytes (expected {expected})")]
    Short { got: usize, expected: usize },
    #[error("unknown op code {0}")]
    UnknownOpCode(u8),
    #[error("unknown response status {0}")]
    UnknownStatus(u8),
}

pub fn encode_header(h: &Header) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[..USER_ID_LEN].copy_from_slice(h.from.as_bytes());
    out[USER_ID_LEN..2 * USER_ID_LEN].copy_from_slice(h.to.as_bytes());
    out[40] = h.op as u8;
    out[41] = h.body_id;
    out[42..50].copy_from_slice(&h.body_len.to_le_bytes());
    out
}

pub fn decode_header(bytes: &[u8]) -> Result<Header, WireError> {
    if bytes.len() < HEADER_LEN {
        return Err(WireError::Short {
            got: bytes.len(),
            expected: HEADER_LEN,
        });
    }
    let mut from = [0u8; USER_ID_LEN];
    from.copy_from_slice(&bytes[..USER_ID_LEN]);
    let mut to = [0u8; USER_ID_LEN];
    to.copy_from_slice(&bytes[USER_ID_LEN..2 * USER_ID_LEN]);
    let op = OpCode::try_from(bytes[40])?;
    let mut len = [0u8; 8];
    len.copy_from_slice(&bytes[42..50]);
    Ok(Header {
        from: UserId::from_wire(from),
        to: UserId::from_wire(to),
        op,
        body_id: bytes[41],
        body_len: u64::from_le_bytes(len),
    })
}

pub fn encode_response(status: Status, responder: UserId) -> [u8; RESPONSE_LEN] {
    let mut out = [0u8; RESPONSE_LEN];
    out[0] = status as u8;
    out[1..1 + USER_ID_LEN].copy_from_slice(responder.as_bytes());
    out
}

pub fn decode_response(bytes: &[u8]) -> Result<Response, WireError> {
    if bytes.len() < RESPONSE_LEN {
        return Err(WireError::Short {
            got: bytes.len(),
            expected: RESPONSE_LEN,
        });
    }
    let status = Status::try_from(bytes[0])?;
    let mut responder = [0u8; USER_ID_LEN];
    responder.copy_from_slice(&bytes[1..1 + USER_ID_LEN]);
    Ok(Response {
        status,
        responder: UserId::from_wire(responder),
    })
}

/// A message body frame opens with the body id of its header so the
/// receiver can correlate the two.
pub fn encode_message_body(body_id: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(body_id);
    out.extend_from_slice(payload);
    out
}

pub fn decode_message_body(bytes: &[u8]) -> Result<(u8, &[u8]), WireError> {
    if bytes.is_empty() {
        return Err(WireError::Short {
            got: 0,
            expected: 1,
        });
    }
    Ok((bytes[0], &bytes[1..]))
}
