//! Frame layout and the HELLO / HELLO_ACK message bodies.
//!
//! Every frame on the wire is a big-endian `u32` length followed by exactly
//! that many body bytes. The length is never part of the body.
//!
//! ```text
//! HelloRequest := 0x01 ++ client_id:u64be                (9 bytes)
//! HelloAck     := 0x81 ++ client_id:u64be ++ status:u8   (10 bytes)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const MSG_HELLO: u8 = 0x01;
pub const MSG_HELLO_ACK: u8 = 0x81;

/// The request was a recognized HELLO.
pub const STATUS_OK: u8 = 0;
/// The request had another type; its next 8 bytes were echoed as an id.
pub const STATUS_UNRECOGNIZED: u8 = 1;

pub const LENGTH_PREFIX_LEN: usize = 4;
pub const HELLO_LEN: usize = 1 + 8;
pub const HELLO_ACK_LEN: usize = 1 + 8 + 1;

/// Ceiling on a reply length accepted by clients, independent of any server's
/// `max_frame`.
pub const MAX_CLIENT_FRAME: u32 = 1 << 20;

#[derive(Debug, PartialEq, Eq, Clone, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed body: expected at least {expected} bytes, got {actual}")]
    MalformedBody { expected: usize, actual: usize },
}

pub fn encode_u32be(value: u32) -> [u8; 4] {
    value.to_be_bytes()
}

pub fn decode_u32be(bytes: [u8; 4]) -> u32 {
    u32::from_be_bytes(bytes)
}

pub fn encode_u64be(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}

pub fn decode_u64be(bytes: [u8; 8]) -> u64 {
    u64::from_be_bytes(bytes)
}

/// First byte of a body, if any.
pub fn message_type(body: &[u8]) -> Option<u8> {
    body.first().copied()
}

pub fn encode_hello(client_id: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(HELLO_LEN);
    buf.put_u8(MSG_HELLO);
    buf.put_u64(client_id);
    buf.freeze()
}

/// Reads the 8 bytes after the type byte. The type byte itself is not
/// checked, servers use this for unrecognized types too.
pub fn decode_hello(mut body: &[u8]) -> Result<u64, DecodeError> {
    ensure_len(body, HELLO_LEN)?;
    body.advance(1);
    Ok(body.get_u64())
}

pub fn encode_hello_ack(client_id: u64, status: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(HELLO_ACK_LEN);
    buf.put_u8(MSG_HELLO_ACK);
    buf.put_u64(client_id);
    buf.put_u8(status);
    buf.freeze()
}

pub fn decode_hello_ack(mut body: &[u8]) -> Result<(u64, u8), DecodeError> {
    ensure_len(body, HELLO_ACK_LEN)?;
    body.advance(1);
    let client_id = body.get_u64();
    let status = body.get_u8();
    Ok((client_id, status))
}

/// Prepends the length prefix to `body`, producing one wire frame.
pub fn frame(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(body);
    buf.freeze()
}

fn ensure_len(body: &[u8], expected: usize) -> Result<(), DecodeError> {
    if body.len() < expected {
        return Err(DecodeError::MalformedBody {
            expected,
            actual: body.len(),
        });
    }
    Ok(())
}
