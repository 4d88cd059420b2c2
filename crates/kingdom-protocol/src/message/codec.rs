//! Binary frame codec.
//!
//! ```text
//! version:u8 flags:u8 priority:u8
//! [channel:u16]                   unless ADMIN or KEEP_ALIVE
//! [chunk_id:u16 chunk_no:u16]     if CHUNK
//! [length:u16 payload:length]     if HAS_PAYLOAD
//! ```
//!
//! All multi-byte fields are big-endian. The fixed 3-byte prefix tells the
//! decoder which optional fields follow.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use kingdom_transport::Connection;

use super::{flags, ChunkHeader, Message, MessageKind};
use crate::error::KingdomError;
use crate::types::{Priority, PROTOCOL_VERSION};

/// Bytes before any optional field.
pub const PREFIX_LEN: usize = 3;

/// Largest payload one frame can carry.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Encoded size of `msg`, header included.
pub fn encoded_len(msg: &Message) -> usize {
    let mut len = PREFIX_LEN;
    if let MessageKind::Channel(_) = msg.kind {
        len += 2;
    }
    if msg.chunk.is_some() {
        len += 4;
    }
    if msg.has_payload() {
        len += 2 + msg.payload.len();
    }
    len
}

/// Append the frame for `msg` to `buf`.
pub fn encode(msg: &Message, buf: &mut BytesMut) -> Result<(), KingdomError> {
    if msg.payload.len() > MAX_FRAME_PAYLOAD {
        return Err(KingdomError::PayloadTooLarge(msg.payload.len()));
    }
    buf.reserve(encoded_len(msg));
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(msg.flags());
    buf.put_u8(msg.priority.as_u8());
    if let MessageKind::Channel(channel) = msg.kind {
        buf.put_u16(channel);
    }
    if let Some(chunk) = msg.chunk {
        buf.put_u16(chunk.chunk_id);
        buf.put_u16(chunk.chunk_no);
    }
    if msg.has_payload() {
        buf.put_u16(msg.payload.len() as u16);
        buf.put_slice(&msg.payload);
    }
    Ok(())
}

pub fn to_bytes(msg: &Message) -> Result<Bytes, KingdomError> {
    let mut buf = BytesMut::with_capacity(encoded_len(msg));
    encode(msg, &mut buf)?;
    Ok(buf.freeze())
}

/// What the prefix announces about the rest of the frame.
#[derive(Debug, Clone, Copy)]
struct Prefix {
    flags: u8,
    priority: Priority,
}

impl Prefix {
    fn parse(version: u8, flag_bits: u8, priority: u8) -> Result<Self, KingdomError> {
        if version != PROTOCOL_VERSION {
            return Err(KingdomError::UnsupportedVersion(version));
        }
        if flag_bits & !flags::KNOWN != 0 {
            return Err(KingdomError::malformed(format!(
                "unknown flag bits {:#04x}",
                flag_bits & !flags::KNOWN
            )));
        }
        if flag_bits & flags::ADMIN != 0 && flag_bits & flags::KEEP_ALIVE != 0 {
            return Err(KingdomError::malformed("admin and keep-alive both set"));
        }
        let priority = Priority::from_u8(priority)
            .ok_or_else(|| KingdomError::malformed(format!("unknown priority {priority}")))?;
        Ok(Self {
            flags: flag_bits,
            priority,
        })
    }

    fn has(&self, bit: u8) -> bool {
        self.flags & bit != 0
    }

    fn has_channel(&self) -> bool {
        !self.has(flags::ADMIN) && !self.has(flags::KEEP_ALIVE)
    }

    fn build(&self, channel: u16, chunk: Option<ChunkHeader>, payload: Bytes) -> Message {
        let kind = if self.has(flags::ADMIN) {
            MessageKind::Admin
        } else if self.has(flags::KEEP_ALIVE) {
            MessageKind::KeepAlive
        } else {
            MessageKind::Channel(channel)
        };
        Message {
            kind,
            priority: self.priority,
            first_hop: self.has(flags::FIRST_HOP),
            exclude_sender: self.has(flags::EXCLUDE_SENDER),
            chunk,
            payload,
        }
    }
}

fn need(buf: &impl Buf, n: usize, what: &str) -> Result<(), KingdomError> {
    if buf.remaining() < n {
        return Err(KingdomError::malformed(format!(
            "truncated {what}: need {n} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

/// Decode one frame from the front of `buf`.
pub fn decode(buf: &mut impl Buf) -> Result<Message, KingdomError> {
    need(buf, PREFIX_LEN, "prefix")?;
    let prefix = Prefix::parse(buf.get_u8(), buf.get_u8(), buf.get_u8())?;

    let channel = if prefix.has_channel() {
        need(buf, 2, "channel id")?;
        buf.get_u16()
    } else {
        0
    };
    let chunk = if prefix.has(flags::CHUNK) {
        need(buf, 4, "chunk header")?;
        Some(ChunkHeader {
            chunk_id: buf.get_u16(),
            chunk_no: buf.get_u16(),
        })
    } else {
        None
    };
    let payload = if prefix.has(flags::HAS_PAYLOAD) {
        need(buf, 2, "payload length")?;
        let len = buf.get_u16() as usize;
        if len == 0 {
            return Err(KingdomError::malformed("payload flag set with zero length"));
        }
        need(buf, len, "payload")?;
        buf.copy_to_bytes(len)
    } else {
        Bytes::new()
    };
    Ok(prefix.build(channel, chunk, payload))
}

/// Read one whole frame from `conn`.
pub async fn read_message(conn: &Connection) -> Result<Message, KingdomError> {
    let mut version = [0u8; 1];
    conn.read_exact(&mut version).await?;
    read_after_version(conn, version[0]).await
}

/// Finish reading a frame whose version byte was already consumed.
///
/// Receivers wait for the version byte under their stop signal and then
/// call this without one, so a frame is never abandoned half-read.
pub async fn read_after_version(conn: &Connection, version: u8) -> Result<Message, KingdomError> {
    let mut rest = [0u8; PREFIX_LEN - 1];
    conn.read_exact(&mut rest).await?;
    let prefix = Prefix::parse(version, rest[0], rest[1])?;

    let channel = if prefix.has_channel() {
        let mut raw = [0u8; 2];
        conn.read_exact(&mut raw).await?;
        u16::from_be_bytes(raw)
    } else {
        0
    };
    let chunk = if prefix.has(flags::CHUNK) {
        let mut raw = [0u8; 4];
        conn.read_exact(&mut raw).await?;
        Some(ChunkHeader {
            chunk_id: u16::from_be_bytes([raw[0], raw[1]]),
            chunk_no: u16::from_be_bytes([raw[2], raw[3]]),
        })
    } else {
        None
    };
    let payload = if prefix.has(flags::HAS_PAYLOAD) {
        let mut raw = [0u8; 2];
        conn.read_exact(&mut raw).await?;
        let len = u16::from_be_bytes(raw) as usize;
        if len == 0 {
            return Err(KingdomError::malformed("payload flag set with zero length"));
        }
        let mut payload = vec![0u8; len];
        conn.read_exact(&mut payload).await?;
        Bytes::from(payload)
    } else {
        Bytes::new()
    };
    Ok(prefix.build(channel, chunk, payload))
}

/// Write one frame to `conn`.
pub async fn write_message(conn: &Connection, msg: &Message) -> Result<(), KingdomError> {
    let frame = to_bytes(msg)?;
    conn.write_all(&frame).await?;
    Ok(())
}
