//! Wire unit of the channel fabric.
//!
//! A [`Message`] is either admin traffic, a keep-alive probe, or a payload
//! for an application channel. The variable-length binary frame lives in
//! [`codec`], oversized payload splitting in [`chunk`], and the admin
//! catalog in [`admin`].

pub mod admin;
pub mod chunk;
pub mod codec;

use bytes::Bytes;

use crate::types::{ChannelId, Priority};

/// Header flag bits.
pub mod flags {
    pub const ADMIN: u8 = 0x01;
    pub const KEEP_ALIVE: u8 = 0x02;
    pub const FIRST_HOP: u8 = 0x04;
    pub const HAS_PAYLOAD: u8 = 0x08;
    pub const CHUNK: u8 = 0x10;
    pub const EXCLUDE_SENDER: u8 = 0x20;

    /// Every bit a decoder understands. Anything else is malformed.
    pub const KNOWN: u8 = ADMIN | KEEP_ALIVE | FIRST_HOP | HAS_PAYLOAD | CHUNK | EXCLUDE_SENDER;
}

/// What a message carries. Channel ids only exist on channel traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Admin,
    KeepAlive,
    Channel(ChannelId),
}

/// Position of one fragment in a chunked message. Numbers start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkHeader {
    pub chunk_id: u16,
    pub chunk_no: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub priority: Priority,
    /// Still has to pass through the master before final delivery.
    pub first_hop: bool,
    /// The master must not echo this message back to its origin.
    pub exclude_sender: bool,
    pub chunk: Option<ChunkHeader>,
    pub payload: Bytes,
}

impl Message {
    /// Admin message carrying an already-encoded admin body.
    pub fn admin(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Admin,
            priority: Priority::Admin,
            first_hop: false,
            exclude_sender: false,
            chunk: None,
            payload: payload.into(),
        }
    }

    /// Encode `message` into an admin frame.
    pub fn admin_message(message: &admin::AdminMessage) -> Result<Self, crate::KingdomError> {
        Ok(Self::admin(message.encode()?))
    }

    pub fn keep_alive() -> Self {
        Self {
            kind: MessageKind::KeepAlive,
            priority: Priority::AdminLow,
            first_hop: false,
            exclude_sender: false,
            chunk: None,
            payload: Bytes::new(),
        }
    }

    pub fn channel(channel: ChannelId, priority: Priority, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Channel(channel),
            priority,
            first_hop: false,
            exclude_sender: false,
            chunk: None,
            payload: payload.into(),
        }
    }

    pub fn with_first_hop(mut self, first_hop: bool) -> Self {
        self.first_hop = first_hop;
        self
    }

    pub fn excluding_sender(mut self, exclude: bool) -> Self {
        self.exclude_sender = exclude;
        self
    }

    pub fn is_admin(&self) -> bool {
        self.kind == MessageKind::Admin
    }

    pub fn is_keep_alive(&self) -> bool {
        self.kind == MessageKind::KeepAlive
    }

    pub fn channel_id(&self) -> Option<ChannelId> {
        match self.kind {
            MessageKind::Channel(id) => Some(id),
            _ => None,
        }
    }

    pub fn has_payload(&self) -> bool {
        !self.payload.is_empty()
    }

    /// Header flag byte for this message.
    pub fn flags(&self) -> u8 {
        let mut bits = 0;
        match self.kind {
            MessageKind::Admin => bits |= flags::ADMIN,
            MessageKind::KeepAlive => bits |= flags::KEEP_ALIVE,
            MessageKind::Channel(_) => {}
        }
        if self.first_hop {
            bits |= flags::FIRST_HOP;
        }
        if self.has_payload() {
            bits |= flags::HAS_PAYLOAD;
        }
        if self.chunk.is_some() {
            bits |= flags::CHUNK;
        }
        if self.exclude_sender {
            bits |= flags::EXCLUDE_SENDER;
        }
        bits
    }
}
