//! Per-connection message pumps.
//!
//! Every live connection gets a [`MessageSender`] (priority-queued
//! outbound worker), a [`MessageReceiver`] (framed inbound worker) and,
//! unless it is the master loopback, a [`KeepAlive`] probe. The three are
//! bundled in a [`ConnectionRecord`].

mod keepalive;
mod queue;
mod receiver;
mod record;
mod sender;

pub use keepalive::KeepAlive;
pub use receiver::{Inbound, LastSeen, MessageReceiver};
pub use record::ConnectionRecord;
pub use sender::{MessageSender, SenderHandle};

use std::time::Duration;

use crate::message::codec::MAX_FRAME_PAYLOAD;

/// Tuning for senders, receivers and keep-alives.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Payloads above this are chunked (at most 65535).
    pub max_frame_payload: usize,
    /// How often a keep-alive is sent on an idle or busy link.
    pub keepalive_interval: Duration,
    /// Silence after which the peer is considered gone.
    pub liveness_timeout: Duration,
    /// Pause after a failed write before retrying the same message.
    pub write_backoff: Duration,
    /// Pause after a failed read before reading again.
    pub read_retry: Duration,
    /// Upper bound for a sender/receiver pair to stop.
    pub deactivate_timeout: Duration,
    /// How long a bow-down waits for queued messages to leave.
    pub flush_timeout: Duration,
    /// Hand chunk frames upward instead of reassembling them.
    pub forward_chunks: bool,
    /// Frames buffered between receivers and their consumer.
    pub inbound_buffer: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_frame_payload: 4096,
            keepalive_interval: Duration::from_secs(2),
            liveness_timeout: Duration::from_secs(10),
            write_backoff: Duration::from_millis(100),
            read_retry: Duration::from_millis(50),
            deactivate_timeout: Duration::from_secs(2),
            flush_timeout: Duration::from_secs(1),
            forward_chunks: false,
            inbound_buffer: 256,
        }
    }
}

impl LinkConfig {
    pub fn max_frame_payload(mut self, bytes: usize) -> Self {
        self.max_frame_payload = bytes.clamp(1, MAX_FRAME_PAYLOAD);
        self
    }

    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = timeout;
        self
    }

    pub fn deactivate_timeout(mut self, timeout: Duration) -> Self {
        self.deactivate_timeout = timeout;
        self
    }

    pub fn forward_chunks(mut self, forward: bool) -> Self {
        self.forward_chunks = forward;
        self
    }

    pub(crate) fn frame_payload(&self) -> usize {
        self.max_frame_payload.clamp(1, MAX_FRAME_PAYLOAD)
    }
}
