use std::time::Duration;

use kingdom_transport::{DeviceId, TransportError};

use crate::types::ChannelId;

/// Protocol-level errors for Kingdom.
///
/// Wraps transport errors and adds the framing, admin and consistency
/// failures of the election and channel layers.
#[derive(Debug, thiserror::Error)]
pub enum KingdomError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: String },

    #[error("malformed admin message: {reason}")]
    MalformedAdmin { reason: String },

    #[error("keep-alive received with first-hop flag set")]
    KeepAliveFirstHop,

    #[error("payload of {0} bytes does not fit in one frame")]
    PayloadTooLarge(usize),

    #[error("shutdown of {what} exceeded {timeout:?}")]
    ShutdownTimeout { what: String, timeout: Duration },

    #[error("device {0} is already registered in this kingdom")]
    DuplicateRegistration(DeviceId),

    #[error("channel {0} queue is full")]
    QueueFull(ChannelId),

    #[error("publish to channel {channel} timed out after {timeout:?}")]
    PublishTimeout {
        channel: ChannelId,
        timeout: Duration,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("runtime shut down")]
    RuntimeClosed,
}

impl KingdomError {
    /// Internal-consistency failures. The runtime stops on these.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KingdomError::ShutdownTimeout { .. } | KingdomError::DuplicateRegistration(_)
        )
    }

    /// Peer misbehaviour: the offending connection is closed, nothing else.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            KingdomError::UnsupportedVersion(_)
                | KingdomError::MalformedFrame { .. }
                | KingdomError::MalformedAdmin { .. }
                | KingdomError::KeepAliveFirstHop
        )
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        KingdomError::MalformedFrame {
            reason: reason.into(),
        }
    }
}

impl From<rmp_serde::encode::Error> for KingdomError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        KingdomError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for KingdomError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        KingdomError::MalformedAdmin {
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_unsupported_version() {
        let err = KingdomError::UnsupportedVersion(7);
        assert_eq!(err.to_string(), "unsupported protocol version 7");
    }

    #[test]
    fn test_display_queue_full() {
        assert_eq!(KingdomError::QueueFull(3).to_string(), "channel 3 queue is full");
    }

    #[test]
    fn test_display_duplicate_registration() {
        let err = KingdomError::DuplicateRegistration("peasant-1".parse().unwrap());
        assert_eq!(
            err.to_string(),
            "device peasant-1 is already registered in this kingdom"
        );
    }

    #[test]
    fn test_classification() {
        assert!(KingdomError::DuplicateRegistration("x".parse().unwrap()).is_fatal());
        assert!(KingdomError::ShutdownTimeout {
            what: "sender".into(),
            timeout: Duration::from_secs(1)
        }
        .is_fatal());
        assert!(!KingdomError::QueueFull(1).is_fatal());

        assert!(KingdomError::KeepAliveFirstHop.is_protocol_violation());
        assert!(KingdomError::UnsupportedVersion(2).is_protocol_violation());
        assert!(!KingdomError::Transport(TransportError::Closed).is_protocol_violation());
    }

    #[test]
    fn test_decode_error_is_malformed_admin() {
        let err: KingdomError = rmp_serde::from_slice::<String>(&[0xc1])
            .unwrap_err()
            .into();
        assert!(matches!(err, KingdomError::MalformedAdmin { .. }));
    }
}
