use std::time::Duration;

use crate::DeviceId;

/// Errors returned by the Kingdom transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection to {device_id} failed: {source}")]
    Connect {
        device_id: DeviceId,
        #[source]
        source: anyhow::Error,
    },

    #[error("connection is closed")]
    Closed,

    #[error("remote end closed the stream")]
    Eof,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid device id: {0:?}")]
    InvalidDeviceId(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("no usable connection metadata for {0}")]
    NoRoute(DeviceId),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TransportError {
    /// True when the stream is gone for good (closed locally or by the peer).
    pub fn is_disconnect(&self) -> bool {
        matches!(self, TransportError::Closed | TransportError::Eof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_connect_includes_device() {
        let err = TransportError::Connect {
            device_id: "king".parse().unwrap(),
            source: anyhow::anyhow!("refused"),
        };
        assert_eq!(err.to_string(), "connection to king failed: refused");
    }

    #[test]
    fn disconnect_classification() {
        assert!(TransportError::Closed.is_disconnect());
        assert!(TransportError::Eof.is_disconnect());
        assert!(!TransportError::Timeout(Duration::from_secs(1)).is_disconnect());
    }
}
