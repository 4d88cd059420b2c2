//! Kingdom transport layer.
//!
//! Everything the election and channel layers need from a physical medium:
//! device identities, transport descriptors, and a duplex [`Connection`]
//! with exactly-once close notification. Concrete media plug in through
//! the [`Dialer`] trait and an inbound `mpsc::Receiver<Connection>`.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use kingdom_transport::{DeviceId, Dialer, MemoryNetwork};
//!
//! # async fn example() -> Result<(), kingdom_transport::TransportError> {
//! let network = MemoryNetwork::new();
//! let alice: DeviceId = "alice".parse()?;
//! let bob: DeviceId = "bob".parse()?;
//!
//! let mut bob_incoming = network.listen(bob.clone());
//! let conn = network.dialer(alice).dial(&bob, &[]).await?;
//! conn.write_all(b"hello").await?;
//!
//! let accepted = bob_incoming.recv().await.unwrap();
//! let mut buf = [0u8; 5];
//! accepted.read_exact(&mut buf).await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod connection;
mod error;
mod memory;
mod metadata;
mod tcp;

pub use config::TransportConfig;
pub use connection::{Connection, ConnectionId, DEFAULT_PIPE_CAPACITY};
pub use error::TransportError;
pub use memory::{MemoryDialer, MemoryNetwork};
pub use metadata::{ConnectionMetadata, TransportKind};
pub use tcp::{TcpDialer, TcpTransport};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Longest identity accepted on the wire (length is carried in one byte).
pub const MAX_DEVICE_ID_LEN: usize = 255;

/// Globally unique participant identity.
///
/// Ordered lexicographically by its UTF-8 bytes; the election uses that
/// order as the tie-breaker between competing kings.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(Arc<str>);

impl DeviceId {
    /// Borrow the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raw identity bytes, as written during handshakes.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > MAX_DEVICE_ID_LEN {
            return Err(TransportError::InvalidDeviceId(s.to_string()));
        }
        Ok(Self(Arc::from(s)))
    }
}

impl TryFrom<&[u8]> for DeviceId {
    type Error = TransportError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let s = std::str::from_utf8(bytes)
            .map_err(|_| TransportError::InvalidDeviceId(String::from_utf8_lossy(bytes).into()))?;
        s.parse()
    }
}

impl serde::Serialize for DeviceId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for DeviceId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Establishes outbound connections to a remote identity.
///
/// Implementations pick whichever entry of `metadata` they understand.
/// A dial either yields a live connection or fails; retries are the
/// caller's business.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync {
    /// Open a connection to `target`.
    async fn dial(
        &self,
        target: &DeviceId,
        metadata: &[ConnectionMetadata],
    ) -> Result<Connection, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_ids_order_lexicographically() {
        let a: DeviceId = "a".parse().unwrap();
        let b: DeviceId = "b".parse().unwrap();
        let ab: DeviceId = "ab".parse().unwrap();
        assert!(a < b);
        assert!(a < ab);
        assert!(ab < b);
    }

    #[test]
    fn rejects_empty_and_oversized_ids() {
        assert!("".parse::<DeviceId>().is_err());
        let long = "x".repeat(MAX_DEVICE_ID_LEN + 1);
        assert!(long.parse::<DeviceId>().is_err());
        let max = "x".repeat(MAX_DEVICE_ID_LEN);
        assert!(max.parse::<DeviceId>().is_ok());
    }

    #[test]
    fn device_id_serde_is_a_plain_string() {
        let id: DeviceId = "node-7".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"node-7\"");
        let back: DeviceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn device_id_from_invalid_utf8_fails() {
        let bytes: &[u8] = &[0xff, 0xfe];
        assert!(DeviceId::try_from(bytes).is_err());
    }
}
