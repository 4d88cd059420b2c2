use serde::{Deserialize, Serialize};

use crate::DeviceId;

/// Physical medium a [`ConnectionMetadata`] entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// In-process pipe (tests, simulations).
    Memory,
    /// TCP socket address, `host:port`.
    Tcp,
    Bluetooth,
    WifiDirect,
}

/// Everything a dialer needs to reach an identity over one medium.
///
/// Devices advertise a list of these; the last advertisement wins.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionMetadata {
    pub transport: TransportKind,
    pub address: String,
}

impl ConnectionMetadata {
    pub fn new(transport: TransportKind, address: impl Into<String>) -> Self {
        Self {
            transport,
            address: address.into(),
        }
    }

    /// Metadata for an in-memory endpoint (the address is the identity).
    pub fn memory(id: &DeviceId) -> Self {
        Self::new(TransportKind::Memory, id.as_str())
    }

    pub fn tcp(addr: std::net::SocketAddr) -> Self {
        Self::new(TransportKind::Tcp, addr.to_string())
    }
}

impl std::fmt::Display for ConnectionMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}:{}", self.transport, self.address)
    }
}
