use std::fmt;

use serde::{Deserialize, Serialize};

pub use kingdom_transport::DeviceId;

/// Frame format version written in the first byte of every message.
pub const PROTOCOL_VERSION: u8 = 1;

/// Application channel identifier.
pub type ChannelId = u16;

/// Position of a device in its kingdom.
///
/// Serialized as a single byte so the census stays compact on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Free,
    Peasant,
    Prince,
    King,
}

impl Role {
    pub fn code(self) -> u8 {
        match self {
            Role::Free => 0,
            Role::Peasant => 1,
            Role::Prince => 2,
            Role::King => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Role::Free),
            1 => Some(Role::Peasant),
            2 => Some(Role::Prince),
            3 => Some(Role::King),
            _ => None,
        }
    }

    /// Roles that keep active discovery running. Peasants only listen.
    pub fn scans_actively(self) -> bool {
        !matches!(self, Role::Peasant)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Free => "free",
            Role::Peasant => "peasant",
            Role::Prince => "prince",
            Role::King => "king",
        };
        f.write_str(name)
    }
}

impl Serialize for Role {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        Role::from_code(code).ok_or_else(|| serde::de::Error::custom(format!("unknown role {code}")))
    }
}

/// Delivery priority. Higher sorts first in a sender queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    /// Keep-alives and other bookkeeping that must beat app traffic.
    AdminLow = 3,
    Admin = 4,
}

impl Priority {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Priority::Low),
            1 => Some(Priority::Normal),
            2 => Some(Priority::High),
            3 => Some(Priority::AdminLow),
            4 => Some(Priority::Admin),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}
