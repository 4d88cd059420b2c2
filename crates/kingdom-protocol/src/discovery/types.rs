//! What a device advertises about itself over the air.
use serde::{Deserialize, Serialize};

use kingdom_transport::ConnectionMetadata;

use crate::types::{DeviceId, Role};

// ── Constants ────────────────────────────────────────────────────────────

/// Default interval between simulated radio scans (250 ms).
pub const DEFAULT_SCAN_INTERVAL_MS: u64 = 250;

// ── Beacon ───────────────────────────────────────────────────────────────

/// One overheard advertisement: who, in which role, and how to reach them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beacon {
    pub device_id: DeviceId,
    pub role: Role,
    pub metadata: Vec<ConnectionMetadata>,
}

impl Beacon {
    pub fn new(device_id: DeviceId, role: Role, metadata: Vec<ConnectionMetadata>) -> Self {
        Self {
            device_id,
            role,
            metadata,
        }
    }

    pub fn is_king(&self) -> bool {
        self.role == Role::King
    }
}
