//! Discovery glue for the Kingdom protocol.
//!
//! The radio itself lives outside this crate. What the protocol needs is
//! a stream of [`Beacon`]s, a last-write-wins [`BeaconStore`], and a
//! [`Discovery`] handle to switch active probing on or off and publish
//! the local role.

pub mod beacon;
pub mod memory;
pub mod types;

pub use beacon::BeaconStore;
pub use memory::{MemoryAirwaves, MemoryRadio, DEFAULT_ZONE};
pub use types::{Beacon, DEFAULT_SCAN_INTERVAL_MS};

use crate::types::Role;

/// Control surface the state machine drives on every transition.
pub trait Discovery: Send + Sync {
    /// Active probing on (Free, Prince, King) or passive only (Peasant).
    fn set_active(&self, active: bool);

    /// Role to advertise from now on.
    fn set_local_role(&self, role: Role);
}

/// Discovery that does nothing; beacons are injected by hand.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDiscovery;

impl Discovery for NoDiscovery {
    fn set_active(&self, _active: bool) {}

    fn set_local_role(&self, _role: Role) {}
}
