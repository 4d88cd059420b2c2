//! Simulated radio neighbourhood.
//!
//! Devices sharing a zone can hear each other. Active scanners hear every
//! neighbour; passive devices (peasants) only hear kings, which advertise
//! loudly. Moving a device to another zone partitions or merges
//! neighbourhoods.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kingdom_transport::ConnectionMetadata;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Beacon, Discovery};
use crate::types::{DeviceId, Role};

const BEACON_BUFFER: usize = 64;

/// Zone every device starts in.
pub const DEFAULT_ZONE: u32 = 0;

#[derive(Clone, Default)]
pub struct MemoryAirwaves {
    inner: Arc<Mutex<HashMap<DeviceId, Station>>>,
}

struct Station {
    zone: u32,
    role: Role,
    active: bool,
    metadata: Vec<ConnectionMetadata>,
    sink: mpsc::Sender<Beacon>,
}

impl MemoryAirwaves {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DeviceId, Station>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Put `id` on the air in the default zone, advertising as Free.
    ///
    /// Returns the control handle for the runtime and the stream of
    /// beacons this device overhears.
    pub fn register(
        &self,
        id: DeviceId,
        metadata: Vec<ConnectionMetadata>,
    ) -> (MemoryRadio, mpsc::Receiver<Beacon>) {
        let (tx, rx) = mpsc::channel(BEACON_BUFFER);
        self.lock().insert(
            id.clone(),
            Station {
                zone: DEFAULT_ZONE,
                role: Role::Free,
                active: true,
                metadata,
                sink: tx,
            },
        );
        (
            MemoryRadio {
                id,
                airwaves: self.clone(),
            },
            rx,
        )
    }

    pub fn unregister(&self, id: &DeviceId) {
        self.lock().remove(id);
    }

    pub fn move_to_zone(&self, id: &DeviceId, zone: u32) {
        if let Some(station) = self.lock().get_mut(id) {
            tracing::debug!(device = %id, from = station.zone, to = zone, "device moved");
            station.zone = zone;
        }
    }

    /// Role `id` currently advertises.
    pub fn advertised_role(&self, id: &DeviceId) -> Option<Role> {
        self.lock().get(id).map(|s| s.role)
    }

    /// One scan round. Returns how many beacons were delivered.
    pub fn scan(&self) -> usize {
        let stations = self.lock();
        let mut delivered = 0;
        for (listener_id, listener) in stations.iter() {
            for (speaker_id, speaker) in stations.iter() {
                if speaker_id == listener_id || speaker.zone != listener.zone {
                    continue;
                }
                if !listener.active && speaker.role != Role::King {
                    continue;
                }
                let beacon = Beacon::new(speaker_id.clone(), speaker.role, speaker.metadata.clone());
                if listener.sink.try_send(beacon).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Scan every `interval` until the returned task is aborted.
    pub fn spawn_scanner(&self, interval: Duration) -> JoinHandle<()> {
        let airwaves = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                airwaves.scan();
            }
        })
    }
}

/// Per-device [`Discovery`] handle onto [`MemoryAirwaves`].
#[derive(Clone)]
pub struct MemoryRadio {
    id: DeviceId,
    airwaves: MemoryAirwaves,
}

impl Discovery for MemoryRadio {
    fn set_active(&self, active: bool) {
        if let Some(station) = self.airwaves.lock().get_mut(&self.id) {
            station.active = active;
        }
    }

    fn set_local_role(&self, role: Role) {
        if let Some(station) = self.airwaves.lock().get_mut(&self.id) {
            station.role = role;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> DeviceId {
        s.parse().unwrap()
    }

    #[test]
    fn same_zone_devices_hear_each_other() {
        let air = MemoryAirwaves::new();
        let (_ra, mut a) = air.register(id("a"), vec![]);
        let (_rb, mut b) = air.register(id("b"), vec![]);
        assert_eq!(air.scan(), 2);
        assert_eq!(a.try_recv().unwrap().device_id, id("b"));
        assert_eq!(b.try_recv().unwrap().device_id, id("a"));
    }

    #[test]
    fn zones_partition_the_air() {
        let air = MemoryAirwaves::new();
        let (_ra, _a) = air.register(id("a"), vec![]);
        let (_rb, _b) = air.register(id("b"), vec![]);
        air.move_to_zone(&id("b"), 1);
        assert_eq!(air.scan(), 0);
    }

    #[test]
    fn passive_devices_only_hear_kings() {
        let air = MemoryAirwaves::new();
        let (radio_p, mut p) = air.register(id("p"), vec![]);
        let (_rf, _f) = air.register(id("free"), vec![]);
        let (radio_k, _k) = air.register(id("king"), vec![]);
        radio_p.set_active(false);
        radio_k.set_local_role(Role::King);

        air.scan();
        let heard = p.try_recv().unwrap();
        assert_eq!(heard.device_id, id("king"));
        assert!(heard.is_king());
        assert!(p.try_recv().is_err());
        assert_eq!(air.advertised_role(&id("king")), Some(Role::King));
    }
}
