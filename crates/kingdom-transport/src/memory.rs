//! In-process network used by tests and the stress harness.
//!
//! Every device registers a listener; dialing creates a duplex pipe and
//! hands the far end to the target's listener. Reachability can be toggled
//! per device and live connections can be severed to simulate range loss.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::{
    Connection, ConnectionMetadata, DeviceId, Dialer, TransportConfig, TransportError,
    TransportKind,
};

const ACCEPT_BACKLOG: usize = 32;

/// Shared registry of in-memory listeners.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkState>>,
    config: TransportConfig,
}

#[derive(Default)]
struct NetworkState {
    listeners: HashMap<DeviceId, mpsc::Sender<Connection>>,
    unreachable: HashSet<DeviceId>,
    /// Every connection ever opened, keyed by both endpoints, for `sever`.
    live: Vec<(DeviceId, DeviceId, Connection)>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::with_config(TransportConfig::new())
    }

    pub fn with_config(config: TransportConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(NetworkState::default())),
            config,
        }
    }

    /// Register `id` and return the stream of connections dialed to it.
    ///
    /// Listening again replaces the previous registration.
    pub fn listen(&self, id: DeviceId) -> mpsc::Receiver<Connection> {
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let mut state = self.lock();
        state.listeners.insert(id, tx);
        rx
    }

    /// A dialer that opens connections on behalf of `local`.
    pub fn dialer(&self, local: DeviceId) -> MemoryDialer {
        MemoryDialer {
            local,
            network: self.clone(),
        }
    }

    /// Make `id` (un)reachable for future dials. Existing connections stay up.
    pub fn set_reachable(&self, id: &DeviceId, reachable: bool) {
        let mut state = self.lock();
        if reachable {
            state.unreachable.remove(id);
        } else {
            state.unreachable.insert(id.clone());
        }
    }

    /// Close every live connection touching `id`. Returns how many were closed.
    pub fn sever(&self, id: &DeviceId) -> usize {
        let mut state = self.lock();
        let mut closed = 0;
        state.live.retain(|(a, b, conn)| {
            if a == id || b == id {
                if conn.disconnect() {
                    closed += 1;
                }
                false
            } else {
                !conn.is_closed()
            }
        });
        tracing::debug!(device = %id, closed, "severed memory connections");
        closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn connect(
        &self,
        local: &DeviceId,
        target: &DeviceId,
    ) -> Result<Connection, TransportError> {
        let listener = {
            let state = self.lock();
            if state.unreachable.contains(target) || state.unreachable.contains(local) {
                return Err(TransportError::Connect {
                    device_id: target.clone(),
                    source: anyhow::anyhow!("device out of range"),
                });
            }
            state.listeners.get(target).cloned()
        };
        let Some(listener) = listener else {
            return Err(TransportError::Connect {
                device_id: target.clone(),
                source: anyhow::anyhow!("no listener"),
            });
        };

        let capacity = self.config.get_pipe_capacity();
        let (ours, theirs) = Connection::pipe(local.clone(), target.clone(), capacity);
        let ours = ours.with_io_timeout(self.config.io_timeout);
        let theirs = theirs.with_io_timeout(self.config.io_timeout);

        tokio::time::timeout(self.config.get_connect_timeout(), listener.send(theirs.clone()))
            .await
            .map_err(|_| TransportError::Timeout(self.config.get_connect_timeout()))?
            .map_err(|_| TransportError::Connect {
                device_id: target.clone(),
                source: anyhow::anyhow!("listener dropped"),
            })?;

        let mut state = self.lock();
        state.live.retain(|(_, _, c)| !c.is_closed());
        state.live.push((local.clone(), target.clone(), ours.clone()));
        state.live.push((target.clone(), local.clone(), theirs));
        Ok(ours)
    }
}

/// [`Dialer`] over a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryDialer {
    local: DeviceId,
    network: MemoryNetwork,
}

impl MemoryDialer {
    pub fn local_id(&self) -> &DeviceId {
        &self.local
    }
}

#[async_trait::async_trait]
impl Dialer for MemoryDialer {
    async fn dial(
        &self,
        target: &DeviceId,
        metadata: &[ConnectionMetadata],
    ) -> Result<Connection, TransportError> {
        // Empty metadata is accepted: the identity is the address.
        if !metadata.is_empty()
            && !metadata.iter().any(|m| m.transport == TransportKind::Memory)
        {
            return Err(TransportError::NoRoute(target.clone()));
        }
        self.network.connect(&self.local, target).await
    }
}
