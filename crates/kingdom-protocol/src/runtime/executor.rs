//! Effect executor: the only place that touches I/O.
//!
//! Takes the effects of one state-machine step and carries them out in
//! order:
//! - SetMaster / Adopt / Disconnect* -> channel manager
//! - Send*/BroadcastAdmin -> channel manager admin paths
//! - SetDiscovery / AnnounceRole -> discovery handle
//! - Dial / StartTimer -> spawned tasks that report back as `Resolved`
//! - Emit -> event channel
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kingdom_transport::{Connection, ConnectionId, ConnectionMetadata, Dialer};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::channel::ChannelManager;
use crate::discovery::{BeaconStore, Discovery};
use crate::error::KingdomError;
use crate::kingdom::{KingdomEffect, Ticket, TimerKind};
use crate::types::DeviceId;

use super::ProtocolEvent;

/// Outcome of a background dial or timer, fed back into the event loop.
pub(super) enum Resolved {
    Dialed {
        ticket: Ticket,
        target: DeviceId,
        connection: Option<Connection>,
    },
    Timer {
        ticket: Ticket,
        timer: TimerKind,
    },
}

pub(super) struct Executor {
    pub(super) manager: ChannelManager,
    pub(super) dialer: Arc<dyn Dialer>,
    pub(super) discovery: Arc<dyn Discovery>,
    pub(super) beacons: BeaconStore,
    pub(super) dial_attempts: u32,
    pub(super) dial_retry_interval: Duration,
    pub(super) resolved_tx: mpsc::UnboundedSender<Resolved>,
    pub(super) event_tx: mpsc::Sender<ProtocolEvent>,
    /// Cancels every outstanding dial and timer on shutdown.
    pub(super) tasks: CancellationToken,
    /// Connections waiting for the machine to adopt or reject them.
    parked: HashMap<ConnectionId, Connection>,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        manager: ChannelManager,
        dialer: Arc<dyn Dialer>,
        discovery: Arc<dyn Discovery>,
        beacons: BeaconStore,
        dial_attempts: u32,
        dial_retry_interval: Duration,
        resolved_tx: mpsc::UnboundedSender<Resolved>,
        event_tx: mpsc::Sender<ProtocolEvent>,
    ) -> Self {
        Self {
            manager,
            dialer,
            discovery,
            beacons,
            dial_attempts: dial_attempts.max(1),
            dial_retry_interval,
            resolved_tx,
            event_tx,
            tasks: CancellationToken::new(),
            parked: HashMap::new(),
        }
    }

    /// Hold `connection` until the next step adopts or rejects it.
    pub(super) fn park(&mut self, connection: Connection) -> ConnectionId {
        let id = connection.id();
        self.parked.insert(id, connection);
        id
    }

    /// Close connections the last step neither adopted nor rejected
    /// (a dial that landed after its state was superseded, for example).
    pub(super) fn reap(&mut self) {
        for (id, connection) in self.parked.drain() {
            tracing::debug!(connection = %id, remote = %connection.remote(), "closing unclaimed connection");
            connection.disconnect();
        }
    }

    pub(super) fn emit(&self, event: ProtocolEvent) {
        // try_send: the loop never blocks on a slow consumer.
        if self.event_tx.try_send(event).is_err() {
            tracing::debug!("protocol event dropped");
        }
    }

    /// Execute one step's effects. Only fatal errors are returned; others
    /// are reported as `ProtocolEvent::Error` and execution continues.
    pub(super) async fn run(&mut self, effects: Vec<KingdomEffect>) -> Result<(), KingdomError> {
        for effect in effects {
            if let Err(e) = self.apply(effect).await {
                if e.is_fatal() {
                    return Err(e);
                }
                tracing::warn!("effect failed: {e}");
                self.emit(ProtocolEvent::Error {
                    description: e.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn apply(&mut self, effect: KingdomEffect) -> Result<(), KingdomError> {
        match effect {
            KingdomEffect::SetMaster(master) => self.manager.set_master(master).await?,
            KingdomEffect::SetDiscovery(active) => self.discovery.set_active(active),
            KingdomEffect::AnnounceRole(role) => self.discovery.set_local_role(role),
            KingdomEffect::Adopt(id) => match self.parked.remove(&id) {
                Some(connection) => self.manager.add_connection(connection).await?,
                None => tracing::warn!(connection = %id, "adopt of unknown connection"),
            },
            KingdomEffect::Reject(id) => {
                if let Some(connection) = self.parked.remove(&id) {
                    tracing::debug!(remote = %connection.remote(), "connection rejected");
                    connection.disconnect();
                }
            }
            KingdomEffect::Dial {
                ticket,
                target,
                metadata,
                delay,
            } => self.spawn_dial(ticket, target, metadata, delay),
            KingdomEffect::Disconnect(device) => {
                self.manager.disconnect_device(&device).await?;
            }
            KingdomEffect::DisconnectAll { flush } => self.manager.disconnect_all(flush).await?,
            KingdomEffect::SendAdmin { to, message } => {
                if !self.manager.send_admin(&to, &message)? {
                    tracing::debug!(to = %to, kind = message.name(), "no connection for admin message");
                }
            }
            KingdomEffect::SendAdminUpstream(message) => {
                if !self.manager.send_admin_upstream(&message)? {
                    tracing::debug!(kind = message.name(), "no upstream for admin message");
                }
            }
            KingdomEffect::BroadcastAdmin(message) => {
                let n = self.manager.broadcast_admin(&message)?;
                tracing::debug!(kind = message.name(), recipients = n, "admin broadcast");
            }
            KingdomEffect::StartTimer {
                ticket,
                timer,
                after,
            } => self.spawn_timer(ticket, timer, after),
            KingdomEffect::Emit(event) => self.emit(event),
        }
        Ok(())
    }

    fn spawn_timer(&self, ticket: Ticket, timer: TimerKind, after: Duration) {
        let tx = self.resolved_tx.clone();
        let cancel = self.tasks.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    let _ = tx.send(Resolved::Timer { ticket, timer });
                }
            }
        });
    }

    fn spawn_dial(
        &self,
        ticket: Ticket,
        target: DeviceId,
        metadata: Vec<ConnectionMetadata>,
        delay: Duration,
    ) {
        let tx = self.resolved_tx.clone();
        let cancel = self.tasks.clone();
        let dialer = self.dialer.clone();
        let beacons = self.beacons.clone();
        let attempts = self.dial_attempts;
        let retry = self.dial_retry_interval;
        tokio::spawn(async move {
            let dial = dial_with_retries(dialer, beacons, &target, metadata, delay, attempts, retry);
            let connection = tokio::select! {
                _ = cancel.cancelled() => return,
                c = dial => c,
            };
            let _ = tx.send(Resolved::Dialed {
                ticket,
                target,
                connection,
            });
        });
    }
}

/// Dial `target` up to `attempts` times. Metadata is refreshed from the
/// beacon store before every attempt so a late beacon still helps.
async fn dial_with_retries(
    dialer: Arc<dyn Dialer>,
    beacons: BeaconStore,
    target: &DeviceId,
    metadata: Vec<ConnectionMetadata>,
    delay: Duration,
    attempts: u32,
    retry: Duration,
) -> Option<Connection> {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    let mut metadata = metadata;
    for attempt in 1..=attempts {
        if let Some(fresh) = beacons.get(target) {
            metadata = fresh;
        }
        match dialer.dial(target, &metadata).await {
            Ok(connection) if connection.remote() == target => return Some(connection),
            Ok(connection) => {
                tracing::warn!(target = %target, got = %connection.remote(), "dialed the wrong device");
                connection.disconnect();
            }
            Err(e) => {
                tracing::debug!(target = %target, attempt, attempts, "dial failed: {e}");
            }
        }
        if attempt < attempts {
            tokio::time::sleep(retry).await;
        }
    }
    tracing::info!(target = %target, attempts, "giving up on dial");
    None
}
