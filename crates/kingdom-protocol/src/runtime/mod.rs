//! Kingdom runtime: drives the election machine against live connections.
//!
//! One task owns the [`KingdomMachine`](crate::kingdom::KingdomMachine) and
//! feeds it every event in a single order: discovery beacons, incoming
//! connections, admin messages and closures reported by the channel
//! manager, dial outcomes and timer expiries. The effects it returns are
//! executed in the same task, which is the only place that does I/O.
mod executor;
mod r#loop;

use std::sync::Arc;
use std::time::Duration;

use kingdom_transport::{Connection, ConnectionMetadata, Dialer};
use tokio::sync::{mpsc, oneshot};

use crate::channel::{ChannelConfig, ChannelManager, ChannelSubscription};
use crate::discovery::{Beacon, Discovery};
use crate::error::KingdomError;
use crate::kingdom::{Census, ElectionConfig, PeasantReason};
use crate::link::LinkConfig;
use crate::types::{ChannelId, DeviceId, Role};

/// Environment variable overriding [`RuntimeConfig::dial_attempts`].
pub const ENV_DIAL_ATTEMPTS: &str = "KINGDOM_DIAL_ATTEMPTS";
/// Environment variable overriding the election free timeout (ms).
pub const ENV_FREE_TIMEOUT_MS: &str = "KINGDOM_FREE_TIMEOUT_MS";
/// Environment variable overriding the keep-alive interval (ms).
pub const ENV_KEEPALIVE_MS: &str = "KINGDOM_KEEPALIVE_MS";

// ── Configuration ─────────────────────────────────────────────────────

/// Configuration for the kingdom runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Sender, receiver and keep-alive tuning.
    pub link: LinkConfig,
    /// Defaults for channels created on demand.
    pub channel: ChannelConfig,
    /// Election timing.
    pub election: ElectionConfig,
    /// Attempts per dial before the transition gives up.
    pub dial_attempts: u32,
    /// Pause between dial attempts.
    pub dial_retry_interval: Duration,
    /// Capacity of the protocol event channel.
    pub event_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            channel: ChannelConfig::default(),
            election: ElectionConfig::default(),
            dial_attempts: 3,
            dial_retry_interval: Duration::from_millis(500),
            event_buffer: 256,
        }
    }
}

impl RuntimeConfig {
    /// Apply `KINGDOM_*` environment overrides. Unparsable values are
    /// logged and ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(n) = env_number(ENV_DIAL_ATTEMPTS) {
            self.dial_attempts = (n as u32).max(1);
        }
        if let Some(ms) = env_number(ENV_FREE_TIMEOUT_MS) {
            self.election.free_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number(ENV_KEEPALIVE_MS) {
            self.link.keepalive_interval = Duration::from_millis(ms);
        }
        self
    }
}

fn env_number(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(n) => Some(n),
        Err(e) => {
            tracing::warn!("ignoring {key}={raw:?}: {e}");
            None
        }
    }
}

// ── Commands (app → runtime) ──────────────────────────────────────────

/// Commands the application sends to the runtime event loop.
pub enum RuntimeCommand {
    /// Query the current role.
    GetRole { reply: oneshot::Sender<Role> },
    /// Query the census as this device knows it.
    GetCensus { reply: oneshot::Sender<Census> },
    /// Feed a beacon that did not come through the beacon stream.
    ReportBeacon(Beacon),
    /// Graceful shutdown.
    Shutdown,
}

// ── Events (runtime → app) ────────────────────────────────────────────

/// Protocol-level events the application may want to observe.
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    /// Our role changed. `reason` is set when the new role is Peasant.
    RoleChanged {
        role: Role,
        reason: Option<PeasantReason>,
    },
    /// A census was received (member) or changed (king).
    CensusUpdated { census: Census },
    /// The king confirmed a prince.
    PrincePronounced { prince: DeviceId },
    MemberJoined { device: DeviceId },
    MemberLeft { device: DeviceId },
    /// Our kingdom is being absorbed by `winner`.
    KingdomMerging { winner: DeviceId },
    /// A subscriber mirror changed.
    SubscriptionChanged {
        device: DeviceId,
        channel: ChannelId,
        subscribed: bool,
    },
    /// Runtime encountered a non-fatal error.
    Error { description: String },
    /// Internal consistency lost; the runtime has stopped.
    Fatal { description: String },
}

// ── RuntimeHandle (app-facing API) ───────────────────────────────────

/// Handle to communicate with a running [`KingdomRuntime`].
///
/// Cheap to clone. Queries are answered by the event loop; channel
/// operations go straight to the shared [`ChannelManager`].
#[derive(Clone)]
pub struct RuntimeHandle {
    cmd_tx: mpsc::Sender<RuntimeCommand>,
    local_id: DeviceId,
    manager: ChannelManager,
}

impl RuntimeHandle {
    pub fn local_id(&self) -> &DeviceId {
        &self.local_id
    }

    /// Current role. `Free` once the runtime has stopped.
    pub async fn role(&self) -> Role {
        let (tx, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(RuntimeCommand::GetRole { reply: tx }).await;
        rx.await.unwrap_or(Role::Free)
    }

    /// Census as this device knows it. Empty once the runtime has stopped.
    pub async fn census(&self) -> Census {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(RuntimeCommand::GetCensus { reply: tx })
            .await;
        rx.await.unwrap_or_default()
    }

    /// The channel manager this runtime reconfigures on every transition.
    pub fn channels(&self) -> &ChannelManager {
        &self.manager
    }

    pub fn subscribe(&self, channel: ChannelId) -> Result<ChannelSubscription, KingdomError> {
        self.manager.subscribe(channel)
    }

    pub fn publish(&self, channel: ChannelId, payload: impl Into<bytes::Bytes>) -> Result<(), KingdomError> {
        self.manager.publish(channel, payload)
    }

    pub async fn report_beacon(&self, beacon: Beacon) -> Result<(), KingdomError> {
        self.cmd_tx
            .send(RuntimeCommand::ReportBeacon(beacon))
            .await
            .map_err(|_| KingdomError::RuntimeClosed)
    }

    /// Graceful shutdown.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(RuntimeCommand::Shutdown).await;
    }
}

// ── RuntimeChannels ──────────────────────────────────────────────────

/// Channels returned to the application when the runtime starts.
pub struct RuntimeChannels {
    /// Handle to send commands to the runtime.
    pub handle: RuntimeHandle,
    /// Receive protocol-level events.
    pub events: mpsc::Receiver<ProtocolEvent>,
}

/// What a runtime needs from the outside world.
pub struct RuntimeParts {
    pub local_id: DeviceId,
    /// How others reach us; sent with prince acknowledgements.
    pub metadata: Vec<ConnectionMetadata>,
    pub dialer: Arc<dyn Dialer>,
    /// Connections accepted by the transport.
    pub incoming: mpsc::Receiver<Connection>,
    /// Beacons heard by the radio.
    pub beacons: mpsc::Receiver<Beacon>,
    pub discovery: Arc<dyn Discovery>,
}

// ── KingdomRuntime ───────────────────────────────────────────────────

/// The kingdom runtime: spawn it and communicate via channels.
pub struct KingdomRuntime;

impl KingdomRuntime {
    /// Create the channel manager and start the event loop as a tokio task.
    pub fn spawn(parts: RuntimeParts, config: RuntimeConfig) -> RuntimeChannels {
        let local_id = parts.local_id.clone();

        let (cmd_tx, cmd_rx) = mpsc::channel::<RuntimeCommand>(64);
        let (event_tx, event_rx) = mpsc::channel::<ProtocolEvent>(config.event_buffer.max(1));

        let (manager, manager_rx) =
            ChannelManager::new(local_id.clone(), config.link.clone(), config.channel.clone());

        tokio::spawn(r#loop::runtime_loop(
            parts,
            config,
            manager.clone(),
            manager_rx,
            cmd_rx,
            event_tx,
        ));

        RuntimeChannels {
            handle: RuntimeHandle {
                cmd_tx,
                local_id,
                manager,
            },
            events: event_rx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let config = RuntimeConfig::default();
        assert!(config.dial_attempts >= 1);
        assert!(config.link.liveness_timeout > config.link.keepalive_interval);
        assert!(config.election.free_timeout > Duration::ZERO);
    }

    #[test]
    fn env_overrides_apply() {
        // Only this test touches these variables.
        std::env::set_var(ENV_DIAL_ATTEMPTS, "7");
        std::env::set_var(ENV_FREE_TIMEOUT_MS, "not-a-number");
        let config = RuntimeConfig::default().with_env_overrides();
        std::env::remove_var(ENV_DIAL_ATTEMPTS);
        std::env::remove_var(ENV_FREE_TIMEOUT_MS);
        assert_eq!(config.dial_attempts, 7);
        assert_eq!(
            config.election.free_timeout,
            ElectionConfig::default().free_timeout
        );
    }
}
