//! The kingdom runtime event loop.
//!
//! A single async task that owns the election machine and multiplexes
//! over application commands, accepted connections, discovery beacons,
//! channel-manager reports, dial outcomes and timers. Every input becomes
//! one `KingdomEvent`, handled to completion before the next is read.
use tokio::sync::mpsc;

use crate::channel::{ChannelManager, ManagerEvent};
use crate::discovery::BeaconStore;
use crate::error::KingdomError;
use crate::kingdom::{KingdomEvent, KingdomMachine, MachineContext};

use super::executor::{Executor, Resolved};
use super::{ProtocolEvent, RuntimeCommand, RuntimeConfig, RuntimeParts};

/// Main event loop: owns all election state.
pub(super) async fn runtime_loop(
    parts: RuntimeParts,
    config: RuntimeConfig,
    manager: ChannelManager,
    mut manager_rx: mpsc::UnboundedReceiver<ManagerEvent>,
    mut cmd_rx: mpsc::Receiver<RuntimeCommand>,
    event_tx: mpsc::Sender<ProtocolEvent>,
) {
    let RuntimeParts {
        local_id,
        metadata,
        dialer,
        mut incoming,
        mut beacons,
        discovery,
    } = parts;

    let store = BeaconStore::new();
    let (resolved_tx, mut resolved_rx) = mpsc::unbounded_channel();
    let mut exec = Executor::new(
        manager.clone(),
        dialer,
        discovery.clone(),
        store.clone(),
        config.dial_attempts,
        config.dial_retry_interval,
        resolved_tx,
        event_tx,
    );

    let ctx = MachineContext::new(local_id.clone(), metadata, config.election.clone(), store);
    let (mut machine, effects) = KingdomMachine::start(ctx);
    tracing::info!(device = %local_id, "kingdom runtime started");

    if let Err(e) = exec.run(effects).await {
        fail(&exec, e);
        shutdown(&exec, &manager).await;
        return;
    }

    let mut incoming_open = true;
    let mut beacons_open = true;

    loop {
        let event = tokio::select! {
            // ── 1. Application commands ─────────────────────────
            cmd = cmd_rx.recv() => match cmd {
                None | Some(RuntimeCommand::Shutdown) => break,
                Some(RuntimeCommand::GetRole { reply }) => {
                    let _ = reply.send(machine.role());
                    continue;
                }
                Some(RuntimeCommand::GetCensus { reply }) => {
                    let _ = reply.send(machine.census());
                    continue;
                }
                Some(RuntimeCommand::ReportBeacon(beacon)) => KingdomEvent::Discovered(beacon),
            },

            // ── 2. Connections accepted by the transport ────────
            conn = incoming.recv(), if incoming_open => match conn {
                Some(conn) => {
                    let remote = conn.remote().clone();
                    let connection = exec.park(conn);
                    KingdomEvent::Incoming { connection, remote }
                }
                None => {
                    tracing::debug!("accept stream ended");
                    incoming_open = false;
                    continue;
                }
            },

            // ── 3. Discovery ────────────────────────────────────
            beacon = beacons.recv(), if beacons_open => match beacon {
                Some(beacon) => KingdomEvent::Discovered(beacon),
                None => {
                    tracing::debug!("beacon stream ended");
                    beacons_open = false;
                    continue;
                }
            },

            // ── 4. Channel manager reports ──────────────────────
            Some(report) = manager_rx.recv() => match report {
                ManagerEvent::Admin { from, message, .. } => KingdomEvent::Admin { from, message },
                ManagerEvent::ConnectionClosed { connection, remote } => {
                    KingdomEvent::ConnectionClosed { connection, remote }
                }
                ManagerEvent::SubscriptionChanged { device, channel, subscribed } => {
                    exec.emit(ProtocolEvent::SubscriptionChanged { device, channel, subscribed });
                    continue;
                }
                ManagerEvent::Fatal { reason } => {
                    tracing::error!(device = %local_id, "channel manager failure: {reason}");
                    exec.emit(ProtocolEvent::Fatal { description: reason });
                    break;
                }
            },

            // ── 5. Dials and timers ─────────────────────────────
            Some(resolved) = resolved_rx.recv() => match resolved {
                Resolved::Dialed { ticket, target, connection: Some(conn) } => {
                    let remote = conn.remote().clone();
                    debug_assert_eq!(remote, target);
                    let connection = exec.park(conn);
                    KingdomEvent::DialSucceeded { ticket, connection, remote }
                }
                Resolved::Dialed { ticket, target, connection: None } => {
                    KingdomEvent::DialFailed { ticket, target }
                }
                Resolved::Timer { ticket, timer } => KingdomEvent::Timeout { ticket, timer },
            },
        };

        let effects = machine.handle(event);
        let result = exec.run(effects).await;
        exec.reap();
        if let Err(e) = result {
            fail(&exec, e);
            break;
        }
    }

    shutdown(&exec, &manager).await;
    tracing::info!(device = %local_id, "kingdom runtime stopped");
}

fn fail(exec: &Executor, error: KingdomError) {
    tracing::error!("fatal: {error}");
    exec.emit(ProtocolEvent::Fatal {
        description: error.to_string(),
    });
}

async fn shutdown(exec: &Executor, manager: &ChannelManager) {
    exec.tasks.cancel();
    exec.discovery.set_active(false);
    manager.shutdown().await;
}
