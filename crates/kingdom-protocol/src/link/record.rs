use std::time::Duration;

use kingdom_transport::{Connection, ConnectionId, DeviceId};
use tokio::sync::mpsc;

use super::{Inbound, KeepAlive, LinkConfig, MessageReceiver, MessageSender};
use crate::error::KingdomError;
use crate::message::Message;

/// One live connection paired with its sender, receiver and keep-alive.
pub struct ConnectionRecord {
    connection: Connection,
    sender: MessageSender,
    receiver: MessageReceiver,
    keep_alive: Option<KeepAlive>,
    loopback: bool,
}

impl ConnectionRecord {
    /// Start the workers for `connection`. Loopback records get no keep-alive.
    pub fn activate(
        connection: Connection,
        config: &LinkConfig,
        sink: mpsc::Sender<Inbound>,
        loopback: bool,
    ) -> Self {
        let sender = MessageSender::spawn(connection.clone(), config);
        let receiver = MessageReceiver::spawn(connection.clone(), config, sink);
        let keep_alive = (!loopback).then(|| {
            KeepAlive::spawn(
                connection.clone(),
                sender.handle(),
                receiver.last_seen(),
                config,
            )
        });
        tracing::debug!(
            connection = %connection.id(),
            remote = %connection.remote(),
            loopback,
            "connection record activated"
        );
        Self {
            connection,
            sender,
            receiver,
            keep_alive,
            loopback,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn remote(&self) -> &DeviceId {
        self.connection.remote()
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn is_loopback(&self) -> bool {
        self.loopback
    }

    pub fn send(&self, message: Message) -> Result<(), KingdomError> {
        self.sender.send(message)
    }

    pub async fn flush(&self, timeout: Duration) -> bool {
        self.sender.flush(timeout).await
    }

    /// Stop all workers, each finishing its current frame first.
    ///
    /// The connection itself stays open. Exceeding `timeout` is an
    /// internal consistency failure.
    pub async fn deactivate(&self, timeout: Duration) -> Result<(), KingdomError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let remaining = || deadline.saturating_duration_since(tokio::time::Instant::now());

        if let Some(ka) = &self.keep_alive {
            ka.deactivate(remaining()).await?;
        }
        self.sender.deactivate(remaining()).await?;
        self.receiver.deactivate(remaining()).await?;
        Ok(())
    }
}
