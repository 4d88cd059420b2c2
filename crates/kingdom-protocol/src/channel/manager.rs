//! Channel Manager: owns channels and connection records, routes traffic.
//!
//! Every channel message and every subscription change passes the master
//! exactly once, flagged first-hop on the way in. The master clears the
//! flag and fans the message out; everyone else just delivers. A master
//! talks to itself over a loopback record so its own publishes take the
//! same path as a member's.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use kingdom_transport::{Connection, ConnectionId, DEFAULT_PIPE_CAPACITY};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::{Channel, ChannelConfig};
use crate::error::KingdomError;
use crate::link::{ConnectionRecord, Inbound, LinkConfig};
use crate::message::admin::AdminMessage;
use crate::message::{Message, MessageKind};
use crate::types::{ChannelId, DeviceId};

/// What the manager reports to its owner (the runtime).
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// An admin message reached its final hop here.
    Admin {
        from: DeviceId,
        connection: ConnectionId,
        message: AdminMessage,
    },
    /// A connection record went away because the stream closed.
    ConnectionClosed {
        connection: ConnectionId,
        remote: DeviceId,
    },
    /// The subscriber mirror of `channel` changed.
    SubscriptionChanged {
        device: DeviceId,
        channel: ChannelId,
        subscribed: bool,
    },
    /// Internal consistency lost; the owner must stop.
    Fatal { reason: String },
}

#[derive(Default)]
struct Records {
    by_id: HashMap<ConnectionId, Arc<ConnectionRecord>>,
    loopback: Option<ConnectionId>,
}

impl Records {
    fn remote_records(&self) -> impl Iterator<Item = &Arc<ConnectionRecord>> {
        self.by_id.values().filter(|r| !r.is_loopback())
    }

    fn by_remote(&self, remote: &DeviceId) -> Option<Arc<ConnectionRecord>> {
        self.remote_records().find(|r| r.remote() == remote).cloned()
    }
}

struct Inner {
    local_id: DeviceId,
    link: LinkConfig,
    channel_config: ChannelConfig,
    channels: Mutex<HashMap<ChannelId, Channel>>,
    records: Mutex<Records>,
    is_master: AtomicBool,
    inbound: mpsc::Sender<Inbound>,
    events: mpsc::UnboundedSender<ManagerEvent>,
    connected: watch::Sender<bool>,
    shutdown: CancellationToken,
}

/// Process-wide registry of channels and connection records.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ChannelManager {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl ChannelManager {
    /// Create a manager in client mode with no connections.
    pub fn new(
        local_id: DeviceId,
        link: LinkConfig,
        channel_config: ChannelConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ManagerEvent>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(link.inbound_buffer.max(1));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (connected, _) = watch::channel(false);
        let shutdown = CancellationToken::new();

        let inner = Arc::new(Inner {
            local_id,
            link,
            channel_config,
            channels: Mutex::new(HashMap::new()),
            records: Mutex::new(Records::default()),
            is_master: AtomicBool::new(false),
            inbound: inbound_tx,
            events: events_tx,
            connected,
            shutdown: shutdown.clone(),
        });
        tokio::spawn(dispatch_loop(Arc::downgrade(&inner), inbound_rx, shutdown));
        (Self { inner }, events_rx)
    }

    fn from_weak(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn local_id(&self) -> &DeviceId {
        &self.inner.local_id
    }

    pub fn is_master(&self) -> bool {
        self.inner.is_master.load(Ordering::Acquire)
    }

    /// Live connection records, loopback excluded.
    pub fn connection_count(&self) -> usize {
        lock(&self.inner.records).remote_records().count()
    }

    /// Largest payload a single frame carries before chunking kicks in.
    pub fn frame_limit(&self) -> usize {
        self.inner.link.frame_payload()
    }

    pub fn connected_devices(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = lock(&self.inner.records)
            .remote_records()
            .map(|r| r.remote().clone())
            .collect();
        ids.sort();
        ids
    }

    fn emit(&self, event: ManagerEvent) {
        let _ = self.inner.events.send(event);
    }

    fn refresh_connected(&self) {
        let any = !lock(&self.inner.records).by_id.is_empty();
        self.inner.connected.send_if_modified(|c| {
            let changed = *c != any;
            *c = any;
            changed
        });
    }

    // ── Role ─────────────────────────────────────────────────────────

    /// Switch between master and client.
    ///
    /// Every record is deactivated and discarded and the subscriber
    /// mirrors are cleared. A new master installs its loopback and
    /// re-subscribes its own listeners through it. Asking for the current
    /// role is a no-op.
    pub async fn set_master(&self, master: bool) -> Result<(), KingdomError> {
        let has_loopback = lock(&self.inner.records).loopback.is_some();
        if self.is_master() == master && has_loopback == master {
            return Ok(());
        }
        tracing::info!(device = %self.inner.local_id, master, "channel manager role change");

        let old: Vec<Arc<ConnectionRecord>> = {
            let mut records = lock(&self.inner.records);
            records.loopback = None;
            records.by_id.drain().map(|(_, r)| r).collect()
        };
        self.refresh_connected();
        let mut result = Ok(());
        for record in old {
            let r = record.deactivate(self.inner.link.deactivate_timeout).await;
            record.connection().disconnect();
            if result.is_ok() {
                result = r;
            }
        }
        for channel in self.channels() {
            channel.clear_subscribers();
        }
        self.inner.is_master.store(master, Ordering::Release);

        if master {
            let loopback = Connection::loopback(self.inner.local_id.clone(), DEFAULT_PIPE_CAPACITY);
            let record = Arc::new(ConnectionRecord::activate(
                loopback,
                &self.inner.link,
                self.inner.inbound.clone(),
                true,
            ));
            {
                let mut records = lock(&self.inner.records);
                records.loopback = Some(record.id());
                records.by_id.insert(record.id(), record);
            }
            self.refresh_connected();
            self.reannounce_listeners()?;
        }
        result
    }

    // ── Connections ──────────────────────────────────────────────────

    /// Register a live connection and start its workers.
    ///
    /// A second live connection from the same device is an internal
    /// consistency failure; a stale closed one is replaced.
    pub async fn add_connection(&self, connection: Connection) -> Result<(), KingdomError> {
        let remote = connection.remote().clone();
        let stale = {
            let records = lock(&self.inner.records);
            match records.by_remote(&remote) {
                Some(existing) if !existing.connection().is_closed() => {
                    return Err(KingdomError::DuplicateRegistration(remote));
                }
                other => other,
            }
        };
        if let Some(stale) = stale {
            self.discard(stale.id()).await?;
        }

        let record = Arc::new(ConnectionRecord::activate(
            connection,
            &self.inner.link,
            self.inner.inbound.clone(),
            false,
        ));
        tracing::info!(device = %self.inner.local_id, remote = %remote, connection = %record.id(), "connection added");
        lock(&self.inner.records).by_id.insert(record.id(), record.clone());
        self.refresh_connected();

        if self.is_master() {
            self.share_subscriptions(&record)?;
        } else {
            self.reannounce_listeners()?;
        }
        Ok(())
    }

    /// Deactivate, remove and close one record. Unknown ids are ignored.
    pub async fn remove_connection(&self, id: ConnectionId) -> Result<(), KingdomError> {
        self.discard(id).await
    }

    /// Drop the record for `device`, if any.
    pub async fn disconnect_device(&self, device: &DeviceId) -> Result<bool, KingdomError> {
        let found = lock(&self.inner.records).by_remote(device).map(|r| r.id());
        match found {
            Some(id) => {
                self.discard(id).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drop every remote record; the loopback stays.
    ///
    /// With `flush`, queued messages get `flush_timeout` to leave first.
    pub async fn disconnect_all(&self, flush: bool) -> Result<(), KingdomError> {
        let targets: Vec<Arc<ConnectionRecord>> =
            lock(&self.inner.records).remote_records().cloned().collect();
        if flush {
            for record in &targets {
                if !record.flush(self.inner.link.flush_timeout).await {
                    tracing::debug!(remote = %record.remote(), "flush timed out before disconnect");
                }
            }
        }
        let mut result = Ok(());
        for record in targets {
            let r = self.discard(record.id()).await;
            if result.is_ok() {
                result = r;
            }
        }
        result
    }

    async fn discard(&self, id: ConnectionId) -> Result<(), KingdomError> {
        let record = {
            let mut records = lock(&self.inner.records);
            if records.loopback == Some(id) {
                records.loopback = None;
            }
            records.by_id.remove(&id)
        };
        self.refresh_connected();
        let Some(record) = record else {
            return Ok(());
        };
        let result = record.deactivate(self.inner.link.deactivate_timeout).await;
        record.connection().disconnect();
        tracing::debug!(remote = %record.remote(), connection = %id, "connection removed");
        result
    }

    // ── Channels ─────────────────────────────────────────────────────

    /// The channel `id`, created on first use.
    pub fn channel(&self, id: ChannelId) -> Channel {
        let mut channels = lock(&self.inner.channels);
        if let Some(channel) = channels.get(&id) {
            return channel.clone();
        }
        let channel = Channel::new(id, &self.inner.channel_config);
        channels.insert(id, channel.clone());
        tokio::spawn(drain_loop(
            Arc::downgrade(&self.inner),
            channel.clone(),
            self.inner.connected.subscribe(),
            self.inner.shutdown.clone(),
        ));
        channel
    }

    fn channels(&self) -> Vec<Channel> {
        lock(&self.inner.channels).values().cloned().collect()
    }

    /// Queue `payload` on channel `id` without waiting.
    pub fn publish(&self, id: ChannelId, payload: impl Into<Bytes>) -> Result<(), KingdomError> {
        self.channel(id).try_publish(payload)
    }

    /// Start listening on channel `id`.
    ///
    /// The first local listener announces the subscription to the master.
    pub fn subscribe(&self, id: ChannelId) -> Result<ChannelSubscription, KingdomError> {
        let channel = self.channel(id);
        let (listener, rx) = channel.add_listener();
        if channel.listener_count() == 1 {
            self.announce(id, true)?;
        }
        Ok(ChannelSubscription {
            channel,
            listener,
            rx,
            manager: Arc::downgrade(&self.inner),
        })
    }

    fn release_listener(&self, channel: &Channel, listener: u64) {
        if channel.remove_listener(listener) == 0 {
            if let Err(e) = self.announce(channel.id(), false) {
                tracing::warn!(channel = channel.id(), "unsubscribe failed: {e}");
            }
        }
    }

    /// Send Add/RemoveSubscription for ourselves through the master, or
    /// apply it locally when there is nobody to round-trip through.
    fn announce(&self, channel: ChannelId, subscribe: bool) -> Result<(), KingdomError> {
        let device = self.inner.local_id.clone();
        let message = if subscribe {
            AdminMessage::AddSubscription { device, channel }
        } else {
            AdminMessage::RemoveSubscription { device, channel }
        };
        if self.route_first_hop(Message::admin_message(&message)?.with_first_hop(true))? {
            return Ok(());
        }
        self.apply_subscription(&message);
        Ok(())
    }

    fn reannounce_listeners(&self) -> Result<(), KingdomError> {
        for channel in self.channels() {
            if channel.listener_count() > 0 {
                self.announce(channel.id(), true)?;
            }
        }
        Ok(())
    }

    /// Seed a new member's subscriber mirror with everything we know.
    fn share_subscriptions(&self, record: &ConnectionRecord) -> Result<(), KingdomError> {
        for channel in self.channels() {
            for device in channel.subscribers() {
                let message = AdminMessage::AddSubscription {
                    device,
                    channel: channel.id(),
                };
                record.send(Message::admin_message(&message)?)?;
            }
        }
        Ok(())
    }

    // ── Sending ──────────────────────────────────────────────────────

    /// Hand a first-hop message to the master: our loopback if we are it,
    /// otherwise our single upstream connection. `false` if neither exists.
    fn route_first_hop(&self, message: Message) -> Result<bool, KingdomError> {
        let target = {
            let records = lock(&self.inner.records);
            if self.is_master() {
                records.loopback.and_then(|id| records.by_id.get(&id).cloned())
            } else {
                records.remote_records().next().cloned()
            }
        };
        match target {
            Some(record) => {
                record.send(message)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Admin message straight to `to`, bypassing the master.
    pub fn send_admin(&self, to: &DeviceId, message: &AdminMessage) -> Result<bool, KingdomError> {
        let record = lock(&self.inner.records).by_remote(to);
        match record {
            Some(record) => {
                record.send(Message::admin_message(message)?)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Admin message to our king (client side only).
    pub fn send_admin_upstream(&self, message: &AdminMessage) -> Result<bool, KingdomError> {
        if self.is_master() {
            return Ok(false);
        }
        let record = lock(&self.inner.records).remote_records().next().cloned();
        match record {
            Some(record) => {
                record.send(Message::admin_message(message)?)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Admin message to every remote connection. Returns how many got it.
    pub fn broadcast_admin(&self, message: &AdminMessage) -> Result<usize, KingdomError> {
        let frame = Message::admin_message(message)?;
        let targets: Vec<Arc<ConnectionRecord>> =
            lock(&self.inner.records).remote_records().cloned().collect();
        for record in &targets {
            record.send(frame.clone())?;
        }
        Ok(targets.len())
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    fn record(&self, id: ConnectionId) -> Option<Arc<ConnectionRecord>> {
        lock(&self.inner.records).by_id.get(&id).cloned()
    }

    fn dispatch(&self, connection: ConnectionId, from: DeviceId, mut message: Message) {
        if self.is_master() && message.first_hop {
            message.first_hop = false;
            match message.kind {
                MessageKind::KeepAlive => {
                    tracing::warn!(remote = %from, "{}, closing", KingdomError::KeepAliveFirstHop);
                    if let Some(record) = self.record(connection) {
                        record.connection().disconnect();
                    }
                }
                MessageKind::Admin => {
                    let targets: Vec<Arc<ConnectionRecord>> =
                        lock(&self.inner.records).by_id.values().cloned().collect();
                    for record in targets {
                        if let Err(e) = record.send(message.clone()) {
                            tracing::warn!(remote = %record.remote(), "admin fan-out failed: {e}");
                        }
                    }
                }
                MessageKind::Channel(id) => {
                    let channel = self.channel(id);
                    let targets: Vec<Arc<ConnectionRecord>> = lock(&self.inner.records)
                        .by_id
                        .values()
                        .filter(|r| channel.is_subscriber(r.remote()))
                        .filter(|r| !(message.exclude_sender && r.id() == connection))
                        .cloned()
                        .collect();
                    for record in targets {
                        if let Err(e) = record.send(message.clone()) {
                            tracing::warn!(remote = %record.remote(), channel = id, "forward failed: {e}");
                        }
                    }
                }
            }
            return;
        }

        match message.kind {
            MessageKind::KeepAlive => {}
            MessageKind::Admin => match AdminMessage::decode(&message.payload) {
                Ok(admin) => {
                    self.apply_subscription(&admin);
                    self.emit(ManagerEvent::Admin {
                        from,
                        connection,
                        message: admin,
                    });
                }
                Err(e) => {
                    tracing::warn!(remote = %from, "protocol violation, closing: {e}");
                    if let Some(record) = self.record(connection) {
                        record.connection().disconnect();
                    }
                }
            },
            MessageKind::Channel(id) => {
                let channel = self.channel(id);
                if channel.deliver(message.payload) && channel.listener_count() == 0 {
                    tracing::debug!(channel = id, "last listener gone, unsubscribing");
                    if let Err(e) = self.announce(id, false) {
                        tracing::warn!(channel = id, "unsubscribe failed: {e}");
                    }
                }
            }
        }
    }

    fn apply_subscription(&self, message: &AdminMessage) {
        let (device, channel, subscribed) = match message {
            AdminMessage::AddSubscription { device, channel } => (device, *channel, true),
            AdminMessage::RemoveSubscription { device, channel } => (device, *channel, false),
            _ => return,
        };
        let ch = self.channel(channel);
        let changed = if subscribed {
            ch.add_subscriber(device.clone())
        } else {
            ch.remove_subscriber(device)
        };
        if changed {
            tracing::debug!(device = %device, channel, subscribed, "subscription changed");
            self.emit(ManagerEvent::SubscriptionChanged {
                device: device.clone(),
                channel,
                subscribed,
            });
        }
    }

    async fn on_closed(&self, connection: ConnectionId, remote: DeviceId) {
        if self.record(connection).is_none() {
            // Already discarded by a role change or explicit removal.
            return;
        }
        if let Err(e) = self.discard(connection).await {
            tracing::error!("{e}");
            self.emit(ManagerEvent::Fatal {
                reason: e.to_string(),
            });
        }

        if self.is_master() {
            for channel in self.channels() {
                if !channel.is_subscriber(&remote) {
                    continue;
                }
                let removal = AdminMessage::RemoveSubscription {
                    device: remote.clone(),
                    channel: channel.id(),
                };
                let routed = Message::admin_message(&removal)
                    .and_then(|m| self.route_first_hop(m.with_first_hop(true)));
                if !matches!(routed, Ok(true)) {
                    self.apply_subscription(&removal);
                }
            }
        }
        self.emit(ManagerEvent::ConnectionClosed { connection, remote });
    }

    /// Stop every worker and close every connection.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let all: Vec<ConnectionId> = lock(&self.inner.records).by_id.keys().copied().collect();
        for id in all {
            if let Err(e) = self.discard(id).await {
                tracing::warn!("shutdown: {e}");
            }
        }
    }
}

async fn dispatch_loop(
    weak: Weak<Inner>,
    mut inbound: mpsc::Receiver<Inbound>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = inbound.recv() => next,
        };
        let Some(next) = next else { break };
        let Some(manager) = ChannelManager::from_weak(&weak) else {
            break;
        };
        match next {
            Inbound::Message {
                connection,
                remote,
                message,
            } => manager.dispatch(connection, remote, message),
            Inbound::Closed { connection, remote } => manager.on_closed(connection, remote).await,
        }
    }
}

/// Publishes a channel's queue while at least one connection exists.
async fn drain_loop(
    weak: Weak<Inner>,
    channel: Channel,
    mut connected: watch::Receiver<bool>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            r = connected.wait_for(|c| *c) => if r.is_err() { return },
        }
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            r = connected.wait_for(|c| !*c) => {
                if r.is_err() { return }
                continue;
            }
            _ = channel.wait_published() => {}
        }
        let delay = channel.min_delay();
        if !delay.is_zero() {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let Some(message) = channel.pick() else {
            continue;
        };
        let Some(manager) = ChannelManager::from_weak(&weak) else {
            return;
        };
        match manager.route_first_hop(message) {
            Ok(true) => {}
            Ok(false) => tracing::debug!(channel = channel.id(), "no route to master, message dropped"),
            Err(e) => tracing::warn!(channel = channel.id(), "publish failed: {e}"),
        }
    }
}

/// A local listener on one channel.
///
/// Dropping the last subscription of a channel unsubscribes the device.
pub struct ChannelSubscription {
    channel: Channel,
    listener: u64,
    rx: mpsc::Receiver<Bytes>,
    manager: Weak<Inner>,
}

impl ChannelSubscription {
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Next payload delivered on the channel.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Bytes> {
        tokio::time::timeout(timeout, self.rx.recv()).await.ok().flatten()
    }

    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}

impl Drop for ChannelSubscription {
    fn drop(&mut self) {
        match ChannelManager::from_weak(&self.manager) {
            Some(manager) => manager.release_listener(&self.channel, self.listener),
            None => {
                self.channel.remove_listener(self.listener);
            }
        }
    }
}
