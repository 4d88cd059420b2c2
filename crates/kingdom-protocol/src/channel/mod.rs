//! Application pub/sub channels.
//!
//! A [`Channel`] is a bounded outbound mailbox plus the listeners that
//! receive its inbound payloads. The [`ChannelManager`] owns every channel
//! and every connection, routes traffic through the master and keeps the
//! subscriber mirrors in sync.

mod manager;
mod picker;

pub use manager::{ChannelManager, ChannelSubscription, ManagerEvent};
pub use picker::PickPolicy;

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};

use crate::error::KingdomError;
use crate::message::Message;
use crate::types::{ChannelId, DeviceId, Priority};

/// Defaults applied to channels as they are created.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Outbound messages a channel may hold before publishing fails.
    pub capacity: usize,
    pub policy: PickPolicy,
    pub priority: Priority,
    /// Pause before each pick of the drain loop.
    pub min_delay: Duration,
    /// Payloads buffered per listener before new ones are dropped.
    pub listener_buffer: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            policy: PickPolicy::ProcessAll,
            priority: Priority::Normal,
            min_delay: Duration::ZERO,
            listener_buffer: 256,
        }
    }
}

impl ChannelConfig {
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn policy(mut self, policy: PickPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn min_delay(mut self, delay: Duration) -> Self {
        self.min_delay = delay;
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    policy: PickPolicy,
    priority: Priority,
    min_delay: Duration,
    exclude_sender: bool,
}

struct Pending {
    items: VecDeque<Bytes>,
    capacity: usize,
}

struct Inner {
    id: ChannelId,
    pending: Mutex<Pending>,
    space: Notify,
    published: Notify,
    settings: Mutex<Settings>,
    listeners: Mutex<Vec<(u64, mpsc::Sender<Bytes>)>>,
    next_listener: AtomicU64,
    listener_buffer: usize,
    subscribers: Mutex<BTreeSet<DeviceId>>,
}

/// One pub/sub topic. Cheap to clone.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl Channel {
    pub(crate) fn new(id: ChannelId, config: &ChannelConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                pending: Mutex::new(Pending {
                    items: VecDeque::with_capacity(config.capacity),
                    capacity: config.capacity.max(1),
                }),
                space: Notify::new(),
                published: Notify::new(),
                settings: Mutex::new(Settings {
                    policy: config.policy,
                    priority: config.priority,
                    min_delay: config.min_delay,
                    exclude_sender: false,
                }),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                listener_buffer: config.listener_buffer.max(1),
                subscribers: Mutex::new(BTreeSet::new()),
            }),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    // ── Publishing ───────────────────────────────────────────────────

    /// Queue `payload` without waiting. Fails with `QueueFull` at capacity.
    pub fn try_publish(&self, payload: impl Into<Bytes>) -> Result<(), KingdomError> {
        self.push(payload.into())
            .map_err(|_| KingdomError::QueueFull(self.inner.id))
    }

    /// Queue `payload`, waiting up to `timeout` for room.
    pub async fn publish_timeout(
        &self,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<(), KingdomError> {
        let mut payload = payload.into();
        let wait = async {
            loop {
                let space = self.inner.space.notified();
                tokio::pin!(space);
                space.as_mut().enable();
                match self.push(payload) {
                    Ok(()) => return,
                    Err(back) => payload = back,
                }
                space.await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| KingdomError::PublishTimeout {
                channel: self.inner.id,
                timeout,
            })
    }

    fn push(&self, payload: Bytes) -> Result<(), Bytes> {
        {
            let mut pending = lock(&self.inner.pending);
            if pending.items.len() >= pending.capacity {
                return Err(payload);
            }
            pending.items.push_back(payload);
        }
        self.inner.published.notify_one();
        Ok(())
    }

    /// Messages waiting for the drain loop.
    pub fn pending(&self) -> usize {
        lock(&self.inner.pending).items.len()
    }

    pub fn capacity(&self) -> usize {
        lock(&self.inner.pending).capacity
    }

    /// Resize the queue, keeping the oldest messages that still fit.
    pub fn set_capacity(&self, capacity: usize) {
        let capacity = capacity.max(1);
        let dropped = {
            let mut pending = lock(&self.inner.pending);
            let old = std::mem::take(&mut pending.items);
            let mut items = VecDeque::with_capacity(capacity);
            let mut dropped = 0usize;
            for item in old {
                if items.len() < capacity {
                    items.push_back(item);
                } else {
                    dropped += 1;
                }
            }
            pending.items = items;
            pending.capacity = capacity;
            dropped
        };
        if dropped > 0 {
            tracing::warn!(channel = self.inner.id, dropped, capacity, "channel shrunk, overflow dropped");
        }
        self.inner.space.notify_waiters();
    }

    // ── Settings ─────────────────────────────────────────────────────

    pub fn policy(&self) -> PickPolicy {
        lock(&self.inner.settings).policy
    }

    pub fn set_policy(&self, policy: PickPolicy) {
        lock(&self.inner.settings).policy = policy;
    }

    pub fn priority(&self) -> Priority {
        lock(&self.inner.settings).priority
    }

    pub fn set_priority(&self, priority: Priority) {
        lock(&self.inner.settings).priority = priority;
    }

    pub fn min_delay(&self) -> Duration {
        lock(&self.inner.settings).min_delay
    }

    pub fn set_min_delay(&self, delay: Duration) {
        lock(&self.inner.settings).min_delay = delay;
    }

    /// Ask the master not to echo this channel's messages back to us.
    pub fn set_exclude_sender(&self, exclude: bool) {
        lock(&self.inner.settings).exclude_sender = exclude;
    }

    // ── Subscribers (mirror of the master's view) ────────────────────

    pub fn subscribers(&self) -> Vec<DeviceId> {
        lock(&self.inner.subscribers).iter().cloned().collect()
    }

    pub fn is_subscriber(&self, id: &DeviceId) -> bool {
        lock(&self.inner.subscribers).contains(id)
    }

    pub(crate) fn add_subscriber(&self, id: DeviceId) -> bool {
        lock(&self.inner.subscribers).insert(id)
    }

    pub(crate) fn remove_subscriber(&self, id: &DeviceId) -> bool {
        lock(&self.inner.subscribers).remove(id)
    }

    pub(crate) fn clear_subscribers(&self) {
        lock(&self.inner.subscribers).clear();
    }

    // ── Listeners (local consumers) ──────────────────────────────────

    pub(crate) fn add_listener(&self) -> (u64, mpsc::Receiver<Bytes>) {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.listener_buffer);
        lock(&self.inner.listeners).push((id, tx));
        (id, rx)
    }

    /// Remove a listener; returns how many remain.
    pub(crate) fn remove_listener(&self, id: u64) -> usize {
        let mut listeners = lock(&self.inner.listeners);
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len()
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner.listeners).len()
    }

    /// Hand an inbound payload to every local listener.
    ///
    /// Returns `true` when pruning closed listeners left none behind.
    pub(crate) fn deliver(&self, payload: Bytes) -> bool {
        let mut listeners = lock(&self.inner.listeners);
        let before = listeners.len();
        listeners.retain(|(lid, tx)| match tx.try_send(payload.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(channel = self.inner.id, listener = lid, "listener lagging, payload dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        listeners.is_empty() && before > 0
    }

    // ── Drain side ───────────────────────────────────────────────────

    pub(crate) async fn wait_published(&self) {
        loop {
            let published = self.inner.published.notified();
            tokio::pin!(published);
            published.as_mut().enable();
            if self.pending() > 0 {
                return;
            }
            published.await;
        }
    }

    /// Next message per the picking policy, as a first-hop frame.
    pub(crate) fn pick(&self) -> Option<Message> {
        let settings = *lock(&self.inner.settings);
        let payload = {
            let mut pending = lock(&self.inner.pending);
            settings.policy.pick(&mut pending.items)
        }?;
        self.inner.space.notify_waiters();
        Some(
            Message::channel(self.inner.id, settings.priority, payload)
                .with_first_hop(true)
                .excluding_sender(settings.exclude_sender),
        )
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("pending", &self.pending())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(capacity: usize) -> Channel {
        Channel::new(1, &ChannelConfig::default().capacity(capacity))
    }

    #[test]
    fn try_publish_fails_when_full() {
        let ch = channel(2);
        ch.try_publish(&b"a"[..]).unwrap();
        ch.try_publish(&b"b"[..]).unwrap();
        assert!(matches!(
            ch.try_publish(&b"c"[..]).unwrap_err(),
            KingdomError::QueueFull(1)
        ));
        assert_eq!(ch.pending(), 2);
    }

    #[tokio::test]
    async fn publish_timeout_waits_for_room() {
        let ch = channel(1);
        ch.try_publish(&b"a"[..]).unwrap();

        let err = ch
            .publish_timeout(&b"b"[..], Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, KingdomError::PublishTimeout { .. }));

        let drainer = ch.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drainer.pick();
        });
        ch.publish_timeout(&b"c"[..], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(&ch.pick().unwrap().payload[..], b"c");
    }

    #[test]
    fn shrinking_keeps_oldest() {
        let ch = channel(5);
        for b in [1u8, 2, 3, 4] {
            ch.try_publish(vec![b]).unwrap();
        }
        ch.set_capacity(2);
        assert_eq!(ch.capacity(), 2);
        assert_eq!(ch.pending(), 2);
        assert_eq!(ch.pick().unwrap().payload[0], 1);
        assert_eq!(ch.pick().unwrap().payload[0], 2);
        assert!(ch.pick().is_none());
    }

    #[test]
    fn picked_message_is_first_hop_with_settings() {
        let ch = channel(4);
        ch.set_priority(Priority::High);
        ch.set_exclude_sender(true);
        ch.try_publish(&b"x"[..]).unwrap();
        let msg = ch.pick().unwrap();
        assert!(msg.first_hop);
        assert!(msg.exclude_sender);
        assert_eq!(msg.priority, Priority::High);
        assert_eq!(msg.channel_id(), Some(1));
    }

    #[tokio::test]
    async fn deliver_reaches_every_listener() {
        let ch = channel(4);
        let (_a, mut rx_a) = ch.add_listener();
        let (b, mut rx_b) = ch.add_listener();
        ch.deliver(Bytes::from_static(b"hey"));
        assert_eq!(&rx_a.recv().await.unwrap()[..], b"hey");
        assert_eq!(&rx_b.recv().await.unwrap()[..], b"hey");
        assert_eq!(ch.remove_listener(b), 1);
    }

    #[test]
    fn closed_listeners_are_pruned_on_delivery() {
        let ch = channel(4);
        let (_id, rx) = ch.add_listener();
        let (_kept, kept_rx) = ch.add_listener();
        drop(rx);
        assert!(!ch.deliver(Bytes::from_static(b"x")));
        assert_eq!(ch.listener_count(), 1);
        drop(kept_rx);
        assert!(ch.deliver(Bytes::from_static(b"y")));
        assert_eq!(ch.listener_count(), 0);
        assert!(!ch.deliver(Bytes::from_static(b"z")));
    }

    #[test]
    fn subscriber_mirror() {
        let ch = channel(4);
        let d: DeviceId = "d".parse().unwrap();
        assert!(ch.add_subscriber(d.clone()));
        assert!(!ch.add_subscriber(d.clone()));
        assert!(ch.is_subscriber(&d));
        assert!(ch.remove_subscriber(&d));
        ch.add_subscriber(d);
        ch.clear_subscribers();
        assert!(ch.subscribers().is_empty());
    }
}
