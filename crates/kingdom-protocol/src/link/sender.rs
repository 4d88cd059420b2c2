use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kingdom_transport::Connection;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::queue::SendQueue;
use super::LinkConfig;
use crate::error::KingdomError;
use crate::message::{chunk, codec, Message};

struct Shared {
    connection: Connection,
    queue: SendQueue,
    max_payload: usize,
    chunk_ids: AtomicU16,
    drained: Notify,
}

impl Shared {
    fn enqueue(&self, message: Message) -> Result<(), KingdomError> {
        if message.payload.len() <= self.max_payload {
            self.queue.push_all([message]);
            return Ok(());
        }
        let chunk_id = self.chunk_ids.fetch_add(1, Ordering::Relaxed);
        let chunks = chunk::split(&message, chunk_id, self.max_payload)?;
        tracing::trace!(
            remote = %self.connection.remote(),
            chunk_id,
            chunks = chunks.len(),
            "chunking oversized message"
        );
        self.queue.push_all(chunks);
        Ok(())
    }
}

/// Outbound pump for one connection.
///
/// `send` never blocks: messages go into a priority queue drained by a
/// single worker that writes frames in (priority, arrival) order. A write
/// that failed before any byte went out puts the message back and retries
/// after a back-off; a torn write closes the connection.
pub struct MessageSender {
    shared: Arc<Shared>,
    stop: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable enqueue-only view of a [`MessageSender`].
#[derive(Clone)]
pub struct SenderHandle {
    shared: Arc<Shared>,
}

impl SenderHandle {
    pub fn send(&self, message: Message) -> Result<(), KingdomError> {
        self.shared.enqueue(message)
    }
}

impl MessageSender {
    pub fn spawn(connection: Connection, config: &LinkConfig) -> Self {
        let shared = Arc::new(Shared {
            connection,
            queue: SendQueue::default(),
            max_payload: config.frame_payload(),
            chunk_ids: AtomicU16::new(rand::random()),
            drained: Notify::new(),
        });
        let stop = CancellationToken::new();
        let worker = tokio::spawn(run(shared.clone(), stop.clone(), config.write_backoff));
        Self {
            shared,
            stop,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue `message`; payloads above the frame limit are chunked.
    pub fn send(&self, message: Message) -> Result<(), KingdomError> {
        self.shared.enqueue(message)
    }

    pub fn handle(&self) -> SenderHandle {
        SenderHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    /// Wait until everything queued so far has been written.
    ///
    /// Returns `false` if the queue did not drain within `timeout`.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let drained = self.shared.drained.notified();
                tokio::pin!(drained);
                drained.as_mut().enable();
                if self.shared.queue.is_idle() || self.shared.connection.is_closed() {
                    return;
                }
                drained.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Stop the worker after its current write and wait for it.
    pub async fn deactivate(&self, timeout: Duration) -> Result<(), KingdomError> {
        self.stop.cancel();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        let Some(worker) = worker else {
            return Ok(());
        };
        match tokio::time::timeout(timeout, worker).await {
            Ok(_) => Ok(()),
            Err(_) => Err(KingdomError::ShutdownTimeout {
                what: format!("sender to {}", self.shared.connection.remote()),
                timeout,
            }),
        }
    }
}

impl Drop for MessageSender {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn run(shared: Arc<Shared>, stop: CancellationToken, backoff: Duration) {
    let remote = shared.connection.remote().clone();
    loop {
        let entry = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            entry = shared.queue.pop() => entry,
        };

        // The write is not raced against `stop`: a frame is finished once started.
        match codec::write_message(&shared.connection, &entry.message).await {
            Ok(()) => shared.queue.finish(),
            Err(KingdomError::Transport(e)) if e.is_disconnect() => {
                tracing::debug!(remote = %remote, "sender stopping: {e}");
                shared.queue.finish();
                shared.drained.notify_waiters();
                break;
            }
            Err(e @ KingdomError::PayloadTooLarge(_)) => {
                tracing::warn!(remote = %remote, "dropping unsendable message: {e}");
                shared.queue.finish();
            }
            Err(e) => {
                tracing::warn!(remote = %remote, "write failed, retrying in {backoff:?}: {e}");
                shared.queue.requeue(entry);
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => continue,
                }
            }
        }

        if shared.queue.is_idle() {
            shared.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;
    use kingdom_transport::DeviceId;

    fn id(s: &str) -> DeviceId {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn writes_frames_in_priority_order() {
        let (ours, theirs) = Connection::pipe(id("a"), id("b"), 64 * 1024);
        let config = LinkConfig::default();
        let sender = MessageSender::spawn(ours, &config);

        // One batch, so the worker cannot pop the Low message early.
        sender.shared.queue.push_all([
            Message::channel(1, Priority::Low, vec![1u8]),
            Message::channel(1, Priority::Admin, vec![2u8]),
            Message::channel(1, Priority::Normal, vec![3u8]),
            Message::channel(1, Priority::Admin, vec![4u8]),
        ]);
        assert!(sender.flush(Duration::from_secs(5)).await);

        let mut seen = Vec::new();
        for _ in 0..4 {
            let m = codec::read_message(&theirs).await.unwrap();
            seen.push(m.payload[0]);
        }
        assert_eq!(seen, vec![2, 4, 3, 1]);
        sender.deactivate(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn oversized_payload_is_chunked() {
        let (ours, theirs) = Connection::pipe(id("a"), id("b"), 64 * 1024);
        let config = LinkConfig::default().max_frame_payload(8);
        let sender = MessageSender::spawn(ours, &config);
        sender
            .send(Message::channel(5, Priority::Normal, vec![7u8; 20]))
            .unwrap();

        let mut numbers = Vec::new();
        for _ in 0..3 {
            let m = codec::read_message(&theirs).await.unwrap();
            let h = m.chunk.expect("chunk header");
            numbers.push((h.chunk_no, m.payload.len()));
        }
        assert_eq!(numbers, vec![(1, 8), (2, 8), (3, 4)]);
    }

    #[tokio::test]
    async fn flush_right_after_send_covers_the_write() {
        for _ in 0..50 {
            let (ours, theirs) = Connection::pipe(id("a"), id("b"), 64 * 1024);
            let sender = MessageSender::spawn(ours.clone(), &LinkConfig::default());
            sender.send(Message::admin(&b"bow down"[..])).unwrap();
            assert!(sender.flush(Duration::from_secs(5)).await);
            ours.disconnect();

            let m = codec::read_message(&theirs).await.unwrap();
            assert_eq!(&m.payload[..], b"bow down");
        }
    }

    #[tokio::test]
    async fn torn_write_is_not_resent() {
        let (ours, theirs) = Connection::pipe(id("a"), id("b"), 16);
        let ours = ours.with_io_timeout(Some(Duration::from_millis(30)));
        let config = LinkConfig {
            write_backoff: Duration::from_millis(10),
            ..LinkConfig::default()
        };
        let sender = MessageSender::spawn(ours.clone(), &config);
        sender
            .send(Message::channel(1, Priority::Normal, vec![7u8; 200]))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(ours.is_closed());
        // Whatever was torn off is followed by end-of-stream, not by a
        // spliced retry that would decode as a frame.
        assert!(codec::read_message(&theirs).await.is_err());
        sender.deactivate(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn deactivate_is_idempotent() {
        let (ours, _theirs) = Connection::pipe(id("a"), id("b"), 1024);
        let sender = MessageSender::spawn(ours, &LinkConfig::default());
        sender.deactivate(Duration::from_secs(1)).await.unwrap();
        sender.deactivate(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn worker_exits_when_connection_closes() {
        let (ours, theirs) = Connection::pipe(id("a"), id("b"), 1024);
        let sender = MessageSender::spawn(ours.clone(), &LinkConfig::default());
        theirs.disconnect();
        ours.disconnect();
        sender.send(Message::keep_alive()).unwrap();
        sender.deactivate(Duration::from_secs(1)).await.unwrap();
    }
}
