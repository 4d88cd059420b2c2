use std::sync::Mutex;
use std::time::Duration;

use kingdom_transport::Connection;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{LastSeen, LinkConfig, SenderHandle};
use crate::error::KingdomError;
use crate::message::Message;

/// Periodic liveness probe for one connection.
///
/// Sends a keep-alive every interval and closes the connection once
/// nothing has been read from it for the liveness timeout. The close then
/// travels the usual connection-closed path.
pub struct KeepAlive {
    stop: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl KeepAlive {
    pub fn spawn(
        connection: Connection,
        sender: SenderHandle,
        last_seen: LastSeen,
        config: &LinkConfig,
    ) -> Self {
        let stop = CancellationToken::new();
        let worker = tokio::spawn(run(
            connection,
            sender,
            last_seen,
            config.keepalive_interval,
            config.liveness_timeout,
            stop.clone(),
        ));
        Self {
            stop,
            worker: Mutex::new(Some(worker)),
        }
    }

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
        tokio::time::timeout(timeout, worker)
            .await
            .map(|_| ())
            .map_err(|_| KingdomError::ShutdownTimeout {
                what: "keep-alive".into(),
                timeout,
            })
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn run(
    connection: Connection,
    sender: SenderHandle,
    last_seen: LastSeen,
    interval: Duration,
    liveness: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Skip the immediate first tick
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = connection.closed() => break,
            _ = ticker.tick() => {}
        }

        let silent = last_seen.elapsed();
        if silent > liveness {
            tracing::info!(
                remote = %connection.remote(),
                silent_ms = silent.as_millis() as u64,
                "peer went silent, closing connection"
            );
            connection.disconnect();
            break;
        }
        if let Err(e) = sender.send(Message::keep_alive()) {
            tracing::debug!(remote = %connection.remote(), "keep-alive not queued: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{Inbound, MessageReceiver, MessageSender};
    use kingdom_transport::DeviceId;
    use tokio::sync::mpsc;

    fn id(s: &str) -> DeviceId {
        s.parse().unwrap()
    }

    fn fast() -> LinkConfig {
        LinkConfig::default()
            .keepalive_interval(Duration::from_millis(50))
            .liveness_timeout(Duration::from_millis(200))
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_disconnected() {
        let (ours, _theirs) = Connection::pipe(id("a"), id("b"), 4096);
        let config = fast();
        let sender = MessageSender::spawn(ours.clone(), &config);
        let (tx, mut rx) = mpsc::channel(16);
        let receiver = MessageReceiver::spawn(ours.clone(), &config, tx);
        let _ka = KeepAlive::spawn(ours.clone(), sender.handle(), receiver.last_seen(), &config);

        // `_theirs` never writes anything back.
        tokio::time::timeout(Duration::from_secs(5), ours.closed())
            .await
            .expect("liveness timeout should close the link");
        assert!(matches!(rx.recv().await.unwrap(), Inbound::Closed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn two_probing_ends_stay_up() {
        let (ours, theirs) = Connection::pipe(id("a"), id("b"), 4096);
        let config = fast();

        let mut parts = Vec::new();
        for conn in [ours.clone(), theirs.clone()] {
            let sender = MessageSender::spawn(conn.clone(), &config);
            let (tx, rx) = mpsc::channel(64);
            let receiver = MessageReceiver::spawn(conn.clone(), &config, tx);
            let ka = KeepAlive::spawn(conn, sender.handle(), receiver.last_seen(), &config);
            parts.push((sender, receiver, ka, rx));
        }
        // Drain inbound keep-alives so receivers never block.
        for (_, _, _, rx) in parts.iter_mut() {
            let mut rx = std::mem::replace(rx, mpsc::channel(1).1);
            tokio::spawn(async move { while rx.recv().await.is_some() {} });
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!ours.is_closed());
        assert!(!theirs.is_closed());
    }
}
