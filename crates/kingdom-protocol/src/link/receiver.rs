use std::sync::{Arc, Mutex};
use std::time::Duration;

use kingdom_transport::{Connection, ConnectionId, DeviceId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::LinkConfig;
use crate::error::KingdomError;
use crate::message::chunk::Reassembler;
use crate::message::{codec, Message};

/// What a receiver hands to its owner.
#[derive(Debug)]
pub enum Inbound {
    Message {
        connection: ConnectionId,
        remote: DeviceId,
        message: Message,
    },
    /// The stream ended or was closed. Sent at most once per receiver.
    Closed {
        connection: ConnectionId,
        remote: DeviceId,
    },
}

/// Instant the last frame arrived on a connection.
#[derive(Debug, Clone)]
pub struct LastSeen(Arc<Mutex<Instant>>);

impl LastSeen {
    pub fn now() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    pub fn touch(&self) {
        *self.0.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).elapsed()
    }
}

/// Inbound framer for one connection.
///
/// Reads frames until the connection closes or [`deactivate`] is called.
/// Stopping only interrupts the wait for the next frame; a frame whose
/// first byte has arrived is always read to the end. Read errors between
/// frames are retried; a read error inside a frame closes the connection.
///
/// [`deactivate`]: MessageReceiver::deactivate
pub struct MessageReceiver {
    remote: DeviceId,
    last_seen: LastSeen,
    stop: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MessageReceiver {
    pub fn spawn(connection: Connection, config: &LinkConfig, sink: mpsc::Sender<Inbound>) -> Self {
        let last_seen = LastSeen::now();
        let stop = CancellationToken::new();
        let worker = tokio::spawn(run(
            connection.clone(),
            Reader {
                reassembler: (!config.forward_chunks)
                    .then(|| Reassembler::new(config.frame_payload())),
                read_retry: config.read_retry,
            },
            last_seen.clone(),
            stop.clone(),
            sink,
        ));
        Self {
            remote: connection.remote().clone(),
            last_seen,
            stop,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn last_seen(&self) -> LastSeen {
        self.last_seen.clone()
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
        match tokio::time::timeout(timeout, worker).await {
            Ok(_) => Ok(()),
            Err(_) => Err(KingdomError::ShutdownTimeout {
                what: format!("receiver from {}", self.remote),
                timeout,
            }),
        }
    }
}

impl Drop for MessageReceiver {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

struct Reader {
    reassembler: Option<Reassembler>,
    read_retry: Duration,
}

enum Step {
    Deliver(Message),
    Nothing,
    Closed,
    Stop,
}

async fn run(
    connection: Connection,
    mut reader: Reader,
    last_seen: LastSeen,
    stop: CancellationToken,
    sink: mpsc::Sender<Inbound>,
) {
    let id = connection.id();
    let remote = connection.remote().clone();

    loop {
        let step = read_step(&connection, &mut reader, &last_seen, &stop).await;
        match step {
            Step::Deliver(message) => {
                let inbound = Inbound::Message {
                    connection: id,
                    remote: remote.clone(),
                    message,
                };
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    sent = sink.send(inbound) => if sent.is_err() { break },
                }
            }
            Step::Nothing => {}
            Step::Stop => break,
            Step::Closed => {
                connection.disconnect();
                if !stop.is_cancelled() {
                    let _ = sink
                        .send(Inbound::Closed {
                            connection: id,
                            remote: remote.clone(),
                        })
                        .await;
                }
                break;
            }
        }
    }

    if let Some(r) = reader.reassembler.as_mut() {
        r.clear();
    }
    tracing::trace!(connection = %id, remote = %remote, "receiver stopped");
}

async fn read_step(
    connection: &Connection,
    reader: &mut Reader,
    last_seen: &LastSeen,
    stop: &CancellationToken,
) -> Step {
    let mut version = [0u8; 1];
    let first = tokio::select! {
        biased;
        _ = stop.cancelled() => return Step::Stop,
        r = connection.read_exact(&mut version) => r,
    };
    let result = match first {
        Ok(()) => match codec::read_after_version(connection, version[0]).await {
            // Part of the frame is consumed; the stream cannot be resynchronised.
            Err(KingdomError::Transport(e)) if !e.is_disconnect() => {
                tracing::warn!(remote = %connection.remote(), "read failed mid-frame, closing: {e}");
                return Step::Closed;
            }
            other => other,
        },
        Err(e) => Err(e.into()),
    };

    match result {
        Ok(message) => {
            last_seen.touch();
            let Some(reassembler) = reader.reassembler.as_mut() else {
                return Step::Deliver(message);
            };
            match reassembler.push(message) {
                Ok(Some(whole)) => Step::Deliver(whole),
                Ok(None) => Step::Nothing,
                Err(e) => {
                    tracing::warn!(remote = %connection.remote(), "protocol violation, closing: {e}");
                    Step::Closed
                }
            }
        }
        Err(KingdomError::Transport(e)) if e.is_disconnect() => Step::Closed,
        Err(e) if e.is_protocol_violation() => {
            tracing::warn!(remote = %connection.remote(), "protocol violation, closing: {e}");
            Step::Closed
        }
        Err(e) => {
            tracing::debug!(remote = %connection.remote(), "read failed, retrying: {e}");
            tokio::select! {
                biased;
                _ = stop.cancelled() => Step::Stop,
                _ = tokio::time::sleep(reader.read_retry) => Step::Nothing,
            }
        }
    }
}
