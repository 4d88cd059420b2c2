//! TCP adapter.
//!
//! Both sides open with a one-line identity exchange: a length byte
//! followed by the device id. After that the stream belongs to the caller.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{
    Connection, ConnectionMetadata, DeviceId, Dialer, TransportConfig, TransportError,
    TransportKind,
};

const ACCEPT_BACKLOG: usize = 32;

/// A bound TCP listener that yields handshaken [`Connection`]s.
pub struct TcpTransport {
    local_id: DeviceId,
    local_addr: SocketAddr,
    config: TransportConfig,
    accept_task: JoinHandle<()>,
}

impl TcpTransport {
    /// Bind `addr` and start accepting.
    pub async fn bind(
        local_id: DeviceId,
        addr: SocketAddr,
        config: TransportConfig,
    ) -> Result<(Self, mpsc::Receiver<Connection>), TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);

        let accept_task = tokio::spawn(accept_loop(
            listener,
            local_id.clone(),
            config.clone(),
            tx,
        ));
        tracing::info!(device = %local_id, addr = %local_addr, "tcp transport listening");

        Ok((
            Self {
                local_id,
                local_addr,
                config,
                accept_task,
            },
            rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// What peers need to dial us.
    pub fn metadata(&self) -> ConnectionMetadata {
        ConnectionMetadata::tcp(self.local_addr)
    }

    pub fn dialer(&self) -> TcpDialer {
        TcpDialer::new(self.local_id.clone(), self.config.clone())
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    local_id: DeviceId,
    config: TransportConfig,
    tx: mpsc::Sender<Connection>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("tcp accept failed: {e}");
                continue;
            }
        };
        let local_id = local_id.clone();
        let config = config.clone();
        let conn_tx = tx.clone();
        tokio::spawn(async move {
            let handshake = tokio::time::timeout(
                config.get_connect_timeout(),
                handshake(stream, &local_id),
            )
            .await;
            match handshake {
                Ok(Ok((remote, stream))) => {
                    tracing::debug!(remote = %remote, %peer, "accepted tcp connection");
                    let conn = Connection::from_stream(remote, stream)
                        .with_io_timeout(config.io_timeout);
                    let _ = conn_tx.send(conn).await;
                }
                Ok(Err(e)) => tracing::debug!(%peer, "inbound handshake failed: {e}"),
                Err(_) => tracing::debug!(%peer, "inbound handshake timed out"),
            }
        });
        if tx.is_closed() {
            break;
        }
    }
}

/// Exchange identities. Returns the remote's id.
async fn handshake(
    mut stream: TcpStream,
    local_id: &DeviceId,
) -> Result<(DeviceId, TcpStream), TransportError> {
    stream.set_nodelay(true)?;

    let id_bytes = local_id.as_bytes();
    let mut hello = Vec::with_capacity(1 + id_bytes.len());
    // DeviceId length is capped at 255.
    hello.push(id_bytes.len() as u8);
    hello.extend_from_slice(id_bytes);
    stream.write_all(&hello).await?;

    let len = stream.read_u8().await?;
    let mut remote = vec![0u8; len as usize];
    stream.read_exact(&mut remote).await?;
    let remote = DeviceId::try_from(remote.as_slice())
        .map_err(|e| TransportError::Handshake(e.to_string()))?;
    Ok((remote, stream))
}

/// [`Dialer`] for `TransportKind::Tcp` metadata.
#[derive(Clone)]
pub struct TcpDialer {
    local_id: DeviceId,
    config: TransportConfig,
}

impl TcpDialer {
    pub fn new(local_id: DeviceId, config: TransportConfig) -> Self {
        Self { local_id, config }
    }

    async fn dial_addr(&self, target: &DeviceId, addr: &str) -> Result<Connection, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        let (remote, stream) = handshake(stream, &self.local_id).await?;
        if &remote != target {
            return Err(TransportError::Handshake(format!(
                "expected {target}, reached {remote}"
            )));
        }
        Ok(Connection::from_stream(remote, stream).with_io_timeout(self.config.io_timeout))
    }
}

#[async_trait::async_trait]
impl Dialer for TcpDialer {
    async fn dial(
        &self,
        target: &DeviceId,
        metadata: &[ConnectionMetadata],
    ) -> Result<Connection, TransportError> {
        let timeout = self.config.get_connect_timeout();
        let mut last_error = None;
        for entry in metadata.iter().filter(|m| m.transport == TransportKind::Tcp) {
            match tokio::time::timeout(timeout, self.dial_addr(target, &entry.address)).await {
                Ok(Ok(conn)) => return Ok(conn),
                Ok(Err(e)) => last_error = Some(e),
                Err(_) => last_error = Some(TransportError::Timeout(timeout)),
            }
        }
        match last_error {
            Some(e) => Err(TransportError::Connect {
                device_id: target.clone(),
                source: e.into(),
            }),
            None => Err(TransportError::NoRoute(target.clone())),
        }
    }
}
