use std::time::Duration;

use crate::connection::DEFAULT_PIPE_CAPACITY;

/// Configuration shared by the transport adapters.
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use std::time::Duration;
/// use kingdom_transport::TransportConfig;
///
/// let config = TransportConfig::new()
///     .connect_timeout(Duration::from_secs(2))
///     .pipe_capacity(16 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Upper bound on a single dial, handshake included.
    pub(crate) connect_timeout: Duration,
    /// Per-write timeout applied to every connection. `None` blocks indefinitely.
    pub(crate) io_timeout: Option<Duration>,
    /// Buffer size of in-memory pipes.
    pub(crate) pipe_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportConfig {
    /// Create a config with defaults.
    ///
    /// If `KINGDOM_CONNECT_TIMEOUT_MS` is set, it overrides the connect
    /// timeout. This can be overridden again with [`.connect_timeout()`].
    ///
    /// [`.connect_timeout()`]: TransportConfig::connect_timeout
    pub fn new() -> Self {
        let connect_timeout = std::env::var("KINGDOM_CONNECT_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(5));

        Self {
            connect_timeout,
            io_timeout: None,
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
        }
    }

    /// Set the dial + handshake timeout (default: 5 s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Bound every write on connections created with this config.
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = Some(timeout);
        self
    }

    /// Set the in-memory pipe buffer size (default: 64 KiB).
    pub fn pipe_capacity(mut self, bytes: usize) -> Self {
        self.pipe_capacity = bytes.max(1);
        self
    }

    pub fn get_connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn get_pipe_capacity(&self) -> usize {
        self.pipe_capacity
    }
}
