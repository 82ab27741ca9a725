//! Server configuration and buffer budgets.
//!
//! # Security-First Defaults
//!
//! The chunk budgets bound every per-client allocation: a request URI may
//! occupy at most `MAX_CHUNKS_URI` chunks, the header block at most
//! `MAX_CHUNKS_HEADER`, and so on. Exceeding a budget never truncates
//! silently; the parser answers `414` or `400` and closes the connection.
//!
//! # Memory Consumption
//!
//! Each active connection owns its receive buffer plus the buffers of the
//! request/response pair in flight; all of them grow in `chunk_size` steps
//! up to their budget, so worst-case memory per client is
//! `chunk_size * (MAX_CHUNKS_URI * 2 + MAX_CHUNKS_HEADER * 2 +
//! MAX_CHUNKS_CONTENT + MAX_CHUNKS_SESSION)` plus the socket.

use crate::http::types::Version;
use std::time::Duration;

/// Granularity of every buffer growth step, in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 64;

/// Chunk budget of the URI buffer (default URI cap: 128 bytes).
pub const MAX_CHUNKS_URI: usize = 2;
/// Chunk budget of a header block (default cap: 768 bytes).
pub const MAX_CHUNKS_HEADER: usize = 12;
/// Chunk budget of a response content packet.
pub const MAX_CHUNKS_CONTENT: usize = 3;
/// Chunk budget of the per-client session dictionary.
pub const MAX_CHUNKS_SESSION: usize = 2;

/// How accepted clients are scheduled.
///
/// Whatever the model, each client's data is touched by exactly one
/// executor at a time and ordering inside a client stays FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduling {
    /// One OS thread per accepted client (default).
    ThreadPerClient,
    /// A fixed pool of workers; each drives one client to completion,
    /// then takes the next from the queue.
    ThreadPool(usize),
    /// A single thread multiplexing every client with one readiness poll.
    Cooperative,
}

/// Server configuration.
///
/// All fields are optional through [`Default`]:
///
/// ```
/// use ember_web::limits::ServerConfig;
///
/// let config = ServerConfig {
///     port: 8080,
///     max_clients: 32,
///     ..ServerConfig::default()
/// };
/// assert_eq!(config.chunk_size, 64);
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Value of the `Host` the server answers for; informational.
    pub hostname: String,

    /// Address to bind (default: `0.0.0.0`).
    pub addr: String,

    /// TCP port (default: `80`).
    pub port: u16,

    /// Service label used in request logging (default: `"http"`).
    pub service: String,

    /// Maximum number of concurrently served clients (default: `10`).
    ///
    /// Beyond this, accepted sockets receive a canned `503` and are
    /// closed immediately.
    pub max_clients: usize,

    /// Buffer growth granularity in bytes (default: [`DEFAULT_CHUNK_SIZE`]).
    pub chunk_size: usize,

    /// Highest HTTP version advertised in responses (default: HTTP/1.1).
    ///
    /// A response never claims a higher version than its request.
    pub max_version: Version,

    /// Keep-alive idle window between requests (default: 6 seconds).
    ///
    /// `None` disables keep-alive entirely.
    pub keepalive: Option<Duration>,

    /// Scheduling model (default: [`Scheduling::ThreadPerClient`]).
    pub scheduling: Scheduling,

    /// Value of the `Server:` response header; `None` omits the header.
    pub server_header: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            addr: "0.0.0.0".into(),
            port: 80,
            service: "http".into(),
            max_clients: 10,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_version: Version::Http11,
            keepalive: Some(Duration::from_secs(6)),
            scheduling: Scheduling::ThreadPerClient,
            server_header: None,
        }
    }
}

/// TLS material for the [`TlsTransport`](crate::transport::tls::TlsTransport)
/// layer: PEM-encoded certificate chain and private key paths.
#[cfg(feature = "tls")]
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: std::path::PathBuf,
    pub key_path: std::path::PathBuf,
}
