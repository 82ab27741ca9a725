//! Flow-control result codes and the crate error type.

use std::io;
use thiserror::Error;

/// Result code shared by the parser, the transport adapters, the connector
/// dispatch and the client state machine.
///
/// Handlers return it from their connector function:
/// - [`Success`](Outcome::Success): the response is complete.
/// - [`Continue`](Outcome::Continue): the response progressed, call the
///   handler again to stream more content.
/// - [`Incomplete`](Outcome::Incomplete): not ready yet, poll again later.
/// - [`Reject`](Outcome::Reject): this request is not mine, try the next
///   connector.
/// - [`Space`](Outcome::Space): a buffer chunk budget was exhausted.
/// - [`Timeout`](Outcome::Timeout): a wait expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Incomplete,
    Continue,
    Space,
    Reject,
    Timeout,
}

impl Outcome {
    #[inline(always)]
    pub const fn is_success(self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// Result of one byte-moving transport operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    /// Bytes moved. `Bytes(0)` means the peer closed the connection.
    Bytes(usize),
    /// The operation would block; wait for readiness and retry.
    Incomplete,
    /// The connection is broken and must be torn down.
    Reject,
}

impl IoOutcome {
    #[inline]
    pub(crate) fn from_io(res: io::Result<usize>) -> Self {
        match res {
            Ok(n) => IoOutcome::Bytes(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => IoOutcome::Incomplete,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => IoOutcome::Incomplete,
            Err(_) => IoOutcome::Reject,
        }
    }
}

/// Errors surfaced to the embedding application.
///
/// Protocol-level failures never show up here: malformed requests are
/// answered on the wire with a 4xx result and the connection state machine
/// moves on. This type covers the setup and client-mode paths only.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("bind {addr} failed")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("connection to {0} failed")]
    Connect(String),

    #[error("i/o error")]
    Io(#[from] io::Error),

    #[cfg(feature = "tls")]
    #[error("tls setup failed: {0}")]
    Tls(String),

    #[error("peer closed before the response was complete")]
    PeerClosed,

    #[error("response exceeded a buffer budget")]
    Space,
}
