//! The transport adapter capability set.
//!
//! An adapter provides byte-level I/O to the client state machine without
//! the parser knowing what sits underneath: plain TCP, TLS over TCP, or a
//! scripted in-memory stream in tests. Adapters may stack; a wrapping
//! adapter holds its inner adapter by value and delegates readiness.

use crate::errors::{IoOutcome, Outcome};
use std::os::fd::RawFd;
use std::time::Duration;

/// What a [`Transport::wait`] call should wake up for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Recv,
    Send,
}

/// Non-blocking readiness probe result.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub recv: bool,
    pub send: bool,
    pub hangup: bool,
}

/// Byte-level I/O capability set of one client connection.
///
/// `recv` and `send` never block. `wait` is the single place the calling
/// executor may suspend; it must only be called after an operation
/// reported [`IoOutcome::Incomplete`], so edge-triggered pollers see the
/// readiness change.
pub trait Transport: Send {
    /// Fills `buf` with received bytes.
    fn recv(&mut self, buf: &mut [u8]) -> IoOutcome;

    /// Drains bytes from `buf` to the wire.
    fn send(&mut self, buf: &[u8]) -> IoOutcome;

    /// Blocks until the interest is ready, the timeout expires
    /// ([`Outcome::Timeout`]) or the connection dies ([`Outcome::Reject`]).
    fn wait(&mut self, interest: Interest, timeout: Option<Duration>) -> Outcome;

    /// Non-blocking probe. Implementations may be optimistic; the
    /// subsequent `recv`/`send` tells the truth.
    fn status(&mut self) -> Readiness;

    /// Pushes any internal buffering to the wire.
    fn flush(&mut self);

    /// Initiates an orderly close.
    fn disconnect(&mut self);

    /// URL scheme spoken over this adapter (`http`, `https`).
    fn scheme(&self) -> &'static str {
        "http"
    }

    /// Default port of the scheme, used by the client-mode dial path.
    fn default_port(&self) -> u16 {
        80
    }

    /// Underlying socket descriptor, for LOCKED handoff and poll
    /// registration. `None` for transports with no OS socket.
    fn raw_fd(&self) -> Option<RawFd>;
}

/// Builds one transport layer on top of an inner adapter; the server
/// keeps an ordered stack of these (`change_protocol`).
pub type TransportLayer =
    dyn Fn(Box<dyn Transport>) -> Result<Box<dyn Transport>, crate::errors::ServerError>
        + Send
        + Sync;
