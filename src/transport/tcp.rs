//! Plain TCP transport, the leaf of every adapter stack.

use crate::{
    errors::{IoOutcome, Outcome, ServerError},
    transport::adapter::{Interest, Readiness, Transport},
};
use mio::{unix::SourceFd, Events, Poll, Token};
use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

const WAIT: Token = Token(0);

pub struct TcpTransport {
    stream: mio::net::TcpStream,
    /// Lazily created; only threaded executors ever wait here.
    poll: Option<Poll>,
    registered: Option<mio::Interest>,
}

impl TcpTransport {
    pub const DEFAULT_PORT: u16 = 80;

    pub fn new(stream: std::net::TcpStream) -> std::io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream: mio::net::TcpStream::from_std(stream),
            poll: None,
            registered: None,
        })
    }

    /// Client-mode dial.
    pub fn connect(addr: &str, port: u16) -> Result<Self, ServerError> {
        let stream = std::net::TcpStream::connect((addr, port))
            .map_err(|_| ServerError::Connect(format!("{addr}:{port}")))?;
        Ok(Self::new(stream)?)
    }

    fn ensure_registered(&mut self, interest: mio::Interest) -> std::io::Result<&mut Poll> {
        if self.poll.is_none() {
            self.poll = Some(Poll::new()?);
            let poll = self.poll.as_ref().unwrap();
            poll.registry()
                .register(&mut SourceFd(&self.stream.as_raw_fd()), WAIT, interest)?;
            self.registered = Some(interest);
        } else if self.registered != Some(interest) {
            let poll = self.poll.as_ref().unwrap();
            poll.registry()
                .reregister(&mut SourceFd(&self.stream.as_raw_fd()), WAIT, interest)?;
            self.registered = Some(interest);
        }
        Ok(self.poll.as_mut().unwrap())
    }
}

impl Transport for TcpTransport {
    fn recv(&mut self, buf: &mut [u8]) -> IoOutcome {
        IoOutcome::from_io(self.stream.read(buf))
    }

    fn send(&mut self, buf: &[u8]) -> IoOutcome {
        IoOutcome::from_io(self.stream.write(buf))
    }

    fn wait(&mut self, interest: Interest, timeout: Option<Duration>) -> Outcome {
        let interest = match interest {
            Interest::Recv => mio::Interest::READABLE,
            Interest::Send => mio::Interest::WRITABLE,
        };
        let poll = match self.ensure_registered(interest) {
            Ok(poll) => poll,
            Err(_) => return Outcome::Reject,
        };
        let mut events = Events::with_capacity(4);
        match poll.poll(&mut events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Outcome::Incomplete,
            Err(_) => return Outcome::Reject,
        }
        let mut ready = false;
        for event in events.iter() {
            if event.is_read_closed() || event.is_error() {
                // readable EOF still delivers the pending bytes first
                ready = true;
            }
            if event.is_readable() || event.is_writable() {
                ready = true;
            }
        }
        if ready {
            Outcome::Success
        } else {
            Outcome::Timeout
        }
    }

    fn status(&mut self) -> Readiness {
        // optimistic: the non-blocking recv/send report the truth
        Readiness {
            recv: true,
            send: true,
            hangup: false,
        }
    }

    fn flush(&mut self) {
        // force the kernel to push anything coalesced so far
        let _ = self.stream.set_nodelay(true);
    }

    fn disconnect(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn default_port(&self) -> u16 {
        Self::DEFAULT_PORT
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.stream.as_raw_fd())
    }
}
