//! In-process transport that scripts received byte chunks and captures
//! sent bytes. Drives the client state machine in tests without sockets.

#![cfg(test)]

use crate::{
    errors::{IoOutcome, Outcome},
    transport::adapter::{Interest, Readiness, Transport},
};
use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
pub(crate) struct MemState {
    pub output: Vec<u8>,
    pub disconnected: bool,
    pub flushed: usize,
}

pub(crate) struct MemTransport {
    input: VecDeque<Vec<u8>>,
    /// Bytes handed out per recv call; 0 means "whole chunk".
    pub trickle: usize,
    /// Cap on bytes accepted per send call; 0 means unlimited.
    pub send_cap: usize,
    /// Report end-of-stream once the script runs dry.
    pub eof: bool,
    state: Arc<Mutex<MemState>>,
}

impl MemTransport {
    pub(crate) fn new(chunks: &[&[u8]]) -> (Self, Arc<Mutex<MemState>>) {
        let state = Arc::new(Mutex::new(MemState::default()));
        (
            Self {
                input: chunks.iter().map(|c| c.to_vec()).collect(),
                trickle: 0,
                send_cap: 0,
                eof: true,
                state: state.clone(),
            },
            state,
        )
    }
}

impl Transport for MemTransport {
    fn recv(&mut self, buf: &mut [u8]) -> IoOutcome {
        let Some(mut chunk) = self.input.pop_front() else {
            return if self.eof {
                // script exhausted: the peer closed
                IoOutcome::Bytes(0)
            } else {
                IoOutcome::Incomplete
            };
        };
        let mut take = chunk.len().min(buf.len());
        if self.trickle > 0 {
            take = take.min(self.trickle);
        }
        buf[..take].copy_from_slice(&chunk[..take]);
        if take < chunk.len() {
            chunk.drain(..take);
            self.input.push_front(chunk);
        }
        IoOutcome::Bytes(take)
    }

    fn send(&mut self, buf: &[u8]) -> IoOutcome {
        let mut take = buf.len();
        if self.send_cap > 0 {
            take = take.min(self.send_cap);
        }
        self.state.lock().unwrap().output.extend_from_slice(&buf[..take]);
        IoOutcome::Bytes(take)
    }

    fn wait(&mut self, interest: Interest, _timeout: Option<Duration>) -> Outcome {
        match interest {
            Interest::Recv if self.input.is_empty() => Outcome::Timeout,
            _ => Outcome::Success,
        }
    }

    fn status(&mut self) -> Readiness {
        Readiness {
            recv: true,
            send: true,
            hangup: false,
        }
    }

    fn flush(&mut self) {
        self.state.lock().unwrap().flushed += 1;
    }

    fn disconnect(&mut self) {
        self.state.lock().unwrap().disconnected = true;
    }

    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}
