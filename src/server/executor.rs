//! Executors: the scheduling models driving [`Client::step`].
//!
//! Every model speaks the same contract: a client is touched by exactly
//! one executor at a time, `step` runs to completion between suspension
//! points, and the only waits happen in the transport adapter (threaded
//! models) or the shared poll (cooperative model).

use crate::{
    errors::Outcome,
    server::{
        client::{Client, StepOutcome},
        server_impl::ServerShared,
    },
    transport::{
        adapter::{Interest, Transport, TransportLayer},
        tcp::TcpTransport,
    },
};
use crossbeam::queue::SegQueue;
use mio::{unix::SourceFd, Events, Poll, Token};
use slab::Slab;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

const ACCEPT_TICK: Duration = Duration::from_millis(200);
const SEND_WAIT: Duration = Duration::from_secs(6);

const OVERLOAD_503: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\n\
Content-Type: text/plain\r\n\
Content-Length: 25\r\n\
Connection: Close\r\n\r\n\
503 Service Unavailable\r\n";

/// Runs one client to DEAD, parking in the adapter between ticks.
pub(crate) fn drive(mut client: Client) {
    loop {
        match client.step() {
            StepOutcome::Yield => {}
            StepOutcome::NeedReadable => match client.wait_io(Interest::Recv) {
                Outcome::Timeout => client.expire(),
                Outcome::Reject => client.fail(),
                _ => {}
            },
            StepOutcome::NeedWritable => match client.wait_io(Interest::Send) {
                Outcome::Timeout | Outcome::Reject => client.fail(),
                _ => {}
            },
            StepOutcome::Dead => return,
        }
    }
}

fn build_transport(
    stream: std::net::TcpStream,
    layers: &[Box<TransportLayer>],
) -> Result<Box<dyn Transport>, crate::errors::ServerError> {
    let mut transport: Box<dyn Transport> = Box::new(TcpTransport::new(stream)?);
    for layer in layers {
        transport = layer(transport)?;
    }
    Ok(transport)
}

fn refuse_overloaded(mut stream: std::net::TcpStream) {
    tracing::warn!("accept: too many clients, refusing");
    let _ = stream.set_nonblocking(false);
    let _ = stream.write_all(OVERLOAD_503);
}

/// Accept loop for the thread-per-client and thread-pool models.
///
/// The listener sits in a small poll so the loop can watch the run flag
/// while blocked; accepted sockets become clients dispatched to their
/// executor.
pub(crate) fn run_threaded(
    listener: std::net::TcpListener,
    shared: Arc<ServerShared>,
    layers: &[Box<TransportLayer>],
    pool_size: Option<usize>,
) -> std::io::Result<()> {
    const LISTENER: Token = Token(0);
    listener.set_nonblocking(true)?;
    let mut poll = Poll::new()?;
    poll.registry().register(
        &mut SourceFd(&listener.as_raw_fd()),
        LISTENER,
        mio::Interest::READABLE,
    )?;
    let mut events = Events::with_capacity(8);

    let live = Arc::new(AtomicUsize::new(0));
    let queue: Arc<SegQueue<Client>> = Arc::new(SegQueue::new());
    let mut workers = Vec::new();

    if let Some(size) = pool_size {
        for _ in 0..size.max(1) {
            let queue = queue.clone();
            let live = live.clone();
            let shared = shared.clone();
            workers.push(std::thread::spawn(move || loop {
                match queue.pop() {
                    Some(client) => {
                        drive(client);
                        live.fetch_sub(1, Ordering::SeqCst);
                    }
                    None => {
                        if !shared.running() {
                            return;
                        }
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
            }));
        }
    }

    while shared.running() {
        let _ = poll.poll(&mut events, Some(ACCEPT_TICK));
        workers.retain(|w| !w.is_finished());
        loop {
            let (stream, peer) = match listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!("accept failed: {e}");
                    break;
                }
            };
            if live.load(Ordering::SeqCst) >= shared.config.max_clients {
                refuse_overloaded(stream);
                continue;
            }
            let transport = match build_transport(stream, layers) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!("transport setup failed: {e}");
                    continue;
                }
            };
            tracing::debug!(%peer, "client accepted");
            let client = Client::new(transport, Some(peer), shared.clone());
            live.fetch_add(1, Ordering::SeqCst);
            match pool_size {
                Some(_) => queue.push(client),
                None => {
                    let live = live.clone();
                    workers.push(std::thread::spawn(move || {
                        drive(client);
                        live.fetch_sub(1, Ordering::SeqCst);
                    }));
                }
            }
        }
    }

    for worker in workers {
        let _ = worker.join();
    }
    Ok(())
}

struct Slot {
    client: Client,
    deadline: Instant,
}

/// Single-threaded cooperative model: one poll multiplexes the listener
/// and every client; each ready client advances `step` once then yields.
pub(crate) fn run_cooperative(
    listener: std::net::TcpListener,
    shared: Arc<ServerShared>,
    layers: &[Box<TransportLayer>],
) -> std::io::Result<()> {
    const LISTENER: Token = Token(usize::MAX);
    listener.set_nonblocking(true)?;
    let mut poll = Poll::new()?;
    poll.registry().register(
        &mut SourceFd(&listener.as_raw_fd()),
        LISTENER,
        mio::Interest::READABLE,
    )?;
    let mut events = Events::with_capacity(64);
    let mut slots: Slab<Slot> = Slab::new();
    let keepalive = shared.config.keepalive.unwrap_or(SEND_WAIT);

    while shared.running() {
        let timeout = slots
            .iter()
            .map(|(_, s)| s.deadline.saturating_duration_since(Instant::now()))
            .min()
            .unwrap_or(ACCEPT_TICK)
            .min(ACCEPT_TICK);
        let _ = poll.poll(&mut events, Some(timeout));

        let mut ready = Vec::new();
        let mut accepted = false;
        for event in events.iter() {
            if event.token() == LISTENER {
                accepted = true;
            } else {
                ready.push(event.token().0);
            }
        }

        if accepted {
            loop {
                let (stream, peer) = match listener.accept() {
                    Ok(pair) => pair,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(_) => break,
                };
                if slots.len() >= shared.config.max_clients {
                    refuse_overloaded(stream);
                    continue;
                }
                let transport = match build_transport(stream, layers) {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::warn!("transport setup failed: {e}");
                        continue;
                    }
                };
                let client = Client::new(transport, Some(peer), shared.clone());
                let key = slots.insert(Slot {
                    client,
                    deadline: Instant::now() + keepalive,
                });
                ready.push(key);
            }
        }

        for key in ready {
            if slots.contains(key) {
                advance(&mut slots, key, &poll, keepalive);
            }
        }

        // keep-alive expiry sweep
        let now = Instant::now();
        let expired: Vec<usize> = slots
            .iter()
            .filter(|(_, s)| s.deadline <= now)
            .map(|(k, _)| k)
            .collect();
        for key in expired {
            slots[key].client.expire();
            advance(&mut slots, key, &poll, keepalive);
        }
    }
    Ok(())
}

/// Steps one cooperative client until it parks, re-registering its poll
/// interest to match what it asked for.
fn advance(slots: &mut Slab<Slot>, key: usize, poll: &Poll, keepalive: Duration) {
    let interest = loop {
        let slot = &mut slots[key];
        match slot.client.step() {
            StepOutcome::Yield => continue,
            StepOutcome::NeedReadable => {
                slot.deadline = Instant::now() + keepalive;
                break Some(mio::Interest::READABLE);
            }
            StepOutcome::NeedWritable => {
                slot.deadline = Instant::now() + SEND_WAIT;
                break Some(mio::Interest::WRITABLE);
            }
            StepOutcome::Dead => break None,
        }
    };

    match interest {
        Some(interest) => {
            let slot = &slots[key];
            if let Some(fd) = slot.client.raw_fd() {
                let registry = poll.registry();
                if registry
                    .reregister(&mut SourceFd(&fd), Token(key), interest)
                    .is_err()
                {
                    let _ = registry.register(&mut SourceFd(&fd), Token(key), interest);
                }
            }
        }
        None => {
            if let Some(fd) = slots[key].client.raw_fd() {
                let _ = poll.registry().deregister(&mut SourceFd(&fd));
            }
            slots.remove(key);
        }
    }
}
