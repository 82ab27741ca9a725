//! Per-connection state machine.
//!
//! A [`Client`] owns its transport adapter, its receive buffer and a FIFO
//! of request/response exchanges. [`Client::step`] never blocks; it
//! advances as far as the socket allows and reports what it needs next,
//! so the same machine runs under a thread, a pool worker or a poll loop.

use crate::{
    errors::{IoOutcome, Outcome},
    http::{
        message::{GenerateState, Message, ParseState},
        parser,
        types::{Version, METHOD_HEAD},
    },
    limits::{ServerConfig, MAX_CHUNKS_HEADER, MAX_CHUNKS_SESSION},
    mem::{buffer::ChunkBuffer, fields::FieldMap},
    server::server_impl::ServerShared,
    transport::adapter::{Interest, Transport},
};
use std::any::Any;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Fallback wait window when no keep-alive timeout is configured.
const EXCHANGE_WAIT: Duration = Duration::from_secs(6);

/// Machine state; the low nibble of the C-era state word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClientState {
    New,
    Reading,
    Waiting,
    Sending,
    Exit,
    Dead,
}

/// What the executor should do after a [`Client::step`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Progress was made; call `step` again.
    Yield,
    /// Parked until the transport is readable (or the keep-alive window
    /// expires).
    NeedReadable,
    /// Parked until the transport accepts more bytes.
    NeedWritable,
    /// Resources are released; drop the client.
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Choice {
    Handler(usize),
    BuiltinError,
}

struct Exchange {
    request: Message,
    response: Option<Message>,
    connector: Option<Choice>,
}

impl Exchange {
    fn new(request: Message) -> Self {
        Self {
            request,
            response: None,
            connector: None,
        }
    }
}

enum GenStep {
    /// State advanced; run the next generate state immediately.
    Advance,
    /// Bytes went out but the response is not finished; come back soon.
    Progress,
    /// The transport would block on send.
    Blocked,
    /// Nothing to do until the handler or the parser feeds more.
    Idle,
    /// The response reached END.
    Done,
    /// The connection is broken.
    Broken,
}

enum SendPart {
    Done,
    Blocked,
    Broken,
}

pub struct Client {
    transport: Box<dyn Transport>,
    sockdata: ChunkBuffer,
    queue: VecDeque<Exchange>,
    state: ClientState,
    error: bool,
    locked: bool,
    /// The request side asked for keep-alive (HTTP/1.1 + header).
    keepalive_flag: bool,
    send_blocked: bool,
    peer: Option<SocketAddr>,
    shared: Arc<ServerShared>,
    session_storage: ChunkBuffer,
    session: FieldMap,
    modctx: Vec<(String, Box<dyn Any + Send>)>,
}

impl Client {
    pub(crate) fn new(
        transport: Box<dyn Transport>,
        peer: Option<SocketAddr>,
        shared: Arc<ServerShared>,
    ) -> Self {
        let chunk = shared.config.chunk_size;
        let modctx = shared
            .modules
            .iter()
            .map(|m| (m.name.clone(), (m.getctx)(&ModuleEnv { peer })))
            .collect();
        Self {
            transport,
            sockdata: ChunkBuffer::new("sockdata", MAX_CHUNKS_HEADER, chunk),
            queue: VecDeque::new(),
            state: ClientState::New,
            error: false,
            locked: false,
            keepalive_flag: false,
            send_blocked: false,
            peer,
            shared,
            session_storage: ChunkBuffer::new("session", MAX_CHUNKS_SESSION, chunk),
            session: FieldMap::default(),
            modctx,
        }
    }

    #[inline(always)]
    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.transport.raw_fd()
    }

    /// Suspension point: parks in the adapter until `interest` is ready.
    pub fn wait_io(&mut self, interest: Interest) -> Outcome {
        let timeout = match interest {
            Interest::Recv => self.shared.config.keepalive.unwrap_or(EXCHANGE_WAIT),
            Interest::Send => EXCHANGE_WAIT,
        };
        self.transport.wait(interest, Some(timeout))
    }

    /// Keep-alive window expired: retire without error.
    pub fn expire(&mut self) {
        self.state = ClientState::Exit;
    }

    /// The transport died while parked.
    pub fn fail(&mut self) {
        self.error = true;
        self.state = ClientState::Exit;
    }

    /// One non-blocking tick of the machine: probe, receive, parse,
    /// dispatch, generate, then report what is needed next.
    pub fn step(&mut self) -> StepOutcome {
        match self.state {
            ClientState::Dead => return StepOutcome::Dead,
            ClientState::Exit => {
                self.sink();
                return StepOutcome::Dead;
            }
            _ => {}
        }

        if !self.locked {
            let want_recv = match self.state {
                ClientState::New | ClientState::Waiting => true,
                ClientState::Reading => self.sockdata.accepts(1),
                ClientState::Sending => self.sockdata.is_drained(),
                _ => false,
            };
            if want_recv {
                self.do_recv();
                if self.state == ClientState::Exit {
                    return StepOutcome::Yield;
                }
            }
        }

        if !self.locked && !self.sockdata.is_drained() {
            self.do_parse();
        }

        self.do_respond();

        match self.state {
            ClientState::New | ClientState::Waiting => StepOutcome::NeedReadable,
            ClientState::Reading => StepOutcome::Yield,
            ClientState::Sending => {
                if self.send_blocked {
                    StepOutcome::NeedWritable
                } else {
                    StepOutcome::Yield
                }
            }
            ClientState::Exit => StepOutcome::Yield,
            ClientState::Dead => StepOutcome::Dead,
        }
    }

    fn do_recv(&mut self) {
        self.sockdata.shrink();
        let Some(space) = self.sockdata.recv_space() else {
            // no room: the parser has to make progress first
            return;
        };
        match self.transport.recv(space) {
            IoOutcome::Bytes(0) | IoOutcome::Reject => {
                self.error = true;
                self.state = ClientState::Exit;
            }
            IoOutcome::Incomplete => {
                if self.state != ClientState::Sending {
                    self.state = ClientState::Waiting;
                }
            }
            IoOutcome::Bytes(n) => {
                self.sockdata.commit(n);
                if self.state != ClientState::Sending {
                    self.state = ClientState::Reading;
                }
            }
        }
    }

    fn do_parse(&mut self) {
        // without pipelining the surplus bytes stay buffered until the
        // response in flight completes
        let gate_open = cfg!(feature = "pipeline")
            || self
                .queue
                .iter()
                .all(|ex| ex.request.state.parse != ParseState::End);
        if !gate_open {
            return;
        }

        let chunk = self.shared.config.chunk_size;
        let needs_new = self
            .queue
            .back()
            .map_or(true, |ex| ex.request.state.parse == ParseState::End);
        if needs_new {
            let request = Message::request(self.shared.methods.clone(), chunk);
            self.queue.push_back(Exchange::new(request));
        }

        let ex = self.queue.back_mut().unwrap();
        let outcome = parser::parse(&mut ex.request, &mut self.sockdata);

        if ex.request.keepalive && ex.request.version > Version::Http10 {
            self.keepalive_flag = true;
        }

        match outcome {
            Outcome::Continue => {
                // a content packet is ready; further body bytes may
                // already sit in the buffer and need no socket wait
                if self.sockdata.is_drained() {
                    self.state = ClientState::Waiting;
                } else {
                    self.state = ClientState::Reading;
                }
            }
            Outcome::Incomplete => {
                if self.sockdata.is_drained() {
                    self.state = ClientState::Waiting;
                } else if !self.sockdata.accepts(1) {
                    // a token larger than the whole receive window
                    ex.request.result = 400;
                    ex.request.state.parse = ParseState::End;
                    Self::stage_error(ex, chunk);
                    self.sockdata.reset(0);
                    self.state = ClientState::Reading;
                } else {
                    self.state = ClientState::Reading;
                }
            }
            Outcome::Reject => {
                tracing::warn!(result = ex.request.result, "bad request");
                Self::stage_error(ex, chunk);
                self.sockdata.reset(0);
                self.state = ClientState::Reading;
            }
            Outcome::Success => {
                self.sockdata.shrink();
                self.state = ClientState::Sending;
            }
            _ => {}
        }
    }

    /// Installs the built-in error response on a rejected exchange.
    fn stage_error(ex: &mut Exchange, chunk_size: usize) {
        let mut response = Message::response_to(&ex.request, chunk_size);
        response.state.parse = ParseState::Content;
        response.state.parse_continue = true;
        response.state.generate = GenerateState::Error;
        ex.response = Some(response);
        ex.connector = Some(Choice::BuiltinError);
    }

    fn do_respond(&mut self) {
        let ready = self
            .queue
            .front()
            .is_some_and(|ex| ex.request.state.parse.dispatchable());
        if !ready {
            return;
        }

        match self.drive_handler() {
            Outcome::Reject => {
                // a handler backed out after the result line went out
                self.error = true;
                self.state = ClientState::Exit;
                return;
            }
            Outcome::Success | Outcome::Continue | Outcome::Incomplete => {}
            _ => {}
        }

        let started = self
            .queue
            .front()
            .and_then(|ex| ex.response.as_ref())
            .is_some_and(|r| r.state.generate != GenerateState::None);
        if !started {
            return;
        }

        self.send_blocked = false;
        loop {
            match self.generate_step() {
                GenStep::Advance => continue,
                GenStep::Progress => {
                    self.state = ClientState::Sending;
                    return;
                }
                GenStep::Blocked => {
                    self.state = ClientState::Sending;
                    self.send_blocked = true;
                    return;
                }
                GenStep::Idle => return,
                GenStep::Broken => {
                    self.error = true;
                    self.state = ClientState::Exit;
                    return;
                }
                GenStep::Done => {
                    self.finish_exchange();
                    return;
                }
            }
        }
    }

    /// Selects a connector for the head exchange or re-enters the chosen
    /// one while it streams. Returns [`Outcome::Reject`] only for the
    /// fatal case (handler gave up after generation started).
    fn drive_handler(&mut self) -> Outcome {
        let Client {
            queue,
            transport,
            session_storage,
            session,
            shared,
            modctx,
            peer,
            locked,
            ..
        } = self;
        let ex = queue.front_mut().unwrap();

        if ex
            .response
            .as_ref()
            .is_some_and(|r| r.state.parse >= ParseState::End)
        {
            // the connector already answered; never call it again
            return Outcome::Success;
        }

        let chunk = shared.config.chunk_size;
        if ex.response.is_none() {
            ex.response = Some(Message::response_to(&ex.request, chunk));
        }
        let response = ex.response.as_mut().unwrap();

        let mut ctx = HandlerCtx {
            peer: *peer,
            scheme: transport.scheme(),
            fd: transport.raw_fd(),
            session_storage,
            session,
            config: &shared.config,
            modctx,
        };

        let connectors = &shared.connectors;
        let ret = match ex.connector {
            None => {
                let mut ret = Outcome::Reject;
                for (index, connector) in connectors.iter().enumerate() {
                    let r = (connector.func)(&mut ctx, &mut ex.request, response);
                    if r != Outcome::Reject {
                        tracing::debug!(connector = %connector.name, "request captured");
                        ex.connector = Some(Choice::Handler(index));
                        ret = r;
                        break;
                    }
                }
                ret
            }
            Some(Choice::BuiltinError) => Outcome::Success,
            Some(Choice::Handler(index)) if response.state.parse_continue => {
                let connector = connectors.get(index).unwrap();
                (connector.func)(&mut ctx, &mut ex.request, response)
            }
            Some(Choice::Handler(_)) => Outcome::Continue,
        };

        match ret {
            Outcome::Success => {
                if response.state.parse < ParseState::PostHeader {
                    response.state.parse = ParseState::PostHeader;
                }
                if response.state.generate == GenerateState::None {
                    response.state.generate = GenerateState::Init;
                }
                response.state.parse = ParseState::End;
                response.state.parse_continue = false;
                if ex.request.locked || response.locked {
                    *locked = true;
                }
                Outcome::Success
            }
            Outcome::Continue => {
                if response.state.parse < ParseState::PostHeader {
                    response.state.parse = ParseState::PostHeader;
                }
                if response.state.generate == GenerateState::None {
                    response.state.generate = GenerateState::Init;
                }
                response.state.parse_continue = true;
                if ex.request.locked || response.locked {
                    *locked = true;
                }
                Outcome::Continue
            }
            Outcome::Incomplete => {
                response.state.parse_continue = true;
                Outcome::Incomplete
            }
            Outcome::Reject => {
                if response.state.generate >= GenerateState::Result {
                    tracing::warn!("handler rejected a partially generated response");
                    return Outcome::Reject;
                }
                if response.result == 200 {
                    response.set_result(404);
                }
                for (_, connector) in connectors.error_connectors() {
                    if (connector.func)(&mut ctx, &mut ex.request, response) != Outcome::Reject {
                        break;
                    }
                }
                response.state.parse = ParseState::End;
                response.state.parse_continue = false;
                response.state.generate = GenerateState::Error;
                ex.connector = Some(Choice::BuiltinError);
                Outcome::Success
            }
            other => other,
        }
    }

    /// One transition of the response generator:
    /// `RESULT -> HEADER -> SEPARATOR -> CONTENT -> END`.
    fn generate_step(&mut self) -> GenStep {
        let Client {
            queue,
            transport,
            shared,
            ..
        } = self;
        let ex = queue.front_mut().unwrap();
        let request_head = ex
            .request
            .method_def()
            .is_some_and(|m| m.id == METHOD_HEAD);
        let response = ex.response.as_mut().unwrap();
        let max_version = shared.config.max_version;

        match response.state.generate {
            GenerateState::None | GenerateState::Error => {
                response.state.parse_continue = false;
                if response.version == Version::Http09 {
                    response.state.generate = GenerateState::Content;
                } else {
                    response.build_response_line(max_version);
                }
                GenStep::Advance
            }
            GenerateState::Init => {
                if response.version == Version::Http09 {
                    response.state.generate = GenerateState::Content;
                    return GenStep::Advance;
                }
                if response.state.parse >= ParseState::PostHeader {
                    response.build_response_line(max_version);
                    return GenStep::Advance;
                }
                GenStep::Idle
            }
            GenerateState::Result => {
                match send_part(transport.as_mut(), &mut response.response_line) {
                    SendPart::Done => {}
                    SendPart::Blocked => return GenStep::Blocked,
                    SendPart::Broken => return GenStep::Broken,
                }
                // error results carry the status text when no handler
                // provided a body; staged before the header block so the
                // synthesized Content-Length covers it
                if response.result >= 300 && !response.has_content {
                    let body = error_body(response.result);
                    response.add_content("text/plain", &body);
                }
                response.build_header(shared.config.server_header.as_deref());
                // the separator rides in the drained response-line buffer
                response.response_line.reset(0);
                let _ = response.response_line.append(b"\r\n");
                GenStep::Advance
            }
            GenerateState::Header => {
                match send_part(transport.as_mut(), &mut response.headers_storage) {
                    SendPart::Done => {
                        response.state.generate = GenerateState::Separator;
                        GenStep::Advance
                    }
                    SendPart::Blocked => GenStep::Blocked,
                    SendPart::Broken => GenStep::Broken,
                }
            }
            GenerateState::Separator => {
                match send_part(transport.as_mut(), &mut response.response_line) {
                    SendPart::Done => {}
                    SendPart::Blocked => return GenStep::Blocked,
                    SendPart::Broken => return GenStep::Broken,
                }
                transport.flush();
                if request_head {
                    response.state.generate = GenerateState::End;
                } else {
                    response.state.generate = GenerateState::Content;
                }
                GenStep::Advance
            }
            GenerateState::Content => {
                if !response.content.is_drained() {
                    let sent = send_part(transport.as_mut(), &mut response.content);
                    match sent {
                        SendPart::Done => {
                            if response.state.parse >= ParseState::End {
                                response.state.generate = GenerateState::End;
                                GenStep::Advance
                            } else {
                                GenStep::Progress
                            }
                        }
                        SendPart::Blocked => GenStep::Blocked,
                        SendPart::Broken => GenStep::Broken,
                    }
                } else if response.state.parse >= ParseState::End
                    && !response.state.parse_continue
                {
                    response.state.generate = GenerateState::End;
                    GenStep::Advance
                } else {
                    GenStep::Idle
                }
            }
            GenerateState::End => {
                response.content.shrink();
                GenStep::Done
            }
        }
    }

    /// END bookkeeping: decide between another keep-alive cycle and EXIT.
    fn finish_exchange(&mut self) {
        let ex = self.queue.pop_front().unwrap();
        let response = ex.response.as_ref().unwrap();

        if response.locked {
            self.locked = true;
        }
        if response.content_length.is_none() {
            tracing::warn!("client: disable keep alive (Content-Length is not set)");
            self.keepalive_flag = false;
        }

        let name = match ex.connector {
            Some(Choice::Handler(i)) => self
                .shared
                .connectors
                .get(i)
                .map(|c| c.name.as_str())
                .unwrap_or("server"),
            _ => "server",
        };
        tracing::info!(connector = name, result = response.result, "response complete");

        let alive = keepalive_allowed(
            self.shared.config.keepalive.is_some(),
            self.keepalive_flag,
            response.version,
            response.content_length.is_some(),
            response.result,
            self.locked,
        );
        if ex.request.state.parse < ParseState::End {
            // the request never finished arriving
            self.state = ClientState::Exit;
        } else if self.locked || !alive {
            self.state = ClientState::Exit;
        } else {
            self.state = ClientState::Reading;
        }
    }

    /// Single resource sink: flush, drop module contexts, close unless a
    /// protocol upgrade took the socket over.
    fn sink(&mut self) {
        self.transport.flush();
        self.modctx.clear();
        if !self.locked {
            self.transport.disconnect();
        }
        tracing::debug!(error = self.error, locked = self.locked, "client exit");
        self.state = ClientState::Dead;
    }
}

fn send_part(transport: &mut dyn Transport, buffer: &mut ChunkBuffer) -> SendPart {
    while !buffer.is_drained() {
        match transport.send(buffer.remaining()) {
            IoOutcome::Bytes(0) => return SendPart::Broken,
            IoOutcome::Bytes(n) => buffer.advance(n),
            IoOutcome::Incomplete => return SendPart::Blocked,
            IoOutcome::Reject => return SendPart::Broken,
        }
    }
    SendPart::Done
}

/// The keep-alive decision is a pure function of the server policy, the
/// request's wish and the response's shape.
pub(crate) fn keepalive_allowed(
    server_allows: bool,
    request_asked: bool,
    version: Version,
    length_known: bool,
    result: u16,
    locked: bool,
) -> bool {
    server_allows
        && request_asked
        && version >= Version::Http11
        && length_known
        && result < 400
        && result != 101
        && !locked
}

fn error_body(result: u16) -> Vec<u8> {
    let mut body = Vec::with_capacity(40);
    crate::http::types::write_status(result, &mut body);
    body.remove(0);
    body.extend_from_slice(b"\r\n");
    body
}

/// Environment handed to module context factories at client creation.
pub struct ModuleEnv {
    pub peer: Option<SocketAddr>,
}

/// Connection-scoped view handed to connectors next to the two messages:
/// peer identity, the SERVER dictionary, the session store and the raw
/// socket for protocol upgrades.
pub struct HandlerCtx<'a> {
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) scheme: &'static str,
    pub(crate) fd: Option<RawFd>,
    pub(crate) session_storage: &'a mut ChunkBuffer,
    pub(crate) session: &'a mut FieldMap,
    pub(crate) config: &'a ServerConfig,
    pub(crate) modctx: &'a mut Vec<(String, Box<dyn Any + Send>)>,
}

impl HandlerCtx<'_> {
    /// URL scheme of the transport carrying this connection.
    #[inline(always)]
    pub fn scheme(&self) -> &str {
        self.scheme
    }

    pub fn remote_addr(&self) -> Option<String> {
        self.peer.map(|p| p.ip().to_string())
    }

    /// Peer host name. No resolver is linked in, so this is the numeric
    /// address, which is also what the original falls back to.
    pub fn remote_host(&self) -> Option<String> {
        self.remote_addr()
    }

    pub fn remote_port(&self) -> Option<u16> {
        self.peer.map(|p| p.port())
    }

    /// The SERVER virtual dictionary: `hostname`, `addr`, `port`,
    /// `service`, `scheme`.
    pub fn server_item(&self, key: &str) -> Option<String> {
        match key {
            "hostname" => Some(self.config.hostname.clone()),
            "addr" => Some(self.config.addr.clone()),
            "port" => Some(self.config.port.to_string()),
            "service" => Some(self.config.service.clone()),
            "scheme" => Some(self.scheme.to_string()),
            _ => None,
        }
    }

    /// Raw socket descriptor, for connectors that upgrade the protocol
    /// and take the socket over after [`Message::lock`].
    #[inline(always)]
    pub fn socket(&self) -> Option<RawFd> {
        self.fd
    }

    /// Duplicates the client socket into an owned stream. Protocol
    /// upgraders call this together with [`Message::lock`]; the duplicate
    /// outlives the client, whose own descriptor is left untouched.
    pub fn take_socket(&self) -> Option<std::net::TcpStream> {
        let fd = self.fd?;
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        let owned = borrowed.try_clone_to_owned().ok()?;
        Some(std::net::TcpStream::from(owned))
    }

    /// Last value stored under `key` in the per-client session.
    pub fn session(&self, key: &[u8]) -> Option<&[u8]> {
        self.session
            .iter(self.session_storage)
            .fold(None, |last, (k, v)| {
                if k.eq_ignore_ascii_case(key) {
                    Some(v)
                } else {
                    last
                }
            })
    }

    /// Stores `key = value` in the session; later writes shadow earlier
    /// ones. The session lives as long as the connection.
    pub fn set_session(&mut self, key: &str, value: &str) -> Outcome {
        let record = format!("{key}={value}\n");
        if self.session_storage.append(record.as_bytes()).is_none() {
            return Outcome::Space;
        }
        self.session.fill(self.session_storage, b'=', b'\n');
        Outcome::Success
    }

    /// Context created by the module factory registered under `name`.
    pub fn module_ctx(&mut self, name: &str) -> Option<&mut (dyn Any + Send)> {
        self.modctx
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, ctx)| ctx.as_mut())
    }
}

#[cfg(test)]
mod keepalive_tests {
    use super::*;

    #[test]
    fn predicate_truth_table() {
        // (server, asked, version, length, result, locked) -> allowed
        #[rustfmt::skip]
        let cases = [
            (true,  true,  Version::Http11, true,  200, false, true),
            (true,  true,  Version::Http11, true,  301, false, true),
            (false, true,  Version::Http11, true,  200, false, false),
            (true,  false, Version::Http11, true,  200, false, false),
            (true,  true,  Version::Http10, true,  200, false, false),
            (true,  true,  Version::Http09, true,  200, false, false),
            (true,  true,  Version::Http11, false, 200, false, false),
            (true,  true,  Version::Http11, true,  400, false, false),
            (true,  true,  Version::Http11, true,  500, false, false),
            (true,  true,  Version::Http11, true,  101, false, false),
            (true,  true,  Version::Http11, true,  200, true,  false),
        ];

        for (server, asked, version, length, result, locked, expected) in cases {
            assert_eq!(
                keepalive_allowed(server, asked, version, length, result, locked),
                expected,
                "({server}, {asked}, {version:?}, {length}, {result}, {locked})"
            );
        }
    }
}

#[cfg(test)]
mod client_tests {
    use super::*;
    use crate::server::connector::priority;
    use crate::server::server_impl::test_shared;
    use crate::transport::mem::{MemState, MemTransport};
    use std::sync::Mutex;

    /// Runs the client to death the way the threaded executor does.
    fn drive(client: &mut Client) {
        for _ in 0..10_000 {
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
        panic!("client never reached DEAD");
    }

    fn run(shared: Arc<ServerShared>, chunks: &[&[u8]]) -> (Arc<Mutex<MemState>>, Client) {
        let (transport, state) = MemTransport::new(chunks);
        let mut client = Client::new(Box::new(transport), None, shared);
        drive(&mut client);
        (state, client)
    }

    fn output(state: &Arc<Mutex<MemState>>) -> Vec<u8> {
        state.lock().unwrap().output.clone()
    }

    #[test]
    fn minimal_get() {
        let shared = test_shared(|server| {
            server.add_connector("hello", priority::DOCUMENT, |_, req, resp| {
                if req.request_item("uri") != Some(b"/" as &[u8]) {
                    return Outcome::Reject;
                }
                resp.add_content("text/plain", b"hi");
                Outcome::Success
            });
        });
        let (state, _) = run(shared, &[b"GET / HTTP/1.0\r\nHost: x\r\n\r\n"]);
        assert_eq!(
            String::from_utf8(output(&state)).unwrap(),
            "HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\nConnection: Close\r\n\r\nhi"
        );
        assert!(state.lock().unwrap().disconnected);
    }

    #[test]
    fn keepalive_two_requests_fifo() {
        let shared = test_shared(|server| {
            server.add_connector("echo-uri", priority::DOCUMENT, |_, req, resp| {
                let uri = req.request_item("uri").unwrap().to_vec();
                resp.add_content("text/plain", &uri);
                Outcome::Success
            });
        });
        let (state, _) = run(
            shared,
            &[
                b"GET /one HTTP/1.1\r\nConnection: Keep-Alive\r\n\r\n",
                b"GET /two HTTP/1.1\r\nConnection: Keep-Alive\r\n\r\n",
            ],
        );
        let text = String::from_utf8(output(&state)).unwrap();
        let first = text.find("/one").expect("first body");
        let second = text.find("/two").expect("second body");
        assert!(first < second, "responses out of order: {text}");
        assert_eq!(text.matches("Connection: Keep-Alive").count(), 2);
        assert_eq!(text.matches("Content-Length:").count(), 2);
    }

    #[test]
    fn oversized_uri_closes_with_414() {
        let shared = test_shared(|_| {});
        let mut input = b"GET /".to_vec();
        input.extend_from_slice(&[b'a'; 10_000]);
        input.extend_from_slice(b" HTTP/1.1\r\n\r\n");
        let (state, _) = run(shared, &[&input]);
        let text = String::from_utf8(output(&state)).unwrap();
        assert!(text.starts_with("HTTP/1.1 414 URI Too Long\r\n"), "{text}");
        assert!(text.contains("Connection: Close"));
        assert!(text.ends_with("414 URI Too Long\r\n"));
        assert!(state.lock().unwrap().disconnected);
    }

    #[test]
    fn encoded_traversal_answers_400() {
        let shared = test_shared(|_| {});
        let (state, _) = run(shared, &[b"GET /x/%2e%2e/y HTTP/1.1\r\n\r\n"]);
        let text = String::from_utf8(output(&state)).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{text}");
        assert!(text.contains("Content-Type: text/plain"));
    }

    #[test]
    fn unmatched_request_gets_404() {
        let shared = test_shared(|server| {
            server.add_connector("never", priority::DOCUMENT, |_, _, _| Outcome::Reject);
        });
        let (state, _) = run(shared, &[b"GET /missing HTTP/1.1\r\n\r\n"]);
        let text = String::from_utf8(output(&state)).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"), "{text}");
        assert!(text.ends_with("404 Not Found\r\n"));
    }

    #[test]
    fn urlencoded_form_reaches_parameters() {
        let shared = test_shared(|server| {
            server.add_connector("form", priority::DOCUMENT, |_, req, resp| {
                let a = req.parameter(b"a").unwrap().to_vec();
                let b = req.parameter(b"b").unwrap().to_vec();
                let mut body = a;
                body.push(b',');
                body.extend_from_slice(&b);
                resp.add_content("text/plain", &body);
                Outcome::Success
            });
        });
        let (state, _) = run(
            shared,
            &[b"POST /f HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 7\r\n\r\na=1&b=2"],
        );
        let text = String::from_utf8(output(&state)).unwrap();
        assert!(text.ends_with("\r\n\r\n1,2"), "{text}");
    }

    #[test]
    fn connectors_visit_in_priority_order() {
        let visited = Arc::new(Mutex::new(Vec::new()));
        let log = |name: &'static str, visited: &Arc<Mutex<Vec<&'static str>>>| {
            let visited = visited.clone();
            move |_: &mut HandlerCtx<'_>, _: &mut Message, resp: &mut Message| {
                visited.lock().unwrap().push(name);
                if name == "document" {
                    resp.add_content("text/plain", b"ok");
                    Outcome::Success
                } else {
                    Outcome::Reject
                }
            }
        };
        let shared = test_shared(|server| {
            server.add_connector("document", priority::DOCUMENT, log("document", &visited));
            server.add_connector("filter", priority::FILTER, log("filter", &visited));
            server.add_connector("auth", priority::AUTH, log("auth", &visited));
            // registered last, same priority: must run after "document"
            server.add_connector("late", priority::DOCUMENT, log("late", &visited));
        });
        let (_, _) = run(shared, &[b"GET / HTTP/1.1\r\n\r\n"]);
        assert_eq!(*visited.lock().unwrap(), ["filter", "auth", "document"]);
    }

    #[test]
    fn streaming_handler_appends_content() {
        let shared = test_shared(|server| {
            server.add_connector("stream", priority::DOCUMENT, |_, _, resp| {
                if resp.content_length().is_none() {
                    resp.set_result(200);
                    resp.set_content_length(6);
                    resp.add_content("text/plain", b"one");
                    Outcome::Continue
                } else {
                    resp.append_content(b"two");
                    Outcome::Success
                }
            });
        });
        let (mut transport, state) = MemTransport::new(&[b"GET /s HTTP/1.1\r\n\r\n"]);
        transport.eof = false;
        let mut client = Client::new(Box::new(transport), None, shared);
        drive(&mut client);
        let text = String::from_utf8(output(&state)).unwrap();
        assert!(text.ends_with("\r\n\r\nonetwo"), "{text}");
        assert!(text.contains("Content-Length: 6"));
    }

    #[test]
    fn large_body_drains_without_socket_waits() {
        // several packet-budget rounds worth of body, all buffered at once
        const DECLARED: usize = 600;
        let shared = test_shared(|server| {
            server.add_connector("sink", priority::DOCUMENT, |_, req, resp| {
                let packet = req.content().map_or(0, <[u8]>::len);
                if req.private().is_none() {
                    req.set_private(Box::new(0usize));
                }
                let seen = req
                    .private()
                    .and_then(|p| p.downcast_mut::<usize>())
                    .unwrap();
                *seen += packet;
                if *seen < DECLARED {
                    return Outcome::Incomplete;
                }
                resp.add_content("text/plain", b"done");
                Outcome::Success
            });
        });

        // the long header grows the receive buffer, so the whole body
        // lands in it at once and must drain across several packet rounds
        let mut input = format!(
            "POST /upload HTTP/1.1\r\nX-Filler: {}\r\nContent-Length: {DECLARED}\r\n\r\n",
            "f".repeat(700)
        )
        .into_bytes();
        input.extend_from_slice(&vec![b'x'; DECLARED]);

        // the peer wrote everything in one go and keeps the socket open;
        // a client parking on readability here would only ever time out
        let (mut transport, state) = MemTransport::new(&[&input]);
        transport.eof = false;
        let mut client = Client::new(Box::new(transport), None, shared);
        drive(&mut client);

        let text = String::from_utf8(output(&state)).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
        assert!(text.ends_with("\r\n\r\ndone"), "{text}");
        assert!(!client.error, "request was dropped on a timeout path");
    }

    #[test]
    fn upgrade_locks_the_socket() {
        let shared = test_shared(|server| {
            server.add_connector("ws", priority::DOCUMENT, |_, req, resp| {
                assert!(req.locked, "Connection: Upgrade must lock the request");
                resp.set_result(101);
                resp.set_content_length(0);
                resp.add_header("Upgrade", "websocket");
                resp.lock();
                Outcome::Success
            });
        });
        let (state, client) = run(
            shared,
            &[
                b"GET /chat HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
                // frames the core must never read
                b"\x81\x05hello",
            ],
        );
        let text = String::from_utf8(output(&state)).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{text}");
        // the socket is handed over, not closed
        assert!(!state.lock().unwrap().disconnected);
        assert!(client.locked);
    }

    #[cfg(feature = "ws")]
    #[test]
    fn websocket_handshake_end_to_end() {
        let shared = test_shared(|server| {
            server.add_connector("ws", priority::DOCUMENT, |_, req, resp| {
                let key = match req.request_str("sec-websocket-key") {
                    Some(key) => key.to_string(),
                    None => return Outcome::Reject,
                };
                resp.set_result(101);
                resp.add_header("Upgrade", "websocket");
                resp.add_header("Sec-WebSocket-Accept", &crate::ws::accept_key(&key));
                resp.lock();
                Outcome::Success
            });
        });
        let (state, client) = run(
            shared,
            &[
                b"GET /chat HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
                b"\x81\x05hello",
            ],
        );
        let text = String::from_utf8(output(&state)).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{text}");
        assert!(
            text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"),
            "{text}"
        );
        // the core never touches the socket again
        assert!(!state.lock().unwrap().disconnected);
        assert!(client.locked);
    }

    #[test]
    fn head_response_has_no_body() {
        let shared = test_shared(|server| {
            server.add_connector("doc", priority::DOCUMENT, |_, _, resp| {
                resp.add_content("text/plain", b"never sent");
                Outcome::Success
            });
        });
        let (state, _) = run(shared, &[b"HEAD / HTTP/1.1\r\n\r\n"]);
        let text = String::from_utf8(output(&state)).unwrap();
        assert!(text.contains("Content-Length: 10\r\n"), "{text}");
        assert!(text.ends_with("\r\n\r\n"), "{text}");
    }

    #[test]
    fn partial_sends_resume() {
        let shared = test_shared(|server| {
            server.add_connector("hello", priority::DOCUMENT, |_, _, resp| {
                resp.add_content("text/plain", b"hello world");
                Outcome::Success
            });
        });
        let (mut transport, state) = MemTransport::new(&[b"GET / HTTP/1.0\r\n\r\n"]);
        transport.send_cap = 3;
        let mut client = Client::new(Box::new(transport), None, shared);
        drive(&mut client);
        let text = String::from_utf8(output(&state)).unwrap();
        assert!(text.ends_with("\r\n\r\nhello world"), "{text}");
    }

    #[test]
    fn trickled_bytes_still_parse() {
        let shared = test_shared(|server| {
            server.add_connector("hello", priority::DOCUMENT, |_, _, resp| {
                resp.add_content("text/plain", b"ok");
                Outcome::Success
            });
        });
        let (mut transport, state) = MemTransport::new(&[b"GET /slow HTTP/1.0\r\n\r\n"]);
        transport.trickle = 1;
        let mut client = Client::new(Box::new(transport), None, shared);
        drive(&mut client);
        let text = String::from_utf8(output(&state)).unwrap();
        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"), "{text}");
    }

    #[test]
    fn session_survives_keepalive() {
        let shared = test_shared(|server| {
            server.add_connector("count", priority::DOCUMENT, |ctx, _, resp| {
                let count = ctx
                    .session(b"count")
                    .and_then(|v| std::str::from_utf8(v).ok())
                    .and_then(|v| v.parse::<u32>().ok())
                    .unwrap_or(0)
                    + 1;
                ctx.set_session("count", &count.to_string());
                resp.add_content("text/plain", count.to_string().as_bytes());
                Outcome::Success
            });
        });
        let (state, _) = run(
            shared,
            &[
                b"GET / HTTP/1.1\r\nConnection: Keep-Alive\r\n\r\n",
                b"GET / HTTP/1.1\r\nConnection: Keep-Alive\r\n\r\n",
            ],
        );
        let text = String::from_utf8(output(&state)).unwrap();
        assert!(text.contains("\r\n\r\n1"), "{text}");
        assert!(text.contains("\r\n\r\n2"), "{text}");
    }
}
