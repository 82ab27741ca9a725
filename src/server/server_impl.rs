//! The server: listener setup, connector/method/module registration,
//! protocol stacking, accept supervision and client-mode connections.

use crate::{
    errors::{IoOutcome, Outcome, ServerError},
    http::{
        message::{Message, ParseState},
        parser,
        types::{default_methods, MethodDef, METHOD_ID_CUSTOM},
    },
    limits::{ServerConfig, Scheduling, MAX_CHUNKS_HEADER},
    mem::buffer::ChunkBuffer,
    server::{
        client::{HandlerCtx, ModuleEnv},
        connector::{ConnectorFn, ConnectorList},
        executor,
    },
    transport::{
        adapter::{Interest, Transport, TransportLayer},
        tcp::TcpTransport,
    },
};
use socket2::{Domain, Protocol, Socket, Type};
use std::any::Any;
use std::net::{IpAddr, SocketAddr};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

/// Context factory of a registered module, run once per accepted client.
pub type ModuleCtxFactory = Arc<dyn Fn(&ModuleEnv) -> Box<dyn Any + Send> + Send + Sync>;

pub(crate) struct ModuleDef {
    pub name: String,
    pub getctx: ModuleCtxFactory,
}

/// Read-only state shared by every client after startup.
pub(crate) struct ServerShared {
    pub config: ServerConfig,
    pub connectors: ConnectorList,
    pub methods: Arc<Vec<MethodDef>>,
    pub modules: Vec<ModuleDef>,
    pub run: Arc<AtomicBool>,
}

impl ServerShared {
    #[inline(always)]
    pub(crate) fn running(&self) -> bool {
        self.run.load(Ordering::SeqCst)
    }
}

/// An embeddable HTTP/1.x server.
///
/// Registration happens before [`run`](Server::run); from then on the
/// connector list, method table and module factories are immutable and
/// shared across clients without locks.
///
/// ```no_run
/// use ember_web::{priority, Outcome, Server, ServerConfig};
///
/// let mut server = Server::new(ServerConfig {
///     port: 8080,
///     ..ServerConfig::default()
/// })
/// .unwrap();
///
/// server.add_connector("hello", priority::DOCUMENT, |_ctx, req, resp| {
///     if req.request_item("uri") != Some(b"/hello" as &[u8]) {
///         return Outcome::Reject;
///     }
///     resp.add_content("text/plain", b"hello\n");
///     Outcome::Success
/// });
///
/// server.run().unwrap();
/// ```
pub struct Server {
    config: ServerConfig,
    connectors: ConnectorList,
    methods: Vec<MethodDef>,
    modules: Vec<ModuleDef>,
    layers: Vec<Box<TransportLayer>>,
    run_flag: Arc<AtomicBool>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        if config.chunk_size == 0 {
            return Err(ServerError::Config("chunk_size must be non-zero".into()));
        }
        if config.max_clients == 0 {
            return Err(ServerError::Config("max_clients must be non-zero".into()));
        }
        Ok(Self {
            config,
            connectors: ConnectorList::default(),
            methods: default_methods(),
            modules: Vec::new(),
            layers: Vec::new(),
            run_flag: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Registers a handler at `priority`; dispatch walks priorities in
    /// ascending order and stops at the first non-Reject return.
    pub fn add_connector(
        &mut self,
        name: &str,
        priority: i32,
        func: impl Fn(&mut HandlerCtx<'_>, &mut Message, &mut Message) -> Outcome
            + Send
            + Sync
            + 'static,
    ) {
        self.connectors
            .add(name, priority, Arc::new(func) as Arc<ConnectorFn>);
    }

    /// Extends the method table; see [`method_props`](crate::method_props)
    /// for the property bits.
    pub fn add_method(&mut self, name: &str, properties: u32) {
        let id = METHOD_ID_CUSTOM + (self.methods.len() as u16);
        self.methods.push(MethodDef {
            name: name.to_ascii_uppercase(),
            id,
            properties,
        });
    }

    /// Registers a per-client module context factory. The context is
    /// created when a client is accepted, reachable from handlers via
    /// [`HandlerCtx::module_ctx`], and dropped in the client sink.
    pub fn add_module(
        &mut self,
        name: &str,
        getctx: impl Fn(&ModuleEnv) -> Box<dyn Any + Send> + Send + Sync + 'static,
    ) {
        self.modules.push(ModuleDef {
            name: name.into(),
            getctx: Arc::new(getctx),
        });
    }

    /// Pushes a transport layer onto the protocol stack; accepted sockets
    /// are wrapped outermost-last.
    pub fn change_protocol(
        &mut self,
        layer: impl Fn(Box<dyn Transport>) -> Result<Box<dyn Transport>, ServerError>
            + Send
            + Sync
            + 'static,
    ) {
        self.layers.push(Box::new(layer));
    }

    /// Convenience for stacking the TLS adapter from PEM material.
    #[cfg(feature = "tls")]
    pub fn change_protocol_tls(
        &mut self,
        tls: &crate::limits::TlsConfig,
    ) -> Result<(), ServerError> {
        let config = tls.load()?;
        self.change_protocol(move |inner| {
            Ok(Box::new(crate::transport::tls::TlsTransport::new(
                inner,
                config.clone(),
            )?))
        });
        Ok(())
    }

    fn shared(&self) -> Arc<ServerShared> {
        Arc::new(ServerShared {
            config: self.config.clone(),
            connectors: self.connectors.clone(),
            methods: Arc::new(self.methods.clone()),
            modules: self
                .modules
                .iter()
                .map(|m| ModuleDef {
                    name: m.name.clone(),
                    getctx: m.getctx.clone(),
                })
                .collect(),
            run: self.run_flag.clone(),
        })
    }

    fn bind(&self) -> Result<std::net::TcpListener, ServerError> {
        let ip: IpAddr = self.config.addr.parse().map_err(|_| {
            ServerError::Config(format!("unparseable address {}", self.config.addr))
        })?;
        let addr = SocketAddr::new(ip, self.config.port);
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let bind_err = |source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        };
        let socket =
            Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;
        socket.set_reuse_address(true).map_err(bind_err)?;
        socket.bind(&addr.into()).map_err(bind_err)?;
        socket.listen(128).map_err(bind_err)?;
        Ok(socket.into())
    }

    /// Binds the listener and serves until [`disconnect`](Self::disconnect)
    /// clears the run flag. Running clients finish their current exchange
    /// before the call returns.
    pub fn run(&mut self) -> Result<(), ServerError> {
        let listener = self.bind()?;
        let shared = self.shared();
        tracing::info!(
            addr = %self.config.addr,
            port = self.config.port,
            service = %self.config.service,
            "listening"
        );
        match self.config.scheduling {
            Scheduling::ThreadPerClient => {
                executor::run_threaded(listener, shared, &self.layers, None)?
            }
            Scheduling::ThreadPool(size) => {
                executor::run_threaded(listener, shared, &self.layers, Some(size))?
            }
            Scheduling::Cooperative => {
                executor::run_cooperative(listener, shared, &self.layers)?
            }
        }
        Ok(())
    }

    /// Stops the accept loop; [`run`](Self::run) returns once clients
    /// drain.
    pub fn disconnect(&self) {
        self.run_flag.store(false, Ordering::SeqCst);
    }

    /// Client mode: dials a remote endpoint over plain TCP and returns a
    /// handle to exchange messages with it. Port `0` selects the scheme
    /// default.
    pub fn connect(&self, addr: &str, port: u16) -> Result<PeerClient, ServerError> {
        let port = if port == 0 {
            TcpTransport::DEFAULT_PORT
        } else {
            port
        };
        Ok(PeerClient {
            transport: Box::new(TcpTransport::connect(addr, port)?),
            methods: Arc::new(self.methods.clone()),
            chunk_size: self.config.chunk_size,
        })
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Outbound connection: serializes request messages and parses the
/// responses with the STATUS branch of the parser.
pub struct PeerClient {
    transport: Box<dyn Transport>,
    methods: Arc<Vec<MethodDef>>,
    chunk_size: usize,
}

impl PeerClient {
    /// Builds an outgoing request message; headers and content go on via
    /// the usual [`Message`] surface.
    pub fn request(&self, method: &str, uri: &str) -> Message {
        let mut msg = Message::request(self.methods.clone(), self.chunk_size);
        msg.method = self
            .methods
            .iter()
            .position(|m| m.name.eq_ignore_ascii_case(method));
        let _ = msg.uri.append(uri.as_bytes());
        msg
    }

    /// Sends `request` and blocks until the response is complete (or the
    /// peer closes after an unsized body).
    pub fn send_request(&mut self, request: &mut Message) -> Result<Message, ServerError> {
        let wire = Self::serialize_request(request);
        self.send_all(&wire)?;
        self.transport.flush();
        self.read_response(request)
    }

    fn serialize_request(request: &mut Message) -> Vec<u8> {
        let mut wire = Vec::with_capacity(256);
        wire.extend_from_slice(
            request
                .method_def()
                .map(|m| m.name.as_bytes())
                .unwrap_or(b"GET"),
        );
        wire.push(b' ');
        wire.extend_from_slice(request.uri.as_slice());
        if let Some(query) = request.query_storage.as_ref() {
            wire.push(b'?');
            wire.extend_from_slice(query.as_slice());
        }
        wire.push(b' ');
        wire.extend_from_slice(request.version().wire().as_bytes());
        wire.extend_from_slice(b"\r\n");

        let body_len = request.content.len();
        if body_len > 0 && request.content_length.is_none() {
            request.content_length = Some(body_len as u64);
        }
        if let Some(len) = request.content_length {
            request.add_header("Content-Length", &len.to_string());
        }
        wire.extend_from_slice(request.headers_storage.as_slice());
        wire.extend_from_slice(b"\r\n");
        wire.extend_from_slice(request.content.as_slice());
        wire
    }

    fn send_all(&mut self, bytes: &[u8]) -> Result<(), ServerError> {
        let mut at = 0;
        while at < bytes.len() {
            match self.transport.send(&bytes[at..]) {
                IoOutcome::Bytes(0) => return Err(ServerError::PeerClosed),
                IoOutcome::Bytes(n) => at += n,
                IoOutcome::Incomplete => {
                    match self.transport.wait(Interest::Send, Some(Duration::from_secs(6))) {
                        Outcome::Success | Outcome::Incomplete => {}
                        _ => return Err(ServerError::PeerClosed),
                    }
                }
                IoOutcome::Reject => return Err(ServerError::PeerClosed),
            }
        }
        Ok(())
    }

    fn read_response(&mut self, request: &Message) -> Result<Message, ServerError> {
        let mut response = Message::request(self.methods.clone(), self.chunk_size);
        response.method = request.method;
        response.state.parse = ParseState::Status;
        response.content_length = None;
        response.content_remaining = None;

        let mut data = ChunkBuffer::new("peer-sockdata", MAX_CHUNKS_HEADER, self.chunk_size);
        let mut body = Vec::new();
        loop {
            data.shrink();
            let Some(space) = data.recv_space() else {
                return Err(ServerError::Space);
            };
            let eof = match self.transport.recv(space) {
                IoOutcome::Bytes(0) => true,
                IoOutcome::Bytes(n) => {
                    data.commit(n);
                    false
                }
                IoOutcome::Incomplete => {
                    match self.transport.wait(Interest::Recv, Some(Duration::from_secs(6))) {
                        Outcome::Success | Outcome::Incomplete => continue,
                        _ => return Err(ServerError::PeerClosed),
                    }
                }
                IoOutcome::Reject => true,
            };

            loop {
                match parser::parse(&mut response, &mut data) {
                    Outcome::Continue => {
                        body.extend_from_slice(response.content().unwrap_or(b""));
                        if data.is_drained() {
                            break;
                        }
                    }
                    Outcome::Success | Outcome::Reject => {
                        body.extend_from_slice(response.content().unwrap_or(b""));
                        return Ok(Self::finish(response, body));
                    }
                    Outcome::Incomplete => break,
                    _ => break,
                }
            }

            if eof {
                // an unsized body legitimately ends at connection close
                if response.content_length.is_none()
                    && response.state.parse >= ParseState::Content
                {
                    return Ok(Self::finish(response, body));
                }
                return Err(ServerError::PeerClosed);
            }
        }
    }

    /// Stows the accumulated body back on the message so `content()`
    /// exposes the whole payload.
    fn finish(mut response: Message, body: Vec<u8>) -> Message {
        response.content = ChunkBuffer::unbounded("peer-content", response.chunk_size);
        let _ = response.content.append(&body);
        response.content_packet = body.len();
        response.content_length = Some(body.len() as u64);
        response
    }
}

#[cfg(test)]
pub(crate) fn test_shared(build: impl FnOnce(&mut Server)) -> Arc<ServerShared> {
    let mut server = Server::new(ServerConfig {
        keepalive: Some(Duration::from_secs(1)),
        ..ServerConfig::default()
    })
    .unwrap();
    build(&mut server);
    server.shared()
}
