//! Parsed or constructed HTTP message and the response serializer.

use crate::{
    errors::Outcome,
    http::types::{write_status, MethodDef, Version},
    limits::{MAX_CHUNKS_CONTENT, MAX_CHUNKS_HEADER, MAX_CHUNKS_URI},
    mem::{
        buffer::ChunkBuffer,
        fields::{is_multi_valued, FieldMap},
    },
};
use std::{any::Any, sync::Arc};

/// Parse phase of the message state word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum ParseState {
    Init,
    Uri,
    UriFragment,
    Query,
    Version,
    Status,
    PreHeader,
    Header,
    PostHeader,
    PreContent,
    Content,
    PostContent,
    End,
}

impl ParseState {
    /// A request may be handed to connectors once its body phase begins;
    /// urlencoded bodies ([`PostContent`](Self::PostContent)) are buffered
    /// to the end first so `parameter()` sees the whole form.
    #[inline(always)]
    pub(crate) fn dispatchable(self) -> bool {
        matches!(self, ParseState::Content | ParseState::End)
    }
}

/// Generate phase of the message state word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum GenerateState {
    None,
    Error,
    Init,
    Result,
    Header,
    Separator,
    Content,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct MsgState {
    pub parse: ParseState,
    pub generate: GenerateState,
    /// More parser or handler work pending inside the current phase.
    pub parse_continue: bool,
}

/// An HTTP request or response.
///
/// Requests are built by the parser; responses are built by connectors
/// through the methods below. A message owns every buffer it references.
pub struct Message {
    pub(crate) chunk_size: usize,
    pub(crate) result: u16,
    pub(crate) version: Version,
    pub(crate) methods: Arc<Vec<MethodDef>>,
    pub(crate) method: Option<usize>,

    pub(crate) uri: ChunkBuffer,
    pub(crate) uri_open: bool,
    pub(crate) query_storage: Option<ChunkBuffer>,
    pub(crate) queries: FieldMap,

    pub(crate) headers_storage: ChunkBuffer,
    pub(crate) headers: FieldMap,

    pub(crate) cookie_storage: Option<ChunkBuffer>,
    pub(crate) cookies: FieldMap,

    /// Most recent content packet (requests) or staged body (responses).
    pub(crate) content: ChunkBuffer,
    pub(crate) content_length: Option<u64>,
    /// Declared bytes not yet carved into packets (requests only).
    pub(crate) content_remaining: Option<u64>,
    pub(crate) content_packet: usize,
    pub(crate) has_content: bool,

    pub(crate) response_line: ChunkBuffer,
    pub(crate) state: MsgState,
    pub(crate) keepalive: bool,
    pub(crate) locked: bool,

    private: Option<Box<dyn Any + Send>>,
    pub(crate) complete: Vec<Box<dyn FnOnce(&mut Message) + Send>>,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("result", &self.result)
            .field("version", &self.version)
            .field("state", &self.state)
            .field("keepalive", &self.keepalive)
            .field("locked", &self.locked)
            .finish_non_exhaustive()
    }
}

impl Message {
    /// A request message about to be parsed.
    pub(crate) fn request(methods: Arc<Vec<MethodDef>>, chunk_size: usize) -> Self {
        Self {
            chunk_size,
            result: 200,
            version: Version::Http11,
            methods,
            method: None,
            uri: ChunkBuffer::new("uri", MAX_CHUNKS_URI, chunk_size),
            uri_open: false,
            query_storage: None,
            queries: FieldMap::default(),
            headers_storage: ChunkBuffer::new("headers", MAX_CHUNKS_HEADER, chunk_size),
            headers: FieldMap::default(),
            cookie_storage: None,
            cookies: FieldMap::default(),
            content: ChunkBuffer::new("content", MAX_CHUNKS_CONTENT, chunk_size),
            content_length: None,
            content_remaining: None,
            content_packet: 0,
            has_content: false,
            response_line: ChunkBuffer::new("response-line", 1, chunk_size.max(64)),
            state: MsgState {
                parse: ParseState::Init,
                generate: GenerateState::None,
                parse_continue: false,
            },
            keepalive: false,
            locked: false,
            private: None,
            complete: Vec::new(),
        }
    }

    /// The response paired with `request`: version, result and mode flags
    /// carry over, content length starts unset.
    pub(crate) fn response_to(request: &Message, chunk_size: usize) -> Self {
        let mut msg = Self::request(request.methods.clone(), chunk_size);
        msg.method = request.method;
        msg.version = request.version;
        msg.result = request.result;
        msg.keepalive = request.keepalive;
        msg.locked = request.locked;
        msg
    }

    #[inline(always)]
    pub(crate) fn method_def(&self) -> Option<&MethodDef> {
        self.method.map(|i| &self.methods[i])
    }
}

// Handler-facing surface
impl Message {
    /// HTTP status result of the message.
    #[inline(always)]
    pub fn result(&self) -> u16 {
        self.result
    }

    /// Sets the status result (e.g. `404`).
    #[inline(always)]
    pub fn set_result(&mut self, result: u16) {
        self.result = result;
    }

    #[inline(always)]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Name of the request method, when one was matched.
    pub fn method(&self) -> Option<&str> {
        self.method_def().map(|m| m.name.as_str())
    }

    /// First header value stored under `name`, case-insensitively.
    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.headers.get(&self.headers_storage, name)
    }

    /// Declared content length; `None` means it was never set.
    #[inline(always)]
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Declares the total body length up front, for handlers that stream
    /// the body across several [`Continue`](crate::Outcome::Continue)
    /// rounds. Without a declared length keep-alive is dropped.
    #[inline(always)]
    pub fn set_content_length(&mut self, length: u64) {
        self.content_length = Some(length);
    }

    /// The content packet currently available to the handler.
    pub fn content(&self) -> Option<&[u8]> {
        if self.content_packet == 0 {
            return None;
        }
        Some(&self.content.as_slice()[..self.content_packet])
    }

    /// Query or urlencoded-form parameter.
    pub fn parameter(&self, key: &[u8]) -> Option<&[u8]> {
        let storage = self.query_storage.as_ref()?;
        self.queries.get(storage, key)
    }

    /// Value of a request cookie.
    pub fn cookie(&self, key: &[u8]) -> Option<&[u8]> {
        let storage = self.cookie_storage.as_ref()?;
        self.cookies.get(storage, key)
    }

    /// The REQUEST virtual dictionary for message-scoped keys:
    /// `uri`, `query`, `version`, `method`, `result`, `content`, or any
    /// header name. Connection-scoped keys (`remote_addr`, `scheme`, ...)
    /// live on [`HandlerCtx`](crate::HandlerCtx).
    pub fn request_item(&self, key: &str) -> Option<&[u8]> {
        match key {
            "uri" => Some(self.uri.as_slice()),
            "query" => self.query_storage.as_ref().map(|q| q.as_slice()),
            "version" => Some(self.version.wire().as_bytes()),
            "method" => self.method().map(str::as_bytes),
            "result" => crate::http::types::status_text(self.result).map(str::as_bytes),
            "content" => self.content(),
            _ => self.header(key.as_bytes()),
        }
    }

    /// [`request_item`](Self::request_item) validated as UTF-8.
    pub fn request_str(&self, key: &str) -> Option<&str> {
        simdutf8::basic::from_utf8(self.request_item(key)?).ok()
    }

    /// Requests connection reuse after this exchange.
    #[inline]
    pub fn keep_alive(&mut self) {
        self.keepalive = true;
    }

    /// Marks the message LOCKED: once the response is flushed the core
    /// stops touching the socket (protocol upgrades take it over).
    #[inline]
    pub fn lock(&mut self) {
        self.locked = true;
    }

    /// Attaches private handler data to the message.
    pub fn set_private(&mut self, data: Box<dyn Any + Send>) {
        self.private = Some(data);
    }

    pub fn private(&mut self) -> Option<&mut (dyn Any + Send)> {
        self.private.as_deref_mut()
    }

    /// Registers a callback invoked after the response headers are
    /// serialized but before the body is sent. Used to inject synthetic
    /// headers (date, signature) at the last moment.
    pub fn on_header_complete(&mut self, cb: impl FnOnce(&mut Message) + Send + 'static) {
        self.complete.push(Box::new(cb));
    }

    /// Adds a response header. Duplicate keys are rejected unless the key
    /// is multi-valued (`Set-Cookie`); headers added after the separator
    /// was sent are rejected.
    pub fn add_header(&mut self, key: &str, value: &str) -> Outcome {
        if self.state.generate >= GenerateState::Separator {
            tracing::warn!("message: result generated, header {key} too late");
            return Outcome::Reject;
        }
        if !is_multi_valued(key.as_bytes()) && self.has_header_line(key.as_bytes()) {
            tracing::warn!("message: header already present {key}");
            return Outcome::Reject;
        }
        if !self
            .headers_storage
            .accepts(key.len() + 2 + value.len() + 2)
        {
            tracing::warn!("message: buffer too small to add {key}");
            return Outcome::Space;
        }
        let _ = self.headers_storage.append(key.as_bytes());
        let _ = self.headers_storage.append(b": ");
        let _ = self.headers_storage.append(value.as_bytes());
        let _ = self.headers_storage.append(b"\r\n");
        Outcome::Success
    }

    /// Extends the value of the most recently added header.
    pub fn append_header(&mut self, key: &str, value: &str) -> Outcome {
        let data = self.headers_storage.as_slice();
        let line_start = match memchr::memrchr(b'\n', &data[..data.len().saturating_sub(2)]) {
            Some(at) => at + 1,
            None => 0,
        };
        if !data[line_start..].starts_with(key.as_bytes()) {
            return Outcome::Reject;
        }
        if !self.headers_storage.accepts(value.len()) {
            tracing::warn!("message: headers too long {value}");
            return Outcome::Space;
        }
        self.headers_storage.pop(2);
        let _ = self.headers_storage.append(value.as_bytes());
        let _ = self.headers_storage.append(b"\r\n");
        Outcome::Success
    }

    /// Creates the response body and sets `Content-Type`; replaces any
    /// previously staged content.
    pub fn add_content(&mut self, content_type: &str, data: &[u8]) -> Outcome {
        if !self.has_content && !content_type.is_empty() {
            self.add_header("Content-Type", content_type);
        }
        self.content.reset(0);
        if self.content.append(data).is_none() {
            return Outcome::Space;
        }
        self.has_content = true;
        if self.content_length.is_none() {
            self.content_length = Some(data.len() as u64);
        }
        Outcome::Success
    }

    /// Appends body bytes, extending the declared length when one is set.
    pub fn append_content(&mut self, data: &[u8]) -> Outcome {
        if self.content.append(data).is_none() {
            return Outcome::Space;
        }
        self.has_content = true;
        if let Some(len) = self.content_length.as_mut() {
            *len += data.len() as u64;
        }
        Outcome::Success
    }

    fn has_header_line(&self, key: &[u8]) -> bool {
        let data = self.headers_storage.as_slice();
        let mut start = 0;
        for at in memchr::memchr_iter(b'\n', data) {
            let line = &data[start..at];
            if line.len() > key.len()
                && line[key.len()] == b':'
                && line[..key.len()].eq_ignore_ascii_case(key)
            {
                return true;
            }
            start = at + 1;
        }
        false
    }
}

// Response serializer
impl Message {
    /// Emits `"HTTP/x.y <status>\r\n"` into the response-line buffer; the
    /// version on the wire never exceeds `max_version`, and results of
    /// 400 and above drop keep-alive.
    pub(crate) fn build_response_line(&mut self, max_version: Version) {
        self.version = self.version.min(max_version);
        let mut line = Vec::with_capacity(48);
        line.extend_from_slice(self.version.wire().as_bytes());
        write_status(self.result, &mut line);
        line.extend_from_slice(b"\r\n");

        self.response_line.reset(0);
        let _ = self.response_line.append(&line);

        if self.result > 399 {
            self.keepalive = false;
        }
        self.state.generate = GenerateState::Result;
    }

    /// Finalizes the header block: synthesizes `Content-Length:` when the
    /// body length is known and the handler did not set one, forces
    /// `Connection:` to match the keep-alive decision, then runs the
    /// header-complete callbacks.
    pub(crate) fn build_header(&mut self, server_header: Option<&str>) {
        if let Some(len) = self.content_length {
            if !self.headers.contains_key(&self.headers_storage, b"content-length")
                && !self.has_header_line(b"Content-Length")
            {
                self.add_header("Content-Length", &len.to_string());
            }
        }
        if let Some(server) = server_header {
            self.add_header("Server", server);
        }
        if self.keepalive {
            self.add_header("Connection", "Keep-Alive");
        } else {
            self.add_header("Connection", "Close");
        }
        for cb in std::mem::take(&mut self.complete) {
            cb(self);
        }
        self.state.generate = GenerateState::Header;
    }
}
