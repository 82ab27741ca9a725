//! ember_web - embeddable HTTP/1.x server for small-footprint services
//!
//! A server library, not a framework: the host application creates
//! listeners, registers URL-matching request handlers ("connectors") and
//! optionally stacks transport layers (TLS, protocol upgrades) between
//! the socket and the parser. Handlers see a concrete request [`Message`]
//! and write a concrete response [`Message`].
//!
//! # Protocol Support
//!
//! - **HTTP/1.1** with keep-alive and strict FIFO pipelining (feature
//!   `pipeline`)
//! - **HTTP/1.0** for legacy clients
//! - **HTTP/0.9** request lines answered with a raw body
//!
//! Body delimitation is `Content-Length` only; chunked transfer encoding
//! is deliberately out of scope for the devices this crate targets.
//!
//! # Quick Start
//!
//! ```no_run
//! use ember_web::{priority, Outcome, Server, ServerConfig};
//!
//! let mut server = Server::new(ServerConfig {
//!     port: 8080,
//!     ..ServerConfig::default()
//! })
//! .unwrap();
//!
//! server.add_connector("hello", priority::DOCUMENT, |_ctx, req, resp| {
//!     if req.request_item("uri") != Some(b"/" as &[u8]) {
//!         return Outcome::Reject;
//!     }
//!     resp.add_content("text/plain", b"Hello World!");
//!     Outcome::Success
//! });
//!
//! server.run().unwrap();
//! ```
//!
//! # Architecture
//!
//! Each accepted connection becomes a [`Client`]: a state machine owning
//! the socket, a transport adapter, a receive buffer and a FIFO of
//! request/response exchanges. `Client::step` never blocks, so the same
//! machine runs under every scheduling model in
//! [`limits::Scheduling`]: a thread per client, a fixed worker pool, or
//! one cooperative poll loop.

pub(crate) mod mem {
    pub(crate) mod buffer;
    pub(crate) mod fields;
}
pub(crate) mod http {
    pub(crate) mod message;
    pub(crate) mod parser;
    pub mod types;
}
pub mod transport {
    pub mod adapter;
    pub(crate) mod mem;
    pub mod tcp;
    #[cfg(feature = "tls")]
    pub mod tls;
}
pub(crate) mod server {
    pub(crate) mod client;
    pub(crate) mod connector;
    pub(crate) mod executor;
    pub(crate) mod server_impl;
}
pub(crate) mod errors;
pub mod limits;
#[cfg(feature = "ws")]
pub mod ws;

pub use crate::{
    errors::{IoOutcome, Outcome, ServerError},
    http::{
        message::Message,
        types::{method_props, status_text, MethodDef, Version},
    },
    limits::ServerConfig,
    server::{
        client::{Client, HandlerCtx, ModuleEnv, StepOutcome},
        connector::priority,
        server_impl::{ModuleCtxFactory, PeerClient, Server},
    },
    transport::adapter::{Interest, Readiness, Transport, TransportLayer},
};
