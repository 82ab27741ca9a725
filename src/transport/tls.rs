//! TLS transport adapter, stacking on top of any inner transport.
//!
//! rustls is a pure state machine, so the wrapper pumps TLS records
//! between the session and the inner adapter synchronously: would-block
//! maps to [`IoOutcome::Incomplete`], fatal alerts to
//! [`IoOutcome::Reject`]. The handshake completes lazily during the first
//! reads and writes; `disconnect` queues a `close_notify` before the
//! inner adapter shuts the socket down.

use crate::{
    errors::{IoOutcome, Outcome, ServerError},
    limits::TlsConfig,
    transport::adapter::{Interest, Readiness, Transport},
};
use rustls::{ServerConfig, ServerConnection};
use std::io::{self, BufReader, Read, Write};
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

impl TlsConfig {
    /// Loads the PEM material into a rustls server configuration.
    pub fn load(&self) -> Result<Arc<ServerConfig>, ServerError> {
        let certs = rustls_pemfile::certs(&mut BufReader::new(
            std::fs::File::open(&self.cert_path)?,
        ))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Tls(format!("certificate chain: {e}")))?;

        let key = rustls_pemfile::private_key(&mut BufReader::new(std::fs::File::open(
            &self.key_path,
        )?))
        .map_err(|e| ServerError::Tls(format!("private key: {e}")))?
        .ok_or_else(|| ServerError::Tls("no private key found".into()))?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ServerError::Tls(e.to_string()))?;
        Ok(Arc::new(config))
    }
}

pub struct TlsTransport {
    inner: Box<dyn Transport>,
    conn: ServerConnection,
    broken: bool,
}

impl TlsTransport {
    pub fn new(
        inner: Box<dyn Transport>,
        config: Arc<ServerConfig>,
    ) -> Result<Self, ServerError> {
        let conn = ServerConnection::new(config).map_err(|e| ServerError::Tls(e.to_string()))?;
        Ok(Self {
            inner,
            conn,
            broken: false,
        })
    }

    /// Writes pending TLS records to the inner adapter. Records the inner
    /// adapter refuses stay queued in the session.
    fn pump_out(&mut self) -> IoOutcome {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut InnerIo(self.inner.as_mut())) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return IoOutcome::Incomplete,
                Err(_) => {
                    self.broken = true;
                    return IoOutcome::Reject;
                }
            }
        }
        IoOutcome::Bytes(0)
    }

    /// Reads TLS records from the inner adapter and decrypts them.
    fn pump_in(&mut self) -> IoOutcome {
        match self.conn.read_tls(&mut InnerIo(self.inner.as_mut())) {
            Ok(0) => return IoOutcome::Bytes(0),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return IoOutcome::Incomplete,
            Err(_) => {
                self.broken = true;
                return IoOutcome::Reject;
            }
        }
        match self.conn.process_new_packets() {
            Ok(_) => IoOutcome::Bytes(1),
            Err(e) => {
                tracing::warn!("tls: fatal alert: {e}");
                // deliver the alert if the socket still accepts it
                let _ = self.pump_out();
                self.broken = true;
                IoOutcome::Reject
            }
        }
    }
}

impl Transport for TlsTransport {
    fn recv(&mut self, buf: &mut [u8]) -> IoOutcome {
        if self.broken {
            return IoOutcome::Reject;
        }
        loop {
            // handshake responses ride on the read path
            if self.conn.wants_write() {
                if let IoOutcome::Reject = self.pump_out() {
                    return IoOutcome::Reject;
                }
            }
            match self.conn.reader().read(buf) {
                Ok(n) => return IoOutcome::Bytes(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return IoOutcome::Bytes(0),
                Err(_) => return IoOutcome::Reject,
            }
            match self.pump_in() {
                IoOutcome::Bytes(0) => return IoOutcome::Bytes(0),
                IoOutcome::Bytes(_) => continue,
                other => return other,
            }
        }
    }

    fn send(&mut self, buf: &[u8]) -> IoOutcome {
        if self.broken {
            return IoOutcome::Reject;
        }
        if self.conn.is_handshaking() {
            // drive the handshake before accepting plaintext
            match self.pump_out() {
                IoOutcome::Reject => return IoOutcome::Reject,
                IoOutcome::Incomplete => return IoOutcome::Incomplete,
                IoOutcome::Bytes(_) => {}
            }
            if self.conn.is_handshaking() {
                return IoOutcome::Incomplete;
            }
        }
        let written = match self.conn.writer().write(buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return IoOutcome::Incomplete,
            Err(_) => return IoOutcome::Reject,
        };
        match self.pump_out() {
            IoOutcome::Reject => IoOutcome::Reject,
            _ => IoOutcome::Bytes(written),
        }
    }

    fn wait(&mut self, interest: Interest, timeout: Option<Duration>) -> Outcome {
        // the state machine owes no plaintext here: recv only reports
        // Incomplete once both the session and the inner adapter drained
        self.inner.wait(interest, timeout)
    }

    fn status(&mut self) -> Readiness {
        self.inner.status()
    }

    fn flush(&mut self) {
        let _ = self.pump_out();
        self.inner.flush();
    }

    fn disconnect(&mut self) {
        self.conn.send_close_notify();
        let _ = self.pump_out();
        self.inner.disconnect();
    }

    fn scheme(&self) -> &'static str {
        "https"
    }

    fn default_port(&self) -> u16 {
        443
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.inner.raw_fd()
    }
}

/// `Read`/`Write` shim mapping the adapter result codes onto `io::Error`
/// for the rustls record pumps.
struct InnerIo<'a>(&'a mut dyn Transport);

impl Read for InnerIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.recv(buf) {
            IoOutcome::Bytes(n) => Ok(n),
            IoOutcome::Incomplete => Err(io::ErrorKind::WouldBlock.into()),
            IoOutcome::Reject => Err(io::ErrorKind::ConnectionReset.into()),
        }
    }
}

impl Write for InnerIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.send(buf) {
            IoOutcome::Bytes(0) => Err(io::ErrorKind::ConnectionReset.into()),
            IoOutcome::Bytes(n) => Ok(n),
            IoOutcome::Incomplete => Err(io::ErrorKind::WouldBlock.into()),
            IoOutcome::Reject => Err(io::ErrorKind::ConnectionReset.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
