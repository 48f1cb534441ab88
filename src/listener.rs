//! Accepting endpoint
//!
//! The listening socket wrapped as a [`StreamContainer`] so it participates
//! in the same readiness loop as data connections. Read-readiness is
//! reported to the host as `NEW_TCP_CONNECTION_AVAILABLE`; the accept
//! itself is performed by the owning [`Server`](crate::server::Server),
//! which constructs and registers the new connection.

use std::io;
use std::path::PathBuf;
use std::time::Instant;

use mio::event::Source;
use mio::{Interest, Registry, Token};
use tracing::{debug, error, warn};

use crate::connection::NetStream;
use crate::container::StreamContainer;
use crate::error::{Error, Result};
use crate::update::{ConnectionId, ErrorKind, ReadKind, Update, UpdateQueue};

/// The listening socket variants a server can bind
#[derive(Debug)]
pub enum NetListener {
    /// TCP listener
    Tcp(mio::net::TcpListener),
    /// Unix-domain stream listener
    Unix(mio::net::UnixListener),
}

impl Source for NetListener {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            NetListener::Tcp(l) => l.register(registry, token, interests),
            NetListener::Unix(l) => l.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            NetListener::Tcp(l) => l.reregister(registry, token, interests),
            NetListener::Unix(l) => l.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            NetListener::Tcp(l) => l.deregister(registry),
            NetListener::Unix(l) => l.deregister(registry),
        }
    }
}

/// Listening endpoint participating in the readiness loop
pub struct AcceptingConnection {
    listener: Option<NetListener>,
    registered: bool,
    /// Socket file to unlink on close (unix listeners only)
    unix_path: Option<PathBuf>,
    /// Whether close unlinks the socket file; cleared in fork children
    cleanup_on_close: bool,
    /// Set while a ready-but-unaccepted connection waits under manual accept
    pub(crate) pending_accept_since: Option<Instant>,
}

impl AcceptingConnection {
    pub(crate) fn new(listener: NetListener, unix_path: Option<PathBuf>) -> Self {
        AcceptingConnection {
            listener: Some(listener),
            registered: false,
            unix_path,
            cleanup_on_close: true,
            pending_accept_since: None,
        }
    }

    /// Accept one pending transport connection
    pub(crate) fn accept(&mut self) -> Result<(NetStream, String)> {
        let listener = self
            .listener
            .as_mut()
            .ok_or(Error::InvalidState("listener is closed"))?;

        match listener {
            NetListener::Tcp(l) => {
                let (stream, addr) = l.accept().map_err(Error::from)?;
                Ok((NetStream::Tcp(stream), addr.to_string()))
            }
            NetListener::Unix(l) => {
                let (stream, addr) = l.accept().map_err(Error::from)?;
                let peer = addr
                    .as_pathname()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "unix:unnamed".to_string());
                Ok((NetStream::Unix(stream), peer))
            }
        }
    }

    /// Local address of a TCP listener (for port-0 binds)
    pub(crate) fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match self.listener.as_ref()? {
            NetListener::Tcp(l) => l.local_addr().ok(),
            NetListener::Unix(_) => None,
        }
    }

    /// Disable unlinking the socket file on close (fork child discipline)
    pub(crate) fn suppress_cleanup(&mut self) {
        self.cleanup_on_close = false;
    }

    /// Close the listener, unlinking the unix socket file unless suppressed
    pub(crate) fn close(&mut self) {
        if self.listener.take().is_none() {
            return;
        }
        self.registered = false;
        if let Some(path) = &self.unix_path {
            if self.cleanup_on_close {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "could not unlink socket file");
                }
            } else {
                debug!(path = %path.display(), "leaving socket file for parent process");
            }
        }
    }
}

impl Drop for AcceptingConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl StreamContainer for AcceptingConnection {
    fn token(&self) -> Token {
        Token(ConnectionId::LISTENER.index())
    }

    fn is_live(&self) -> bool {
        self.listener.is_some()
    }

    fn is_write_buffer_empty(&self) -> bool {
        true
    }

    fn update_registration(&mut self, registry: &Registry, interest: Interest) -> io::Result<()> {
        let token = self.token();
        let registered = self.registered;
        let Some(listener) = self.listener.as_mut() else {
            return Ok(());
        };
        if registered {
            listener.reregister(registry, token, interest)
        } else {
            listener.register(registry, token, interest)?;
            self.registered = true;
            Ok(())
        }
    }

    fn before_stream_select(&mut self, _now: Instant, _updates: &mut UpdateQueue) {}

    fn handle_read(&mut self, updates: &mut UpdateQueue) {
        // The server turns this into an inline accept under auto-accept.
        updates.push_back(Update::read(
            ReadKind::NewTcpConnectionAvailable,
            ConnectionId::LISTENER,
        ));
    }

    fn handle_write(&mut self, updates: &mut UpdateQueue) {
        // Never armed for write interest; being called here means the
        // dispatcher routed an event to the wrong container.
        error!("handle_write invoked on the accepting connection");
        debug_assert!(false, "accepting connection has no write side");
        updates.push_back(Update::error(ErrorKind::WriteFailed));
    }

    fn handle_exceptional(&mut self, updates: &mut UpdateQueue) {
        error!("handle_exceptional invoked on the accepting connection");
        debug_assert!(false, "accepting connection has no exceptional handling");
        updates.push_back(Update::error(ErrorKind::ReadFailed));
    }
}
