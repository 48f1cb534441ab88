//! WebSocket server
//!
//! A [`Server`] owns the accepting endpoint (optional; a server can run
//! without one for in-process pair tests) and the table of live
//! connections, and drives both through the readiness multiplexer. Hosts
//! consume the event loop by calling [`Server::update`] and iterating the
//! returned updates, calling back into connections (send, close, accept)
//! between ticks.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use mio::Token;
use tracing::{debug, info, warn};

use crate::addr::{Address, Scheme};
use crate::connection::{ConnState, Connection, NetStream};
use crate::container::{ContainerSet, StreamContainer};
use crate::error::{Error, Result};
use crate::listener::{AcceptingConnection, NetListener};
use crate::multiplexer::Multiplexer;
use crate::update::{ConnectionId, ReadKind, Update, UpdateQueue};
use crate::Config;

/// Process-wide instance counter, used only for log correlation
static SERVER_COUNT: AtomicU64 = AtomicU64::new(0);

/// A WebSocket endpoint multiplexing many sessions on one thread
pub struct Server {
    instance: u64,
    config: Config,
    address: Option<Address>,
    accepting: Option<AcceptingConnection>,
    connections: BTreeMap<usize, Connection>,
    next_index: usize,
    multiplexer: Multiplexer,
    pending: UpdateQueue,
    closed: bool,
}

/// Borrowed view of the server's containers handed to the multiplexer
struct ServerContainers<'a> {
    accepting: Option<&'a mut AcceptingConnection>,
    connections: &'a mut BTreeMap<usize, Connection>,
}

impl ContainerSet for ServerContainers<'_> {
    fn for_each(&mut self, f: &mut dyn FnMut(&mut dyn StreamContainer)) {
        if let Some(accepting) = self.accepting.as_deref_mut() {
            f(accepting);
        }
        for connection in self.connections.values_mut() {
            f(connection);
        }
    }

    fn get_mut(&mut self, token: Token) -> Option<&mut dyn StreamContainer> {
        if token.0 == ConnectionId::LISTENER.index() {
            self.accepting
                .as_deref_mut()
                .map(|a| a as &mut dyn StreamContainer)
        } else {
            self.connections
                .get_mut(&token.0)
                .map(|c| c as &mut dyn StreamContainer)
        }
    }
}

impl Server {
    /// Bind a listening endpoint and create the server
    ///
    /// `address` follows the `protocol://host:port` scheme (§`addr`). For
    /// unix-domain addresses a stale socket file is unlinked (with a
    /// warning) and a missing parent directory is created with mode 0770.
    pub fn bind(address: &str, config: Config) -> Result<Server> {
        let parsed = Address::parse(address, config.use_crypto)?;

        let (listener, unix_path) = match &parsed {
            Address::Inet { addr, .. } => {
                let listener = mio::net::TcpListener::bind(*addr).map_err(Error::Bind)?;
                (NetListener::Tcp(listener), None)
            }
            Address::Path {
                scheme: Scheme::Unix,
                path,
            } => {
                prepare_unix_path(path)?;
                let listener = mio::net::UnixListener::bind(path).map_err(Error::Bind)?;
                (NetListener::Unix(listener), Some(path.clone()))
            }
            Address::Path {
                scheme: Scheme::Udg,
                ..
            } => {
                // Datagram sockets cannot carry an RFC 6455 byte stream.
                return Err(Error::BadAddress(address.to_string()));
            }
            Address::Path { .. } => return Err(Error::BadAddress(address.to_string())),
        };

        let mut server = Server::without_listener(config)?;
        info!(server = server.instance, address = %parsed, "listening");
        server.address = Some(parsed);
        server.accepting = Some(AcceptingConnection::new(listener, unix_path));
        Ok(server)
    }

    /// Create a server with no accepting endpoint
    ///
    /// Connections arrive only through [`Server::adopt_stream`]; used for
    /// in-process pair tests and hosts that accept elsewhere (e.g. behind a
    /// TLS acceptor).
    pub fn without_listener(config: Config) -> Result<Server> {
        Ok(Server {
            instance: SERVER_COUNT.fetch_add(1, Ordering::Relaxed) + 1,
            config,
            address: None,
            accepting: None,
            connections: BTreeMap::new(),
            next_index: 1,
            multiplexer: Multiplexer::new()?,
            pending: UpdateQueue::new(),
            closed: false,
        })
    }

    /// The configured endpoint address, if the server has a listener
    pub fn address(&self) -> Option<&Address> {
        self.address.as_ref()
    }

    /// Actual local address of a TCP listener (useful after binding port 0)
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.accepting.as_ref()?.local_addr()
    }

    /// Number of connections currently owned
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Look up a connection by id
    pub fn connection(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id.index())
    }

    /// Iterate all owned connections
    pub fn connections(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.values_mut()
    }

    /// Run one multiplexer tick and return the resulting updates
    ///
    /// `timeout = None` waits indefinitely; zero polls. The returned
    /// iterator drains the internal queue; updates left unconsumed stay
    /// queued for the next call.
    pub fn update(&mut self, timeout: Option<Duration>) -> Updates<'_> {
        self.prune_closed();
        self.check_accept_deadline();

        let mut set = ServerContainers {
            accepting: self.accepting.as_mut(),
            connections: &mut self.connections,
        };
        self.multiplexer.tick(&mut set, timeout, &mut self.pending);

        self.post_process();
        Updates {
            queue: &mut self.pending,
        }
    }

    /// Accept one pending transport connection by hand
    ///
    /// The manual counterpart to auto-accept, used after a
    /// `NEW_TCP_CONNECTION_AVAILABLE` update. Fails with a usage error when
    /// the server has no listener.
    pub fn accept_new_connection(&mut self) -> Result<ConnectionId> {
        let accepting = self
            .accepting
            .as_mut()
            .ok_or(Error::InvalidState("server has no listener"))?;
        let (stream, peer) = accepting.accept()?;
        accepting.pending_accept_since = None;
        Ok(self.register_connection(stream, peer))
    }

    /// Register an already-connected stream as a new handshaking connection
    pub fn adopt_stream(&mut self, stream: NetStream, peer_address: impl Into<String>) -> ConnectionId {
        self.register_connection(stream, peer_address.into())
    }

    /// Start the close handshake on every open connection
    pub fn disconnect_all(&mut self, code: u16, reason: &str) {
        for connection in self.connections.values_mut() {
            if connection.is_open() {
                // Cannot fail on an open connection.
                let _ = connection.close(code, reason);
            }
        }
    }

    /// Remove (and close) a connection owned by this server
    ///
    /// Fails with a usage error if the id does not name an owned
    /// connection.
    pub fn remove_connection(&mut self, id: ConnectionId) -> Result<()> {
        match self.connections.remove(&id.index()) {
            Some(mut connection) => {
                if connection.state() != ConnState::Closed {
                    connection.hard_close();
                }
                debug!(server = self.instance, conn = %id, "connection removed");
                Ok(())
            }
            None => Err(Error::InvalidState("connection not owned by this server")),
        }
    }

    /// Post-fork bookkeeping
    ///
    /// The child (`pid == 0`) must call this before any I/O: it drops the
    /// child's copies of the parent's connections without close frames and
    /// disables socket-file cleanup so the child's shutdown cannot unlink
    /// the listener the parent still owns. In the parent (`pid != 0`) this
    /// is a no-op.
    pub fn process_did_fork(&mut self, pid: i32) {
        if pid != 0 {
            return;
        }
        debug!(server = self.instance, "fork child: dropping inherited connections");
        if let Some(accepting) = self.accepting.as_mut() {
            accepting.suppress_cleanup();
        }
        for connection in self.connections.values_mut() {
            connection.hard_close();
        }
        self.connections.clear();
        self.pending.clear();
    }

    /// Close every connection, then the accepting endpoint, then release
    ///
    /// Unix socket cleanup honors the fork flag. Idempotent; also run on
    /// drop.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        info!(server = self.instance, "shutting down");
        for connection in self.connections.values_mut() {
            connection.hard_close();
        }
        self.connections.clear();
        if let Some(mut accepting) = self.accepting.take() {
            accepting.close();
        }
        self.pending.clear();
    }

    // ------------------------------------------------------------------

    fn register_connection(&mut self, stream: NetStream, peer_address: String) -> ConnectionId {
        let index = self.next_index;
        self.next_index += 1;
        let id = ConnectionId(index);
        let connection = Connection::new(id, stream, peer_address, &self.config);
        debug!(
            server = self.instance,
            conn = %id,
            peer = %connection.peer_address(),
            "connection registered"
        );
        self.connections.insert(index, connection);
        id
    }

    /// Drop connections that finished in an earlier tick. They stay in the
    /// table for one update round so the host can still inspect close codes
    /// after the final DISCONNECT.
    fn prune_closed(&mut self) {
        self.connections
            .retain(|_, connection| connection.state() != ConnState::Closed);
    }

    /// Under manual accept, a ready connection the host never accepted is
    /// dropped once the accept deadline passes.
    fn check_accept_deadline(&mut self) {
        let Some(accepting) = self.accepting.as_mut() else {
            return;
        };
        let Some(since) = accepting.pending_accept_since else {
            return;
        };
        if since.elapsed() < self.config.accept_timeout {
            return;
        }
        accepting.pending_accept_since = None;
        match accepting.accept() {
            Ok((stream, peer)) => {
                warn!(peer = %peer, "pending connection never accepted, dropping");
                drop(stream);
            }
            Err(Error::WouldBlock) => {}
            Err(e) => warn!(error = %e, "accept failed while clearing stale connection"),
        }
    }

    /// Turn listener readiness into accepted connections (auto-accept) or
    /// arm the manual-accept deadline.
    fn post_process(&mut self) {
        let needs_accept = self
            .pending
            .iter()
            .any(|u| matches!(u, Update::Read { kind: ReadKind::NewTcpConnectionAvailable, .. }));
        if !needs_accept {
            return;
        }

        if !self.config.auto_accept {
            if let Some(accepting) = self.accepting.as_mut() {
                accepting.pending_accept_since.get_or_insert_with(Instant::now);
            }
            return;
        }

        let drained: Vec<Update> = self.pending.drain(..).collect();
        for update in drained {
            if !matches!(
                update,
                Update::Read {
                    kind: ReadKind::NewTcpConnectionAvailable,
                    ..
                }
            ) {
                self.pending.push_back(update);
                continue;
            }

            // One readiness event can cover several queued connections.
            loop {
                let accept = match self.accepting.as_mut() {
                    Some(accepting) => accepting.accept(),
                    None => break,
                };
                match accept {
                    Ok((stream, peer)) => {
                        let id = self.register_connection(stream, peer);
                        self.pending
                            .push_back(Update::read(ReadKind::NewTcpConnection, id));
                    }
                    Err(Error::WouldBlock) => break,
                    Err(e) => {
                        warn!(server = self.instance, error = %e, "accept failed");
                        break;
                    }
                }
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close();
    }
}

/// Draining iterator over the updates produced by one tick
///
/// Dropping the iterator leaves unconsumed updates queued; they are yielded
/// first by the next [`Server::update`] call.
pub struct Updates<'a> {
    queue: &'a mut UpdateQueue,
}

impl Iterator for Updates<'_> {
    type Item = Update;

    fn next(&mut self) -> Option<Update> {
        self.queue.pop_front()
    }
}

fn prepare_unix_path(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            let mut builder = std::fs::DirBuilder::new();
            builder.recursive(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::DirBuilderExt;
                builder.mode(0o770);
            }
            builder.create(parent).map_err(Error::Bind)?;
        }
    }
    if path.exists() {
        warn!(path = %path.display(), "removing stale socket file");
        std::fs::remove_file(path).map_err(Error::Bind)?;
    }
    Ok(())
}
