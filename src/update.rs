//! Update events surfaced by the event loop
//!
//! Every multiplexer tick yields a sequence of tagged [`Update`] values.
//! Updates reference connections through [`ConnectionId`], a typed handle
//! into the server's connection table; the accepting endpoint owns the
//! reserved id 0.

use std::collections::VecDeque;
use std::fmt;

/// Handle to a connection owned by a [`Server`](crate::server::Server)
///
/// The listener holds [`ConnectionId::LISTENER`]; data connections are
/// numbered from 1 by a monotonically increasing counter and ids are never
/// reused within one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub usize);

impl ConnectionId {
    /// The accepting endpoint's reserved id
    pub const LISTENER: ConnectionId = ConnectionId(0);

    /// Raw index value
    #[inline]
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Read-side event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadKind {
    /// The listener is readable and auto-accept is off; call
    /// [`Server::accept_new_connection`](crate::server::Server::accept_new_connection)
    NewTcpConnectionAvailable,
    /// A transport connection was accepted and awaits its handshake
    NewTcpConnection,
    /// The opening handshake completed; the session is open
    NewConnection,
    /// A complete message is ready on the connection
    Read,
    /// A complete message with an empty payload is ready
    ReadEmptyFrame,
    /// The close handshake finished and the connection reached Closed
    Disconnect,
    /// The peer vanished (EOF or reset) without a close handshake
    SockDisconnect,
    /// The opening handshake was rejected
    HandshakeFailure,
    /// The opening handshake did not complete within its deadline
    HandshakeTimeout,
}

/// Write-side event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// The connection's write queue drained completely this tick
    WriteCompleted,
    /// A write failed; the connection was torn down
    WriteFailed,
}

/// Loop-level error kinds (no connection attached)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The readiness wait itself failed; the host may retry
    SelectFailed,
    /// A read failed at the transport layer
    ReadFailed,
    /// A write failed at the transport layer
    WriteFailed,
}

/// An event surfaced to the host consumer of the event loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Update {
    /// Read-side event on a connection (or the listener)
    Read {
        /// What happened
        kind: ReadKind,
        /// The connection it happened on
        conn: ConnectionId,
    },
    /// Write-side event on a connection
    Write {
        /// What happened
        kind: WriteKind,
        /// The connection it happened on
        conn: ConnectionId,
    },
    /// Loop-level failure
    Error {
        /// What failed
        kind: ErrorKind,
    },
}

impl Update {
    /// Shorthand constructor for read events
    #[inline]
    pub fn read(kind: ReadKind, conn: ConnectionId) -> Self {
        Update::Read { kind, conn }
    }

    /// Shorthand constructor for write events
    #[inline]
    pub fn write(kind: WriteKind, conn: ConnectionId) -> Self {
        Update::Write { kind, conn }
    }

    /// Shorthand constructor for loop errors
    #[inline]
    pub fn error(kind: ErrorKind) -> Self {
        Update::Error { kind }
    }

    /// The connection this update refers to, if any
    pub fn connection(&self) -> Option<ConnectionId> {
        match self {
            Update::Read { conn, .. } | Update::Write { conn, .. } => Some(*conn),
            Update::Error { .. } => None,
        }
    }
}

/// Ordered queue the dispatcher pushes updates into
pub type UpdateQueue = VecDeque<Update>;
