//! Stream container capability
//!
//! Everything the multiplexer drives (data connections, the accepting
//! endpoint, an embedded client) implements [`StreamContainer`]. The
//! multiplexer itself only ever sees this contract; the concrete types live
//! in their own modules.

use std::io;
use std::time::Instant;

use mio::{Interest, Registry, Token};

use crate::update::UpdateQueue;

/// Capability implemented by every entity the multiplexer drives
pub trait StreamContainer {
    /// The poll token identifying this container's stream
    fn token(&self) -> Token;

    /// Whether the container still holds a live stream
    ///
    /// Dead containers are skipped (and logged) during dispatch.
    fn is_live(&self) -> bool;

    /// Whether the outbound buffer is empty
    ///
    /// Containers reporting a non-empty buffer are armed for write
    /// readiness on the next wait.
    fn is_write_buffer_empty(&self) -> bool;

    /// (Re)arm the container's stream with the given interest
    ///
    /// Called once per tick before the readiness wait. Implementations
    /// register on first use and re-register afterwards.
    fn update_registration(&mut self, registry: &Registry, interest: Interest) -> io::Result<()>;

    /// Hook run before the readiness wait
    ///
    /// Deadline checks (handshake timeout, close timeout) live here and may
    /// push updates of their own.
    fn before_stream_select(&mut self, now: Instant, updates: &mut UpdateQueue);

    /// The stream became readable
    fn handle_read(&mut self, updates: &mut UpdateQueue);

    /// The stream became writable
    fn handle_write(&mut self, updates: &mut UpdateQueue);

    /// The stream reported an exceptional condition
    fn handle_exceptional(&mut self, updates: &mut UpdateQueue);
}

/// A host-owned table of containers the multiplexer can iterate and index
///
/// Splitting iteration from token lookup keeps the multiplexer independent
/// of how the host stores its containers (the server keeps an optional
/// listener plus an ordered map of connections).
pub trait ContainerSet {
    /// Visit every container once, in token order
    fn for_each(&mut self, f: &mut dyn FnMut(&mut dyn StreamContainer));

    /// Look up the container owning `token`
    fn get_mut(&mut self, token: Token) -> Option<&mut dyn StreamContainer>;
}
