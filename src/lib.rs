//! # wsmux: readiness-driven WebSocket endpoint
//!
//! A server-side WebSocket library that performs RFC 6455 opening
//! handshakes over incoming byte streams and multiplexes many concurrent
//! sessions through a single-threaded, readiness-driven event loop.
//!
//! ## Architecture
//!
//! - **Framer** ([`frame`]): encodes and parses RFC 6455 frames with
//!   payload-length validation, masking and control-frame rules.
//! - **Connection** ([`connection`]): one session's state machine:
//!   handshake, fragmentation assembly, control-frame interleaving,
//!   partial writes with control-frame priority, and the close handshake.
//! - **Multiplexer** ([`multiplexer`]): a single readiness wait per tick
//!   over every stream container, dispatching reads, then writes, then
//!   exceptional conditions.
//! - **Server** ([`server`]): owns the accepting endpoint and the
//!   connection table, and surfaces the loop to the host as a sequence of
//!   [`update::Update`] events.
//!
//! The loop never blocks on user code: the only suspension point is the
//! readiness wait, bounded by the caller-supplied timeout.
//!
//! ## Example
//!
//! ```ignore
//! use std::time::Duration;
//! use wsmux::prelude::*;
//!
//! let mut server = Server::bind("tcp://127.0.0.1:9001", Config::default())?;
//! loop {
//!     let updates: Vec<Update> = server.update(Some(Duration::from_millis(100))).collect();
//!     for update in updates {
//!         if let Update::Read { kind: ReadKind::Read, conn } = update {
//!             if let Some(connection) = server.connection(conn) {
//!                 while let Some(message) = connection.recv() {
//!                     connection.send(message.opcode(), message.as_bytes())?; // echo
//!                 }
//!             }
//!         }
//!     }
//! }
//! ```

pub mod addr;
pub mod client;
pub mod connection;
pub mod container;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod listener;
pub mod mask;
pub mod multiplexer;
pub mod server;
pub mod update;
pub mod utf8;

mod rng;

pub use connection::{ConnState, Connection, Message, NetStream};
pub use error::{CloseReason, Error, Result};
pub use frame::{Frame, OpCode};
pub use server::{Server, Updates};
pub use update::{ConnectionId, ErrorKind, ReadKind, Update, WriteKind};

use std::time::Duration;

/// WebSocket GUID for the handshake accept token (RFC 6455 §1.3)
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Handshake byte cap: upgrade requests larger than this are rejected
/// with a 413 page
pub const MAX_HANDSHAKE_SIZE: usize = 8192;

/// Largest payload encodable with a 1-byte length
pub const SMALL_PAYLOAD_THRESHOLD: usize = 125;

/// Largest payload encodable with a 2-byte extended length
pub const MEDIUM_PAYLOAD_THRESHOLD: usize = 65535;

/// Default per-tick byte budget per direction per connection
pub const DEFAULT_TICK_BYTE_BUDGET: usize = 16 * 1024;

/// Configuration for a [`Server`] and its connections
///
/// # Example
///
/// ```
/// use wsmux::Config;
/// use std::time::Duration;
///
/// let config = Config::builder()
///     .max_message_size(16 * 1024 * 1024)
///     .handshake_timeout(Duration::from_secs(5))
///     .auto_accept(true)
///     .server_identifier("example/1.0")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum assembled message size (default: 64 MiB)
    pub max_message_size: usize,
    /// Maximum single-frame payload size (default: 16 MiB)
    pub max_frame_size: usize,
    /// Bytes read/written per connection per tick (default: 16 KiB)
    pub tick_byte_budget: usize,
    /// Deadline for completing the opening handshake (default: 5 s)
    pub handshake_timeout: Duration,
    /// Deadline for completing the close handshake (default: 5 s)
    pub close_timeout: Duration,
    /// How long a ready connection may wait under manual accept
    /// (default: 5 s)
    pub accept_timeout: Duration,
    /// Accept new transport connections inline (default: true); when off,
    /// the host accepts explicitly after `NEW_TCP_CONNECTION_AVAILABLE`
    pub auto_accept: bool,
    /// Whether TLS credentials are configured; selects the `tls://:443`
    /// default for bare addresses (default: false)
    pub use_crypto: bool,
    /// Identifier sent in the `Server:` header and error pages
    pub server_identifier: String,
    /// Sub-protocols the endpoint will echo when offered
    pub protocols: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024 * 1024,
            max_frame_size: 16 * 1024 * 1024,
            tick_byte_budget: DEFAULT_TICK_BYTE_BUDGET,
            handshake_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(5),
            accept_timeout: Duration::from_secs(5),
            auto_accept: true,
            use_crypto: false,
            server_identifier: concat!("wsmux/", env!("CARGO_PKG_VERSION")).to_string(),
            protocols: Vec::new(),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Builder for [`Config`]
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set the maximum assembled message size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Set the maximum single-frame payload size
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set the per-tick byte budget per direction
    pub fn tick_byte_budget(mut self, bytes: usize) -> Self {
        self.config.tick_byte_budget = bytes;
        self
    }

    /// Set the opening-handshake deadline
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set the close-handshake deadline
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout = timeout;
        self
    }

    /// Set the manual-accept deadline
    pub fn accept_timeout(mut self, timeout: Duration) -> Self {
        self.config.accept_timeout = timeout;
        self
    }

    /// Enable or disable inline accepts
    pub fn auto_accept(mut self, enabled: bool) -> Self {
        self.config.auto_accept = enabled;
        self
    }

    /// Mark TLS credentials as configured
    pub fn use_crypto(mut self, enabled: bool) -> Self {
        self.config.use_crypto = enabled;
        self
    }

    /// Set the server identifier
    pub fn server_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.config.server_identifier = identifier.into();
        self
    }

    /// Add a sub-protocol the endpoint will echo when offered
    pub fn protocol(mut self, name: impl Into<String>) -> Self {
        self.config.protocols.push(name.into());
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::connection::{ConnState, Connection, Message};
    pub use crate::error::{CloseReason, Error, Result};
    pub use crate::frame::{Frame, OpCode};
    pub use crate::server::Server;
    pub use crate::update::{ConnectionId, ReadKind, Update, WriteKind};
    pub use crate::Config;
}
