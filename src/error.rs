//! Error types for the WebSocket endpoint

use std::fmt;
use std::io;

/// Result type alias for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

/// WebSocket error types
///
/// Variants fall into the four families the endpoint distinguishes:
/// initialization errors (fatal to a [`Server`](crate::server::Server)),
/// protocol errors (per-connection, answered with a Close frame), transport
/// errors (per-stream I/O), and usage errors (programmer mistakes, not
/// recoverable).
#[derive(Debug)]
pub enum Error {
    /// I/O error from the underlying stream
    Io(io::Error),
    /// Failed to bind the listening endpoint
    Bind(io::Error),
    /// Address string could not be parsed or is unsupported for binding
    BadAddress(String),
    /// Invalid WebSocket frame
    InvalidFrame(&'static str),
    /// Invalid UTF-8 in a text message or close reason
    InvalidUtf8,
    /// Protocol violation
    Protocol(&'static str),
    /// Connection closed normally
    ConnectionClosed,
    /// Message too large
    MessageTooLarge,
    /// Frame too large
    FrameTooLarge,
    /// Invalid HTTP in the upgrade handshake
    InvalidHttp(&'static str),
    /// Handshake failed
    HandshakeFailed(&'static str),
    /// Would block (non-blocking I/O)
    WouldBlock,
    /// Connection reset by peer
    ConnectionReset,
    /// Invalid close code on the wire
    InvalidCloseCode(u16),
    /// Usage error: the operation is not valid in the current state
    InvalidState(&'static str),
}

impl Error {
    /// The close code a peer is sent when this error aborts a connection
    pub fn close_code(&self) -> u16 {
        match self {
            Error::InvalidUtf8 => CloseReason::INVALID_PAYLOAD,
            Error::MessageTooLarge | Error::FrameTooLarge => CloseReason::TOO_BIG,
            _ => CloseReason::PROTOCOL_ERROR,
        }
    }
}

/// Close frame reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: u16,
    /// Optional reason string
    pub reason: String,
}

impl CloseReason {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (e.g., server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data
    pub const UNSUPPORTED: u16 = 1003;
    /// No status received (never valid on the wire)
    pub const NO_STATUS: u16 = 1005;
    /// Abnormal closure (never valid on the wire)
    pub const ABNORMAL: u16 = 1006;
    /// Invalid frame payload
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Policy violation
    pub const POLICY: u16 = 1008;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
    /// Mandatory extension
    pub const EXTENSION: u16 = 1010;
    /// Internal server error
    pub const INTERNAL: u16 = 1011;
    /// TLS handshake failure (never valid on the wire)
    pub const TLS_FAILURE: u16 = 1015;

    /// Create a new close reason
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Check if a close code may appear in a Close frame payload
    ///
    /// 1000-1003, 1007-1011 and the application range 3000-4999 are valid.
    /// 1005, 1006 and 1015 are reserved for local reporting and must never
    /// arrive on the wire; everything else is invalid outright.
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Bind(e) => write!(f, "failed to bind listener: {}", e),
            Error::BadAddress(addr) => write!(f, "bad address: {}", addr),
            Error::InvalidFrame(msg) => write!(f, "invalid frame: {}", msg),
            Error::InvalidUtf8 => write!(f, "invalid UTF-8 in text payload"),
            Error::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Error::ConnectionClosed => write!(f, "connection closed"),
            Error::MessageTooLarge => write!(f, "message too large"),
            Error::FrameTooLarge => write!(f, "frame too large"),
            Error::InvalidHttp(msg) => write!(f, "invalid HTTP: {}", msg),
            Error::HandshakeFailed(msg) => write!(f, "handshake failed: {}", msg),
            Error::WouldBlock => write!(f, "would block"),
            Error::ConnectionReset => write!(f, "connection reset by peer"),
            Error::InvalidCloseCode(code) => write!(f, "invalid close code: {}", code),
            Error::InvalidState(msg) => write!(f, "invalid state: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) | Error::Bind(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock => Error::WouldBlock,
            io::ErrorKind::ConnectionReset => Error::ConnectionReset,
            io::ErrorKind::BrokenPipe => Error::ConnectionClosed,
            io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            _ => Error::Io(e),
        }
    }
}
