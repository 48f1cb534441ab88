//! Per-connection protocol state machine
//!
//! A [`Connection`] owns one non-blocking stream and drives a single
//! session through its lifecycle: handshake, open, closing, closed. It
//! feeds inbound bytes to the frame parser, assembles fragmented messages,
//! answers control frames, and maintains the outbound queue with
//! control-frame priority and a partial-write cursor. All I/O happens in
//! bounded per-tick chunks so one busy session cannot starve the rest of
//! the loop.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::Instant;

use bytes::{Buf, Bytes, BytesMut};
use mio::event::Source;
use mio::{Interest, Registry, Token};
use tracing::{debug, trace, warn};

use crate::container::StreamContainer;
use crate::error::{CloseReason, Error, Result};
use crate::frame::{encode_frame, Frame, FrameParser, OpCode};
use crate::handshake;
use crate::update::{ConnectionId, ReadKind, Update, UpdateQueue, WriteKind};
use crate::utf8::{validate_utf8, validate_utf8_partial};
use crate::{Config, MAX_HANDSHAKE_SIZE};

/// A non-blocking byte-duplex stream a connection can own
#[derive(Debug)]
pub enum NetStream {
    /// TCP stream (plain, or carrying a host-attached TLS record layer)
    Tcp(mio::net::TcpStream),
    /// Unix-domain stream socket
    Unix(mio::net::UnixStream),
}

impl Read for NetStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            NetStream::Tcp(s) => s.read(buf),
            NetStream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for NetStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            NetStream::Tcp(s) => s.write(buf),
            NetStream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            NetStream::Tcp(s) => s.flush(),
            NetStream::Unix(s) => s.flush(),
        }
    }
}

impl Source for NetStream {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            NetStream::Tcp(s) => s.register(registry, token, interests),
            NetStream::Unix(s) => s.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            NetStream::Tcp(s) => s.reregister(registry, token, interests),
            NetStream::Unix(s) => s.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            NetStream::Tcp(s) => s.deregister(registry),
            NetStream::Unix(s) => s.deregister(registry),
        }
    }
}

impl From<mio::net::TcpStream> for NetStream {
    fn from(s: mio::net::TcpStream) -> Self {
        NetStream::Tcp(s)
    }
}

impl From<mio::net::UnixStream> for NetStream {
    fn from(s: mio::net::UnixStream) -> Self {
        NetStream::Unix(s)
    }
}

/// A complete inbound message, assembled from one or more frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Text message (UTF-8 validated)
    Text(Bytes),
    /// Binary message
    Binary(Bytes),
}

impl Message {
    /// Message payload bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Text(b) | Message::Binary(b) => b,
        }
    }

    /// Text payload; `None` for binary messages
    #[inline]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            // Validated on arrival
            Message::Text(b) => Some(unsafe { std::str::from_utf8_unchecked(b) }),
            Message::Binary(_) => None,
        }
    }

    /// The opcode the message arrived under
    #[inline]
    pub fn opcode(&self) -> OpCode {
        match self {
            Message::Text(_) => OpCode::Text,
            Message::Binary(_) => OpCode::Binary,
        }
    }
}

/// Session lifecycle state
///
/// Transitions only ever move forward in this ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for the HTTP upgrade request
    AwaitingHandshake,
    /// Handshake complete, session established
    Open,
    /// We sent (or queued) a Close and await the peer's
    ClosingLocal,
    /// The peer sent a Close; ours is queued behind pending writes
    ClosingRemote,
    /// Session over, stream released
    Closed,
}

/// One queued outbound write: an encoded frame or a raw handshake response
#[derive(Debug)]
struct PendingWrite {
    buf: Bytes,
    offset: usize,
    control: bool,
    close_frame: bool,
}

impl PendingWrite {
    fn frame(opcode: OpCode, payload: &[u8]) -> Self {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, opcode, payload, true, None);
        PendingWrite {
            buf: buf.freeze(),
            offset: 0,
            control: opcode.is_control(),
            close_frame: opcode == OpCode::Close,
        }
    }

    fn raw(buf: Bytes) -> Self {
        PendingWrite {
            buf,
            offset: 0,
            control: true,
            close_frame: false,
        }
    }

    fn started(&self) -> bool {
        self.offset > 0
    }
}

/// One WebSocket session on a non-blocking stream
pub struct Connection {
    id: ConnectionId,
    stream: Option<NetStream>,
    registered: bool,
    state: ConnState,
    read_buf: BytesMut,
    parser: FrameParser,
    write_queue: VecDeque<PendingWrite>,
    fragment_opcode: Option<OpCode>,
    fragment_buf: BytesMut,
    incoming: VecDeque<Message>,
    peer_address: String,
    created_at: Instant,
    handshake_deadline: Instant,
    close_deadline: Option<Instant>,
    close_code_sent: Option<u16>,
    close_code_received: Option<u16>,
    close_sent_flushed: bool,
    close_received: bool,
    shutdown_after_flush: bool,
    protocol: Option<String>,
    config: Config,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        stream: NetStream,
        peer_address: String,
        config: &Config,
    ) -> Self {
        let now = Instant::now();
        Connection {
            id,
            stream: Some(stream),
            registered: false,
            state: ConnState::AwaitingHandshake,
            read_buf: BytesMut::with_capacity(4096),
            parser: FrameParser::new(config.max_frame_size, true),
            write_queue: VecDeque::new(),
            fragment_opcode: None,
            fragment_buf: BytesMut::new(),
            incoming: VecDeque::new(),
            peer_address,
            created_at: now,
            handshake_deadline: now + config.handshake_timeout,
            close_deadline: None,
            close_code_sent: None,
            close_code_received: None,
            close_sent_flushed: false,
            close_received: false,
            shutdown_after_flush: false,
            protocol: None,
            config: config.clone(),
        }
    }

    /// This connection's handle in the owning server's table
    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Current lifecycle state
    #[inline]
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Whether the session is established and not closing
    #[inline]
    pub fn is_open(&self) -> bool {
        self.state == ConnState::Open
    }

    /// Peer address as reported at accept time
    pub fn peer_address(&self) -> &str {
        &self.peer_address
    }

    /// When the connection was accepted
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Sub-protocol echoed during the handshake, if any
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Close code we sent, once a local Close went out
    pub fn close_code_sent(&self) -> Option<u16> {
        self.close_code_sent
    }

    /// Close code the peer sent, once their Close arrived
    pub fn close_code_received(&self) -> Option<u16> {
        self.close_code_received
    }

    /// Take the next completed inbound message, if any
    pub fn recv(&mut self) -> Option<Message> {
        self.incoming.pop_front()
    }

    /// Enqueue an outbound frame
    ///
    /// Control frames jump ahead of queued data frames (but never into a
    /// partially written one). Fails unless the session is open.
    pub fn send(&mut self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        if self.state != ConnState::Open {
            return Err(Error::InvalidState("connection is not open"));
        }
        if opcode == OpCode::Close {
            return Err(Error::InvalidState("use close() to start the close handshake"));
        }
        if opcode.is_control() && payload.len() > 125 {
            return Err(Error::Protocol("control frame too large"));
        }
        if payload.len() > self.config.max_message_size {
            return Err(Error::MessageTooLarge);
        }

        self.enqueue(PendingWrite::frame(opcode, payload));
        Ok(())
    }

    /// Enqueue a text message
    pub fn send_text(&mut self, text: &str) -> Result<()> {
        self.send(OpCode::Text, text.as_bytes())
    }

    /// Enqueue a binary message
    pub fn send_binary(&mut self, data: &[u8]) -> Result<()> {
        self.send(OpCode::Binary, data)
    }

    /// Enqueue a ping
    pub fn send_ping(&mut self, data: &[u8]) -> Result<()> {
        self.send(OpCode::Ping, data)
    }

    /// Start the close handshake
    ///
    /// Queued-but-unstarted data frames are dropped so nothing follows the
    /// Close on the wire. During the handshake phase this is a hard close.
    /// Already-closing connections are left alone.
    pub fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        match self.state {
            ConnState::Open => {
                self.local_close(code, reason);
                Ok(())
            }
            ConnState::AwaitingHandshake => {
                self.hard_close();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Drop the connection immediately: no Close frame, stream released
    ///
    /// On an open session this is a protocol anomaly from the peer's point
    /// of view (it observes an abnormal 1006 closure). Double-close is a
    /// silent no-op.
    pub fn hard_close(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        if self.state == ConnState::Open {
            warn!(conn = %self.id, peer = %self.peer_address, "hard close on open connection");
        }
        self.state = ConnState::Closed;
        self.release_stream();
    }

    // ------------------------------------------------------------------
    // Outbound queue
    // ------------------------------------------------------------------

    fn enqueue(&mut self, write: PendingWrite) {
        if !write.control {
            self.write_queue.push_back(write);
            return;
        }

        // Control frames go ahead of pending data frames, but behind the
        // write in flight and behind earlier control frames.
        let mut at = 0;
        for (i, queued) in self.write_queue.iter().enumerate() {
            if queued.control || (i == 0 && queued.started()) {
                at = i + 1;
            } else {
                break;
            }
        }
        self.write_queue.insert(at, write);
    }

    fn enqueue_close_frame(&mut self, reason: Option<(u16, &str)>) {
        // Drop data frames that have not touched the wire yet; a data frame
        // mid-write has to finish or the stream would be corrupted.
        let mut kept = VecDeque::with_capacity(self.write_queue.len());
        for (i, w) in self.write_queue.drain(..).enumerate() {
            if w.control || (i == 0 && w.started()) {
                kept.push_back(w);
            }
        }
        self.write_queue = kept;

        let write = match reason {
            Some((code, text)) => {
                let mut payload = BytesMut::with_capacity(2 + text.len());
                payload.extend_from_slice(&code.to_be_bytes());
                payload.extend_from_slice(text.as_bytes());
                PendingWrite::frame(OpCode::Close, &payload)
            }
            None => PendingWrite::frame(OpCode::Close, &[]),
        };
        self.enqueue(write);
    }

    fn local_close(&mut self, code: u16, reason: &str) {
        self.enqueue_close_frame(Some((code, reason)));
        self.close_code_sent = Some(code);
        self.state = ConnState::ClosingLocal;
        self.close_deadline = Some(Instant::now() + self.config.close_timeout);
    }

    // ------------------------------------------------------------------
    // State transitions
    // ------------------------------------------------------------------

    fn release_stream(&mut self) {
        // Dropping the stream closes the descriptor and deregisters it.
        self.stream = None;
        self.registered = false;
        self.read_buf.clear();
        self.fragment_buf.clear();
        self.fragment_opcode = None;
        self.write_queue.clear();
    }

    fn finish_close(&mut self, updates: &mut UpdateQueue) {
        if self.state == ConnState::Closed {
            return;
        }
        debug!(
            conn = %self.id,
            sent = ?self.close_code_sent,
            received = ?self.close_code_received,
            "close handshake finished"
        );
        self.state = ConnState::Closed;
        self.release_stream();
        updates.push_back(Update::read(ReadKind::Disconnect, self.id));
    }

    fn sock_disconnect(&mut self, updates: &mut UpdateQueue) {
        if self.state == ConnState::Closed {
            return;
        }
        debug!(conn = %self.id, peer = %self.peer_address, "peer went away");
        self.state = ConnState::Closed;
        self.release_stream();
        updates.push_back(Update::read(ReadKind::SockDisconnect, self.id));
    }

    fn protocol_error(&mut self, err: Error, updates: &mut UpdateQueue) {
        debug!(conn = %self.id, error = %err, "protocol error");
        match self.state {
            ConnState::Open => {
                let code = err.close_code();
                self.local_close(code, "");
            }
            ConnState::AwaitingHandshake => {
                // Bytes before a finished handshake never reach the framer;
                // anything else here means the handshake itself failed.
                self.reject_handshake(400, updates);
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------

    fn reject_handshake(&mut self, status: u16, updates: &mut UpdateQueue) {
        debug!(conn = %self.id, peer = %self.peer_address, status, "handshake rejected");
        updates.push_back(Update::read(ReadKind::HandshakeFailure, self.id));
        let page = handshake::error_page(status, &self.config.server_identifier);
        self.write_queue.clear();
        self.enqueue(PendingWrite::raw(page));
        self.shutdown_after_flush = true;
        self.read_buf.clear();
    }

    fn process_handshake(&mut self, updates: &mut UpdateQueue) {
        if self.shutdown_after_flush {
            return;
        }

        if self.read_buf.len() > MAX_HANDSHAKE_SIZE {
            self.reject_handshake(413, updates);
            return;
        }

        let (response, protocol, consumed) = match handshake::parse_request(&self.read_buf) {
            Ok(None) => return,
            Err(e) => {
                trace!(conn = %self.id, error = %e, "bad upgrade request");
                self.reject_handshake(400, updates);
                return;
            }
            Ok(Some((request, consumed))) => {
                let protocol = request
                    .first_protocol_offer()
                    .filter(|offer| {
                        self.config
                            .protocols
                            .iter()
                            .any(|p| p.eq_ignore_ascii_case(offer))
                    })
                    .map(str::to_owned);
                let accept = handshake::accept_key(request.key);
                let response = handshake::build_response(
                    &accept,
                    protocol.as_deref(),
                    &self.config.server_identifier,
                );
                (response, protocol, consumed)
            }
        };

        self.read_buf.advance(consumed);
        self.enqueue(PendingWrite::raw(response));
        self.protocol = protocol;
        self.state = ConnState::Open;
        debug!(conn = %self.id, peer = %self.peer_address, "handshake complete");
        updates.push_back(Update::read(ReadKind::NewConnection, self.id));
    }

    // ------------------------------------------------------------------
    // Inbound frames
    // ------------------------------------------------------------------

    fn process_input(&mut self, updates: &mut UpdateQueue) {
        if self.state == ConnState::AwaitingHandshake {
            self.process_handshake(updates);
        }

        // Leftover bytes received along with the upgrade request fall
        // straight through to the framer.
        while matches!(
            self.state,
            ConnState::Open | ConnState::ClosingLocal | ConnState::ClosingRemote
        ) {
            match self.parser.parse(&mut self.read_buf) {
                Ok(Some(frame)) => {
                    self.handle_frame(frame, updates);
                    if self.close_received || self.state == ConnState::Closed {
                        self.read_buf.clear();
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.protocol_error(e, updates);
                    break;
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame, updates: &mut UpdateQueue) {
        match frame.header.opcode {
            OpCode::Close => self.handle_close_frame(&frame, updates),
            OpCode::Ping => {
                trace!(conn = %self.id, len = frame.payload.len(), "ping");
                if self.state == ConnState::Open {
                    self.enqueue(PendingWrite::frame(OpCode::Pong, &frame.payload));
                }
            }
            OpCode::Pong => {
                trace!(conn = %self.id, len = frame.payload.len(), "pong");
            }
            OpCode::Text | OpCode::Binary => self.handle_data_frame(frame, updates),
            OpCode::Continuation => self.handle_continuation(frame, updates),
        }
    }

    fn handle_close_frame(&mut self, frame: &Frame, updates: &mut UpdateQueue) {
        self.close_received = true;

        let reason = match frame.parse_close() {
            Ok(reason) => reason,
            Err(e) => {
                // A Close did arrive, however malformed; answer with our
                // own error Close and finish once it flushes.
                self.protocol_error(e, updates);
                return;
            }
        };
        self.close_code_received = reason.as_ref().map(|r| r.code);

        match self.state {
            ConnState::Open => {
                // Echo: 1000 when the peer named a code, empty otherwise.
                match reason {
                    Some(r) => {
                        trace!(conn = %self.id, code = r.code, "peer close");
                        self.enqueue_close_frame(Some((CloseReason::NORMAL, "")));
                        self.close_code_sent = Some(CloseReason::NORMAL);
                    }
                    None => {
                        trace!(conn = %self.id, "peer close without status");
                        self.enqueue_close_frame(None);
                    }
                }
                self.state = ConnState::ClosingRemote;
                self.close_deadline = Some(Instant::now() + self.config.close_timeout);
            }
            ConnState::ClosingLocal => {
                if self.close_sent_flushed {
                    self.finish_close(updates);
                }
                // Otherwise the pending flush completes the handshake.
            }
            _ => {}
        }
    }

    fn handle_data_frame(&mut self, frame: Frame, updates: &mut UpdateQueue) {
        if self.state != ConnState::Open {
            trace!(conn = %self.id, "data frame while closing, dropped");
            return;
        }
        if self.fragment_opcode.is_some() {
            self.protocol_error(Error::Protocol("expected continuation frame"), updates);
            return;
        }

        let opcode = frame.header.opcode;
        if frame.header.fin {
            if opcode == OpCode::Text && !validate_utf8(&frame.payload) {
                self.protocol_error(Error::InvalidUtf8, updates);
                return;
            }
            if frame.payload.len() > self.config.max_message_size {
                self.protocol_error(Error::MessageTooLarge, updates);
                return;
            }
            self.deliver(opcode, frame.payload, updates);
        } else {
            self.fragment_opcode = Some(opcode);
            self.fragment_buf.clear();
            if self.append_fragment(&frame, updates) {
                trace!(conn = %self.id, ?opcode, "fragmented message started");
            }
        }
    }

    fn handle_continuation(&mut self, frame: Frame, updates: &mut UpdateQueue) {
        if self.state != ConnState::Open {
            trace!(conn = %self.id, "continuation while closing, dropped");
            return;
        }
        let Some(opcode) = self.fragment_opcode else {
            self.protocol_error(Error::Protocol("unexpected continuation frame"), updates);
            return;
        };

        if !self.append_fragment(&frame, updates) {
            return;
        }

        if frame.header.fin {
            self.fragment_opcode = None;
            let payload = self.fragment_buf.split().freeze();
            if opcode == OpCode::Text && !validate_utf8(&payload) {
                self.protocol_error(Error::InvalidUtf8, updates);
                return;
            }
            self.deliver(opcode, payload, updates);
        }
    }

    /// Append a fragment payload, enforcing size and incremental UTF-8.
    /// Returns false if the connection errored out.
    fn append_fragment(&mut self, frame: &Frame, updates: &mut UpdateQueue) -> bool {
        if self.fragment_buf.len() + frame.payload.len() > self.config.max_message_size {
            self.fragment_opcode = None;
            self.fragment_buf.clear();
            self.protocol_error(Error::MessageTooLarge, updates);
            return false;
        }

        self.fragment_buf.extend_from_slice(&frame.payload);

        if self.fragment_opcode == Some(OpCode::Text) {
            let (valid, _incomplete) = validate_utf8_partial(&self.fragment_buf);
            if !valid {
                self.fragment_opcode = None;
                self.fragment_buf.clear();
                self.protocol_error(Error::InvalidUtf8, updates);
                return false;
            }
        }
        true
    }

    fn deliver(&mut self, opcode: OpCode, payload: Bytes, updates: &mut UpdateQueue) {
        let kind = if payload.is_empty() {
            ReadKind::ReadEmptyFrame
        } else {
            ReadKind::Read
        };
        let message = match opcode {
            OpCode::Text => Message::Text(payload),
            _ => Message::Binary(payload),
        };
        self.incoming.push_back(message);
        updates.push_back(Update::read(kind, self.id));
    }
}

impl StreamContainer for Connection {
    fn token(&self) -> Token {
        Token(self.id.index())
    }

    fn is_live(&self) -> bool {
        self.stream.is_some()
    }

    fn is_write_buffer_empty(&self) -> bool {
        self.write_queue.is_empty()
    }

    fn update_registration(&mut self, registry: &Registry, interest: Interest) -> io::Result<()> {
        let token = self.token();
        let registered = self.registered;
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        if registered {
            stream.reregister(registry, token, interest)
        } else {
            stream.register(registry, token, interest)?;
            self.registered = true;
            Ok(())
        }
    }

    fn before_stream_select(&mut self, now: Instant, updates: &mut UpdateQueue) {
        if self.state == ConnState::AwaitingHandshake
            && !self.shutdown_after_flush
            && now >= self.handshake_deadline
        {
            debug!(conn = %self.id, peer = %self.peer_address, "handshake deadline exceeded");
            updates.push_back(Update::read(ReadKind::HandshakeTimeout, self.id));
            self.state = ConnState::Closed;
            self.release_stream();
            return;
        }

        if matches!(self.state, ConnState::ClosingLocal | ConnState::ClosingRemote) {
            if let Some(deadline) = self.close_deadline {
                if now >= deadline {
                    debug!(conn = %self.id, "close handshake deadline exceeded");
                    self.finish_close(updates);
                }
            }
        }
    }

    fn handle_read(&mut self, updates: &mut UpdateQueue) {
        if self.stream.is_none() {
            return;
        }

        let mut budget = self.config.tick_byte_budget;
        let mut tmp = [0u8; 4096];
        let mut eof = false;

        while budget > 0 {
            let stream = match self.stream.as_mut() {
                Some(s) => s,
                None => return,
            };
            match stream.read(&mut tmp) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => {
                    self.read_buf.extend_from_slice(&tmp[..n]);
                    budget = budget.saturating_sub(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(conn = %self.id, error = %e, "read failed");
                    updates.push_back(Update::error(crate::update::ErrorKind::ReadFailed));
                    self.sock_disconnect(updates);
                    return;
                }
            }
        }

        self.process_input(updates);

        if eof && self.state != ConnState::Closed {
            match self.state {
                ConnState::ClosingLocal | ConnState::ClosingRemote => {
                    // The peer hung up after (or instead of) its Close;
                    // either way the handshake is over.
                    self.finish_close(updates);
                }
                _ => self.sock_disconnect(updates),
            }
        }
    }

    fn handle_write(&mut self, updates: &mut UpdateQueue) {
        if self.stream.is_none() || self.write_queue.is_empty() {
            return;
        }

        let mut budget = self.config.tick_byte_budget;
        let mut wrote_any = false;

        while budget > 0 {
            let Some(front) = self.write_queue.front_mut() else {
                break;
            };
            let end = front.buf.len().min(front.offset + budget);
            let stream = match self.stream.as_mut() {
                Some(s) => s,
                None => return,
            };
            match stream.write(&front.buf[front.offset..end]) {
                Ok(0) => {
                    updates.push_back(Update::write(WriteKind::WriteFailed, self.id));
                    self.sock_disconnect(updates);
                    return;
                }
                Ok(n) => {
                    front.offset += n;
                    budget -= n;
                    wrote_any = true;
                    if front.offset == front.buf.len() {
                        if let Some(done) = self.write_queue.pop_front() {
                            if done.close_frame {
                                self.close_sent_flushed = true;
                            }
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(conn = %self.id, error = %e, "write failed");
                    updates.push_back(Update::write(WriteKind::WriteFailed, self.id));
                    self.sock_disconnect(updates);
                    return;
                }
            }
        }

        if self.write_queue.is_empty() {
            if wrote_any {
                updates.push_back(Update::write(WriteKind::WriteCompleted, self.id));
            }
            if self.shutdown_after_flush {
                // Rejection page delivered; the failure update went out when
                // the page was queued.
                self.state = ConnState::Closed;
                self.release_stream();
            } else if self.close_sent_flushed
                && (self.state == ConnState::ClosingRemote
                    || (self.state == ConnState::ClosingLocal && self.close_received))
            {
                self.finish_close(updates);
            }
        }
    }

    fn handle_exceptional(&mut self, updates: &mut UpdateQueue) {
        if self.stream.is_none() {
            return;
        }
        debug!(conn = %self.id, peer = %self.peer_address, "exceptional condition on stream");
        match self.state {
            ConnState::ClosingLocal | ConnState::ClosingRemote => self.finish_close(updates),
            _ => self.sock_disconnect(updates),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::ErrorKind;
    use std::time::Duration;

    fn test_conn() -> (Connection, UpdateQueue) {
        let config = Config::default();
        let conn = Connection {
            id: ConnectionId(1),
            stream: None,
            registered: false,
            state: ConnState::Open,
            read_buf: BytesMut::new(),
            parser: FrameParser::new(config.max_frame_size, true),
            write_queue: VecDeque::new(),
            fragment_opcode: None,
            fragment_buf: BytesMut::new(),
            incoming: VecDeque::new(),
            peer_address: "test:0".to_string(),
            created_at: Instant::now(),
            handshake_deadline: Instant::now() + config.handshake_timeout,
            close_deadline: None,
            close_code_sent: None,
            close_code_received: None,
            close_sent_flushed: false,
            close_received: false,
            shutdown_after_flush: false,
            protocol: None,
            config,
        };
        (conn, UpdateQueue::new())
    }

    fn queued_opcodes(conn: &Connection) -> Vec<u8> {
        conn.write_queue.iter().map(|w| w.buf[0] & 0x0F).collect()
    }

    #[test]
    fn test_control_frames_jump_data() {
        let (mut conn, _q) = test_conn();
        conn.send_binary(b"one").unwrap();
        conn.send_binary(b"two").unwrap();
        conn.send_ping(b"p").unwrap();

        assert_eq!(queued_opcodes(&conn), vec![0x9, 0x2, 0x2]);
    }

    #[test]
    fn test_control_does_not_split_partial_write() {
        let (mut conn, _q) = test_conn();
        conn.send_binary(b"started").unwrap();
        conn.write_queue.front_mut().unwrap().offset = 3;
        conn.send_binary(b"queued").unwrap();
        conn.send_ping(b"p").unwrap();

        // The in-flight data frame stays first; the ping lands behind it.
        assert_eq!(queued_opcodes(&conn), vec![0x2, 0x9, 0x2]);
    }

    #[test]
    fn test_controls_keep_fifo_order() {
        let (mut conn, _q) = test_conn();
        conn.send_binary(b"data").unwrap();
        conn.send_ping(b"1").unwrap();
        conn.send_ping(b"2").unwrap();

        let pings: Vec<&PendingWrite> =
            conn.write_queue.iter().filter(|w| w.control).collect();
        assert_eq!(pings[0].buf.last(), Some(&b'1'));
        assert_eq!(pings[1].buf.last(), Some(&b'2'));
    }

    #[test]
    fn test_local_close_drops_unstarted_data() {
        let (mut conn, _q) = test_conn();
        conn.send_binary(b"started").unwrap();
        conn.write_queue.front_mut().unwrap().offset = 2;
        conn.send_binary(b"never sent").unwrap();
        conn.close(1000, "bye").unwrap();

        assert_eq!(conn.state(), ConnState::ClosingLocal);
        assert_eq!(conn.close_code_sent(), Some(1000));
        // Partial data frame, then the Close; the unstarted frame is gone.
        assert_eq!(queued_opcodes(&conn), vec![0x2, 0x8]);
    }

    #[test]
    fn test_send_requires_open() {
        let (mut conn, _q) = test_conn();
        conn.close(1000, "").unwrap();
        assert!(matches!(
            conn.send_text("late"),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_fragmented_message_assembly() {
        let (mut conn, mut q) = test_conn();

        conn.handle_frame(Frame::new(OpCode::Binary, Bytes::from_static(b"abc"), false), &mut q);
        assert!(q.is_empty());
        conn.handle_frame(
            Frame::new(OpCode::Continuation, Bytes::from_static(b"def"), false),
            &mut q,
        );
        conn.handle_frame(
            Frame::new(OpCode::Continuation, Bytes::from_static(b"ghi"), true),
            &mut q,
        );

        assert_eq!(
            q.pop_front(),
            Some(Update::read(ReadKind::Read, ConnectionId(1)))
        );
        assert_eq!(
            conn.recv(),
            Some(Message::Binary(Bytes::from_static(b"abcdefghi")))
        );
        assert!(conn.fragment_opcode.is_none());
        assert!(conn.fragment_buf.is_empty());
    }

    #[test]
    fn test_ping_mid_fragment_keeps_assembly() {
        let (mut conn, mut q) = test_conn();

        conn.handle_frame(Frame::new(OpCode::Text, Bytes::from_static(b"hel"), false), &mut q);
        conn.handle_frame(Frame::ping(Bytes::from_static(b"p")), &mut q);

        // Pong queued ahead of everything, fragment state untouched.
        assert_eq!(queued_opcodes(&conn), vec![0xA]);
        assert_eq!(conn.fragment_opcode, Some(OpCode::Text));

        conn.handle_frame(
            Frame::new(OpCode::Continuation, Bytes::from_static(b"lo"), true),
            &mut q,
        );
        assert_eq!(conn.recv(), Some(Message::Text(Bytes::from_static(b"hello"))));
    }

    #[test]
    fn test_new_data_mid_fragment_is_error() {
        let (mut conn, mut q) = test_conn();
        conn.handle_frame(Frame::new(OpCode::Binary, Bytes::from_static(b"a"), false), &mut q);
        conn.handle_frame(Frame::new(OpCode::Binary, Bytes::from_static(b"b"), true), &mut q);

        assert_eq!(conn.state(), ConnState::ClosingLocal);
        assert_eq!(conn.close_code_sent(), Some(1002));
    }

    #[test]
    fn test_stray_continuation_is_error() {
        let (mut conn, mut q) = test_conn();
        conn.handle_frame(
            Frame::new(OpCode::Continuation, Bytes::from_static(b"x"), true),
            &mut q,
        );
        assert_eq!(conn.state(), ConnState::ClosingLocal);
        assert_eq!(conn.close_code_sent(), Some(1002));
    }

    #[test]
    fn test_invalid_utf8_closes_1007() {
        let (mut conn, mut q) = test_conn();
        conn.handle_frame(
            Frame::new(OpCode::Text, Bytes::from_static(&[0xFF, 0xFE]), true),
            &mut q,
        );
        assert_eq!(conn.state(), ConnState::ClosingLocal);
        assert_eq!(conn.close_code_sent(), Some(1007));
        assert!(conn.recv().is_none());
    }

    #[test]
    fn test_invalid_utf8_fragment_fails_early() {
        let (mut conn, mut q) = test_conn();
        conn.handle_frame(
            Frame::new(OpCode::Text, Bytes::from_static(&[0xC2, 0x20]), false),
            &mut q,
        );
        assert_eq!(conn.close_code_sent(), Some(1007));
    }

    #[test]
    fn test_empty_message_reports_empty_frame() {
        let (mut conn, mut q) = test_conn();
        conn.handle_frame(Frame::new(OpCode::Text, Bytes::new(), true), &mut q);
        assert_eq!(
            q.pop_front(),
            Some(Update::read(ReadKind::ReadEmptyFrame, ConnectionId(1)))
        );
        assert_eq!(conn.recv(), Some(Message::Text(Bytes::new())));
    }

    #[test]
    fn test_peer_close_with_code_echoes_1000() {
        let (mut conn, mut q) = test_conn();
        conn.handle_frame(Frame::close(1001, "going away"), &mut q);

        assert_eq!(conn.state(), ConnState::ClosingRemote);
        assert_eq!(conn.close_code_received(), Some(1001));
        assert_eq!(conn.close_code_sent(), Some(1000));
        assert_eq!(queued_opcodes(&conn), vec![0x8]);
    }

    #[test]
    fn test_peer_close_empty_echoes_empty() {
        let (mut conn, mut q) = test_conn();
        conn.handle_frame(Frame::close_empty(), &mut q);

        assert_eq!(conn.state(), ConnState::ClosingRemote);
        assert_eq!(conn.close_code_received(), None);
        assert_eq!(conn.close_code_sent(), None);
        // An empty Close is two header bytes, no payload.
        assert_eq!(conn.write_queue.front().unwrap().buf.to_vec(), vec![0x88, 0x00]);
    }

    #[test]
    fn test_peer_close_invalid_code_answers_1002() {
        let (mut conn, mut q) = test_conn();
        conn.handle_frame(Frame::close(1005, ""), &mut q);

        assert_eq!(conn.state(), ConnState::ClosingLocal);
        assert_eq!(conn.close_code_sent(), Some(1002));
        assert!(conn.close_received);
    }

    #[test]
    fn test_message_too_large_closes_1009() {
        let (mut conn, mut q) = test_conn();
        conn.config.max_message_size = 8;
        conn.handle_frame(Frame::new(OpCode::Binary, Bytes::from_static(b"12345"), false), &mut q);
        conn.handle_frame(
            Frame::new(OpCode::Continuation, Bytes::from_static(b"67890"), false),
            &mut q,
        );
        assert_eq!(conn.close_code_sent(), Some(1009));
    }

    #[test]
    fn test_hard_close_is_idempotent() {
        let (mut conn, _q) = test_conn();
        conn.hard_close();
        assert_eq!(conn.state(), ConnState::Closed);
        assert!(!conn.is_live());
        conn.hard_close();
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[test]
    fn test_closed_connection_has_drained_buffers() {
        let (mut conn, mut q) = test_conn();
        conn.send_binary(b"pending").unwrap();
        conn.handle_frame(Frame::new(OpCode::Binary, Bytes::from_static(b"frag"), false), &mut q);
        conn.hard_close();

        assert!(conn.write_queue.is_empty());
        assert!(conn.fragment_buf.is_empty());
        assert!(conn.read_buf.is_empty());
    }

    #[test]
    fn test_handshake_timeout_update() {
        let (mut conn, mut q) = test_conn();
        conn.state = ConnState::AwaitingHandshake;
        conn.handshake_deadline = Instant::now() - Duration::from_secs(1);

        conn.before_stream_select(Instant::now(), &mut q);
        assert_eq!(
            q.pop_front(),
            Some(Update::read(ReadKind::HandshakeTimeout, ConnectionId(1)))
        );
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[test]
    fn test_close_deadline_forces_disconnect() {
        let (mut conn, mut q) = test_conn();
        conn.close(1000, "").unwrap();
        conn.close_deadline = Some(Instant::now() - Duration::from_secs(1));

        conn.before_stream_select(Instant::now(), &mut q);
        assert_eq!(
            q.pop_front(),
            Some(Update::read(ReadKind::Disconnect, ConnectionId(1)))
        );
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[test]
    fn test_handshake_over_buffer() {
        let (mut conn, mut q) = test_conn();
        conn.state = ConnState::AwaitingHandshake;
        conn.read_buf.extend_from_slice(
            b"GET /chat HTTP/1.1\r\n\
              Host: localhost\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        );
        conn.process_input(&mut q);

        assert_eq!(conn.state(), ConnState::Open);
        assert_eq!(
            q.pop_front(),
            Some(Update::read(ReadKind::NewConnection, ConnectionId(1)))
        );
        let response = &conn.write_queue.front().unwrap().buf;
        let text = std::str::from_utf8(response).unwrap();
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    }

    #[test]
    fn test_handshake_leftover_frames_processed() {
        let (mut conn, mut q) = test_conn();
        conn.state = ConnState::AwaitingHandshake;
        conn.read_buf.extend_from_slice(
            b"GET / HTTP/1.1\r\n\
              Host: localhost\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        );
        // A masked text frame pipelined right behind the upgrade.
        let mut wire = BytesMut::new();
        encode_frame(&mut wire, OpCode::Text, b"early", true, Some([1, 2, 3, 4]));
        conn.read_buf.extend_from_slice(&wire);

        conn.process_input(&mut q);
        assert_eq!(conn.state(), ConnState::Open);
        assert_eq!(
            conn.recv(),
            Some(Message::Text(Bytes::from_static(b"early")))
        );
    }

    #[test]
    fn test_bad_handshake_rejected_with_page() {
        let (mut conn, mut q) = test_conn();
        conn.state = ConnState::AwaitingHandshake;
        conn.read_buf
            .extend_from_slice(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        conn.process_input(&mut q);

        assert_eq!(
            q.pop_front(),
            Some(Update::read(ReadKind::HandshakeFailure, ConnectionId(1)))
        );
        assert!(conn.shutdown_after_flush);
        let page = &conn.write_queue.front().unwrap().buf;
        assert!(page.starts_with(b"HTTP/1.1 400"));
    }

    #[test]
    fn test_oversized_handshake_rejected_413() {
        let (mut conn, mut q) = test_conn();
        conn.state = ConnState::AwaitingHandshake;
        conn.read_buf.extend_from_slice(&vec![b'x'; 9000]);
        conn.process_input(&mut q);

        assert_eq!(
            q.pop_front(),
            Some(Update::read(ReadKind::HandshakeFailure, ConnectionId(1)))
        );
        let page = &conn.write_queue.front().unwrap().buf;
        assert!(page.starts_with(b"HTTP/1.1 413"));
    }

    #[test]
    fn test_error_kind_exported() {
        // ReadFailed is what handle_read pushes ahead of SOCK_DISCONNECT.
        assert_ne!(ErrorKind::ReadFailed, ErrorKind::SelectFailed);
    }
}
