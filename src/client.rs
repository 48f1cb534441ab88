//! Embedded WebSocket client
//!
//! A small blocking client used as the test peer for the server. The
//! handshake is split in two phases ([`Client::connect`] sends the upgrade
//! request, [`Client::finish_handshake`] reads the 101) so a single thread
//! can interleave client steps with server ticks. Frames can be sent at
//! frame granularity (for fragmentation and interleaving tests) or as raw
//! bytes (for protocol-violation tests).

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use bytes::{Buf, BytesMut};

use crate::error::{Error, Result};
use crate::frame::{encode_frame, Frame, FrameParser, OpCode};
use crate::handshake;
use crate::mask::generate_mask;

/// Default blocking-read timeout so a misbehaving server fails the test
/// instead of hanging it
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Blocking WebSocket client peer
pub struct Client {
    stream: TcpStream,
    key: String,
    read_buf: BytesMut,
    parser: FrameParser,
    handshake_done: bool,
}

impl Client {
    /// Connect and send the upgrade request
    ///
    /// The handshake is not complete until [`Client::finish_handshake`]
    /// has read the server's 101 response.
    pub fn connect(addr: SocketAddr, path: &str) -> Result<Client> {
        let stream = TcpStream::connect(addr).map_err(Error::Io)?;
        stream.set_nodelay(true).ok();
        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(Error::Io)?;

        let key = handshake::generate_key();
        let request = handshake::build_request(&addr.to_string(), path, &key, None);
        let mut client = Client {
            stream,
            key,
            read_buf: BytesMut::with_capacity(4096),
            parser: FrameParser::new(16 * 1024 * 1024, false),
            handshake_done: false,
        };
        client.stream.write_all(&request).map_err(Error::Io)?;
        Ok(client)
    }

    /// Connect with a caller-supplied key (for fixed-vector tests)
    pub fn connect_with_key(addr: SocketAddr, path: &str, key: &str) -> Result<Client> {
        let stream = TcpStream::connect(addr).map_err(Error::Io)?;
        stream.set_nodelay(true).ok();
        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(Error::Io)?;

        let request = handshake::build_request(&addr.to_string(), path, key, None);
        let mut client = Client {
            stream,
            key: key.to_string(),
            read_buf: BytesMut::with_capacity(4096),
            parser: FrameParser::new(16 * 1024 * 1024, false),
            handshake_done: false,
        };
        client.stream.write_all(&request).map_err(Error::Io)?;
        Ok(client)
    }

    /// Connect without sending any upgrade request (timeout tests)
    pub fn connect_silent(addr: SocketAddr) -> Result<Client> {
        let stream = TcpStream::connect(addr).map_err(Error::Io)?;
        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(Error::Io)?;
        Ok(Client {
            stream,
            key: String::new(),
            read_buf: BytesMut::with_capacity(4096),
            parser: FrameParser::new(16 * 1024 * 1024, false),
            handshake_done: false,
        })
    }

    /// Read and validate the server's 101 response
    pub fn finish_handshake(&mut self) -> Result<()> {
        loop {
            let consumed = match handshake::parse_response(&self.read_buf)? {
                Some((response, consumed)) => {
                    let accept = response
                        .accept
                        .ok_or(Error::HandshakeFailed("missing Sec-WebSocket-Accept"))?;
                    if !handshake::validate_accept_key(&self.key, accept) {
                        return Err(Error::HandshakeFailed("invalid Sec-WebSocket-Accept"));
                    }
                    Some(consumed)
                }
                None => None,
            };

            match consumed {
                Some(consumed) => {
                    self.read_buf.advance(consumed);
                    self.handshake_done = true;
                    return Ok(());
                }
                None => {
                    self.fill()?;
                }
            }
        }
    }

    /// Whether the 101 response has been read and validated
    pub fn is_established(&self) -> bool {
        self.handshake_done
    }

    /// The raw accept header from the 101 response, for vector checks
    pub fn read_raw_response(&mut self) -> Result<String> {
        loop {
            if let Some(end) = find_header_end(&self.read_buf) {
                let head = self.read_buf.split_to(end);
                return Ok(String::from_utf8_lossy(&head).into_owned());
            }
            self.fill()?;
        }
    }

    /// Send one frame, masked as clients must
    pub fn send_frame(&mut self, opcode: OpCode, payload: &[u8], fin: bool) -> Result<()> {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, opcode, payload, fin, Some(generate_mask()));
        self.stream.write_all(&buf).map_err(Error::Io)
    }

    /// Send a complete text message
    pub fn send_text(&mut self, text: &str) -> Result<()> {
        self.send_frame(OpCode::Text, text.as_bytes(), true)
    }

    /// Send a complete binary message
    pub fn send_binary(&mut self, data: &[u8]) -> Result<()> {
        self.send_frame(OpCode::Binary, data, true)
    }

    /// Send a Close frame with a code and reason
    pub fn send_close(&mut self, code: u16, reason: &str) -> Result<()> {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        self.send_frame(OpCode::Close, &payload, true)
    }

    /// Send arbitrary bytes down the stream
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).map_err(Error::Io)
    }

    /// Receive the next frame from the server
    pub fn recv_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.parser.parse(&mut self.read_buf)? {
                return Ok(frame);
            }
            self.fill()?;
        }
    }

    /// Shut down the write side, signalling EOF to the server
    pub fn shutdown(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Write);
    }

    fn fill(&mut self) -> Result<()> {
        let mut tmp = [0u8; 4096];
        let n = self.stream.read(&mut tmp).map_err(Error::from)?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        self.read_buf.extend_from_slice(&tmp[..n]);
        Ok(())
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}
