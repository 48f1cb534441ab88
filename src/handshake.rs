//! WebSocket opening handshake
//!
//! HTTP/1.1 upgrade parsing and response building for the server side, the
//! request half used by the embedded client peer, and the templated HTTP
//! error pages sent for rejected handshakes.

use std::fmt::Write as _;

use base64::Engine;
use bytes::Bytes;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::rng;
use crate::{MAX_HANDSHAKE_SIZE, WS_GUID};

/// WebSocket handshake request (server-side view)
#[derive(Debug)]
pub struct HandshakeRequest<'a> {
    /// The request path
    pub path: &'a str,
    /// The Host header
    pub host: Option<&'a str>,
    /// The Sec-WebSocket-Key header
    pub key: &'a str,
    /// The Sec-WebSocket-Protocol header (optional, comma-separated offers)
    pub protocol: Option<&'a str>,
    /// The Origin header (optional)
    pub origin: Option<&'a str>,
}

impl HandshakeRequest<'_> {
    /// First sub-protocol token the client offered, if any
    pub fn first_protocol_offer(&self) -> Option<&str> {
        self.protocol
            .and_then(|p| p.split(',').next())
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }
}

/// First occurrence of `name` among the parsed headers, as UTF-8
fn header_value<'a>(headers: &[httparse::Header<'a>], name: &str) -> Result<Option<&'a str>> {
    for header in headers {
        if header.name.eq_ignore_ascii_case(name) {
            let value = std::str::from_utf8(header.value)
                .map_err(|_| Error::InvalidHttp("header value is not UTF-8"))?;
            return Ok(Some(value));
        }
    }
    Ok(None)
}

/// Whether a comma-separated header value names `token` (case-insensitive)
fn token_list_contains(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

/// A Sec-WebSocket-Key must be base64 over exactly 16 nonce bytes
fn key_is_nonce(key: &str) -> bool {
    matches!(
        base64::engine::general_purpose::STANDARD.decode(key.trim()),
        Ok(nonce) if nonce.len() == 16
    )
}

/// Parse a WebSocket upgrade request
///
/// Returns the parsed request and the number of bytes consumed, or `None`
/// while the request is still incomplete. Headers are matched
/// case-insensitively; the required set is `Upgrade: websocket`, a
/// `Connection` header containing `Upgrade`, `Sec-WebSocket-Version: 13`
/// and a `Sec-WebSocket-Key` that decodes to 16 bytes.
pub fn parse_request(buf: &[u8]) -> Result<Option<(HandshakeRequest<'_>, usize)>> {
    if buf.len() > MAX_HANDSHAKE_SIZE {
        return Err(Error::InvalidHttp("request exceeds the header cap"));
    }

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    let len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(_) => return Err(Error::InvalidHttp("malformed HTTP request")),
    };

    if req.method != Some("GET") {
        return Err(Error::InvalidHttp("upgrade requests use GET"));
    }

    match header_value(req.headers, "upgrade")? {
        Some(value) if token_list_contains(value, "websocket") => {}
        _ => return Err(Error::HandshakeFailed("Upgrade header does not name websocket")),
    }
    match header_value(req.headers, "connection")? {
        Some(value) if token_list_contains(value, "upgrade") => {}
        _ => return Err(Error::HandshakeFailed("Connection header does not request an upgrade")),
    }
    match header_value(req.headers, "sec-websocket-version")? {
        Some(value) if value.trim() == "13" => {}
        Some(_) => return Err(Error::HandshakeFailed("only WebSocket version 13 is supported")),
        None => return Err(Error::HandshakeFailed("no Sec-WebSocket-Version header")),
    }

    let key = header_value(req.headers, "sec-websocket-key")?
        .ok_or(Error::HandshakeFailed("no Sec-WebSocket-Key header"))?;
    if !key_is_nonce(key) {
        return Err(Error::HandshakeFailed("key is not base64 over a 16-byte nonce"));
    }

    Ok(Some((
        HandshakeRequest {
            path: req.path.unwrap_or("/"),
            host: header_value(req.headers, "host")?,
            key,
            protocol: header_value(req.headers, "sec-websocket-protocol")?,
            origin: header_value(req.headers, "origin")?,
        },
        len,
    )))
}

/// Compute the Sec-WebSocket-Accept token: `base64(SHA1(key || GUID))`
#[inline]
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Build the 101 Switching Protocols response
///
/// `protocol` echoes a chosen sub-protocol name; `server` fills the
/// `Server:` header with the endpoint identifier.
pub fn build_response(accept: &str, protocol: Option<&str>, server: &str) -> Bytes {
    let mut head = String::with_capacity(192);
    head.push_str("HTTP/1.1 101 Switching Protocols\r\n");
    head.push_str("Upgrade: websocket\r\nConnection: Upgrade\r\n");
    let _ = write!(head, "Sec-WebSocket-Accept: {accept}\r\n");
    if let Some(name) = protocol {
        let _ = write!(head, "Sec-WebSocket-Protocol: {name}\r\n");
    }
    let _ = write!(head, "Server: {server}\r\n\r\n");
    Bytes::from(head.into_bytes())
}

/// Build a WebSocket upgrade request (client-side)
pub fn build_request(host: &str, path: &str, key: &str, protocol: Option<&str>) -> Bytes {
    let mut head = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n"
    );
    if let Some(name) = protocol {
        let _ = write!(head, "Sec-WebSocket-Protocol: {name}\r\n");
    }
    head.push_str("\r\n");
    Bytes::from(head.into_bytes())
}

/// Generate a random 16-byte WebSocket key (client-side)
pub fn generate_key() -> String {
    let mut nonce = [0u8; 16];
    rng::fill(&mut nonce);
    base64::engine::general_purpose::STANDARD.encode(nonce)
}

/// WebSocket handshake response (client-side view)
#[derive(Debug)]
pub struct HandshakeResponse<'a> {
    /// HTTP status code
    pub status: u16,
    /// The Sec-WebSocket-Accept header
    pub accept: Option<&'a str>,
    /// The Sec-WebSocket-Protocol header
    pub protocol: Option<&'a str>,
}

/// Parse a WebSocket upgrade response (client-side)
pub fn parse_response(buf: &[u8]) -> Result<Option<(HandshakeResponse<'_>, usize)>> {
    if buf.len() > MAX_HANDSHAKE_SIZE {
        return Err(Error::InvalidHttp("response exceeds the header cap"));
    }

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut res = httparse::Response::new(&mut headers);
    let len = match res.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(_) => return Err(Error::InvalidHttp("malformed HTTP response")),
    };

    let status = res.code.unwrap_or(0);
    if status != 101 {
        return Err(Error::HandshakeFailed("server did not switch protocols"));
    }

    Ok(Some((
        HandshakeResponse {
            status,
            accept: header_value(res.headers, "sec-websocket-accept")?,
            protocol: header_value(res.headers, "sec-websocket-protocol")?,
        },
        len,
    )))
}

/// Validate the server's accept token against the key we sent
pub fn validate_accept_key(sent_key: &str, received_accept: &str) -> bool {
    accept_key(sent_key) == received_accept
}

/// Canonical reason phrase for an HTTP status code
pub fn status_text(code: u16) -> &'static str {
    match code {
        101 => "Switching Protocols",
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        426 => "Upgrade Required",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Build a templated HTTP error page for a rejected handshake
///
/// The body carries the status line and the server identifier, mirroring
/// what a browser sees when it hits the endpoint with a non-WebSocket
/// request.
pub fn error_page(code: u16, server: &str) -> Bytes {
    let text = status_text(code);
    let body = format!(
        "<html><head><title>{code} {text}</title></head>\
         <body><h1>{code} {text}</h1>\
         <hr><address>{server}</address></body></html>\n",
    );

    let mut page = format!(
        "HTTP/1.1 {code} {text}\r\n\
         Content-Type: text/html\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         Server: {server}\r\n\r\n",
        body.len()
    );
    page.push_str(&body);
    Bytes::from(page.into_bytes())
}
