//! Loopback integration scenarios
//!
//! Each test drives a real server and the embedded blocking client in one
//! thread: the client writes, the server is pumped through a few bounded
//! ticks, and the resulting update sequence is asserted.

use std::net::SocketAddr;
use std::time::Duration;

use wsmux::client::Client;
use wsmux::frame::OpCode;
use wsmux::update::{ConnectionId, ReadKind, Update, WriteKind};
use wsmux::{Config, ConnState, Message, Server};

fn pump(server: &mut Server, ticks: usize) -> Vec<Update> {
    let mut out = Vec::new();
    for _ in 0..ticks {
        out.extend(server.update(Some(Duration::from_millis(50))));
    }
    out
}

fn bind_server(config: Config) -> (Server, SocketAddr) {
    let server = Server::bind("tcp://127.0.0.1:0", config).expect("bind");
    let addr = server.local_addr().expect("local addr");
    (server, addr)
}

fn new_connection_id(updates: &[Update]) -> Option<ConnectionId> {
    updates.iter().find_map(|u| match u {
        Update::Read {
            kind: ReadKind::NewConnection,
            conn,
        } => Some(*conn),
        _ => None,
    })
}

fn has_read_kind(updates: &[Update], kind: ReadKind) -> bool {
    updates
        .iter()
        .any(|u| matches!(u, Update::Read { kind: k, .. } if *k == kind))
}

fn open_session(server: &mut Server, addr: SocketAddr) -> (Client, ConnectionId) {
    let mut client = Client::connect(addr, "/").expect("connect");
    let updates = pump(server, 4);
    let conn = new_connection_id(&updates).expect("handshake should complete");
    client.finish_handshake().expect("101 response");
    (client, conn)
}

fn close_code(frame: &wsmux::Frame) -> Option<u16> {
    if frame.payload.len() >= 2 {
        Some(u16::from_be_bytes([frame.payload[0], frame.payload[1]]))
    } else {
        None
    }
}

#[test]
fn happy_handshake_and_echo() {
    let (mut server, addr) = bind_server(Config::default());

    // RFC 6455 sample nonce must produce the sample accept token.
    let mut client =
        Client::connect_with_key(addr, "/chat", "dGhlIHNhbXBsZSBub25jZQ==").expect("connect");
    let updates = pump(&mut server, 4);
    let conn = new_connection_id(&updates).expect("NEW_CONNECTION");
    assert!(has_read_kind(&updates, ReadKind::NewTcpConnection));

    let response = client.read_raw_response().expect("response");
    assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    assert!(response.starts_with("HTTP/1.1 101"));

    client.send_text("Hello").expect("send");
    let updates = pump(&mut server, 2);
    assert!(has_read_kind(&updates, ReadKind::Read));

    let connection = server.connection(conn).expect("connection");
    let message = connection.recv().expect("message");
    assert_eq!(message, Message::Text(bytes::Bytes::from_static(b"Hello")));

    // Echo it back and watch the flush complete.
    connection.send_text("Hello").expect("echo");
    let updates = pump(&mut server, 2);
    assert!(updates
        .iter()
        .any(|u| matches!(u, Update::Write { kind: WriteKind::WriteCompleted, .. })));

    let frame = client.recv_frame().expect("echo frame");
    assert_eq!(frame.header.opcode, OpCode::Text);
    assert_eq!(frame.payload.as_ref(), b"Hello");
}

#[test]
fn fragmented_binary_message_reassembles() {
    let (mut server, addr) = bind_server(Config::default());
    let (mut client, conn) = open_session(&mut server, addr);

    client.send_frame(OpCode::Binary, b"abc", false).unwrap();
    client.send_frame(OpCode::Continuation, b"def", false).unwrap();
    client.send_frame(OpCode::Continuation, b"ghi", true).unwrap();

    let updates = pump(&mut server, 2);
    let reads = updates
        .iter()
        .filter(|u| matches!(u, Update::Read { kind: ReadKind::Read, .. }))
        .count();
    assert_eq!(reads, 1, "one message from three fragments");

    let connection = server.connection(conn).unwrap();
    assert_eq!(
        connection.recv(),
        Some(Message::Binary(bytes::Bytes::from_static(b"abcdefghi")))
    );
    assert!(connection.recv().is_none());
}

#[test]
fn ping_interleaved_mid_fragment() {
    let (mut server, addr) = bind_server(Config::default());
    let (mut client, conn) = open_session(&mut server, addr);

    client.send_frame(OpCode::Text, b"hel", false).unwrap();
    client.send_frame(OpCode::Ping, b"p", true).unwrap();
    let updates = pump(&mut server, 2);

    // The ping is answered internally, not surfaced as a READ.
    assert!(!has_read_kind(&updates, ReadKind::Read));
    let pong = client.recv_frame().expect("pong");
    assert_eq!(pong.header.opcode, OpCode::Pong);
    assert_eq!(pong.payload.as_ref(), b"p");

    // The fragmented message is still being assembled.
    client.send_frame(OpCode::Continuation, b"lo", true).unwrap();
    let updates = pump(&mut server, 2);
    assert!(has_read_kind(&updates, ReadKind::Read));
    assert_eq!(
        server.connection(conn).unwrap().recv(),
        Some(Message::Text(bytes::Bytes::from_static(b"hello")))
    );
}

#[test]
fn invalid_utf8_closes_with_1007() {
    let (mut server, addr) = bind_server(Config::default());
    let (mut client, _conn) = open_session(&mut server, addr);

    client.send_frame(OpCode::Text, &[0xFF, 0xFE], true).unwrap();
    let updates = pump(&mut server, 2);
    assert!(!has_read_kind(&updates, ReadKind::Read));

    let frame = client.recv_frame().expect("close frame");
    assert_eq!(frame.header.opcode, OpCode::Close);
    assert_eq!(close_code(&frame), Some(1007));

    // Complete the close handshake; the final update is DISCONNECT.
    client.send_close(1007, "").unwrap();
    let updates = pump(&mut server, 2);
    assert!(has_read_kind(&updates, ReadKind::Disconnect));
}

#[test]
fn oversized_handshake_rejected_with_413() {
    let (mut server, addr) = bind_server(Config::default());
    let mut client = Client::connect_silent(addr).expect("connect");

    // Valid-but-unterminated headers well past the 8 KiB cap.
    let mut request = b"GET / HTTP/1.1\r\nX-Padding: ".to_vec();
    request.extend(std::iter::repeat(b'a').take(9000));
    request.extend_from_slice(b"\r\n");
    client.send_raw(&request).unwrap();

    let updates = pump(&mut server, 3);
    assert!(has_read_kind(&updates, ReadKind::HandshakeFailure));

    let response = client.read_raw_response().expect("error page");
    assert!(response.starts_with("HTTP/1.1 413"));
    assert!(response.contains("Server: wsmux/"));
}

#[test]
fn malformed_handshake_rejected_with_400() {
    let (mut server, addr) = bind_server(Config::default());
    let mut client = Client::connect_silent(addr).expect("connect");
    client
        .send_raw(b"GET / HTTP/1.1\r\nHost: nope\r\n\r\n")
        .unwrap();

    let updates = pump(&mut server, 3);
    assert!(has_read_kind(&updates, ReadKind::HandshakeFailure));

    let response = client.read_raw_response().expect("error page");
    assert!(response.starts_with("HTTP/1.1 400"));
}

#[test]
fn handshake_deadline_times_out() {
    let config = Config::builder()
        .handshake_timeout(Duration::from_millis(100))
        .build();
    let (mut server, addr) = bind_server(config);
    let _client = Client::connect_silent(addr).expect("connect");

    let mut updates = pump(&mut server, 2);
    std::thread::sleep(Duration::from_millis(150));
    updates.extend(pump(&mut server, 2));

    assert!(has_read_kind(&updates, ReadKind::HandshakeTimeout));
    assert_eq!(server.connection_count(), 0, "timed-out connection pruned");
}

#[test]
fn client_initiated_close_handshake() {
    let (mut server, addr) = bind_server(Config::default());
    let (mut client, _conn) = open_session(&mut server, addr);

    client.send_close(1000, "done").unwrap();
    let updates = pump(&mut server, 2);
    assert!(has_read_kind(&updates, ReadKind::Disconnect));

    // The echoed Close carries 1000.
    let frame = client.recv_frame().expect("close echo");
    assert_eq!(frame.header.opcode, OpCode::Close);
    assert_eq!(close_code(&frame), Some(1000));
}

#[test]
fn server_initiated_close_handshake() {
    let (mut server, addr) = bind_server(Config::default());
    let (mut client, conn) = open_session(&mut server, addr);

    server.connection(conn).unwrap().close(1000, "bye").unwrap();
    assert_eq!(server.connection(conn).unwrap().state(), ConnState::ClosingLocal);
    pump(&mut server, 2);

    let frame = client.recv_frame().expect("close frame");
    assert_eq!(frame.header.opcode, OpCode::Close);
    assert_eq!(close_code(&frame), Some(1000));

    client.send_close(1000, "").unwrap();
    let updates = pump(&mut server, 2);
    assert!(has_read_kind(&updates, ReadKind::Disconnect));
}

#[test]
fn peer_eof_reports_sock_disconnect() {
    let (mut server, addr) = bind_server(Config::default());
    let (mut client, _conn) = open_session(&mut server, addr);

    client.shutdown();
    let updates = pump(&mut server, 2);
    assert!(has_read_kind(&updates, ReadKind::SockDisconnect));
}

#[test]
fn disconnect_all_closes_every_session() {
    let (mut server, addr) = bind_server(Config::default());
    let (mut client_a, _a) = open_session(&mut server, addr);
    let (mut client_b, _b) = open_session(&mut server, addr);

    server.disconnect_all(1001, "going away");
    pump(&mut server, 2);

    for client in [&mut client_a, &mut client_b] {
        let frame = client.recv_frame().expect("close frame");
        assert_eq!(frame.header.opcode, OpCode::Close);
        assert_eq!(close_code(&frame), Some(1001));
    }
}

#[test]
fn manual_accept_flow() {
    let config = Config::builder().auto_accept(false).build();
    let (mut server, addr) = bind_server(config);

    let mut client = Client::connect(addr, "/").expect("connect");
    let updates = pump(&mut server, 2);
    assert!(has_read_kind(&updates, ReadKind::NewTcpConnectionAvailable));
    assert_eq!(server.connection_count(), 0);

    server.accept_new_connection().expect("manual accept");
    let updates = pump(&mut server, 4);
    let conn = new_connection_id(&updates).expect("handshake completes after accept");
    client.finish_handshake().expect("101");

    assert!(server.connection(conn).unwrap().is_open());
}

#[test]
fn empty_message_surfaces_empty_frame_kind() {
    let (mut server, addr) = bind_server(Config::default());
    let (mut client, conn) = open_session(&mut server, addr);

    client.send_frame(OpCode::Text, b"", true).unwrap();
    let updates = pump(&mut server, 2);
    assert!(has_read_kind(&updates, ReadKind::ReadEmptyFrame));
    assert_eq!(
        server.connection(conn).unwrap().recv(),
        Some(Message::Text(bytes::Bytes::new()))
    );
}

#[test]
fn update_accounting_matches_lifecycle() {
    let (mut server, addr) = bind_server(Config::default());

    let mut all_updates = Vec::new();
    let mut clients = Vec::new();
    for _ in 0..3 {
        let mut client = Client::connect(addr, "/").expect("connect");
        all_updates.extend(pump(&mut server, 4));
        client.finish_handshake().expect("101");
        clients.push(client);
    }

    for client in &mut clients {
        client.send_close(1000, "").unwrap();
    }
    all_updates.extend(pump(&mut server, 3));

    let new_connections = all_updates
        .iter()
        .filter(|u| matches!(u, Update::Read { kind: ReadKind::NewConnection, .. }))
        .count();
    let disconnects = all_updates
        .iter()
        .filter(|u| matches!(u, Update::Read { kind: ReadKind::Disconnect, .. }))
        .count();

    assert_eq!(new_connections, 3);
    assert_eq!(disconnects, 3);
}

#[test]
fn unix_socket_cleanup_and_fork_discipline() {
    let dir = std::env::temp_dir().join(format!("wsmux-it-{}", std::process::id()));
    let path = dir.join("ws.sock");
    let address = format!("unix://{}", path.display());

    // Bind creates the missing parent directory.
    let mut child = Server::bind(&address, Config::default()).expect("bind unix");
    assert!(path.exists());

    // A fork child must not unlink the file the parent still owns.
    child.process_did_fork(0);
    child.close();
    assert!(path.exists(), "child close must leave the socket file");

    // Rebinding unlinks the stale file; a normal close removes it.
    let mut parent = Server::bind(&address, Config::default()).expect("rebind unix");
    parent.process_did_fork(1234); // parent side is a no-op
    parent.close();
    assert!(!path.exists(), "parent close must unlink the socket file");

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn subprotocol_echoed_when_configured() {
    let config = Config::builder().protocol("chat").build();
    let (mut server, addr) = bind_server(config);

    let mut client = Client::connect_silent(addr).expect("connect");
    client.send_raw(
        b"GET / HTTP/1.1\r\n\
          Host: localhost\r\n\
          Upgrade: websocket\r\n\
          Connection: Upgrade\r\n\
          Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
          Sec-WebSocket-Version: 13\r\n\
          Sec-WebSocket-Protocol: chat, superchat\r\n\r\n",
    )
    .unwrap();

    let updates = pump(&mut server, 4);
    let conn = new_connection_id(&updates).expect("NEW_CONNECTION");

    let response = client.read_raw_response().expect("101");
    assert!(response.contains("Sec-WebSocket-Protocol: chat"));
    assert_eq!(server.connection(conn).unwrap().protocol(), Some("chat"));
}
