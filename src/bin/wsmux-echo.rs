//! Minimal echo server over the update loop
//!
//! Usage: wsmux-echo [tcp://host:port]

use std::time::Duration;

use wsmux::prelude::*;

fn main() -> Result<()> {
    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "tcp://127.0.0.1:9001".to_string());

    let mut server = Server::bind(&address, Config::default())?;
    println!("listening on {address}");

    loop {
        let updates: Vec<Update> = server.update(Some(Duration::from_millis(250))).collect();
        for update in updates {
            match update {
                Update::Read {
                    kind: ReadKind::NewConnection,
                    conn,
                } => println!("session {conn} open"),
                Update::Read {
                    kind: ReadKind::Read | ReadKind::ReadEmptyFrame,
                    conn,
                } => {
                    if let Some(connection) = server.connection(conn) {
                        while let Some(message) = connection.recv() {
                            let _ = connection.send(message.opcode(), message.as_bytes());
                        }
                    }
                }
                Update::Read {
                    kind: ReadKind::Disconnect | ReadKind::SockDisconnect,
                    conn,
                } => println!("session {conn} closed"),
                _ => {}
            }
        }
    }
}
