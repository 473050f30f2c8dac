//! # Connection Lifecycle
//!
//! Everything that happens to one TCP stream: upgrade handshake, registry
//! entry, the blocking read loop that feeds the frame parser, and cleanup.
//!
//! Each connection runs two threads. The reader (this module's loop) pulls
//! socket bytes into the parser and hands decoded envelopes to the
//! injected message handler. The writer drains the bounded outbound queue
//! so a slow socket never blocks dispatch.
//!
//! A connection moves through CONNECTING (handshake in flight), OPEN
//! (registered, after the 101 response is written), and CLOSED (socket
//! close or error, which unregisters it and broadcasts `user_offline`).
//! There is no half-close state; closure is abrupt.
//!
//! Malformed frames and bad envelope JSON get a 1002 close frame and tear
//! the connection down.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread;

use tracing::{debug, info, warn};

use crate::frame::{self, FrameKind, FrameParser, CLOSE_PROTOCOL_ERROR};
use crate::handshake;
use crate::protocol::{Envelope, TYPE_USER_OFFLINE};
use crate::registry::{Peer, Registry, OUTBOUND_QUEUE_CAPACITY};

/// Hook invoked for every successfully decoded inbound envelope. This is
/// the seam to the message router; the push core never interprets
/// envelope contents itself.
pub type MessageHandler = Arc<dyn Fn(&str, Envelope) + Send + Sync>;

/// Drive one client connection from raw TCP to teardown. Owns the stream;
/// returns when the connection is gone.
pub fn handle_connection(mut stream: TcpStream, registry: Arc<Registry>, on_message: MessageHandler) {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();

    let (request, surplus) = match handshake::read_request(&mut stream) {
        Ok(r) => r,
        Err(e) => {
            debug!(peer = %peer_addr, error = %e, "dropping connection before handshake");
            return;
        }
    };

    let response = match handshake::upgrade_response(&request) {
        Ok(r) => r,
        Err(e) => {
            warn!(peer = %peer_addr, error = %e, "handshake rejected");
            let _ = stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n");
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
    };
    if stream.write_all(&response).is_err() {
        return;
    }

    // Handshake done, the connection is OPEN. Wire up the outbound side
    // before registering so no dispatched frame can be lost.
    let (writer_stream, peer_stream) = match (stream.try_clone(), stream.try_clone()) {
        (Ok(w), Ok(p)) => (w, p),
        _ => {
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
    };
    let (tx, rx) = sync_channel::<Vec<u8>>(OUTBOUND_QUEUE_CAPACITY);
    let writer = thread::spawn(move || write_loop(writer_stream, rx));

    let id = registry.register(Peer::new(tx, Some(peer_stream)));
    info!(id = %id, peer = %peer_addr, "connection open");

    registry.enqueue(
        &id,
        frame::encode_text(Envelope::connected(&id).to_json().as_bytes()),
    );

    read_loop(&mut stream, surplus, &registry, &id, &on_message);

    // CLOSED: remove the entry (idempotent if the overflow policy already
    // did). Dropping the registry entry drops the queue sender; the writer
    // drains whatever is left, then shuts the socket down.
    registry.unregister(&id);
    let _ = writer.join();
    registry.broadcast(
        TYPE_USER_OFFLINE,
        &serde_json::json!({ "clientId": id }),
        Some(&id),
    );
    info!(id = %id, "connection closed");
}

/// Pull socket bytes through the incremental parser until the peer goes
/// away or violates the protocol. `surplus` is whatever the handshake
/// reader pulled in past the header block; it is parsed before the first
/// socket read.
fn read_loop(
    stream: &mut TcpStream,
    surplus: Vec<u8>,
    registry: &Registry,
    id: &str,
    on_message: &MessageHandler,
) {
    let mut parser = FrameParser::new();
    let mut buf = [0u8; 4096];
    parser.feed(&surplus);

    loop {
        // One feed can complete any number of frames.
        loop {
            match parser.next() {
                Ok(Some(frame)) => {
                    if !dispatch_frame(frame, registry, id, on_message) {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(id, error = %e, "protocol violation, closing");
                    registry.enqueue(id, frame::encode_close(CLOSE_PROTOCOL_ERROR));
                    return;
                }
            }
        }

        let n = match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                debug!(id, error = %e, "socket read failed");
                return;
            }
        };
        parser.feed(&buf[..n]);
    }
}

/// Handle one decoded frame. Returns false when the connection should be
/// torn down.
fn dispatch_frame(
    frame: frame::Frame,
    registry: &Registry,
    id: &str,
    on_message: &MessageHandler,
) -> bool {
    match frame.kind {
        FrameKind::Text => match Envelope::from_payload(&frame.payload) {
            Ok(envelope) => {
                on_message(id, envelope);
                true
            }
            Err(e) => {
                warn!(id, error = %e, "bad envelope json, closing");
                registry.enqueue(id, frame::encode_close(CLOSE_PROTOCOL_ERROR));
                false
            }
        },
        FrameKind::Close => {
            // Echo the peer's status code if it sent one.
            let code = match frame.payload.get(..2) {
                Some(&[hi, lo]) => u16::from_be_bytes([hi, lo]),
                _ => 1000,
            };
            registry.enqueue(id, frame::encode_close(code));
            false
        }
        FrameKind::Ping => {
            registry.enqueue(id, frame::encode_pong(&frame.payload));
            true
        }
        FrameKind::Pong => true,
        FrameKind::Binary | FrameKind::Continuation => {
            // Text-only protocol; fragmentation and binary payloads are
            // out of scope for the push core.
            debug!(id, kind = ?frame.kind, "unsupported frame kind ignored");
            true
        }
    }
}

/// Drain the outbound queue into the socket. Exits when every sender is
/// gone (the registry entry was removed) or the socket dies.
fn write_loop(mut stream: TcpStream, rx: Receiver<Vec<u8>>) {
    while let Ok(bytes) = rx.recv() {
        if stream.write_all(&bytes).is_err() {
            break;
        }
    }
    let _ = stream.shutdown(Shutdown::Both);
}
