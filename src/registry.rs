//! # Connection Registry & Broadcast Dispatch
//!
//! The authoritative map from connection id to live peer, and the only
//! shared mutable state in the push core. Every mutation funnels through
//! `register`/`unregister`; there is no module-level singleton, callers
//! hold an `Arc<Registry>`.
//!
//! With one reader thread and one writer thread per connection the map is
//! genuinely shared, so it lives behind a mutex. `broadcast` snapshots the
//! id list under the lock and releases it before touching any peer, so the
//! lock is never held across a write.
//!
//! Outbound delivery is a non-blocking enqueue onto a bounded
//! per-connection queue drained by that connection's writer thread. A
//! full queue means the peer has stopped draining, and the policy is to
//! disconnect it. Enqueue failures never propagate out of `send_to_client` or
//! `broadcast`: a dying peer is reaped by its own close/error event, and
//! one dead peer must not rob the others of delivery.

use std::collections::{HashMap, HashSet};
use std::net::{Shutdown, TcpStream};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{debug, warn};

use crate::frame;
use crate::protocol::Envelope;

/// Outbound frames a peer may have in flight before it is considered too
/// slow and disconnected.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// A registered connection: its outbound queue plus the socket handle used
/// to force a disconnect. Room memberships are tracked for the messenger's
/// topic fan-out but not consulted by core dispatch.
pub struct Peer {
    tx: SyncSender<Vec<u8>>,
    stream: Option<TcpStream>,
    rooms: HashSet<String>,
}

impl Peer {
    /// A peer backed by a real socket. The stream clone is only ever used
    /// for `shutdown`; all writes go through the queue.
    pub fn new(tx: SyncSender<Vec<u8>>, stream: Option<TcpStream>) -> Self {
        Self {
            tx,
            stream,
            rooms: HashSet::new(),
        }
    }
}

/// The in-memory table of live connections.
#[derive(Default)]
pub struct Registry {
    peers: Mutex<HashMap<String, Peer>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peer and hand back its freshly generated id. Ids are
    /// unique for the lifetime of the registry.
    pub fn register(&self, peer: Peer) -> String {
        let mut peers = self.peers.lock().unwrap();
        let mut id = generate_id();
        while peers.contains_key(&id) {
            id = generate_id();
        }
        peers.insert(id.clone(), peer);
        id
    }

    /// Remove a connection. Removing an id that is already gone is a
    /// no-op, so close and error events may both fire for one socket.
    pub fn unregister(&self, id: &str) {
        self.peers.lock().unwrap().remove(id);
    }

    /// Encode an envelope and queue it for one connection. A missing id,
    /// a full queue, or a dead writer never throws out of here; the
    /// connection's own close event is what removes it.
    pub fn send_to_client<T: Serialize>(&self, id: &str, msg_type: &str, data: &T) {
        let bytes = frame::encode_text(Envelope::new(msg_type, data).to_json().as_bytes());
        self.enqueue(id, bytes);
    }

    /// Deliver one envelope to every connection except `exclude`. The
    /// frame is encoded once; a failing peer never aborts delivery to the
    /// rest.
    pub fn broadcast<T: Serialize>(&self, msg_type: &str, data: &T, exclude: Option<&str>) {
        let bytes = frame::encode_text(Envelope::new(msg_type, data).to_json().as_bytes());
        for id in self.ids() {
            if exclude == Some(id.as_str()) {
                continue;
            }
            self.enqueue(&id, bytes.clone());
        }
    }

    /// Queue raw frame bytes for one connection, applying the overflow
    /// policy. Used directly by the connection layer for control frames.
    pub fn enqueue(&self, id: &str, bytes: Vec<u8>) {
        let mut peers = self.peers.lock().unwrap();
        let Some(peer) = peers.get(id) else {
            debug!(id, "send to unknown connection dropped");
            return;
        };
        match peer.tx.try_send(bytes) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                // The peer stopped draining its queue. Cut it loose; its
                // reader thread will observe the shutdown and clean up.
                warn!(id, "outbound queue full, disconnecting slow peer");
                if let Some(stream) = &peer.stream {
                    let _ = stream.shutdown(Shutdown::Both);
                }
                peers.remove(id);
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!(id, "writer gone, dropping connection entry");
                peers.remove(id);
            }
        }
    }

    pub fn join_room(&self, id: &str, room: &str) {
        if let Some(peer) = self.peers.lock().unwrap().get_mut(id) {
            peer.rooms.insert(room.to_string());
        }
    }

    pub fn leave_room(&self, id: &str, room: &str) {
        if let Some(peer) = self.peers.lock().unwrap().get_mut(id) {
            peer.rooms.remove(room);
        }
    }

    pub fn in_room(&self, id: &str, room: &str) -> bool {
        self.peers
            .lock()
            .unwrap()
            .get(id)
            .map(|peer| peer.rooms.contains(room))
            .unwrap_or(false)
    }

    /// Snapshot of the registered ids. Taken under the lock, used after
    /// releasing it.
    pub fn ids(&self) -> Vec<String> {
        self.peers.lock().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Connection id: hex timestamp plus a random suffix. Opaque to peers.
fn generate_id() -> String {
    format!("{:x}-{:04x}", now_unix(), rand_u16())
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn rand_u16() -> u16 {
    // Simple PRNG seeded from the clock. Good enough for ids that only
    // need to be unique within one registry.
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    ((t >> 16) ^ t) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::{sync_channel, Receiver};

    fn test_peer(capacity: usize) -> (Peer, Receiver<Vec<u8>>) {
        let (tx, rx) = sync_channel(capacity);
        (Peer::new(tx, None), rx)
    }

    /// Pull the envelope back out of a queued server frame.
    fn queued_envelope(rx: &Receiver<Vec<u8>>) -> Option<Envelope> {
        let bytes = rx.try_recv().ok()?;
        // Server frames are unmasked; short test payloads use the 2-byte
        // header form.
        assert_eq!(bytes[0], 0x81);
        Envelope::from_payload(&bytes[2..]).ok()
    }

    #[test]
    fn register_returns_unique_ids() {
        let registry = Registry::new();
        let mut ids = HashSet::new();
        for _ in 0..100 {
            let (peer, _rx) = test_peer(1);
            assert!(ids.insert(registry.register(peer)));
        }
        assert_eq!(registry.len(), 100);
    }

    #[test]
    fn broadcast_excludes_the_sender() {
        let registry = Registry::new();
        let (peer_a, rx_a) = test_peer(4);
        let (peer_b, rx_b) = test_peer(4);
        let (peer_c, rx_c) = test_peer(4);
        let a = registry.register(peer_a);
        registry.register(peer_b);
        registry.register(peer_c);

        registry.broadcast("ping_test", &serde_json::json!({}), Some(&a));

        assert!(queued_envelope(&rx_a).is_none());
        for rx in [&rx_b, &rx_c] {
            let env = queued_envelope(rx).expect("delivered");
            assert_eq!(env.msg_type, "ping_test");
        }
    }

    #[test]
    fn broadcast_without_exclusion_reaches_everyone() {
        let registry = Registry::new();
        let (peer_a, rx_a) = test_peer(4);
        let (peer_b, rx_b) = test_peer(4);
        registry.register(peer_a);
        registry.register(peer_b);

        registry.broadcast("notification", &serde_json::json!({"n": 1}), None);

        for rx in [&rx_a, &rx_b] {
            let env = queued_envelope(rx).expect("delivered");
            assert_eq!(env.msg_type, "notification");
            assert_eq!(env.data["n"], 1);
        }
    }

    #[test]
    fn send_after_unregister_is_a_noop() {
        let registry = Registry::new();
        let (peer, rx) = test_peer(4);
        let id = registry.register(peer);

        registry.unregister(&id);
        registry.unregister(&id); // idempotent

        registry.send_to_client(&id, "new_message", &serde_json::json!({}));
        assert!(queued_envelope(&rx).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn dead_peer_does_not_abort_broadcast() {
        let registry = Registry::new();
        let (peer_dead, rx_dead) = test_peer(4);
        let (peer_live, rx_live) = test_peer(4);
        registry.register(peer_dead);
        registry.register(peer_live);
        drop(rx_dead); // writer side gone

        registry.broadcast("new_post", &serde_json::json!({}), None);

        let env = queued_envelope(&rx_live).expect("live peer still served");
        assert_eq!(env.msg_type, "new_post");
        // The dead peer was reaped during the broadcast.
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn full_queue_disconnects_the_slow_peer() {
        let registry = Registry::new();
        let (peer, _rx) = test_peer(1);
        let id = registry.register(peer);

        registry.send_to_client(&id, "new_message", &serde_json::json!({"seq": 1}));
        // Queue of one is now full; the next send trips the policy.
        registry.send_to_client(&id, "new_message", &serde_json::json!({"seq": 2}));

        assert!(registry.is_empty());
    }

    #[test]
    fn room_membership_round_trip() {
        let registry = Registry::new();
        let (peer, _rx) = test_peer(1);
        let id = registry.register(peer);

        assert!(!registry.in_room(&id, "general"));
        registry.join_room(&id, "general");
        assert!(registry.in_room(&id, "general"));
        registry.leave_room(&id, "general");
        assert!(!registry.in_room(&id, "general"));
    }
}
