use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;
use warp::ws::Message;

use crate::types::{now_ms, PeerId, RoomKey};

pub(crate) type PeerSender = mpsc::UnboundedSender<Message>;

pub(crate) struct ConnectionRecord {
    pub sender: PeerSender,
    pub conn_id: Uuid,
    pub joined_at_ms: i64,
    pub last_heartbeat_ms: i64,
    pub alive: bool,
}

// At most one live connection per (room, peer) pair.
#[derive(Default)]
pub(crate) struct ConnectionRegistry {
    rooms: DashMap<RoomKey, DashMap<PeerId, ConnectionRecord>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, room: RoomKey, peer: PeerId, sender: PeerSender) -> Uuid {
        let conn_id = Uuid::new_v4();
        let now = now_ms();
        let record = ConnectionRecord {
            sender,
            conn_id,
            joined_at_ms: now,
            last_heartbeat_ms: now,
            alive: true,
        };
        let peers = self.rooms.entry(room).or_default();
        // close the replaced transport instead of leaking it
        if let Some(prev) = peers.insert(peer, record) {
            let _ = prev
                .sender
                .send(Message::close_with(1000u16, "Connection superseded"));
        }
        conn_id
    }

    // Only removes the record still identified by conn_id, so a superseded
    // connection's late disconnect cannot evict its replacement.
    pub fn remove(&self, room: &RoomKey, peer: &PeerId, conn_id: Uuid) -> bool {
        let Some(peers) = self.rooms.get(room) else {
            return false;
        };
        let removed = match peers.remove_if(peer, |_, rec| rec.conn_id == conn_id) {
            Some((_, rec)) => {
                let session_ms = now_ms() - rec.joined_at_ms;
                debug!(room = %room, player = %peer, session_ms, "connection deregistered");
                true
            }
            None => false,
        };
        let empty = peers.is_empty();
        drop(peers);
        if removed && empty {
            self.rooms.remove_if(room, |_, peers| peers.is_empty());
        }
        removed
    }

    pub fn touch(&self, room: &RoomKey, peer: &PeerId) {
        if let Some(peers) = self.rooms.get(room) {
            if let Some(mut rec) = peers.get_mut(peer) {
                rec.last_heartbeat_ms = now_ms();
                rec.alive = true;
            }
        }
    }

    // Best-effort; returns whether a frame was enqueued.
    pub fn send_to(&self, room: &RoomKey, peer: &PeerId, msg: Message) -> bool {
        match self.rooms.get(room) {
            Some(peers) => match peers.get(peer) {
                Some(rec) => rec.sender.send(msg).is_ok(),
                None => false,
            },
            None => false,
        }
    }

    pub fn broadcast(&self, room: &RoomKey, msg: Message, exclude: Option<&PeerId>) -> usize {
        let Some(peers) = self.rooms.get(room) else {
            return 0;
        };
        let mut sent = 0;
        for entry in peers.iter() {
            if let Some(ex) = exclude {
                if entry.key() == ex {
                    continue;
                }
            }
            if entry.value().sender.send(msg.clone()).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    pub fn peers_of(&self, room: &RoomKey) -> Vec<PeerId> {
        self.rooms
            .get(room)
            .map(|peers| peers.iter().map(|e| e.key().clone()).collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.rooms.iter().map(|e| e.value().len()).sum()
    }

    // Pings every connection and marks it unanswered; whatever is still
    // unanswered from the previous pass gets closed and returned for cleanup.
    pub fn ping_pass(&self) -> Vec<(RoomKey, PeerId, Uuid)> {
        let mut dead = Vec::new();
        for room in self.rooms.iter() {
            for mut rec in room.value().iter_mut() {
                if rec.alive {
                    rec.alive = false;
                    let _ = rec.sender.send(Message::ping(Vec::new()));
                } else {
                    let _ = rec
                        .sender
                        .send(Message::close_with(1001u16, "Heartbeat timeout"));
                    dead.push((room.key().clone(), rec.key().clone(), rec.conn_id));
                }
            }
        }
        for (room, peer, conn_id) in &dead {
            self.remove(room, peer, *conn_id);
        }
        dead
    }

    pub fn sweep_stale(&self, now: i64, max_age_ms: i64) -> Vec<(RoomKey, PeerId, Uuid)> {
        let mut stale = Vec::new();
        for room in self.rooms.iter() {
            for rec in room.value().iter() {
                if now - rec.last_heartbeat_ms > max_age_ms {
                    let _ = rec
                        .sender
                        .send(Message::close_with(1001u16, "Connection stale"));
                    stale.push((room.key().clone(), rec.key().clone(), rec.conn_id));
                }
            }
        }
        for (room, peer, conn_id) in &stale {
            self.remove(room, peer, *conn_id);
        }
        stale
    }

    pub fn close_room(&self, room: &RoomKey, code: u16, reason: &'static str) {
        if let Some((_, peers)) = self.rooms.remove(room) {
            for (_, rec) in peers {
                let _ = rec.sender.send(Message::close_with(code, reason));
            }
        }
    }

    pub fn close_all(&self, code: u16, reason: &'static str) {
        let keys: Vec<RoomKey> = self.rooms.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.close_room(&key, code, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn arena(id: i64) -> RoomKey {
        RoomKey::Arena(id)
    }

    fn connect(
        registry: &ConnectionRegistry,
        room: RoomKey,
        peer: &str,
    ) -> (Uuid, UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = registry.add(room, peer.to_string(), tx);
        (conn_id, rx)
    }

    #[test]
    fn add_and_send() {
        let registry = ConnectionRegistry::new();
        let (_, mut rx) = connect(&registry, arena(1), "alice");

        assert!(registry.send_to(&arena(1), &"alice".to_string(), Message::text("hi")));
        assert_eq!(rx.try_recv().unwrap().to_str().unwrap(), "hi");
    }

    #[test]
    fn send_to_unknown_peer_is_dropped() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.send_to(&arena(1), &"ghost".to_string(), Message::text("hi")));
    }

    #[test]
    fn replacement_closes_the_incumbent() {
        let registry = ConnectionRegistry::new();
        let (old_id, mut old_rx) = connect(&registry, arena(1), "alice");
        let (_, mut new_rx) = connect(&registry, arena(1), "alice");

        let frame = old_rx.try_recv().unwrap();
        assert!(frame.is_close());

        // The old connection's late disconnect must not evict the new one.
        assert!(!registry.remove(&arena(1), &"alice".to_string(), old_id));
        assert!(registry.send_to(&arena(1), &"alice".to_string(), Message::text("still here")));
        assert_eq!(new_rx.try_recv().unwrap().to_str().unwrap(), "still here");
    }

    #[test]
    fn remove_drops_empty_room_index() {
        let registry = ConnectionRegistry::new();
        let (conn_id, _rx) = connect(&registry, arena(1), "alice");

        assert!(registry.remove(&arena(1), &"alice".to_string(), conn_id));
        assert!(registry.peers_of(&arena(1)).is_empty());
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn broadcast_excludes_the_sender() {
        let registry = ConnectionRegistry::new();
        let (_, mut alice_rx) = connect(&registry, arena(1), "alice");
        let (_, mut bob_rx) = connect(&registry, arena(1), "bob");

        let sent = registry.broadcast(
            &arena(1),
            Message::text("update"),
            Some(&"alice".to_string()),
        );
        assert_eq!(sent, 1);
        assert!(alice_rx.try_recv().is_err());
        assert_eq!(bob_rx.try_recv().unwrap().to_str().unwrap(), "update");
    }

    #[test]
    fn broadcast_preserves_per_sender_order() {
        let registry = ConnectionRegistry::new();
        let (_, mut rx) = connect(&registry, arena(1), "alice");

        for i in 0..10 {
            registry.broadcast(&arena(1), Message::text(format!("{}", i)), None);
        }
        for i in 0..10 {
            assert_eq!(rx.try_recv().unwrap().to_str().unwrap(), format!("{}", i));
        }
    }

    #[test]
    fn stale_sweep_evicts_old_connections() {
        let registry = ConnectionRegistry::new();
        let (_, mut stale_rx) = connect(&registry, arena(1), "alice");
        let (_, _fresh_rx) = connect(&registry, arena(1), "bob");

        {
            let peers = registry.rooms.get(&arena(1)).unwrap();
            peers.get_mut(&"alice".to_string()).unwrap().last_heartbeat_ms -= 61_000;
        }

        let evicted = registry.sweep_stale(now_ms(), 60_000);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].1, "alice");
        assert!(stale_rx.try_recv().unwrap().is_close());
        assert_eq!(registry.peers_of(&arena(1)), vec!["bob".to_string()]);
    }

    #[test]
    fn touch_is_non_decreasing() {
        let registry = ConnectionRegistry::new();
        let (_, _rx) = connect(&registry, arena(1), "alice");

        let heartbeat_ms = |registry: &ConnectionRegistry| {
            let peers = registry.rooms.get(&arena(1)).unwrap();
            let rec = peers.get(&"alice".to_string()).unwrap();
            rec.last_heartbeat_ms
        };
        let before = heartbeat_ms(&registry);
        registry.touch(&arena(1), &"alice".to_string());
        assert!(heartbeat_ms(&registry) >= before);
    }

    #[test]
    fn ping_pass_closes_connections_that_never_answer() {
        let registry = ConnectionRegistry::new();
        let (_, mut rx) = connect(&registry, arena(1), "alice");

        // First pass pings and marks unanswered.
        assert!(registry.ping_pass().is_empty());
        assert!(rx.try_recv().unwrap().is_ping());

        // No pong came back: the second pass terminates the connection.
        let dead = registry.ping_pass();
        assert_eq!(dead.len(), 1);
        assert!(rx.try_recv().unwrap().is_close());
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn pong_keeps_the_connection_alive() {
        let registry = ConnectionRegistry::new();
        let (_, mut rx) = connect(&registry, arena(1), "alice");

        assert!(registry.ping_pass().is_empty());
        assert!(rx.try_recv().unwrap().is_ping());
        registry.touch(&arena(1), &"alice".to_string());

        assert!(registry.ping_pass().is_empty());
        assert!(rx.try_recv().unwrap().is_ping());
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn close_room_closes_every_socket() {
        let registry = ConnectionRegistry::new();
        let (_, mut alice_rx) = connect(&registry, arena(1), "alice");
        let (_, mut bob_rx) = connect(&registry, arena(1), "bob");

        registry.close_room(&arena(1), 1000, "done");
        assert!(alice_rx.try_recv().unwrap().is_close());
        assert!(bob_rx.try_recv().unwrap().is_close());
        assert_eq!(registry.connection_count(), 0);
    }
}
