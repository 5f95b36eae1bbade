use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;
use warp::ws::Message;

use crate::registry::ConnectionRegistry;
use crate::timer::{TimerKind, TimerService};
use crate::types::{now_ms, PeerId, RoomKey};

const START_HOLD: Duration = Duration::from_secs(1);
const CLEANUP_DELAY: Duration = Duration::from_secs(30);
// rooms older than this are reaped unless a match is running
const MAX_AGE_MS: i64 = 30 * 60 * 1000;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum BattleStatus {
    Waiting,
    Ready,
    InProgress,
    Ended,
}

#[derive(Debug, Clone)]
pub(crate) struct MoveRecord {
    pub peer: PeerId,
    pub mv: String,
    pub submitted_at_ms: i64,
}

pub(crate) struct BattleRoom {
    challenge_id: String,
    // join order, at most two
    players: Vec<PeerId>,
    moves: HashMap<u32, Vec<MoveRecord>>,
    status: BattleStatus,
    winner: Option<PeerId>,
    created_at_ms: i64,
}

impl BattleRoom {
    fn new(challenge_id: &str) -> Self {
        Self {
            challenge_id: challenge_id.to_string(),
            players: Vec::new(),
            moves: HashMap::new(),
            status: BattleStatus::Waiting,
            winner: None,
            created_at_ms: now_ms(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum BattleClientMessage {
    SubmitMove { round: u32, r#move: String },
    GameEnded { winner: PeerId },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum BattleServerMessage {
    #[serde(rename_all = "camelCase")]
    PlayerJoined {
        player_id: PeerId,
        challenge_id: String,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    GameReady {
        challenge_id: String,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    OpponentMoved {
        player_id: PeerId,
        round: u32,
        timestamp: i64,
    },
    RoundComplete {
        round: u32,
        moves: Vec<RoundMove>,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    GameEnded {
        winner: PeerId,
        challenge_id: String,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    OpponentLeft { player_id: PeerId, timestamp: i64 },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RoundMove {
    pub player_address: PeerId,
    pub r#move: String,
}

pub(crate) struct BattleManager {
    rooms: DashMap<String, BattleRoom>,
    registry: Arc<ConnectionRegistry>,
    timers: Arc<TimerService>,
}

impl BattleManager {
    pub fn new(registry: Arc<ConnectionRegistry>, timers: Arc<TimerService>) -> Self {
        Self {
            rooms: DashMap::new(),
            registry,
            timers,
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    // First peer creates the room, the second makes it Ready, anyone else is
    // turned away. A known peer rejoining already had its transport swapped
    // by the registry.
    pub fn handle_join(&self, challenge_id: &str, peer: &PeerId, conn_id: Uuid) {
        let key = RoomKey::Battle(challenge_id.to_string());
        let created = !self.rooms.contains_key(challenge_id);
        let mut room = self
            .rooms
            .entry(challenge_id.to_string())
            .or_insert_with(|| BattleRoom::new(challenge_id));
        if created {
            info!(challenge = challenge_id, "battle room created");
        }
        if room.players.iter().any(|p| p == peer) {
            debug!(challenge = challenge_id, player = %peer, "peer reconnected");
            return;
        }
        if room.players.len() >= 2 {
            drop(room);
            warn!(challenge = challenge_id, player = %peer, "battle full, refusing peer");
            self.registry
                .send_to(&key, peer, Message::close_with(1008u16, "Battle full"));
            self.registry.remove(&key, peer, conn_id);
            return;
        }
        room.players.push(peer.clone());
        let challenge = room.challenge_id.clone();
        let ready = room.players.len() == 2 && room.status == BattleStatus::Waiting;
        if ready {
            room.status = BattleStatus::Ready;
        }
        drop(room);
        self.broadcast_msg(
            challenge_id,
            &BattleServerMessage::PlayerJoined {
                player_id: peer.clone(),
                challenge_id: challenge.clone(),
                timestamp: now_ms(),
            },
            None,
        );
        if ready {
            self.broadcast_msg(
                challenge_id,
                &BattleServerMessage::GameReady {
                    challenge_id: challenge,
                    timestamp: now_ms(),
                },
                None,
            );
            self.timers.arm(key, TimerKind::BattleStart, START_HOLD);
        }
    }

    pub fn handle_message(&self, challenge_id: &str, peer: &PeerId, msg: BattleClientMessage) {
        match msg {
            BattleClientMessage::SubmitMove { round, r#move } => {
                self.submit_move(challenge_id, peer, round, r#move)
            }
            BattleClientMessage::GameEnded { winner } => self.game_ended(challenge_id, winner),
        }
    }

    pub fn handle_timer(&self, challenge_id: &str, kind: TimerKind) {
        match kind {
            TimerKind::BattleStart => {
                if let Some(mut room) = self.rooms.get_mut(challenge_id) {
                    if room.status == BattleStatus::Ready {
                        room.status = BattleStatus::InProgress;
                        info!(challenge = challenge_id, "battle in progress");
                    }
                }
            }
            TimerKind::BattleCleanup => self.delete_room(challenge_id, "Battle closed"),
            _ => {}
        }
    }

    // If a match was pending or running and the opponent is still connected,
    // the opponent wins by forfeit.
    pub fn handle_disconnect(&self, challenge_id: &str, peer: &PeerId) {
        let key = RoomKey::Battle(challenge_id.to_string());
        let Some(mut room) = self.rooms.get_mut(challenge_id) else {
            return;
        };
        let remaining = self.registry.peers_of(&key);
        let mut forfeit_winner = None;
        match room.status {
            BattleStatus::Waiting => {
                room.players.retain(|p| p != peer);
            }
            BattleStatus::Ready | BattleStatus::InProgress => {
                let other = room.players.iter().find(|p| *p != peer).cloned();
                if let Some(other) = other {
                    if remaining.contains(&other) {
                        room.status = BattleStatus::Ended;
                        room.winner = Some(other.clone());
                        forfeit_winner = Some(other);
                    }
                }
            }
            BattleStatus::Ended => {}
        }
        drop(room);
        if !remaining.is_empty() {
            self.broadcast_msg(
                challenge_id,
                &BattleServerMessage::OpponentLeft {
                    player_id: peer.clone(),
                    timestamp: now_ms(),
                },
                None,
            );
            if let Some(winner) = forfeit_winner {
                self.timers.cancel(&key, TimerKind::BattleStart);
                self.broadcast_msg(
                    challenge_id,
                    &BattleServerMessage::GameEnded {
                        winner: winner.clone(),
                        challenge_id: challenge_id.to_string(),
                        timestamp: now_ms(),
                    },
                    None,
                );
                self.timers
                    .arm(key.clone(), TimerKind::BattleCleanup, CLEANUP_DELAY);
                info!(challenge = challenge_id, winner = %winner, "battle won by forfeit");
            }
        } else {
            self.timers.cancel_room(&key);
            self.rooms.remove(challenge_id);
            info!(challenge = challenge_id, "battle room deleted");
        }
    }

    pub fn cleanup_scan(&self, now: i64) -> usize {
        let expired: Vec<String> = self
            .rooms
            .iter()
            .filter(|e| {
                e.status != BattleStatus::InProgress && now - e.created_at_ms > MAX_AGE_MS
            })
            .map(|e| e.key().clone())
            .collect();
        for id in &expired {
            self.delete_room(id, "Battle expired");
        }
        expired.len()
    }

    pub fn sweep_empty(&self) -> usize {
        let empty: Vec<String> = self
            .rooms
            .iter()
            .map(|e| e.key().clone())
            .filter(|id| self.registry.peers_of(&RoomKey::Battle(id.clone())).is_empty())
            .collect();
        for id in &empty {
            self.delete_room(id, "Battle closed");
        }
        empty.len()
    }

    fn submit_move(&self, challenge_id: &str, peer: &PeerId, round: u32, mv: String) {
        let Some(mut room) = self.rooms.get_mut(challenge_id) else {
            return;
        };
        if room.status != BattleStatus::InProgress {
            debug!(challenge = challenge_id, player = %peer, "move outside running match dropped");
            return;
        }
        if !room.players.iter().any(|p| p == peer) {
            return;
        }
        let moves = room.moves.entry(round).or_default();
        if moves.iter().any(|m| m.peer == *peer) {
            debug!(challenge = challenge_id, player = %peer, round, "duplicate move dropped");
            return;
        }
        moves.push(MoveRecord {
            peer: peer.clone(),
            mv: mv.clone(),
            submitted_at_ms: now_ms(),
        });
        let complete = if moves.len() == 2 {
            // First submitter first; the stable sort keeps push order for
            // same-millisecond submissions.
            let mut records: Vec<&MoveRecord> = moves.iter().collect();
            records.sort_by_key(|m| m.submitted_at_ms);
            Some(
                records
                    .iter()
                    .map(|m| RoundMove {
                        player_address: m.peer.clone(),
                        r#move: m.mv.clone(),
                    })
                    .collect::<Vec<_>>(),
            )
        } else {
            None
        };
        let opponent = room.players.iter().find(|p| *p != peer).cloned();
        drop(room);
        if let Some(opponent) = opponent {
            self.send_to(
                challenge_id,
                &opponent,
                &BattleServerMessage::OpponentMoved {
                    player_id: peer.clone(),
                    round,
                    timestamp: now_ms(),
                },
            );
        }
        if let Some(moves) = complete {
            self.broadcast_msg(
                challenge_id,
                &BattleServerMessage::RoundComplete {
                    round,
                    moves,
                    timestamp: now_ms(),
                },
                None,
            );
        }
    }

    fn game_ended(&self, challenge_id: &str, winner: PeerId) {
        let key = RoomKey::Battle(challenge_id.to_string());
        let Some(mut room) = self.rooms.get_mut(challenge_id) else {
            return;
        };
        room.status = BattleStatus::Ended;
        room.winner = Some(winner.clone());
        drop(room);
        self.timers.cancel(&key, TimerKind::BattleStart);
        self.broadcast_msg(
            challenge_id,
            &BattleServerMessage::GameEnded {
                winner: winner.clone(),
                challenge_id: challenge_id.to_string(),
                timestamp: now_ms(),
            },
            None,
        );
        self.timers
            .arm(key, TimerKind::BattleCleanup, CLEANUP_DELAY);
        info!(challenge = challenge_id, winner = %winner, "battle ended");
    }

    fn delete_room(&self, challenge_id: &str, reason: &'static str) {
        let key = RoomKey::Battle(challenge_id.to_string());
        if let Some((_, room)) = self.rooms.remove(challenge_id) {
            self.timers.cancel_room(&key);
            self.registry.close_room(&key, 1000, reason);
            info!(challenge = challenge_id, winner = ?room.winner, "battle room deleted");
        }
    }

    fn send_to(&self, challenge_id: &str, peer: &PeerId, msg: &BattleServerMessage) {
        let text = serde_json::to_string(msg).unwrap_or_else(|_| "{}".into());
        self.registry.send_to(
            &RoomKey::Battle(challenge_id.to_string()),
            peer,
            Message::text(text),
        );
    }

    fn broadcast_msg(&self, challenge_id: &str, msg: &BattleServerMessage, exclude: Option<&PeerId>) {
        let text = serde_json::to_string(msg).unwrap_or_else(|_| "{}".into());
        self.registry.broadcast(
            &RoomKey::Battle(challenge_id.to_string()),
            Message::text(text),
            exclude,
        );
    }

    #[cfg(test)]
    pub fn status_of(&self, challenge_id: &str) -> Option<BattleStatus> {
        self.rooms.get(challenge_id).map(|r| r.status)
    }

    #[cfg(test)]
    pub fn winner_of(&self, challenge_id: &str) -> Option<PeerId> {
        self.rooms.get(challenge_id).and_then(|r| r.winner.clone())
    }
}
