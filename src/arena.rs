use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use warp::ws::Message;

use crate::registry::ConnectionRegistry;
use crate::timer::{TimerKind, TimerService};
use crate::types::{now_ms, PeerId, RoomKey};

const COUNTDOWN_MS: i64 = 15_000;
const AUTO_START_DELAY: Duration = Duration::from_secs(1);

// Phases only ever move forward.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Phase {
    Waiting,
    Countdown,
    Active,
    Ended,
}

pub(crate) struct ArenaRoom {
    game_id: i64,
    phase: Phase,
    countdown_start_ms: Option<i64>,
    countdown_duration_ms: i64,
    start_ms: Option<i64>,
    winner: Option<PeerId>,
    // latest client-supplied state per peer, stored verbatim
    players: HashMap<PeerId, Value>,
    ready: HashSet<PeerId>,
}

impl ArenaRoom {
    fn new(game_id: i64) -> Self {
        Self {
            game_id,
            phase: Phase::Waiting,
            countdown_start_ms: None,
            countdown_duration_ms: COUNTDOWN_MS,
            start_ms: None,
            winner: None,
            players: HashMap::new(),
            ready: HashSet::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ArenaClientMessage {
    Heartbeat,
    MarkReady,
    StartGame,
    SetDeadline { deadline: i64 },
    Update { data: Value },
    Eliminated,
    #[serde(rename_all = "camelCase")]
    Winner { winner_id: PeerId },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ArenaServerMessage {
    Sync {
        players: Vec<SyncPlayer>,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    GameStateUpdate {
        game_state: GameStateSnapshot,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    PlayerConnected { player_id: PeerId, timestamp: i64 },
    #[serde(rename_all = "camelCase")]
    PlayerDisconnected { player_id: PeerId, timestamp: i64 },
    #[serde(rename_all = "camelCase")]
    Update {
        player_id: PeerId,
        data: Value,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    Eliminated { player_id: PeerId, timestamp: i64 },
    #[serde(rename_all = "camelCase")]
    Winner { winner_id: PeerId, timestamp: i64 },
    HeartbeatAck { timestamp: i64 },
    Error { message: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SyncPlayer {
    pub player_id: PeerId,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GameStateSnapshot {
    pub phase: Phase,
    pub countdown_start_time: Option<i64>,
    pub countdown_duration: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner_id: Option<PeerId>,
    pub ready_players: usize,
    pub total_players: usize,
}

pub(crate) struct ArenaManager {
    rooms: DashMap<i64, ArenaRoom>,
    registry: Arc<ConnectionRegistry>,
    timers: Arc<TimerService>,
}

impl ArenaManager {
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

    pub fn handle_join(&self, game_id: i64, peer: &PeerId) {
        let created = !self.rooms.contains_key(&game_id);
        let room = self
            .rooms
            .entry(game_id)
            .or_insert_with(|| ArenaRoom::new(game_id));
        let players: Vec<SyncPlayer> = room
            .players
            .iter()
            .map(|(id, data)| SyncPlayer {
                player_id: id.clone(),
                data: data.clone(),
            })
            .collect();
        let snapshot = self.snapshot_of(&room);
        drop(room);
        if created {
            info!(game = game_id, "arena room created");
        }
        self.send_to(
            game_id,
            peer,
            &ArenaServerMessage::Sync {
                players,
                timestamp: now_ms(),
            },
        );
        self.broadcast_msg(
            game_id,
            &ArenaServerMessage::PlayerConnected {
                player_id: peer.clone(),
                timestamp: now_ms(),
            },
            Some(peer),
        );
        self.send_to(
            game_id,
            peer,
            &ArenaServerMessage::GameStateUpdate {
                game_state: snapshot,
                timestamp: now_ms(),
            },
        );
    }

    pub fn handle_message(&self, game_id: i64, peer: &PeerId, msg: ArenaClientMessage) {
        match msg {
            ArenaClientMessage::Heartbeat => {
                self.registry.touch(&RoomKey::Arena(game_id), peer);
                self.send_to(
                    game_id,
                    peer,
                    &ArenaServerMessage::HeartbeatAck {
                        timestamp: now_ms(),
                    },
                );
            }
            ArenaClientMessage::MarkReady => self.mark_ready(game_id, peer),
            ArenaClientMessage::StartGame => self.try_start(game_id, Some(peer)),
            ArenaClientMessage::SetDeadline { deadline } => self.set_deadline(game_id, deadline),
            ArenaClientMessage::Update { data } => self.update(game_id, peer, data),
            ArenaClientMessage::Eliminated => self.eliminated(game_id, peer),
            ArenaClientMessage::Winner { winner_id } => self.force_winner(game_id, winner_id),
        }
    }

    pub fn handle_timer(&self, game_id: i64, kind: TimerKind) {
        match kind {
            TimerKind::AutoStart | TimerKind::Deadline => self.try_start(game_id, None),
            TimerKind::Countdown => self.finish_countdown(game_id),
            _ => {}
        }
    }

    // Called after the registry record is already gone.
    pub fn handle_disconnect(&self, game_id: i64, peer: &PeerId) {
        let key = RoomKey::Arena(game_id);
        let Some(mut room) = self.rooms.get_mut(&game_id) else {
            return;
        };
        room.players.remove(peer);
        room.ready.remove(peer);
        let snapshot = self.snapshot_of(&room);
        drop(room);
        self.broadcast_msg(
            game_id,
            &ArenaServerMessage::PlayerDisconnected {
                player_id: peer.clone(),
                timestamp: now_ms(),
            },
            None,
        );
        self.broadcast_state(game_id, snapshot);
        if self.registry.peers_of(&key).is_empty() {
            self.timers.cancel_room(&key);
            self.rooms.remove(&game_id);
            info!(game = game_id, "arena room deleted");
        }
    }

    pub fn sweep_empty(&self) -> usize {
        let empty: Vec<i64> = self
            .rooms
            .iter()
            .map(|e| *e.key())
            .filter(|id| self.registry.peers_of(&RoomKey::Arena(*id)).is_empty())
            .collect();
        for game_id in &empty {
            self.timers.cancel_room(&RoomKey::Arena(*game_id));
            self.rooms.remove(game_id);
        }
        empty.len()
    }

    fn mark_ready(&self, game_id: i64, peer: &PeerId) {
        let Some(mut room) = self.rooms.get_mut(&game_id) else {
            return;
        };
        if room.phase != Phase::Waiting {
            debug!(game = game_id, player = %peer, "mark_ready outside waiting phase");
            return;
        }
        if !room.ready.insert(peer.clone()) {
            return;
        }
        let ready = room.ready.len();
        let snapshot = self.snapshot_of(&room);
        drop(room);
        self.broadcast_state(game_id, snapshot);
        if ready >= 2 {
            self.timers
                .arm(RoomKey::Arena(game_id), TimerKind::AutoStart, AUTO_START_DELAY);
        }
    }

    // One ready player wins outright, two or more enter the countdown, zero
    // is an error back to the requester (if any).
    fn try_start(&self, game_id: i64, requester: Option<&PeerId>) {
        let key = RoomKey::Arena(game_id);
        let Some(mut room) = self.rooms.get_mut(&game_id) else {
            return;
        };
        if room.phase != Phase::Waiting {
            return;
        }
        if room.ready.is_empty() {
            drop(room);
            if let Some(peer) = requester {
                self.send_to(
                    game_id,
                    peer,
                    &ArenaServerMessage::Error {
                        message: "No players ready".to_string(),
                    },
                );
            }
            return;
        }
        if room.ready.len() == 1 {
            let Some(winner) = room.ready.iter().next().cloned() else {
                return;
            };
            room.phase = Phase::Ended;
            room.winner = Some(winner.clone());
            let snapshot = self.snapshot_of(&room);
            drop(room);
            self.timers.cancel_room(&key);
            self.broadcast_state(game_id, snapshot);
            self.broadcast_msg(
                game_id,
                &ArenaServerMessage::Winner {
                    winner_id: winner,
                    timestamp: now_ms(),
                },
                None,
            );
            info!(game = game_id, "single ready player wins by default");
            return;
        }
        room.phase = Phase::Countdown;
        room.countdown_start_ms = Some(now_ms());
        let duration_ms = room.countdown_duration_ms;
        let snapshot = self.snapshot_of(&room);
        drop(room);
        self.timers.cancel(&key, TimerKind::AutoStart);
        self.timers.cancel(&key, TimerKind::Deadline);
        self.timers.arm(
            key,
            TimerKind::Countdown,
            Duration::from_millis(duration_ms as u64),
        );
        self.broadcast_state(game_id, snapshot);
        info!(game = game_id, "countdown started");
    }

    fn finish_countdown(&self, game_id: i64) {
        let Some(mut room) = self.rooms.get_mut(&game_id) else {
            return;
        };
        if room.phase != Phase::Countdown {
            return;
        }
        room.phase = Phase::Active;
        room.start_ms = Some(now_ms());
        let snapshot = self.snapshot_of(&room);
        drop(room);
        self.broadcast_state(game_id, snapshot);
        info!(game = game_id, "game active");
    }

    fn set_deadline(&self, game_id: i64, deadline: i64) {
        if !self.rooms.contains_key(&game_id) {
            return;
        }
        let delay = deadline - now_ms();
        if delay <= 0 {
            self.try_start(game_id, None);
        } else {
            self.timers.arm(
                RoomKey::Arena(game_id),
                TimerKind::Deadline,
                Duration::from_millis(delay as u64),
            );
        }
    }

    fn update(&self, game_id: i64, peer: &PeerId, data: Value) {
        let Some(mut room) = self.rooms.get_mut(&game_id) else {
            return;
        };
        room.players.insert(peer.clone(), data.clone());
        drop(room);
        self.broadcast_msg(
            game_id,
            &ArenaServerMessage::Update {
                player_id: peer.clone(),
                data,
                timestamp: now_ms(),
            },
            Some(peer),
        );
    }

    fn eliminated(&self, game_id: i64, peer: &PeerId) {
        let Some(mut room) = self.rooms.get_mut(&game_id) else {
            return;
        };
        if let Some(state) = room.players.get_mut(peer) {
            if let Some(obj) = state.as_object_mut() {
                obj.insert("alive".to_string(), Value::Bool(false));
            }
        }
        // End-game detection counts client-reported alive flags, and only
        // once the game is actually running.
        let mut ended = None;
        if room.phase == Phase::Active {
            let alive: Vec<PeerId> = room
                .players
                .iter()
                .filter(|(_, state)| {
                    state.get("alive").and_then(Value::as_bool).unwrap_or(false)
                })
                .map(|(id, _)| id.clone())
                .collect();
            if alive.len() == 1 {
                if let Some(winner) = alive.into_iter().next() {
                    room.phase = Phase::Ended;
                    room.winner = Some(winner.clone());
                    ended = Some((winner, self.snapshot_of(&room)));
                }
            }
        }
        drop(room);
        self.broadcast_msg(
            game_id,
            &ArenaServerMessage::Eliminated {
                player_id: peer.clone(),
                timestamp: now_ms(),
            },
            Some(peer),
        );
        if let Some((winner, snapshot)) = ended {
            self.timers
                .cancel(&RoomKey::Arena(game_id), TimerKind::Countdown);
            self.broadcast_msg(
                game_id,
                &ArenaServerMessage::Winner {
                    winner_id: winner.clone(),
                    timestamp: now_ms(),
                },
                None,
            );
            self.broadcast_state(game_id, snapshot);
            info!(game = game_id, winner = %winner, "last player standing");
        }
    }

    fn force_winner(&self, game_id: i64, winner_id: PeerId) {
        let key = RoomKey::Arena(game_id);
        let Some(mut room) = self.rooms.get_mut(&game_id) else {
            return;
        };
        room.phase = Phase::Ended;
        room.winner = Some(winner_id.clone());
        let snapshot = self.snapshot_of(&room);
        drop(room);
        self.timers.cancel(&key, TimerKind::Countdown);
        self.timers.cancel(&key, TimerKind::AutoStart);
        self.timers.cancel(&key, TimerKind::Deadline);
        self.broadcast_msg(
            game_id,
            &ArenaServerMessage::Winner {
                winner_id,
                timestamp: now_ms(),
            },
            None,
        );
        self.broadcast_state(game_id, snapshot);
    }

    fn snapshot_of(&self, room: &ArenaRoom) -> GameStateSnapshot {
        GameStateSnapshot {
            phase: room.phase,
            countdown_start_time: room.countdown_start_ms,
            countdown_duration: room.countdown_duration_ms,
            start_time: room.start_ms,
            winner_id: room.winner.clone(),
            ready_players: room.ready.len(),
            total_players: self
                .registry
                .peers_of(&RoomKey::Arena(room.game_id))
                .len(),
        }
    }

    fn broadcast_state(&self, game_id: i64, snapshot: GameStateSnapshot) {
        self.broadcast_msg(
            game_id,
            &ArenaServerMessage::GameStateUpdate {
                game_state: snapshot,
                timestamp: now_ms(),
            },
            None,
        );
    }

    fn send_to(&self, game_id: i64, peer: &PeerId, msg: &ArenaServerMessage) {
        let text = serde_json::to_string(msg).unwrap_or_else(|_| "{}".into());
        self.registry
            .send_to(&RoomKey::Arena(game_id), peer, Message::text(text));
    }

    fn broadcast_msg(&self, game_id: i64, msg: &ArenaServerMessage, exclude: Option<&PeerId>) {
        let text = serde_json::to_string(msg).unwrap_or_else(|_| "{}".into());
        self.registry
            .broadcast(&RoomKey::Arena(game_id), Message::text(text), exclude);
    }

    #[cfg(test)]
    pub fn phase_of(&self, game_id: i64) -> Option<Phase> {
        self.rooms.get(&game_id).map(|r| r.phase)
    }

    #[cfg(test)]
    pub fn winner_of(&self, game_id: i64) -> Option<PeerId> {
        self.rooms.get(&game_id).and_then(|r| r.winner.clone())
    }
}
