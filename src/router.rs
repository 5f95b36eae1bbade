use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::arena::ArenaManager;
use crate::battle::BattleManager;
use crate::registry::ConnectionRegistry;
use crate::timer::{TimerKind, TimerService};
use crate::types::{now_ms, PeerId, RoomKey};

// Everything that mutates session state arrives as one of these on a single
// queue; the router task applies them in arrival order.
#[derive(Debug)]
pub(crate) enum RouterEvent {
    ArenaJoin {
        game_id: i64,
        peer: PeerId,
    },
    BattleJoin {
        challenge_id: String,
        peer: PeerId,
        conn_id: Uuid,
    },
    Inbound {
        room: RoomKey,
        peer: PeerId,
        text: String,
    },
    Disconnect {
        room: RoomKey,
        peer: PeerId,
        conn_id: Uuid,
    },
    TimerFired {
        room: RoomKey,
        kind: TimerKind,
        generation: u64,
    },
    HeartbeatSweep,
    StaleSweep,
    BattleCleanupScan,
}

const STALE_AFTER_MS: i64 = 60_000;

enum ParseError {
    Malformed(serde_json::Error),
    Unsupported(String),
}

// Reads the type field first so an unknown type is distinguishable from a
// garbled frame in the logs; both are dropped either way.
fn parse_envelope<T: DeserializeOwned>(text: &str) -> Result<T, ParseError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(ParseError::Malformed)?;
    let ty = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string);
    match serde_json::from_value(value) {
        Ok(msg) => Ok(msg),
        Err(err) => match ty {
            Some(ty) => Err(ParseError::Unsupported(ty)),
            None => Err(ParseError::Malformed(err)),
        },
    }
}

pub(crate) struct Router {
    registry: Arc<ConnectionRegistry>,
    arenas: Arc<ArenaManager>,
    battles: Arc<BattleManager>,
    timers: Arc<TimerService>,
}

impl Router {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        arenas: Arc<ArenaManager>,
        battles: Arc<BattleManager>,
        timers: Arc<TimerService>,
    ) -> Self {
        Self {
            registry,
            arenas,
            battles,
            timers,
        }
    }

    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<RouterEvent>) {
        while let Some(event) = rx.recv().await {
            self.dispatch(event);
        }
        info!("router queue closed");
    }

    pub fn dispatch(&self, event: RouterEvent) {
        match event {
            RouterEvent::ArenaJoin { game_id, peer } => {
                self.arenas.handle_join(game_id, &peer);
            }
            RouterEvent::BattleJoin {
                challenge_id,
                peer,
                conn_id,
            } => {
                self.battles.handle_join(&challenge_id, &peer, conn_id);
            }
            RouterEvent::Inbound { room, peer, text } => self.inbound(room, &peer, &text),
            RouterEvent::Disconnect {
                room,
                peer,
                conn_id,
            } => {
                // only the current holder's disconnect tears down session state
                if self.registry.remove(&room, &peer, conn_id) {
                    self.peer_gone(&room, &peer);
                }
            }
            RouterEvent::TimerFired {
                room,
                kind,
                generation,
            } => {
                if !self.timers.acknowledge(&room, kind, generation) {
                    debug!(room = %room, ?kind, "stale timer firing ignored");
                    return;
                }
                match &room {
                    RoomKey::Arena(game_id) => self.arenas.handle_timer(*game_id, kind),
                    RoomKey::Battle(challenge_id) => {
                        self.battles.handle_timer(challenge_id, kind)
                    }
                }
            }
            RouterEvent::HeartbeatSweep => {
                for (room, peer, _) in self.registry.ping_pass() {
                    info!(room = %room, player = %peer, "connection failed heartbeat");
                    self.peer_gone(&room, &peer);
                }
            }
            RouterEvent::StaleSweep => {
                for (room, peer, _) in self.registry.sweep_stale(now_ms(), STALE_AFTER_MS) {
                    info!(room = %room, player = %peer, "connection stale, evicted");
                    self.peer_gone(&room, &peer);
                }
                self.arenas.sweep_empty();
                self.battles.sweep_empty();
            }
            RouterEvent::BattleCleanupScan => {
                let removed = self.battles.cleanup_scan(now_ms());
                if removed > 0 {
                    info!(removed, "expired battle rooms reaped");
                }
            }
        }
    }

    fn inbound(&self, room: RoomKey, peer: &PeerId, text: &str) {
        match &room {
            RoomKey::Arena(game_id) => match parse_envelope(text) {
                Ok(msg) => self.arenas.handle_message(*game_id, peer, msg),
                Err(err) => log_drop(&room, peer, err),
            },
            RoomKey::Battle(challenge_id) => match parse_envelope(text) {
                Ok(msg) => self.battles.handle_message(challenge_id, peer, msg),
                Err(err) => log_drop(&room, peer, err),
            },
        }
    }

    fn peer_gone(&self, room: &RoomKey, peer: &PeerId) {
        match room {
            RoomKey::Arena(game_id) => self.arenas.handle_disconnect(*game_id, peer),
            RoomKey::Battle(challenge_id) => self.battles.handle_disconnect(challenge_id, peer),
        }
    }
}

fn log_drop(room: &RoomKey, peer: &PeerId, err: ParseError) {
    match err {
        ParseError::Malformed(err) => {
            warn!(room = %room, player = %peer, error = %err, "malformed frame dropped");
        }
        ParseError::Unsupported(ty) => {
            warn!(room = %room, player = %peer, r#type = %ty, "unsupported envelope dropped");
        }
    }
}
