use std::fmt;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::arena::ArenaManager;
use crate::battle::BattleManager;
use crate::registry::ConnectionRegistry;
use crate::router::RouterEvent;

// Opaque, client-chosen; the server never interprets it.
pub(crate) type PeerId = String;

// Arena and battle rooms share no namespace.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub(crate) enum RoomKey {
    Arena(i64),
    Battle(String),
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomKey::Arena(id) => write!(f, "arena/{}", id),
            RoomKey::Battle(id) => write!(f, "battle/{}", id),
        }
    }
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) config: Arc<Config>,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) arenas: Arc<ArenaManager>,
    pub(crate) battles: Arc<BattleManager>,
    pub(crate) router_tx: mpsc::UnboundedSender<RouterEvent>,
    pub(crate) started_at: Instant,
}

// Read once from the environment at startup.
#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub port: u16,
    pub production: bool,
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let port = std::env::var("PORT")
            .or_else(|_| std::env::var("WS_PORT"))
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3001);
        let production = std::env::var("NODE_ENV")
            .map(|v| v == "production")
            .unwrap_or(false);
        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        Self {
            port,
            production,
            allowed_origins,
        }
    }

    // Only enforced in production; a `*` entry or an empty list disables it.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if !self.production
            || self.allowed_origins.is_empty()
            || self.allowed_origins.iter().any(|o| o == "*")
        {
            return true;
        }
        match origin {
            Some(origin) => self.allowed_origins.iter().any(|o| o == origin),
            None => false,
        }
    }
}

#[derive(Serialize)]
pub(crate) struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub games: usize,
    pub players: usize,
    pub uptime: u64,
    pub timestamp: i64,
    pub version: &'static str,
}

// Milliseconds since the unix epoch, the timestamp unit of every envelope.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(production: bool, origins: &[&str]) -> Config {
        Config {
            port: 3001,
            production,
            allowed_origins: origins.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn origin_check_disabled_outside_production() {
        let cfg = config(false, &["https://game.example"]);
        assert!(cfg.origin_allowed(Some("https://evil.example")));
        assert!(cfg.origin_allowed(None));
    }

    #[test]
    fn origin_check_enforced_in_production() {
        let cfg = config(true, &["https://game.example"]);
        assert!(cfg.origin_allowed(Some("https://game.example")));
        assert!(!cfg.origin_allowed(Some("https://evil.example")));
        assert!(!cfg.origin_allowed(None));
    }

    #[test]
    fn wildcard_origin_disables_check() {
        let cfg = config(true, &["*"]);
        assert!(cfg.origin_allowed(Some("https://anything.example")));
        assert!(cfg.origin_allowed(None));
    }

    #[test]
    fn empty_allow_list_disables_check() {
        let cfg = config(true, &[]);
        assert!(cfg.origin_allowed(None));
    }

    #[test]
    fn room_keys_do_not_collide_across_flavors() {
        assert_ne!(RoomKey::Arena(7), RoomKey::Battle("7".to_string()));
        assert_eq!(RoomKey::Arena(7), RoomKey::Arena(7));
    }
}
