mod arena;
mod battle;
mod registry;
mod router;
mod timer;
mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use warp::http::StatusCode;
use warp::ws::{Message, WebSocket};
use warp::{Filter, Reply};

use crate::arena::ArenaManager;
use crate::battle::BattleManager;
use crate::registry::ConnectionRegistry;
use crate::router::{Router, RouterEvent};
use crate::timer::TimerService;
use crate::types::{now_ms, AppState, Config, HealthResponse, PeerId, RoomKey};

const SERVICE_NAME: &str = "arena-coordinator-server";

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const STATS_INTERVAL: Duration = Duration::from_secs(60);
const BATTLE_SCAN_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(Config::from_env());
    let (router_tx, router_rx) = mpsc::unbounded_channel();
    let timers = Arc::new(TimerService::new(router_tx.clone()));
    let registry = Arc::new(ConnectionRegistry::new());
    let arenas = Arc::new(ArenaManager::new(registry.clone(), timers.clone()));
    let battles = Arc::new(BattleManager::new(registry.clone(), timers.clone()));
    let state = AppState {
        config: config.clone(),
        registry: registry.clone(),
        arenas: arenas.clone(),
        battles: battles.clone(),
        router_tx,
        started_at: Instant::now(),
    };

    tokio::spawn(Router::new(registry.clone(), arenas, battles, timers).run(router_rx));
    spawn_sweepers(&state);

    let state_filter = warp::any().map(move || state.clone());

    // WebSocket /battle?challengeId=..&playerId=..
    let battle_route = warp::path("battle")
        .and(warp::ws())
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::header::optional::<String>("origin"))
        .and(state_filter.clone())
        .and_then(upgrade_battle);

    // WebSocket on any other path ?gameId=..&playerId=..
    let arena_route = warp::ws()
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::header::optional::<String>("origin"))
        .and(state_filter.clone())
        .and_then(upgrade_arena);

    // GET / and GET /health
    let health_route = warp::get()
        .and(warp::path::end().or(warp::path("health")).unify())
        .and(state_filter.clone())
        .map(health_reply);

    let routes = battle_route.or(arena_route).or(health_route).with(
        warp::cors()
            .allow_any_origin()
            .allow_methods(vec!["GET", "POST", "OPTIONS"])
            .allow_header("content-type"),
    );

    let (addr, server) = warp::serve(routes)
        .try_bind_with_graceful_shutdown(([0, 0, 0, 0], config.port), shutdown_signal())?;
    info!(%addr, production = config.production, "coordinator server listening");
    server.await;

    info!("shutting down, closing open connections");
    registry.close_all(1001, "Server shutting down");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = ctrl_c.await;
        }
    }
    info!("termination signal received");
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("termination signal received");
}

// Sweeps go through the event queue; stats are read-only and logged in place.
fn spawn_sweepers(state: &AppState) {
    spawn_periodic(state.router_tx.clone(), HEARTBEAT_INTERVAL, || {
        RouterEvent::HeartbeatSweep
    });
    spawn_periodic(state.router_tx.clone(), STALE_SWEEP_INTERVAL, || {
        RouterEvent::StaleSweep
    });
    spawn_periodic(state.router_tx.clone(), BATTLE_SCAN_INTERVAL, || {
        RouterEvent::BattleCleanupScan
    });

    let stats = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATS_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            info!(
                arena_rooms = stats.arenas.room_count(),
                battle_rooms = stats.battles.room_count(),
                connections = stats.registry.connection_count(),
                "server stats"
            );
        }
    });
}

fn spawn_periodic(
    tx: mpsc::UnboundedSender<RouterEvent>,
    period: Duration,
    make_event: impl Fn() -> RouterEvent + Send + 'static,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick is immediate; skip it so sweeps start one period in.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if tx.send(make_event()).is_err() {
                break;
            }
        }
    });
}

async fn upgrade_arena(
    ws: warp::ws::Ws,
    query: HashMap<String, String>,
    origin: Option<String>,
    state: AppState,
) -> Result<Box<dyn Reply>, warp::Rejection> {
    if !state.config.origin_allowed(origin.as_deref()) {
        warn!(
            origin = origin.as_deref().unwrap_or("<none>"),
            "upgrade rejected by origin policy"
        );
        return Ok(Box::new(warp::reply::with_status(
            "Forbidden",
            StatusCode::FORBIDDEN,
        )));
    }
    Ok(Box::new(ws.on_upgrade(move |socket| {
        handle_arena_socket(socket, query, state)
    })))
}

async fn upgrade_battle(
    ws: warp::ws::Ws,
    query: HashMap<String, String>,
    origin: Option<String>,
    state: AppState,
) -> Result<Box<dyn Reply>, warp::Rejection> {
    if !state.config.origin_allowed(origin.as_deref()) {
        warn!(
            origin = origin.as_deref().unwrap_or("<none>"),
            "upgrade rejected by origin policy"
        );
        return Ok(Box::new(warp::reply::with_status(
            "Forbidden",
            StatusCode::FORBIDDEN,
        )));
    }
    Ok(Box::new(ws.on_upgrade(move |socket| {
        handle_battle_socket(socket, query, state)
    })))
}

async fn handle_arena_socket(socket: WebSocket, query: HashMap<String, String>, state: AppState) {
    let Some((game_id, peer)) = arena_params(&query) else {
        reject_socket(socket).await;
        return;
    };
    serve_socket(socket, RoomKey::Arena(game_id), peer, state).await;
}

async fn handle_battle_socket(socket: WebSocket, query: HashMap<String, String>, state: AppState) {
    let Some((challenge_id, peer)) = battle_params(&query) else {
        reject_socket(socket).await;
        return;
    };
    serve_socket(socket, RoomKey::Battle(challenge_id), peer, state).await;
}

fn arena_params(query: &HashMap<String, String>) -> Option<(i64, PeerId)> {
    let game_id = query.get("gameId")?.parse().ok()?;
    let peer = query.get("playerId").filter(|v| !v.is_empty())?.clone();
    Some((game_id, peer))
}

fn battle_params(query: &HashMap<String, String>) -> Option<(String, PeerId)> {
    let challenge_id = query.get("challengeId").filter(|v| !v.is_empty())?.clone();
    let peer = query.get("playerId").filter(|v| !v.is_empty())?.clone();
    Some((challenge_id, peer))
}

// Policy close before any application frame is sent.
async fn reject_socket(socket: WebSocket) {
    let (mut ws_tx, _) = socket.split();
    let _ = ws_tx
        .send(Message::close_with(1008u16, "Invalid parameters"))
        .await;
    let _ = ws_tx.close().await;
    debug!("connection rejected: invalid parameters");
}

async fn serve_socket(socket: WebSocket, room: RoomKey, peer: PeerId, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // task to forward queued outbound frames to the websocket
    let forward = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = msg.is_close();
            if ws_tx.send(msg).await.is_err() {
                break;
            }
            if closing {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let conn_id = state.registry.add(room.clone(), peer.clone(), tx);
    info!(room = %room, player = %peer, "peer connected");
    let join = match &room {
        RoomKey::Arena(game_id) => RouterEvent::ArenaJoin {
            game_id: *game_id,
            peer: peer.clone(),
        },
        RoomKey::Battle(challenge_id) => RouterEvent::BattleJoin {
            challenge_id: challenge_id.clone(),
            peer: peer.clone(),
            conn_id,
        },
    };
    let _ = state.router_tx.send(join);

    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(msg) => {
                if msg.is_text() {
                    let text = msg.to_str().unwrap_or("").to_string();
                    let _ = state.router_tx.send(RouterEvent::Inbound {
                        room: room.clone(),
                        peer: peer.clone(),
                        text,
                    });
                } else if msg.is_ping() || msg.is_pong() {
                    state.registry.touch(&room, &peer);
                } else if msg.is_close() {
                    break;
                }
            }
            Err(err) => {
                debug!(room = %room, player = %peer, error = %err, "websocket error");
                break;
            }
        }
    }

    info!(room = %room, player = %peer, "peer disconnected");
    let _ = state.router_tx.send(RouterEvent::Disconnect {
        room,
        peer,
        conn_id,
    });
    forward.abort();
}

fn health_reply(state: AppState) -> impl Reply {
    warp::reply::json(&HealthResponse {
        status: "ok",
        service: SERVICE_NAME,
        games: state.arenas.room_count() + state.battles.room_count(),
        players: state.registry.connection_count(),
        uptime: state.started_at.elapsed().as_secs(),
        timestamp: now_ms(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn arena_params_require_an_integer_game_id() {
        assert_eq!(
            arena_params(&query(&[("gameId", "7"), ("playerId", "alice")])),
            Some((7, "alice".to_string()))
        );
        assert!(arena_params(&query(&[("gameId", "seven"), ("playerId", "alice")])).is_none());
        assert!(arena_params(&query(&[("playerId", "alice")])).is_none());
    }

    #[test]
    fn arena_params_reject_an_empty_player_id() {
        assert!(arena_params(&query(&[("gameId", "7"), ("playerId", "")])).is_none());
        assert!(arena_params(&query(&[("gameId", "7")])).is_none());
    }

    #[test]
    fn battle_params_require_both_ids() {
        assert_eq!(
            battle_params(&query(&[("challengeId", "x"), ("playerId", "A")])),
            Some(("x".to_string(), "A".to_string()))
        );
        assert!(battle_params(&query(&[("challengeId", ""), ("playerId", "A")])).is_none());
        assert!(battle_params(&query(&[("challengeId", "x")])).is_none());
    }
}
