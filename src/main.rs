mod auth;
mod config;
mod domain;
mod dungeon;
mod events;
mod game;
mod intelligence;
mod services;
mod websocket;

use std::path::Path;
use std::sync::Arc;

use axum::{routing::get, Router};
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;

use auth::AuthService;
use config::Config;
use events::EventBus;
use game::{GameDeps, GameRegistry};
use services::{
    FileStorage, MonsterService, PlayerRegistry, PlayerStatsTracker, SqliteStorage, Storage,
};

pub(crate) struct AppState {
    pub(crate) config: Config,
    pub(crate) auth: AuthService,
    pub(crate) players: Arc<PlayerRegistry>,
    pub(crate) stats: Arc<PlayerStatsTracker>,
    pub(crate) games: Arc<GameRegistry>,
    pub(crate) events: EventBus,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    // Try loading config from current directory, then parent directory
    let config = Config::load("config.toml")
        .or_else(|_| Config::load("../config.toml"))
        .unwrap_or_else(|_| {
            tracing::warn!("config.toml not found, using defaults");
            Config::default()
        });

    let host = config.server.host.clone();
    let port = config.server.port;

    // Storage backend: one interface, picked in config
    let storage: Arc<dyn Storage> = match config.storage.backend.as_str() {
        "sqlite" => Arc::new(
            SqliteStorage::new(Path::new(&config.storage.sqlite_file))
                .await
                .expect("failed to initialize sqlite storage"),
        ),
        _ => Arc::new(FileStorage::new(config.storage.data_dir.clone().into())),
    };
    tracing::info!(backend = %config.storage.backend, "storage initialized");

    let events = EventBus::default();
    let shutdown = CancellationToken::new();

    // Monster AI service owns the species knowledge store and consumes
    // reward events from every game
    let monsters = Arc::new(
        MonsterService::new(storage.clone(), events.clone(), config.ai.clone()).await,
    );
    let reward_task = monsters.spawn_reward_consumer(shutdown.clone());

    let players = Arc::new(
        PlayerRegistry::new(storage.clone(), config.auth.max_profiles_per_user).await,
    );
    let registry_task = players.spawn_flush_task(shutdown.clone());

    let stats = Arc::new(PlayerStatsTracker::new(storage.clone(), events.clone()).await);
    let stats_task = stats.spawn_tracker(shutdown.clone());

    let games = GameRegistry::new(
        GameDeps {
            storage: storage.clone(),
            monsters: monsters.clone(),
            events: events.clone(),
            settings: config.game.clone(),
        },
        config.multi_game.clone(),
    );
    games.restore_games().await;
    let cleanup_task = games.spawn_cleanup_task(shutdown.clone());

    let auth = AuthService::new(storage.clone());

    let state = Arc::new(AppState {
        config,
        auth,
        players,
        stats,
        games,
        events: events.clone(),
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket::ws_handler))
        .route("/api/games", get(list_games))
        .route("/api/leaderboard", get(leaderboard))
        .route("/api/events", get(recent_events))
        .fallback_service(ServeDir::new("../frontend/dist"))
        .with_state(state.clone());

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind to address");
    tracing::info!(%addr, "dungeon server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server failed");

    // Orderly teardown: stop background tasks, then flush everything
    tracing::info!("shutting down");
    shutdown.cancel();
    for task in [reward_task, registry_task, stats_task, cleanup_task] {
        let _ = task.await;
    }
    state.games.shutdown().await;
    state.players.save().await;
    state.stats.save().await;
    monsters.save().await;
    tracing::info!("shutdown complete");
}

async fn health_check() -> &'static str {
    "OK"
}

/// Lobby listing of active games.
async fn list_games(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({"games": state.games.list_games().await}))
}

/// Top players by experience.
async fn leaderboard(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({"leaderboard": state.stats.xp_leaderboard(10).await}))
}

/// Recent event-bus activity, for diagnostics.
async fn recent_events(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({"events": state.events.recent(100)}))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
