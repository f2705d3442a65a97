//! Central registry owning all game instances: lifecycle, player routing,
//! restore on startup, and garbage collection of dead games.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{GameSettings, MultiGameSettings};
use crate::game::instance::{Game, GameDeps};

struct RegistryState {
    games: HashMap<String, Arc<Game>>,
    /// player_token -> game_id routing.
    player_to_game: HashMap<String, String>,
}

pub struct GameRegistry {
    deps: GameDeps,
    multi: MultiGameSettings,
    state: Mutex<RegistryState>,
}

impl GameRegistry {
    pub fn new(deps: GameDeps, multi: MultiGameSettings) -> Arc<Self> {
        tracing::info!(
            max_players = multi.max_players_per_game,
            inactive_timeout_minutes = multi.game_inactive_timeout_minutes,
            grace_period_minutes = multi.completed_game_grace_period_minutes,
            "game registry ready"
        );
        Arc::new(GameRegistry {
            deps,
            multi,
            state: Mutex::new(RegistryState {
                games: HashMap::new(),
                player_to_game: HashMap::new(),
            }),
        })
    }

    /// Periodic cleanup of inactive and completed games.
    pub fn spawn_cleanup_task(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => registry.cleanup_games().await,
                }
            }
        })
    }

    fn generate_game_id() -> String {
        uuid::Uuid::new_v4().to_string()[..8].to_string()
    }

    /// A short evocative dungeon name. The narrative generator is an
    /// external collaborator; this is the built-in fallback.
    fn generate_game_name() -> String {
        const PLACES: [&str; 8] = [
            "Catacombs", "Depths", "Halls", "Warrens", "Crypts", "Vaults", "Caverns", "Ruins",
        ];
        const EPITHETS: [&str; 8] = [
            "of Ember", "of the Forgotten King", "of Whispers", "of the Pale Moon",
            "of Rust", "of Hollow Stars", "of the Drowned", "of Silent Bells",
        ];
        let mut rng = rand::thread_rng();
        let place = PLACES.choose(&mut rng).unwrap_or(&"Depths");
        let epithet = EPITHETS.choose(&mut rng).unwrap_or(&"of Ember");
        format!("{place} {epithet}")
    }

    /// Create and initialize a new game.
    pub async fn create_game(
        &self,
        name: Option<String>,
        map_width: Option<i32>,
        map_height: Option<i32>,
        room_count: Option<usize>,
    ) -> Arc<Game> {
        let game_id = Self::generate_game_id();
        let name = name.unwrap_or_else(Self::generate_game_name);
        let game = Game::new(game_id.clone(), name.clone(), self.deps.clone());
        game.initialize(None, map_width, map_height, room_count).await;

        self.state.lock().await.games.insert(game_id.clone(), game.clone());
        tracing::info!(game_id = %game_id, name = %name, "created game");
        game
    }

    /// First game with room for another connected player, or a fresh one.
    pub async fn get_or_create_joinable_game(&self) -> Arc<Game> {
        let candidates: Vec<Arc<Game>> = {
            let state = self.state.lock().await;
            state.games.values().cloned().collect()
        };
        for game in candidates {
            let status = game.status().await;
            if !status.is_completed && status.active_player_count < self.multi.max_players_per_game
            {
                return game;
            }
        }
        self.create_game(None, None, None, None).await
    }

    pub async fn get_game(&self, game_id: &str) -> Option<Arc<Game>> {
        self.state.lock().await.games.get(game_id).cloned()
    }

    pub async fn game_for_player(&self, player_token: &str) -> Option<Arc<Game>> {
        let state = self.state.lock().await;
        let game_id = state.player_to_game.get(player_token)?;
        state.games.get(game_id).cloned()
    }

    /// Route a token to a game, moving it off any previous game. Completed
    /// games stay joinable for exploration.
    pub async fn assign_player_to_game(&self, player_token: &str, game_id: &str) -> bool {
        let (game, previous) = {
            let state = self.state.lock().await;
            let Some(game) = state.games.get(game_id).cloned() else {
                return false;
            };
            let previous = state
                .player_to_game
                .get(player_token)
                .filter(|gid| gid.as_str() != game_id)
                .and_then(|gid| state.games.get(gid).cloned());
            (game, previous)
        };

        let status = game.status().await;
        if !status.is_completed && status.active_player_count >= self.multi.max_players_per_game {
            return false;
        }

        if let Some(old_game) = previous {
            old_game.remove_player_by_token(player_token).await;
        }

        self.state
            .lock()
            .await
            .player_to_game
            .insert(player_token.to_string(), game_id.to_string());
        true
    }

    pub async fn remove_player_mapping(&self, player_token: &str) {
        self.state.lock().await.player_to_game.remove(player_token);
    }

    /// Restore saved games from storage on startup. A record that fails to
    /// load is skipped (and kept on disk for inspection).
    pub async fn restore_games(&self) {
        let save_ids = match self.deps.storage.list_keys("games").await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list game saves");
                return;
            }
        };

        let mut restored = 0;
        for game_id in save_ids {
            let game = Game::new(game_id.clone(), "Loading...".to_string(), self.deps.clone());
            if game.initialize(Some(&game_id), None, None, None).await {
                self.state.lock().await.games.insert(game_id.clone(), game);
                restored += 1;
            } else {
                tracing::warn!(game_id = %game_id, "failed to restore game save");
            }
        }
        tracing::info!(restored, "restored games from storage");
    }

    /// Lobby summaries, newest first.
    pub async fn list_games(&self) -> Vec<serde_json::Value> {
        let games: Vec<Arc<Game>> = {
            let state = self.state.lock().await;
            state.games.values().cloned().collect()
        };
        let mut summaries = Vec::with_capacity(games.len());
        for game in games {
            let status = game.status().await;
            summaries.push((status.created_at, serde_json::json!({
                "game_id": status.game_id,
                "name": status.name,
                "player_count": status.active_player_count,
                "total_players": status.player_count,
                "max_players": self.multi.max_players_per_game,
                "is_completed": status.is_completed,
                "is_joinable": status.active_player_count < self.multi.max_players_per_game
                    && !status.is_completed,
                "created_at": status.created_at.to_rfc3339(),
            })));
        }
        summaries.sort_by(|a, b| b.0.cmp(&a.0));
        summaries.into_iter().map(|(_, v)| v).collect()
    }

    pub async fn game_count(&self) -> usize {
        self.state.lock().await.games.len()
    }

    /// Remove completed games past their grace period and idle games past
    /// the inactivity timeout.
    pub async fn cleanup_games(&self) {
        let inactive_timeout = ChronoDuration::minutes(self.multi.game_inactive_timeout_minutes);
        let grace_period =
            ChronoDuration::minutes(self.multi.completed_game_grace_period_minutes);
        let now = Utc::now();

        let games: Vec<Arc<Game>> = {
            let state = self.state.lock().await;
            state.games.values().cloned().collect()
        };

        let mut to_remove = Vec::new();
        for game in games {
            let status = game.status().await;
            if status.is_completed {
                if let Some(completed_at) = status.completed_at {
                    if now - completed_at > grace_period {
                        tracing::info!(game_id = %status.game_id, "removing completed game");
                        to_remove.push(status.game_id);
                        continue;
                    }
                }
            }
            if status.active_player_count == 0 && now - status.last_activity > inactive_timeout {
                tracing::info!(game_id = %status.game_id, "removing inactive game");
                to_remove.push(status.game_id);
            }
        }

        for game_id in to_remove {
            self.remove_game(&game_id).await;
        }
    }

    async fn remove_game(&self, game_id: &str) {
        let game = {
            let mut state = self.state.lock().await;
            let game = state.games.remove(game_id);
            state.player_to_game.retain(|_, gid| gid != game_id);
            game
        };
        if let Some(game) = game {
            game.stop().await;
            tracing::info!(game_id, "removed game");
        }
    }

    /// Stop every game, writing final saves. Used on shutdown.
    pub async fn shutdown(&self) {
        let games: Vec<Arc<Game>> = {
            let mut state = self.state.lock().await;
            state.player_to_game.clear();
            state.games.drain().map(|(_, g)| g).collect()
        };
        for game in games {
            game.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AiSettings;
    use crate::events::EventBus;
    use crate::services::{FileStorage, MonsterService, Storage};

    async fn make_registry(dir: &tempfile::TempDir) -> Arc<GameRegistry> {
        let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(dir.path().to_path_buf()));
        let events = EventBus::default();
        let monsters = Arc::new(
            MonsterService::new(storage.clone(), events.clone(), AiSettings::default()).await,
        );
        let deps = GameDeps {
            storage,
            monsters,
            events,
            settings: GameSettings {
                default_map_width: 120,
                default_map_height: 80,
                default_room_count: 10,
                ..GameSettings::default()
            },
        };
        GameRegistry::new(deps, MultiGameSettings::default())
    }

    #[tokio::test]
    async fn test_create_and_get_game() {
        let dir = tempfile::tempdir().unwrap();
        let registry = make_registry(&dir).await;
        let game = registry.create_game(Some("Alpha".into()), None, None, None).await;
        assert_eq!(registry.game_count().await, 1);
        let found = registry.get_game(&game.game_id).await.unwrap();
        assert_eq!(found.game_id, game.game_id);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_auto_join_reuses_open_game() {
        let dir = tempfile::tempdir().unwrap();
        let registry = make_registry(&dir).await;
        let first = registry.get_or_create_joinable_game().await;
        let second = registry.get_or_create_joinable_game().await;
        assert_eq!(first.game_id, second.game_id);
        assert_eq!(registry.game_count().await, 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_assign_player_moves_between_games() {
        let dir = tempfile::tempdir().unwrap();
        let registry = make_registry(&dir).await;
        let a = registry.create_game(Some("A".into()), None, None, None).await;
        let b = registry.create_game(Some("B".into()), None, None, None).await;

        assert!(registry.assign_player_to_game("tok", &a.game_id).await);
        assert_eq!(
            registry.game_for_player("tok").await.unwrap().game_id,
            a.game_id
        );

        assert!(registry.assign_player_to_game("tok", &b.game_id).await);
        assert_eq!(
            registry.game_for_player("tok").await.unwrap().game_id,
            b.game_id
        );

        assert!(!registry.assign_player_to_game("tok", "missing").await);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_restore_games_from_saves() {
        let dir = tempfile::tempdir().unwrap();
        let game_id = {
            let registry = make_registry(&dir).await;
            let game = registry.create_game(Some("Persisted".into()), None, None, None).await;
            let id = game.game_id.clone();
            registry.shutdown().await;
            id
        };

        let registry = make_registry(&dir).await;
        registry.restore_games().await;
        let restored = registry.get_game(&game_id).await.unwrap();
        assert_eq!(restored.status().await.name, "Persisted");
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_list_games_reports_joinable() {
        let dir = tempfile::tempdir().unwrap();
        let registry = make_registry(&dir).await;
        registry.create_game(Some("Open".into()), None, None, None).await;
        let listed = registry.list_games().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["is_joinable"], true);
        assert_eq!(listed[0]["player_count"], 0);
        registry.shutdown().await;
    }
}
