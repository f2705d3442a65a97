//! Player identity registry: token-keyed profiles that survive across games
//! and reconnects.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::services::storage::Storage;

const PROFILE_COLLECTION: &str = "players";
const PROFILE_KEY: &str = "profiles";

/// Persistent player data across games. The token is the stable identity;
/// `user_id` ties the profile to the authenticated account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerProfile {
    pub token: String,
    pub display_name: String,
    pub user_id: String,
    pub created_at: String,
    pub last_seen: String,
    #[serde(default)]
    pub current_game_id: Option<String>,
    #[serde(default)]
    pub current_player_id: Option<String>,
    #[serde(default)]
    pub total_games_played: u64,
    /// Earned title, written by the external narrative service.
    #[serde(default)]
    pub nickname: Option<String>,
}

impl PlayerProfile {
    fn new(token: &str, user_id: &str, display_name: String) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        PlayerProfile {
            token: token.to_string(),
            display_name,
            user_id: user_id.to_string(),
            created_at: now.clone(),
            last_seen: now,
            current_game_id: None,
            current_player_id: None,
            total_games_played: 0,
            nickname: None,
        }
    }

    fn touch(&mut self) {
        self.last_seen = chrono::Utc::now().to_rfc3339();
    }
}

/// Token-keyed profile registry with periodic dirty flushes.
pub struct PlayerRegistry {
    storage: Arc<dyn Storage>,
    max_profiles_per_user: usize,
    state: Mutex<RegistryState>,
}

struct RegistryState {
    profiles: HashMap<String, PlayerProfile>,
    dirty: bool,
}

impl PlayerRegistry {
    pub async fn new(storage: Arc<dyn Storage>, max_profiles_per_user: usize) -> Self {
        let mut profiles = HashMap::new();
        match storage.get(PROFILE_COLLECTION, PROFILE_KEY).await {
            Ok(Some(doc)) => {
                if let Ok(parsed) =
                    serde_json::from_value::<HashMap<String, PlayerProfile>>(doc)
                {
                    profiles = parsed;
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "failed to load player registry"),
        }
        tracing::info!(players = profiles.len(), "player registry ready");
        PlayerRegistry {
            storage,
            max_profiles_per_user,
            state: Mutex::new(RegistryState {
                profiles,
                dirty: false,
            }),
        }
    }

    /// Flush the registry every minute while dirty.
    pub fn spawn_flush_task(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut flush = interval(Duration::from_secs(60));
            flush.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        registry.save().await;
                        break;
                    }
                    _ = flush.tick() => {
                        if registry.state.lock().await.dirty {
                            registry.save().await;
                        }
                    }
                }
            }
        })
    }

    /// Get the profile for a token, or create one bound to the user.
    /// Fails when the token belongs to another user or the user already has
    /// the maximum number of profiles.
    pub async fn get_or_create(
        &self,
        token: &str,
        user_id: &str,
        display_name: Option<String>,
    ) -> Result<PlayerProfile, &'static str> {
        let mut state = self.state.lock().await;

        if let Some(profile) = state.profiles.get_mut(token) {
            if profile.user_id != user_id {
                return Err("Profile belongs to different user");
            }
            profile.touch();
            let profile = profile.clone();
            state.dirty = true;
            return Ok(profile);
        }

        let owned = state
            .profiles
            .values()
            .filter(|p| p.user_id == user_id)
            .count();
        if owned >= self.max_profiles_per_user {
            return Err("Maximum profiles reached for user");
        }

        let display_name = display_name.unwrap_or_else(|| format!("Hero_{}", &token[..6.min(token.len())]));
        let profile = PlayerProfile::new(token, user_id, display_name);
        state.profiles.insert(token.to_string(), profile.clone());
        state.dirty = true;
        tracing::info!(token = %token, user_id, "new player profile registered");
        Ok(profile)
    }

    pub async fn get(&self, token: &str) -> Option<PlayerProfile> {
        self.state.lock().await.profiles.get(token).cloned()
    }

    /// Record which game (and in-game player id) a token is bound to.
    pub async fn update_player_game(
        &self,
        token: &str,
        game_id: Option<String>,
        player_id: Option<String>,
    ) {
        let mut state = self.state.lock().await;
        if let Some(profile) = state.profiles.get_mut(token) {
            if game_id.is_some() {
                profile.total_games_played += 1;
            }
            profile.current_game_id = game_id;
            profile.current_player_id = player_id;
            profile.touch();
            state.dirty = true;
        }
    }

    #[allow(dead_code)]
    pub async fn clear_player_game(&self, token: &str) {
        self.update_player_game(token, None, None).await;
    }

    #[allow(dead_code)]
    pub async fn find_player_game(&self, token: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .profiles
            .get(token)
            .and_then(|p| p.current_game_id.clone())
    }

    pub async fn save(&self) {
        let doc = {
            let state = self.state.lock().await;
            match serde_json::to_value(&state.profiles) {
                Ok(doc) => doc,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to serialize player registry");
                    return;
                }
            }
        };
        match self.storage.put(PROFILE_COLLECTION, PROFILE_KEY, &doc).await {
            Ok(()) => self.state.lock().await.dirty = false,
            Err(e) => tracing::warn!(error = %e, "failed to save player registry"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage::FileStorage;

    async fn registry(dir: &tempfile::TempDir) -> Arc<PlayerRegistry> {
        let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(dir.path().to_path_buf()));
        Arc::new(PlayerRegistry::new(storage, 4).await)
    }

    #[tokio::test]
    async fn test_create_and_reuse_profile() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir).await;

        let created = reg.get_or_create("tok-1", "user-1", None).await.unwrap();
        assert_eq!(created.user_id, "user-1");
        assert!(created.display_name.starts_with("Hero_"));

        let reused = reg.get_or_create("tok-1", "user-1", None).await.unwrap();
        assert_eq!(reused.token, created.token);
    }

    #[tokio::test]
    async fn test_profile_user_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir).await;
        reg.get_or_create("tok-1", "user-1", None).await.unwrap();
        let err = reg.get_or_create("tok-1", "user-2", None).await.unwrap_err();
        assert_eq!(err, "Profile belongs to different user");
    }

    #[tokio::test]
    async fn test_profile_cap_per_user() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir).await;
        for i in 0..4 {
            reg.get_or_create(&format!("tok-{i}"), "user-1", None)
                .await
                .unwrap();
        }
        assert!(reg.get_or_create("tok-5", "user-1", None).await.is_err());
        // A different user is unaffected
        assert!(reg.get_or_create("tok-6", "user-2", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_game_assignment_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(&dir).await;
        reg.get_or_create("tok-1", "user-1", None).await.unwrap();
        reg.update_player_game("tok-1", Some("g1".into()), Some("p1".into()))
            .await;
        assert_eq!(reg.find_player_game("tok-1").await, Some("g1".into()));
        reg.clear_player_game("tok-1").await;
        assert_eq!(reg.find_player_game("tok-1").await, None);
    }

    #[tokio::test]
    async fn test_persistence_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let reg = registry(&dir).await;
            reg.get_or_create("tok-1", "user-1", Some("Alva".into()))
                .await
                .unwrap();
            reg.save().await;
        }
        let reg = registry(&dir).await;
        let profile = reg.get("tok-1").await.unwrap();
        assert_eq!(profile.display_name, "Alva");
    }
}
