use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fs;

/// Application configuration, loaded from `config.toml`. Every section and
/// field has a default so a missing file still boots for development.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub game: GameSettings,
    pub ai: AiSettings,
    pub multi_game: MultiGameSettings,
    pub storage: StorageSettings,
    pub auth: AuthSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct GameSettings {
    pub default_map_width: i32,
    pub default_map_height: i32,
    pub default_room_count: usize,
    /// Seconds between game loop ticks.
    pub tick_interval: f64,
    /// Seconds between periodic saves.
    pub autosave_interval: u64,
    pub viewport_width: i32,
    pub viewport_height: i32,
    /// Seconds per combat turn.
    pub turn_duration: u64,
}

impl Default for GameSettings {
    fn default() -> Self {
        GameSettings {
            default_map_width: 80,
            default_map_height: 50,
            default_room_count: 15,
            tick_interval: 0.5,
            autosave_interval: 300,
            viewport_width: 60,
            viewport_height: 30,
            turn_duration: 120,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct AiSettings {
    /// Ceiling for a species' generation counter.
    pub max_generation_cap: u32,
    /// Fraction of learned Q-values a species keeps when its generation
    /// advances.
    pub generation_inheritance_ratio: f32,
}

impl Default for AiSettings {
    fn default() -> Self {
        AiSettings {
            max_generation_cap: 10,
            generation_inheritance_ratio: 0.7,
        }
    }
}

impl AiSettings {
    pub fn clamped(mut self) -> Self {
        self.max_generation_cap = self.max_generation_cap.max(1);
        self.generation_inheritance_ratio = self.generation_inheritance_ratio.clamp(0.0, 1.0);
        self
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct MultiGameSettings {
    pub max_players_per_game: usize,
    pub game_inactive_timeout_minutes: i64,
    pub completed_game_grace_period_minutes: i64,
}

impl Default for MultiGameSettings {
    fn default() -> Self {
        MultiGameSettings {
            max_players_per_game: 4,
            game_inactive_timeout_minutes: 30,
            completed_game_grace_period_minutes: 5,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct StorageSettings {
    /// "file" or "sqlite".
    pub backend: String,
    /// Root directory for the file backend.
    pub data_dir: String,
    /// Database path for the sqlite backend.
    pub sqlite_file: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            backend: "file".to_string(),
            data_dir: "data".to_string(),
            sqlite_file: "data/dungeon.db".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct AuthSettings {
    pub access_cookie: String,
    pub profile_cookie: String,
    pub max_profiles_per_user: usize,
}

impl Default for AuthSettings {
    fn default() -> Self {
        AuthSettings {
            access_cookie: "access_token".to_string(),
            profile_cookie: "player_token".to_string(),
            max_profiles_per_user: 4,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Box<dyn Error>> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.game.tick_interval, 0.5);
        assert_eq!(config.game.autosave_interval, 300);
        assert_eq!(config.game.viewport_width, 60);
        assert_eq!(config.game.viewport_height, 30);
        assert_eq!(config.multi_game.max_players_per_game, 4);
        assert_eq!(config.storage.backend, "file");
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 9000

            [game]
            tick_interval = 0.25
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.game.tick_interval, 0.25);
        assert_eq!(config.game.default_room_count, 15);
    }

    #[test]
    fn test_ai_settings_clamp() {
        let ai = AiSettings {
            max_generation_cap: 0,
            generation_inheritance_ratio: 1.8,
        }
        .clamped();
        assert_eq!(ai.max_generation_cap, 1);
        assert_eq!(ai.generation_inheritance_ratio, 1.0);
    }
}
