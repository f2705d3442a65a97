//! Process-wide services: storage backends, the monster AI service, and the
//! player registry and stats trackers. All are plain values wired together
//! in `main` and injected where needed.

pub mod bestiary;
pub mod monster_service;
pub mod player_registry;
pub mod player_stats;
pub mod storage;

pub use monster_service::MonsterService;
pub use player_registry::{PlayerProfile, PlayerRegistry};
pub use player_stats::{xp_for_cr, PlayerStats, PlayerStatsTracker};
pub use storage::{FileStorage, SqliteStorage, Storage, StorageError};
