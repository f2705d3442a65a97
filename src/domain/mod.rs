//! Core domain model: tiles, rooms, entities, dice, and the fight state
//! machine. Everything here is pure state and rules; IO lives in the service
//! layer.

pub mod dice;
pub mod fight;
pub mod monster;
pub mod player;
pub mod rooms;
pub mod tiles;

pub use fight::{Fight, FightStatus};
pub use monster::{Monster, MonsterBehavior, MonsterIntelligenceState, MonsterStats};
pub use player::Player;
pub use rooms::{Room, ROOM_TYPES};
pub use tiles::Tile;

/// Current unix time in fractional seconds. Fight timers and immunity
/// windows use this representation on the wire.
pub fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
