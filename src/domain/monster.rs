//! Monster entity and per-monster AI state.

use serde::{Deserialize, Serialize};

use crate::intelligence::agent::AiAction;
use crate::intelligence::encoder::WorldState;
use crate::intelligence::memory::ThreatEvent;

use super::player::ability_modifier;

/// High-level movement disposition for a monster when it has no learned
/// policy driving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonsterBehavior {
    /// Stays in place.
    Static,
    /// Moves randomly within its room.
    Patrol,
    /// Moves toward the last known player position.
    Searching,
    /// Actively chases players.
    Aggressive,
    /// Runs away when hurt.
    Fleeing,
    /// Waits hidden, attacks when a player is close.
    Ambush,
    /// Moves aimlessly.
    Wander,
    /// Ghostly movement patterns.
    Haunt,
    /// Stays in place performing rituals.
    Ritual,
}

/// D&D-style monster statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonsterStats {
    pub hp: i32,
    pub max_hp: i32,
    pub ac: i32,
    #[serde(rename = "str")]
    pub strength: i32,
    #[serde(rename = "dex")]
    pub dexterity: i32,
    #[serde(rename = "con")]
    pub constitution: i32,
    #[serde(rename = "int")]
    pub intelligence: i32,
    #[serde(rename = "wis")]
    pub wisdom: i32,
    #[serde(rename = "cha")]
    pub charisma: i32,
    #[serde(default = "default_speed")]
    pub speed: i32,
    #[serde(default = "default_cr")]
    pub challenge_rating: f32,
}

fn default_speed() -> i32 {
    30
}

fn default_cr() -> f32 {
    0.25
}

impl MonsterStats {
    pub fn modifier(&self, stat_value: i32) -> i32 {
        ability_modifier(stat_value)
    }

    pub fn str_mod(&self) -> i32 {
        self.modifier(self.strength)
    }

    /// Apply damage, clamped to `[0, hp]`. Returns the damage actually taken.
    pub fn take_damage(&mut self, amount: i32) -> i32 {
        let actual = amount.min(self.hp).max(0);
        self.hp -= actual;
        actual
    }
}

/// Serializable snapshot of per-monster AI state, carried on the monster so
/// reward events can be attributed after the fact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonsterIntelligenceState {
    #[serde(default)]
    pub memory_events: Vec<ThreatEvent>,
    #[serde(default)]
    pub last_state_index: Option<usize>,
    #[serde(default)]
    pub last_action: Option<AiAction>,
    #[serde(default)]
    pub last_reward: f32,
    #[serde(default)]
    pub last_decision_tick: u64,
    #[serde(default)]
    pub generation: u32,
    #[serde(default)]
    pub q_table_version: usize,
    #[serde(default)]
    pub last_world_state: WorldState,
}

/// A monster in the dungeon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Monster {
    pub id: String,
    pub monster_type: String,
    pub name: String,
    pub x: i32,
    pub y: i32,
    pub room_id: String,
    pub symbol: String,
    pub color: String,
    pub stats: MonsterStats,
    pub behavior: MonsterBehavior,
    #[serde(default)]
    pub description: String,
    /// Cached patrol waypoint, kept until reached or unreachable.
    #[serde(default)]
    pub patrol_target: Option<(i32, i32)>,
    #[serde(default)]
    pub last_move_tick: u64,
    #[serde(default)]
    pub target_player_id: Option<String>,
    #[serde(default)]
    pub last_seen_player_pos: Option<(i32, i32)>,
    #[serde(default)]
    pub intelligence_state: MonsterIntelligenceState,
}

impl Monster {
    pub fn is_alive(&self) -> bool {
        self.stats.hp > 0
    }

    pub fn position(&self) -> (i32, i32) {
        (self.x, self.y)
    }

    pub fn take_damage(&mut self, amount: i32) -> i32 {
        self.stats.take_damage(amount)
    }

    pub fn hp_ratio(&self) -> f32 {
        self.stats.hp as f32 / self.stats.max_hp.max(1) as f32
    }

    /// The damage die scales with challenge rating: `1d(6 + 2*CR)`.
    pub fn damage_dice(&self) -> String {
        format!("1d{}", 6 + (self.stats.challenge_rating * 2.0) as i32)
    }

    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(hp: i32) -> MonsterStats {
        MonsterStats {
            hp,
            max_hp: hp,
            ac: 12,
            strength: 14,
            dexterity: 10,
            constitution: 10,
            intelligence: 8,
            wisdom: 8,
            charisma: 6,
            speed: 30,
            challenge_rating: 0.25,
        }
    }

    #[test]
    fn test_take_damage_clamps_to_hp() {
        let mut s = stats(10);
        assert_eq!(s.take_damage(4), 4);
        assert_eq!(s.hp, 6);
        assert_eq!(s.take_damage(20), 6);
        assert_eq!(s.hp, 0);
        assert_eq!(s.take_damage(5), 0);
        assert_eq!(s.take_damage(-3), 0);
    }

    #[test]
    fn test_str_mod() {
        let s = stats(10);
        assert_eq!(s.str_mod(), 2);
    }

    #[test]
    fn test_damage_dice_scales_with_cr() {
        let mut s = stats(10);
        s.challenge_rating = 2.0;
        let monster = Monster {
            id: "m_1".into(),
            monster_type: "mimic".into(),
            name: "Mimic".into(),
            x: 0,
            y: 0,
            room_id: "room_1".into(),
            symbol: "M".into(),
            color: "#a83".into(),
            stats: s,
            behavior: MonsterBehavior::Ambush,
            description: String::new(),
            patrol_target: None,
            last_move_tick: 0,
            target_player_id: None,
            last_seen_player_pos: None,
            intelligence_state: MonsterIntelligenceState::default(),
        };
        assert_eq!(monster.damage_dice(), "1d10");
    }

    #[test]
    fn test_behavior_serde_names() {
        let json = serde_json::to_string(&MonsterBehavior::Ritual).unwrap();
        assert_eq!(json, "\"ritual\"");
        let behavior: MonsterBehavior = serde_json::from_str("\"haunt\"").unwrap();
        assert_eq!(behavior, MonsterBehavior::Haunt);
    }
}
