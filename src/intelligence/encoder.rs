//! Discretizes world observations into flat state indices for the Q-table.
//!
//! State space dimensions (3*4*4*3*3*9*2 = 7776 states):
//!
//! | dim                | bins | binning                                |
//! |--------------------|------|----------------------------------------|
//! | hp ratio           | 3    | <=0.33, <=0.66, else                   |
//! | enemy count        | 4    | 0, 1, 2, 3+                            |
//! | ally count         | 4    | 0, 1, 2, 3+                            |
//! | room category      | 3    | combat / safe / dangerous              |
//! | distance to threat | 3    | <=1, <=4, else                         |
//! | threat direction   | 9    | 8 compass + NONE                       |
//! | in corridor        | 2    | bool                                   |

use serde::{Deserialize, Serialize};

use crate::dungeon::pathfinding::{Direction, DIRECTION_NAMES};

/// Observed surroundings of a monster, built by the game instance each tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldState {
    pub room_type: String,
    pub nearby_enemies: u32,
    pub nearby_allies: u32,
    pub distance_to_threat: i32,
    pub threat_direction: Direction,
    pub in_corridor: bool,
    /// Position of the nearest threat, when one is visible.
    #[serde(default)]
    pub threat_position: Option<(i32, i32)>,
}

impl Default for WorldState {
    fn default() -> Self {
        WorldState {
            room_type: "chamber".to_string(),
            nearby_enemies: 0,
            nearby_allies: 0,
            distance_to_threat: 8,
            threat_direction: Direction::None,
            in_corridor: false,
            threat_position: None,
        }
    }
}

const HP_BINS: [f32; 3] = [0.33, 0.66, 1.0];
const ENEMY_BINS: [i64; 4] = [0, 1, 2, 3];
const ALLY_BINS: [i64; 4] = [0, 1, 2, 3];
const DISTANCE_BINS: [i64; 3] = [1, 4, 999];

pub const ROOM_CATEGORY_NAMES: [&str; 3] = ["combat", "safe", "dangerous"];

/// Map a room type to a tactical category. Unknown types read as safe.
pub fn room_category(room_type: &str) -> usize {
    match room_type {
        "armory" | "guard_post" | "throne_room" => 0,
        "crypt" | "dungeon_cell" | "treasury" | "alchemy_lab" => 2,
        _ => 1,
    }
}

/// The encoder's dimension sizes, rightmost varying fastest.
pub const STATE_SHAPE: [usize; 7] = [3, 4, 4, 3, 3, 9, 2];

/// Total number of discrete states.
pub const STATE_SPACE: usize = 3 * 4 * 4 * 3 * 3 * 9 * 2;

#[derive(Debug, Clone, Copy, Default)]
pub struct StateEncoder;

impl StateEncoder {
    pub fn state_space(&self) -> usize {
        STATE_SPACE
    }

    fn bucket_f32(value: f32, bins: &[f32]) -> usize {
        for (i, &threshold) in bins.iter().enumerate() {
            if value <= threshold {
                return i;
            }
        }
        bins.len() - 1
    }

    fn bucket_i64(value: i64, bins: &[i64]) -> usize {
        for (i, &threshold) in bins.iter().enumerate() {
            if value <= threshold {
                return i;
            }
        }
        bins.len() - 1
    }

    /// Encode observations into a flat index plus the per-dimension indices.
    #[allow(clippy::too_many_arguments)]
    pub fn encode(
        &self,
        hp_ratio: f32,
        enemy_count: u32,
        ally_count: u32,
        room_type: &str,
        distance_to_threat: i32,
        threat_direction: Direction,
        in_corridor: bool,
    ) -> (usize, [usize; 7]) {
        let multi = [
            Self::bucket_f32(hp_ratio.clamp(0.0, 1.0), &HP_BINS),
            Self::bucket_i64(enemy_count as i64, &ENEMY_BINS),
            Self::bucket_i64(ally_count as i64, &ALLY_BINS),
            room_category(room_type),
            Self::bucket_i64(distance_to_threat.max(0) as i64, &DISTANCE_BINS),
            threat_direction.index() as usize,
            usize::from(in_corridor),
        ];
        (Self::flatten(&multi), multi)
    }

    /// Encode a full [`WorldState`] with the monster's HP ratio.
    pub fn encode_world(&self, hp_ratio: f32, world: &WorldState) -> (usize, [usize; 7]) {
        self.encode(
            hp_ratio,
            world.nearby_enemies,
            world.nearby_allies,
            &world.room_type,
            world.distance_to_threat,
            world.threat_direction,
            world.in_corridor,
        )
    }

    /// Row-major flatten: rightmost index varies fastest.
    fn flatten(indices: &[usize; 7]) -> usize {
        let mut flat = 0;
        let mut stride = 1;
        for (size, index) in STATE_SHAPE.iter().rev().zip(indices.iter().rev()) {
            flat += index * stride;
            stride *= size;
        }
        flat
    }

    /// Convert a flat index back into per-dimension indices (debugging).
    pub fn decode(&self, flat_index: usize) -> [usize; 7] {
        let mut indices = [0; 7];
        let mut remaining = flat_index;
        for (slot, size) in indices.iter_mut().rev().zip(STATE_SHAPE.iter().rev()) {
            *slot = remaining % size;
            remaining /= size;
        }
        indices
    }

    /// Human-readable description of a state index (debugging).
    pub fn describe(&self, flat_index: usize) -> serde_json::Value {
        let [hp, enemies, allies, room, distance, direction, corridor] = self.decode(flat_index);
        let hp_labels = ["LOW", "MEDIUM", "HIGH"];
        let distance_labels = ["CLOSE", "MEDIUM", "FAR"];
        serde_json::json!({
            "hp": hp_labels[hp],
            "enemies": if enemies < 3 { enemies.to_string() } else { "3+".to_string() },
            "allies": if allies < 3 { allies.to_string() } else { "3+".to_string() },
            "room_category": ROOM_CATEGORY_NAMES[room],
            "distance": distance_labels[distance],
            "threat_direction": DIRECTION_NAMES[direction],
            "in_corridor": corridor == 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_space_size() {
        assert_eq!(STATE_SPACE, 7776);
        assert_eq!(STATE_SHAPE.iter().product::<usize>(), STATE_SPACE);
    }

    #[test]
    fn test_encode_in_range_and_decodes_back() {
        let encoder = StateEncoder;
        let cases = [
            (0.1_f32, 0_u32, 0_u32, "chamber", 0, Direction::None, false),
            (0.5, 1, 2, "armory", 3, Direction::North, true),
            (0.9, 5, 7, "crypt", 100, Direction::SouthWest, false),
            (1.0, 3, 3, "unknown_type", 1, Direction::East, true),
        ];
        for (hp, enemies, allies, room, dist, dir, corridor) in cases {
            let (flat, multi) = encoder.encode(hp, enemies, allies, room, dist, dir, corridor);
            assert!(flat < STATE_SPACE);
            assert_eq!(encoder.decode(flat), multi);
        }
    }

    #[test]
    fn test_hp_binning() {
        let encoder = StateEncoder;
        let low = encoder.encode(0.2, 0, 0, "chamber", 8, Direction::None, false);
        let mid = encoder.encode(0.5, 0, 0, "chamber", 8, Direction::None, false);
        let high = encoder.encode(0.9, 0, 0, "chamber", 8, Direction::None, false);
        assert_eq!(low.1[0], 0);
        assert_eq!(mid.1[0], 1);
        assert_eq!(high.1[0], 2);
    }

    #[test]
    fn test_distance_binning() {
        let encoder = StateEncoder;
        assert_eq!(encoder.encode(1.0, 0, 0, "chamber", 1, Direction::None, false).1[4], 0);
        assert_eq!(encoder.encode(1.0, 0, 0, "chamber", 3, Direction::None, false).1[4], 1);
        assert_eq!(encoder.encode(1.0, 0, 0, "chamber", 9, Direction::None, false).1[4], 2);
    }

    #[test]
    fn test_counts_saturate_at_three() {
        let encoder = StateEncoder;
        let (_, multi) = encoder.encode(1.0, 12, 9, "chamber", 8, Direction::None, false);
        assert_eq!(multi[1], 3);
        assert_eq!(multi[2], 3);
    }

    #[test]
    fn test_room_categories() {
        assert_eq!(room_category("armory"), 0);
        assert_eq!(room_category("guard_post"), 0);
        assert_eq!(room_category("throne_room"), 0);
        assert_eq!(room_category("chamber"), 1);
        assert_eq!(room_category("library"), 1);
        assert_eq!(room_category("crypt"), 2);
        assert_eq!(room_category("treasury"), 2);
        // Unknown types read as safe
        assert_eq!(room_category("ballroom"), 1);
    }

    #[test]
    fn test_distinct_states_get_distinct_indices() {
        let encoder = StateEncoder;
        let a = encoder.encode(0.9, 1, 0, "armory", 1, Direction::North, false).0;
        let b = encoder.encode(0.9, 1, 0, "armory", 1, Direction::South, false).0;
        let c = encoder.encode(0.9, 1, 0, "armory", 1, Direction::North, true).0;
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_describe_labels() {
        let encoder = StateEncoder;
        let (flat, _) = encoder.encode(0.2, 1, 0, "crypt", 1, Direction::East, true);
        let described = encoder.describe(flat);
        assert_eq!(described["hp"], "LOW");
        assert_eq!(described["room_category"], "dangerous");
        assert_eq!(described["distance"], "CLOSE");
        assert_eq!(described["threat_direction"], "E");
        assert_eq!(described["in_corridor"], true);
    }
}
