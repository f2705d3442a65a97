//! Procedural dungeon map: generated data, the generator itself, and grid
//! pathfinding.

pub mod generator;
pub mod pathfinding;

use serde::{Deserialize, Serialize};

use crate::domain::{Room, Tile};


/// Result of map generation. Also the persisted map shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedMap {
    pub width: i32,
    pub height: i32,
    pub tiles: Vec<Vec<Tile>>,
    pub rooms: Vec<Room>,
    pub spawn_x: i32,
    pub spawn_y: i32,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl GeneratedMap {
    /// Tile at coordinates; out of bounds reads as VOID.
    pub fn tile_at(&self, x: i32, y: i32) -> Tile {
        if x >= 0 && x < self.width && y >= 0 && y < self.height {
            self.tiles[y as usize][x as usize]
        } else {
            Tile::Void
        }
    }
}
