//! Room entity: a rectangular floor area with metadata.

use serde::{Deserialize, Serialize};

use super::tiles::Tile;

/// Room types used for thematic naming, furniture, and spawn tables.
pub const ROOM_TYPES: [&str; 12] = [
    "chamber",
    "library",
    "armory",
    "bedroom",
    "storage",
    "throne_room",
    "dining_hall",
    "crypt",
    "treasury",
    "dungeon_cell",
    "alchemy_lab",
    "guard_post",
];

/// A room in the dungeon. `x, y` is the top-left floor tile (walls excluded).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    #[serde(default = "default_room_type")]
    pub room_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub furniture: Vec<(i32, i32, Tile)>,
    #[serde(default)]
    pub connected_rooms: Vec<String>,
    /// Whether a player has entered this room yet (gates monster spawning).
    #[serde(default)]
    pub visited: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub required_key: Option<String>,
    #[serde(default)]
    pub trap_type: Option<String>,
    #[serde(default = "default_light_level")]
    pub light_level: u8,
}

fn default_room_type() -> String {
    "chamber".to_string()
}

fn default_light_level() -> u8 {
    100
}

impl Room {
    pub fn new(id: String, x: i32, y: i32, width: i32, height: i32, room_type: &str) -> Self {
        Room {
            id,
            x,
            y,
            width,
            height,
            room_type: room_type.to_string(),
            name: String::new(),
            description: String::new(),
            furniture: Vec::new(),
            connected_rooms: Vec::new(),
            visited: false,
            locked: false,
            required_key: None,
            trap_type: None,
            light_level: 100,
        }
    }

    pub fn center_x(&self) -> i32 {
        self.x + self.width / 2
    }

    pub fn center_y(&self) -> i32 {
        self.y + self.height / 2
    }

    pub fn center(&self) -> (i32, i32) {
        (self.center_x(), self.center_y())
    }

    pub fn area(&self) -> i32 {
        self.width * self.height
    }

    pub fn bounds(&self) -> (i32, i32, i32, i32) {
        (self.x, self.y, self.width, self.height)
    }

    /// Inclusive-start, exclusive-end rectangle test.
    pub fn contains(&self, px: i32, py: i32) -> bool {
        self.x <= px && px < self.x + self.width && self.y <= py && py < self.y + self.height
    }

    /// Short room info sent to clients on discovery.
    pub fn info(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "type": self.room_type,
            "description": self.description,
        })
    }
}
