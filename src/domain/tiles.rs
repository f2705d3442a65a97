//! Tile kinds for the dungeon grid.
//!
//! Tiles are serialized as numeric codes so the persisted map format and the
//! client wire format stay stable across versions.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// A single map tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tile {
    Floor,
    Wall,
    DoorClosed,
    DoorOpen,
    Chest,
    Table,
    Chair,
    Bed,
    Bookshelf,
    Barrel,
    Torch,
    /// Empty black space (not walkable, not rendered as wall).
    Void,
}

/// All tile kinds with their wire names, in code order.
pub const TILE_TYPES: [(&str, Tile); 12] = [
    ("floor", Tile::Floor),
    ("wall", Tile::Wall),
    ("doorClosed", Tile::DoorClosed),
    ("doorOpen", Tile::DoorOpen),
    ("chest", Tile::Chest),
    ("table", Tile::Table),
    ("chair", Tile::Chair),
    ("bed", Tile::Bed),
    ("bookshelf", Tile::Bookshelf),
    ("barrel", Tile::Barrel),
    ("torch", Tile::Torch),
    ("void", Tile::Void),
];

impl Tile {
    pub fn code(&self) -> u8 {
        match self {
            Tile::Floor => 0,
            Tile::Wall => 1,
            Tile::DoorClosed => 2,
            Tile::DoorOpen => 3,
            Tile::Chest => 4,
            Tile::Table => 5,
            Tile::Chair => 6,
            Tile::Bed => 7,
            Tile::Bookshelf => 8,
            Tile::Barrel => 9,
            Tile::Torch => 10,
            Tile::Void => 11,
        }
    }

    pub fn from_code(code: u8) -> Option<Tile> {
        match code {
            0 => Some(Tile::Floor),
            1 => Some(Tile::Wall),
            2 => Some(Tile::DoorClosed),
            3 => Some(Tile::DoorOpen),
            4 => Some(Tile::Chest),
            5 => Some(Tile::Table),
            6 => Some(Tile::Chair),
            7 => Some(Tile::Bed),
            8 => Some(Tile::Bookshelf),
            9 => Some(Tile::Barrel),
            10 => Some(Tile::Torch),
            11 => Some(Tile::Void),
            _ => None,
        }
    }

    #[allow(dead_code)]
    pub fn name(&self) -> &'static str {
        TILE_TYPES[self.code() as usize].0
    }

    /// Entities can stand here.
    pub fn is_walkable(&self) -> bool {
        matches!(self, Tile::Floor | Tile::DoorOpen)
    }

    pub fn is_door(&self) -> bool {
        matches!(self, Tile::DoorClosed | Tile::DoorOpen)
    }

    /// Blocks movement and vision.
    #[allow(dead_code)]
    pub fn is_blocking(&self) -> bool {
        matches!(self, Tile::Wall | Tile::DoorClosed | Tile::Void)
    }
}

impl Serialize for Tile {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for Tile {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        Tile::from_code(code)
            .ok_or_else(|| de::Error::custom(format!("unknown tile code {code}")))
    }
}

/// The tile-name to code mapping sent to clients with every full state payload.
pub fn tile_types_payload() -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (name, tile) in TILE_TYPES {
        map.insert(name.to_string(), serde_json::json!(tile.code()));
    }
    serde_json::Value::Object(map)
}
