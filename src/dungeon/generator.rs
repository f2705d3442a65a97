//! Procedural dungeon generator using random non-adjacent room placement.
//!
//! Rules:
//! - Rooms keep a minimum gap between each other so corridors have space
//! - Corridors are 1 tile wide and never hug room walls or corners
//! - Doors are placed where a corridor meets a room wall
//! - A flood-fill repair pass guarantees every room is reachable

use std::collections::HashSet;

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::domain::rooms::{Room, ROOM_TYPES};
use crate::domain::Tile;

use super::GeneratedMap;

const MAX_SIZE: i32 = 5000;
/// Minimum gap between rooms (leaves space for corridor + walls).
const MIN_ROOM_GAP: i32 = 10;

pub struct DungeonGenerator {
    width: i32,
    height: i32,
    min_room_size: i32,
    max_room_size: i32,
    room_count: usize,
    seed: u64,
    rng: ChaCha8Rng,
    tiles: Vec<Vec<Tile>>,
    rooms: Vec<Room>,
    room_id_counter: u32,
    corridor_tiles: HashSet<(i32, i32)>,
}

impl DungeonGenerator {
    pub fn new(
        width: i32,
        height: i32,
        min_room_size: i32,
        max_room_size: i32,
        room_count: usize,
        seed: Option<u64>,
    ) -> Self {
        let seed = seed.unwrap_or_else(|| rand::thread_rng().gen::<u32>() as u64);
        DungeonGenerator {
            width: width.clamp(40, MAX_SIZE),
            height: height.clamp(30, MAX_SIZE),
            min_room_size: min_room_size.max(6),
            max_room_size: max_room_size.min(20),
            room_count: room_count.max(10),
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
            tiles: Vec::new(),
            rooms: Vec::new(),
            room_id_counter: 0,
            corridor_tiles: HashSet::new(),
        }
    }

    /// Generate a complete dungeon map. Deterministic under a fixed seed.
    pub fn generate(mut self) -> GeneratedMap {
        self.tiles = vec![vec![Tile::Void; self.width as usize]; self.height as usize];
        self.rooms.clear();
        self.corridor_tiles.clear();

        self.place_rooms();
        self.connect_rooms();
        self.add_walls();
        self.place_doors();
        self.ensure_all_rooms_connected();
        self.place_chests();
        self.place_torches();

        let (spawn_x, spawn_y) = self
            .rooms
            .first()
            .map(|r| r.center())
            .unwrap_or((self.width / 2, self.height / 2));

        GeneratedMap {
            width: self.width,
            height: self.height,
            tiles: self.tiles,
            rooms: self.rooms,
            spawn_x,
            spawn_y,
            seed: Some(self.seed),
        }
    }

    fn place_rooms(&mut self) {
        let max_attempts = self.room_count * 100;
        let mut attempts = 0;

        while self.rooms.len() < self.room_count && attempts < max_attempts {
            attempts += 1;

            let room_width = self.rng.gen_range(self.min_room_size..=self.max_room_size);
            let room_height = self.rng.gen_range(self.min_room_size..=self.max_room_size);

            // Leave margin for walls and corridors
            let margin = MIN_ROOM_GAP + 2;
            let max_x = self.width - room_width - margin;
            let max_y = self.height - room_height - margin;
            if max_x <= margin || max_y <= margin {
                continue;
            }

            let room_x = self.rng.gen_range(margin..=max_x);
            let room_y = self.rng.gen_range(margin..=max_y);

            if !self.room_fits(room_x, room_y, room_width, room_height) {
                continue;
            }

            self.room_id_counter += 1;
            let room_type = ROOM_TYPES
                .choose(&mut self.rng)
                .copied()
                .unwrap_or("chamber");
            let mut room = Room::new(
                format!("room_{}", self.room_id_counter),
                room_x,
                room_y,
                room_width,
                room_height,
                room_type,
            );
            room.name = self.generate_room_name(room_type);

            for y in room_y..room_y + room_height {
                for x in room_x..room_x + room_width {
                    self.tiles[y as usize][x as usize] = Tile::Floor;
                }
            }
            self.rooms.push(room);
        }
    }

    /// A room fits when its bounding box inflated by MIN_ROOM_GAP overlaps
    /// no existing room.
    fn room_fits(&self, x: i32, y: i32, w: i32, h: i32) -> bool {
        let check_x1 = x - MIN_ROOM_GAP;
        let check_y1 = y - MIN_ROOM_GAP;
        let check_x2 = x + w + MIN_ROOM_GAP;
        let check_y2 = y + h + MIN_ROOM_GAP;

        for room in &self.rooms {
            let room_x2 = room.x + room.width;
            let room_y2 = room.y + room.height;
            let separated = check_x2 <= room.x
                || check_x1 >= room_x2
                || check_y2 <= room.y
                || check_y1 >= room_y2;
            if !separated {
                return false;
            }
        }
        true
    }

    /// Connect rooms with a minimum-spanning tree over center distance: at
    /// each step, attach the nearest unconnected room to the connected set.
    fn connect_rooms(&mut self) {
        if self.rooms.len() < 2 {
            return;
        }

        let mut connected = vec![false; self.rooms.len()];
        connected[0] = true;
        let mut remaining = self.rooms.len() - 1;

        while remaining > 0 {
            let mut best_dist = f64::INFINITY;
            let mut best_pair: Option<(usize, usize)> = None;

            // Scan in index order so distance ties resolve identically for a
            // given seed
            for ci in 0..self.rooms.len() {
                if !connected[ci] {
                    continue;
                }
                for ui in 0..self.rooms.len() {
                    if connected[ui] {
                        continue;
                    }
                    let dist = self.room_distance(&self.rooms[ci], &self.rooms[ui]);
                    if dist < best_dist {
                        best_dist = dist;
                        best_pair = Some((ci, ui));
                    }
                }
            }

            let Some((ci, ui)) = best_pair else { break };
            self.carve_corridor(ci, ui);
            let connected_id = self.rooms[ui].id.clone();
            let new_id = self.rooms[ci].id.clone();
            self.rooms[ci].connected_rooms.push(connected_id);
            self.rooms[ui].connected_rooms.push(new_id);
            connected[ui] = true;
            remaining -= 1;
        }
    }

    fn room_distance(&self, a: &Room, b: &Room) -> f64 {
        let dx = (a.center_x() - b.center_x()) as f64;
        let dy = (a.center_y() - b.center_y()) as f64;
        (dx * dx + dy * dy).sqrt()
    }

    /// Carve a 1-tile wide L-shaped corridor between two room centers,
    /// picking horizontal-first or vertical-first at random.
    fn carve_corridor(&mut self, room_a: usize, room_b: usize) {
        let (x1, y1) = self.rooms[room_a].center();
        let (x2, y2) = self.rooms[room_b].center();

        if self.rng.gen_bool(0.5) {
            self.carve_h_corridor(x1, x2, y1);
            self.carve_v_corridor(y1, y2, x2);
        } else {
            self.carve_v_corridor(y1, y2, x1);
            self.carve_h_corridor(x1, x2, y2);
        }
    }

    fn is_inside_room(&self, x: i32, y: i32) -> bool {
        self.rooms.iter().any(|r| r.contains(x, y))
    }

    /// Cardinally adjacent to any room floor tile.
    fn is_adjacent_to_room_floor(&self, x: i32, y: i32) -> bool {
        for room in &self.rooms {
            if x == room.x - 1 && room.y <= y && y < room.y + room.height {
                return true;
            }
            if x == room.x + room.width && room.y <= y && y < room.y + room.height {
                return true;
            }
            if y == room.y - 1 && room.x <= x && x < room.x + room.width {
                return true;
            }
            if y == room.y + room.height && room.x <= x && x < room.x + room.width {
                return true;
            }
        }
        false
    }

    /// At or diagonally adjacent to any room corner.
    fn is_at_room_corner(&self, x: i32, y: i32) -> bool {
        for room in &self.rooms {
            let corners = [
                (room.x - 1, room.y - 1),
                (room.x + room.width, room.y - 1),
                (room.x - 1, room.y + room.height),
                (room.x + room.width, room.y + room.height),
            ];
            for (cx, cy) in corners {
                if (x - cx).abs() <= 1 && (y - cy).abs() <= 1 {
                    return true;
                }
            }
        }
        false
    }

    fn can_carve_at(&self, x: i32, y: i32) -> bool {
        x >= 0
            && x < self.width
            && y >= 0
            && y < self.height
            && !self.is_inside_room(x, y)
            && !self.is_adjacent_to_room_floor(x, y)
            && !self.is_at_room_corner(x, y)
    }

    fn carve_h_corridor(&mut self, x1: i32, x2: i32, y: i32) {
        for x in x1.min(x2)..=x1.max(x2) {
            if self.can_carve_at(x, y) && self.tiles[y as usize][x as usize] == Tile::Void {
                self.tiles[y as usize][x as usize] = Tile::Floor;
                self.corridor_tiles.insert((x, y));
            }
        }
    }

    fn carve_v_corridor(&mut self, y1: i32, y2: i32, x: i32) {
        for y in y1.min(y2)..=y1.max(y2) {
            if self.can_carve_at(x, y) && self.tiles[y as usize][x as usize] == Tile::Void {
                self.tiles[y as usize][x as usize] = Tile::Floor;
                self.corridor_tiles.insert((x, y));
            }
        }
    }

    /// Every VOID tile 8-adjacent to a floor becomes a wall.
    fn add_walls(&mut self) {
        let mut wall_positions = HashSet::new();

        for y in 0..self.height {
            for x in 0..self.width {
                if self.tiles[y as usize][x as usize] != Tile::Floor {
                    continue;
                }
                for dy in -1..=1 {
                    for dx in -1..=1 {
                        if dx == 0 && dy == 0 {
                            continue;
                        }
                        let (nx, ny) = (x + dx, y + dy);
                        if nx >= 0
                            && nx < self.width
                            && ny >= 0
                            && ny < self.height
                            && self.tiles[ny as usize][nx as usize] == Tile::Void
                        {
                            wall_positions.insert((nx, ny));
                        }
                    }
                }
            }
        }

        for (x, y) in wall_positions {
            self.tiles[y as usize][x as usize] = Tile::Wall;
        }
    }

    fn is_corridor_floor(&self, x: i32, y: i32) -> bool {
        self.corridor_tiles.contains(&(x, y))
    }

    fn tile(&self, x: i32, y: i32) -> Tile {
        if x >= 0 && x < self.width && y >= 0 && y < self.height {
            self.tiles[y as usize][x as usize]
        } else {
            Tile::Void
        }
    }

    /// Place doors wherever a wall tile has room floor on one side and a
    /// corridor floor on the opposite side.
    fn place_doors(&mut self) {
        for i in 0..self.rooms.len() {
            self.place_room_doors(i);
        }
    }

    fn place_room_doors(&mut self, room_index: usize) {
        let (rx, ry, rw, rh) = self.rooms[room_index].bounds();

        // Top wall
        let wall_y = ry - 1;
        for x in rx..rx + rw {
            if self.tile(x, wall_y) == Tile::Wall
                && self.tile(x, wall_y + 1) == Tile::Floor
                && self.is_corridor_floor(x, wall_y - 1)
            {
                self.tiles[wall_y as usize][x as usize] = Tile::DoorClosed;
            }
        }

        // Bottom wall
        let wall_y = ry + rh;
        for x in rx..rx + rw {
            if self.tile(x, wall_y) == Tile::Wall
                && self.tile(x, wall_y - 1) == Tile::Floor
                && self.is_corridor_floor(x, wall_y + 1)
            {
                self.tiles[wall_y as usize][x as usize] = Tile::DoorClosed;
            }
        }

        // Left wall
        let wall_x = rx - 1;
        for y in ry..ry + rh {
            if self.tile(wall_x, y) == Tile::Wall
                && self.tile(wall_x + 1, y) == Tile::Floor
                && self.is_corridor_floor(wall_x - 1, y)
            {
                self.tiles[y as usize][wall_x as usize] = Tile::DoorClosed;
            }
        }

        // Right wall
        let wall_x = rx + rw;
        for y in ry..ry + rh {
            if self.tile(wall_x, y) == Tile::Wall
                && self.tile(wall_x - 1, y) == Tile::Floor
                && self.is_corridor_floor(wall_x + 1, y)
            {
                self.tiles[y as usize][wall_x as usize] = Tile::DoorClosed;
            }
        }
    }

    /// Flood fill from the first room's center; any room whose center is
    /// unreachable gets a force-carved corridor to the nearest reachable
    /// room, followed by wall and door repair for that room.
    fn ensure_all_rooms_connected(&mut self) {
        if self.rooms.len() < 2 {
            return;
        }

        let (start_x, start_y) = self.rooms[0].center();
        let mut reachable = self.flood_fill(start_x, start_y);

        let unreachable: Vec<usize> = self
            .rooms
            .iter()
            .enumerate()
            .filter(|(_, r)| !reachable.contains(&r.center()))
            .map(|(i, _)| i)
            .collect();

        for ui in unreachable {
            let mut best_dist = f64::INFINITY;
            let mut best_room: Option<usize> = None;
            for (i, room) in self.rooms.iter().enumerate() {
                if i == ui || !reachable.contains(&room.center()) {
                    continue;
                }
                let dist = self.room_distance(room, &self.rooms[ui]);
                if dist < best_dist {
                    best_dist = dist;
                    best_room = Some(i);
                }
            }

            if let Some(bi) = best_room {
                self.force_corridor(bi, ui);
                self.add_walls();
                self.place_room_doors(ui);
                reachable = self.flood_fill(start_x, start_y);
            }
        }
    }

    /// All tiles reachable through floors, doors, chests and torches via
    /// cardinal steps.
    fn flood_fill(&self, start_x: i32, start_y: i32) -> HashSet<(i32, i32)> {
        let mut reachable = HashSet::new();
        let mut stack = vec![(start_x, start_y)];

        while let Some((x, y)) = stack.pop() {
            if reachable.contains(&(x, y)) {
                continue;
            }
            if x < 0 || x >= self.width || y < 0 || y >= self.height {
                continue;
            }
            let passable = matches!(
                self.tiles[y as usize][x as usize],
                Tile::Floor | Tile::DoorClosed | Tile::DoorOpen | Tile::Chest | Tile::Torch
            );
            if !passable {
                continue;
            }
            reachable.insert((x, y));
            stack.extend([(x + 1, y), (x - 1, y), (x, y + 1), (x, y - 1)]);
        }
        reachable
    }

    /// Carve a straight L-corridor ignoring the adjacency rules. Used only
    /// by the connectivity repair pass.
    fn force_corridor(&mut self, room_a: usize, room_b: usize) {
        let (x1, y1) = self.rooms[room_a].center();
        let (x2, y2) = self.rooms[room_b].center();

        for x in x1.min(x2)..=x1.max(x2) {
            if matches!(self.tile(x, y1), Tile::Void | Tile::Wall) {
                self.tiles[y1 as usize][x as usize] = Tile::Floor;
                if !self.is_inside_room(x, y1) {
                    self.corridor_tiles.insert((x, y1));
                }
            }
        }
        for y in y1.min(y2)..=y1.max(y2) {
            if matches!(self.tile(x2, y), Tile::Void | Tile::Wall) {
                self.tiles[y as usize][x2 as usize] = Tile::Floor;
                if !self.is_inside_room(x2, y) {
                    self.corridor_tiles.insert((x2, y));
                }
            }
        }
    }

    /// One chest per sampled room, placed on a random interior floor tile.
    fn place_chests(&mut self) {
        if self.rooms.is_empty() {
            return;
        }
        let num_chests = (self.rooms.len() / 4).max(1).min(self.rooms.len());
        let mut indices: Vec<usize> = (0..self.rooms.len()).collect();
        indices.shuffle(&mut self.rng);
        indices.truncate(num_chests);

        for i in indices {
            let (rx, ry, rw, rh) = self.rooms[i].bounds();
            let mut valid_positions = Vec::new();
            for y in ry + 1..ry + rh - 1 {
                for x in rx + 1..rx + rw - 1 {
                    if self.tiles[y as usize][x as usize] == Tile::Floor {
                        valid_positions.push((x, y));
                    }
                }
            }
            if let Some(&(x, y)) = valid_positions.choose(&mut self.rng) {
                self.tiles[y as usize][x as usize] = Tile::Chest;
                self.rooms[i].furniture.push((x, y, Tile::Chest));
            }
        }
    }

    /// One torch on a random wall tile per room.
    fn place_torches(&mut self) {
        for i in 0..self.rooms.len() {
            let (rx, ry, rw, rh) = self.rooms[i].bounds();
            let mut wall_positions = Vec::new();

            for x in rx..rx + rw {
                if self.tile(x, ry - 1) == Tile::Wall {
                    wall_positions.push((x, ry - 1));
                }
                if self.tile(x, ry + rh) == Tile::Wall {
                    wall_positions.push((x, ry + rh));
                }
            }
            for y in ry..ry + rh {
                if self.tile(rx - 1, y) == Tile::Wall {
                    wall_positions.push((rx - 1, y));
                }
                if self.tile(rx + rw, y) == Tile::Wall {
                    wall_positions.push((rx + rw, y));
                }
            }

            if let Some(&(x, y)) = wall_positions.choose(&mut self.rng) {
                self.tiles[y as usize][x as usize] = Tile::Torch;
            }
        }
    }

    fn generate_room_name(&mut self, room_type: &str) -> String {
        let prefixes: &[&str] = match room_type {
            "chamber" => &["Ancient", "Dusty", "Forgotten", "Hidden", "Dark"],
            "library" => &["Ruined", "Arcane", "Silent", "Forbidden", "Lost"],
            "armory" => &["Old", "Royal", "Abandoned", "Guard's", "Knight's"],
            "bedroom" => &["Noble's", "Servant's", "Guest", "Master", "Dusty"],
            "storage" => &["Supply", "Old", "Forgotten", "Cluttered", "Dark"],
            "throne_room" => &["Grand", "Fallen", "Ancient", "Cursed", "Royal"],
            "dining_hall" => &["Great", "Abandoned", "Noble", "Feasting", "Old"],
            "crypt" => &["Silent", "Haunted", "Ancient", "Forgotten", "Dark"],
            "treasury" => &["Empty", "Looted", "Hidden", "Royal", "Forgotten"],
            "dungeon_cell" => &["Dark", "Damp", "Forgotten", "Torture", "Prison"],
            "alchemy_lab" => &["Abandoned", "Mysterious", "Arcane", "Ruined", "Secret"],
            "guard_post" => &["Abandoned", "Old", "Watchtower", "Patrol", "Empty"],
            _ => &["Mysterious"],
        };
        let type_name = match room_type {
            "chamber" => "Chamber",
            "library" => "Library",
            "armory" => "Armory",
            "bedroom" => "Bedroom",
            "storage" => "Storage Room",
            "throne_room" => "Throne Room",
            "dining_hall" => "Dining Hall",
            "crypt" => "Crypt",
            "treasury" => "Treasury",
            "dungeon_cell" => "Cell",
            "alchemy_lab" => "Laboratory",
            "guard_post" => "Guard Post",
            _ => "Room",
        };
        let prefix = prefixes.choose(&mut self.rng).unwrap_or(&"Mysterious");
        format!("{prefix} {type_name}")
    }
}

/// Generate a dungeon map with default room sizes.
pub fn generate_dungeon(
    width: i32,
    height: i32,
    room_count: usize,
    seed: Option<u64>,
) -> GeneratedMap {
    DungeonGenerator::new(width, height, 8, 14, room_count, seed).generate()
}
