//! A* pathfinding and corridor detection for monster movement.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::domain::{Room, Tile};

/// 8 compass directions plus None for "no threat visible".
///
/// Encoded as 0..=8 in the AI state space and on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    North,
    NorthEast,
    East,
    SouthEast,
    South,
    SouthWest,
    West,
    NorthWest,
    None,
}

pub const DIRECTION_NAMES: [&str; 9] = ["N", "NE", "E", "SE", "S", "SW", "W", "NW", "NONE"];

impl Direction {
    pub fn index(&self) -> u8 {
        match self {
            Direction::North => 0,
            Direction::NorthEast => 1,
            Direction::East => 2,
            Direction::SouthEast => 3,
            Direction::South => 4,
            Direction::SouthWest => 5,
            Direction::West => 6,
            Direction::NorthWest => 7,
            Direction::None => 8,
        }
    }

    pub fn from_index(index: u8) -> Direction {
        match index {
            0 => Direction::North,
            1 => Direction::NorthEast,
            2 => Direction::East,
            3 => Direction::SouthEast,
            4 => Direction::South,
            5 => Direction::SouthWest,
            6 => Direction::West,
            7 => Direction::NorthWest,
            _ => Direction::None,
        }
    }

    pub fn from_delta(dx: i32, dy: i32) -> Direction {
        if dx == 0 && dy == 0 {
            return Direction::None;
        }
        match (dx.signum(), dy.signum()) {
            (0, -1) => Direction::North,
            (1, -1) => Direction::NorthEast,
            (1, 0) => Direction::East,
            (1, 1) => Direction::SouthEast,
            (0, 1) => Direction::South,
            (-1, 1) => Direction::SouthWest,
            (-1, 0) => Direction::West,
            (-1, -1) => Direction::NorthWest,
            _ => Direction::None,
        }
    }

    pub fn to_delta(&self) -> (i32, i32) {
        match self {
            Direction::North => (0, -1),
            Direction::NorthEast => (1, -1),
            Direction::East => (1, 0),
            Direction::SouthEast => (1, 1),
            Direction::South => (0, 1),
            Direction::SouthWest => (-1, 1),
            Direction::West => (-1, 0),
            Direction::NorthWest => (-1, -1),
            Direction::None => (0, 0),
        }
    }

    /// The opposite compass direction (used for fleeing).
    pub fn opposite(&self) -> Direction {
        if *self == Direction::None {
            return Direction::None;
        }
        Direction::from_index((self.index() + 4) % 8)
    }
}

impl Serialize for Direction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.index())
    }
}

impl<'de> Deserialize<'de> for Direction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let index = u8::deserialize(deserializer)?;
        if index > 8 {
            return Err(de::Error::custom(format!("invalid direction {index}")));
        }
        Ok(Direction::from_index(index))
    }
}

/// Compass direction from one point to another.
pub fn direction_to_target(from_x: i32, from_y: i32, to_x: i32, to_y: i32) -> Direction {
    Direction::from_delta(to_x - from_x, to_y - from_y)
}

const DIAGONAL_COST: f32 = 1.414;

#[derive(Clone, Copy)]
struct HeapEntry {
    f: f32,
    node: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.f == other.f
    }
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse so the BinaryHeap pops the lowest f-cost first
        other.f.total_cmp(&self.f)
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct SearchNode {
    x: i32,
    y: i32,
    g: f32,
    parent: Option<usize>,
}

/// A* over the tile grid with an occupied-position set.
///
/// Manhattan heuristic; cardinal moves cost 1.0, diagonals 1.414 and require
/// both cardinal neighbors to be walkable (no cutting corners through walls).
pub struct AStar<'a> {
    tiles: &'a [Vec<Tile>],
    occupied: &'a HashSet<(i32, i32)>,
    width: i32,
    height: i32,
}

impl<'a> AStar<'a> {
    pub fn new(tiles: &'a [Vec<Tile>], occupied: &'a HashSet<(i32, i32)>) -> Self {
        let height = tiles.len() as i32;
        let width = tiles.first().map(|row| row.len()).unwrap_or(0) as i32;
        AStar {
            tiles,
            occupied,
            width,
            height,
        }
    }

    fn heuristic(x1: i32, y1: i32, x2: i32, y2: i32) -> f32 {
        ((x1 - x2).abs() + (y1 - y2).abs()) as f32
    }

    fn is_walkable(&self, x: i32, y: i32, ignore_occupied: bool) -> bool {
        if x < 0 || x >= self.width || y < 0 || y >= self.height {
            return false;
        }
        if !self.tiles[y as usize][x as usize].is_walkable() {
            return false;
        }
        ignore_occupied || !self.occupied.contains(&(x, y))
    }

    /// Find the shortest path from start to goal, excluding the start tile.
    /// Returns None when no path exists within `max_iterations`.
    pub fn find_path(
        &self,
        start: (i32, i32),
        goal: (i32, i32),
        max_iterations: usize,
    ) -> Option<Vec<(i32, i32)>> {
        if !self.is_walkable(start.0, start.1, true) || !self.is_walkable(goal.0, goal.1, true) {
            return None;
        }

        let mut arena = vec![SearchNode {
            x: start.0,
            y: start.1,
            g: 0.0,
            parent: None,
        }];
        let mut open = BinaryHeap::new();
        open.push(HeapEntry {
            f: Self::heuristic(start.0, start.1, goal.0, goal.1),
            node: 0,
        });
        let mut g_scores: HashMap<(i32, i32), f32> = HashMap::from([(start, 0.0)]);
        let mut closed: HashSet<(i32, i32)> = HashSet::new();

        let mut iterations = 0;
        while let Some(entry) = open.pop() {
            if iterations >= max_iterations {
                break;
            }
            iterations += 1;

            let (cx, cy, cg) = {
                let node = &arena[entry.node];
                (node.x, node.y, node.g)
            };

            if (cx, cy) == goal {
                return Some(self.reconstruct_path(&arena, entry.node));
            }
            if !closed.insert((cx, cy)) {
                continue;
            }

            for (nx, ny, cost) in self.neighbors(cx, cy) {
                if closed.contains(&(nx, ny)) {
                    continue;
                }
                let tentative_g = cg + cost;
                if let Some(&best) = g_scores.get(&(nx, ny)) {
                    if tentative_g >= best {
                        continue;
                    }
                }
                g_scores.insert((nx, ny), tentative_g);
                arena.push(SearchNode {
                    x: nx,
                    y: ny,
                    g: tentative_g,
                    parent: Some(entry.node),
                });
                open.push(HeapEntry {
                    f: tentative_g + Self::heuristic(nx, ny, goal.0, goal.1),
                    node: arena.len() - 1,
                });
            }
        }
        None
    }

    fn neighbors(&self, x: i32, y: i32) -> Vec<(i32, i32, f32)> {
        let mut result = Vec::with_capacity(8);
        for (dx, dy) in [(0, -1), (0, 1), (-1, 0), (1, 0)] {
            let (nx, ny) = (x + dx, y + dy);
            if self.is_walkable(nx, ny, false) {
                result.push((nx, ny, 1.0));
            }
        }
        for (dx, dy) in [(-1, -1), (1, -1), (-1, 1), (1, 1)] {
            let (nx, ny) = (x + dx, y + dy);
            if self.is_walkable(nx, ny, false)
                && self.is_walkable(x + dx, y, false)
                && self.is_walkable(x, y + dy, false)
            {
                result.push((nx, ny, DIAGONAL_COST));
            }
        }
        result
    }

    fn reconstruct_path(&self, arena: &[SearchNode], goal_index: usize) -> Vec<(i32, i32)> {
        let mut path = Vec::new();
        let mut current = Some(goal_index);
        while let Some(index) = current {
            let node = &arena[index];
            path.push((node.x, node.y));
            current = node.parent;
        }
        path.reverse();
        // Drop the start position; the caller is already there
        if path.len() > 1 {
            path.remove(0);
            path
        } else {
            Vec::new()
        }
    }

    /// Find the reachable position within the radius that maximizes Manhattan
    /// distance from the threat. Returns None when trapped.
    pub fn find_flee_position(
        &self,
        start: (i32, i32),
        threat: (i32, i32),
        search_radius: i32,
    ) -> Option<(i32, i32)> {
        let mut best_pos = None;
        let mut best_distance = 0;

        for dy in -search_radius..=search_radius {
            for dx in -search_radius..=search_radius {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let (nx, ny) = (start.0 + dx, start.1 + dy);
                if !self.is_walkable(nx, ny, false) {
                    continue;
                }
                let dist = (nx - threat.0).abs() + (ny - threat.1).abs();
                if dist > best_distance && self.find_path(start, (nx, ny), 100).is_some() {
                    best_distance = dist;
                    best_pos = Some((nx, ny));
                }
            }
        }
        best_pos
    }
}

/// A corridor tile is a walkable tile not inside any room.
pub fn is_in_corridor(x: i32, y: i32, tiles: &[Vec<Tile>], rooms: &[Room]) -> bool {
    let height = tiles.len() as i32;
    let width = tiles.first().map(|row| row.len()).unwrap_or(0) as i32;
    if x < 0 || x >= width || y < 0 || y >= height {
        return false;
    }
    if !tiles[y as usize][x as usize].is_walkable() {
        return false;
    }
    !rooms.iter().any(|r| r.contains(x, y))
}

/// BFS for the nearest corridor tile, bounded by `max_search` steps.
pub fn find_nearest_corridor(
    x: i32,
    y: i32,
    tiles: &[Vec<Tile>],
    rooms: &[Room],
    max_search: i32,
) -> Option<(i32, i32)> {
    let height = tiles.len() as i32;
    let width = tiles.first().map(|row| row.len()).unwrap_or(0) as i32;

    let mut visited = HashSet::from([(x, y)]);
    let mut queue = VecDeque::from([(x, y, 0)]);

    while let Some((cx, cy, dist)) = queue.pop_front() {
        if dist > max_search {
            break;
        }
        if is_in_corridor(cx, cy, tiles, rooms) {
            return Some((cx, cy));
        }
        for (dx, dy) in [(0, -1), (0, 1), (-1, 0), (1, 0)] {
            let (nx, ny) = (cx + dx, cy + dy);
            if visited.contains(&(nx, ny)) {
                continue;
            }
            if nx < 0 || nx >= width || ny < 0 || ny >= height {
                continue;
            }
            if !tiles[ny as usize][nx as usize].is_walkable() {
                continue;
            }
            visited.insert((nx, ny));
            queue.push_back((nx, ny, dist + 1));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a grid from an ASCII sketch: '.' floor, '#' wall, '+' closed door.
    fn grid(rows: &[&str]) -> Vec<Vec<Tile>> {
        rows.iter()
            .map(|row| {
                row.chars()
                    .map(|c| match c {
                        '.' => Tile::Floor,
                        '#' => Tile::Wall,
                        '+' => Tile::DoorClosed,
                        '/' => Tile::DoorOpen,
                        _ => Tile::Void,
                    })
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_straight_path() {
        let tiles = grid(&["....."]);
        let occupied = HashSet::new();
        let astar = AStar::new(&tiles, &occupied);
        let path = astar.find_path((0, 0), (4, 0), 1000).unwrap();
        assert_eq!(path, vec![(1, 0), (2, 0), (3, 0), (4, 0)]);
    }

    #[test]
    fn test_path_excludes_start() {
        let tiles = grid(&["..."]);
        let occupied = HashSet::new();
        let astar = AStar::new(&tiles, &occupied);
        let path = astar.find_path((0, 0), (0, 0), 1000).unwrap();
        assert!(path.is_empty());
    }

    #[test]
    fn test_path_around_wall() {
        let tiles = grid(&[
            ".....",
            ".###.",
            ".....",
        ]);
        let occupied = HashSet::new();
        let astar = AStar::new(&tiles, &occupied);
        let path = astar.find_path((0, 1), (4, 1), 1000).unwrap();
        assert_eq!(path.last(), Some(&(4, 1)));
        assert!(path.iter().all(|&(x, y)| tiles[y as usize][x as usize].is_walkable()));
    }

    #[test]
    fn test_no_corner_cutting() {
        // Diagonal from (0,0) to (1,1) must not squeeze between two walls
        let tiles = grid(&[
            ".#",
            "#.",
        ]);
        let occupied = HashSet::new();
        let astar = AStar::new(&tiles, &occupied);
        assert!(astar.find_path((0, 0), (1, 1), 1000).is_none());
    }

    #[test]
    fn test_diagonal_allowed_when_open() {
        let tiles = grid(&[
            "..",
            "..",
        ]);
        let occupied = HashSet::new();
        let astar = AStar::new(&tiles, &occupied);
        let path = astar.find_path((0, 0), (1, 1), 1000).unwrap();
        assert_eq!(path, vec![(1, 1)]);
    }

    #[test]
    fn test_occupied_blocks_path() {
        let tiles = grid(&["..."]);
        let occupied = HashSet::from([(1, 0)]);
        let astar = AStar::new(&tiles, &occupied);
        assert!(astar.find_path((0, 0), (2, 0), 1000).is_none());
    }

    #[test]
    fn test_closed_door_blocks_open_door_passes() {
        let closed = grid(&[".+."]);
        let open = grid(&["./."]);
        let occupied = HashSet::new();
        assert!(AStar::new(&closed, &occupied).find_path((0, 0), (2, 0), 1000).is_none());
        assert!(AStar::new(&open, &occupied).find_path((0, 0), (2, 0), 1000).is_some());
    }

    #[test]
    fn test_max_iterations_bounds_search() {
        let rows: Vec<String> = (0..50).map(|_| ".".repeat(50)).collect();
        let row_refs: Vec<&str> = rows.iter().map(String::as_str).collect();
        let tiles = grid(&row_refs);
        let occupied = HashSet::new();
        let astar = AStar::new(&tiles, &occupied);
        assert!(astar.find_path((0, 0), (49, 49), 5).is_none());
        assert!(astar.find_path((0, 0), (49, 49), 100_000).is_some());
    }

    #[test]
    fn test_flee_position_maximizes_distance() {
        let tiles = grid(&[
            ".....",
            ".....",
            ".....",
        ]);
        let occupied = HashSet::new();
        let astar = AStar::new(&tiles, &occupied);
        let flee = astar.find_flee_position((2, 1), (0, 1), 2).unwrap();
        let dist = (flee.0 - 0).abs() + (flee.1 - 1).abs();
        assert!(dist >= 4, "expected a far position, got {flee:?}");
    }

    #[test]
    fn test_direction_from_delta() {
        assert_eq!(Direction::from_delta(0, -3), Direction::North);
        assert_eq!(Direction::from_delta(5, 5), Direction::SouthEast);
        assert_eq!(Direction::from_delta(-1, 0), Direction::West);
        assert_eq!(Direction::from_delta(0, 0), Direction::None);
    }

    #[test]
    fn test_direction_opposite() {
        assert_eq!(Direction::North.opposite(), Direction::South);
        assert_eq!(Direction::NorthEast.opposite(), Direction::SouthWest);
        assert_eq!(Direction::None.opposite(), Direction::None);
    }

    #[test]
    fn test_corridor_detection() {
        let tiles = grid(&[
            ".....",
        ]);
        let room = Room::new("room_1".into(), 0, 0, 2, 1, "chamber");
        let rooms = vec![room];
        assert!(!is_in_corridor(0, 0, &tiles, &rooms));
        assert!(!is_in_corridor(1, 0, &tiles, &rooms));
        assert!(is_in_corridor(2, 0, &tiles, &rooms));
        assert_eq!(find_nearest_corridor(0, 0, &tiles, &rooms, 10), Some((2, 0)));
    }
}
