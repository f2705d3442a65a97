//! Monster service: spawning, per-tick AI behavior, combat decisions, and
//! reward application into the species knowledge store.
//!
//! The service is the single writer of species Q-tables. Reward events from
//! every game funnel through one consumer task, so concurrent games never
//! race on a species record.

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::broadcast;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::domain::{Monster, MonsterBehavior, MonsterIntelligenceState, Room, Tile};
use crate::dungeon::pathfinding::{direction_to_target, find_nearest_corridor, is_in_corridor, AStar};
use crate::events::{AiSnapshot, EventBus, EventData, GameEvent};
use crate::intelligence::{
    AiAction, DecisionEngine, DecisionResult, SpeciesKnowledgeStore, ThreatMemory, WorldState,
    ACTION_COUNT, OBLIVIOUS_INTELLIGENCE_THRESHOLD, STATE_SPACE,
};
use crate::config::AiSettings;
use crate::services::storage::Storage;

use super::bestiary::{self, SpeciesDef};

struct ServiceState {
    store: SpeciesKnowledgeStore,
    /// Per-species decision engines; each carries its own exploration state.
    engines: HashMap<&'static str, DecisionEngine>,
    /// Per-monster threat memories, keyed by monster id.
    memories: HashMap<String, ThreatMemory>,
}

pub struct MonsterService {
    events: EventBus,
    ai: AiSettings,
    state: Mutex<ServiceState>,
}

impl MonsterService {
    pub async fn new(storage: Arc<dyn Storage>, events: EventBus, ai: AiSettings) -> Self {
        let ai = ai.clamped();
        let store = SpeciesKnowledgeStore::load(storage).await;
        let engines = bestiary::SPECIES
            .iter()
            .map(|def| (def.monster_type, DecisionEngine::new(def.learning)))
            .collect();
        tracing::info!(
            species = bestiary::SPECIES.len(),
            known = store.species_count(),
            "monster service ready"
        );
        MonsterService {
            events,
            ai,
            state: Mutex::new(ServiceState {
                store,
                engines,
                memories: HashMap::new(),
            }),
        }
    }

    /// Consume reward events from the bus. One task serializes all Q-table
    /// writes (the store is single-writer).
    pub fn spawn_reward_consumer(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        let mut rx = service.events.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(event) => service.handle_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "reward consumer lagged; events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    async fn handle_event(&self, event: GameEvent) {
        match event.data {
            EventData::DamageDealt {
                ai_snapshot: Some(snapshot),
                reward,
                ..
            } => {
                self.apply_reward(&snapshot, reward, false).await;
            }
            EventData::MonsterDied {
                ai_snapshot: Some(snapshot),
                reward,
                ..
            } => {
                self.apply_reward(&snapshot, reward, true).await;
            }
            _ => {}
        }
    }

    /// Apply a Q-learning reward from a snapshot. Malformed input (unknown
    /// species or action, out-of-range state, zero reward) is ignored.
    async fn apply_reward(&self, snapshot: &AiSnapshot, reward: f32, is_death: bool) {
        if reward == 0.0 || snapshot.state_index >= STATE_SPACE {
            return;
        }
        let Some(def) = bestiary::species(&snapshot.monster_type) else {
            return;
        };

        let mut state = self.state.lock().await;
        let ServiceState { store, engines, .. } = &mut *state;
        let Some(engine) = engines.get_mut(def.monster_type) else {
            return;
        };

        let hp_ratio = snapshot.hp_ratio.clamp(0.0, 1.0);
        let (next_state_index, _) = engine.encoder.encode_world(hp_ratio, &snapshot.world_state);

        let (q_before, q_after) = {
            let record = store.get_or_create(&snapshot.monster_type, STATE_SPACE, ACTION_COUNT);
            let q_before = record.q_table.get(snapshot.state_index, snapshot.action.index());
            engine.learn(
                &mut record.q_table,
                snapshot.state_index,
                next_state_index,
                snapshot.action,
                reward,
            );
            let q_after = record.q_table.get(snapshot.state_index, snapshot.action.index());
            (q_before, q_after)
        };

        store
            .record_learning_event(
                &snapshot.monster_type,
                reward,
                snapshot.state_index,
                snapshot.action.name(),
                q_before,
                q_after,
            )
            .await;

        if is_death && store.bump_generation(&snapshot.monster_type, self.ai.max_generation_cap) {
            // A new generation inherits only part of the learned policy
            let record = store.get_or_create(&snapshot.monster_type, STATE_SPACE, ACTION_COUNT);
            record.q_table.scale(self.ai.generation_inheritance_ratio);
        }

        tracing::debug!(
            monster_type = %snapshot.monster_type,
            state = snapshot.state_index,
            action = snapshot.action.name(),
            reward,
            q_before,
            q_after,
            "q-learning update"
        );

        store.save().await;
    }

    /// Spawn monsters in a freshly discovered room.
    ///
    /// Small rooms spawn nothing; otherwise a single spawn-chance roll gates
    /// the room, and up to `min(max_monsters, area / 50)` monsters are placed
    /// on interior floor tiles that are neither occupied nor within one tile
    /// of a door.
    pub async fn spawn_monsters_in_room(
        &self,
        room: &Room,
        tiles: &[Vec<Tile>],
        occupied: &mut HashSet<(i32, i32)>,
        map_width: i32,
        map_height: i32,
    ) -> Vec<Monster> {
        let mut spawned = Vec::new();
        if room.area() < bestiary::MIN_ROOM_AREA_FOR_SPAWN {
            return spawned;
        }

        // All randomness happens before the state lock
        let picks: Vec<(&'static SpeciesDef, (i32, i32))> = {
            let mut rng = rand::thread_rng();
            if rng.gen::<f64>() > bestiary::spawn_chance(&room.room_type) {
                return spawned;
            }

            let monster_count =
                (room.area() / 50).max(1).min(bestiary::MAX_MONSTERS_PER_ROOM as i32) as usize;

            let mut valid_positions = Vec::new();
            for y in room.y + 1..room.y + room.height - 1 {
                for x in room.x + 1..room.x + room.width - 1 {
                    if tiles[y as usize][x as usize] != Tile::Floor
                        || occupied.contains(&(x, y))
                    {
                        continue;
                    }
                    let near_door = (-1..=1).any(|dy: i32| {
                        (-1..=1).any(|dx: i32| {
                            let (nx, ny) = (x + dx, y + dy);
                            nx >= 0
                                && nx < map_width
                                && ny >= 0
                                && ny < map_height
                                && tiles[ny as usize][nx as usize].is_door()
                        })
                    });
                    if !near_door {
                        valid_positions.push((x, y));
                    }
                }
            }

            let mut picks = Vec::new();
            for _ in 0..monster_count.min(valid_positions.len()) {
                let Some(def) = pick_species(&mut rng, &room.room_type) else {
                    continue;
                };
                let index = rng.gen_range(0..valid_positions.len());
                let pos = valid_positions.swap_remove(index);
                picks.push((def, pos));
            }
            picks
        };

        if picks.is_empty() {
            return spawned;
        }

        let mut state = self.state.lock().await;
        for (def, pos) in picks {
            let monster = create_monster(&mut state, def, pos.0, pos.1, &room.id);
            occupied.insert(pos);
            tracing::debug!(
                monster = %monster.name,
                x = pos.0,
                y = pos.1,
                room = %room.name,
                "spawned monster"
            );
            spawned.push(monster);
        }
        spawned
    }

    /// Drop per-monster AI state when a monster is removed from the world.
    pub async fn forget(&self, monster_id: &str) {
        self.state.lock().await.memories.remove(monster_id);
    }

    /// Per-tick AI update for one monster. Returns true when it moved.
    #[allow(clippy::too_many_arguments)]
    pub async fn update_monster(
        &self,
        monster: &mut Monster,
        room_bounds: (i32, i32, i32, i32),
        tiles: &[Vec<Tile>],
        occupied: &HashSet<(i32, i32)>,
        current_tick: u64,
        world_state: &WorldState,
        rooms: &[Room],
    ) -> bool {
        let Some(def) = bestiary::species(&monster.monster_type) else {
            // Unknown species (stale save): fall back to the declared behavior
            return match monster.behavior {
                MonsterBehavior::Patrol => {
                    update_patrol(monster, room_bounds, tiles, occupied, current_tick)
                }
                _ => false,
            };
        };

        // Reuse the last decision within the species' cooldown window to keep
        // movement coherent between decisions.
        let elapsed = current_tick.saturating_sub(monster.intelligence_state.last_decision_tick);
        let action = match monster.intelligence_state.last_action {
            Some(last) if elapsed < def.decision_cooldown_ticks as u64 => last,
            _ => {
                let mut state = self.state.lock().await;
                evaluate_decision(&mut state, def, monster, current_tick, world_state).action
            }
        };

        execute_action(
            action,
            monster,
            room_bounds,
            tiles,
            occupied,
            current_tick,
            world_state,
            rooms,
        )
    }

    /// Decide a combat action with the in-melee overlay applied.
    ///
    /// Oblivious species never notice their attacker, so they keep patrolling
    /// instead of emitting combat actions.
    pub async fn decide_combat_action(
        &self,
        monster: &mut Monster,
        current_tick: u64,
        world_state: &WorldState,
    ) -> AiAction {
        let Some(def) = bestiary::species(&monster.monster_type) else {
            return AiAction::AttackAggressive;
        };
        if monster.stats.intelligence <= OBLIVIOUS_INTELLIGENCE_THRESHOLD {
            return AiAction::Patrol;
        }

        let mut world = world_state.clone();
        world.distance_to_threat = 1;
        world.in_corridor = false;

        let mut state = self.state.lock().await;
        evaluate_decision(&mut state, def, monster, current_tick, &world).action
    }

    /// Persist all dirty species knowledge.
    pub async fn save(&self) {
        self.state.lock().await.store.save().await;
    }
}

/// Run the shared decision pipeline and sync the monster's generation from
/// the species record.
fn evaluate_decision(
    state: &mut ServiceState,
    def: &'static SpeciesDef,
    monster: &mut Monster,
    current_tick: u64,
    world_state: &WorldState,
) -> DecisionResult {
    let ServiceState {
        store,
        engines,
        memories,
    } = state;

    let memory = memories
        .entry(monster.id.clone())
        .or_insert_with(|| ThreatMemory::new(def.memory_capacity, def.memory_decay));
    let record = store.get_or_create(&monster.monster_type, STATE_SPACE, ACTION_COUNT);

    let Some(engine) = engines.get(def.monster_type) else {
        // Engines cover every bestiary species; this is unreachable in
        // practice but harmless if a species table changes at runtime.
        return DecisionResult {
            action: AiAction::Patrol,
            state_index: 0,
            discrete_state: [0; 7],
            confidence: 0.5,
        };
    };

    let decision = engine.decide(
        monster,
        memory,
        &def.personality,
        &record.q_table,
        current_tick,
        world_state,
    );
    monster.intelligence_state.generation = record.generation;
    decision
}

fn create_monster(
    state: &mut ServiceState,
    def: &'static SpeciesDef,
    x: i32,
    y: i32,
    room_id: &str,
) -> Monster {
    let id = format!("m_{}", &uuid::Uuid::new_v4().to_string()[..8]);
    let record = state
        .store
        .get_or_create(def.monster_type, STATE_SPACE, ACTION_COUNT);

    let mut monster = Monster {
        id: id.clone(),
        monster_type: def.monster_type.to_string(),
        name: def.name.to_string(),
        x,
        y,
        room_id: room_id.to_string(),
        symbol: def.symbol.to_string(),
        color: def.color.to_string(),
        stats: def.stats(),
        behavior: def.behavior,
        description: def.description.to_string(),
        patrol_target: None,
        last_move_tick: 0,
        target_player_id: None,
        last_seen_player_pos: None,
        intelligence_state: MonsterIntelligenceState::default(),
    };
    monster.intelligence_state.generation = record.generation;
    monster.intelligence_state.q_table_version = record.q_table.states();

    state.memories.insert(
        id,
        ThreatMemory::new(def.memory_capacity, def.memory_decay),
    );
    monster
}

fn pick_species<R: Rng>(rng: &mut R, room_type: &str) -> Option<&'static SpeciesDef> {
    let weights = bestiary::monster_weights(room_type);
    let total: u32 = weights.iter().map(|(_, w)| w).sum();
    if total == 0 {
        return None;
    }
    let mut roll = rng.gen_range(0..total);
    for (monster_type, weight) in weights {
        if roll < *weight {
            return bestiary::species(monster_type);
        }
        roll -= weight;
    }
    None
}

/// Per-monster movement cadence, derived from the id so a crowd of monsters
/// does not step in lockstep.
fn move_interval(monster_id: &str, base: u64, spread: u64) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    monster_id.hash(&mut hasher);
    base + hasher.finish() % spread
}

#[allow(clippy::too_many_arguments)]
fn execute_action(
    action: AiAction,
    monster: &mut Monster,
    room_bounds: (i32, i32, i32, i32),
    tiles: &[Vec<Tile>],
    occupied: &HashSet<(i32, i32)>,
    current_tick: u64,
    world_state: &WorldState,
    rooms: &[Room],
) -> bool {
    match action {
        AiAction::MoveTowardThreat => {
            move_toward_threat(monster, tiles, occupied, current_tick, world_state)
        }
        AiAction::MoveAwayFromThreat => {
            move_away_from_threat(monster, tiles, occupied, current_tick, world_state)
        }
        AiAction::PatrolWaypoint => {
            patrol_waypoint(monster, tiles, occupied, current_tick, rooms)
        }
        AiAction::Patrol | AiAction::Ambush | AiAction::AttackDefensive => {
            update_patrol(monster, room_bounds, tiles, occupied, current_tick)
        }
        AiAction::Flee => attempt_flee(monster, room_bounds, tiles, occupied, current_tick),
        // Stance and social actions hold position outside combat
        AiAction::AttackAggressive | AiAction::Defend | AiAction::CallAllies => false,
    }
}

/// Random in-room wandering, one cardinal step every few ticks.
fn update_patrol(
    monster: &mut Monster,
    room_bounds: (i32, i32, i32, i32),
    tiles: &[Vec<Tile>],
    occupied: &HashSet<(i32, i32)>,
    current_tick: u64,
) -> bool {
    if current_tick.saturating_sub(monster.last_move_tick) < move_interval(&monster.id, 2, 3) {
        return false;
    }

    let (rx, ry, rw, rh) = room_bounds;
    let mut rng = rand::thread_rng();
    let mut directions = [(0, -1), (0, 1), (-1, 0), (1, 0)];
    directions.shuffle(&mut rng);

    for (dx, dy) in directions {
        let (new_x, new_y) = (monster.x + dx, monster.y + dy);
        if new_x < rx || new_x >= rx + rw || new_y < ry || new_y >= ry + rh {
            continue;
        }
        if tiles[new_y as usize][new_x as usize] != Tile::Floor {
            continue;
        }
        if occupied.contains(&(new_x, new_y)) {
            continue;
        }
        monster.x = new_x;
        monster.y = new_y;
        monster.last_move_tick = current_tick;
        return true;
    }
    false
}

/// Panicked in-room scramble; unlike MOVE_AWAY_FROM_THREAT there is no
/// pathfinding, just any open cardinal step.
fn attempt_flee(
    monster: &mut Monster,
    room_bounds: (i32, i32, i32, i32),
    tiles: &[Vec<Tile>],
    occupied: &HashSet<(i32, i32)>,
    current_tick: u64,
) -> bool {
    let (rx, ry, rw, rh) = room_bounds;
    let mut rng = rand::thread_rng();
    let mut directions = [(0, 1), (0, -1), (1, 0), (-1, 0)];
    directions.shuffle(&mut rng);

    for (dx, dy) in directions {
        let (new_x, new_y) = (monster.x + dx, monster.y + dy);
        if new_x < rx || new_x >= rx + rw || new_y < ry || new_y >= ry + rh {
            continue;
        }
        if tiles[new_y as usize][new_x as usize] != Tile::Floor {
            continue;
        }
        if occupied.contains(&(new_x, new_y)) {
            continue;
        }
        monster.x = new_x;
        monster.y = new_y;
        monster.last_move_tick = current_tick;
        return true;
    }
    false
}

/// Chase the nearest threat with A*, taking the first step of the path.
fn move_toward_threat(
    monster: &mut Monster,
    tiles: &[Vec<Tile>],
    occupied: &HashSet<(i32, i32)>,
    current_tick: u64,
    world_state: &WorldState,
) -> bool {
    if current_tick.saturating_sub(monster.last_move_tick) < move_interval(&monster.id, 2, 2) {
        return false;
    }
    let Some((threat_x, threat_y)) = world_state.threat_position else {
        return false;
    };

    // Already in melee range
    if (monster.x - threat_x).abs() + (monster.y - threat_y).abs() <= 1 {
        return false;
    }

    let astar = AStar::new(tiles, occupied);
    let Some(path) = astar.find_path((monster.x, monster.y), (threat_x, threat_y), 200) else {
        return false;
    };
    let Some(&(next_x, next_y)) = path.first() else {
        return false;
    };
    if occupied.contains(&(next_x, next_y)) {
        return false;
    }

    monster.x = next_x;
    monster.y = next_y;
    monster.last_move_tick = current_tick;
    true
}

/// Calculated retreat toward the best reachable flee position.
fn move_away_from_threat(
    monster: &mut Monster,
    tiles: &[Vec<Tile>],
    occupied: &HashSet<(i32, i32)>,
    current_tick: u64,
    world_state: &WorldState,
) -> bool {
    if current_tick.saturating_sub(monster.last_move_tick) < move_interval(&monster.id, 2, 2) {
        return false;
    }
    let Some((threat_x, threat_y)) = world_state.threat_position else {
        return false;
    };

    let astar = AStar::new(tiles, occupied);
    let Some(flee_pos) =
        astar.find_flee_position((monster.x, monster.y), (threat_x, threat_y), 4)
    else {
        // Trapped: try a plain step directly away from the threat
        let direction =
            direction_to_target(monster.x, monster.y, threat_x, threat_y).opposite();
        let (dx, dy) = direction.to_delta();
        let (new_x, new_y) = (monster.x + dx, monster.y + dy);
        if can_move_to(new_x, new_y, tiles, occupied) {
            monster.x = new_x;
            monster.y = new_y;
            monster.last_move_tick = current_tick;
            return true;
        }
        return false;
    };

    let Some(path) = astar.find_path((monster.x, monster.y), flee_pos, 100) else {
        return false;
    };
    let Some(&(next_x, next_y)) = path.first() else {
        return false;
    };
    if occupied.contains(&(next_x, next_y)) {
        return false;
    }

    monster.x = next_x;
    monster.y = next_y;
    monster.last_move_tick = current_tick;
    true
}

/// Move toward a cached patrol waypoint, generating a new one when it is
/// reached or becomes unreachable. This is what lets monsters roam through
/// corridors rather than pacing their spawn room forever.
fn patrol_waypoint(
    monster: &mut Monster,
    tiles: &[Vec<Tile>],
    occupied: &HashSet<(i32, i32)>,
    current_tick: u64,
    rooms: &[Room],
) -> bool {
    if current_tick.saturating_sub(monster.last_move_tick) < move_interval(&monster.id, 3, 3) {
        return false;
    }

    let waypoint = match monster.patrol_target {
        Some(wp) if wp != (monster.x, monster.y) => wp,
        _ => {
            let Some(wp) = generate_patrol_waypoint(monster, tiles, rooms) else {
                monster.patrol_target = None;
                return false;
            };
            monster.patrol_target = Some(wp);
            wp
        }
    };

    let astar = AStar::new(tiles, occupied);
    let Some(path) = astar.find_path((monster.x, monster.y), waypoint, 150) else {
        // Unreachable waypoint: drop it and retry next tick
        monster.patrol_target = None;
        return false;
    };
    let Some(&(next_x, next_y)) = path.first() else {
        return false;
    };
    if occupied.contains(&(next_x, next_y)) {
        return false;
    }

    monster.x = next_x;
    monster.y = next_y;
    monster.last_move_tick = current_tick;
    true
}

/// Pick the next patrol waypoint:
/// 1. In a room: 40% chance to head for the nearest corridor
/// 2. In a corridor: 60% chance per nearby room to head for its center
/// 3. Otherwise a random floor tile within a 6-tile box
fn generate_patrol_waypoint(
    monster: &Monster,
    tiles: &[Vec<Tile>],
    rooms: &[Room],
) -> Option<(i32, i32)> {
    let height = tiles.len() as i32;
    let width = tiles.first().map(|row| row.len()).unwrap_or(0) as i32;
    let mut rng = rand::thread_rng();

    let in_room = rooms.iter().any(|r| r.contains(monster.x, monster.y));
    if in_room && rng.gen_bool(0.4) {
        if let Some(corridor) = find_nearest_corridor(monster.x, monster.y, tiles, rooms, 8) {
            return Some(corridor);
        }
    }

    if is_in_corridor(monster.x, monster.y, tiles, rooms) {
        for room in rooms {
            let dist = (room.center_x() - monster.x).abs() + (room.center_y() - monster.y).abs();
            if dist < 15 && rng.gen_bool(0.6) {
                return Some(room.center());
            }
        }
    }

    let mut valid_positions = Vec::new();
    for dy in -6..=6 {
        for dx in -6..=6 {
            if dx == 0 && dy == 0 {
                continue;
            }
            let (nx, ny) = (monster.x + dx, monster.y + dy);
            if nx >= 0
                && nx < width
                && ny >= 0
                && ny < height
                && tiles[ny as usize][nx as usize] == Tile::Floor
            {
                valid_positions.push((nx, ny));
            }
        }
    }
    valid_positions.choose(&mut rng).copied()
}

fn can_move_to(x: i32, y: i32, tiles: &[Vec<Tile>], occupied: &HashSet<(i32, i32)>) -> bool {
    let height = tiles.len() as i32;
    let width = tiles.first().map(|row| row.len()).unwrap_or(0) as i32;
    x >= 0
        && x < width
        && y >= 0
        && y < height
        && tiles[y as usize][x as usize] == Tile::Floor
        && !occupied.contains(&(x, y))
}
