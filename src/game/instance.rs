//! A single dungeon session.
//!
//! All mutable state lives behind one async mutex. The lock is never held
//! across a WebSocket send: every operation queues outgoing messages while
//! mutating, then delivers them after the guard is released. The tick loop
//! drives monster movement, monster combat turns, and turn timeouts.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::GameSettings;
use crate::domain::tiles::tile_types_payload;
use crate::domain::{dice, now_secs, Fight, Monster, Player, Room, Tile};
use crate::dungeon::generator::generate_dungeon;
use crate::dungeon::pathfinding::{direction_to_target, is_in_corridor};
use crate::events::{AiSnapshot, EventBus, EventData, GameEvent};
use crate::intelligence::{AiAction, WorldState};
use crate::services::player_stats::xp_for_cr;
use crate::services::{MonsterService, Storage};

const PLAYER_COLORS: [&str; 8] = [
    "#ff0", "#0ff", "#f0f", "#0f0", "#f80", "#08f", "#f08", "#8f0",
];

const GAMES_COLLECTION: &str = "games";

/// Shared collaborators a game is constructed with.
#[derive(Clone)]
pub struct GameDeps {
    pub storage: Arc<dyn Storage>,
    pub monsters: Arc<MonsterService>,
    pub events: EventBus,
    pub settings: GameSettings,
}

/// Outcome of a move request.
#[derive(Debug)]
pub struct MoveOutcome {
    pub success: bool,
    pub room_entered: Option<serde_json::Value>,
}

/// Outcome of an interact request.
#[derive(Debug)]
pub enum InteractOutcome {
    Nothing,
    AlreadyInFight,
    FightRequest {
        monster_id: String,
        monster: serde_json::Value,
    },
    CanJoinFight {
        fight_id: String,
        fight: serde_json::Value,
        monster: serde_json::Value,
    },
    DoorToggled {
        x: i32,
        y: i32,
        open: bool,
    },
}

/// Summary used by the registry for routing and cleanup decisions.
#[derive(Debug, Clone)]
pub struct GameStatus {
    pub game_id: String,
    pub name: String,
    pub player_count: usize,
    pub active_player_count: usize,
    pub is_completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

enum Recipient {
    One(String),
    Many(Vec<String>),
    AllExcept(String),
    All,
}

struct Outgoing {
    to: Recipient,
    text: String,
}

type Outbox = Vec<Outgoing>;

fn push_to(outbox: &mut Outbox, player_id: &str, payload: serde_json::Value) {
    outbox.push(Outgoing {
        to: Recipient::One(player_id.to_string()),
        text: payload.to_string(),
    });
}

fn push_to_many(outbox: &mut Outbox, player_ids: &[String], payload: serde_json::Value) {
    outbox.push(Outgoing {
        to: Recipient::Many(player_ids.to_vec()),
        text: payload.to_string(),
    });
}

enum MonsterTurn {
    /// The fight is still running after the monster acted.
    Continue,
    /// The fight ended during the monster's action (it fled).
    Ended,
}

struct GameState {
    name: String,
    width: i32,
    height: i32,
    tiles: Vec<Vec<Tile>>,
    rooms: Vec<Room>,
    spawn_x: i32,
    spawn_y: i32,
    map_seed: Option<u64>,
    players: HashMap<String, Player>,
    monsters: HashMap<String, Monster>,
    token_to_player: HashMap<String, String>,
    active_fights: HashMap<String, Fight>,
    connections: HashMap<String, mpsc::Sender<String>>,
    dirty: bool,
    last_activity: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize)]
struct SavedMap {
    width: i32,
    height: i32,
    tiles: Vec<Vec<Tile>>,
    spawn_x: i32,
    spawn_y: i32,
    #[serde(default)]
    seed: Option<u64>,
}

#[derive(Serialize, Deserialize)]
struct SavedGame {
    game_id: String,
    name: String,
    map: SavedMap,
    rooms: Vec<Room>,
    players: HashMap<String, Player>,
    monsters: HashMap<String, Monster>,
    #[serde(default)]
    token_to_player: HashMap<String, String>,
}

pub struct Game {
    pub game_id: String,
    pub created_at: DateTime<Utc>,
    deps: GameDeps,
    state: Mutex<GameState>,
    cancel: CancellationToken,
    tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    initialized: AtomicBool,
}

impl Game {
    pub fn new(game_id: String, name: String, deps: GameDeps) -> Arc<Self> {
        let settings = deps.settings.clone();
        Arc::new(Game {
            game_id,
            created_at: Utc::now(),
            deps,
            state: Mutex::new(GameState {
                name,
                width: settings.default_map_width,
                height: settings.default_map_height,
                tiles: Vec::new(),
                rooms: Vec::new(),
                spawn_x: 1,
                spawn_y: 1,
                map_seed: None,
                players: HashMap::new(),
                monsters: HashMap::new(),
                token_to_player: HashMap::new(),
                active_fights: HashMap::new(),
                connections: HashMap::new(),
                dirty: false,
                last_activity: Utc::now(),
                completed_at: None,
            }),
            cancel: CancellationToken::new(),
            tasks: std::sync::Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
        })
    }

    /// Generate or restore the dungeon and start the tick and autosave
    /// tasks. Idempotent. Returns false when a requested restore fails.
    pub async fn initialize(
        self: &Arc<Self>,
        load_save_id: Option<&str>,
        map_width: Option<i32>,
        map_height: Option<i32>,
        room_count: Option<usize>,
    ) -> bool {
        if self.initialized.load(Ordering::SeqCst) {
            return true;
        }

        if let Some(save_id) = load_save_id {
            if !self.load_game(save_id).await {
                return false;
            }
            let rooms = self.state.lock().await.rooms.len();
            tracing::info!(game_id = %self.game_id, rooms, "game restored from save");
        } else {
            self.generate_new_map(map_width, map_height, room_count).await;
            let st = self.state.lock().await;
            tracing::info!(game_id = %self.game_id, name = %st.name, rooms = st.rooms.len(), "game initialized");
        }

        self.start_tick_loop();
        self.start_periodic_save();
        self.initialized.store(true, Ordering::SeqCst);
        true
    }

    /// Cancel the background tasks, await them, and write a final save.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = {
            let mut tasks = match self.tasks.lock() {
                Ok(tasks) => tasks,
                Err(poisoned) => poisoned.into_inner(),
            };
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        self.force_save("game_stopped").await;
        tracing::info!(game_id = %self.game_id, "game stopped");
    }

    fn start_tick_loop(self: &Arc<Self>) {
        let game = Arc::clone(self);
        let cancel = self.cancel.clone();
        let period = Duration::from_secs_f64(self.deps.settings.tick_interval.max(0.05));
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            // A slow tick delays the next one by a full period; ticks are
            // never batched to catch up
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut tick: u64 = 0;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        tick += 1;
                        game.run_tick(tick).await;
                    }
                }
            }
        });
        self.push_task(handle);
    }

    fn start_periodic_save(self: &Arc<Self>) {
        let game = Arc::clone(self);
        let cancel = self.cancel.clone();
        let period = Duration::from_secs(self.deps.settings.autosave_interval.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if game.state.lock().await.dirty {
                            game.force_save("periodic").await;
                        }
                    }
                }
            }
        });
        self.push_task(handle);
    }

    fn push_task(&self, handle: tokio::task::JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(handle);
        }
    }

    /// One game-loop iteration: monster AI, monster combat turns, player
    /// turn timeouts, then a state broadcast if anything moved.
    async fn run_tick(&self, tick: u64) {
        let (outbox, state_changed) = {
            let mut st = self.state.lock().await;
            let mut outbox = Outbox::new();
            let moved = self.update_monsters(&mut st, tick, &mut outbox).await;
            self.process_monster_combat_turns(&mut st, tick, &mut outbox).await;
            self.process_turn_timeouts(&mut st, &mut outbox);

            // First observation of the cleared dungeon latches completion
            let was_completed = st.completed_at.is_some();
            if check_completed(&mut st) && !was_completed {
                self.deps.events.publish(GameEvent::new(EventData::GameCompleted {
                    game_id: self.game_id.clone(),
                    player_tokens: st.token_to_player.keys().cloned().collect(),
                }));
                tracing::info!(game_id = %self.game_id, "dungeon completed");
            }

            let state_changed = moved && !st.connections.is_empty();
            (outbox, state_changed)
        };
        self.deliver(outbox).await;
        if state_changed {
            self.broadcast_state().await;
        }
    }

    // ============== Persistence ==============

    async fn load_game(&self, save_id: &str) -> bool {
        let doc = match self.deps.storage.get(GAMES_COLLECTION, save_id).await {
            Ok(Some(doc)) => doc,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!(game_id = %self.game_id, error = %e, "game load failed");
                return false;
            }
        };
        let Some(game_state) = doc.get("game_state") else {
            return false;
        };
        let saved: SavedGame = match serde_json::from_value(game_state.clone()) {
            Ok(saved) => saved,
            Err(e) => {
                tracing::warn!(game_id = %self.game_id, error = %e, "corrupt game save");
                return false;
            }
        };

        let mut st = self.state.lock().await;
        st.name = saved.name;
        st.width = saved.map.width;
        st.height = saved.map.height;
        st.tiles = saved.map.tiles;
        st.spawn_x = saved.map.spawn_x;
        st.spawn_y = saved.map.spawn_y;
        st.map_seed = saved.map.seed;
        st.rooms = saved.rooms;
        st.players = saved.players;
        st.monsters = saved.monsters;
        st.token_to_player = saved.token_to_player;
        true
    }

    async fn generate_new_map(
        &self,
        width: Option<i32>,
        height: Option<i32>,
        room_count: Option<usize>,
    ) {
        let settings = &self.deps.settings;
        let generated = generate_dungeon(
            width.unwrap_or(settings.default_map_width),
            height.unwrap_or(settings.default_map_height),
            room_count.unwrap_or(settings.default_room_count),
            None,
        );

        {
            let mut st = self.state.lock().await;
            st.width = generated.width;
            st.height = generated.height;
            st.tiles = generated.tiles;
            st.spawn_x = generated.spawn_x;
            st.spawn_y = generated.spawn_y;
            st.map_seed = generated.seed;
            st.rooms = generated.rooms;
            st.players.clear();
            st.monsters.clear();
        }
        self.force_save("new_map").await;
    }

    fn save_doc(&self, st: &GameState) -> serde_json::Value {
        json!({
            "version": "2.0",
            "game_id": self.game_id,
            "saved_at": Utc::now().to_rfc3339(),
            "game_state": {
                "game_id": self.game_id,
                "name": st.name,
                "map": {
                    "width": st.width,
                    "height": st.height,
                    "tiles": st.tiles,
                    "spawn_x": st.spawn_x,
                    "spawn_y": st.spawn_y,
                    "seed": st.map_seed,
                },
                "rooms": st.rooms,
                "players": st.players,
                "monsters": st.monsters,
                "token_to_player": st.token_to_player,
            },
        })
    }

    /// Save now. A failed save leaves the dirty flag set so the periodic
    /// task retries.
    pub async fn force_save(&self, reason: &str) -> bool {
        let doc = {
            let st = self.state.lock().await;
            self.save_doc(&st)
        };
        match self.deps.storage.put(GAMES_COLLECTION, &self.game_id, &doc).await {
            Ok(()) => {
                self.state.lock().await.dirty = false;
                self.deps.events.publish(GameEvent::new(EventData::GameSaved {
                    game_id: self.game_id.clone(),
                    reason: reason.to_string(),
                }));
                true
            }
            Err(e) => {
                tracing::warn!(game_id = %self.game_id, reason, error = %e, "game save failed");
                false
            }
        }
    }

    // ============== Status ==============

    pub async fn status(&self) -> GameStatus {
        let mut st = self.state.lock().await;
        let is_completed = check_completed(&mut st);
        GameStatus {
            game_id: self.game_id.clone(),
            name: st.name.clone(),
            player_count: st.players.len(),
            active_player_count: st.connections.len(),
            is_completed,
            completed_at: st.completed_at,
            last_activity: st.last_activity,
            created_at: self.created_at,
        }
    }

    pub async fn is_player_in_fight(&self, player_id: &str) -> bool {
        fight_id_for_player(&*self.state.lock().await, player_id).is_some()
    }

    pub async fn fight_for_player(&self, player_id: &str) -> Option<String> {
        fight_id_for_player(&*self.state.lock().await, player_id)
    }

    /// Room info for the player's current room, for the welcome flow.
    pub async fn player_room_info(&self, player_id: &str) -> Option<serde_json::Value> {
        let st = self.state.lock().await;
        let player = st.players.get(player_id)?;
        let room_id = player.current_room_id.clone()?;
        st.rooms.iter().find(|r| r.id == room_id).map(|r| r.info())
    }

    // ============== Player management ==============

    /// Add or reconnect a player.
    ///
    /// Reconnection order: the token's mapped player if it still exists,
    /// then the caller-supplied id; otherwise a brand new player spawned
    /// near the spawn point.
    pub async fn add_player(
        &self,
        sender: mpsc::Sender<String>,
        player_token: &str,
        existing_player_id: Option<&str>,
    ) -> (String, bool) {
        let mut st = self.state.lock().await;
        st.last_activity = Utc::now();

        if let Some(pid) = st.token_to_player.get(player_token).cloned() {
            if st.players.contains_key(&pid) {
                st.connections.insert(pid.clone(), sender);
                tracing::info!(game_id = %self.game_id, player_id = %pid, "player reconnected via token");
                return (pid, true);
            }
        }

        if let Some(pid) = existing_player_id {
            if st.players.contains_key(pid) {
                st.connections.insert(pid.to_string(), sender);
                st.token_to_player
                    .insert(player_token.to_string(), pid.to_string());
                tracing::info!(game_id = %self.game_id, player_id = %pid, "player reconnected");
                return (pid.to_string(), true);
            }
        }

        let player_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let (x, y) = find_spawn_position(&st);
        let color = PLAYER_COLORS[st.players.len() % PLAYER_COLORS.len()].to_string();
        let initial_room = st.rooms.iter().find(|r| r.contains(x, y)).map(|r| r.id.clone());

        let player = Player::new(player_id.clone(), x, y, color, initial_room.clone());
        st.players.insert(player_id.clone(), player);
        st.connections.insert(player_id.clone(), sender);
        st.token_to_player
            .insert(player_token.to_string(), player_id.clone());
        mark_dirty(&mut st);

        self.deps.events.publish(GameEvent::from_source(
            &player_id,
            EventData::PlayerJoined {
                game_id: self.game_id.clone(),
                x,
                y,
            },
        ));
        tracing::info!(game_id = %self.game_id, player_id = %player_id, total = st.players.len(), "player joined");

        // First visit of the spawn room behaves like walking into it
        if let Some(room_id) = initial_room {
            let unvisited = st
                .rooms
                .iter()
                .find(|r| r.id == room_id)
                .map(|r| !r.visited)
                .unwrap_or(false);
            if unvisited {
                self.visit_room(&mut st, &room_id, &player_id, player_token).await;
            }
        }

        (player_id, false)
    }

    /// Mark a room visited, spawn its monsters, and emit the discovery
    /// event.
    async fn visit_room(&self, st: &mut GameState, room_id: &str, player_id: &str, token: &str) {
        let Some(room_index) = st.rooms.iter().position(|r| r.id == room_id) else {
            return;
        };
        st.rooms[room_index].visited = true;

        let mut occupied: HashSet<(i32, i32)> =
            st.players.values().map(|p| (p.x, p.y)).collect();
        occupied.extend(st.monsters.values().map(|m| (m.x, m.y)));

        let room = st.rooms[room_index].clone();
        let spawned = self
            .deps
            .monsters
            .spawn_monsters_in_room(&room, &st.tiles, &mut occupied, st.width, st.height)
            .await;
        for monster in spawned {
            st.monsters.insert(monster.id.clone(), monster);
        }
        mark_dirty(st);

        self.deps.events.publish(GameEvent::from_source(
            player_id,
            EventData::PlayerEnteredRoom {
                player_token: token.to_string(),
                room_id: room_id.to_string(),
                first_visit: true,
                game_id: self.game_id.clone(),
            },
        ));
    }

    /// Drop the connection; with `permanent` also drop the player and its
    /// token mapping. Fights are untouched here (the caller flees first).
    pub async fn remove_player(&self, player_id: &str, permanent: bool) {
        {
            let mut st = self.state.lock().await;
            st.connections.remove(player_id);
            if permanent {
                st.players.remove(player_id);
                st.token_to_player.retain(|_, pid| pid != player_id);
            }
            mark_dirty(&mut st);
        }
        self.deps.events.publish(GameEvent::from_source(
            player_id,
            EventData::PlayerLeft {
                game_id: self.game_id.clone(),
            },
        ));
        self.force_save("player_disconnected").await;
        tracing::info!(
            game_id = %self.game_id,
            player_id,
            permanent,
            "player {}", if permanent { "removed" } else { "disconnected" }
        );
    }

    pub async fn remove_player_by_token(&self, token: &str) {
        let player_id = {
            let st = self.state.lock().await;
            st.token_to_player.get(token).cloned()
        };
        if let Some(pid) = player_id {
            self.remove_player(&pid, true).await;
        }
    }

    /// Move a player one tile. The destination must be walkable and
    /// unoccupied; only cardinal steps are accepted.
    pub async fn move_player(&self, player_id: &str, dx: i32, dy: i32) -> MoveOutcome {
        let mut result = MoveOutcome {
            success: false,
            room_entered: None,
        };
        if dx.abs() + dy.abs() != 1 {
            return result;
        }

        let mut st = self.state.lock().await;
        let Some(player) = st.players.get(player_id) else {
            return result;
        };
        let (new_x, new_y) = (player.x + dx, player.y + dy);
        if !is_walkable(&st, new_x, new_y) || is_occupied(&st, new_x, new_y, Some(player_id)) {
            return result;
        }

        let old_room = st.players.get(player_id).and_then(|p| p.current_room_id.clone());
        if let Some(player) = st.players.get_mut(player_id) {
            player.x = new_x;
            player.y = new_y;
        }
        result.success = true;
        mark_dirty(&mut st);

        let new_room = st
            .rooms
            .iter()
            .find(|r| r.contains(new_x, new_y))
            .map(|r| (r.id.clone(), r.visited, r.info()));
        let new_room_id = new_room.as_ref().map(|(id, _, _)| id.clone());

        if new_room_id != old_room {
            if let Some(player) = st.players.get_mut(player_id) {
                player.current_room_id = new_room_id.clone();
            }
            if let Some((room_id, visited, info)) = new_room {
                let token = token_for_player(&st, player_id);
                if !visited {
                    if let Some(token) = &token {
                        self.visit_room(&mut st, &room_id, player_id, token).await;
                    }
                } else if let Some(token) = &token {
                    self.deps.events.publish(GameEvent::from_source(
                        player_id,
                        EventData::PlayerEnteredRoom {
                            player_token: token.clone(),
                            room_id: room_id.clone(),
                            first_visit: false,
                            game_id: self.game_id.clone(),
                        },
                    ));
                }
                result.room_entered = Some(info);
            }
        }

        result
    }

    /// Interact: fights take priority over doors; diagonal interaction is
    /// allowed even though diagonal movement is not. Door toggles only mark
    /// the game dirty; the autosave task persists them.
    pub async fn interact(&self, player_id: &str) -> InteractOutcome {
        let mut st = self.state.lock().await;
        let Some(player) = st.players.get(player_id) else {
            return InteractOutcome::Nothing;
        };
        let (px, py) = (player.x, player.y);

        if fight_id_for_player(&st, player_id).is_some() {
            return InteractOutcome::AlreadyInFight;
        }

        if let Some(monster_id) = adjacent_monster_id(&st, px, py) {
            let monster_payload = st.monsters[&monster_id].to_payload();
            if let Some(fight_id) = fight_id_for_monster(&st, &monster_id) {
                let fight_payload = st.active_fights[&fight_id].to_payload();
                return InteractOutcome::CanJoinFight {
                    fight_id,
                    fight: fight_payload,
                    monster: monster_payload,
                };
            }
            return InteractOutcome::FightRequest {
                monster_id,
                monster: monster_payload,
            };
        }

        for (dx, dy) in [(0, -1), (0, 1), (-1, 0), (1, 0), (-1, -1), (1, -1), (-1, 1), (1, 1)] {
            let (x, y) = (px + dx, py + dy);
            if x < 0 || x >= st.width || y < 0 || y >= st.height {
                continue;
            }
            let tile = st.tiles[y as usize][x as usize];
            let open = match tile {
                Tile::DoorClosed => true,
                Tile::DoorOpen => false,
                _ => continue,
            };
            st.tiles[y as usize][x as usize] = if open { Tile::DoorOpen } else { Tile::DoorClosed };
            mark_dirty(&mut st);
            self.deps.events.publish(GameEvent::from_source(
                player_id,
                EventData::DoorToggled {
                    game_id: self.game_id.clone(),
                    x,
                    y,
                    open,
                },
            ));
            return InteractOutcome::DoorToggled { x, y, open };
        }

        InteractOutcome::Nothing
    }

    // ============== Fights ==============

    /// Start a player-initiated fight with an adjacent monster and notify
    /// the participants.
    pub async fn start_fight(&self, player_id: &str, monster_id: &str) -> Result<(), &'static str> {
        let outbox = {
            let mut st = self.state.lock().await;
            if !st.players.contains_key(player_id) || !st.monsters.contains_key(monster_id) {
                return Err("Not found");
            }
            if fight_id_for_player(&st, player_id).is_some()
                || fight_id_for_monster(&st, monster_id).is_some()
            {
                return Err("Already in fight");
            }

            let fight = Fight::create(monster_id, player_id, self.deps.settings.turn_duration);
            let fight_id = fight.id.clone();
            st.active_fights.insert(fight_id.clone(), fight);
            st.last_activity = Utc::now();

            let mut outbox = Outbox::new();
            let fight = &st.active_fights[&fight_id];
            let payload = json!({
                "type": "fight_started",
                "fight": fight.to_payload(),
                "monster": st.monsters[monster_id].to_payload(),
            });
            push_to_many(&mut outbox, &fight.player_ids.clone(), payload);
            outbox
        };
        self.deliver(outbox).await;
        Ok(())
    }

    /// Join an existing fight. The joiner must be 8-adjacent to the monster.
    pub async fn join_fight(&self, player_id: &str, fight_id: &str) -> Result<(), &'static str> {
        let outbox = {
            let mut st = self.state.lock().await;
            if !st.players.contains_key(player_id) || !st.active_fights.contains_key(fight_id) {
                return Err("Not found");
            }
            if fight_id_for_player(&st, player_id).is_some() {
                return Err("Already in fight");
            }
            let monster_id = st.active_fights[fight_id].monster_id.clone();
            let Some(monster) = st.monsters.get(&monster_id) else {
                return Err("Monster not found");
            };
            let player = &st.players[player_id];
            if (player.x - monster.x).abs() > 1 || (player.y - monster.y).abs() > 1 {
                return Err("Not adjacent");
            }

            if let Some(fight) = st.active_fights.get_mut(fight_id) {
                fight.add_player(player_id);
            }
            st.last_activity = Utc::now();

            let mut outbox = Outbox::new();
            let fight = &st.active_fights[fight_id];
            let monster_payload = st.monsters[&monster_id].to_payload();
            push_to(
                &mut outbox,
                player_id,
                json!({
                    "type": "fight_started",
                    "fight": fight.to_payload(),
                    "monster": monster_payload,
                }),
            );
            queue_fight_updated(&mut outbox, &st, fight_id);
            outbox
        };
        self.deliver(outbox).await;
        Ok(())
    }

    /// Remove a fleeing player from a fight and notify the remaining
    /// participants. Grants fight immunity to the fleeing player.
    pub async fn flee_fight(&self, player_id: &str, fight_id: &str) -> Result<(), &'static str> {
        let outbox = {
            let mut st = self.state.lock().await;
            if !st.active_fights.contains_key(fight_id) {
                return Err("Fight not found");
            }
            if !st.active_fights[fight_id].player_ids.iter().any(|p| p == player_id) {
                return Err("Not in fight");
            }

            let mut outbox = Outbox::new();
            let ended = match st.active_fights.get_mut(fight_id) {
                Some(fight) => {
                    fight.remove_player(player_id);
                    !fight.is_active()
                }
                None => return Err("Fight not found"),
            };

            if let Some(player) = st.players.get_mut(player_id) {
                player.grant_fight_immunity();
            }
            st.last_activity = Utc::now();

            if ended {
                let fight = st.active_fights.remove(fight_id);
                let remaining = fight.map(|f| f.player_ids).unwrap_or_default();
                push_to_many(
                    &mut outbox,
                    &remaining,
                    json!({"type": "fight_ended", "fight_id": fight_id, "result": "fled"}),
                );
            } else {
                let remaining = st.active_fights[fight_id].player_ids.clone();
                push_to_many(
                    &mut outbox,
                    &remaining,
                    json!({
                        "type": "player_fled",
                        "fight_id": fight_id,
                        "fled_player_id": player_id,
                    }),
                );
                queue_fight_updated(&mut outbox, &st, fight_id);
            }
            outbox
        };
        self.deliver(outbox).await;
        Ok(())
    }

    /// Process a player combat action ("attack", "defend" or "item"),
    /// including the monster's reply turn. All fight notifications are
    /// queued while the lock is held and sent after release.
    pub async fn process_combat_action(
        &self,
        player_id: &str,
        fight_id: &str,
        action: &str,
    ) -> Result<(), &'static str> {
        let (outbox, state_changed) = {
            let mut st = self.state.lock().await;
            if !st.active_fights.contains_key(fight_id) {
                return Err("Fight not found");
            }
            {
                let fight = &st.active_fights[fight_id];
                if !fight.player_ids.iter().any(|p| p == player_id)
                    || fight.current_turn_id() != Some(player_id)
                {
                    return Err("Not your turn");
                }
            }
            if !st.players.contains_key(player_id) {
                return Err("Combatant not found");
            }
            let monster_id = st.active_fights[fight_id].monster_id.clone();
            if !st.monsters.contains_key(&monster_id) {
                return Err("Combatant not found");
            }

            if let Some(player) = st.players.get_mut(player_id) {
                player.is_defending = false;
            }

            match action {
                "attack" => self.process_player_attack(&mut st, player_id, &monster_id, fight_id),
                "defend" => {
                    if let Some(player) = st.players.get_mut(player_id) {
                        player.is_defending = true;
                    }
                    if let Some(fight) = st.active_fights.get_mut(fight_id) {
                        fight.add_log_entry(
                            "defend",
                            "You take a defensive stance!",
                            Some(player_id),
                        );
                    }
                }
                "item" => {
                    let roll = dice::roll_d20(0).rolls[0];
                    if let Some(player) = st.players.get_mut(player_id) {
                        let healed = player.heal(roll);
                        if healed > 0 {
                            if let Some(fight) = st.active_fights.get_mut(fight_id) {
                                fight.add_log_entry(
                                    "heal",
                                    &format!("A potion restores {healed} HP!"),
                                    Some(player_id),
                                );
                            }
                        }
                    }
                }
                _ => return Err("Unknown action"),
            }

            let mut outbox = Outbox::new();
            st.last_activity = Utc::now();

            // Monster killed by the action
            let monster_dead = st
                .monsters
                .get(&monster_id)
                .map(|m| !m.is_alive())
                .unwrap_or(false);
            if monster_dead {
                self.finish_victory(&mut st, fight_id, &monster_id, player_id, &mut outbox, false);
                (outbox, true)
            } else {
                if let Some(fight) = st.active_fights.get_mut(fight_id) {
                    fight.advance_turn();
                }

                let monster_turn = st
                    .active_fights
                    .get(fight_id)
                    .map(|f| f.is_monster_turn())
                    .unwrap_or(false);
                if monster_turn {
                    let turn = self
                        .process_monster_turn(&mut st, fight_id, player_id, now_secs() as u64, &mut outbox)
                        .await;
                    match turn {
                        MonsterTurn::Ended => (outbox, true),
                        MonsterTurn::Continue => {
                            let defeated =
                                self.reap_dead_players(&mut st, fight_id, &mut outbox).await;
                            if !defeated {
                                if let Some(fight) = st.active_fights.get_mut(fight_id) {
                                    fight.advance_turn();
                                }
                                queue_fight_updated(&mut outbox, &st, fight_id);
                            }
                            (outbox, defeated)
                        }
                    }
                } else {
                    queue_fight_updated(&mut outbox, &st, fight_id);
                    (outbox, false)
                }
            }
        };

        self.deliver(outbox).await;
        if state_changed {
            self.broadcast_state().await;
        }
        Ok(())
    }

    fn process_player_attack(
        &self,
        st: &mut GameState,
        player_id: &str,
        monster_id: &str,
        fight_id: &str,
    ) {
        let (str_mod, damage_dice) = {
            let player = &st.players[player_id];
            (player.str_mod(), player.damage_dice.clone())
        };
        let monster_ac = st.monsters[monster_id].stats.ac;

        let (_, hit, is_crit) = dice::roll_attack(str_mod, monster_ac);
        let mut actual = 0;
        if hit {
            let dmg = dice::roll_damage(&damage_dice, is_crit);
            if let Some(monster) = st.monsters.get_mut(monster_id) {
                actual = monster.take_damage(dmg.total);
            }
        }

        if let Some(fight) = st.active_fights.get_mut(fight_id) {
            if is_crit {
                fight.add_log_entry("critical", &format!("CRITICAL! {actual} damage!"), Some(player_id));
            } else if hit {
                fight.add_log_entry("hit", &format!("Hit for {actual} damage!"), Some(player_id));
            } else {
                fight.add_log_entry("miss", "Miss!", Some(player_id));
            }
        }

        if actual > 0 {
            if let Some(token) = token_for_player(st, player_id) {
                let snapshot = st.monsters.get(monster_id).and_then(build_ai_snapshot);
                self.deps.events.publish(
                    GameEvent::from_source(player_id, EventData::DamageDealt {
                        player_token: token,
                        damage: actual,
                        is_player_source: true,
                        is_critical: is_crit,
                        game_id: self.game_id.clone(),
                        ai_snapshot: snapshot,
                        reward: -(actual as f32),
                    })
                    .with_target(monster_id),
                );
            }
        }
    }

    /// Victory epilogue: award XP, grant immunity, emit the death penalty
    /// reward, delete the monster and the fight, and notify participants.
    /// `half_xp` marks a monster that fled rather than died.
    fn finish_victory(
        &self,
        st: &mut GameState,
        fight_id: &str,
        monster_id: &str,
        killer_id: &str,
        outbox: &mut Outbox,
        half_xp: bool,
    ) {
        let Some(monster) = st.monsters.get(monster_id) else {
            return;
        };
        let monster_type = monster.monster_type.clone();
        let challenge_rating = monster.stats.challenge_rating;
        let snapshot = build_ai_snapshot(monster);
        let xp_earned = if half_xp {
            xp_for_cr(challenge_rating) / 2
        } else {
            xp_for_cr(challenge_rating)
        };

        if let Some(fight) = st.active_fights.get_mut(fight_id) {
            fight.end_fight("victory");
            if half_xp {
                fight.add_log_entry("enemy_flee", "The enemy flees!", Some(monster_id));
            } else {
                fight.add_log_entry("victory", "The enemy is defeated!", None);
            }
        }

        // The death penalty only applies to an actual kill
        if !half_xp {
            if let Some(token) = token_for_player(st, killer_id) {
                self.deps.events.publish(GameEvent::from_source(
                    monster_id,
                    EventData::MonsterDied {
                        player_token: token,
                        monster_type: monster_type.clone(),
                        challenge_rating,
                        game_id: self.game_id.clone(),
                        fight_id: fight_id.to_string(),
                        ai_snapshot: snapshot,
                        reward: -100.0,
                    },
                ));
            }
        }

        let participant_ids = st
            .active_fights
            .get(fight_id)
            .map(|f| f.player_ids.clone())
            .unwrap_or_default();
        for pid in &participant_ids {
            if let Some(player) = st.players.get_mut(pid) {
                player.grant_fight_immunity();
            }
        }

        st.monsters.remove(monster_id);
        let fight_payload = st
            .active_fights
            .remove(fight_id)
            .map(|f| f.to_payload())
            .unwrap_or(serde_json::Value::Null);
        mark_dirty(st);

        push_to_many(
            outbox,
            &participant_ids,
            json!({
                "type": "fight_ended",
                "fight_id": fight_id,
                "result": "victory",
                "fight": fight_payload,
                "xp_earned": xp_earned,
                "monster_type": monster_type,
            }),
        );
    }

    /// Run the monster's combat turn against its target.
    async fn process_monster_turn(
        &self,
        st: &mut GameState,
        fight_id: &str,
        target_id: &str,
        current_tick: u64,
        outbox: &mut Outbox,
    ) -> MonsterTurn {
        let Some(fight) = st.active_fights.get(fight_id) else {
            return MonsterTurn::Ended;
        };
        let monster_id = fight.monster_id.clone();
        if !st.players.contains_key(target_id) {
            return MonsterTurn::Continue;
        }
        let Some(monster_ref) = st.monsters.get(&monster_id) else {
            return MonsterTurn::Continue;
        };

        let mut world = build_monster_world_state(st, monster_ref);
        world.distance_to_threat = 1;

        let Some(mut monster) = st.monsters.remove(&monster_id) else {
            return MonsterTurn::Continue;
        };
        let action = self
            .deps
            .monsters
            .decide_combat_action(&mut monster, current_tick, &world)
            .await;
        let monster_name = monster.name.clone();
        st.monsters.insert(monster_id.clone(), monster);

        match action {
            AiAction::Defend => {
                if let Some(fight) = st.active_fights.get_mut(fight_id) {
                    fight.add_log_entry(
                        "enemy_defend",
                        &format!("{monster_name} braces!"),
                        Some(&monster_id),
                    );
                }
                MonsterTurn::Continue
            }
            AiAction::Flee => {
                self.finish_victory(st, fight_id, &monster_id, target_id, outbox, true);
                MonsterTurn::Ended
            }
            AiAction::CallAllies => {
                if let Some(fight) = st.active_fights.get_mut(fight_id) {
                    fight.add_log_entry(
                        "enemy_call",
                        &format!("{monster_name} howls for help!"),
                        Some(&monster_id),
                    );
                }
                MonsterTurn::Continue
            }
            other => {
                self.monster_attack(st, fight_id, &monster_id, target_id, other);
                MonsterTurn::Continue
            }
        }
    }

    /// Resolve a monster attack with its per-action modifiers:
    /// aggressive +1 to hit and damage, defensive -1 to the target's AC,
    /// ambush rerolls a miss and adds +1 damage.
    fn monster_attack(
        &self,
        st: &mut GameState,
        fight_id: &str,
        monster_id: &str,
        target_id: &str,
        action: AiAction,
    ) {
        let aggressive = action == AiAction::AttackAggressive;
        let defensive = action == AiAction::AttackDefensive;
        let ambush = action == AiAction::Ambush;

        let (attack_bonus, damage_dice, monster_name) = {
            let Some(monster) = st.monsters.get(monster_id) else {
                return;
            };
            (
                monster.stats.str_mod() + if aggressive { 1 } else { 0 },
                monster.damage_dice(),
                monster.name.clone(),
            )
        };
        let target_ac = {
            let Some(player) = st.players.get(target_id) else {
                return;
            };
            player.effective_ac() - if defensive { 1 } else { 0 }
        };

        let (_, mut hit, mut is_crit) = dice::roll_attack(attack_bonus, target_ac);
        if ambush && !hit {
            // Advantage: one reroll on a miss
            let (_, rehit, recrit) = dice::roll_attack(attack_bonus, target_ac);
            hit = rehit;
            is_crit = recrit;
        }

        if hit {
            let extra = if aggressive || ambush { 1 } else { 0 };
            let dmg = dice::roll_damage(&damage_dice, is_crit);
            let actual = st
                .players
                .get_mut(target_id)
                .map(|p| p.take_damage((dmg.total + extra).max(1)))
                .unwrap_or(0);

            if let Some(fight) = st.active_fights.get_mut(fight_id) {
                let entry_type = if is_crit { "enemy_critical" } else { "enemy_hit" };
                fight.add_log_entry(
                    entry_type,
                    &format!("{monster_name} hits for {actual}!"),
                    Some(monster_id),
                );
            }

            if let Some(token) = token_for_player(st, target_id) {
                let snapshot = st.monsters.get(monster_id).and_then(build_ai_snapshot);
                let reward = actual as f32 * if is_crit { 2.0 } else { 1.0 };
                self.deps.events.publish(
                    GameEvent::from_source(monster_id, EventData::DamageDealt {
                        player_token: token,
                        damage: actual,
                        is_player_source: false,
                        is_critical: is_crit,
                        game_id: self.game_id.clone(),
                        ai_snapshot: snapshot,
                        reward,
                    })
                    .with_target(target_id),
                );
            }
        } else {
            if let Some(fight) = st.active_fights.get_mut(fight_id) {
                fight.add_log_entry(
                    "enemy_miss",
                    &format!("{monster_name} misses!"),
                    Some(monster_id),
                );
            }
            if let Some(token) = token_for_player(st, target_id) {
                let snapshot = st.monsters.get(monster_id).and_then(build_ai_snapshot);
                self.deps.events.publish(
                    GameEvent::from_source(monster_id, EventData::DamageDealt {
                        player_token: token,
                        damage: 0,
                        is_player_source: false,
                        is_critical: false,
                        game_id: self.game_id.clone(),
                        ai_snapshot: snapshot,
                        reward: -1.0,
                    })
                    .with_target(target_id),
                );
            }
        }
    }

    /// Remove dead players from the fight, respawning each with immunity.
    /// Returns true when the fight ended in defeat (no players left).
    async fn reap_dead_players(
        &self,
        st: &mut GameState,
        fight_id: &str,
        outbox: &mut Outbox,
    ) -> bool {
        let Some(fight) = st.active_fights.get(fight_id) else {
            return false;
        };
        let original_ids = fight.player_ids.clone();
        let dead: Vec<String> = fight
            .player_ids
            .iter()
            .filter(|pid| {
                st.players
                    .get(*pid)
                    .map(|p| !p.is_alive())
                    .unwrap_or(true)
            })
            .cloned()
            .collect();

        for pid in &dead {
            if let Some(fight) = st.active_fights.get_mut(fight_id) {
                fight.add_log_entry("death", "A hero has fallen!", Some(pid));
                fight.remove_player(pid);
            }
            self.respawn_player(st, pid, outbox);
            if let Some(player) = st.players.get_mut(pid) {
                player.grant_fight_immunity();
            }
        }

        let empty = st
            .active_fights
            .get(fight_id)
            .map(|f| f.player_ids.is_empty())
            .unwrap_or(true);
        if empty {
            if let Some(mut fight) = st.active_fights.remove(fight_id) {
                fight.end_fight("defeat");
                for pid in &original_ids {
                    if let Some(player) = st.players.get_mut(pid) {
                        player.grant_fight_immunity();
                    }
                }
                push_to_many(
                    outbox,
                    &original_ids,
                    json!({
                        "type": "fight_ended",
                        "fight_id": fight_id,
                        "result": "defeat",
                        "fight": fight.to_payload(),
                        "xp_earned": 0,
                        "monster_type": serde_json::Value::Null,
                    }),
                );
            }
            return true;
        }
        false
    }

    /// Respawn a defeated player at the spawn area with full HP.
    fn respawn_player(&self, st: &mut GameState, player_id: &str, outbox: &mut Outbox) {
        if !st.players.contains_key(player_id) {
            return;
        }
        if let Some(token) = token_for_player(st, player_id) {
            self.deps.events.publish(GameEvent::from_source(
                player_id,
                EventData::PlayerDied {
                    player_token: token,
                    game_id: self.game_id.clone(),
                },
            ));
        }

        let (x, y) = find_spawn_position(st);
        let room_id = st.rooms.iter().find(|r| r.contains(x, y)).map(|r| r.id.clone());
        if let Some(player) = st.players.get_mut(player_id) {
            player.respawn(x, y);
            player.current_room_id = room_id;
            let payload = json!({
                "type": "player_respawned",
                "player_id": player_id,
                "x": x,
                "y": y,
                "hp": player.hp,
                "max_hp": player.max_hp,
            });
            push_to(outbox, player_id, payload);
        }
        mark_dirty(st);
    }

    // ============== Tick processing ==============

    /// Monster AI pass: aggro checks first, then patrol and movement.
    /// Returns true when any monster moved.
    async fn update_monsters(&self, st: &mut GameState, tick: u64, outbox: &mut Outbox) -> bool {
        if st.monsters.is_empty() {
            return false;
        }

        self.check_monster_aggro(st, tick, outbox).await;

        let mut occupied: HashSet<(i32, i32)> =
            st.players.values().map(|p| (p.x, p.y)).collect();
        occupied.extend(st.monsters.values().map(|m| (m.x, m.y)));

        let mut any_moved = false;
        let monster_ids: Vec<String> = st.monsters.keys().cloned().collect();
        for monster_id in monster_ids {
            if fight_id_for_monster(st, &monster_id).is_some() {
                continue;
            }
            let Some(monster_ref) = st.monsters.get(&monster_id) else {
                continue;
            };
            // A monster whose room no longer resolves is skipped, not deleted
            let Some(room) = st.rooms.iter().find(|r| r.id == monster_ref.room_id) else {
                continue;
            };
            let room_bounds = room.bounds();
            let world = build_monster_world_state(st, monster_ref);

            let Some(mut monster) = st.monsters.remove(&monster_id) else {
                continue;
            };
            occupied.remove(&(monster.x, monster.y));
            let rooms = std::mem::take(&mut st.rooms);
            let moved = self
                .deps
                .monsters
                .update_monster(
                    &mut monster,
                    room_bounds,
                    &st.tiles,
                    &occupied,
                    tick,
                    &world,
                    &rooms,
                )
                .await;
            st.rooms = rooms;
            occupied.insert((monster.x, monster.y));
            st.monsters.insert(monster_id, monster);
            if moved {
                any_moved = true;
            }
        }

        if any_moved {
            mark_dirty(st);
        }
        any_moved
    }

    /// Let idle monsters decide whether to jump adjacent players. Immune or
    /// already-fighting players are never auto-engaged.
    async fn check_monster_aggro(&self, st: &mut GameState, tick: u64, outbox: &mut Outbox) {
        let monster_ids: Vec<String> = st.monsters.keys().cloned().collect();
        for monster_id in monster_ids {
            if fight_id_for_monster(st, &monster_id).is_some() {
                continue;
            }
            let Some(monster_ref) = st.monsters.get(&monster_id) else {
                continue;
            };
            let adjacent = adjacent_player_ids(st, monster_ref.x, monster_ref.y);
            if adjacent.is_empty() {
                continue;
            }

            let mut world = build_monster_world_state(st, monster_ref);
            world.distance_to_threat = 1;

            let Some(mut monster) = st.monsters.remove(&monster_id) else {
                continue;
            };
            let action = self
                .deps
                .monsters
                .decide_combat_action(&mut monster, tick, &world)
                .await;
            st.monsters.insert(monster_id.clone(), monster);

            if !action.is_aggressive() {
                continue;
            }

            for pid in adjacent {
                let eligible = st
                    .players
                    .get(&pid)
                    .map(|p| !p.has_fight_immunity())
                    .unwrap_or(false)
                    && fight_id_for_player(st, &pid).is_none();
                if eligible {
                    self.monster_initiate_combat(st, &monster_id, &pid, outbox);
                    break;
                }
            }
        }
    }

    /// Monster-initiated fight: the monster acts first and the turn timer
    /// restarts from its turn.
    fn monster_initiate_combat(
        &self,
        st: &mut GameState,
        monster_id: &str,
        player_id: &str,
        outbox: &mut Outbox,
    ) {
        if fight_id_for_player(st, player_id).is_some()
            || fight_id_for_monster(st, monster_id).is_some()
        {
            return;
        }
        let Some(monster) = st.monsters.get(monster_id) else {
            return;
        };
        let monster_name = monster.name.clone();
        let monster_payload = monster.to_payload();

        let mut fight = Fight::create(monster_id, player_id, self.deps.settings.turn_duration);
        if let Some(index) = fight.turn_order.iter().position(|t| t == monster_id) {
            fight.current_turn_index = index;
        }
        fight.reset_turn_timer();
        fight.add_log_entry("system", &format!("{monster_name} attacks!"), Some(monster_id));

        let fight_id = fight.id.clone();
        st.active_fights.insert(fight_id.clone(), fight);
        st.last_activity = Utc::now();

        let fight = &st.active_fights[&fight_id];
        push_to(
            outbox,
            player_id,
            json!({
                "type": "monster_attacks",
                "fight": fight.to_payload(),
                "monster": monster_payload,
                "players": fight_players_payload(st, fight),
            }),
        );
    }

    /// Run the monster turn for every active fight where it is the
    /// monster's move.
    async fn process_monster_combat_turns(
        &self,
        st: &mut GameState,
        tick: u64,
        outbox: &mut Outbox,
    ) {
        let fight_ids: Vec<String> = st.active_fights.keys().cloned().collect();
        for fight_id in fight_ids {
            let target_id = {
                let Some(fight) = st.active_fights.get(&fight_id) else {
                    continue;
                };
                if !fight.is_active() || !fight.is_monster_turn() {
                    continue;
                }
                if !st.monsters.contains_key(&fight.monster_id) {
                    continue;
                }
                let Some(target_id) = fight.player_ids.first().cloned() else {
                    continue;
                };
                if !st.players.contains_key(&target_id) {
                    continue;
                }
                target_id
            };

            match self
                .process_monster_turn(st, &fight_id, &target_id, tick, outbox)
                .await
            {
                MonsterTurn::Ended => continue,
                MonsterTurn::Continue => {}
            }

            let defeated = self.reap_dead_players(st, &fight_id, outbox).await;
            if !defeated {
                if let Some(fight) = st.active_fights.get_mut(&fight_id) {
                    fight.advance_turn();
                }
                queue_fight_updated(outbox, st, &fight_id);
            }
        }
    }

    /// Kill and respawn players whose combat turn timed out. Resolution is
    /// one tick interval.
    fn process_turn_timeouts(&self, st: &mut GameState, outbox: &mut Outbox) {
        let fight_ids: Vec<String> = st.active_fights.keys().cloned().collect();
        for fight_id in fight_ids {
            let timed_out_id = {
                let Some(fight) = st.active_fights.get(&fight_id) else {
                    continue;
                };
                if !fight.is_active() || fight.is_monster_turn() || fight.time_remaining() > 0.0 {
                    continue;
                }
                match fight.current_turn_id() {
                    Some(id) => id.to_string(),
                    None => continue,
                }
            };

            if !st.players.contains_key(&timed_out_id) {
                if let Some(fight) = st.active_fights.get_mut(&fight_id) {
                    fight.remove_player(&timed_out_id);
                }
                continue;
            }

            if let Some(player) = st.players.get_mut(&timed_out_id) {
                player.hp = 0;
            }
            let original_ids = st
                .active_fights
                .get(&fight_id)
                .map(|f| f.player_ids.clone())
                .unwrap_or_default();
            if let Some(fight) = st.active_fights.get_mut(&fight_id) {
                fight.add_log_entry("timeout", "Time's up!", Some(&timed_out_id));
                fight.remove_player(&timed_out_id);
            }
            self.respawn_player(st, &timed_out_id, outbox);
            if let Some(player) = st.players.get_mut(&timed_out_id) {
                player.grant_fight_immunity();
            }

            let empty = st
                .active_fights
                .get(&fight_id)
                .map(|f| f.player_ids.is_empty())
                .unwrap_or(true);
            if empty {
                if let Some(mut fight) = st.active_fights.remove(&fight_id) {
                    fight.end_fight("defeat");
                    for pid in &original_ids {
                        if let Some(player) = st.players.get_mut(pid) {
                            player.grant_fight_immunity();
                        }
                    }
                    push_to_many(
                        outbox,
                        &original_ids,
                        json!({
                            "type": "fight_ended",
                            "fight_id": fight_id,
                            "result": "defeat",
                            "fight": fight.to_payload(),
                            "xp_earned": 0,
                            "monster_type": serde_json::Value::Null,
                        }),
                    );
                }
            } else {
                queue_fight_updated(outbox, st, &fight_id);
            }
        }
    }

    // ============== State payloads ==============

    /// A viewport-cropped state centered on the player. Entity coordinates
    /// are rewritten to viewport space with the world position preserved.
    pub async fn get_viewport_state(&self, player_id: &str) -> serde_json::Value {
        let mut st = self.state.lock().await;
        let settings = &self.deps.settings;
        viewport_payload(
            &self.game_id,
            &mut st,
            player_id,
            settings.viewport_width,
            settings.viewport_height,
        )
    }

    // ============== Messaging ==============

    /// Deliver queued messages outside the state lock. Channels that have
    /// closed get their players disconnected.
    async fn deliver(&self, outbox: Outbox) {
        if outbox.is_empty() {
            return;
        }
        let mut resolved: Vec<(String, mpsc::Sender<String>, String)> = Vec::new();
        {
            let st = self.state.lock().await;
            for outgoing in outbox {
                match &outgoing.to {
                    Recipient::One(pid) => {
                        if let Some(tx) = st.connections.get(pid) {
                            resolved.push((pid.clone(), tx.clone(), outgoing.text.clone()));
                        }
                    }
                    Recipient::Many(pids) => {
                        for pid in pids {
                            if let Some(tx) = st.connections.get(pid) {
                                resolved.push((pid.clone(), tx.clone(), outgoing.text.clone()));
                            }
                        }
                    }
                    Recipient::AllExcept(excluded) => {
                        for (pid, tx) in &st.connections {
                            if pid != excluded {
                                resolved.push((pid.clone(), tx.clone(), outgoing.text.clone()));
                            }
                        }
                    }
                    Recipient::All => {
                        for (pid, tx) in &st.connections {
                            resolved.push((pid.clone(), tx.clone(), outgoing.text.clone()));
                        }
                    }
                }
            }
        }

        let mut disconnected: Vec<String> = Vec::new();
        for (pid, tx, text) in resolved {
            match tx.try_send(text) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Slow client: drop this message rather than stall the game
                    tracing::debug!(player_id = %pid, "send buffer full, message dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    if !disconnected.contains(&pid) {
                        disconnected.push(pid);
                    }
                }
            }
        }
        for pid in disconnected {
            self.remove_player(&pid, false).await;
        }
    }

    /// Send every connected player its viewport state.
    pub async fn broadcast_state(&self) {
        let mut outbox = Outbox::new();
        {
            let mut st = self.state.lock().await;
            let settings = &self.deps.settings;
            let player_ids: Vec<String> = st.connections.keys().cloned().collect();
            for pid in player_ids {
                let state = viewport_payload(
                    &self.game_id,
                    &mut st,
                    &pid,
                    settings.viewport_width,
                    settings.viewport_height,
                );
                push_to(&mut outbox, &pid, json!({"type": "state_update", "state": state}));
            }
        }
        self.deliver(outbox).await;
    }

    pub async fn send_welcome(&self, player_id: &str, is_reconnection: bool) {
        let mut outbox = Outbox::new();
        {
            let mut st = self.state.lock().await;
            if !st.connections.contains_key(player_id) {
                return;
            }
            let settings = &self.deps.settings;
            let state = viewport_payload(
                &self.game_id,
                &mut st,
                player_id,
                settings.viewport_width,
                settings.viewport_height,
            );
            let room_info = st
                .players
                .get(player_id)
                .and_then(|p| p.current_room_id.clone())
                .and_then(|room_id| st.rooms.iter().find(|r| r.id == room_id))
                .map(|r| r.info());
            push_to(
                &mut outbox,
                player_id,
                json!({
                    "type": "welcome",
                    "playerId": player_id,
                    "state": state,
                    "currentRoom": room_info,
                    "isReconnection": is_reconnection,
                }),
            );
        }
        self.deliver(outbox).await;
    }

    pub async fn send_room_entered(&self, player_id: &str, room_info: serde_json::Value) {
        let mut outbox = Outbox::new();
        push_to(&mut outbox, player_id, json!({"type": "room_entered", "room": room_info}));
        self.deliver(outbox).await;
    }

    pub async fn broadcast_player_joined(&self, player_id: &str) {
        let outbox = vec![Outgoing {
            to: Recipient::AllExcept(player_id.to_string()),
            text: json!({"type": "player_joined", "playerId": player_id}).to_string(),
        }];
        self.deliver(outbox).await;
    }

    pub async fn broadcast_player_left(&self, player_id: &str) {
        let outbox = vec![Outgoing {
            to: Recipient::All,
            text: json!({"type": "player_left", "playerId": player_id}).to_string(),
        }];
        self.deliver(outbox).await;
    }
}

// ============== State helpers ==============

fn mark_dirty(st: &mut GameState) {
    st.dirty = true;
    st.last_activity = Utc::now();
}

/// Completed = every room visited and no monsters remain. The first
/// observation latches the completion time.
fn check_completed(st: &mut GameState) -> bool {
    if st.completed_at.is_some() {
        return true;
    }
    let all_visited = st.rooms.iter().all(|r| r.visited);
    if all_visited && st.monsters.is_empty() && !st.rooms.is_empty() {
        st.completed_at = Some(Utc::now());
        return true;
    }
    false
}

fn is_walkable(st: &GameState, x: i32, y: i32) -> bool {
    if x < 0 || x >= st.width || y < 0 || y >= st.height {
        return false;
    }
    st.tiles[y as usize][x as usize].is_walkable()
}

fn is_occupied(st: &GameState, x: i32, y: i32, exclude_player: Option<&str>) -> bool {
    let player_there = st
        .players
        .iter()
        .any(|(pid, p)| Some(pid.as_str()) != exclude_player && p.x == x && p.y == y);
    player_there || st.monsters.values().any(|m| m.x == x && m.y == y)
}

/// Spawn search: the spawn tile itself, then a 7x7 box around it, then the
/// first free floor tile in any room.
fn find_spawn_position(st: &GameState) -> (i32, i32) {
    let occupied: HashSet<(i32, i32)> = st.players.values().map(|p| (p.x, p.y)).collect();

    if !occupied.contains(&(st.spawn_x, st.spawn_y))
        && st.tiles[st.spawn_y as usize][st.spawn_x as usize] == Tile::Floor
    {
        return (st.spawn_x, st.spawn_y);
    }

    for dy in -3..=3 {
        for dx in -3..=3 {
            let (x, y) = (st.spawn_x + dx, st.spawn_y + dy);
            if x >= 0
                && x < st.width
                && y >= 0
                && y < st.height
                && st.tiles[y as usize][x as usize] == Tile::Floor
                && !occupied.contains(&(x, y))
            {
                return (x, y);
            }
        }
    }

    for room in &st.rooms {
        for y in room.y..room.y + room.height {
            for x in room.x..room.x + room.width {
                if st.tiles[y as usize][x as usize] == Tile::Floor && !occupied.contains(&(x, y)) {
                    return (x, y);
                }
            }
        }
    }

    (st.spawn_x, st.spawn_y)
}

const ADJACENT_8: [(i32, i32); 8] = [
    (0, -1),
    (0, 1),
    (-1, 0),
    (1, 0),
    (-1, -1),
    (1, -1),
    (-1, 1),
    (1, 1),
];

fn adjacent_monster_id(st: &GameState, px: i32, py: i32) -> Option<String> {
    for (dx, dy) in ADJACENT_8 {
        for (mid, m) in &st.monsters {
            if m.x == px + dx && m.y == py + dy {
                return Some(mid.clone());
            }
        }
    }
    None
}

fn adjacent_player_ids(st: &GameState, mx: i32, my: i32) -> Vec<String> {
    let mut result = Vec::new();
    for (dx, dy) in ADJACENT_8 {
        for (pid, p) in &st.players {
            if p.x == mx + dx && p.y == my + dy {
                result.push(pid.clone());
            }
        }
    }
    result
}

fn fight_id_for_player(st: &GameState, player_id: &str) -> Option<String> {
    st.active_fights
        .values()
        .find(|f| f.is_active() && f.player_ids.iter().any(|p| p == player_id))
        .map(|f| f.id.clone())
}

fn fight_id_for_monster(st: &GameState, monster_id: &str) -> Option<String> {
    st.active_fights
        .values()
        .find(|f| f.is_active() && f.monster_id == monster_id)
        .map(|f| f.id.clone())
}

fn token_for_player(st: &GameState, player_id: &str) -> Option<String> {
    st.token_to_player
        .iter()
        .find(|(_, pid)| pid.as_str() == player_id)
        .map(|(token, _)| token.clone())
}

/// The state-action snapshot for reward attribution, captured from the
/// monster's last recorded decision.
fn build_ai_snapshot(monster: &Monster) -> Option<AiSnapshot> {
    let intel = &monster.intelligence_state;
    Some(AiSnapshot {
        monster_type: monster.monster_type.clone(),
        state_index: intel.last_state_index?,
        action: intel.last_action?,
        world_state: intel.last_world_state.clone(),
        hp_ratio: monster.hp_ratio(),
    })
}

/// What the monster can observe this tick: enemies within 6 tiles, allies
/// in the same room, the nearest threat's distance and direction, and
/// whether it stands in a corridor.
fn build_monster_world_state(st: &GameState, monster: &Monster) -> WorldState {
    let room = st.rooms.iter().find(|r| r.id == monster.room_id);

    let mut nearby: Vec<(i32, (i32, i32))> = st
        .players
        .values()
        .filter_map(|p| {
            let dist = (p.x - monster.x).abs() + (p.y - monster.y).abs();
            (dist <= 6).then_some((dist, (p.x, p.y)))
        })
        .collect();
    nearby.sort_by_key(|(dist, _)| *dist);
    let nearest = nearby.first().copied();

    let nearby_allies = st
        .monsters
        .values()
        .filter(|m| m.id != monster.id && m.room_id == monster.room_id)
        .count() as u32;

    WorldState {
        room_type: room
            .map(|r| r.room_type.clone())
            .unwrap_or_else(|| "chamber".to_string()),
        nearby_enemies: nearby.len() as u32,
        nearby_allies,
        distance_to_threat: nearest.map(|(d, _)| d).unwrap_or(8),
        threat_direction: nearest
            .map(|(_, (tx, ty))| direction_to_target(monster.x, monster.y, tx, ty))
            .unwrap_or(crate::dungeon::pathfinding::Direction::None),
        in_corridor: is_in_corridor(monster.x, monster.y, &st.tiles, &st.rooms),
        threat_position: nearest.map(|(_, pos)| pos),
    }
}

fn fight_players_payload(st: &GameState, fight: &Fight) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for pid in &fight.player_ids {
        if let Some(player) = st.players.get(pid) {
            map.insert(pid.clone(), player.to_payload());
        }
    }
    serde_json::Value::Object(map)
}

/// Queue a fight_updated message, including the fight participants' current
/// stats, to everyone in the fight.
fn queue_fight_updated(outbox: &mut Outbox, st: &GameState, fight_id: &str) {
    let Some(fight) = st.active_fights.get(fight_id) else {
        return;
    };
    let monster_payload = st
        .monsters
        .get(&fight.monster_id)
        .map(|m| m.to_payload())
        .unwrap_or(serde_json::Value::Null);
    let payload = json!({
        "type": "fight_updated",
        "fight": fight.to_payload(),
        "monster": monster_payload,
        "players": fight_players_payload(st, fight),
    });
    push_to_many(outbox, &fight.player_ids.clone(), payload);
}

fn full_state_payload(game_id: &str, st: &mut GameState) -> serde_json::Value {
    let is_completed = check_completed(st);
    json!({
        "game_id": game_id,
        "game_name": st.name,
        "width": st.width,
        "height": st.height,
        "tiles": st.tiles,
        "players": st.players.iter().map(|(pid, p)| (pid.clone(), p.to_payload())).collect::<serde_json::Map<_, _>>(),
        "monsters": st.monsters.iter().map(|(mid, m)| (mid.clone(), m.to_payload())).collect::<serde_json::Map<_, _>>(),
        "rooms": st.rooms,
        "tileTypes": tile_types_payload(),
        "is_completed": is_completed,
    })
}

fn viewport_payload(
    game_id: &str,
    st: &mut GameState,
    player_id: &str,
    viewport_width: i32,
    viewport_height: i32,
) -> serde_json::Value {
    let Some(player) = st.players.get(player_id) else {
        return full_state_payload(game_id, st);
    };
    let (px, py) = (player.x, player.y);

    let half_w = viewport_width / 2;
    let half_h = viewport_height / 2;
    let cam_x = (px - half_w).min(st.width - viewport_width).max(0);
    let cam_y = (py - half_h).min(st.height - viewport_height).max(0);
    let actual_w = viewport_width.min(st.width - cam_x);
    let actual_h = viewport_height.min(st.height - cam_y);

    let mut visible_tiles = Vec::with_capacity(actual_h as usize);
    for y in cam_y..cam_y + actual_h {
        let mut row = Vec::with_capacity(actual_w as usize);
        for x in cam_x..cam_x + actual_w {
            // Out-of-bounds reads as wall so the client never renders void
            let tile = if x >= 0 && x < st.width && y >= 0 && y < st.height {
                st.tiles[y as usize][x as usize]
            } else {
                Tile::Wall
            };
            row.push(tile);
        }
        visible_tiles.push(row);
    }

    let mut viewport_players = serde_json::Map::new();
    for (pid, p) in &st.players {
        let (rx, ry) = (p.x - cam_x, p.y - cam_y);
        if rx >= 0 && rx < actual_w && ry >= 0 && ry < actual_h {
            let mut payload = p.to_payload();
            if let Some(map) = payload.as_object_mut() {
                map.insert("x".into(), json!(rx));
                map.insert("y".into(), json!(ry));
                map.insert("world_x".into(), json!(p.x));
                map.insert("world_y".into(), json!(p.y));
            }
            viewport_players.insert(pid.clone(), payload);
        }
    }

    let mut viewport_monsters = serde_json::Map::new();
    for (mid, m) in &st.monsters {
        let (rx, ry) = (m.x - cam_x, m.y - cam_y);
        if rx >= 0 && rx < actual_w && ry >= 0 && ry < actual_h {
            let mut payload = m.to_payload();
            if let Some(map) = payload.as_object_mut() {
                map.insert("x".into(), json!(rx));
                map.insert("y".into(), json!(ry));
                map.insert("world_x".into(), json!(m.x));
                map.insert("world_y".into(), json!(m.y));
            }
            viewport_monsters.insert(mid.clone(), payload);
        }
    }

    let is_completed = check_completed(st);
    json!({
        "game_id": game_id,
        "game_name": st.name,
        "width": actual_w,
        "height": actual_h,
        "viewport_x": cam_x,
        "viewport_y": cam_y,
        "map_width": st.width,
        "map_height": st.height,
        "tiles": visible_tiles,
        "players": viewport_players,
        "monsters": viewport_monsters,
        "rooms": st.rooms,
        "tileTypes": tile_types_payload(),
        "is_completed": is_completed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AiSettings;
    use crate::services::FileStorage;

    async fn make_game(dir: &tempfile::TempDir) -> Arc<Game> {
        let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(dir.path().to_path_buf()));
        let events = EventBus::default();
        let monsters = Arc::new(
            MonsterService::new(storage.clone(), events.clone(), AiSettings::default()).await,
        );
        let mut settings = GameSettings::default();
        settings.default_map_width = 120;
        settings.default_map_height = 80;
        settings.default_room_count = 10;
        let deps = GameDeps {
            storage,
            monsters,
            events,
            settings,
        };
        let game = Game::new("g_test".into(), "Test Dungeon".into(), deps);
        assert!(game.initialize(None, None, None, None).await);
        game
    }

    fn channel() -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
        mpsc::channel(64)
    }

    async fn recv_messages(rx: &mut mpsc::Receiver<String>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_add_player_spawns_on_walkable_tile() {
        let dir = tempfile::tempdir().unwrap();
        let game = make_game(&dir).await;
        let (tx, _rx) = channel();
        let (pid, reconnected) = game.add_player(tx, "token-1", None).await;
        assert!(!reconnected);

        let st = game.state.lock().await;
        let player = &st.players[&pid];
        assert!(st.tiles[player.y as usize][player.x as usize].is_walkable());
        assert_eq!(st.token_to_player["token-1"], pid);
        drop(st);
        game.stop().await;
    }

    #[tokio::test]
    async fn test_reconnect_by_token_keeps_position() {
        let dir = tempfile::tempdir().unwrap();
        let game = make_game(&dir).await;
        let (tx, _rx) = channel();
        let (pid, _) = game.add_player(tx, "token-1", None).await;

        let pos = {
            let st = game.state.lock().await;
            st.players[&pid].position()
        };

        // Disconnect, then reconnect with the same token
        game.remove_player(&pid, false).await;
        let (tx2, _rx2) = channel();
        let (pid2, reconnected) = game.add_player(tx2, "token-1", None).await;
        assert!(reconnected);
        assert_eq!(pid2, pid);
        let st = game.state.lock().await;
        assert_eq!(st.players[&pid].position(), pos);
        drop(st);
        game.stop().await;
    }

    #[tokio::test]
    async fn test_reconnect_by_player_id_binds_new_token() {
        let dir = tempfile::tempdir().unwrap();
        let game = make_game(&dir).await;
        let (tx, _rx) = channel();
        let (pid, _) = game.add_player(tx, "token-1", None).await;
        game.remove_player(&pid, false).await;

        let (tx2, _rx2) = channel();
        let (pid2, reconnected) = game.add_player(tx2, "token-2", Some(&pid)).await;
        assert!(reconnected);
        assert_eq!(pid2, pid);
        let st = game.state.lock().await;
        assert_eq!(st.token_to_player["token-2"], pid);
        drop(st);
        game.stop().await;
    }

    #[tokio::test]
    async fn test_move_rejects_diagonals_and_walls() {
        let dir = tempfile::tempdir().unwrap();
        let game = make_game(&dir).await;
        let (tx, _rx) = channel();
        let (pid, _) = game.add_player(tx, "token-1", None).await;

        assert!(!game.move_player(&pid, 1, 1).await.success);
        assert!(!game.move_player(&pid, 0, 0).await.success);
        assert!(!game.move_player(&pid, 2, 0).await.success);

        // At least one cardinal direction from spawn is walkable
        let mut moved = false;
        for (dx, dy) in [(1, 0), (-1, 0), (0, 1), (0, -1)] {
            if game.move_player(&pid, dx, dy).await.success {
                moved = true;
                break;
            }
        }
        assert!(moved);
        game.stop().await;
    }

    #[tokio::test]
    async fn test_interact_toggles_door_and_marks_dirty_only() {
        let dir = tempfile::tempdir().unwrap();
        let game = make_game(&dir).await;
        let (tx, _rx) = channel();
        let (pid, _) = game.add_player(tx, "token-1", None).await;

        // Plant a closed door next to the player
        let (dx, dy) = {
            let mut st = game.state.lock().await;
            let p = &st.players[&pid];
            let (x, y) = (p.x + 1, p.y);
            st.tiles[y as usize][x as usize] = Tile::DoorClosed;
            st.dirty = false;
            (x, y)
        };

        match game.interact(&pid).await {
            InteractOutcome::DoorToggled { x, y, open } => {
                assert_eq!((x, y), (dx, dy));
                assert!(open);
            }
            other => panic!("expected door toggle, got {other:?}"),
        }
        let st = game.state.lock().await;
        assert_eq!(st.tiles[dy as usize][dx as usize], Tile::DoorOpen);
        assert!(st.dirty, "door toggle marks the game dirty");
        drop(st);
        game.stop().await;
    }

    /// Place a goblin next to the player and start a fight with it.
    async fn setup_fight(game: &Arc<Game>, pid: &str) -> (String, String) {
        let monster_id = {
            let mut st = game.state.lock().await;
            let (px, py) = st.players[pid].position();
            let def = crate::services::bestiary::species("goblin").unwrap();
            let monster = Monster {
                id: "m_test".into(),
                monster_type: "goblin".into(),
                name: def.name.into(),
                x: px + 1,
                y: py,
                room_id: st.rooms[0].id.clone(),
                symbol: def.symbol.into(),
                color: def.color.into(),
                stats: def.stats(),
                behavior: def.behavior,
                description: String::new(),
                patrol_target: None,
                last_move_tick: 0,
                target_player_id: None,
                last_seen_player_pos: None,
                intelligence_state: Default::default(),
            };
            st.monsters.insert(monster.id.clone(), monster);
            "m_test".to_string()
        };
        game.start_fight(pid, &monster_id).await.unwrap();
        let fight_id = game.fight_for_player(pid).await.unwrap();
        (monster_id, fight_id)
    }

    #[tokio::test]
    async fn test_interact_adjacent_monster_requests_fight() {
        let dir = tempfile::tempdir().unwrap();
        let game = make_game(&dir).await;
        let (tx, _rx) = channel();
        let (pid, _) = game.add_player(tx, "token-1", None).await;

        {
            let mut st = game.state.lock().await;
            let (px, py) = st.players[&pid].position();
            let def = crate::services::bestiary::species("goblin").unwrap();
            let monster = Monster {
                id: "m_adj".into(),
                monster_type: "goblin".into(),
                name: def.name.into(),
                x: px + 1,
                y: py + 1, // diagonal: interaction is allowed diagonally
                room_id: st.rooms[0].id.clone(),
                symbol: def.symbol.into(),
                color: def.color.into(),
                stats: def.stats(),
                behavior: def.behavior,
                description: String::new(),
                patrol_target: None,
                last_move_tick: 0,
                target_player_id: None,
                last_seen_player_pos: None,
                intelligence_state: Default::default(),
            };
            st.monsters.insert(monster.id.clone(), monster);
        }

        match game.interact(&pid).await {
            InteractOutcome::FightRequest { monster_id, .. } => assert_eq!(monster_id, "m_adj"),
            other => panic!("expected fight request, got {other:?}"),
        }
        game.stop().await;
    }

    #[tokio::test]
    async fn test_fight_lifecycle_to_victory() {
        let dir = tempfile::tempdir().unwrap();
        let game = make_game(&dir).await;
        let (tx, mut rx) = channel();
        let (pid, _) = game.add_player(tx, "token-1", None).await;
        let (monster_id, fight_id) = setup_fight(&game, &pid).await;

        // Hammer attack until the goblin (10 HP) dies; drain the channel
        // every round so the buffer never fills mid-fight.
        let mut messages = Vec::new();
        let mut ended = false;
        for _ in 0..200 {
            match game.process_combat_action(&pid, &fight_id, "attack").await {
                Ok(()) => {}
                Err("Fight not found") => {
                    ended = true;
                }
                Err(_) => {}
            }
            messages.extend(recv_messages(&mut rx).await);
            let st = game.state.lock().await;
            if !st.active_fights.contains_key(&fight_id) {
                ended = true;
            }
            drop(st);
            if ended {
                break;
            }
        }
        assert!(ended, "fight never ended");
        messages.extend(recv_messages(&mut rx).await);

        let st = game.state.lock().await;
        let monster_gone = !st.monsters.contains_key(&monster_id);
        let player_respawned_or_alive = st.players[&pid].hp > 0;
        drop(st);
        assert!(player_respawned_or_alive);

        let fight_ended = messages
            .iter()
            .find(|m| m["type"] == "fight_ended")
            .expect("fight_ended message");
        if fight_ended["result"] == "victory" {
            assert!(monster_gone);
            assert_eq!(fight_ended["monster_type"], "goblin");
            assert_eq!(fight_ended["xp_earned"], 50);
            let st = game.state.lock().await;
            assert!(st.players[&pid].has_fight_immunity());
        }
        game.stop().await;
    }

    #[tokio::test]
    async fn test_flee_from_two_player_fight_keeps_it_active() {
        let dir = tempfile::tempdir().unwrap();
        let game = make_game(&dir).await;
        let (tx_a, _rx_a) = channel();
        let (pid_a, _) = game.add_player(tx_a, "token-a", None).await;
        let (monster_id, fight_id) = setup_fight(&game, &pid_a).await;

        // Second player joins, adjacent to the monster
        let (tx_b, mut rx_b) = channel();
        let (pid_b, _) = game.add_player(tx_b, "token-b", None).await;
        {
            let mut st = game.state.lock().await;
            let (mx, my) = {
                let m = &st.monsters[&monster_id];
                (m.x, m.y)
            };
            if let Some(p) = st.players.get_mut(&pid_b) {
                p.x = mx;
                p.y = my + 1;
            }
        }
        game.join_fight(&pid_b, &fight_id).await.unwrap();

        game.flee_fight(&pid_a, &fight_id).await.unwrap();

        let st = game.state.lock().await;
        let fight = &st.active_fights[&fight_id];
        assert!(fight.is_active());
        assert_eq!(fight.player_ids, vec![pid_b.clone()]);
        assert!(st.players[&pid_a].has_fight_immunity());
        drop(st);

        let messages = recv_messages(&mut rx_b).await;
        assert!(
            messages
                .iter()
                .any(|m| m["type"] == "player_fled" && m["fled_player_id"] == pid_a.as_str()),
            "player B should learn that A fled: {messages:?}"
        );
        assert!(messages.iter().any(|m| m["type"] == "fight_updated"));
        game.stop().await;
    }

    #[tokio::test]
    async fn test_turn_timeout_defeats_player() {
        let dir = tempfile::tempdir().unwrap();
        let game = make_game(&dir).await;
        let (tx, mut rx) = channel();
        let (pid, _) = game.add_player(tx, "token-1", None).await;
        let (_, fight_id) = setup_fight(&game, &pid).await;

        // Expire the turn timer
        {
            let mut st = game.state.lock().await;
            if let Some(fight) = st.active_fights.get_mut(&fight_id) {
                fight.turn_end_time = now_secs() - 1.0;
            }
        }

        let mut outbox = Outbox::new();
        {
            let mut st = game.state.lock().await;
            game.process_turn_timeouts(&mut st, &mut outbox);
        }
        game.deliver(outbox).await;

        let st = game.state.lock().await;
        assert!(!st.active_fights.contains_key(&fight_id));
        let player = &st.players[&pid];
        assert_eq!(player.hp, player.max_hp, "respawned at full HP");
        assert!(player.has_fight_immunity());
        drop(st);

        let messages = recv_messages(&mut rx).await;
        assert!(messages
            .iter()
            .any(|m| m["type"] == "fight_ended" && m["result"] == "defeat"));
        assert!(messages.iter().any(|m| m["type"] == "player_respawned"));
        game.stop().await;
    }

    #[tokio::test]
    async fn test_room_discovery_spawns_monsters_away_from_doors() {
        let dir = tempfile::tempdir().unwrap();
        let game = make_game(&dir).await;
        let (tx, _rx) = channel();
        let (pid, _) = game.add_player(tx, "token-1", None).await;

        // Force-visit every unvisited room via the discovery path
        let room_ids: Vec<String> = {
            let st = game.state.lock().await;
            st.rooms.iter().filter(|r| !r.visited).map(|r| r.id.clone()).collect()
        };
        {
            let mut st = game.state.lock().await;
            for room_id in room_ids {
                game.visit_room(&mut st, &room_id, &pid, "token-1").await;
            }
        }

        let st = game.state.lock().await;
        assert!(st.rooms.iter().all(|r| r.visited));
        for monster in st.monsters.values() {
            // Never on or adjacent to a door
            for dy in -1..=1i32 {
                for dx in -1..=1i32 {
                    let (x, y) = (monster.x + dx, monster.y + dy);
                    if x >= 0 && x < st.width && y >= 0 && y < st.height {
                        assert!(
                            !st.tiles[y as usize][x as usize].is_door(),
                            "monster {} at ({}, {}) adjacent to a door",
                            monster.id,
                            monster.x,
                            monster.y
                        );
                    }
                }
            }
        }
        drop(st);
        game.stop().await;
    }

    #[tokio::test]
    async fn test_viewport_clamps_and_rewrites_coordinates() {
        let dir = tempfile::tempdir().unwrap();
        let game = make_game(&dir).await;
        let (tx, _rx) = channel();
        let (pid, _) = game.add_player(tx, "token-1", None).await;

        let state = game.get_viewport_state(&pid).await;
        let vw = state["width"].as_i64().unwrap();
        let vh = state["height"].as_i64().unwrap();
        assert!(vw <= 60 && vh <= 30);
        assert_eq!(state["tiles"].as_array().unwrap().len() as i64, vh);

        let me = &state["players"][&pid];
        let (rx_, ry_) = (me["x"].as_i64().unwrap(), me["y"].as_i64().unwrap());
        assert!(rx_ >= 0 && rx_ < vw);
        assert!(ry_ >= 0 && ry_ < vh);
        let world_x = me["world_x"].as_i64().unwrap();
        let cam_x = state["viewport_x"].as_i64().unwrap();
        assert_eq!(world_x, cam_x + rx_);
        game.stop().await;
    }

    #[tokio::test]
    async fn test_save_and_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(dir.path().to_path_buf()));
        let events = EventBus::default();
        let monsters = Arc::new(
            MonsterService::new(storage.clone(), events.clone(), AiSettings::default()).await,
        );
        let deps = GameDeps {
            storage: storage.clone(),
            monsters,
            events,
            settings: GameSettings {
                default_map_width: 120,
                default_map_height: 80,
                default_room_count: 10,
                ..GameSettings::default()
            },
        };

        let (tiles, player_pos) = {
            let game = Game::new("g_save".into(), "Saved Dungeon".into(), deps.clone());
            assert!(game.initialize(None, None, None, None).await);
            let (tx, _rx) = channel();
            let (pid, _) = game.add_player(tx, "token-1", None).await;
            game.stop().await;
            let st = game.state.lock().await;
            (st.tiles.clone(), st.players[&pid].position())
        };

        let restored = Game::new("g_save".into(), "Loading...".into(), deps);
        assert!(restored.initialize(Some("g_save"), None, None, None).await);
        let st = restored.state.lock().await;
        assert_eq!(st.name, "Saved Dungeon");
        assert_eq!(st.tiles, tiles);
        assert_eq!(st.players.len(), 1);
        assert_eq!(st.players.values().next().unwrap().position(), player_pos);
        assert_eq!(st.token_to_player.len(), 1);
        drop(st);
        restored.stop().await;
    }

    #[tokio::test]
    async fn test_restore_missing_save_fails() {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(dir.path().to_path_buf()));
        let events = EventBus::default();
        let monsters = Arc::new(
            MonsterService::new(storage.clone(), events.clone(), AiSettings::default()).await,
        );
        let deps = GameDeps {
            storage,
            monsters,
            events,
            settings: GameSettings::default(),
        };
        let game = Game::new("g_missing".into(), "Nope".into(), deps);
        assert!(!game.initialize(Some("g_missing"), None, None, None).await);
    }

    #[tokio::test]
    async fn test_immune_player_not_auto_engaged() {
        let dir = tempfile::tempdir().unwrap();
        let game = make_game(&dir).await;
        let (tx, _rx) = channel();
        let (pid, _) = game.add_player(tx, "token-1", None).await;

        {
            let mut st = game.state.lock().await;
            let (px, py) = st.players[&pid].position();
            let def = crate::services::bestiary::species("orc").unwrap();
            let monster = Monster {
                id: "m_orc".into(),
                monster_type: "orc".into(),
                name: def.name.into(),
                x: px + 1,
                y: py,
                room_id: st.rooms[0].id.clone(),
                symbol: def.symbol.into(),
                color: def.color.into(),
                stats: def.stats(),
                behavior: def.behavior,
                description: String::new(),
                patrol_target: None,
                last_move_tick: 0,
                target_player_id: None,
                last_seen_player_pos: None,
                intelligence_state: Default::default(),
            };
            st.monsters.insert(monster.id.clone(), monster);
            if let Some(p) = st.players.get_mut(&pid) {
                p.grant_fight_immunity();
            }
        }

        let mut outbox = Outbox::new();
        {
            let mut st = game.state.lock().await;
            game.check_monster_aggro(&mut st, 1, &mut outbox).await;
            assert!(
                st.active_fights.is_empty(),
                "immune player must not be engaged"
            );
        }
        game.stop().await;
    }
}
