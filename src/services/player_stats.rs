//! Cross-game player statistics, fed by the event bus.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::Mutex;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::events::{EventBus, EventData, GameEvent};
use crate::services::storage::Storage;

const STATS_COLLECTION: &str = "players";
const STATS_KEY: &str = "stats";

/// D&D 5e challenge rating to XP, ascending by CR.
pub const XP_BY_CHALLENGE_RATING: [(f32, u32); 12] = [
    (0.0, 10),
    (0.125, 25),
    (0.25, 50),
    (0.5, 100),
    (1.0, 200),
    (2.0, 450),
    (3.0, 700),
    (4.0, 1100),
    (5.0, 1800),
    (6.0, 2300),
    (7.0, 2900),
    (8.0, 3900),
];

/// XP reward for a challenge rating: the exact table value, or the nearest
/// lower entry for off-table ratings.
pub fn xp_for_cr(challenge_rating: f32) -> u32 {
    let mut best = XP_BY_CHALLENGE_RATING[0].1;
    for (cr, xp) in XP_BY_CHALLENGE_RATING {
        if cr <= challenge_rating {
            best = xp;
        } else {
            break;
        }
    }
    best
}

/// Per-player statistics, keyed by the profile token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlayerStats {
    pub token: String,
    #[serde(default)]
    pub monsters_killed: u64,
    #[serde(default)]
    pub rooms_visited: u64,
    #[serde(default)]
    pub damage_dealt: u64,
    #[serde(default)]
    pub damage_taken: u64,
    #[serde(default)]
    pub deaths: u64,
    #[serde(default)]
    pub games_completed: u64,
    #[serde(default)]
    pub critical_hits: u64,
    #[serde(default)]
    pub experience_earned: u64,
    #[serde(default)]
    pub kills_by_type: HashMap<String, u64>,
    #[serde(default)]
    pub last_updated: String,
}

impl PlayerStats {
    fn new(token: &str) -> Self {
        PlayerStats {
            token: token.to_string(),
            last_updated: chrono::Utc::now().to_rfc3339(),
            ..PlayerStats::default()
        }
    }

    fn touch(&mut self) {
        self.last_updated = chrono::Utc::now().to_rfc3339();
    }

    /// Record a kill and award XP for the monster's challenge rating.
    /// Returns the XP awarded.
    pub fn record_monster_kill(&mut self, monster_type: &str, challenge_rating: f32) -> u32 {
        self.touch();
        *self.kills_by_type.entry(monster_type.to_string()).or_insert(0) += 1;
        self.monsters_killed += 1;
        let xp = xp_for_cr(challenge_rating);
        self.experience_earned += xp as u64;
        xp
    }

    pub fn top_kill_type(&self) -> Option<(&str, u64)> {
        self.kills_by_type
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(t, count)| (t.as_str(), *count))
    }
}

/// Event-driven stats tracker with a dirty flag and periodic flush.
pub struct PlayerStatsTracker {
    storage: Arc<dyn Storage>,
    events: EventBus,
    state: Mutex<TrackerState>,
}

struct TrackerState {
    stats: HashMap<String, PlayerStats>,
    dirty: bool,
}

impl PlayerStatsTracker {
    pub async fn new(storage: Arc<dyn Storage>, events: EventBus) -> Self {
        let mut stats = HashMap::new();
        match storage.get(STATS_COLLECTION, STATS_KEY).await {
            Ok(Some(doc)) => {
                if let Ok(parsed) =
                    serde_json::from_value::<HashMap<String, PlayerStats>>(doc)
                {
                    stats = parsed;
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "failed to load player stats"),
        }
        tracing::info!(players = stats.len(), "player stats tracker ready");
        PlayerStatsTracker {
            storage,
            events,
            state: Mutex::new(TrackerState {
                stats,
                dirty: false,
            }),
        }
    }

    /// Consume stat-bearing events and flush periodically while dirty.
    pub fn spawn_tracker(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let tracker = Arc::clone(self);
        let mut rx = tracker.events.subscribe();
        tokio::spawn(async move {
            let mut flush = interval(Duration::from_secs(120));
            flush.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracker.save().await;
                        break;
                    }
                    _ = flush.tick() => {
                        tracker.save_if_dirty().await;
                    }
                    event = rx.recv() => match event {
                        Ok(event) => tracker.handle_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "stats tracker lagged; events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    async fn handle_event(&self, event: GameEvent) {
        let mut state = self.state.lock().await;
        match &event.data {
            EventData::MonsterDied {
                player_token,
                monster_type,
                challenge_rating,
                ..
            } => {
                let stats = entry(&mut state.stats, player_token);
                let xp = stats.record_monster_kill(monster_type, *challenge_rating);
                tracing::debug!(token = %player_token, monster_type, xp, "kill recorded");
                state.dirty = true;
            }
            EventData::PlayerEnteredRoom {
                player_token,
                first_visit,
                ..
            } => {
                if *first_visit {
                    let stats = entry(&mut state.stats, player_token);
                    stats.rooms_visited += 1;
                    stats.touch();
                    state.dirty = true;
                }
            }
            EventData::DamageDealt {
                player_token,
                damage,
                is_player_source,
                is_critical,
                ..
            } => {
                if *damage <= 0 {
                    return;
                }
                let stats = entry(&mut state.stats, player_token);
                if *is_player_source {
                    stats.damage_dealt += *damage as u64;
                    if *is_critical {
                        stats.critical_hits += 1;
                    }
                } else {
                    stats.damage_taken += *damage as u64;
                }
                stats.touch();
                state.dirty = true;
            }
            EventData::PlayerDied { player_token, .. } => {
                let stats = entry(&mut state.stats, player_token);
                stats.deaths += 1;
                stats.touch();
                state.dirty = true;
            }
            EventData::GameCompleted { player_tokens, .. } => {
                for token in player_tokens {
                    let stats = entry(&mut state.stats, token);
                    stats.games_completed += 1;
                    stats.touch();
                }
                state.dirty = true;
            }
            _ => {}
        }
    }

    #[allow(dead_code)]
    pub async fn get_stats(&self, token: &str) -> Option<PlayerStats> {
        self.state.lock().await.stats.get(token).cloned()
    }

    /// Top players by experience, with the fields the leaderboard shows.
    pub async fn xp_leaderboard(&self, limit: usize) -> Vec<serde_json::Value> {
        let state = self.state.lock().await;
        let mut all: Vec<&PlayerStats> = state.stats.values().collect();
        all.sort_by(|a, b| b.experience_earned.cmp(&a.experience_earned));
        all.into_iter()
            .take(limit)
            .map(|s| {
                serde_json::json!({
                    "token": s.token,
                    "experience": s.experience_earned,
                    "kills": s.monsters_killed,
                    "top_kill": s.top_kill_type(),
                })
            })
            .collect()
    }

    async fn save_if_dirty(&self) {
        if self.state.lock().await.dirty {
            self.save().await;
        }
    }

    /// Flush stats; a failed write keeps the dirty flag so the next flush
    /// retries.
    pub async fn save(&self) {
        let doc = {
            let state = self.state.lock().await;
            match serde_json::to_value(&state.stats) {
                Ok(doc) => doc,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to serialize player stats");
                    return;
                }
            }
        };
        match self.storage.put(STATS_COLLECTION, STATS_KEY, &doc).await {
            Ok(()) => self.state.lock().await.dirty = false,
            Err(e) => tracing::warn!(error = %e, "failed to save player stats"),
        }
    }
}

fn entry<'a>(stats: &'a mut HashMap<String, PlayerStats>, token: &str) -> &'a mut PlayerStats {
    stats
        .entry(token.to_string())
        .or_insert_with(|| PlayerStats::new(token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage::FileStorage;

    #[test]
    fn test_xp_table_exact_values() {
        for (cr, xp) in XP_BY_CHALLENGE_RATING {
            assert_eq!(xp_for_cr(cr), xp, "CR {cr}");
        }
    }

    #[test]
    fn test_xp_nearest_lower_for_off_table_cr() {
        assert_eq!(xp_for_cr(0.3), 50); // between 0.25 and 0.5
        assert_eq!(xp_for_cr(1.5), 200); // between 1 and 2
        assert_eq!(xp_for_cr(42.0), 3900); // above the table
        assert_eq!(xp_for_cr(-1.0), 10); // below the table
    }

    #[test]
    fn test_record_kill_awards_xp() {
        let mut stats = PlayerStats::new("t1");
        let xp = stats.record_monster_kill("goblin", 0.25);
        assert_eq!(xp, 50);
        assert_eq!(stats.experience_earned, 50);
        assert_eq!(stats.monsters_killed, 1);
        assert_eq!(stats.kills_by_type["goblin"], 1);
    }

    async fn tracker(dir: &tempfile::TempDir, bus: EventBus) -> Arc<PlayerStatsTracker> {
        let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(dir.path().to_path_buf()));
        Arc::new(PlayerStatsTracker::new(storage, bus).await)
    }

    #[tokio::test]
    async fn test_events_accumulate_stats() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::default();
        let t = tracker(&dir, bus).await;

        t.handle_event(GameEvent::new(EventData::MonsterDied {
            player_token: "t1".into(),
            monster_type: "goblin".into(),
            challenge_rating: 0.25,
            game_id: "g1".into(),
            fight_id: "f1".into(),
            ai_snapshot: None,
            reward: -100.0,
        }))
        .await;
        t.handle_event(GameEvent::new(EventData::DamageDealt {
            player_token: "t1".into(),
            damage: 7,
            is_player_source: true,
            is_critical: true,
            game_id: "g1".into(),
            ai_snapshot: None,
            reward: -7.0,
        }))
        .await;
        t.handle_event(GameEvent::new(EventData::PlayerEnteredRoom {
            player_token: "t1".into(),
            room_id: "room_1".into(),
            first_visit: true,
            game_id: "g1".into(),
        }))
        .await;
        // Revisits do not count
        t.handle_event(GameEvent::new(EventData::PlayerEnteredRoom {
            player_token: "t1".into(),
            room_id: "room_1".into(),
            first_visit: false,
            game_id: "g1".into(),
        }))
        .await;
        t.handle_event(GameEvent::new(EventData::PlayerDied {
            player_token: "t1".into(),
            game_id: "g1".into(),
        }))
        .await;

        let stats = t.get_stats("t1").await.unwrap();
        assert_eq!(stats.monsters_killed, 1);
        assert_eq!(stats.experience_earned, 50);
        assert_eq!(stats.damage_dealt, 7);
        assert_eq!(stats.critical_hits, 1);
        assert_eq!(stats.rooms_visited, 1);
        assert_eq!(stats.deaths, 1);
    }

    #[tokio::test]
    async fn test_stats_persist_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::default();
        {
            let t = tracker(&dir, bus.clone()).await;
            t.handle_event(GameEvent::new(EventData::MonsterDied {
                player_token: "t1".into(),
                monster_type: "orc".into(),
                challenge_rating: 0.5,
                game_id: "g1".into(),
                fight_id: "f1".into(),
                ai_snapshot: None,
                reward: -100.0,
            }))
            .await;
            t.save().await;
        }
        let t = tracker(&dir, bus).await;
        let stats = t.get_stats("t1").await.unwrap();
        assert_eq!(stats.experience_earned, 100);
    }

    #[tokio::test]
    async fn test_leaderboard_orders_by_xp() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(&dir, EventBus::default()).await;
        for (token, cr) in [("a", 5.0_f32), ("b", 0.25), ("c", 2.0)] {
            t.handle_event(GameEvent::new(EventData::MonsterDied {
                player_token: token.into(),
                monster_type: "troll".into(),
                challenge_rating: cr,
                game_id: "g1".into(),
                fight_id: "f1".into(),
                ai_snapshot: None,
                reward: -100.0,
            }))
            .await;
        }
        let board = t.xp_leaderboard(2).await;
        assert_eq!(board.len(), 2);
        assert_eq!(board[0]["token"], "a");
        assert_eq!(board[1]["token"], "c");
    }
}
