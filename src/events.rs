//! Game event bus.
//!
//! Pub/sub over a tokio broadcast channel plus a bounded ring of recent
//! events for diagnostics. The bus owns no subscriber state: consumers hold
//! their own receivers and drain them in their own tasks, so a slow consumer
//! can lag but never blocks a publisher.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::intelligence::{AiAction, WorldState};

/// State-action snapshot attached to reward events so Q-learning can
/// attribute outcomes to the decision that caused them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiSnapshot {
    pub monster_type: String,
    pub state_index: usize,
    pub action: AiAction,
    pub world_state: WorldState,
    pub hp_ratio: f32,
}

/// Typed event payloads.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventData {
    PlayerJoined {
        game_id: String,
        x: i32,
        y: i32,
    },
    PlayerLeft {
        game_id: String,
    },
    PlayerDied {
        player_token: String,
        game_id: String,
    },
    PlayerEnteredRoom {
        player_token: String,
        room_id: String,
        first_visit: bool,
        game_id: String,
    },
    DamageDealt {
        player_token: String,
        damage: i32,
        is_player_source: bool,
        is_critical: bool,
        game_id: String,
        ai_snapshot: Option<AiSnapshot>,
        reward: f32,
    },
    MonsterDied {
        player_token: String,
        monster_type: String,
        challenge_rating: f32,
        game_id: String,
        fight_id: String,
        ai_snapshot: Option<AiSnapshot>,
        reward: f32,
    },
    DoorToggled {
        game_id: String,
        x: i32,
        y: i32,
        open: bool,
    },
    GameSaved {
        game_id: String,
        reason: String,
    },
    GameCompleted {
        game_id: String,
        player_tokens: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct GameEvent {
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(flatten)]
    pub data: EventData,
}

impl GameEvent {
    pub fn new(data: EventData) -> Self {
        GameEvent {
            at: Utc::now(),
            source_id: None,
            target_id: None,
            data,
        }
    }

    pub fn from_source(source_id: &str, data: EventData) -> Self {
        GameEvent {
            at: Utc::now(),
            source_id: Some(source_id.to_string()),
            target_id: None,
            data,
        }
    }

    pub fn with_target(mut self, target_id: &str) -> Self {
        self.target_id = Some(target_id.to_string());
        self
    }
}

/// Broadcast bus with a bounded history ring.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GameEvent>,
    history: Arc<Mutex<VecDeque<GameEvent>>>,
    max_history: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(1000)
    }
}

impl EventBus {
    pub fn new(max_history: usize) -> Self {
        // Channel buffer sized for bursts of combat events across many games
        let (tx, _) = broadcast::channel(256);
        EventBus {
            tx,
            history: Arc::new(Mutex::new(VecDeque::with_capacity(max_history))),
            max_history,
        }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<GameEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Never blocks; delivery errors (no subscribers) are
    /// ignored.
    pub fn publish(&self, event: GameEvent) {
        if let Ok(mut history) = self.history.lock() {
            if history.len() >= self.max_history {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        let _ = self.tx.send(event);
    }

    /// Most recent events, newest last.
    pub fn recent(&self, limit: usize) -> Vec<GameEvent> {
        let history = match self.history.lock() {
            Ok(h) => h,
            Err(_) => return Vec::new(),
        };
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn saved_event(reason: &str) -> GameEvent {
        GameEvent::new(EventData::GameSaved {
            game_id: "g1".into(),
            reason: reason.into(),
        })
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();
        bus.publish(saved_event("test"));
        let event = rx.recv().await.unwrap();
        assert!(matches!(event.data, EventData::GameSaved { .. }));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new(10);
        bus.publish(saved_event("nobody listening"));
        assert_eq!(bus.recent(10).len(), 1);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let bus = EventBus::new(5);
        for i in 0..12 {
            bus.publish(saved_event(&format!("save {i}")));
        }
        let recent = bus.recent(100);
        assert_eq!(recent.len(), 5);
        match &recent[0].data {
            EventData::GameSaved { reason, .. } => assert_eq!(reason, "save 7"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_multiple_subscribers_each_get_events() {
        let bus = EventBus::new(10);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(saved_event("x"));
        assert!(a.recv().await.is_ok());
        assert!(b.recv().await.is_ok());
    }
}
