//! Turn-based fight state machine.
//!
//! A fight pits one monster against one or more players. The turn order is
//! always `player_ids... + monster_id`; joins insert immediately before the
//! monster so it keeps acting last in the round.

use serde::{Deserialize, Serialize};

use super::now_secs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FightStatus {
    /// Fight requested but not yet started.
    Pending,
    /// Fight in progress.
    Active,
    /// Fight concluded.
    Ended,
    /// All players fled.
    Fled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombatLogEntry {
    #[serde(rename = "type")]
    pub entry_type: String,
    pub message: String,
    #[serde(default)]
    pub source_id: Option<String>,
    pub timestamp: f64,
}

/// An active combat encounter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fight {
    pub id: String,
    pub monster_id: String,
    #[serde(default)]
    pub player_ids: Vec<String>,
    #[serde(default)]
    pub turn_order: Vec<String>,
    #[serde(default)]
    pub current_turn_index: usize,
    pub status: FightStatus,
    #[serde(default)]
    pub started_at: f64,
    #[serde(default)]
    pub turn_end_time: f64,
    #[serde(default = "default_turn_duration")]
    pub turn_duration: u64,
    #[serde(default)]
    pub combat_log: Vec<CombatLogEntry>,
}

fn default_turn_duration() -> u64 {
    30
}

impl Fight {
    /// Create a new active fight with the initiator acting first.
    pub fn create(monster_id: &str, initiator_player_id: &str, turn_duration: u64) -> Self {
        let now = now_secs();
        let mut fight = Fight {
            id: uuid::Uuid::new_v4().to_string()[..8].to_string(),
            monster_id: monster_id.to_string(),
            player_ids: vec![initiator_player_id.to_string()],
            turn_order: vec![initiator_player_id.to_string(), monster_id.to_string()],
            current_turn_index: 0,
            status: FightStatus::Active,
            started_at: now,
            turn_end_time: now + turn_duration as f64,
            turn_duration,
            combat_log: Vec::new(),
        };
        fight.add_log_entry("system", "Combat initiated!", None);
        fight
    }

    /// Whoever has the current turn (a player id or the monster id).
    pub fn current_turn_id(&self) -> Option<&str> {
        if self.turn_order.is_empty() {
            return None;
        }
        Some(&self.turn_order[self.current_turn_index % self.turn_order.len()])
    }

    pub fn is_monster_turn(&self) -> bool {
        self.current_turn_id() == Some(self.monster_id.as_str())
    }

    pub fn is_active(&self) -> bool {
        self.status == FightStatus::Active
    }

    /// Remaining time in the current turn, clamped at zero.
    pub fn time_remaining(&self) -> f64 {
        (self.turn_end_time - now_secs()).max(0.0)
    }

    /// Add a player, inserted immediately before the monster in the turn
    /// order. The turn timer is not reset. Returns false if already present.
    pub fn add_player(&mut self, player_id: &str) -> bool {
        if self.player_ids.iter().any(|p| p == player_id) {
            return false;
        }
        self.player_ids.push(player_id.to_string());
        let monster_index = self
            .turn_order
            .iter()
            .position(|t| t == &self.monster_id)
            .unwrap_or(self.turn_order.len());
        self.turn_order.insert(monster_index, player_id.to_string());
        self.add_log_entry("system", "A new ally joins the fight!", None);
        true
    }

    /// Remove a player (flee or death). Adjusts the turn index so the next
    /// actor is preserved; resets the timer when it was the removed player's
    /// turn. Transitions to FLED when the last player leaves.
    pub fn remove_player(&mut self, player_id: &str) -> bool {
        let Some(pos) = self.player_ids.iter().position(|p| p == player_id) else {
            return false;
        };
        self.player_ids.remove(pos);

        if let Some(turn_pos) = self.turn_order.iter().position(|t| t == player_id) {
            self.turn_order.remove(turn_pos);
            if turn_pos < self.current_turn_index {
                self.current_turn_index -= 1;
            } else if turn_pos == self.current_turn_index {
                self.current_turn_index %= self.turn_order.len();
                self.reset_turn_timer();
            }
        }

        self.add_log_entry("system", "A combatant has fled!", None);

        if self.player_ids.is_empty() {
            self.status = FightStatus::Fled;
            self.add_log_entry("system", "All players have fled. Combat ends.", None);
        }
        true
    }

    /// Advance to the next turn and reset the timer. Returns the new actor.
    pub fn advance_turn(&mut self) -> Option<&str> {
        if self.turn_order.is_empty() {
            return None;
        }
        self.current_turn_index = (self.current_turn_index + 1) % self.turn_order.len();
        self.reset_turn_timer();
        self.current_turn_id()
    }

    pub fn reset_turn_timer(&mut self) {
        self.turn_end_time = now_secs() + self.turn_duration as f64;
    }

    pub fn add_log_entry(&mut self, entry_type: &str, message: &str, source_id: Option<&str>) {
        self.combat_log.push(CombatLogEntry {
            entry_type: entry_type.to_string(),
            message: message.to_string(),
            source_id: source_id.map(str::to_string),
            timestamp: now_secs(),
        });
    }

    pub fn end_fight(&mut self, result: &str) {
        self.status = FightStatus::Ended;
        self.add_log_entry("system", &format!("Combat ended: {result}"), None);
    }

    /// Wire payload with derived fields; carries the last 20 log entries.
    pub fn to_payload(&self) -> serde_json::Value {
        let log_start = self.combat_log.len().saturating_sub(20);
        serde_json::json!({
            "id": self.id,
            "monster_id": self.monster_id,
            "player_ids": self.player_ids,
            "turn_order": self.turn_order,
            "current_turn_id": self.current_turn_id(),
            "current_turn_index": self.current_turn_index,
            "is_monster_turn": self.is_monster_turn(),
            "status": self.status,
            "started_at": self.started_at,
            "turn_end_time": self.turn_end_time,
            "turn_duration": self.turn_duration,
            "time_remaining": self.time_remaining(),
            "combat_log": self.combat_log[log_start..],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fight() -> Fight {
        Fight::create("m_1", "p_1", 30)
    }

    #[test]
    fn test_create_turn_order() {
        let f = fight();
        assert_eq!(f.turn_order, vec!["p_1", "m_1"]);
        assert_eq!(f.current_turn_id(), Some("p_1"));
        assert!(f.is_active());
        assert!(!f.is_monster_turn());
        assert!(f.time_remaining() > 29.0);
    }

    #[test]
    fn test_invariant_monster_in_turn_order() {
        let mut f = fight();
        f.add_player("p_2");
        f.add_player("p_3");
        assert_eq!(
            f.turn_order.iter().filter(|t| *t == "m_1").count(),
            1,
            "monster appears exactly once"
        );
        for pid in &f.player_ids {
            assert_eq!(f.turn_order.iter().filter(|t| *t == pid).count(), 1);
        }
        assert!(f.current_turn_index < f.turn_order.len());
    }

    #[test]
    fn test_join_inserts_before_monster() {
        let mut f = fight();
        assert!(f.add_player("p_2"));
        assert_eq!(f.turn_order, vec!["p_1", "p_2", "m_1"]);
        // Joining twice is a no-op
        assert!(!f.add_player("p_2"));
    }

    #[test]
    fn test_advance_turn_wraps() {
        let mut f = fight();
        assert_eq!(f.advance_turn(), Some("m_1"));
        assert!(f.is_monster_turn());
        assert_eq!(f.advance_turn(), Some("p_1"));
    }

    #[test]
    fn test_remove_earlier_player_decrements_index() {
        let mut f = fight();
        f.add_player("p_2");
        // Move to p_2's turn (index 1)
        f.advance_turn();
        assert_eq!(f.current_turn_id(), Some("p_2"));
        f.remove_player("p_1");
        assert_eq!(f.current_turn_id(), Some("p_2"));
        assert_eq!(f.current_turn_index, 0);
    }

    #[test]
    fn test_remove_current_player_keeps_next_actor() {
        let mut f = fight();
        f.add_player("p_2");
        assert_eq!(f.current_turn_id(), Some("p_1"));
        f.remove_player("p_1");
        assert_eq!(f.current_turn_id(), Some("p_2"));
        assert!(f.is_active());
    }

    #[test]
    fn test_last_player_removed_transitions_to_fled() {
        let mut f = fight();
        f.remove_player("p_1");
        assert_eq!(f.status, FightStatus::Fled);
        assert!(!f.is_active());
        assert!(f.player_ids.is_empty());
        // Monster stays in the order
        assert_eq!(f.turn_order, vec!["m_1"]);
    }

    #[test]
    fn test_remove_unknown_player() {
        let mut f = fight();
        assert!(!f.remove_player("p_404"));
        assert_eq!(f.player_ids, vec!["p_1"]);
    }

    #[test]
    fn test_end_fight() {
        let mut f = fight();
        f.end_fight("victory");
        assert_eq!(f.status, FightStatus::Ended);
        assert!(!f.is_active());
    }

    #[test]
    fn test_payload_log_capped_at_twenty() {
        let mut f = fight();
        for i in 0..30 {
            f.add_log_entry("hit", &format!("swing {i}"), Some("p_1"));
        }
        let payload = f.to_payload();
        assert_eq!(payload["combat_log"].as_array().unwrap().len(), 20);
        assert_eq!(payload["current_turn_id"], "p_1");
    }
}
