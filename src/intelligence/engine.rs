//! Decision orchestration: ties personality, memory, the encoder and the
//! learning agent together into one per-species brain.

use crate::domain::Monster;

use super::agent::{AiAction, QLearningAgent, QLearningConfig, QTable};
use super::encoder::{StateEncoder, WorldState};
use super::memory::ThreatMemory;
use super::personality::PersonalityProfile;
use crate::dungeon::pathfinding::Direction;

/// Monsters at or below this intelligence never perceive player threats.
pub const OBLIVIOUS_INTELLIGENCE_THRESHOLD: i32 = 6;

#[derive(Debug, Clone)]
pub struct DecisionResult {
    pub action: AiAction,
    pub state_index: usize,
    pub discrete_state: [usize; 7],
    pub confidence: f32,
}

/// High-level AI brain shared by all monsters of one species.
#[derive(Debug, Clone)]
pub struct DecisionEngine {
    pub encoder: StateEncoder,
    pub agent: QLearningAgent,
}

impl DecisionEngine {
    pub fn new(config: QLearningConfig) -> Self {
        DecisionEngine {
            encoder: StateEncoder,
            agent: QLearningAgent::new(config),
        }
    }

    /// Decide an action for the monster and record the decision into its
    /// intelligence state so later reward events can be attributed.
    pub fn decide(
        &self,
        monster: &mut Monster,
        memory: &mut ThreatMemory,
        personality: &PersonalityProfile,
        q_table: &QTable,
        current_tick: u64,
        world_state: &WorldState,
    ) -> DecisionResult {
        memory.decay(current_tick);

        let (state_index, discrete_state) = self.encode_state(monster, world_state);
        let action = self.agent.select_action(q_table, state_index, Some(personality));

        monster.intelligence_state.last_state_index = Some(state_index);
        monster.intelligence_state.last_action = Some(action);
        monster.intelligence_state.last_decision_tick = current_tick;
        monster.intelligence_state.q_table_version = q_table.states();
        monster.intelligence_state.last_world_state = world_state.clone();
        monster.intelligence_state.memory_events = memory.events.clone();

        let q_max = q_table.max_row(state_index);
        let confidence = if q_max == 0.0 {
            0.5
        } else {
            1.0 / (1.0 + (-q_max).exp())
        };

        tracing::trace!(
            monster_id = %monster.id,
            state_index,
            state = %self.encoder.describe(state_index),
            action = ?action,
            confidence,
            "ai decision"
        );

        DecisionResult {
            action,
            state_index,
            discrete_state,
            confidence,
        }
    }

    /// Apply a reward: Bellman update followed by exploration decay.
    /// Returns the Q-value delta.
    pub fn learn(
        &mut self,
        q_table: &mut QTable,
        state_index: usize,
        next_state_index: usize,
        action: AiAction,
        reward: f32,
    ) -> f32 {
        let delta = self
            .agent
            .update(q_table, state_index, action, reward, next_state_index);
        self.agent.decay_exploration();
        delta
    }

    /// Encode the world as seen by this monster, applying intelligence
    /// gating: dumb monsters never perceive the player.
    pub fn encode_state(&self, monster: &Monster, world_state: &WorldState) -> (usize, [usize; 7]) {
        let hp_ratio = monster.hp_ratio().clamp(0.0, 1.0);

        let (enemy_count, distance, direction) =
            if monster.stats.intelligence <= OBLIVIOUS_INTELLIGENCE_THRESHOLD {
                (0, 999, Direction::None)
            } else {
                (
                    world_state.nearby_enemies,
                    world_state.distance_to_threat,
                    world_state.threat_direction,
                )
            };

        self.encoder.encode(
            hp_ratio,
            enemy_count,
            world_state.nearby_allies,
            &world_state.room_type,
            distance,
            direction,
            world_state.in_corridor,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MonsterBehavior, MonsterIntelligenceState, MonsterStats};
    use crate::intelligence::agent::ACTION_COUNT;
    use crate::intelligence::encoder::STATE_SPACE;

    fn monster(intelligence: i32) -> Monster {
        Monster {
            id: "m_1".into(),
            monster_type: "goblin".into(),
            name: "Goblin".into(),
            x: 5,
            y: 5,
            room_id: "room_1".into(),
            symbol: "g".into(),
            color: "#5c2".into(),
            stats: MonsterStats {
                hp: 10,
                max_hp: 10,
                ac: 12,
                strength: 10,
                dexterity: 12,
                constitution: 10,
                intelligence,
                wisdom: 8,
                charisma: 8,
                speed: 30,
                challenge_rating: 0.25,
            },
            behavior: MonsterBehavior::Patrol,
            description: String::new(),
            patrol_target: None,
            last_move_tick: 0,
            target_player_id: None,
            last_seen_player_pos: None,
            intelligence_state: MonsterIntelligenceState::default(),
        }
    }

    fn threat_world() -> WorldState {
        WorldState {
            room_type: "armory".into(),
            nearby_enemies: 2,
            nearby_allies: 1,
            distance_to_threat: 1,
            threat_direction: Direction::North,
            in_corridor: false,
            threat_position: Some((5, 4)),
        }
    }

    #[test]
    fn test_decision_records_intelligence_state() {
        let engine = DecisionEngine::new(QLearningConfig::default());
        let mut m = monster(10);
        let mut memory = ThreatMemory::default();
        let personality = PersonalityProfile::default();
        let table = QTable::zeros(STATE_SPACE, ACTION_COUNT);
        let world = threat_world();

        let result = engine.decide(&mut m, &mut memory, &personality, &table, 7, &world);

        assert_eq!(m.intelligence_state.last_state_index, Some(result.state_index));
        assert_eq!(m.intelligence_state.last_action, Some(result.action));
        assert_eq!(m.intelligence_state.last_decision_tick, 7);
        assert_eq!(m.intelligence_state.q_table_version, STATE_SPACE);
        assert_eq!(m.intelligence_state.last_world_state.room_type, "armory");
        assert!(result.state_index < STATE_SPACE);
    }

    #[test]
    fn test_confidence_half_on_untrained_table() {
        let engine = DecisionEngine::new(QLearningConfig::default());
        let mut m = monster(10);
        let mut memory = ThreatMemory::default();
        let table = QTable::zeros(STATE_SPACE, ACTION_COUNT);
        let result = engine.decide(
            &mut m,
            &mut memory,
            &PersonalityProfile::default(),
            &table,
            1,
            &threat_world(),
        );
        assert_eq!(result.confidence, 0.5);
    }

    #[test]
    fn test_oblivious_monster_never_sees_threats() {
        let engine = DecisionEngine::new(QLearningConfig::default());
        let dumb = monster(2);
        let smart = monster(10);
        let world = threat_world();

        let (_, dumb_state) = engine.encode_state(&dumb, &world);
        let (_, smart_state) = engine.encode_state(&smart, &world);

        // enemies forced to 0, distance to FAR, direction to NONE
        assert_eq!(dumb_state[1], 0);
        assert_eq!(dumb_state[4], 2);
        assert_eq!(dumb_state[5], 8);
        // allies are still perceived
        assert_eq!(dumb_state[2], 1);

        assert_eq!(smart_state[1], 2);
        assert_eq!(smart_state[4], 0);
        assert_eq!(smart_state[5], 0);
    }

    #[test]
    fn test_threshold_boundary() {
        let engine = DecisionEngine::new(QLearningConfig::default());
        let world = threat_world();
        let at_threshold = monster(OBLIVIOUS_INTELLIGENCE_THRESHOLD);
        let above = monster(OBLIVIOUS_INTELLIGENCE_THRESHOLD + 1);
        assert_eq!(engine.encode_state(&at_threshold, &world).1[1], 0);
        assert_eq!(engine.encode_state(&above, &world).1[1], 2);
    }

    #[test]
    fn test_learn_updates_and_decays() {
        let mut engine = DecisionEngine::new(QLearningConfig::default());
        let mut table = QTable::zeros(STATE_SPACE, ACTION_COUNT);
        let epsilon_before = engine.agent.exploration_rate;
        let delta = engine.learn(&mut table, 10, 10, AiAction::AttackAggressive, 5.0);
        assert!(delta > 0.0);
        assert!(engine.agent.exploration_rate < epsilon_before);
    }
}
