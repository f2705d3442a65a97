//! Tabular Q-learning: action space, hyperparameters, the shared Q-table
//! buffer, and the epsilon-greedy agent.
//!
//! The Bellman update:
//!
//! ```text
//! Q(s, a) <- Q(s, a) + alpha * (r + gamma * max(Q(s', a')) - Q(s, a))
//! ```
//!
//! The agent does not own Q-tables; tables live per-species in the knowledge
//! store so every monster of a species learns from the whole species'
//! experience.

use rand::Rng;
use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::personality::PersonalityProfile;

/// Discrete actions available during AI decision-making.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AiAction {
    /// All-out attack, high risk/reward.
    AttackAggressive,
    /// Balanced attack with some caution.
    AttackDefensive,
    /// Minimize damage taken, reduced offense.
    Defend,
    /// Attempt to escape from combat.
    Flee,
    /// Alert nearby monsters for assistance.
    CallAllies,
    /// Wait for an optimal attack opportunity.
    Ambush,
    /// Move around territory, standard behavior.
    Patrol,
    /// Chase or approach the nearest threat.
    MoveTowardThreat,
    /// Tactical retreat from the threat.
    MoveAwayFromThreat,
    /// Move toward a patrol waypoint (corridor exploration).
    PatrolWaypoint,
}

pub const ACTION_COUNT: usize = 10;

impl AiAction {
    pub const ALL: [AiAction; ACTION_COUNT] = [
        AiAction::AttackAggressive,
        AiAction::AttackDefensive,
        AiAction::Defend,
        AiAction::Flee,
        AiAction::CallAllies,
        AiAction::Ambush,
        AiAction::Patrol,
        AiAction::MoveTowardThreat,
        AiAction::MoveAwayFromThreat,
        AiAction::PatrolWaypoint,
    ];

    pub fn index(&self) -> usize {
        Self::ALL.iter().position(|a| a == self).unwrap_or(0)
    }

    pub fn from_index(index: usize) -> Option<AiAction> {
        Self::ALL.get(index).copied()
    }

    /// Wire/history name, matching the serde representation.
    pub fn name(&self) -> &'static str {
        match self {
            AiAction::AttackAggressive => "ATTACK_AGGRESSIVE",
            AiAction::AttackDefensive => "ATTACK_DEFENSIVE",
            AiAction::Defend => "DEFEND",
            AiAction::Flee => "FLEE",
            AiAction::CallAllies => "CALL_ALLIES",
            AiAction::Ambush => "AMBUSH",
            AiAction::Patrol => "PATROL",
            AiAction::MoveTowardThreat => "MOVE_TOWARD_THREAT",
            AiAction::MoveAwayFromThreat => "MOVE_AWAY_FROM_THREAT",
            AiAction::PatrolWaypoint => "PATROL_WAYPOINT",
        }
    }

    /// Actions that initiate or continue attacks.
    pub fn is_aggressive(&self) -> bool {
        matches!(
            self,
            AiAction::AttackAggressive | AiAction::AttackDefensive | AiAction::Ambush
        )
    }
}

/// Q-learning hyperparameters. All values are clamped into valid ranges on
/// construction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QLearningConfig {
    /// Alpha: how much new information overrides old.
    pub learning_rate: f32,
    /// Gamma: importance of future rewards.
    pub discount_factor: f32,
    /// Epsilon: probability of a random action.
    pub exploration_rate: f32,
    /// Floor for epsilon after decay.
    pub min_exploration_rate: f32,
    /// Epsilon multiplier applied after each learning step.
    pub exploration_decay: f32,
}

impl Default for QLearningConfig {
    fn default() -> Self {
        QLearningConfig {
            learning_rate: 0.1,
            discount_factor: 0.95,
            exploration_rate: 0.3,
            min_exploration_rate: 0.05,
            exploration_decay: 0.995,
        }
    }
}

impl QLearningConfig {
    pub const fn new(
        learning_rate: f32,
        discount_factor: f32,
        exploration_rate: f32,
        min_exploration_rate: f32,
        exploration_decay: f32,
    ) -> Self {
        QLearningConfig {
            learning_rate,
            discount_factor,
            exploration_rate,
            min_exploration_rate,
            exploration_decay,
        }
    }

    pub fn clamped(mut self) -> Self {
        self.learning_rate = self.learning_rate.clamp(1e-4, 1.0);
        self.discount_factor = self.discount_factor.clamp(0.0, 0.999);
        self.exploration_rate = self.exploration_rate.clamp(0.0, 1.0);
        self.min_exploration_rate = self.min_exploration_rate.clamp(0.0, self.exploration_rate);
        self.exploration_decay = self.exploration_decay.clamp(0.9, 0.9999);
        self
    }
}

/// A flat row-major `f32` buffer of shape `(states, actions)`.
///
/// Serialized as nested rows so the persisted document format matches the
/// species store schema.
#[derive(Debug, Clone, PartialEq)]
pub struct QTable {
    states: usize,
    actions: usize,
    values: Vec<f32>,
}

impl QTable {
    pub fn zeros(states: usize, actions: usize) -> Self {
        QTable {
            states,
            actions,
            values: vec![0.0; states * actions],
        }
    }

    pub fn states(&self) -> usize {
        self.states
    }

    pub fn actions(&self) -> usize {
        self.actions
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.states, self.actions)
    }

    pub fn get(&self, state: usize, action: usize) -> f32 {
        self.values[state * self.actions + action]
    }

    pub fn set(&mut self, state: usize, action: usize, value: f32) {
        self.values[state * self.actions + action] = value;
    }

    pub fn row(&self, state: usize) -> &[f32] {
        let start = state * self.actions;
        &self.values[start..start + self.actions]
    }

    pub fn max_row(&self, state: usize) -> f32 {
        self.row(state)
            .iter()
            .copied()
            .fold(f32::NEG_INFINITY, f32::max)
    }

    pub fn argmax_row(&self, state: usize) -> usize {
        let row = self.row(state);
        let mut best = 0;
        for (i, &v) in row.iter().enumerate() {
            if v > row[best] {
                best = i;
            }
        }
        best
    }

    /// Largest absolute value in a row; used to detect untrained tables.
    pub fn max_abs_row(&self, state: usize) -> f32 {
        self.row(state).iter().fold(0.0_f32, |acc, v| acc.max(v.abs()))
    }

    /// Scale every value by a factor. Used when a new generation partially
    /// inherits the learned policy.
    pub fn scale(&mut self, factor: f32) {
        for value in &mut self.values {
            *value *= factor;
        }
    }

    /// Resize to a new shape, copying the overlapping top-left sub-block and
    /// zero-filling the rest. Used when the encoder's state space changes.
    pub fn resized(&self, states: usize, actions: usize) -> QTable {
        let mut resized = QTable::zeros(states, actions);
        for s in 0..self.states.min(states) {
            for a in 0..self.actions.min(actions) {
                resized.set(s, a, self.get(s, a));
            }
        }
        resized
    }
}

impl Serialize for QTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.states))?;
        for state in 0..self.states {
            seq.serialize_element(self.row(state))?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for QTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RowsVisitor;

        impl<'de> Visitor<'de> for RowsVisitor {
            type Value = QTable;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a sequence of f32 rows")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<QTable, A::Error> {
                let mut values = Vec::new();
                let mut states = 0;
                let mut actions = 0;
                while let Some(row) = seq.next_element::<Vec<f32>>()? {
                    if states == 0 {
                        actions = row.len();
                    } else if row.len() != actions {
                        return Err(serde::de::Error::custom("ragged q_table rows"));
                    }
                    values.extend(row);
                    states += 1;
                }
                Ok(QTable {
                    states,
                    actions,
                    values,
                })
            }
        }

        deserializer.deserialize_seq(RowsVisitor)
    }
}

/// Epsilon-greedy Q-learning agent with personality-biased exploitation.
#[derive(Debug, Clone)]
pub struct QLearningAgent {
    pub config: QLearningConfig,
    pub exploration_rate: f32,
}

impl QLearningAgent {
    pub fn new(config: QLearningConfig) -> Self {
        let config = config.clamped();
        QLearningAgent {
            exploration_rate: config.exploration_rate,
            config,
        }
    }

    /// Select an action for the given state.
    ///
    /// With probability epsilon the action is uniform random. Otherwise the
    /// action maximizes the personality-weighted Q-row: when the row is
    /// effectively untrained (`max |q| < 0.1`) the personality biases are
    /// used alone so new species behave sensibly before learning kicks in.
    pub fn select_action(
        &self,
        q_table: &QTable,
        state_index: usize,
        personality: Option<&PersonalityProfile>,
    ) -> AiAction {
        let mut rng = rand::thread_rng();
        if rng.gen::<f32>() < self.exploration_rate {
            return AiAction::ALL[rng.gen_range(0..ACTION_COUNT)];
        }

        let Some(profile) = personality else {
            return AiAction::ALL[q_table.argmax_row(state_index)];
        };

        let q_values = q_table.row(state_index);
        let biases: Vec<f32> = AiAction::ALL
            .iter()
            .map(|&a| profile.action_bias(a))
            .collect();
        let weighted: Vec<f32> = if q_table.max_abs_row(state_index) < 0.1 {
            biases
        } else {
            q_values.iter().zip(&biases).map(|(q, b)| q * b).collect()
        };

        let mut best = 0;
        for (i, &v) in weighted.iter().enumerate() {
            if v > weighted[best] {
                best = i;
            }
        }
        AiAction::ALL[best]
    }

    /// Apply the Bellman update and return the Q-value delta.
    pub fn update(
        &self,
        q_table: &mut QTable,
        state_index: usize,
        action: AiAction,
        reward: f32,
        next_state_index: usize,
    ) -> f32 {
        let alpha = self.config.learning_rate;
        let gamma = self.config.discount_factor;

        let old_value = q_table.get(state_index, action.index());
        let next_max = q_table.max_row(next_state_index);
        let target = reward + gamma * next_max;
        let delta = alpha * (target - old_value);
        q_table.set(state_index, action.index(), old_value + delta);
        delta
    }

    /// Reduce exploration toward the configured floor.
    pub fn decay_exploration(&mut self) {
        self.exploration_rate = (self.exploration_rate * self.config.exploration_decay)
            .max(self.config.min_exploration_rate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_round_trip() {
        for (i, action) in AiAction::ALL.iter().enumerate() {
            assert_eq!(action.index(), i);
            assert_eq!(AiAction::from_index(i), Some(*action));
        }
        assert_eq!(AiAction::from_index(10), None);
    }

    #[test]
    fn test_action_serde_names() {
        let json = serde_json::to_string(&AiAction::AttackAggressive).unwrap();
        assert_eq!(json, "\"ATTACK_AGGRESSIVE\"");
        let action: AiAction = serde_json::from_str("\"PATROL_WAYPOINT\"").unwrap();
        assert_eq!(action, AiAction::PatrolWaypoint);
    }

    #[test]
    fn test_config_clamping() {
        let config = QLearningConfig::new(5.0, 1.5, 2.0, 3.0, 0.5).clamped();
        assert_eq!(config.learning_rate, 1.0);
        assert_eq!(config.discount_factor, 0.999);
        assert_eq!(config.exploration_rate, 1.0);
        assert_eq!(config.min_exploration_rate, 1.0);
        assert_eq!(config.exploration_decay, 0.9);

        let config = QLearningConfig::new(0.0, -1.0, -0.5, -0.5, 2.0).clamped();
        assert_eq!(config.learning_rate, 1e-4);
        assert_eq!(config.discount_factor, 0.0);
        assert_eq!(config.exploration_rate, 0.0);
        assert_eq!(config.min_exploration_rate, 0.0);
        assert_eq!(config.exploration_decay, 0.9999);
    }

    #[test]
    fn test_qtable_indexing() {
        let mut table = QTable::zeros(4, 3);
        table.set(2, 1, 1.5);
        assert_eq!(table.get(2, 1), 1.5);
        assert_eq!(table.row(2), &[0.0, 1.5, 0.0]);
        assert_eq!(table.argmax_row(2), 1);
        assert_eq!(table.max_row(2), 1.5);
    }

    #[test]
    fn test_qtable_serde_round_trip() {
        let mut table = QTable::zeros(2, 3);
        table.set(0, 2, 0.5);
        table.set(1, 0, -1.0);
        let json = serde_json::to_string(&table).unwrap();
        assert_eq!(json, "[[0.0,0.0,0.5],[-1.0,0.0,0.0]]");
        let back: QTable = serde_json::from_str(&json).unwrap();
        assert_eq!(back, table);
    }

    #[test]
    fn test_qtable_resize_preserves_overlap() {
        let mut table = QTable::zeros(3, 2);
        table.set(0, 0, 1.0);
        table.set(2, 1, 2.0);
        let grown = table.resized(5, 4);
        assert_eq!(grown.shape(), (5, 4));
        assert_eq!(grown.get(0, 0), 1.0);
        assert_eq!(grown.get(2, 1), 2.0);
        assert_eq!(grown.get(4, 3), 0.0);
        let shrunk = table.resized(2, 2);
        assert_eq!(shrunk.get(0, 0), 1.0);
        assert_eq!(shrunk.shape(), (2, 2));
    }

    #[test]
    fn test_update_positive_reward_raises_q() {
        let agent = QLearningAgent::new(QLearningConfig::default());
        let mut table = QTable::zeros(10, ACTION_COUNT);
        let delta = agent.update(&mut table, 3, AiAction::AttackAggressive, 5.0, 3);
        assert!(delta > 0.0);
        assert!(table.get(3, AiAction::AttackAggressive.index()) > 0.0);
    }

    #[test]
    fn test_exploration_decay_monotonic() {
        let mut agent = QLearningAgent::new(QLearningConfig::default());
        let mut previous = agent.exploration_rate;
        for _ in 0..2000 {
            agent.decay_exploration();
            assert!(agent.exploration_rate <= previous);
            previous = agent.exploration_rate;
        }
        assert!((agent.exploration_rate - agent.config.min_exploration_rate).abs() < 1e-6);
    }

    #[test]
    fn test_untrained_table_follows_personality() {
        let mut agent = QLearningAgent::new(QLearningConfig::default());
        agent.exploration_rate = 0.0;
        let table = QTable::zeros(10, ACTION_COUNT);
        let aggressive = PersonalityProfile::new(1.0, 0.1, 0.5, 0.1, 0.1);
        let action = agent.select_action(&table, 0, Some(&aggressive));
        assert_eq!(action, AiAction::AttackAggressive);
    }

    #[test]
    fn test_trained_table_overrides_personality() {
        let mut agent = QLearningAgent::new(QLearningConfig::default());
        agent.exploration_rate = 0.0;
        let mut table = QTable::zeros(10, ACTION_COUNT);
        table.set(0, AiAction::Flee.index(), 50.0);
        let aggressive = PersonalityProfile::new(1.0, 0.9, 0.5, 0.1, 0.1);
        let action = agent.select_action(&table, 0, Some(&aggressive));
        assert_eq!(action, AiAction::Flee);
    }

    #[test]
    fn test_convergence_to_fixed_point() {
        // Repeated +5 reward on a self-loop converges to r / (1 - gamma)
        let config = QLearningConfig::new(0.1, 0.95, 0.0, 0.0, 0.9999);
        let agent = QLearningAgent::new(config);
        let mut table = QTable::zeros(10, ACTION_COUNT);
        for _ in 0..2000 {
            agent.update(&mut table, 4, AiAction::AttackAggressive, 5.0, 4);
        }
        let fixed_point = 5.0 / (1.0 - 0.95);
        let learned = table.get(4, AiAction::AttackAggressive.index());
        assert!(
            (learned - fixed_point).abs() / fixed_point < 0.05,
            "learned {learned}, expected near {fixed_point}"
        );
        for action in AiAction::ALL {
            if action != AiAction::AttackAggressive {
                assert!(learned > table.get(4, action.index()));
            }
        }
    }
}
