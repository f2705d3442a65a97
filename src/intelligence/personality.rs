//! Personality profiles that bias monster action selection.

use serde::{Deserialize, Serialize};

use super::agent::AiAction;

fn clamp01(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}

/// High-level behavioral tendencies, normalized to [0, 1].
///
/// Traits influence action weighting in the decision engine: they shape
/// behavior before any learning has happened and amplify or dampen learned
/// preferences afterwards.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PersonalityProfile {
    /// Tendency toward attack actions.
    pub aggression: f32,
    /// Tendency toward defensive actions.
    pub caution: f32,
    /// Tendency toward tactical actions (defensive attacks, ambush).
    pub cunning: f32,
    /// Tendency toward social actions (calling allies).
    pub pack_mentality: f32,
    /// Tendency toward movement and patrol actions.
    pub exploration: f32,
}

impl Default for PersonalityProfile {
    fn default() -> Self {
        PersonalityProfile {
            aggression: 0.5,
            caution: 0.5,
            cunning: 0.5,
            pack_mentality: 0.5,
            exploration: 0.5,
        }
    }
}

impl PersonalityProfile {
    pub const fn new(
        aggression: f32,
        caution: f32,
        cunning: f32,
        pack_mentality: f32,
        exploration: f32,
    ) -> Self {
        PersonalityProfile {
            aggression,
            caution,
            cunning,
            pack_mentality,
            exploration,
        }
    }

    /// Clamp every trait into [0, 1].
    pub fn clamped(mut self) -> Self {
        self.aggression = clamp01(self.aggression);
        self.caution = clamp01(self.caution);
        self.cunning = clamp01(self.cunning);
        self.pack_mentality = clamp01(self.pack_mentality);
        self.exploration = clamp01(self.exploration);
        self
    }

    /// Multiplier biasing the weighted Q-value for a specific action.
    ///
    /// Biases are centered near 1.0. The combat attacks carry the strongest
    /// base so untrained monsters still fight when threatened; CALL_ALLIES
    /// gets a lower base so it cannot dominate an untrained table. Every
    /// bias is floored at 0.1.
    pub fn action_bias(&self, action: AiAction) -> f32 {
        let base = match action {
            AiAction::AttackAggressive => 1.15 + (self.aggression - 0.5) * 0.3,
            AiAction::AttackDefensive => 1.10 + (self.cunning - 0.5) * 0.25,
            AiAction::Defend => 0.9 + (self.caution - 0.5) * 0.4,
            AiAction::Flee => 0.7 + (self.caution - 0.5) * 0.5,
            AiAction::CallAllies => 0.8 + (self.pack_mentality - 0.5) * 0.4,
            AiAction::Ambush => {
                1.0 + (self.cunning - 0.5) * 0.4 + (self.aggression - 0.5) * 0.15
            }
            AiAction::Patrol => 0.85 + (self.exploration - 0.5) * 0.3,
            AiAction::MoveTowardThreat => 1.05 + (self.aggression - 0.5) * 0.35,
            AiAction::MoveAwayFromThreat => 0.8 + (self.caution - 0.5) * 0.4,
            AiAction::PatrolWaypoint => 0.85 + (self.exploration - 0.5) * 0.35,
        };
        base.max(0.1)
    }
}
