//! Monster intelligence: Q-learning over a discretized world state, shaped
//! by per-species personalities and decaying threat memory.

pub mod agent;
pub mod encoder;
pub mod engine;
pub mod memory;
pub mod personality;
pub mod species;

pub use agent::{AiAction, QLearningAgent, QLearningConfig, QTable, ACTION_COUNT};
pub use encoder::{StateEncoder, WorldState, STATE_SPACE};
pub use engine::{DecisionEngine, DecisionResult, OBLIVIOUS_INTELLIGENCE_THRESHOLD};
pub use memory::{ThreatEvent, ThreatMemory, ThreatType};
pub use personality::PersonalityProfile;
pub use species::{SpeciesKnowledgeStore, SpeciesRecord, SCHEMA_VERSION};
