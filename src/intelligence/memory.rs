//! Threat memory: a finite-capacity record of recent dangers with linear
//! decay over game ticks.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatType {
    Player,
    Trap,
    Environment,
    Unknown,
}

/// Single remembered threat entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatEvent {
    pub source_id: String,
    pub position: (i32, i32),
    pub intensity: f32,
    pub tick: u64,
    #[serde(default = "default_threat_type")]
    pub threat_type: ThreatType,
}

fn default_threat_type() -> ThreatType {
    ThreatType::Unknown
}

impl ThreatEvent {
    /// Linear decay by elapsed ticks; re-stamps the event at the current tick.
    pub fn decay(&mut self, current_tick: u64, rate: f32) {
        let delta = current_tick.saturating_sub(self.tick) as f32;
        self.intensity *= (1.0 - rate * delta).max(0.0);
        self.tick = current_tick;
    }
}

/// Finite-capacity memory storing recent dangers. Oldest entries are evicted
/// first; fully-decayed entries (intensity <= 0.05) are dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatMemory {
    pub capacity: usize,
    pub decay_rate: f32,
    #[serde(default)]
    pub events: Vec<ThreatEvent>,
    #[serde(default)]
    pub last_updated_tick: u64,
}

impl Default for ThreatMemory {
    fn default() -> Self {
        ThreatMemory::new(5, 0.05)
    }
}

impl ThreatMemory {
    pub fn new(capacity: usize, decay_rate: f32) -> Self {
        ThreatMemory {
            capacity,
            decay_rate,
            events: Vec::new(),
            last_updated_tick: 0,
        }
    }

    pub fn remember(&mut self, event: ThreatEvent) {
        if self.events.len() >= self.capacity {
            self.events.remove(0);
        }
        self.events.push(event);
    }

    /// Decay all events to the current tick, dropping the ones that faded.
    pub fn decay(&mut self, current_tick: u64) {
        if current_tick == self.last_updated_tick {
            return;
        }
        let rate = self.decay_rate;
        for event in &mut self.events {
            event.decay(current_tick, rate);
        }
        self.events.retain(|e| e.intensity > 0.05);
        self.last_updated_tick = current_tick;
    }

    #[allow(dead_code)]
    pub fn most_recent_threat(&self) -> Option<&ThreatEvent> {
        self.events.iter().max_by_key(|e| e.tick)
    }

    #[allow(dead_code)]
    pub fn strongest_threat(&self) -> Option<&ThreatEvent> {
        self.events
            .iter()
            .max_by(|a, b| a.intensity.total_cmp(&b.intensity))
    }

    /// Merge this memory into another at reduced intensity, enabling pack
    /// behavior when a monster calls allies.
    #[allow(dead_code)]
    pub fn share_with(&self, other: &mut ThreatMemory, blend: f32) {
        let blend = blend.clamp(0.0, 1.0);
        for event in &self.events {
            other.remember(ThreatEvent {
                source_id: event.source_id.clone(),
                position: event.position,
                intensity: event.intensity * blend,
                tick: event.tick,
                threat_type: event.threat_type,
            });
        }
    }
}
