//! Static species definitions and spawn tables.
//!
//! Every monster of a species shares the same base stats, personality, and
//! learning configuration; individual state (HP, memory, position) is per
//! instance.

use crate::domain::{MonsterBehavior, MonsterStats};
use crate::intelligence::{PersonalityProfile, QLearningConfig};

pub struct SpeciesDef {
    pub monster_type: &'static str,
    pub name: &'static str,
    pub symbol: &'static str,
    pub color: &'static str,
    pub description: &'static str,
    pub behavior: MonsterBehavior,
    pub hp: i32,
    pub ac: i32,
    pub strength: i32,
    pub dexterity: i32,
    pub constitution: i32,
    pub intelligence: i32,
    pub wisdom: i32,
    pub charisma: i32,
    pub speed: i32,
    pub challenge_rating: f32,
    pub personality: PersonalityProfile,
    pub learning: QLearningConfig,
    pub memory_capacity: usize,
    pub memory_decay: f32,
    pub decision_cooldown_ticks: u32,
}

impl SpeciesDef {
    pub fn stats(&self) -> MonsterStats {
        MonsterStats {
            hp: self.hp,
            max_hp: self.hp,
            ac: self.ac,
            strength: self.strength,
            dexterity: self.dexterity,
            constitution: self.constitution,
            intelligence: self.intelligence,
            wisdom: self.wisdom,
            charisma: self.charisma,
            speed: self.speed,
            challenge_rating: self.challenge_rating,
        }
    }
}

const DEFAULT_LEARNING: QLearningConfig = QLearningConfig::new(0.1, 0.95, 0.3, 0.05, 0.995);

pub const SPECIES: [SpeciesDef; 10] = [
    SpeciesDef {
        monster_type: "cave_bat",
        name: "Cave Bat",
        symbol: "b",
        color: "#96a",
        description: "A twitchy bat that startles at footsteps.",
        behavior: MonsterBehavior::Wander,
        hp: 2,
        ac: 12,
        strength: 2,
        dexterity: 16,
        constitution: 8,
        intelligence: 2,
        wisdom: 12,
        charisma: 4,
        speed: 30,
        challenge_rating: 0.0,
        personality: PersonalityProfile::new(0.2, 0.8, 0.2, 0.5, 0.9),
        learning: QLearningConfig::new(0.1, 0.9, 0.4, 0.05, 0.995),
        memory_capacity: 3,
        memory_decay: 0.1,
        decision_cooldown_ticks: 1,
    },
    SpeciesDef {
        monster_type: "giant_rat",
        name: "Giant Rat",
        symbol: "r",
        color: "#a86",
        description: "A mangy rat the size of a dog.",
        behavior: MonsterBehavior::Patrol,
        hp: 7,
        ac: 12,
        strength: 7,
        dexterity: 15,
        constitution: 11,
        intelligence: 2,
        wisdom: 10,
        charisma: 4,
        speed: 30,
        challenge_rating: 0.125,
        personality: PersonalityProfile::new(0.4, 0.6, 0.3, 0.7, 0.7),
        learning: DEFAULT_LEARNING,
        memory_capacity: 4,
        memory_decay: 0.08,
        decision_cooldown_ticks: 2,
    },
    SpeciesDef {
        monster_type: "goblin",
        name: "Goblin",
        symbol: "g",
        color: "#5c2",
        description: "A sneering goblin clutching a rusty blade.",
        behavior: MonsterBehavior::Patrol,
        hp: 10,
        ac: 12,
        strength: 8,
        dexterity: 14,
        constitution: 10,
        intelligence: 10,
        wisdom: 8,
        charisma: 8,
        speed: 30,
        challenge_rating: 0.25,
        personality: PersonalityProfile::new(0.6, 0.4, 0.6, 0.7, 0.6),
        learning: DEFAULT_LEARNING,
        memory_capacity: 5,
        memory_decay: 0.05,
        decision_cooldown_ticks: 2,
    },
    SpeciesDef {
        monster_type: "skeleton",
        name: "Skeleton",
        symbol: "s",
        color: "#eee",
        description: "Animated bones that rattle with every step.",
        behavior: MonsterBehavior::Patrol,
        hp: 13,
        ac: 13,
        strength: 10,
        dexterity: 14,
        constitution: 15,
        intelligence: 6,
        wisdom: 8,
        charisma: 5,
        speed: 30,
        challenge_rating: 0.25,
        personality: PersonalityProfile::new(0.7, 0.2, 0.3, 0.3, 0.5),
        learning: DEFAULT_LEARNING,
        memory_capacity: 3,
        memory_decay: 0.05,
        decision_cooldown_ticks: 2,
    },
    SpeciesDef {
        monster_type: "cultist",
        name: "Cultist",
        symbol: "c",
        color: "#b3c",
        description: "A robed figure murmuring to something unseen.",
        behavior: MonsterBehavior::Ritual,
        hp: 9,
        ac: 12,
        strength: 11,
        dexterity: 12,
        constitution: 10,
        intelligence: 10,
        wisdom: 11,
        charisma: 10,
        speed: 30,
        challenge_rating: 0.25,
        personality: PersonalityProfile::new(0.5, 0.5, 0.7, 0.6, 0.3),
        learning: DEFAULT_LEARNING,
        memory_capacity: 5,
        memory_decay: 0.04,
        decision_cooldown_ticks: 2,
    },
    SpeciesDef {
        monster_type: "orc",
        name: "Orc",
        symbol: "o",
        color: "#473",
        description: "A scarred orc looking for a fight.",
        behavior: MonsterBehavior::Aggressive,
        hp: 15,
        ac: 13,
        strength: 16,
        dexterity: 12,
        constitution: 16,
        intelligence: 7,
        wisdom: 11,
        charisma: 10,
        speed: 30,
        challenge_rating: 0.5,
        personality: PersonalityProfile::new(0.9, 0.2, 0.3, 0.5, 0.4),
        learning: QLearningConfig::new(0.15, 0.95, 0.3, 0.05, 0.995),
        memory_capacity: 5,
        memory_decay: 0.05,
        decision_cooldown_ticks: 2,
    },
    SpeciesDef {
        monster_type: "giant_spider",
        name: "Giant Spider",
        symbol: "S",
        color: "#333",
        description: "A bloated spider lurking in the shadows.",
        behavior: MonsterBehavior::Ambush,
        hp: 26,
        ac: 14,
        strength: 14,
        dexterity: 16,
        constitution: 12,
        intelligence: 2,
        wisdom: 11,
        charisma: 4,
        speed: 30,
        challenge_rating: 1.0,
        personality: PersonalityProfile::new(0.6, 0.4, 0.8, 0.2, 0.3),
        learning: DEFAULT_LEARNING,
        memory_capacity: 4,
        memory_decay: 0.06,
        decision_cooldown_ticks: 3,
    },
    SpeciesDef {
        monster_type: "ghost",
        name: "Ghost",
        symbol: "G",
        color: "#acf",
        description: "A translucent figure drifting through the gloom.",
        behavior: MonsterBehavior::Haunt,
        hp: 22,
        ac: 11,
        strength: 7,
        dexterity: 13,
        constitution: 10,
        intelligence: 10,
        wisdom: 12,
        charisma: 17,
        speed: 40,
        challenge_rating: 1.0,
        personality: PersonalityProfile::new(0.4, 0.5, 0.7, 0.1, 0.7),
        learning: QLearningConfig::new(0.08, 0.97, 0.35, 0.05, 0.995),
        memory_capacity: 7,
        memory_decay: 0.03,
        decision_cooldown_ticks: 2,
    },
    SpeciesDef {
        monster_type: "mimic",
        name: "Mimic",
        symbol: "M",
        color: "#a83",
        description: "That chest has teeth.",
        behavior: MonsterBehavior::Static,
        hp: 30,
        ac: 12,
        strength: 17,
        dexterity: 12,
        constitution: 15,
        intelligence: 5,
        wisdom: 13,
        charisma: 8,
        speed: 15,
        challenge_rating: 2.0,
        personality: PersonalityProfile::new(0.7, 0.3, 0.9, 0.1, 0.1),
        learning: DEFAULT_LEARNING,
        memory_capacity: 4,
        memory_decay: 0.04,
        decision_cooldown_ticks: 3,
    },
    SpeciesDef {
        monster_type: "troll",
        name: "Troll",
        symbol: "T",
        color: "#385",
        description: "A hulking troll, knuckles dragging on stone.",
        behavior: MonsterBehavior::Wander,
        hp: 50,
        ac: 15,
        strength: 18,
        dexterity: 13,
        constitution: 20,
        intelligence: 7,
        wisdom: 9,
        charisma: 7,
        speed: 30,
        challenge_rating: 5.0,
        personality: PersonalityProfile::new(0.8, 0.3, 0.2, 0.2, 0.5),
        learning: QLearningConfig::new(0.08, 0.95, 0.25, 0.05, 0.995),
        memory_capacity: 5,
        memory_decay: 0.04,
        decision_cooldown_ticks: 3,
    },
];

pub fn species(monster_type: &str) -> Option<&'static SpeciesDef> {
    SPECIES.iter().find(|s| s.monster_type == monster_type)
}

/// Maximum monsters spawned per room.
pub const MAX_MONSTERS_PER_ROOM: usize = 2;

/// Minimum room area (in tiles) required for monster spawns.
pub const MIN_ROOM_AREA_FOR_SPAWN: i32 = 36;

/// Probability that a room of the given type spawns monsters on first visit.
pub fn spawn_chance(room_type: &str) -> f64 {
    match room_type {
        "armory" => 0.7,
        "guard_post" => 0.8,
        "throne_room" => 0.6,
        "chamber" => 0.5,
        "library" => 0.4,
        "bedroom" => 0.3,
        "storage" => 0.5,
        "dining_hall" => 0.4,
        "crypt" => 0.9,
        "treasury" => 0.7,
        "dungeon_cell" => 0.8,
        "alchemy_lab" => 0.6,
        _ => 0.5,
    }
}

const DEFAULT_WEIGHTS: [(&str, u32); 10] = [
    ("cave_bat", 5),
    ("giant_rat", 5),
    ("goblin", 5),
    ("skeleton", 5),
    ("cultist", 5),
    ("orc", 5),
    ("giant_spider", 5),
    ("ghost", 5),
    ("mimic", 5),
    ("troll", 5),
];

/// Weighted species table for a room type.
pub fn monster_weights(room_type: &str) -> &'static [(&'static str, u32)] {
    match room_type {
        "armory" => &[("goblin", 6), ("orc", 5), ("skeleton", 3)],
        "guard_post" => &[("goblin", 6), ("orc", 6), ("skeleton", 2)],
        "throne_room" => &[("orc", 5), ("cultist", 4), ("ghost", 2), ("troll", 1)],
        "chamber" => &[("goblin", 5), ("giant_rat", 4), ("cave_bat", 3)],
        "library" => &[("cultist", 5), ("ghost", 3), ("giant_rat", 2)],
        "bedroom" => &[("giant_rat", 4), ("cave_bat", 3), ("ghost", 2)],
        "storage" => &[("giant_rat", 6), ("cave_bat", 4), ("giant_spider", 3), ("mimic", 1)],
        "dining_hall" => &[("giant_rat", 5), ("goblin", 4), ("cave_bat", 2)],
        "crypt" => &[("skeleton", 8), ("ghost", 4), ("giant_rat", 2)],
        "treasury" => &[("mimic", 5), ("giant_spider", 3), ("skeleton", 3)],
        "dungeon_cell" => &[("skeleton", 5), ("giant_rat", 4), ("ghost", 2)],
        "alchemy_lab" => &[("cultist", 6), ("giant_spider", 3), ("cave_bat", 2)],
        _ => &DEFAULT_WEIGHTS,
    }
}
