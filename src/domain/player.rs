//! Player entity.

use serde::{Deserialize, Serialize};

use super::now_secs;

/// Calculate a D&D ability modifier: `(stat - 10) // 2` with floor division.
pub fn ability_modifier(stat: i32) -> i32 {
    (stat - 10).div_euclid(2)
}

/// A player inside a single game instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Player {
    pub id: String,
    pub x: i32,
    pub y: i32,
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default)]
    pub current_room_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_hp")]
    pub hp: i32,
    #[serde(default = "default_hp")]
    pub max_hp: i32,
    #[serde(default = "default_ac")]
    pub ac: i32,

    // Ability scores. Serialized under the classic short names.
    #[serde(rename = "str", default = "default_ability")]
    pub strength: i32,
    #[serde(rename = "dex", default = "default_ability")]
    pub dexterity: i32,
    #[serde(rename = "con", default = "default_ability")]
    pub constitution: i32,

    #[serde(default = "default_damage_dice")]
    pub damage_dice: String,

    /// Bonus AC until the player's next turn.
    #[serde(default)]
    pub is_defending: bool,

    /// Unix timestamp until which the player cannot be auto-engaged.
    #[serde(default)]
    pub fight_immunity_until: f64,
}

fn default_symbol() -> String {
    "@".to_string()
}

fn default_color() -> String {
    "#ff0".to_string()
}

fn default_hp() -> i32 {
    30
}

fn default_ac() -> i32 {
    12
}

fn default_ability() -> i32 {
    12
}

fn default_damage_dice() -> String {
    "1d6".to_string()
}

impl Player {
    pub fn new(id: String, x: i32, y: i32, color: String, current_room_id: Option<String>) -> Self {
        Player {
            id,
            x,
            y,
            symbol: default_symbol(),
            color,
            current_room_id,
            name: None,
            hp: default_hp(),
            max_hp: default_hp(),
            ac: default_ac(),
            strength: default_ability(),
            dexterity: default_ability(),
            constitution: default_ability(),
            damage_dice: default_damage_dice(),
            is_defending: false,
            fight_immunity_until: 0.0,
        }
    }

    pub fn str_mod(&self) -> i32 {
        ability_modifier(self.strength)
    }

    pub fn dex_mod(&self) -> i32 {
        ability_modifier(self.dexterity)
    }

    pub fn con_mod(&self) -> i32 {
        ability_modifier(self.constitution)
    }

    /// AC including the defending bonus.
    pub fn effective_ac(&self) -> i32 {
        self.ac + if self.is_defending { 2 } else { 0 }
    }

    pub fn is_alive(&self) -> bool {
        self.hp > 0
    }

    pub fn position(&self) -> (i32, i32) {
        (self.x, self.y)
    }

    /// Apply damage, clamped so HP never goes below zero. Returns the damage
    /// actually taken.
    pub fn take_damage(&mut self, amount: i32) -> i32 {
        let actual = amount.min(self.hp).max(0);
        self.hp -= actual;
        actual
    }

    /// Heal, clamped at max HP. Returns the amount actually healed.
    pub fn heal(&mut self, amount: i32) -> i32 {
        let actual = amount.min(self.max_hp - self.hp).max(0);
        self.hp += actual;
        actual
    }

    /// Respawn at the given position with full HP.
    pub fn respawn(&mut self, x: i32, y: i32) {
        self.x = x;
        self.y = y;
        self.hp = self.max_hp;
        self.is_defending = false;
        self.current_room_id = None;
    }

    pub fn has_fight_immunity(&self) -> bool {
        now_secs() < self.fight_immunity_until
    }

    /// Grant a short window during which monsters will not auto-engage.
    pub fn grant_fight_immunity(&mut self) {
        self.grant_fight_immunity_for(2.0);
    }

    pub fn grant_fight_immunity_for(&mut self, duration: f64) {
        self.fight_immunity_until = now_secs() + duration;
    }

    /// Full player payload for clients, including derived fields.
    pub fn to_payload(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(map) = value.as_object_mut() {
            map.insert("effective_ac".into(), serde_json::json!(self.effective_ac()));
            map.insert("str_mod".into(), serde_json::json!(self.str_mod()));
            map.insert("dex_mod".into(), serde_json::json!(self.dex_mod()));
            map.insert("con_mod".into(), serde_json::json!(self.con_mod()));
        }
        value
    }
}
