//! Client-to-server message types for the game WebSocket.
//!
//! Server-to-client messages are assembled with `serde_json::json!` at the
//! call sites, mirroring their per-message shapes.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First frame only: reuse an existing in-game player id.
    Reconnect {
        #[serde(default)]
        player_id: Option<String>,
    },
    Move {
        #[serde(default)]
        dx: i32,
        #[serde(default)]
        dy: i32,
    },
    Interact {},
    RequestFight {
        monster_id: String,
    },
    JoinFight {
        fight_id: String,
    },
    DeclineFight {},
    FleeFight {
        #[serde(default)]
        fight_id: Option<String>,
    },
    CombatAction {
        fight_id: String,
        action: String,
    },
    Ping {},
}

impl ClientMessage {
    pub fn parse(text: &str) -> Option<ClientMessage> {
        serde_json::from_str(text).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_move() {
        let msg = ClientMessage::parse(r#"{"type":"move","dx":1,"dy":0}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Move { dx: 1, dy: 0 }));
    }

    #[test]
    fn test_parse_reconnect_without_player_id() {
        let msg = ClientMessage::parse(r#"{"type":"reconnect"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Reconnect { player_id: None }));
    }

    #[test]
    fn test_parse_combat_action() {
        let msg =
            ClientMessage::parse(r#"{"type":"combat_action","fight_id":"f1","action":"attack"}"#)
                .unwrap();
        match msg {
            ClientMessage::CombatAction { fight_id, action } => {
                assert_eq!(fight_id, "f1");
                assert_eq!(action, "attack");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(ClientMessage::parse(r#"{"type":"teleport"}"#).is_none());
        assert!(ClientMessage::parse("not json").is_none());
    }
}
