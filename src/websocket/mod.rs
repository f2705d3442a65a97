//! WebSocket endpoint for the multiplayer dungeon.
//!
//! Authenticates the connection from cookies, routes it to a game (explicit
//! id, the profile's current game, or auto-join), then dispatches client
//! messages into game operations.
//!
//! Architecture per connection:
//! - Split socket into sender and receiver
//! - An mpsc channel feeds a writer task, so every message to one client is
//!   serialized through a single sender
//! - The game holds a clone of the channel for broadcasts
//! - On disconnect: flee the current fight, notify, drop the connection

pub mod protocol;

use std::borrow::Cow;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use crate::auth::{parse_cookies, AuthError};
use crate::game::{Game, InteractOutcome};
use crate::AppState;
use protocol::ClientMessage;

/// A client that never sends its first frame is dropped after this long.
const INITIAL_FRAME_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub game_id: Option<String>,
}

/// WebSocket upgrade handler for `/ws`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let cookie_header = headers
        .get(axum::http::header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.game_id, cookie_header))
}

async fn reject(mut socket: WebSocket, error: AuthError) {
    let _ = socket
        .send(Message::Text(
            json!({"type": "error", "message": error.to_string()}).to_string(),
        ))
        .await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: error.close_code(),
            reason: Cow::Owned(error.to_string()),
        })))
        .await;
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    game_id: Option<String>,
    cookie_header: String,
) {
    let cookies = parse_cookies(&cookie_header);

    // Authenticate: a valid access-token session whose user owns the
    // selected player profile.
    let access_token = cookies
        .get(&state.config.auth.access_cookie)
        .cloned()
        .unwrap_or_default();
    let user_id = match state.auth.validate_access_token(&access_token).await {
        Ok(user_id) => user_id,
        Err(error) => {
            reject(socket, error).await;
            return;
        }
    };

    let Some(player_token) = cookies.get(&state.config.auth.profile_cookie).cloned() else {
        reject(socket, AuthError::MissingProfile).await;
        return;
    };
    let profile = match state.players.get(&player_token).await {
        Some(profile) => profile,
        None => {
            reject(socket, AuthError::ProfileNotFound).await;
            return;
        }
    };
    if profile.user_id != user_id {
        reject(socket, AuthError::ProfileUserMismatch).await;
        return;
    }

    // Route to a game: explicit id, the profile's current game, or auto-join
    let mut game: Option<Arc<Game>> = match &game_id {
        Some(id) => state.games.get_game(id).await,
        None => match &profile.current_game_id {
            Some(id) => state.games.get_game(id).await,
            None => None,
        },
    };
    if game.is_none() {
        let joined = state.games.get_or_create_joinable_game().await;
        state
            .games
            .assign_player_to_game(&player_token, &joined.game_id)
            .await;
        game = Some(joined);
    }
    let Some(game) = game else {
        reject_unavailable(socket).await;
        return;
    };

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // First frame may carry reconnect info. A silent client is bounded by a
    // server-side deadline instead of stalling forever.
    let existing_player_id = match timeout(INITIAL_FRAME_DEADLINE, ws_receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => match ClientMessage::parse(&text) {
            Some(ClientMessage::Reconnect { player_id }) => player_id,
            _ => None,
        },
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Err(_) => {
            let _ = ws_sender.send(Message::Close(None)).await;
            return;
        }
        Ok(Some(Ok(_))) => None,
        Ok(Some(Err(_))) => return,
    };

    // Writer task: everything the game or this handler sends goes through
    // one channel, keeping per-client message order.
    // Buffer size 32: enough for a burst of combat updates without blocking.
    let (tx, mut rx) = mpsc::channel::<String>(32);
    let mut send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let (player_id, is_reconnection) = game
        .add_player(tx.clone(), &player_token, existing_player_id.as_deref())
        .await;
    state
        .players
        .update_player_game(&player_token, Some(game.game_id.clone()), Some(player_id.clone()))
        .await;

    game.send_welcome(&player_id, is_reconnection).await;
    if !is_reconnection {
        game.broadcast_player_joined(&player_id).await;
        if let Some(room_info) = game.player_room_info(&player_id).await {
            game.send_room_entered(&player_id, room_info).await;
        }
    }
    game.broadcast_state().await;

    let mut recv_task = {
        let game = Arc::clone(&game);
        let player_id = player_id.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            run_message_loop(&mut ws_receiver, &game, &player_id, &tx).await;
        })
    };

    // Either task finishing means the connection is gone
    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }

    // Disconnect: flee the current fight, tell the room, drop the player
    if let Some(fight_id) = game.fight_for_player(&player_id).await {
        let _ = game.flee_fight(&player_id, &fight_id).await;
    }
    game.broadcast_player_left(&player_id).await;
    game.remove_player(&player_id, false).await;
    game.broadcast_state().await;
    tracing::info!(game_id = %game.game_id, player_id = %player_id, "connection closed");
}

async fn reject_unavailable(mut socket: WebSocket) {
    let _ = socket
        .send(Message::Text(
            json!({"type": "error", "message": "No game available"}).to_string(),
        ))
        .await;
    let _ = socket.send(Message::Close(None)).await;
}

async fn run_message_loop(
    ws_receiver: &mut SplitStream<WebSocket>,
    game: &Arc<Game>,
    player_id: &str,
    tx: &mpsc::Sender<String>,
) {
    while let Some(frame) = ws_receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(error = %e, "websocket receive error");
                break;
            }
        };
        let Some(message) = ClientMessage::parse(&text) else {
            continue;
        };
        dispatch_message(message, game, player_id, tx).await;
    }
}

async fn send_json(tx: &mpsc::Sender<String>, payload: serde_json::Value) {
    let _ = tx.send(payload.to_string()).await;
}

async fn send_error(tx: &mpsc::Sender<String>, message: &str) {
    send_json(tx, json!({"type": "error", "message": message})).await;
}

async fn dispatch_message(
    message: ClientMessage,
    game: &Arc<Game>,
    player_id: &str,
    tx: &mpsc::Sender<String>,
) {
    match message {
        ClientMessage::Move { dx, dy } => {
            // No walking away mid-fight
            if game.is_player_in_fight(player_id).await {
                return;
            }
            let outcome = game.move_player(player_id, dx, dy).await;
            if outcome.success {
                if let Some(room_info) = outcome.room_entered {
                    game.send_room_entered(player_id, room_info).await;
                }
                game.broadcast_state().await;
            }
        }

        ClientMessage::Interact {} => match game.interact(player_id).await {
            InteractOutcome::FightRequest {
                monster_id,
                monster,
            } => {
                send_json(
                    tx,
                    json!({
                        "type": "fight_request",
                        "monster": monster,
                        "monster_id": monster_id,
                    }),
                )
                .await;
            }
            InteractOutcome::CanJoinFight {
                fight_id,
                fight,
                monster,
            } => {
                send_json(
                    tx,
                    json!({
                        "type": "can_join_fight",
                        "fight_id": fight_id,
                        "fight": fight,
                        "monster": monster,
                    }),
                )
                .await;
            }
            InteractOutcome::AlreadyInFight => {
                send_error(tx, "Already in fight").await;
            }
            InteractOutcome::DoorToggled { .. } => {
                game.broadcast_state().await;
            }
            InteractOutcome::Nothing => {}
        },

        ClientMessage::RequestFight { monster_id } => {
            if let Err(error) = game.start_fight(player_id, &monster_id).await {
                send_error(tx, error).await;
            }
        }

        ClientMessage::JoinFight { fight_id } => {
            if let Err(error) = game.join_fight(player_id, &fight_id).await {
                send_error(tx, error).await;
            }
        }

        ClientMessage::DeclineFight {} => {
            send_json(tx, json!({"type": "fight_declined"})).await;
        }

        ClientMessage::FleeFight { fight_id } => {
            // Always confirm fight_left so the client UI can reset, even
            // when the fight is already gone
            send_json(tx, json!({"type": "fight_left", "fight_id": fight_id})).await;
            if let Some(fight_id) = fight_id {
                if let Err(error) = game.flee_fight(player_id, &fight_id).await {
                    tracing::debug!(player_id, error, "flee rejected");
                }
            }
        }

        ClientMessage::CombatAction { fight_id, action } => {
            if let Err(error) = game.process_combat_action(player_id, &fight_id, &action).await {
                send_error(tx, error).await;
            }
        }

        ClientMessage::Ping {} => {
            send_json(tx, json!({"type": "pong"})).await;
        }

        // Reconnect is only meaningful as the first frame
        ClientMessage::Reconnect { .. } => {}
    }
}
