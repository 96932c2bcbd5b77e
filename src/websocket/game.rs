use axum::{
    extract::{ws::{Message, WebSocket, WebSocketUpgrade}, State},
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, Duration};

use crate::{
    api::AppState,
    constants::{WS_CLIENT_TIMEOUT_SECS, WS_HEARTBEAT_INTERVAL_SECS},
    error::{AppError, Result},
    models::{ClientMessage, LobbyStatus, ServerMessage},
    services::{LobbyCommand, MatchCommand, Membership},
    utils::now_millis,
};

/// Game WebSocket: one connection is one player session.
pub async fn handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

fn decode(text: &str) -> Result<ClientMessage> {
    serde_json::from_str(text).map_err(|e| AppError::BadRequest(format!("Invalid message: {}", e)))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // The registry only keeps a weak handle; this connection owns the sender.
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let session_id = state.registry.connect(&tx).await;
    tracing::info!("WebSocket session {} opened", session_id);
    let _ = tx.send(ServerMessage::LobbyStatus(LobbyStatus::idle(
        state.lobby.capacity(),
    )));

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = interval(Duration::from_secs(WS_HEARTBEAT_INTERVAL_SECS));

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                outbound = rx.recv() => {
                    let Some(message) = outbound else { break };
                    let json = match serde_json::to_string(&message) {
                        Ok(json) => json,
                        Err(err) => {
                            tracing::error!("Failed to encode {}: {}", message.kind(), err);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let recv_state = state.clone();
    let recv_session = session_id.clone();
    let mut recv_task = tokio::spawn(async move {
        loop {
            let next_msg = timeout(Duration::from_secs(WS_CLIENT_TIMEOUT_SECS), receiver.next()).await;
            let msg = match next_msg {
                Ok(Some(Ok(msg))) => msg,
                Ok(Some(Err(_))) | Ok(None) => break,
                Err(_) => {
                    tracing::info!("WebSocket client {} timed out", recv_session);
                    break;
                }
            };

            match msg {
                Message::Text(text) => {
                    let result = match decode(text.as_str()) {
                        Ok(message) => dispatch(&recv_state, &recv_session, &tx, message).await,
                        Err(err) => Err(err),
                    };
                    if let Err(err) = result {
                        tracing::debug!("Rejected frame from {}: {}", recv_session, err);
                        let _ = tx.send(ServerMessage::error(&err));
                    }
                }
                Message::Close(_) => {
                    tracing::info!("Client {} closed the connection", recv_session);
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        }
        _ = &mut recv_task => {
            send_task.abort();
        }
    }

    disconnect(&state, &session_id).await;
    tracing::info!("WebSocket session {} closed", session_id);
}

/// Routes one client frame to the lobby actor or the session's match.
async fn dispatch(
    state: &AppState,
    session_id: &str,
    tx: &mpsc::UnboundedSender<ServerMessage>,
    message: ClientMessage,
) -> Result<()> {
    let session_id = session_id.to_string();
    match message {
        ClientMessage::JoinLobby { player_data } => state.lobby.send(LobbyCommand::Join {
            session_id,
            player: player_data,
        }),
        ClientMessage::LeaveLobby => state.lobby.send(LobbyCommand::Leave { session_id }),
        ClientMessage::ConfirmJoin => state.lobby.send(LobbyCommand::Confirm { session_id }),
        ClientMessage::PlayerUpdate { player_data } => {
            // Late updates after a match ends are normal; drop them quietly.
            if let Some(match_id) = current_match(state, &session_id).await {
                state
                    .matches
                    .send(
                        &match_id,
                        MatchCommand::Update {
                            session_id,
                            data: player_data,
                        },
                    )
                    .await;
            }
            Ok(())
        }
        ClientMessage::PlayerKill { victim_id } => {
            let match_id = current_match(state, &session_id)
                .await
                .ok_or_else(|| AppError::InvalidState("You are not in a match".to_string()))?;
            state
                .matches
                .send(
                    &match_id,
                    MatchCommand::Kill {
                        session_id,
                        victim_id,
                    },
                )
                .await;
            Ok(())
        }
        ClientMessage::Ping { timestamp } => {
            let _ = tx.send(ServerMessage::Pong {
                timestamp,
                server_time: now_millis(),
            });
            Ok(())
        }
    }
}

async fn current_match(state: &AppState, session_id: &str) -> Option<String> {
    match state.registry.get(session_id).await?.membership {
        Membership::Match(match_id) => Some(match_id),
        _ => None,
    }
}

/// A lost connection counts as leaving whatever the session was part of.
async fn disconnect(state: &AppState, session_id: &str) {
    match state.registry.disconnect(session_id).await {
        Some(Membership::Match(match_id)) => {
            state
                .matches
                .send(
                    &match_id,
                    MatchCommand::Disconnect {
                        session_id: session_id.to_string(),
                    },
                )
                .await;
        }
        // Idle sessions may still have a join in flight.
        Some(_) => {
            let _ = state.lobby.send(LobbyCommand::Disconnect {
                session_id: session_id.to_string(),
            });
        }
        None => {}
    }
}
