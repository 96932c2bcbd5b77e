//! JSON wire protocol. Every frame is an object whose `type` field selects the variant.

use serde::{Deserialize, Serialize};

use super::game::{
    Food, GameStateView, GameStatusView, LeaderboardEntry, LobbyStatus, PlayerData,
};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JoinPlayerData {
    pub wallet_address: Option<String>,
    pub player_name: Option<String>,
    pub color: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdateData {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub angle: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    JoinLobby {
        #[serde(rename = "playerData", default)]
        player_data: JoinPlayerData,
    },
    LeaveLobby,
    ConfirmJoin,
    PlayerUpdate {
        #[serde(rename = "playerData")]
        player_data: PlayerUpdateData,
    },
    PlayerKill {
        #[serde(rename = "victimId")]
        victim_id: String,
    },
    Ping {
        #[serde(default)]
        timestamp: Option<i64>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStateUpdate {
    pub prize_pool: String,
    pub players: Vec<PlayerData>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub food_spawned: Vec<Food>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub food_eaten: Vec<String>,
    pub connected_count: usize,
    pub game_state: GameStatusView,
}

impl GameStateUpdate {
    pub fn is_empty(&self) -> bool {
        self.players.is_empty() && self.food_spawned.is_empty() && self.food_eaten.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameEndedPayload {
    pub final_leaderboard: Vec<LeaderboardEntry>,
    pub players: Vec<PlayerData>,
    pub prize_pool: String,
    pub game_state: GameStatusView,
    pub survivors: Vec<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    GameJoined {
        #[serde(rename = "playerId")]
        player_id: String,
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "gameState")]
        game_state: GameStateView,
    },
    LobbyStatus(LobbyStatus),
    LobbyUpdate(LobbyStatus),
    MatchStarting {
        message: String,
        #[serde(rename = "timeRemaining")]
        time_remaining: u64,
    },
    GameStarted {
        #[serde(rename = "matchId")]
        match_id: String,
    },
    GameStateUpdate(GameStateUpdate),
    TimerUpdate {
        #[serde(rename = "elapsedTime")]
        elapsed_time: u64,
        #[serde(rename = "timeRemaining")]
        time_remaining: u64,
    },
    PlayerKilled {
        #[serde(rename = "killerId")]
        killer_id: String,
        #[serde(rename = "victimId")]
        victim_id: String,
        #[serde(rename = "gameState")]
        game_state: GameStatusView,
        message: String,
    },
    GameEnded(GameEndedPayload),
    LifeRefunded {
        message: String,
    },
    MatchCanceled {
        message: String,
    },
    MatchFailed {
        message: String,
    },
    PlayerJoined {
        player: PlayerData,
    },
    PlayerLeft {
        #[serde(rename = "playerId")]
        player_id: String,
    },
    Error {
        code: String,
        message: String,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
        #[serde(rename = "serverTime")]
        server_time: i64,
    },
}

impl ServerMessage {
    pub fn error(err: &crate::error::AppError) -> Self {
        ServerMessage::Error {
            code: err.code().to_string(),
            message: err.client_message(),
        }
    }

    /// Wire name of the variant, handy for logs and assertions.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::GameJoined { .. } => "GAME_JOINED",
            ServerMessage::LobbyStatus(_) => "LOBBY_STATUS",
            ServerMessage::LobbyUpdate(_) => "LOBBY_UPDATE",
            ServerMessage::MatchStarting { .. } => "MATCH_STARTING",
            ServerMessage::GameStarted { .. } => "GAME_STARTED",
            ServerMessage::GameStateUpdate(_) => "GAME_STATE_UPDATE",
            ServerMessage::TimerUpdate { .. } => "TIMER_UPDATE",
            ServerMessage::PlayerKilled { .. } => "PLAYER_KILLED",
            ServerMessage::GameEnded(_) => "GAME_ENDED",
            ServerMessage::LifeRefunded { .. } => "LIFE_REFUNDED",
            ServerMessage::MatchCanceled { .. } => "MATCH_CANCELED",
            ServerMessage::MatchFailed { .. } => "MATCH_FAILED",
            ServerMessage::PlayerJoined { .. } => "PLAYER_JOINED",
            ServerMessage::PlayerLeft { .. } => "PLAYER_LEFT",
            ServerMessage::Error { .. } => "ERROR",
            ServerMessage::Pong { .. } => "PONG",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::game::LobbyPhase;

    #[test]
    fn join_lobby_parses_wallet_from_player_data() {
        let raw = r#"{"type":"JOIN_LOBBY","playerData":{"walletAddress":"0xabc","playerName":"worm"}}"#;
        match serde_json::from_str::<ClientMessage>(raw).unwrap() {
            ClientMessage::JoinLobby { player_data } => {
                assert_eq!(player_data.wallet_address.as_deref(), Some("0xabc"));
                assert_eq!(player_data.player_name.as_deref(), Some("worm"));
                assert!(player_data.color.is_none());
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn unit_variants_need_only_type() {
        let leave = serde_json::from_str::<ClientMessage>(r#"{"type":"LEAVE_LOBBY"}"#).unwrap();
        assert!(matches!(leave, ClientMessage::LeaveLobby));
        let ping = serde_json::from_str::<ClientMessage>(r#"{"type":"PING"}"#).unwrap();
        assert!(matches!(ping, ClientMessage::Ping { timestamp: None }));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"JOIN_GAME"}"#).is_err());
    }

    #[test]
    fn lobby_update_flattens_status_fields() {
        let msg = ServerMessage::LobbyUpdate(LobbyStatus {
            lobby_id: Some("l_1".into()),
            players: 2,
            max_players: 30,
            time_remaining: 1500,
            lobby_state: LobbyPhase::Waiting,
            confirmed_count: 0,
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "LOBBY_UPDATE");
        assert_eq!(json["maxPlayers"], 30);
        assert_eq!(json["lobbyState"], "waiting");
        assert_eq!(json["timeRemaining"], 1500);
    }

    #[test]
    fn player_killed_uses_camel_case_ids() {
        let msg = ServerMessage::PlayerKilled {
            killer_id: "a".into(),
            victim_id: "b".into(),
            game_state: GameStatusView {
                is_active: true,
                time_remaining: 10,
                alive_count: 1,
            },
            message: "a killed b".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "PLAYER_KILLED");
        assert_eq!(json["killerId"], "a");
        assert_eq!(json["gameState"]["aliveCount"], 1);
        assert_eq!(msg.kind(), "PLAYER_KILLED");
    }
}
