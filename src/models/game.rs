use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Public view of one snake, as the client renders it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerData {
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub angle: f64,
    pub segments: Vec<Point>,
    pub kills: u32,
    pub is_alive: bool,
    pub color: u32,
    pub spawn_time: i64,
    pub is_invulnerable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Food {
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub color: u32,
    pub size: f64,
}

/// Full snapshot, sent only on join/resync.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStateView {
    pub players: Vec<PlayerData>,
    pub food: Vec<Food>,
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    pub time_remaining: u64,
}

/// Compact status block attached to incremental updates.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStatusView {
    pub is_active: bool,
    pub time_remaining: u64,
    pub alive_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LobbyPhase {
    Idle,
    Gathering,
    Waiting,
    Confirming,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbyStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lobby_id: Option<String>,
    pub players: usize,
    pub max_players: usize,
    pub time_remaining: u64,
    pub lobby_state: LobbyPhase,
    pub confirmed_count: usize,
}

impl LobbyStatus {
    /// The "not in any lobby" view; only ever sent to a single client.
    pub fn idle(max_players: usize) -> Self {
        Self {
            lobby_id: None,
            players: 0,
            max_players,
            time_remaining: 0,
            lobby_state: LobbyPhase::Idle,
            confirmed_count: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub player_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_name: Option<String>,
    pub wallet_address: String,
    pub kills: u32,
    pub is_alive: bool,
    pub survival_time_ms: u64,
    pub is_winner: bool,
    pub prize: String,
}
