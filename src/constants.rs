/// Application constants

// API version
pub const API_VERSION: &str = "v1";

// WebSocket configuration
pub const WS_HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const WS_CLIENT_TIMEOUT_SECS: u64 = 60;

// Lobby defaults
pub const DEFAULT_LOBBY_CAPACITY: usize = 30;
pub const DEFAULT_LOBBY_MIN_TO_START: usize = 2;
pub const DEFAULT_LOBBY_WAIT_SECS: u64 = 30;
pub const DEFAULT_LOBBY_CONFIRM_SECS: u64 = 15;

// Match defaults
pub const DEFAULT_MATCH_DURATION_SECS: u64 = 300; // 5 minutes
pub const DEFAULT_MATCH_TICK_MS: u64 = 100;
pub const DEFAULT_INVULNERABILITY_SECS: u64 = 20;
pub const DEFAULT_ARENA_WIDTH: f64 = 4000.0;
pub const DEFAULT_ARENA_HEIGHT: f64 = 4000.0;
pub const ARENA_SPAWN_MARGIN: f64 = 100.0;
pub const TIMER_UPDATE_INTERVAL_MS: u64 = 1_000;

// Arena rules
pub const INITIAL_SEGMENTS: usize = 5;
pub const SEGMENT_SPACING: f64 = 12.0;
pub const MAX_SEGMENTS: usize = 500;
pub const MAX_SPEED_PER_SEC: f64 = 400.0; // boost speed, pixels per second
pub const MOVE_TOLERANCE: f64 = 1.5;
pub const EAT_RADIUS: f64 = 24.0;
pub const KILL_RADIUS: f64 = 30.0;
pub const FOOD_TARGET: usize = 300;
pub const FOOD_SPAWN_PER_TICK: usize = 10;
pub const MAX_DROPPED_FOOD: usize = 20;

// Settlement defaults
pub const DEFAULT_WINNER_COUNT: usize = 3;
pub const DEFAULT_PRIZE_SPLIT_BPS: [u32; 3] = [5_000, 3_000, 2_000];
pub const BPS_DENOMINATOR: u32 = 10_000;
pub const DEFAULT_SETTLEMENT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_SETTLEMENT_BACKOFF_MS: u64 = 500;
pub const SETTLEMENT_BACKOFF_MAX_MS: u64 = 30_000;

// Ledger defaults
pub const DEFAULT_CHAIN_ID: u64 = 57_054; // Sonic Blaze testnet
pub const DEFAULT_TX_CONFIRMATIONS: usize = 1;
pub const DEFAULT_TX_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_SIM_STARTING_LIVES: u64 = 3;
pub const DEFAULT_SIM_PRIZE_POOL_ETHER: &str = "10";

// Background service intervals
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_RECONCILE_SCAN_LIMIT: u64 = 500;
