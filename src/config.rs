use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::constants::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum LedgerMode {
    Evm,
    Simulated,
}

impl LedgerMode {
    fn parse(raw: &str) -> anyhow::Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "evm" | "onchain" => Ok(Self::Evm),
            "simulated" | "sim" | "memory" => Ok(Self::Simulated),
            other => anyhow::bail!("Unknown LEDGER_MODE '{}'", other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Evm => "evm",
            Self::Simulated => "simulated",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // Server
    pub host: String,
    pub port: u16,
    pub environment: String,

    // Ledger
    pub ledger_mode: LedgerMode,
    pub rpc_url: Option<String>,
    pub chain_id: u64,
    pub game_contract_address: Option<String>,
    pub operator_private_key: Option<String>,
    pub tx_confirmations: usize,
    pub tx_timeout_secs: u64,
    pub sim_starting_lives: u64,
    pub sim_prize_pool_ether: String,

    // Lobby
    pub lobby_capacity: usize,
    pub lobby_min_to_start: usize,
    pub lobby_wait_secs: u64,
    pub lobby_confirm_secs: u64,

    // Match
    pub match_duration_secs: u64,
    pub match_tick_ms: u64,
    pub invulnerability_secs: u64,
    pub arena_width: f64,
    pub arena_height: f64,

    // Settlement
    pub winner_count: usize,
    pub prize_split_bps: Vec<u32>,
    pub prize_pool_share_bps: u32,
    pub settlement_max_attempts: u32,
    pub settlement_backoff_ms: u64,

    // Reconciliation
    pub reconcile_interval_secs: u64,
    pub reconcile_scan_limit: u64,

    // Admin
    pub admin_key: Option<String>,

    // CORS
    pub cors_allowed_origins: String,
}

#[derive(Debug, Clone)]
pub struct LobbySettings {
    pub capacity: usize,
    pub min_to_start: usize,
    pub wait_window: Duration,
    pub confirm_window: Duration,
}

#[derive(Debug, Clone)]
pub struct MatchSettings {
    pub duration: Duration,
    pub tick: Duration,
    pub invulnerability: Duration,
    pub arena_width: f64,
    pub arena_height: f64,
}

#[derive(Debug, Clone)]
pub struct SettlementSettings {
    pub winner_count: usize,
    pub prize_split_bps: Vec<u32>,
    pub prize_pool_share_bps: u32,
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

#[derive(Debug, Clone)]
pub struct LedgerSettings {
    pub confirmations: usize,
    pub tx_timeout: Duration,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Invalid {}: {}", name, e)),
        _ => Ok(default),
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parses a comma separated list of basis points, e.g. `5000,3000,2000`.
pub fn parse_bps_list(raw: &str) -> anyhow::Result<Vec<u32>> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u32>()
                .map_err(|e| anyhow::anyhow!("Invalid basis points '{}': {}", part, e))
        })
        .collect()
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let prize_split_bps = match env_non_empty("PRIZE_SPLIT_BPS") {
            Some(raw) => parse_bps_list(&raw)?,
            None => DEFAULT_PRIZE_SPLIT_BPS.to_vec(),
        };

        Ok(Config {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_or("PORT", 8080)?,
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),

            ledger_mode: LedgerMode::parse(
                &env::var("LEDGER_MODE").unwrap_or_else(|_| "simulated".to_string()),
            )?,
            rpc_url: env_non_empty("RPC_URL"),
            chain_id: env_or("CHAIN_ID", DEFAULT_CHAIN_ID)?,
            game_contract_address: env_non_empty("GAME_CONTRACT_ADDRESS"),
            operator_private_key: env_non_empty("OPERATOR_PRIVATE_KEY"),
            tx_confirmations: env_or("TX_CONFIRMATIONS", DEFAULT_TX_CONFIRMATIONS)?,
            tx_timeout_secs: env_or("TX_TIMEOUT_SECS", DEFAULT_TX_TIMEOUT_SECS)?,
            sim_starting_lives: env_or("SIM_STARTING_LIVES", DEFAULT_SIM_STARTING_LIVES)?,
            sim_prize_pool_ether: env_non_empty("SIM_PRIZE_POOL_ETHER")
                .unwrap_or_else(|| DEFAULT_SIM_PRIZE_POOL_ETHER.to_string()),

            lobby_capacity: env_or("LOBBY_CAPACITY", DEFAULT_LOBBY_CAPACITY)?,
            lobby_min_to_start: env_or("LOBBY_MIN_TO_START", DEFAULT_LOBBY_MIN_TO_START)?,
            lobby_wait_secs: env_or("LOBBY_WAIT_SECS", DEFAULT_LOBBY_WAIT_SECS)?,
            lobby_confirm_secs: env_or("LOBBY_CONFIRM_SECS", DEFAULT_LOBBY_CONFIRM_SECS)?,

            match_duration_secs: env_or("MATCH_DURATION_SECS", DEFAULT_MATCH_DURATION_SECS)?,
            match_tick_ms: env_or("MATCH_TICK_MS", DEFAULT_MATCH_TICK_MS)?,
            invulnerability_secs: env_or("INVULNERABILITY_SECS", DEFAULT_INVULNERABILITY_SECS)?,
            arena_width: env_or("ARENA_WIDTH", DEFAULT_ARENA_WIDTH)?,
            arena_height: env_or("ARENA_HEIGHT", DEFAULT_ARENA_HEIGHT)?,

            winner_count: env_or("WINNER_COUNT", DEFAULT_WINNER_COUNT)?,
            prize_split_bps,
            prize_pool_share_bps: env_or("PRIZE_POOL_SHARE_BPS", BPS_DENOMINATOR)?,
            settlement_max_attempts: env_or(
                "SETTLEMENT_MAX_ATTEMPTS",
                DEFAULT_SETTLEMENT_MAX_ATTEMPTS,
            )?,
            settlement_backoff_ms: env_or("SETTLEMENT_BACKOFF_MS", DEFAULT_SETTLEMENT_BACKOFF_MS)?,

            reconcile_interval_secs: env_or(
                "RECONCILE_INTERVAL_SECS",
                DEFAULT_RECONCILE_INTERVAL_SECS,
            )?,
            reconcile_scan_limit: env_or("RECONCILE_SCAN_LIMIT", DEFAULT_RECONCILE_SCAN_LIMIT)?,

            admin_key: env_non_empty("ADMIN_KEY"),

            cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "*".to_string()),
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ledger_mode == LedgerMode::Evm {
            let rpc_url = self
                .rpc_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("RPC_URL is required when LEDGER_MODE=evm"))?;
            url::Url::parse(rpc_url).map_err(|e| anyhow::anyhow!("Invalid RPC_URL: {}", e))?;
            if self.game_contract_address.is_none() {
                anyhow::bail!("GAME_CONTRACT_ADDRESS is required when LEDGER_MODE=evm");
            }
            if self.operator_private_key.is_none() {
                anyhow::bail!("OPERATOR_PRIVATE_KEY is required when LEDGER_MODE=evm");
            }
        } else if self.environment == "production" {
            tracing::warn!("Simulated ledger in production environment; no real stakes are settled");
        }

        if self.lobby_capacity == 0 {
            anyhow::bail!("LOBBY_CAPACITY must be > 0");
        }
        if self.lobby_min_to_start == 0 || self.lobby_min_to_start > self.lobby_capacity {
            anyhow::bail!("LOBBY_MIN_TO_START must be between 1 and LOBBY_CAPACITY");
        }
        if self.match_tick_ms < 10 {
            anyhow::bail!("MATCH_TICK_MS must be >= 10");
        }
        if self.match_duration_secs == 0 {
            anyhow::bail!("MATCH_DURATION_SECS must be > 0");
        }
        for (name, size) in [("ARENA_WIDTH", self.arena_width), ("ARENA_HEIGHT", self.arena_height)] {
            if !size.is_finite() || size <= 2.0 * ARENA_SPAWN_MARGIN {
                anyhow::bail!("{} must be a finite size above {}", name, 2.0 * ARENA_SPAWN_MARGIN);
            }
        }
        if self.reconcile_interval_secs == 0 {
            tracing::warn!("RECONCILE_INTERVAL_SECS=0 disables the periodic sweep");
        }
        if self.prize_pool_share_bps > BPS_DENOMINATOR {
            anyhow::bail!("PRIZE_POOL_SHARE_BPS must be <= {}", BPS_DENOMINATOR);
        }
        let split_total: u64 = self.prize_split_bps.iter().map(|v| *v as u64).sum();
        if split_total == 0 {
            anyhow::bail!("PRIZE_SPLIT_BPS must contain at least one non-zero share");
        }
        if split_total != BPS_DENOMINATOR as u64 {
            tracing::warn!(
                "PRIZE_SPLIT_BPS sums to {} (expected {}); shares are normalised",
                split_total,
                BPS_DENOMINATOR
            );
        }
        if self.winner_count > self.prize_split_bps.len() {
            tracing::warn!(
                "WINNER_COUNT {} exceeds prize split entries {}; extra winners get no prize",
                self.winner_count,
                self.prize_split_bps.len()
            );
        }
        if self.settlement_max_attempts == 0 {
            anyhow::bail!("SETTLEMENT_MAX_ATTEMPTS must be > 0");
        }
        if self.admin_key.is_none() {
            tracing::warn!("ADMIN_KEY is not set; admin endpoints are disabled");
        }
        if self.cors_allowed_origins.trim().is_empty() {
            tracing::warn!("CORS_ALLOWED_ORIGINS is empty; requests may be blocked");
        }

        Ok(())
    }

    pub fn lobby_settings(&self) -> LobbySettings {
        LobbySettings {
            capacity: self.lobby_capacity,
            min_to_start: self.lobby_min_to_start,
            wait_window: Duration::from_secs(self.lobby_wait_secs),
            confirm_window: Duration::from_secs(self.lobby_confirm_secs),
        }
    }

    pub fn match_settings(&self) -> MatchSettings {
        MatchSettings {
            duration: Duration::from_secs(self.match_duration_secs),
            tick: Duration::from_millis(self.match_tick_ms),
            invulnerability: Duration::from_secs(self.invulnerability_secs),
            arena_width: self.arena_width,
            arena_height: self.arena_height,
        }
    }

    pub fn settlement_settings(&self) -> SettlementSettings {
        SettlementSettings {
            winner_count: self.winner_count,
            prize_split_bps: self.prize_split_bps.clone(),
            prize_pool_share_bps: self.prize_pool_share_bps,
            max_attempts: self.settlement_max_attempts,
            backoff_base: Duration::from_millis(self.settlement_backoff_ms),
        }
    }

    pub fn ledger_settings(&self) -> LedgerSettings {
        LedgerSettings {
            confirmations: self.tx_confirmations.max(1),
            tx_timeout: Duration::from_secs(self.tx_timeout_secs),
        }
    }
}

#[cfg(test)]
impl Config {
    /// Small, fast settings for scenario tests.
    pub fn for_tests() -> Self {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            environment: "test".to_string(),
            ledger_mode: LedgerMode::Simulated,
            rpc_url: None,
            chain_id: DEFAULT_CHAIN_ID,
            game_contract_address: None,
            operator_private_key: None,
            tx_confirmations: 1,
            tx_timeout_secs: 5,
            sim_starting_lives: 3,
            sim_prize_pool_ether: "10".to_string(),
            lobby_capacity: 4,
            lobby_min_to_start: 3,
            lobby_wait_secs: 10,
            lobby_confirm_secs: 5,
            match_duration_secs: 60,
            match_tick_ms: 100,
            invulnerability_secs: 2,
            arena_width: 1000.0,
            arena_height: 1000.0,
            winner_count: 3,
            prize_split_bps: DEFAULT_PRIZE_SPLIT_BPS.to_vec(),
            prize_pool_share_bps: BPS_DENOMINATOR,
            settlement_max_attempts: 3,
            settlement_backoff_ms: 10,
            reconcile_interval_secs: 60,
            reconcile_scan_limit: 100,
            admin_key: Some("test-admin".to_string()),
            cors_allowed_origins: "*".to_string(),
        }
    }
}
