// src/api/mod.rs

pub mod admin;
pub mod health;
pub mod lobby;
pub mod players;

use axum::http::{HeaderMap, HeaderName};
use std::sync::Arc;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::services::{
    LedgerGateway, LobbyHandle, MatchDirectory, Reconciler, SessionRegistry,
};

const ADMIN_KEY_HEADER: &str = "x-admin-key";

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub registry: SessionRegistry,
    pub lobby: LobbyHandle,
    pub matches: Arc<MatchDirectory>,
    pub ledger: Arc<dyn LedgerGateway>,
    pub reconciler: Arc<Reconciler>,
}

pub fn require_admin_key(headers: &HeaderMap, state: &AppState) -> Result<()> {
    let expected = state
        .config
        .admin_key
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            AppError::AuthError("ADMIN_KEY is not configured; admin endpoints are disabled".to_string())
        })?;

    let header_name = HeaderName::from_static(ADMIN_KEY_HEADER);
    let provided = headers
        .get(&header_name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            AppError::AuthError(format!(
                "Missing admin key. Send header '{}' to access this endpoint.",
                ADMIN_KEY_HEADER
            ))
        })?;

    if provided != expected {
        return Err(AppError::AuthError("Invalid admin key".to_string()));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::services::{start_game_services, SimulatedLedger};
    use ethers::types::U256;

    /// App state over a simulated ledger the test can keep poking at.
    pub fn state_with_ledger() -> (AppState, Arc<SimulatedLedger>) {
        let ledger = Arc::new(SimulatedLedger::new(3, U256::from(10_000u64)));
        let mut config = Config::for_tests();
        config.reconcile_interval_secs = 0;
        (start_game_services(config, ledger.clone()), ledger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[tokio::test]
    async fn admin_key_must_match() {
        let (state, _) = test_support::state_with_ledger();
        let mut headers = HeaderMap::new();
        assert!(matches!(
            require_admin_key(&headers, &state),
            Err(AppError::AuthError(_))
        ));

        headers.insert(ADMIN_KEY_HEADER, HeaderValue::from_static("wrong"));
        assert!(require_admin_key(&headers, &state).is_err());

        headers.insert(ADMIN_KEY_HEADER, HeaderValue::from_static("test-admin"));
        assert!(require_admin_key(&headers, &state).is_ok());
    }

    #[tokio::test]
    async fn admin_disabled_without_configured_key() {
        let (mut state, _) = test_support::state_with_ledger();
        state.config.admin_key = None;
        let mut headers = HeaderMap::new();
        headers.insert(ADMIN_KEY_HEADER, HeaderValue::from_static("test-admin"));
        assert!(require_admin_key(&headers, &state).is_err());
    }
}
