use axum::{extract::State, Json};
use serde::Serialize;
use super::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub ledger_mode: String,
    pub ledger: String,
    pub connected_sessions: usize,
    pub tracked_sessions: usize,
    pub running_matches: usize,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    // A cheap view call tells whether the RPC endpoint answers.
    let ledger_status = match state.ledger.prize_pool().await {
        Ok(_) => "connected".to_string(),
        Err(err) => {
            tracing::warn!("Health check: ledger unreachable: {}", err);
            "unreachable".to_string()
        }
    };

    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        ledger_mode: state.config.ledger_mode.as_str().to_string(),
        ledger: ledger_status,
        connected_sessions: state.registry.connected_count().await,
        tracked_sessions: state.registry.len().await,
        running_matches: state.matches.len().await,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::state_with_ledger;

    #[tokio::test]
    async fn reports_simulated_ledger_as_connected() {
        let (state, _) = state_with_ledger();
        let Json(health) = health_check(State(state)).await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.ledger_mode, "simulated");
        assert_eq!(health.ledger, "connected");
        assert_eq!(health.running_matches, 0);
    }
}
