use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use super::AppState;
use crate::{
    error::Result,
    models::ApiResponse,
    services::{onchain::PlayerRecord, reconciliation::FlaggedPlayer},
    utils::{parse_wallet, wallet_hex},
};

#[derive(Debug, Serialize)]
pub struct SessionBinding {
    pub session_id: String,
    pub membership: String,
    pub connected: bool,
    pub reserved_game_id: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct PlayerResponse {
    pub wallet: String,
    pub onchain: PlayerRecord,
    pub pending_rewards: String,
    pub sessions: Vec<SessionBinding>,
    pub flagged: Option<FlaggedPlayer>,
}

/// GET /api/v1/players/{wallet}
pub async fn get_player(
    State(state): State<AppState>,
    Path(wallet): Path<String>,
) -> Result<Json<ApiResponse<PlayerResponse>>> {
    let wallet = parse_wallet(&wallet)?;
    let onchain = state.ledger.get_player(wallet).await?;
    let pending_rewards = state.ledger.pending_rewards(wallet).await?;

    let sessions = state
        .registry
        .find_by_wallet(wallet)
        .await
        .into_iter()
        .map(|session| SessionBinding {
            session_id: session.session_id,
            membership: session.membership.label(),
            connected: session.connected,
            reserved_game_id: session.reserved_game_id,
        })
        .collect();

    Ok(Json(ApiResponse::success(PlayerResponse {
        wallet: wallet_hex(&wallet),
        onchain,
        pending_rewards: pending_rewards.to_string(),
        sessions,
        flagged: state.reconciler.queue().get(wallet).await,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::state_with_ledger;
    use crate::error::AppError;

    #[tokio::test]
    async fn unseen_wallet_reports_starting_lives() {
        let (state, _) = state_with_ledger();
        let Json(body) = get_player(
            State(state),
            Path("0x2222222222222222222222222222222222222222".to_string()),
        )
        .await
        .unwrap();
        assert!(body.success);
        assert_eq!(body.data.onchain.lives, 3);
        assert!(!body.data.onchain.is_active);
        assert!(body.data.sessions.is_empty());
        assert!(body.data.flagged.is_none());
    }

    #[tokio::test]
    async fn malformed_wallet_is_bad_request() {
        let (state, _) = state_with_ledger();
        let err = get_player(State(state), Path("nope".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }
}
