use super::{require_admin_key, AppState};
use crate::{
    error::{AppError, Result},
    models::ApiResponse,
    services::{
        onchain::ConfirmedTx,
        reconciliation::{FlaggedPlayer, ReconcileAction, SweepReport},
    },
    utils::{parse_wallet, wallet_hex},
};
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ReconcileResponse {
    pub wallet: String,
    pub action: ReconcileAction,
}

#[derive(Debug, Serialize)]
pub struct ClaimResponse {
    pub wallet: String,
    pub amount: String,
    pub tx: ConfirmedTx,
}

/// GET /api/v1/admin/reconciliation
pub async fn list_flagged(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<Vec<FlaggedPlayer>>>> {
    require_admin_key(&headers, &state)?;
    Ok(Json(ApiResponse::success(
        state.reconciler.queue().list().await,
    )))
}

/// POST /api/v1/admin/reconciliation/sweep
pub async fn run_sweep(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<SweepReport>>> {
    require_admin_key(&headers, &state)?;
    tracing::info!("Manual reconciliation sweep requested");
    Ok(Json(ApiResponse::success(state.reconciler.sweep().await)))
}

/// POST /api/v1/admin/players/{wallet}/reconcile
pub async fn reconcile_player(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(wallet): Path<String>,
) -> Result<Json<ApiResponse<ReconcileResponse>>> {
    require_admin_key(&headers, &state)?;
    let wallet = parse_wallet(&wallet)?;
    let action = state.reconciler.reconcile_wallet(wallet).await?;
    tracing::info!("Manual reconcile of {}: {:?}", wallet_hex(&wallet), action);
    Ok(Json(ApiResponse::success(ReconcileResponse {
        wallet: wallet_hex(&wallet),
        action,
    })))
}

/// DELETE /api/v1/admin/reconciliation/{wallet}
pub async fn acknowledge_flag(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(wallet): Path<String>,
) -> Result<Json<ApiResponse<FlaggedPlayer>>> {
    require_admin_key(&headers, &state)?;
    let wallet = parse_wallet(&wallet)?;
    let flag = state
        .reconciler
        .queue()
        .acknowledge(wallet)
        .await
        .ok_or_else(|| AppError::NotFound(format!("{} is not flagged", wallet_hex(&wallet))))?;
    tracing::warn!(
        "Flag on {} acknowledged by admin: {:?}",
        wallet_hex(&wallet),
        flag.reason
    );
    Ok(Json(ApiResponse::success(flag)))
}

/// POST /api/v1/admin/players/{wallet}/claim-rewards
pub async fn claim_rewards(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(wallet): Path<String>,
) -> Result<Json<ApiResponse<ClaimResponse>>> {
    require_admin_key(&headers, &state)?;
    let wallet = parse_wallet(&wallet)?;
    let amount = state.ledger.pending_rewards(wallet).await?;
    if amount.is_zero() {
        return Err(AppError::BadRequest("No pending rewards to claim".to_string()));
    }
    let tx = state.ledger.claim_rewards(wallet).await?;
    Ok(Json(ApiResponse::success(ClaimResponse {
        wallet: wallet_hex(&wallet),
        amount: amount.to_string(),
        tx,
    })))
}
