use axum::{extract::State, Json};

use super::AppState;
use crate::{
    error::Result,
    models::{ApiResponse, LobbyStatus},
    services::match_coordinator::MatchSummary,
};

/// GET /api/v1/lobby
pub async fn get_lobbies(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<LobbyStatus>>>> {
    let lobbies = state
        .lobby
        .snapshot()
        .await?
        .into_iter()
        .map(|snapshot| snapshot.status)
        .collect();
    Ok(Json(ApiResponse::success(lobbies)))
}

/// GET /api/v1/matches
pub async fn get_matches(State(state): State<AppState>) -> Json<ApiResponse<Vec<MatchSummary>>> {
    Json(ApiResponse::success(state.matches.summaries().await))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::state_with_ledger;
    use crate::models::{JoinPlayerData, LobbyPhase};
    use crate::services::LobbyCommand;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn lobby_snapshot_lists_gathering_lobby() {
        let (state, _) = state_with_ledger();
        let Json(empty) = get_lobbies(State(state.clone())).await.unwrap();
        assert!(empty.data.is_empty());

        let (tx, _rx) = mpsc::unbounded_channel();
        let session_id = state.registry.connect(&tx).await;
        state
            .lobby
            .send(LobbyCommand::Join {
                session_id,
                player: JoinPlayerData {
                    wallet_address: Some("0x1111111111111111111111111111111111111111".into()),
                    ..Default::default()
                },
            })
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let Json(lobbies) = get_lobbies(State(state.clone())).await.unwrap();
        assert_eq!(lobbies.data.len(), 1);
        assert_eq!(lobbies.data[0].players, 1);
        assert_eq!(lobbies.data[0].lobby_state, LobbyPhase::Gathering);

        let Json(matches) = get_matches(State(state)).await;
        assert!(matches.data.is_empty());
    }
}
