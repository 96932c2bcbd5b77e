use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    #[error("Already active: {0}")]
    AlreadyActive(String),

    #[error("Ledger state is inconsistent: {0}")]
    LedgerInconsistent(String),

    #[error("No lives remaining")]
    InsufficientLives,

    #[error("Lobby is full")]
    LobbyFull,

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Transaction not confirmed within {0}s")]
    TransactionTimeout(u64),

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Blockchain RPC error: {0}")]
    BlockchainRPC(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code shared by the wire `ERROR` message and HTTP bodies.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::AlreadyActive(_) => "ALREADY_ACTIVE",
            AppError::LedgerInconsistent(_) => "LEDGER_INCONSISTENT",
            AppError::InsufficientLives => "INSUFFICIENT_LIVES",
            AppError::LobbyFull => "LOBBY_FULL",
            AppError::TransactionFailed(_) => "TRANSACTION_FAILED",
            AppError::TransactionTimeout(_) => "TRANSACTION_TIMEOUT",
            AppError::ConnectionLost => "CONNECTION_LOST",
            AppError::BlockchainRPC(_) => "BLOCKCHAIN_RPC_ERROR",
            AppError::InvalidState(_) => "INVALID_STATE",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::AuthError(_) => "AUTH_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Transient failures where the outcome on-chain is unknown or the RPC hiccuped.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::BlockchainRPC(_) | AppError::TransactionTimeout(_) | AppError::ConnectionLost
        )
    }

    /// Message shown to players.
    pub fn client_message(&self) -> String {
        match self {
            AppError::AlreadyActive(detail) => {
                format!("You already have an active or reserved game ({detail})")
            }
            AppError::LedgerInconsistent(_) => {
                "Your on-chain status is stuck in an active game that does not exist. \
                 An automatic reset has been scheduled; please try again shortly."
                    .to_string()
            }
            AppError::InsufficientLives => {
                "You have no lives left! Please buy more lives first.".to_string()
            }
            AppError::LobbyFull => "Lobby is full, please try again in a moment.".to_string(),
            AppError::TransactionTimeout(secs) => {
                format!("Blockchain did not confirm the transaction within {secs}s")
            }
            other => other.to_string(),
        }
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::AuthError(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) | AppError::InsufficientLives => StatusCode::BAD_REQUEST,
            AppError::AlreadyActive(_) | AppError::InvalidState(_) | AppError::LobbyFull => {
                StatusCode::CONFLICT
            }
            AppError::BlockchainRPC(_)
            | AppError::TransactionFailed(_)
            | AppError::TransactionTimeout(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(ErrorResponse {
            success: false,
            error: ErrorDetail {
                code: self.code().to_string(),
                message: self.to_string(),
                details: None,
            },
        });

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_only_for_transient_ledger_failures() {
        assert!(AppError::TransactionTimeout(60).is_retryable());
        assert!(AppError::BlockchainRPC("502".into()).is_retryable());
        assert!(!AppError::TransactionFailed("reverted".into()).is_retryable());
        assert!(!AppError::LedgerInconsistent("stuck".into()).is_retryable());
    }

    #[test]
    fn inconsistent_ledger_message_differs_from_generic_failure() {
        let inconsistent = AppError::LedgerInconsistent("active without game".into());
        assert_eq!(inconsistent.code(), "LEDGER_INCONSISTENT");
        assert!(inconsistent.client_message().contains("reset"));
    }

    #[test]
    fn into_response_maps_conflicts() {
        let response = AppError::LobbyFull.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
