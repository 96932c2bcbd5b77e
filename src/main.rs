use axum::http::HeaderValue;
use axum::{
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod constants;
mod error;
mod models;
mod services;
mod utils;
mod websocket;

use config::Config;
use constants::API_VERSION;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sonicworm_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    config.validate()?;

    tracing::info!("Starting SonicWorm game server");
    tracing::info!("Environment: {}", config.environment);
    tracing::info!("API Version: {}", API_VERSION);
    tracing::info!("Ledger mode: {}", config.ledger_mode.as_str());

    let ledger = services::build_ledger(&config)?;
    let app_state = services::start_game_services(config.clone(), ledger);

    // Build router
    let app = build_router(app_state);

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid HOST/PORT: {}", e))?;

    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_router(state: api::AppState) -> Router {
    // CORS configuration
    let cors = cors_from_config(&state.config);

    Router::new()
        // Game socket
        .route("/", get(websocket::game::handler))
        .route("/ws", get(websocket::game::handler))
        // Health check
        .route("/health", get(api::health::health_check))
        // Lobby & matches
        .route("/api/v1/lobby", get(api::lobby::get_lobbies))
        .route("/api/v1/matches", get(api::lobby::get_matches))
        // Players
        .route("/api/v1/players/{wallet}", get(api::players::get_player))
        // Admin (reconciliation)
        .route(
            "/api/v1/admin/reconciliation",
            get(api::admin::list_flagged),
        )
        .route(
            "/api/v1/admin/reconciliation/sweep",
            post(api::admin::run_sweep),
        )
        .route(
            "/api/v1/admin/reconciliation/{wallet}",
            delete(api::admin::acknowledge_flag),
        )
        .route(
            "/api/v1/admin/players/{wallet}/reconcile",
            post(api::admin::reconcile_player),
        )
        .route(
            "/api/v1/admin/players/{wallet}/claim-rewards",
            post(api::admin::claim_rewards),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_from_config(config: &Config) -> CorsLayer {
    match allowed_origins(&config.cors_allowed_origins) {
        Some(allowed) => CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed))
            .allow_methods(Any)
            .allow_headers(Any),
        None => CorsLayer::very_permissive(),
    }
}

/// Parses `CORS_ALLOWED_ORIGINS`; `None` means any origin is allowed.
fn allowed_origins(raw: &str) -> Option<Vec<HeaderValue>> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "*" {
        return None;
    }

    let allowed: Vec<HeaderValue> = raw
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<HeaderValue>().ok())
        .collect();

    if allowed.is_empty() {
        tracing::warn!("No valid CORS origins parsed; falling back to permissive");
        return None;
    }
    Some(allowed)
}
