// Game services: lobby and match actors, settlement, reconciliation and the ledger.
pub mod arena;
pub mod ledger_sim;
pub mod lobby_manager;
pub mod match_coordinator;
pub mod onchain;
pub mod reconciliation;
pub mod relayer;
pub mod session_registry;
pub mod settlement;

// Re-export for convenience
pub use ledger_sim::SimulatedLedger;
pub use lobby_manager::{LobbyCommand, LobbyHandle, LobbyManager};
pub use match_coordinator::{MatchCommand, MatchContext, MatchDirectory};
pub use onchain::{EvmLedger, LedgerGateway};
pub use reconciliation::{ReconciliationQueue, Reconciler};
pub use session_registry::{Membership, SessionRegistry};
pub use settlement::SettlementEngine;

use crate::{
    api::AppState,
    config::{Config, LedgerMode},
};
use std::sync::Arc;
use std::time::Duration;

/// Picks the ledger implementation named by `LEDGER_MODE`.
pub fn build_ledger(config: &Config) -> anyhow::Result<Arc<dyn LedgerGateway>> {
    let ledger: Arc<dyn LedgerGateway> = match config.ledger_mode {
        LedgerMode::Evm => {
            let evm = EvmLedger::from_config(config)?;
            tracing::info!(
                "Ledger writes wait for {} confirmation(s), timeout {:?}",
                evm.settings().confirmations,
                evm.settings().tx_timeout
            );
            Arc::new(evm)
        }
        LedgerMode::Simulated => {
            tracing::warn!("Using the simulated ledger; no real stakes are settled");
            Arc::new(SimulatedLedger::from_config(config)?)
        }
    };
    Ok(ledger)
}

/// Wires the game components together and starts the long-running actors.
pub fn start_game_services(config: Config, ledger: Arc<dyn LedgerGateway>) -> AppState {
    tracing::info!("Starting game services...");

    let registry = SessionRegistry::new();
    let queue = ReconciliationQueue::new();

    let reconciler = Arc::new(Reconciler::new(
        ledger.clone(),
        registry.clone(),
        queue.clone(),
        config.reconcile_scan_limit,
    ));
    let settlement = Arc::new(SettlementEngine::new(
        ledger.clone(),
        registry.clone(),
        queue.clone(),
        config.settlement_settings(),
    ));
    let matches = MatchDirectory::new(MatchContext {
        ledger: ledger.clone(),
        registry: registry.clone(),
        settlement,
        queue,
        settings: config.match_settings(),
    });
    let lobby = LobbyManager::spawn(
        config.lobby_settings(),
        registry.clone(),
        ledger.clone(),
        matches.clone(),
        reconciler.clone(),
    );

    if config.reconcile_interval_secs > 0 {
        tracing::info!(
            "Starting reconciliation sweep every {}s",
            config.reconcile_interval_secs
        );
        reconciler
            .clone()
            .spawn_periodic(Duration::from_secs(config.reconcile_interval_secs));
    } else {
        tracing::warn!("RECONCILE_INTERVAL_SECS=0; periodic reconciliation disabled");
    }

    AppState {
        config,
        registry,
        lobby,
        matches,
        ledger,
        reconciler,
    }
}
