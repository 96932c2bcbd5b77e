//! Automatic repair of on-chain player state left inconsistent by crashes,
//! dropped connections or failed transactions.

use chrono::{DateTime, Utc};
use ethers::types::Address;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::{
    error::{AppError, Result},
    utils::wallet_hex,
};

use super::onchain::{ConfirmedTx, GameId, LedgerGateway};
use super::session_registry::SessionRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FlagReason {
    /// `reserveGame` reported an active game the server knows nothing about.
    StuckActive,
    /// Leaving a lobby could neither cancel nor reset the reservation.
    ReleaseFailed { game_id: GameId },
    /// A life was spent on a match that never ran and the refund did not confirm.
    /// `lives_before` is the on-chain count read just before the refund was sent.
    RefundOwed { game_id: GameId, lives_before: u64 },
    /// A start failed and the game could not be read back; whether a life is
    /// owed is decided from the game record during reconciliation.
    RefundUnverified { game_id: GameId },
    /// `endGame` retries were exhausted.
    SettlementFailed { game_id: GameId, kills: u32 },
    /// Prize payment failed; needs a human, never retried automatically.
    PrizeDistributionFailed { match_id: String, amount: String },
}

impl FlagReason {
    pub fn needs_manual_review(&self) -> bool {
        matches!(self, FlagReason::PrizeDistributionFailed { .. })
    }

    fn last_known_kills(&self) -> Option<u32> {
        match self {
            FlagReason::SettlementFailed { kills, .. } => Some(*kills),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FlaggedPlayer {
    pub wallet: String,
    pub reason: FlagReason,
    pub attempts: u32,
    pub first_flagged_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

#[derive(Clone, Default)]
pub struct ReconciliationQueue {
    flagged: Arc<RwLock<HashMap<Address, FlaggedPlayer>>>,
}

impl ReconciliationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags a wallet. A manual-review flag is never downgraded by a later one.
    pub async fn flag(&self, wallet: Address, reason: FlagReason, error: Option<String>) {
        let mut flagged = self.flagged.write().await;
        match flagged.get_mut(&wallet) {
            Some(existing) => {
                if !existing.reason.needs_manual_review() {
                    existing.reason = reason;
                }
                existing.last_error = error.or(existing.last_error.take());
            }
            None => {
                tracing::warn!("Flagged {} for reconciliation: {:?}", wallet_hex(&wallet), reason);
                flagged.insert(
                    wallet,
                    FlaggedPlayer {
                        wallet: wallet_hex(&wallet),
                        reason,
                        attempts: 0,
                        first_flagged_at: Utc::now(),
                        last_error: error,
                    },
                );
            }
        }
    }

    pub async fn get(&self, wallet: Address) -> Option<FlaggedPlayer> {
        self.flagged.read().await.get(&wallet).cloned()
    }

    pub async fn list(&self) -> Vec<FlaggedPlayer> {
        let mut list: Vec<FlaggedPlayer> = self.flagged.read().await.values().cloned().collect();
        list.sort_by_key(|entry| entry.first_flagged_at);
        list
    }

    pub async fn wallets(&self) -> Vec<Address> {
        self.flagged.read().await.keys().copied().collect()
    }

    async fn record_failure(&self, wallet: Address, error: &AppError) {
        if let Some(entry) = self.flagged.write().await.get_mut(&wallet) {
            entry.attempts += 1;
            entry.last_error = Some(error.to_string());
        }
    }

    /// Clears an automatically resolved flag; manual-review flags stay.
    async fn resolve(&self, wallet: Address) {
        let mut flagged = self.flagged.write().await;
        if flagged
            .get(&wallet)
            .is_some_and(|entry| !entry.reason.needs_manual_review())
        {
            flagged.remove(&wallet);
        }
    }

    /// Admin acknowledgement; removes any flag.
    pub async fn acknowledge(&self, wallet: Address) -> Option<FlaggedPlayer> {
        self.flagged.write().await.remove(&wallet)
    }

    pub async fn len(&self) -> usize {
        self.flagged.read().await.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileAction {
    Clean,
    RefundedLife,
    SkippedInPlay,
    SkippedBusy,
    ManualReview,
    EmergencyReset,
    CancelledReservation,
    FinalizedGame { game_id: GameId, kills: u32 },
}

/// How a reservation was released.
#[derive(Debug, Clone)]
pub enum ReleaseOutcome {
    Cancelled(ConfirmedTx),
    Reset(ConfirmedTx),
    Failed(AppError),
}

impl ReleaseOutcome {
    pub fn is_released(&self) -> bool {
        !matches!(self, ReleaseOutcome::Failed(_))
    }
}

/// Cancels a pending reservation, falling back to an emergency reset.
pub async fn release_reservation(
    ledger: &dyn LedgerGateway,
    wallet: Address,
    game_id: GameId,
) -> ReleaseOutcome {
    match ledger.cancel_reserved_game(wallet, game_id).await {
        Ok(tx) => ReleaseOutcome::Cancelled(tx),
        Err(cancel_err) => {
            tracing::warn!(
                "cancelReservedGame failed for {} game {}: {}; trying emergency reset",
                wallet_hex(&wallet),
                game_id,
                cancel_err
            );
            match ledger.emergency_reset(wallet).await {
                Ok(tx) => ReleaseOutcome::Reset(tx),
                Err(reset_err) => {
                    tracing::error!(
                        "Emergency reset failed for {}: {}",
                        wallet_hex(&wallet),
                        reset_err
                    );
                    ReleaseOutcome::Failed(reset_err)
                }
            }
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub repaired: usize,
    pub skipped: usize,
    pub failed: usize,
    pub manual_review: usize,
}

pub struct Reconciler {
    ledger: Arc<dyn LedgerGateway>,
    registry: SessionRegistry,
    queue: ReconciliationQueue,
    scan_limit: u64,
}

impl Reconciler {
    pub fn new(
        ledger: Arc<dyn LedgerGateway>,
        registry: SessionRegistry,
        queue: ReconciliationQueue,
        scan_limit: u64,
    ) -> Self {
        Self {
            ledger,
            registry,
            queue,
            scan_limit,
        }
    }

    pub fn queue(&self) -> &ReconciliationQueue {
        &self.queue
    }

    /// Re-derives the wallet's on-chain state and applies the stuck-player rules.
    pub async fn reconcile_wallet(&self, wallet: Address) -> Result<ReconcileAction> {
        let flag = self.queue.get(wallet).await;
        if flag.as_ref().is_some_and(|f| f.reason.needs_manual_review()) {
            return Ok(ReconcileAction::ManualReview);
        }
        if self.registry.wallet_in_play(wallet).await {
            return Ok(ReconcileAction::SkippedInPlay);
        }

        // Hold every bound session's ledger slot so nothing races the repair.
        let mut held = Vec::new();
        for session in self.registry.find_by_wallet(wallet).await {
            if let Some(guard) = self.registry.ledger_guard(&session.session_id).await {
                match guard.try_lock_owned() {
                    Ok(owned) => held.push(owned),
                    Err(_) => return Ok(ReconcileAction::SkippedBusy),
                }
            }
        }

        let outcome = self.apply(wallet, flag.map(|f| f.reason)).await;
        drop(held);

        match outcome {
            Ok(action) => {
                self.queue.resolve(wallet).await;
                self.registry.clear_wallet_reservation(wallet).await;
                if action != ReconcileAction::Clean {
                    tracing::warn!("Reconciled {}: {:?}", wallet_hex(&wallet), action);
                }
                Ok(action)
            }
            Err(err) => {
                self.queue.record_failure(wallet, &err).await;
                tracing::error!("Reconciliation failed for {}: {}", wallet_hex(&wallet), err);
                Err(err)
            }
        }
    }

    async fn apply(&self, wallet: Address, reason: Option<FlagReason>) -> Result<ReconcileAction> {
        let reason = match reason {
            Some(FlagReason::RefundUnverified { game_id }) => self.verify_refund(wallet, game_id).await?,
            other => other,
        };
        let kills = reason.as_ref().and_then(FlagReason::last_known_kills);
        let action = self.repair(wallet, kills).await?;
        match reason {
            Some(FlagReason::RefundOwed { lives_before, .. }) => {
                self.refund_once(wallet, lives_before, action).await
            }
            _ => Ok(action),
        }
    }

    /// A life is owed only if the game actually consumed one.
    async fn verify_refund(&self, wallet: Address, game_id: GameId) -> Result<Option<FlagReason>> {
        let game = self.ledger.get_game(game_id).await?;
        if !game.life_consumed {
            tracing::info!(
                "Game {} for {} never consumed a life; no refund owed",
                game_id,
                wallet_hex(&wallet)
            );
            return Ok(None);
        }
        let lives_before = self.ledger.get_player(wallet).await?.lives;
        let reason = FlagReason::RefundOwed {
            game_id,
            lives_before,
        };
        self.queue.flag(wallet, reason.clone(), None).await;
        Ok(Some(reason))
    }

    /// Sends the owed refund unless one already landed after `lives_before` was read.
    async fn refund_once(
        &self,
        wallet: Address,
        lives_before: u64,
        action: ReconcileAction,
    ) -> Result<ReconcileAction> {
        let lives = self.ledger.get_player(wallet).await?.lives;
        if lives > lives_before {
            tracing::info!(
                "Refund for {} already landed (lives {} > {})",
                wallet_hex(&wallet),
                lives,
                lives_before
            );
            return Ok(action);
        }
        self.ledger.refund_life(wallet).await?;
        Ok(match action {
            ReconcileAction::Clean => ReconcileAction::RefundedLife,
            other => other,
        })
    }

    async fn repair(&self, wallet: Address, last_known_kills: Option<u32>) -> Result<ReconcileAction> {
        let player = self.ledger.get_player(wallet).await?;
        if !player.is_active && player.current_game_id == 0 {
            return Ok(ReconcileAction::Clean);
        }
        if player.current_game_id == 0 {
            self.ledger.emergency_reset(wallet).await?;
            return Ok(ReconcileAction::EmergencyReset);
        }

        let game = self.ledger.get_game(player.current_game_id).await?;
        if game.is_completed {
            if !player.is_active {
                return Ok(ReconcileAction::Clean);
            }
            self.ledger.emergency_reset(wallet).await?;
            return Ok(ReconcileAction::EmergencyReset);
        }

        if !game.life_consumed {
            return match release_reservation(self.ledger.as_ref(), wallet, game.game_id).await {
                ReleaseOutcome::Cancelled(_) => Ok(ReconcileAction::CancelledReservation),
                ReleaseOutcome::Reset(_) => Ok(ReconcileAction::EmergencyReset),
                ReleaseOutcome::Failed(err) => Err(err),
            };
        }

        let kills = last_known_kills.unwrap_or_else(|| u32::try_from(game.kills).unwrap_or(u32::MAX));
        match self.ledger.end_game(wallet, game.game_id, kills).await {
            Ok(_) => Ok(ReconcileAction::FinalizedGame {
                game_id: game.game_id,
                kills,
            }),
            Err(err) => {
                tracing::warn!(
                    "endGame during reconciliation failed for {}: {}; resetting",
                    wallet_hex(&wallet),
                    err
                );
                self.ledger.emergency_reset(wallet).await?;
                Ok(ReconcileAction::EmergencyReset)
            }
        }
    }

    /// One pass over flagged wallets plus on-chain players up to the scan limit.
    pub async fn sweep(&self) -> SweepReport {
        let mut candidates: BTreeSet<Address> = self.queue.wallets().await.into_iter().collect();

        match self.ledger.player_count().await {
            Ok(count) => {
                for index in 0..count.min(self.scan_limit) {
                    match self.ledger.player_at(index).await {
                        Ok(address) => {
                            candidates.insert(address);
                        }
                        Err(err) => {
                            tracing::warn!("Player enumeration stopped at {}: {}", index, err);
                            break;
                        }
                    }
                }
            }
            Err(err) => tracing::warn!("Player enumeration unavailable: {}", err),
        }

        let mut report = SweepReport::default();
        for wallet in candidates {
            report.examined += 1;
            match self.reconcile_wallet(wallet).await {
                Ok(ReconcileAction::Clean) => {}
                Ok(ReconcileAction::SkippedInPlay) | Ok(ReconcileAction::SkippedBusy) => {
                    report.skipped += 1
                }
                Ok(ReconcileAction::ManualReview) => report.manual_review += 1,
                Ok(_) => report.repaired += 1,
                Err(_) => report.failed += 1,
            }
        }

        tracing::info!(
            "Reconciliation sweep: examined={} repaired={} skipped={} failed={} manual={}",
            report.examined,
            report.repaired,
            report.skipped,
            report.failed,
            report.manual_review
        );
        report
    }

    /// Runs a sweep immediately (crash recovery) and then every `period`.
    pub fn spawn_periodic(self: Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ledger_sim::SimulatedLedger;
    use crate::services::onchain::LedgerOp;
    use crate::services::session_registry::Membership;
    use ethers::types::U256;
    use tokio::sync::mpsc;

    fn wallet(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    fn setup() -> (Arc<SimulatedLedger>, SessionRegistry, Reconciler) {
        let ledger = Arc::new(SimulatedLedger::new(3, U256::from(1_000u64)));
        let registry = SessionRegistry::new();
        let reconciler = Reconciler::new(
            ledger.clone(),
            registry.clone(),
            ReconciliationQueue::new(),
            100,
        );
        (ledger, registry, reconciler)
    }

    #[tokio::test]
    async fn active_without_game_is_reset() {
        let (ledger, _registry, reconciler) = setup();
        ledger.force_active(wallet(1)).await;
        reconciler.queue().flag(wallet(1), FlagReason::StuckActive, None).await;

        let action = reconciler.reconcile_wallet(wallet(1)).await.unwrap();
        assert_eq!(action, ReconcileAction::EmergencyReset);
        assert!(!ledger.get_player(wallet(1)).await.unwrap().is_active);
        assert_eq!(reconciler.queue().len().await, 0);
    }

    #[tokio::test]
    async fn pending_reservation_is_cancelled() {
        let (ledger, _registry, reconciler) = setup();
        ledger.reserve_game(wallet(2)).await.unwrap();
        let action = reconciler.reconcile_wallet(wallet(2)).await.unwrap();
        assert_eq!(action, ReconcileAction::CancelledReservation);
        assert_eq!(ledger.get_player(wallet(2)).await.unwrap().lives, 3);
    }

    #[tokio::test]
    async fn started_game_is_finalized_with_last_known_kills() {
        let (ledger, _registry, reconciler) = setup();
        let reservation = ledger.reserve_game(wallet(3)).await.unwrap();
        ledger.start_game(wallet(3), reservation.game_id).await.unwrap();
        reconciler
            .queue()
            .flag(
                wallet(3),
                FlagReason::SettlementFailed {
                    game_id: reservation.game_id,
                    kills: 4,
                },
                Some("timeout".into()),
            )
            .await;

        let action = reconciler.reconcile_wallet(wallet(3)).await.unwrap();
        assert_eq!(
            action,
            ReconcileAction::FinalizedGame {
                game_id: reservation.game_id,
                kills: 4
            }
        );
        assert_eq!(ledger.get_player(wallet(3)).await.unwrap().total_kills, 4);
    }

    #[tokio::test]
    async fn owed_refund_is_paid_once_state_is_clean() {
        let (ledger, _registry, reconciler) = setup();
        let reservation = ledger.reserve_game(wallet(7)).await.unwrap();
        ledger.start_game(wallet(7), reservation.game_id).await.unwrap();
        ledger.end_game(wallet(7), reservation.game_id, 0).await.unwrap();
        reconciler
            .queue()
            .flag(
                wallet(7),
                FlagReason::RefundOwed {
                    game_id: reservation.game_id,
                    lives_before: 2,
                },
                None,
            )
            .await;

        assert_eq!(
            reconciler.reconcile_wallet(wallet(7)).await.unwrap(),
            ReconcileAction::RefundedLife
        );
        assert_eq!(ledger.get_player(wallet(7)).await.unwrap().lives, 3);
        assert_eq!(
            reconciler.reconcile_wallet(wallet(7)).await.unwrap(),
            ReconcileAction::Clean
        );
        assert_eq!(ledger.count(LedgerOp::RefundLife).await, 1);
    }

    #[tokio::test]
    async fn refund_that_landed_unconfirmed_is_not_sent_again() {
        let (ledger, _registry, reconciler) = setup();
        let reservation = ledger.reserve_game(wallet(8)).await.unwrap();
        ledger.start_game(wallet(8), reservation.game_id).await.unwrap();
        ledger.end_game(wallet(8), reservation.game_id, 0).await.unwrap();
        ledger
            .fail_after_apply(LedgerOp::RefundLife, AppError::TransactionTimeout(60))
            .await;
        assert!(ledger.refund_life(wallet(8)).await.is_err());
        reconciler
            .queue()
            .flag(
                wallet(8),
                FlagReason::RefundOwed {
                    game_id: reservation.game_id,
                    lives_before: 2,
                },
                None,
            )
            .await;

        assert_eq!(
            reconciler.reconcile_wallet(wallet(8)).await.unwrap(),
            ReconcileAction::Clean
        );
        assert_eq!(ledger.get_player(wallet(8)).await.unwrap().lives, 3);
        assert_eq!(ledger.count(LedgerOp::RefundLife).await, 1);
        assert_eq!(reconciler.queue().len().await, 0);
    }

    #[tokio::test]
    async fn unverified_refund_for_unstarted_game_only_cancels() {
        let (ledger, _registry, reconciler) = setup();
        let reservation = ledger.reserve_game(wallet(9)).await.unwrap();
        reconciler
            .queue()
            .flag(
                wallet(9),
                FlagReason::RefundUnverified {
                    game_id: reservation.game_id,
                },
                None,
            )
            .await;

        assert_eq!(
            reconciler.reconcile_wallet(wallet(9)).await.unwrap(),
            ReconcileAction::CancelledReservation
        );
        assert_eq!(ledger.get_player(wallet(9)).await.unwrap().lives, 3);
        assert_eq!(ledger.count(LedgerOp::RefundLife).await, 0);
    }

    #[tokio::test]
    async fn unverified_refund_for_consumed_life_closes_and_refunds() {
        let (ledger, _registry, reconciler) = setup();
        let reservation = ledger.reserve_game(wallet(10)).await.unwrap();
        ledger.start_game(wallet(10), reservation.game_id).await.unwrap();
        reconciler
            .queue()
            .flag(
                wallet(10),
                FlagReason::RefundUnverified {
                    game_id: reservation.game_id,
                },
                None,
            )
            .await;

        assert_eq!(
            reconciler.reconcile_wallet(wallet(10)).await.unwrap(),
            ReconcileAction::FinalizedGame {
                game_id: reservation.game_id,
                kills: 0
            }
        );
        let player = ledger.get_player(wallet(10)).await.unwrap();
        assert_eq!(player.lives, 3);
        assert!(!player.is_active);
        assert_eq!(
            reconciler.reconcile_wallet(wallet(10)).await.unwrap(),
            ReconcileAction::Clean
        );
        assert_eq!(ledger.count(LedgerOp::RefundLife).await, 1);
    }

    #[tokio::test]
    async fn wallets_in_play_are_left_alone() {
        let (ledger, registry, reconciler) = setup();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry.connect(&tx).await;
        registry.bind_wallet(&id, wallet(4), None, None).await.unwrap();
        let reservation = ledger.reserve_game(wallet(4)).await.unwrap();
        registry.admit(&id, "l_1", reservation.game_id).await;
        assert_eq!(registry.get(&id).await.unwrap().membership, Membership::Lobby("l_1".into()));

        let report = reconciler.sweep().await;
        assert_eq!(report.skipped, 1);
        assert_eq!(ledger.count(LedgerOp::Cancel).await, 0);
    }

    #[tokio::test]
    async fn prize_failures_wait_for_acknowledgement() {
        let (_ledger, _registry, reconciler) = setup();
        let reason = FlagReason::PrizeDistributionFailed {
            match_id: "m_1".into(),
            amount: "100".into(),
        };
        reconciler.queue().flag(wallet(5), reason, None).await;
        reconciler
            .queue()
            .flag(wallet(5), FlagReason::StuckActive, None)
            .await;

        assert_eq!(
            reconciler.reconcile_wallet(wallet(5)).await.unwrap(),
            ReconcileAction::ManualReview
        );
        assert!(reconciler.queue().acknowledge(wallet(5)).await.is_some());
        assert_eq!(reconciler.queue().len().await, 0);
    }

    #[tokio::test]
    async fn release_falls_back_to_emergency_reset() {
        let (ledger, _registry, _reconciler) = setup();
        let reservation = ledger.reserve_game(wallet(6)).await.unwrap();
        ledger
            .fail_next(LedgerOp::Cancel, AppError::BlockchainRPC("down".into()))
            .await;
        let outcome = release_reservation(ledger.as_ref(), wallet(6), reservation.game_id).await;
        assert!(matches!(outcome, ReleaseOutcome::Reset(_)));
        assert_eq!(ledger.count_for(LedgerOp::EmergencyReset, wallet(6)).await, 1);
    }
}
