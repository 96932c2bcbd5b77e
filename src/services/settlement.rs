//! Settlement Engine: final ranking, prize split and on-chain finalization of
//! every participant's game.

use ethers::types::{Address, U256};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::{
    config::SettlementSettings,
    constants::BPS_DENOMINATOR,
    error::AppError,
    models::LeaderboardEntry,
    utils::{backoff_delay, wallet_hex},
};

use super::onchain::{GameId, LedgerGateway};
use super::reconciliation::{FlagReason, ReconciliationQueue};
use super::session_registry::{SessionId, SessionRegistry};

/// Recently settled matches remembered to absorb duplicate triggers.
const SETTLED_HISTORY: usize = 1_024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    LastSurvivor,
    TimeLimit,
    Aborted,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::LastSurvivor => "last_survivor",
            EndReason::TimeLimit => "time_limit",
            EndReason::Aborted => "aborted",
        }
    }
}

/// Terminal state of one match participant.
#[derive(Debug, Clone)]
pub struct Participant {
    pub session_id: SessionId,
    pub wallet: Address,
    pub game_id: GameId,
    pub player_name: Option<String>,
    pub kills: u32,
    pub alive: bool,
    /// Time from match start to elimination; `None` for survivors.
    pub eliminated_after: Option<Duration>,
    pub join_order: usize,
}

#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub match_id: String,
    pub reason: EndReason,
    pub duration: Duration,
    pub prize_pool: U256,
    pub participants: Vec<Participant>,
}

#[derive(Debug, Clone)]
pub struct RankedParticipant {
    pub rank: usize,
    pub participant: Participant,
    pub is_winner: bool,
    pub prize: U256,
}

#[derive(Debug, Clone)]
pub struct SettlementPlan {
    pub standings: Vec<RankedParticipant>,
    pub pool_share: U256,
}

impl SettlementPlan {
    pub fn payouts(&self) -> (Vec<Address>, Vec<U256>) {
        self.standings
            .iter()
            .filter(|entry| !entry.prize.is_zero())
            .map(|entry| (entry.participant.wallet, entry.prize))
            .unzip()
    }

    pub fn leaderboard(&self, match_duration: Duration) -> Vec<LeaderboardEntry> {
        self.standings
            .iter()
            .map(|entry| LeaderboardEntry {
                rank: entry.rank,
                player_id: entry.participant.session_id.clone(),
                player_name: entry.participant.player_name.clone(),
                wallet_address: wallet_hex(&entry.participant.wallet),
                kills: entry.participant.kills,
                is_alive: entry.participant.alive,
                survival_time_ms: entry
                    .participant
                    .eliminated_after
                    .unwrap_or(match_duration)
                    .as_millis() as u64,
                is_winner: entry.is_winner,
                prize: entry.prize.to_string(),
            })
            .collect()
    }
}

// Survivors first (kills desc), then the eliminated by survival time desc, then kills desc.
fn standing_key(p: &Participant) -> (bool, Duration, u32) {
    (
        !p.alive,
        Duration::MAX - p.eliminated_after.unwrap_or(Duration::ZERO),
        u32::MAX - p.kills,
    )
}

/// Orders participants and assigns competition ranks (equal keys share a rank).
pub fn rank(participants: &[Participant]) -> Vec<(usize, Participant)> {
    let mut ordered: Vec<Participant> = participants.to_vec();
    ordered.sort_by(|a, b| {
        standing_key(a)
            .cmp(&standing_key(b))
            .then(a.join_order.cmp(&b.join_order))
    });

    let mut ranked = Vec::with_capacity(ordered.len());
    let mut previous: Option<((bool, Duration, u32), usize)> = None;
    for (position, participant) in ordered.into_iter().enumerate() {
        let key = standing_key(&participant);
        let rank = match previous {
            Some((prev_key, prev_rank)) if prev_key == key => prev_rank,
            _ => position + 1,
        };
        previous = Some((key, rank));
        ranked.push((rank, participant));
    }
    ranked
}

/// Splits `pool_share` over winners by position. Shares are renormalised over
/// the positions actually filled, and tied ranks split their combined share.
pub fn split_prizes(pool_share: U256, winner_ranks: &[usize], split_bps: &[u32]) -> Vec<U256> {
    let weights: Vec<u64> = (0..winner_ranks.len())
        .map(|position| u64::from(split_bps.get(position).copied().unwrap_or(0)))
        .collect();
    let total_weight: u64 = weights.iter().sum();
    if total_weight == 0 || pool_share.is_zero() {
        return vec![U256::zero(); winner_ranks.len()];
    }

    let mut amounts = vec![U256::zero(); winner_ranks.len()];
    let mut start = 0;
    while start < winner_ranks.len() {
        let mut end = start + 1;
        while end < winner_ranks.len() && winner_ranks[end] == winner_ranks[start] {
            end += 1;
        }
        let group_weight: u64 = weights[start..end].iter().sum();
        let group_amount = pool_share * U256::from(group_weight) / U256::from(total_weight);
        let each = group_amount / U256::from(end - start);
        for amount in &mut amounts[start..end] {
            *amount = each;
        }
        start = end;
    }
    amounts
}

pub struct SettlementEngine {
    ledger: Arc<dyn LedgerGateway>,
    registry: SessionRegistry,
    queue: ReconciliationQueue,
    settings: SettlementSettings,
    finalizing: Mutex<HashSet<GameId>>,
    settled: Mutex<VecDeque<String>>,
}

impl SettlementEngine {
    pub fn new(
        ledger: Arc<dyn LedgerGateway>,
        registry: SessionRegistry,
        queue: ReconciliationQueue,
        settings: SettlementSettings,
    ) -> Self {
        Self {
            ledger,
            registry,
            queue,
            settings,
            finalizing: Mutex::new(HashSet::new()),
            settled: Mutex::new(VecDeque::new()),
        }
    }

    /// Pure computation of standings and prizes for a terminal match.
    pub fn plan(&self, outcome: &MatchOutcome) -> SettlementPlan {
        let pool_share = outcome.prize_pool * U256::from(self.settings.prize_pool_share_bps)
            / U256::from(BPS_DENOMINATOR);

        let ranked = rank(&outcome.participants);
        let pays_out = outcome.reason != EndReason::Aborted;
        let winner_ranks: Vec<usize> = ranked
            .iter()
            .filter(|(rank, p)| pays_out && p.alive && *rank <= self.settings.winner_count)
            .map(|(rank, _)| *rank)
            .collect();
        let amounts = split_prizes(pool_share, &winner_ranks, &self.settings.prize_split_bps);

        let standings = ranked
            .into_iter()
            .enumerate()
            .map(|(position, (rank, participant))| {
                // Survivors lead the ordering, so winners are exactly the first positions.
                let is_winner = position < winner_ranks.len();
                RankedParticipant {
                    rank,
                    prize: if is_winner { amounts[position] } else { U256::zero() },
                    participant,
                    is_winner,
                }
            })
            .collect();

        SettlementPlan {
            standings,
            pool_share,
        }
    }

    /// Finalizes every participant's game, then pays prizes at most once.
    pub async fn settle(&self, outcome: &MatchOutcome, plan: &SettlementPlan) {
        {
            let mut settled = self.settled.lock().await;
            if settled.contains(&outcome.match_id) {
                tracing::warn!("Match {} already settled or settling", outcome.match_id);
                return;
            }
            if settled.len() >= SETTLED_HISTORY {
                settled.pop_front();
            }
            settled.push_back(outcome.match_id.clone());
        }
        tracing::info!(
            "Settling match {} ({}): {} participants, pool share {}",
            outcome.match_id,
            outcome.reason.as_str(),
            outcome.participants.len(),
            plan.pool_share
        );

        join_all(
            outcome
                .participants
                .iter()
                .map(|participant| self.finalize(participant)),
        )
        .await;

        self.pay(outcome, plan).await;
    }

    /// `endGame` for one participant; concurrent triggers for the same game submit once.
    pub async fn finalize(&self, participant: &Participant) {
        if !self.finalizing.lock().await.insert(participant.game_id) {
            tracing::debug!(
                "Game {} already being finalized; skipping",
                participant.game_id
            );
            return;
        }

        let guard = self.registry.ledger_guard(&participant.session_id).await;
        let slot = match &guard {
            Some(guard) => Some(guard.clone().lock_owned().await),
            None => None,
        };

        if let Err(err) = self.end_with_retry(participant).await {
            tracing::error!(
                "endGame exhausted for {} game {}: {}",
                wallet_hex(&participant.wallet),
                participant.game_id,
                err
            );
            self.queue
                .flag(
                    participant.wallet,
                    FlagReason::SettlementFailed {
                        game_id: participant.game_id,
                        kills: participant.kills,
                    },
                    Some(err.to_string()),
                )
                .await;
        }
        drop(slot);
        // Either way the session may play again; a flagged game now belongs to the reconciler.
        self.registry.release(&participant.session_id).await;
        self.finalizing.lock().await.remove(&participant.game_id);
    }

    async fn end_with_retry(&self, participant: &Participant) -> Result<(), AppError> {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self
                .ledger
                .end_game(participant.wallet, participant.game_id, participant.kills)
                .await
            {
                Ok(tx) => {
                    tracing::info!(
                        "endGame {} kills={} for {} confirmed in {}",
                        participant.game_id,
                        participant.kills,
                        wallet_hex(&participant.wallet),
                        tx.tx_hash
                    );
                    return Ok(());
                }
                Err(err) => {
                    // The failed attempt may still have landed; never submit twice for a completed game.
                    if let Ok(game) = self.ledger.get_game(participant.game_id).await {
                        if game.is_completed {
                            tracing::info!(
                                "Game {} already completed on-chain; treating endGame as done",
                                participant.game_id
                            );
                            return Ok(());
                        }
                    }
                    if !err.is_retryable() || attempt >= max_attempts {
                        return Err(err);
                    }
                    let delay = backoff_delay(self.settings.backoff_base, attempt);
                    tracing::warn!(
                        "endGame attempt {}/{} for game {} failed: {}; retrying in {:?}",
                        attempt,
                        max_attempts,
                        participant.game_id,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn pay(&self, outcome: &MatchOutcome, plan: &SettlementPlan) {
        let (winners, amounts) = plan.payouts();
        if winners.is_empty() {
            tracing::info!("Match {}: no prizes to distribute", outcome.match_id);
            return;
        }
        match self.ledger.distribute_prizes(&winners, &amounts).await {
            Ok(tx) => tracing::info!(
                "Prizes for match {} distributed to {} winners: {}",
                outcome.match_id,
                winners.len(),
                tx.tx_hash
            ),
            Err(err) => {
                tracing::error!(
                    "distributePrizes failed for match {}: {}; flagged for manual review",
                    outcome.match_id,
                    err
                );
                for (wallet, amount) in winners.iter().zip(amounts.iter()) {
                    self.queue
                        .flag(
                            *wallet,
                            FlagReason::PrizeDistributionFailed {
                                match_id: outcome.match_id.clone(),
                                amount: amount.to_string(),
                            },
                            Some(err.to_string()),
                        )
                        .await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::services::ledger_sim::SimulatedLedger;
    use crate::services::onchain::LedgerOp;

    fn participant(n: u8, kills: u32, eliminated_after: Option<u64>) -> Participant {
        Participant {
            session_id: format!("s_{}", n),
            wallet: Address::repeat_byte(n),
            game_id: u64::from(n),
            player_name: None,
            kills,
            alive: eliminated_after.is_none(),
            eliminated_after: eliminated_after.map(Duration::from_secs),
            join_order: usize::from(n),
        }
    }

    fn ids(ranked: &[(usize, Participant)]) -> Vec<(usize, &str)> {
        ranked
            .iter()
            .map(|(rank, p)| (*rank, p.session_id.as_str()))
            .collect()
    }

    #[test]
    fn survivors_rank_above_eliminated() {
        let ranked = rank(&[
            participant(1, 9, Some(100)),
            participant(2, 1, None),
            participant(3, 3, None),
            participant(4, 0, Some(200)),
            participant(5, 2, Some(100)),
        ]);
        assert_eq!(
            ids(&ranked),
            vec![(1, "s_3"), (2, "s_2"), (3, "s_4"), (4, "s_1"), (5, "s_5")]
        );
    }

    #[test]
    fn equal_standing_shares_rank() {
        let ranked = rank(&[participant(1, 2, None), participant(2, 2, None), participant(3, 1, None)]);
        assert_eq!(ids(&ranked), vec![(1, "s_1"), (1, "s_2"), (3, "s_3")]);
    }

    #[test]
    fn split_renormalises_over_filled_positions() {
        let amounts = split_prizes(U256::from(8_000u64), &[1, 2], &[5_000, 3_000, 2_000]);
        assert_eq!(amounts, vec![U256::from(5_000u64), U256::from(3_000u64)]);
    }

    #[test]
    fn tied_winners_split_their_combined_share() {
        let amounts = split_prizes(U256::from(10_000u64), &[1, 1, 3], &[5_000, 3_000, 2_000]);
        assert_eq!(
            amounts,
            vec![U256::from(4_000u64), U256::from(4_000u64), U256::from(2_000u64)]
        );
    }

    #[test]
    fn empty_split_pays_nothing() {
        assert_eq!(split_prizes(U256::from(10u64), &[1], &[]), vec![U256::zero()]);
    }

    fn engine(ledger: Arc<SimulatedLedger>) -> SettlementEngine {
        SettlementEngine::new(
            ledger,
            SessionRegistry::new(),
            ReconciliationQueue::new(),
            Config::for_tests().settlement_settings(),
        )
    }

    async fn started(ledger: &SimulatedLedger, n: u8, kills: u32, eliminated_after: Option<u64>) -> Participant {
        let wallet = Address::repeat_byte(n);
        let reservation = ledger.reserve_game(wallet).await.unwrap();
        ledger.start_game(wallet, reservation.game_id).await.unwrap();
        Participant {
            game_id: reservation.game_id,
            ..participant(n, kills, eliminated_after)
        }
    }

    #[tokio::test]
    async fn duplicate_triggers_end_each_game_once() {
        let ledger = Arc::new(SimulatedLedger::new(3, U256::from(10_000u64)));
        let engine = engine(ledger.clone());
        let outcome = MatchOutcome {
            match_id: "m_1".into(),
            reason: EndReason::LastSurvivor,
            duration: Duration::from_secs(60),
            prize_pool: U256::from(10_000u64),
            participants: vec![
                started(&ledger, 1, 2, None).await,
                started(&ledger, 2, 0, Some(30)).await,
            ],
        };
        let plan = engine.plan(&outcome);

        tokio::join!(engine.settle(&outcome, &plan), engine.settle(&outcome, &plan));
        engine.settle(&outcome, &plan).await;

        assert_eq!(ledger.count(LedgerOp::End).await, 2);
        assert_eq!(ledger.count(LedgerOp::DistributePrizes).await, 1);
        assert_eq!(
            ledger.pending_rewards(Address::repeat_byte(1)).await.unwrap(),
            U256::from(10_000u64)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_then_flagged() {
        let ledger = Arc::new(SimulatedLedger::new(3, U256::zero()));
        let engine = engine(ledger.clone());
        let p = started(&ledger, 7, 4, None).await;

        ledger.fail_next(LedgerOp::End, AppError::TransactionTimeout(60)).await;
        engine.finalize(&p).await;
        assert_eq!(ledger.count(LedgerOp::End).await, 2);
        assert_eq!(ledger.get_player(p.wallet).await.unwrap().total_kills, 4);

        let q = started(&ledger, 8, 1, None).await;
        for _ in 0..3 {
            ledger
                .fail_next(LedgerOp::End, AppError::BlockchainRPC("down".into()))
                .await;
        }
        engine.finalize(&q).await;
        assert_eq!(ledger.count_for(LedgerOp::End, q.wallet).await, 3);
        assert!(matches!(
            engine.queue.get(q.wallet).await.unwrap().reason,
            FlagReason::SettlementFailed { kills: 1, .. }
        ));
    }

    #[tokio::test]
    async fn confirmed_but_unacknowledged_end_is_not_resubmitted() {
        let ledger = Arc::new(SimulatedLedger::new(3, U256::zero()));
        let engine = engine(ledger.clone());
        let p = started(&ledger, 9, 3, None).await;
        ledger
            .fail_after_apply(LedgerOp::End, AppError::TransactionTimeout(60))
            .await;
        engine.finalize(&p).await;
        assert_eq!(ledger.count(LedgerOp::End).await, 1);
        assert_eq!(engine.queue.len().await, 0);
    }

    #[tokio::test]
    async fn failed_payment_is_flagged_not_retried() {
        let ledger = Arc::new(SimulatedLedger::new(3, U256::from(100u64)));
        let engine = engine(ledger.clone());
        let outcome = MatchOutcome {
            match_id: "m_2".into(),
            reason: EndReason::TimeLimit,
            duration: Duration::from_secs(60),
            prize_pool: U256::from(100u64),
            participants: vec![started(&ledger, 10, 1, None).await],
        };
        let plan = engine.plan(&outcome);
        ledger
            .fail_next(LedgerOp::DistributePrizes, AppError::TransactionFailed("x".into()))
            .await;
        engine.settle(&outcome, &plan).await;
        engine.settle(&outcome, &plan).await;
        assert_eq!(ledger.count(LedgerOp::DistributePrizes).await, 1);
        assert!(engine
            .queue
            .get(Address::repeat_byte(10))
            .await
            .unwrap()
            .reason
            .needs_manual_review());
    }

    #[tokio::test]
    async fn settlement_bookkeeping_stays_bounded() {
        let ledger = Arc::new(SimulatedLedger::new(3, U256::zero()));
        let engine = engine(ledger.clone());
        let p = started(&ledger, 11, 0, None).await;
        engine.finalize(&p).await;
        assert!(engine.finalizing.lock().await.is_empty());

        for n in 0..SETTLED_HISTORY + 5 {
            let outcome = MatchOutcome {
                match_id: format!("m_{}", n),
                reason: EndReason::Aborted,
                duration: Duration::ZERO,
                prize_pool: U256::zero(),
                participants: Vec::new(),
            };
            let plan = engine.plan(&outcome);
            engine.settle(&outcome, &plan).await;
        }
        let settled = engine.settled.lock().await;
        assert_eq!(settled.len(), SETTLED_HISTORY);
        assert_eq!(settled.front().map(String::as_str), Some("m_5"));
    }

    #[test]
    fn aborted_matches_pay_nothing() {
        let ledger = Arc::new(SimulatedLedger::new(3, U256::zero()));
        let engine = engine(ledger);
        let outcome = MatchOutcome {
            match_id: "m_3".into(),
            reason: EndReason::Aborted,
            duration: Duration::ZERO,
            prize_pool: U256::from(1_000u64),
            participants: vec![participant(1, 0, None)],
        };
        let plan = engine.plan(&outcome);
        assert!(plan.payouts().0.is_empty());
        assert!(!plan.standings[0].is_winner);
    }
}
