//! In-process model of the game contract.
//!
//! Used when `LEDGER_MODE=simulated` and as the ledger double in scenario
//! tests. Faults can be queued per operation, and every call (successful or
//! not) is appended to a journal that tests assert against.

use async_trait::async_trait;
use ethers::types::{Address, U256};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::{
    config::Config,
    error::{AppError, Result},
    utils::wallet_hex,
};

use super::onchain::{
    ConfirmedTx, GameId, GameRecord, LedgerGateway, LedgerOp, PlayerRecord, Reservation,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerCall {
    pub op: LedgerOp,
    pub player: Option<Address>,
    pub game_id: Option<GameId>,
    pub kills: Option<u32>,
}

#[derive(Debug, Clone)]
enum Fault {
    /// Reject before touching state.
    Reject(AppError),
    /// Apply the effect, then report the error (a confirmation that never arrived).
    ApplyThenFail(AppError),
}

#[derive(Debug, Default, Clone)]
struct SimPlayer {
    lives: u64,
    total_games_played: u64,
    total_kills: u64,
    is_active: bool,
    current_game_id: GameId,
    pending_rewards: U256,
}

#[derive(Debug, Default)]
struct SimState {
    players: HashMap<Address, SimPlayer>,
    order: Vec<Address>,
    games: HashMap<GameId, GameRecord>,
    next_game_id: GameId,
    prize_pool: U256,
    faults: HashMap<LedgerOp, VecDeque<Fault>>,
    journal: Vec<LedgerCall>,
    tx_counter: u64,
    clock_secs: u64,
}

pub struct SimulatedLedger {
    state: Mutex<SimState>,
    starting_lives: u64,
    latency: Duration,
}

impl SimulatedLedger {
    pub fn new(starting_lives: u64, prize_pool: U256) -> Self {
        Self {
            state: Mutex::new(SimState {
                next_game_id: 1,
                prize_pool,
                clock_secs: 1_700_000_000,
                ..Default::default()
            }),
            starting_lives,
            latency: Duration::ZERO,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let pool = ethers::utils::parse_ether(config.sim_prize_pool_ether.trim())
            .map_err(|e| AppError::Internal(format!("Invalid SIM_PRIZE_POOL_ETHER: {}", e)))?;
        Ok(Self::new(config.sim_starting_lives, pool))
    }

    /// Every write waits this long before "confirming".
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub async fn fail_next(&self, op: LedgerOp, err: AppError) {
        let mut state = self.state.lock().await;
        state
            .faults
            .entry(op)
            .or_default()
            .push_back(Fault::Reject(err));
    }

    pub async fn fail_after_apply(&self, op: LedgerOp, err: AppError) {
        let mut state = self.state.lock().await;
        state
            .faults
            .entry(op)
            .or_default()
            .push_back(Fault::ApplyThenFail(err));
    }

    /// Reproduces the on-chain bug: active flag set with no real game behind it.
    pub async fn force_active(&self, player: Address) {
        let mut state = self.state.lock().await;
        let lives = self.starting_lives;
        let entry = Self::register(&mut state, player, lives);
        entry.is_active = true;
        entry.current_game_id = 0;
    }

    pub async fn set_lives(&self, player: Address, lives: u64) {
        let mut state = self.state.lock().await;
        let starting = self.starting_lives;
        Self::register(&mut state, player, starting).lives = lives;
    }

    pub async fn journal(&self) -> Vec<LedgerCall> {
        self.state.lock().await.journal.clone()
    }

    pub async fn count(&self, op: LedgerOp) -> usize {
        self.state
            .lock()
            .await
            .journal
            .iter()
            .filter(|call| call.op == op)
            .count()
    }

    pub async fn count_for(&self, op: LedgerOp, player: Address) -> usize {
        self.state
            .lock()
            .await
            .journal
            .iter()
            .filter(|call| call.op == op && call.player == Some(player))
            .count()
    }

    fn register(state: &mut SimState, player: Address, lives: u64) -> &mut SimPlayer {
        if !state.players.contains_key(&player) {
            state.order.push(player);
        }
        state.players.entry(player).or_insert_with(|| SimPlayer {
            lives,
            ..Default::default()
        })
    }

    /// Journals the call, waits out the simulated latency and pops any queued fault.
    async fn begin(&self, call: LedgerCall) -> Option<Fault> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut state = self.state.lock().await;
        let op = call.op;
        state.journal.push(call);
        state.faults.get_mut(&op).and_then(|queue| queue.pop_front())
    }

    fn receipt(state: &mut SimState, op: LedgerOp) -> ConfirmedTx {
        state.tx_counter += 1;
        state.clock_secs += 1;
        let tx = ConfirmedTx {
            tx_hash: format!("0x{:064x}", state.tx_counter),
            block_number: Some(state.tx_counter),
        };
        tracing::debug!("[sim] {} confirmed: {}", op.as_str(), tx.tx_hash);
        tx
    }

    /// Runs `apply` under the state lock, honouring the queued fault.
    async fn write<T, F>(&self, call: LedgerCall, apply: F) -> Result<T>
    where
        F: FnOnce(&mut SimState, u64) -> Result<T>,
    {
        let op = call.op;
        let fault = self.begin(call).await;
        if let Some(Fault::Reject(err)) = fault {
            tracing::debug!("[sim] {} rejected by injected fault: {}", op.as_str(), err);
            return Err(err);
        }
        let mut state = self.state.lock().await;
        let result = apply(&mut *state, self.starting_lives);
        match (fault, result) {
            (Some(Fault::ApplyThenFail(err)), Ok(_)) => {
                tracing::debug!("[sim] {} applied, then failed: {}", op.as_str(), err);
                Err(err)
            }
            (_, result) => result,
        }
    }

    fn call(op: LedgerOp, player: Option<Address>, game_id: Option<GameId>) -> LedgerCall {
        LedgerCall {
            op,
            player,
            game_id,
            kills: None,
        }
    }
}

fn reverted(op: LedgerOp, reason: &str) -> AppError {
    AppError::TransactionFailed(format!("{}: execution reverted: {}", op.as_str(), reason))
}

#[async_trait]
impl LedgerGateway for SimulatedLedger {
    async fn reserve_game(&self, player: Address) -> Result<Reservation> {
        let op = LedgerOp::Reserve;
        self.write(Self::call(op, Some(player), None), |state, lives| {
            let entry = Self::register(state, player, lives);
            if entry.is_active || entry.current_game_id != 0 {
                return Err(AppError::AlreadyActive(format!(
                    "{} reverted: Player already has an active game",
                    op.as_str()
                )));
            }
            if entry.lives == 0 {
                return Err(AppError::InsufficientLives);
            }
            let game_id = state.next_game_id;
            state.next_game_id += 1;
            if let Some(entry) = state.players.get_mut(&player) {
                entry.is_active = true;
                entry.current_game_id = game_id;
            }
            state.games.insert(
                game_id,
                GameRecord {
                    game_id,
                    player,
                    is_reserved: true,
                    ..Default::default()
                },
            );
            Ok(Reservation {
                game_id,
                tx: Self::receipt(state, op),
            })
        })
        .await
    }

    async fn cancel_reserved_game(&self, player: Address, game_id: GameId) -> Result<ConfirmedTx> {
        let op = LedgerOp::Cancel;
        self.write(Self::call(op, Some(player), Some(game_id)), |state, _| {
            let game = state
                .games
                .get_mut(&game_id)
                .filter(|game| game.player == player)
                .ok_or_else(|| reverted(op, "Game not found"))?;
            if !game.is_reserved || game.life_consumed || game.is_completed {
                return Err(reverted(op, "Game is not a pending reservation"));
            }
            game.is_reserved = false;
            game.is_completed = true;
            if let Some(entry) = state.players.get_mut(&player) {
                if entry.current_game_id == game_id {
                    entry.current_game_id = 0;
                    entry.is_active = false;
                }
            }
            Ok(Self::receipt(state, op))
        })
        .await
    }

    async fn start_game(&self, player: Address, game_id: GameId) -> Result<ConfirmedTx> {
        let op = LedgerOp::Start;
        self.write(Self::call(op, Some(player), Some(game_id)), |state, _| {
            let now = state.clock_secs;
            let lives = state.players.get(&player).map(|p| p.lives).unwrap_or(0);
            let game = state
                .games
                .get_mut(&game_id)
                .filter(|game| game.player == player)
                .ok_or_else(|| reverted(op, "Game not found"))?;
            if !game.is_reserved || game.life_consumed || game.is_completed {
                return Err(reverted(op, "Game is not a pending reservation"));
            }
            if lives == 0 {
                return Err(AppError::InsufficientLives);
            }
            game.life_consumed = true;
            game.start_time = now;
            if let Some(entry) = state.players.get_mut(&player) {
                entry.lives -= 1;
            }
            Ok(Self::receipt(state, op))
        })
        .await
    }

    async fn end_game(&self, player: Address, game_id: GameId, kills: u32) -> Result<ConfirmedTx> {
        let op = LedgerOp::End;
        let mut call = Self::call(op, Some(player), Some(game_id));
        call.kills = Some(kills);
        self.write(call, |state, _| {
            let game = state
                .games
                .get_mut(&game_id)
                .filter(|game| game.player == player)
                .ok_or_else(|| reverted(op, "Game not found"))?;
            if game.is_completed {
                return Err(reverted(op, "Game already completed"));
            }
            if !game.life_consumed {
                return Err(reverted(op, "Game not started"));
            }
            game.is_completed = true;
            game.is_reserved = false;
            game.kills = u64::from(kills);
            if let Some(entry) = state.players.get_mut(&player) {
                entry.total_games_played += 1;
                entry.total_kills += u64::from(kills);
                if entry.current_game_id == game_id {
                    entry.current_game_id = 0;
                    entry.is_active = false;
                }
            }
            Ok(Self::receipt(state, op))
        })
        .await
    }

    async fn record_kill(&self, game_id: GameId, victim: Address) -> Result<ConfirmedTx> {
        let op = LedgerOp::RecordKill;
        self.write(Self::call(op, Some(victim), Some(game_id)), |state, _| {
            let game = state
                .games
                .get_mut(&game_id)
                .ok_or_else(|| reverted(op, "Game not found"))?;
            if !game.life_consumed || game.is_completed {
                return Err(reverted(op, "Game not in progress"));
            }
            game.kills += 1;
            Ok(Self::receipt(state, op))
        })
        .await
    }

    async fn refund_life(&self, player: Address) -> Result<ConfirmedTx> {
        let op = LedgerOp::RefundLife;
        self.write(Self::call(op, Some(player), None), |state, lives| {
            Self::register(state, player, lives).lives += 1;
            Ok(Self::receipt(state, op))
        })
        .await
    }

    async fn distribute_prizes(
        &self,
        winners: &[Address],
        amounts: &[U256],
    ) -> Result<ConfirmedTx> {
        let op = LedgerOp::DistributePrizes;
        let winners = winners.to_vec();
        let amounts = amounts.to_vec();
        self.write(Self::call(op, None, None), move |state, lives| {
            if winners.len() != amounts.len() {
                return Err(reverted(op, "Length mismatch"));
            }
            let total = amounts.iter().fold(U256::zero(), |acc, a| acc + *a);
            if total > state.prize_pool {
                return Err(reverted(op, "Insufficient reward pool"));
            }
            state.prize_pool -= total;
            for (winner, amount) in winners.iter().zip(amounts.iter()) {
                Self::register(state, *winner, lives).pending_rewards += *amount;
            }
            Ok(Self::receipt(state, op))
        })
        .await
    }

    async fn claim_rewards(&self, player: Address) -> Result<ConfirmedTx> {
        let op = LedgerOp::ClaimRewards;
        self.write(Self::call(op, Some(player), None), |state, _| {
            let entry = state
                .players
                .get_mut(&player)
                .filter(|entry| !entry.pending_rewards.is_zero())
                .ok_or_else(|| reverted(op, "No rewards to claim"))?;
            entry.pending_rewards = U256::zero();
            Ok(Self::receipt(state, op))
        })
        .await
    }

    async fn emergency_reset(&self, player: Address) -> Result<ConfirmedTx> {
        let op = LedgerOp::EmergencyReset;
        self.write(Self::call(op, Some(player), None), |state, _| {
            let current = match state.players.get_mut(&player) {
                Some(entry) => {
                    let current = entry.current_game_id;
                    entry.is_active = false;
                    entry.current_game_id = 0;
                    current
                }
                None => return Err(reverted(op, "Player not registered")),
            };
            if let Some(game) = state.games.get_mut(&current) {
                game.is_reserved = false;
                game.is_completed = true;
            }
            tracing::debug!("[sim] emergency reset for {}", wallet_hex(&player));
            Ok(Self::receipt(state, op))
        })
        .await
    }

    async fn get_player(&self, player: Address) -> Result<PlayerRecord> {
        let state = self.state.lock().await;
        Ok(match state.players.get(&player) {
            Some(entry) => PlayerRecord {
                lives: entry.lives,
                total_games_played: entry.total_games_played,
                total_kills: entry.total_kills,
                is_active: entry.is_active,
                is_registered: true,
                current_game_id: entry.current_game_id,
            },
            // Unseen wallets are registered lazily on their first write.
            None => PlayerRecord {
                lives: self.starting_lives,
                ..Default::default()
            },
        })
    }

    async fn get_game(&self, game_id: GameId) -> Result<GameRecord> {
        let state = self.state.lock().await;
        Ok(state.games.get(&game_id).cloned().unwrap_or(GameRecord {
            game_id,
            ..Default::default()
        }))
    }

    async fn prize_pool(&self) -> Result<U256> {
        Ok(self.state.lock().await.prize_pool)
    }

    async fn pending_rewards(&self, player: Address) -> Result<U256> {
        let state = self.state.lock().await;
        Ok(state
            .players
            .get(&player)
            .map(|entry| entry.pending_rewards)
            .unwrap_or_default())
    }

    async fn player_count(&self) -> Result<u64> {
        Ok(self.state.lock().await.order.len() as u64)
    }

    async fn player_at(&self, index: u64) -> Result<Address> {
        let state = self.state.lock().await;
        state
            .order
            .get(index as usize)
            .copied()
            .ok_or_else(|| AppError::NotFound(format!("No player at index {}", index)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wallet(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    fn ledger() -> SimulatedLedger {
        SimulatedLedger::new(3, U256::from(1_000_000u64))
    }

    #[tokio::test]
    async fn reserve_start_end_lifecycle() {
        let ledger = ledger();
        let reservation = ledger.reserve_game(wallet(1)).await.unwrap();
        let player = ledger.get_player(wallet(1)).await.unwrap();
        assert!(player.is_active);
        assert_eq!(player.current_game_id, reservation.game_id);
        assert_eq!(player.lives, 3);

        ledger.start_game(wallet(1), reservation.game_id).await.unwrap();
        assert_eq!(ledger.get_player(wallet(1)).await.unwrap().lives, 2);

        ledger.end_game(wallet(1), reservation.game_id, 4).await.unwrap();
        let player = ledger.get_player(wallet(1)).await.unwrap();
        assert!(!player.is_active);
        assert_eq!(player.total_kills, 4);

        let again = ledger.end_game(wallet(1), reservation.game_id, 4).await;
        assert!(matches!(again, Err(AppError::TransactionFailed(_))));
    }

    #[tokio::test]
    async fn second_reservation_is_already_active() {
        let ledger = ledger();
        ledger.reserve_game(wallet(2)).await.unwrap();
        assert!(matches!(
            ledger.reserve_game(wallet(2)).await,
            Err(AppError::AlreadyActive(_))
        ));
    }

    #[tokio::test]
    async fn cancel_releases_without_spending_a_life() {
        let ledger = ledger();
        let reservation = ledger.reserve_game(wallet(3)).await.unwrap();
        ledger
            .cancel_reserved_game(wallet(3), reservation.game_id)
            .await
            .unwrap();
        let player = ledger.get_player(wallet(3)).await.unwrap();
        assert!(!player.is_active);
        assert_eq!(player.lives, 3);
        assert!(ledger
            .cancel_reserved_game(wallet(3), reservation.game_id)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn forced_active_bug_is_cleared_by_emergency_reset() {
        let ledger = ledger();
        ledger.force_active(wallet(4)).await;
        assert!(matches!(
            ledger.reserve_game(wallet(4)).await,
            Err(AppError::AlreadyActive(_))
        ));
        ledger.emergency_reset(wallet(4)).await.unwrap();
        assert!(ledger.reserve_game(wallet(4)).await.is_ok());
    }

    #[tokio::test]
    async fn injected_faults_apply_in_order() {
        let ledger = ledger();
        ledger
            .fail_next(LedgerOp::Reserve, AppError::BlockchainRPC("down".into()))
            .await;
        assert!(ledger.reserve_game(wallet(5)).await.is_err());
        assert!(!ledger.get_player(wallet(5)).await.unwrap().is_active);

        ledger
            .fail_after_apply(LedgerOp::Reserve, AppError::TransactionTimeout(60))
            .await;
        assert!(ledger.reserve_game(wallet(5)).await.is_err());
        assert!(ledger.get_player(wallet(5)).await.unwrap().is_active);
        assert_eq!(ledger.count_for(LedgerOp::Reserve, wallet(5)).await, 2);
    }

    #[tokio::test]
    async fn prizes_move_from_pool_to_pending_and_claim_once() {
        let ledger = ledger();
        ledger
            .distribute_prizes(&[wallet(6)], &[U256::from(400_000u64)])
            .await
            .unwrap();
        assert_eq!(ledger.prize_pool().await.unwrap(), U256::from(600_000u64));
        assert_eq!(
            ledger.pending_rewards(wallet(6)).await.unwrap(),
            U256::from(400_000u64)
        );
        ledger.claim_rewards(wallet(6)).await.unwrap();
        assert!(ledger.claim_rewards(wallet(6)).await.is_err());
        assert_eq!(ledger.player_count().await.unwrap(), 1);
        assert_eq!(ledger.player_at(0).await.unwrap(), wallet(6));
    }
}
