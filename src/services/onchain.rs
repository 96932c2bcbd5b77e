//! Ledger Gateway: the only path from the server to the game contract.
//!
//! Every write returns only after the transaction is *confirmed*; the
//! submitted-but-unconfirmed state is internal to the implementation and is
//! surfaced as `TransactionTimeout` when confirmation does not arrive in time.

use async_trait::async_trait;
use ethers::{
    contract::{abigen, ContractCall},
    core::abi::Detokenize,
    middleware::SignerMiddleware,
    providers::{Http, Provider},
    signers::{LocalWallet, Signer},
    types::{Address, U256},
};
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;

use crate::{
    config::{Config, LedgerSettings},
    error::{AppError, Result},
    utils::{u256_to_u64, wallet_hex},
};

use super::relayer::Relayer;

pub type GameId = u64;

abigen!(
    SonicWormGame,
    r#"[
        function reserveGameFor(address player) external returns (uint256)
        function cancelReservedGameFor(address player, uint256 gameId) external
        function startMatch(address[] players, uint256[] gameIds) external
        function endGameFor(address player, uint256 gameId, uint256 kills) external
        function recordKill(uint256 gameId, address victimAddress) external
        function refundLife(address player) external
        function distributePrizes(address[] winners, uint256[] amounts) external
        function claimRewardsFor(address player) external
        function batchResetPlayers(address[] playerAddresses) external
        function getPlayer(address playerAddress) external view returns (uint256 lives, uint256 totalGamesPlayed, uint256 totalKills, uint256 totalSurvivalTime, uint256 totalRewards, uint256 lastLifeRefill, bool isActive, bool isRegistered, uint256 currentGameId)
        function getGame(uint256 gameId) external view returns (address player, uint256 startTime, uint256 endTime, uint256 kills, uint256 survivalTime, bool earnedReward, bool isCompleted, bool rewardClaimed, bool lifeConsumed, bool isReserved)
        function rewardPool() external view returns (uint256)
        function getPendingRewards(address playerAddress) external view returns (uint256)
        function getPlayerCount() external view returns (uint256)
        function getPlayerAddressByIndex(uint256 index) external view returns (address)
        event GameReserved(address indexed player, uint256 gameId)
    ]"#
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerOp {
    Reserve,
    Cancel,
    Start,
    End,
    RecordKill,
    RefundLife,
    DistributePrizes,
    ClaimRewards,
    EmergencyReset,
}

impl LedgerOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerOp::Reserve => "reserveGame",
            LedgerOp::Cancel => "cancelReservedGame",
            LedgerOp::Start => "startMatch",
            LedgerOp::End => "endGame",
            LedgerOp::RecordKill => "recordKill",
            LedgerOp::RefundLife => "refundLife",
            LedgerOp::DistributePrizes => "distributePrizes",
            LedgerOp::ClaimRewards => "claimRewards",
            LedgerOp::EmergencyReset => "emergencyResetStatus",
        }
    }
}

/// A transaction that reached the required confirmations.
#[derive(Debug, Clone, Serialize)]
pub struct ConfirmedTx {
    pub tx_hash: String,
    pub block_number: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Reservation {
    pub game_id: GameId,
    pub tx: ConfirmedTx,
}

/// Mirror of the contract's player struct.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlayerRecord {
    pub lives: u64,
    pub total_games_played: u64,
    pub total_kills: u64,
    pub is_active: bool,
    pub is_registered: bool,
    pub current_game_id: GameId,
}

/// Mirror of the contract's game struct (the on-chain Reservation).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GameRecord {
    pub game_id: GameId,
    pub player: Address,
    pub start_time: u64,
    pub kills: u64,
    pub is_reserved: bool,
    pub life_consumed: bool,
    pub is_completed: bool,
}

#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Reserves a game slot without spending a life.
    async fn reserve_game(&self, player: Address) -> Result<Reservation>;

    /// Releases a reservation that has not started yet.
    async fn cancel_reserved_game(&self, player: Address, game_id: GameId) -> Result<ConfirmedTx>;

    /// Turns a reservation into a started game; the life cost becomes final here.
    async fn start_game(&self, player: Address, game_id: GameId) -> Result<ConfirmedTx>;

    /// Finalizes a started game. Fails cleanly when the game is already completed.
    async fn end_game(&self, player: Address, game_id: GameId, kills: u32) -> Result<ConfirmedTx>;

    async fn record_kill(&self, game_id: GameId, victim: Address) -> Result<ConfirmedTx>;

    async fn refund_life(&self, player: Address) -> Result<ConfirmedTx>;

    async fn distribute_prizes(&self, winners: &[Address], amounts: &[U256])
        -> Result<ConfirmedTx>;

    async fn claim_rewards(&self, player: Address) -> Result<ConfirmedTx>;

    /// Escape hatch clearing a player's active flag and any dangling game.
    async fn emergency_reset(&self, player: Address) -> Result<ConfirmedTx>;

    async fn get_player(&self, player: Address) -> Result<PlayerRecord>;

    async fn get_game(&self, game_id: GameId) -> Result<GameRecord>;

    async fn prize_pool(&self) -> Result<U256>;

    async fn pending_rewards(&self, player: Address) -> Result<U256>;

    async fn player_count(&self) -> Result<u64>;

    async fn player_at(&self, index: u64) -> Result<Address>;
}

/// Maps a revert reason or RPC failure onto the error taxonomy.
pub fn classify_ledger_error(op: LedgerOp, message: &str) -> AppError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("already active")
        || lower.contains("already has an active")
        || lower.contains("already in game")
        || lower.contains("already in an active")
        || lower.contains("active or reserved game")
    {
        return AppError::AlreadyActive(format!("{} reverted: {}", op.as_str(), message));
    }
    if lower.contains("no lives") || lower.contains("insufficient lives") {
        return AppError::InsufficientLives;
    }
    if lower.contains("execution reverted") || lower.contains("revert") {
        return AppError::TransactionFailed(format!("{}: {}", op.as_str(), message));
    }
    if lower.contains("timeout") || lower.contains("timed out") {
        return AppError::BlockchainRPC(format!("{} timed out: {}", op.as_str(), message));
    }
    AppError::BlockchainRPC(format!("{}: {}", op.as_str(), message))
}

type OperatorClient = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Ledger Gateway backed by the deployed game contract over JSON-RPC.
pub struct EvmLedger {
    contract: SonicWormGame<OperatorClient>,
    relayer: Relayer,
}

impl EvmLedger {
    pub fn from_config(config: &Config) -> Result<Self> {
        let rpc_url = config
            .rpc_url
            .as_deref()
            .ok_or_else(|| AppError::Internal("RPC_URL is not configured".to_string()))?;
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| AppError::Internal(format!("Invalid RPC URL: {}", e)))?;

        let key = config
            .operator_private_key
            .as_deref()
            .ok_or_else(|| AppError::Internal("OPERATOR_PRIVATE_KEY is not configured".into()))?;
        let wallet = LocalWallet::from_str(key.trim_start_matches("0x"))
            .map_err(|e| AppError::Internal(format!("Invalid operator key: {}", e)))?
            .with_chain_id(config.chain_id);

        let contract_address = config
            .game_contract_address
            .as_deref()
            .ok_or_else(|| AppError::Internal("GAME_CONTRACT_ADDRESS is not configured".into()))?;
        let contract_address = Address::from_str(contract_address)
            .map_err(|e| AppError::Internal(format!("Invalid contract address: {}", e)))?;

        tracing::info!(
            "EVM ledger: contract {} on chain {} (operator {})",
            wallet_hex(&contract_address),
            config.chain_id,
            wallet_hex(&wallet.address())
        );

        let client = Arc::new(SignerMiddleware::new(provider, wallet));
        Ok(Self {
            contract: SonicWormGame::new(contract_address, client),
            relayer: Relayer::new(config.ledger_settings()),
        })
    }

    pub fn settings(&self) -> &LedgerSettings {
        self.relayer.settings()
    }

    async fn submit<D: Detokenize + Send + Sync>(
        &self,
        op: LedgerOp,
        call: ContractCall<OperatorClient, D>,
    ) -> Result<ethers::types::TransactionReceipt> {
        let pending = call
            .send()
            .await
            .map_err(|e| classify_ledger_error(op, &e.to_string()))?;
        self.relayer.wait_for_receipt(op, pending).await
    }

    async fn view<D: Detokenize + Send + Sync>(
        &self,
        op: &'static str,
        call: ContractCall<OperatorClient, D>,
    ) -> Result<D> {
        call.call()
            .await
            .map_err(|e| AppError::BlockchainRPC(format!("{}: {}", op, e)))
    }
}

#[async_trait]
impl LedgerGateway for EvmLedger {
    async fn reserve_game(&self, player: Address) -> Result<Reservation> {
        let receipt = self
            .submit(LedgerOp::Reserve, self.contract.reserve_game_for(player))
            .await?;

        let game_id = receipt
            .logs
            .iter()
            .find_map(|log| ethers::contract::parse_log::<GameReservedFilter>(log.clone()).ok())
            .filter(|event| event.player == player)
            .map(|event| u256_to_u64(event.game_id))
            .transpose()?
            .ok_or_else(|| {
                AppError::LedgerInconsistent(
                    "reserveGame confirmed without a GameReserved event".to_string(),
                )
            })?;

        Ok(Reservation {
            game_id,
            tx: Relayer::confirmed(&receipt),
        })
    }

    async fn cancel_reserved_game(&self, player: Address, game_id: GameId) -> Result<ConfirmedTx> {
        let receipt = self
            .submit(
                LedgerOp::Cancel,
                self.contract
                    .cancel_reserved_game_for(player, U256::from(game_id)),
            )
            .await?;
        Ok(Relayer::confirmed(&receipt))
    }

    async fn start_game(&self, player: Address, game_id: GameId) -> Result<ConfirmedTx> {
        let receipt = self
            .submit(
                LedgerOp::Start,
                self.contract
                    .start_match(vec![player], vec![U256::from(game_id)]),
            )
            .await?;
        Ok(Relayer::confirmed(&receipt))
    }

    async fn end_game(&self, player: Address, game_id: GameId, kills: u32) -> Result<ConfirmedTx> {
        let receipt = self
            .submit(
                LedgerOp::End,
                self.contract
                    .end_game_for(player, U256::from(game_id), U256::from(kills)),
            )
            .await?;
        Ok(Relayer::confirmed(&receipt))
    }

    async fn record_kill(&self, game_id: GameId, victim: Address) -> Result<ConfirmedTx> {
        let receipt = self
            .submit(
                LedgerOp::RecordKill,
                self.contract.record_kill(U256::from(game_id), victim),
            )
            .await?;
        Ok(Relayer::confirmed(&receipt))
    }

    async fn refund_life(&self, player: Address) -> Result<ConfirmedTx> {
        let receipt = self
            .submit(LedgerOp::RefundLife, self.contract.refund_life(player))
            .await?;
        Ok(Relayer::confirmed(&receipt))
    }

    async fn distribute_prizes(
        &self,
        winners: &[Address],
        amounts: &[U256],
    ) -> Result<ConfirmedTx> {
        if winners.len() != amounts.len() {
            return Err(AppError::Internal(
                "winners and amounts length mismatch".to_string(),
            ));
        }
        let receipt = self
            .submit(
                LedgerOp::DistributePrizes,
                self.contract
                    .distribute_prizes(winners.to_vec(), amounts.to_vec()),
            )
            .await?;
        Ok(Relayer::confirmed(&receipt))
    }

    async fn claim_rewards(&self, player: Address) -> Result<ConfirmedTx> {
        let receipt = self
            .submit(LedgerOp::ClaimRewards, self.contract.claim_rewards_for(player))
            .await?;
        Ok(Relayer::confirmed(&receipt))
    }

    async fn emergency_reset(&self, player: Address) -> Result<ConfirmedTx> {
        let receipt = self
            .submit(
                LedgerOp::EmergencyReset,
                self.contract.batch_reset_players(vec![player]),
            )
            .await?;
        Ok(Relayer::confirmed(&receipt))
    }

    async fn get_player(&self, player: Address) -> Result<PlayerRecord> {
        let (lives, games, kills, _survival, _rewards, _refill, is_active, is_registered, current) =
            self.view("getPlayer", self.contract.get_player(player)).await?;
        Ok(PlayerRecord {
            lives: u256_to_u64(lives)?,
            total_games_played: u256_to_u64(games)?,
            total_kills: u256_to_u64(kills)?,
            is_active,
            is_registered,
            current_game_id: u256_to_u64(current)?,
        })
    }

    async fn get_game(&self, game_id: GameId) -> Result<GameRecord> {
        let (
            player,
            start_time,
            _end_time,
            kills,
            _survival,
            _earned,
            is_completed,
            _claimed,
            life_consumed,
            is_reserved,
        ) = self
            .view("getGame", self.contract.get_game(U256::from(game_id)))
            .await?;
        Ok(GameRecord {
            game_id,
            player,
            start_time: u256_to_u64(start_time)?,
            kills: u256_to_u64(kills)?,
            is_reserved,
            life_consumed,
            is_completed,
        })
    }

    async fn prize_pool(&self) -> Result<U256> {
        self.view("rewardPool", self.contract.reward_pool()).await
    }

    async fn pending_rewards(&self, player: Address) -> Result<U256> {
        self.view("getPendingRewards", self.contract.get_pending_rewards(player))
            .await
    }

    async fn player_count(&self) -> Result<u64> {
        let count = self
            .view("getPlayerCount", self.contract.get_player_count())
            .await?;
        u256_to_u64(count)
    }

    async fn player_at(&self, index: u64) -> Result<Address> {
        self.view(
            "getPlayerAddressByIndex",
            self.contract.get_player_address_by_index(U256::from(index)),
        )
        .await
    }
}
