//! Lobby Manager: the queue actor that gathers players, runs the waiting and
//! confirmation countdowns and hands confirmed groups to a match.
//!
//! All lobby state lives inside the actor. Ledger calls run on spawned tasks
//! and post their results back as commands; countdown expiry is a command
//! too, so a transition never races a join or a leave.

use ethers::types::Address;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, OwnedMutexGuard};
use tokio::time::{sleep_until, Instant};

use crate::{
    config::LobbySettings,
    error::{AppError, Result},
    models::{JoinPlayerData, LobbyPhase, LobbyStatus, ServerMessage},
    utils::{parse_wallet, random_id, wallet_hex},
};

use super::match_coordinator::{Entrant, MatchDirectory};
use super::onchain::{GameId, LedgerGateway, Reservation};
use super::reconciliation::{
    release_reservation, FlagReason, ReconciliationQueue, Reconciler, ReleaseOutcome,
};
use super::session_registry::{Membership, SessionId, SessionRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobbyState {
    Gathering,
    Waiting,
    Confirming,
}

impl LobbyState {
    fn phase(&self) -> LobbyPhase {
        match self {
            LobbyState::Gathering => LobbyPhase::Gathering,
            LobbyState::Waiting => LobbyPhase::Waiting,
            LobbyState::Confirming => LobbyPhase::Confirming,
        }
    }
}

/// What the leaving session is told once its reservation is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseNotice {
    /// Voluntary leave: answer with the idle lobby view.
    Left,
    /// Already told why (cancellation, failed confirmation, disconnect).
    Quiet,
}

pub struct ReservationResult {
    session_id: SessionId,
    wallet: Address,
    result: Result<(Reservation, u64)>,
    guard: OwnedMutexGuard<()>,
}

pub enum LobbyCommand {
    Join {
        session_id: SessionId,
        player: JoinPlayerData,
    },
    Leave {
        session_id: SessionId,
    },
    Confirm {
        session_id: SessionId,
    },
    Disconnect {
        session_id: SessionId,
    },
    Deadline {
        lobby_id: String,
        generation: u64,
    },
    ReservationResolved(Box<ReservationResult>),
    ReleaseResolved {
        session_id: SessionId,
        lobby_id: Option<String>,
        wallet: Address,
        game_id: GameId,
        outcome: ReleaseOutcome,
        notice: ReleaseNotice,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<LobbySnapshot>>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct LobbySnapshot {
    #[serde(flatten)]
    pub status: LobbyStatus,
    #[serde(skip)]
    pub members: Vec<SessionId>,
    #[serde(skip)]
    pub confirmed: Vec<SessionId>,
}

#[derive(Clone)]
pub struct LobbyHandle {
    tx: mpsc::UnboundedSender<LobbyCommand>,
    capacity: usize,
}

impl LobbyHandle {
    pub fn send(&self, command: LobbyCommand) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| AppError::Internal("Lobby manager stopped".to_string()))
    }

    pub async fn snapshot(&self) -> Result<Vec<LobbySnapshot>> {
        let (reply, rx) = oneshot::channel();
        self.send(LobbyCommand::Snapshot { reply })?;
        rx.await
            .map_err(|_| AppError::Internal("Lobby manager stopped".to_string()))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Debug, Clone)]
struct LobbyMember {
    session_id: SessionId,
    wallet: Address,
    game_id: GameId,
    player_name: Option<String>,
    color: Option<u32>,
    join_order: usize,
    leaving: bool,
}

#[derive(Debug)]
struct Lobby {
    id: String,
    state: LobbyState,
    members: Vec<LobbyMember>,
    confirmed: HashSet<SessionId>,
    deadline: Option<Instant>,
    generation: u64,
}

impl Lobby {
    fn new() -> Self {
        Self {
            id: random_id("l"),
            state: LobbyState::Gathering,
            members: Vec::new(),
            confirmed: HashSet::new(),
            deadline: None,
            generation: 0,
        }
    }

    fn active(&self) -> impl Iterator<Item = &LobbyMember> {
        self.members.iter().filter(|m| !m.leaving)
    }

    fn active_ids(&self) -> Vec<SessionId> {
        self.active().map(|m| m.session_id.clone()).collect()
    }

    fn active_count(&self) -> usize {
        self.active().count()
    }

    fn all_confirmed(&self) -> bool {
        self.active_count() > 0 && self.active().all(|m| self.confirmed.contains(&m.session_id))
    }

    fn status(&self, capacity: usize) -> LobbyStatus {
        LobbyStatus {
            lobby_id: Some(self.id.clone()),
            players: self.active_count(),
            max_players: capacity,
            time_remaining: self
                .deadline
                .map(|d| d.saturating_duration_since(Instant::now()).as_millis() as u64)
                .unwrap_or(0),
            lobby_state: self.state.phase(),
            confirmed_count: self.confirmed.len(),
        }
    }
}

struct PendingJoin {
    lobby_id: String,
    cancelled: bool,
}

pub struct LobbyManager {
    settings: LobbySettings,
    registry: SessionRegistry,
    ledger: Arc<dyn LedgerGateway>,
    matches: Arc<MatchDirectory>,
    reconciler: Arc<Reconciler>,
    queue: ReconciliationQueue,
    tx: mpsc::UnboundedSender<LobbyCommand>,
    rx: mpsc::UnboundedReceiver<LobbyCommand>,
    lobbies: HashMap<String, Lobby>,
    open: Option<String>,
    pending: HashMap<SessionId, PendingJoin>,
    join_counter: usize,
}

impl LobbyManager {
    /// Starts the queue actor and returns its handle.
    pub fn spawn(
        settings: LobbySettings,
        registry: SessionRegistry,
        ledger: Arc<dyn LedgerGateway>,
        matches: Arc<MatchDirectory>,
        reconciler: Arc<Reconciler>,
    ) -> LobbyHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = LobbyHandle {
            tx: tx.clone(),
            capacity: settings.capacity,
        };
        let queue = reconciler.queue().clone();
        let manager = LobbyManager {
            settings,
            registry,
            ledger,
            matches,
            reconciler,
            queue,
            tx,
            rx,
            lobbies: HashMap::new(),
            open: None,
            pending: HashMap::new(),
            join_counter: 0,
        };
        tokio::spawn(manager.run());
        handle
    }

    async fn run(mut self) {
        tracing::info!(
            "Lobby manager started (capacity {}, min {}, wait {:?}, confirm {:?})",
            self.settings.capacity,
            self.settings.min_to_start,
            self.settings.wait_window,
            self.settings.confirm_window
        );
        while let Some(command) = self.rx.recv().await {
            self.handle(command).await;
        }
    }

    async fn handle(&mut self, command: LobbyCommand) {
        match command {
            LobbyCommand::Join { session_id, player } => {
                if let Err(err) = self.on_join(&session_id, player).await {
                    tracing::debug!("Join rejected for {}: {}", session_id, err);
                    self.registry
                        .send(&session_id, ServerMessage::error(&err))
                        .await;
                }
            }
            LobbyCommand::Leave { session_id } => {
                if let Err(err) = self.on_leave(&session_id, ReleaseNotice::Left).await {
                    self.registry
                        .send(&session_id, ServerMessage::error(&err))
                        .await;
                }
            }
            LobbyCommand::Confirm { session_id } => {
                if let Err(err) = self.on_confirm(&session_id).await {
                    self.registry
                        .send(&session_id, ServerMessage::error(&err))
                        .await;
                }
            }
            LobbyCommand::Disconnect { session_id } => {
                let _ = self.on_leave(&session_id, ReleaseNotice::Quiet).await;
            }
            LobbyCommand::Deadline {
                lobby_id,
                generation,
            } => self.on_deadline(&lobby_id, generation).await,
            LobbyCommand::ReservationResolved(result) => self.on_reservation(*result).await,
            LobbyCommand::ReleaseResolved {
                session_id,
                lobby_id,
                wallet,
                game_id,
                outcome,
                notice,
            } => {
                self.on_released(&session_id, lobby_id, wallet, game_id, outcome, notice)
                    .await
            }
            LobbyCommand::Snapshot { reply } => {
                let mut lobbies: Vec<&Lobby> = self.lobbies.values().collect();
                lobbies.sort_by(|a, b| a.id.cmp(&b.id));
                let snapshot = lobbies
                    .into_iter()
                    .map(|lobby| LobbySnapshot {
                        status: lobby.status(self.settings.capacity),
                        members: lobby.active_ids(),
                        confirmed: lobby.confirmed.iter().cloned().collect(),
                    })
                    .collect();
                let _ = reply.send(snapshot);
            }
        }
    }

    // ---------------------------------------------------------------- join

    async fn on_join(&mut self, session_id: &str, player: JoinPlayerData) -> Result<()> {
        let session = self
            .registry
            .get(session_id)
            .await
            .ok_or(AppError::ConnectionLost)?;
        if !session.connected {
            return Err(AppError::ConnectionLost);
        }
        let wallet = match player.wallet_address.as_deref() {
            Some(raw) => parse_wallet(raw)?,
            None => session
                .wallet
                .ok_or_else(|| AppError::BadRequest("walletAddress is required".to_string()))?,
        };
        if !session.membership.is_idle() {
            return Err(AppError::AlreadyActive(
                "You are already in a lobby or match".to_string(),
            ));
        }
        if session.reserved_game_id.is_some() {
            return Err(AppError::AlreadyActive(
                "Your previous game is still being settled".to_string(),
            ));
        }
        if self.pending.contains_key(session_id) {
            return Err(AppError::AlreadyActive(
                "Your join request is already being processed".to_string(),
            ));
        }
        self.registry
            .bind_wallet(session_id, wallet, player.player_name, player.color)
            .await?;

        let lobby_id = self.open_lobby();
        if self.occupancy(&lobby_id) >= self.settings.capacity {
            self.prune(&lobby_id);
            return Err(AppError::LobbyFull);
        }
        let guard = self.registry.try_claim_ledger(session_id).await?;

        self.pending.insert(
            session_id.to_string(),
            PendingJoin {
                lobby_id: lobby_id.clone(),
                cancelled: false,
            },
        );
        tracing::info!(
            "{} joining lobby {} as {}",
            session_id,
            lobby_id,
            wallet_hex(&wallet)
        );

        let ledger = self.ledger.clone();
        let tx = self.tx.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let result = async {
                // Never trust a cached life count for a decision that spends one.
                let record = ledger.get_player(wallet).await?;
                if record.is_registered && record.lives == 0 {
                    return Err(AppError::InsufficientLives);
                }
                let reservation = ledger.reserve_game(wallet).await?;
                Ok((reservation, record.lives))
            }
            .await;
            let _ = tx.send(LobbyCommand::ReservationResolved(Box::new(
                ReservationResult {
                    session_id,
                    wallet,
                    result,
                    guard,
                },
            )));
        });
        Ok(())
    }

    /// The lobby accepting joins, created on demand.
    fn open_lobby(&mut self) -> String {
        if let Some(id) = &self.open {
            if self.lobbies.contains_key(id) {
                return id.clone();
            }
        }
        let lobby = Lobby::new();
        let id = lobby.id.clone();
        tracing::info!("Lobby {} created", id);
        self.lobbies.insert(id.clone(), lobby);
        self.open = Some(id.clone());
        id
    }

    fn occupancy(&self, lobby_id: &str) -> usize {
        let members = self
            .lobbies
            .get(lobby_id)
            .map(|lobby| lobby.active_count())
            .unwrap_or(0);
        let pending = self
            .pending
            .values()
            .filter(|p| !p.cancelled && p.lobby_id == lobby_id)
            .count();
        members + pending
    }

    async fn on_reservation(&mut self, resolved: ReservationResult) {
        let ReservationResult {
            session_id,
            wallet,
            result,
            guard,
        } = resolved;
        let Some(pending) = self.pending.remove(&session_id) else {
            tracing::error!("Reservation result for unknown join {}", session_id);
            return;
        };

        match result {
            Err(err) => {
                drop(guard);
                let err = self.classify_join_failure(wallet, err).await;
                tracing::warn!("Join failed for {}: {}", wallet_hex(&wallet), err);
                self.registry
                    .send(&session_id, ServerMessage::error(&err))
                    .await;
                self.prune(&pending.lobby_id);
                self.registry.reap(&session_id).await;
            }
            Ok((reservation, lives)) => {
                self.registry.set_lives(&session_id, lives).await;
                let connected = self
                    .registry
                    .get(&session_id)
                    .await
                    .is_some_and(|s| s.connected);
                let target = if pending.cancelled || !connected {
                    None
                } else {
                    self.admission_target(&pending.lobby_id)
                };

                match target {
                    Some(lobby_id) => {
                        // Held until membership says Lobby so a sweep never sees an idle reservation.
                        self.admit(&session_id, &lobby_id, wallet, reservation.game_id)
                            .await;
                        drop(guard);
                    }
                    None => {
                        if !pending.cancelled && connected {
                            self.registry
                                .send(&session_id, ServerMessage::error(&AppError::LobbyFull))
                                .await;
                        }
                        self.registry
                            .set_reservation(&session_id, Some(reservation.game_id))
                            .await;
                        self.spawn_release(
                            &session_id,
                            None,
                            wallet,
                            reservation.game_id,
                            Some(guard),
                            ReleaseNotice::Quiet,
                        );
                    }
                }
                self.prune(&pending.lobby_id);
            }
        }
    }

    /// `AlreadyActive` from the ledger for a wallet that is not in play in
    /// memory is an on-chain inconsistency; it goes to the reset path.
    async fn classify_join_failure(&self, wallet: Address, err: AppError) -> AppError {
        match err {
            AppError::AlreadyActive(detail) if !self.registry.wallet_in_play(wallet).await => {
                self.queue
                    .flag(wallet, FlagReason::StuckActive, Some(detail.clone()))
                    .await;
                let reconciler = self.reconciler.clone();
                tokio::spawn(async move {
                    let _ = reconciler.reconcile_wallet(wallet).await;
                });
                AppError::LedgerInconsistent(detail)
            }
            other => other,
        }
    }

    /// Where a freshly reserved session goes: its intended lobby if that still
    /// accepts joins, else the open lobby, else nowhere.
    fn admission_target(&mut self, intended: &str) -> Option<String> {
        if let Some(lobby) = self.lobbies.get(intended) {
            if lobby.state != LobbyState::Confirming
                && lobby.active_count() < self.settings.capacity
            {
                return Some(intended.to_string());
            }
        }
        let open = self.open_lobby();
        if self.occupancy(&open) < self.settings.capacity {
            Some(open)
        } else {
            None
        }
    }

    async fn admit(&mut self, session_id: &str, lobby_id: &str, wallet: Address, game_id: GameId) {
        let Some(session) = self.registry.get(session_id).await else {
            return;
        };
        self.join_counter += 1;
        self.registry.admit(session_id, lobby_id, game_id).await;

        let Some(lobby) = self.lobbies.get_mut(lobby_id) else {
            return;
        };
        lobby.members.push(LobbyMember {
            session_id: session_id.to_string(),
            wallet,
            game_id,
            player_name: session.player_name,
            color: session.color,
            join_order: self.join_counter,
            leaving: false,
        });
        tracing::info!(
            "{} admitted to lobby {} ({}/{})",
            session_id,
            lobby_id,
            lobby.active_count(),
            self.settings.capacity
        );
        let status = lobby.status(self.settings.capacity);
        self.registry
            .send(session_id, ServerMessage::LobbyStatus(status))
            .await;

        if lobby.state == LobbyState::Gathering && lobby.active_count() >= self.settings.min_to_start
        {
            let deadline = Instant::now() + self.settings.wait_window;
            lobby.state = LobbyState::Waiting;
            lobby.deadline = Some(deadline);
            lobby.generation += 1;
            let generation = lobby.generation;
            tracing::info!("Lobby {} waiting, countdown {:?}", lobby_id, self.settings.wait_window);
            self.schedule(lobby_id, generation, deadline);
        }
        self.broadcast_update(lobby_id).await;
    }

    // ---------------------------------------------------------------- leave

    async fn on_leave(&mut self, session_id: &str, notice: ReleaseNotice) -> Result<()> {
        if let Some(pending) = self.pending.get_mut(session_id) {
            pending.cancelled = true;
            tracing::info!("{} left while its reservation is in flight", session_id);
            if notice == ReleaseNotice::Left {
                self.registry
                    .send(
                        session_id,
                        ServerMessage::LobbyStatus(LobbyStatus::idle(self.settings.capacity)),
                    )
                    .await;
            }
            return Ok(());
        }

        let session = self
            .registry
            .get(session_id)
            .await
            .ok_or(AppError::ConnectionLost)?;
        let lobby_id = match session.membership {
            Membership::Lobby(id) => id,
            Membership::Match(_) => {
                return Err(AppError::InvalidState(
                    "Cannot leave a running match".to_string(),
                ))
            }
            Membership::Idle => {
                return Err(AppError::InvalidState("You are not in a lobby".to_string()))
            }
        };
        let Some(lobby) = self.lobbies.get_mut(&lobby_id) else {
            return Ok(());
        };
        let Some(member) = lobby
            .members
            .iter_mut()
            .find(|m| m.session_id == session_id && !m.leaving)
        else {
            // Already on its way out.
            return Ok(());
        };
        member.leaving = true;
        let (wallet, game_id) = (member.wallet, member.game_id);
        lobby.confirmed.remove(session_id);
        tracing::info!("{} leaving lobby {}", session_id, lobby_id);

        self.spawn_release(session_id, Some(lobby_id.clone()), wallet, game_id, None, notice);
        self.after_departure(&lobby_id).await;
        Ok(())
    }

    /// Re-evaluates a lobby after members dropped out.
    async fn after_departure(&mut self, lobby_id: &str) {
        let Some(lobby) = self.lobbies.get_mut(lobby_id) else {
            return;
        };
        if lobby.state == LobbyState::Confirming {
            if lobby.active_count() < self.settings.min_to_start {
                let deadline = Instant::now() + self.settings.wait_window;
                lobby.state = LobbyState::Waiting;
                lobby.confirmed.clear();
                lobby.deadline = Some(deadline);
                lobby.generation += 1;
                let generation = lobby.generation;
                tracing::info!("Lobby {} fell below minimum, back to waiting", lobby_id);
                if self
                    .open
                    .as_ref()
                    .is_none_or(|open| !self.lobbies.contains_key(open))
                {
                    self.open = Some(lobby_id.to_string());
                }
                self.schedule(lobby_id, generation, deadline);
            } else if lobby.all_confirmed() {
                self.start_match(lobby_id).await;
                return;
            }
        }
        self.broadcast_update(lobby_id).await;
    }

    fn spawn_release(
        &self,
        session_id: &str,
        lobby_id: Option<String>,
        wallet: Address,
        game_id: GameId,
        guard: Option<OwnedMutexGuard<()>>,
        notice: ReleaseNotice,
    ) {
        let ledger = self.ledger.clone();
        let registry = self.registry.clone();
        let tx = self.tx.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let slot = match guard {
                Some(guard) => Some(guard),
                None => match registry.ledger_guard(&session_id).await {
                    Some(guard) => Some(guard.lock_owned().await),
                    None => None,
                },
            };
            let outcome = release_reservation(ledger.as_ref(), wallet, game_id).await;
            drop(slot);
            let _ = tx.send(LobbyCommand::ReleaseResolved {
                session_id,
                lobby_id,
                wallet,
                game_id,
                outcome,
                notice,
            });
        });
    }

    async fn on_released(
        &mut self,
        session_id: &str,
        lobby_id: Option<String>,
        wallet: Address,
        game_id: GameId,
        outcome: ReleaseOutcome,
        notice: ReleaseNotice,
    ) {
        if let Some(lobby) = lobby_id.as_ref().and_then(|id| self.lobbies.get_mut(id)) {
            lobby.members.retain(|m| m.session_id != session_id);
        }

        match &outcome {
            ReleaseOutcome::Failed(err) => {
                self.queue
                    .flag(wallet, FlagReason::ReleaseFailed { game_id }, Some(err.to_string()))
                    .await;
                // The reservation mirror stays until reconciliation clears it.
                self.registry
                    .set_reservation(session_id, Some(game_id))
                    .await;
                self.registry
                    .set_membership(session_id, Membership::Idle)
                    .await;
                if notice == ReleaseNotice::Left {
                    self.registry
                        .send(session_id, ServerMessage::error(err))
                        .await;
                }
            }
            ReleaseOutcome::Cancelled(tx) | ReleaseOutcome::Reset(tx) => {
                tracing::info!(
                    "Reservation {} of {} released ({})",
                    game_id,
                    wallet_hex(&wallet),
                    tx.tx_hash
                );
                self.registry.release(session_id).await;
            }
        }
        if notice == ReleaseNotice::Left {
            self.registry
                .send(
                    session_id,
                    ServerMessage::LobbyStatus(LobbyStatus::idle(self.settings.capacity)),
                )
                .await;
        }
        self.registry.reap(session_id).await;

        if let Some(lobby_id) = lobby_id {
            if !self.prune(&lobby_id) {
                self.broadcast_update(&lobby_id).await;
            }
        }
    }

    // ---------------------------------------------------------------- confirm

    async fn on_confirm(&mut self, session_id: &str) -> Result<()> {
        let session = self
            .registry
            .get(session_id)
            .await
            .ok_or(AppError::ConnectionLost)?;
        let Membership::Lobby(lobby_id) = session.membership else {
            return Err(AppError::InvalidState("You are not in a lobby".to_string()));
        };
        let lobby = self
            .lobbies
            .get_mut(&lobby_id)
            .ok_or_else(|| AppError::InvalidState("Lobby no longer exists".to_string()))?;
        if lobby.state != LobbyState::Confirming {
            return Err(AppError::InvalidState(
                "Lobby is not awaiting confirmation".to_string(),
            ));
        }
        if !lobby.active().any(|m| m.session_id == session_id) {
            return Err(AppError::InvalidState("You are leaving this lobby".to_string()));
        }
        lobby.confirmed.insert(session_id.to_string());
        tracing::info!(
            "{} confirmed in lobby {} ({}/{})",
            session_id,
            lobby_id,
            lobby.confirmed.len(),
            lobby.active_count()
        );

        if lobby.all_confirmed() {
            self.start_match(&lobby_id).await;
        } else {
            self.broadcast_update(&lobby_id).await;
        }
        Ok(())
    }

    // ---------------------------------------------------------------- timers

    fn schedule(&self, lobby_id: &str, generation: u64, deadline: Instant) {
        let tx = self.tx.clone();
        let lobby_id = lobby_id.to_string();
        tokio::spawn(async move {
            sleep_until(deadline).await;
            let _ = tx.send(LobbyCommand::Deadline {
                lobby_id,
                generation,
            });
        });
    }

    async fn on_deadline(&mut self, lobby_id: &str, generation: u64) {
        let Some(lobby) = self.lobbies.get(lobby_id) else {
            return;
        };
        if lobby.generation != generation {
            return;
        }
        let (state, active) = (lobby.state, lobby.active_count());
        match state {
            LobbyState::Gathering => {}
            LobbyState::Waiting => {
                if active >= self.settings.min_to_start {
                    self.begin_confirmation(lobby_id).await;
                } else {
                    self.cancel_lobby(lobby_id, "Not enough players joined in time")
                        .await;
                }
            }
            LobbyState::Confirming => self.expire_confirmation(lobby_id).await,
        }
    }

    async fn begin_confirmation(&mut self, lobby_id: &str) {
        let Some(lobby) = self.lobbies.get_mut(lobby_id) else {
            return;
        };
        let deadline = Instant::now() + self.settings.confirm_window;
        lobby.state = LobbyState::Confirming;
        lobby.confirmed.clear();
        lobby.deadline = Some(deadline);
        lobby.generation += 1;
        let generation = lobby.generation;
        let members = lobby.active_ids();
        if self.open.as_deref() == Some(lobby_id) {
            self.open = None;
        }
        tracing::info!(
            "Lobby {} confirming with {} players",
            lobby_id,
            members.len()
        );
        self.schedule(lobby_id, generation, deadline);

        self.registry
            .broadcast(
                &members,
                &ServerMessage::MatchStarting {
                    message: "Match is starting, confirm to play".to_string(),
                    time_remaining: self.settings.confirm_window.as_millis() as u64,
                },
            )
            .await;
        self.broadcast_update(lobby_id).await;
    }

    /// Releases every active member, telling each of them why.
    async fn release_members<F>(&mut self, lobby_id: &str, select: F, message: ServerMessage)
    where
        F: Fn(&Lobby, &LobbyMember) -> bool,
    {
        let Some(lobby) = self.lobbies.get_mut(lobby_id) else {
            return;
        };
        let chosen: Vec<SessionId> = {
            let view: &Lobby = lobby;
            view.active()
                .filter(|m| select(view, m))
                .map(|m| m.session_id.clone())
                .collect()
        };
        let mut released = Vec::new();
        for member in lobby.members.iter_mut() {
            if chosen.contains(&member.session_id) {
                member.leaving = true;
                released.push((member.session_id.clone(), member.wallet, member.game_id));
            }
        }
        for (session_id, _, _) in &released {
            lobby.confirmed.remove(session_id);
        }

        let ids: Vec<SessionId> = released.iter().map(|(id, _, _)| id.clone()).collect();
        self.registry.broadcast(&ids, &message).await;
        for (session_id, wallet, game_id) in released {
            self.spawn_release(
                &session_id,
                Some(lobby_id.to_string()),
                wallet,
                game_id,
                None,
                ReleaseNotice::Quiet,
            );
        }
    }

    async fn cancel_lobby(&mut self, lobby_id: &str, reason: &str) {
        tracing::info!("Lobby {} canceled: {}", lobby_id, reason);
        if self.open.as_deref() == Some(lobby_id) {
            self.open = None;
        }
        if let Some(lobby) = self.lobbies.get_mut(lobby_id) {
            lobby.generation += 1;
            lobby.deadline = None;
        }
        self.release_members(
            lobby_id,
            |_, _| true,
            ServerMessage::MatchCanceled {
                message: reason.to_string(),
            },
        )
        .await;
    }

    async fn expire_confirmation(&mut self, lobby_id: &str) {
        self.release_members(
            lobby_id,
            |lobby, member| !lobby.confirmed.contains(&member.session_id),
            ServerMessage::MatchCanceled {
                message: "You did not confirm in time".to_string(),
            },
        )
        .await;

        let Some(lobby) = self.lobbies.get_mut(lobby_id) else {
            return;
        };
        if lobby.active_count() >= self.settings.min_to_start {
            self.start_match(lobby_id).await;
            return;
        }

        tracing::info!(
            "Lobby {} failed: {} of {} required players confirmed",
            lobby_id,
            lobby.active_count(),
            self.settings.min_to_start
        );
        lobby.generation += 1;
        lobby.deadline = None;
        self.release_members(
            lobby_id,
            |_, _| true,
            ServerMessage::MatchFailed {
                message: "Not enough players confirmed".to_string(),
            },
        )
        .await;
    }

    /// Hands the confirmed members to a new match and retires the lobby.
    async fn start_match(&mut self, lobby_id: &str) {
        let Some(lobby) = self.lobbies.remove(lobby_id) else {
            return;
        };
        if self.open.as_deref() == Some(lobby_id) {
            self.open = None;
        }
        let entrants: Vec<Entrant> = lobby
            .members
            .iter()
            .filter(|m| !m.leaving && lobby.confirmed.contains(&m.session_id))
            .map(|m| Entrant {
                session_id: m.session_id.clone(),
                wallet: m.wallet,
                game_id: m.game_id,
                player_name: m.player_name.clone(),
                color: m.color,
                join_order: m.join_order,
            })
            .collect();
        tracing::info!(
            "Lobby {} complete, starting match with {} players",
            lobby_id,
            entrants.len()
        );
        self.matches.launch(entrants).await;
    }

    // ---------------------------------------------------------------- helpers

    /// Drops a lobby nobody is in or heading to. Returns true when removed.
    fn prune(&mut self, lobby_id: &str) -> bool {
        let empty = self
            .lobbies
            .get(lobby_id)
            .is_some_and(|lobby| lobby.members.is_empty());
        let awaited = self.pending.values().any(|p| p.lobby_id == lobby_id);
        if empty && !awaited {
            self.lobbies.remove(lobby_id);
            if self.open.as_deref() == Some(lobby_id) {
                self.open = None;
            }
            tracing::debug!("Lobby {} drained", lobby_id);
            return true;
        }
        false
    }

    async fn broadcast_update(&self, lobby_id: &str) {
        let Some(lobby) = self.lobbies.get(lobby_id) else {
            return;
        };
        let message = ServerMessage::LobbyUpdate(lobby.status(self.settings.capacity));
        self.registry.broadcast(&lobby.active_ids(), &message).await;
    }
}
