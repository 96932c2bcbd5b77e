//! Match Coordinator: one actor per running match.
//!
//! The actor owns every piece of in-match state. Client updates, kill claims
//! and disconnects arrive on its command channel and are applied between
//! ticks, so nothing else ever mutates a match.

use ethers::types::{Address, U256};
use futures_util::future::join_all;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::{
    config::MatchSettings,
    constants::{MAX_SEGMENTS, TIMER_UPDATE_INTERVAL_MS},
    models::{
        Food, GameEndedPayload, GameStateUpdate, GameStateView, GameStatusView, PlayerData,
        PlayerUpdateData, Point, ServerMessage,
    },
    utils::{now_millis, random_id, short_wallet, wallet_hex},
};

use super::arena::{self, Arena};
use super::onchain::{GameId, LedgerGateway};
use super::reconciliation::{release_reservation, FlagReason, ReconciliationQueue};
use super::session_registry::{Membership, SessionId, SessionRegistry};
use super::settlement::{EndReason, MatchOutcome, Participant, SettlementEngine};

/// A lobby member handed over to a match, with its confirmed reservation.
#[derive(Debug, Clone)]
pub struct Entrant {
    pub session_id: SessionId,
    pub wallet: Address,
    pub game_id: GameId,
    pub player_name: Option<String>,
    pub color: Option<u32>,
    pub join_order: usize,
}

#[derive(Debug)]
pub enum MatchCommand {
    Update {
        session_id: SessionId,
        data: PlayerUpdateData,
    },
    Kill {
        session_id: SessionId,
        victim_id: SessionId,
    },
    Disconnect {
        session_id: SessionId,
    },
    Summary {
        reply: oneshot::Sender<MatchSummary>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchSummary {
    pub match_id: String,
    pub phase: &'static str,
    pub players: usize,
    pub alive: usize,
    pub connected: usize,
    pub elapsed_ms: u64,
    pub time_remaining_ms: u64,
    pub prize_pool: String,
}

#[derive(Clone)]
pub struct MatchHandle {
    pub match_id: String,
    tx: mpsc::UnboundedSender<MatchCommand>,
}

/// Everything a coordinator needs from the rest of the server.
#[derive(Clone)]
pub struct MatchContext {
    pub ledger: Arc<dyn LedgerGateway>,
    pub registry: SessionRegistry,
    pub settlement: Arc<SettlementEngine>,
    pub queue: ReconciliationQueue,
    pub settings: MatchSettings,
}

/// Running matches by id.
pub struct MatchDirectory {
    ctx: MatchContext,
    matches: RwLock<HashMap<String, MatchHandle>>,
}

impl MatchDirectory {
    pub fn new(ctx: MatchContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            matches: RwLock::new(HashMap::new()),
        })
    }

    /// Moves the entrants into a new match actor and returns its id.
    pub async fn launch(self: &Arc<Self>, entrants: Vec<Entrant>) -> String {
        let match_id = random_id("m");
        let (tx, rx) = mpsc::unbounded_channel();
        self.matches.write().await.insert(
            match_id.clone(),
            MatchHandle {
                match_id: match_id.clone(),
                tx,
            },
        );
        for entrant in &entrants {
            self.ctx
                .registry
                .set_membership(&entrant.session_id, Membership::Match(match_id.clone()))
                .await;
        }

        tracing::info!("Match {} launching with {} entrants", match_id, entrants.len());
        let coordinator = MatchCoordinator::new(match_id.clone(), self.ctx.clone(), rx);
        let directory = Arc::clone(self);
        let id = match_id.clone();
        tokio::spawn(async move {
            coordinator.run(entrants).await;
            directory.matches.write().await.remove(&id);
            tracing::info!("Match {} closed", id);
        });
        match_id
    }

    pub async fn send(&self, match_id: &str, command: MatchCommand) -> bool {
        match self.matches.read().await.get(match_id) {
            Some(handle) => handle.tx.send(command).is_ok(),
            None => false,
        }
    }

    pub async fn summaries(&self) -> Vec<MatchSummary> {
        let handles: Vec<MatchHandle> = self.matches.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            let (reply, rx) = oneshot::channel();
            if handle.tx.send(MatchCommand::Summary { reply }).is_ok() {
                if let Ok(summary) = rx.await {
                    summaries.push(summary);
                }
            }
        }
        summaries
    }

    pub async fn len(&self) -> usize {
        self.matches.read().await.len()
    }
}

/// Decides the single reason a match ends, if it does. A survivor verdict
/// wins over the time limit when both hold on the same evaluation.
pub fn evaluate_end(
    initial_players: usize,
    alive: usize,
    elapsed: Duration,
    limit: Duration,
) -> Option<EndReason> {
    if (initial_players >= 2 && alive <= 1) || alive == 0 {
        Some(EndReason::LastSurvivor)
    } else if elapsed >= limit {
        Some(EndReason::TimeLimit)
    } else {
        None
    }
}

struct MatchPlayer {
    entrant: Entrant,
    color: u32,
    head: Point,
    angle: f64,
    body: Vec<Point>,
    length: usize,
    kills: u32,
    alive: bool,
    connected: bool,
    spawned_at: i64,
    invulnerable_until: Instant,
    was_invulnerable: bool,
    eliminated_at: Option<Instant>,
    last_update_at: Instant,
    dirty: bool,
}

impl MatchPlayer {
    fn is_invulnerable(&self, now: Instant) -> bool {
        now < self.invulnerable_until
    }

    fn view(&self, now: Instant) -> PlayerData {
        PlayerData {
            id: self.entrant.session_id.clone(),
            x: self.head.x,
            y: self.head.y,
            angle: self.angle,
            segments: self.body.clone(),
            kills: self.kills,
            is_alive: self.alive,
            color: self.color,
            spawn_time: self.spawned_at,
            is_invulnerable: self.is_invulnerable(now),
            player_name: self.entrant.player_name.clone(),
        }
    }

    fn display_name(&self) -> String {
        self.entrant
            .player_name
            .clone()
            .unwrap_or_else(|| short_wallet(&self.entrant.wallet))
    }
}

struct MatchCoordinator {
    match_id: String,
    ctx: MatchContext,
    rx: mpsc::UnboundedReceiver<MatchCommand>,
    rng: StdRng,
    arena: Arena,
    players: Vec<MatchPlayer>,
    started_at: Instant,
    started_wall: i64,
    prize_pool: U256,
    food_spawned: Vec<Food>,
    food_eaten: Vec<String>,
    last_timer_at: Instant,
    ended: bool,
}

impl MatchCoordinator {
    fn new(match_id: String, ctx: MatchContext, rx: mpsc::UnboundedReceiver<MatchCommand>) -> Self {
        let arena = Arena::new(ctx.settings.arena_width, ctx.settings.arena_height);
        let now = Instant::now();
        Self {
            match_id,
            ctx,
            rx,
            rng: StdRng::from_os_rng(),
            arena,
            players: Vec::new(),
            started_at: now,
            started_wall: now_millis(),
            prize_pool: U256::zero(),
            food_spawned: Vec::new(),
            food_eaten: Vec::new(),
            last_timer_at: now,
            ended: false,
        }
    }

    async fn run(mut self, entrants: Vec<Entrant>) {
        let entrant_count = entrants.len();
        let started = self.consume_lives(entrants).await;

        if started.len() < entrant_count.min(2) {
            self.abort(started).await;
            return;
        }

        self.prize_pool = match self.ctx.ledger.prize_pool().await {
            Ok(pool) => pool,
            Err(err) => {
                tracing::warn!("Match {}: prize pool unavailable: {}", self.match_id, err);
                U256::zero()
            }
        };
        self.spawn_players(started);
        self.announce_start().await;

        let mut ticker = interval(self.ctx.settings.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    match command {
                        Some(command) => self.handle(command).await,
                        None => break,
                    }
                }
                _ = ticker.tick() => self.on_tick().await,
            }

            if let Some(reason) = self.check_end() {
                self.finish(reason).await;
                return;
            }
        }
    }

    /// Turns every reservation into a started game; failures are excluded and refunded.
    async fn consume_lives(&self, entrants: Vec<Entrant>) -> Vec<Entrant> {
        let ledger = &self.ctx.ledger;
        let registry = &self.ctx.registry;
        let results = join_all(entrants.iter().map(|entrant| async move {
            let guard = registry.ledger_guard(&entrant.session_id).await;
            let _slot = match guard {
                Some(guard) => Some(guard.lock_owned().await),
                None => None,
            };
            ledger.start_game(entrant.wallet, entrant.game_id).await
        }))
        .await;

        let mut started = Vec::with_capacity(entrants.len());
        for (entrant, result) in entrants.into_iter().zip(results) {
            match result {
                Ok(tx) => {
                    tracing::info!(
                        "Match {}: life consumed for {} (game {}, tx {})",
                        self.match_id,
                        wallet_hex(&entrant.wallet),
                        entrant.game_id,
                        tx.tx_hash
                    );
                    started.push(entrant);
                }
                Err(err) => {
                    tracing::warn!(
                        "Match {}: could not start game {} for {}: {}",
                        self.match_id,
                        entrant.game_id,
                        wallet_hex(&entrant.wallet),
                        err
                    );
                    let ctx = self.ctx.clone();
                    tokio::spawn(async move { refund_unstarted(ctx, entrant).await });
                }
            }
        }
        started
    }

    /// Too few players could start: close their games and give the lives back.
    async fn abort(&mut self, started: Vec<Entrant>) {
        tracing::warn!(
            "Match {} aborted: only {} player(s) started",
            self.match_id,
            started.len()
        );
        let outcome = MatchOutcome {
            match_id: self.match_id.clone(),
            reason: EndReason::Aborted,
            duration: Duration::ZERO,
            prize_pool: U256::zero(),
            participants: started
                .iter()
                .map(|entrant| Participant {
                    session_id: entrant.session_id.clone(),
                    wallet: entrant.wallet,
                    game_id: entrant.game_id,
                    player_name: entrant.player_name.clone(),
                    kills: 0,
                    alive: true,
                    eliminated_after: None,
                    join_order: entrant.join_order,
                })
                .collect(),
        };
        let plan = self.ctx.settlement.plan(&outcome);
        let ended = ServerMessage::GameEnded(GameEndedPayload {
            final_leaderboard: plan.leaderboard(Duration::ZERO),
            players: Vec::new(),
            prize_pool: "0".to_string(),
            game_state: GameStatusView {
                is_active: false,
                time_remaining: 0,
                alive_count: 0,
            },
            survivors: Vec::new(),
            reason: EndReason::Aborted.as_str().to_string(),
        });
        let ids: Vec<SessionId> = started.iter().map(|e| e.session_id.clone()).collect();
        self.ctx.registry.broadcast(&ids, &ended).await;
        self.ctx
            .registry
            .broadcast(
                &ids,
                &ServerMessage::MatchCanceled {
                    message: "Not enough players could start the match".to_string(),
                },
            )
            .await;

        let ctx = &self.ctx;
        join_all(outcome.participants.iter().map(|participant| async move {
            ctx.settlement.finalize(participant).await;
            refund_spent_life(
                ctx,
                participant.wallet,
                participant.game_id,
                &participant.session_id,
                "Match canceled, your life has been refunded",
            )
            .await;
        }))
        .await;
    }

    fn spawn_players(&mut self, started: Vec<Entrant>) {
        let now = Instant::now();
        let wall = now_millis();
        self.started_at = now;
        self.started_wall = wall;
        self.last_timer_at = now;

        for entrant in started {
            let head = self.arena.spawn_point(&mut self.rng);
            let angle = self.rng.random_range(0.0..std::f64::consts::TAU);
            let body = arena::initial_body(head, angle);
            let color = entrant
                .color
                .unwrap_or_else(|| self.rng.random_range(0x202020..0xffffff));
            self.players.push(MatchPlayer {
                color,
                head,
                angle,
                length: body.len(),
                body,
                kills: 0,
                alive: true,
                connected: true,
                spawned_at: wall,
                invulnerable_until: now + self.ctx.settings.invulnerability,
                was_invulnerable: true,
                eliminated_at: None,
                last_update_at: now,
                dirty: false,
                entrant,
            });
        }
        self.arena.replenish(&mut self.rng);
    }

    fn session_ids(&self) -> Vec<SessionId> {
        self.players
            .iter()
            .filter(|p| p.connected)
            .map(|p| p.entrant.session_id.clone())
            .collect()
    }

    fn alive_count(&self) -> usize {
        self.players.iter().filter(|p| p.alive).count()
    }

    fn elapsed(&self) -> Duration {
        Instant::now().saturating_duration_since(self.started_at)
    }

    fn time_remaining(&self) -> Duration {
        self.ctx.settings.duration.saturating_sub(self.elapsed())
    }

    fn status(&self) -> GameStatusView {
        GameStatusView {
            is_active: !self.ended,
            time_remaining: self.time_remaining().as_millis() as u64,
            alive_count: self.alive_count(),
        }
    }

    fn snapshot(&self) -> GameStateView {
        let now = Instant::now();
        GameStateView {
            players: self.players.iter().map(|p| p.view(now)).collect(),
            food: self.arena.food(),
            is_active: !self.ended,
            start_time: Some(self.started_wall),
            time_remaining: self.time_remaining().as_millis() as u64,
        }
    }

    async fn announce_start(&self) {
        let ids = self.session_ids();
        let registry = &self.ctx.registry;
        registry
            .broadcast(
                &ids,
                &ServerMessage::GameStarted {
                    match_id: self.match_id.clone(),
                },
            )
            .await;

        let snapshot = self.snapshot();
        for id in &ids {
            registry
                .send(
                    id,
                    ServerMessage::GameJoined {
                        player_id: id.clone(),
                        room_id: self.match_id.clone(),
                        game_state: snapshot.clone(),
                    },
                )
                .await;
        }
        for player in &snapshot.players {
            let others: Vec<&SessionId> = ids.iter().filter(|id| **id != player.id).collect();
            registry
                .broadcast(others, &ServerMessage::PlayerJoined { player: player.clone() })
                .await;
        }
        tracing::info!(
            "Match {} started with {} players",
            self.match_id,
            self.players.len()
        );
    }

    fn player_index(&self, session_id: &str) -> Option<usize> {
        self.players
            .iter()
            .position(|p| p.entrant.session_id == session_id)
    }

    async fn handle(&mut self, command: MatchCommand) {
        match command {
            MatchCommand::Update { session_id, data } => self.on_update(&session_id, data),
            MatchCommand::Kill {
                session_id,
                victim_id,
            } => self.on_kill(&session_id, &victim_id).await,
            MatchCommand::Disconnect { session_id } => self.on_disconnect(&session_id).await,
            MatchCommand::Summary { reply } => {
                let _ = reply.send(MatchSummary {
                    match_id: self.match_id.clone(),
                    phase: if self.ended { "settling" } else { "running" },
                    players: self.players.len(),
                    alive: self.alive_count(),
                    connected: self.players.iter().filter(|p| p.connected).count(),
                    elapsed_ms: self.elapsed().as_millis() as u64,
                    time_remaining_ms: self.time_remaining().as_millis() as u64,
                    prize_pool: self.prize_pool.to_string(),
                });
            }
        }
    }

    fn on_update(&mut self, session_id: &str, data: PlayerUpdateData) {
        if self.ended {
            return;
        }
        let Some(index) = self.player_index(session_id) else {
            return;
        };
        let now = Instant::now();
        let next = Point::new(data.x, data.y);
        {
            let player = &self.players[index];
            if !player.alive {
                return;
            }
            let elapsed = now.saturating_duration_since(player.last_update_at);
            if !self.arena.contains(&next)
                || !arena::move_is_plausible(&player.head, &next, elapsed)
            {
                tracing::debug!(
                    "Match {}: rejected move for {} to ({:.1}, {:.1})",
                    self.match_id,
                    session_id,
                    next.x,
                    next.y
                );
                return;
            }
        }

        let eaten = self.arena.eat_near(&next);
        let player = &mut self.players[index];
        player.length = (player.length + eaten.len()).min(MAX_SEGMENTS);
        player.head = next;
        player.angle = data.angle;

        arena::advance_trail(&mut player.body, next, player.length);
        player.last_update_at = now;
        player.dirty = true;
        self.food_eaten.extend(eaten);
    }

    async fn on_kill(&mut self, killer_id: &str, victim_id: &str) {
        if self.ended || killer_id == victim_id {
            return;
        }
        let (Some(killer), Some(victim)) = (self.player_index(killer_id), self.player_index(victim_id))
        else {
            return;
        };
        let now = Instant::now();
        {
            let k = &self.players[killer];
            let v = &self.players[victim];
            let reason = if !k.alive || !v.alive {
                Some("player not alive")
            } else if v.is_invulnerable(now) {
                Some("victim invulnerable")
            } else if !arena::kill_is_plausible(&k.body, &v.head) {
                Some("no contact")
            } else {
                None
            };
            if let Some(reason) = reason {
                tracing::debug!(
                    "Match {}: rejected kill claim {} -> {}: {}",
                    self.match_id,
                    killer_id,
                    victim_id,
                    reason
                );
                return;
            }
        }

        let remains = self.players[victim].body.clone();
        let dropped = self.arena.drop_remains(&mut self.rng, &remains);
        self.food_spawned.extend(dropped);

        {
            let v = &mut self.players[victim];
            v.alive = false;
            v.eliminated_at = Some(now);
            v.dirty = true;
        }
        let killer_game = {
            let k = &mut self.players[killer];
            k.kills += 1;
            k.dirty = true;
            k.entrant.game_id
        };
        let victim_wallet = self.players[victim].entrant.wallet;
        let message = format!(
            "{} eliminated {}",
            self.players[killer].display_name(),
            self.players[victim].display_name()
        );
        tracing::info!("Match {}: {}", self.match_id, message);

        let killed = ServerMessage::PlayerKilled {
            killer_id: killer_id.to_string(),
            victim_id: victim_id.to_string(),
            game_state: self.status(),
            message,
        };
        self.ctx.registry.broadcast(&self.session_ids(), &killed).await;

        let ledger = self.ctx.ledger.clone();
        tokio::spawn(async move {
            if let Err(err) = ledger.record_kill(killer_game, victim_wallet).await {
                tracing::warn!("recordKill for game {} failed: {}", killer_game, err);
            }
        });
    }

    async fn on_disconnect(&mut self, session_id: &str) {
        let Some(index) = self.player_index(session_id) else {
            return;
        };
        let now = Instant::now();
        let player = &mut self.players[index];
        if !player.connected {
            return;
        }
        player.connected = false;
        if player.alive && !self.ended {
            player.alive = false;
            player.eliminated_at = Some(now);
        }
        player.dirty = true;
        tracing::info!(
            "Match {}: {} disconnected with {} kills",
            self.match_id,
            session_id,
            player.kills
        );
        self.ctx
            .registry
            .broadcast(
                &self.session_ids(),
                &ServerMessage::PlayerLeft {
                    player_id: session_id.to_string(),
                },
            )
            .await;
    }

    async fn on_tick(&mut self) {
        if self.ended {
            return;
        }
        let now = Instant::now();
        let spawned = self.arena.replenish(&mut self.rng);
        self.food_spawned.extend(spawned);

        for player in self.players.iter_mut() {
            let invulnerable = player.is_invulnerable(now);
            if player.was_invulnerable != invulnerable {
                player.was_invulnerable = invulnerable;
                player.dirty = true;
            }
        }

        let changed: Vec<PlayerData> = self
            .players
            .iter_mut()
            .filter(|p| p.dirty)
            .map(|p| {
                p.dirty = false;
                p.view(now)
            })
            .collect();

        let update = GameStateUpdate {
            prize_pool: self.prize_pool.to_string(),
            players: changed,
            food_spawned: std::mem::take(&mut self.food_spawned),
            food_eaten: std::mem::take(&mut self.food_eaten),
            connected_count: self.players.iter().filter(|p| p.connected).count(),
            game_state: self.status(),
        };
        let ids = self.session_ids();
        if !update.is_empty() {
            self.ctx
                .registry
                .broadcast(&ids, &ServerMessage::GameStateUpdate(update))
                .await;
        }

        if now.saturating_duration_since(self.last_timer_at)
            >= Duration::from_millis(TIMER_UPDATE_INTERVAL_MS)
        {
            self.last_timer_at = now;
            self.ctx
                .registry
                .broadcast(
                    &ids,
                    &ServerMessage::TimerUpdate {
                        elapsed_time: self.elapsed().as_millis() as u64,
                        time_remaining: self.time_remaining().as_millis() as u64,
                    },
                )
                .await;
        }
    }

    fn check_end(&self) -> Option<EndReason> {
        if self.ended {
            return None;
        }
        evaluate_end(
            self.players.len(),
            self.alive_count(),
            self.elapsed(),
            self.ctx.settings.duration,
        )
    }

    /// Freezes the match, publishes the result and settles every participant.
    async fn finish(&mut self, reason: EndReason) {
        self.ended = true;
        let elapsed = self.elapsed();
        tracing::info!(
            "Match {} ended ({}) after {:?} with {} alive",
            self.match_id,
            reason.as_str(),
            elapsed,
            self.alive_count()
        );

        let outcome = MatchOutcome {
            match_id: self.match_id.clone(),
            reason,
            duration: elapsed,
            prize_pool: self.prize_pool,
            participants: self
                .players
                .iter()
                .map(|p| Participant {
                    session_id: p.entrant.session_id.clone(),
                    wallet: p.entrant.wallet,
                    game_id: p.entrant.game_id,
                    player_name: p.entrant.player_name.clone(),
                    kills: p.kills,
                    alive: p.alive,
                    eliminated_after: p
                        .eliminated_at
                        .map(|at| at.saturating_duration_since(self.started_at)),
                    join_order: p.entrant.join_order,
                })
                .collect(),
        };
        let plan = self.ctx.settlement.plan(&outcome);

        let now = Instant::now();
        let ended = ServerMessage::GameEnded(GameEndedPayload {
            final_leaderboard: plan.leaderboard(elapsed),
            players: self.players.iter().map(|p| p.view(now)).collect(),
            prize_pool: plan.pool_share.to_string(),
            game_state: GameStatusView {
                is_active: false,
                time_remaining: self.time_remaining().as_millis() as u64,
                alive_count: self.alive_count(),
            },
            survivors: self
                .players
                .iter()
                .filter(|p| p.alive)
                .map(|p| p.entrant.session_id.clone())
                .collect(),
            reason: reason.as_str().to_string(),
        });
        self.ctx.registry.broadcast(&self.session_ids(), &ended).await;

        self.ctx.settlement.settle(&outcome, &plan).await;
    }
}

/// Gives back a life the game consumed. The lives count is read first so a
/// refund that lands without confirming is not paid again by the reconciler.
async fn refund_spent_life(
    ctx: &MatchContext,
    wallet: Address,
    game_id: GameId,
    session_id: &str,
    message: &str,
) {
    let lives_before = match ctx.ledger.get_player(wallet).await {
        Ok(player) => player.lives,
        Err(err) => {
            ctx.queue
                .flag(
                    wallet,
                    FlagReason::RefundUnverified { game_id },
                    Some(err.to_string()),
                )
                .await;
            return;
        }
    };
    match ctx.ledger.refund_life(wallet).await {
        Ok(_) => {
            ctx.registry
                .send(
                    session_id,
                    ServerMessage::LifeRefunded {
                        message: message.to_string(),
                    },
                )
                .await;
        }
        Err(err) => {
            tracing::error!("refundLife for {} failed: {}", wallet_hex(&wallet), err);
            ctx.queue
                .flag(
                    wallet,
                    FlagReason::RefundOwed {
                        game_id,
                        lives_before,
                    },
                    Some(err.to_string()),
                )
                .await;
        }
    }
}

/// Undoes a reservation whose life consumption failed, refunding the life if
/// the failed call in fact consumed it.
async fn refund_unstarted(ctx: MatchContext, entrant: Entrant) {
    let wallet = entrant.wallet;
    match ctx.ledger.get_game(entrant.game_id).await {
        Ok(game) if game.life_consumed => {
            if !game.is_completed {
                if let Err(err) = ctx.ledger.end_game(wallet, entrant.game_id, 0).await {
                    tracing::warn!("Closing unstarted game {} failed: {}", entrant.game_id, err);
                }
            }
            refund_spent_life(
                &ctx,
                wallet,
                entrant.game_id,
                &entrant.session_id,
                "Your match could not start; your life has been refunded",
            )
            .await;
        }
        Ok(_) => {
            let outcome = release_reservation(ctx.ledger.as_ref(), wallet, entrant.game_id).await;
            if outcome.is_released() {
                ctx.registry
                    .send(
                        &entrant.session_id,
                        ServerMessage::LifeRefunded {
                            message: "Your match could not start; no life was spent".to_string(),
                        },
                    )
                    .await;
            } else {
                ctx.queue
                    .flag(
                        wallet,
                        FlagReason::ReleaseFailed {
                            game_id: entrant.game_id,
                        },
                        None,
                    )
                    .await;
            }
        }
        Err(err) => {
            tracing::error!(
                "Game {} for {} unreadable after failed start: {}",
                entrant.game_id,
                wallet_hex(&wallet),
                err
            );
            ctx.queue
                .flag(
                    wallet,
                    FlagReason::RefundUnverified {
                        game_id: entrant.game_id,
                    },
                    Some(err.to_string()),
                )
                .await;
        }
    }
    ctx.registry.release(&entrant.session_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::AppError;
    use crate::services::ledger_sim::SimulatedLedger;
    use crate::services::onchain::LedgerOp;
    use crate::services::reconciliation::{ReconcileAction, Reconciler};

    struct Harness {
        ledger: Arc<SimulatedLedger>,
        registry: SessionRegistry,
        queue: ReconciliationQueue,
        directory: Arc<MatchDirectory>,
    }

    fn harness() -> Harness {
        let config = Config::for_tests();
        let ledger = Arc::new(SimulatedLedger::new(3, U256::from(10_000u64)));
        let registry = SessionRegistry::new();
        let queue = ReconciliationQueue::new();
        let settlement = Arc::new(SettlementEngine::new(
            ledger.clone(),
            registry.clone(),
            queue.clone(),
            config.settlement_settings(),
        ));
        let directory = MatchDirectory::new(MatchContext {
            ledger: ledger.clone(),
            registry: registry.clone(),
            settlement,
            queue: queue.clone(),
            settings: config.match_settings(),
        });
        Harness {
            ledger,
            registry,
            queue,
            directory,
        }
    }

    /// The transport side of a session: owns the strong sender.
    struct Inbox {
        _tx: mpsc::UnboundedSender<ServerMessage>,
        rx: mpsc::UnboundedReceiver<ServerMessage>,
    }

    async fn entrants(h: &Harness, count: u8) -> (Vec<Entrant>, Vec<Inbox>) {
        let mut entrants = Vec::new();
        let mut inboxes = Vec::new();
        for n in 1..=count {
            let (tx, rx) = mpsc::unbounded_channel();
            let session_id = h.registry.connect(&tx).await;
            let wallet = Address::repeat_byte(n);
            h.registry.bind_wallet(&session_id, wallet, None, None).await.unwrap();
            let reservation = h.ledger.reserve_game(wallet).await.unwrap();
            h.registry.admit(&session_id, "l_test", reservation.game_id).await;
            entrants.push(Entrant {
                session_id,
                wallet,
                game_id: reservation.game_id,
                player_name: Some(format!("worm{}", n)),
                color: None,
                join_order: usize::from(n),
            });
            inboxes.push(Inbox { _tx: tx, rx });
        }
        (entrants, inboxes)
    }

    fn drain(inbox: &mut Inbox) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(message) = inbox.rx.try_recv() {
            out.push(message);
        }
        out
    }

    async fn settle_time() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn end_reason_is_claimed_once_with_survivor_precedence() {
        let limit = Duration::from_secs(60);
        assert_eq!(evaluate_end(3, 2, Duration::from_secs(10), limit), None);
        assert_eq!(
            evaluate_end(3, 1, Duration::from_secs(61), limit),
            Some(EndReason::LastSurvivor)
        );
        assert_eq!(
            evaluate_end(3, 2, Duration::from_secs(60), limit),
            Some(EndReason::TimeLimit)
        );
        // A solo match only ends on time (or when its player leaves).
        assert_eq!(evaluate_end(1, 1, Duration::from_secs(1), limit), None);
        assert_eq!(
            evaluate_end(1, 0, Duration::from_secs(1), limit),
            Some(EndReason::LastSurvivor)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn all_entrants_get_started_and_snapshot() {
        let h = harness();
        let (entrants, mut inboxes) = entrants(&h, 3).await;
        let match_id = h.directory.launch(entrants.clone()).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(h.ledger.count(LedgerOp::Start).await, 3);
        let summary = h.directory.summaries().await;
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].players, 3);
        for (entrant, inbox) in entrants.iter().zip(inboxes.iter_mut()) {
            let kinds: Vec<&str> = drain(inbox).iter().map(|m| m.kind()).collect::<Vec<_>>();
            assert_eq!(kinds[0], "GAME_STARTED");
            assert_eq!(kinds[1], "GAME_JOINED");
            assert_eq!(
                h.registry.get(&entrant.session_id).await.unwrap().membership,
                Membership::Match(match_id.clone())
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_start_excludes_and_refunds_player() {
        let h = harness();
        let (entrants, mut inboxes) = entrants(&h, 3).await;
        h.ledger
            .fail_next(LedgerOp::Start, AppError::TransactionFailed("reverted".into()))
            .await;
        let failed = entrants[0].clone();
        h.directory.launch(entrants).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        settle_time().await;

        let summary = h.directory.summaries().await;
        assert_eq!(summary[0].players, 2);
        let kinds: Vec<&str> = drain(&mut inboxes[0]).iter().map(|m| m.kind()).collect::<Vec<_>>();
        assert!(kinds.contains(&"LIFE_REFUNDED"));
        assert!(!kinds.contains(&"GAME_STARTED"));
        let player = h.ledger.get_player(failed.wallet).await.unwrap();
        assert!(!player.is_active);
        assert_eq!(player.lives, 3);
        assert_eq!(
            h.registry.get(&failed.session_id).await.unwrap().membership,
            Membership::Idle
        );
    }

    #[tokio::test(start_paused = true)]
    async fn lone_starter_is_aborted_and_refunded() {
        let h = harness();
        let (entrants, mut inboxes) = entrants(&h, 2).await;
        h.ledger
            .fail_next(LedgerOp::Start, AppError::TransactionFailed("reverted".into()))
            .await;
        let survivor = entrants[1].clone();
        h.directory.launch(entrants).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        settle_time().await;

        assert_eq!(h.directory.len().await, 0);
        let kinds: Vec<&str> = drain(&mut inboxes[1]).iter().map(|m| m.kind()).collect::<Vec<_>>();
        assert!(kinds.contains(&"MATCH_CANCELED"));
        assert!(kinds.contains(&"LIFE_REFUNDED"));
        assert_eq!(h.ledger.get_player(survivor.wallet).await.unwrap().lives, 3);
        assert_eq!(h.ledger.count_for(LedgerOp::End, survivor.wallet).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_abort_refund_is_not_paid_twice() {
        let h = harness();
        let (entrants, _inboxes) = entrants(&h, 2).await;
        h.ledger
            .fail_next(LedgerOp::Start, AppError::TransactionFailed("reverted".into()))
            .await;
        h.ledger
            .fail_after_apply(LedgerOp::RefundLife, AppError::TransactionTimeout(60))
            .await;
        let survivor = entrants[1].clone();
        h.directory.launch(entrants).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        settle_time().await;

        let flag = h.queue.get(survivor.wallet).await.unwrap();
        assert!(matches!(
            flag.reason,
            FlagReason::RefundOwed { lives_before: 2, .. }
        ));
        assert_eq!(h.ledger.get_player(survivor.wallet).await.unwrap().lives, 3);

        let reconciler = Reconciler::new(
            h.ledger.clone(),
            h.registry.clone(),
            h.queue.clone(),
            100,
        );
        assert_eq!(
            reconciler.reconcile_wallet(survivor.wallet).await.unwrap(),
            ReconcileAction::Clean
        );
        assert_eq!(h.ledger.get_player(survivor.wallet).await.unwrap().lives, 3);
        assert_eq!(h.ledger.count_for(LedgerOp::RefundLife, survivor.wallet).await, 1);
        assert!(h.queue.get(survivor.wallet).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn kill_claims_during_spawn_protection_are_rejected() {
        let h = harness();
        let (entrants, _inboxes) = entrants(&h, 2).await;
        let (killer, victim) = (entrants[0].clone(), entrants[1].clone());
        let match_id = h.directory.launch(entrants).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        for (entrant, x, y) in [(&killer, 500.0, 500.0), (&victim, 480.0, 505.0)] {
            h.directory
                .send(
                    &match_id,
                    MatchCommand::Update {
                        session_id: entrant.session_id.clone(),
                        data: PlayerUpdateData { x, y, angle: 0.0 },
                    },
                )
                .await;
        }
        let claim = || MatchCommand::Kill {
            session_id: killer.session_id.clone(),
            victim_id: victim.session_id.clone(),
        };
        h.directory.send(&match_id, claim()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.directory.summaries().await[0].alive, 2);
        assert_eq!(h.ledger.count(LedgerOp::RecordKill).await, 0);

        // Same positions once protection has lapsed: the claim now stands.
        tokio::time::sleep(Duration::from_secs(2)).await;
        h.directory.send(&match_id, claim()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        settle_time().await;
        assert_eq!(h.ledger.count(LedgerOp::RecordKill).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_mid_match_finalizes_with_last_known_kills() {
        let h = harness();
        let (entrants, _inboxes) = entrants(&h, 6).await;
        let killer = entrants[0].clone();
        let match_id = h.directory.launch(entrants.clone()).await;

        // Let invulnerability lapse.
        tokio::time::sleep(Duration::from_secs(3)).await;

        h.directory
            .send(
                &match_id,
                MatchCommand::Update {
                    session_id: killer.session_id.clone(),
                    data: PlayerUpdateData {
                        x: 500.0,
                        y: 500.0,
                        angle: 0.0,
                    },
                },
            )
            .await;
        for victim in &entrants[1..5] {
            h.directory
                .send(
                    &match_id,
                    MatchCommand::Update {
                        session_id: victim.session_id.clone(),
                        data: PlayerUpdateData {
                            x: 480.0,
                            y: 505.0,
                            angle: 0.0,
                        },
                    },
                )
                .await;
            h.directory
                .send(
                    &match_id,
                    MatchCommand::Kill {
                        session_id: killer.session_id.clone(),
                        victim_id: victim.session_id.clone(),
                    },
                )
                .await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let summary = h.directory.summaries().await;
        assert_eq!(summary[0].alive, 2);

        h.directory
            .send(
                &match_id,
                MatchCommand::Disconnect {
                    session_id: killer.session_id.clone(),
                },
            )
            .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        settle_time().await;

        let ends: Vec<_> = h
            .ledger
            .journal()
            .await
            .into_iter()
            .filter(|call| call.op == LedgerOp::End && call.player == Some(killer.wallet))
            .collect();
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0].kills, Some(4));
        assert_eq!(h.ledger.count(LedgerOp::End).await, 6);
        assert_eq!(h.ledger.count(LedgerOp::RecordKill).await, 4);
        assert!(!h.ledger.get_player(killer.wallet).await.unwrap().is_active);
    }

    #[tokio::test(start_paused = true)]
    async fn time_limit_ends_match_and_pays_survivors() {
        let h = harness();
        let (entrants, mut inboxes) = entrants(&h, 2).await;
        h.directory.launch(entrants.clone()).await;
        tokio::time::sleep(Duration::from_secs(61)).await;
        settle_time().await;

        assert_eq!(h.directory.len().await, 0);
        let ended = drain(&mut inboxes[0])
            .into_iter()
            .find_map(|m| match m {
                ServerMessage::GameEnded(payload) => Some(payload),
                _ => None,
            })
            .unwrap();
        assert_eq!(ended.reason, "time_limit");
        assert_eq!(ended.survivors.len(), 2);
        assert_eq!(h.ledger.count(LedgerOp::End).await, 2);
        assert_eq!(h.ledger.count(LedgerOp::DistributePrizes).await, 1);
        for entrant in &entrants {
            assert_eq!(
                h.registry.get(&entrant.session_id).await.unwrap().membership,
                Membership::Idle
            );
        }
    }
}
