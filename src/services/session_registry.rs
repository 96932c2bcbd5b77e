use ethers::types::Address;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard, RwLock};

use crate::{
    error::{AppError, Result},
    models::ServerMessage,
    utils::{now_millis, random_id, wallet_hex},
};

use super::onchain::GameId;

pub type SessionId = String;
pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

/// Where a session currently is. Lobby and match membership are exclusive
/// by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Membership {
    Idle,
    Lobby(String),
    Match(String),
}

impl Membership {
    pub fn is_idle(&self) -> bool {
        matches!(self, Membership::Idle)
    }

    pub fn label(&self) -> String {
        match self {
            Membership::Idle => "idle".to_string(),
            Membership::Lobby(id) => format!("lobby:{}", id),
            Membership::Match(id) => format!("match:{}", id),
        }
    }
}

#[derive(Debug)]
struct PlayerSession {
    wallet: Option<Address>,
    player_name: Option<String>,
    color: Option<u32>,
    // The transport owns the strong sender; a dropped socket leaves this dangling.
    outbound: Option<mpsc::WeakUnboundedSender<ServerMessage>>,
    membership: Membership,
    lives_snapshot: Option<u64>,
    reserved_game_id: Option<GameId>,
    ledger_guard: Arc<Mutex<()>>,
    connected: bool,
    connected_at: i64,
}

impl PlayerSession {
    /// A disconnected session is kept as a tombstone while anything still
    /// references it: a membership, a reservation or an in-flight ledger call.
    fn reapable(&self) -> bool {
        !self.connected
            && self.membership.is_idle()
            && self.reserved_game_id.is_none()
            && Arc::strong_count(&self.ledger_guard) == 1
            && self.ledger_guard.try_lock().is_ok()
    }
}

/// Read-only copy of a session handed to callers.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub session_id: SessionId,
    pub wallet: Option<Address>,
    pub player_name: Option<String>,
    pub color: Option<u32>,
    pub membership: Membership,
    pub lives_snapshot: Option<u64>,
    pub reserved_game_id: Option<GameId>,
    pub connected: bool,
    pub connected_at: i64,
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionId, PlayerSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh connection and returns its server-generated id.
    pub async fn connect(&self, outbound: &Outbound) -> SessionId {
        let session_id = random_id("s");
        let session = PlayerSession {
            wallet: None,
            player_name: None,
            color: None,
            outbound: Some(outbound.downgrade()),
            membership: Membership::Idle,
            lives_snapshot: None,
            reserved_game_id: None,
            ledger_guard: Arc::new(Mutex::new(())),
            connected: true,
            connected_at: now_millis(),
        };
        self.sessions
            .write()
            .await
            .insert(session_id.clone(), session);
        tracing::debug!("Session {} connected", session_id);
        session_id
    }

    /// Marks the session disconnected and returns its membership at that moment.
    pub async fn disconnect(&self, session_id: &str) -> Option<Membership> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(session_id)?;
        session.connected = false;
        session.outbound = None;
        let membership = session.membership.clone();
        if session.reapable() {
            sessions.remove(session_id);
            tracing::debug!("Session {} removed", session_id);
        } else {
            tracing::debug!("Session {} tombstoned ({})", session_id, membership.label());
        }
        Some(membership)
    }

    /// Drops a tombstone once nothing references it any more.
    pub async fn reap(&self, session_id: &str) {
        let mut sessions = self.sessions.write().await;
        if sessions.get(session_id).is_some_and(|s| s.reapable()) {
            sessions.remove(session_id);
            tracing::debug!("Tombstone {} reaped", session_id);
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionView> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|session| view(session_id, session))
    }

    pub async fn find_by_wallet(&self, wallet: Address) -> Vec<SessionView> {
        self.sessions
            .read()
            .await
            .iter()
            .filter(|(_, session)| session.wallet == Some(wallet))
            .map(|(id, session)| view(id, session))
            .collect()
    }

    /// Binds a wallet to the session. The binding is immutable, and a wallet
    /// held by another busy session cannot be bound again.
    pub async fn bind_wallet(
        &self,
        session_id: &str,
        wallet: Address,
        player_name: Option<String>,
        color: Option<u32>,
    ) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let held_elsewhere = sessions.iter().any(|(id, other)| {
            id != session_id
                && other.wallet == Some(wallet)
                && (!other.membership.is_idle()
                    || other.reserved_game_id.is_some()
                    || other.ledger_guard.try_lock().is_err())
        });
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| AppError::NotFound(format!("Session {} not found", session_id)))?;

        match session.wallet {
            Some(bound) if bound != wallet => {
                return Err(AppError::BadRequest(format!(
                    "Session is already bound to wallet {}",
                    wallet_hex(&bound)
                )));
            }
            Some(_) => {}
            None => {
                if held_elsewhere {
                    return Err(AppError::AlreadyActive(format!(
                        "Wallet {} is in use by another connection",
                        wallet_hex(&wallet)
                    )));
                }
                session.wallet = Some(wallet);
            }
        }
        if player_name.is_some() {
            session.player_name = player_name;
        }
        if color.is_some() {
            session.color = color;
        }
        Ok(())
    }

    pub async fn ledger_guard(&self, session_id: &str) -> Option<Arc<Mutex<()>>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|session| session.ledger_guard.clone())
    }

    /// Claims the per-session ledger slot; `AlreadyActive` if an operation is in flight.
    pub async fn try_claim_ledger(&self, session_id: &str) -> Result<OwnedMutexGuard<()>> {
        let guard = self
            .ledger_guard(session_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("Session {} not found", session_id)))?;
        guard.try_lock_owned().map_err(|_| {
            AppError::AlreadyActive("A ledger operation is already in flight".to_string())
        })
    }

    pub async fn set_membership(&self, session_id: &str, membership: Membership) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.membership = membership;
        }
    }

    pub async fn set_reservation(&self, session_id: &str, game_id: Option<GameId>) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.reserved_game_id = game_id;
        }
    }

    pub async fn set_lives(&self, session_id: &str, lives: u64) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.lives_snapshot = Some(lives);
        }
    }

    /// Records a confirmed reservation together with the lobby it admitted the session to.
    pub async fn admit(&self, session_id: &str, lobby_id: &str, game_id: GameId) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.membership = Membership::Lobby(lobby_id.to_string());
            session.reserved_game_id = Some(game_id);
        }
    }

    /// Returns the session to idle once its reservation is resolved on-chain.
    pub async fn release(&self, session_id: &str) {
        {
            let mut sessions = self.sessions.write().await;
            if let Some(session) = sessions.get_mut(session_id) {
                session.membership = Membership::Idle;
                session.reserved_game_id = None;
            }
        }
        self.reap(session_id).await;
    }

    /// Clears a reservation mirror for every session bound to `wallet`.
    pub async fn clear_wallet_reservation(&self, wallet: Address) {
        let ids: Vec<SessionId> = {
            let mut sessions = self.sessions.write().await;
            sessions
                .iter_mut()
                .filter(|(_, session)| session.wallet == Some(wallet))
                .filter(|(_, session)| session.membership.is_idle())
                .map(|(id, session)| {
                    session.reserved_game_id = None;
                    id.clone()
                })
                .collect()
        };
        for id in ids {
            self.reap(&id).await;
        }
    }

    /// True while the wallet is bound to a lobby or match in memory.
    pub async fn wallet_in_play(&self, wallet: Address) -> bool {
        self.sessions
            .read()
            .await
            .values()
            .any(|session| session.wallet == Some(wallet) && !session.membership.is_idle())
    }

    /// Sends to one session. Returns false when the session is gone or its socket closed.
    pub async fn send(&self, session_id: &str, message: ServerMessage) -> bool {
        let outbound = self
            .sessions
            .read()
            .await
            .get(session_id)
            .and_then(|session| session.outbound.as_ref())
            .and_then(|weak| weak.upgrade());
        match outbound {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    pub async fn broadcast<'a, I>(&self, session_ids: I, message: &ServerMessage)
    where
        I: IntoIterator<Item = &'a SessionId>,
    {
        let sessions = self.sessions.read().await;
        for id in session_ids {
            if let Some(tx) = sessions
                .get(id)
                .and_then(|session| session.outbound.as_ref())
                .and_then(|weak| weak.upgrade())
            {
                let _ = tx.send(message.clone());
            }
        }
    }

    pub async fn connected_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|session| session.connected)
            .count()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

fn view(session_id: &str, session: &PlayerSession) -> SessionView {
    SessionView {
        session_id: session_id.to_string(),
        wallet: session.wallet,
        player_name: session.player_name.clone(),
        color: session.color,
        membership: session.membership.clone(),
        lives_snapshot: session.lives_snapshot,
        reserved_game_id: session.reserved_game_id,
        connected: session.connected,
        connected_at: session.connected_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wallet(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    #[tokio::test]
    async fn wallet_binding_is_immutable() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry.connect(&tx).await;
        registry.bind_wallet(&id, wallet(1), None, None).await.unwrap();
        registry.bind_wallet(&id, wallet(1), Some("worm".into()), None).await.unwrap();
        assert!(matches!(
            registry.bind_wallet(&id, wallet(2), None, None).await,
            Err(AppError::BadRequest(_))
        ));
        assert_eq!(
            registry.get(&id).await.unwrap().player_name.as_deref(),
            Some("worm")
        );
    }

    #[tokio::test]
    async fn busy_wallet_cannot_be_bound_twice() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = registry.connect(&tx).await;
        let second = registry.connect(&tx).await;
        registry.bind_wallet(&first, wallet(3), None, None).await.unwrap();
        registry.admit(&first, "l_1", 7).await;
        assert!(matches!(
            registry.bind_wallet(&second, wallet(3), None, None).await,
            Err(AppError::AlreadyActive(_))
        ));
    }

    #[tokio::test]
    async fn disconnect_tombstones_until_released() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry.connect(&tx).await;
        registry.bind_wallet(&id, wallet(4), None, None).await.unwrap();
        registry.admit(&id, "l_1", 9).await;

        let membership = registry.disconnect(&id).await.unwrap();
        assert_eq!(membership, Membership::Lobby("l_1".into()));
        assert!(registry.get(&id).await.is_some());
        assert!(!registry.send(&id, ServerMessage::Pong { timestamp: None, server_time: 0 }).await);

        registry.release(&id).await;
        assert!(registry.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn idle_disconnect_removes_immediately() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry.connect(&tx).await;
        registry.disconnect(&id).await;
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn ledger_slot_is_exclusive() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry.connect(&tx).await;
        let held = registry.try_claim_ledger(&id).await.unwrap();
        assert!(matches!(
            registry.try_claim_ledger(&id).await,
            Err(AppError::AlreadyActive(_))
        ));
        drop(held);
        assert!(registry.try_claim_ledger(&id).await.is_ok());
    }

    #[tokio::test]
    async fn send_reaches_live_socket() {
        let registry = SessionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = registry.connect(&tx).await;
        assert!(registry.send(&id, ServerMessage::Pong { timestamp: Some(1), server_time: 2 }).await);
        assert_eq!(rx.recv().await.unwrap().kind(), "PONG");
    }
}
