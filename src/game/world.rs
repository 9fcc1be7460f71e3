//! Game World
//!
//! Maps sessions to players and fans world events out to every connected
//! session. Game packet handlers are installed on each session at connect and
//! hold only a weak reference back to the world.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::future::{join_all, BoxFuture};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::garbage::{GarbageConfig, GarbageError, GarbageState, Verdict};
use super::player::{MovementPolicy, Player};
use crate::core::rng::ChallengeRng;
use crate::network::auth::LoginStore;
use crate::network::codec::{BincodeCodec, Codec};
use crate::network::packet::{OpCode, PacketWriter};
use crate::network::protocol::{
    ChatBroadcast, ClientChat, ClientMove, GarbageAck, GarbageChallenge, GarbageResponse, Message,
    PlayerConnected, PlayerInfo, PlayerMoved, PlayerRoster,
};
use crate::network::session::{DisconnectNotifier, Session};

/// World configuration.
#[derive(Debug, Clone)]
pub struct WorldConfig {
    /// Edge behaviour for movement.
    pub movement: MovementPolicy,
    /// Challenge parameters.
    pub garbage: GarbageConfig,
    /// Per-recipient limit on a broadcast write.
    pub broadcast_timeout: Duration,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            movement: MovementPolicy::Clamp,
            garbage: GarbageConfig::default(),
            broadcast_timeout: Duration::from_secs(1),
        }
    }
}

/// Resolves display names for identities.
pub trait NameResolver: Send + Sync {
    /// Name for `id`, if known.
    fn resolve_name(&self, id: &Uuid) -> Option<String>;
}

impl NameResolver for LoginStore {
    fn resolve_name(&self, id: &Uuid) -> Option<String> {
        self.name_of(id)
    }
}

struct Entry {
    session: Arc<Session>,
    player: Arc<tokio::sync::Mutex<Player>>,
}

/// A player already present for a session's identity.
enum Bound {
    /// Bound to this very session.
    Same,
    /// Bound to another session object for the same identity.
    Other(Arc<tokio::sync::Mutex<Player>>),
}

fn bound(players: &BTreeMap<Uuid, Entry>, session: &Arc<Session>) -> Option<Bound> {
    players.get(&session.id()).map(|entry| {
        if Arc::ptr_eq(&entry.session, session) {
            Bound::Same
        } else {
            Bound::Other(entry.player.clone())
        }
    })
}

enum GarbageReply {
    Ack(u32),
    Challenge(GarbageChallenge),
    Close,
}

/// The shared world.
pub struct GameWorld {
    config: WorldConfig,
    names: Arc<dyn NameResolver>,
    players: RwLock<BTreeMap<Uuid, Entry>>,
    broadcaster: tokio::sync::Mutex<PacketWriter<BincodeCodec>>,
    rng: Mutex<ChallengeRng>,
    this: Weak<GameWorld>,
}

impl GameWorld {
    /// Create a world.
    pub fn new(config: WorldConfig, names: Arc<dyn NameResolver>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            names,
            players: RwLock::new(BTreeMap::new()),
            broadcaster: tokio::sync::Mutex::new(PacketWriter::new(BincodeCodec)),
            rng: Mutex::new(ChallengeRng::from_clock()),
            this: this.clone(),
        })
    }

    /// Connected player count.
    pub async fn player_count(&self) -> usize {
        self.players.read().await.len()
    }

    /// Public view of one player.
    pub async fn player(&self, id: &Uuid) -> Option<PlayerInfo> {
        let player = self.player_handle(id).await?;
        let info = player.lock().await.info();
        Some(info)
    }

    /// Public view of every player.
    pub async fn roster(&self) -> Vec<PlayerInfo> {
        let handles: Vec<_> = {
            let players = self.players.read().await;
            players.values().map(|e| e.player.clone()).collect()
        };
        let mut roster = Vec::with_capacity(handles.len());
        for handle in handles {
            roster.push(handle.lock().await.info());
        }
        roster
    }

    async fn player_handle(&self, id: &Uuid) -> Option<Arc<tokio::sync::Mutex<Player>>> {
        self.players.read().await.get(id).map(|e| e.player.clone())
    }

    fn issue_challenge(&self, state: &mut GarbageState) -> GarbageChallenge {
        let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
        state.issue(&mut rng, &self.config.garbage)
    }

    fn display_name(&self, id: &Uuid) -> String {
        self.names
            .resolve_name(id)
            .unwrap_or_else(|| format!("player-{}", hex::encode(&id.as_bytes()[..4])))
    }

    // =========================================================================
    // MEMBERSHIP
    // =========================================================================

    /// Add the session's player. Returns false if it was already present
    /// on this session. A player bound to another session for the same
    /// identity moves over to this one.
    pub async fn connect(&self, session: Arc<Session>) -> bool {
        let id = session.id();
        let existing = bound(&*self.players.read().await, &session);
        if let Some(existing) = existing {
            return self.take_over(session, existing).await;
        }

        self.install_routes(&session);

        let mut player = Player::new(id, self.display_name(&id));
        let challenge = self.issue_challenge(&mut player.garbage);
        let info = player.info();

        {
            let mut players = self.players.write().await;
            if let Some(existing) = bound(&players, &session) {
                drop(players);
                return self.take_over(session, existing).await;
            }
            players.insert(
                id,
                Entry {
                    session: session.clone(),
                    player: Arc::new(tokio::sync::Mutex::new(player)),
                },
            );
        }
        info!("Player {} ({}) connected", info.name, id);

        self.broadcast(&PlayerConnected { player: info, connected: true }).await;
        let roster = PlayerRoster { players: self.roster().await };
        self.unicast(&session, &roster).await;
        self.unicast(&session, &challenge).await;
        true
    }

    /// Remove the session's player. Returns false if it was not present.
    pub async fn disconnect(&self, session: &Session) -> bool {
        let removed = self.players.write().await.remove(&session.id());
        let entry = match removed {
            Some(entry) => entry,
            None => return false,
        };

        let info = entry.player.lock().await.info();
        info!("Player {} ({}) disconnected", info.name, info.id);
        self.broadcast(&PlayerConnected { player: info, connected: false }).await;
        true
    }

    /// Bring a reconnected session up to date. Position and challenge
    /// progress are kept.
    pub async fn reconnect(&self, session: Arc<Session>) {
        match self.player_handle(&session.id()).await {
            Some(player) => self.rebind(session, player).await,
            None => {
                self.connect(session).await;
            }
        }
    }

    async fn take_over(&self, session: Arc<Session>, existing: Bound) -> bool {
        match existing {
            Bound::Same => {
                debug!("Player {} already connected", session.id());
                false
            }
            Bound::Other(player) => {
                self.rebind(session, player).await;
                true
            }
        }
    }

    /// Point the player's entry at `session` and send it the current state.
    async fn rebind(&self, session: Arc<Session>, player: Arc<tokio::sync::Mutex<Player>>) {
        let id = session.id();
        self.install_routes(&session);
        if let Some(entry) = self.players.write().await.get_mut(&id) {
            entry.session = session.clone();
        }

        let (info, challenge) = {
            let mut player = player.lock().await;
            let challenge = if player.garbage.needs_challenge() {
                self.issue_challenge(&mut player.garbage)
            } else {
                player.garbage.challenge()
            };
            (player.info(), challenge)
        };
        info!("Player {} ({}) reconnected", info.name, id);

        self.unicast(&session, &PlayerConnected { player: info, connected: true }).await;
        let roster = PlayerRoster { players: self.roster().await };
        self.unicast(&session, &roster).await;
        self.unicast(&session, &challenge).await;
    }

    // =========================================================================
    // DELIVERY
    // =========================================================================

    /// Send `message` to every connected session. The message is encoded
    /// once; a failing or slow recipient does not hold up the others.
    pub async fn broadcast<M: Message>(&self, message: &M) {
        let mut writer = self.broadcaster.lock().await;
        let frame = match writer.encode(M::OPCODE, message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode {:?} broadcast: {}", M::OPCODE, e);
                return;
            }
        };

        let players = self.players.read().await;
        let timeout = self.config.broadcast_timeout;
        let sends = players.values().map(|entry| {
            let session = entry.session.clone();
            async move {
                match tokio::time::timeout(timeout, session.send_frame(frame)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => debug!("Broadcast to {} failed: {}", session.id(), e),
                    Err(_) => warn!("Broadcast to {} timed out", session.id()),
                }
            }
        });
        join_all(sends).await;
    }

    async fn unicast<M: Message>(&self, session: &Session, message: &M) {
        if let Err(e) = session.send(message).await {
            debug!("Send {:?} to {} failed: {}", M::OPCODE, session.id(), e);
        }
    }

    // =========================================================================
    // HANDLERS
    // =========================================================================

    fn install_routes(&self, session: &Session) {
        self.route(session, OpCode::ClientChat, GameWorld::handle_chat);
        self.route(session, OpCode::ClientMove, GameWorld::handle_move);
        self.route(session, OpCode::GarbageResponse, GameWorld::handle_garbage);
    }

    fn route<F, Fut>(&self, session: &Session, opcode: OpCode, handler: F)
    where
        F: Fn(Arc<GameWorld>, Arc<Session>, Vec<u8>) -> Fut + Send + Sync + Copy + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let world = self.this.clone();
        session.add_handler(opcode, move |session, payload| {
            let world = world.upgrade();
            async move {
                if let Some(world) = world {
                    handler(world, session, payload).await;
                }
            }
        });
    }

    async fn handle_chat(self: Arc<Self>, session: Arc<Session>, payload: Vec<u8>) {
        let chat: ClientChat = match BincodeCodec.decode(&payload) {
            Ok(chat) => chat,
            Err(e) => {
                warn!("Bad chat from {}: {}", session.id(), e);
                return;
            }
        };
        let player = match self.player_handle(&session.id()).await {
            Some(player) => player,
            None => return,
        };

        let name = player.lock().await.name.clone();
        debug!("Chat from {}: {}", name, chat.text);
        self.broadcast(&ChatBroadcast { name, text: chat.text }).await;
    }

    async fn handle_move(self: Arc<Self>, session: Arc<Session>, payload: Vec<u8>) {
        let movement: ClientMove = match BincodeCodec.decode(&payload) {
            Ok(movement) => movement,
            Err(e) => {
                warn!("Bad move from {}: {}", session.id(), e);
                return;
            }
        };
        let player = match self.player_handle(&session.id()).await {
            Some(player) => player,
            None => return,
        };

        let moved = {
            let mut player = player.lock().await;
            if player.step(movement.dx, movement.dy, self.config.movement) {
                Some(player.info())
            } else {
                None
            }
        };

        if let Some(who) = moved {
            debug!("Player {} moved to ({}, {})", who.name, who.x, who.y);
            self.broadcast(&PlayerMoved { who }).await;
        }
    }

    async fn handle_garbage(self: Arc<Self>, session: Arc<Session>, payload: Vec<u8>) {
        let player = match self.player_handle(&session.id()).await {
            Some(player) => player,
            None => return,
        };
        let response = BincodeCodec
            .decode::<GarbageResponse>(&payload)
            .map_err(|e| GarbageError::Malformed(e.to_string()));

        let reply = {
            let mut player = player.lock().await;
            match response.and_then(|r| player.garbage.verify(&r.hashes)) {
                Ok(verdict) => {
                    player.garbage.record_success();
                    match verdict {
                        Verdict::Complete => {
                            info!("Player {} finished a challenge", player.name);
                            GarbageReply::Challenge(self.issue_challenge(&mut player.garbage))
                        }
                        Verdict::Progress { remaining } => GarbageReply::Ack(remaining),
                    }
                }
                Err(e) => {
                    warn!("Garbage from {} rejected: {}", player.name, e);
                    if player.garbage.record_failure(self.config.garbage.max_failed_rounds) {
                        GarbageReply::Close
                    } else {
                        GarbageReply::Challenge(self.issue_challenge(&mut player.garbage))
                    }
                }
            }
        };

        match reply {
            GarbageReply::Ack(remaining) => self.unicast(&session, &GarbageAck { remaining }).await,
            GarbageReply::Challenge(challenge) => self.unicast(&session, &challenge).await,
            GarbageReply::Close => {
                warn!("Closing {}: too many failed garbage rounds", session.id());
                session.close().await;
            }
        }
    }
}

impl DisconnectNotifier for GameWorld {
    fn on_disconnect(&self, session: Arc<Session>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.disconnect(&session).await;
        })
    }
}
