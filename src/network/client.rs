//! Headless Client
//!
//! Logs in over HTTP, dials the stream endpoint and drives a [`Session`] from
//! the client side: heartbeats are echoed and garbage challenges are answered
//! at the requested rate until the server issues a new one. Used by the bot
//! binary and by end-to-end tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::hash::garbage_answer;
use crate::network::codec::{BincodeCodec, Codec};
use crate::network::packet::OpCode;
use crate::network::protocol::{
    ChatBroadcast, ClientChat, ClientMove, GarbageAck, GarbageChallenge, GarbageResponse,
    Heartbeat, PlayerConnected, PlayerMoved, PlayerRoster,
};
use crate::network::session::{Session, SessionConfig, SessionError};
use crate::network::transport::WsTransport;

/// Where a client connects.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Login endpoint.
    pub http_addr: SocketAddr,
    /// Stream endpoint.
    pub ws_addr: SocketAddr,
    /// Client-side session settings.
    pub session: SessionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([127, 0, 0, 1], 8770)),
            ws_addr: SocketAddr::from(([127, 0, 0, 1], 8771)),
            session: SessionConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `SIMPLEWT_HTTP_TARGET` and `SIMPLEWT_WS_TARGET`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(addr) = std::env::var("SIMPLEWT_HTTP_TARGET").ok().and_then(|v| v.parse().ok()) {
            config.http_addr = addr;
        }
        if let Some(addr) = std::env::var("SIMPLEWT_WS_TARGET").ok().and_then(|v| v.parse().ok()) {
            config.ws_addr = addr;
        }
        config
    }
}

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Reading the login response failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Login request could not be made.
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// Login refused or unreadable.
    #[error("Login failed: {0}")]
    Login(String),

    /// Dial or upgrade failed.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Session failed to start.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Counters a bot keeps about what the server sent.
#[derive(Debug, Default)]
pub struct ClientStats {
    /// Challenges received.
    pub challenges: AtomicU64,
    /// Acks received.
    pub acks: AtomicU64,
    /// Remaining total from the latest ack.
    pub remaining: AtomicU64,
    /// Chat lines received.
    pub chats: AtomicU64,
    /// Movement updates received.
    pub moves: AtomicU64,
}

/// Request a login code for `name`.
pub async fn login(http_addr: SocketAddr, name: &str) -> Result<String, ClientError> {
    let url = format!("http://{}/login", http_addr);
    let name = name.to_string();
    tokio::task::spawn_blocking(move || login_blocking(&url, &name))
        .await
        .map_err(|e| ClientError::Login(e.to_string()))?
}

fn login_blocking(url: &str, name: &str) -> Result<String, ClientError> {
    match ureq::get(url).query("name", name).call() {
        Ok(response) => Ok(response.into_string()?.trim().to_string()),
        Err(ureq::Error::Status(code, response)) => {
            let body = response.into_string().unwrap_or_default();
            Err(ClientError::Login(format!("{}: {}", code, body.trim())))
        }
        Err(ureq::Error::Transport(e)) => Err(ClientError::Http(e.to_string())),
    }
}

/// A connected headless client.
pub struct Client {
    name: String,
    session: Arc<Session>,
    stats: Arc<ClientStats>,
}

impl Client {
    /// Log in as `name` and open the stream.
    pub async fn connect(config: &ClientConfig, name: &str) -> Result<Self, ClientError> {
        let code = login(config.http_addr, name).await?;
        let url = format!("ws://{}/wt?code={}", config.ws_addr, code);
        let (socket, _) = connect_async(url).await?;

        let session = Arc::new(Session::new(
            Uuid::new_v4(),
            config.ws_addr.ip(),
            config.session.clone(),
        ));
        let stats = Arc::new(ClientStats::default());
        let (challenge_tx, challenge_rx) = watch::channel(None);

        install_handlers(&session, stats.clone(), challenge_tx);
        session.start(Arc::new(WsTransport::new(socket))).await?;
        tokio::spawn(session.clone().run());
        tokio::spawn(answer_challenges(session.clone(), challenge_rx));

        info!("Client {} connected to {}", name, config.ws_addr);
        Ok(Self {
            name: name.to_string(),
            session,
            stats,
        })
    }

    /// Name used at login.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Underlying session.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Counters.
    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    /// Say something.
    pub async fn chat(&self, text: &str) -> Result<(), SessionError> {
        self.session.send(&ClientChat { text: text.to_string() }).await?;
        Ok(())
    }

    /// Request a one-cell step.
    pub async fn step(&self, dx: i8, dy: i8) -> Result<(), SessionError> {
        self.session.send(&ClientMove { dx, dy }).await?;
        Ok(())
    }

    /// Hang up.
    pub async fn close(&self) {
        self.session.close().await;
    }
}

fn install_handlers(
    session: &Session,
    stats: Arc<ClientStats>,
    challenge_tx: watch::Sender<Option<GarbageChallenge>>,
) {
    session.add_handler(OpCode::Heartbeat, |session: Arc<Session>, payload: Vec<u8>| async move {
        if let Ok(hb) = BincodeCodec.decode::<Heartbeat>(&payload) {
            let _ = session.send(&hb).await;
        }
    });

    let challenges = stats.clone();
    session.add_handler(OpCode::GarbageChallenge, move |_session, payload: Vec<u8>| {
        match BincodeCodec.decode::<GarbageChallenge>(&payload) {
            Ok(challenge) => {
                debug!("Challenge: amount {} rate {}", challenge.amount, challenge.rate);
                challenges.challenges.fetch_add(1, Ordering::Relaxed);
                challenge_tx.send_replace(Some(challenge));
            }
            Err(e) => warn!("Bad challenge: {}", e),
        }
        async {}
    });

    let acks = stats.clone();
    session.add_handler(OpCode::GarbageAck, move |_session, payload: Vec<u8>| {
        if let Ok(ack) = BincodeCodec.decode::<GarbageAck>(&payload) {
            acks.acks.fetch_add(1, Ordering::Relaxed);
            acks.remaining.store(ack.remaining as u64, Ordering::Relaxed);
        }
        async {}
    });

    let chats = stats.clone();
    session.add_handler(OpCode::Chat, move |_session, payload: Vec<u8>| {
        if let Ok(chat) = BincodeCodec.decode::<ChatBroadcast>(&payload) {
            chats.chats.fetch_add(1, Ordering::Relaxed);
            debug!("<{}> {}", chat.name, chat.text);
        }
        async {}
    });

    let moves = stats;
    session.add_handler(OpCode::PlayerMoved, move |_session, payload: Vec<u8>| {
        if let Ok(moved) = BincodeCodec.decode::<PlayerMoved>(&payload) {
            moves.moves.fetch_add(1, Ordering::Relaxed);
            debug!("{} at ({}, {})", moved.who.name, moved.who.x, moved.who.y);
        }
        async {}
    });

    session.add_handler(OpCode::PlayerConnected, |_session, payload: Vec<u8>| {
        if let Ok(event) = BincodeCodec.decode::<PlayerConnected>(&payload) {
            debug!("{} connected: {}", event.player.name, event.connected);
        }
        async {}
    });

    session.add_handler(OpCode::PlayerRoster, |_session, payload: Vec<u8>| {
        if let Ok(roster) = BincodeCodec.decode::<PlayerRoster>(&payload) {
            debug!("Roster of {} players", roster.players.len());
        }
        async {}
    });
}

/// Answer the current challenge every `1 / rate` seconds until the next
/// one arrives or the session goes away.
async fn answer_challenges(session: Arc<Session>, mut challenges: watch::Receiver<Option<GarbageChallenge>>) {
    loop {
        let current = challenges.borrow_and_update().clone();
        let challenge = match current {
            Some(challenge) => challenge,
            None => {
                if challenges.changed().await.is_err() {
                    return;
                }
                continue;
            }
        };

        let response = GarbageResponse {
            hashes: garbage_answer(&challenge.base, challenge.amount),
        };
        let period = Duration::from_secs_f64(1.0 / challenge.rate.max(1) as f64);
        let mut ticker = interval(period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = session.send(&response).await {
                        debug!("Stopped answering challenges: {}", e);
                        return;
                    }
                }
                changed = challenges.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    break;
                }
            }
        }
    }
}
