//! Game Server
//!
//! Wires the pieces together:
//! - `GET /login?name=` on a blocking HTTP thread issues one-time codes
//! - `GET /wt?code=` upgrades to a WebSocket carrying the packet stream
//! - new identities get a fresh session, known ones reconnect
//! - background tasks prune idle sessions and expired codes

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tiny_http::{Method, Request, Response};
use url::form_urlencoded;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::interval;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as WsRequest, Response as WsResponse,
};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::game::world::{GameWorld, WorldConfig};
use crate::network::auth::{AuthConfig, LoginStore};
use crate::network::session::{
    DisconnectNotifier, HeartbeatConfig, SessionConfig, SessionError, SessionManager,
};
use crate::network::transport::{Transport, WsTransport};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Login endpoint address.
    pub http_addr: SocketAddr,
    /// Stream endpoint address.
    pub ws_addr: SocketAddr,
    /// Login codes.
    pub auth: AuthConfig,
    /// Session timing and limits.
    pub session: SessionConfig,
    /// World rules.
    pub world: WorldConfig,
    /// How often expired login codes are dropped.
    pub code_prune_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8770)),
            ws_addr: SocketAddr::from(([0, 0, 0, 0], 8771)),
            auth: AuthConfig::default(),
            session: SessionConfig::default(),
            world: WorldConfig::default(),
            code_prune_interval: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `SIMPLEWT_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(addr) = env_parse("SIMPLEWT_HTTP_ADDR") {
            config.http_addr = addr;
        }
        if let Some(addr) = env_parse("SIMPLEWT_WS_ADDR") {
            config.ws_addr = addr;
        }
        if let Some(secs) = env_parse::<u64>("SIMPLEWT_HEARTBEAT_SECS") {
            let wait = Duration::from_secs(secs.max(1));
            config.session.heartbeat = HeartbeatConfig {
                wait,
                period: wait.mul_f64(0.9),
                ..config.session.heartbeat
            };
        }
        if let Some(policy) = env_parse("SIMPLEWT_MOVEMENT") {
            config.world.movement = policy;
        }
        if let Some(rounds) = env_parse("SIMPLEWT_MAX_FAILED_ROUNDS") {
            config.world.garbage.max_failed_rounds = rounds;
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let value = std::env::var(key).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("Ignoring invalid {}={}", key, value);
            None
        }
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind the stream listener.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// Failed to start the login endpoint.
    #[error("HTTP error: {0}")]
    Http(String),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Session error.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Bound sockets, before serving.
pub struct Listeners {
    http: Arc<tiny_http::Server>,
    ws: TcpListener,
}

impl Listeners {
    /// Actual login endpoint address.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http.server_addr().to_ip()
    }

    /// Actual stream endpoint address.
    pub fn ws_addr(&self) -> std::io::Result<SocketAddr> {
        self.ws.local_addr()
    }
}

/// The game server.
pub struct GameServer {
    config: ServerConfig,
    logins: Arc<LoginStore>,
    sessions: Arc<SessionManager>,
    world: Arc<GameWorld>,
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let logins = Arc::new(LoginStore::new(config.auth.clone()));
        let sessions = Arc::new(SessionManager::new(config.session.clone()));
        let world = GameWorld::new(config.world.clone(), logins.clone());

        Self {
            config,
            logins,
            sessions,
            world,
            shutdown_tx,
        }
    }

    /// Login store.
    pub fn logins(&self) -> &Arc<LoginStore> {
        &self.logins
    }

    /// Session registry.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// The world.
    pub fn world(&self) -> &Arc<GameWorld> {
        &self.world
    }

    /// Bind both endpoints.
    pub async fn bind(&self) -> Result<Listeners, GameServerError> {
        let http = tiny_http::Server::http(self.config.http_addr)
            .map_err(|e| GameServerError::Http(e.to_string()))?;
        let ws = TcpListener::bind(self.config.ws_addr).await?;
        Ok(Listeners {
            http: Arc::new(http),
            ws,
        })
    }

    /// Bind and serve until shutdown.
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listeners = self.bind().await?;
        self.serve(listeners).await
    }

    /// Serve on already bound sockets until shutdown.
    #[instrument(skip_all)]
    pub async fn serve(&self, listeners: Listeners) -> Result<(), GameServerError> {
        let Listeners { http, ws: listener } = listeners;
        info!(
            "Login endpoint on {:?}, stream endpoint on {}",
            http.server_addr().to_ip(),
            listener.local_addr()?
        );

        let login_server = http.clone();
        let login_store = self.logins.clone();
        let login_thread = thread::spawn(move || serve_logins(login_server, login_store));

        let notifier: Arc<dyn DisconnectNotifier> = self.world.clone();
        let prune_handle = tokio::spawn(self.sessions.clone().run_prune_loop(notifier));
        let code_handle = tokio::spawn(Self::run_code_prune_loop(
            self.logins.clone(),
            self.config.code_prune_interval,
            self.shutdown_tx.subscribe(),
        ));

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        http.unblock();
        self.sessions.shutdown().await;
        code_handle.abort();
        let _ = prune_handle.await;
        if login_thread.join().is_err() {
            warn!("Login thread panicked");
        }

        Ok(())
    }

    /// Upgrade a stream connection and attach it to a session.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let logins = self.logins.clone();
        let sessions = self.sessions.clone();
        let world = self.world.clone();

        tokio::spawn(async move {
            let ip = addr.ip();
            let mut admission = None;

            let check = |request: &WsRequest, response: WsResponse| {
                match admit(request, ip, &logins, &sessions) {
                    Ok(id) => {
                        admission = Some(id);
                        Ok(response)
                    }
                    Err((status, reason)) => {
                        warn!("Rejected upgrade from {}: {}", addr, reason);
                        let mut rejection = ErrorResponse::new(Some(reason));
                        *rejection.status_mut() = status;
                        Err(rejection)
                    }
                }
            };

            let socket = match accept_hdr_async(stream, check).await {
                Ok(socket) => socket,
                Err(e) => {
                    debug!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let id = match admission {
                Some(id) => id,
                None => return,
            };
            let transport: Arc<dyn Transport> = Arc::new(WsTransport::new(socket));

            let (session, created) = sessions.get_or_create(id, ip);
            if created {
                if let Err(e) = session.start(transport).await {
                    error!("Session {} failed to start: {}", id, e);
                    return;
                }
                // A concurrent admission for the same identity may have
                // connected the player already
                if !world.connect(session.clone()).await {
                    world.reconnect(session.clone()).await;
                }
            } else {
                if let Err(e) = session.reconnect(ip, transport).await {
                    error!("Session {} failed to reconnect: {}", id, e);
                    return;
                }
                world.reconnect(session.clone()).await;
            }

            session.run().await;
            debug!("Dispatch for {} from {} ended", addr, ip);
        });
    }

    async fn run_code_prune_loop(
        logins: Arc<LoginStore>,
        every: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut ticker = interval(every);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = logins.prune_expired(std::time::Instant::now());
                    if removed > 0 {
                        debug!("Dropped {} expired login codes", removed);
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get registered session count.
    pub fn session_count(&self) -> usize {
        self.sessions.session_count()
    }
}

/// Validate an upgrade request and consume its login code. Returns the
/// identity the connection belongs to.
fn admit(
    request: &WsRequest,
    ip: IpAddr,
    logins: &LoginStore,
    sessions: &SessionManager,
) -> Result<Uuid, (StatusCode, String)> {
    if request.uri().path() != "/wt" {
        return Err((StatusCode::NOT_FOUND, "not found".to_string()));
    }

    let code = query_param(request.uri().query(), "code").unwrap_or_default();
    let id = logins
        .redeem(&code)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    match sessions.get_valid_session(&id, ip) {
        Ok(_) | Err(SessionError::NotFound(_)) => Ok(id),
        Err(e) => Err((StatusCode::BAD_REQUEST, e.to_string())),
    }
}

// =============================================================================
// LOGIN ENDPOINT
// =============================================================================

fn serve_logins(server: Arc<tiny_http::Server>, logins: Arc<LoginStore>) {
    for request in server.incoming_requests() {
        if let Err(e) = handle_login(request, &logins) {
            warn!("Login request failed: {}", e);
        }
    }
    debug!("Login endpoint stopped");
}

fn handle_login(request: Request, logins: &LoginStore) -> std::io::Result<()> {
    let url = request.url().to_string();
    let (path, query) = match url.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (url.as_str(), None),
    };

    let response = match (request.method(), path) {
        (&Method::Get, "/login") => {
            let name = query_param(query, "name").unwrap_or_default();
            match logins.login(&name) {
                Ok((id, code)) => {
                    info!("Login for {} as {} from {:?}", name.trim(), id, request.remote_addr());
                    Response::from_string(code)
                }
                Err(e) => Response::from_string(e.to_string()).with_status_code(400),
            }
        }
        _ => Response::from_string("not found").with_status_code(404),
    };

    request.respond(response)
}

/// Find `key` in a query string and percent-decode its value.
pub fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    form_urlencoded::parse(query?.as_bytes())
        .find(|(k, _)| k.as_ref() == key)
        .map(|(_, v)| v.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use tokio::task::JoinHandle;
    use tokio::time::{sleep, timeout, Instant};

    use crate::network::client::{login, Client, ClientConfig, ClientError};

    async fn start_server() -> (Arc<GameServer>, ClientConfig, JoinHandle<Result<(), GameServerError>>) {
        let config = ServerConfig {
            http_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ws_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Default::default()
        };
        let server = Arc::new(GameServer::new(config));
        let listeners = server.bind().await.unwrap();
        let client = ClientConfig {
            http_addr: listeners.http_addr().unwrap(),
            ws_addr: listeners.ws_addr().unwrap(),
            ..Default::default()
        };

        let serving = server.clone();
        let handle = tokio::spawn(async move { serving.serve(listeners).await });
        (server, client, handle)
    }

    async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            sleep(Duration::from_millis(20)).await;
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr.port(), 8770);
        assert_eq!(config.ws_addr.port(), 8771);
        assert_eq!(config.session.heartbeat.wait, Duration::from_secs(60));
        assert_eq!(config.session.inactive_ttl, Duration::from_secs(300));
        assert_eq!(config.world.garbage.max_failed_rounds, 5);
    }

    #[test]
    fn test_query_param() {
        assert_eq!(query_param(Some("name=ann"), "name").as_deref(), Some("ann"));
        assert_eq!(query_param(Some("x=1&name=ann+lee"), "name").as_deref(), Some("ann lee"));
        assert_eq!(query_param(Some("name=a%26b%3D"), "name").as_deref(), Some("a&b="));
        assert_eq!(query_param(Some("name=100%"), "name").as_deref(), Some("100%"));
        assert_eq!(query_param(Some("code"), "code").as_deref(), Some(""));
        assert_eq!(query_param(Some("other=1"), "name"), None);
        assert_eq!(query_param(Some("na%6De=bob"), "name").as_deref(), Some("bob"));
        assert_eq!(query_param(Some("name=%FFx"), "name").as_deref(), Some("\u{FFFD}x"));
        assert_eq!(query_param(None, "name"), None);
    }

    #[tokio::test]
    async fn test_login_endpoint() {
        let (server, client, handle) = start_server().await;

        let code = login(client.http_addr, "ann lee").await.unwrap();
        assert_eq!(code.len(), 32);
        assert_eq!(server.logins().pending_codes(), 1);

        match login(client.http_addr, "").await {
            Err(ClientError::Login(msg)) => assert!(msg.starts_with("400")),
            other => panic!("expected rejection, got {:?}", other.map(|_| ())),
        }

        server.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_client_joins_and_answers_challenge() {
        let (server, config, handle) = start_server().await;

        let client = Client::connect(&config, "ann").await.unwrap();
        wait_until("first ack", || client.stats().acks.load(Ordering::Relaxed) > 0).await;

        assert_eq!(client.stats().challenges.load(Ordering::Relaxed), 1);
        assert_eq!(server.session_count(), 1);
        assert_eq!(server.world().player_count().await, 1);

        let roster = server.world().roster().await;
        assert_eq!(roster[0].name, "ann");

        client.step(1, 1).await.unwrap();
        wait_until("move echo", || client.stats().moves.load(Ordering::Relaxed) > 0).await;
        let player = server.world().player(&roster[0].id).await.unwrap();
        assert_eq!((player.x, player.y), (1, 1));

        client.chat("hello").await.unwrap();
        wait_until("chat echo", || client.stats().chats.load(Ordering::Relaxed) > 0).await;

        server.shutdown();
        handle.await.unwrap().unwrap();
        wait_until("client closed", || !client.session().is_active()).await;
    }

    #[tokio::test]
    async fn test_bad_code_is_rejected() {
        let (server, config, handle) = start_server().await;

        let url = format!("ws://{}/wt?code=bogus", config.ws_addr);
        assert!(tokio_tungstenite::connect_async(url).await.is_err());

        let url = format!("ws://{}/wt", config.ws_addr);
        assert!(tokio_tungstenite::connect_async(url).await.is_err());
        assert_eq!(server.session_count(), 0);

        server.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_code_is_single_use() {
        let (server, config, handle) = start_server().await;

        let code = login(config.http_addr, "ann").await.unwrap();
        let url = format!("ws://{}/wt?code={}", config.ws_addr, code);
        let (first, _) = tokio_tungstenite::connect_async(url.clone()).await.unwrap();
        assert!(tokio_tungstenite::connect_async(url).await.is_err());

        drop(first);
        server.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_keeps_player() {
        let (server, config, handle) = start_server().await;

        let first = Client::connect(&config, "ann").await.unwrap();
        wait_until("first ack", || first.stats().acks.load(Ordering::Relaxed) > 0).await;
        let id = server.world().roster().await[0].id;

        first.close().await;
        let session = server.sessions().get(&id).unwrap();
        wait_until("server side close", || !session.is_active()).await;

        let second = Client::connect(&config, "ann").await.unwrap();
        wait_until("second ack", || second.stats().acks.load(Ordering::Relaxed) > 0).await;

        assert!(session.is_active());
        assert_eq!(server.session_count(), 1);
        assert_eq!(server.world().player_count().await, 1);

        server.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_simultaneous_logins_leave_one_live_player() {
        let (server, config, handle) = start_server().await;

        let (a, b) = tokio::join!(Client::connect(&config, "ann"), Client::connect(&config, "ann"));
        let (a, b) = (a.unwrap(), b.unwrap());
        wait_until("one connection replaced", || {
            a.session().is_active() != b.session().is_active()
        })
        .await;
        let live = if a.session().is_active() { &a } else { &b };

        wait_until("live ack", || live.stats().acks.load(Ordering::Relaxed) > 0).await;
        live.chat("hi").await.unwrap();
        wait_until("chat echo", || live.stats().chats.load(Ordering::Relaxed) > 0).await;
        assert_eq!(server.session_count(), 1);
        assert_eq!(server.world().player_count().await, 1);

        server.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions() {
        let (server, config, handle) = start_server().await;
        let client = Client::connect(&config, "ann").await.unwrap();
        wait_until("joined", || server.session_count() == 1).await;

        server.shutdown();
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap().unwrap();

        let id = server.world().roster().await[0].id;
        assert!(!server.sessions().get(&id).unwrap().is_active());
        wait_until("client closed", || !client.session().is_active()).await;
    }
}
