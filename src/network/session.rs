//! Session Lifecycle
//!
//! One [`Session`] per logical identity. A session outlives individual
//! connections: it keeps its identity, inbound queue and handler table across
//! reconnects while each connection gets a fresh reader, heartbeat and close
//! signal.
//!
//! ```text
//! Disconnected --start--> Starting --ok--> Active --close--> Disconnected
//!                            |                |
//!                            +--fail----------+--reconnect--> Active
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::codec::{BincodeCodec, Codec};
use super::packet::{read_loop, write_frame, FrameConfig, FrameError, OpCode, Packet, PacketWriter};
use super::protocol::{Heartbeat, Message};
use super::transport::{BoxStream, Transport, CLOSE_START_FAILED, CLOSE_STREAM_ENDED};

/// Boxed packet handler.
pub type Handler = Arc<dyn Fn(Arc<Session>, Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Session connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No live connection.
    Disconnected,
    /// Opening the control stream.
    Starting,
    /// Reader and heartbeat are running.
    Active,
}

// =============================================================================
// CONFIG
// =============================================================================

/// Heartbeat timing.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Window after which an unreset timer counts as a miss.
    pub wait: Duration,
    /// Ping interval.
    pub period: Duration,
    /// Consecutive misses that close the session.
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        let wait = Duration::from_secs(60);
        Self {
            wait,
            period: wait.mul_f64(0.9),
            max_missed: 3,
        }
    }
}

/// Configuration shared by every session of a manager.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Heartbeat timing.
    pub heartbeat: HeartbeatConfig,
    /// Framing limits.
    pub frame: FrameConfig,
    /// Inbound packet queue capacity.
    pub queue_capacity: usize,
    /// How long an inactive session is kept for reconnection.
    pub inactive_ttl: Duration,
    /// How often the manager prunes.
    pub prune_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::default(),
            frame: FrameConfig::default(),
            queue_capacity: 1024,
            inactive_ttl: Duration::from_secs(5 * 60),
            prune_interval: Duration::from_secs(60),
        }
    }
}

/// Session errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No session for this identity.
    #[error("session {0} not found")]
    NotFound(Uuid),

    /// An active session was claimed from another address.
    #[error("session address mismatch: expected {expected}, got {got}")]
    IpMismatch {
        /// Address of the active connection.
        expected: IpAddr,
        /// Address of the new request.
        got: IpAddr,
    },

    /// The session has no live connection.
    #[error("session {0} is inactive")]
    Inactive(Uuid),

    /// The control stream could not be opened.
    #[error("session failed to start: {0}")]
    FailedToStart(String),

    /// Framing failure on the session's stream.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// HEARTBEAT
// =============================================================================

/// Missed-window accounting for the heartbeat loop.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    missed: u32,
    max_missed: u32,
}

impl HeartbeatMonitor {
    /// Monitor that trips after `max_missed` consecutive misses.
    pub fn new(max_missed: u32) -> Self {
        Self { missed: 0, max_missed }
    }

    /// Record a missed window. Returns true when the session should close.
    pub fn miss(&mut self) -> bool {
        self.missed += 1;
        self.missed >= self.max_missed
    }

    /// A ping went out.
    pub fn reset(&mut self) {
        self.missed = 0;
    }

    /// Consecutive misses so far.
    pub fn missed(&self) -> u32 {
        self.missed
    }
}

// =============================================================================
// SESSION
// =============================================================================

struct Outbound {
    writer: Option<WriteHalf<BoxStream>>,
    packets: PacketWriter<BincodeCodec>,
}

struct CloseHandle {
    generation: u64,
    tx: watch::Sender<bool>,
}

/// A logical client connection.
pub struct Session {
    id: Uuid,
    config: SessionConfig,
    addr: Mutex<IpAddr>,
    state: Mutex<SessionState>,
    last_active: Mutex<Instant>,
    handlers: RwLock<Vec<Option<Handler>>>,
    incoming_tx: mpsc::Sender<Packet>,
    incoming_rx: tokio::sync::Mutex<mpsc::Receiver<Packet>>,
    outbound: tokio::sync::Mutex<Outbound>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    close: Mutex<Option<CloseHandle>>,
    close_rx: Mutex<watch::Receiver<bool>>,
    generation: AtomicU64,
    lifecycle: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("addr", &self.addr())
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Create a disconnected session.
    pub fn new(id: Uuid, addr: IpAddr, config: SessionConfig) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::channel(config.queue_capacity.max(1));
        // Closed signal until the first start
        let (_, close_rx) = watch::channel(true);

        Self {
            id,
            config,
            addr: Mutex::new(addr),
            state: Mutex::new(SessionState::Disconnected),
            last_active: Mutex::new(Instant::now()),
            handlers: RwLock::new(vec![None; OpCode::TABLE_SIZE]),
            incoming_tx,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
            outbound: tokio::sync::Mutex::new(Outbound {
                writer: None,
                packets: PacketWriter::new(BincodeCodec),
            }),
            transport: Mutex::new(None),
            close: Mutex::new(None),
            close_rx: Mutex::new(close_rx),
            generation: AtomicU64::new(0),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Session identity.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Last observed peer address.
    pub fn addr(&self) -> IpAddr {
        *lock(&self.addr)
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// True while a connection is live.
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// When the session last became inactive (or was created).
    pub fn last_active(&self) -> Instant {
        *lock(&self.last_active)
    }

    /// Packets waiting in the inbound queue.
    pub fn pending_packets(&self) -> usize {
        self.incoming_tx.max_capacity() - self.incoming_tx.capacity()
    }

    fn set_state(&self, state: SessionState) {
        *lock(&self.state) = state;
    }

    /// Register `handler` for `opcode`, replacing any previous one.
    pub fn add_handler<F, Fut>(&self, opcode: OpCode, handler: F)
    where
        F: Fn(Arc<Session>, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |session: Arc<Session>, payload: Vec<u8>| {
            Box::pin(handler(session, payload)) as BoxFuture<'static, ()>
        });
        let mut table = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        table[opcode.index()] = Some(handler);
    }

    fn handler(&self, opcode: u16) -> Option<Handler> {
        let op = OpCode::try_from(opcode).ok()?;
        let table = self.handlers.read().unwrap_or_else(|p| p.into_inner());
        table[op.index()].clone()
    }

    /// Open the control stream on `transport` and spawn the reader and
    /// heartbeat for this connection. A connection still open is closed first.
    #[instrument(skip(self, transport), fields(session = %self.id))]
    pub async fn start(self: &Arc<Self>, transport: Arc<dyn Transport>) -> Result<(), SessionError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.close().await;
        self.start_locked(transport).await
    }

    /// Replace the connection: close the old transport and start on the new one.
    pub async fn reconnect(self: &Arc<Self>, addr: IpAddr, transport: Arc<dyn Transport>) -> Result<(), SessionError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.close().await;
        *lock(&self.addr) = addr;
        info!("Session {} reconnecting from {}", self.id, addr);
        self.start_locked(transport).await
    }

    /// Start with the lifecycle lock held and no connection open.
    async fn start_locked(self: &Arc<Self>, transport: Arc<dyn Transport>) -> Result<(), SessionError> {
        self.set_state(SessionState::Starting);

        let stream = match transport.open_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to open stream: {}", e);
                transport.close_with_error(CLOSE_START_FAILED, "failed to start session");
                self.set_state(SessionState::Disconnected);
                return Err(SessionError::FailedToStart(e.to_string()));
            }
        };

        let (reader, writer) = tokio::io::split(stream);
        self.outbound.lock().await.writer = Some(writer);

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (close_tx, close_rx) = watch::channel(false);
        *lock(&self.close) = Some(CloseHandle { generation, tx: close_tx });
        *lock(&self.close_rx) = close_rx.clone();
        *lock(&self.transport) = Some(transport);
        self.set_state(SessionState::Active);

        let session = self.clone();
        let reader_close = close_rx.clone();
        let frame_config = self.config.frame.clone();
        let incoming = self.incoming_tx.clone();
        tokio::spawn(async move {
            match read_loop(reader, incoming, reader_close, frame_config).await {
                Ok(()) => debug!("Reader for {} finished", session.id),
                Err(e) => warn!("Reader for {} failed: {}", session.id, e),
            }
            session.close_generation(generation).await;
        });

        tokio::spawn(self.clone().heartbeat_loop(generation, close_rx));

        info!("Session {} started from {}", self.id, self.addr());
        Ok(())
    }

    /// Close the current connection. Repeated calls are no-ops.
    pub async fn close(&self) {
        let handle = lock(&self.close).take();
        if let Some(handle) = handle {
            self.finish_close(handle).await;
        }
    }

    async fn close_generation(&self, generation: u64) {
        let handle = {
            let mut slot = lock(&self.close);
            match slot.as_ref() {
                Some(h) if h.generation == generation => slot.take(),
                _ => None,
            }
        };
        if let Some(handle) = handle {
            self.finish_close(handle).await;
        }
    }

    async fn finish_close(&self, handle: CloseHandle) {
        self.set_state(SessionState::Disconnected);
        *lock(&self.last_active) = Instant::now();
        let _ = handle.tx.send(true);

        let writer = self.outbound.lock().await.writer.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }

        let transport = lock(&self.transport).take();
        if let Some(transport) = transport {
            transport.close_with_error(CLOSE_STREAM_ENDED, "session closed");
        }

        info!("Session {} closed", self.id);
    }

    /// Encode and send a message.
    pub async fn send<M: Message>(&self, message: &M) -> Result<usize, SessionError> {
        if !self.is_active() {
            return Err(SessionError::Inactive(self.id));
        }

        let result = {
            let mut out = self.outbound.lock().await;
            let Outbound { writer, packets } = &mut *out;
            packets.write(writer.as_mut(), M::OPCODE, message).await
        };
        self.after_write(result).await
    }

    /// Send an already framed packet.
    pub async fn send_frame(&self, frame: &[u8]) -> Result<usize, SessionError> {
        if !self.is_active() {
            return Err(SessionError::Inactive(self.id));
        }

        let result = {
            let mut out = self.outbound.lock().await;
            match out.writer.as_mut() {
                Some(writer) => write_frame(writer, frame).await.map(|_| frame.len()),
                None => Err(FrameError::NilStream),
            }
        };
        self.after_write(result).await
    }

    async fn after_write(&self, result: Result<usize, FrameError>) -> Result<usize, SessionError> {
        match result {
            Ok(n) => Ok(n),
            Err(e) => {
                if matches!(e, FrameError::Write(_) | FrameError::NilStream) {
                    warn!("Write to session {} failed: {}", self.id, e);
                    self.close().await;
                }
                Err(e.into())
            }
        }
    }

    /// Dispatch inbound packets in arrival order until the connection closes.
    pub async fn run(self: Arc<Self>) {
        let mut close_rx = lock(&self.close_rx).clone();
        if *close_rx.borrow() {
            return;
        }

        let mut incoming = self.incoming_rx.lock().await;
        loop {
            let packet = tokio::select! {
                packet = incoming.recv() => match packet {
                    Some(packet) => packet,
                    None => return,
                },
                _ = close_rx.changed() => return,
            };
            self.dispatch(packet).await;
        }
    }

    /// Run the handler for one packet. Unknown opcodes are logged and skipped.
    pub async fn dispatch(self: &Arc<Self>, packet: Packet) {
        match self.handler(packet.opcode) {
            Some(handler) => handler(self.clone(), packet.payload).await,
            None => warn!("Session {}: no handler for opcode {}", self.id, packet.opcode),
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, generation: u64, mut close_rx: watch::Receiver<bool>) {
        let config = self.config.heartbeat.clone();
        let mut monitor = HeartbeatMonitor::new(config.max_missed);
        let mut ping = interval(config.period);
        let wait = tokio::time::sleep(config.wait);
        tokio::pin!(wait);

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    match tokio::time::timeout(config.wait, self.send(&Heartbeat::now())).await {
                        Ok(Ok(_)) => {
                            monitor.reset();
                            wait.as_mut().reset(Instant::now() + config.wait);
                        }
                        Ok(Err(e)) => {
                            warn!("Heartbeat to {} failed: {}", self.id, e);
                            self.close_generation(generation).await;
                            return;
                        }
                        Err(_) => {
                            if monitor.miss() {
                                warn!("Session {} heartbeat stalled", self.id);
                                self.close_generation(generation).await;
                                return;
                            }
                        }
                    }
                }
                _ = &mut wait => {
                    if monitor.miss() {
                        warn!("Session {} missed {} heartbeat windows", self.id, monitor.missed());
                        self.close_generation(generation).await;
                        return;
                    }
                    debug!("Session {} missed heartbeat window {}", self.id, monitor.missed());
                    wait.as_mut().reset(Instant::now() + config.wait);
                }
                _ = close_rx.changed() => return,
            }
        }
    }
}

/// Log the client's heartbeat reply.
async fn handle_heartbeat(session: Arc<Session>, payload: Vec<u8>) {
    match BincodeCodec.decode::<Heartbeat>(&payload) {
        Ok(hb) => {
            let rtt = chrono::Utc::now().timestamp_millis() - hb.timestamp;
            debug!("Heartbeat from {} ({} ms)", session.id(), rtt);
        }
        Err(e) => debug!("Bad heartbeat from {}: {}", session.id(), e),
    }
}

// =============================================================================
// SESSION MANAGER
// =============================================================================

/// Told when a pruned session leaves for good.
pub trait DisconnectNotifier: Send + Sync {
    /// The session was removed from the registry.
    fn on_disconnect(&self, session: Arc<Session>) -> BoxFuture<'_, ()>;
}

/// Registry of sessions by identity.
pub struct SessionManager {
    config: SessionConfig,
    sessions: RwLock<BTreeMap<Uuid, Arc<Session>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl SessionManager {
    /// Create a manager.
    pub fn new(config: SessionConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            sessions: RwLock::new(BTreeMap::new()),
            shutdown_tx,
        }
    }

    /// Create and register a disconnected session with the heartbeat
    /// handler installed. A session already registered under `id` is closed.
    pub async fn create_session(&self, id: Uuid, addr: IpAddr) -> Arc<Session> {
        let session = Arc::new(Session::new(id, addr, self.config.clone()));
        session.add_handler(OpCode::Heartbeat, handle_heartbeat);

        let replaced = {
            let mut sessions = self.sessions.write().unwrap_or_else(|p| p.into_inner());
            sessions.insert(id, session.clone())
        };
        if let Some(old) = replaced {
            warn!("Replacing session {}", id);
            old.close().await;
        }

        debug!("Created session {} for {}", id, addr);
        session
    }

    /// Existing session for `id`, or a new disconnected one registered
    /// atomically. The flag is true when the session was created.
    pub fn get_or_create(&self, id: Uuid, addr: IpAddr) -> (Arc<Session>, bool) {
        let mut sessions = self.sessions.write().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = sessions.get(&id) {
            return (existing.clone(), false);
        }

        let session = Arc::new(Session::new(id, addr, self.config.clone()));
        session.add_handler(OpCode::Heartbeat, handle_heartbeat);
        sessions.insert(id, session.clone());
        debug!("Created session {} for {}", id, addr);
        (session, true)
    }

    /// Look up a session.
    pub fn get(&self, id: &Uuid) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().unwrap_or_else(|p| p.into_inner());
        sessions.get(id).cloned()
    }

    /// Find a session that `addr` may reconnect to.
    pub fn get_valid_session(&self, id: &Uuid, addr: IpAddr) -> Result<Arc<Session>, SessionError> {
        let session = self.get(id).ok_or(SessionError::NotFound(*id))?;
        let expected = session.addr();
        if session.is_active() && expected != addr {
            return Err(SessionError::IpMismatch { expected, got: addr });
        }
        Ok(session)
    }

    /// Registered sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Remove sessions inactive for longer than the TTL as of `now`, then
    /// notify once per removed session.
    pub async fn prune_inactive(&self, now: Instant, notifier: &dyn DisconnectNotifier) -> Vec<Uuid> {
        let ttl = self.config.inactive_ttl;
        let removed: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().unwrap_or_else(|p| p.into_inner());
            let expired: Vec<Uuid> = sessions
                .iter()
                .filter(|(_, s)| !s.is_active() && now.saturating_duration_since(s.last_active()) > ttl)
                .map(|(id, _)| *id)
                .collect();
            expired.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        let mut ids = Vec::with_capacity(removed.len());
        for session in removed {
            info!("Pruned inactive session {}", session.id());
            ids.push(session.id());
            notifier.on_disconnect(session).await;
        }
        ids
    }

    /// Prune on an interval until shutdown.
    pub async fn run_prune_loop(self: Arc<Self>, notifier: Arc<dyn DisconnectNotifier>) {
        let mut ticker = interval(self.config.prune_interval);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let pruned = self.prune_inactive(Instant::now(), notifier.as_ref()).await;
                    if !pruned.is_empty() {
                        debug!("Pruned {} sessions", pruned.len());
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    }

    /// Stop pruning and close every session.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let sessions: Vec<Arc<Session>> = {
            let sessions = self.sessions.read().unwrap_or_else(|p| p.into_inner());
            sessions.values().cloned().collect()
        };
        for session in sessions {
            session.close().await;
        }
        info!("Session manager shut down");
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::packet::{frame_bytes, read_packet};
    use crate::network::protocol::ChatBroadcast;
    use crate::network::transport::memory::MemoryTransport;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::DuplexStream;

    const LOCAL: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    const OTHER: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

    fn new_session(config: SessionConfig) -> Arc<Session> {
        Arc::new(Session::new(Uuid::new_v4(), LOCAL, config))
    }

    async fn next_non_heartbeat(peer: &mut DuplexStream) -> Packet {
        loop {
            let packet = read_packet(peer, &FrameConfig::default()).await.unwrap().unwrap();
            if packet.opcode != OpCode::Heartbeat.as_u16() {
                return packet;
            }
        }
    }

    async fn wait_inactive(session: &Session) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while session.is_active() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_heartbeat_monitor() {
        let mut monitor = HeartbeatMonitor::new(3);
        assert!(!monitor.miss());
        assert!(!monitor.miss());
        monitor.reset();
        assert!(!monitor.miss());
        assert!(!monitor.miss());
        assert!(monitor.miss());
    }

    #[test]
    fn test_default_timing() {
        let config = SessionConfig::default();
        assert_eq!(config.heartbeat.wait, Duration::from_secs(60));
        assert_eq!(config.heartbeat.period, Duration::from_secs(54));
        assert_eq!(config.queue_capacity, 1024);
        assert_eq!(config.inactive_ttl, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_start_and_send() {
        let session = new_session(SessionConfig::default());
        let (transport, mut peer) = MemoryTransport::pair();

        session.start(transport).await.unwrap();
        assert!(session.is_active());

        let chat = ChatBroadcast { name: "ann".into(), text: "hi".into() };
        session.send(&chat).await.unwrap();

        let packet = next_non_heartbeat(&mut peer).await;
        assert_eq!(packet.opcode, OpCode::Chat.as_u16());
        let decoded: ChatBroadcast = BincodeCodec.decode(&packet.payload).unwrap();
        assert_eq!(decoded, chat);
    }

    #[tokio::test]
    async fn test_first_ping_is_immediate() {
        let session = new_session(SessionConfig::default());
        let (transport, mut peer) = MemoryTransport::pair();
        session.start(transport).await.unwrap();

        let packet = tokio::time::timeout(
            Duration::from_secs(1),
            read_packet(&mut peer, &FrameConfig::default()),
        )
        .await
        .unwrap()
        .unwrap()
        .unwrap();
        assert_eq!(packet.opcode, OpCode::Heartbeat.as_u16());
    }

    #[tokio::test]
    async fn test_start_failure_closes_with_500() {
        let session = new_session(SessionConfig::default());
        let transport = MemoryTransport::failing();

        let result = session.start(transport.clone()).await;
        assert!(matches!(result, Err(SessionError::FailedToStart(_))));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(transport.close_codes(), vec![CLOSE_START_FAILED]);
    }

    #[tokio::test]
    async fn test_send_when_inactive() {
        let session = new_session(SessionConfig::default());
        let result = session.send(&Heartbeat::now()).await;
        assert!(matches!(result, Err(SessionError::Inactive(_))));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let session = new_session(SessionConfig::default());
        let (transport, _peer) = MemoryTransport::pair();
        session.start(transport.clone()).await.unwrap();

        tokio::join!(session.close(), session.close(), session.close());
        session.close().await;

        assert!(!session.is_active());
        assert_eq!(transport.close_codes(), vec![CLOSE_STREAM_ENDED]);
    }

    #[tokio::test]
    async fn test_peer_hangup_closes_session() {
        let session = new_session(SessionConfig::default());
        let (transport, peer) = MemoryTransport::pair();
        session.start(transport.clone()).await.unwrap();

        drop(peer);
        wait_inactive(&session).await;
        assert_eq!(transport.close_codes(), vec![CLOSE_STREAM_ENDED]);
    }

    #[tokio::test]
    async fn test_dispatch_skips_unknown_opcodes() {
        let session = new_session(SessionConfig::default());
        let (tx, mut rx) = mpsc::channel(4);
        session.add_handler(OpCode::ClientChat, move |_, payload| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(payload).await;
            }
        });

        let (transport, mut peer) = MemoryTransport::pair();
        session.start(transport).await.unwrap();
        tokio::spawn(session.clone().run());

        peer.write_all(&frame_bytes(99, &[1, 2]).unwrap()).await.unwrap();
        peer.write_all(&frame_bytes(OpCode::PlayerMoved.as_u16(), &[3]).unwrap()).await.unwrap();
        peer.write_all(&frame_bytes(OpCode::ClientChat.as_u16(), &[4, 5]).unwrap()).await.unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, vec![4, 5]);
        assert!(session.is_active());
    }

    #[tokio::test]
    async fn test_handler_reregistration_overwrites() {
        let session = new_session(SessionConfig::default());
        let hits = Arc::new(AtomicUsize::new(0));

        session.add_handler(OpCode::ClientChat, |_, _| async {});
        let counter = hits.clone();
        session.add_handler(OpCode::ClientChat, move |_, _| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(10, Ordering::SeqCst);
            }
        });

        session
            .dispatch(Packet { opcode: OpCode::ClientChat.as_u16(), payload: vec![] })
            .await;
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_full_queue_applies_backpressure() {
        let session = new_session(SessionConfig::default());
        let (transport, mut peer) = MemoryTransport::pair();
        session.start(transport).await.unwrap();

        // Nothing is dispatching, so the queue fills and the reader waits
        for _ in 0..1100 {
            peer.write_all(&frame_bytes(OpCode::ClientChat.as_u16(), &[]).unwrap()).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while session.pending_packets() < 1024 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.pending_packets(), 1024);
        assert!(session.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_missed_windows_close() {
        let config = SessionConfig {
            heartbeat: HeartbeatConfig {
                wait: Duration::from_secs(1),
                period: Duration::from_secs(10),
                max_missed: 3,
            },
            ..Default::default()
        };
        let session = new_session(config);
        let (transport, _peer) = MemoryTransport::pair();
        session.start(transport).await.unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(session.is_active());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!session.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_resets_missed_windows() {
        let config = SessionConfig {
            heartbeat: HeartbeatConfig {
                wait: Duration::from_secs(1),
                period: Duration::from_millis(2500),
                max_missed: 3,
            },
            ..Default::default()
        };
        let session = new_session(config);
        let (transport, _peer) = MemoryTransport::pair();
        session.start(transport).await.unwrap();

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(session.is_active());
    }

    #[tokio::test]
    async fn test_reconnect_keeps_identity_and_handlers() {
        let session = new_session(SessionConfig::default());
        let (tx, mut rx) = mpsc::channel(4);
        session.add_handler(OpCode::ClientChat, move |s: Arc<Session>, _| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(s.id()).await;
            }
        });

        let (first, _first_peer) = MemoryTransport::pair();
        session.start(first.clone()).await.unwrap();

        let (second, mut second_peer) = MemoryTransport::pair();
        session.reconnect(OTHER, second).await.unwrap();
        tokio::spawn(session.clone().run());

        assert_eq!(first.close_codes(), vec![CLOSE_STREAM_ENDED]);
        assert_eq!(session.addr(), OTHER);
        assert!(session.is_active());

        second_peer
            .write_all(&frame_bytes(OpCode::ClientChat.as_u16(), &[]).unwrap())
            .await
            .unwrap();
        let id = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, session.id());
    }

    #[tokio::test]
    async fn test_concurrent_reconnects_keep_one_connection() {
        let session = new_session(SessionConfig::default());
        let (first, _first_peer) = MemoryTransport::pair();
        session.start(first.clone()).await.unwrap();

        let (a, _a_peer) = MemoryTransport::pair();
        let (b, _b_peer) = MemoryTransport::pair();
        let (ra, rb) = tokio::join!(
            session.reconnect(OTHER, a.clone()),
            session.reconnect(OTHER, b.clone())
        );
        ra.unwrap();
        rb.unwrap();

        assert!(session.is_active());
        assert_eq!(first.close_codes(), vec![CLOSE_STREAM_ENDED]);
        // The loser was closed by the winner; the winner is still open
        let codes = [a.close_codes(), b.close_codes()];
        assert_eq!(codes.iter().filter(|c| c.as_slice() == [CLOSE_STREAM_ENDED]).count(), 1);
        assert_eq!(codes.iter().filter(|c| c.is_empty()).count(), 1);
    }

    #[tokio::test]
    async fn test_start_twice_closes_previous_connection() {
        let session = new_session(SessionConfig::default());
        let (first, _first_peer) = MemoryTransport::pair();
        let (second, _second_peer) = MemoryTransport::pair();

        session.start(first.clone()).await.unwrap();
        session.start(second.clone()).await.unwrap();

        assert_eq!(first.close_codes(), vec![CLOSE_STREAM_ENDED]);
        assert!(second.close_codes().is_empty());
        assert!(session.is_active());
    }

    // -------------------------------------------------------------------------
    // Manager
    // -------------------------------------------------------------------------

    #[derive(Default)]
    struct CountingNotifier {
        calls: AtomicUsize,
    }

    impl DisconnectNotifier for CountingNotifier {
        fn on_disconnect(&self, _session: Arc<Session>) -> BoxFuture<'_, ()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let manager = SessionManager::default();
        let id = Uuid::new_v4();

        let session = manager.create_session(id, LOCAL).await;
        assert_eq!(manager.session_count(), 1);
        assert_eq!(manager.get(&id).unwrap().id(), session.id());
        assert!(matches!(
            manager.get_valid_session(&Uuid::new_v4(), LOCAL),
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_get_or_create_registers_once() {
        let manager = SessionManager::default();
        let id = Uuid::new_v4();

        let (first, created) = manager.get_or_create(id, LOCAL);
        assert!(created);
        let (again, created) = manager.get_or_create(id, OTHER);
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(again.addr(), LOCAL);
        assert_eq!(manager.session_count(), 1);
    }

    #[tokio::test]
    async fn test_ip_mismatch_only_while_active() {
        let manager = SessionManager::default();
        let id = Uuid::new_v4();
        let session = manager.create_session(id, LOCAL).await;

        // Inactive sessions may move
        assert!(manager.get_valid_session(&id, OTHER).is_ok());

        let (transport, _peer) = MemoryTransport::pair();
        session.start(transport).await.unwrap();
        assert!(matches!(
            manager.get_valid_session(&id, OTHER),
            Err(SessionError::IpMismatch { .. })
        ));
        assert!(manager.get_valid_session(&id, LOCAL).is_ok());
    }

    #[tokio::test]
    async fn test_create_replaces_and_closes_old() {
        let manager = SessionManager::default();
        let id = Uuid::new_v4();
        let old = manager.create_session(id, LOCAL).await;
        let (transport, _peer) = MemoryTransport::pair();
        old.start(transport).await.unwrap();

        let new = manager.create_session(id, LOCAL).await;
        assert!(!old.is_active());
        assert!(Arc::ptr_eq(&manager.get(&id).unwrap(), &new));
        assert_eq!(manager.session_count(), 1);
    }

    #[tokio::test]
    async fn test_prune_after_five_minutes() {
        let manager = SessionManager::default();
        let notifier = CountingNotifier::default();
        let session = manager.create_session(Uuid::new_v4(), LOCAL).await;
        let since = session.last_active();

        let kept = manager
            .prune_inactive(since + Duration::from_secs(4 * 60 + 59), &notifier)
            .await;
        assert!(kept.is_empty());
        assert_eq!(manager.session_count(), 1);

        let pruned = manager
            .prune_inactive(since + Duration::from_secs(5 * 60 + 1), &notifier)
            .await;
        assert_eq!(pruned, vec![session.id()]);
        assert_eq!(manager.session_count(), 0);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);

        // Already gone: no second notification
        manager
            .prune_inactive(since + Duration::from_secs(10 * 60), &notifier)
            .await;
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_prune_keeps_active_sessions() {
        let manager = SessionManager::default();
        let notifier = CountingNotifier::default();
        let session = manager.create_session(Uuid::new_v4(), LOCAL).await;
        let (transport, _peer) = MemoryTransport::pair();
        session.start(transport).await.unwrap();

        let pruned = manager
            .prune_inactive(Instant::now() + Duration::from_secs(3600), &notifier)
            .await;
        assert!(pruned.is_empty());
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions() {
        let manager = SessionManager::default();
        let session = manager.create_session(Uuid::new_v4(), LOCAL).await;
        let (transport, _peer) = MemoryTransport::pair();
        session.start(transport).await.unwrap();

        manager.shutdown().await;
        assert!(!session.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_loop_removes_on_tick_and_stops() {
        let config = SessionConfig {
            inactive_ttl: Duration::from_secs(10),
            prune_interval: Duration::from_secs(5),
            ..SessionConfig::default()
        };
        let manager = Arc::new(SessionManager::new(config));
        let notifier = Arc::new(CountingNotifier::default());
        manager.create_session(Uuid::new_v4(), LOCAL).await;

        let handle = tokio::spawn(manager.clone().run_prune_loop(notifier.clone()));

        // Ticks at 5s and 10s find the session within its TTL
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(manager.session_count(), 1);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(manager.session_count(), 0);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);

        manager.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
