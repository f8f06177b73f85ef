//! Connection lifecycle for one joined world.
//!
//! A [`ConnectionSession`] owns at most one live socket at a time, the
//! retry loop that replaces it, and the two outbound buckets. Each socket is
//! read by a driver task that decodes frames in arrival order and feeds
//! them through the shared [`DispatchPipeline`]; a frame is fully dispatched
//! before the next one is read.
//!
//! State changes are published through a [`ConnectionStateWatch`]:
//!
//! ```text
//! Idle -> Connecting -> Connected -> Closing -> Closed
//!            ^   |          |                    ^
//!            |   +----------|--------------------+  (give up)
//!            +--------------+                       (drop, rejoin)
//! ```

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Sleep};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::bucket::TokenBucket;
use crate::credentials::{JoinKeyProvider, join_url};
use crate::error::{CredentialError, JoinError};
use crate::events::{Event, EventKind, RawFrame};
use crate::messages::{PacketKind, PlayerInit, WorldPacket, decode_frame, encode_packet};
use crate::pipeline::{DispatchPipeline, HookState};
use crate::reconnection::AttemptWindow;
use crate::settings::{ClientSettings, HandledPacket};
use crate::transport::{CloseInfo, Connector, Incoming, Outgoing, Socket, TransportError};

/// How long `disconnect` waits for the socket to report closure.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, never joined.
    Idle,
    /// Opening a socket or waiting for the init frame.
    Connecting,
    /// Init frame received.
    Connected,
    /// Explicit disconnect in progress.
    Closing,
    /// Terminal.
    Closed,
}

/// Observable session state backed by a [`watch`] channel.
pub struct ConnectionStateWatch {
    tx: watch::Sender<SessionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a watch initialized to [`SessionState::Idle`].
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::Idle);
        Self { tx }
    }

    pub fn set(&self, state: SessionState) {
        self.tx.send_replace(state);
    }

    /// Move to `to` only if currently in `from`.
    pub fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> SessionState {
        *self.tx.borrow()
    }
}

/// What `disconnect` should do about reconnecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reconnect {
    /// Close for good.
    #[default]
    No,
    /// Close and rejoin the same world right away.
    Yes,
    /// Close and rejoin after the given delay.
    After(Duration),
}

#[derive(Clone)]
struct SocketSlot {
    id: u64,
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

/// Why a single connect attempt did not reach init.
#[derive(Debug)]
enum AttemptError {
    Transport(TransportError),
    Closed(CloseInfo),
    HandshakeTimeout,
    Cancelled,
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Transport(e) => write!(f, "{e}"),
            AttemptError::Closed(info) => write!(f, "closed with {info}"),
            AttemptError::HandshakeTimeout => f.write_str("no init frame before timeout"),
            AttemptError::Cancelled => f.write_str("cancelled"),
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionSession
// ---------------------------------------------------------------------------

/// One logical connection, possibly spanning several sockets.
pub struct ConnectionSession {
    state: ConnectionStateWatch,
    settings: ClientSettings,
    reconnect_enabled: AtomicBool,
    /// Set while a `join` call is running.
    joining: AtomicBool,
    window: Mutex<AttemptWindow>,
    target: Mutex<Option<String>>,
    socket: watch::Sender<Option<SocketSlot>>,
    next_socket_id: AtomicU64,
    bulk: TokenBucket,
    chat: TokenBucket,
    pipeline: Arc<DispatchPipeline>,
    credentials: Arc<dyn JoinKeyProvider>,
    connector: Arc<dyn Connector>,
    cancel: CancellationToken,
    rejoin_delay: Mutex<Option<Duration>>,
}

impl ConnectionSession {
    pub fn new(
        settings: ClientSettings,
        pipeline: Arc<DispatchPipeline>,
        credentials: Arc<dyn JoinKeyProvider>,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        let limits = &settings.rate_limits;
        let bulk = TokenBucket::new(limits.bulk_initial, limits.interval);
        let chat = TokenBucket::new(limits.chat_initial, limits.interval);
        let (socket, _rx) = watch::channel(None);
        Arc::new(Self {
            state: ConnectionStateWatch::new(),
            reconnect_enabled: AtomicBool::new(settings.reconnect.enabled),
            joining: AtomicBool::new(false),
            settings,
            window: Mutex::new(AttemptWindow::new()),
            target: Mutex::new(None),
            socket,
            next_socket_id: AtomicU64::new(1),
            bulk,
            chat,
            pipeline,
            credentials,
            connector,
            cancel: CancellationToken::new(),
            rejoin_delay: Mutex::new(None),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Whether a socket is open and the init frame has arrived.
    pub fn connected(&self) -> bool {
        self.socket.borrow().is_some() && self.state() == SessionState::Connected
    }

    /// World id of the last join, reused on rejoin.
    pub fn target(&self) -> Option<String> {
        self.target.lock().clone()
    }

    /// Current `(bulk, chat)` bucket limits.
    pub fn token_limits(&self) -> (u32, u32) {
        (self.bulk.token_limit(), self.chat.token_limit())
    }

    pub(crate) fn mark_connecting(&self) {
        self.state.set(SessionState::Connecting);
    }

    /// Join `target`, resolving once the server's init frame arrives.
    ///
    /// A `Closed` session stays closed; joining it again fails with
    /// [`JoinError::Cancelled`]. A connected session refuses with
    /// [`JoinError::AlreadyConnected`], and a second call while one is still
    /// running gets [`JoinError::AlreadyConnecting`].
    pub async fn join(
        self: &Arc<Self>,
        target: &str,
        join_data: Option<&serde_json::Value>,
    ) -> Result<(), JoinError> {
        if self.cancel.is_cancelled() || self.state() == SessionState::Closed {
            self.state.set(SessionState::Closed);
            return Err(JoinError::Cancelled);
        }
        if self.state() == SessionState::Connected {
            return Err(JoinError::AlreadyConnected);
        }
        let Some(_guard) = JoinGuard::acquire(&self.joining) else {
            return Err(JoinError::AlreadyConnecting);
        };
        self.state.set(SessionState::Connecting);

        let result = self.run_join(target, join_data).await;
        if let Err(error) = &result {
            tracing::debug!(%error, world = target, "Join failed");
            self.state.set(SessionState::Closed);
        }
        result
    }

    async fn run_join(
        self: &Arc<Self>,
        target: &str,
        join_data: Option<&serde_json::Value>,
    ) -> Result<(), JoinError> {
        let key = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(JoinError::Cancelled),
            key = self.credentials.join_key(target) => key?,
        };
        if key.is_empty() {
            return Err(CredentialError::Missing.into());
        }
        let url = join_url(&self.settings.game_ws, &key, join_data)?;
        *self.target.lock() = Some(target.to_string());

        let policy = &self.settings.reconnect;
        self.window.lock().begin(Instant::now(), policy.attempt_window);

        loop {
            if !self.window.lock().try_attempt(policy.max_attempts) {
                return Err(JoinError::ConnectionExhausted {
                    attempts: self.window.lock().count(),
                    last_failure: "attempt budget already spent".to_string(),
                });
            }

            let failure = match self.attempt(&url).await {
                Ok(()) => return Ok(()),
                Err(AttemptError::Cancelled) => return Err(JoinError::Cancelled),
                Err(failure) => failure,
            };

            if !self.reconnect_enabled.load(Ordering::SeqCst) {
                return Err(match failure {
                    AttemptError::Closed(info) => JoinError::ProtocolClose(info),
                    other => JoinError::ConnectionExhausted {
                        attempts: self.window.lock().count(),
                        last_failure: other.to_string(),
                    },
                });
            }

            let (attempts, budget) = {
                let window = self.window.lock();
                (window.count(), window.has_budget(policy.max_attempts))
            };
            if !budget {
                return Err(JoinError::ConnectionExhausted {
                    attempts,
                    last_failure: failure.to_string(),
                });
            }

            tracing::debug!(attempts, error = %failure, "Failed to reconnect, retrying");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(JoinError::Cancelled),
                _ = tokio::time::sleep(policy.retry_interval) => {}
            }
        }
    }

    /// Open one socket and wait for its init frame.
    async fn attempt(self: &Arc<Self>, url: &Url) -> Result<(), AttemptError> {
        let socket = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(AttemptError::Cancelled),
            socket = self.connector.connect(url) => socket.map_err(AttemptError::Transport)?,
        };
        let Socket { outgoing, incoming } = socket;

        let id = self.next_socket_id.fetch_add(1, Ordering::SeqCst);
        self.socket.send_replace(Some(SocketSlot {
            id,
            outgoing: outgoing.clone(),
        }));
        tracing::debug!(socket = id, "Connected successfully, waiting for init packet");

        let (ready_tx, ready_rx) = oneshot::channel();
        let driver = Driver {
            session: Arc::downgrade(self),
            id,
            incoming,
            ready: Some(ready_tx),
            initialized: false,
            redelivery: None,
        };
        tokio::spawn(driver.run());

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                let _ = outgoing.send(Outgoing::Close);
                Err(AttemptError::Cancelled)
            }
            ready = ready_rx => match ready {
                Ok(Ok(())) => {
                    self.state.transition(SessionState::Connecting, SessionState::Connected);
                    Ok(())
                }
                Ok(Err(info)) => Err(AttemptError::Closed(info)),
                Err(_) => Err(AttemptError::Closed(CloseInfo::abnormal("socket driver stopped"))),
            },
            _ = tokio::time::sleep(self.settings.handshake_timeout) => {
                let _ = outgoing.send(Outgoing::Close);
                Err(AttemptError::HandshakeTimeout)
            }
        }
    }

    /// Queue a packet. Chat goes through the chat bucket, everything else
    /// through the bulk bucket; `direct` skips both. Silently dropped when no
    /// socket is open.
    pub fn send(self: &Arc<Self>, packet: WorldPacket, direct: bool) {
        if self.socket.borrow().is_none() {
            tracing::trace!(kind = ?packet.kind(), "No socket, dropping send");
            return;
        }
        let bytes = match encode_packet(&packet) {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::warn!(%error, kind = ?packet.kind(), "Failed to encode packet");
                return;
            }
        };
        tracing::debug!(kind = ?packet.kind(), direct, "Sent {:?}", packet.kind());

        if direct {
            self.write(bytes);
            return;
        }
        let session = Arc::downgrade(self);
        let job = move || {
            if let Some(session) = session.upgrade() {
                session.write(bytes);
            }
        };
        match packet.kind() {
            PacketKind::PlayerChat => self.chat.queue(job, false),
            _ => self.bulk.queue(job, false),
        }
    }

    /// Write to whichever socket is open right now.
    fn write(&self, bytes: Vec<u8>) {
        if let Some(slot) = self.socket.borrow().as_ref() {
            let _ = slot.outgoing.send(Outgoing::Frame(bytes));
        }
    }

    /// Close the socket. Returns `true` once it reports closure.
    pub async fn disconnect(&self, reconnect: Reconnect) -> bool {
        match reconnect {
            Reconnect::No => {
                self.reconnect_enabled.store(false, Ordering::SeqCst);
                self.cancel.cancel();
            }
            Reconnect::Yes => {
                self.reconnect_enabled.store(true, Ordering::SeqCst);
            }
            Reconnect::After(delay) => {
                self.reconnect_enabled.store(true, Ordering::SeqCst);
                *self.rejoin_delay.lock() = Some(delay);
            }
        }

        let terminal = reconnect == Reconnect::No;
        let slot = self.socket.borrow().clone();
        let Some(slot) = slot else {
            // A running join observes the cancel and finishes the move to Closed.
            if terminal
                && !(self.joining.load(Ordering::SeqCst)
                    && self.state.transition(SessionState::Connecting, SessionState::Closing))
            {
                self.state.set(SessionState::Closed);
            }
            return true;
        };
        if terminal {
            let _ = self.state.transition(SessionState::Connected, SessionState::Closing)
                || self.state.transition(SessionState::Connecting, SessionState::Closing);
        }

        let _ = slot.outgoing.send(Outgoing::Close);
        let mut rx = self.socket.subscribe();
        let released = rx.wait_for(|current| current.as_ref().is_none_or(|s| s.id != slot.id));
        let closed = matches!(
            tokio::time::timeout(CLOSE_TIMEOUT, released).await,
            Ok(Ok(_))
        );
        if terminal && closed {
            self.state.transition(SessionState::Closing, SessionState::Closed);
        }
        closed
    }

    /// Clear the slot if it still holds socket `id`.
    fn release_socket(&self, id: u64) -> bool {
        self.socket.send_if_modified(|slot| {
            if slot.as_ref().is_some_and(|s| s.id == id) {
                *slot = None;
                true
            } else {
                false
            }
        })
    }

    fn apply_role_limits(&self, init: &PlayerInit) {
        let elevated = init.properties.is_world_owner;
        let (bulk, chat) = self.settings.rate_limits.for_role(elevated);
        self.bulk.set_token_limit(bulk);
        self.chat.set_token_limit(chat);
        tracing::debug!(elevated, bulk, chat, "Applied rate limits");
    }

    /// The socket of a connected session went away.
    fn handle_drop(self: &Arc<Self>) {
        if !self.reconnect_enabled.load(Ordering::SeqCst) || self.cancel.is_cancelled() {
            self.state.set(SessionState::Closed);
            return;
        }
        if !self.credentials.supports_rejoin() {
            tracing::debug!("Not attempting to reconnect as this client was created with a join key");
            self.state.set(SessionState::Closed);
            return;
        }
        let Some(target) = self.target() else {
            tracing::warn!("Socket closed, attempt to reconnect was made but no previous world id was kept");
            self.state.set(SessionState::Closed);
            return;
        };

        self.state.set(SessionState::Connecting);
        let delay = self.rejoin_delay.lock().take();
        let session = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::select! {
                    _ = session.cancel.cancelled() => {
                        session.state.set(SessionState::Closed);
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            tracing::debug!(world = %target, "Attempting to reconnect");
            if let Err(error) = session.join(&target, None).await {
                tracing::warn!(%error, "Reconnect failed");
            }
        });
    }
}

/// Holds the `joining` flag for the duration of one `join` call.
struct JoinGuard<'a>(&'a AtomicBool);

impl<'a> JoinGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for JoinGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

type Redelivery = Option<(Pin<Box<Sleep>>, Event)>;

/// Reads one socket until it closes.
struct Driver {
    session: Weak<ConnectionSession>,
    id: u64,
    incoming: mpsc::UnboundedReceiver<Incoming>,
    /// Resolves the pending attempt. Taken by the first init frame.
    ready: Option<oneshot::Sender<Result<(), CloseInfo>>>,
    initialized: bool,
    redelivery: Redelivery,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                item = self.incoming.recv() => match item {
                    Some(Incoming::Frame(bytes)) => {
                        let Some(session) = self.session.upgrade() else {
                            return;
                        };
                        self.on_frame(&session, &bytes).await;
                    }
                    Some(Incoming::Closed(info)) => {
                        self.on_close(info);
                        return;
                    }
                    None => {
                        self.on_close(CloseInfo::abnormal("transport ended"));
                        return;
                    }
                },
                event = redelivery_due(&mut self.redelivery) => {
                    let Some(session) = self.session.upgrade() else {
                        return;
                    };
                    if let Err(error) = session.pipeline.dispatch(event).await {
                        tracing::error!(%error, "Init redelivery was not handled");
                    }
                }
            }
        }
    }

    async fn on_frame(&mut self, session: &Arc<ConnectionSession>, bytes: &[u8]) {
        let mut event = match decode_frame(bytes) {
            Ok(event) => event,
            Err(error) => {
                tracing::warn!(%error, socket = self.id, "Dropping undecodable frame");
                return;
            }
        };
        tracing::debug!(kind = %event.kind(), "Received {}", event.kind());

        if session.pipeline.callback_count(EventKind::Raw) > 0 {
            let mut raw = Event::Raw(RawFrame {
                bytes: bytes.to_vec(),
                decoded: Box::new(event.clone()),
            });
            if let Err(error) = session.pipeline.invoke(&mut raw, &HookState::new()).await {
                tracing::error!(%error, "Raw frame failure was not handled");
            }
        }

        if let Event::Unknown(_) = event {
            if let Err(error) = session.pipeline.invoke(&mut event, &HookState::new()).await {
                tracing::error!(%error, "Unknown frame failure was not handled");
            }
            return;
        }

        let state = session.pipeline.run_hooks(&event).await;
        match &event {
            Event::Packet(WorldPacket::PlayerInit(init)) => {
                if self.on_init(session, init) {
                    let sleep = Box::pin(tokio::time::sleep(session.settings.init_redelivery));
                    self.redelivery = Some((sleep, event.clone()));
                }
            }
            Event::Packet(WorldPacket::Ping) if session.settings.handles(HandledPacket::Ping) => {
                session.send(WorldPacket::Ping, true);
            }
            _ => {}
        }

        if let Err(error) = session.pipeline.invoke(&mut event, &state).await {
            tracing::error!(%error, "Handler failure was not handled");
        }
    }

    /// Returns `true` for the init frame that completed the join.
    fn on_init(&mut self, session: &Arc<ConnectionSession>, init: &PlayerInit) -> bool {
        if session.settings.handles(HandledPacket::Init) {
            session.send(WorldPacket::PlayerInitReceived, false);
        }
        session.apply_role_limits(init);

        let Some(ready) = self.ready.take() else {
            return false;
        };
        if ready.send(Ok(())).is_err() {
            tracing::debug!(socket = self.id, "Init arrived after the attempt was abandoned");
            return false;
        }
        session
            .state
            .transition(SessionState::Connecting, SessionState::Connected);
        self.initialized = true;
        true
    }

    fn on_close(&mut self, info: CloseInfo) {
        tracing::debug!(
            code = info.code,
            reason = %info.reason,
            "Server closed connection due to code {}, reason: \"{}\"",
            info.code,
            info.reason
        );
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let current = session.release_socket(self.id);

        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Err(info));
            return;
        }
        if self.initialized && current {
            session.handle_drop();
        }
    }
}

/// Completes with the pending redelivery once its delay has passed; never
/// completes when nothing is pending.
async fn redelivery_due(slot: &mut Redelivery) -> Event {
    if let Some((sleep, _)) = slot.as_mut() {
        sleep.as_mut().await;
    }
    match slot.take() {
        Some((_, event)) => event,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::FixedJoinKey;
    use crate::events::EventKind;
    use crate::messages::PlayerProperties;
    use crate::pipeline::Flow;
    use crate::reconnection::ReconnectPolicy;
    use crate::transport::memory::{self, MemoryConnector, MemoryServer};
    use futures::FutureExt;
    use futures::future::BoxFuture;

    /// Hands out a fresh key every time.
    struct Keys;

    impl JoinKeyProvider for Keys {
        fn join_key<'a>(&'a self, room_id: &'a str) -> BoxFuture<'a, Result<String, CredentialError>> {
            futures::future::ready(Ok(format!("key-for-{room_id}"))).boxed()
        }
    }

    fn settings() -> ClientSettings {
        ClientSettings {
            game_ws: "ws://memory.test".to_string(),
            ..ClientSettings::default()
        }
    }

    fn init(owner: bool) -> WorldPacket {
        WorldPacket::PlayerInit(PlayerInit {
            properties: PlayerProperties {
                player_id: 1,
                username: "BOT".to_string(),
                is_world_owner: owner,
                ..PlayerProperties::default()
            },
            world_id: "world".to_string(),
            world_width: 100,
            world_height: 100,
        })
    }

    struct Harness {
        session: Arc<ConnectionSession>,
        pipeline: Arc<DispatchPipeline>,
        connector: MemoryConnector,
        server: MemoryServer,
    }

    fn harness_with(settings: ClientSettings, credentials: Arc<dyn JoinKeyProvider>) -> Harness {
        let (connector, server) = memory::pair();
        let pipeline = Arc::new(DispatchPipeline::new());
        let session = ConnectionSession::new(
            settings,
            pipeline.clone(),
            credentials,
            Arc::new(connector.clone()),
        );
        Harness {
            session,
            pipeline,
            connector,
            server,
        }
    }

    fn harness(settings: ClientSettings) -> Harness {
        harness_with(settings, Arc::new(Keys))
    }

    fn spawn_join(
        session: &Arc<ConnectionSession>,
    ) -> tokio::task::JoinHandle<Result<(), JoinError>> {
        let session = session.clone();
        tokio::spawn(async move { session.join("world", None).await })
    }

    /// Join and complete the handshake; returns the live server connection.
    async fn connect(h: &mut Harness) -> memory::ServerConnection {
        let join = spawn_join(&h.session);
        let conn = h.server.accept().await.unwrap();
        conn.send_packet(&init(false));
        join.await.unwrap().unwrap();
        conn
    }

    fn count_kind(pipeline: &DispatchPipeline, kind: PacketKind) -> Arc<Mutex<usize>> {
        let counter = Arc::new(Mutex::new(0));
        let c = counter.clone();
        pipeline.add_callback(kind, move |_: &mut Event, _: &HookState| {
            *c.lock() += 1;
            anyhow::Ok(Flow::Continue)
        });
        counter
    }

    async fn wait_for_state(session: &ConnectionSession, want: SessionState) {
        let mut rx = session.subscribe();
        rx.wait_for(|s| *s == want).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_resolves_on_init_not_on_open() {
        let mut h = harness(settings());
        let join = spawn_join(&h.session);
        let conn = h.server.accept().await.unwrap();

        assert_eq!(conn.url.as_str(), "ws://memory.test/ws?joinKey=key-for-world");
        tokio::task::yield_now().await;
        assert_eq!(h.session.state(), SessionState::Connecting);
        assert!(!h.session.connected());

        conn.send_packet(&init(false));
        join.await.unwrap().unwrap();
        assert_eq!(h.session.state(), SessionState::Connected);
        assert!(h.session.connected());
        assert_eq!(h.session.target().as_deref(), Some("world"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_socket_exhausts_after_three_attempts() {
        let mut policy = ReconnectPolicy::default();
        policy.max_attempts = 2;
        let h = harness(ClientSettings {
            reconnect: policy,
            ..settings()
        });
        h.connector.set_refuse(true);

        let start = Instant::now();
        let err = h.session.join("world", None).await.unwrap_err();
        assert!(
            matches!(err, JoinError::ConnectionExhausted { attempts: 3, .. }),
            "unexpected error: {err:?}"
        );
        assert_eq!(h.connector.attempts(), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(8) && elapsed < Duration::from_secs(9));
        assert_eq!(h.session.state(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_within_budget() {
        let mut h = harness(settings());
        h.connector.set_refuse(true);
        let join = spawn_join(&h.session);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.connector.attempts(), 1);
        h.connector.set_refuse(false);

        let conn = h.server.accept().await.unwrap();
        conn.send_packet(&init(false));
        join.await.unwrap().unwrap();
        assert_eq!(h.connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_before_init_without_reconnect_is_protocol_close() {
        let mut h = harness(ClientSettings {
            reconnect: ReconnectPolicy::disabled(),
            ..settings()
        });
        let join = spawn_join(&h.session);
        let conn = h.server.accept().await.unwrap();
        conn.close(CloseInfo::new(4001, "invalid join key"));

        let err = join.await.unwrap().unwrap_err();
        let JoinError::ProtocolClose(info) = err else {
            panic!("unexpected error: {err:?}");
        };
        assert_eq!(info, CloseInfo::new(4001, "invalid join key"));
        assert_eq!(h.session.state(), SessionState::Closed);

        // Closed is terminal for this session.
        assert!(matches!(
            h.session.join("world", None).await,
            Err(JoinError::Cancelled)
        ));
        assert_eq!(h.connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_server_hits_handshake_timeout() {
        let mut h = harness(ClientSettings {
            reconnect: ReconnectPolicy::disabled(),
            ..settings()
        });
        let join = spawn_join(&h.session);
        let _conn = h.server.accept().await.unwrap();

        let err = join.await.unwrap().unwrap_err();
        assert!(matches!(err, JoinError::ConnectionExhausted { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_credential_never_connects() {
        let h = harness_with(settings(), Arc::new(FixedJoinKey::new("")));
        let err = h.session.join("world", None).await.unwrap_err();
        assert!(matches!(err, JoinError::Credential(CredentialError::Missing)));
        assert_eq!(h.connector.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_init_resolves_once_and_redelivers_once() {
        let mut h = harness(settings());
        let inits = count_kind(&h.pipeline, PacketKind::PlayerInit);
        let hook_runs = Arc::new(Mutex::new(0));
        let runs = hook_runs.clone();
        h.pipeline.add_hook(move |event: &Event| {
            if event.kind() == EventKind::Packet(PacketKind::PlayerInit) {
                *runs.lock() += 1;
            }
            anyhow::Ok(HookState::new())
        });

        let join = spawn_join(&h.session);
        let conn = h.server.accept().await.unwrap();
        conn.send_packet(&init(false));
        conn.send_packet(&init(false));
        join.await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*inits.lock(), 2);
        assert_eq!(*hook_runs.lock(), 2);
        assert_eq!(h.session.state(), SessionState::Connected);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(*inits.lock(), 3, "Init is redelivered exactly once");
        // Redelivery goes through hooks again.
        assert_eq!(*hook_runs.lock(), 3);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(*inits.lock(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_is_echoed_directly() {
        let mut h = harness(settings());
        let mut conn = connect(&mut h).await;

        conn.send_packet(&WorldPacket::Ping);
        assert_eq!(conn.recv_packet().await, Some(WorldPacket::Ping));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_not_echoed_when_unhandled() {
        let mut h = harness(ClientSettings {
            handle_packets: Default::default(),
            ..settings()
        });
        let mut conn = connect(&mut h).await;

        conn.send_packet(&WorldPacket::Ping);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(conn.try_recv_packet(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_is_acknowledged_when_handled() {
        let mut settings = settings();
        settings.handle_packets.insert(HandledPacket::Init);
        let mut h = harness(settings);
        let mut conn = connect(&mut h).await;
        assert_eq!(conn.recv_packet().await, Some(WorldPacket::PlayerInitReceived));
    }

    #[tokio::test(start_paused = true)]
    async fn test_role_decides_bucket_limits() {
        let mut h = harness(settings());
        assert_eq!(h.session.token_limits(), (100, 10));

        let join = spawn_join(&h.session);
        let conn = h.server.accept().await.unwrap();
        conn.send_packet(&init(true));
        join.await.unwrap().unwrap();
        assert_eq!(h.session.token_limits(), (200, 10));

        conn.send_packet(&init(false));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.session.token_limits(), (125, 5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_chat_is_paced_by_chat_bucket() {
        let mut h = harness(settings());
        let mut conn = connect(&mut h).await;
        // Default role: 5 chat messages per second.
        let start = Instant::now();
        for i in 0..6 {
            h.session.send(WorldPacket::chat(format!("line {i}")), false);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        for _ in 0..5 {
            assert!(conn.try_recv_packet().is_some());
        }
        assert_eq!(conn.try_recv_packet(), None);

        assert_eq!(conn.recv_packet().await, Some(WorldPacket::chat("line 5")));
        assert!(start.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_without_socket_is_noop() {
        let h = harness(settings());
        h.session.send(WorldPacket::chat("nobody home"), false);
        h.session.send(WorldPacket::Ping, true);
        assert!(!h.session.connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_drop_rejoins_same_world() {
        let mut h = harness(settings());
        let conn = connect(&mut h).await;

        drop(conn);
        let conn = h.server.accept().await.unwrap();
        assert_eq!(h.session.state(), SessionState::Connecting);
        assert_eq!(conn.url.as_str(), "ws://memory.test/ws?joinKey=key-for-world");

        conn.send_packet(&init(false));
        wait_for_state(&h.session, SessionState::Connected).await;
        assert_eq!(h.connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_key_session_does_not_rejoin() {
        let mut h = harness_with(settings(), Arc::new(FixedJoinKey::new("one-shot")));
        let conn = connect(&mut h).await;

        drop(conn);
        wait_for_state(&h.session, SessionState::Closed).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_without_reconnect_is_terminal() {
        let mut h = harness(settings());
        let _conn = connect(&mut h).await;

        assert!(h.session.disconnect(Reconnect::No).await);
        wait_for_state(&h.session, SessionState::Closed).await;
        assert!(!h.session.connected());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.connector.attempts(), 1);
        assert!(matches!(
            h.session.join("world", None).await,
            Err(JoinError::Cancelled)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_after_delay_rejoins_later() {
        let mut h = harness(settings());
        let _conn = connect(&mut h).await;

        let start = Instant::now();
        assert!(h.session.disconnect(Reconnect::After(Duration::from_secs(3))).await);
        let conn = h.server.accept().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(3));
        conn.send_packet(&init(false));
        wait_for_state(&h.session, SessionState::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_on_connected_session_keeps_single_socket() {
        let mut h = harness(settings());
        let chats = count_kind(&h.pipeline, PacketKind::PlayerChat);
        let conn = connect(&mut h).await;

        assert!(matches!(
            h.session.join("world", None).await,
            Err(JoinError::AlreadyConnected)
        ));
        assert_eq!(h.connector.attempts(), 1);
        assert!(h.server.try_accept().is_none());
        assert_eq!(h.session.state(), SessionState::Connected);

        conn.send_packet(&WorldPacket::chat("once"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*chats.lock(), 1);
        assert!(h.session.connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_join_while_joining_is_rejected() {
        let mut h = harness(settings());
        let join = spawn_join(&h.session);
        let conn = h.server.accept().await.unwrap();

        assert!(matches!(
            h.session.join("world", None).await,
            Err(JoinError::AlreadyConnecting)
        ));
        assert_eq!(h.session.state(), SessionState::Connecting);

        conn.send_packet(&init(false));
        join.await.unwrap().unwrap();
        assert_eq!(h.connector.attempts(), 1);
        assert_eq!(h.session.state(), SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_before_join_runs_closes() {
        let h = harness(settings());
        h.session.mark_connecting();

        assert!(h.session.disconnect(Reconnect::No).await);
        assert_eq!(h.session.state(), SessionState::Closed);

        assert!(matches!(
            h.session.join("world", None).await,
            Err(JoinError::Cancelled)
        ));
        assert_eq!(h.session.state(), SessionState::Closed);
        assert_eq!(h.connector.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_connecting_cancels_join() {
        let mut h = harness(settings());
        let join = spawn_join(&h.session);
        let _conn = h.server.accept().await.unwrap();

        h.session.disconnect(Reconnect::No).await;
        assert!(matches!(join.await.unwrap(), Err(JoinError::Cancelled)));
        assert_eq!(h.session.state(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_frames_reach_unknown_callbacks() {
        let mut h = harness(settings());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        h.pipeline.add_callback(EventKind::Unknown, move |event: &mut Event, _: &HookState| {
            if let Event::Unknown(unknown) = event {
                sink.lock().push(unknown.kind);
            }
            anyhow::Ok(Flow::Continue)
        });
        let conn = connect(&mut h).await;

        conn.send_raw(vec![crate::messages::PROTOCOL_VERSION, 0x34, 0x12]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*seen.lock(), vec![0x1234]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_raw_callbacks_see_every_frame_before_hooks() {
        let mut h = harness(settings());
        let mut conn = connect(&mut h).await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let frames = Arc::new(Mutex::new(Vec::new()));
        let (log, sink) = (order.clone(), frames.clone());
        h.pipeline.add_callback(EventKind::Raw, move |event: &mut Event, _: &HookState| {
            if let Event::Raw(frame) = event {
                log.lock().push("raw");
                sink.lock().push((frame.bytes.clone(), frame.decoded.kind()));
            }
            anyhow::Ok(Flow::Continue)
        });
        let log = order.clone();
        h.pipeline.add_hook(move |_: &Event| {
            log.lock().push("hook");
            anyhow::Ok(HookState::new())
        });

        conn.send_packet(&WorldPacket::Ping);
        let unknown = vec![crate::messages::PROTOCOL_VERSION, 0x34, 0x12, 9];
        conn.send_raw(unknown.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*order.lock(), vec!["raw", "hook", "raw"]);
        let frames = frames.lock();
        assert_eq!(
            frames[0],
            (encode_packet(&WorldPacket::Ping).unwrap(), EventKind::Packet(PacketKind::Ping))
        );
        assert_eq!(frames[1], (unknown, EventKind::Unknown));
        // The normal path still runs.
        assert_eq!(conn.recv_packet().await, Some(WorldPacket::Ping));
    }
}
