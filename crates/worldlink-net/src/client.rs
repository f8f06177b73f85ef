//! Long-lived client owning the dispatch pipeline across sessions.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::credentials::{FixedJoinKey, JoinKeyProvider};
use crate::error::JoinError;
use crate::messages::WorldPacket;
use crate::pipeline::DispatchPipeline;
use crate::session::{ConnectionSession, Reconnect, SessionState};
use crate::settings::ClientSettings;
use crate::transport::{Connector, WebSocketConnector};

/// Handle to a world connection. Cheap to clone.
///
/// Hooks and callbacks registered on [`pipeline`](Self::pipeline) survive
/// every reconnect and every new [`join`](Self::join).
#[derive(Clone)]
pub struct GameClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    settings: ClientSettings,
    pipeline: Arc<DispatchPipeline>,
    credentials: Arc<dyn JoinKeyProvider>,
    connector: Arc<dyn Connector>,
    session: Mutex<Option<Arc<ConnectionSession>>>,
}

impl GameClient {
    /// Client over WebSockets that fetches join keys from `credentials`.
    pub fn new(settings: ClientSettings, credentials: Arc<dyn JoinKeyProvider>) -> Self {
        Self::with_connector(settings, credentials, Arc::new(WebSocketConnector))
    }

    /// Client for a join key obtained out of band. It will not rejoin on
    /// its own after a drop.
    pub fn from_join_key(settings: ClientSettings, join_key: impl Into<String>) -> Self {
        Self::new(settings, Arc::new(FixedJoinKey::new(join_key)))
    }

    pub fn with_connector(
        settings: ClientSettings,
        credentials: Arc<dyn JoinKeyProvider>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                settings,
                pipeline: Arc::new(DispatchPipeline::new()),
                credentials,
                connector,
                session: Mutex::new(None),
            }),
        }
    }

    pub fn pipeline(&self) -> &DispatchPipeline {
        &self.inner.pipeline
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.inner.settings
    }

    /// Join `world_id`. Fails with [`JoinError::AlreadyConnecting`] while a
    /// previous join is still in flight; a connected session is closed
    /// (without reconnect) first.
    pub async fn join(
        &self,
        world_id: &str,
        join_data: Option<serde_json::Value>,
    ) -> Result<Arc<ConnectionSession>, JoinError> {
        let (session, previous) = {
            let mut slot = self.inner.session.lock();
            if slot.as_ref().is_some_and(|s| s.state() == SessionState::Connecting) {
                return Err(JoinError::AlreadyConnecting);
            }
            let session = ConnectionSession::new(
                self.inner.settings.clone(),
                self.inner.pipeline.clone(),
                self.inner.credentials.clone(),
                self.inner.connector.clone(),
            );
            session.mark_connecting();
            (session.clone(), slot.replace(session))
        };

        if let Some(previous) = previous {
            if previous.state() != SessionState::Closed {
                tracing::info!("Closing previous session before joining {}", world_id);
                previous.disconnect(Reconnect::No).await;
            }
        }

        session.join(world_id, join_data.as_ref()).await?;
        tracing::info!("Joined world {}", world_id);
        Ok(session)
    }

    /// Queue a packet on the current session. No-op without one.
    pub fn send(&self, packet: WorldPacket) {
        if let Some(session) = self.session() {
            session.send(packet, false);
        }
    }

    /// Send bypassing the rate limiters.
    pub fn send_direct(&self, packet: WorldPacket) {
        if let Some(session) = self.session() {
            session.send(packet, true);
        }
    }

    pub fn connected(&self) -> bool {
        self.session().is_some_and(|s| s.connected())
    }

    pub fn state(&self) -> SessionState {
        self.session().map_or(SessionState::Idle, |s| s.state())
    }

    /// Watch the current session's state. `None` before the first join.
    pub fn subscribe(&self) -> Option<watch::Receiver<SessionState>> {
        self.session().map(|s| s.subscribe())
    }

    pub fn session(&self) -> Option<Arc<ConnectionSession>> {
        self.inner.session.lock().clone()
    }

    /// Close the current session. Returns `true` once the socket is closed
    /// (or when there was nothing to close).
    pub async fn disconnect(&self, reconnect: Reconnect) -> bool {
        match self.session() {
            Some(session) => session.disconnect(reconnect).await,
            None => true,
        }
    }
}
