//! The one session a service process exposes to its clients

use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use crate::capture::{AudioInput, CapturedAudio};
use crate::error::{Result, SessionError};
use crate::events::SessionEvent;
use crate::session::{retire, settle, Session, SessionConfig, SessionSlot, SessionSnapshot};
use crate::state::SessionState;
use crate::store::ArtifactStore;
use crate::transport::Connector;

/// Builds a fresh input for every new session
pub type InputFactory = Box<dyn Fn() -> Result<Box<dyn AudioInput>> + Send + Sync>;

/// Capacity of the shared event channel
const EVENT_CAPACITY: usize = 256;

/// Creates, replaces and drives the current session
pub struct SessionControl {
    config: SessionConfig,
    default_endpoint: String,
    connector: Arc<dyn Connector>,
    store: Arc<dyn ArtifactStore>,
    inputs: InputFactory,
    events: broadcast::Sender<SessionEvent>,
    /// Held only to swap or clone the current handle, never across a
    /// session command that waits on the network
    slot: Mutex<SessionSlot>,
    /// Capture a replaced session never got to send
    retained: Mutex<CapturedAudio>,
}

impl SessionControl {
    pub fn new(
        config: SessionConfig,
        default_endpoint: impl Into<String>,
        connector: Arc<dyn Connector>,
        store: Arc<dyn ArtifactStore>,
        inputs: InputFactory,
    ) -> Self {
        Self::with_event_capacity(config, default_endpoint, connector, store, inputs, EVENT_CAPACITY)
    }

    pub fn with_event_capacity(
        config: SessionConfig,
        default_endpoint: impl Into<String>,
        connector: Arc<dyn Connector>,
        store: Arc<dyn ArtifactStore>,
        inputs: InputFactory,
        capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            config,
            default_endpoint: default_endpoint.into(),
            connector,
            store,
            inputs,
            events,
            slot: Mutex::new(SessionSlot::new()),
            retained: Mutex::new(CapturedAudio::default()),
        }
    }

    /// Events of every session this control creates. See
    /// `Session::subscribe` for what a lagging receiver loses.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Replace the current session with a new one and connect it.
    ///
    /// Fails with `AlreadyInProgress` while the current session is still
    /// connecting. Unsent capture of the replaced session is kept for
    /// `resend`.
    pub async fn open(&self, endpoint: Option<String>) -> Result<Uuid> {
        let endpoint = endpoint.unwrap_or_else(|| self.default_endpoint.clone());

        let (session, previous, connected) = {
            let mut slot = self.slot.lock().await;
            if let Some(current) = slot.current() {
                if current.state().await.ok() == Some(SessionState::Connecting) {
                    return Err(SessionError::AlreadyInProgress("open"));
                }
            }

            let input = (self.inputs)()?;
            let session = Arc::new(Session::with_events(
                self.config.clone(),
                Arc::clone(&self.connector),
                input,
                Arc::clone(&self.store),
                self.events.clone(),
            ));
            // Queued before the lock drops, so the next open sees Connecting
            let connected = session.begin_open(&endpoint).await?;
            let previous = slot.replace(Arc::clone(&session));
            (session, previous, connected)
        };
        info!(session_id = %session.id(), %endpoint, "session installed");

        if let Some(previous) = previous {
            self.retain_capture(&previous).await;
            retire(previous).await;
        }

        settle(connected).await?;
        Ok(session.id())
    }

    /// Send the capture retained from a replaced session on the current one.
    /// `None` when there is no current session.
    pub async fn resend(&self) -> Option<Result<()>> {
        let session = self.current().await?;
        let captured = std::mem::take(&mut *self.retained.lock().await);
        if captured.is_empty() {
            return Some(Err(SessionError::NothingToResend));
        }

        let result = session.resend(captured.clone()).await;
        if let Err(SessionError::InvalidState { .. } | SessionError::AlreadyInProgress(_)) = &result {
            // Refused before anything went out; keep it for the next try
            *self.retained.lock().await = captured;
        }
        Some(result)
    }

    /// Fragments waiting for `resend`
    pub async fn retained_fragments(&self) -> usize {
        self.retained.lock().await.len()
    }

    /// Handle to the current session, if any
    pub async fn current(&self) -> Option<Arc<Session>> {
        self.slot.lock().await.current()
    }

    pub async fn snapshot(&self) -> Option<SessionSnapshot> {
        self.current().await?.snapshot().await.ok()
    }

    /// Dispose the current session, if any
    pub async fn shutdown(&self) {
        let current = self.slot.lock().await.take();
        if let Some(session) = current {
            retire(session).await;
        }
    }

    async fn retain_capture(&self, previous: &Session) {
        match previous.take_captured().await {
            Ok(captured) if !captured.is_empty() => {
                info!(
                    session_id = %previous.id(),
                    fragments = captured.len(),
                    "retaining unsent capture"
                );
                *self.retained.lock().await = captured;
            }
            Ok(_) => {}
            Err(e) => debug!(session_id = %previous.id(), %e, "no capture to retain"),
        }
    }
}
