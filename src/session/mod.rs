//! Audio session: one recording-to-playback round trip
//!
//! A `Session` is a handle to a dedicated actor task that owns the
//! transport, the capture stream, the outgoing framing and the inbound
//! reassembly. Dropping the last handle (or calling `dispose`) closes the
//! transport and stops capture.

mod actor;
mod framing;
mod reassembly;
mod slot;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::capture::{AudioInput, CapturedAudio};
use crate::config::Config;
use crate::error::{Result, SessionError};
use crate::events::SessionEvent;
use crate::state::{SessionState, StateMachine};
use crate::store::ArtifactStore;
use crate::transport::Connector;

use actor::{Command, Reply, SessionActor};

pub use framing::{Framed, Framer, OutgoingMode, ParsePolicyError};
pub use reassembly::{assemble, Artifact, FinalizePolicy, Reassembler, Rebuild};
pub use slot::{retire, SessionSlot};

/// Capacity of a session's own event channel
const EVENT_CAPACITY: usize = 256;

/// Outcome of a command that was queued but not yet answered
pub(crate) type Pending<T> = oneshot::Receiver<Result<T>>;

/// Per-session behavior
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub mode: OutgoingMode,
    pub finalize: FinalizePolicy,
    pub response_timeout: Option<Duration>,
    /// Media type tagged on the artifact
    pub media_type: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: OutgoingMode::default(),
            finalize: FinalizePolicy::default(),
            response_timeout: None,
            media_type: "audio/wav".to_string(),
        }
    }
}

impl From<&Config> for SessionConfig {
    fn from(config: &Config) -> Self {
        Self {
            mode: config.mode,
            finalize: config.finalize,
            response_timeout: config.response_timeout,
            media_type: config.artifact_media_type.clone(),
        }
    }
}

/// Read-only view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub state: SessionState,
    pub mode: OutgoingMode,
    #[serde(serialize_with = "serialize_error")]
    pub last_error: Option<SessionError>,
    pub inbound_chunks: usize,
    /// Retained fragments not yet sent
    pub captured_fragments: usize,
    #[serde(skip)]
    pub artifact: Option<Arc<Artifact>>,
}

fn serialize_error<S>(error: &Option<SessionError>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match error {
        Some(error) => serializer.serialize_some(&error.to_string()),
        None => serializer.serialize_none(),
    }
}

/// Handle to a running audio session
pub struct Session {
    id: Uuid,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SessionEvent>,
    store: Arc<dyn ArtifactStore>,
    task: JoinHandle<()>,
}

impl Session {
    /// Spawn a session in Idle with its own event channel
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        input: Box<dyn AudioInput>,
        store: Arc<dyn ArtifactStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self::with_events(config, connector, input, store, events)
    }

    /// Spawn a session that publishes into an existing event channel
    pub fn with_events(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        input: Box<dyn AudioInput>,
        store: Arc<dyn ArtifactStore>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let id = Uuid::new_v4();
        let (commands, command_rx) = mpsc::channel(32);
        let machine = StateMachine::new(id, events.clone());
        let actor = SessionActor::new(id, config, machine, connector, input, command_rx);
        let task = tokio::spawn(actor.run());

        Self {
            id,
            commands,
            events,
            store,
            task,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Receive every state transition and artifact change from now on.
    ///
    /// A receiver that falls more than the channel capacity behind gets
    /// `RecvError::Lagged` and loses the oldest events; `snapshot` gives
    /// the current state to resume from.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Connect to `endpoint`; resolves once Connected or failed
    pub async fn open(&self, endpoint: &str) -> Result<()> {
        settle(self.begin_open(endpoint).await?).await
    }

    /// Queue the connect without waiting for it. Commands sent after this
    /// returns see the session Connecting.
    pub(crate) async fn begin_open(&self, endpoint: &str) -> Result<Pending<()>> {
        let endpoint = endpoint.to_string();
        self.submit(|reply| Command::Open { endpoint, reply }).await
    }

    pub async fn start_capture(&self) -> Result<()> {
        self.request(|reply| Command::StartCapture { reply }).await
    }

    /// Stop capture, flush and send per the outgoing mode
    pub async fn stop_capture(&self) -> Result<()> {
        self.request(|reply| Command::StopCapture { reply }).await
    }

    /// Send previously captured fragments as one payload on this session
    pub async fn resend(&self, captured: CapturedAudio) -> Result<()> {
        self.request(|reply| Command::Resend { captured, reply }).await
    }

    /// Release the artifact and return to Connected
    pub async fn discard(&self) -> Result<()> {
        self.request(|reply| Command::Discard { reply }).await
    }

    /// Close the transport and stop capture. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.request(|reply| Command::Close { reply }).await
    }

    /// Hand over fragments that were captured but not sent
    pub async fn take_captured(&self) -> Result<CapturedAudio> {
        self.request(|reply| Command::TakeCaptured { reply }).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn state(&self) -> Result<SessionState> {
        Ok(self.snapshot().await?.state)
    }

    pub async fn artifact(&self) -> Result<Option<Arc<Artifact>>> {
        Ok(self.snapshot().await?.artifact)
    }

    /// Upload the current artifact. Runs outside the session's queue.
    pub async fn persist(&self) -> Result<()> {
        let artifact = self.artifact().await?.ok_or(SessionError::NoArtifact)?;
        self.store.store(&artifact).await
    }

    /// Close and wait for the session task to finish
    pub async fn dispose(self) {
        if let Err(e) = self.close().await {
            debug!(session_id = %self.id, %e, "close during dispose");
        }
        let Session { commands, task, .. } = self;
        drop(commands);
        let _ = task.await;
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        settle(self.submit(make).await?).await
    }

    async fn submit<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<Pending<T>> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| SessionError::SessionGone)?;
        Ok(response)
    }
}

/// Wait for the answer to a queued command
pub(crate) async fn settle<T>(pending: Pending<T>) -> Result<T> {
    pending.await.map_err(|_| SessionError::SessionGone)?
}
