//! In-memory collaborators for session tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use crate::capture::{AudioInput, CaptureEvent, CaptureSink};
use crate::error::{Result, SessionError};
use crate::session::{Artifact, Session, SessionConfig};
use crate::state::SessionState;
use crate::store::ArtifactStore;
use crate::transport::{Connector, Inbound, Transport};

/// Test-side end of a fake connection
pub struct FakeLink {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    open: Arc<AtomicBool>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
}

impl FakeLink {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            open: Arc::new(AtomicBool::new(true)),
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: Mutex::new(Some(rx)),
        })
    }

    /// Messages the client sent, in order
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    /// Deliver a binary message from the server
    pub fn push(&self, bytes: &[u8]) {
        self.push_inbound(Inbound::Binary(bytes.to_vec()));
    }

    pub fn push_inbound(&self, inbound: Inbound) {
        if let Some(tx) = self.inbound_tx.lock().unwrap().as_ref() {
            let _ = tx.send(inbound);
        }
    }

    /// Make sends fail without the session hearing about it yet
    pub fn sever(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Server closes the connection; the session observes end of stream
    pub fn hang_up(&self) {
        self.sever();
        self.inbound_tx.lock().unwrap().take();
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn transport(&self) -> FakeTransport {
        FakeTransport {
            sent: Arc::clone(&self.sent),
            open: Arc::clone(&self.open),
            inbound: self
                .inbound_rx
                .lock()
                .unwrap()
                .take()
                .expect("fake link connected twice"),
        }
    }
}

pub struct FakeTransport {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    open: Arc<AtomicBool>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&mut self, payload: Vec<u8>) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(SessionError::TransportClosed);
        }
        self.sent.lock().unwrap().push(payload);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Inbound> {
        self.inbound.recv().await
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

enum ConnectBehavior {
    Succeed,
    /// A new link per connection
    Fresh(Mutex<Vec<Arc<FakeLink>>>),
    Refuse(String),
    Gated(Arc<Notify>),
}

pub struct FakeConnector {
    link: Arc<FakeLink>,
    behavior: ConnectBehavior,
}

impl FakeConnector {
    pub fn new(link: Arc<FakeLink>) -> Arc<Self> {
        Arc::new(Self {
            link,
            behavior: ConnectBehavior::Succeed,
        })
    }

    pub fn refusing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            link: FakeLink::new(),
            behavior: ConnectBehavior::Refuse(message.to_string()),
        })
    }

    /// Hands every connection its own link
    pub fn fresh() -> Arc<Self> {
        Arc::new(Self {
            link: FakeLink::new(),
            behavior: ConnectBehavior::Fresh(Mutex::new(Vec::new())),
        })
    }

    /// Links handed out by a `fresh` connector, oldest first
    pub fn links(&self) -> Vec<Arc<FakeLink>> {
        match &self.behavior {
            ConnectBehavior::Fresh(links) => links.lock().unwrap().clone(),
            _ => vec![Arc::clone(&self.link)],
        }
    }

    /// Connects only once the returned gate is notified
    pub fn gated(link: Arc<FakeLink>) -> (Arc<Self>, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let connector = Arc::new(Self {
            link,
            behavior: ConnectBehavior::Gated(Arc::clone(&gate)),
        });
        (connector, gate)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn Transport>> {
        match &self.behavior {
            ConnectBehavior::Succeed => {}
            ConnectBehavior::Fresh(links) => {
                let link = FakeLink::new();
                let transport = link.transport();
                links.lock().unwrap().push(link);
                return Ok(Box::new(transport));
            }
            ConnectBehavior::Refuse(message) => {
                return Err(SessionError::ConnectionError {
                    endpoint: endpoint.to_string(),
                    message: message.clone(),
                })
            }
            ConnectBehavior::Gated(gate) => gate.notified().await,
        }
        Ok(Box::new(self.link.transport()))
    }
}

#[derive(Default)]
struct InputState {
    sink: Option<CaptureSink>,
    in_flight: Option<Vec<u8>>,
    permission_error: Option<SessionError>,
    permission_gate: Option<std::sync::mpsc::Receiver<()>>,
    start_error: Option<SessionError>,
    starts: usize,
    stops: usize,
}

/// Drives a `ScriptedInput` from the test
#[derive(Clone, Default)]
pub struct InputController {
    state: Arc<Mutex<InputState>>,
}

impl InputController {
    /// Deliver a fragment as if the device produced it
    pub fn emit(&self, bytes: &[u8]) {
        self.send(CaptureEvent::Fragment(bytes.to_vec()));
    }

    /// The device breaks mid-recording
    pub fn fail(&self, message: &str) {
        self.send(CaptureEvent::Error(message.to_string()));
    }

    /// The input runs out on its own
    pub fn finish(&self) {
        let sink = self.state.lock().unwrap().sink.take();
        if let Some(sink) = sink {
            let _ = sink.send(CaptureEvent::Ended);
        }
    }

    /// Fragment still being recorded, delivered by `stop()`
    pub fn set_in_flight(&self, bytes: &[u8]) {
        self.state.lock().unwrap().in_flight = Some(bytes.to_vec());
    }

    pub fn deny_permission(&self) {
        self.state.lock().unwrap().permission_error =
            Some(SessionError::PermissionDenied("denied by user".to_string()));
    }

    /// Keep the permission prompt up until the returned sender fires
    pub fn hold_permission(&self) -> std::sync::mpsc::Sender<()> {
        let (grant, gate) = std::sync::mpsc::channel();
        self.state.lock().unwrap().permission_gate = Some(gate);
        grant
    }

    pub fn fail_start(&self, error: SessionError) {
        self.state.lock().unwrap().start_error = Some(error);
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().unwrap().sink.is_some()
    }

    pub fn starts(&self) -> usize {
        self.state.lock().unwrap().starts
    }

    pub fn stops(&self) -> usize {
        self.state.lock().unwrap().stops
    }

    fn send(&self, event: CaptureEvent) {
        if let Some(sink) = self.state.lock().unwrap().sink.as_ref() {
            let _ = sink.send(event);
        }
    }
}

pub struct ScriptedInput {
    controller: InputController,
}

impl ScriptedInput {
    pub fn new() -> (Box<Self>, InputController) {
        let controller = InputController::default();
        (
            Box::new(Self {
                controller: controller.clone(),
            }),
            controller,
        )
    }
}

impl AudioInput for ScriptedInput {
    fn request_permission(&mut self) -> Result<()> {
        let gate = self.controller.state.lock().unwrap().permission_gate.take();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        match self.controller.state.lock().unwrap().permission_error.clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn start(&mut self, sink: CaptureSink) -> Result<()> {
        let mut state = self.controller.state.lock().unwrap();
        if let Some(e) = state.start_error.clone() {
            return Err(e);
        }
        state.sink = Some(sink);
        state.starts += 1;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut state = self.controller.state.lock().unwrap();
        state.stops += 1;
        if let Some(sink) = state.sink.take() {
            if let Some(fragment) = state.in_flight.take() {
                let _ = sink.send(CaptureEvent::Fragment(fragment));
            }
            let _ = sink.send(CaptureEvent::Ended);
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.controller.is_active()
    }
}

/// Keeps every artifact it is given
#[derive(Default)]
pub struct MemoryStore {
    stored: Mutex<Vec<Vec<u8>>>,
    reject: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reject(&self) {
        self.reject.store(true, Ordering::SeqCst);
    }

    pub fn stored(&self) -> Vec<Vec<u8>> {
        self.stored.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn store(&self, artifact: &Artifact) -> Result<()> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(SessionError::PersistFailed("server returned 500".to_string()));
        }
        self.stored.lock().unwrap().push(artifact.bytes().to_vec());
        Ok(())
    }
}

/// A session wired to fakes, with handles to drive them
pub struct Harness {
    pub session: Session,
    pub link: Arc<FakeLink>,
    pub input: InputController,
    pub store: Arc<MemoryStore>,
}

impl Harness {
    pub fn new(config: SessionConfig) -> Self {
        let link = FakeLink::new();
        let (input, controller) = ScriptedInput::new();
        let store = MemoryStore::new();
        let session = Session::new(config, FakeConnector::new(Arc::clone(&link)), input, store.clone());
        Self {
            session,
            link,
            input: controller,
            store,
        }
    }

    /// Open against the fake link
    pub async fn connected(config: SessionConfig) -> Self {
        let harness = Self::new(config);
        harness.session.open("ws://test/ws/audio").await.unwrap();
        harness
    }

    pub async fn recording(config: SessionConfig) -> Self {
        let harness = Self::connected(config).await;
        harness.session.start_capture().await.unwrap();
        harness
    }

    /// Poll until the session reaches `state`
    pub async fn wait_for_state(&self, state: SessionState) {
        wait_until(|| async move { self.session.state().await.ok() == Some(state) }).await;
    }

    /// Poll until `count` inbound chunks were appended
    pub async fn wait_for_chunks(&self, count: usize) {
        wait_until(|| async move {
            self.session
                .snapshot()
                .await
                .map(|s| s.inbound_chunks >= count)
                .unwrap_or(false)
        })
        .await;
    }
}

/// Poll `check` every few milliseconds for up to two seconds
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
