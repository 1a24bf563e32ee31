//! Session event loop
//!
//! One task owns all session state. User commands, capture events,
//! inbound transport messages, connection completion and the response
//! deadline are handled one at a time from a single `select!`, so no two
//! handlers ever interleave. Input calls that may block (permission
//! prompts, device setup, joining the capture thread) run on the blocking
//! pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::framing::{Framed, Framer, OutgoingMode};
use super::reassembly::{FinalizePolicy, Reassembler};
use super::{SessionConfig, SessionSnapshot};
use crate::capture::{AudioInput, CaptureEvent, CapturedAudio, Fragment};
use crate::error::{Result, SessionError};
use crate::events::SessionEvent;
use crate::state::{SessionState, StateMachine};
use crate::transport::{Connector, Inbound, Transport};

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

/// Requests from a `Session` handle to its actor
pub(crate) enum Command {
    Open { endpoint: String, reply: Reply<()> },
    StartCapture { reply: Reply<()> },
    StopCapture { reply: Reply<()> },
    Resend { captured: CapturedAudio, reply: Reply<()> },
    Discard { reply: Reply<()> },
    Close { reply: Reply<()> },
    TakeCaptured { reply: Reply<CapturedAudio> },
    Snapshot { reply: Reply<SessionSnapshot> },
}

struct PendingConnect {
    endpoint: String,
    task: JoinHandle<Result<Box<dyn Transport>>>,
    reply: Option<Reply<()>>,
}

/// The input is handed back once its permission check and start returned
type StartOutcome = (Box<dyn AudioInput>, Result<()>);

struct PendingStart {
    task: JoinHandle<StartOutcome>,
    capture_rx: mpsc::UnboundedReceiver<CaptureEvent>,
    reply: Option<Reply<()>>,
}

pub(crate) struct SessionActor {
    id: Uuid,
    config: SessionConfig,
    machine: StateMachine,
    connector: Arc<dyn Connector>,
    /// `None` while a start holds it on the blocking pool
    input: Option<Box<dyn AudioInput>>,
    transport: Option<Box<dyn Transport>>,
    pending_connect: Option<PendingConnect>,
    pending_start: Option<PendingStart>,
    capture_rx: Option<mpsc::UnboundedReceiver<CaptureEvent>>,
    framer: Framer,
    reassembler: Reassembler,
    response_deadline: Option<Instant>,
    commands: mpsc::Receiver<Command>,
}

impl SessionActor {
    pub(crate) fn new(
        id: Uuid,
        config: SessionConfig,
        machine: StateMachine,
        connector: Arc<dyn Connector>,
        input: Box<dyn AudioInput>,
        commands: mpsc::Receiver<Command>,
    ) -> Self {
        Self {
            id,
            framer: Framer::new(config.mode),
            reassembler: Reassembler::new(config.media_type.clone()),
            config,
            machine,
            connector,
            input: Some(input),
            transport: None,
            pending_connect: None,
            pending_start: None,
            capture_rx: None,
            response_deadline: None,
            commands,
        }
    }

    /// Run until every handle is dropped, then release everything
    pub(crate) async fn run(mut self) {
        info!(session_id = %self.id, mode = %self.config.mode, "session started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                joined = wait_connect(&mut self.pending_connect) => {
                    self.on_connected(joined).await;
                }
                started = wait_start(&mut self.pending_start) => {
                    self.on_capture_started(started).await;
                }
                event = recv_capture(&mut self.capture_rx) => {
                    self.on_capture_event(event).await;
                }
                inbound = recv_inbound(&mut self.transport) => {
                    self.on_inbound(inbound).await;
                }
                _ = wait_deadline(self.response_deadline) => {
                    self.on_response_timeout().await;
                }
            }
        }

        self.release().await;
        if !self.machine.state().is_terminal() {
            let _ = self.machine.transition_to(SessionState::Closed);
        }
        if self.pending_start.take().is_some() {
            // Still blocked in the input; it is dropped, and stops, when that returns
            debug!(session_id = %self.id, "detaching input start");
        }
        info!(session_id = %self.id, "session stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Open { endpoint, reply } => self.open(endpoint, reply),
            Command::StartCapture { reply } => self.start_capture(reply),
            Command::StopCapture { reply } => {
                let result = self.stop_capture().await;
                let _ = reply.send(result);
            }
            Command::Resend { captured, reply } => {
                let result = self.resend(captured).await;
                let _ = reply.send(result);
            }
            Command::Discard { reply } => {
                let result = self.discard().await;
                let _ = reply.send(result);
            }
            Command::Close { reply } => {
                self.close().await;
                let _ = reply.send(Ok(()));
            }
            Command::TakeCaptured { reply } => {
                let _ = reply.send(self.take_captured());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(Ok(self.snapshot()));
            }
        }
    }

    // Connection lifecycle

    fn open(&mut self, endpoint: String, reply: Reply<()>) {
        let state = self.machine.state();
        if state == SessionState::Connecting {
            let _ = reply.send(Err(SessionError::AlreadyInProgress("open")));
            return;
        }
        if state != SessionState::Idle {
            let _ = reply.send(Err(SessionError::InvalidState {
                operation: "open",
                state,
            }));
            return;
        }

        if let Err(e) = self.machine.transition_to(SessionState::Connecting) {
            let _ = reply.send(Err(e));
            return;
        }

        info!(session_id = %self.id, %endpoint, "opening transport");

        // Connect off the queue so commands keep being served meanwhile
        let connector = Arc::clone(&self.connector);
        let target = endpoint.clone();
        let task = tokio::spawn(async move { connector.connect(&target).await });

        self.pending_connect = Some(PendingConnect {
            endpoint,
            task,
            reply: Some(reply),
        });
    }

    async fn on_connected(&mut self, joined: std::result::Result<Result<Box<dyn Transport>>, JoinError>) {
        let Some(mut pending) = self.pending_connect.take() else {
            return;
        };
        let reply = pending.reply.take();

        let result = match joined {
            Ok(Ok(mut transport)) if transport.is_open() => {
                if self.machine.state() == SessionState::Connecting {
                    self.transport = Some(transport);
                    self.machine.transition_to(SessionState::Connected)
                } else {
                    transport.close().await;
                    Err(SessionError::InvalidState {
                        operation: "open",
                        state: self.machine.state(),
                    })
                }
            }
            Ok(Ok(_)) => Err(self.connect_failed(
                &pending.endpoint,
                "transport closed before connecting".to_string(),
            )),
            Ok(Err(e)) => {
                self.fail(e.clone()).await;
                Err(e)
            }
            Err(e) => Err(self.connect_failed(&pending.endpoint, e.to_string())),
        };

        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    fn connect_failed(&mut self, endpoint: &str, message: String) -> SessionError {
        let error = SessionError::ConnectionError {
            endpoint: endpoint.to_string(),
            message,
        };
        self.machine.fail(error.clone());
        error
    }

    async fn close(&mut self) {
        if self.machine.state() == SessionState::Closed {
            debug!(session_id = %self.id, "close on closed session");
            return;
        }

        let unsent = self.framer.captured().len();
        if unsent > 0 {
            info!(session_id = %self.id, fragments = unsent, "discarding unsent capture");
        }
        self.framer.clear();
        self.release().await;

        let _ = self.machine.transition_to(SessionState::Closed);
    }

    /// Abort the pending connect, stop capture and close the transport
    async fn release(&mut self) {
        if let Some(mut pending) = self.pending_connect.take() {
            pending.task.abort();
            if let Some(reply) = pending.reply.take() {
                let _ = reply.send(Err(SessionError::ConnectionError {
                    endpoint: pending.endpoint,
                    message: "session closed before connecting".to_string(),
                }));
            }
        }

        // A blocking start cannot be aborted; its input is stopped once it returns
        if let Some(reply) = self.pending_start.as_mut().and_then(|p| p.reply.take()) {
            let _ = reply.send(Err(SessionError::CaptureFailure(
                "session released before capture started".to_string(),
            )));
        }

        self.halt_capture().await;

        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
            debug!(session_id = %self.id, "transport released");
        }

        self.response_deadline = None;
    }

    async fn fail(&mut self, cause: SessionError) {
        self.release().await;
        self.machine.fail(cause);
    }

    // Capture lifecycle

    fn start_capture(&mut self, reply: Reply<()>) {
        if let Err(e) = self.check_can_start() {
            let _ = reply.send(Err(e));
            return;
        }
        let Some(mut input) = self.input.take() else {
            let _ = reply.send(Err(SessionError::DeviceUnavailable(
                "audio input is no longer available".to_string(),
            )));
            return;
        };

        let (sink, capture_rx) = mpsc::unbounded_channel();
        let task = tokio::task::spawn_blocking(move || {
            let result = input.request_permission().and_then(|()| input.start(sink));
            (input, result)
        });

        self.pending_start = Some(PendingStart {
            task,
            capture_rx,
            reply: Some(reply),
        });
    }

    fn check_can_start(&self) -> Result<()> {
        if self.pending_start.is_some() {
            return Err(SessionError::AlreadyInProgress("capture"));
        }

        let state = self.machine.state();
        match state {
            SessionState::Recording | SessionState::Flushing => {
                return Err(SessionError::AlreadyInProgress("capture"))
            }
            SessionState::Connected => {}
            _ => {
                return Err(SessionError::InvalidState {
                    operation: "start capture",
                    state,
                })
            }
        }

        if !self.transport_open() {
            return Err(SessionError::TransportClosed);
        }
        Ok(())
    }

    async fn on_capture_started(&mut self, joined: std::result::Result<StartOutcome, JoinError>) {
        let Some(mut pending) = self.pending_start.take() else {
            return;
        };
        let reply = pending.reply.take();

        let result = match joined {
            Ok((input, Ok(()))) => {
                self.input = Some(input);
                let state = self.machine.state();
                if state == SessionState::Connected && self.transport_open() {
                    self.framer.begin();
                    self.capture_rx = Some(pending.capture_rx);
                    let result = self.machine.transition_to(SessionState::Recording);
                    if result.is_ok() {
                        self.machine.emit(SessionEvent::CaptureStarted);
                    }
                    result
                } else {
                    debug!(session_id = %self.id, %state, "capture started after session moved on");
                    self.stop_input().await;
                    Err(SessionError::InvalidState {
                        operation: "start capture",
                        state,
                    })
                }
            }
            Ok((input, Err(e))) => {
                self.input = Some(input);
                Err(e)
            }
            Err(e) => Err(SessionError::CaptureFailure(format!("input start task failed: {e}"))),
        };

        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    async fn stop_capture(&mut self) -> Result<()> {
        let state = self.machine.state();
        if state != SessionState::Recording {
            return Err(SessionError::InvalidState {
                operation: "stop capture",
                state,
            });
        }
        self.flush_capture().await
    }

    async fn on_capture_event(&mut self, event: Option<CaptureEvent>) {
        match event {
            Some(CaptureEvent::Fragment(fragment)) => {
                if self.machine.state() == SessionState::Recording {
                    self.accept_fragment(fragment).await;
                } else {
                    debug!(session_id = %self.id, "fragment outside recording, dropped");
                }
            }
            Some(CaptureEvent::Error(message)) => {
                if self.machine.state() == SessionState::Recording {
                    warn!(session_id = %self.id, %message, "capture device failed");
                    self.fail(SessionError::CaptureFailure(message)).await;
                } else {
                    debug!(session_id = %self.id, %message, "capture error while stopping, ignored");
                }
            }
            Some(CaptureEvent::Ended) | None => {
                if self.machine.state() == SessionState::Recording {
                    info!(session_id = %self.id, "input exhausted, flushing");
                    if let Err(e) = self.flush_capture().await {
                        debug!(session_id = %self.id, %e, "flush after input end failed");
                    }
                } else {
                    self.capture_rx = None;
                }
            }
        }
    }

    async fn accept_fragment(&mut self, fragment: Fragment) {
        match self.framer.frame(fragment) {
            Framed::Send { index, fragment } => self.send_streamed(index, fragment).await,
            Framed::Buffered => {}
        }
    }

    /// Best effort: a fragment that cannot go out is dropped with a warning
    async fn send_streamed(&mut self, index: usize, fragment: Fragment) {
        let bytes = fragment.len();

        let sent = match self.transport.as_mut().filter(|t| t.is_open()) {
            Some(transport) => match transport.send(fragment).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(session_id = %self.id, index, %e, "fragment send failed");
                    false
                }
            },
            None => {
                warn!(session_id = %self.id, index, "transport not open, fragment dropped");
                false
            }
        };

        if sent {
            self.machine.emit(SessionEvent::FragmentSent { index, bytes });
        } else {
            self.machine.emit(SessionEvent::FragmentDropped { index, bytes });
        }
    }

    /// Recording -> Flushing -> AwaitingResponse
    async fn flush_capture(&mut self) -> Result<()> {
        self.machine.transition_to(SessionState::Flushing)?;

        self.stop_input().await;

        // The input has delivered everything up to Ended before stop returned
        if let Some(mut capture_rx) = self.capture_rx.take() {
            while let Ok(event) = capture_rx.try_recv() {
                match event {
                    CaptureEvent::Fragment(fragment) => self.accept_fragment(fragment).await,
                    CaptureEvent::Error(message) => {
                        debug!(session_id = %self.id, %message, "capture error while stopping, ignored");
                    }
                    CaptureEvent::Ended => break,
                }
            }
        }

        self.machine.emit(SessionEvent::CaptureStopped {
            fragments: self.framer.fragments_seen(),
            bytes: self.framer.captured().total_bytes(),
        });

        match self.framer.mode() {
            OutgoingMode::StreamingChunks => {}
            OutgoingMode::BufferedWhole => self.send_buffered().await?,
        }

        self.await_response()
    }

    /// Exactly one send attempt; on failure the capture stays retained
    async fn send_buffered(&mut self) -> Result<()> {
        let fragments = self.framer.captured().len();
        let payload = self.framer.payload();
        let bytes = payload.len();

        let result = match self.transport.as_mut().filter(|t| t.is_open()) {
            Some(transport) => transport.send(payload).await,
            None => Err(SessionError::TransportClosed),
        };

        match result {
            Ok(()) => {
                info!(session_id = %self.id, fragments, bytes, "buffered payload sent");
                self.framer.clear();
                self.machine.emit(SessionEvent::PayloadSent { fragments, bytes });
                Ok(())
            }
            Err(e) => {
                warn!(session_id = %self.id, fragments, %e, "buffered payload not sent, capture retained");
                self.fail(e.clone()).await;
                Err(e)
            }
        }
    }

    async fn resend(&mut self, captured: CapturedAudio) -> Result<()> {
        let state = self.machine.state();
        match state {
            SessionState::Recording | SessionState::Flushing => {
                return Err(SessionError::AlreadyInProgress("capture"))
            }
            SessionState::Connected => {}
            _ => {
                return Err(SessionError::InvalidState {
                    operation: "resend",
                    state,
                })
            }
        }

        info!(session_id = %self.id, fragments = captured.len(), "resending retained capture");

        self.framer.restore(captured);
        self.machine.transition_to(SessionState::Flushing)?;
        self.send_buffered().await?;
        self.await_response()
    }

    fn take_captured(&mut self) -> Result<CapturedAudio> {
        let state = self.machine.state();
        if matches!(state, SessionState::Recording | SessionState::Flushing) {
            return Err(SessionError::InvalidState {
                operation: "take capture",
                state,
            });
        }
        Ok(self.framer.take())
    }

    async fn halt_capture(&mut self) {
        let active = self.input.as_ref().is_some_and(|input| input.is_active());
        if self.capture_rx.take().is_some() || active {
            self.stop_input().await;
        }
    }

    /// Stop the input on the blocking pool and wait for it to hand back
    async fn stop_input(&mut self) {
        let Some(mut input) = self.input.take() else {
            return;
        };

        match tokio::task::spawn_blocking(move || {
            let result = input.stop();
            (input, result)
        })
        .await
        {
            Ok((input, result)) => {
                self.input = Some(input);
                if let Err(e) = result {
                    warn!(session_id = %self.id, %e, "input did not stop cleanly");
                }
            }
            Err(e) => warn!(session_id = %self.id, %e, "input stop task failed"),
        }
    }

    // Inbound reassembly

    fn await_response(&mut self) -> Result<()> {
        self.machine.transition_to(SessionState::AwaitingResponse)?;

        if self.reassembler.has_artifact() {
            // The server answered while we were still sending
            return self.machine.transition_to(SessionState::Ready);
        }

        // A timeout too large to represent never fires
        self.response_deadline = self
            .config
            .response_timeout
            .and_then(|t| Instant::now().checked_add(t));
        Ok(())
    }

    fn accepts_inbound(&self) -> bool {
        match self.machine.state() {
            SessionState::Connected | SessionState::Recording | SessionState::AwaitingResponse => true,
            SessionState::Ready => self.config.finalize == FinalizePolicy::Continuous,
            _ => false,
        }
    }

    async fn on_inbound(&mut self, inbound: Option<Inbound>) {
        match inbound {
            Some(Inbound::Binary(bytes)) if self.accepts_inbound() => self.append_inbound(bytes),
            Some(Inbound::Binary(bytes)) => {
                self.protocol_violation(format!("unexpected {} byte fragment", bytes.len()));
            }
            Some(Inbound::Unexpected(description)) => self.protocol_violation(description),
            None => self.on_transport_lost().await,
        }
    }

    fn append_inbound(&mut self, bytes: Vec<u8>) {
        let rebuild = self.reassembler.append(bytes);

        if let Some(generation) = rebuild.released {
            self.machine.emit(SessionEvent::ArtifactReleased { generation });
        }
        if let Some(artifact) = rebuild.installed {
            debug!(
                session_id = %self.id,
                generation = artifact.generation(),
                bytes = artifact.len(),
                "artifact rebuilt"
            );
            self.machine.emit(SessionEvent::ArtifactUpdated {
                generation: artifact.generation(),
                chunks: artifact.chunk_count(),
                bytes: artifact.len(),
            });
        }

        if self.machine.state() == SessionState::AwaitingResponse && self.reassembler.has_artifact() {
            self.response_deadline = None;
            let _ = self.machine.transition_to(SessionState::Ready);
        }
    }

    fn protocol_violation(&self, message: String) {
        let state = self.machine.state();
        let error = SessionError::ProtocolViolation {
            state,
            message: message.clone(),
        };
        warn!(session_id = %self.id, %error, "ignoring inbound message");
        self.machine.emit(SessionEvent::ProtocolViolation { state, message });
    }

    async fn on_transport_lost(&mut self) {
        self.transport = None;
        self.machine.emit(SessionEvent::TransportLost);

        match self.machine.state() {
            // The response is complete; the artifact stays usable
            SessionState::Ready => {
                info!(session_id = %self.id, "transport closed after response");
            }
            state if state.is_terminal() => {}
            _ => self.fail(SessionError::TransportClosed).await,
        }
    }

    async fn on_response_timeout(&mut self) {
        let Some(timeout) = self.config.response_timeout else {
            return;
        };
        self.response_deadline = None;

        if self.machine.state() == SessionState::AwaitingResponse {
            self.fail(SessionError::ResponseTimeout {
                timeout_ms: timeout_ms(timeout),
            })
            .await;
        }
    }

    async fn discard(&mut self) -> Result<()> {
        let state = self.machine.state();
        if state != SessionState::Ready {
            return Err(SessionError::InvalidState {
                operation: "discard",
                state,
            });
        }

        if let Some(generation) = self.reassembler.clear() {
            self.machine.emit(SessionEvent::ArtifactReleased { generation });
        }
        self.framer.clear();

        if self.transport_open() {
            self.machine.transition_to(SessionState::Connected)
        } else {
            self.fail(SessionError::TransportClosed).await;
            Err(SessionError::TransportClosed)
        }
    }

    fn transport_open(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_open())
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id,
            state: self.machine.state(),
            mode: self.config.mode,
            last_error: self.machine.last_error().cloned(),
            inbound_chunks: self.reassembler.chunk_count(),
            captured_fragments: self.framer.captured().len(),
            artifact: self.reassembler.artifact(),
        }
    }
}

async fn wait_connect(
    pending: &mut Option<PendingConnect>,
) -> std::result::Result<Result<Box<dyn Transport>>, JoinError> {
    match pending {
        Some(pending) => (&mut pending.task).await,
        None => std::future::pending().await,
    }
}

async fn wait_start(pending: &mut Option<PendingStart>) -> std::result::Result<StartOutcome, JoinError> {
    match pending {
        Some(pending) => (&mut pending.task).await,
        None => std::future::pending().await,
    }
}

async fn recv_capture(
    capture_rx: &mut Option<mpsc::UnboundedReceiver<CaptureEvent>>,
) -> Option<CaptureEvent> {
    match capture_rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_inbound(transport: &mut Option<Box<dyn Transport>>) -> Option<Inbound> {
    match transport {
        Some(transport) => transport.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Whole milliseconds, saturating
fn timeout_ms(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}
