//! Unix domain socket server for IPC
//!
//! Provides request-response control of the current session and push
//! notifications of session events to subscribed clients.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use futures_util::future::BoxFuture;

use crate::events::SessionEvent;
use crate::session::Session;

use super::control::SessionControl;
use super::protocol::{Notification, Request, Response, ServiceStatus};

/// Largest accepted request body
const MAX_MESSAGE_LEN: usize = 1024 * 1024;

/// IPC Server handling client connections
pub struct Server {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    control: Arc<SessionControl>,
    start_time: Instant,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Bind the socket, replacing a stale one
    pub fn new(socket_path: &Path, control: Arc<SessionControl>) -> Result<Self> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create socket directory")?;
        }

        if socket_path.exists() {
            std::fs::remove_file(socket_path).context("failed to remove stale socket")?;
        }

        let listener = UnixListener::bind(socket_path).context("failed to bind Unix socket")?;

        // Owner-only (0600)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        info!(?socket_path, "IPC server listening");

        Ok(Self {
            socket_path: socket_path.to_owned(),
            listener: Some(listener),
            control,
            start_time: Instant::now(),
            shutdown_tx,
        })
    }

    /// Run the server, accepting connections
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref().context("server not initialized")?;

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("client connected");
                    let control = Arc::clone(&self.control);
                    let start_time = self.start_time;
                    let mut shutdown_rx = self.shutdown_tx.subscribe();

                    tokio::spawn(async move {
                        tokio::select! {
                            result = Self::handle_client(stream, control, start_time) => {
                                if let Err(e) = result {
                                    warn!(?e, "client handler error");
                                }
                            }
                            _ = shutdown_rx.recv() => {
                                debug!("client handler shutting down");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(?e, "accept error");
                }
            }
        }
    }

    /// Handle a single client connection
    ///
    /// Frames are read on a separate task so a subscribed client can
    /// receive notifications while no request is pending.
    async fn handle_client(stream: UnixStream, control: Arc<SessionControl>, start_time: Instant) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let (request_tx, mut request_rx) = mpsc::channel(8);
        let reader_task = tokio::spawn(Self::read_requests(reader, request_tx));

        let mut events: Option<broadcast::Receiver<SessionEvent>> = None;

        let result = loop {
            tokio::select! {
                request = request_rx.recv() => {
                    let Some(request) = request else {
                        break Ok(());
                    };
                    debug!(?request, "received request");

                    let response = match request {
                        Request::Subscribe => {
                            if events.is_none() {
                                events = Some(control.subscribe());
                                debug!("client subscribed to notifications");
                            }
                            Response::Subscribed
                        }
                        request => Self::process_request(request, &control, start_time).await,
                    };

                    if let Err(e) = Self::send_message(&mut writer, &response).await {
                        break Err(e);
                    }
                }
                event = recv_event(&mut events) => match event {
                    Ok(event) => {
                        let note = Notification::Event { event };
                        if let Err(e) = Self::send_message(&mut writer, &note).await {
                            break Err(e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "notification receiver lagged, resyncing");
                        let note = Notification::Resync {
                            skipped,
                            session: control.snapshot().await,
                        };
                        if let Err(e) = Self::send_message(&mut writer, &note).await {
                            break Err(e);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        events = None;
                    }
                },
            }
        };

        reader_task.abort();
        result
    }

    /// Read length-prefixed requests until EOF or a protocol error
    async fn read_requests(mut reader: OwnedReadHalf, requests: mpsc::Sender<Request>) -> Result<()> {
        let mut len_buf = [0u8; 4];

        loop {
            match reader.read_exact(&mut len_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!("client disconnected");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }

            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_MESSAGE_LEN {
                warn!(len, "message too large, disconnecting");
                return Ok(());
            }

            let mut msg_buf = vec![0u8; len];
            reader.read_exact(&mut msg_buf).await?;

            let request: Request = match serde_json::from_slice(&msg_buf) {
                Ok(request) => request,
                Err(e) => {
                    warn!(%e, "failed to parse request, disconnecting");
                    return Ok(());
                }
            };

            if requests.send(request).await.is_err() {
                return Ok(());
            }
        }
    }

    /// Send a length-prefixed JSON message
    async fn send_message<T: serde::Serialize>(writer: &mut OwnedWriteHalf, msg: &T) -> Result<()> {
        let msg_bytes = serde_json::to_vec(msg)?;
        let msg_len = (msg_bytes.len() as u32).to_le_bytes();

        writer.write_all(&msg_len).await?;
        writer.write_all(&msg_bytes).await?;

        Ok(())
    }

    /// Process a control request and return a response
    async fn process_request(request: Request, control: &SessionControl, start_time: Instant) -> Response {
        match request {
            Request::Ping => Response::Pong,

            Request::GetStatus => Response::Status(ServiceStatus {
                version: env!("CARGO_PKG_VERSION").to_string(),
                uptime_secs: start_time.elapsed().as_secs(),
                session: control.snapshot().await,
                retained_fragments: control.retained_fragments().await,
            }),

            Request::Open { endpoint } => match control.open(endpoint).await {
                Ok(session_id) => {
                    info!(%session_id, "session opened via IPC");
                    Response::Ok
                }
                Err(e) => e.into(),
            },

            Request::StartCapture => {
                Self::on_current(control, |session| Box::pin(session.start_capture())).await
            }

            Request::StopCapture => {
                Self::on_current(control, |session| Box::pin(session.stop_capture())).await
            }

            Request::Resend => match control.resend().await {
                Some(Ok(())) => Response::Ok,
                Some(Err(e)) => e.into(),
                None => Response::no_session(),
            },

            Request::Discard => Self::on_current(control, |session| Box::pin(session.discard())).await,

            Request::Persist => Self::on_current(control, |session| Box::pin(session.persist())).await,

            Request::Close => Self::on_current(control, |session| Box::pin(session.close())).await,

            // Handled by the connection loop
            Request::Subscribe => Response::Subscribed,
        }
    }

    /// Run `f` on the current session without holding the slot
    async fn on_current<F>(control: &SessionControl, f: F) -> Response
    where
        F: for<'a> FnOnce(&'a Session) -> BoxFuture<'a, crate::error::Result<()>>,
    {
        let Some(session) = control.current().await else {
            return Response::no_session();
        };
        match f(&session).await {
            Ok(()) => Response::Ok,
            Err(e) => e.into(),
        }
    }

    /// Gracefully shutdown the server
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.control.shutdown().await;

        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(?e, "failed to remove socket file");
            }
        }

        info!("IPC server shutdown complete");
    }
}

async fn recv_event(
    events: &mut Option<broadcast::Receiver<SessionEvent>>,
) -> std::result::Result<SessionEvent, broadcast::error::RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
