//! audio-relay: record an utterance, stream it to a server and keep the
//! audio the server sends back
//!
//! Two ways to run it:
//! - `record` runs one session from the command line and writes the reply
//! - `serve` exposes a session to local clients over a Unix socket

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use audio_relay::capture::{AudioInput, CapturedAudio, WavFileInput};
use audio_relay::config::Config;
use audio_relay::ipc::{InputFactory, Server, SessionControl};
use audio_relay::lifecycle::ShutdownSignal;
use audio_relay::session::OutgoingMode;
use audio_relay::store::{ArtifactStore, HttpStore};
use audio_relay::transport::{Connector, WebSocketConnector};
use audio_relay::{Session, SessionConfig, SessionError, SessionEvent, SessionState};

#[derive(Parser)]
#[command(name = "audio-relay", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record one utterance and save the server's reply
    Record(RecordArgs),
    /// Serve session control over a Unix socket
    Serve(ServeArgs),
}

#[derive(Args)]
struct RecordArgs {
    /// Server socket endpoint
    #[arg(long)]
    endpoint: Option<String>,

    /// streaming or buffered
    #[arg(long)]
    mode: Option<OutgoingMode>,

    /// Replay a WAV file instead of the microphone
    #[arg(long)]
    input: Option<PathBuf>,

    /// Longest recording, in seconds
    #[arg(long, default_value_t = 5)]
    duration: u64,

    /// Where to write the reply
    #[arg(long, short, default_value = "reply.wav")]
    output: PathBuf,

    /// Also upload the reply to the store endpoint
    #[arg(long)]
    persist: bool,

    /// If the connection drops before a buffered recording is sent,
    /// reconnect once and send it again
    #[arg(long)]
    resend_on_loss: bool,
}

#[derive(Args)]
struct ServeArgs {
    /// Socket path, defaults to the data directory
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Replay a WAV file for every capture instead of the microphone
    #[arg(long)]
    input: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    info!(version = env!("CARGO_PKG_VERSION"), "audio-relay starting");

    let config = Config::load()?;
    info!(endpoint = %config.endpoint, mode = %config.mode, "configuration loaded");

    match cli.command {
        Command::Record(args) => record(config, args).await,
        Command::Serve(args) => serve(config, args).await,
    }
}

async fn record(config: Config, args: RecordArgs) -> Result<()> {
    let mut session_config = SessionConfig::from(&config);
    if let Some(mode) = args.mode {
        session_config.mode = mode;
    }

    let inputs = input_factory(&config, args.input.clone())?;
    let connector: Arc<dyn Connector> = Arc::new(WebSocketConnector);
    let store: Arc<dyn ArtifactStore> = Arc::new(HttpStore::new(config.store_url.clone()));
    let mut session = Session::new(
        session_config.clone(),
        Arc::clone(&connector),
        inputs()?,
        Arc::clone(&store),
    );
    let mut events = session.subscribe();
    let mut shutdown = ShutdownSignal::new()?;

    let endpoint = args.endpoint.unwrap_or_else(|| config.endpoint.clone());
    let duration = Duration::from_secs(args.duration);
    let mut outcome = run_round_trip(&session, &mut events, &mut shutdown, &endpoint, duration).await;

    if outcome.is_err() && args.resend_on_loss {
        if let Some(captured) = unsent_after_loss(&session).await {
            warn!(fragments = captured.len(), "connection lost, resending on a new connection");
            let retry = Session::new(session_config, connector, inputs()?, store);
            let mut retry_events = retry.subscribe();
            outcome = resend_round_trip(&retry, &mut retry_events, &mut shutdown, &endpoint, captured).await;
            std::mem::replace(&mut session, retry).dispose().await;
        }
    }

    let result = match outcome {
        Ok(()) => save_reply(&session, &args.output, args.persist).await,
        Err(e) => Err(e),
    };
    session.dispose().await;
    result
}

/// Open, record for up to `duration` or until interrupted, then wait for
/// the reply. A second interrupt abandons the wait.
async fn run_round_trip(
    session: &Session,
    events: &mut broadcast::Receiver<SessionEvent>,
    shutdown: &mut ShutdownSignal,
    endpoint: &str,
    duration: Duration,
) -> Result<()> {
    session.open(endpoint).await?;
    session.start_capture().await?;
    info!(seconds = duration.as_secs(), "recording");

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);

    // The input may run out before the deadline and flush on its own
    while session.state().await? == SessionState::Recording {
        let stop = tokio::select! {
            _ = &mut deadline => true,
            _ = shutdown.wait() => {
                info!("interrupted, stopping capture");
                true
            }
            event = events.recv() => matches!(event, Err(RecvError::Closed)),
        };
        if stop {
            match session.stop_capture().await {
                Ok(()) | Err(SessionError::InvalidState { .. }) => {}
                Err(e) => warn!(%e, "stop capture failed"),
            }
            break;
        }
    }

    wait_for_response(session, events, shutdown).await
}

/// Reconnect and send a recording the previous connection lost
async fn resend_round_trip(
    session: &Session,
    events: &mut broadcast::Receiver<SessionEvent>,
    shutdown: &mut ShutdownSignal,
    endpoint: &str,
    captured: CapturedAudio,
) -> Result<()> {
    session.open(endpoint).await?;
    session.resend(captured).await?;
    wait_for_response(session, events, shutdown).await
}

/// Capture a failed session still holds, when the failure was a lost
/// connection
async fn unsent_after_loss(session: &Session) -> Option<CapturedAudio> {
    let snapshot = session.snapshot().await.ok()?;
    if !snapshot.last_error.is_some_and(|e| e.is_retry_required()) {
        return None;
    }
    session.take_captured().await.ok().filter(|captured| !captured.is_empty())
}

async fn wait_for_response(
    session: &Session,
    events: &mut broadcast::Receiver<SessionEvent>,
    shutdown: &mut ShutdownSignal,
) -> Result<()> {
    info!("waiting for response");
    loop {
        let snapshot = session.snapshot().await?;
        match snapshot.state {
            SessionState::Ready => return Ok(()),
            SessionState::Failed | SessionState::Closed => {
                let cause = snapshot
                    .last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "session closed".to_string());
                anyhow::bail!("no response: {cause}");
            }
            _ => {}
        }
        tokio::select! {
            event = events.recv() => {
                if let Err(RecvError::Closed) = event {
                    anyhow::bail!("session stopped while waiting for response");
                }
            }
            _ = shutdown.wait() => anyhow::bail!("interrupted while waiting for response"),
        }
    }
}

async fn save_reply(session: &Session, output: &Path, persist: bool) -> Result<()> {
    let artifact = session.artifact().await?.context("session has no artifact")?;
    std::fs::write(output, artifact.bytes())
        .with_context(|| format!("failed to write {}", output.display()))?;
    info!(path = %output.display(), bytes = artifact.len(), "reply saved");

    if persist {
        session.persist().await?;
    }
    Ok(())
}

async fn serve(config: Config, args: ServeArgs) -> Result<()> {
    config.ensure_dirs()?;
    let socket_path = args.socket.unwrap_or_else(|| config.socket_path.clone());

    let control = SessionControl::new(
        SessionConfig::from(&config),
        config.endpoint.clone(),
        Arc::new(WebSocketConnector),
        Arc::new(HttpStore::new(config.store_url.clone())),
        input_factory(&config, args.input)?,
    );

    let server = Server::new(&socket_path, Arc::new(control))?;
    let mut shutdown = ShutdownSignal::new()?;

    info!("service initialized, entering main loop");

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(?e, "IPC server error");
            }
        }
        _ = shutdown.wait() => {
            info!("shutdown signal received");
        }
    }

    info!("shutting down...");
    server.shutdown().await;
    info!("audio-relay stopped");

    Ok(())
}

/// A WAV replay when `wav` is given, otherwise the default microphone
fn input_factory(config: &Config, wav: Option<PathBuf>) -> Result<InputFactory> {
    let interval = config.fragment_interval;

    if let Some(path) = wav {
        return Ok(Box::new(move || {
            let input: Box<dyn AudioInput> = Box::new(WavFileInput::open(&path, interval)?);
            Ok(input)
        }));
    }

    microphone(config.sample_rate, interval)
}

#[cfg(feature = "cpal-audio")]
fn microphone(sample_rate: u32, interval: Duration) -> Result<InputFactory> {
    use audio_relay::capture::MicInput;

    Ok(Box::new(move || {
        let input: Box<dyn AudioInput> = Box::new(MicInput::new(sample_rate, interval));
        Ok(input)
    }))
}

#[cfg(not(feature = "cpal-audio"))]
fn microphone(_sample_rate: u32, _interval: Duration) -> Result<InputFactory> {
    anyhow::bail!("built without microphone support; pass --input <file.wav> or enable the cpal-audio feature")
}
