//! Configuration loading and management

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::session::{FinalizePolicy, OutgoingMode};

/// Default server socket endpoint
pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8000/ws/audio";

/// Default artifact upload endpoint
pub const DEFAULT_STORE_URL: &str = "http://localhost:8000/store";

/// Client configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Server socket endpoint
    pub endpoint: String,

    /// Multipart upload endpoint for finished artifacts
    pub store_url: String,

    /// Whether captured audio is streamed or sent as one payload
    pub mode: OutgoingMode,

    /// When inbound reassembly stops accepting chunks
    pub finalize: FinalizePolicy,

    /// Capture cadence: one fragment per interval
    pub fragment_interval: Duration,

    /// Microphone sample rate
    pub sample_rate: u32,

    /// Bounded wait in AwaitingResponse; `None` waits forever
    pub response_timeout: Option<Duration>,

    /// Media type tagged on reassembled artifacts
    pub artifact_media_type: String,

    /// Path to the Unix domain socket for IPC
    pub socket_path: PathBuf,

    /// Directory for runtime data
    pub data_dir: PathBuf,
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let home = lookup("HOME").context("HOME is not set")?;
        let data_dir = PathBuf::from(&home)
            .join(".local")
            .join("share")
            .join("audio-relay");

        let socket_path = data_dir.join("control.sock");

        let mode = match lookup("AUDIO_RELAY_MODE") {
            Some(value) => value.parse()?,
            None => OutgoingMode::default(),
        };
        let finalize = match lookup("AUDIO_RELAY_FINALIZE") {
            Some(value) => value.parse()?,
            None => FinalizePolicy::default(),
        };

        let fragment_ms = parse_u64(&lookup, "AUDIO_RELAY_FRAGMENT_MS")?.unwrap_or(1000);
        if fragment_ms == 0 {
            anyhow::bail!("AUDIO_RELAY_FRAGMENT_MS must be greater than zero");
        }

        let sample_rate = parse_u64(&lookup, "AUDIO_RELAY_SAMPLE_RATE")?.unwrap_or(16_000);
        let sample_rate = u32::try_from(sample_rate).context("AUDIO_RELAY_SAMPLE_RATE is too large")?;

        // Zero disables the deadline
        let response_timeout = parse_u64(&lookup, "AUDIO_RELAY_RESPONSE_TIMEOUT_MS")?
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);

        Ok(Self {
            endpoint: lookup("AUDIO_RELAY_ENDPOINT").unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            store_url: lookup("AUDIO_RELAY_STORE_URL")
                .unwrap_or_else(|| DEFAULT_STORE_URL.to_string()),
            mode,
            finalize,
            fragment_interval: Duration::from_millis(fragment_ms),
            sample_rate,
            response_timeout,
            artifact_media_type: lookup("AUDIO_RELAY_MEDIA_TYPE")
                .unwrap_or_else(|| "audio/wav".to_string()),
            socket_path,
            data_dir,
        })
    }

    /// Ensure data directory exists
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }
}

fn parse_u64<F>(lookup: &F, key: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse::<u64>()
                .with_context(|| format!("{key} must be an unsigned integer, got {value:?}"))
        })
        .transpose()
}
