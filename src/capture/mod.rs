//! Capture module for audio inputs
//!
//! An `AudioInput` produces an ordered stream of opaque binary fragments
//! at a fixed cadence. Fragment boundaries carry no meaning; only the
//! order does.

mod file;
#[cfg(feature = "cpal-audio")]
mod mic;

use tokio::sync::mpsc;

use crate::error::Result;

pub use file::WavFileInput;
#[cfg(feature = "cpal-audio")]
pub use mic::MicInput;

/// One discrete unit of binary audio
pub type Fragment = Vec<u8>;

/// Events sent from an audio input to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// A captured fragment, in capture order
    Fragment(Fragment),
    /// The device failed mid-recording
    Error(String),
    /// No more fragments will follow
    Ended,
}

/// Where an input delivers its events
pub type CaptureSink = mpsc::UnboundedSender<CaptureEvent>;

/// A source of captured audio
///
/// `stop()` must deliver the in-flight fragment and then `Ended` to the
/// sink before it returns, so that a reader draining the sink up to
/// `Ended` has observed every fragment.
pub trait AudioInput: Send {
    /// Ask the platform for microphone access
    fn request_permission(&mut self) -> Result<()> {
        Ok(())
    }

    /// Start producing fragments into `sink`
    fn start(&mut self, sink: CaptureSink) -> Result<()>;

    /// Stop producing fragments. Calling it on an idle input is a no-op.
    fn stop(&mut self) -> Result<()>;

    /// Whether fragments are still being produced
    fn is_active(&self) -> bool;
}

/// Raw fragments captured during one recording, in capture order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedAudio {
    fragments: Vec<Fragment>,
}

impl CapturedAudio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: Fragment) {
        self.fragments.push(fragment);
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.fragments.iter().map(Vec::len).sum()
    }

    /// All fragments joined in capture order
    pub fn concat(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.total_bytes());
        for fragment in &self.fragments {
            payload.extend_from_slice(fragment);
        }
        payload
    }
}

impl From<Vec<Fragment>> for CapturedAudio {
    fn from(fragments: Vec<Fragment>) -> Self {
        Self { fragments }
    }
}
