//! Outgoing framing policies
//!
//! StreamingChunks hands every fragment straight to the transport.
//! BufferedWhole keeps fragments until the capture is flushed and then
//! sends their concatenation as a single payload.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::capture::{CapturedAudio, Fragment};

/// How captured audio leaves the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutgoingMode {
    /// Send each fragment as soon as it is captured
    #[default]
    StreamingChunks,
    /// Send one payload after capture stops
    BufferedWhole,
}

impl std::fmt::Display for OutgoingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutgoingMode::StreamingChunks => write!(f, "streaming"),
            OutgoingMode::BufferedWhole => write!(f, "buffered"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} {value:?}")]
pub struct ParsePolicyError {
    kind: &'static str,
    value: String,
}

impl ParsePolicyError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

impl FromStr for OutgoingMode {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "streaming" | "stream" | "streaming_chunks" => Ok(OutgoingMode::StreamingChunks),
            "buffered" | "buffer" | "buffered_whole" => Ok(OutgoingMode::BufferedWhole),
            _ => Err(ParsePolicyError::new("outgoing mode", s)),
        }
    }
}

/// What to do with a fragment once it has been captured
#[derive(Debug, PartialEq, Eq)]
pub enum Framed {
    /// Send this fragment now; `index` counts fragments in this capture
    Send { index: usize, fragment: Fragment },
    /// Kept for the flush payload
    Buffered,
}

/// Applies the outgoing policy to one capture's fragments
#[derive(Debug)]
pub struct Framer {
    mode: OutgoingMode,
    captured: CapturedAudio,
    seen: usize,
}

impl Framer {
    pub fn new(mode: OutgoingMode) -> Self {
        Self {
            mode,
            captured: CapturedAudio::new(),
            seen: 0,
        }
    }

    pub fn mode(&self) -> OutgoingMode {
        self.mode
    }

    /// Reset for a new capture
    pub fn begin(&mut self) {
        self.captured = CapturedAudio::new();
        self.seen = 0;
    }

    pub fn frame(&mut self, fragment: Fragment) -> Framed {
        let index = self.seen;
        self.seen += 1;

        match self.mode {
            OutgoingMode::StreamingChunks => Framed::Send { index, fragment },
            OutgoingMode::BufferedWhole => {
                self.captured.push(fragment);
                Framed::Buffered
            }
        }
    }

    /// Fragments observed since `begin`, sent or not
    pub fn fragments_seen(&self) -> usize {
        self.seen
    }

    /// Captured but not yet sent
    pub fn captured(&self) -> &CapturedAudio {
        &self.captured
    }

    /// Replace the retained capture, for a manual resend
    pub fn restore(&mut self, captured: CapturedAudio) {
        self.seen = captured.len();
        self.captured = captured;
    }

    /// The flush payload: every retained fragment in capture order
    pub fn payload(&self) -> Vec<u8> {
        self.captured.concat()
    }

    /// Hand the retained capture to the caller
    pub fn take(&mut self) -> CapturedAudio {
        std::mem::take(&mut self.captured)
    }

    /// Drop the retained capture
    pub fn clear(&mut self) {
        self.captured = CapturedAudio::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streaming_sends_every_fragment() {
        let mut framer = Framer::new(OutgoingMode::StreamingChunks);
        framer.begin();

        assert_eq!(
            framer.frame(b"a".to_vec()),
            Framed::Send { index: 0, fragment: b"a".to_vec() }
        );
        assert_eq!(
            framer.frame(b"b".to_vec()),
            Framed::Send { index: 1, fragment: b"b".to_vec() }
        );
        assert!(framer.captured().is_empty());
        assert_eq!(framer.fragments_seen(), 2);
    }

    #[test]
    fn test_buffered_concatenates_in_order() {
        let mut framer = Framer::new(OutgoingMode::BufferedWhole);
        framer.begin();

        for fragment in [b"a".to_vec(), b"b".to_vec(), b"c".to_vec()] {
            assert_eq!(framer.frame(fragment), Framed::Buffered);
        }
        assert_eq!(framer.payload(), b"abc".to_vec());

        // Building the payload does not consume the capture
        assert_eq!(framer.captured().len(), 3);
        assert_eq!(framer.take().len(), 3);
        assert!(framer.captured().is_empty());
    }

    #[test]
    fn test_begin_resets_previous_capture() {
        let mut framer = Framer::new(OutgoingMode::BufferedWhole);
        framer.begin();
        framer.frame(b"old".to_vec());

        framer.begin();
        framer.frame(b"new".to_vec());
        assert_eq!(framer.payload(), b"new".to_vec());
        assert_eq!(framer.fragments_seen(), 1);
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!("buffered".parse::<OutgoingMode>().unwrap(), OutgoingMode::BufferedWhole);
        assert_eq!(" Streaming ".parse::<OutgoingMode>().unwrap(), OutgoingMode::StreamingChunks);
        assert!("carrier-pigeon".parse::<OutgoingMode>().is_err());
    }
}
