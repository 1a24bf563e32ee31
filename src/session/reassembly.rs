//! Inbound reassembly
//!
//! Inbound fragments are appended in arrival order and the playable
//! artifact is rebuilt from all of them after every change. The previous
//! artifact is released before the new one is installed.

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::framing::ParsePolicyError;
use crate::capture::Fragment;

/// When reassembly stops accepting inbound fragments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizePolicy {
    /// Keep appending while Ready; each append rebuilds the artifact
    #[default]
    Continuous,
    /// The first non-empty message completes the response
    FirstMessage,
}

impl FromStr for FinalizePolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continuous" => Ok(FinalizePolicy::Continuous),
            "first" | "first_message" => Ok(FinalizePolicy::FirstMessage),
            _ => Err(ParsePolicyError::new("finalize policy", s)),
        }
    }
}

/// A playable object assembled from inbound fragments
#[derive(Debug, PartialEq, Eq)]
pub struct Artifact {
    generation: u64,
    media_type: String,
    chunk_count: usize,
    bytes: Vec<u8>,
}

impl Artifact {
    /// Increments on every rebuild within a session
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// Number of inbound fragments the artifact was built from
    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Outcome of one append
#[derive(Debug, Default)]
pub struct Rebuild {
    /// Generation of the artifact that was dropped to make room
    pub released: Option<u64>,
    /// The newly installed artifact, if the bytes changed
    pub installed: Option<Arc<Artifact>>,
}

/// Ordered inbound fragments and the artifact derived from them
#[derive(Debug)]
pub struct Reassembler {
    media_type: String,
    chunks: Vec<Fragment>,
    artifact: Option<Arc<Artifact>>,
    generation: u64,
}

impl Reassembler {
    pub fn new(media_type: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            chunks: Vec::new(),
            artifact: None,
            generation: 0,
        }
    }

    /// Append one fragment in arrival order and rebuild if anything changed
    pub fn append(&mut self, chunk: Fragment) -> Rebuild {
        let changed = !chunk.is_empty();
        self.chunks.push(chunk);

        if !changed {
            debug!(chunks = self.chunks.len(), "empty inbound fragment, artifact unchanged");
            return Rebuild::default();
        }

        // Release first so two full copies never coexist in the session
        let released = self.artifact.take().map(|a| a.generation);

        self.generation += 1;
        let artifact = Arc::new(Artifact {
            generation: self.generation,
            media_type: self.media_type.clone(),
            chunk_count: self.chunks.len(),
            bytes: assemble(&self.chunks),
        });
        self.artifact = Some(Arc::clone(&artifact));

        Rebuild {
            released,
            installed: Some(artifact),
        }
    }

    pub fn artifact(&self) -> Option<Arc<Artifact>> {
        self.artifact.clone()
    }

    pub fn has_artifact(&self) -> bool {
        self.artifact.as_ref().is_some_and(|a| !a.is_empty())
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Drop every fragment and the artifact; returns the released generation
    pub fn clear(&mut self) -> Option<u64> {
        self.chunks.clear();
        self.artifact.take().map(|a| a.generation)
    }
}

/// Ordered concatenation of inbound fragments
pub fn assemble(chunks: &[Fragment]) -> Vec<u8> {
    let total = chunks.iter().map(Vec::len).sum();
    let mut bytes = Vec::with_capacity(total);
    for chunk in chunks {
        bytes.extend_from_slice(chunk);
    }
    bytes
}
