//! audio-relay: client for bidirectional audio streaming sessions
//!
//! A session captures audio from an input, sends it to a server over a
//! persistent socket, reassembles the server's binary reply into a
//! playable artifact and optionally uploads that artifact for storage.
//!
//! - `session` owns the lifecycle and serializes every operation
//! - `capture`, `transport` and `store` are the swappable collaborators
//! - `ipc` exposes one session to local clients over a Unix socket

pub mod capture;
pub mod config;
pub mod error;
pub mod events;
pub mod ipc;
pub mod lifecycle;
pub mod session;
pub mod state;
pub mod store;
pub mod transport;

#[cfg(test)]
mod testkit;

pub use error::{Result, SessionError};
pub use events::SessionEvent;
pub use session::{Artifact, Session, SessionConfig, SessionSnapshot};
pub use state::SessionState;
