//! State machine module for session lifecycle
//!
//! Provides the single explicit state value of an audio session:
//! - Idle, Connecting, Connected: transport lifecycle
//! - Recording, Flushing: capture lifecycle
//! - AwaitingResponse, Ready: inbound reassembly
//! - Closed, Failed: terminal

mod machine;

pub use machine::{SessionState, StateMachine};
