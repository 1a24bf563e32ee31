//! Holder for the one current session of a process
//!
//! The slot only swaps handles. Callers retire the session they replaced
//! after releasing whatever lock guards the slot, so a slow close never
//! stalls other users of it.

use std::sync::Arc;

use tracing::{debug, info};

use super::Session;

#[derive(Default)]
pub struct SessionSlot {
    current: Option<Arc<Session>>,
}

impl SessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `session`, handing back the one it replaces
    pub fn replace(&mut self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.current.replace(session)
    }

    pub fn current(&self) -> Option<Arc<Session>> {
        self.current.clone()
    }

    pub fn take(&mut self) -> Option<Arc<Session>> {
        self.current.take()
    }
}

/// Close a session that left its slot. Disposes it when this was the last
/// handle; otherwise the remaining holders see it Closed.
pub async fn retire(session: Arc<Session>) {
    info!(session_id = %session.id(), "retiring session");
    match Arc::try_unwrap(session) {
        Ok(session) => session.dispose().await,
        Err(shared) => {
            if let Err(e) = shared.close().await {
                debug!(session_id = %shared.id(), %e, "close while retiring");
            }
        }
    }
}
