//! IPC module for local session control

mod control;
mod protocol;
mod server;

pub use control::{InputFactory, SessionControl};
pub use protocol::{Notification, Request, Response, ServiceStatus};
pub use server::Server;
