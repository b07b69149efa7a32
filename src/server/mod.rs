//! Event loop, handler dispatch and idle-connection reclamation.

pub mod clock;
pub mod dispatch;
pub mod event_loop;
pub mod listener;
pub mod monitor;

pub use listener::{Server, ServerHandle};
pub use monitor::{ConnectionId, IdleTimeoutMonitor};
