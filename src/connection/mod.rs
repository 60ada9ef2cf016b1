//! Duplex connection management
//!
//! Maintains a single WebSocket session with automatic reconnection and
//! dispatches lifecycle and message events to registered handlers.

mod events;
mod manager;

pub use events::*;
pub use manager::*;
