//! Wire protocol definitions
//!
//! Two independent protocols live here:
//! - the realtime state protocol spoken with the server over WebSocket
//!   (`state.snapshot`, `state.patch`, `logs.*` inbound; `hello`, `subscribe` outbound)
//! - the worker RPC protocol spoken with the publish worker
//!   (correlated requests, `ready`/`result`/`log` messages)
//!
//! Both are JSON with a string discriminator and are decoded once, at the
//! transport boundary, into closed enums.

mod messages;
mod version;
mod worker;

pub use messages::*;
pub use version::*;
pub use worker::*;
