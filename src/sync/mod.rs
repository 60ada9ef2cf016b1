//! Client-side state synchronization
//!
//! A [`SyncSession`] keeps a [`StateMirror`] in step with the server through
//! snapshots and version-bounded patches, relays log batches, and projects
//! connection status for display.

mod mirror;
mod patch;
mod session;
mod status;

pub use mirror::*;
pub use patch::*;
pub use session::*;
pub use status::*;
