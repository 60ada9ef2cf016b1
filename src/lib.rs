//! syncdeck - realtime state mirror and publish-worker supervisor
//!
//! Two cooperating halves:
//! - [`sync`]: a WebSocket client that keeps a local, versioned copy of
//!   server-authoritative state current through snapshots and ordered patches,
//!   reconnecting with exponential backoff ([`connection`]).
//! - [`supervisor`]: drives an isolated publish worker over a correlated
//!   request/response protocol, in-process or over a child's stdio.

pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod supervisor;
pub mod sync;
pub mod version;

pub use error::{Error, Result};
