//! Worker supervision
//!
//! The supervisor side ([`WorkerSupervisor`]) sends correlated requests to an
//! isolated worker; the worker side ([`WorkerRuntime`]) executes them through a
//! [`PublishRunner`] with crash containment. The two meet over a
//! [`WorkerTransport`]: an in-process task or a child process on stdio.

mod client;
mod mock;
mod runtime;
mod state;
mod transport;

pub use client::*;
pub use mock::*;
pub use runtime::*;
pub use state::*;
pub use transport::{read_lines, write_lines, WorkerCommand, WorkerTransport};
