//! Connection status projection for display

use std::fmt;

use serde::Serialize;
use tokio::sync::watch;

use crate::connection::{ConnectionState, StatusUpdate};

/// What a user-facing indicator shows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayKind {
    Connected,
    Reconnecting,
    Disconnected,
}

impl fmt::Display for DisplayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DisplayKind::Connected => "connected",
            DisplayKind::Reconnecting => "reconnecting",
            DisplayKind::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Latest display status with backoff metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayStatus {
    pub kind: DisplayKind,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
}

impl DisplayStatus {
    /// Map a connection status onto its display form
    pub fn project(update: &StatusUpdate) -> Self {
        let kind = match update.state {
            ConnectionState::Open => DisplayKind::Connected,
            ConnectionState::Reconnecting => DisplayKind::Reconnecting,
            ConnectionState::Connecting if update.attempts > 0 => DisplayKind::Reconnecting,
            ConnectionState::Connecting | ConnectionState::Idle | ConnectionState::Closed => {
                DisplayKind::Disconnected
            }
        };

        Self {
            kind,
            attempts: update.attempts,
            delay_ms: update.delay_ms,
        }
    }
}

impl Default for DisplayStatus {
    fn default() -> Self {
        Self {
            kind: DisplayKind::Disconnected,
            attempts: 0,
            delay_ms: None,
        }
    }
}

impl fmt::Display for DisplayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind, self.delay_ms) {
            (DisplayKind::Reconnecting, Some(delay)) => {
                write!(f, "reconnecting (attempt {}, retry in {}ms)", self.attempts, delay)
            }
            (DisplayKind::Reconnecting, None) => write!(f, "reconnecting (attempt {})", self.attempts),
            (kind, _) => write!(f, "{}", kind),
        }
    }
}

/// Holds only the latest [`DisplayStatus`]
pub struct StatusReporter {
    tx: watch::Sender<DisplayStatus>,
}

impl StatusReporter {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(DisplayStatus::default());
        Self { tx }
    }

    /// Project and publish a connection status
    pub fn observe(&self, update: &StatusUpdate) {
        let next = DisplayStatus::project(update);
        self.tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    /// Latest status
    pub fn latest(&self) -> DisplayStatus {
        *self.tx.borrow()
    }

    /// Watch for changes
    pub fn subscribe(&self) -> watch::Receiver<DisplayStatus> {
        self.tx.subscribe()
    }
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new()
    }
}
