//! Versioned state mirror
//!
//! Holds the client-side copy of the server document. Only two operations
//! mutate it: snapshot replacement and in-order patch application. Every
//! outcome, including discarded patches, is published as a [`MirrorEvent`].

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::patch::{apply_ops, PatchOp};

/// Why a patch was not applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscardReason {
    /// No snapshot has been received yet
    NoSnapshot,
    /// `fromVersion` is ahead of the mirror: intermediate versions are missing
    VersionGap,
    /// `fromVersion` is behind the mirror: duplicate or replayed patch
    Stale,
    /// `toVersion` does not advance past `fromVersion`
    InvalidRange,
    /// An edit addressed a location that does not exist
    Unreachable(String),
}

impl std::fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscardReason::NoSnapshot => f.write_str("no snapshot received yet"),
            DiscardReason::VersionGap => f.write_str("version gap"),
            DiscardReason::Stale => f.write_str("stale or duplicate patch"),
            DiscardReason::InvalidRange => f.write_str("toVersion does not advance"),
            DiscardReason::Unreachable(msg) => write!(f, "unreachable edit: {}", msg),
        }
    }
}

/// Notifications for downstream observers
#[derive(Debug, Clone, PartialEq)]
pub enum MirrorEvent {
    /// Document replaced wholesale
    Replaced { version: u64, data: Value },

    /// Edits applied in order
    Patched {
        from_version: u64,
        to_version: u64,
        ops: Vec<PatchOp>,
    },

    /// Patch dropped; document and version unchanged
    PatchDiscarded {
        from_version: u64,
        to_version: u64,
        current_version: u64,
        reason: DiscardReason,
    },
}

/// Result of [`StateMirror::apply_patch`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    Applied { version: u64 },
    Discarded(DiscardReason),
}

impl PatchOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, PatchOutcome::Applied { .. })
    }
}

/// Single-writer versioned document
pub struct StateMirror {
    document: Option<Value>,
    version: u64,
    server_config: Option<Value>,
    events_tx: broadcast::Sender<MirrorEvent>,
}

impl StateMirror {
    /// Create an empty mirror; `capacity` bounds the event backlog per observer
    pub fn new(capacity: usize) -> Self {
        let (events_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            document: None,
            version: 0,
            server_config: None,
            events_tx,
        }
    }

    /// Observe replace / patch / discard notifications
    pub fn subscribe(&self) -> broadcast::Receiver<MirrorEvent> {
        self.events_tx.subscribe()
    }

    /// The document, once at least one snapshot has been received
    pub fn document(&self) -> Option<&Value> {
        self.document.as_ref()
    }

    /// Current version (0 before the first snapshot)
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether a snapshot has been received
    pub fn is_synced(&self) -> bool {
        self.document.is_some()
    }

    /// Server settings carried by the latest snapshot, if any
    pub fn server_config(&self) -> Option<&Value> {
        self.server_config.as_ref()
    }

    /// Unconditionally replace the document
    pub fn replace_snapshot(&mut self, version: u64, data: Value) {
        self.replace_snapshot_with_config(version, data, None);
    }

    /// Replace the document and remember the snapshot's server settings
    pub fn replace_snapshot_with_config(&mut self, version: u64, data: Value, server_config: Option<Value>) {
        debug!(version, previous = self.version, "Replacing mirror snapshot");

        self.document = Some(data.clone());
        self.version = version;
        if server_config.is_some() {
            self.server_config = server_config;
        }

        self.emit(MirrorEvent::Replaced { version, data });
    }

    /// Apply a patch if it starts exactly at the current version
    pub fn apply_patch(&mut self, from_version: u64, to_version: u64, ops: Vec<PatchOp>) -> PatchOutcome {
        let Some(current) = self.document.as_ref() else {
            return self.discard(from_version, to_version, DiscardReason::NoSnapshot);
        };

        if from_version != self.version {
            let reason = if from_version > self.version {
                DiscardReason::VersionGap
            } else {
                DiscardReason::Stale
            };
            return self.discard(from_version, to_version, reason);
        }

        if to_version <= from_version {
            return self.discard(from_version, to_version, DiscardReason::InvalidRange);
        }

        match apply_ops(current, &ops) {
            Ok(next) => {
                self.document = Some(next);
                self.version = to_version;
                debug!(from_version, to_version, edits = ops.len(), "Patch applied");
                self.emit(MirrorEvent::Patched {
                    from_version,
                    to_version,
                    ops,
                });
                PatchOutcome::Applied { version: to_version }
            }
            Err(e) => self.discard(from_version, to_version, DiscardReason::Unreachable(e.to_string())),
        }
    }

    fn discard(&mut self, from_version: u64, to_version: u64, reason: DiscardReason) -> PatchOutcome {
        warn!(
            from_version,
            to_version,
            current_version = self.version,
            reason = %reason,
            "Discarding patch"
        );

        self.emit(MirrorEvent::PatchDiscarded {
            from_version,
            to_version,
            current_version: self.version,
            reason: reason.clone(),
        });

        PatchOutcome::Discarded(reason)
    }

    fn emit(&self, event: MirrorEvent) {
        // No observers is fine
        let _ = self.events_tx.send(event);
    }
}

impl Default for StateMirror {
    fn default() -> Self {
        Self::new(256)
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
