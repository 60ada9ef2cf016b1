//! Synchronization session
//!
//! Wires a [`ConnectionManager`] to a [`StateMirror`], a log relay and a
//! [`StatusReporter`]. Every open (first connect and each reconnect) performs
//! the `hello` + `subscribe` handshake, so a fresh snapshot always follows a
//! reconnect. The session is an explicit object: construct one per server,
//! tear it down with [`SyncSession::dispose`] / [`SyncSession::shutdown`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use super::mirror::{DiscardReason, MirrorEvent, PatchOutcome, StateMirror};
use super::status::{DisplayStatus, StatusReporter};
use crate::connection::{
    ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionSender, EventKind, Subscription,
};
use crate::error::Result;
use crate::protocol::{ClientMessage, LogEntry, ServerMessage};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Session behaviour
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Capabilities announced in `hello`
    pub capabilities: Vec<String>,

    /// Re-request a snapshot when a patch reveals the mirror is behind
    pub resync_on_gap: bool,

    /// Broadcast backlog per observer
    pub event_capacity: usize,

    /// Log entries retained locally (oldest dropped first)
    pub log_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            capabilities: vec!["state.patch".to_string(), "logs".to_string()],
            resync_on_gap: true,
            event_capacity: 256,
            log_capacity: 1000,
        }
    }
}

/// Log updates forwarded to observers
#[derive(Debug, Clone, PartialEq)]
pub enum LogEvent {
    /// Whole history replaced
    History(Vec<LogEntry>),
    /// Entries appended
    Append(Vec<LogEntry>),
}

// ─────────────────────────────────────────────────────────────────
// Session Core
// ─────────────────────────────────────────────────────────────────

/// State shared with the connection handlers
struct SessionCore {
    config: SessionConfig,
    mirror: RwLock<StateMirror>,
    status: StatusReporter,
    logs: Mutex<VecDeque<LogEntry>>,
    logs_tx: broadcast::Sender<LogEvent>,

    /// A subscribe requesting a snapshot is outstanding
    resync_pending: AtomicBool,
}

impl SessionCore {
    fn new(config: SessionConfig) -> Self {
        let (logs_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            mirror: RwLock::new(StateMirror::new(config.event_capacity)),
            status: StatusReporter::new(),
            logs: Mutex::new(VecDeque::new()),
            logs_tx,
            resync_pending: AtomicBool::new(false),
            config,
        }
    }

    fn handshake(&self, sender: &ConnectionSender) {
        let hello = ClientMessage::hello(self.config.capabilities.iter().cloned());
        let subscribed = sender.send(&hello) && sender.send(&ClientMessage::subscribe_with_snapshot());
        self.resync_pending.store(subscribed, Ordering::SeqCst);

        if subscribed {
            info!(capabilities = ?self.config.capabilities, "Handshake sent");
        } else {
            warn!("Handshake could not be queued");
        }
    }

    fn handle_message(&self, message: &ServerMessage, sender: &ConnectionSender) {
        match message {
            ServerMessage::StateSnapshot(snapshot) => {
                self.mirror.write().replace_snapshot_with_config(
                    snapshot.state_version,
                    snapshot.data.clone(),
                    snapshot.server_config.clone(),
                );
                self.resync_pending.store(false, Ordering::SeqCst);
                info!(version = snapshot.state_version, "Snapshot applied");
            }
            ServerMessage::StatePatch(patch) => {
                let outcome =
                    self.mirror
                        .write()
                        .apply_patch(patch.from_version, patch.to_version, patch.patch.clone());

                if let PatchOutcome::Discarded(reason) = outcome {
                    self.maybe_resync(&reason, sender);
                }
            }
            ServerMessage::LogsHistory(batch) => {
                {
                    let mut logs = self.logs.lock();
                    logs.clear();
                    logs.extend(batch.entries.iter().cloned());
                    self.trim_logs(&mut logs);
                }
                debug!(entries = batch.entries.len(), "Log history replaced");
                let _ = self.logs_tx.send(LogEvent::History(batch.entries.clone()));
            }
            ServerMessage::LogsAppend(batch) => {
                if batch.entries.is_empty() {
                    return;
                }
                {
                    let mut logs = self.logs.lock();
                    logs.extend(batch.entries.iter().cloned());
                    self.trim_logs(&mut logs);
                }
                let _ = self.logs_tx.send(LogEvent::Append(batch.entries.clone()));
            }
        }
    }

    /// Request a fresh snapshot after a desync, at most once until it arrives
    fn maybe_resync(&self, reason: &DiscardReason, sender: &ConnectionSender) {
        if !self.config.resync_on_gap {
            return;
        }
        if !matches!(reason, DiscardReason::VersionGap | DiscardReason::Unreachable(_)) {
            return;
        }
        if self.resync_pending.swap(true, Ordering::SeqCst) {
            debug!(reason = %reason, "Resync already pending");
            return;
        }

        info!(reason = %reason, "Mirror out of sync; requesting snapshot");
        if !sender.send(&ClientMessage::subscribe_with_snapshot()) {
            self.resync_pending.store(false, Ordering::SeqCst);
        }
    }

    fn trim_logs(&self, logs: &mut VecDeque<LogEntry>) {
        while logs.len() > self.config.log_capacity {
            logs.pop_front();
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Sync Session
// ─────────────────────────────────────────────────────────────────

/// One synchronized view of one server
pub struct SyncSession {
    connection: ConnectionManager,
    core: Arc<SessionCore>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl SyncSession {
    /// Create a session and register its handlers; nothing connects until `start`
    pub fn new(connection_config: ConnectionConfig, config: SessionConfig) -> Self {
        let connection = ConnectionManager::new(connection_config);
        let core = Arc::new(SessionCore::new(config));
        let mut subscriptions = Vec::with_capacity(3);

        let sender = connection.sender();
        let handshake_core = core.clone();
        subscriptions.push(connection.on(EventKind::Open, move |_| {
            handshake_core.handshake(&sender);
        }));

        let sender = connection.sender();
        let message_core = core.clone();
        subscriptions.push(connection.on(EventKind::Message, move |event| {
            if let ConnectionEvent::Message(message) = event {
                message_core.handle_message(message, &sender);
            }
        }));

        let status_core = core.clone();
        subscriptions.push(connection.on(EventKind::Status, move |event| {
            if let ConnectionEvent::Status(update) = event {
                status_core.status.observe(update);
            }
        }));

        Self {
            connection,
            core,
            subscriptions: Mutex::new(subscriptions),
        }
    }

    /// Connect (no-op if already live)
    pub fn start(&self, url: &str) -> Result<()> {
        self.connection.connect(url)
    }

    /// Intentionally disconnect
    pub fn stop(&self) {
        self.connection.stop();
    }

    /// Stop and wait for the connection task
    pub async fn shutdown(&self) {
        self.connection.shutdown().await;
    }

    /// Remove this session's handlers; idempotent, never fails
    pub fn dispose(&self) {
        for subscription in self.subscriptions.lock().drain(..) {
            subscription.dispose();
        }
    }

    /// Underlying connection, for extra handlers
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Copy of the current document, once a snapshot has arrived
    pub fn document(&self) -> Option<Value> {
        self.core.mirror.read().document().cloned()
    }

    /// Current mirror version
    pub fn version(&self) -> u64 {
        self.core.mirror.read().version()
    }

    /// Server settings from the latest snapshot
    pub fn server_config(&self) -> Option<Value> {
        self.core.mirror.read().server_config().cloned()
    }

    /// Observe mirror changes
    pub fn subscribe_mirror(&self) -> broadcast::Receiver<MirrorEvent> {
        self.core.mirror.read().subscribe()
    }

    /// Observe log updates
    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogEvent> {
        self.core.logs_tx.subscribe()
    }

    /// Retained log entries, oldest first
    pub fn logs(&self) -> Vec<LogEntry> {
        self.core.logs.lock().iter().cloned().collect()
    }

    /// Latest display status
    pub fn status(&self) -> DisplayStatus {
        self.core.status.latest()
    }

    /// Watch display status changes
    pub fn watch_status(&self) -> watch::Receiver<DisplayStatus> {
        self.core.status.subscribe()
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.dispose();
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{LogBatch, StatePatch, StateSnapshot};
    use serde_json::json;

    fn idle_sender() -> ConnectionSender {
        ConnectionManager::new(ConnectionConfig::default()).sender()
    }

    fn snapshot(version: u64, data: Value) -> ServerMessage {
        ServerMessage::StateSnapshot(StateSnapshot {
            state_version: version,
            data,
            server_config: None,
        })
    }

    fn patch(from: u64, to: u64, ops: Value) -> ServerMessage {
        ServerMessage::StatePatch(StatePatch {
            from_version: from,
            to_version: to,
            patch: serde_json::from_value(ops).unwrap(),
        })
    }

    #[test]
    fn test_snapshot_then_patch() {
        let core = SessionCore::new(SessionConfig::default());
        let sender = idle_sender();

        core.handle_message(&snapshot(5, json!({"count": 1})), &sender);
        core.handle_message(
            &patch(5, 6, json!([{"op": "replace", "path": ["count"], "value": 2}])),
            &sender,
        );

        let mirror = core.mirror.read();
        assert_eq!(mirror.version(), 6);
        assert_eq!(mirror.document(), Some(&json!({"count": 2})));
    }

    #[test]
    fn test_gap_marks_resync_only_when_sent() {
        let core = SessionCore::new(SessionConfig::default());
        let sender = idle_sender();

        core.handle_message(&snapshot(1, json!({})), &sender);
        core.handle_message(&patch(3, 4, json!([])), &sender);

        // Not open, so the resync request could not be queued
        assert!(!core.resync_pending.load(Ordering::SeqCst));
        assert_eq!(core.mirror.read().version(), 1);
    }

    #[test]
    fn test_snapshot_clears_pending_resync() {
        let core = SessionCore::new(SessionConfig::default());
        core.resync_pending.store(true, Ordering::SeqCst);

        core.handle_message(&snapshot(9, json!({"a": 1})), &idle_sender());
        assert!(!core.resync_pending.load(Ordering::SeqCst));
    }

    #[test]
    fn test_log_history_replaces_and_append_extends() {
        let core = SessionCore::new(SessionConfig {
            log_capacity: 3,
            ..Default::default()
        });
        let sender = idle_sender();
        let mut rx = core.logs_tx.subscribe();

        core.handle_message(
            &ServerMessage::LogsHistory(LogBatch {
                entries: vec![json!("a"), json!("b")],
            }),
            &sender,
        );
        core.handle_message(&ServerMessage::LogsAppend(LogBatch { entries: vec![] }), &sender);
        core.handle_message(
            &ServerMessage::LogsAppend(LogBatch {
                entries: vec![json!("c"), json!("d")],
            }),
            &sender,
        );

        let logs: Vec<LogEntry> = core.logs.lock().iter().cloned().collect();
        assert_eq!(logs, vec![json!("b"), json!("c"), json!("d")]);

        assert_eq!(rx.try_recv().unwrap(), LogEvent::History(vec![json!("a"), json!("b")]));
        assert_eq!(rx.try_recv().unwrap(), LogEvent::Append(vec![json!("c"), json!("d")]));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let session = SyncSession::new(ConnectionConfig::default(), SessionConfig::default());
        assert_eq!(session.connection().registered(EventKind::Message), 1);

        session.dispose();
        session.dispose();
        assert_eq!(session.connection().registered(EventKind::Message), 0);
        assert!(session.document().is_none());
    }
}
