//! Reconnecting WebSocket connection manager
//!
//! Owns one duplex connection at a time:
//! - Automatic reconnection with capped exponential backoff
//! - Status telemetry on every state transition
//! - Decoded inbound messages dispatched to registered handlers
//! - Intentional stop that also cancels a pending retry timer
//!
//! All handler invocations happen on the connection task, one at a time and in
//! arrival order.

use std::sync::Arc;
use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message as WsMessage},
};
use tracing::{debug, error, info, warn};
use url::Url;

use super::events::{
    ConnectionEvent, ConnectionState, EventKind, HandlerRegistry, StatusUpdate, Subscription,
};
use crate::error::{Error, Result};
use crate::protocol::{ClientMessage, ServerMessage};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Configuration for the connection manager
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Time allowed for the TCP + WebSocket handshake
    pub connect_timeout: Duration,

    /// Maximum consecutive failed attempts (0 = infinite)
    pub max_reconnect_attempts: u32,

    /// Delay before the first retry
    pub initial_reconnect_delay: Duration,

    /// Upper bound on any retry delay
    pub max_reconnect_delay: Duration,

    /// Growth factor between consecutive delays
    pub multiplier: f64,

    /// Outbound frames buffered while the socket is busy
    pub message_queue_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 0, // Infinite
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            multiplier: 2.0,
            message_queue_size: 100,
        }
    }
}

impl ConnectionConfig {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_reconnect_delay,
            current_interval: self.initial_reconnect_delay,
            max_interval: self.max_reconnect_delay,
            multiplier: self.multiplier,
            randomization_factor: 0.0,
            max_elapsed_time: None, // Retry forever
            ..Default::default()
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Shared State
// ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct SharedState {
    /// Current lifecycle state
    state: ConnectionState,

    /// Consecutive failed attempts since the last open
    attempts: u32,

    /// Delay of the pending retry, if one is scheduled
    next_delay: Option<Duration>,

    /// Writer for the current socket (only while open)
    outbound: Option<mpsc::Sender<String>>,

    /// Bumped on every `connect`; a loop whose generation is stale no longer
    /// owns this state
    generation: u64,
}

/// Handle to the running connection loop
struct LoopControl {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

// ─────────────────────────────────────────────────────────────────
// Connection Manager
// ─────────────────────────────────────────────────────────────────

/// Reconnecting duplex connection with a handler registry
pub struct ConnectionManager {
    config: ConnectionConfig,
    shared: Arc<RwLock<SharedState>>,
    registry: Arc<HandlerRegistry>,
    control: Mutex<Option<LoopControl>>,
}

impl ConnectionManager {
    /// Create an idle manager
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            shared: Arc::new(RwLock::new(SharedState::default())),
            registry: HandlerRegistry::new(),
            control: Mutex::new(None),
        }
    }

    /// Start connecting to `url`
    ///
    /// No-op while a session is already connecting, open, or reconnecting.
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self, url: &str) -> Result<()> {
        let url = Url::parse(url).map_err(|e| Error::connection_failed(url, format!("invalid URL: {}", e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::connection_failed(
                url.as_str(),
                format!("unsupported scheme '{}'", url.scheme()),
            ));
        }

        let mut control = self.control.lock();

        let generation = {
            let mut s = self.shared.write();
            if s.state.is_live() {
                debug!(state = %s.state, "Connect ignored; session already active");
                return Ok(());
            }
            s.generation += 1;
            s.state = ConnectionState::Connecting;
            s.attempts = 0;
            s.next_delay = None;
            s.outbound = None;
            s.generation
        };

        // A previous loop may still be winding down after stop(); it no
        // longer owns the shared state. The new loop waits for it to exit so
        // handler delivery never overlaps.
        let previous = control.take().map(|previous| {
            let _ = previous.stop_tx.send(true);
            previous.task
        });

        let (stop_tx, stop_rx) = watch::channel(false);
        let ctx = LoopContext {
            url,
            config: self.config.clone(),
            shared: self.shared.clone(),
            registry: self.registry.clone(),
            generation,
        };
        let task = tokio::spawn(run_connection_loop(ctx, stop_rx, previous));

        *control = Some(LoopControl { stop_tx, task });
        Ok(())
    }

    /// Send a client message; returns `false` (and logs a warning) unless open
    pub fn send(&self, message: &ClientMessage) -> bool {
        self.sender().send(message)
    }

    /// Cheap handle for sending from inside handlers
    pub fn sender(&self) -> ConnectionSender {
        ConnectionSender {
            shared: self.shared.clone(),
        }
    }

    /// Register a handler for one event kind
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.registry.register(kind, Arc::new(handler))
    }

    /// Number of handlers currently registered for `kind`
    pub fn registered(&self, kind: EventKind) -> usize {
        self.registry.count(kind)
    }

    /// Intentionally close; no reconnection follows
    ///
    /// A pending retry timer is cancelled. Safe to call repeatedly.
    pub fn stop(&self) {
        let control = self.control.lock();
        if let Some(ref ctl) = *control {
            let _ = ctl.stop_tx.send(true);
        }

        let mut s = self.shared.write();
        if s.state.is_live() {
            info!(state = %s.state, "Stopping connection");
            s.state = ConnectionState::Closed;
        }
        s.next_delay = None;
        s.outbound = None;
    }

    /// Stop and wait for the connection task to finish
    pub async fn shutdown(&self) {
        self.stop();
        let control = self.control.lock().take();
        if let Some(ctl) = control {
            if let Err(e) = ctl.task.await {
                warn!(error = %e, "Connection task ended abnormally");
            }
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.shared.read().state
    }

    /// Consecutive failed attempts since the last successful open
    pub fn attempts(&self) -> u32 {
        self.shared.read().attempts
    }

    /// Delay of the pending retry, while reconnecting
    pub fn next_delay(&self) -> Option<Duration> {
        self.shared.read().next_delay
    }

    /// Whether messages can be sent right now
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(ctl) = self.control.get_mut().take() {
            let _ = ctl.stop_tx.send(true);
        }
    }
}

/// Send-only view of a connection
#[derive(Clone)]
pub struct ConnectionSender {
    shared: Arc<RwLock<SharedState>>,
}

impl ConnectionSender {
    /// Queue a message on the open socket; `false` if not open or the queue is full
    pub fn send(&self, message: &ClientMessage) -> bool {
        let s = self.shared.read();
        let Some(ref outbound) = s.outbound else {
            warn!(
                message_type = message.type_name(),
                state = %s.state,
                "Dropping outbound message; connection not open"
            );
            return false;
        };

        let text = match message.to_json() {
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, message_type = message.type_name(), "Failed to encode message");
                return false;
            }
        };

        match outbound.try_send(text) {
            Ok(()) => {
                debug!(message_type = message.type_name(), "Queued outbound message");
                true
            }
            Err(e) => {
                warn!(error = %e, message_type = message.type_name(), "Outbound queue rejected message");
                false
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Connection Loop
// ─────────────────────────────────────────────────────────────────

struct LoopContext {
    url: Url,
    config: ConnectionConfig,
    shared: Arc<RwLock<SharedState>>,
    registry: Arc<HandlerRegistry>,
    generation: u64,
}

impl LoopContext {
    /// Mutate shared state if this loop still owns it
    fn update(&self, f: impl FnOnce(&mut SharedState)) -> bool {
        let mut s = self.shared.write();
        if s.generation != self.generation {
            return false;
        }
        f(&mut s);
        true
    }

    fn transition(&self, state: ConnectionState, attempts: u32, delay: Option<Duration>) {
        let owned = self.update(|s| {
            s.state = state;
            s.attempts = attempts;
            s.next_delay = delay;
            if state != ConnectionState::Open {
                s.outbound = None;
            }
        });

        if owned {
            self.emit(ConnectionEvent::Status(StatusUpdate {
                state,
                attempts,
                delay_ms: delay.map(|d| d.as_millis() as u64),
            }));
        }
    }

    /// Deliver to handlers, unless a newer `connect` has superseded this loop
    fn emit(&self, event: ConnectionEvent) {
        if self.shared.read().generation != self.generation {
            debug!(kind = ?event.kind(), "Superseded loop dropped event");
            return;
        }
        self.registry.dispatch(&event);
    }
}

/// How an open connection ended
enum Ended {
    Stopped,
    Closed(String),
    Failed(String),
}

/// Main loop with reconnection logic
async fn run_connection_loop(
    ctx: LoopContext,
    mut stop_rx: watch::Receiver<bool>,
    previous: Option<JoinHandle<()>>,
) {
    if let Some(previous) = previous {
        if let Err(e) = previous.await {
            warn!(error = %e, "Previous connection task ended abnormally");
        }
    }

    let mut backoff = ctx.config.backoff();
    let mut attempts: u32 = 0;

    loop {
        if *stop_rx.borrow() {
            break;
        }

        ctx.transition(ConnectionState::Connecting, attempts, None);
        info!(url = %ctx.url, attempt = attempts + 1, "Connecting");

        let connect = tokio::time::timeout(ctx.config.connect_timeout, connect_async(ctx.url.clone()));
        let outcome = tokio::select! {
            _ = stop_rx.changed() => break,
            outcome = connect => outcome,
        };

        match outcome {
            Ok(Ok((ws_stream, _response))) => {
                info!(url = %ctx.url, "WebSocket connection established");

                // Reset backoff on successful connection
                backoff.reset();
                attempts = 0;

                let (out_tx, out_rx) = mpsc::channel(ctx.config.message_queue_size.max(1));
                ctx.update(|s| s.outbound = Some(out_tx));
                ctx.transition(ConnectionState::Open, 0, None);
                ctx.emit(ConnectionEvent::Open);

                let (write, read) = ws_stream.split();
                let ended = handle_connection(&ctx, write, read, out_rx, &mut stop_rx).await;

                match ended {
                    Ended::Stopped => {
                        ctx.emit(ConnectionEvent::Close {
                            reason: "stopped by client".to_string(),
                        });
                        break;
                    }
                    Ended::Closed(reason) => {
                        info!(reason = %reason, "Connection closed");
                        ctx.update(|s| s.outbound = None);
                        ctx.emit(ConnectionEvent::Close { reason });
                    }
                    Ended::Failed(message) => {
                        warn!(error = %message, "Connection error");
                        ctx.update(|s| s.outbound = None);
                        ctx.emit(ConnectionEvent::Error {
                            message: message.clone(),
                        });
                        ctx.emit(ConnectionEvent::Close { reason: message });
                    }
                }
            }
            Ok(Err(e)) => {
                warn!(url = %ctx.url, error = %e, "Failed to connect");
                ctx.emit(ConnectionEvent::Error {
                    message: Error::connection_failed(ctx.url.as_str(), e.to_string()).to_string(),
                });
            }
            Err(_) => {
                warn!(
                    url = %ctx.url,
                    timeout_ms = ctx.config.connect_timeout.as_millis() as u64,
                    "Connection attempt timed out"
                );
                let err = Error::ConnectionTimeout {
                    url: ctx.url.to_string(),
                    timeout_ms: ctx.config.connect_timeout.as_millis() as u64,
                };
                ctx.emit(ConnectionEvent::Error {
                    message: err.to_string(),
                });
            }
        }

        if *stop_rx.borrow() {
            break;
        }

        attempts = attempts.saturating_add(1);

        // Check max reconnect attempts
        let max = ctx.config.max_reconnect_attempts;
        if max > 0 && attempts >= max {
            error!(attempts, max, "Max reconnection attempts reached");
            ctx.transition(ConnectionState::Closed, attempts, None);
            return;
        }

        let delay = backoff.next_backoff().unwrap_or(ctx.config.max_reconnect_delay);
        ctx.transition(ConnectionState::Reconnecting, attempts, Some(delay));

        info!(
            delay_ms = delay.as_millis() as u64,
            attempt = attempts,
            "Waiting before reconnection"
        );

        // Wait before reconnecting; stop cancels the timer
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop_rx.changed() => break,
        }
    }

    ctx.transition(ConnectionState::Closed, attempts, None);
    info!("Connection loop terminated");
}

/// Pump one open socket until it ends
async fn handle_connection<S, R>(
    ctx: &LoopContext,
    mut write: S,
    mut read: R,
    mut out_rx: mpsc::Receiver<String>,
    stop_rx: &mut watch::Receiver<bool>,
) -> Ended
where
    S: SinkExt<WsMessage, Error = WsError> + Unpin,
    R: StreamExt<Item = std::result::Result<WsMessage, WsError>> + Unpin,
{
    loop {
        tokio::select! {
            biased;

            _ = stop_rx.changed() => return close_for_stop(&mut write).await,

            Some(text) = out_rx.recv() => {
                if let Err(e) = write.send(WsMessage::Text(text)).await {
                    return Ended::Failed(e.to_string());
                }
            }

            msg = read.next() => {
                // A frame that raced an intentional stop is not delivered
                if *stop_rx.borrow() {
                    return close_for_stop(&mut write).await;
                }
                match msg {
                    Some(Ok(WsMessage::Text(text))) => dispatch_inbound(ctx, ServerMessage::decode(&text)),
                    Some(Ok(WsMessage::Binary(data))) => dispatch_inbound(ctx, ServerMessage::decode_bytes(&data)),
                    Some(Ok(WsMessage::Ping(data))) => {
                        if let Err(e) = write.send(WsMessage::Pong(data)).await {
                            return Ended::Failed(e.to_string());
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {}
                    Some(Ok(WsMessage::Close(frame))) => {
                        let reason = frame
                            .map(|f| format!("{} ({})", f.reason, u16::from(f.code)))
                            .unwrap_or_else(|| "closed by server".to_string());
                        return Ended::Closed(reason);
                    }
                    Some(Ok(WsMessage::Frame(_))) => {}
                    Some(Err(e)) => return Ended::Failed(e.to_string()),
                    None => return Ended::Closed("stream ended".to_string()),
                }
            }
        }
    }
}

async fn close_for_stop<S>(write: &mut S) -> Ended
where
    S: SinkExt<WsMessage, Error = WsError> + Unpin,
{
    if let Err(e) = write.send(WsMessage::Close(None)).await {
        debug!(error = %e, "Close frame not delivered");
    }
    Ended::Stopped
}

fn dispatch_inbound(ctx: &LoopContext, decoded: Result<ServerMessage>) {
    match decoded {
        Ok(message) => {
            debug!(message_type = message.type_name(), "Received message");
            ctx.emit(ConnectionEvent::Message(message));
        }
        Err(e) => warn!(error = %e, "Dropping unrecognized inbound message"),
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
