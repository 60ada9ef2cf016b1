//! Common test utilities and fixtures
//!
//! A scripted WebSocket server speaking the sync protocol, plus polling helpers.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage, WebSocketStream};

/// Frames pushed to every live connection
#[derive(Debug, Clone)]
enum ServerFrame {
    Text(String),
    Drop,
}

/// Mock sync server for testing
///
/// Records every client message, answers `subscribe` with the current
/// snapshot, and lets tests push arbitrary frames or drop connections.
pub struct MockSyncServer {
    addr: SocketAddr,
    shutdown_tx: Option<mpsc::Sender<()>>,
    received: Arc<RwLock<Vec<Value>>>,
    connections: Arc<AtomicUsize>,
    snapshot: Arc<RwLock<Value>>,
    frames: broadcast::Sender<ServerFrame>,
}

impl MockSyncServer {
    /// Start a server whose snapshot is `{}` at version 1
    pub async fn start() -> Self {
        Self::start_with_snapshot(1, json!({})).await
    }

    pub async fn start_with_snapshot(version: u64, data: Value) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let (frames, _) = broadcast::channel(64);

        let server = Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            received: Arc::new(RwLock::new(Vec::new())),
            connections: Arc::new(AtomicUsize::new(0)),
            snapshot: Arc::new(RwLock::new(snapshot_message(version, data))),
            frames,
        };

        let received = server.received.clone();
        let connections = server.connections.clone();
        let snapshot = server.snapshot.clone();
        let frames = server.frames.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        if let Ok((stream, _)) = accept_result {
                            let received = received.clone();
                            let snapshot = snapshot.clone();
                            let frames_rx = frames.subscribe();
                            let connections = connections.clone();
                            tokio::spawn(async move {
                                if let Ok(ws_stream) = accept_async(stream).await {
                                    connections.fetch_add(1, Ordering::SeqCst);
                                    let _ = handle_connection(ws_stream, received, snapshot, frames_rx).await;
                                }
                            });
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        server
    }

    /// Get the WebSocket URL for this server
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Every client message received so far, in arrival order
    pub fn received(&self) -> Vec<Value> {
        self.received.read().clone()
    }

    /// `type` of every client message received so far
    pub fn received_types(&self) -> Vec<String> {
        self.received
            .read()
            .iter()
            .map(|m| m.get("type").and_then(Value::as_str).unwrap_or_default().to_string())
            .collect()
    }

    /// WebSocket handshakes completed so far
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Snapshot sent in answer to future `subscribe` requests
    pub fn set_snapshot(&self, version: u64, data: Value) {
        *self.snapshot.write() = snapshot_message(version, data);
    }

    /// Push a message to every live connection
    pub fn send(&self, message: Value) {
        let _ = self.frames.send(ServerFrame::Text(message.to_string()));
    }

    /// Push a raw text frame to every live connection
    pub fn send_raw(&self, text: &str) {
        let _ = self.frames.send(ServerFrame::Text(text.to_string()));
    }

    /// Close every live connection from the server side
    pub fn drop_connections(&self) {
        let _ = self.frames.send(ServerFrame::Drop);
    }
}

impl Drop for MockSyncServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.try_send(());
        }
        self.drop_connections();
    }
}

async fn handle_connection(
    ws_stream: WebSocketStream<TcpStream>,
    received: Arc<RwLock<Vec<Value>>>,
    snapshot: Arc<RwLock<Value>>,
    mut frames: broadcast::Receiver<ServerFrame>,
) -> anyhow::Result<()> {
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    let Ok(parsed) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    let wants_snapshot = parsed["type"] == "subscribe"
                        && parsed["payload"]["includeSnapshot"] == true;
                    received.write().push(parsed);

                    if wants_snapshot {
                        let reply = snapshot.read().to_string();
                        write.send(WsMessage::Text(reply)).await?;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                Some(Err(e)) => return Err(anyhow::anyhow!("client stream failed: {}", e)),
                Some(Ok(_)) => {}
            },
            frame = frames.recv() => match frame {
                Ok(ServerFrame::Text(text)) => write.send(WsMessage::Text(text)).await?,
                Ok(ServerFrame::Drop) | Err(broadcast::error::RecvError::Closed) => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Ok(());
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
            },
        }
    }
}

/// `state.snapshot` message body
pub fn snapshot_message(version: u64, data: Value) -> Value {
    json!({
        "type": "state.snapshot",
        "stateVersion": version,
        "data": data,
    })
}

/// `state.patch` message body
pub fn patch_message(from: u64, to: u64, ops: Value) -> Value {
    json!({
        "type": "state.patch",
        "fromVersion": from,
        "toVersion": to,
        "patch": ops,
    })
}

/// A `ws://` URL nothing is listening on
pub async fn unused_ws_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{}/ws", addr)
}

/// Poll `condition` every 10ms until it holds or `timeout` passes
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Fail the test if `fut` does not finish within `timeout`
pub async fn within<T>(timeout: Duration, fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(timeout, fut)
        .await
        .expect("operation did not finish in time")
}
