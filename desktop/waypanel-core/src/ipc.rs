//! Compositor IPC client: a line-delimited JSON protocol over a Unix
//! socket, with request/response correlation and automatic reconnection.
//!
//! Built against `tokio::net::UnixStream` and `serde_json` for framing,
//! with `tokio::sync` channels carrying responses and events back to
//! callers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::events::EventBus;

const INITIAL_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("not connected to compositor")]
    NotConnected,

    #[error("request timed out")]
    Timeout,

    #[error("compositor returned an error: {0}")]
    CompositorError(String),

    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type IpcResult<T> = Result<T, IpcError>;

/// A single outgoing request, envelope shape shared by every compositor
/// method call: a correlation token plus a method name and arguments.
#[derive(Debug, Serialize)]
struct Request {
    token: u64,
    method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Response {
    token: u64,
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

/// Picks the compositor socket from the environment, `WAYFIRE_SOCKET`
/// before `SWAYSOCK`, matching the precedence the original tooling used
/// when probing for a running compositor.
pub fn default_socket_path() -> Option<String> {
    std::env::var("WAYFIRE_SOCKET")
        .or_else(|_| std::env::var("SWAYSOCK"))
        .ok()
}

struct PendingRequest {
    responder: oneshot::Sender<IpcResult<Value>>,
}

/// Owns the socket connection and the in-flight request table. Cloned
/// handles share the same connection; reconnects are transparent to
/// callers already holding a handle.
pub struct IpcClient {
    socket_path: String,
    inner: Arc<Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>>,
    pending: Arc<Mutex<HashMap<u64, PendingRequest>>>,
    next_token: AtomicU64,
    events: Arc<EventBus>,
}

impl IpcClient {
    pub fn new(socket_path: impl Into<String>, events: Arc<EventBus>) -> Self {
        Self {
            socket_path: socket_path.into(),
            inner: Arc::new(Mutex::new(None)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_token: AtomicU64::new(1),
            events,
        }
    }

    /// Spawns the connection-management task: connects, reads responses
    /// into the pending-request table, and reconnects with doubling
    /// backoff (reset to `INITIAL_BACKOFF` after any successful connect)
    /// whenever the socket drops.
    pub fn spawn(self: &Arc<Self>) {
        let client = self.clone();
        tokio::spawn(async move {
            client.run().await;
        });
    }

    async fn run(self: Arc<Self>) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match UnixStream::connect(&self.socket_path).await {
                Ok(stream) => {
                    info!("connected to compositor socket at {}", self.socket_path);
                    backoff = INITIAL_BACKOFF;
                    self.events.publish("compositor-connected", Value::Null);
                    self.serve(stream).await;
                    self.events
                        .publish("compositor-disconnected", Value::Null);
                    *self.inner.lock().await = None;
                    self.fail_all_pending(IpcError::NotConnected).await;
                }
                Err(e) => {
                    warn!(
                        "failed to connect to compositor socket {}: {e}, retrying in {backoff:?}",
                        self.socket_path
                    );
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
        }
    }

    async fn fail_all_pending(&self, _err: IpcError) {
        let mut pending = self.pending.lock().await;
        for (_, req) in pending.drain() {
            let _ = req.responder.send(Err(IpcError::NotConnected));
        }
    }

    async fn serve(&self, stream: UnixStream) {
        let (read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        *self.inner.lock().await = Some(tx);

        let write_task = tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if write_half.write_all(&bytes).await.is_err() {
                    break;
                }
                if write_half.write_all(b"\n").await.is_err() {
                    break;
                }
            }
        });

        let mut lines = BufReader::new(read_half).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => self.handle_line(&line).await,
                Ok(None) => break,
                Err(e) => {
                    warn!("compositor socket read error: {e}");
                    break;
                }
            }
        }
        write_task.abort();
    }

    async fn handle_line(&self, line: &str) {
        let response: Response = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                warn!("malformed compositor response, dropping: {e}");
                return;
            }
        };
        let mut pending = self.pending.lock().await;
        if let Some(req) = pending.remove(&response.token) {
            let result = if response.ok {
                Ok(response.result)
            } else {
                Err(IpcError::CompositorError(
                    response.error.unwrap_or_else(|| "unknown error".to_string()),
                ))
            };
            let _ = req.responder.send(result);
        } else {
            debug!("response for unknown token {}", response.token);
        }
    }

    /// Sends `method` with `params` and awaits the matching response,
    /// timing out after `REQUEST_TIMEOUT`.
    pub async fn call(&self, method: &str, params: Option<Value>) -> IpcResult<Value> {
        let tx = {
            let guard = self.inner.lock().await;
            guard.clone().ok_or(IpcError::NotConnected)?
        };

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (responder, receiver) = oneshot::channel();
        self.pending
            .lock()
            .await
            .insert(token, PendingRequest { responder });

        let request = Request {
            token,
            method: method.to_string(),
            params,
        };
        let bytes = serde_json::to_vec(&request)?;
        if tx.send(bytes).is_err() {
            self.pending.lock().await.remove(&token);
            return Err(IpcError::NotConnected);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(IpcError::NotConnected),
            Err(_) => {
                self.pending.lock().await.remove(&token);
                Err(IpcError::Timeout)
            }
        }
    }

    pub async fn list_views(&self) -> IpcResult<Value> {
        self.call("list_views", None).await
    }

    pub async fn get_view(&self, view_id: u64) -> IpcResult<Value> {
        self.call("get_view", Some(serde_json::json!({ "id": view_id })))
            .await
    }

    pub async fn get_focused_view(&self) -> IpcResult<Value> {
        self.call("get_focused_view", None).await
    }

    pub async fn close_view(&self, view_id: u64) -> IpcResult<Value> {
        self.call("close_view", Some(serde_json::json!({ "id": view_id })))
            .await
    }

    pub async fn set_focus(&self, view_id: u64) -> IpcResult<Value> {
        self.call("set_focus", Some(serde_json::json!({ "id": view_id })))
            .await
    }

    pub async fn configure_view(&self, view_id: u64, geometry: Value) -> IpcResult<Value> {
        self.call(
            "configure_view",
            Some(serde_json::json!({ "id": view_id, "geometry": geometry })),
        )
        .await
    }

    pub async fn set_view_fullscreen(&self, view_id: u64, fullscreen: bool) -> IpcResult<Value> {
        self.call(
            "set_view_fullscreen",
            Some(serde_json::json!({ "id": view_id, "fullscreen": fullscreen })),
        )
        .await
    }

    pub async fn set_view_alpha(&self, view_id: u64, alpha: f64) -> IpcResult<Value> {
        self.call(
            "set_view_alpha",
            Some(serde_json::json!({ "id": view_id, "alpha": alpha })),
        )
        .await
    }

    pub async fn list_outputs(&self) -> IpcResult<Value> {
        self.call("list_outputs", None).await
    }

    pub async fn get_focused_output(&self) -> IpcResult<Value> {
        self.call("get_focused_output", None).await
    }

    pub async fn get_output_geometry(&self, output: &str) -> IpcResult<Value> {
        self.call("get_output_geometry", Some(serde_json::json!({ "output": output })))
            .await
    }

    pub async fn set_workspace(&self, x: i32, y: i32) -> IpcResult<Value> {
        self.call("set_workspace", Some(serde_json::json!({ "x": x, "y": y })))
            .await
    }

    pub async fn scale_toggle(&self) -> IpcResult<Value> {
        self.call("scale_toggle", None).await
    }

    pub async fn toggle_expo(&self) -> IpcResult<Value> {
        self.call("toggle_expo", None).await
    }

    pub async fn register_binding(&self, binding: &str, command: &str) -> IpcResult<Value> {
        self.call(
            "register_binding",
            Some(serde_json::json!({ "binding": binding, "command": command })),
        )
        .await
    }

    pub async fn get_option_value(&self, option: &str) -> IpcResult<Value> {
        self.call("get_option_value", Some(serde_json::json!({ "option": option })))
            .await
    }

    pub async fn set_option_values(&self, values: Value) -> IpcResult<Value> {
        self.call("set_option_values", Some(values)).await
    }

    pub async fn watch(&self, events: Vec<&str>) -> IpcResult<Value> {
        self.call("watch", Some(serde_json::json!({ "events": events })))
            .await
    }

    pub async fn register_command(&self, name: &str, command: &str) -> IpcResult<Value> {
        self.call(
            "register_command",
            Some(serde_json::json!({ "name": name, "command": command })),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_socket_path_prefers_wayfire() {
        std::env::set_var("WAYFIRE_SOCKET", "/tmp/wayfire.sock");
        std::env::set_var("SWAYSOCK", "/tmp/sway.sock");
        assert_eq!(default_socket_path(), Some("/tmp/wayfire.sock".to_string()));
        std::env::remove_var("WAYFIRE_SOCKET");
        std::env::remove_var("SWAYSOCK");
    }

    #[test]
    fn default_socket_path_falls_back_to_sway() {
        std::env::remove_var("WAYFIRE_SOCKET");
        std::env::set_var("SWAYSOCK", "/tmp/sway.sock");
        assert_eq!(default_socket_path(), Some("/tmp/sway.sock".to_string()));
        std::env::remove_var("SWAYSOCK");
    }

    #[test]
    fn request_serializes_with_token_and_method() {
        let req = Request {
            token: 7,
            method: "list_views".to_string(),
            params: None,
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["token"], 7);
        assert_eq!(value["method"], "list_views");
        assert!(value.get("params").is_none());
    }

    #[tokio::test]
    async fn call_without_connection_fails_not_connected() {
        let events = Arc::new(EventBus::new());
        let client = IpcClient::new("/tmp/does-not-exist.sock", events);
        let err = client.call("list_views", None).await.unwrap_err();
        assert!(matches!(err, IpcError::NotConnected));
    }
}
