//! Local IPC server: a Unix socket under `$XDG_RUNTIME_DIR/waypanel/ipc.sock`
//! exposing runtime introspection to external tooling, distinct from the
//! compositor IPC client in `ipc.rs`.
//!
//! Every response carries the same envelope: `{status, command, data?,
//! message?}`. Four commands are always available (`get_config_data`,
//! `get_plugins_data`, `get_status_data`, `list_commands`); modules can
//! register additional ones through `register_command(name, handler)`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{error, info, warn};

use crate::config::ConfigStore;
use crate::module::ModuleState;

#[derive(Error, Debug)]
pub enum IpcServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A snapshot view of a loaded module for `get_plugins_data`/status
/// reporting, independent of the loader's own instance table so the
/// server doesn't need to borrow it across an await point.
#[derive(Debug, Clone)]
pub struct ModuleSnapshot {
    pub id: String,
    pub state: ModuleState,
}

pub type CommandHandler = Box<dyn Fn(&Value) -> Value + Send + Sync>;

/// Resolves the server's socket path under `$XDG_RUNTIME_DIR`, falling
/// back to `/tmp` if the variable is unset (a headless test environment,
/// typically).
pub fn socket_path() -> PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(runtime_dir).join("waypanel").join("ipc.sock")
}

fn ok_envelope(command: &str, data: Value) -> Value {
    json!({ "status": "ok", "command": command, "data": data })
}

fn error_envelope(command: &str, message: impl std::fmt::Display) -> Value {
    json!({ "status": "error", "command": command, "message": message.to_string() })
}

/// Registered command handlers plus the shared state the built-in
/// commands read from.
pub struct IpcServer {
    socket_path: PathBuf,
    handlers: Arc<RwLock<HashMap<String, CommandHandler>>>,
    config: Arc<RwLock<ConfigStore>>,
    modules: Arc<RwLock<Vec<ModuleSnapshot>>>,
    clients_connected: Arc<AtomicUsize>,
    start_time: std::time::Instant,
}

impl IpcServer {
    pub fn new(config: Arc<RwLock<ConfigStore>>, modules: Arc<RwLock<Vec<ModuleSnapshot>>>) -> Self {
        let server = Self {
            socket_path: socket_path(),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            config,
            modules,
            clients_connected: Arc::new(AtomicUsize::new(0)),
            start_time: std::time::Instant::now(),
        };
        server.register_builtin_commands();
        server
    }

    pub fn socket_path_str(&self) -> &Path {
        &self.socket_path
    }

    /// Registers a module-provided command, the same extension surface the
    /// original exposed as `ipc_server.register_command(name, handler)`.
    pub fn register_command<F>(&self, name: &str, handler: F)
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .insert(name.to_string(), Box::new(handler));
    }

    fn register_builtin_commands(&self) {
        let config = self.config.clone();
        self.register_command("get_config_data", move |_args| {
            ok_envelope("get_config_data", config.read().snapshot())
        });

        let modules = self.modules.clone();
        self.register_command("get_plugins_data", move |_args| {
            let names: Vec<String> = modules.read().iter().map(|m| m.id.clone()).collect();
            ok_envelope("get_plugins_data", json!(names))
        });

        let clients = self.clients_connected.clone();
        let started = self.start_time;
        let socket = self.socket_path.clone();
        self.register_command("get_status_data", move |_args| {
            ok_envelope(
                "get_status_data",
                json!({
                    "ipc_socket": socket.to_string_lossy(),
                    "clients_connected": clients.load(Ordering::Relaxed),
                    "uptime_seconds": started.elapsed().as_secs(),
                }),
            )
        });

        let handlers = self.handlers.clone();
        self.register_command("list_commands", move |_args| {
            let mut names: Vec<String> = handlers.read().keys().cloned().collect();
            names.sort();
            ok_envelope("list_commands", json!(names))
        });
    }

    fn dispatch(&self, command: &str, args: &Value) -> Value {
        let handlers = self.handlers.read();
        match handlers.get(command) {
            Some(handler) => handler(args),
            None => error_envelope(command, "unknown command"),
        }
    }

    /// Binds the Unix socket and serves requests until the process exits.
    /// Each connection is handled on its own task; one misbehaving client
    /// cannot block others.
    pub async fn serve(self: Arc<Self>) -> Result<(), IpcServerError> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        info!("ipc server listening on {:?}", self.socket_path);

        loop {
            let (stream, _) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                server.clients_connected.fetch_add(1, Ordering::Relaxed);
                server.handle_connection(stream).await;
                server.clients_connected.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    async fn handle_connection(&self, stream: UnixStream) {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("ipc client read error: {e}");
                    break;
                }
            };

            let response = match serde_json::from_str::<Value>(&line) {
                Ok(request) => {
                    let command = request
                        .get("command")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string();
                    let args = request.get("args").cloned().unwrap_or(Value::Null);
                    self.dispatch(&command, &args)
                }
                Err(e) => error_envelope("unknown", format!("malformed request: {e}")),
            };

            let Ok(mut bytes) = serde_json::to_vec(&response) else {
                error!("failed to serialize ipc response");
                break;
            };
            bytes.push(b'\n');
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelopes_carry_command_name() {
        let ok = ok_envelope("list_commands", json!([]));
        assert_eq!(ok["status"], "ok");
        assert_eq!(ok["command"], "list_commands");

        let err = error_envelope("list_commands", "boom");
        assert_eq!(err["status"], "error");
        assert_eq!(err["message"], "boom");
    }

    #[test]
    fn dispatch_unknown_command_returns_error_envelope() {
        let config = Arc::new(RwLock::new(ConfigStore::load().unwrap()));
        let modules = Arc::new(RwLock::new(Vec::new()));
        let server = IpcServer::new(config, modules);
        let response = server.dispatch("nonexistent", &Value::Null);
        assert_eq!(response["status"], "error");
    }

    #[test]
    fn list_commands_includes_every_builtin() {
        let config = Arc::new(RwLock::new(ConfigStore::load().unwrap()));
        let modules = Arc::new(RwLock::new(Vec::new()));
        let server = IpcServer::new(config, modules);
        let response = server.dispatch("list_commands", &Value::Null);
        let commands: Vec<String> =
            serde_json::from_value(response["data"].clone()).unwrap();
        for expected in ["get_config_data", "get_plugins_data", "get_status_data", "list_commands"] {
            assert!(commands.contains(&expected.to_string()));
        }
    }

    #[test]
    fn module_registered_command_is_dispatched() {
        let config = Arc::new(RwLock::new(ConfigStore::load().unwrap()));
        let modules = Arc::new(RwLock::new(Vec::new()));
        let server = IpcServer::new(config, modules);
        server.register_command("ping", |_| json!({ "status": "ok", "command": "ping", "data": "pong" }));
        let response = server.dispatch("ping", &Value::Null);
        assert_eq!(response["data"], "pong");
    }
}
