//! Primary-output resolution for the Host Application.
//!
//! Picks which compositor output the panel surfaces should live on:
//! the configured `primary_output.name` if present and enabled, otherwise
//! the first output that isn't DPMS-disabled.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use waypanel_core::ipc::IpcClient;
use waypanel_core::ConfigFacade;

pub struct OutputResolver {
    config: ConfigFacade,
    ipc: Arc<IpcClient>,
    current: Option<String>,
}

impl OutputResolver {
    pub fn new(config: ConfigFacade, ipc: Arc<IpcClient>) -> Self {
        Self {
            config,
            ipc,
            current: None,
        }
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Queries the compositor for the current output list and resolves the
    /// target. Awaits the IPC round trip directly rather than blocking a
    /// thread on it; callers must drive this from `run_in_async_task`, not
    /// from a synchronous UI callback, or a slow compositor would stall the
    /// caller for up to the request timeout.
    pub async fn resolve(&mut self) -> Option<String> {
        let outputs = match self.ipc.list_outputs().await {
            Ok(v) => v,
            Err(e) => {
                warn!("list_outputs failed while resolving primary output: {e}");
                return self.current.clone();
            }
        };
        let Some(outputs) = outputs.as_array() else {
            return self.current.clone();
        };

        let preferred = self
            .config
            .get_setting("org.waypanel.panel.primary_output.name", Value::Null);
        let preferred = preferred.as_str().map(str::to_string);

        let is_enabled = |o: &Value| {
            !o.get("disabled")
                .and_then(Value::as_bool)
                .unwrap_or(false)
        };
        let name_of = |o: &Value| o.get("name").and_then(Value::as_str).map(str::to_string);

        let chosen = preferred
            .as_deref()
            .and_then(|wanted| {
                outputs
                    .iter()
                    .find(|o| is_enabled(o) && name_of(o).as_deref() == Some(wanted))
            })
            .or_else(|| outputs.iter().find(|o| is_enabled(o)))
            .and_then(name_of);

        self.current = chosen.clone();
        chosen
    }
}
