//! Module Runtime Facilities: the single handle every module's lifecycle
//! methods receive, instead of a back-reference to the whole host process.
//!
//! Carries a per-module data directory, config access, and an event
//! channel, plus the facilities a module actually needs day to day:
//! logging, config, desktop notifications, running a shell command, and
//! the three ways to get work off the UI thread and back onto it. No
//! unrestricted access to other modules or the host window itself.

use std::process::Command;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::Span;

use crate::config::ConfigFacade;
use crate::events::EventBus;
use crate::ipc::IpcClient;
use crate::module::{config_namespace, ModuleState};
use crate::regions::RegionRegistry;
use crate::scheduler::{ModuleScheduler, Scheduler};

#[derive(Error, Debug)]
pub enum HostError {
    #[error("command failed to start: {0}")]
    CommandFailed(String),
}

/// A reference to another loaded module's state, returned by
/// `HostHandle::get_module`. A module may only observe another module's state and
/// exported commands if that module is currently `Enabled`.
#[derive(Debug, Clone)]
pub struct ModuleRef {
    pub id: String,
    pub state: ModuleState,
}

/// Shell command execution, the Rust equivalent of the original
/// `CommandRunner`/`self.run_cmd`: fire-and-forget, run off the UI thread.
#[derive(Clone, Default)]
pub struct CommandRunner;

impl CommandRunner {
    /// Spawns `command` via `sh -c` on a background thread; does not wait
    /// for completion or capture output, matching the original's
    /// fire-and-forget `run_cmd` usage (`self.run_cmd("notify-send ...")`).
    pub fn run(&self, command: &str) {
        let command = command.to_string();
        std::thread::spawn(move || match Command::new("sh").arg("-c").arg(&command).status() {
            Ok(status) if !status.success() => {
                tracing::warn!("command exited with {status}: {command}");
            }
            Err(e) => tracing::warn!("failed to spawn command '{command}': {e}"),
            _ => {}
        });
    }
}

/// Miscellaneous convenience functions that don't warrant their own
/// facility, the equivalent of the original `BasePlugin`'s grab-bag of
/// small utility methods (cursor effects, icon lookups) narrowed to the
/// ones with no GTK dependency.
#[derive(Clone, Default)]
pub struct Helpers;

/// The facility bag passed to every `Module` lifecycle method. Cloning is
/// cheap (everything inside is an `Arc`); modules are expected to clone it
/// into any background thread or task they spawn rather than borrow it.
#[derive(Clone)]
pub struct HostHandle {
    module_id: String,
    config: ConfigFacade,
    events: Arc<EventBus>,
    ipc: Arc<IpcClient>,
    regions: Arc<RwLock<RegionRegistry>>,
    scheduler: Scheduler,
    modules: Arc<RwLock<Vec<ModuleRef>>>,
    cmd: CommandRunner,
    helpers: Helpers,
}

impl HostHandle {
    pub fn new(
        module_id: impl Into<String>,
        config: ConfigFacade,
        events: Arc<EventBus>,
        ipc: Arc<IpcClient>,
        regions: Arc<RwLock<RegionRegistry>>,
        scheduler: Scheduler,
        modules: Arc<RwLock<Vec<ModuleRef>>>,
    ) -> Self {
        Self {
            module_id: module_id.into(),
            config,
            events,
            ipc,
            regions,
            scheduler,
            modules,
            cmd: CommandRunner,
            helpers: Helpers,
        }
    }

    /// Returns a handle scoped to a different module id, sharing every
    /// other facility. Used by the loader when constructing the
    /// `HostHandle` passed to each module's lifecycle methods.
    pub fn for_module(&self, module_id: impl Into<String>) -> Self {
        let mut clone = self.clone();
        clone.module_id = module_id.into();
        clone
    }

    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    /// A `tracing` span pre-populated with this module's id, the
    /// equivalent of the original per-plugin `self.logger`.
    pub fn logger(&self) -> Span {
        tracing::info_span!("module", id = %self.module_id)
    }

    /// The settings façade: `get_setting(path, default)` and
    /// `add_hint(path, default, description)`, per the Module Runtime
    /// Facilities.
    pub fn config(&self) -> &ConfigFacade {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn ipc(&self) -> &Arc<IpcClient> {
        &self.ipc
    }

    pub fn regions(&self) -> &Arc<RwLock<RegionRegistry>> {
        &self.regions
    }

    /// This module's scheduler view: `run_in_thread`/`run_in_async_task`/
    /// `schedule_in_ui_thread`/`schedule_timer`. Every handle it spawns is
    /// tracked under this module's id so the Loader can cancel all of them
    /// on disable.
    pub fn scheduler(&self) -> ModuleScheduler {
        self.scheduler.for_module(&self.module_id)
    }

    pub fn cmd(&self) -> &CommandRunner {
        &self.cmd
    }

    pub fn helpers(&self) -> &Helpers {
        &self.helpers
    }

    /// This module's own settings namespace (`org.waypanel.plugin.<id>`).
    pub fn own_config_namespace(&self) -> String {
        config_namespace(&self.module_id)
    }

    /// Sends a desktop notification through the compositor-side
    /// notification channel, matching the original `Notifier.notify_send`
    /// helper's role — never D-Bus directly from a module.
    pub fn notify_send(&self, title: &str, body: &str) {
        let ipc = self.ipc.clone();
        let title = title.to_string();
        let body = body.to_string();
        tokio::spawn(async move {
            let params = serde_json::json!({ "title": title, "body": body });
            if let Err(e) = ipc.call("notify_send", Some(params)).await {
                tracing::warn!("notify_send failed: {e}");
            }
        });
    }

    /// Looks up another module by id. Returns `None` unless that module is
    /// currently `Enabled` — a disabled, failed, or unloaded module is
    /// invisible to cross-module lookups, so callers must handle the
    /// absent case rather than assume a declared dependency is reachable.
    pub fn get_module(&self, id: &str) -> Option<ModuleRef> {
        self.modules
            .read()
            .iter()
            .find(|m| m.id == id && m.state == ModuleState::Enabled)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_host(modules: Vec<ModuleRef>) -> HostHandle {
        HostHandle::new(
            "test-module",
            ConfigFacade::new(Arc::new(RwLock::new(
                crate::config::ConfigStore::load().expect("config store loads in test env"),
            ))),
            Arc::new(EventBus::new()),
            Arc::new(IpcClient::new("/tmp/does-not-exist.sock", Arc::new(EventBus::new()))),
            Arc::new(RwLock::new(RegionRegistry::new())),
            Scheduler::new(),
            Arc::new(RwLock::new(modules)),
        )
    }

    #[test]
    fn get_module_returns_none_for_disabled() {
        let host = test_host(vec![ModuleRef {
            id: "clock".to_string(),
            state: ModuleState::Disabled,
        }]);
        assert!(host.get_module("clock").is_none());
    }

    #[test]
    fn get_module_returns_ref_for_enabled() {
        let host = test_host(vec![ModuleRef {
            id: "clock".to_string(),
            state: ModuleState::Enabled,
        }]);
        assert!(host.get_module("clock").is_some());
    }

    #[test]
    fn for_module_preserves_shared_facilities_with_new_id() {
        let host = test_host(vec![]);
        let scoped = host.for_module("other");
        assert_eq!(scoped.module_id(), "other");
        assert_eq!(host.module_id(), "test-module");
    }

    #[test]
    fn own_config_namespace_is_scoped_by_id() {
        let host = test_host(vec![]);
        assert_eq!(host.own_config_namespace(), "org.waypanel.plugin.test-module");
    }
}
