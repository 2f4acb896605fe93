//! Waypanel module runtime.
//!
//! The GTK-free half of Waypanel: module discovery, dependency resolution,
//! lifecycle management, the event bus, the compositor IPC client, the
//! shared config store, the panel region registry, and the module sync/
//! hot-reload service. The concrete GUI toolkit binding lives in the
//! `waypanel` host binary crate, which depends on this one and never the
//! reverse — every type this crate exposes to a module is GTK-agnostic.
//!
//! # Example
//!
//! ```rust,ignore
//! use waypanel_core::prelude::*;
//!
//! #[derive(Default)]
//! struct ClockModule;
//!
//! impl Module for ClockModule {
//!     fn on_start(&mut self, host: &HostHandle) -> ModuleResult<()> {
//!         host.logger();
//!         Ok(())
//!     }
//! }
//!
//! fn metadata() -> ModuleMetadata {
//!     ModuleMetadata { id: "org.waypanel.clock".into(), ..Default::default() }
//! }
//!
//! declare_module!(ClockModule, metadata, ClockModule::default);
//! ```

pub mod config;
pub mod events;
pub mod host;
pub mod ipc;
pub mod ipc_server;
pub mod loader;
pub mod module;
pub mod regions;
pub mod registry;
pub mod scheduler;
pub mod sync;
pub mod watcher;

pub use config::{ConfigFacade, ConfigStore, HintRegistry, PathResolver, SettingHint};
pub use events::{EventBus, SubscriptionId};
pub use host::{HostHandle, ModuleRef};
pub use ipc::IpcClient;
pub use ipc_server::IpcServer;
pub use loader::{topological_order, ModuleLoader};
pub use module::{
    AttachMode, FailureReason, Module, ModuleError, ModuleInstance, ModuleMetadata, ModuleResult,
    ModuleState,
};
pub use regions::{RegionRegistry, WidgetHandle};
pub use registry::ModuleRegistry;
pub use scheduler::{ModuleScheduler, Scheduler, StopFlag};
pub use watcher::FileWatcherService;

/// Module API version for compatibility checking. Major must match
/// exactly between host and module; a module's declared minimum minor
/// must not exceed the host's.
pub const API_VERSION: &str = "1.0.0";

/// Parses [`API_VERSION`] as a [`semver::Version`], for callers (chiefly the
/// host binary's `ModuleLoader::load_all`) that need it as a `Version`
/// rather than a string. `API_VERSION` is a crate constant, so this never
/// fails in practice.
pub fn host_api_version() -> semver::Version {
    semver::Version::parse(API_VERSION).expect("API_VERSION is a valid semver string")
}

/// Common imports for writing a module against this crate.
pub mod prelude {
    pub use crate::declare_module;
    pub use crate::events::EventHandlerEntry;
    pub use crate::host::HostHandle;
    pub use crate::module::{
        AttachMode, FailureReason, Module, ModuleError, ModuleMetadata, ModuleResult, ModuleState,
    };
    pub use crate::regions::WidgetHandle;
    pub use semver::Version;
}
