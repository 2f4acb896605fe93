//! Core module traits and types.
//!
//! A module is a loadable unit that declares metadata and a factory. It may
//! or may not contribute UI. This mirrors the two-phase contract the
//! registry relies on: cheap, side-effect-free metadata extraction, and a
//! separate factory call that does the real construction work.

use semver::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::host::HostHandle;
use crate::regions::WidgetHandle;

/// Errors a module's lifecycle methods can raise.
#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("module construction failed: {0}")]
    ConstructionFailed(String),

    #[error("module not found: {0}")]
    NotFound(String),

    #[error("module API version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },

    #[error("missing dependency: {0}")]
    MissingDependency(String),

    #[error("dependency cycle detected: {0:?}")]
    DependencyCycle(Vec<String>),

    #[error("module already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("module disabled: {0}")]
    Disabled(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("region attach failed: {0}")]
    RegionAttach(String),

    #[error("startup error: {0}")]
    Startup(String),
}

pub type ModuleResult<T> = Result<T, ModuleError>;

/// Lifecycle state of a loaded module instance.
///
/// ```text
/// Unloaded --load()--> Loading --on_start() ok--> Enabled
/// Loading --on_start() err--> Failed
/// Enabled --disable()--> Disabled (cleanup completed)
/// Disabled --reload()--> Loading
/// any --Failed--> remains Failed until reload
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleState {
    Unloaded,
    Loading,
    Enabled,
    Disabled,
    Failed,
}

impl Default for ModuleState {
    fn default() -> Self {
        Self::Unloaded
    }
}

/// Why a module ended up `Failed`, for tooling and log messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    MissingDependency(String),
    DependencyCycle,
    Metadata(String),
    Startup(String),
    RegionAttach(String),
}

/// Attach-mode a module's main widget is handed to the Panel Region Registry
/// with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachMode {
    /// Insert as a child of the region's container.
    Append,
    /// Replace the region's root child.
    SetContent,
}

/// Metadata extracted from a module source without constructing it.
///
/// Invariant: immutable after extraction. To pick up changed metadata, the
/// source must be reloaded (treated as uninstall-of-old-id +
/// install-of-new-id by the registry if the id itself changed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleMetadata {
    pub id: String,
    pub name: String,
    #[serde(with = "version_serde")]
    pub version: Version,
    pub enabled: bool,
    /// Panel region name, `"background"`, or `None` if the module has no UI.
    pub container: Option<String>,
    /// Order among siblings within `container`.
    pub index: i32,
    /// Tie-break key for Kahn-sort ordering when dependencies leave freedom.
    pub priority: i32,
    /// Declared dependency ids, in declaration order.
    pub deps: Vec<String>,
    pub description: String,
}

impl Default for ModuleMetadata {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            version: Version::new(0, 1, 0),
            enabled: true,
            container: None,
            index: 0,
            priority: 0,
            deps: Vec::new(),
            description: String::new(),
        }
    }
}

impl ModuleMetadata {
    pub fn is_background(&self) -> bool {
        matches!(self.container.as_deref(), None | Some("background"))
    }
}

/// Checks a module's declared minimum API version against the host's:
/// major must match exactly, module minor must not exceed host minor.
pub fn check_api_compatibility(host: &Version, module_min: &Version) -> ModuleResult<()> {
    if host.major != module_min.major || host.minor < module_min.minor {
        return Err(ModuleError::VersionMismatch {
            expected: host.to_string(),
            actual: module_min.to_string(),
        });
    }
    Ok(())
}

/// Optional-method lifecycle interface every module implements.
///
/// Construction happens via the module's `factory()` entry point (see
/// `crate::loader`); this trait covers everything after that. Every method
/// has a no-op default so a module only overrides the hooks it needs.
pub trait Module: Send {
    /// One-shot setup: register settings hints, subscribe to events, build
    /// `main_widget()`. Raising here moves the instance to `Failed` without
    /// propagating past the loader.
    fn on_start(&mut self, _host: &HostHandle) -> ModuleResult<()> {
        Ok(())
    }

    /// Post-attach activation, called once the module's widget (if any) has
    /// been handed to the Panel Region Registry.
    fn on_enable(&mut self, _host: &HostHandle) -> ModuleResult<()> {
        Ok(())
    }

    /// Called before subscriptions/tasks/threads are torn down on disable.
    fn on_disable(&mut self, _host: &HostHandle) -> ModuleResult<()> {
        Ok(())
    }

    /// Called after a successful reload of this module's source.
    fn on_reload(&mut self, _host: &HostHandle) -> ModuleResult<()> {
        Ok(())
    }

    /// Final teardown before the instance is dropped.
    fn on_stop(&mut self, _host: &HostHandle) -> ModuleResult<()> {
        Ok(())
    }

    /// Arbitrary cleanup hook run after `on_stop`, regardless of whether
    /// `on_stop` returned an error.
    fn on_cleanup(&mut self, _host: &HostHandle) {}

    /// Invoked on every `config-reloaded` event; default is a no-op since
    /// most modules read config lazily via `host.config().get_setting(...)`.
    fn on_config_changed(&mut self, _host: &HostHandle) {}

    /// The module's main widget, if it has UI: a handle plus the attach
    /// mode the Panel Region Registry should use. Read once, right after
    /// `on_start` returns successfully.
    fn main_widget(&self) -> Option<(WidgetHandle, AttachMode)> {
        None
    }
}

/// A boxed, constructed module instance plus the bookkeeping the loader
/// needs to run its lifecycle and clean it up.
pub struct ModuleInstance {
    pub id: String,
    pub metadata: ModuleMetadata,
    pub state: ModuleState,
    pub failure_reason: Option<FailureReason>,
    pub module: Box<dyn Module>,
    /// The widget handle and attach mode this instance last attached to its
    /// container, if any; cleared on disable. Tracked here (in addition to
    /// the Panel Region Registry's own bookkeeping) so tooling can answer
    /// "what did module X attach" without walking every region.
    pub main_widget: Option<(WidgetHandle, AttachMode)>,
}

impl ModuleInstance {
    pub fn new(metadata: ModuleMetadata, module: Box<dyn Module>) -> Self {
        Self {
            id: metadata.id.clone(),
            metadata,
            state: ModuleState::Unloaded,
            failure_reason: None,
            module,
            main_widget: None,
        }
    }

    pub fn mark_failed(&mut self, reason: FailureReason) {
        self.state = ModuleState::Failed;
        self.failure_reason = Some(reason);
    }
}

/// A module's declared own configuration namespace (`org.waypanel.plugin.<id>.*`).
pub fn config_namespace(id: &str) -> String {
    format!("org.waypanel.plugin.{id}")
}

/// Function pointer types a dynamically-loaded module exports. See
/// `crate::loader` for the `libloading` symbol resolution that uses these.
pub type ModuleMetadataFn = unsafe extern "C" fn() -> *mut ModuleMetadata;
pub type ModuleFactoryFn = unsafe extern "C" fn() -> *mut dyn Module;
pub type ModuleApiVersionFn = unsafe extern "C" fn() -> *const std::os::raw::c_char;
pub type ModuleDestroyFn = unsafe extern "C" fn(*mut dyn Module);

/// Declares the FFI entry points a dynamically-loaded module must export:
/// `_waypanel_module_api_version`, `_waypanel_module_metadata`,
/// `_waypanel_module_create`, `_waypanel_module_destroy`. Kept separate from
/// `metadata()`/`factory()` so the registry can read metadata without
/// constructing anything (the two-phase discovery contract).
#[macro_export]
macro_rules! declare_module {
    ($module_type:ty, $metadata_fn:expr, $constructor:expr) => {
        #[no_mangle]
        pub extern "C" fn _waypanel_module_api_version() -> *const std::os::raw::c_char {
            concat!($crate::API_VERSION, "\0").as_ptr() as *const std::os::raw::c_char
        }

        #[no_mangle]
        pub extern "C" fn _waypanel_module_metadata() -> *mut $crate::module::ModuleMetadata {
            let f: fn() -> $crate::module::ModuleMetadata = $metadata_fn;
            Box::into_raw(Box::new(f()))
        }

        #[no_mangle]
        pub extern "C" fn _waypanel_module_create() -> *mut dyn $crate::module::Module {
            let constructor: fn() -> $module_type = $constructor;
            let module = constructor();
            let boxed: Box<dyn $crate::module::Module> = Box::new(module);
            Box::into_raw(boxed)
        }

        #[no_mangle]
        pub extern "C" fn _waypanel_module_destroy(module: *mut dyn $crate::module::Module) {
            if !module.is_null() {
                unsafe {
                    let _ = Box::from_raw(module);
                }
            }
        }
    };
}

mod version_serde {
    use semver::Version;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(version: &Version, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        version.to_string().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Version, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Version::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_default_is_background() {
        let meta = ModuleMetadata::default();
        assert!(meta.is_background());
        assert_eq!(meta.version, Version::new(0, 1, 0));
    }

    #[test]
    fn state_default_is_unloaded() {
        assert_eq!(ModuleState::default(), ModuleState::Unloaded);
    }

    #[test]
    fn api_compat_rejects_major_mismatch() {
        let host = Version::new(1, 3, 0);
        let module_min = Version::new(2, 0, 0);
        assert!(check_api_compatibility(&host, &module_min).is_err());
    }

    #[test]
    fn api_compat_rejects_newer_minor() {
        let host = Version::new(1, 2, 0);
        let module_min = Version::new(1, 3, 0);
        assert!(check_api_compatibility(&host, &module_min).is_err());
    }

    #[test]
    fn api_compat_accepts_older_or_equal_minor() {
        let host = Version::new(1, 3, 0);
        let module_min = Version::new(1, 1, 0);
        assert!(check_api_compatibility(&host, &module_min).is_ok());
    }
}
