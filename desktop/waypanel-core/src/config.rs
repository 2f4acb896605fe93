//! Path & Config Store: XDG directory resolution plus the shared
//! configuration tree with atomic save and reload notification.
//!
//! Built on a `ProjectDirs`-based load/save shape, extended with explicit
//! `XDG_CONFIG_DIRS`/`XDG_DATA_DIRS` search-path precedence, which
//! `directories::ProjectDirs` alone does not expose (it only ever returns
//! the user's own directory, never the system search list).

use std::collections::{HashMap, HashSet};
use std::env;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use directories::ProjectDirs;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::events::EventBus;

const APP_NAME: &str = "waypanel";
const CONFIG_FILE: &str = "config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not determine XDG directories for {APP_NAME}")]
    NoProjectDirs,

    #[error("config read failed: {0}")]
    ReadFailed(String),

    #[error("config write failed: {0}")]
    WriteFailed(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

fn xdg_base_dir(env_var: &str, default: PathBuf) -> PathBuf {
    match env::var(env_var) {
        Ok(value) if !value.is_empty() => {
            let path = PathBuf::from(value);
            if path.is_absolute() {
                return path;
            }
            default
        }
        _ => default,
    }
}

fn xdg_search_dirs(env_var: &str, defaults: &[&str]) -> Vec<PathBuf> {
    match env::var(env_var) {
        Ok(value) if !value.is_empty() => env::split_paths(&value)
            .filter(|p| p.is_absolute())
            .collect(),
        _ => defaults.iter().map(PathBuf::from).collect(),
    }
}

/// Resolves XDG paths for user config/data/cache and the ordered system
/// search paths: user paths first, then system paths in the order given
/// by environment or defaults.
#[derive(Clone)]
pub struct PathResolver {
    home: PathBuf,
}

impl Default for PathResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl PathResolver {
    pub fn new() -> Self {
        Self {
            home: dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    pub fn config_dir(&self) -> PathBuf {
        let home = xdg_base_dir("XDG_CONFIG_HOME", self.home.join(".config"));
        home.join(APP_NAME)
    }

    pub fn data_dir(&self) -> PathBuf {
        let home = xdg_base_dir("XDG_DATA_HOME", self.home.join(".local/share"));
        home.join(APP_NAME)
    }

    pub fn cache_dir(&self) -> PathBuf {
        let home = xdg_base_dir("XDG_CACHE_HOME", self.home.join(".cache"));
        home.join(APP_NAME)
    }

    /// User search path first, then each `XDG_CONFIG_DIRS` entry (default
    /// `/etc/xdg`) joined with the app name.
    pub fn config_search_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.config_dir()];
        paths.extend(
            xdg_search_dirs("XDG_CONFIG_DIRS", &["/etc/xdg"])
                .into_iter()
                .map(|p| p.join(APP_NAME)),
        );
        paths
    }

    /// User search path first, then each `XDG_DATA_DIRS` entry (default
    /// `/usr/local/share:/usr/share`) joined with the app name.
    pub fn data_search_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.data_dir()];
        paths.extend(
            xdg_search_dirs("XDG_DATA_DIRS", &["/usr/local/share", "/usr/share"])
                .into_iter()
                .map(|p| p.join(APP_NAME)),
        );
        paths
    }

    /// First existing match across user+system search paths; if none
    /// exists, the user path (creating its parent directories).
    pub fn data_path(&self, parts: &[&str]) -> PathBuf {
        for base in self.data_search_paths() {
            let candidate = parts.iter().fold(base, |p, part| p.join(part));
            if candidate.exists() {
                return candidate;
            }
        }
        let user_path = parts.iter().fold(self.data_dir(), |p, part| p.join(part));
        if let Some(parent) = user_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        user_path
    }
}

/// Just a sanity check that `ProjectDirs` agrees with the XDG paths above;
/// not used for path resolution itself, kept as a guard against silent
/// drift between the two.
fn assert_project_dirs_available() -> ConfigResult<()> {
    ProjectDirs::from("org", "waypanel", APP_NAME)
        .map(|_| ())
        .ok_or(ConfigError::NoProjectDirs)
}

/// The shared configuration tree plus its on-disk persistence.
///
/// Reads on the UI thread are meant to be lock-free snapshot reads; this
/// crate has no GTK-thread-affinity of its own to enforce that, so callers
/// own the invariant that `reload()` and its publish of `config-reloaded`
/// happen on the UI thread, per the concurrency model.
pub struct ConfigStore {
    resolver: PathResolver,
    tree: Value,
}

impl ConfigStore {
    /// Loads `{config_dir}/config.toml`, or starts from an empty tree if
    /// the file does not exist yet (and persists the empty tree so future
    /// tooling has something to read). On malformed content, keeps
    /// whatever was previously in memory (empty, on first start) and logs.
    pub fn load() -> ConfigResult<Self> {
        if let Err(e) = assert_project_dirs_available() {
            warn!("project dirs unavailable: {e}");
        }
        let resolver = PathResolver::new();
        fs::create_dir_all(resolver.config_dir())
            .map_err(|e| ConfigError::WriteFailed(e.to_string()))?;
        let path = resolver.config_dir().join(CONFIG_FILE);

        let tree = if path.exists() {
            let content = fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(e.to_string()))?;
            match toml::from_str::<toml::Value>(&content) {
                Ok(value) => toml_to_json(value),
                Err(e) => {
                    warn!("config at {path:?} malformed ({e}), keeping empty tree in memory");
                    Value::Object(Default::default())
                }
            }
        } else {
            info!("no config file at {path:?}, starting from an empty tree");
            Value::Object(Default::default())
        };

        let store = Self { resolver, tree };
        if !path.exists() {
            store.save()?;
        }
        Ok(store)
    }

    pub fn path_resolver(&self) -> &PathResolver {
        &self.resolver
    }

    fn config_path(&self) -> PathBuf {
        self.resolver.config_dir().join(CONFIG_FILE)
    }

    /// Writes atomically: temp file in the same directory, fsync, rename
    /// over the target. On a crash mid-save either the old or the new file
    /// content is observed, never a partial write.
    pub fn save(&self) -> ConfigResult<()> {
        let path = self.config_path();
        let toml_value = json_to_toml(self.tree.clone());
        let content = toml::to_string_pretty(&toml_value)
            .map_err(|e| ConfigError::WriteFailed(e.to_string()))?;

        let tmp_path = path.with_extension(format!("toml.tmp-{}", std::process::id()));
        {
            let mut f =
                File::create(&tmp_path).map_err(|e| ConfigError::WriteFailed(e.to_string()))?;
            f.write_all(content.as_bytes())
                .map_err(|e| ConfigError::WriteFailed(e.to_string()))?;
            f.sync_all()
                .map_err(|e| ConfigError::WriteFailed(e.to_string()))?;
        }
        fs::rename(&tmp_path, &path).map_err(|e| ConfigError::WriteFailed(e.to_string()))?;
        debug!("config saved to {path:?}");
        Ok(())
    }

    /// Re-reads from disk and publishes `config-reloaded` with the new
    /// tree. Subscribers self-serve what they need from the payload.
    pub fn reload(&mut self, bus: &EventBus) -> ConfigResult<()> {
        let reloaded = Self::load()?;
        self.tree = reloaded.tree;
        bus.publish("config-reloaded", self.tree.clone());
        Ok(())
    }

    /// Reads a dotted path (`a.b.c`), returning `default` if any segment
    /// is missing or the leaf type doesn't match.
    pub fn get(&self, path: &str, default: Value) -> Value {
        get_path(&self.tree, path).cloned().unwrap_or(default)
    }

    /// Sets a dotted path, creating intermediate objects as needed.
    pub fn set(&mut self, path: &str, value: Value) {
        set_path(&mut self.tree, path, value);
    }

    /// Deletes an entire module's subtree (`org.waypanel.plugin.<id>`).
    pub fn remove_root_setting(&mut self, id: &str) {
        if let Value::Object(map) = &mut self.tree {
            map.remove(id);
        }
    }

    pub fn snapshot(&self) -> Value {
        self.tree.clone()
    }
}

/// A declared default and human-readable description for a settings path,
/// recorded by `ConfigFacade::add_hint` for tooling (control-center UI,
/// documentation generation) to read back later.
#[derive(Debug, Clone)]
pub struct SettingHint {
    pub default: Value,
    pub description: String,
}

/// Process-wide registry of every settings path a module has declared a
/// hint for, plus the set of paths read without one. Per the config tree
/// invariant, every leaf a module reads SHOULD have a hint; an unhinted
/// read still succeeds, it is just tracked here for later tooling to flag.
#[derive(Default)]
pub struct HintRegistry {
    hints: HashMap<String, SettingHint>,
    unhinted_reads: HashSet<String>,
}

impl HintRegistry {
    pub fn hints(&self) -> impl Iterator<Item = (&String, &SettingHint)> {
        self.hints.iter()
    }

    /// Paths read via `get_setting` that never went through `add_hint`.
    pub fn unhinted_reads(&self) -> impl Iterator<Item = &String> {
        self.unhinted_reads.iter()
    }
}

/// A module-facing façade over the `ConfigStore`: the two operations
/// `HostHandle::config()` exposes. Cheap to clone; every `HostHandle` shares the same
/// underlying store and hint registry.
#[derive(Clone)]
pub struct ConfigFacade {
    store: Arc<RwLock<ConfigStore>>,
    hints: Arc<Mutex<HintRegistry>>,
}

impl ConfigFacade {
    pub fn new(store: Arc<RwLock<ConfigStore>>) -> Self {
        Self {
            store,
            hints: Arc::new(Mutex::new(HintRegistry::default())),
        }
    }

    /// Reads `path`, recording it as an unhinted read unless a hint was
    /// already registered for it.
    pub fn get_setting(&self, path: &str, default: Value) -> Value {
        let mut hints = self.hints.lock();
        if !hints.hints.contains_key(path) {
            hints.unhinted_reads.insert(path.to_string());
        }
        drop(hints);
        self.store.read().get(path, default)
    }

    /// Records `default`/`description` as the declared hint for `path` in
    /// the process-wide registry, then reads the current value the same
    /// way `get_setting` does.
    pub fn add_hint(&self, path: &str, default: Value, description: &str) -> Value {
        let mut hints = self.hints.lock();
        hints.unhinted_reads.remove(path);
        hints.hints.insert(
            path.to_string(),
            SettingHint {
                default: default.clone(),
                description: description.to_string(),
            },
        );
        drop(hints);
        self.store.read().get(path, default)
    }

    pub fn set(&self, path: &str, value: Value) {
        self.store.write().set(path, value);
    }

    pub fn store(&self) -> &Arc<RwLock<ConfigStore>> {
        &self.store
    }

    /// Snapshot of every hint registered so far, for tooling.
    pub fn hint_snapshot(&self) -> Vec<(String, SettingHint)> {
        self.hints
            .lock()
            .hints()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn set_path(value: &mut Value, path: &str, new_value: Value) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = match segments.pop() {
        Some(s) => s,
        None => return,
    };
    let mut current = value;
    for segment in segments {
        if !current.is_object() {
            *current = Value::Object(Default::default());
        }
        current = current
            .as_object_mut()
            .unwrap()
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    if !current.is_object() {
        *current = Value::Object(Default::default());
    }
    current
        .as_object_mut()
        .unwrap()
        .insert(last.to_string(), new_value);
}

fn toml_to_json(value: toml::Value) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn json_to_toml(value: Value) -> toml::Value {
    serde_json::from_value(value).unwrap_or(toml::Value::Table(Default::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment-variable tests must not run concurrently with each
    // other; this mutex keeps them serialized within the process.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn search_paths_default_when_env_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::remove_var("XDG_CONFIG_DIRS");
        let resolver = PathResolver::new();
        let paths = resolver.config_search_paths();
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[1], PathBuf::from("/etc/xdg/waypanel"));
    }

    #[test]
    fn search_paths_respect_env_override() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("XDG_CONFIG_DIRS", "/opt/a:/opt/b");
        let resolver = PathResolver::new();
        let paths = resolver.config_search_paths();
        assert_eq!(paths[1], PathBuf::from("/opt/a/waypanel"));
        assert_eq!(paths[2], PathBuf::from("/opt/b/waypanel"));
        env::remove_var("XDG_CONFIG_DIRS");
    }

    #[test]
    fn relative_env_entries_are_ignored() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("XDG_DATA_DIRS", "relative/path:/abs/path");
        let resolver = PathResolver::new();
        let paths = resolver.data_search_paths();
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[1], PathBuf::from("/abs/path/waypanel"));
        env::remove_var("XDG_DATA_DIRS");
    }

    #[test]
    fn get_set_dotted_path() {
        let mut tree = Value::Object(Default::default());
        set_path(&mut tree, "panels.top.size", Value::from(40));
        assert_eq!(
            get_path(&tree, "panels.top.size"),
            Some(&Value::from(40))
        );
    }

    #[test]
    fn get_missing_path_returns_default() {
        let tree = Value::Object(Default::default());
        assert_eq!(
            get_path(&tree, "panels.top.size"),
            None
        );
    }

    #[test]
    fn add_hint_registers_default_and_reads_back() {
        let store = Arc::new(RwLock::new(
            ConfigStore::load().expect("config store loads in test env"),
        ));
        let facade = ConfigFacade::new(store);
        let value = facade.add_hint("panels.top.size", Value::from(32), "top panel height");
        assert_eq!(value, Value::from(32));
        let hints = facade.hint_snapshot();
        assert!(hints.iter().any(|(k, _)| k == "panels.top.size"));
    }

    #[test]
    fn get_setting_without_hint_is_tracked_as_unhinted() {
        let store = Arc::new(RwLock::new(
            ConfigStore::load().expect("config store loads in test env"),
        ));
        let facade = ConfigFacade::new(store);
        facade.get_setting("org.waypanel.plugin.clock.format", Value::from("24h"));
        assert!(facade
            .hints
            .lock()
            .unhinted_reads()
            .any(|p| p == "org.waypanel.plugin.clock.format"));
    }

    #[test]
    fn add_hint_removes_path_from_unhinted_set() {
        let store = Arc::new(RwLock::new(
            ConfigStore::load().expect("config store loads in test env"),
        ));
        let facade = ConfigFacade::new(store);
        facade.get_setting("x.y", Value::Null);
        facade.add_hint("x.y", Value::from(1), "desc");
        assert!(!facade.hints.lock().unhinted_reads().any(|p| p == "x.y"));
    }
}
