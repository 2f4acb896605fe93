//! Dependency Resolver & Loader: orders discovered modules with Kahn's
//! algorithm and drives each one through construction and its full
//! lifecycle.
//!
//! The dynamic-library reopen-and-construct step and the semver
//! compatibility check follow the familiar `load_library`/
//! `check_api_compatibility` shape used by dynamically-loaded plugin
//! systems. The topological sort with `(priority asc, index asc, id
//! lexicographic)` tie-breaking is built on the standard Kahn formulation
//! plus the explicit tie-break rule this system requires.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;

use libloading::{Library, Symbol};
use semver::Version;
use thiserror::Error;
use tracing::{info, warn};

use crate::host::HostHandle;
use crate::module::{
    check_api_compatibility, AttachMode, FailureReason, Module, ModuleDestroyFn, ModuleError,
    ModuleFactoryFn, ModuleInstance, ModuleMetadata, ModuleResult, ModuleState,
};
use crate::regions::{RegionRegistry, WidgetHandle};
use crate::registry::{ModuleCandidate, ModuleRegistry};

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("failed to load library {0:?}: {1}")]
    LibraryLoad(PathBuf, libloading::Error),

    #[error("missing symbol {1} in {0:?}: {2}")]
    MissingSymbol(PathBuf, &'static str, libloading::Error),

    #[error("module {0} unknown to the registry")]
    UnknownModule(String),
}

/// A constructed module still attached to the library that produced it.
/// The `Library` must outlive the raw pointer; dropping this drops the
/// library only after `destroy_fn` has run. Implements `Module` by forwarding every call
/// across the FFI boundary, so it can be boxed as a plain `Box<dyn Module>`
/// like any in-process module.
struct DynamicModule {
    _library: Library,
    module: *mut dyn Module,
    destroy_fn: ModuleDestroyFn,
}

unsafe impl Send for DynamicModule {}

impl Drop for DynamicModule {
    fn drop(&mut self) {
        unsafe {
            (self.destroy_fn)(self.module);
        }
    }
}

impl Module for DynamicModule {
    fn on_start(&mut self, host: &HostHandle) -> ModuleResult<()> {
        unsafe { (*self.module).on_start(host) }
    }
    fn on_enable(&mut self, host: &HostHandle) -> ModuleResult<()> {
        unsafe { (*self.module).on_enable(host) }
    }
    fn on_disable(&mut self, host: &HostHandle) -> ModuleResult<()> {
        unsafe { (*self.module).on_disable(host) }
    }
    fn on_reload(&mut self, host: &HostHandle) -> ModuleResult<()> {
        unsafe { (*self.module).on_reload(host) }
    }
    fn on_stop(&mut self, host: &HostHandle) -> ModuleResult<()> {
        unsafe { (*self.module).on_stop(host) }
    }
    fn on_cleanup(&mut self, host: &HostHandle) {
        unsafe { (*self.module).on_cleanup(host) }
    }
    fn on_config_changed(&mut self, host: &HostHandle) {
        unsafe { (*self.module).on_config_changed(host) }
    }
    fn main_widget(&self) -> Option<(WidgetHandle, AttachMode)> {
        unsafe { (*self.module).main_widget() }
    }
}

fn construct(candidate: &ModuleCandidate) -> Result<DynamicModule, LoaderError> {
    let path = &candidate.path;
    let library =
        unsafe { Library::new(path).map_err(|e| LoaderError::LibraryLoad(path.clone(), e))? };

    let create_fn: Symbol<ModuleFactoryFn> = unsafe {
        library
            .get(b"_waypanel_module_create\0")
            .map_err(|e| LoaderError::MissingSymbol(path.clone(), "_waypanel_module_create", e))?
    };
    let destroy_fn: ModuleDestroyFn = unsafe {
        *library
            .get(b"_waypanel_module_destroy\0")
            .map_err(|e| LoaderError::MissingSymbol(path.clone(), "_waypanel_module_destroy", e))?
    };

    let module = unsafe { create_fn() };
    Ok(DynamicModule {
        _library: library,
        module,
        destroy_fn,
    })
}

/// A no-op placeholder so a `ModuleInstance` always has a valid `Module`
/// target, even for instances that failed before construction.
struct NullModule;
impl Module for NullModule {}

/// Topologically sorts `candidates` by declared dependencies using Kahn's
/// algorithm. Ties among nodes with no remaining incoming edges are broken
/// by `(priority asc, index asc, id lexicographic)`, so the resulting order
/// is fully deterministic given the same metadata. Returns the ordered ids,
/// the ids whose dependencies reference an id absent from `candidates`
/// entirely, and the ids left stranded in a dependency cycle.
pub fn topological_order(
    candidates: &HashMap<String, ModuleMetadata>,
) -> (Vec<String>, Vec<String>, Vec<String>) {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut missing: Vec<String> = Vec::new();

    for (id, meta) in candidates {
        in_degree.entry(id.as_str()).or_insert(0);
        for dep in &meta.deps {
            if !candidates.contains_key(dep) {
                missing.push(id.clone());
                continue;
            }
            *in_degree.entry(id.as_str()).or_insert(0) += 1;
            dependents.entry(dep.as_str()).or_default().push(id.as_str());
        }
    }

    let ready_key = |id: &str| -> (i32, i32, String) {
        let meta = &candidates[id];
        (meta.priority, meta.index, id.to_string())
    };

    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| *id)
        .collect();
    ready.sort_by_key(|id| ready_key(id));

    let mut queue: VecDeque<&str> = ready.into();
    let mut order: Vec<String> = Vec::new();
    let mut visited: HashSet<&str> = HashSet::new();

    while let Some(id) = queue.pop_front() {
        if !visited.insert(id) {
            continue;
        }
        order.push(id.to_string());

        let mut newly_ready = Vec::new();
        if let Some(deps) = dependents.get(id) {
            for &dependent in deps {
                if let Some(deg) = in_degree.get_mut(dependent) {
                    *deg -= 1;
                    if *deg == 0 {
                        newly_ready.push(dependent);
                    }
                }
            }
        }

        // Re-sort the whole queue with the newly-ready nodes merged in,
        // keeping overall pop order consistent with the tie-break rule
        // rather than just appending to the back.
        let mut merged: Vec<&str> = queue.into_iter().collect();
        merged.extend(newly_ready);
        merged.sort_by_key(|id| ready_key(id));
        queue = merged.into();
    }

    let cyclic: Vec<String> = candidates
        .keys()
        .filter(|id| !visited.contains(id.as_str()))
        .cloned()
        .collect();

    (order, missing, cyclic)
}

/// Drives modules through construction and lifecycle: holds the registry of
/// discovered candidates and the live instance table.
pub struct ModuleLoader {
    registry: ModuleRegistry,
    instances: HashMap<String, ModuleInstance>,
}

impl ModuleLoader {
    pub fn new(registry: ModuleRegistry) -> Self {
        Self {
            registry,
            instances: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn instance(&self, id: &str) -> Option<&ModuleInstance> {
        self.instances.get(id)
    }

    pub fn instances(&self) -> impl Iterator<Item = &ModuleInstance> {
        self.instances.values()
    }

    /// Computes the load order across every discovered candidate.
    pub fn plan(&self) -> (Vec<String>, Vec<String>, Vec<String>) {
        let candidates: HashMap<String, ModuleMetadata> = self
            .registry
            .iter()
            .map(|c| (c.metadata.id.clone(), c.metadata.clone()))
            .collect();
        topological_order(&candidates)
    }

    /// Loads every discovered module in dependency order: missing
    /// dependencies and cycles are marked `Failed` without constructing
    /// anything, then each remaining id is constructed and run through
    /// `on_start` -> attach widget -> `on_enable`. One module's failure
    /// never stops the rest from loading.
    pub fn load_all(&mut self, host: &HostHandle, host_api_version: &Version, regions: &mut RegionRegistry) {
        let (order, missing, cyclic) = self.plan();

        for id in &missing {
            let metadata = self
                .registry
                .get(id)
                .map(|c| c.metadata.clone())
                .unwrap_or_default();
            let mut instance = ModuleInstance::new(metadata, Box::new(NullModule));
            instance.mark_failed(FailureReason::MissingDependency(id.clone()));
            warn!("module {id} has a missing dependency, not loading");
            self.instances.insert(id.clone(), instance);
        }

        for id in &cyclic {
            let metadata = self
                .registry
                .get(id)
                .map(|c| c.metadata.clone())
                .unwrap_or_default();
            let mut instance = ModuleInstance::new(metadata, Box::new(NullModule));
            instance.mark_failed(FailureReason::DependencyCycle);
            warn!("module {id} is part of a dependency cycle, not loading");
            self.instances.insert(id.clone(), instance);
        }

        for id in &order {
            if missing.contains(id) || cyclic.contains(id) {
                continue;
            }
            // A dependency that itself failed to load leaves this module
            // unsatisfiable even though the graph had no missing edge.
            let metadata = self.registry.get(id).map(|c| c.metadata.clone()).unwrap_or_default();
            let blocked_on = metadata.deps.iter().find(|dep| {
                self.instances
                    .get(*dep)
                    .map(|i| i.state != ModuleState::Enabled)
                    .unwrap_or(false)
            });
            if let Some(dep) = blocked_on {
                let mut instance = ModuleInstance::new(metadata, Box::new(NullModule));
                instance.mark_failed(FailureReason::MissingDependency(dep.clone()));
                warn!("module {id} depends on failed module {dep}, not loading");
                self.instances.insert(id.clone(), instance);
                continue;
            }

            let mut instance = self.construct(id, host_api_version);
            if instance.state != ModuleState::Failed {
                let scoped_host = host.for_module(id);
                enable_instance(&mut instance, &scoped_host, regions);
            }
            self.instances.insert(id.clone(), instance);
        }
    }

    fn construct(&mut self, id: &str, host_api_version: &Version) -> ModuleInstance {
        let Some(candidate) = self.registry.get(id).cloned() else {
            let mut instance = ModuleInstance::new(ModuleMetadata::default(), Box::new(NullModule));
            instance.id = id.to_string();
            instance.mark_failed(FailureReason::Metadata(format!("module {id} not in registry")));
            return instance;
        };

        if let Err(ModuleError::VersionMismatch { expected, actual }) =
            check_api_compatibility(host_api_version, &candidate.api_version)
        {
            let mut instance =
                ModuleInstance::new(candidate.metadata.clone(), Box::new(NullModule));
            instance.mark_failed(FailureReason::Metadata(format!(
                "API version mismatch: host {expected}, module {actual}"
            )));
            return instance;
        }

        match construct(&candidate) {
            Ok(dynamic) => {
                let mut instance =
                    ModuleInstance::new(candidate.metadata.clone(), Box::new(dynamic));
                instance.state = ModuleState::Loading;
                instance
            }
            Err(e) => {
                let mut instance =
                    ModuleInstance::new(candidate.metadata.clone(), Box::new(NullModule));
                instance.mark_failed(FailureReason::Startup(e.to_string()));
                instance
            }
        }
    }

    /// Runs the disable sequence for `id`, if currently loaded.
    pub fn disable(&mut self, id: &str, host: &HostHandle, regions: &mut RegionRegistry) {
        if let Some(instance) = self.instances.get_mut(id) {
            let scoped_host = host.for_module(id);
            disable_instance(instance, &scoped_host, regions);
        }
    }

    /// Reconstructs and re-enables `id` from its candidate's current
    /// on-disk state, first running the disable sequence on whatever
    /// instance is currently loaded (if any).
    pub fn reload(
        &mut self,
        id: &str,
        host: &HostHandle,
        host_api_version: &Version,
        regions: &mut RegionRegistry,
    ) -> Result<(), LoaderError> {
        if self.registry.get(id).is_none() {
            return Err(LoaderError::UnknownModule(id.to_string()));
        }
        if self.instances.contains_key(id) {
            self.disable(id, host, regions);
        }
        let mut instance = self.construct(id, host_api_version);
        if instance.state != ModuleState::Failed {
            let scoped_host = host.for_module(id);
            enable_instance(&mut instance, &scoped_host, regions);
            if instance.state == ModuleState::Enabled {
                if let Err(e) = instance.module.on_reload(&host.for_module(id)) {
                    warn!("module {id} on_reload returned an error: {e}");
                }
            }
        }
        self.instances.insert(id.to_string(), instance);
        Ok(())
    }
}

/// Runs the full enable sequence for a constructed instance: `on_start`,
/// attach the declared main widget (if any) to its region, then
/// `on_enable`. A failure at any step marks the instance `Failed` with the
/// matching reason and does not proceed further.
pub fn enable_instance(instance: &mut ModuleInstance, host: &HostHandle, regions: &mut RegionRegistry) {
    if let Err(e) = instance.module.on_start(host) {
        instance.mark_failed(FailureReason::Startup(e.to_string()));
        return;
    }

    if let Some((widget, attach_mode)) = instance.module.main_widget() {
        let region_name = instance
            .metadata
            .container
            .clone()
            .unwrap_or_else(|| "background".to_string());
        if let Err(e) = regions.attach(
            &region_name,
            &instance.id,
            widget,
            attach_mode,
            instance.metadata.index,
        ) {
            instance.mark_failed(FailureReason::RegionAttach(e.to_string()));
            return;
        }
        instance.main_widget = Some((widget, attach_mode));
    }

    if let Err(e) = instance.module.on_enable(host) {
        instance.mark_failed(FailureReason::Startup(e.to_string()));
        return;
    }

    instance.state = ModuleState::Enabled;
    info!("module {} enabled", instance.id);
}

/// Runs the disable sequence: `on_disable`, unsubscribe every event handler
/// the module registered, cancel every thread/async task/timer the
/// scheduler tracked for it, detach its widget from every region, then mark
/// `Disabled`.
pub fn disable_instance(instance: &mut ModuleInstance, host: &HostHandle, regions: &mut RegionRegistry) {
    if let Err(e) = instance.module.on_disable(host) {
        warn!("module {} on_disable returned an error: {e}", instance.id);
    }
    host.events().unsubscribe_all(&instance.id);
    host.scheduler().cancel();
    regions.detach_all(&instance.id);
    instance.main_widget = None;
    instance.state = ModuleState::Disabled;
    info!("module {} disabled", instance.id);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(id: &str, deps: &[&str], priority: i32, index: i32) -> ModuleMetadata {
        ModuleMetadata {
            id: id.to_string(),
            deps: deps.iter().map(|s| s.to_string()).collect(),
            priority,
            index,
            ..ModuleMetadata::default()
        }
    }

    #[test]
    fn simple_chain_orders_dependencies_first() {
        let mut candidates = HashMap::new();
        candidates.insert("b".to_string(), meta("b", &["a"], 0, 0));
        candidates.insert("a".to_string(), meta("a", &[], 0, 0));
        let (order, missing, cyclic) = topological_order(&candidates);
        assert_eq!(order, vec!["a".to_string(), "b".to_string()]);
        assert!(missing.is_empty());
        assert!(cyclic.is_empty());
    }

    #[test]
    fn ties_broken_by_priority_then_index_then_id() {
        let mut candidates = HashMap::new();
        candidates.insert("c".to_string(), meta("c", &[], 1, 0));
        candidates.insert("b".to_string(), meta("b", &[], 0, 1));
        candidates.insert("a".to_string(), meta("a", &[], 0, 0));
        let (order, _, _) = topological_order(&candidates);
        assert_eq!(order, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }

    #[test]
    fn missing_dependency_is_reported() {
        let mut candidates = HashMap::new();
        candidates.insert("a".to_string(), meta("a", &["ghost"], 0, 0));
        let (order, missing, _) = topological_order(&candidates);
        assert_eq!(missing, vec!["a".to_string()]);
        assert!(order.contains(&"a".to_string()));
    }

    #[test]
    fn cycle_is_detected_and_excluded_from_order() {
        let mut candidates = HashMap::new();
        candidates.insert("a".to_string(), meta("a", &["b"], 0, 0));
        candidates.insert("b".to_string(), meta("b", &["a"], 0, 0));
        let (order, _, cyclic) = topological_order(&candidates);
        assert!(order.is_empty());
        let mut cyclic_sorted = cyclic.clone();
        cyclic_sorted.sort();
        assert_eq!(cyclic_sorted, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn diamond_dependency_orders_joins_after_both_branches() {
        let mut candidates = HashMap::new();
        candidates.insert("d".to_string(), meta("d", &["b", "c"], 0, 0));
        candidates.insert("b".to_string(), meta("b", &["a"], 0, 0));
        candidates.insert("c".to_string(), meta("c", &["a"], 0, 0));
        candidates.insert("a".to_string(), meta("a", &[], 0, 0));
        let (order, _, _) = topological_order(&candidates);
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
    }
}
