//! Module Registry & Metadata: scans the fixed module-root directories for
//! candidate shared libraries, extracting `ModuleMetadata` via the cheap,
//! side-effect-free half of the two-phase discovery contract without
//! constructing anything.
//!
//! Uses `WalkDir` over search paths with first-found-wins on name
//! collision, and keeps metadata extraction and construction as separate
//! calls rather than a single-pass load that does both at once.

use std::collections::HashMap;
use std::ffi::CStr;
use std::path::{Path, PathBuf};

use libloading::{Library, Symbol};
use semver::Version;
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::module::{ModuleApiVersionFn, ModuleMetadata, ModuleMetadataFn};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("failed to load library {path:?}: {source}")]
    LibraryLoad {
        path: PathBuf,
        source: libloading::Error,
    },

    #[error("missing symbol {symbol} in {path:?}: {source}")]
    MissingSymbol {
        path: PathBuf,
        symbol: &'static str,
        source: libloading::Error,
    },

    #[error("invalid API version string in {0:?}")]
    InvalidApiVersion(PathBuf),
}

fn module_file_extension() -> &'static str {
    if cfg!(target_os = "windows") {
        "dll"
    } else if cfg!(target_os = "macos") {
        "dylib"
    } else {
        "so"
    }
}

/// A discovered module source: the shared library path plus the metadata
/// extracted from it without constructing a module instance.
#[derive(Debug, Clone)]
pub struct ModuleCandidate {
    pub path: PathBuf,
    pub metadata: ModuleMetadata,
    pub api_version: Version,
}

/// Extracts `ModuleMetadata` and the declared API version from a candidate
/// library without invoking its factory. Safety: the symbols are trusted to
/// match the `declare_module!` ABI; a module that lies about its own
/// exports can still crash the host; that tradeoff is accepted for native
/// module libraries.
fn probe_library(path: &Path) -> Result<ModuleCandidate, RegistryError> {
    let library = unsafe {
        Library::new(path).map_err(|source| RegistryError::LibraryLoad {
            path: path.to_path_buf(),
            source,
        })?
    };

    let api_version_fn: Symbol<ModuleApiVersionFn> = unsafe {
        library
            .get(b"_waypanel_module_api_version\0")
            .map_err(|source| RegistryError::MissingSymbol {
                path: path.to_path_buf(),
                symbol: "_waypanel_module_api_version",
                source,
            })?
    };
    let version_ptr = unsafe { api_version_fn() };
    let version_str = unsafe { CStr::from_ptr(version_ptr) }
        .to_str()
        .map_err(|_| RegistryError::InvalidApiVersion(path.to_path_buf()))?;
    let api_version = Version::parse(version_str)
        .map_err(|_| RegistryError::InvalidApiVersion(path.to_path_buf()))?;

    let metadata_fn: Symbol<ModuleMetadataFn> = unsafe {
        library
            .get(b"_waypanel_module_metadata\0")
            .map_err(|source| RegistryError::MissingSymbol {
                path: path.to_path_buf(),
                symbol: "_waypanel_module_metadata",
                source,
            })?
    };
    let metadata_ptr = unsafe { metadata_fn() };
    let metadata = unsafe { *Box::from_raw(metadata_ptr) };

    // The library is dropped here deliberately: probing only needs the two
    // exported metadata symbols, never the factory, so the handle does not
    // need to outlive this function. The loader reopens the library when it
    // actually constructs the module.
    drop(library);

    Ok(ModuleCandidate {
        path: path.to_path_buf(),
        metadata,
        api_version,
    })
}

/// Returns the fixed module-root search order: user data path first, then
/// system data paths, then the in-tree bundled set (a `modules/` directory
/// relative to the current working directory, for development builds that
/// have not been installed).
pub fn default_module_roots(data_search_paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut roots: Vec<PathBuf> = data_search_paths
        .iter()
        .map(|p| p.join("modules"))
        .collect();
    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd.join("modules"));
    }
    roots
}

/// Indexes module candidates by id across the search roots, in order.
/// The first root to yield a given id wins; a later root redeclaring the
/// same id is logged and skipped.
#[derive(Default)]
pub struct ModuleRegistry {
    candidates: HashMap<String, ModuleCandidate>,
    /// Insertion order, preserved for discovery-order-dependent callers
    /// (not load order, which the dependency resolver controls).
    order: Vec<String>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scans every root in order, probing every file with the
    /// platform's shared-library extension at depth 1 (modules are not
    /// expected to nest further than `<root>/<file>.so`).
    pub fn scan(&mut self, roots: &[PathBuf]) {
        let extension = module_file_extension();
        for root in roots {
            if !root.exists() {
                continue;
            }
            for entry in WalkDir::new(root)
                .max_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(extension) {
                    continue;
                }
                match probe_library(path) {
                    Ok(candidate) => self.insert(candidate),
                    Err(e) => warn!("skipping module candidate {path:?}: {e}"),
                }
            }
        }
    }

    fn insert(&mut self, candidate: ModuleCandidate) {
        let id = candidate.metadata.id.clone();
        if id.is_empty() {
            warn!("module at {:?} declares an empty id, skipping", candidate.path);
            return;
        }
        if self.candidates.contains_key(&id) {
            debug!(
                "duplicate module id '{id}' at {:?}, keeping first discovered",
                candidate.path
            );
            return;
        }
        self.order.push(id.clone());
        self.candidates.insert(id, candidate);
    }

    pub fn get(&self, id: &str) -> Option<&ModuleCandidate> {
        self.candidates.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleCandidate> {
        self.order.iter().filter_map(|id| self.candidates.get(id))
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleMetadata;

    fn candidate(id: &str, path: &str) -> ModuleCandidate {
        ModuleCandidate {
            path: PathBuf::from(path),
            metadata: ModuleMetadata {
                id: id.to_string(),
                ..ModuleMetadata::default()
            },
            api_version: Version::new(1, 0, 0),
        }
    }

    #[test]
    fn first_discovered_wins_on_duplicate_id() {
        let mut registry = ModuleRegistry::new();
        registry.insert(candidate("clock", "/a/clock.so"));
        registry.insert(candidate("clock", "/b/clock.so"));
        assert_eq!(registry.get("clock").unwrap().path, PathBuf::from("/a/clock.so"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn empty_id_is_skipped() {
        let mut registry = ModuleRegistry::new();
        registry.insert(candidate("", "/a/bad.so"));
        assert!(registry.is_empty());
    }

    #[test]
    fn iter_preserves_discovery_order() {
        let mut registry = ModuleRegistry::new();
        registry.insert(candidate("b", "/b.so"));
        registry.insert(candidate("a", "/a.so"));
        let ids: Vec<_> = registry.iter().map(|c| c.metadata.id.clone()).collect();
        assert_eq!(ids, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn default_module_roots_includes_modules_suffix() {
        let roots = default_module_roots(&[PathBuf::from("/home/u/.local/share/waypanel")]);
        assert!(roots.contains(&PathBuf::from("/home/u/.local/share/waypanel/modules")));
    }
}
