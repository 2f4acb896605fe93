//! Module Sync & Hot-Reload: mirrors external source folders into the
//! installed module directory, so modules can be developed in an
//! arbitrary checkout (e.g. `~/Git/waypanel-modules`) while the loader only
//! ever needs to read from the installed tree.
//!
//! Each configured source gets its own destination subfolder under the
//! mirror root. A rolling hash of file names, sizes, and mtimes (directory
//! mtimes excluded, since those change on every traversal and would defeat
//! the hash) decides whether a resync is needed; `.ignore_plugins` marks a
//! folder to skip entirely. The mirror is authoritative: a resync copies
//! and deletes to match the source exactly, then fires a single
//! notification rather than one per synced folder.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;

const IGNORE_MARKER: &str = ".ignore_plugins";
const EXCLUDED_DIR_NAMES: &[&str] = &[".git", "__pycache__", "examples"];
const STATE_FILE_NAME: &str = ".sync_state.json";

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sync state file error: {0}")]
    State(#[from] serde_json::Error),
}

/// Hashes a source folder's contents by file name, size, and mtime,
/// skipping any subtree marked with `.ignore_plugins` and never hashing
/// directory mtimes (directory entries contribute only their name to the
/// hash, so touching a directory without changing its files does not
/// trigger a resync).
fn hash_folder(root: &Path) -> u64 {
    let mut hasher = DefaultHasher::new();
    let mut entries: Vec<_> = WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| {
            if e.file_type().is_dir() {
                !e.path().join(IGNORE_MARKER).exists()
            } else {
                true
            }
        })
        .filter_map(|e| e.ok())
        .collect();
    entries.sort_by_key(|e| e.path().to_path_buf());

    for entry in entries {
        let entry_path = entry.path();
        let relative = entry_path.strip_prefix(root).unwrap_or(entry_path);
        if entry.file_type().is_dir() {
            relative.hash(&mut hasher);
            continue;
        }
        if let Ok(meta) = entry.metadata() {
            relative.hash(&mut hasher);
            meta.len().hash(&mut hasher);
            if let Ok(modified) = meta.modified() {
                modified.hash(&mut hasher);
            }
        }
    }
    hasher.finish()
}

fn valid_subdirs(source: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(source) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter(|e| !e.path().join(IGNORE_MARKER).exists())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| !EXCLUDED_DIR_NAMES.contains(&name.as_str()))
        .collect()
}

fn mirror_dir(src: &Path, dst: &Path) -> Result<(), SyncError> {
    std::fs::create_dir_all(dst)?;
    let mut seen = std::collections::HashSet::new();

    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        seen.insert(name.clone());
        let src_path = entry.path();
        let dst_path = dst.join(&name);
        if src_path.is_dir() {
            mirror_dir(&src_path, &dst_path)?;
        } else {
            std::fs::copy(&src_path, &dst_path)?;
        }
    }

    for entry in std::fs::read_dir(dst)? {
        let entry = entry?;
        if !seen.contains(&entry.file_name()) {
            let path = entry.path();
            if path.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }
    }
    Ok(())
}

/// Tracks the last-synced hash per source folder, so unchanged folders are
/// skipped on subsequent runs. Persisted as JSON under the mirror
/// destination so a process restart does not force a full resync of every
/// source that hasn't actually changed.
#[derive(Default, Serialize, Deserialize)]
pub struct SyncState {
    last_hash: std::collections::HashMap<String, u64>,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    fn state_path(dest_root: &Path) -> PathBuf {
        dest_root.join(STATE_FILE_NAME)
    }

    /// Loads the persisted hash table from `dest_root`. Starts fresh (full
    /// resync on the next `run_sync`) if no state file exists yet or it
    /// can't be read or parsed.
    pub fn load(dest_root: &Path) -> Self {
        let path = Self::state_path(dest_root);
        let Ok(contents) = std::fs::read_to_string(&path) else {
            return Self::default();
        };
        serde_json::from_str(&contents).unwrap_or_else(|e| {
            warn!("sync state file {path:?} is corrupt, starting fresh: {e}");
            Self::default()
        })
    }

    /// Writes the current hash table to `dest_root`.
    pub fn save(&self, dest_root: &Path) -> Result<(), SyncError> {
        let path = Self::state_path(dest_root);
        let contents = serde_json::to_string(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Mirrors every folder in `source_folders` into its own isolated
/// subdirectory of `dest_root`, named after the source folder's own
/// basename so two sources can never collide. Returns true if anything was
/// actually synced (the caller publishes the single post-sync
/// notification only when this is true).
pub fn run_sync(
    dest_root: &Path,
    source_folders: &[PathBuf],
    state: &mut SyncState,
    force: bool,
) -> Result<bool, SyncError> {
    std::fs::create_dir_all(dest_root)?;
    let mut synced_any = false;

    for folder in source_folders {
        if !folder.exists() {
            continue;
        }
        let current_hash = hash_folder(folder);
        let key = folder.to_string_lossy().to_string();
        let last = state.last_hash.get(&key).copied();

        if !force && last == Some(current_hash) {
            continue;
        }

        let folder_name = folder
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "source".to_string());
        let dest = dest_root.join(&folder_name);
        std::fs::create_dir_all(&dest)?;

        let subdirs = valid_subdirs(folder);
        for subdir in &subdirs {
            let src = folder.join(subdir);
            let dst = dest.join(subdir);
            if let Err(e) = mirror_dir(&src, &dst) {
                warn!("failed to mirror {src:?} into {dst:?}: {e}");
                continue;
            }
        }

        // Authoritative mirror: anything at `dest` not among the current
        // valid subdirs is stale and removed.
        if let Ok(entries) = std::fs::read_dir(&dest) {
            for entry in entries.filter_map(|e| e.ok()) {
                let name = entry.file_name().to_string_lossy().to_string();
                if !subdirs.contains(&name) {
                    let _ = std::fs::remove_dir_all(entry.path());
                }
            }
        }

        state.last_hash.insert(key, current_hash);
        synced_any = true;
        info!("synced module source {folder:?} into {dest:?}");
    }

    if synced_any {
        state.save(dest_root)?;
    }

    Ok(synced_any)
}

/// Wipes `dest_root` and the sync state entirely, forcing the next
/// `run_sync` call to do a full resync from scratch. Used when the
/// destination root has gone missing out from under the host.
pub fn reset_if_destination_missing(dest_root: &Path, state: &mut SyncState) -> Result<(), SyncError> {
    if !dest_root.exists() {
        std::fs::create_dir_all(dest_root)?;
        state.last_hash.clear();
        state.save(dest_root)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_file(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn sync_mirrors_valid_subdirectories() {
        let source = tempdir().unwrap();
        let dest = tempdir().unwrap();
        write_file(&source.path().join("clock/mod.so"), "binary");

        let mut state = SyncState::new();
        let synced = run_sync(dest.path(), &[source.path().to_path_buf()], &mut state, false)
            .unwrap();
        assert!(synced);

        let folder_name = source.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(dest.path().join(&folder_name).join("clock/mod.so").exists());
    }

    #[test]
    fn sync_skips_unchanged_folder_on_second_run() {
        let source = tempdir().unwrap();
        let dest = tempdir().unwrap();
        write_file(&source.path().join("clock/mod.so"), "binary");

        let mut state = SyncState::new();
        run_sync(dest.path(), &[source.path().to_path_buf()], &mut state, false).unwrap();
        let synced_again =
            run_sync(dest.path(), &[source.path().to_path_buf()], &mut state, false).unwrap();
        assert!(!synced_again);
    }

    #[test]
    fn state_survives_a_reloaded_process() {
        let source = tempdir().unwrap();
        let dest = tempdir().unwrap();
        write_file(&source.path().join("clock/mod.so"), "binary");

        let mut state = SyncState::new();
        run_sync(dest.path(), &[source.path().to_path_buf()], &mut state, false).unwrap();

        // Simulate a process restart: drop the in-memory state and reload
        // it from the file `run_sync` just persisted under `dest`.
        let mut reloaded = SyncState::load(dest.path());
        let synced_again =
            run_sync(dest.path(), &[source.path().to_path_buf()], &mut reloaded, false).unwrap();
        assert!(!synced_again);
    }

    #[test]
    fn load_with_no_state_file_starts_fresh() {
        let dest = tempdir().unwrap();
        let state = SyncState::load(dest.path());
        assert!(state.last_hash.is_empty());
    }

    #[test]
    fn ignore_marker_excludes_subdirectory() {
        let source = tempdir().unwrap();
        write_file(&source.path().join("wip/mod.so"), "binary");
        write_file(&source.path().join("wip/.ignore_plugins"), "");

        let subdirs = valid_subdirs(source.path());
        assert!(!subdirs.contains(&"wip".to_string()));
    }

    #[test]
    fn stale_destination_subdir_is_removed_on_resync() {
        let source = tempdir().unwrap();
        let dest = tempdir().unwrap();
        write_file(&source.path().join("clock/mod.so"), "v1");

        let mut state = SyncState::new();
        run_sync(dest.path(), &[source.path().to_path_buf()], &mut state, false).unwrap();

        std::fs::remove_dir_all(source.path().join("clock")).unwrap();
        write_file(&source.path().join("taskbar/mod.so"), "v1");
        run_sync(dest.path(), &[source.path().to_path_buf()], &mut state, true).unwrap();

        let folder_name = source.path().file_name().unwrap().to_string_lossy().to_string();
        let dest_folder = dest.path().join(&folder_name);
        assert!(!dest_folder.join("clock").exists());
        assert!(dest_folder.join("taskbar/mod.so").exists());
    }
}
