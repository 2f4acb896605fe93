//! File Watcher Service: directory-level `notify` watching with a 1s
//! debounce window, delivering a single coalesced event to the UI thread
//! per burst of filesystem activity.
//!
//! Watches whole directories rather than single files, since editors and
//! atomic-rename saves both produce filesystem events the target path
//! itself never sees directly. A generic path-set callback lets any
//! caller (config store, module sync service) reuse the same debounce.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

const DEBOUNCE_DURATION: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("failed to initialize watcher: {0}")]
    Init(String),

    #[error("failed to watch path {path:?}: {source}")]
    Watch { path: PathBuf, source: notify::Error },
}

/// Watches one or more directories and invokes `on_change` once per
/// debounce window with the set of paths that changed, coalesced across
/// the window rather than delivered per individual filesystem event.
pub struct FileWatcherService {
    _watcher: RecommendedWatcher,
}

impl FileWatcherService {
    /// Starts watching `dirs` recursively. `on_change` runs on whatever
    /// task polls the debounce loop; callers that need UI-thread delivery
    /// must hop there themselves (e.g. via the scheduler's
    /// `schedule_in_ui_thread`), since this service has no GTK-thread
    /// affinity of its own.
    pub fn start<F>(dirs: &[PathBuf], on_change: F) -> Result<Self, WatcherError>
    where
        F: FnMut(Vec<PathBuf>) + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |result: Result<Event, _>| {
            if let Ok(event) = result {
                let _ = tx.send(event);
            }
        })
        .map_err(|e| WatcherError::Init(e.to_string()))?;

        for dir in dirs {
            watcher
                .watch(dir, RecursiveMode::Recursive)
                .map_err(|source| WatcherError::Watch {
                    path: dir.clone(),
                    source,
                })?;
            info!("watching {dir:?} for changes");
        }

        tokio::spawn(run_debounced_event_loop(rx, on_change));

        Ok(Self { _watcher: watcher })
    }

    pub fn watch_one<F>(dir: &Path, on_change: F) -> Result<Self, WatcherError>
    where
        F: FnMut(Vec<PathBuf>) + Send + 'static,
    {
        Self::start(&[dir.to_path_buf()], on_change)
    }
}

fn should_reload(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

async fn run_debounced_event_loop<F>(mut rx: mpsc::UnboundedReceiver<Event>, mut on_change: F)
where
    F: FnMut(Vec<PathBuf>) + Send + 'static,
{
    let mut pending_paths: Vec<PathBuf> = Vec::new();
    let mut deadline: Option<Instant> = None;

    loop {
        let maybe_event = match deadline {
            Some(d) => tokio::select! {
                biased;
                event = rx.recv() => event,
                () = sleep_until(d) => None,
            },
            None => rx.recv().await,
        };

        match maybe_event {
            Some(event) if should_reload(&event) => {
                accumulate_paths(&mut pending_paths, event.paths);
                deadline = Some(Instant::now() + DEBOUNCE_DURATION);
            }
            Some(_) => {}
            None if deadline.is_some() => {
                debug!(?pending_paths, "debounce window elapsed, delivering change");
                let paths = std::mem::take(&mut pending_paths);
                on_change(paths);
                deadline = None;
            }
            None => break,
        }
    }
    warn!("file watcher event loop exited, sender dropped");
}

fn accumulate_paths(pending: &mut Vec<PathBuf>, new_paths: Vec<PathBuf>) {
    for path in new_paths {
        if !pending.contains(&path) {
            pending.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulate_paths_deduplicates() {
        let mut pending = vec![PathBuf::from("/a")];
        accumulate_paths(&mut pending, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        assert_eq!(pending, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
    }

    #[tokio::test]
    async fn start_on_missing_directory_errors() {
        let result =
            FileWatcherService::watch_one(Path::new("/does/not/exist/waypanel-test"), |_| {});
        assert!(result.is_err());
    }
}
