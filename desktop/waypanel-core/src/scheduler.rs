//! Scheduler: the three concurrency primitives modules use to get work off
//! the UI thread and back onto it, plus the per-module bookkeeping the
//! Loader needs to cancel everything a module started when it disables.
//!
//! Earlier module code ran arbitrary `tokio::spawn` calls ad hoc from
//! inside GTK callbacks. This module names and bounds that pattern into
//! three primitives: a plain OS thread for blocking work, an async task
//! for cooperative work, and a UI-thread callback queue a host event-loop
//! integration drains every iteration. Threads, tasks, and timers are
//! tracked per owning module so `cancel_module` can clean up everything a
//! module started when it disables: async tasks cancelled at their next
//! suspension point, threads signalled via a stop-flag and given up to 5s
//! to exit before being leaked with a warning, timers removed
//! synchronously.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle as TaskHandle;
use tracing::{error, warn};

type UiCallback = Box<dyn FnOnce() + Send>;

const THREAD_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Cooperative stop signal handed to a `run_in_thread` closure. Worker
/// threads are expected to poll this between units of work; the scheduler
/// cannot forcibly kill an OS thread.
#[derive(Clone)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct ThreadRecord {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

struct TimerRecord {
    stop: Arc<AtomicBool>,
}

/// Schedules blocking work on a dedicated OS thread, cooperative work on
/// the tokio runtime, and callbacks to run on the next UI-thread tick.
/// Shared across every module via cheap `Arc` clones; per-module tracking
/// is keyed by the module id passed to each spawning method.
#[derive(Clone)]
pub struct Scheduler {
    ui_queue: Arc<Mutex<Vec<UiCallback>>>,
    threads: Arc<Mutex<HashMap<String, Vec<ThreadRecord>>>>,
    tasks: Arc<Mutex<HashMap<String, Vec<TaskHandle<()>>>>>,
    timers: Arc<Mutex<HashMap<String, Vec<TimerRecord>>>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            ui_queue: Arc::new(Mutex::new(Vec::new())),
            threads: Arc::new(Mutex::new(HashMap::new())),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns a view of this scheduler bound to `module_id`, the handle
    /// every `HostHandle::scheduler()` call actually returns.
    pub fn for_module(&self, module_id: &str) -> ModuleScheduler {
        ModuleScheduler {
            scheduler: self.clone(),
            module_id: module_id.to_string(),
        }
    }

    /// Queues `f` to run on the UI thread the next time `drain_ui_queue`
    /// is called by the host's event-loop integration. This is the only
    /// safe way for background work to touch UI state.
    pub fn schedule_in_ui_thread<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.ui_queue.lock().push(Box::new(f));
    }

    /// Drains and runs every queued UI callback, in FIFO order. The host
    /// binary calls this once per iteration of its own GTK main loop
    /// integration (e.g. from a `glib::idle_add_local` tick).
    pub fn drain_ui_queue(&self) {
        let callbacks = std::mem::take(&mut *self.ui_queue.lock());
        for callback in callbacks {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback));
            if let Err(panic) = result {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("UI-thread callback panicked: {msg}");
            }
        }
    }

    pub fn pending_ui_callbacks(&self) -> usize {
        self.ui_queue.lock().len()
    }

    /// Cancels every thread, async task, and timer owned by `module_id`.
    /// Called by the Loader's disable sequence, after `on_disable` and
    /// before the instance is marked `Disabled`. Async tasks are aborted
    /// (cancelled at their next suspension point); threads are signalled
    /// and given up to 5s to exit before being leaked with a warning;
    /// timers are stopped synchronously.
    pub fn cancel_module(&self, module_id: &str) {
        if let Some(tasks) = self.tasks.lock().remove(module_id) {
            for task in tasks {
                task.abort();
            }
        }

        if let Some(timers) = self.timers.lock().remove(module_id) {
            for timer in timers {
                timer.stop.store(true, Ordering::SeqCst);
            }
        }

        if let Some(threads) = self.threads.lock().remove(module_id) {
            for mut record in threads {
                record.stop.store(true, Ordering::SeqCst);
                let Some(handle) = record.handle.take() else {
                    continue;
                };
                let (tx, rx) = std::sync::mpsc::channel();
                std::thread::spawn(move || {
                    let _ = handle.join();
                    let _ = tx.send(());
                });
                if rx.recv_timeout(THREAD_JOIN_TIMEOUT).is_err() {
                    warn!(
                        "thread owned by module '{module_id}' did not stop within {:?}, leaking it",
                        THREAD_JOIN_TIMEOUT
                    );
                }
            }
        }
    }
}

/// A `Scheduler` view bound to one module id; every spawn call registers
/// its handle under this module so a later `cancel_module` can find it.
/// This is what `HostHandle::scheduler()` returns.
pub struct ModuleScheduler {
    scheduler: Scheduler,
    module_id: String,
}

impl ModuleScheduler {
    /// Runs `f` on a dedicated OS thread, for blocking work (file I/O,
    /// subprocess waits) that would stall the async runtime. `f` receives a
    /// `StopFlag` it SHOULD poll between units of work; modules must not
    /// mutate shared state directly from here — only via
    /// `schedule_in_ui_thread`.
    pub fn run_in_thread<F>(&self, f: F)
    where
        F: FnOnce(StopFlag) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = StopFlag(stop.clone());
        let handle = std::thread::spawn(move || f(flag));
        self.scheduler
            .threads
            .lock()
            .entry(self.module_id.clone())
            .or_default()
            .push(ThreadRecord {
                stop,
                handle: Some(handle),
            });
    }

    /// Spawns `fut` on the tokio runtime, for cooperative async work.
    /// Cancelled at its next suspension point if the owning module
    /// disables before it completes.
    pub fn run_in_async_task<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        self.scheduler
            .tasks
            .lock()
            .entry(self.module_id.clone())
            .or_default()
            .push(handle);
    }

    /// Queues `f` to run on the UI thread. Equivalent to calling the
    /// untracked `Scheduler::schedule_in_ui_thread` directly; kept here so
    /// modules only ever reach through `host.scheduler()`.
    pub fn schedule_in_ui_thread<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.schedule_in_ui_thread(f);
    }

    /// Runs `f` on the UI thread every `interval`, until the owning module
    /// disables. Removed synchronously on disable (the next tick after
    /// cancellation is simply never enqueued).
    pub fn schedule_timer<F>(&self, interval: Duration, f: F)
    where
        F: FnMut() + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        self.scheduler
            .timers
            .lock()
            .entry(self.module_id.clone())
            .or_default()
            .push(TimerRecord { stop: stop.clone() });

        let ui_queue = self.scheduler.ui_queue.clone();
        let f = Arc::new(Mutex::new(f));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                let f = f.clone();
                ui_queue.lock().push(Box::new(move || {
                    (f.lock())();
                }));
            }
        });
    }

    /// Cancels every resource this module owns. Called by the Loader's
    /// disable sequence.
    pub fn cancel(&self) {
        self.scheduler.cancel_module(&self.module_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn ui_queue_runs_in_fifo_order() {
        let scheduler = Scheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        scheduler.schedule_in_ui_thread(move || o1.lock().push(1));
        let o2 = order.clone();
        scheduler.schedule_in_ui_thread(move || o2.lock().push(2));

        scheduler.drain_ui_queue();
        assert_eq!(*order.lock(), vec![1, 2]);
        assert_eq!(scheduler.pending_ui_callbacks(), 0);
    }

    #[test]
    fn ui_callback_panic_does_not_stop_subsequent_callbacks() {
        let scheduler = Scheduler::new();
        let ran = Arc::new(AtomicUsize::new(0));

        scheduler.schedule_in_ui_thread(|| panic!("boom"));
        let ran2 = ran.clone();
        scheduler.schedule_in_ui_thread(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });

        scheduler.drain_ui_queue();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_in_async_task_executes() {
        let scheduler = Scheduler::new();
        let done = Arc::new(Mutex::new(false));
        let d = done.clone();
        scheduler.for_module("m").run_in_async_task(async move {
            *d.lock() = true;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(*done.lock());
    }

    #[tokio::test]
    async fn cancel_module_aborts_its_async_tasks() {
        let scheduler = Scheduler::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        scheduler.for_module("m").run_in_async_task(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            r.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.cancel_module("m");
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_module_joins_cooperative_thread_promptly() {
        let scheduler = Scheduler::new();
        let module = scheduler.for_module("m");
        module.run_in_thread(|stop| {
            while !stop.is_stopped() {
                std::thread::sleep(Duration::from_millis(5));
            }
        });
        let start = std::time::Instant::now();
        scheduler.cancel_module("m");
        assert!(start.elapsed() < THREAD_JOIN_TIMEOUT);
    }

    #[test]
    fn cancel_module_stops_timer_delivery() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        scheduler
            .for_module("m")
            .schedule_timer(Duration::from_millis(5), move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        scheduler.cancel_module("m");
        // Timer's internal stop flag is set synchronously; no further UI
        // callbacks for it should be enqueued by the time we check.
        scheduler.drain_ui_queue();
        let after_cancel = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        scheduler.drain_ui_queue();
        assert_eq!(count.load(Ordering::SeqCst), after_cancel);
    }
}
