//! Waypanel host application.
//!
//! Owns the GTK4/libadwaita process, builds one `PanelSurface` per enabled
//! edge from config, and orchestrates the GTK-free module runtime in
//! `waypanel_core`: config store, event bus, compositor IPC client, module
//! registry/loader, panel region registry, file watcher, and local IPC
//! server. Everything here is the concrete UI layer the core crate treats
//! abstractly through `WidgetHandle`.

mod output;
mod surface;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use fs2::FileExt;
use gtk4::prelude::*;
use gtk4::{gdk, gio, glib, Application, CssProvider};
use libadwaita as adw;
use parking_lot::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use waypanel_core::{
    ipc::default_socket_path,
    ipc_server::{IpcServer, ModuleSnapshot},
    ConfigFacade, ConfigStore, EventBus, FileWatcherService, HostHandle, IpcClient, ModuleLoader,
    ModuleRef, ModuleRegistry, RegionRegistry,
};

use output::OutputResolver;
use surface::PanelSurfaces;

const APP_ID: &str = "org.waypanel.Panel";
const LOCK_FILE_NAME: &str = "waypanel.lock";

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting waypanel v{}", env!("CARGO_PKG_VERSION"));

    // A second panel instance competing for the same compositor socket and
    // panel surfaces would just fight the first one over layer-shell
    // anchors; refuse to start rather than leave two panels flickering.
    let _lock = acquire_instance_lock().context("another waypanel instance is already running")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;
    let _runtime_guard = runtime.enter();

    let host = build_host().context("failed to assemble the module runtime")?;
    run_gtk(host)
}

/// Everything the UI layer needs to drive the module runtime, assembled
/// once at startup and handed into the GTK callbacks by clone.
#[derive(Clone)]
struct RuntimeHost {
    config: ConfigFacade,
    store: Arc<RwLock<ConfigStore>>,
    events: Arc<EventBus>,
    ipc: Arc<IpcClient>,
    regions: Arc<RwLock<RegionRegistry>>,
    scheduler: waypanel_core::Scheduler,
    modules: Arc<RwLock<Vec<ModuleRef>>>,
    loader: Arc<RwLock<ModuleLoader>>,
    // tokio's Mutex, not parking_lot's: `OutputResolver::resolve` is async
    // and awaits the IPC client from inside the guarded section, and only
    // a lock built for holding across an await is safe to do that with.
    output: Arc<tokio::sync::Mutex<OutputResolver>>,
}

fn build_host() -> Result<RuntimeHost> {
    let store = ConfigStore::load().context("loading config.toml")?;
    let resolver = store.path_resolver().clone();
    let store = Arc::new(RwLock::new(store));
    let config = ConfigFacade::new(store.clone());

    let events = Arc::new(EventBus::new());

    let socket_path = default_socket_path().unwrap_or_else(|| {
        warn!("no WAYFIRE_SOCKET or SWAYSOCK in the environment, IPC client will retry forever");
        String::new()
    });
    let ipc = Arc::new(IpcClient::new(socket_path, events.clone()));
    ipc.spawn();

    let regions = Arc::new(RwLock::new(RegionRegistry::new()));
    let scheduler = waypanel_core::Scheduler::new();
    let modules: Arc<RwLock<Vec<ModuleRef>>> = Arc::new(RwLock::new(Vec::new()));

    let mut registry = ModuleRegistry::new();
    let roots = waypanel_core::registry::default_module_roots(&resolver.data_search_paths());
    registry.scan(&roots);
    let loader = Arc::new(RwLock::new(ModuleLoader::new(registry)));

    let output = Arc::new(tokio::sync::Mutex::new(OutputResolver::new(
        config.clone(),
        ipc.clone(),
    )));

    start_ipc_server(store.clone(), loader.clone());
    start_config_watcher(resolver.config_dir(), store.clone(), events.clone());

    Ok(RuntimeHost {
        config,
        store,
        events,
        ipc,
        regions,
        scheduler,
        modules,
        loader,
        output,
    })
}

/// Spawns the local introspection IPC server (`$XDG_RUNTIME_DIR/waypanel/ipc.sock`)
/// as a background task; it runs for the process lifetime and is never
/// explicitly stopped, matching the original dev-IPC plugin's lifecycle.
fn start_ipc_server(store: Arc<RwLock<ConfigStore>>, loader: Arc<RwLock<ModuleLoader>>) {
    let snapshots: Arc<RwLock<Vec<ModuleSnapshot>>> = Arc::new(RwLock::new(Vec::new()));
    {
        let snapshots = snapshots.clone();
        let mut initial = snapshots.write();
        initial.extend(loader.read().instances().map(|i| ModuleSnapshot {
            id: i.id.clone(),
            state: i.state,
        }));
    }
    let server = Arc::new(IpcServer::new(store, snapshots));
    tokio::spawn(async move {
        if let Err(e) = server.serve().await {
            error!("local IPC server stopped: {e}");
        }
    });
}

/// Watches the config directory and reloads `ConfigStore` on change.
/// `notify` only reports the directory, so any write inside it (including
/// the atomic-rename temp file churn from our own `save()`) triggers a
/// reload; a stale `config-reloaded` caused by our own save is harmless,
/// since reload is idempotent against unchanged content.
fn start_config_watcher(config_dir: PathBuf, store: Arc<RwLock<ConfigStore>>, events: Arc<EventBus>) {
    let watch_dir = config_dir.clone();
    match FileWatcherService::watch_one(&watch_dir, move |paths| {
        info!("config directory changed ({} paths), reloading", paths.len());
        let mut store = store.write();
        if let Err(e) = store.reload(&events) {
            warn!("config reload failed: {e}");
        }
    }) {
        Ok(service) => {
            // Leaked deliberately: the watcher must outlive this function and
            // there is no natural owner for it besides the process itself.
            std::mem::forget(service);
        }
        Err(e) => error!("could not watch config directory {config_dir:?}: {e}"),
    }
}

/// Takes an exclusive advisory lock on a file under the runtime directory so
/// a second `waypanel` process refuses to start instead of fighting the
/// first one over panel surfaces and the compositor socket.
fn acquire_instance_lock() -> Result<std::fs::File> {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| "/tmp".to_string());
    let dir = PathBuf::from(runtime_dir).join("waypanel");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(LOCK_FILE_NAME);
    let file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)?;
    file.try_lock_exclusive()
        .with_context(|| format!("could not lock {path:?}"))?;
    Ok(file)
}

fn run_gtk(host: RuntimeHost) -> Result<()> {
    let app = Application::builder()
        .application_id(APP_ID)
        .flags(gio::ApplicationFlags::FLAGS_NONE)
        .build();

    let startup_host = host.clone();
    app.connect_startup(move |_app| {
        adw::init().expect("failed to initialize libadwaita");
        load_css();
        subscribe_compositor_lifecycle(&startup_host);
    });

    let activate_host = host.clone();
    app.connect_activate(move |app| {
        info!("activating waypanel");
        let surfaces = PanelSurfaces::build(app, &activate_host.config, activate_host.ipc.clone());
        load_modules(&activate_host, &surfaces);
        drain_ui_queue_periodically(activate_host.scheduler.clone());
        watch_output_layout(activate_host.clone(), surfaces);
    });

    let args: Vec<String> = std::env::args().collect();
    let exit_code = app.run_with_args(&args);
    info!("waypanel exiting with code {:?}", exit_code);
    Ok(())
}

fn load_modules(host: &RuntimeHost, surfaces: &PanelSurfaces) {
    let host_handle = HostHandle::new(
        "host",
        host.config.clone(),
        host.events.clone(),
        host.ipc.clone(),
        host.regions.clone(),
        host.scheduler.clone(),
        host.modules.clone(),
    );

    let mut loader = host.loader.write();
    let mut regions = host.regions.write();
    loader.load_all(&host_handle, &waypanel_core::host_api_version(), &mut regions);
    drop(regions);

    let mut refs = host.modules.write();
    refs.clear();
    refs.extend(loader.instances().map(|i| ModuleRef {
        id: i.id.clone(),
        state: i.state,
    }));
    drop(refs);
    drop(loader);

    surfaces.realize_all(&host.regions.read());
}

/// Marks the IPC client's connectivity state in the event bus so modules
/// can react to `compositor-disconnected`/`compositor-connected` without
/// polling, and so the host can render a diagnostic banner while degraded.
/// Relies on the same event bus the IPC client publishes reconnection state
/// to; this subscription only logs, the degraded UI affordance lives in
/// `surface::PanelSurfaces`.
fn subscribe_compositor_lifecycle(host: &RuntimeHost) {
    host.events.subscribe("compositor-disconnected", "host", |_| {
        warn!("compositor connection lost, running in degraded mode");
    });
    host.events.subscribe("compositor-connected", "host", |_| {
        info!("compositor connection (re)established");
    });
}

/// Drains the scheduler's UI-thread callback queue on a GTK idle timeout.
/// This is the bridge between the cooperative executor's worker-thread and
/// async-task callbacks and the single UI thread every widget mutation must
/// happen on.
fn drain_ui_queue_periodically(scheduler: waypanel_core::Scheduler) {
    glib::timeout_add_local(std::time::Duration::from_millis(16), move || {
        scheduler.drain_ui_queue();
        glib::ControlFlow::Continue
    });
}

/// Reacts to `output-layout-changed` with a 100ms debounce and a
/// fullscreen-defer rule, migrating panel surfaces to the resolved
/// primary output.
///
/// The resolution itself calls out to the compositor twice (`list_outputs`
/// then, if a candidate output was found, `list_views` for the fullscreen
/// check), so it runs on the async executor via `run_in_async_task` rather
/// than inline in this UI-thread timeout — blocking here would freeze the
/// whole panel for up to the IPC request timeout whenever the compositor is
/// slow or unreachable. Only the final migrate/defer/warn decision, which
/// touches GTK widgets, is handed back to the UI thread.
fn watch_output_layout(host: RuntimeHost, surfaces: PanelSurfaces) {
    host.events.subscribe("output-layout-changed", "host", move |_payload| {
        let output = host.output.clone();
        let surfaces = surfaces.clone();
        let scheduler = host.scheduler.clone();
        glib::timeout_add_local_once(std::time::Duration::from_millis(100), move || {
            let output = output.clone();
            let surfaces = surfaces.clone();
            let ui_scheduler = scheduler.clone();
            scheduler.for_module("host").run_in_async_task(async move {
                let resolved = output.lock().await.resolve().await;
                match resolved {
                    Some(target) if !surfaces.has_fullscreen_view(&target).await => {
                        ui_scheduler.schedule_in_ui_thread(move || {
                            surfaces.migrate_to_output(&target);
                        });
                    }
                    Some(target) => {
                        ui_scheduler.schedule_in_ui_thread(move || {
                            info!(
                                "deferring output migration to {target}: fullscreen view present"
                            );
                        });
                    }
                    None => {
                        ui_scheduler.schedule_in_ui_thread(|| {
                            warn!("no usable output to migrate panel surfaces to");
                        });
                    }
                }
            });
        });
    });
}

fn load_css() {
    let provider = CssProvider::new();
    let css = r#"
        .waypanel-surface {
            background-color: alpha(@window_bg_color, 0.85);
        }

        .waypanel-surface.degraded {
            border: 1px solid alpha(@error_bg_color, 0.6);
        }
    "#;
    provider.load_from_string(css);

    if let Some(display) = gdk::Display::default() {
        gtk4::style_context_add_provider_for_display(
            &display,
            &provider,
            gtk4::STYLE_PROVIDER_PRIORITY_APPLICATION,
        );
    } else {
        error!("no default display available, panel CSS not installed");
    }
}
