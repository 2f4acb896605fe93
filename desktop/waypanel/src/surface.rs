//! Concrete GTK4/layer-shell realization of `PanelSurface` and the Panel
//! Region Registry's named containers.
//!
//! `waypanel_core::RegionRegistry` only tracks which opaque `WidgetHandle`
//! belongs to which named region, in which order; this module is the UI
//! layer that owns the actual `gtk4::Widget`s and maps the registry's
//! bookkeeping onto real containers, per edge.

use std::collections::HashMap;
use std::sync::Arc;

use gtk4::gio::prelude::*;
use gtk4::prelude::*;
use gtk4::Orientation;
use gtk4_layer_shell::{Edge, Layer, LayerShell};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, warn};

use waypanel_core::ipc::IpcClient;
use waypanel_core::{ConfigFacade, RegionRegistry, WidgetHandle};

#[derive(Clone, Copy, PartialEq, Eq)]
enum EdgeKind {
    Top,
    Bottom,
    Left,
    Right,
}

const ALL_EDGES: [EdgeKind; 4] = [EdgeKind::Top, EdgeKind::Bottom, EdgeKind::Left, EdgeKind::Right];

impl EdgeKind {
    fn config_key(self) -> &'static str {
        match self {
            Self::Top => "top",
            Self::Bottom => "bottom",
            Self::Left => "left",
            Self::Right => "right",
        }
    }

    fn anchors(self) -> &'static [Edge] {
        match self {
            Self::Top => &[Edge::Top, Edge::Left, Edge::Right],
            Self::Bottom => &[Edge::Bottom, Edge::Left, Edge::Right],
            Self::Left => &[Edge::Left, Edge::Top, Edge::Bottom],
            Self::Right => &[Edge::Right, Edge::Top, Edge::Bottom],
        }
    }

    fn orientation(self) -> Orientation {
        match self {
            Self::Top | Self::Bottom => Orientation::Horizontal,
            Self::Left | Self::Right => Orientation::Vertical,
        }
    }

    fn default_size(self) -> i64 {
        match self {
            Self::Top | Self::Bottom => 32,
            Self::Left | Self::Right => 48,
        }
    }

    /// The closed region names this edge owns, in display order within the
    /// surface's root box.
    fn region_names(self) -> &'static [&'static str] {
        match self {
            Self::Top => &[
                "top-panel-left",
                "top-panel-box-widgets-left",
                "top-panel-center",
                "top-panel-right",
                "top-panel-systray",
                "top-panel-after-systray",
            ],
            Self::Bottom => &[
                "bottom-panel-left",
                "bottom-panel-box-widgets-left",
                "bottom-panel-center",
                "bottom-panel-right",
                "bottom-panel-systray",
                "bottom-panel-after-systray",
            ],
            Self::Left => &["left-panel-top", "left-panel-center", "left-panel-bottom"],
            Self::Right => &["right-panel-top", "right-panel-center", "right-panel-bottom"],
        }
    }
}

struct EdgeSurface {
    window: gtk4::ApplicationWindow,
    region_boxes: HashMap<&'static str, gtk4::Box>,
}

/// Owns one `gtk4::ApplicationWindow` per enabled edge and the mapping from
/// `WidgetHandle` to the real `gtk4::Widget` a module built. Cheap to
/// clone: everything inside is shared.
#[derive(Clone)]
pub struct PanelSurfaces {
    edges: Arc<Mutex<HashMap<&'static str, EdgeSurface>>>,
    widgets: Arc<Mutex<HashMap<WidgetHandle, gtk4::Widget>>>,
    ipc: Arc<IpcClient>,
}

// GTK widgets are not `Send` in general, but the one-UI-thread concurrency
// model guarantees every `PanelSurfaces` access happens on the
// thread that owns the GTK main loop. This only needs to be `Send` at all
// so a clone can be captured by an `EventBus::subscribe` closure, whose
// `Send` bound exists for handlers registered from worker threads, not for
// this one; dispatch itself is always performed by `publish` on the UI
// thread.
unsafe impl Send for PanelSurfaces {}

impl PanelSurfaces {
    /// Builds one edge-anchored, layer-shell window per `panels.{edge}`
    /// entry in config whose `enabled` field is true (default true for top,
    /// false for the others, matching a single-bar-by-default panel).
    /// Registers a settings hint for every field it reads so control-center
    /// tooling can discover them.
    pub fn build(app: &gtk4::Application, config: &ConfigFacade, ipc: Arc<IpcClient>) -> Self {
        let mut edges = HashMap::new();

        for kind in ALL_EDGES {
            let key = kind.config_key();
            let default_enabled = matches!(kind, EdgeKind::Top);
            let enabled = config
                .add_hint(
                    &format!("panels.{key}.enabled"),
                    Value::Bool(default_enabled),
                    "whether this panel edge is shown",
                )
                .as_bool()
                .unwrap_or(default_enabled);
            if !enabled {
                continue;
            }

            let size = config
                .add_hint(
                    &format!("panels.{key}.size"),
                    Value::from(kind.default_size()),
                    "panel thickness in pixels",
                )
                .as_i64()
                .unwrap_or(kind.default_size()) as i32;

            let exclusive = config
                .add_hint(
                    &format!("panels.{key}.exclusive"),
                    Value::Bool(true),
                    "reserve compositor output space for this panel",
                )
                .as_bool()
                .unwrap_or(true);

            let window = gtk4::ApplicationWindow::builder()
                .application(app)
                .title(format!("waypanel-{key}"))
                .build();

            window.init_layer_shell();
            window.set_layer(Layer::Top);
            if exclusive {
                window.auto_exclusive_zone_enable();
            }
            for edge in kind.anchors() {
                window.set_anchor(*edge, true);
            }
            match kind {
                EdgeKind::Top | EdgeKind::Bottom => window.set_height_request(size),
                EdgeKind::Left | EdgeKind::Right => window.set_width_request(size),
            }
            window.add_css_class("waypanel-surface");

            let root = gtk4::Box::new(kind.orientation(), 0);
            window.set_child(Some(&root));

            let mut region_boxes = HashMap::new();
            for name in kind.region_names() {
                let container = gtk4::Box::new(kind.orientation(), 4);
                container.set_hexpand(matches!(kind.orientation(), Orientation::Horizontal));
                root.append(&container);
                region_boxes.insert(*name, container);
            }

            window.present();
            edges.insert(key, EdgeSurface { window, region_boxes });
        }

        Self {
            edges: Arc::new(Mutex::new(edges)),
            widgets: Arc::new(Mutex::new(HashMap::new())),
            ipc,
        }
    }

    /// Records the real widget a module built behind its opaque handle.
    /// Must be called before `realize_all` observes the corresponding
    /// `RegionRegistry::attach` for it to be placed.
    pub fn register_widget(&self, handle: WidgetHandle, widget: gtk4::Widget) {
        self.widgets.lock().insert(handle, widget);
    }

    /// Walks every region this process owns a container for and appends the
    /// registered widget behind each attached handle, in registry order.
    /// A handle with no registered widget is logged and skipped rather than
    /// treated as fatal, since a module may declare a container without
    /// building UI in this particular build (e.g. compiled out).
    pub fn realize_all(&self, regions: &RegionRegistry) {
        let edges = self.edges.lock();
        let widgets = self.widgets.lock();
        for surface in edges.values() {
            for (name, container) in &surface.region_boxes {
                for handle in regions.children(name) {
                    match widgets.get(&handle) {
                        Some(widget) => container.append(widget),
                        None => {
                            warn!("region {name} has widget handle {handle:?} with no GTK widget registered")
                        }
                    }
                }
            }
        }
    }

    /// Whether the compositor reports a fullscreen view on `output`, the
    /// migration-defer condition. Awaits the IPC round trip directly;
    /// callers must drive this from `run_in_async_task`, never block a UI
    /// callback on it.
    pub async fn has_fullscreen_view(&self, output: &str) -> bool {
        let views = match self.ipc.list_views().await {
            Ok(v) => v,
            Err(e) => {
                warn!("list_views failed while checking for a fullscreen view: {e}");
                return false;
            }
        };
        views
            .as_array()
            .map(|list| {
                list.iter().any(|v| {
                    v.get("output").and_then(Value::as_str) == Some(output)
                        && v.get("fullscreen").and_then(Value::as_bool).unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }

    /// Moves every panel surface's layer-shell window onto the monitor
    /// backing `output`. A no-op per-window if no `gdk::Monitor` with a
    /// matching connector name is found (output just went away mid-churn).
    pub fn migrate_to_output(&self, output: &str) {
        let Some(display) = gtk4::gdk::Display::default() else {
            warn!("no default GDK display, cannot migrate panel surfaces");
            return;
        };
        let monitors = display.monitors();
        let target = (0..monitors.n_items()).find_map(|i| {
            monitors
                .item(i)
                .and_downcast::<gtk4::gdk::Monitor>()
                .filter(|m| m.connector().as_deref() == Some(output))
        });
        let Some(monitor) = target else {
            warn!("no monitor with connector {output} found, deferring migration");
            return;
        };
        info!("migrating panel surfaces to output {output}");
        for surface in self.edges.lock().values() {
            surface.window.set_monitor(&monitor);
        }
    }
}
