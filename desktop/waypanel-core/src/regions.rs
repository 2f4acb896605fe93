//! Panel Region Registry: named anchor points on panel surfaces that accept
//! module-provided UI fragments.
//!
//! Earlier panel code built concrete `gtk4` widgets directly; here the GUI
//! toolkit binding is treated as an external collaborator described
//! abstractly, so this module never
//! constructs or destroys a widget — it only tracks which opaque
//! [`WidgetHandle`] belongs to which region, in which order, and hands that
//! bookkeeping to the concrete UI layer (the `waypanel` host binary) to
//! realize.

use std::collections::HashMap;

use thiserror::Error;

use crate::module::AttachMode;

/// An opaque reference to a widget the concrete UI layer constructed. The
/// registry never looks inside it; it is a plain newtype over whatever
/// identifier the UI layer chooses (e.g. an index into its own widget
/// table, or a raw pointer it alone understands).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WidgetHandle(pub u64);

/// The closed set of panel region names. Anything else is a programmer
/// error in the calling module's metadata, not a runtime condition to
/// tolerate.
pub const REGION_NAMES: &[&str] = &[
    "top-panel",
    "top-panel-left",
    "top-panel-box-widgets-left",
    "top-panel-center",
    "top-panel-right",
    "top-panel-systray",
    "top-panel-after-systray",
    "bottom-panel",
    "bottom-panel-left",
    "bottom-panel-box-widgets-left",
    "bottom-panel-center",
    "bottom-panel-right",
    "bottom-panel-systray",
    "bottom-panel-after-systray",
    "left-panel-top",
    "left-panel-center",
    "left-panel-bottom",
    "right-panel-top",
    "right-panel-center",
    "right-panel-bottom",
    "background",
];

pub fn is_known_region(name: &str) -> bool {
    name == "background" || REGION_NAMES.contains(&name)
}

#[derive(Error, Debug)]
pub enum RegionError {
    #[error("unknown panel region: {0}")]
    UnknownRegion(String),

    #[error("region attach failed: {0}")]
    AttachFailed(String),
}

/// One child attached to a region: the owning module, the widget handle,
/// and the `index` used to order siblings.
#[derive(Debug, Clone)]
struct Child {
    module_id: String,
    widget: WidgetHandle,
    index: i32,
    /// Global insertion sequence number, the tie-break for equal `index`.
    seq: u64,
}

/// A named attachment point inside a panel surface. Not a widget itself —
/// a logical slot the UI layer realizes.
#[derive(Debug, Default)]
struct Region {
    children: Vec<Child>,
    /// Name of the overflow region to divert into when the UI layer decides
    /// this region's children no longer fit, if one was registered.
    overflow_target: Option<String>,
}

impl Region {
    fn insert(&mut self, child: Child) {
        let pos = self
            .children
            .partition_point(|c| (c.index, c.seq) <= (child.index, child.seq));
        self.children.insert(pos, child);
    }
}

/// Tracks every [`Region`] across every panel surface and mediates module
/// widget attachment.
///
/// Ordering inside a region is by `(index asc, insertion order)`, per the
/// spec's data model for `Region`.
pub struct RegionRegistry {
    regions: HashMap<String, Region>,
    next_seq: u64,
}

impl Default for RegionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionRegistry {
    pub fn new() -> Self {
        let mut regions = HashMap::new();
        for name in REGION_NAMES {
            regions.insert((*name).to_string(), Region::default());
        }
        Self {
            regions,
            next_seq: 0,
        }
    }

    /// Registers a dedicated overflow container for `region_name`. The
    /// registry itself never measures available space; it only remembers
    /// this target so the UI layer can divert a widget into it via
    /// `overflow_target` when the widget doesn't fit. Pass-through (no
    /// diversion) if never called.
    pub fn register_overflow(&mut self, region_name: &str, overflow_region: &str) {
        if let Some(region) = self.regions.get_mut(region_name) {
            region.overflow_target = Some(overflow_region.to_string());
        }
    }

    /// Inserts `widget` into `region_name`, ordered by `(index asc,
    /// insertion order)`. `attach_mode` is recorded only for the UI layer's
    /// benefit; the registry's own bookkeeping is attach-mode agnostic.
    pub fn attach(
        &mut self,
        region_name: &str,
        module_id: &str,
        widget: WidgetHandle,
        _attach_mode: AttachMode,
        index: i32,
    ) -> Result<(), RegionError> {
        if !is_known_region(region_name) {
            return Err(RegionError::UnknownRegion(region_name.to_string()));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let region = self
            .regions
            .get_mut(region_name)
            .ok_or_else(|| RegionError::UnknownRegion(region_name.to_string()))?;
        region.insert(Child {
            module_id: module_id.to_string(),
            widget,
            index,
            seq,
        });
        Ok(())
    }

    /// If `region_name` has a registered overflow container, returns it so
    /// the caller can divert; otherwise returns `None` (pass through).
    pub fn overflow_target(&self, region_name: &str) -> Option<&str> {
        self.regions
            .get(region_name)
            .and_then(|r| r.overflow_target.as_deref())
    }

    /// Removes every widget belonging to `module_id` from `region_name`.
    pub fn detach(&mut self, region_name: &str, module_id: &str) {
        if let Some(region) = self.regions.get_mut(region_name) {
            region.children.retain(|c| c.module_id != module_id);
        }
    }

    /// Removes every widget belonging to `module_id` across all regions,
    /// used when a module disables without the caller tracking which
    /// regions it attached to.
    pub fn detach_all(&mut self, module_id: &str) {
        for region in self.regions.values_mut() {
            region.children.retain(|c| c.module_id != module_id);
        }
    }

    /// Widget handles currently attached to `region_name`, in display
    /// order.
    pub fn children(&self, region_name: &str) -> Vec<WidgetHandle> {
        self.regions
            .get(region_name)
            .map(|r| r.children.iter().map(|c| c.widget).collect())
            .unwrap_or_default()
    }

    pub fn child_count(&self, region_name: &str) -> usize {
        self.regions.get(region_name).map_or(0, |r| r.children.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_rejects_unknown_region() {
        let mut registry = RegionRegistry::new();
        let err = registry
            .attach("not-a-region", "m", WidgetHandle(1), AttachMode::Append, 0)
            .unwrap_err();
        assert!(matches!(err, RegionError::UnknownRegion(_)));
    }

    #[test]
    fn ordering_by_index_then_insertion() {
        let mut registry = RegionRegistry::new();
        registry
            .attach("top-panel-left", "a", WidgetHandle(1), AttachMode::Append, 5)
            .unwrap();
        registry
            .attach("top-panel-left", "b", WidgetHandle(2), AttachMode::Append, 1)
            .unwrap();
        registry
            .attach("top-panel-left", "c", WidgetHandle(3), AttachMode::Append, 1)
            .unwrap();
        let children = registry.children("top-panel-left");
        assert_eq!(children, vec![WidgetHandle(2), WidgetHandle(3), WidgetHandle(1)]);
    }

    #[test]
    fn detach_removes_only_owning_module() {
        let mut registry = RegionRegistry::new();
        registry
            .attach("background", "a", WidgetHandle(1), AttachMode::Append, 0)
            .unwrap();
        registry
            .attach("background", "b", WidgetHandle(2), AttachMode::Append, 0)
            .unwrap();
        registry.detach("background", "a");
        assert_eq!(registry.children("background"), vec![WidgetHandle(2)]);
    }

    #[test]
    fn attach_detach_round_trip_restores_prior_state() {
        let mut registry = RegionRegistry::new();
        registry
            .attach("right-panel-top", "a", WidgetHandle(1), AttachMode::Append, 0)
            .unwrap();
        let before = registry.children("right-panel-top");
        registry
            .attach("right-panel-top", "b", WidgetHandle(2), AttachMode::Append, 0)
            .unwrap();
        registry.detach("right-panel-top", "b");
        assert_eq!(registry.children("right-panel-top"), before);
    }
}
