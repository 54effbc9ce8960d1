//! DOM geometry entropy reduction
//!
//! Every rectangle field is rounded to 0.5px steps. Non-random and
//! always the same for a given layout, so sub-pixel rendering differences
//! between machines stop being observable.

use smallvec::SmallVec;

use super::{quantize_half, FnIdentity, MitigationCtx, Mitigator, PageSurfaces, SurfaceId};

/// A client rectangle
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
    pub left: f64,
}

impl Rect {
    /// Build from position and size, deriving the edge fields
    pub fn from_origin_size(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
            top: y,
            right: x + width,
            bottom: y + height,
            left: x,
        }
    }

    /// All eight fields rounded to 0.5px
    pub fn quantized(&self) -> Self {
        Self {
            x: quantize_half(self.x),
            y: quantize_half(self.y),
            width: quantize_half(self.width),
            height: quantize_half(self.height),
            top: quantize_half(self.top),
            right: quantize_half(self.right),
            bottom: quantize_half(self.bottom),
            left: quantize_half(self.left),
        }
    }
}

/// Bounded scratch for typical fragment counts
pub type RectList = SmallVec<[Rect; 4]>;

/// The layout-measurement capability, keyed by an element handle
pub trait LayoutSurface: Send + Sync {
    fn bounding_rect(&self, element: &str) -> Rect;
    fn client_rects(&self, element: &str) -> RectList;
    fn identity(&self) -> &FnIdentity;
}

/// Reference native layout over a fixed element map
pub struct StaticLayout {
    elements: std::collections::HashMap<String, RectList>,
    id: FnIdentity,
}

impl StaticLayout {
    pub fn new() -> Self {
        Self {
            elements: std::collections::HashMap::new(),
            id: FnIdentity::native("getBoundingClientRect", 0),
        }
    }

    pub fn with_element(mut self, name: &str, rects: impl IntoIterator<Item = Rect>) -> Self {
        self.elements
            .insert(name.to_string(), rects.into_iter().collect());
        self
    }
}

impl Default for StaticLayout {
    fn default() -> Self {
        Self::new()
    }
}

impl LayoutSurface for StaticLayout {
    fn bounding_rect(&self, element: &str) -> Rect {
        self.elements
            .get(element)
            .and_then(|rects| rects.first().copied())
            .unwrap_or_default()
    }

    fn client_rects(&self, element: &str) -> RectList {
        self.elements.get(element).cloned().unwrap_or_default()
    }

    fn identity(&self) -> &FnIdentity {
        &self.id
    }
}

/// Decorator snapping every returned rect to the 0.5px grid
pub struct SnappedLayout {
    native: Box<dyn LayoutSurface>,
}

impl SnappedLayout {
    pub fn wrap(native: Box<dyn LayoutSurface>) -> Self {
        Self { native }
    }
}

impl LayoutSurface for SnappedLayout {
    fn bounding_rect(&self, element: &str) -> Rect {
        self.native.bounding_rect(element).quantized()
    }

    fn client_rects(&self, element: &str) -> RectList {
        self.native
            .client_rects(element)
            .into_iter()
            .map(|r| r.quantized())
            .collect()
    }

    fn identity(&self) -> &FnIdentity {
        self.native.identity()
    }
}

/// Installs the snapped layout decorator
pub struct GeometryMitigator;

impl Mitigator for GeometryMitigator {
    fn surface(&self) -> SurfaceId {
        SurfaceId::Geometry
    }

    fn enabled(&self, config: &crate::ShroudConfig) -> bool {
        config.dom_geometry
    }

    fn apply(&self, mut page: PageSurfaces, _ctx: &MitigationCtx) -> PageSurfaces {
        page.layout = Box::new(SnappedLayout::wrap(page.layout));
        page
    }
}
