//! WebGL surface mitigation
//!
//! Vendor/renderer queries (masked and unmasked variants) return two fixed
//! strings, and the debug-renderer-info extension is blocked outright. The
//! context factory itself is decorated so contexts created after the
//! initial install, including offscreen variants reached through a
//! canvas-to-offscreen transfer, come back already masked.

use std::sync::Arc;

use crate::detect::{Category, DetectionReporter, Severity};

use super::{FnIdentity, MitigationCtx, Mitigator, PageSurfaces, SurfaceId};

/// Extension blocked for every masked context
const DEBUG_RENDERER_INFO: &str = "WEBGL_debug_renderer_info";

/// Default mask used when no persona supplies a vendor/renderer pair
const DEFAULT_VENDOR: &str = "Google Inc. (Intel)";
const DEFAULT_RENDERER: &str =
    "ANGLE (Intel, Intel(R) HD Graphics 620 Direct3D11 vs_5_0 ps_5_0, D3D11)";

/// Context flavors the factory can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlContextKind {
    Webgl,
    Webgl2,
}

/// Parameter queries routed through `getParameter`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlQuery {
    Vendor,
    Renderer,
    UnmaskedVendor,
    UnmaskedRenderer,
    Other(u32),
}

/// Result of a parameter query
#[derive(Debug, Clone, PartialEq)]
pub enum GlValue {
    Str(String),
    Num(f64),
    Null,
}

/// A live rendering context
pub trait GlContext: Send + Sync {
    fn kind(&self) -> GlContextKind;
    fn get_parameter(&self, query: GlQuery) -> GlValue;
    /// `Some` when the extension is available, `None` when absent/blocked
    fn get_extension(&self, name: &str) -> Option<String>;
    fn identity(&self) -> &FnIdentity;
}

/// Creates rendering contexts; the seam for `getContext` and
/// `transferControlToOffscreen`
pub trait GraphicsFactory: Send + Sync {
    fn create_context(&self, kind: GlContextKind) -> Box<dyn GlContext>;
    /// The offscreen variant of this factory
    fn transfer_to_offscreen(&self) -> Box<dyn GraphicsFactory>;
}

/// Reference native context reporting the real device strings
pub struct DeviceGl {
    kind: GlContextKind,
    vendor: String,
    renderer: String,
    extensions: Vec<String>,
    get_parameter_id: FnIdentity,
}

impl DeviceGl {
    pub fn new(kind: GlContextKind, vendor: &str, renderer: &str) -> Self {
        Self {
            kind,
            vendor: vendor.to_string(),
            renderer: renderer.to_string(),
            extensions: vec![
                DEBUG_RENDERER_INFO.to_string(),
                "OES_texture_float".to_string(),
                "EXT_color_buffer_float".to_string(),
            ],
            get_parameter_id: FnIdentity::native("getParameter", 1),
        }
    }
}

impl GlContext for DeviceGl {
    fn kind(&self) -> GlContextKind {
        self.kind
    }

    fn get_parameter(&self, query: GlQuery) -> GlValue {
        match query {
            GlQuery::Vendor | GlQuery::UnmaskedVendor => GlValue::Str(self.vendor.clone()),
            GlQuery::Renderer | GlQuery::UnmaskedRenderer => GlValue::Str(self.renderer.clone()),
            GlQuery::Other(_) => GlValue::Null,
        }
    }

    fn get_extension(&self, name: &str) -> Option<String> {
        self.extensions.iter().find(|e| *e == name).cloned()
    }

    fn identity(&self) -> &FnIdentity {
        &self.get_parameter_id
    }
}

/// Reference native factory producing [`DeviceGl`] contexts
pub struct DeviceGraphics {
    vendor: String,
    renderer: String,
}

impl DeviceGraphics {
    pub fn new(vendor: &str, renderer: &str) -> Self {
        Self {
            vendor: vendor.to_string(),
            renderer: renderer.to_string(),
        }
    }
}

impl GraphicsFactory for DeviceGraphics {
    fn create_context(&self, kind: GlContextKind) -> Box<dyn GlContext> {
        Box::new(DeviceGl::new(kind, &self.vendor, &self.renderer))
    }

    fn transfer_to_offscreen(&self) -> Box<dyn GraphicsFactory> {
        Box::new(DeviceGraphics {
            vendor: self.vendor.clone(),
            renderer: self.renderer.clone(),
        })
    }
}

/// Context decorator that answers vendor/renderer queries with the mask
pub struct MaskedGl {
    native: Box<dyn GlContext>,
    vendor: String,
    renderer: String,
    reporter: Arc<DetectionReporter>,
}

impl GlContext for MaskedGl {
    fn kind(&self) -> GlContextKind {
        self.native.kind()
    }

    fn get_parameter(&self, query: GlQuery) -> GlValue {
        match query {
            GlQuery::Vendor | GlQuery::UnmaskedVendor => {
                self.reporter
                    .probe(Category::Webgl, "getParameter", Severity::High);
                GlValue::Str(self.vendor.clone())
            }
            GlQuery::Renderer | GlQuery::UnmaskedRenderer => {
                self.reporter
                    .probe(Category::Webgl, "getParameter", Severity::High);
                GlValue::Str(self.renderer.clone())
            }
            other => self.native.get_parameter(other),
        }
    }

    fn get_extension(&self, name: &str) -> Option<String> {
        if name == DEBUG_RENDERER_INFO {
            self.reporter
                .probe(Category::Webgl, "getExtension", Severity::High);
            return None;
        }
        self.native.get_extension(name)
    }

    fn identity(&self) -> &FnIdentity {
        self.native.identity()
    }
}

/// Factory decorator: every context it hands out is masked, and the
/// offscreen variant it produces masks its contexts too
pub struct MaskedGraphics {
    native: Box<dyn GraphicsFactory>,
    vendor: String,
    renderer: String,
    reporter: Arc<DetectionReporter>,
}

impl MaskedGraphics {
    pub fn wrap(
        native: Box<dyn GraphicsFactory>,
        vendor: String,
        renderer: String,
        reporter: Arc<DetectionReporter>,
    ) -> Self {
        Self {
            native,
            vendor,
            renderer,
            reporter,
        }
    }
}

impl GraphicsFactory for MaskedGraphics {
    fn create_context(&self, kind: GlContextKind) -> Box<dyn GlContext> {
        Box::new(MaskedGl {
            native: self.native.create_context(kind),
            vendor: self.vendor.clone(),
            renderer: self.renderer.clone(),
            reporter: Arc::clone(&self.reporter),
        })
    }

    fn transfer_to_offscreen(&self) -> Box<dyn GraphicsFactory> {
        Box::new(MaskedGraphics {
            native: self.native.transfer_to_offscreen(),
            vendor: self.vendor.clone(),
            renderer: self.renderer.clone(),
            reporter: Arc::clone(&self.reporter),
        })
    }
}

/// Installs the masked graphics factory
pub struct WebglMitigator;

impl Mitigator for WebglMitigator {
    fn surface(&self) -> SurfaceId {
        SurfaceId::Webgl
    }

    fn enabled(&self, config: &crate::ShroudConfig) -> bool {
        config.spoof_webgl
    }

    fn apply(&self, mut page: PageSurfaces, ctx: &MitigationCtx) -> PageSurfaces {
        let (vendor, renderer) = match &ctx.persona {
            Some(persona) => (persona.webgl.vendor.clone(), persona.webgl.renderer.clone()),
            None => (DEFAULT_VENDOR.to_string(), DEFAULT_RENDERER.to_string()),
        };
        page.graphics = Box::new(MaskedGraphics::wrap(
            page.graphics,
            vendor,
            renderer,
            Arc::clone(&ctx.reporter),
        ));
        page
    }
}
