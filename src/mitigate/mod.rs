//! Surface Mitigators
//!
//! One module per intercepted capability surface:
//! - Canvas pixel reads, encoded exports, text metrics
//! - WebGL vendor/renderer queries and late-created contexts
//! - Audio buffer and analyser output
//! - Timing bucketization
//! - DOM geometry rounding
//! - Media queries and device-pixel-ratio
//! - Font availability checks
//! - Battery capability removal
//! - WebRTC block / relay-only filtering
//!
//! Instead of mutating globals, every native capability lives as a boxed
//! trait object in [`PageSurfaces`]; a mitigator consumes the native box and
//! returns a decorator exposing the same trait. Introspection identity
//! (name, arity, string form) is forwarded from the native so a patched
//! entry point is indistinguishable from the original.

pub mod audio;
pub mod battery;
pub mod canvas;
pub mod fonts;
pub mod geometry;
pub mod media;
pub mod timing;
pub mod webgl;
pub mod webrtc;

use std::sync::Arc;

use crate::detect::DetectionReporter;
use crate::persona::Persona;
use crate::prng::OriginRng;
use crate::ShroudConfig;

pub use audio::{AnalyserSurface, AudioBlock, AudioSurface};
pub use battery::BatterySurface;
pub use canvas::{CanvasEntry, CanvasState, CanvasSurface, ImageFormat, TextMetrics};
pub use fonts::FontSurface;
pub use geometry::{LayoutSurface, Rect};
pub use media::MediaSurface;
pub use timing::{TimeSite, TimeSurface};
pub use webgl::{GlContext, GlContextKind, GlQuery, GlValue, GraphicsFactory};
pub use webrtc::{PeerConnection, RtcSurface, SessionDescription};

/// Quantize a continuous value to 0.5 steps, the shared low-entropy
/// rounding used for text widths, rect fields and pixel ratios.
pub(crate) fn quantize_half(value: f64) -> f64 {
    (value * 2.0).round() / 2.0
}

/// Identifier for one intercepted surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceId {
    Canvas,
    Webgl,
    Audio,
    Timing,
    Geometry,
    Media,
    Fonts,
    Battery,
    Webrtc,
}

impl SurfaceId {
    /// Stable name used in logs and the readiness payload
    pub fn as_str(&self) -> &'static str {
        match self {
            SurfaceId::Canvas => "canvas",
            SurfaceId::Webgl => "webgl",
            SurfaceId::Audio => "audio",
            SurfaceId::Timing => "timing",
            SurfaceId::Geometry => "geometry",
            SurfaceId::Media => "media",
            SurfaceId::Fonts => "fonts",
            SurfaceId::Battery => "battery",
            SurfaceId::Webrtc => "webrtc",
        }
    }
}

/// Introspection identity of a native entry point.
///
/// Decorators forward the wrapped native's identity untouched, so probes
/// that compare name, arity, or the string form see the original.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FnIdentity {
    pub name: String,
    pub arity: u8,
    pub repr: String,
}

impl FnIdentity {
    /// Identity of a host-native function
    pub fn native(name: &str, arity: u8) -> Self {
        Self {
            name: name.to_string(),
            arity,
            repr: format!("function {name}() {{ [native code] }}"),
        }
    }
}

/// Shared inputs handed to every mitigator at install time
pub struct MitigationCtx {
    pub rng: OriginRng,
    pub config: ShroudConfig,
    pub persona: Option<Persona>,
    pub reporter: Arc<DetectionReporter>,
}

/// One unit intercepting one native capability.
///
/// Installation is a move: the mitigator takes the surface table, replaces
/// its own slot with a decorator over the previous occupant, and hands the
/// table back. The engine's installed-surface set makes this idempotent.
pub trait Mitigator: Send + Sync {
    fn surface(&self) -> SurfaceId;
    fn enabled(&self, config: &ShroudConfig) -> bool;
    fn apply(&self, page: PageSurfaces, ctx: &MitigationCtx) -> PageSurfaces;
}

/// The page's capability table: every native surface the engine may
/// intercept, supplied by the embedding for the target execution context.
pub struct PageSurfaces {
    pub canvas: Box<dyn CanvasSurface>,
    pub graphics: Box<dyn GraphicsFactory>,
    pub audio: Box<dyn AudioSurface>,
    pub analyser: Box<dyn AnalyserSurface>,
    pub time: Box<dyn TimeSurface>,
    pub layout: Box<dyn LayoutSurface>,
    pub media: Box<dyn MediaSurface>,
    pub fonts: Box<dyn FontSurface>,
    /// `None` once the battery mitigator has removed the capability
    pub battery: Option<Box<dyn BatterySurface>>,
    pub rtc: Box<dyn RtcSurface>,
}

/// The standard mitigator chain, in install order
pub fn standard_mitigators() -> Vec<Box<dyn Mitigator>> {
    vec![
        Box::new(canvas::CanvasMitigator),
        Box::new(webgl::WebglMitigator),
        Box::new(audio::AudioMitigator),
        Box::new(timing::TimingMitigator),
        Box::new(geometry::GeometryMitigator),
        Box::new(media::MediaMitigator),
        Box::new(fonts::FontMitigator),
        Box::new(battery::BatteryMitigator),
        Box::new(webrtc::WebrtcMitigator),
    ]
}
