//! # Shroud
//!
//! Deterministic fingerprint-surface hardening with per-domain personas.
//!
//! Shroud reduces a page's ability to uniquely identify a visiting browser
//! through canvas, WebGL, audio, timing, font, geometry and hardware
//! probes, while keeping the page working and login state intact. All
//! spoofing noise is derived from a per-origin seed, so a site sees a
//! stable device within a session but cannot correlate it across sites.
//!
//! ## Architecture
//!
//! - **Origin-seeded PRNG** - one deterministic noise source feeding every
//!   surface mitigator
//! - **Surface mitigators** - decorators over the page's native
//!   capabilities (canvas, WebGL, audio, timing, geometry, media queries,
//!   fonts, battery, WebRTC)
//! - **Persona store** - one synthetic device identity per domain,
//!   stable for the browsing session
//! - **Secure bridge** - token-authenticated duplex channel between the
//!   privileged coordinator and the page main world
//! - **Injection coordinator** - strategy chain that gets the engine
//!   running across the privilege boundary and fails open when it cannot
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use shroud::{DetectionReporter, Engine, ShroudConfig};
//! # fn page_surfaces() -> shroud::mitigate::PageSurfaces { unimplemented!() }
//!
//! let reporter = Arc::new(DetectionReporter::new("https://example.com/"));
//! let mut engine = Engine::new(
//!     "https://example.com",
//!     ShroudConfig::default(),
//!     None,
//!     reporter,
//! );
//!
//! // Replace the page's native capabilities with hardened decorators
//! let page = engine.harden(page_surfaces());
//! ```

pub mod bridge;
pub mod detect;
pub mod domains;
pub mod engine;
pub mod error;
pub mod inject;
pub mod mitigate;
pub mod persona;
pub mod prng;

use serde::{Deserialize, Serialize};

// Re-exports
pub use bridge::{Bridge, Envelope, MsgKind, SessionToken, World};
pub use detect::{Category, Detection, DetectionRecord, DetectionReporter, DetectionStats, Severity};
pub use engine::{Bootstrap, Engine};
pub use error::{Error, Result};
pub use inject::{
    EngineSource, InjectRequest, InjectState, InjectionCoordinator, MainWorld, PageContext,
    PrivilegedHost,
};
pub use mitigate::{PageSurfaces, SurfaceId};
pub use persona::{Catalog, Persona, PersonaStore, SessionStore};

/// WebRTC handling mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebrtcMode {
    /// Leave WebRTC untouched
    Off,
    /// Peer connections and capture fail like a denied permission
    Block,
    /// Only relayed candidates survive, local addresses never leak
    Relay,
}

/// Which frames get protection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IframePolicy {
    /// Protect same-origin frames, skip cross-origin ones
    SameOrigin,
    /// Protect only the top frame
    TopOnly,
    /// Protect every frame
    All,
}

/// The settings bag controlling which mitigators are active.
///
/// Owned by the external configuration layer and read-only to the core;
/// serialized whenever it crosses the context boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShroudConfig {
    /// Protection master switch
    pub enabled: bool,
    /// Perturb canvas pixel reads, exports and text metrics
    pub spoof_canvas: bool,
    /// Mask WebGL vendor/renderer strings
    pub spoof_webgl: bool,
    /// Perturb audio buffers and analyser output
    pub spoof_audio: bool,
    /// Quantize elapsed-time reads into jittered buckets
    pub timing_protection: bool,
    /// Round DOM rectangles to the 0.5px grid
    pub dom_geometry: bool,
    /// Flatten preference media queries and quantize pixel ratios
    pub css_fingerprint: bool,
    /// Answer font checks by generic family only
    pub font_enumeration: bool,
    /// Remove the battery capability
    pub block_battery: bool,
    /// WebRTC mode
    pub webrtc: WebrtcMode,
    /// Leave allow-listed login providers untouched
    pub preserve_auth: bool,
    /// Frame protection policy
    pub protect_iframes: IframePolicy,
    /// User allow patterns (merged with the built-in trusted list)
    pub allow_patterns: Vec<String>,
    /// User deny patterns; a deny hit always protects
    pub deny_patterns: Vec<String>,
    /// Preferred persona OS family
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_preference: Option<String>,
}

impl Default for ShroudConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            spoof_canvas: true,
            spoof_webgl: true,
            spoof_audio: true,
            timing_protection: true,
            dom_geometry: true,
            css_fingerprint: true,
            font_enumeration: true,
            block_battery: true,
            webrtc: WebrtcMode::Block,
            preserve_auth: true,
            protect_iframes: IframePolicy::SameOrigin,
            allow_patterns: Vec::new(),
            deny_patterns: Vec::new(),
            os_preference: None,
        }
    }
}

impl ShroudConfig {
    /// Everything off except the master switch; useful as a baseline when
    /// enabling surfaces one by one
    pub fn minimal() -> Self {
        Self {
            enabled: true,
            spoof_canvas: false,
            spoof_webgl: false,
            spoof_audio: false,
            timing_protection: false,
            dom_geometry: false,
            css_fingerprint: false,
            font_enumeration: false,
            block_battery: false,
            webrtc: WebrtcMode::Off,
            preserve_auth: true,
            protect_iframes: IframePolicy::SameOrigin,
            allow_patterns: Vec::new(),
            deny_patterns: Vec::new(),
            os_preference: None,
        }
    }
}
