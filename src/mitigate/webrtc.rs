//! WebRTC mitigation
//!
//! Two modes. Block: peer-connection construction and media capture both
//! fail with a permission-style error, the same shape a user denial
//! produces. Relay-only: host and server-reflexive candidates are
//! stripped from outgoing offers and incoming candidates, leaving only
//! relayed paths that do not expose local addresses.

use std::sync::Arc;

use crate::detect::{Category, DetectionReporter, Severity};
use crate::error::{Error, Result};
use crate::WebrtcMode;

use super::{FnIdentity, MitigationCtx, Mitigator, PageSurfaces, SurfaceId};

/// An SDP session description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp: String,
}

/// A live peer connection
pub trait PeerConnection: Send + Sync {
    fn create_offer(&self) -> Result<SessionDescription>;
    fn add_ice_candidate(&self, candidate: &str) -> Result<()>;
}

/// The peer-connection / media-capture capability
pub trait RtcSurface: Send + Sync {
    fn create_peer_connection(&self) -> Result<Box<dyn PeerConnection>>;
    /// `getUserMedia` analog; returns an opaque stream id
    fn user_media(&self) -> Result<String>;
    fn identity(&self) -> &FnIdentity;
}

/// True for SDP candidate lines and raw candidates that would expose a
/// local or server-reflexive address
fn leaks_address(candidate_line: &str) -> bool {
    let lower = candidate_line.to_ascii_lowercase();
    if !lower.contains("candidate") {
        return false;
    }
    lower.contains(" typ host") || lower.contains(" typ srflx")
}

/// Reference native RTC stack with a canned offer
pub struct HostRtc {
    offer_sdp: String,
    id: FnIdentity,
}

impl HostRtc {
    pub fn new(offer_sdp: &str) -> Self {
        Self {
            offer_sdp: offer_sdp.to_string(),
            id: FnIdentity::native("RTCPeerConnection", 2),
        }
    }
}

struct HostPeerConnection {
    offer_sdp: String,
}

impl PeerConnection for HostPeerConnection {
    fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription {
            sdp: self.offer_sdp.clone(),
        })
    }

    fn add_ice_candidate(&self, _candidate: &str) -> Result<()> {
        Ok(())
    }
}

impl RtcSurface for HostRtc {
    fn create_peer_connection(&self) -> Result<Box<dyn PeerConnection>> {
        Ok(Box::new(HostPeerConnection {
            offer_sdp: self.offer_sdp.clone(),
        }))
    }

    fn user_media(&self) -> Result<String> {
        Ok("camera-0".to_string())
    }

    fn identity(&self) -> &FnIdentity {
        &self.id
    }
}

/// Block mode: everything fails like a denied permission
pub struct BlockedRtc {
    native: Box<dyn RtcSurface>,
    reporter: Arc<DetectionReporter>,
}

impl BlockedRtc {
    pub fn wrap(native: Box<dyn RtcSurface>, reporter: Arc<DetectionReporter>) -> Self {
        Self { native, reporter }
    }
}

impl RtcSurface for BlockedRtc {
    fn create_peer_connection(&self) -> Result<Box<dyn PeerConnection>> {
        self.reporter
            .probe(Category::Network, "RTCPeerConnection", Severity::High);
        Err(Error::not_allowed("peer connection disabled"))
    }

    fn user_media(&self) -> Result<String> {
        self.reporter
            .probe(Category::Network, "getUserMedia", Severity::High);
        Err(Error::not_allowed("media capture disabled"))
    }

    fn identity(&self) -> &FnIdentity {
        self.native.identity()
    }
}

/// Relay mode: address-bearing candidates are filtered both ways
pub struct RelayOnlyRtc {
    native: Box<dyn RtcSurface>,
    reporter: Arc<DetectionReporter>,
}

impl RelayOnlyRtc {
    pub fn wrap(native: Box<dyn RtcSurface>, reporter: Arc<DetectionReporter>) -> Self {
        Self { native, reporter }
    }
}

struct RelayOnlyConnection {
    native: Box<dyn PeerConnection>,
}

impl PeerConnection for RelayOnlyConnection {
    fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.native.create_offer()?;
        let sdp = offer
            .sdp
            .split("\r\n")
            .filter(|line| !leaks_address(line))
            .collect::<Vec<_>>()
            .join("\r\n");
        Ok(SessionDescription { sdp })
    }

    fn add_ice_candidate(&self, candidate: &str) -> Result<()> {
        if leaks_address(candidate) {
            // Swallowed, not an error: the remote side just never
            // completes a direct path
            return Ok(());
        }
        self.native.add_ice_candidate(candidate)
    }
}

impl RtcSurface for RelayOnlyRtc {
    fn create_peer_connection(&self) -> Result<Box<dyn PeerConnection>> {
        self.reporter
            .probe(Category::Network, "RTCPeerConnection", Severity::Medium);
        let native = self.native.create_peer_connection()?;
        Ok(Box::new(RelayOnlyConnection { native }))
    }

    fn user_media(&self) -> Result<String> {
        self.native.user_media()
    }

    fn identity(&self) -> &FnIdentity {
        self.native.identity()
    }
}

/// Installs the mode-appropriate RTC decorator
pub struct WebrtcMitigator;

impl Mitigator for WebrtcMitigator {
    fn surface(&self) -> SurfaceId {
        SurfaceId::Webrtc
    }

    fn enabled(&self, config: &crate::ShroudConfig) -> bool {
        config.webrtc != WebrtcMode::Off
    }

    fn apply(&self, mut page: PageSurfaces, ctx: &MitigationCtx) -> PageSurfaces {
        page.rtc = match ctx.config.webrtc {
            WebrtcMode::Block => Box::new(BlockedRtc::wrap(page.rtc, Arc::clone(&ctx.reporter))),
            WebrtcMode::Relay => {
                Box::new(RelayOnlyRtc::wrap(page.rtc, Arc::clone(&ctx.reporter)))
            }
            WebrtcMode::Off => page.rtc,
        };
        page
    }
}
