//! Media-query and pixel-ratio mitigation
//!
//! Preference queries (color scheme, reduced motion) answer a fixed
//! `false` regardless of the real OS setting; device-pixel-ratio and
//! viewport scale are quantized to 0.5 steps.

use super::{quantize_half, FnIdentity, MitigationCtx, Mitigator, PageSurfaces, SurfaceId};

/// The media-environment capability
pub trait MediaSurface: Send + Sync {
    fn matches(&self, query: &str) -> bool;
    fn device_pixel_ratio(&self) -> f64;
    fn viewport_scale(&self) -> f64;
    fn identity(&self) -> &FnIdentity;
}

/// Reference native media environment
pub struct HostMedia {
    pub dark_scheme: bool,
    pub reduced_motion: bool,
    pub pixel_ratio: f64,
    pub scale: f64,
    id: FnIdentity,
}

impl HostMedia {
    pub fn new(dark_scheme: bool, reduced_motion: bool, pixel_ratio: f64) -> Self {
        Self {
            dark_scheme,
            reduced_motion,
            pixel_ratio,
            scale: 1.0,
            id: FnIdentity::native("matchMedia", 1),
        }
    }
}

impl MediaSurface for HostMedia {
    fn matches(&self, query: &str) -> bool {
        let query = query.to_ascii_lowercase();
        if query.contains("prefers-color-scheme") {
            return query.contains("dark") == self.dark_scheme;
        }
        if query.contains("prefers-reduced-motion") {
            return self.reduced_motion;
        }
        false
    }

    fn device_pixel_ratio(&self) -> f64 {
        self.pixel_ratio
    }

    fn viewport_scale(&self) -> f64 {
        self.scale
    }

    fn identity(&self) -> &FnIdentity {
        &self.id
    }
}

/// Decorator forcing preference queries off and quantizing ratios
pub struct FlattenedMedia {
    native: Box<dyn MediaSurface>,
}

impl FlattenedMedia {
    pub fn wrap(native: Box<dyn MediaSurface>) -> Self {
        Self { native }
    }

    fn is_preference_query(query: &str) -> bool {
        let query = query.to_ascii_lowercase();
        query.contains("prefers-color-scheme") || query.contains("prefers-reduced-motion")
    }
}

impl MediaSurface for FlattenedMedia {
    fn matches(&self, query: &str) -> bool {
        if Self::is_preference_query(query) {
            return false;
        }
        self.native.matches(query)
    }

    fn device_pixel_ratio(&self) -> f64 {
        quantize_half(self.native.device_pixel_ratio())
    }

    fn viewport_scale(&self) -> f64 {
        quantize_half(self.native.viewport_scale())
    }

    fn identity(&self) -> &FnIdentity {
        self.native.identity()
    }
}

/// Installs the flattened media decorator
pub struct MediaMitigator;

impl Mitigator for MediaMitigator {
    fn surface(&self) -> SurfaceId {
        SurfaceId::Media
    }

    fn enabled(&self, config: &crate::ShroudConfig) -> bool {
        config.css_fingerprint
    }

    fn apply(&self, mut page: PageSurfaces, _ctx: &MitigationCtx) -> PageSurfaces {
        page.media = Box::new(FlattenedMedia::wrap(page.media));
        page
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preference_queries_forced_false() {
        let media = FlattenedMedia::wrap(Box::new(HostMedia::new(true, true, 2.0)));

        assert!(!media.matches("(prefers-color-scheme: dark)"));
        assert!(!media.matches("(prefers-color-scheme: light)"));
        assert!(!media.matches("(prefers-reduced-motion: reduce)"));
    }

    #[test]
    fn test_other_queries_pass_through() {
        let media = FlattenedMedia::wrap(Box::new(HostMedia::new(true, false, 1.0)));
        // Non-preference queries keep their native answer
        assert!(!media.matches("(min-width: 600px)"));
    }

    #[test]
    fn test_pixel_ratio_quantized() {
        let media = FlattenedMedia::wrap(Box::new(HostMedia::new(false, false, 1.3359375)));
        assert_eq!(media.device_pixel_ratio(), 1.5);

        let media = FlattenedMedia::wrap(Box::new(HostMedia::new(false, false, 2.201)));
        assert_eq!(media.device_pixel_ratio(), 2.0);
    }

    #[test]
    fn test_viewport_scale_quantized() {
        let mut host = HostMedia::new(false, false, 1.0);
        host.scale = 1.26;
        let media = FlattenedMedia::wrap(Box::new(host));
        assert_eq!(media.viewport_scale(), 1.5);
    }

    #[test]
    fn test_identity_forwarded() {
        let media = FlattenedMedia::wrap(Box::new(HostMedia::new(false, false, 1.0)));
        assert_eq!(media.identity().name, "matchMedia");
        assert!(media.identity().repr.contains("[native code]"));
    }
}
