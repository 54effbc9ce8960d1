//! Font enumeration mitigation
//!
//! Availability checks answer by pattern alone: generic families report
//! true, specific families are never confirmed, so the installed-font set
//! stops being enumerable.

use std::collections::HashSet;
use std::sync::Arc;

use crate::detect::{Category, DetectionReporter, Severity};

use super::{FnIdentity, MitigationCtx, Mitigator, PageSurfaces, SurfaceId};

/// The `document.fonts.check` analog
pub trait FontSurface: Send + Sync {
    fn check(&self, spec: &str) -> bool;
    fn identity(&self) -> &FnIdentity;
}

/// Reference native font set
pub struct InstalledFonts {
    families: HashSet<String>,
    id: FnIdentity,
}

impl InstalledFonts {
    pub fn new(families: impl IntoIterator<Item = &'static str>) -> Self {
        Self {
            families: families.into_iter().map(str::to_lowercase).collect(),
            id: FnIdentity::native("check", 2),
        }
    }
}

impl FontSurface for InstalledFonts {
    fn check(&self, spec: &str) -> bool {
        let spec = spec.to_lowercase();
        self.families.iter().any(|family| spec.contains(family))
    }

    fn identity(&self) -> &FnIdentity {
        &self.id
    }
}

/// Decorator answering by generic-family pattern only
pub struct GenericFonts {
    native: Box<dyn FontSurface>,
    reporter: Arc<DetectionReporter>,
}

impl GenericFonts {
    pub fn wrap(native: Box<dyn FontSurface>, reporter: Arc<DetectionReporter>) -> Self {
        Self { native, reporter }
    }

    fn is_generic(spec: &str) -> bool {
        let spec = spec.to_lowercase();
        spec.split(|c: char| !c.is_ascii_alphanumeric() && c != '-')
            .any(|word| matches!(word, "monospace" | "serif" | "sans-serif"))
    }
}

impl FontSurface for GenericFonts {
    fn check(&self, spec: &str) -> bool {
        self.reporter.probe(Category::Fonts, "check", Severity::Medium);
        Self::is_generic(spec)
    }

    fn identity(&self) -> &FnIdentity {
        self.native.identity()
    }
}

/// Installs the generic-only font decorator
pub struct FontMitigator;

impl Mitigator for FontMitigator {
    fn surface(&self) -> SurfaceId {
        SurfaceId::Fonts
    }

    fn enabled(&self, config: &crate::ShroudConfig) -> bool {
        config.font_enumeration
    }

    fn apply(&self, mut page: PageSurfaces, ctx: &MitigationCtx) -> PageSurfaces {
        page.fonts = Box::new(GenericFonts::wrap(page.fonts, Arc::clone(&ctx.reporter)));
        page
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generic() -> GenericFonts {
        GenericFonts::wrap(
            Box::new(InstalledFonts::new(["helvetica neue", "comic sans ms"])),
            Arc::new(DetectionReporter::new("https://example.com")),
        )
    }

    #[test]
    fn test_generic_families_confirmed() {
        let fonts = generic();
        assert!(fonts.check("12px monospace"));
        assert!(fonts.check("16px serif"));
        assert!(fonts.check("1em sans-serif"));
    }

    #[test]
    fn test_specific_families_never_confirmed() {
        let fonts = generic();
        // Installed on the host, still denied
        assert!(!fonts.check("12px \"Helvetica Neue\""));
        assert!(!fonts.check("12px \"Comic Sans MS\""));
        assert!(!fonts.check("12px \"Totally Unknown Font\""));
    }

    #[test]
    fn test_sans_serif_not_confused_with_serif() {
        // "sans-serif" must match as a whole word, and a bare "serif"
        // inside another family name must not count
        let fonts = generic();
        assert!(fonts.check("10px sans-serif"));
        assert!(!fonts.check("10px seriffont"));
    }

    #[test]
    fn test_native_would_have_leaked() {
        let native = InstalledFonts::new(["helvetica neue"]);
        assert!(native.check("12px \"Helvetica Neue\""));
    }

    #[test]
    fn test_identity_forwarded() {
        assert_eq!(generic().identity().name, "check");
    }
}
