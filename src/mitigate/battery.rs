//! Battery capability removal
//!
//! The battery API carries enough entropy (level, charging state, rates)
//! to contribute to a fingerprint; the mitigator removes it from the
//! capability table entirely rather than feeding it noise.

use super::{FnIdentity, MitigationCtx, Mitigator, PageSurfaces, SurfaceId};

/// The `navigator.getBattery` analog
pub trait BatterySurface: Send + Sync {
    fn level(&self) -> f64;
    fn charging(&self) -> bool;
    fn identity(&self) -> &FnIdentity;
}

/// Reference native battery state
pub struct HostBattery {
    pub level: f64,
    pub charging: bool,
    id: FnIdentity,
}

impl HostBattery {
    pub fn new(level: f64, charging: bool) -> Self {
        Self {
            level,
            charging,
            id: FnIdentity::native("getBattery", 0),
        }
    }
}

impl BatterySurface for HostBattery {
    fn level(&self) -> f64 {
        self.level
    }

    fn charging(&self) -> bool {
        self.charging
    }

    fn identity(&self) -> &FnIdentity {
        &self.id
    }
}

/// Removes the battery capability from the surface table
pub struct BatteryMitigator;

impl Mitigator for BatteryMitigator {
    fn surface(&self) -> SurfaceId {
        SurfaceId::Battery
    }

    fn enabled(&self, config: &crate::ShroudConfig) -> bool {
        config.block_battery
    }

    fn apply(&self, mut page: PageSurfaces, _ctx: &MitigationCtx) -> PageSurfaces {
        page.battery = None;
        page
    }
}
