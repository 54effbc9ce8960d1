//! The spoofing engine
//!
//! Runs in the page main world once injection succeeds: derives the
//! origin seed, walks the mitigator chain over the page's capability
//! table, and confirms readiness back over the bridge.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::bridge::Bridge;
use crate::detect::DetectionReporter;
use crate::error::Result;
use crate::mitigate::{standard_mitigators, MitigationCtx, PageSurfaces, SurfaceId};
use crate::persona::Persona;
use crate::prng::OriginRng;
use crate::ShroudConfig;

/// Line marker carrying the serialized init payload inside wrapped
/// engine source
pub const BOOTSTRAP_MARKER: &str = "//# shroud-init ";

/// Everything the engine needs to initialize in the target context,
/// serialized into the wrapped script by injection strategies 2 and 3
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bootstrap {
    pub settings: ShroudConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona: Option<Persona>,
    pub allow_list: Vec<String>,
    pub deny_list: Vec<String>,
    pub correlation_id: String,
}

/// Append the serialized bootstrap to the engine program text
pub fn wrap_source(engine_source: &str, bootstrap: &Bootstrap) -> Result<String> {
    let payload = serde_json::to_string(bootstrap)?;
    Ok(format!("{engine_source}\n{BOOTSTRAP_MARKER}{payload}\n"))
}

impl Bootstrap {
    /// Recover the init payload from a wrapped script
    pub fn extract(script: &str) -> Option<Bootstrap> {
        let line = script
            .lines()
            .rev()
            .find(|line| line.starts_with(BOOTSTRAP_MARKER))?;
        serde_json::from_str(&line[BOOTSTRAP_MARKER.len()..]).ok()
    }
}

/// Per-page mitigation engine
pub struct Engine {
    rng: OriginRng,
    config: ShroudConfig,
    persona: Option<Persona>,
    reporter: Arc<DetectionReporter>,
    installed: HashSet<SurfaceId>,
}

impl Engine {
    /// Create an engine for one page load
    pub fn new(
        origin: &str,
        config: ShroudConfig,
        persona: Option<Persona>,
        reporter: Arc<DetectionReporter>,
    ) -> Self {
        Self {
            rng: OriginRng::for_origin(origin),
            config,
            persona,
            reporter,
            installed: HashSet::new(),
        }
    }

    /// Create an engine from an extracted bootstrap payload
    pub fn from_bootstrap(
        origin: &str,
        bootstrap: Bootstrap,
        reporter: Arc<DetectionReporter>,
    ) -> Self {
        Self::new(origin, bootstrap.settings, bootstrap.persona, reporter)
    }

    pub fn reporter(&self) -> &Arc<DetectionReporter> {
        &self.reporter
    }

    /// Surfaces installed so far
    pub fn installed(&self) -> &HashSet<SurfaceId> {
        &self.installed
    }

    /// Move the capability table through every enabled mitigator.
    ///
    /// Idempotent: each surface is installed at most once per engine, so
    /// a second pass (late re-init, duplicated inject) changes nothing.
    pub fn harden(&mut self, page: PageSurfaces) -> PageSurfaces {
        if !self.config.enabled {
            tracing::debug!("protection disabled in settings, surfaces untouched");
            return page;
        }

        let ctx = MitigationCtx {
            rng: self.rng,
            config: self.config.clone(),
            persona: self.persona.clone(),
            reporter: Arc::clone(&self.reporter),
        };

        let mut page = page;
        for mitigator in standard_mitigators() {
            if !mitigator.enabled(&self.config) {
                continue;
            }
            if !self.installed.insert(mitigator.surface()) {
                continue;
            }
            page = mitigator.apply(page, &ctx);
            tracing::debug!("installed {} mitigator", mitigator.surface().as_str());
        }
        page
    }

    /// Route every detection record to the peer context as a
    /// `fingerprinting_detected` event
    pub fn relay_detections(&self, bridge: Arc<Bridge>) {
        self.reporter.subscribe(move |record| {
            match serde_json::to_value(record) {
                Ok(data) => {
                    if let Err(err) = bridge.emit_now(crate::bridge::DETECTION_EVENT, data) {
                        tracing::debug!("detection relay failed: {err}");
                    }
                }
                Err(err) => tracing::debug!("detection record not serializable: {err}"),
            }
        });
    }

    /// Confirm readiness for a correlation id over the bridge
    pub async fn confirm_ready(&self, bridge: &Bridge, correlation_id: &str) -> Result<()> {
        let surfaces: Vec<&str> = self.installed.iter().map(SurfaceId::as_str).collect();
        bridge
            .ack(correlation_id, json!({ "surfaces": surfaces }))
            .await
    }
}
