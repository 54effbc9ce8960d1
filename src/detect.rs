//! Fingerprinting-probe detection and aggregation
//!
//! Mitigators report every observed probe here. Records are categorized,
//! stamped and counted per page execution context, then fanned out to
//! subscribers; one subscriber failing can never take down the others or
//! the reporter itself.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Probe categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Canvas,
    Webgl,
    Audio,
    Fonts,
    Hardware,
    Navigator,
    Screen,
    Timing,
    Storage,
    Network,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Canvas => "canvas",
            Category::Webgl => "webgl",
            Category::Audio => "audio",
            Category::Fonts => "fonts",
            Category::Hardware => "hardware",
            Category::Navigator => "navigator",
            Category::Screen => "screen",
            Category::Timing => "timing",
            Category::Storage => "storage",
            Category::Network => "network",
        }
    }

    /// Parse a wire value, coercing anything unknown to [`Category::Navigator`]
    pub fn parse_lossy(value: &str) -> Self {
        match value {
            "canvas" => Category::Canvas,
            "webgl" => Category::Webgl,
            "audio" => Category::Audio,
            "fonts" => Category::Fonts,
            "hardware" => Category::Hardware,
            "navigator" => Category::Navigator,
            "screen" => Category::Screen,
            "timing" => Category::Timing,
            "storage" => Category::Storage,
            "network" => Category::Network,
            other => {
                tracing::debug!("unknown detection category '{other}', coercing to navigator");
                Category::Navigator
            }
        }
    }
}

/// Probe severities
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Parse a wire value, coercing anything unknown to [`Severity::Medium`]
    pub fn parse_lossy(value: &str) -> Self {
        match value {
            "low" => Severity::Low,
            "medium" => Severity::Medium,
            "high" => Severity::High,
            "critical" => Severity::Critical,
            _ => Severity::Medium,
        }
    }
}

/// Raw detection input as it arrives off the wire; category and severity
/// may be anything and get coerced on report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub category: String,
    pub method: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Enriched, counted record delivered to subscribers and the external
/// aggregator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionRecord {
    pub category: Category,
    pub method: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub timestamp: u64,
    pub url: String,
    pub detection_count: u64,
    pub total_detections: u64,
}

/// Aggregate counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionStats {
    pub total_detections: u64,
    pub categories: HashMap<String, u64>,
}

/// Subscriber handle returned by [`DetectionReporter::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

type Callback = Box<dyn Fn(&DetectionRecord) + Send + Sync>;

/// Per-page detection aggregator
pub struct DetectionReporter {
    url: String,
    counts: Mutex<HashMap<Category, u64>>,
    subscribers: Mutex<Vec<(SubscriberId, Callback)>>,
    next_subscriber: AtomicU64,
}

impl DetectionReporter {
    /// Create a reporter for one page context
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            counts: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber: AtomicU64::new(1),
        }
    }

    /// Register a callback for every future record
    pub fn subscribe(&self, callback: impl Fn(&DetectionRecord) + Send + Sync + 'static) -> SubscriberId {
        let id = SubscriberId(self.next_subscriber.fetch_add(1, Ordering::Relaxed));
        self.lock_subscribers().push((id, Box::new(callback)));
        id
    }

    /// Remove a previously registered callback
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.lock_subscribers().retain(|(sid, _)| *sid != id);
    }

    /// Report a raw detection; invalid category/severity are coerced,
    /// never rejected
    pub fn report(&self, detection: Detection) -> DetectionRecord {
        let category = Category::parse_lossy(&detection.category);
        let severity = Severity::parse_lossy(&detection.severity);
        self.record(category, &detection.method, severity, detection.property, detection.value)
    }

    /// Shorthand used by mitigators at probe sites
    pub fn probe(&self, category: Category, method: &str, severity: Severity) -> DetectionRecord {
        self.record(category, method, severity, None, None)
    }

    fn record(
        &self,
        category: Category,
        method: &str,
        severity: Severity,
        property: Option<String>,
        value: Option<String>,
    ) -> DetectionRecord {
        let (detection_count, total_detections) = {
            let mut counts = match self.counts.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let entry = counts.entry(category).or_insert(0);
            *entry += 1;
            let per_category = *entry;
            let total: u64 = counts.values().sum();
            (per_category, total)
        };

        let record = DetectionRecord {
            category,
            method: method.to_string(),
            severity,
            property,
            value,
            timestamp: now_ms(),
            url: self.url.clone(),
            detection_count,
            total_detections,
        };

        // Fan out with per-subscriber isolation: a panicking callback
        // must not block the rest or poison the reporter
        let subscribers = self.lock_subscribers();
        for (id, callback) in subscribers.iter() {
            let outcome = catch_unwind(AssertUnwindSafe(|| callback(&record)));
            if outcome.is_err() {
                tracing::warn!("detection subscriber {:?} panicked", id);
            }
        }

        record
    }

    /// Categorize a canvas entry-point access; only read/export methods
    /// count as probes
    pub fn canvas_access(&self, method: &str) -> Option<DetectionRecord> {
        matches!(method, "getImageData" | "toDataURL" | "toBlob").then(|| {
            self.record(
                Category::Canvas,
                method,
                Severity::High,
                Some(format!("canvas.{method}")),
                None,
            )
        })
    }

    /// Categorize a WebGL `getParameter` query by parameter name
    pub fn webgl_access(&self, parameter: &str) -> Option<DetectionRecord> {
        matches!(
            parameter,
            "VENDOR"
                | "RENDERER"
                | "VERSION"
                | "SHADING_LANGUAGE_VERSION"
                | "UNMASKED_VENDOR_WEBGL"
                | "UNMASKED_RENDERER_WEBGL"
        )
        .then(|| {
            self.record(
                Category::Webgl,
                "getParameter",
                Severity::High,
                Some(format!("webgl.{parameter}")),
                None,
            )
        })
    }

    /// Categorize a navigator property read; the high-entropy hardware
    /// counters rate critical
    pub fn navigator_access(&self, property: &str) -> Option<DetectionRecord> {
        let severity = match property {
            "hardwareConcurrency" | "deviceMemory" => Severity::Critical,
            "platform" | "userAgent" | "languages" | "plugins" | "mimeTypes" => Severity::Medium,
            _ => return None,
        };
        Some(self.record(
            Category::Navigator,
            "propertyAccess",
            severity,
            Some(format!("navigator.{property}")),
            None,
        ))
    }

    /// Categorize a screen property read
    pub fn screen_access(&self, property: &str) -> Option<DetectionRecord> {
        matches!(
            property,
            "width" | "height" | "availWidth" | "availHeight" | "colorDepth" | "pixelDepth"
        )
        .then(|| {
            self.record(
                Category::Screen,
                "propertyAccess",
                Severity::Medium,
                Some(format!("screen.{property}")),
                None,
            )
        })
    }

    /// Aggregate counts by category plus the running total
    pub fn stats(&self) -> DetectionStats {
        let counts = match self.counts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        DetectionStats {
            total_detections: counts.values().sum(),
            categories: counts
                .iter()
                .map(|(category, count)| (category.as_str().to_string(), *count))
                .collect(),
        }
    }

    /// Reset all counters
    pub fn clear_stats(&self) {
        match self.counts.lock() {
            Ok(mut guard) => guard.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, Vec<(SubscriberId, Callback)>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
