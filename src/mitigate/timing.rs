//! Timing surface mitigation
//!
//! Elapsed-time reads are quantized to fixed 100ms buckets. Within one
//! bucket every read at the same call site returns the identical value:
//! the jitter is computed once per bucket (seeded from bucket, origin and
//! call-site salt) and cached until the bucket advances.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::prng::OriginRng;

use super::{FnIdentity, MitigationCtx, Mitigator, PageSurfaces, SurfaceId};

/// Bucket width in milliseconds
const BUCKET_MS: f64 = 100.0;

/// Call sites with independent jitter streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeSite {
    /// `performance.now` analog
    Now,
    /// Animation-frame timestamps
    AnimationFrame,
    /// Performance-entry start times
    EntryStart,
    /// Performance-entry durations
    EntryDuration,
}

impl TimeSite {
    fn salt(&self) -> u32 {
        match self {
            TimeSite::Now => 0xA11CE,
            TimeSite::AnimationFrame => 0xBEEF,
            TimeSite::EntryStart => 0xC0DE,
            TimeSite::EntryDuration => 0xD00D,
        }
    }
}

/// The elapsed-time capability
pub trait TimeSurface: Send + Sync {
    /// Milliseconds since the page time origin, as observed at `site`
    fn elapsed_ms(&self, site: TimeSite) -> f64;
    fn identity(&self, site: TimeSite) -> &FnIdentity;
}

/// Reference native clock: monotonic milliseconds since construction
pub struct MonotonicClock {
    epoch: Instant,
    now_id: FnIdentity,
    frame_id: FnIdentity,
    entry_id: FnIdentity,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            now_id: FnIdentity::native("now", 0),
            frame_id: FnIdentity::native("requestAnimationFrame", 1),
            entry_id: FnIdentity::native("getEntriesByType", 1),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSurface for MonotonicClock {
    fn elapsed_ms(&self, _site: TimeSite) -> f64 {
        self.epoch.elapsed().as_secs_f64() * 1000.0
    }

    fn identity(&self, site: TimeSite) -> &FnIdentity {
        match site {
            TimeSite::Now => &self.now_id,
            TimeSite::AnimationFrame => &self.frame_id,
            TimeSite::EntryStart | TimeSite::EntryDuration => &self.entry_id,
        }
    }
}

/// Decorator quantizing reads into jittered buckets
pub struct BucketedTime {
    native: Box<dyn TimeSurface>,
    rng: OriginRng,
    /// Cached (bucket, jitter) per call site, replaced when the bucket
    /// advances
    cache: Mutex<HashMap<TimeSite, (u64, f64)>>,
}

impl BucketedTime {
    pub fn wrap(native: Box<dyn TimeSurface>, rng: OriginRng) -> Self {
        Self {
            native,
            rng,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Quantize one raw reading for a call site
    pub fn bucketize(&self, site: TimeSite, raw_ms: f64) -> f64 {
        let bucket = (raw_ms / BUCKET_MS).floor().max(0.0) as u64;

        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            // A poisoned cache only loses the memo; recompute instead
            Err(poisoned) => poisoned.into_inner(),
        };
        let (cached_bucket, jitter) = *cache.entry(site).or_insert_with(|| {
            (bucket, Self::bucket_jitter(&self.rng, site, bucket))
        });

        let jitter = if cached_bucket == bucket {
            jitter
        } else {
            let fresh = Self::bucket_jitter(&self.rng, site, bucket);
            cache.insert(site, (bucket, fresh));
            fresh
        };

        bucket as f64 * BUCKET_MS + jitter
    }

    fn bucket_jitter(rng: &OriginRng, site: TimeSite, bucket: u64) -> f64 {
        let seed = (bucket as u32) ^ rng.seed() ^ site.salt();
        let mut local = crate::prng::Mulberry32::new(seed);
        (local.next_f64() * BUCKET_MS).floor()
    }
}

impl TimeSurface for BucketedTime {
    fn elapsed_ms(&self, site: TimeSite) -> f64 {
        let raw = self.native.elapsed_ms(site);
        self.bucketize(site, raw)
    }

    fn identity(&self, site: TimeSite) -> &FnIdentity {
        self.native.identity(site)
    }
}

/// Installs the bucketed clock
pub struct TimingMitigator;

impl Mitigator for TimingMitigator {
    fn surface(&self) -> SurfaceId {
        SurfaceId::Timing
    }

    fn enabled(&self, config: &crate::ShroudConfig) -> bool {
        config.timing_protection
    }

    fn apply(&self, mut page: PageSurfaces, ctx: &MitigationCtx) -> PageSurfaces {
        page.time = Box::new(BucketedTime::wrap(page.time, ctx.rng));
        page
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucketed(origin: &str) -> BucketedTime {
        BucketedTime::wrap(
            Box::new(MonotonicClock::new()),
            OriginRng::for_origin(origin),
        )
    }

    #[test]
    fn test_same_bucket_same_value() {
        let time = bucketed("https://example.com");
        let a = time.bucketize(TimeSite::Now, 1234.0);
        let b = time.bucketize(TimeSite::Now, 1299.9);
        assert_eq!(a.to_bits(), b.to_bits());
    }

    #[test]
    fn test_next_bucket_new_jitter() {
        let time = bucketed("https://example.com");
        let a = time.bucketize(TimeSite::Now, 1234.0);
        let b = time.bucketize(TimeSite::Now, 1350.0);
        assert_ne!(a.to_bits(), b.to_bits());
        // Jitter changes, not just the bucket base
        assert_ne!((a - 1200.0).to_bits(), (b - 1300.0).to_bits());
    }

    #[test]
    fn test_value_within_bucket_window() {
        let time = bucketed("https://example.com");
        for raw in [0.0, 99.0, 512.7, 100_000.3] {
            let v = time.bucketize(TimeSite::Now, raw);
            let base = (raw / BUCKET_MS).floor() * BUCKET_MS;
            assert!(v >= base);
            assert!(v < base + BUCKET_MS);
        }
    }

    #[test]
    fn test_call_sites_independent() {
        let time = bucketed("https://example.com");
        let now = time.bucketize(TimeSite::Now, 5000.0);
        let frame = time.bucketize(TimeSite::AnimationFrame, 5000.0);
        assert_ne!(now.to_bits(), frame.to_bits());
    }

    #[test]
    fn test_returning_to_old_bucket_recomputes_deterministically() {
        let time = bucketed("https://example.com");
        let first = time.bucketize(TimeSite::EntryStart, 700.0);
        let _advance = time.bucketize(TimeSite::EntryStart, 900.0);
        // Entry start times can be re-read for old entries; the jitter is
        // a pure function of (bucket, origin, site) so the value repeats
        let again = time.bucketize(TimeSite::EntryStart, 700.0);
        assert_eq!(first.to_bits(), again.to_bits());
    }

    #[test]
    fn test_origins_diverge() {
        let a = bucketed("https://example.com").bucketize(TimeSite::Now, 5000.0);
        let b = bucketed("https://example.org").bucketize(TimeSite::Now, 5000.0);
        assert_ne!(a.to_bits(), b.to_bits());
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let clock = MonotonicClock::new();
        let a = clock.elapsed_ms(TimeSite::Now);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = clock.elapsed_ms(TimeSite::Now);
        assert!(b > a);
    }
}
