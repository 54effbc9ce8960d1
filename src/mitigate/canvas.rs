//! Canvas surface mitigation
//!
//! Perturbs a bounded handful of pixel channels on every pixel read and
//! encoded export, and jitters text-metric widths. Noise is seeded from the
//! origin plus the buffer length, so two reads of the same canvas in one
//! page load return byte-identical buffers while distinct origins diverge.

use std::sync::Arc;

use crate::detect::{Category, DetectionReporter, Severity};
use crate::error::{Error, Result};
use crate::prng::{fnv1a, OriginRng};

use super::{quantize_half, FnIdentity, MitigationCtx, Mitigator, PageSurfaces, SurfaceId};

/// Hard cap on perturbed channel samples per read
const MAX_NOISE_SAMPLES: usize = 200;
/// Fraction of pixels sampled for perturbation
const NOISE_RATE: f64 = 0.000_05;

/// Snapshot of a canvas backing store (RGBA8)
#[derive(Debug, Clone)]
pub struct CanvasState {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl CanvasState {
    /// A canvas filled with one RGBA value
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let mut data = Vec::with_capacity((width * height * 4) as usize);
        for _ in 0..(width * height) {
            data.extend_from_slice(&rgba);
        }
        Self {
            width,
            height,
            data,
        }
    }
}

/// Encoded-export format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
}

/// Text measurement result
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextMetrics {
    pub width: f64,
    pub ascent: f64,
    pub descent: f64,
}

/// Patched canvas entry points
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanvasEntry {
    ReadPixels,
    Export,
    MeasureText,
}

/// The canvas capability: pixel reads, encoded exports, text metrics
pub trait CanvasSurface: Send + Sync {
    /// RGBA snapshot, the `getImageData` analog
    fn read_pixels(&self, canvas: &CanvasState) -> Vec<u8>;
    /// Encoded export, the `toDataURL`/`toBlob` analog
    fn encode(&self, canvas: &CanvasState, format: ImageFormat) -> Result<Vec<u8>>;
    /// Text metrics for a text/font pair
    fn measure_text(&self, text: &str, font: &str) -> TextMetrics;
    fn identity(&self, entry: CanvasEntry) -> &FnIdentity;
}

/// Reference native canvas backed directly by the snapshot buffer.
///
/// Embeddings bind this seam to the real rendering surface; this impl is
/// enough for in-process use and tests.
pub struct RasterCanvas {
    read_id: FnIdentity,
    export_id: FnIdentity,
    measure_id: FnIdentity,
}

/// Per-character advance of the reference text measurer
const CHAR_ADVANCE: f64 = 7.3;

impl RasterCanvas {
    pub fn new() -> Self {
        Self {
            read_id: FnIdentity::native("getImageData", 4),
            export_id: FnIdentity::native("toDataURL", 2),
            measure_id: FnIdentity::native("measureText", 1),
        }
    }
}

impl Default for RasterCanvas {
    fn default() -> Self {
        Self::new()
    }
}

impl CanvasSurface for RasterCanvas {
    fn read_pixels(&self, canvas: &CanvasState) -> Vec<u8> {
        canvas.data.clone()
    }

    fn encode(&self, canvas: &CanvasState, format: ImageFormat) -> Result<Vec<u8>> {
        let marker: &[u8] = match format {
            ImageFormat::Png => b"PNG0",
            ImageFormat::Jpeg => b"JPG0",
        };
        let mut out = Vec::with_capacity(4 + canvas.data.len());
        out.extend_from_slice(marker);
        out.extend_from_slice(&canvas.data);
        Ok(out)
    }

    fn measure_text(&self, text: &str, _font: &str) -> TextMetrics {
        TextMetrics {
            width: text.chars().count() as f64 * CHAR_ADVANCE,
            ascent: 8.0,
            descent: 2.0,
        }
    }

    fn identity(&self, entry: CanvasEntry) -> &FnIdentity {
        match entry {
            CanvasEntry::ReadPixels => &self.read_id,
            CanvasEntry::Export => &self.export_id,
            CanvasEntry::MeasureText => &self.measure_id,
        }
    }
}

/// Decorator adding deterministic noise over a native canvas surface
pub struct NoisyCanvas {
    native: Box<dyn CanvasSurface>,
    rng: OriginRng,
    reporter: Arc<DetectionReporter>,
}

impl NoisyCanvas {
    pub fn wrap(
        native: Box<dyn CanvasSurface>,
        rng: OriginRng,
        reporter: Arc<DetectionReporter>,
    ) -> Self {
        Self {
            native,
            rng,
            reporter,
        }
    }

    /// Perturb at most [`MAX_NOISE_SAMPLES`] channel values in place.
    ///
    /// Seed = origin + buffer length; channel in {R,G,B}; delta in
    /// {-1, 0, +1}; results clamped to [0, 255]. Errors out on a
    /// malformed buffer so callers can fall back to the native result.
    fn add_noise(&self, data: &mut [u8]) -> Result<()> {
        if data.len() % 4 != 0 {
            return Err(Error::mitigation("canvas", "buffer not RGBA-aligned"));
        }
        let pixel_count = data.len() / 4;
        if pixel_count == 0 {
            return Ok(());
        }

        let mut local = self.rng.stream_mixed(&[data.len() as u32]);
        let noise_count = ((pixel_count as f64 * NOISE_RATE) as usize).clamp(1, MAX_NOISE_SAMPLES);

        for _ in 0..noise_count {
            let pixel = local.next_index(pixel_count) * 4;
            let channel = local.next_index(3);
            let delta = local.next_unit_step();
            let value = i16::from(data[pixel + channel]) + delta;
            data[pixel + channel] = value.clamp(0, 255) as u8;
        }
        Ok(())
    }
}

impl CanvasSurface for NoisyCanvas {
    fn read_pixels(&self, canvas: &CanvasState) -> Vec<u8> {
        self.reporter
            .probe(Category::Canvas, "getImageData", Severity::High);

        let mut data = self.native.read_pixels(canvas);
        if let Err(err) = self.add_noise(&mut data) {
            tracing::debug!("canvas noise skipped: {err}");
            return self.native.read_pixels(canvas);
        }
        data
    }

    fn encode(&self, canvas: &CanvasState, format: ImageFormat) -> Result<Vec<u8>> {
        self.reporter
            .probe(Category::Canvas, "toDataURL", Severity::High);

        // Noise the export through a scratch copy so the visible canvas
        // never flickers; any failure falls back to the untouched native
        // export.
        let mut scratch = canvas.clone();
        match self.add_noise(&mut scratch.data) {
            Ok(()) => self.native.encode(&scratch, format),
            Err(err) => {
                tracing::debug!("canvas export noise skipped: {err}");
                self.native.encode(canvas, format)
            }
        }
    }

    fn measure_text(&self, text: &str, font: &str) -> TextMetrics {
        self.reporter
            .probe(Category::Canvas, "measureText", Severity::Medium);

        let metrics = self.native.measure_text(text, font);

        let mut local = self
            .rng
            .stream_mixed(&[fnv1a(&format!("{text}{font}"))]);
        let jitter = (local.next_f64() - 0.5) * 0.02;

        TextMetrics {
            width: quantize_half(metrics.width + jitter),
            ..metrics
        }
    }

    fn identity(&self, entry: CanvasEntry) -> &FnIdentity {
        self.native.identity(entry)
    }
}

/// Installs the noisy canvas decorator
pub struct CanvasMitigator;

impl Mitigator for CanvasMitigator {
    fn surface(&self) -> SurfaceId {
        SurfaceId::Canvas
    }

    fn enabled(&self, config: &crate::ShroudConfig) -> bool {
        config.spoof_canvas
    }

    fn apply(&self, mut page: PageSurfaces, ctx: &MitigationCtx) -> PageSurfaces {
        page.canvas = Box::new(NoisyCanvas::wrap(
            page.canvas,
            ctx.rng,
            Arc::clone(&ctx.reporter),
        ));
        page
    }
}
