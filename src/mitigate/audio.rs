//! Audio surface mitigation
//!
//! Buffer reads get at most twenty samples perturbed at an inaudible
//! amplitude, enough to break exact-byte reproducibility of rendered
//! audio. Analyser output gets a sparse perturbation over roughly one in
//! thirty-two entries.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::detect::{Category, DetectionReporter, Severity};
use crate::prng::OriginRng;

use super::{FnIdentity, MitigationCtx, Mitigator, PageSurfaces, SurfaceId};

/// Samples perturbed per channel read
const MAX_BUFFER_SAMPLES: usize = 20;
/// Buffer perturbation amplitude (±1e-7)
const BUFFER_AMPLITUDE: f64 = 2e-7;
/// Analyser perturbation amplitude (±5e-4)
const ANALYSER_AMPLITUDE: f64 = 1e-3;

/// Analyser entry-point salts
const SALT_FLOAT_FREQUENCY: u32 = 0xF00D;
const SALT_BYTE_FREQUENCY: u32 = 0xFACE;
const SALT_TIME_DOMAIN: u32 = 0xCAFE;

/// A decoded audio buffer: per-channel sample data plus rate
#[derive(Debug, Clone)]
pub struct AudioBlock {
    pub sample_rate: u32,
    pub channels: Vec<Vec<f32>>,
}

impl AudioBlock {
    /// Length in sample frames of the first channel
    pub fn len(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The `AudioBuffer.getChannelData` analog
pub trait AudioSurface: Send + Sync {
    fn channel_data(&self, block: &AudioBlock, channel: usize) -> Vec<f32>;
    fn identity(&self) -> &FnIdentity;
}

/// The analyser-node read family
pub trait AnalyserSurface: Send + Sync {
    fn float_frequency(&self, out: &mut [f32]);
    fn byte_frequency(&self, out: &mut [u8]);
    fn float_time_domain(&self, out: &mut [f32]);
    fn identity(&self) -> &FnIdentity;
}

/// Reference native buffer reader
pub struct PcmAudio {
    id: FnIdentity,
}

impl PcmAudio {
    pub fn new() -> Self {
        Self {
            id: FnIdentity::native("getChannelData", 1),
        }
    }
}

impl Default for PcmAudio {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSurface for PcmAudio {
    fn channel_data(&self, block: &AudioBlock, channel: usize) -> Vec<f32> {
        block.channels.get(channel).cloned().unwrap_or_default()
    }

    fn identity(&self) -> &FnIdentity {
        &self.id
    }
}

/// Reference native analyser holding a fixed capture
pub struct CaptureAnalyser {
    pub frequency: Vec<f32>,
    pub time_domain: Vec<f32>,
    id: FnIdentity,
}

impl CaptureAnalyser {
    pub fn new(frequency: Vec<f32>, time_domain: Vec<f32>) -> Self {
        Self {
            frequency,
            time_domain,
            id: FnIdentity::native("getFloatFrequencyData", 1),
        }
    }
}

impl AnalyserSurface for CaptureAnalyser {
    fn float_frequency(&self, out: &mut [f32]) {
        for (slot, value) in out.iter_mut().zip(self.frequency.iter()) {
            *slot = *value;
        }
    }

    fn byte_frequency(&self, out: &mut [u8]) {
        for (slot, value) in out.iter_mut().zip(self.frequency.iter()) {
            *slot = value.clamp(0.0, 255.0) as u8;
        }
    }

    fn float_time_domain(&self, out: &mut [f32]) {
        for (slot, value) in out.iter_mut().zip(self.time_domain.iter()) {
            *slot = *value;
        }
    }

    fn identity(&self) -> &FnIdentity {
        &self.id
    }
}

/// Buffer decorator: seed = origin + length + sample rate + channel index
pub struct JitteredAudio {
    native: Box<dyn AudioSurface>,
    rng: OriginRng,
    reporter: Arc<DetectionReporter>,
}

impl JitteredAudio {
    pub fn wrap(
        native: Box<dyn AudioSurface>,
        rng: OriginRng,
        reporter: Arc<DetectionReporter>,
    ) -> Self {
        Self {
            native,
            rng,
            reporter,
        }
    }
}

impl AudioSurface for JitteredAudio {
    fn channel_data(&self, block: &AudioBlock, channel: usize) -> Vec<f32> {
        self.reporter
            .probe(Category::Audio, "getChannelData", Severity::Medium);

        let mut data = self.native.channel_data(block, channel);
        if data.is_empty() {
            return data;
        }

        let mut local = self.rng.stream_mixed(&[
            data.len() as u32,
            block.sample_rate,
            channel as u32,
        ]);

        // Pick indices first so the jitter draw order matches the pick
        // order deterministically for a given seed
        let count = MAX_BUFFER_SAMPLES.min(data.len());
        let mut picks: SmallVec<[(usize, f32); MAX_BUFFER_SAMPLES]> = SmallVec::new();
        for _ in 0..count {
            let index = local.next_index(data.len());
            let jitter = ((local.next_f64() - 0.5) * BUFFER_AMPLITUDE) as f32;
            picks.push((index, jitter));
        }
        for (index, jitter) in picks {
            data[index] += jitter;
        }
        data
    }

    fn identity(&self) -> &FnIdentity {
        self.native.identity()
    }
}

/// Analyser decorator: sparse perturbation, one entry in ~32
pub struct JitteredAnalyser {
    native: Box<dyn AnalyserSurface>,
    rng: OriginRng,
    reporter: Arc<DetectionReporter>,
}

impl JitteredAnalyser {
    pub fn wrap(
        native: Box<dyn AnalyserSurface>,
        rng: OriginRng,
        reporter: Arc<DetectionReporter>,
    ) -> Self {
        Self {
            native,
            rng,
            reporter,
        }
    }

    fn jitter_floats(&self, out: &mut [f32], salt: u32) {
        if out.is_empty() {
            return;
        }
        let mut local = self.rng.stream(salt);
        let stride = (out.len() / 32).max(1);
        let mut i = 0;
        while i < out.len() {
            out[i] += ((local.next_f64() - 0.5) * ANALYSER_AMPLITUDE) as f32;
            i += stride;
        }
    }
}

impl AnalyserSurface for JitteredAnalyser {
    fn float_frequency(&self, out: &mut [f32]) {
        self.reporter
            .probe(Category::Audio, "getFloatFrequencyData", Severity::Medium);
        self.native.float_frequency(out);
        self.jitter_floats(out, SALT_FLOAT_FREQUENCY);
    }

    fn byte_frequency(&self, out: &mut [u8]) {
        self.reporter
            .probe(Category::Audio, "getByteFrequencyData", Severity::Medium);
        self.native.byte_frequency(out);
        if out.is_empty() {
            return;
        }
        // Quantized analog of the float perturbation: one saturating step
        let mut local = self.rng.stream(SALT_BYTE_FREQUENCY);
        let stride = (out.len() / 32).max(1);
        let mut i = 0;
        while i < out.len() {
            if local.next_f64() < 0.5 {
                out[i] = out[i].saturating_sub(1);
            } else {
                out[i] = out[i].saturating_add(1);
            }
            i += stride;
        }
    }

    fn float_time_domain(&self, out: &mut [f32]) {
        self.reporter
            .probe(Category::Audio, "getFloatTimeDomainData", Severity::Medium);
        self.native.float_time_domain(out);
        self.jitter_floats(out, SALT_TIME_DOMAIN);
    }

    fn identity(&self) -> &FnIdentity {
        self.native.identity()
    }
}

/// Installs both audio decorators
pub struct AudioMitigator;

impl Mitigator for AudioMitigator {
    fn surface(&self) -> SurfaceId {
        SurfaceId::Audio
    }

    fn enabled(&self, config: &crate::ShroudConfig) -> bool {
        config.spoof_audio
    }

    fn apply(&self, mut page: PageSurfaces, ctx: &MitigationCtx) -> PageSurfaces {
        page.audio = Box::new(JitteredAudio::wrap(
            page.audio,
            ctx.rng,
            Arc::clone(&ctx.reporter),
        ));
        page.analyser = Box::new(JitteredAnalyser::wrap(
            page.analyser,
            ctx.rng,
            Arc::clone(&ctx.reporter),
        ));
        page
    }
}
