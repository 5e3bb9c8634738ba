use tokio::time::Instant;

use super::constants::{INT16_MAX_F, INT16_MIN_F, PCM_SCALE};

/// One fixed-duration block of interleaved i16 PCM.
///
/// Frames are immutable once built; stages take ownership and hand a new
/// frame (usually reusing the same buffer) to the next step.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<i16>,
    channels: usize,
    sequence: u64,
    captured_at: Instant,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, channels: usize, sequence: u64, captured_at: Instant) -> Self {
        Self {
            samples,
            channels: channels.max(1),
            sequence,
            captured_at,
        }
    }

    pub fn silence(len: usize, channels: usize, sequence: u64, captured_at: Instant) -> Self {
        Self::new(vec![0; len], channels, sequence, captured_at)
    }

    /// Same sequence number and timestamp, different samples.
    pub fn with_samples(&self, samples: Vec<i16>) -> Self {
        Self::new(samples, self.channels, self.sequence, self.captured_at)
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn samples_per_channel(&self) -> usize {
        self.samples.len() / self.channels
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Largest absolute sample, normalised to `0.0..=1.0`.
    pub fn peak(&self) -> f32 {
        self.samples
            .iter()
            .map(|&s| (s as i32).unsigned_abs())
            .max()
            .map_or(0.0, |p| p as f32 / PCM_SCALE)
    }

    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .samples
            .iter()
            .map(|&s| {
                let v = s as f64 / PCM_SCALE as f64;
                v * v
            })
            .sum();
        (sum / self.samples.len() as f64).sqrt() as f32
    }
}

#[inline]
pub fn sample_to_f32(sample: i16) -> f32 {
    sample as f32 / PCM_SCALE
}

#[inline]
pub fn f32_to_sample(value: f32) -> i16 {
    (value * PCM_SCALE).round().clamp(INT16_MIN_F, INT16_MAX_F) as i16
}

/// [`f32_to_sample`] rounded to a grid of `bits` significant bits.
#[inline]
pub fn f32_to_sample_at_depth(value: f32, bits: u32) -> i16 {
    if bits >= 16 {
        return f32_to_sample(value);
    }
    let step = (1u32 << (16 - bits.max(1))) as f32;
    ((value * PCM_SCALE / step).round() * step).clamp(INT16_MIN_F, INT16_MAX_F) as i16
}
