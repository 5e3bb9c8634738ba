//! Master volume with a sinusoidal ramp, and the soft limiter shared with
//! the mixer.

use crate::audio::constants::{LIMITER_SOFTNESS, LIMITER_THRESHOLD};
use crate::audio::frame::{f32_to_sample, sample_to_f32};

/// Exponential knee above a threshold. Output magnitude approaches but never
/// exceeds full scale, so summed sources bend instead of clipping.
#[derive(Debug, Clone, Copy)]
pub struct SoftLimiter {
    threshold: f32,
    headroom: f32,
    softness: f32,
}

impl Default for SoftLimiter {
    fn default() -> Self {
        Self::new(LIMITER_THRESHOLD, LIMITER_SOFTNESS)
    }
}

impl SoftLimiter {
    pub fn new(threshold: f32, softness: f32) -> Self {
        let threshold = threshold.clamp(0.0, 1.0);
        Self {
            threshold,
            headroom: 1.0 - threshold,
            softness,
        }
    }

    /// Limits one normalised sample.
    #[inline]
    pub fn apply(&self, value: f32) -> f32 {
        let abs = value.abs();
        if abs <= self.threshold || self.headroom <= 0.0 {
            return value.clamp(-1.0, 1.0);
        }
        let overshoot = (abs - self.threshold) / self.headroom;
        let softened = 1.0 - (-overshoot * self.softness).exp();
        value.signum() * (self.threshold + self.headroom * softened).min(1.0)
    }
}

/// Guild output volume. Changes fade over `ramp_ms` with a raised-cosine
/// curve so that adjusting the volume never clicks.
pub struct MasterVolume {
    current: f32,
    start: f32,
    target: f32,
    ramp_total: usize,
    ramp_elapsed: usize,
    channels: usize,
    limiter: SoftLimiter,
}

impl MasterVolume {
    pub fn new(volume: f32, sample_rate: u32, channels: usize, ramp_ms: u32) -> Self {
        let volume = volume.clamp(0.0, 1.0);
        let ramp_total = (sample_rate as usize * ramp_ms as usize) / 1000;
        Self {
            current: volume,
            start: volume,
            target: volume,
            ramp_total,
            ramp_elapsed: ramp_total,
            channels: channels.max(1),
            limiter: SoftLimiter::default(),
        }
    }

    /// Requested volume (the ramp may still be on its way there).
    pub fn volume(&self) -> f32 {
        self.target
    }

    pub fn current(&self) -> f32 {
        self.current
    }

    pub fn is_ramping(&self) -> bool {
        self.ramp_elapsed < self.ramp_total
    }

    pub fn set_volume(&mut self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        if (volume - self.target).abs() < f32::EPSILON {
            return;
        }
        self.start = self.current;
        self.target = volume;
        self.ramp_elapsed = 0;
        if self.ramp_total == 0 {
            self.current = volume;
        }
    }

    fn curve(t: f32) -> f32 {
        0.5 * (1.0 - (t * std::f32::consts::PI).cos())
    }

    /// Applies the volume to an interleaved frame in place.
    pub fn process(&mut self, frame: &mut [i16]) {
        let sample_count = frame.len();
        if sample_count == 0 {
            return;
        }

        let (gain_start, gain_end) = if self.is_ramping() {
            let frames = sample_count / self.channels;
            let prev = self.ramp_elapsed;
            let next = (prev + frames).min(self.ramp_total);
            let range = self.target - self.start;
            let gs = self.start + range * Self::curve(prev as f32 / self.ramp_total as f32);
            let ge = self.start + range * Self::curve(next as f32 / self.ramp_total as f32);
            self.ramp_elapsed = next;
            self.current = if next >= self.ramp_total { self.target } else { ge };
            (gs, ge)
        } else {
            (self.target, self.target)
        };

        if gain_start == 1.0 && gain_end == 1.0 {
            return;
        }

        let step = if sample_count > 1 {
            (gain_end - gain_start) / (sample_count - 1) as f32
        } else {
            0.0
        };
        let mut gain = gain_start;
        for s in frame.iter_mut() {
            *s = f32_to_sample(self.limiter.apply(sample_to_f32(*s) * gain));
            gain += step;
        }
    }
}
