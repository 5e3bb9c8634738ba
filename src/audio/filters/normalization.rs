use std::collections::VecDeque;

use super::DspStage;
use crate::audio::constants::{LUFS_OFFSET_DB, MIN_DB, db_to_gain};
use crate::common::StageError;
use crate::configs::NormalizerConfig;
use crate::quality::QualityProfile;

/// Loudness normaliser.
///
/// Short-term loudness is the mean square over the last `window_ms` of input,
/// read every `stride` sample frames. The correction toward the target is
/// rate-limited per frame and interpolated across the samples of the frame.
pub struct Normalizer {
    config: NormalizerConfig,
    channels: usize,
    sample_rate: u32,
    stride: usize,
    window: VecDeque<f64>,
    window_sum: f64,
    gain_db: f32,
}

impl Normalizer {
    pub fn new(config: NormalizerConfig, channels: usize, sample_rate: u32) -> Self {
        Self {
            config,
            channels: channels.max(1),
            sample_rate,
            stride: 1,
            window: VecDeque::new(),
            window_sum: 0.0,
            gain_db: 0.0,
        }
    }

    pub fn gain_db(&self) -> f32 {
        self.gain_db
    }

    pub fn target_lufs(&self) -> f32 {
        self.config.target_lufs
    }

    /// Moves the loudness target. The current gain glides toward it at the usual rate.
    pub fn set_target(&mut self, lufs: f32) {
        self.config.target_lufs = lufs;
    }

    /// Short-term loudness of the current window, `None` while it is empty.
    pub fn loudness_lufs(&self) -> Option<f32> {
        if self.window.is_empty() {
            return None;
        }
        let mean = (self.window_sum / self.window.len() as f64).max(0.0);
        if mean <= 0.0 {
            return Some(MIN_DB);
        }
        Some((10.0 * mean.log10()) as f32 + LUFS_OFFSET_DB)
    }

    fn measure(&self, samples: &[f32]) -> f64 {
        let mut sum = 0.0f64;
        let mut count = 0usize;
        for frame in samples.chunks_exact(self.channels).step_by(self.stride) {
            for &s in frame {
                sum += (s as f64) * (s as f64);
            }
            count += 1;
        }
        if count == 0 {
            return 0.0;
        }
        sum / (count * self.channels) as f64
    }
}

impl DspStage for Normalizer {
    fn name(&self) -> &'static str {
        "normalizer"
    }

    fn process(&mut self, samples: &mut [f32]) -> Result<(), StageError> {
        if !self.config.enabled || samples.is_empty() {
            return Ok(());
        }
        if samples.len() % self.channels != 0 {
            return Err(StageError::Misaligned {
                stage: self.name(),
                len: samples.len(),
                channels: self.channels,
            });
        }

        let frames = samples.len() / self.channels;
        let frame_ms = frames as f32 * 1000.0 / self.sample_rate as f32;
        let capacity = (self.config.window_ms as f32 / frame_ms).ceil().max(1.0) as usize;

        let mean_square = self.measure(samples);
        self.window.push_back(mean_square);
        self.window_sum += mean_square;
        while self.window.len() > capacity {
            if let Some(old) = self.window.pop_front() {
                self.window_sum -= old;
            }
        }

        let previous = self.gain_db;
        if let Some(lufs) = self.loudness_lufs()
            && lufs >= self.config.gate_lufs
        {
            let desired = (self.config.target_lufs - lufs)
                .clamp(self.config.min_gain_db, self.config.max_gain_db);
            let max_step = self.config.max_change_db_per_100ms * frame_ms / 100.0;
            self.gain_db += (desired - self.gain_db).clamp(-max_step, max_step);
        }

        let start = db_to_gain(previous);
        let end = db_to_gain(self.gain_db);
        if (start - 1.0).abs() < f32::EPSILON && (end - 1.0).abs() < f32::EPSILON {
            return Ok(());
        }
        let step = (end - start) / frames as f32;
        for (i, frame) in samples.chunks_exact_mut(self.channels).enumerate() {
            let gain = start + step * (i + 1) as f32;
            for s in frame {
                *s *= gain;
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.window.clear();
        self.window_sum = 0.0;
        self.gain_db = 0.0;
    }

    fn apply_quality(&mut self, profile: &QualityProfile) {
        self.stride = profile.analysis_stride(self.sample_rate);
    }
}
