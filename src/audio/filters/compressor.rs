use super::DspStage;
use crate::audio::constants::{MAX_LOOKAHEAD_MS, db_to_gain, gain_to_db};
use crate::common::StageError;
use crate::configs::CompressorConfig;
use crate::quality::QualityProfile;

/// Feed-forward peak compressor with a stereo-linked envelope.
///
/// The envelope reads the undelayed input while gain is applied to a copy
/// delayed by the lookahead, so transients are caught before they pass.
pub struct Compressor {
    config: CompressorConfig,
    channels: usize,
    sample_rate: u32,
    attack_coef: f32,
    release_coef: f32,
    makeup: f32,
    envelope: f32,
    delay: Vec<f32>,
    delay_frames: usize,
    lookahead_frames: usize,
    write_pos: usize,
}

impl Compressor {
    pub fn new(config: CompressorConfig, channels: usize, sample_rate: u32) -> Self {
        let channels = channels.max(1);
        let rate = sample_rate as f32;
        let delay_frames = (MAX_LOOKAHEAD_MS * rate / 1000.0).ceil() as usize + 1;
        Self {
            attack_coef: (-1.0 / ((config.attack_ms / 1000.0).max(1e-4) * rate)).exp(),
            release_coef: (-1.0 / ((config.release_ms / 1000.0).max(1e-3) * rate)).exp(),
            makeup: db_to_gain(config.makeup_db),
            config,
            channels,
            sample_rate,
            envelope: 0.0,
            delay: vec![0.0; delay_frames * channels],
            delay_frames,
            lookahead_frames: 0,
            write_pos: 0,
        }
    }

    pub fn lookahead_frames(&self) -> usize {
        self.lookahead_frames
    }

    pub fn envelope(&self) -> f32 {
        self.envelope
    }

    pub fn ratio(&self) -> f32 {
        self.config.ratio
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Maps `amount` in `0.0..=1.0` onto a ratio between 1:1 and `max_ratio`:1.
    /// Zero switches the stage off.
    pub fn set_amount(&mut self, amount: f32) {
        let amount = amount.clamp(0.0, 1.0);
        self.config.ratio = 1.0 + amount * (self.config.max_ratio - 1.0).max(0.0);
        self.config.enabled = amount > 0.0;
        if !self.config.enabled {
            self.envelope = 0.0;
        }
    }

    fn gain_for(&self, envelope: f32) -> f32 {
        let env_db = gain_to_db(envelope);
        let reduction_db = if env_db > self.config.threshold_db {
            (self.config.threshold_db - env_db) * (1.0 - 1.0 / self.config.ratio)
        } else {
            0.0
        };
        db_to_gain(reduction_db) * self.makeup
    }
}

impl DspStage for Compressor {
    fn name(&self) -> &'static str {
        "compressor"
    }

    fn process(&mut self, samples: &mut [f32]) -> Result<(), StageError> {
        if !self.config.enabled {
            return Ok(());
        }
        if samples.len() % self.channels != 0 {
            return Err(StageError::Misaligned {
                stage: self.name(),
                len: samples.len(),
                channels: self.channels,
            });
        }

        let ch = self.channels;
        for frame in samples.chunks_exact_mut(ch) {
            let peak = frame.iter().fold(0.0f32, |m, s| m.max(s.abs()));
            let coef = if peak > self.envelope {
                self.attack_coef
            } else {
                self.release_coef
            };
            self.envelope = coef * (self.envelope - peak) + peak;
            let gain = self.gain_for(self.envelope);

            let write = self.write_pos * ch;
            self.delay[write..write + ch].copy_from_slice(frame);
            let read_pos = (self.write_pos + self.delay_frames - self.lookahead_frames) % self.delay_frames;
            let read = read_pos * ch;
            for (i, s) in frame.iter_mut().enumerate() {
                *s = self.delay[read + i] * gain;
            }
            self.write_pos = (self.write_pos + 1) % self.delay_frames;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.envelope = 0.0;
        self.delay.fill(0.0);
        self.write_pos = 0;
    }

    fn apply_quality(&mut self, profile: &QualityProfile) {
        let frames = (profile.lookahead_ms.min(MAX_LOOKAHEAD_MS) * self.sample_rate as f32 / 1000.0)
            .round() as usize;
        self.lookahead_frames = frames.min(self.delay_frames - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::QualityLevel;

    #[test]
    fn loud_signal_is_reduced() {
        let mut comp = Compressor::new(CompressorConfig::default(), 2, 48_000);
        let mut last = 0.0;
        for _ in 0..10 {
            let mut frame = vec![0.9f32; 1920];
            comp.process(&mut frame).unwrap();
            last = frame[1919];
        }
        // -0.9 dBFS is 17.1 dB over threshold; 4:1 leaves about 4.3 dB of it.
        assert!(gain_to_db(last) < -12.0, "{}", gain_to_db(last));
    }

    #[test]
    fn quiet_signal_passes_untouched() {
        let mut comp = Compressor::new(CompressorConfig::default(), 2, 48_000);
        let mut frame = vec![0.05f32; 1920];
        comp.process(&mut frame).unwrap();
        assert!(frame.iter().all(|s| (*s - 0.05).abs() < 1e-6));
    }

    #[test]
    fn lookahead_delays_output() {
        let mut comp = Compressor::new(
            CompressorConfig {
                enabled: true,
                threshold_db: 0.0,
                ..CompressorConfig::default()
            },
            1,
            48_000,
        );
        comp.apply_quality(&QualityLevel::High.profile());
        assert_eq!(comp.lookahead_frames(), 240);

        let mut frame = vec![0.0f32; 960];
        frame[0] = 0.5;
        comp.process(&mut frame).unwrap();
        assert_eq!(frame[0], 0.0);
        assert!((frame[240] - 0.5).abs() < 1e-6);

        comp.apply_quality(&QualityLevel::Low.profile());
        assert_eq!(comp.lookahead_frames(), 0);
    }

    #[test]
    fn runtime_amount_sets_ratio_and_bypass() {
        let mut comp = Compressor::new(CompressorConfig::default(), 2, 48_000);
        comp.set_amount(0.5);
        assert!(comp.is_enabled());
        assert!((comp.ratio() - 10.5).abs() < 1e-6);

        comp.set_amount(0.0);
        assert!(!comp.is_enabled());
        assert_eq!(comp.ratio(), 1.0);
        let mut frame = vec![0.9f32; 1920];
        comp.process(&mut frame).unwrap();
        assert!(frame.iter().all(|s| *s == 0.9));
    }
}
