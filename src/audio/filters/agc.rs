use super::DspStage;
use crate::common::StageError;
use crate::configs::AgcConfig;

/// Automatic gain control keeping the frame RMS inside a target band and the
/// peak under a ceiling. Gain follows its target with a one-pole smoother.
pub struct Agc {
    config: AgcConfig,
    channels: usize,
    sample_rate: u32,
    gain: f32,
}

impl Agc {
    pub fn new(config: AgcConfig, channels: usize, sample_rate: u32) -> Self {
        Self {
            config,
            channels: channels.max(1),
            sample_rate,
            gain: 1.0,
        }
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Turning AGC back on starts again from unity gain.
    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled && !self.config.enabled {
            self.gain = 1.0;
        }
        self.config.enabled = enabled;
    }

    fn desired_gain(&self, rms: f32, peak: f32) -> f32 {
        let cfg = &self.config;
        let mut desired = self.gain;
        if rms >= cfg.gate_rms {
            desired = desired.clamp(cfg.target_rms_low / rms, cfg.target_rms_high / rms);
        }
        if peak > 0.0 {
            desired = desired.min(cfg.peak_ceiling / peak);
        }
        desired.clamp(cfg.min_gain, cfg.max_gain)
    }
}

impl DspStage for Agc {
    fn name(&self) -> &'static str {
        "agc"
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

        let mut sum = 0.0f64;
        let mut peak = 0.0f32;
        for &s in samples.iter() {
            sum += (s as f64) * (s as f64);
            peak = peak.max(s.abs());
        }
        let rms = (sum / samples.len() as f64).sqrt() as f32;
        let frames = samples.len() / self.channels;

        let desired = self.desired_gain(rms, peak);
        let dt = frames as f32 / self.sample_rate as f32;
        let tau = (self.config.time_constant_ms / 1000.0).max(1e-4);
        let alpha = 1.0 - (-dt / tau).exp();

        let start = self.gain;
        let mut end = start + alpha * (desired - start);
        // Peaks are pulled under the ceiling at once rather than smoothed.
        if peak * end > self.config.peak_ceiling {
            end = self.config.peak_ceiling / peak;
        }
        self.gain = end.clamp(self.config.min_gain, self.config.max_gain);

        let step = (self.gain - start) / frames as f32;
        for (i, frame) in samples.chunks_exact_mut(self.channels).enumerate() {
            let g = if step == 0.0 { start } else { start + step * (i + 1) as f32 };
            for s in frame {
                *s *= g;
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.gain = 1.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(level: f32, len: usize) -> Vec<f32> {
        (0..len).map(|i| if i % 4 < 2 { level } else { -level }).collect()
    }

    #[test]
    fn quiet_signal_is_pulled_into_band() {
        let mut agc = Agc::new(AgcConfig::default(), 2, 48_000);
        for _ in 0..200 {
            let mut frame = square(0.01, 1920);
            agc.process(&mut frame).unwrap();
        }
        let mut frame = square(0.01, 1920);
        agc.process(&mut frame).unwrap();
        let rms = (frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32).sqrt();
        assert!(rms >= 0.049 && rms <= 0.2, "rms {}", rms);
    }

    #[test]
    fn signal_in_band_keeps_unity_gain() {
        let mut agc = Agc::new(AgcConfig::default(), 2, 48_000);
        for _ in 0..20 {
            let mut frame = square(0.1, 1920);
            agc.process(&mut frame).unwrap();
        }
        assert!((agc.gain() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn gain_is_bounded_and_silence_gated() {
        let mut agc = Agc::new(AgcConfig::default(), 2, 48_000);
        for _ in 0..500 {
            let mut frame = square(0.002, 1920);
            agc.process(&mut frame).unwrap();
        }
        assert!(agc.gain() <= 10.0);

        let before = agc.gain();
        let mut silent = vec![0.0; 1920];
        agc.process(&mut silent).unwrap();
        assert_eq!(agc.gain(), before);
    }

    #[test]
    fn peak_ceiling_is_respected_immediately() {
        let mut agc = Agc::new(AgcConfig::default(), 2, 48_000);
        let mut frame = square(0.99, 1920);
        agc.process(&mut frame).unwrap();
        assert!(agc.gain() * 0.99 <= 0.98 + 1e-6);
    }

    #[test]
    fn disabled_agc_leaves_signal_alone() {
        let mut agc = Agc::new(AgcConfig::default(), 2, 48_000);
        for _ in 0..50 {
            let mut frame = square(0.01, 1920);
            agc.process(&mut frame).unwrap();
        }
        assert!(agc.gain() > 1.0);

        agc.set_enabled(false);
        let mut frame = square(0.01, 1920);
        agc.process(&mut frame).unwrap();
        assert!(frame.iter().all(|s| s.abs() == 0.01));

        agc.set_enabled(true);
        assert_eq!(agc.gain(), 1.0);
    }
}
