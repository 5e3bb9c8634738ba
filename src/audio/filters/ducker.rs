use super::DspStage;
use crate::common::StageError;
use crate::configs::DuckingConfig;

/// Lowers the primary stream while an auxiliary source plays over it.
///
/// The owning pipeline sets the auxiliary level once per frame; the applied
/// gain follows `1 - depth * level` with separate attack and release times.
pub struct Ducker {
    config: DuckingConfig,
    channels: usize,
    attack_coef: f32,
    release_coef: f32,
    level: f32,
    gain: f32,
}

impl Ducker {
    pub fn new(config: DuckingConfig, channels: usize, sample_rate: u32) -> Self {
        let rate = sample_rate as f32;
        Self {
            attack_coef: (-1.0 / ((config.attack_ms / 1000.0).max(1e-4) * rate)).exp(),
            release_coef: (-1.0 / ((config.release_ms / 1000.0).max(1e-4) * rate)).exp(),
            config,
            channels: channels.max(1),
            level: 0.0,
            gain: 1.0,
        }
    }

    /// Auxiliary level in `0.0..=1.0`; `0.0` means nothing to duck under.
    pub fn set_level(&mut self, level: f32) {
        self.level = if level.is_finite() { level.clamp(0.0, 1.0) } else { 0.0 };
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    fn target(&self) -> f32 {
        1.0 - self.config.depth * self.level
    }
}

impl DspStage for Ducker {
    fn name(&self) -> &'static str {
        "ducker"
    }

    fn process(&mut self, samples: &mut [f32]) -> Result<(), StageError> {
        if samples.len() % self.channels != 0 {
            return Err(StageError::Misaligned {
                stage: self.name(),
                len: samples.len(),
                channels: self.channels,
            });
        }
        let target = self.target();
        if self.gain == 1.0 && target == 1.0 {
            return Ok(());
        }
        let coef = if target < self.gain {
            self.attack_coef
        } else {
            self.release_coef
        };
        for frame in samples.chunks_exact_mut(self.channels) {
            self.gain = coef * (self.gain - target) + target;
            for s in frame {
                *s *= self.gain;
            }
        }
        if (self.gain - target).abs() < 1e-5 {
            self.gain = target;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.gain = 1.0;
        self.level = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ducks_and_releases() {
        let mut ducker = Ducker::new(DuckingConfig::default(), 2, 48_000);
        let mut frame = vec![0.5f32; 1920];
        ducker.process(&mut frame).unwrap();
        assert_eq!(frame[0], 0.5);

        ducker.set_level(1.0);
        for _ in 0..50 {
            let mut frame = vec![0.5f32; 1920];
            ducker.process(&mut frame).unwrap();
        }
        assert!((ducker.gain() - 0.3).abs() < 1e-3);

        ducker.set_level(0.0);
        let mut frame = vec![0.5f32; 1920];
        ducker.process(&mut frame).unwrap();
        // release is slower than attack, so one frame only recovers part of the way
        assert!(ducker.gain() > 0.3 && ducker.gain() < 1.0);
        for i in (2..frame.len()).step_by(2) {
            assert!(frame[i] >= frame[i - 2]);
        }
    }
}
