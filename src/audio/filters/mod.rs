//! Per-guild DSP chain.
//!
//! Stages run in a fixed order on an interleaved f32 copy of each frame:
//! normalizer, AGC, equalizer, compressor, ducker. The chain owns every
//! buffer it needs, so steady-state processing does not allocate.

pub mod agc;
pub mod biquad;
pub mod compressor;
pub mod ducker;
pub mod equalizer;
pub mod normalization;

pub use agc::Agc;
pub use compressor::Compressor;
pub use ducker::Ducker;
pub use equalizer::{EqGains, EqPreset, ThreeBandEqualizer};
pub use normalization::Normalizer;

use serde::Serialize;
use tracing::warn;

use super::frame::{AudioFrame, f32_to_sample_at_depth, sample_to_f32};
use crate::common::{EngineError, GuildId, StageError};
use crate::configs::{DspConfig, EngineConfig};
use crate::quality::QualityProfile;

/// One processing step of the chain. Buffers are interleaved, normalised to
/// `[-1.0, 1.0]`, and always a whole number of sample frames.
pub trait DspStage: Send {
    fn name(&self) -> &'static str;
    /// Process samples in place.
    fn process(&mut self, samples: &mut [f32]) -> Result<(), StageError>;
    /// Drop all internal state.
    fn reset(&mut self);
    /// Adopt the parameters of a new quality level. Called between frames.
    fn apply_quality(&mut self, _profile: &QualityProfile) {}
}

/// What the chain made of one input frame.
#[derive(Debug)]
pub enum ChainOutput {
    Processed(AudioFrame),
    /// The frame had the wrong length and was dropped.
    Skipped {
        expected: usize,
        got: usize,
        /// Set once the run of malformed frames passes the escalation limit.
        escalate: bool,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainStats {
    pub processed: u64,
    pub skipped: u64,
    pub stage_faults: u64,
}

pub struct DspChain {
    guild_id: GuildId,
    normalizer: Normalizer,
    agc: Agc,
    equalizer: ThreeBandEqualizer,
    compressor: Compressor,
    ducker: Ducker,
    frame_samples: usize,
    channels: usize,
    scratch: Vec<f32>,
    backup: Vec<f32>,
    preset: Option<EqPreset>,
    malformed_escalation: u32,
    malformed_run: u32,
    bit_depth: u32,
    stats: ChainStats,
}

impl DspChain {
    pub fn new(guild_id: GuildId, dsp: &DspConfig, engine: &EngineConfig) -> Self {
        let channels = engine.channels;
        let rate = engine.sample_rate;
        let frame_samples = engine.frame_samples();
        Self {
            guild_id,
            normalizer: Normalizer::new(dsp.normalizer.clone(), channels, rate),
            agc: Agc::new(dsp.agc.clone(), channels, rate),
            equalizer: ThreeBandEqualizer::new(dsp.equalizer.clone(), channels, rate),
            compressor: Compressor::new(dsp.compressor.clone(), channels, rate),
            ducker: Ducker::new(dsp.ducking.clone(), channels, rate),
            frame_samples,
            channels,
            scratch: Vec::with_capacity(frame_samples),
            backup: Vec::with_capacity(frame_samples),
            preset: None,
            malformed_escalation: dsp.malformed_escalation,
            malformed_run: 0,
            bit_depth: 16,
            stats: ChainStats::default(),
        }
    }

    /// Runs one frame through every stage.
    ///
    /// A frame with the wrong sample count never reaches a stage. A stage
    /// whose output is not finite is undone for this frame and reset.
    pub fn process(&mut self, frame: AudioFrame) -> ChainOutput {
        if frame.len() != self.frame_samples || frame.channels() != self.channels {
            self.stats.skipped += 1;
            self.malformed_run += 1;
            let escalate = self.malformed_run > self.malformed_escalation;
            warn!(
                "[{}] Dropping malformed frame #{}: {} samples/{} channels, expected {}/{}",
                self.guild_id,
                frame.sequence(),
                frame.len(),
                frame.channels(),
                self.frame_samples,
                self.channels
            );
            return ChainOutput::Skipped {
                expected: self.frame_samples,
                got: frame.len(),
                escalate,
            };
        }
        self.malformed_run = 0;

        self.scratch.clear();
        self.scratch.extend(frame.samples().iter().map(|&s| sample_to_f32(s)));

        let guild_id = &self.guild_id;
        let scratch = &mut self.scratch;
        let backup = &mut self.backup;
        let stats = &mut self.stats;
        let stages: [&mut dyn DspStage; 5] = [
            &mut self.normalizer,
            &mut self.agc,
            &mut self.equalizer,
            &mut self.compressor,
            &mut self.ducker,
        ];
        for stage in stages {
            backup.clear();
            backup.extend_from_slice(scratch);
            let mut result = stage.process(scratch);
            if result.is_ok() && !scratch.iter().all(|s| s.is_finite()) {
                result = Err(StageError::NonFinite { stage: stage.name() });
            }
            if let Err(e) = result {
                warn!("[{}] Bypassing {} for this frame: {}", guild_id, stage.name(), e);
                scratch.copy_from_slice(backup);
                stage.reset();
                stats.stage_faults += 1;
            }
        }

        let (sequence, captured_at) = (frame.sequence(), frame.captured_at());
        let mut samples = frame.into_samples();
        for (out, &v) in samples.iter_mut().zip(self.scratch.iter()) {
            *out = f32_to_sample_at_depth(v, self.bit_depth);
        }
        self.stats.processed += 1;
        ChainOutput::Processed(AudioFrame::new(samples, self.channels, sequence, captured_at))
    }

    pub fn apply_quality(&mut self, profile: &QualityProfile) {
        self.normalizer.apply_quality(profile);
        self.agc.apply_quality(profile);
        self.equalizer.apply_quality(profile);
        self.compressor.apply_quality(profile);
        self.ducker.apply_quality(profile);
        self.bit_depth = profile.bit_depth.clamp(1, 16);
    }

    /// Custom gains; clears any active preset.
    pub fn set_eq(&mut self, gains: EqGains) -> Result<(), EngineError> {
        self.equalizer.set_gains(gains)?;
        self.preset = None;
        Ok(())
    }

    pub fn apply_preset(&mut self, preset: EqPreset) {
        // Preset gains are always in range.
        if self.equalizer.set_gains(preset.gains()).is_ok() {
            self.preset = Some(preset);
        }
    }

    pub fn set_duck_level(&mut self, level: f32) {
        self.ducker.set_level(level);
    }

    pub fn set_normalization_target(&mut self, lufs: f32) {
        self.normalizer.set_target(lufs);
    }

    pub fn normalization_target(&self) -> f32 {
        self.normalizer.target_lufs()
    }

    pub fn set_auto_gain(&mut self, enabled: bool) {
        self.agc.set_enabled(enabled);
    }

    pub fn auto_gain(&self) -> bool {
        self.agc.is_enabled()
    }

    /// `0.0` bypasses the compressor, `1.0` compresses hardest.
    pub fn set_compression(&mut self, amount: f32) {
        self.compressor.set_amount(amount);
    }

    pub fn compression_ratio(&self) -> Option<f32> {
        self.compressor.is_enabled().then(|| self.compressor.ratio())
    }

    pub fn bit_depth(&self) -> u32 {
        self.bit_depth
    }

    pub fn eq(&self) -> EqGains {
        self.equalizer.target()
    }

    pub fn preset(&self) -> Option<EqPreset> {
        self.preset
    }

    pub fn stats(&self) -> ChainStats {
        self.stats
    }

    pub fn equalizer(&self) -> &ThreeBandEqualizer {
        &self.equalizer
    }

    pub fn reset(&mut self) {
        self.normalizer.reset();
        self.agc.reset();
        self.equalizer.reset();
        self.compressor.reset();
        self.ducker.reset();
        self.malformed_run = 0;
    }
}
