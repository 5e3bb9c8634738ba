use serde::{Deserialize, Serialize};

use super::{
    DspStage,
    biquad::{BiquadCoeffs, BiquadState},
};
use crate::audio::constants::{EQ_MAX_DB, EQ_MIN_DB, SHELF_SLOPE};
use crate::common::{EngineError, StageError};
use crate::configs::EqualizerConfig;
use crate::quality::QualityProfile;

const BASS: usize = 0;
const MID: usize = 1;
const TREBLE: usize = 2;
const BAND_COUNT: usize = 3;

/// Gains of the three bands in dB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EqGains {
    pub bass: f32,
    pub mid: f32,
    pub treble: f32,
}

impl EqGains {
    pub const FLAT: Self = Self::new(0.0, 0.0, 0.0);

    pub const fn new(bass: f32, mid: f32, treble: f32) -> Self {
        Self { bass, mid, treble }
    }

    /// Rejects any band outside `-12..=12` dB.
    pub fn validated(self) -> Result<Self, EngineError> {
        for (field, value) in [("bass", self.bass), ("mid", self.mid), ("treble", self.treble)] {
            if !value.is_finite() || !(EQ_MIN_DB..=EQ_MAX_DB).contains(&value) {
                return Err(EngineError::InvalidArgument {
                    field,
                    value,
                    expected: "-12.0..=12.0 dB",
                });
            }
        }
        Ok(self)
    }

    fn as_array(self) -> [f32; BAND_COUNT] {
        [self.bass, self.mid, self.treble]
    }

    fn from_array(a: [f32; BAND_COUNT]) -> Self {
        Self::new(a[BASS], a[MID], a[TREBLE])
    }

    pub fn is_flat(&self) -> bool {
        *self == Self::FLAT
    }
}

/// Named equalizer settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EqPreset {
    Flat,
    Rock,
    Pop,
    Jazz,
    Classical,
    Electronic,
    Voice,
    BassBoost,
    TrebleBoost,
}

impl EqPreset {
    pub const ALL: [EqPreset; 9] = [
        Self::Flat,
        Self::Rock,
        Self::Pop,
        Self::Jazz,
        Self::Classical,
        Self::Electronic,
        Self::Voice,
        Self::BassBoost,
        Self::TrebleBoost,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Flat => "flat",
            Self::Rock => "rock",
            Self::Pop => "pop",
            Self::Jazz => "jazz",
            Self::Classical => "classical",
            Self::Electronic => "electronic",
            Self::Voice => "voice",
            Self::BassBoost => "bass-boost",
            Self::TrebleBoost => "treble-boost",
        }
    }

    pub fn gains(self) -> EqGains {
        match self {
            Self::Flat => EqGains::FLAT,
            Self::Rock => EqGains::new(4.0, 2.0, 3.0),
            Self::Pop => EqGains::new(2.0, 1.0, 4.0),
            Self::Jazz => EqGains::new(3.0, -1.0, 2.0),
            Self::Classical => EqGains::new(1.0, -2.0, 3.0),
            Self::Electronic => EqGains::new(6.0, -2.0, 4.0),
            Self::Voice => EqGains::new(-2.0, 4.0, 2.0),
            Self::BassBoost => EqGains::new(8.0, 0.0, 0.0),
            Self::TrebleBoost => EqGains::new(0.0, 0.0, 8.0),
        }
    }

    /// Case-insensitive lookup; `_` and `-` are interchangeable.
    pub fn from_name(name: &str) -> Result<Self, EngineError> {
        let key = name.trim().to_ascii_lowercase().replace('_', "-");
        if key == "vocal" {
            return Ok(Self::Voice);
        }
        Self::ALL
            .into_iter()
            .find(|p| p.name() == key)
            .ok_or_else(|| EngineError::UnknownPreset(name.to_owned()))
    }

    pub fn names() -> impl Iterator<Item = &'static str> {
        Self::ALL.into_iter().map(Self::name)
    }
}

impl std::fmt::Display for EqPreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for EqPreset {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
    }
}

/// Bass low-shelf, mid peaking and treble high-shelf sections in series.
///
/// Requested gains are targets; the applied gains walk toward them by at
/// most `ramp_db_per_sec` and coefficients are recomputed once per block so
/// that a preset change never produces a step in the output.
pub struct ThreeBandEqualizer {
    config: EqualizerConfig,
    channels: usize,
    sample_rate: f64,
    target: EqGains,
    current: [f32; BAND_COUNT],
    coeffs: [BiquadCoeffs; BAND_COUNT],
    states: Vec<[BiquadState; BAND_COUNT]>,
    mid_enabled: bool,
}

impl ThreeBandEqualizer {
    pub fn new(config: EqualizerConfig, channels: usize, sample_rate: u32) -> Self {
        let channels = channels.max(1);
        Self {
            config,
            channels,
            sample_rate: sample_rate as f64,
            target: EqGains::FLAT,
            current: [0.0; BAND_COUNT],
            coeffs: [BiquadCoeffs::IDENTITY; BAND_COUNT],
            states: vec![[BiquadState::default(); BAND_COUNT]; channels],
            mid_enabled: true,
        }
    }

    /// Sets new target gains. The output moves toward them over the next frames.
    pub fn set_gains(&mut self, gains: EqGains) -> Result<(), EngineError> {
        self.target = gains.validated()?;
        Ok(())
    }

    pub fn target(&self) -> EqGains {
        self.target
    }

    /// Gains currently applied, which lag the target while ramping.
    pub fn current(&self) -> EqGains {
        EqGains::from_array(self.current)
    }

    pub fn is_settled(&self) -> bool {
        self.current == self.effective_target()
    }

    fn effective_target(&self) -> [f32; BAND_COUNT] {
        let mut t = self.target.as_array();
        if !self.mid_enabled {
            t[MID] = 0.0;
        }
        t
    }

    fn mid_bypassed(&self) -> bool {
        !self.mid_enabled && self.current[MID] == 0.0
    }

    /// Walks the applied gains one block toward the target. Returns whether anything moved.
    fn step_gains(&mut self, block_frames: usize) -> bool {
        let target = self.effective_target();
        let max_step = self.config.ramp_db_per_sec * block_frames as f32 / self.sample_rate as f32;
        let mut changed = false;
        for band in 0..BAND_COUNT {
            let diff = target[band] - self.current[band];
            if diff == 0.0 {
                continue;
            }
            self.current[band] = if diff.abs() <= max_step {
                target[band]
            } else {
                self.current[band] + max_step.copysign(diff)
            };
            changed = true;
        }
        if changed {
            self.update_coeffs();
        }
        changed
    }

    fn update_coeffs(&mut self) {
        let cfg = &self.config;
        let rate = self.sample_rate;
        self.coeffs = [
            BiquadCoeffs::low_shelf(cfg.bass_hz as f64, self.current[BASS] as f64, SHELF_SLOPE, rate),
            BiquadCoeffs::peaking(cfg.mid_hz as f64, self.current[MID] as f64, cfg.mid_q as f64, rate),
            BiquadCoeffs::high_shelf(cfg.treble_hz as f64, self.current[TREBLE] as f64, SHELF_SLOPE, rate),
        ];
    }
}

impl DspStage for ThreeBandEqualizer {
    fn name(&self) -> &'static str {
        "equalizer"
    }

    fn process(&mut self, samples: &mut [f32]) -> Result<(), StageError> {
        if samples.len() % self.channels != 0 {
            return Err(StageError::Misaligned {
                stage: self.name(),
                len: samples.len(),
                channels: self.channels,
            });
        }
        if self.current == [0.0; BAND_COUNT] && self.is_settled() {
            // Keep filter memory aligned with the signal so the next boost starts clean.
            for frame in samples.chunks_exact(self.channels) {
                for (ch, &s) in frame.iter().enumerate() {
                    for state in self.states[ch].iter_mut() {
                        state.track(s as f64);
                    }
                }
            }
            return Ok(());
        }

        let block = self.config.block_size.max(1) * self.channels;
        for chunk in samples.chunks_mut(block) {
            self.step_gains(chunk.len() / self.channels);
            let skip_mid = self.mid_bypassed();
            for frame in chunk.chunks_exact_mut(self.channels) {
                for (ch, sample) in frame.iter_mut().enumerate() {
                    let states = &mut self.states[ch];
                    let mut v = *sample as f64;
                    v = states[BASS].process(v, &self.coeffs[BASS]);
                    if skip_mid {
                        states[MID].track(v);
                    } else {
                        v = states[MID].process(v, &self.coeffs[MID]);
                    }
                    v = states[TREBLE].process(v, &self.coeffs[TREBLE]);
                    *sample = v as f32;
                }
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        for states in self.states.iter_mut() {
            for state in states.iter_mut() {
                state.reset();
            }
        }
        self.current = self.effective_target();
        self.update_coeffs();
    }

    fn apply_quality(&mut self, profile: &QualityProfile) {
        self.mid_enabled = profile.eq_bands >= BAND_COUNT;
    }
}
