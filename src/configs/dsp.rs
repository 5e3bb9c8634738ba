use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct DspConfig {
    pub normalizer: NormalizerConfig,
    pub agc: AgcConfig,
    pub equalizer: EqualizerConfig,
    pub compressor: CompressorConfig,
    pub ducking: DuckingConfig,
    pub volume: VolumeConfig,
    /// Consecutive malformed frames tolerated before health monitoring is told.
    pub malformed_escalation: u32,
}

impl Default for DspConfig {
    fn default() -> Self {
        Self {
            normalizer: NormalizerConfig::default(),
            agc: AgcConfig::default(),
            equalizer: EqualizerConfig::default(),
            compressor: CompressorConfig::default(),
            ducking: DuckingConfig::default(),
            volume: VolumeConfig::default(),
            malformed_escalation: 5,
        }
    }
}

/// Loudness normalisation toward a LUFS target.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct NormalizerConfig {
    pub enabled: bool,
    pub target_lufs: f32,
    pub window_ms: u32,
    pub max_change_db_per_100ms: f32,
    pub min_gain_db: f32,
    pub max_gain_db: f32,
    /// Below this loudness the gain is held, so silence is never boosted.
    pub gate_lufs: f32,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target_lufs: -23.0,
            window_ms: 400,
            max_change_db_per_100ms: 6.0,
            min_gain_db: -20.0,
            max_gain_db: 9.5,
            gate_lufs: -70.0,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct AgcConfig {
    pub enabled: bool,
    pub target_rms_low: f32,
    pub target_rms_high: f32,
    pub peak_ceiling: f32,
    pub time_constant_ms: f32,
    pub min_gain: f32,
    pub max_gain: f32,
    pub gate_rms: f32,
}

impl Default for AgcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target_rms_low: 0.05,
            target_rms_high: 0.2,
            peak_ceiling: 0.98,
            time_constant_ms: 200.0,
            min_gain: 0.1,
            max_gain: 10.0,
            gate_rms: 0.001,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct EqualizerConfig {
    pub bass_hz: f32,
    pub mid_hz: f32,
    pub mid_q: f32,
    pub treble_hz: f32,
    /// Fastest allowed gain movement per band.
    pub ramp_db_per_sec: f32,
    /// Samples per channel between coefficient updates while ramping.
    pub block_size: usize,
}

impl Default for EqualizerConfig {
    fn default() -> Self {
        Self {
            bass_hz: 250.0,
            mid_hz: 1_000.0,
            mid_q: 0.7,
            treble_hz: 4_000.0,
            ramp_db_per_sec: 75.0,
            block_size: 64,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CompressorConfig {
    pub enabled: bool,
    pub threshold_db: f32,
    pub ratio: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
    pub makeup_db: f32,
    /// Ratio reached when runtime compression is set to full.
    pub max_ratio: f32,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_db: -18.0,
            ratio: 4.0,
            attack_ms: 10.0,
            release_ms: 100.0,
            makeup_db: 0.0,
            max_ratio: 20.0,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct DuckingConfig {
    /// Attenuation applied to the primary when an auxiliary source plays at full gain.
    pub depth: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
}

impl Default for DuckingConfig {
    fn default() -> Self {
        Self {
            depth: 0.7,
            attack_ms: 50.0,
            release_ms: 300.0,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct VolumeConfig {
    pub default_volume: f32,
    pub ramp_ms: u32,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            default_volume: 0.8,
            ramp_ms: 500,
        }
    }
}
