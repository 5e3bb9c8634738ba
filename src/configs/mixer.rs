use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::mix::MixMode;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MixerConfig {
    #[serde(default)]
    pub default_mode: MixMode,
    #[serde(default = "default_crossfade_ms")]
    pub crossfade_ms: u64,
    /// Gain left to lower-priority sources in priority mode.
    #[serde(default)]
    pub priority_floor: f32,
    #[serde(default = "default_max_sources")]
    pub max_sources: usize,
    /// Ticks an auxiliary source stays audible-in-principle after its last frame.
    /// Past that it no longer mutes or replaces anything.
    #[serde(default = "default_idle_hold_frames")]
    pub idle_hold_frames: u32,
}

impl MixerConfig {
    pub fn crossfade(&self) -> Duration {
        Duration::from_millis(self.crossfade_ms)
    }
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            default_mode: MixMode::default(),
            crossfade_ms: default_crossfade_ms(),
            priority_floor: 0.0,
            max_sources: default_max_sources(),
            idle_hold_frames: default_idle_hold_frames(),
        }
    }
}

fn default_crossfade_ms() -> u64 {
    2_000
}

fn default_max_sources() -> usize {
    5
}

fn default_idle_hold_frames() -> u32 {
    5
}
