//! Adaptive quality selection.
//!
//! A [`QualityController`] looks at each [`MetricsSnapshot`] on a fixed cadence
//! and moves the guild's [`QualityLevel`] at most one step at a time. The
//! chosen [`QualityProfile`] is pushed into the DSP chain and mixer between
//! frames by the owning pipeline.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::{configs::QualityConfig, monitoring::metrics::MetricsSnapshot};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    Low,
    Medium,
    #[default]
    High,
    Ultra,
}

impl QualityLevel {
    pub const ALL: [QualityLevel; 4] = [Self::Low, Self::Medium, Self::High, Self::Ultra];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Ultra => "ultra",
        }
    }

    pub fn step_down(self) -> Option<Self> {
        match self {
            Self::Low => None,
            Self::Medium => Some(Self::Low),
            Self::High => Some(Self::Medium),
            Self::Ultra => Some(Self::High),
        }
    }

    pub fn step_up(self) -> Option<Self> {
        match self {
            Self::Low => Some(Self::Medium),
            Self::Medium => Some(Self::High),
            Self::High => Some(Self::Ultra),
            Self::Ultra => None,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Low,
            1 => Self::Medium,
            2 => Self::High,
            _ => Self::Ultra,
        }
    }

    pub fn profile(self) -> QualityProfile {
        match self {
            Self::Low => QualityProfile {
                level: self,
                analysis_rate: 24_000,
                eq_bands: 2,
                lookahead_ms: 0.0,
                blend_resolution: 64,
                bit_depth: 12,
            },
            Self::Medium => QualityProfile {
                level: self,
                analysis_rate: 48_000,
                eq_bands: 3,
                lookahead_ms: 2.0,
                blend_resolution: 16,
                bit_depth: 14,
            },
            Self::High => QualityProfile {
                level: self,
                analysis_rate: 48_000,
                eq_bands: 3,
                lookahead_ms: 5.0,
                blend_resolution: 4,
                bit_depth: 16,
            },
            Self::Ultra => QualityProfile {
                level: self,
                analysis_rate: 48_000,
                eq_bands: 3,
                lookahead_ms: 10.0,
                blend_resolution: 1,
                bit_depth: 16,
            },
        }
    }
}

impl std::fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing parameters selected by a [`QualityLevel`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityProfile {
    pub level: QualityLevel,
    /// Rate at which the loudness detector samples the signal. Output always stays at the engine rate.
    pub analysis_rate: u32,
    /// Active equalizer bands; the mid band is bypassed when this is 2.
    pub eq_bands: usize,
    pub lookahead_ms: f32,
    /// Samples per channel between gain updates in mixer blends.
    pub blend_resolution: usize,
    /// Resolution the DSP chain rounds its output to. Never above 16.
    pub bit_depth: u32,
}

impl QualityProfile {
    /// How many sample frames the loudness detector skips between reads.
    pub fn analysis_stride(&self, engine_rate: u32) -> usize {
        (engine_rate / self.analysis_rate.max(1)).max(1) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum QualityReason {
    Overload,
    Recovered,
    CeilingLowered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityChange {
    pub from: QualityLevel,
    pub to: QualityLevel,
    pub reason: QualityReason,
}

pub struct QualityController {
    config: QualityConfig,
    level: QualityLevel,
    ceiling: QualityLevel,
    overload_streak: u32,
    clean_since: Option<Instant>,
}

impl QualityController {
    pub fn new(config: QualityConfig, ceiling: QualityLevel) -> Self {
        let ceiling = ceiling.min(config.ceiling);
        let level = config.initial.min(ceiling);
        Self {
            config,
            level,
            ceiling,
            overload_streak: 0,
            clean_since: None,
        }
    }

    pub fn level(&self) -> QualityLevel {
        self.level
    }

    pub fn ceiling(&self) -> QualityLevel {
        self.ceiling
    }

    pub fn set_ceiling(&mut self, ceiling: QualityLevel) {
        self.ceiling = ceiling.min(self.config.ceiling);
    }

    fn change(&mut self, to: QualityLevel, reason: QualityReason) -> QualityChange {
        let from = self.level;
        self.level = to;
        self.overload_streak = 0;
        QualityChange { from, to, reason }
    }

    /// Runs one adjustment cycle. Returns the step taken, if any.
    pub fn evaluate(&mut self, snapshot: &MetricsSnapshot, now: Instant) -> Option<QualityChange> {
        if self.level > self.ceiling {
            self.clean_since = None;
            let to = self.level.step_down()?;
            return Some(self.change(to, QualityReason::CeilingLowered));
        }

        // An idle window carries no load signal. A window of nothing but
        // underruns does: its underrun rate is 1.0.
        if snapshot.frames == 0 && snapshot.underruns == 0 {
            return None;
        }

        let cfg = &self.config;
        let overloaded =
            snapshot.cpu_load > cfg.cpu_high || snapshot.underrun_rate > cfg.underrun_high;
        let clean = snapshot.cpu_load < cfg.cpu_low && snapshot.underrun_rate < cfg.underrun_low;

        if overloaded {
            self.clean_since = None;
            self.overload_streak += 1;
            debug!(
                "quality overload {}/{} (load {:.2}, underruns {:.3})",
                self.overload_streak, cfg.degrade_after, snapshot.cpu_load, snapshot.underrun_rate
            );
            if self.overload_streak >= cfg.degrade_after {
                if let Some(to) = self.level.step_down() {
                    return Some(self.change(to, QualityReason::Overload));
                }
            }
            return None;
        }

        self.overload_streak = 0;
        if !clean {
            self.clean_since = None;
            return None;
        }

        let since = *self.clean_since.get_or_insert(now);
        if now.duration_since(since) < cfg.upgrade_cooldown() || self.level >= self.ceiling {
            return None;
        }
        let to = self.level.step_up()?;
        // Each further step needs its own clean period.
        self.clean_since = Some(now);
        Some(self.change(to, QualityReason::Recovered))
    }
}
