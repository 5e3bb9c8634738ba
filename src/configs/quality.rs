use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::quality::QualityLevel;

/// Adaptive quality thresholds. Load is processing time divided by the frame period.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct QualityConfig {
    pub initial: QualityLevel,
    pub ceiling: QualityLevel,
    pub evaluate_interval_ms: u64,
    pub cpu_high: f32,
    pub cpu_low: f32,
    pub underrun_high: f32,
    pub underrun_low: f32,
    /// Overloaded evaluations in a row before stepping down.
    pub degrade_after: u32,
    pub upgrade_cooldown_ms: u64,
}

impl QualityConfig {
    pub fn evaluate_interval(&self) -> Duration {
        Duration::from_millis(self.evaluate_interval_ms)
    }

    pub fn upgrade_cooldown(&self) -> Duration {
        Duration::from_millis(self.upgrade_cooldown_ms)
    }
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            initial: QualityLevel::High,
            ceiling: QualityLevel::Ultra,
            evaluate_interval_ms: 2_000,
            cpu_high: 0.75,
            cpu_low: 0.35,
            underrun_high: 0.05,
            underrun_low: 0.01,
            degrade_after: 2,
            upgrade_cooldown_ms: 10_000,
        }
    }
}
