use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HealthConfig {
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,
    /// Underrun rate that moves a healthy pipeline to degraded.
    #[serde(default = "default_underrun_soft")]
    pub underrun_soft: f32,
    /// Clean time required before returning to healthy.
    #[serde(default = "default_recovery_cooldown_ms")]
    pub recovery_cooldown_ms: u64,
    #[serde(default = "default_evaluate_interval_ms")]
    pub evaluate_interval_ms: u64,
    #[serde(default = "default_metrics_window_ms")]
    pub metrics_window_ms: u64,
    #[serde(default = "default_history")]
    pub history: usize,
}

impl HealthConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn recovery_cooldown(&self) -> Duration {
        Duration::from_millis(self.recovery_cooldown_ms)
    }

    pub fn evaluate_interval(&self) -> Duration {
        Duration::from_millis(self.evaluate_interval_ms)
    }

    pub fn metrics_window(&self) -> Duration {
        Duration::from_millis(self.metrics_window_ms)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stall_timeout_ms: default_stall_timeout_ms(),
            underrun_soft: default_underrun_soft(),
            recovery_cooldown_ms: default_recovery_cooldown_ms(),
            evaluate_interval_ms: default_evaluate_interval_ms(),
            metrics_window_ms: default_metrics_window_ms(),
            history: default_history(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RecoveryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Upper bound of the random fraction added to each delay.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_history")]
    pub history: usize,
}

impl RecoveryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            window_secs: default_window_secs(),
            history: default_history(),
        }
    }
}

fn default_stall_timeout_ms() -> u64 {
    5_000
}

fn default_underrun_soft() -> f32 {
    0.05
}

fn default_recovery_cooldown_ms() -> u64 {
    10_000
}

fn default_evaluate_interval_ms() -> u64 {
    250
}

fn default_metrics_window_ms() -> u64 {
    5_000
}

fn default_history() -> usize {
    32
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.2
}

fn default_window_secs() -> u64 {
    300
}
