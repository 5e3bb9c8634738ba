use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Frame format, scheduling and queue sizing shared by every guild pipeline.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: usize,
    #[serde(default = "default_frame_ms")]
    pub frame_ms: u32,
    /// Size of the frame-processing worker pool. `0` uses every available core.
    #[serde(default)]
    pub workers: usize,
    #[serde(default = "default_control_queue")]
    pub control_queue: usize,
    #[serde(default = "default_event_queue")]
    pub event_queue: usize,
    #[serde(default = "default_notice_queue")]
    pub notice_queue: usize,
    /// Longest single wait for the next source frame before it counts as an underrun.
    #[serde(default = "default_source_wait_ms")]
    pub source_wait_ms: u64,
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    /// How long a terminal event may wait for room in a full event queue before it is dropped.
    #[serde(default = "default_terminal_event_wait_ms")]
    pub terminal_event_wait_ms: u64,
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

impl EngineConfig {
    /// Interleaved samples in one frame.
    pub fn frame_samples(&self) -> usize {
        self.samples_per_channel() * self.channels
    }

    pub fn samples_per_channel(&self) -> usize {
        self.sample_rate as usize * self.frame_ms as usize / 1000
    }

    pub fn frame_period(&self) -> Duration {
        Duration::from_millis(self.frame_ms as u64)
    }

    pub fn source_wait(&self) -> Duration {
        Duration::from_millis(self.source_wait_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn terminal_event_wait(&self) -> Duration {
        Duration::from_millis(self.terminal_event_wait_ms)
    }

    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            frame_ms: default_frame_ms(),
            workers: 0,
            control_queue: default_control_queue(),
            event_queue: default_event_queue(),
            notice_queue: default_notice_queue(),
            source_wait_ms: default_source_wait_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            terminal_event_wait_ms: default_terminal_event_wait_ms(),
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

fn default_sample_rate() -> u32 {
    48_000
}

fn default_channels() -> usize {
    2
}

fn default_frame_ms() -> u32 {
    20
}

fn default_control_queue() -> usize {
    64
}

fn default_event_queue() -> usize {
    1024
}

fn default_notice_queue() -> usize {
    16
}

fn default_source_wait_ms() -> u64 {
    40
}

fn default_stop_timeout_ms() -> u64 {
    20
}

fn default_terminal_event_wait_ms() -> u64 {
    10
}

fn default_stats_interval_secs() -> u64 {
    30
}
