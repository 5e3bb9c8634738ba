use std::{collections::VecDeque, time::Duration};

use serde::Serialize;
use tokio::time::Instant;

/// Upper bound on retained entries, whatever the window length.
const MAX_ENTRIES: usize = 4_096;

#[derive(Debug, Clone, Copy)]
enum Entry {
    Frame { at: Instant, processing: Duration },
    Underrun { at: Instant },
    Malformed { at: Instant },
}

impl Entry {
    fn at(&self) -> Instant {
        match *self {
            Self::Frame { at, .. } | Self::Underrun { at } | Self::Malformed { at } => at,
        }
    }
}

/// Lifetime counters, never pruned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsTotals {
    pub frames: u64,
    pub underruns: u64,
    pub malformed: u64,
    pub stage_faults: u64,
}

/// Read-only view over the rolling window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub window: Duration,
    pub frames: u32,
    pub underruns: u32,
    pub malformed: u32,
    pub avg_latency: Duration,
    pub max_latency: Duration,
    /// Mean processing time as a fraction of the frame period.
    pub cpu_load: f32,
    /// Underruns over frame slots (delivered frames plus underruns).
    pub underrun_rate: f32,
    pub totals: MetricsTotals,
}

/// Per-guild frame timing, underrun and fault counters.
pub struct MetricsCollector {
    window: Duration,
    frame_period: Duration,
    entries: VecDeque<Entry>,
    totals: MetricsTotals,
}

impl MetricsCollector {
    pub fn new(window: Duration, frame_period: Duration) -> Self {
        let expected = (window.as_millis() / frame_period.as_millis().max(1)) as usize;
        Self {
            window,
            frame_period,
            entries: VecDeque::with_capacity((expected * 2).min(MAX_ENTRIES)),
            totals: MetricsTotals::default(),
        }
    }

    fn push(&mut self, entry: Entry) {
        self.prune(entry.at());
        if self.entries.len() == MAX_ENTRIES {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.entries.front() {
            if now.saturating_duration_since(front.at()) > self.window {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn record_frame(&mut self, at: Instant, processing: Duration) {
        self.totals.frames += 1;
        self.push(Entry::Frame { at, processing });
    }

    pub fn record_underrun(&mut self, at: Instant) {
        self.totals.underruns += 1;
        self.push(Entry::Underrun { at });
    }

    pub fn record_malformed(&mut self, at: Instant) {
        self.totals.malformed += 1;
        self.push(Entry::Malformed { at });
    }

    pub fn record_stage_faults(&mut self, count: u32) {
        self.totals.stage_faults += count as u64;
    }

    pub fn totals(&self) -> MetricsTotals {
        self.totals
    }

    /// Drops the window but keeps lifetime totals.
    pub fn clear_window(&mut self) {
        self.entries.clear();
    }

    pub fn snapshot(&mut self, now: Instant) -> MetricsSnapshot {
        self.prune(now);

        let mut frames = 0u32;
        let mut underruns = 0u32;
        let mut malformed = 0u32;
        let mut total = Duration::ZERO;
        let mut max_latency = Duration::ZERO;
        for entry in &self.entries {
            match *entry {
                Entry::Frame { processing, .. } => {
                    frames += 1;
                    total += processing;
                    max_latency = max_latency.max(processing);
                }
                Entry::Underrun { .. } => underruns += 1,
                Entry::Malformed { .. } => malformed += 1,
            }
        }

        let avg_latency = if frames > 0 {
            total / frames
        } else {
            Duration::ZERO
        };
        let slots = frames + underruns;
        let underrun_rate = if slots > 0 {
            underruns as f32 / slots as f32
        } else {
            0.0
        };

        MetricsSnapshot {
            window: self.window,
            frames,
            underruns,
            malformed,
            avg_latency,
            max_latency,
            cpu_load: avg_latency.as_secs_f32() / self.frame_period.as_secs_f32(),
            underrun_rate,
            totals: self.totals,
        }
    }
}
