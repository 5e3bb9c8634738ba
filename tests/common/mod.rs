#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use radiorelay::{
    audio::{AudioFrame, FrameOutcome, FrameSource},
    common::SourceError,
    configs::Config,
    quality::QualityLevel,
};
use tokio::time::Instant;

pub const SAMPLES_PER_CHANNEL: usize = 960;
pub const CHANNELS: usize = 2;

/// Phase-continuous stereo sine, so consecutive frames join without a step.
pub fn tone(freq: f32, amplitude: f32, sequence: u64) -> AudioFrame {
    let offset = sequence as usize * SAMPLES_PER_CHANNEL;
    let mut samples = Vec::with_capacity(SAMPLES_PER_CHANNEL * CHANNELS);
    for i in 0..SAMPLES_PER_CHANNEL {
        let t = (offset + i) as f32 / 48_000.0;
        let v = (t * freq * std::f32::consts::TAU).sin() * amplitude * 32_767.0;
        for _ in 0..CHANNELS {
            samples.push(v as i16);
        }
    }
    AudioFrame::new(samples, CHANNELS, sequence, Instant::now())
}

/// Two tones summed, a stand-in for programme material.
pub fn programme(sequence: u64) -> AudioFrame {
    let low = tone(110.0, 0.08, sequence);
    let high = tone(6_000.0, 0.04, sequence);
    let samples = low
        .samples()
        .iter()
        .zip(high.samples())
        .map(|(a, b)| a.saturating_add(*b))
        .collect();
    AudioFrame::new(samples, CHANNELS, sequence, Instant::now())
}

pub fn silence(sequence: u64) -> AudioFrame {
    AudioFrame::silence(SAMPLES_PER_CHANNEL * CHANNELS, CHANNELS, sequence, Instant::now())
}

pub fn rms(frames: &[AudioFrame]) -> f32 {
    let mut sum = 0.0f64;
    let mut n = 0usize;
    for frame in frames {
        for s in frame.samples() {
            let v = *s as f64 / 32_768.0;
            sum += v * v;
            n += 1;
        }
    }
    if n == 0 { 0.0 } else { (sum / n as f64).sqrt() as f32 }
}

/// Quality pinned to one level so timers cannot change processing mid-test.
pub fn fixed_quality_config() -> Config {
    let mut config = Config::default();
    config.quality.initial = QualityLevel::High;
    config.quality.ceiling = QualityLevel::High;
    config
}

/// A source whose upstream is gone: every read times out and every
/// reconnect is refused.
pub struct DeadSource {
    pub reconnects: Arc<AtomicU32>,
}

impl DeadSource {
    pub fn new() -> (Self, Arc<AtomicU32>) {
        let reconnects = Arc::new(AtomicU32::new(0));
        (
            Self {
                reconnects: reconnects.clone(),
            },
            reconnects,
        )
    }
}

#[async_trait]
impl FrameSource for DeadSource {
    async fn next_frame(&mut self, timeout: Duration) -> FrameOutcome {
        tokio::time::sleep(timeout).await;
        FrameOutcome::Timeout
    }

    async fn reconnect(&mut self) -> Result<(), SourceError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Err(SourceError::Transient("connection refused".into()))
    }

    fn label(&self) -> &str {
        "dead-upstream"
    }
}
