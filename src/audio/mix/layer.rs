//! `MixLayer`: one auxiliary input of the mixer.
//!
//! Layers are fed by a producer over a flume channel (an announcement, a
//! second station being faded in) and are pulled once per mix tick.

use crate::audio::frame::AudioFrame;
use crate::common::SourceId;

pub struct MixLayer {
    pub id: SourceId,
    pub rx: flume::Receiver<AudioFrame>,
    pub priority: i32,
    /// Blend gain in [0.0, 1.0].
    pub gain: f32,
    /// Registration order; larger is newer.
    pub started: u64,
    /// Set once the producer is gone and the channel is drained.
    pub finished: bool,
    /// Mix ticks since the last frame arrived. Saturates while the layer has never played.
    pub idle_ticks: u32,
}

impl MixLayer {
    pub fn new(
        id: SourceId,
        rx: flume::Receiver<AudioFrame>,
        priority: i32,
        gain: f32,
        started: u64,
    ) -> Self {
        Self {
            id,
            rx,
            priority,
            gain: gain.clamp(0.0, 1.0),
            started,
            finished: false,
            idle_ticks: u32::MAX,
        }
    }

    /// Takes the next frame if one is ready. Never waits.
    pub fn poll(&mut self) -> Option<AudioFrame> {
        match self.rx.try_recv() {
            Ok(frame) => Some(frame),
            Err(flume::TryRecvError::Empty) => None,
            Err(flume::TryRecvError::Disconnected) => {
                self.finished = true;
                None
            }
        }
    }

    pub fn note_tick(&mut self, delivered: bool) {
        self.idle_ticks = if delivered {
            0
        } else {
            self.idle_ticks.saturating_add(1)
        };
    }

    /// Delivered a frame within the last `hold` ticks.
    pub fn is_active(&self, hold: u32) -> bool {
        !self.finished && self.idle_ticks <= hold
    }

    pub fn is_dead(&self) -> bool {
        self.finished
    }
}
