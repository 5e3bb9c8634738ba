//! Boundary traits for the outside world.
//!
//! The engine never decodes or transports audio itself. A [`FrameSource`]
//! yields decoded PCM frames from the stream-ingest layer and a [`VoiceSink`]
//! hands processed frames to the Discord voice transport.
//!
//! # Module layout
//!
//! ```text
//! src/audio/source/
//! ├── mod.rs      ← FrameSource / VoiceSink traits
//! └── channel.rs  ← flume-backed implementations for in-process producers
//! ```

pub mod channel;

pub use channel::{ChannelFrameSource, ChannelVoiceSink};

use std::time::Duration;

use async_trait::async_trait;

use super::frame::AudioFrame;
use crate::common::{SinkError, SourceError};

/// Result of waiting for the next frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Frame(AudioFrame),
    /// Nothing arrived within the wait bound.
    Timeout,
    /// The upstream ended; only `reconnect` can revive it.
    Closed,
}

/// Decoded PCM supplier for one stream.
///
/// `next_frame` must be cancel-safe: the pipeline races it against control
/// commands and cancellation and may drop the future before it completes.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self, timeout: Duration) -> FrameOutcome;

    async fn reconnect(&mut self) -> Result<(), SourceError>;

    /// Short label for logs.
    fn label(&self) -> &str {
        "stream"
    }
}

/// Consumer of processed frames. `send` may wait to apply backpressure.
#[async_trait]
pub trait VoiceSink: Send {
    async fn send(&mut self, frame: AudioFrame) -> Result<(), SinkError>;
}

#[async_trait]
impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    async fn next_frame(&mut self, timeout: Duration) -> FrameOutcome {
        (**self).next_frame(timeout).await
    }

    async fn reconnect(&mut self) -> Result<(), SourceError> {
        (**self).reconnect().await
    }

    fn label(&self) -> &str {
        (**self).label()
    }
}

#[async_trait]
impl<T: VoiceSink + ?Sized> VoiceSink for Box<T> {
    async fn send(&mut self, frame: AudioFrame) -> Result<(), SinkError> {
        (**self).send(frame).await
    }
}
