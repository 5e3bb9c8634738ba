use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{FrameOutcome, FrameSource, VoiceSink};
use crate::audio::frame::AudioFrame;
use crate::common::{SinkError, SourceError};

/// Frame source fed by an in-process producer over a bounded flume channel.
///
/// Receiving through `recv_async` is cancel-safe: a frame is only removed
/// from the channel when the future resolves.
pub struct ChannelFrameSource {
    rx: flume::Receiver<AudioFrame>,
    label: String,
}

impl ChannelFrameSource {
    pub fn new(rx: flume::Receiver<AudioFrame>) -> Self {
        Self {
            rx,
            label: "channel".to_owned(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Creates a connected producer/source pair.
    pub fn pair(capacity: usize) -> (flume::Sender<AudioFrame>, Self) {
        let (tx, rx) = flume::bounded(capacity.max(1));
        (tx, Self::new(rx))
    }

    /// Swaps in a fresh upstream, e.g. after the producer reconnected.
    pub fn replace(&mut self, rx: flume::Receiver<AudioFrame>) {
        self.rx = rx;
    }
}

#[async_trait]
impl FrameSource for ChannelFrameSource {
    async fn next_frame(&mut self, timeout: Duration) -> FrameOutcome {
        match tokio::time::timeout(timeout, self.rx.recv_async()).await {
            Ok(Ok(frame)) => FrameOutcome::Frame(frame),
            Ok(Err(_)) => FrameOutcome::Closed,
            Err(_) => FrameOutcome::Timeout,
        }
    }

    async fn reconnect(&mut self) -> Result<(), SourceError> {
        if self.rx.is_disconnected() && self.rx.is_empty() {
            return Err(SourceError::Structural(format!(
                "{}: producer dropped",
                self.label
            )));
        }
        let stale = self.rx.drain().count();
        if stale > 0 {
            debug!("{}: dropped {} stale frames on reconnect", self.label, stale);
        }
        Ok(())
    }

    fn label(&self) -> &str {
        &self.label
    }
}

/// Voice sink that forwards frames over a bounded flume channel.
/// A full channel makes `send` wait, which is the pipeline's backpressure.
pub struct ChannelVoiceSink {
    tx: flume::Sender<AudioFrame>,
}

impl ChannelVoiceSink {
    pub fn new(tx: flume::Sender<AudioFrame>) -> Self {
        Self { tx }
    }

    pub fn pair(capacity: usize) -> (Self, flume::Receiver<AudioFrame>) {
        let (tx, rx) = flume::bounded(capacity.max(1));
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl VoiceSink for ChannelVoiceSink {
    async fn send(&mut self, frame: AudioFrame) -> Result<(), SinkError> {
        self.tx.send_async(frame).await.map_err(|_| SinkError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn frame(seq: u64) -> AudioFrame {
        AudioFrame::silence(4, 2, seq, Instant::now())
    }

    #[tokio::test(start_paused = true)]
    async fn source_reports_frames_timeouts_and_close() {
        let (tx, mut source) = ChannelFrameSource::pair(4);
        tx.send(frame(1)).unwrap();

        match source.next_frame(Duration::from_millis(40)).await {
            FrameOutcome::Frame(f) => assert_eq!(f.sequence(), 1),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            source.next_frame(Duration::from_millis(40)).await,
            FrameOutcome::Timeout
        );

        drop(tx);
        assert_eq!(
            source.next_frame(Duration::from_millis(40)).await,
            FrameOutcome::Closed
        );
        assert!(source.reconnect().await.unwrap_err().is_structural());
    }

    #[tokio::test]
    async fn reconnect_drops_stale_frames() {
        let (tx, mut source) = ChannelFrameSource::pair(4);
        tx.send(frame(1)).unwrap();
        tx.send(frame(2)).unwrap();
        source.reconnect().await.unwrap();
        assert!(tx.is_empty());
    }

    #[tokio::test]
    async fn sink_reports_closed_receiver() {
        let (mut sink, rx) = ChannelVoiceSink::pair(2);
        sink.send(frame(1)).await.unwrap();
        assert_eq!(rx.recv_async().await.unwrap().sequence(), 1);
        drop(rx);
        assert_eq!(sink.send(frame(2)).await, Err(SinkError::Closed));
    }
}
