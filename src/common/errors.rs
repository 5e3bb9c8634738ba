use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::{GuildId, SourceId};

/// How far a fault reaches beyond the frame it happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FaultClass {
    /// Absorbed locally: the frame is skipped or replaced with silence.
    Transient,
    /// Sustained load; answered with a quality step-down.
    Degrading,
    /// Stalls and closed sockets; handled by health monitoring and recovery.
    Connectivity,
    /// Retry budget exhausted or unusable configuration.
    Fatal,
}

/// Errors returned by the public control surface.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid {field}: {value} (expected {expected})")]
    InvalidArgument {
        field: &'static str,
        value: f32,
        expected: &'static str,
    },
    #[error("unknown equalizer preset '{0}'")]
    UnknownPreset(String),
    #[error("no pipeline running for guild {0}")]
    PipelineNotFound(GuildId),
    #[error("a pipeline is already running for guild {0}")]
    AlreadyRunning(GuildId),
    #[error("pipeline for guild {0} has failed and must be restarted")]
    PipelineFailed(GuildId),
    #[error("control queue for guild {0} is closed")]
    ChannelClosed(GuildId),
    #[error("mixer already holds {0} sources")]
    MixerFull(usize),
    #[error("no mixer source with id {0}")]
    UnknownSource(SourceId),
    #[error("settings storage error: {0}")]
    Storage(#[from] std::io::Error),
    #[error("settings encoding error: {0}")]
    SettingsFormat(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    pub fn class(&self) -> FaultClass {
        match self {
            Self::PipelineFailed(_) | Self::Config(_) => FaultClass::Fatal,
            Self::ChannelClosed(_) => FaultClass::Connectivity,
            _ => FaultClass::Transient,
        }
    }
}

/// Errors reported by a [`FrameSource`](crate::audio::FrameSource) when reconnecting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// Worth retrying against the same upstream.
    #[error("transient source failure: {0}")]
    Transient(String),
    /// The decoder or upstream is unusable; the pipeline state is rebuilt before the next try.
    #[error("structural source failure: {0}")]
    Structural(String),
}

impl SourceError {
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Structural(_))
    }
}

/// Errors reported by a [`VoiceSink`](crate::audio::VoiceSink).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("voice sink closed")]
    Closed,
    #[error("voice sink rejected frame: {0}")]
    Rejected(String),
}

/// A DSP stage that could not produce usable output for one frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    #[error("{stage} produced non-finite output")]
    NonFinite { stage: &'static str },
    #[error("{stage} received {len} samples, not a multiple of {channels} channels")]
    Misaligned {
        stage: &'static str,
        len: usize,
        channels: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_errors() {
        assert_eq!(
            EngineError::PipelineFailed(GuildId::from("1")).class(),
            FaultClass::Fatal
        );
        assert_eq!(
            EngineError::UnknownPreset("loud".into()).class(),
            FaultClass::Transient
        );
    }

    #[test]
    fn invalid_argument_message() {
        let err = EngineError::InvalidArgument {
            field: "volume",
            value: 1.5,
            expected: "0.0..=1.0",
        };
        assert_eq!(err.to_string(), "invalid volume: 1.5 (expected 0.0..=1.0)");
    }
}
