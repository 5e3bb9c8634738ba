use std::time::Duration;

use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::{
    audio::mix::MixMode,
    common::GuildId,
    monitoring::{
        health::{HealthCause, HealthState},
        recovery::{AttemptOutcome, RecoveryAction},
    },
    quality::{QualityLevel, QualityReason},
};

/// Why a pipeline task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    /// `stop()` or supervisor shutdown.
    Requested,
    /// The voice sink went away.
    SinkClosed,
    /// Recovery ran out of attempts.
    Failed,
}

/// Everything a pipeline reports to the outside.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EngineEvent {
    PipelineStarted {
        guild_id: GuildId,
        instance: Uuid,
        quality: QualityLevel,
    },
    PipelineStopped {
        guild_id: GuildId,
        reason: StopReason,
    },
    HealthChanged {
        guild_id: GuildId,
        from: HealthState,
        to: HealthState,
        cause: Option<HealthCause>,
        at_ms: u64,
    },
    QualityChanged {
        guild_id: GuildId,
        from: QualityLevel,
        to: QualityLevel,
        reason: QualityReason,
    },
    RecoveryScheduled {
        guild_id: GuildId,
        attempt: u32,
        action: RecoveryAction,
        delay_ms: u64,
    },
    RecoveryFinished {
        guild_id: GuildId,
        attempt: u32,
        outcome: AttemptOutcome,
        error: Option<String>,
    },
    MixerModeChanged {
        guild_id: GuildId,
        from: MixMode,
        to: MixMode,
    },
    /// Loudness target moved, in LUFS.
    NormalizationAdjusted {
        guild_id: GuildId,
        from: f32,
        to: f32,
    },
    /// Terminal. Sent exactly once per failed pipeline instance.
    PipelineFailed {
        guild_id: GuildId,
        attempts: u32,
        cause: Option<HealthCause>,
    },
}

impl EngineEvent {
    pub fn guild_id(&self) -> &GuildId {
        match self {
            Self::PipelineStarted { guild_id, .. }
            | Self::PipelineStopped { guild_id, .. }
            | Self::HealthChanged { guild_id, .. }
            | Self::QualityChanged { guild_id, .. }
            | Self::RecoveryScheduled { guild_id, .. }
            | Self::RecoveryFinished { guild_id, .. }
            | Self::MixerModeChanged { guild_id, .. }
            | Self::NormalizationAdjusted { guild_id, .. }
            | Self::PipelineFailed { guild_id, .. } => guild_id,
        }
    }

    /// Events that must never be dropped.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::PipelineFailed { .. } | Self::PipelineStopped { .. }
        )
    }
}

const DEFAULT_TERMINAL_WAIT: Duration = Duration::from_millis(10);

/// Sending half of the engine event channel, shared by all pipelines.
#[derive(Clone)]
pub struct EventSink {
    tx: flume::Sender<EngineEvent>,
    terminal_wait: Duration,
}

impl EventSink {
    pub fn new(tx: flume::Sender<EngineEvent>) -> Self {
        Self {
            tx,
            terminal_wait: DEFAULT_TERMINAL_WAIT,
        }
    }

    /// Upper bound on how long a terminal event waits for queue room.
    pub fn with_terminal_wait(mut self, wait: Duration) -> Self {
        self.terminal_wait = wait;
        self
    }

    /// Non-terminal events are dropped with a warning when nobody keeps up.
    /// Terminal events wait for room, but never longer than the terminal wait,
    /// so a pipeline can always finish.
    pub async fn emit(&self, event: EngineEvent) {
        if event.is_terminal() {
            let event = match self.tx.try_send(event) {
                Ok(()) | Err(flume::TrySendError::Disconnected(_)) => return,
                Err(flume::TrySendError::Full(event)) => event,
            };
            let guild_id = event.guild_id().clone();
            match tokio::time::timeout(self.terminal_wait, self.tx.send_async(event)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => warn!("Engine event channel closed"),
                Err(_) => warn!(
                    "[{}] Event queue still full after {:?}, terminal event lost",
                    guild_id, self.terminal_wait
                ),
            }
            return;
        }
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(flume::TrySendError::Full(event)) => {
                warn!("[{}] Event queue full, dropping {:?}", event.guild_id(), event);
            }
            Err(flume::TrySendError::Disconnected(_)) => {}
        }
    }
}
