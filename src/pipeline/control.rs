use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering},
    },
    time::Duration,
};

use serde::Serialize;

use crate::{
    audio::{
        constants::{MAX_TARGET_LUFS, MIN_TARGET_LUFS},
        filters::{EqGains, EqPreset},
        frame::AudioFrame,
        mix::{MixMode, MixSource},
    },
    common::{EngineError, GuildId, SourceId},
    monitoring::HealthState,
    quality::QualityLevel,
};

/// Requests applied by the pipeline task at the next frame boundary.
pub enum ControlCommand {
    SetVolume(f32),
    SetEq(EqGains),
    ApplyPreset(EqPreset),
    SetQualityCeiling(QualityLevel),
    SetNormalizationTarget(f32),
    SetAutoGain(bool),
    SetCompression(f32),
    SetMixMode(MixMode),
    AddOverlay {
        rx: flume::Receiver<AudioFrame>,
        priority: i32,
        gain: f32,
        reply: flume::Sender<Result<SourceId, EngineError>>,
    },
    RemoveSource {
        id: SourceId,
        reply: flume::Sender<Result<(), EngineError>>,
    },
    CrossfadeTo {
        rx: flume::Receiver<AudioFrame>,
        gain: f32,
        duration: Option<Duration>,
        reply: flume::Sender<Result<SourceId, EngineError>>,
    },
    Refresh,
    GetInfo(flume::Sender<AudioInfo>),
}

/// What `get_audio_info` reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioInfo {
    pub guild_id: GuildId,
    pub volume: f32,
    pub eq: EqGains,
    pub preset: Option<EqPreset>,
    pub quality_level: QualityLevel,
    pub quality_ceiling: QualityLevel,
    pub normalization_target: f32,
    pub auto_gain: bool,
    /// `None` while the compressor is bypassed.
    pub compression_ratio: Option<f32>,
    pub sample_rate: u32,
    pub channels: usize,
    pub health: HealthState,
    pub mix_mode: MixMode,
    pub sources: Vec<MixSource>,
    pub crossfade_progress: Option<f32>,
}

/// Lock-free view of a running pipeline, written by its task only.
pub struct PipelineStatus {
    health: AtomicU8,
    quality: AtomicU8,
    volume: AtomicU32, // f32 bits
    finished: AtomicBool,
}

impl PipelineStatus {
    pub fn new(quality: QualityLevel, volume: f32) -> Self {
        Self {
            health: AtomicU8::new(HealthState::Healthy as u8),
            quality: AtomicU8::new(quality as u8),
            volume: AtomicU32::new(volume.to_bits()),
            finished: AtomicBool::new(false),
        }
    }

    pub fn health(&self) -> HealthState {
        HealthState::from_u8(self.health.load(Ordering::Acquire))
    }

    pub fn set_health(&self, state: HealthState) {
        self.health.store(state as u8, Ordering::Release);
    }

    pub fn quality(&self) -> QualityLevel {
        QualityLevel::from_u8(self.quality.load(Ordering::Acquire))
    }

    pub fn set_quality(&self, level: QualityLevel) {
        self.quality.store(level as u8, Ordering::Release);
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Acquire))
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume.store(volume.to_bits(), Ordering::Release);
    }

    /// The task has returned.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }
}

fn check_gain(gain: f32) -> Result<f32, EngineError> {
    if gain.is_finite() && (0.0..=1.0).contains(&gain) {
        Ok(gain)
    } else {
        Err(EngineError::InvalidArgument {
            field: "gain",
            value: gain,
            expected: "0.0..=1.0",
        })
    }
}

/// Cloneable control surface of one guild pipeline.
///
/// Arguments are validated before anything is queued, so a bad value is
/// reported to the caller and never reaches the audio path.
#[derive(Clone)]
pub struct PipelineHandle {
    guild_id: GuildId,
    command_tx: flume::Sender<ControlCommand>,
    status: Arc<PipelineStatus>,
}

impl PipelineHandle {
    pub fn new(
        guild_id: GuildId,
        command_tx: flume::Sender<ControlCommand>,
        status: Arc<PipelineStatus>,
    ) -> Self {
        Self {
            guild_id,
            command_tx,
            status,
        }
    }

    pub fn guild_id(&self) -> &GuildId {
        &self.guild_id
    }

    pub fn health(&self) -> HealthState {
        self.status.health()
    }

    pub fn quality(&self) -> QualityLevel {
        self.status.quality()
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    fn closed_error(&self) -> EngineError {
        if self.status.health() == HealthState::Failed {
            EngineError::PipelineFailed(self.guild_id.clone())
        } else {
            EngineError::ChannelClosed(self.guild_id.clone())
        }
    }

    async fn send(&self, command: ControlCommand) -> Result<(), EngineError> {
        if self.status.health() == HealthState::Failed {
            return Err(EngineError::PipelineFailed(self.guild_id.clone()));
        }
        self.command_tx
            .send_async(command)
            .await
            .map_err(|_| self.closed_error())
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(flume::Sender<T>) -> ControlCommand,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = flume::bounded(1);
        self.send(build(reply_tx)).await?;
        reply_rx.recv_async().await.map_err(|_| self.closed_error())
    }

    pub async fn set_volume(&self, volume: f32) -> Result<(), EngineError> {
        if !volume.is_finite() || !(0.0..=1.0).contains(&volume) {
            return Err(EngineError::InvalidArgument {
                field: "volume",
                value: volume,
                expected: "0.0..=1.0",
            });
        }
        self.send(ControlCommand::SetVolume(volume)).await
    }

    pub async fn set_eq(&self, bass: f32, mid: f32, treble: f32) -> Result<(), EngineError> {
        let gains = EqGains::new(bass, mid, treble).validated()?;
        self.send(ControlCommand::SetEq(gains)).await
    }

    pub async fn apply_preset(&self, name: &str) -> Result<EqPreset, EngineError> {
        let preset = EqPreset::from_name(name)?;
        self.send(ControlCommand::ApplyPreset(preset)).await?;
        Ok(preset)
    }

    pub async fn set_quality_ceiling(&self, ceiling: QualityLevel) -> Result<(), EngineError> {
        self.send(ControlCommand::SetQualityCeiling(ceiling)).await
    }

    /// Clamps `lufs` into -30..=-16 and returns the target actually used.
    pub async fn set_normalization_target(&self, lufs: f32) -> Result<f32, EngineError> {
        if !lufs.is_finite() {
            return Err(EngineError::InvalidArgument {
                field: "lufs_target",
                value: lufs,
                expected: "a finite LUFS value",
            });
        }
        let lufs = lufs.clamp(MIN_TARGET_LUFS, MAX_TARGET_LUFS);
        self.send(ControlCommand::SetNormalizationTarget(lufs))
            .await?;
        Ok(lufs)
    }

    pub async fn enable_auto_gain_control(&self, enabled: bool) -> Result<(), EngineError> {
        self.send(ControlCommand::SetAutoGain(enabled)).await
    }

    /// `0.0` turns compression off, `1.0` is the strongest setting. Returns the
    /// clamped amount.
    pub async fn set_dynamic_range_compression(&self, amount: f32) -> Result<f32, EngineError> {
        if !amount.is_finite() {
            return Err(EngineError::InvalidArgument {
                field: "compression",
                value: amount,
                expected: "0.0..=1.0",
            });
        }
        let amount = amount.clamp(0.0, 1.0);
        self.send(ControlCommand::SetCompression(amount)).await?;
        Ok(amount)
    }

    pub async fn set_mix_mode(&self, mode: MixMode) -> Result<(), EngineError> {
        if mode == MixMode::Crossfade {
            return Err(EngineError::Config(
                "crossfade mode is entered through crossfade_to".to_owned(),
            ));
        }
        self.send(ControlCommand::SetMixMode(mode)).await
    }

    pub async fn add_overlay(
        &self,
        rx: flume::Receiver<AudioFrame>,
        priority: i32,
        gain: f32,
    ) -> Result<SourceId, EngineError> {
        let gain = check_gain(gain)?;
        self.request(|reply| ControlCommand::AddOverlay {
            rx,
            priority,
            gain,
            reply,
        })
        .await?
    }

    pub async fn remove_overlay(&self, id: SourceId) -> Result<(), EngineError> {
        if id == SourceId::PRIMARY {
            return Err(EngineError::UnknownSource(id));
        }
        self.request(|reply| ControlCommand::RemoveSource { id, reply })
            .await?
    }

    /// Fades from what is heard now to a new source. `None` uses the
    /// configured crossfade length.
    pub async fn crossfade_to(
        &self,
        rx: flume::Receiver<AudioFrame>,
        gain: f32,
        duration: Option<Duration>,
    ) -> Result<SourceId, EngineError> {
        let gain = check_gain(gain)?;
        self.request(|reply| ControlCommand::CrossfadeTo {
            rx,
            gain,
            duration,
            reply,
        })
        .await?
    }

    /// Reconnects the frame source now, outside the retry budget.
    pub async fn refresh(&self) -> Result<(), EngineError> {
        self.send(ControlCommand::Refresh).await
    }

    pub async fn get_audio_info(&self) -> Result<AudioInfo, EngineError> {
        self.request(ControlCommand::GetInfo).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (PipelineHandle, flume::Receiver<ControlCommand>, Arc<PipelineStatus>) {
        let (tx, rx) = flume::bounded(4);
        let status = Arc::new(PipelineStatus::new(QualityLevel::High, 0.8));
        (PipelineHandle::new(GuildId::from("9"), tx, status.clone()), rx, status)
    }

    #[tokio::test]
    async fn rejects_out_of_range_arguments_before_queueing() {
        let (handle, rx, _) = handle();
        assert!(matches!(
            handle.set_volume(1.5).await,
            Err(EngineError::InvalidArgument { field: "volume", .. })
        ));
        assert!(matches!(
            handle.set_eq(0.0, 13.0, 0.0).await,
            Err(EngineError::InvalidArgument { field: "mid", .. })
        ));
        assert!(matches!(
            handle.apply_preset("loudness-war").await,
            Err(EngineError::UnknownPreset(_))
        ));
        assert!(handle.set_mix_mode(MixMode::Crossfade).await.is_err());
        assert!(rx.is_empty());

        handle.set_volume(0.25).await.unwrap();
        assert!(matches!(rx.try_recv(), Ok(ControlCommand::SetVolume(v)) if v == 0.25));
    }

    #[tokio::test]
    async fn runtime_dsp_controls_clamp_and_queue() {
        let (handle, rx, _) = handle();
        assert_eq!(handle.set_normalization_target(-40.0).await.unwrap(), -30.0);
        assert!(matches!(
            rx.try_recv(),
            Ok(ControlCommand::SetNormalizationTarget(v)) if v == -30.0
        ));
        assert_eq!(handle.set_normalization_target(-14.0).await.unwrap(), -16.0);
        assert!(matches!(
            handle.set_normalization_target(f32::NAN).await,
            Err(EngineError::InvalidArgument { field: "lufs_target", .. })
        ));
        assert_eq!(handle.set_dynamic_range_compression(1.7).await.unwrap(), 1.0);
        assert!(handle.set_dynamic_range_compression(f32::INFINITY).await.is_err());
        handle.enable_auto_gain_control(false).await.unwrap();

        let queued: Vec<_> = rx.drain().collect();
        assert_eq!(queued.len(), 3);
        assert!(matches!(queued[1], ControlCommand::SetCompression(v) if v == 1.0));
        assert!(matches!(queued[2], ControlCommand::SetAutoGain(false)));
    }

    #[tokio::test]
    async fn closed_queue_reports_failure_state() {
        let (handle, rx, status) = handle();
        drop(rx);
        assert!(matches!(
            handle.refresh().await,
            Err(EngineError::ChannelClosed(_))
        ));
        status.set_health(HealthState::Failed);
        assert!(matches!(
            handle.set_volume(0.5).await,
            Err(EngineError::PipelineFailed(_))
        ));
    }

    #[test]
    fn status_round_trips_through_atomics() {
        let status = PipelineStatus::new(QualityLevel::Medium, 0.4);
        assert_eq!(status.quality(), QualityLevel::Medium);
        assert_eq!(status.volume(), 0.4);
        status.set_health(HealthState::Unhealthy);
        assert_eq!(status.health(), HealthState::Unhealthy);
    }
}
