use std::{sync::Arc, time::Duration};

use dashmap::{DashMap, mapref::entry::Entry};
use futures::future::join_all;
use serde::Serialize;
use tokio::{sync::Semaphore, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    control::{AudioInfo, PipelineHandle},
    events::{EngineEvent, EventSink},
    guild::{GuildPipeline, PipelineContext, PipelineExit},
};
use crate::{
    audio::{
        filters::EqPreset,
        frame::AudioFrame,
        mix::MixMode,
        source::{FrameSource, VoiceSink},
    },
    common::{EngineError, GuildId, SourceId},
    configs::Config,
    monitoring::{HealthState, SystemStats},
    quality::QualityLevel,
    storage::{GuildSettings, SettingsStore},
};

struct PipelineEntry {
    handle: PipelineHandle,
    cancel: CancellationToken,
    task: JoinHandle<PipelineExit>,
    instance: Uuid,
}

/// Counts for the periodic stats report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub pipelines: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub failed: usize,
    pub workers: usize,
    pub system: SystemStats,
}

/// Owns every guild pipeline and the resources they share.
pub struct PipelineSupervisor {
    config: Arc<Config>,
    store: Arc<dyn SettingsStore>,
    pipelines: DashMap<GuildId, PipelineEntry>,
    workers: Arc<Semaphore>,
    worker_count: usize,
    events: EventSink,
    events_rx: flume::Receiver<EngineEvent>,
    shutdown: CancellationToken,
}

impl PipelineSupervisor {
    pub fn new(config: Arc<Config>, store: Arc<dyn SettingsStore>) -> Self {
        let worker_count = config.engine.worker_count();
        let (events_tx, events_rx) = flume::bounded(config.engine.event_queue);
        Self {
            store,
            pipelines: DashMap::new(),
            workers: Arc::new(Semaphore::new(worker_count)),
            worker_count,
            events: EventSink::new(events_tx).with_terminal_wait(config.engine.terminal_event_wait()),
            events_rx,
            shutdown: CancellationToken::new(),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Receiving end of the engine event stream. Every clone competes for the same events.
    pub fn events(&self) -> flume::Receiver<EngineEvent> {
        self.events_rx.clone()
    }

    pub fn presets(&self) -> Vec<&'static str> {
        EqPreset::names().collect()
    }

    pub fn guilds(&self) -> Vec<GuildId> {
        self.pipelines.iter().map(|e| e.key().clone()).collect()
    }

    pub fn is_running(&self, guild_id: &GuildId) -> bool {
        self.pipelines
            .get(guild_id)
            .is_some_and(|e| !e.handle.is_finished())
    }

    /// Starts a pipeline for `guild_id` with its stored settings.
    pub async fn start<S, K>(
        &self,
        guild_id: GuildId,
        source: S,
        sink: K,
    ) -> Result<PipelineHandle, EngineError>
    where
        S: FrameSource + 'static,
        K: VoiceSink + 'static,
    {
        self.start_boxed(guild_id, Box::new(source), Box::new(sink))
            .await
    }

    pub async fn start_boxed(
        &self,
        guild_id: GuildId,
        source: Box<dyn FrameSource>,
        sink: Box<dyn VoiceSink>,
    ) -> Result<PipelineHandle, EngineError> {
        if self.is_running(&guild_id) {
            return Err(EngineError::AlreadyRunning(guild_id));
        }
        let settings = self.load_settings(&guild_id).await;

        let cancel = self.shutdown.child_token();
        let ctx = PipelineContext {
            events: self.events.clone(),
            workers: self.workers.clone(),
            store: self.store.clone(),
        };
        let (pipeline, handle) = GuildPipeline::new(
            guild_id.clone(),
            self.config.clone(),
            settings,
            source,
            sink,
            ctx,
            cancel.clone(),
        );
        let instance = pipeline.instance();

        match self.pipelines.entry(guild_id.clone()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().handle.is_finished() {
                    return Err(EngineError::AlreadyRunning(guild_id));
                }
                let task = tokio::spawn(pipeline.run());
                let old = occupied.insert(PipelineEntry {
                    handle: handle.clone(),
                    cancel,
                    task,
                    instance,
                });
                old.cancel.cancel();
            }
            Entry::Vacant(vacant) => {
                let task = tokio::spawn(pipeline.run());
                vacant.insert(PipelineEntry {
                    handle: handle.clone(),
                    cancel,
                    task,
                    instance,
                });
            }
        }
        info!("[{}] Pipeline {} scheduled", guild_id, instance);
        Ok(handle)
    }

    async fn load_settings(&self, guild_id: &GuildId) -> GuildSettings {
        let defaults = GuildSettings {
            volume: self.config.dsp.volume.default_volume,
            quality_ceiling: self.config.quality.ceiling,
            ..GuildSettings::default()
        };
        match self.store.load(guild_id).await {
            Ok(Some(settings)) => settings,
            Ok(None) => defaults,
            Err(e) => {
                warn!("[{}] Could not load settings, using defaults: {}", guild_id, e);
                defaults
            }
        }
    }

    async fn stop_entry(&self, guild_id: &GuildId, entry: PipelineEntry) -> Option<PipelineExit> {
        entry.cancel.cancel();
        let mut task = entry.task;
        match tokio::time::timeout(self.config.engine.stop_timeout(), &mut task).await {
            Ok(Ok(exit)) => Some(exit),
            Ok(Err(e)) => {
                warn!("[{}] Pipeline task ended abnormally: {}", guild_id, e);
                None
            }
            Err(_) => {
                warn!(
                    "[{}] Pipeline {} did not stop within {:?}, aborting",
                    guild_id,
                    entry.instance,
                    self.config.engine.stop_timeout()
                );
                task.abort();
                None
            }
        }
    }

    /// Stops the guild's pipeline and drops its state. Other guilds keep playing.
    pub async fn stop(&self, guild_id: &GuildId) -> Result<(), EngineError> {
        let (_, entry) = self
            .pipelines
            .remove(guild_id)
            .ok_or_else(|| EngineError::PipelineNotFound(guild_id.clone()))?;
        self.stop_entry(guild_id, entry).await;
        Ok(())
    }

    /// Replaces the guild's pipeline, failed or not, with a fresh instance
    /// that keeps the same source and sink.
    pub async fn restart(&self, guild_id: &GuildId) -> Result<PipelineHandle, EngineError> {
        let (_, entry) = self
            .pipelines
            .remove(guild_id)
            .ok_or_else(|| EngineError::PipelineNotFound(guild_id.clone()))?;
        let exit = self
            .stop_entry(guild_id, entry)
            .await
            .ok_or_else(|| EngineError::ChannelClosed(guild_id.clone()))?;
        info!(
            "[{}] Restarting pipeline {} ({:?})",
            guild_id, exit.instance, exit.reason
        );
        self.start_boxed(guild_id.clone(), exit.source, exit.sink)
            .await
    }

    pub fn handle(&self, guild_id: &GuildId) -> Result<PipelineHandle, EngineError> {
        let handle = self
            .pipelines
            .get(guild_id)
            .map(|e| e.handle.clone())
            .ok_or_else(|| EngineError::PipelineNotFound(guild_id.clone()))?;
        if handle.health() == HealthState::Failed {
            return Err(EngineError::PipelineFailed(guild_id.clone()));
        }
        Ok(handle)
    }

    pub async fn set_volume(&self, guild_id: &GuildId, volume: f32) -> Result<(), EngineError> {
        self.handle(guild_id)?.set_volume(volume).await
    }

    pub async fn set_eq(
        &self,
        guild_id: &GuildId,
        bass: f32,
        mid: f32,
        treble: f32,
    ) -> Result<(), EngineError> {
        self.handle(guild_id)?.set_eq(bass, mid, treble).await
    }

    pub async fn apply_preset(&self, guild_id: &GuildId, name: &str) -> Result<EqPreset, EngineError> {
        self.handle(guild_id)?.apply_preset(name).await
    }

    pub async fn set_quality_ceiling(
        &self,
        guild_id: &GuildId,
        ceiling: QualityLevel,
    ) -> Result<(), EngineError> {
        self.handle(guild_id)?.set_quality_ceiling(ceiling).await
    }

    pub async fn set_normalization_target(
        &self,
        guild_id: &GuildId,
        lufs: f32,
    ) -> Result<f32, EngineError> {
        self.handle(guild_id)?.set_normalization_target(lufs).await
    }

    pub async fn enable_auto_gain_control(
        &self,
        guild_id: &GuildId,
        enabled: bool,
    ) -> Result<(), EngineError> {
        self.handle(guild_id)?.enable_auto_gain_control(enabled).await
    }

    pub async fn set_dynamic_range_compression(
        &self,
        guild_id: &GuildId,
        amount: f32,
    ) -> Result<f32, EngineError> {
        self.handle(guild_id)?
            .set_dynamic_range_compression(amount)
            .await
    }

    pub async fn set_mix_mode(&self, guild_id: &GuildId, mode: MixMode) -> Result<(), EngineError> {
        self.handle(guild_id)?.set_mix_mode(mode).await
    }

    pub async fn add_overlay(
        &self,
        guild_id: &GuildId,
        rx: flume::Receiver<AudioFrame>,
        priority: i32,
        gain: f32,
    ) -> Result<SourceId, EngineError> {
        self.handle(guild_id)?.add_overlay(rx, priority, gain).await
    }

    pub async fn remove_overlay(&self, guild_id: &GuildId, id: SourceId) -> Result<(), EngineError> {
        self.handle(guild_id)?.remove_overlay(id).await
    }

    pub async fn crossfade_to(
        &self,
        guild_id: &GuildId,
        rx: flume::Receiver<AudioFrame>,
        gain: f32,
        duration: Option<Duration>,
    ) -> Result<SourceId, EngineError> {
        self.handle(guild_id)?.crossfade_to(rx, gain, duration).await
    }

    pub async fn refresh(&self, guild_id: &GuildId) -> Result<(), EngineError> {
        self.handle(guild_id)?.refresh().await
    }

    pub async fn get_audio_info(&self, guild_id: &GuildId) -> Result<AudioInfo, EngineError> {
        self.handle(guild_id)?.get_audio_info().await
    }

    pub fn stats(&self) -> EngineStats {
        let mut stats = EngineStats {
            workers: self.worker_count,
            system: SystemStats::collect(),
            ..EngineStats::default()
        };
        for entry in self.pipelines.iter() {
            if entry.handle.is_finished() {
                continue;
            }
            stats.pipelines += 1;
            match entry.handle.health() {
                HealthState::Healthy => stats.healthy += 1,
                HealthState::Degraded => stats.degraded += 1,
                HealthState::Unhealthy => stats.unhealthy += 1,
                HealthState::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Stops every pipeline and waits for all of them.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let guilds = self.guilds();
        let entries: Vec<_> = guilds
            .iter()
            .filter_map(|g| self.pipelines.remove(g))
            .collect();
        info!("Shutting down {} pipelines", entries.len());
        join_all(
            entries
                .into_iter()
                .map(|(guild_id, entry)| async move { self.stop_entry(&guild_id, entry).await }),
        )
        .await;
    }
}

impl Drop for PipelineSupervisor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::source::{ChannelFrameSource, ChannelVoiceSink},
        storage::MemorySettingsStore,
    };

    fn supervisor() -> PipelineSupervisor {
        PipelineSupervisor::new(
            Arc::new(Config::default()),
            Arc::new(MemorySettingsStore::default()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn one_pipeline_per_guild() {
        let sup = supervisor();
        let guild = GuildId::from("10");
        let (_tx, source) = ChannelFrameSource::pair(4);
        let (sink, _rx) = ChannelVoiceSink::pair(4);
        sup.start(guild.clone(), source, sink).await.unwrap();

        let (_tx2, source) = ChannelFrameSource::pair(4);
        let (sink, _rx2) = ChannelVoiceSink::pair(4);
        assert!(matches!(
            sup.start(guild.clone(), source, sink).await,
            Err(EngineError::AlreadyRunning(_))
        ));

        sup.stop(&guild).await.unwrap();
        assert!(matches!(
            sup.stop(&guild).await,
            Err(EngineError::PipelineNotFound(_))
        ));
        assert!(matches!(
            sup.set_volume(&guild, 0.2).await,
            Err(EngineError::PipelineNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn settings_survive_restart() {
        let sup = supervisor();
        let guild = GuildId::from("11");
        let (tx, source) = ChannelFrameSource::pair(4);
        let (sink, out) = ChannelVoiceSink::pair(4);
        sup.start(guild.clone(), source, sink).await.unwrap();

        sup.apply_preset(&guild, "Jazz").await.unwrap();
        sup.set_volume(&guild, 0.3).await.unwrap();
        // A round trip through the task guarantees both commands were applied.
        sup.get_audio_info(&guild).await.unwrap();
        // Let the settings writer catch up.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let handle = sup.restart(&guild).await.unwrap();
        let info = handle.get_audio_info().await.unwrap();
        assert_eq!(info.preset, Some(EqPreset::Jazz));
        assert_eq!(info.volume, 0.3);
        assert_eq!(info.health, HealthState::Healthy);

        tx.send_async(AudioFrame::silence(1920, 2, 0, tokio::time::Instant::now()))
            .await
            .unwrap();
        assert_eq!(out.recv_async().await.unwrap().sequence(), 0);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn stats_count_running_pipelines() {
        let sup = supervisor();
        assert_eq!(sup.presets().len(), 9);
        let (_tx, source) = ChannelFrameSource::pair(4);
        let (sink, _rx) = ChannelVoiceSink::pair(4);
        sup.start(GuildId::from("12"), source, sink).await.unwrap();
        let stats = sup.stats();
        assert_eq!(stats.pipelines, 1);
        assert_eq!(stats.healthy, 1);
        assert!(stats.workers >= 1);
        sup.shutdown().await;
        assert_eq!(sup.stats().pipelines, 0);
    }
}
