//! One guild's audio pipeline and the task loop that drives it.
//!
//! Every piece of per-guild state lives in [`GuildPipeline`] and is touched
//! only by its own task. The loop waits on a single `select!` so control
//! commands, timers, recovery and the next source frame are all observed at
//! frame boundaries, and cancellation wins over everything else.
//!
//! A station brought in with `crossfade_to` gets its own DSP chain while the
//! fade runs. When the fade completes it replaces the frame source and its
//! chain becomes the pipeline's chain; the old source is dropped.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::Semaphore,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    control::{AudioInfo, ControlCommand, PipelineHandle, PipelineStatus},
    events::{EngineEvent, EventSink, StopReason},
};
use crate::{
    audio::{
        constants::{MAX_TARGET_LUFS, MIN_TARGET_LUFS},
        filters::{ChainOutput, DspChain, EqPreset},
        frame::AudioFrame,
        mix::{MixOutput, Mixer, ModeChange},
        source::{ChannelFrameSource, FrameOutcome, FrameSource, VoiceSink},
        volume::MasterVolume,
    },
    common::{GuildId, SinkError, SourceId},
    configs::Config,
    monitoring::{
        AttemptOutcome, HealthMonitor, HealthTransition, MetricsCollector, RecoveryAction,
        RecoveryAttempt, RecoveryDecision, RecoveryManager,
    },
    quality::{QualityController, QualityLevel},
    storage::{GuildSettings, SettingsStore},
};

/// Shared resources a pipeline borrows from its supervisor.
#[derive(Clone)]
pub struct PipelineContext {
    pub events: EventSink,
    /// FIFO permits gating the CPU-bound part of each frame.
    pub workers: Arc<Semaphore>,
    pub store: Arc<dyn SettingsStore>,
}

/// What is left of a pipeline after its task returns. The source and sink
/// can be handed to a fresh instance.
pub struct PipelineExit {
    pub guild_id: GuildId,
    pub instance: Uuid,
    pub reason: StopReason,
    pub source: Box<dyn FrameSource>,
    pub sink: Box<dyn VoiceSink>,
}

impl std::fmt::Debug for PipelineExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineExit")
            .field("guild_id", &self.guild_id)
            .field("instance", &self.instance)
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

pub struct GuildPipeline {
    guild_id: GuildId,
    instance: Uuid,
    config: Arc<Config>,
    source: Box<dyn FrameSource>,
    sink: Box<dyn VoiceSink>,
    source_live: bool,

    chain: DspChain,
    incoming: Option<IncomingStation>,
    mixer: Mixer,
    volume: MasterVolume,
    metrics: MetricsCollector,
    health: HealthMonitor,
    recovery: RecoveryManager,
    quality: QualityController,
    pending: Option<RecoveryAttempt>,
    stage_faults_seen: u64,

    settings: GuildSettings,
    settings_tx: flume::Sender<GuildSettings>,
    /// Same queue as the writer reads; lets a newer snapshot displace a queued one.
    settings_backlog: flume::Receiver<GuildSettings>,
    commands: flume::Receiver<ControlCommand>,
    status: Arc<PipelineStatus>,
    ctx: PipelineContext,
    cancel: CancellationToken,
}

fn apply_eq_settings(guild_id: &GuildId, chain: &mut DspChain, settings: &GuildSettings) {
    if let Some(name) = settings.preset.as_deref() {
        match EqPreset::from_name(name) {
            Ok(preset) => {
                chain.apply_preset(preset);
                return;
            }
            Err(e) => warn!("[{}] Ignoring stored preset: {}", guild_id, e),
        }
    }
    if let Err(e) = chain.set_eq(settings.eq) {
        warn!("[{}] Ignoring stored EQ gains: {}", guild_id, e);
    }
}

fn apply_runtime_settings(chain: &mut DspChain, settings: &GuildSettings) {
    if let Some(lufs) = settings.normalization_target {
        chain.set_normalization_target(lufs.clamp(MIN_TARGET_LUFS, MAX_TARGET_LUFS));
    }
    if let Some(enabled) = settings.auto_gain {
        chain.set_auto_gain(enabled);
    }
    if let Some(amount) = settings.compression {
        chain.set_compression(amount);
    }
}

/// A crossfade target and the chain its frames run through until it takes over.
struct IncomingStation {
    id: SourceId,
    chain: DspChain,
}

impl IncomingStation {
    fn process(&mut self, frame: AudioFrame) -> AudioFrame {
        let (sequence, captured_at, channels) =
            (frame.sequence(), frame.captured_at(), frame.channels());
        match self.chain.process(frame) {
            ChainOutput::Processed(frame) => frame,
            // The mixer treats a frame of the wrong length as silence.
            ChainOutput::Skipped { .. } => {
                AudioFrame::new(Vec::new(), channels, sequence, captured_at)
            }
        }
    }
}

fn spawn_settings_writer(
    guild_id: GuildId,
    store: Arc<dyn SettingsStore>,
    rx: flume::Receiver<GuildSettings>,
) {
    tokio::spawn(async move {
        while let Ok(mut settings) = rx.recv_async().await {
            // Only the latest state matters.
            while let Ok(newer) = rx.try_recv() {
                settings = newer;
            }
            if let Err(e) = store.save(&guild_id, &settings).await {
                warn!("[{}] Failed to save settings: {}", guild_id, e);
            }
        }
    });
}

impl GuildPipeline {
    /// Builds every per-guild component from `config` and the guild's stored settings.
    pub fn new(
        guild_id: GuildId,
        config: Arc<Config>,
        settings: GuildSettings,
        source: Box<dyn FrameSource>,
        sink: Box<dyn VoiceSink>,
        ctx: PipelineContext,
        cancel: CancellationToken,
    ) -> (Self, PipelineHandle) {
        let engine = &config.engine;
        let now = Instant::now();

        let mut chain = DspChain::new(guild_id.clone(), &config.dsp, engine);
        apply_eq_settings(&guild_id, &mut chain, &settings);
        apply_runtime_settings(&mut chain, &settings);
        let mixer = Mixer::new(config.mixer.clone(), engine.sample_rate);
        let volume = MasterVolume::new(
            settings.volume,
            engine.sample_rate,
            engine.channels,
            config.dsp.volume.ramp_ms,
        );
        let metrics = MetricsCollector::new(config.health.metrics_window(), engine.frame_period());

        let (notice_tx, notice_rx) = flume::bounded(engine.notice_queue);
        let health = HealthMonitor::new(guild_id.clone(), config.health.clone(), notice_tx, now);
        let recovery = RecoveryManager::new(guild_id.clone(), config.recovery.clone(), notice_rx);
        let quality = QualityController::new(config.quality.clone(), settings.quality_ceiling);

        let (command_tx, commands) = flume::bounded(engine.control_queue);
        let status = Arc::new(PipelineStatus::new(quality.level(), volume.volume()));
        let handle = PipelineHandle::new(guild_id.clone(), command_tx, status.clone());

        let (settings_tx, settings_rx) = flume::bounded(1);
        spawn_settings_writer(guild_id.clone(), ctx.store.clone(), settings_rx.clone());

        let mut pipeline = Self {
            guild_id,
            instance: Uuid::new_v4(),
            config,
            source,
            sink,
            source_live: true,
            chain,
            incoming: None,
            mixer,
            volume,
            metrics,
            health,
            recovery,
            quality,
            pending: None,
            stage_faults_seen: 0,
            settings,
            settings_tx,
            settings_backlog: settings_rx,
            commands,
            status,
            ctx,
            cancel,
        };
        pipeline.apply_quality_level(pipeline.quality.level());
        (pipeline, handle)
    }

    pub fn instance(&self) -> Uuid {
        self.instance
    }

    /// Runs until stopped, until the sink closes or until recovery gives up.
    pub async fn run(mut self) -> PipelineExit {
        info!(
            "[{}] Pipeline {} started at {} quality ({})",
            self.guild_id,
            self.instance,
            self.quality.level(),
            self.source.label()
        );
        self.ctx
            .events
            .emit(EngineEvent::PipelineStarted {
                guild_id: self.guild_id.clone(),
                instance: self.instance,
                quality: self.quality.level(),
            })
            .await;

        let mut health_tick = tokio::time::interval(self.config.health.evaluate_interval());
        health_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut quality_tick = tokio::time::interval(self.config.quality.evaluate_interval());
        quality_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let source_wait = self
            .config
            .engine
            .source_wait()
            .min(self.config.health.stall_timeout());

        // Timer branches interrupt the wait for a frame; the deadline keeps
        // the wait from starting over each time they do.
        let mut frame_deadline = Instant::now() + source_wait;
        let mut commands_open = true;
        let reason = loop {
            if !self.source_live {
                frame_deadline = Instant::now() + source_wait;
            }
            let frame_wait = frame_deadline.saturating_duration_since(Instant::now());
            let due = self.pending.as_ref().map(RecoveryAttempt::due_at);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break StopReason::Requested,
                command = self.commands.recv_async(), if commands_open => match command {
                    Ok(command) => self.handle_command(command).await,
                    // Every handle is gone; only the cancel token can stop us now.
                    Err(_) => commands_open = false,
                },
                _ = tokio::time::sleep_until(due.unwrap_or_else(Instant::now)), if due.is_some() => {
                    if let Some(reason) = self.run_recovery().await {
                        break reason;
                    }
                }
                _ = health_tick.tick() => {
                    if let Some(reason) = self.evaluate_health().await {
                        break reason;
                    }
                }
                _ = quality_tick.tick() => self.evaluate_quality().await,
                outcome = self.source.next_frame(frame_wait), if self.source_live => {
                    frame_deadline = Instant::now() + source_wait;
                    match outcome {
                        FrameOutcome::Frame(frame) => {
                            if let Some(reason) = self.on_frame(frame).await {
                                break reason;
                            }
                        }
                        FrameOutcome::Timeout => self.metrics.record_underrun(Instant::now()),
                        FrameOutcome::Closed => {
                            warn!("[{}] Frame source closed", self.guild_id);
                            self.health.on_closed();
                            self.source_live = false;
                        }
                    }
                }
            }
        };

        match reason {
            StopReason::Failed => {}
            _ => {
                info!("[{}] Pipeline {} stopped: {:?}", self.guild_id, self.instance, reason);
                self.ctx
                    .events
                    .emit(EngineEvent::PipelineStopped {
                        guild_id: self.guild_id.clone(),
                        reason,
                    })
                    .await;
            }
        }
        self.status.mark_finished();

        PipelineExit {
            guild_id: self.guild_id,
            instance: self.instance,
            reason,
            source: self.source,
            sink: self.sink,
        }
    }

    async fn on_frame(&mut self, frame: AudioFrame) -> Option<StopReason> {
        let now = Instant::now();
        self.health.on_frame(now, frame.sequence());
        if self.recovery.is_engaged() {
            debug!("[{}] Frames flowing again, standing down recovery", self.guild_id);
            self.recovery.cancel_pending();
            self.recovery.confirm();
            self.health.note_reconnected(now);
            if let Some(attempt) = self.pending.take() {
                self.publish_finished(&attempt, AttemptOutcome::Cancelled, None)
                    .await;
            }
        }

        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Some(StopReason::Requested),
            permit = self.ctx.workers.clone().acquire_owned() => permit,
        };
        let Ok(permit) = permit else {
            return Some(StopReason::Requested);
        };

        let started = Instant::now();
        let (sequence, captured_at) = (frame.sequence(), frame.captured_at());
        self.chain.set_duck_level(self.mixer.duck_level());
        let processed = match self.chain.process(frame) {
            ChainOutput::Processed(frame) => frame,
            ChainOutput::Skipped { escalate, .. } => {
                self.metrics.record_malformed(started);
                self.health.record_decode_fault();
                if escalate {
                    self.health.escalate_decode_faults();
                }
                AudioFrame::silence(
                    self.config.engine.frame_samples(),
                    self.config.engine.channels,
                    sequence,
                    captured_at,
                )
            }
        };

        let faults = self.chain.stats().stage_faults;
        if faults > self.stage_faults_seen {
            self.metrics
                .record_stage_faults((faults - self.stage_faults_seen) as u32);
            self.stage_faults_seen = faults;
        }

        let incoming = &mut self.incoming;
        let MixOutput { frame, mode_change } =
            self.mixer.mix_with(processed, |id, frame| match incoming.as_mut() {
                Some(station) if station.id == id => station.process(frame),
                _ => frame,
            });
        if let Some(change) = mode_change {
            self.publish_mode_change(change).await;
        }
        self.adopt_promoted();
        let channels = frame.channels();
        let mut samples = frame.into_samples();
        self.volume.process(&mut samples);
        let out = AudioFrame::new(samples, channels, sequence, captured_at);
        self.metrics.record_frame(Instant::now(), started.elapsed());
        drop(permit);

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Some(StopReason::Requested),
            sent = self.sink.send(out) => match sent {
                Ok(()) => None,
                Err(SinkError::Closed) => {
                    warn!("[{}] Voice sink closed", self.guild_id);
                    Some(StopReason::SinkClosed)
                }
                Err(e) => {
                    warn!("[{}] Frame #{} not delivered: {}", self.guild_id, sequence, e);
                    None
                }
            },
        }
    }

    async fn handle_command(&mut self, command: ControlCommand) {
        self.apply_command(command).await;
        self.adopt_promoted();
    }

    async fn apply_command(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::SetVolume(volume) => {
                self.volume.set_volume(volume);
                self.status.set_volume(self.volume.volume());
                self.settings.volume = self.volume.volume();
                self.persist();
            }
            ControlCommand::SetEq(gains) => match self.chain.set_eq(gains) {
                Ok(()) => {
                    if let Some(station) = self.incoming.as_mut() {
                        let _ = station.chain.set_eq(gains);
                    }
                    debug!("[{}] EQ set to {:?}", self.guild_id, gains);
                    self.settings.eq = gains;
                    self.settings.preset = None;
                    self.persist();
                }
                Err(e) => warn!("[{}] Rejected EQ change: {}", self.guild_id, e),
            },
            ControlCommand::ApplyPreset(preset) => {
                debug!("[{}] Applying EQ preset {}", self.guild_id, preset);
                self.chain.apply_preset(preset);
                if let Some(station) = self.incoming.as_mut() {
                    station.chain.apply_preset(preset);
                }
                self.settings.eq = preset.gains();
                self.settings.preset = Some(preset.name().to_owned());
                self.persist();
            }
            ControlCommand::SetQualityCeiling(ceiling) => {
                self.quality.set_ceiling(ceiling);
                self.settings.quality_ceiling = ceiling;
                self.persist();
            }
            ControlCommand::SetNormalizationTarget(lufs) => {
                let from = self.chain.normalization_target();
                for chain in self.chains_mut() {
                    chain.set_normalization_target(lufs);
                }
                self.settings.normalization_target = Some(lufs);
                self.persist();
                info!(
                    "[{}] Normalization target {:.1} -> {:.1} LUFS",
                    self.guild_id, from, lufs
                );
                self.ctx
                    .events
                    .emit(EngineEvent::NormalizationAdjusted {
                        guild_id: self.guild_id.clone(),
                        from,
                        to: lufs,
                    })
                    .await;
            }
            ControlCommand::SetAutoGain(enabled) => {
                for chain in self.chains_mut() {
                    chain.set_auto_gain(enabled);
                }
                self.settings.auto_gain = Some(enabled);
                self.persist();
                info!(
                    "[{}] {} automatic gain control",
                    self.guild_id,
                    if enabled { "Enabled" } else { "Disabled" }
                );
            }
            ControlCommand::SetCompression(amount) => {
                for chain in self.chains_mut() {
                    chain.set_compression(amount);
                }
                self.settings.compression = Some(amount);
                self.persist();
                info!("[{}] Dynamic range compression set to {:.2}", self.guild_id, amount);
            }
            ControlCommand::SetMixMode(mode) => match self.mixer.set_mode(mode) {
                Ok(Some(change)) => self.publish_mode_change(change).await,
                Ok(None) => {}
                Err(e) => warn!("[{}] Mix mode not changed: {}", self.guild_id, e),
            },
            ControlCommand::AddOverlay {
                rx,
                priority,
                gain,
                reply,
            } => {
                let result = self.mixer.add_source(rx, priority, gain);
                if let Ok(id) = &result {
                    info!(
                        "[{}] Source {} joined the mix (priority {}, gain {:.2})",
                        self.guild_id, id, priority, gain
                    );
                }
                let _ = reply.send(result);
            }
            ControlCommand::RemoveSource { id, reply } => {
                let result = match self.mixer.remove_source(id) {
                    Ok(change) => {
                        if let Some(change) = change {
                            self.publish_mode_change(change).await;
                        }
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            ControlCommand::CrossfadeTo {
                rx,
                gain,
                duration,
                reply,
            } => {
                let duration = duration.unwrap_or_else(|| self.config.mixer.crossfade());
                let result = match self.mixer.add_crossfade_source(rx, gain, duration) {
                    Ok((id, change)) => {
                        info!("[{}] Crossfading to source {} over {:?}", self.guild_id, id, duration);
                        // A fade cut short by this one may have handed over already.
                        self.adopt_promoted();
                        self.incoming = Some(IncomingStation {
                            id,
                            chain: self.fresh_chain(),
                        });
                        if let Some(change) = change {
                            self.publish_mode_change(change).await;
                        }
                        Ok(id)
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            ControlCommand::Refresh => {
                match self.recovery.schedule_manual(Instant::now()) {
                    Some(attempt) => {
                        info!("[{}] Manual reconnect requested", self.guild_id);
                        self.publish_scheduled(&attempt).await;
                        self.pending = Some(attempt);
                    }
                    None => debug!("[{}] Reconnect already pending", self.guild_id),
                }
            }
            ControlCommand::GetInfo(reply) => {
                let _ = reply.send(self.audio_info());
            }
        }
    }

    /// The station's chain plus the chain of a station still fading in.
    fn chains_mut(&mut self) -> impl Iterator<Item = &mut DspChain> {
        std::iter::once(&mut self.chain).chain(self.incoming.as_mut().map(|s| &mut s.chain))
    }

    /// A chain carrying the guild's stored EQ, runtime settings and current quality.
    fn fresh_chain(&self) -> DspChain {
        let mut chain = DspChain::new(self.guild_id.clone(), &self.config.dsp, &self.config.engine);
        apply_eq_settings(&self.guild_id, &mut chain, &self.settings);
        apply_runtime_settings(&mut chain, &self.settings);
        chain.apply_quality(&self.quality.level().profile());
        chain
    }

    /// Completes a crossfade handover: the target's receiver becomes the
    /// frame source and its chain the pipeline's chain.
    fn adopt_promoted(&mut self) {
        let Some((id, rx)) = self.mixer.take_promoted() else {
            if self
                .incoming
                .as_ref()
                .is_some_and(|station| !self.mixer.contains(station.id))
            {
                debug!("[{}] Incoming station left before the fade finished", self.guild_id);
                self.incoming = None;
            }
            return;
        };
        let chain = match self.incoming.take() {
            Some(station) if station.id == id => station.chain,
            other => {
                self.incoming = other;
                self.fresh_chain()
            }
        };
        let source = ChannelFrameSource::new(rx).with_label(format!("crossfade:{id}"));
        let previous = std::mem::replace(&mut self.source, Box::new(source));
        info!(
            "[{}] Source {} took over from {}",
            self.guild_id,
            id,
            previous.label()
        );
        drop(previous);
        self.chain = chain;
        self.stage_faults_seen = self.chain.stats().stage_faults;
        self.source_live = true;
        self.health.note_reconnected(Instant::now());
    }

    fn audio_info(&self) -> AudioInfo {
        AudioInfo {
            guild_id: self.guild_id.clone(),
            volume: self.volume.volume(),
            eq: self.chain.eq(),
            preset: self.chain.preset(),
            quality_level: self.quality.level(),
            quality_ceiling: self.quality.ceiling(),
            normalization_target: self.chain.normalization_target(),
            auto_gain: self.chain.auto_gain(),
            compression_ratio: self.chain.compression_ratio(),
            sample_rate: self.config.engine.sample_rate,
            channels: self.config.engine.channels,
            health: self.health.state(),
            mix_mode: self.mixer.mode(),
            sources: self.mixer.sources(),
            crossfade_progress: self.mixer.crossfade_progress(),
        }
    }

    /// Queues the current settings for the writer. A snapshot the writer has
    /// not picked up yet is replaced.
    fn persist(&self) {
        let settings = match self.settings_tx.try_send(self.settings.clone()) {
            Ok(()) => return,
            Err(flume::TrySendError::Full(settings)) => settings,
            Err(flume::TrySendError::Disconnected(_)) => {
                warn!("[{}] Settings writer is gone", self.guild_id);
                return;
            }
        };
        let _ = self.settings_backlog.try_recv();
        if self.settings_tx.try_send(settings).is_err() {
            warn!("[{}] Settings snapshot dropped", self.guild_id);
        }
    }

    fn apply_quality_level(&mut self, level: QualityLevel) {
        let profile = level.profile();
        for chain in self.chains_mut() {
            chain.apply_quality(&profile);
        }
        self.mixer.set_blend_resolution(profile.blend_resolution);
        self.status.set_quality(level);
    }

    async fn evaluate_quality(&mut self) {
        let now = Instant::now();
        let snapshot = self.metrics.snapshot(now);
        let Some(change) = self.quality.evaluate(&snapshot, now) else {
            return;
        };
        self.apply_quality_level(change.to);
        info!(
            "[{}] Quality {} -> {} ({:?}, load {:.2}, underruns {:.3})",
            self.guild_id, change.from, change.to, change.reason, snapshot.cpu_load, snapshot.underrun_rate
        );
        self.ctx
            .events
            .emit(EngineEvent::QualityChanged {
                guild_id: self.guild_id.clone(),
                from: change.from,
                to: change.to,
                reason: change.reason,
            })
            .await;
    }

    async fn evaluate_health(&mut self) -> Option<StopReason> {
        let now = Instant::now();
        let snapshot = self.metrics.snapshot(now);
        for transition in self.health.evaluate(&snapshot, now) {
            self.publish_transition(transition).await;
        }
        let decision = self.recovery.poll_notices(now);
        self.apply_decision(decision).await
    }

    async fn apply_decision(&mut self, decision: Option<RecoveryDecision>) -> Option<StopReason> {
        match decision? {
            RecoveryDecision::Attempt(attempt) => {
                self.publish_scheduled(&attempt).await;
                self.pending = Some(attempt);
                None
            }
            RecoveryDecision::Exhausted { attempts } => {
                self.fail(attempts).await;
                Some(StopReason::Failed)
            }
        }
    }

    async fn run_recovery(&mut self) -> Option<StopReason> {
        let attempt = self.pending.take()?;
        if attempt.action == RecoveryAction::Restart {
            self.rebuild().await;
        }
        info!(
            "[{}] Reconnecting {} (attempt {}, {:?})",
            self.guild_id,
            self.source.label(),
            attempt.attempt,
            attempt.action
        );

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Some(StopReason::Requested),
            result = self.source.reconnect() => result,
        };
        let now = Instant::now();

        match result {
            Ok(()) => {
                self.recovery.record_success(attempt.sequence);
                self.health.note_reconnected(now);
                self.source_live = true;
                info!("[{}] Reconnect succeeded", self.guild_id);
                self.publish_finished(&attempt, AttemptOutcome::Succeeded, None)
                    .await;
                None
            }
            Err(e) => {
                warn!("[{}] Reconnect attempt {} failed: {}", self.guild_id, attempt.attempt, e);
                self.publish_finished(&attempt, AttemptOutcome::Failed, Some(e.to_string()))
                    .await;
                let decision = self.recovery.record_failure(attempt.sequence, &e, now);
                self.apply_decision(decision).await
            }
        }
    }

    /// Throws away chain, mixer and metrics state before a restart attempt.
    async fn rebuild(&mut self) {
        warn!("[{}] Restarting pipeline state", self.guild_id);
        self.chain = self.fresh_chain();
        self.incoming = None;
        self.stage_faults_seen = 0;

        let previous = self.mixer.mode();
        self.mixer = Mixer::new(self.config.mixer.clone(), self.config.engine.sample_rate);
        self.metrics.clear_window();
        self.apply_quality_level(self.quality.level());

        if previous != self.mixer.mode() {
            let change = ModeChange {
                from: previous,
                to: self.mixer.mode(),
            };
            self.publish_mode_change(change).await;
        }
    }

    async fn fail(&mut self, attempts: u32) {
        if let Some(transition) = self.health.mark_failed(Instant::now()) {
            self.publish_transition(transition).await;
        }
        error!(
            "[{}] Recovery gave up after {} attempts, pipeline failed",
            self.guild_id, attempts
        );
        self.ctx
            .events
            .emit(EngineEvent::PipelineFailed {
                guild_id: self.guild_id.clone(),
                attempts,
                cause: self.health.cause(),
            })
            .await;
    }

    async fn publish_transition(&mut self, transition: HealthTransition) {
        self.status.set_health(transition.to);
        info!(
            "[{}] Health {:?} -> {:?} ({:?})",
            self.guild_id, transition.from, transition.to, transition.cause
        );
        self.ctx
            .events
            .emit(EngineEvent::HealthChanged {
                guild_id: self.guild_id.clone(),
                from: transition.from,
                to: transition.to,
                cause: transition.cause,
                at_ms: transition.at_ms,
            })
            .await;
    }

    async fn publish_mode_change(&mut self, change: ModeChange) {
        debug!("[{}] Mix mode {} -> {}", self.guild_id, change.from, change.to);
        self.ctx
            .events
            .emit(EngineEvent::MixerModeChanged {
                guild_id: self.guild_id.clone(),
                from: change.from,
                to: change.to,
            })
            .await;
    }

    async fn publish_scheduled(&mut self, attempt: &RecoveryAttempt) {
        self.ctx
            .events
            .emit(EngineEvent::RecoveryScheduled {
                guild_id: self.guild_id.clone(),
                attempt: attempt.attempt,
                action: attempt.action,
                delay_ms: duration_ms(attempt.backoff),
            })
            .await;
    }

    async fn publish_finished(
        &mut self,
        attempt: &RecoveryAttempt,
        outcome: AttemptOutcome,
        error: Option<String>,
    ) {
        self.ctx
            .events
            .emit(EngineEvent::RecoveryFinished {
                guild_id: self.guild_id.clone(),
                attempt: attempt.attempt,
                outcome,
                error,
            })
            .await;
    }
}

fn duration_ms(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}
