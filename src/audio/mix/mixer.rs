//! `audio/mix/mixer.rs`: combines the processed stream with auxiliary layers.
//!
//! The primary stream ([`SourceId::PRIMARY`]) always exists. Auxiliary
//! [`MixLayer`]s are polled without waiting on every tick; a layer with
//! nothing ready contributes silence for that frame. A layer only competes
//! with the primary while it is active, i.e. it delivered a frame within the
//! last `idle_hold_frames` ticks.
//!
//! A finished crossfade hands the target's receiver back through
//! [`Mixer::take_promoted`] so its owner can make it the new primary input.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{crossfade::Crossfade, layer::MixLayer};
use crate::audio::frame::{AudioFrame, f32_to_sample, sample_to_f32};
use crate::audio::volume::SoftLimiter;
use crate::common::{EngineError, SourceId};
use crate::configs::MixerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MixMode {
    /// Only the newest active source is heard.
    #[default]
    Replace,
    /// All sources summed with normalised weights.
    Overlay,
    /// The highest-priority source at full gain, the rest at the floor.
    Priority,
    /// Linear blend between two sources, then back to `Replace`.
    Crossfade,
}

impl MixMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::Overlay => "overlay",
            Self::Priority => "priority",
            Self::Crossfade => "crossfade",
        }
    }
}

impl std::fmt::Display for MixMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModeChange {
    pub from: MixMode,
    pub to: MixMode,
}

pub struct MixOutput {
    pub frame: AudioFrame,
    pub mode_change: Option<ModeChange>,
}

/// Snapshot of one registered input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MixSource {
    pub id: SourceId,
    pub priority: i32,
    pub gain: f32,
    pub started: u64,
}

pub struct Mixer {
    config: MixerConfig,
    mode: MixMode,
    primary: MixSource,
    layers: Vec<MixLayer>,
    crossfade: Option<Crossfade>,
    blend_resolution: usize,
    sample_rate: u32,
    next_id: u32,
    next_start: u64,
    limiter: SoftLimiter,
    acc: Vec<f32>,
    from_buf: Vec<f32>,
    to_buf: Vec<f32>,
    pulled: Vec<(SourceId, AudioFrame)>,
    promoted: Option<(SourceId, flume::Receiver<AudioFrame>)>,
}

impl Mixer {
    pub fn new(config: MixerConfig, sample_rate: u32) -> Self {
        Self {
            mode: config.default_mode,
            primary: MixSource {
                id: SourceId::PRIMARY,
                priority: 0,
                gain: 1.0,
                started: 1,
            },
            config,
            layers: Vec::new(),
            crossfade: None,
            blend_resolution: 1,
            sample_rate,
            next_id: 1,
            next_start: 2,
            limiter: SoftLimiter::default(),
            acc: Vec::new(),
            from_buf: Vec::new(),
            to_buf: Vec::new(),
            pulled: Vec::new(),
            promoted: None,
        }
    }

    pub fn mode(&self) -> MixMode {
        self.mode
    }

    pub fn crossfade_progress(&self) -> Option<f32> {
        self.crossfade.map(|c| c.progress())
    }

    pub fn sources(&self) -> Vec<MixSource> {
        std::iter::once(self.primary)
            .chain(self.layers.iter().map(|l| MixSource {
                id: l.id,
                priority: l.priority,
                gain: l.gain,
                started: l.started,
            }))
            .collect()
    }

    pub fn contains(&self, id: SourceId) -> bool {
        id == SourceId::PRIMARY || self.layers.iter().any(|l| l.id == id)
    }

    fn source(&self, id: SourceId) -> Option<MixSource> {
        self.sources().into_iter().find(|s| s.id == id)
    }

    /// The primary plus every layer that is currently delivering.
    fn active_sources(&self) -> Vec<MixSource> {
        let hold = self.config.idle_hold_frames;
        std::iter::once(self.primary)
            .chain(
                self.layers
                    .iter()
                    .filter(|l| l.is_active(hold))
                    .map(|l| MixSource {
                        id: l.id,
                        priority: l.priority,
                        gain: l.gain,
                        started: l.started,
                    }),
            )
            .collect()
    }

    fn any_layer_active(&self) -> bool {
        let hold = self.config.idle_hold_frames;
        self.layers.iter().any(|l| l.is_active(hold))
    }

    /// Most recently started source among the active ones; what `Replace` plays.
    pub fn heard(&self) -> SourceId {
        let hold = self.config.idle_hold_frames;
        self.layers
            .iter()
            .filter(|l| l.is_active(hold))
            .map(|l| (l.started, l.id))
            .chain(std::iter::once((self.primary.started, self.primary.id)))
            .max()
            .map_or(SourceId::PRIMARY, |(_, id)| id)
    }

    /// Receiver of a crossfade target that has just become the primary.
    pub fn take_promoted(&mut self) -> Option<(SourceId, flume::Receiver<AudioFrame>)> {
        self.promoted.take()
    }

    /// Registers an auxiliary input and returns its id.
    pub fn add_source(
        &mut self,
        rx: flume::Receiver<AudioFrame>,
        priority: i32,
        gain: f32,
    ) -> Result<SourceId, EngineError> {
        if !gain.is_finite() || !(0.0..=1.0).contains(&gain) {
            return Err(EngineError::InvalidArgument {
                field: "gain",
                value: gain,
                expected: "0.0..=1.0",
            });
        }
        if self.layers.len() + 1 >= self.config.max_sources {
            return Err(EngineError::MixerFull(self.config.max_sources));
        }
        let id = SourceId(self.next_id);
        self.next_id += 1;
        let started = self.bump_start();
        self.layers.push(MixLayer::new(id, rx, priority, gain, started));
        Ok(id)
    }

    /// Registers an auxiliary input and fades to it from whatever is heard now.
    /// Until the fade completes the new source is never the one `Replace` picks.
    pub fn add_crossfade_source(
        &mut self,
        rx: flume::Receiver<AudioFrame>,
        gain: f32,
        duration: Duration,
    ) -> Result<(SourceId, Option<ModeChange>), EngineError> {
        let id = self.add_source(rx, 0, gain)?;
        if let Some(layer) = self.layers.iter_mut().find(|l| l.id == id) {
            layer.started = 0;
        }
        let change = self.start_crossfade(id, duration)?;
        Ok((id, change))
    }

    pub fn remove_source(&mut self, id: SourceId) -> Result<Option<ModeChange>, EngineError> {
        let Some(idx) = self.layers.iter().position(|l| l.id == id) else {
            return Err(EngineError::UnknownSource(id));
        };
        self.layers.remove(idx);
        if let Some(fade) = self.crossfade
            && (fade.from == id || fade.to == id)
        {
            self.crossfade = None;
            return Ok(self.switch_mode(MixMode::Replace));
        }
        Ok(None)
    }

    pub fn set_source_gain(&mut self, id: SourceId, gain: f32) -> Result<(), EngineError> {
        if !gain.is_finite() || !(0.0..=1.0).contains(&gain) {
            return Err(EngineError::InvalidArgument {
                field: "gain",
                value: gain,
                expected: "0.0..=1.0",
            });
        }
        if id == SourceId::PRIMARY {
            self.primary.gain = gain;
            return Ok(());
        }
        let layer = self
            .layers
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or(EngineError::UnknownSource(id))?;
        layer.gain = gain;
        Ok(())
    }

    /// Switches mode directly. Entering `Crossfade` this way is not possible;
    /// use [`Mixer::start_crossfade`]. Leaving it abandons the running fade.
    pub fn set_mode(&mut self, mode: MixMode) -> Result<Option<ModeChange>, EngineError> {
        if mode == MixMode::Crossfade {
            return Err(EngineError::Config(
                "crossfade mode is entered through crossfade_to".to_owned(),
            ));
        }
        if let Some(mut fade) = self.crossfade.take() {
            fade.finish();
            self.complete_crossfade(fade);
        }
        Ok(self.switch_mode(mode))
    }

    /// Starts blending from the currently heard source to `to`.
    ///
    /// A crossfade already running is completed first, so its target becomes
    /// the outgoing side of the new one.
    pub fn start_crossfade(
        &mut self,
        to: SourceId,
        duration: Duration,
    ) -> Result<Option<ModeChange>, EngineError> {
        if !self.contains(to) {
            return Err(EngineError::UnknownSource(to));
        }
        if let Some(mut fade) = self.crossfade.take() {
            fade.finish();
            self.complete_crossfade(fade);
        }
        let from = self.heard();
        if from == to {
            return Ok(None);
        }
        let frames = (duration.as_secs_f64() * self.sample_rate as f64).round() as usize;
        self.crossfade = Some(Crossfade::new(from, to, frames));
        Ok(self.switch_mode(MixMode::Crossfade))
    }

    /// Samples per channel between gain updates during blends.
    pub fn set_blend_resolution(&mut self, resolution: usize) {
        self.blend_resolution = resolution.max(1);
    }

    /// Level the primary should duck under: the loudest active auxiliary
    /// source in overlay mode.
    pub fn duck_level(&self) -> f32 {
        if self.mode != MixMode::Overlay {
            return 0.0;
        }
        let hold = self.config.idle_hold_frames;
        self.layers
            .iter()
            .filter(|l| l.is_active(hold))
            .map(|l| l.gain)
            .fold(0.0, f32::max)
    }

    /// Pulls whatever the auxiliary layers have ready and mixes it with `primary`.
    pub fn mix(&mut self, primary: AudioFrame) -> MixOutput {
        self.mix_with(primary, |_, frame| frame)
    }

    /// Like [`Mixer::mix`], but every pulled auxiliary frame goes through
    /// `prepare` first.
    pub fn mix_with(
        &mut self,
        primary: AudioFrame,
        mut prepare: impl FnMut(SourceId, AudioFrame) -> AudioFrame,
    ) -> MixOutput {
        let mut pulled = std::mem::take(&mut self.pulled);
        pulled.clear();
        for layer in self.layers.iter_mut() {
            if let Some(frame) = layer.poll() {
                pulled.push((layer.id, prepare(layer.id, frame)));
            }
        }
        let mut out = self.mix_frames(primary, &pulled);
        pulled.clear();
        self.pulled = pulled;

        let before = self.layers.len();
        self.layers.retain(|l| !l.is_dead());
        if self.layers.len() != before
            && let Some(fade) = self.crossfade
            && !(self.contains(fade.from) && self.contains(fade.to))
        {
            self.crossfade = None;
            if out.mode_change.is_none() {
                out.mode_change = self.switch_mode(MixMode::Replace);
            }
        }
        out
    }

    /// Mixes one tick. `aux` holds the frames that arrived from auxiliary
    /// sources; missing or misshapen frames count as silence.
    pub fn mix_frames(&mut self, primary: AudioFrame, aux: &[(SourceId, AudioFrame)]) -> MixOutput {
        let len = primary.len();
        let channels = primary.channels();
        for layer in self.layers.iter_mut() {
            let delivered = aux.iter().any(|(id, _)| *id == layer.id);
            layer.note_tick(delivered);
        }

        let passthrough = match self.mode {
            MixMode::Replace => self.heard() == SourceId::PRIMARY,
            MixMode::Overlay | MixMode::Priority => !self.any_layer_active(),
            MixMode::Crossfade => false,
        };
        if passthrough && self.primary.gain == 1.0 {
            return MixOutput {
                frame: primary,
                mode_change: None,
            };
        }

        self.acc.clear();
        self.acc.resize(len, 0.0);
        let frame_of = |id: SourceId| -> Option<&[i16]> {
            if id == SourceId::PRIMARY {
                return Some(primary.samples());
            }
            aux.iter()
                .find(|(sid, f)| *sid == id && f.len() == len)
                .map(|(_, f)| f.samples())
        };

        let mut mode_change = None;
        match self.mode {
            MixMode::Replace => {
                let heard = self.heard();
                let gain = self.source(heard).map_or(0.0, |s| s.gain);
                if let Some(samples) = frame_of(heard) {
                    accumulate(&mut self.acc, samples, gain);
                }
            }
            MixMode::Overlay => {
                let sources = self.active_sources();
                let total: f32 = sources.iter().map(|s| s.gain).sum();
                let norm = if total > 1.0 { 1.0 / total } else { 1.0 };
                for s in &sources {
                    if let Some(samples) = frame_of(s.id) {
                        accumulate(&mut self.acc, samples, s.gain * norm);
                    }
                }
            }
            MixMode::Priority => {
                let sources = self.active_sources();
                let winner = sources
                    .iter()
                    .max_by_key(|s| (s.priority, s.started))
                    .map(|s| s.id);
                for s in &sources {
                    let gain = if Some(s.id) == winner {
                        1.0
                    } else {
                        self.config.priority_floor
                    };
                    if gain > 0.0
                        && let Some(samples) = frame_of(s.id)
                    {
                        accumulate(&mut self.acc, samples, gain);
                    }
                }
            }
            MixMode::Crossfade => {
                if let Some(mut fade) = self.crossfade.take() {
                    fill(&mut self.from_buf, frame_of(fade.from), len);
                    fill(&mut self.to_buf, frame_of(fade.to), len);
                    fade.blend(
                        &mut self.acc,
                        &self.from_buf,
                        &self.to_buf,
                        channels,
                        self.blend_resolution,
                    );
                    if fade.is_done() {
                        self.complete_crossfade(fade);
                        mode_change = self.switch_mode(MixMode::Replace);
                    } else {
                        self.crossfade = Some(fade);
                    }
                }
            }
        }

        let (sequence, captured_at) = (primary.sequence(), primary.captured_at());
        let mut samples = primary.into_samples();
        for (out, &v) in samples.iter_mut().zip(self.acc.iter()) {
            *out = f32_to_sample(self.limiter.apply(v));
        }
        MixOutput {
            frame: AudioFrame::new(samples, channels, sequence, captured_at),
            mode_change,
        }
    }

    /// The outgoing side is dropped. A layer target takes over the primary
    /// slot and waits in `promoted` for its receiver to be collected.
    fn complete_crossfade(&mut self, fade: Crossfade) {
        if fade.from != SourceId::PRIMARY {
            self.layers.retain(|l| l.id != fade.from);
        }
        let started = self.bump_start();
        self.primary.started = started;
        if let Some(idx) = self.layers.iter().position(|l| l.id == fade.to) {
            let layer = self.layers.remove(idx);
            self.primary.gain = layer.gain;
            self.promoted = Some((layer.id, layer.rx));
        }
    }

    fn switch_mode(&mut self, mode: MixMode) -> Option<ModeChange> {
        if self.mode == mode {
            return None;
        }
        let change = ModeChange {
            from: self.mode,
            to: mode,
        };
        self.mode = mode;
        Some(change)
    }

    fn bump_start(&mut self) -> u64 {
        let s = self.next_start;
        self.next_start += 1;
        s
    }

    pub fn reset(&mut self) {
        self.layers.clear();
        self.crossfade = None;
        self.promoted = None;
        self.primary.started = 1;
        self.primary.gain = 1.0;
        self.mode = self.config.default_mode;
    }
}

fn accumulate(acc: &mut [f32], samples: &[i16], gain: f32) {
    for (a, &s) in acc.iter_mut().zip(samples) {
        *a += sample_to_f32(s) * gain;
    }
}

fn fill(buf: &mut Vec<f32>, samples: Option<&[i16]>, len: usize) {
    buf.clear();
    match samples {
        Some(samples) => buf.extend(samples.iter().map(|&s| sample_to_f32(s))),
        None => buf.resize(len, 0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn frame(value: i16, seq: u64) -> AudioFrame {
        AudioFrame::new(vec![value; 1920], 2, seq, Instant::now())
    }

    fn mixer() -> Mixer {
        Mixer::new(MixerConfig::default(), 48_000)
    }

    #[test]
    fn lone_primary_passes_through_untouched() {
        let mut mixer = mixer();
        let input = frame(1234, 7);
        let out = mixer.mix_frames(input.clone(), &[]);
        assert_eq!(out.frame, input);
        assert!(out.mode_change.is_none());
    }

    #[test]
    fn replace_plays_only_the_newest_source() {
        let mut mixer = mixer();
        let (_tx, rx) = flume::bounded(1);
        let aux = mixer.add_source(rx, 0, 1.0).unwrap();
        // registered but silent so far
        assert_eq!(mixer.heard(), SourceId::PRIMARY);

        let out = mixer.mix_frames(frame(8_000, 0), &[(aux, frame(-4_000, 0))]);
        assert_eq!(mixer.heard(), aux);
        assert!(out.frame.samples().iter().all(|s| *s == -4_000));

        // a short gap from the newest source is bridged with silence, never the older one
        for seq in 1..=5 {
            let out = mixer.mix_frames(frame(8_000, seq), &[]);
            assert!(out.frame.samples().iter().all(|s| *s == 0));
        }
        // past the hold the primary is back
        let out = mixer.mix_frames(frame(8_000, 6), &[]);
        assert_eq!(mixer.heard(), SourceId::PRIMARY);
        assert!(out.frame.samples().iter().all(|s| *s == 8_000));
    }

    #[test]
    fn idle_alert_does_not_mute_primary() {
        let mut mixer = mixer();
        mixer.set_mode(MixMode::Priority).unwrap();
        let (alert_tx, rx) = flume::bounded(4);
        mixer.add_source(rx, 10, 1.0).unwrap();
        for seq in 0..50 {
            let out = mixer.mix(frame(8_000, seq));
            assert!(out.frame.samples().iter().all(|s| *s == 8_000), "tick {seq}");
        }
        assert_eq!(mixer.duck_level(), 0.0);

        alert_tx.send(frame(-2_000, 50)).unwrap();
        let out = mixer.mix(frame(8_000, 50));
        assert!(out.frame.samples().iter().all(|s| *s == -2_000));
        // within the hold the alert still owns the channel
        let out = mixer.mix(frame(8_000, 51));
        assert!(out.frame.samples().iter().all(|s| *s == 0));
        for seq in 52..60 {
            mixer.mix(frame(8_000, seq));
        }
        let out = mixer.mix(frame(8_000, 60));
        assert!(out.frame.samples().iter().all(|s| *s == 8_000));
    }

    #[test]
    fn overlay_stays_within_bounds() {
        let mut mixer = mixer();
        mixer.set_mode(MixMode::Overlay).unwrap();
        let (_tx1, rx1) = flume::bounded(1);
        let (_tx2, rx2) = flume::bounded(1);
        let a = mixer.add_source(rx1, 0, 1.0).unwrap();
        let b = mixer.add_source(rx2, 0, 1.0).unwrap();
        let out = mixer.mix_frames(
            frame(i16::MAX, 0),
            &[(a, frame(i16::MAX, 0)), (b, frame(i16::MAX, 0))],
        );
        for &s in out.frame.samples() {
            assert!(s <= i16::MAX && s >= 31_000, "{}", s);
        }
        assert_eq!(mixer.duck_level(), 1.0);
    }

    #[test]
    fn overlay_with_small_gains_is_a_plain_sum() {
        let mut mixer = mixer();
        mixer.set_mode(MixMode::Overlay).unwrap();
        mixer.set_source_gain(SourceId::PRIMARY, 0.5).unwrap();
        let (_tx, rx) = flume::bounded(1);
        let a = mixer.add_source(rx, 0, 0.25).unwrap();
        let out = mixer.mix_frames(frame(8_000, 0), &[(a, frame(8_000, 0))]);
        assert!(out.frame.samples().iter().all(|s| *s == 6_000));
    }

    #[test]
    fn priority_prefers_highest_then_newest() {
        let mut mixer = mixer();
        mixer.set_mode(MixMode::Priority).unwrap();
        let (_tx1, rx1) = flume::bounded(1);
        let (_tx2, rx2) = flume::bounded(1);
        let low = mixer.add_source(rx1, 5, 1.0).unwrap();
        let out = mixer.mix_frames(frame(1_000, 0), &[(low, frame(2_000, 0))]);
        assert!(out.frame.samples().iter().all(|s| *s == 2_000));

        let tie = mixer.add_source(rx2, 5, 1.0).unwrap();
        let out = mixer.mix_frames(
            frame(1_000, 1),
            &[(low, frame(2_000, 1)), (tie, frame(3_000, 1))],
        );
        assert!(out.frame.samples().iter().all(|s| *s == 3_000));
    }

    #[test]
    fn crossfade_moves_from_a_to_b_then_reverts() {
        let mut mixer = mixer();
        mixer.set_blend_resolution(1);
        let (_tx, rx) = flume::bounded(1);
        let b = mixer.add_source(rx, 0, 1.0).unwrap();
        mixer.mix_frames(frame(10_000, 0), &[(b, frame(0, 0))]);
        assert_eq!(mixer.heard(), b);
        // make the primary the heard source again
        mixer.start_crossfade(SourceId::PRIMARY, Duration::ZERO).unwrap();
        let out = mixer.mix_frames(frame(10_000, 1), &[(b, frame(0, 1))]);
        assert_eq!(out.mode_change.map(|c| c.to), Some(MixMode::Replace));
        assert_eq!(mixer.heard(), SourceId::PRIMARY);
        assert!(!mixer.contains(b));
        assert!(mixer.take_promoted().is_none());

        let mut mixer = Mixer::new(MixerConfig::default(), 48_000);
        mixer.set_blend_resolution(1);
        let (_tx, rx) = flume::bounded(1);
        let (b, change) = mixer
            .add_crossfade_source(rx, 1.0, Duration::from_millis(100))
            .unwrap();
        assert_eq!(change.map(|c| c.to), Some(MixMode::Crossfade));
        assert_eq!(mixer.heard(), SourceId::PRIMARY);
        let mut last_progress = 0.0;
        let mut first = None;
        let mut reverted = false;
        for seq in 0..5 {
            let out = mixer.mix_frames(frame(10_000, seq), &[(b, frame(0, seq))]);
            first.get_or_insert(out.frame.samples()[0]);
            if let Some(p) = mixer.crossfade_progress() {
                assert!(p > last_progress);
                last_progress = p;
            }
            if let Some(change) = out.mode_change {
                assert_eq!(change.to, MixMode::Replace);
                assert!(out.frame.samples()[1918] < 300);
                reverted = true;
            }
        }
        assert_eq!(first, Some(10_000));
        assert!(reverted);
        assert_eq!(mixer.mode(), MixMode::Replace);
        // b now occupies the primary slot; its receiver is handed out once
        assert!(!mixer.contains(b));
        assert_eq!(mixer.sources().len(), 1);
        assert_eq!(mixer.take_promoted().map(|(id, _)| id), Some(b));
        assert!(mixer.take_promoted().is_none());
    }

    #[test]
    fn source_limit_and_unknown_ids() {
        let mut mixer = Mixer::new(
            MixerConfig {
                max_sources: 2,
                ..MixerConfig::default()
            },
            48_000,
        );
        let (_tx, rx) = flume::bounded(1);
        mixer.add_source(rx.clone(), 0, 1.0).unwrap();
        assert!(matches!(mixer.add_source(rx, 0, 1.0), Err(EngineError::MixerFull(2))));
        assert!(matches!(
            mixer.remove_source(SourceId(42)),
            Err(EngineError::UnknownSource(_))
        ));
        assert!(mixer.set_mode(MixMode::Crossfade).is_err());
    }
}
