mod common;

use std::{sync::Arc, time::Duration};

use common::{fixed_quality_config, programme, rms, silence, tone};
use radiorelay::{
    GuildId,
    audio::{AudioFrame, ChannelFrameSource, ChannelVoiceSink, EqPreset},
    pipeline::{EngineEvent, PipelineSupervisor},
    storage::{MemorySettingsStore, SettingsStore},
};

fn supervisor() -> PipelineSupervisor {
    PipelineSupervisor::new(
        Arc::new(fixed_quality_config()),
        Arc::new(MemorySettingsStore::default()),
    )
}

/// Five minutes of 20 ms frames.
const FIVE_MINUTES: u64 = 5 * 60 * 50;

#[tokio::test(start_paused = true)]
async fn rock_preset_on_long_silence_stays_clean() {
    let sup = supervisor();
    let guild = GuildId::from("100");
    let (tx, source) = ChannelFrameSource::pair(2);
    let (sink, out) = ChannelVoiceSink::pair(2);
    sup.start(guild.clone(), source, sink).await.unwrap();

    let mut previous_tail = 0i32;
    for seq in 0..FIVE_MINUTES {
        if seq == 100 {
            assert_eq!(sup.apply_preset(&guild, "rock").await.unwrap(), EqPreset::Rock);
        }
        tx.send_async(silence(seq)).await.unwrap();
        let frame = out.recv_async().await.unwrap();
        assert_eq!(frame.sequence(), seq);
        assert_eq!(frame.len(), 1920);

        let first = i32::from(frame.samples()[0]);
        assert!((first - previous_tail).abs() <= 1, "step at frame {seq}");
        assert!(frame.samples().iter().all(|s| s.unsigned_abs() <= 1));
        previous_tail = i32::from(frame.samples()[1919]);
    }

    let info = sup.get_audio_info(&guild).await.unwrap();
    assert_eq!(info.preset, Some(EqPreset::Rock));
    assert_eq!(info.eq, EqPreset::Rock.gains());
    sup.shutdown().await;
}

async fn run_guild(
    sup: &PipelineSupervisor,
    guild: &str,
    preset: &str,
    frames: impl Fn(u64) -> AudioFrame,
) -> Vec<AudioFrame> {
    let guild = GuildId::from(guild);
    let (tx, source) = ChannelFrameSource::pair(2);
    let (sink, out) = ChannelVoiceSink::pair(2);
    sup.start(guild.clone(), source, sink).await.unwrap();
    sup.apply_preset(&guild, preset).await.unwrap();

    let mut captured = Vec::new();
    for seq in 0..150 {
        tx.send_async(frames(seq)).await.unwrap();
        captured.push(out.recv_async().await.unwrap());
    }
    sup.stop(&guild).await.unwrap();
    // Judge the settled tail only.
    captured.split_off(100)
}

#[tokio::test(start_paused = true)]
async fn bass_and_treble_boosts_are_measurable() {
    // Without the compressor pulling boosted peaks back down, the shelf
    // gain shows up almost in full.
    let mut config = fixed_quality_config();
    config.dsp.compressor.enabled = false;
    let sup = PipelineSupervisor::new(Arc::new(config), Arc::new(MemorySettingsStore::default()));

    let bass_flat = run_guild(&sup, "200", "flat", |s| tone(80.0, 0.1, s)).await;
    let bass_boost = run_guild(&sup, "201", "bass-boost", |s| tone(80.0, 0.1, s)).await;
    assert!(rms(&bass_boost) > rms(&bass_flat) * 1.5);

    let treble_flat = run_guild(&sup, "202", "flat", |s| tone(9_000.0, 0.1, s)).await;
    let treble_boost = run_guild(&sup, "203", "treble-boost", |s| tone(9_000.0, 0.1, s)).await;
    assert!(rms(&treble_boost) > rms(&treble_flat) * 1.5);

    let mixed_flat = run_guild(&sup, "204", "flat", programme).await;
    let mixed_rock = run_guild(&sup, "205", "rock", programme).await;
    assert!(rms(&mixed_rock) > rms(&mixed_flat) * 1.1);
}

#[tokio::test(start_paused = true)]
async fn runtime_loudness_controls_apply_and_persist() {
    let store = Arc::new(MemorySettingsStore::default());
    let sup = PipelineSupervisor::new(Arc::new(fixed_quality_config()), store.clone());
    let events = sup.events();
    let guild = GuildId::from("110");
    let (tx, source) = ChannelFrameSource::pair(2);
    let (sink, out) = ChannelVoiceSink::pair(2);
    sup.start(guild.clone(), source, sink).await.unwrap();

    assert_eq!(sup.set_normalization_target(&guild, -40.0).await.unwrap(), -30.0);
    sup.enable_auto_gain_control(&guild, false).await.unwrap();
    assert_eq!(sup.set_dynamic_range_compression(&guild, 0.0).await.unwrap(), 0.0);

    for seq in 0..10 {
        tx.send_async(programme(seq)).await.unwrap();
        out.recv_async().await.unwrap();
    }
    let info = sup.get_audio_info(&guild).await.unwrap();
    assert_eq!(info.normalization_target, -30.0);
    assert!(!info.auto_gain);
    assert_eq!(info.compression_ratio, None);

    let adjusted: Vec<_> = events
        .drain()
        .filter_map(|e| match e {
            EngineEvent::NormalizationAdjusted { from, to, .. } => Some((from, to)),
            _ => None,
        })
        .collect();
    assert_eq!(adjusted, vec![(-23.0, -30.0)]);

    // The settings writer runs beside the pipeline.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let saved = store.load(&guild).await.unwrap().unwrap();
    assert_eq!(saved.normalization_target, Some(-30.0));
    assert_eq!(saved.auto_gain, Some(false));
    assert_eq!(saved.compression, Some(0.0));

    // A fresh instance picks the stored values up again.
    sup.restart(&guild).await.unwrap();
    let info = sup.get_audio_info(&guild).await.unwrap();
    assert_eq!(info.normalization_target, -30.0);
    assert!(!info.auto_gain);
    assert_eq!(info.compression_ratio, None);

    sup.set_dynamic_range_compression(&guild, 0.5).await.unwrap();
    let info = sup.get_audio_info(&guild).await.unwrap();
    assert_eq!(info.compression_ratio, Some(10.5));
    sup.shutdown().await;
}
