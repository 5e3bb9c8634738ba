mod common;

use std::{sync::Arc, time::Duration};

use common::{fixed_quality_config, rms, silence, tone};
use radiorelay::{
    EngineError, GuildId,
    audio::{ChannelFrameSource, ChannelVoiceSink, MixMode},
    common::SourceId,
    pipeline::{EngineEvent, PipelineSupervisor},
    storage::MemorySettingsStore,
};

fn supervisor() -> PipelineSupervisor {
    PipelineSupervisor::new(
        Arc::new(fixed_quality_config()),
        Arc::new(MemorySettingsStore::default()),
    )
}

#[tokio::test(start_paused = true)]
async fn overlay_mixes_announcement_without_clipping() {
    let sup = supervisor();
    let events = sup.events();
    let guild = GuildId::from("600");
    let (tx, source) = ChannelFrameSource::pair(2);
    let (sink, out) = ChannelVoiceSink::pair(2);
    sup.start(guild.clone(), source, sink).await.unwrap();

    sup.set_mix_mode(&guild, MixMode::Overlay).await.unwrap();
    let (announce_tx, announce_rx) = flume::bounded(64);
    let id = sup.add_overlay(&guild, announce_rx, 1, 0.5).await.unwrap();
    assert_ne!(id, SourceId::PRIMARY);

    let mut mixed = Vec::new();
    for seq in 0..50 {
        announce_tx.send_async(tone(880.0, 0.9, seq)).await.unwrap();
        tx.send_async(tone(220.0, 0.9, seq)).await.unwrap();
        mixed.push(out.recv_async().await.unwrap());
    }
    assert!(rms(&mixed) > 0.05);
    // Mixed peaks stay under full scale times the default 0.8 volume.
    let peak = mixed
        .iter()
        .flat_map(|f| f.samples())
        .map(|s| s.unsigned_abs())
        .max()
        .unwrap_or(0);
    assert!(peak < 27_000, "peak {peak}");

    let info = sup.get_audio_info(&guild).await.unwrap();
    assert_eq!(info.mix_mode, MixMode::Overlay);
    assert_eq!(info.sources.len(), 2);

    sup.remove_overlay(&guild, id).await.unwrap();
    assert!(matches!(
        sup.remove_overlay(&guild, id).await,
        Err(EngineError::UnknownSource(_))
    ));
    assert!(sup.set_mix_mode(&guild, MixMode::Crossfade).await.is_err());

    let modes: Vec<_> = events
        .drain()
        .filter_map(|e| match e {
            EngineEvent::MixerModeChanged { from, to, .. } => Some((from, to)),
            _ => None,
        })
        .collect();
    assert_eq!(modes, vec![(MixMode::Replace, MixMode::Overlay)]);
    sup.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn crossfade_hands_over_to_new_station() {
    let sup = supervisor();
    let events = sup.events();
    let guild = GuildId::from("601");
    let (tx, source) = ChannelFrameSource::pair(2);
    let (sink, out) = ChannelVoiceSink::pair(2);
    sup.start(guild.clone(), source, sink).await.unwrap();

    let (station_tx, station_rx) = flume::bounded(64);
    let id = sup
        .crossfade_to(&guild, station_rx, 1.0, Some(Duration::from_millis(200)))
        .await
        .unwrap();
    let info = sup.get_audio_info(&guild).await.unwrap();
    assert_eq!(info.mix_mode, MixMode::Crossfade);
    assert_eq!(info.crossfade_progress, Some(0.0));

    // Ten 20 ms frames cover the fade.
    let mut levels = Vec::new();
    for seq in 0..10 {
        station_tx.send_async(silence(seq)).await.unwrap();
        tx.send_async(tone(440.0, 0.5, seq)).await.unwrap();
        levels.push(rms(&[out.recv_async().await.unwrap()]));
    }
    assert!(levels[1] > levels[8]);

    let info = sup.get_audio_info(&guild).await.unwrap();
    assert_eq!(info.mix_mode, MixMode::Replace);
    assert_eq!(info.crossfade_progress, None);
    // The new station took the primary slot and the old feed was let go.
    assert_eq!(info.sources.len(), 1);
    assert!(!info.sources.iter().any(|s| s.id == id));
    assert!(tx.send_async(tone(440.0, 0.5, 10)).await.is_err());

    // From here on the station alone drives the pipeline, through the DSP chain.
    let mut after = Vec::new();
    for seq in 10..40 {
        station_tx.send_async(tone(330.0, 0.5, seq)).await.unwrap();
        let frame = out.recv_async().await.unwrap();
        assert_eq!(frame.sequence(), seq);
        after.push(frame);
    }
    assert!(rms(&after) > 0.02);
    sup.set_eq(&guild, 0.0, 0.0, -12.0).await.unwrap();
    let info = sup.get_audio_info(&guild).await.unwrap();
    assert_eq!(info.eq.treble, -12.0);

    let modes: Vec<_> = events
        .drain()
        .filter_map(|e| match e {
            EngineEvent::MixerModeChanged { from, to, .. } => Some((from, to)),
            _ => None,
        })
        .collect();
    assert_eq!(
        modes,
        vec![
            (MixMode::Replace, MixMode::Crossfade),
            (MixMode::Crossfade, MixMode::Replace)
        ]
    );
    sup.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn idle_alert_leaves_station_audible() {
    let sup = supervisor();
    let guild = GuildId::from("602");
    let (tx, source) = ChannelFrameSource::pair(2);
    let (sink, out) = ChannelVoiceSink::pair(2);
    sup.start(guild.clone(), source, sink).await.unwrap();

    sup.set_mix_mode(&guild, MixMode::Priority).await.unwrap();
    let (alert_tx, alert_rx) = flume::bounded(4);
    sup.add_overlay(&guild, alert_rx, 10, 1.0).await.unwrap();

    // The alert producer is connected but has nothing to say.
    let mut station = Vec::new();
    for seq in 0..30 {
        tx.send_async(tone(440.0, 0.5, seq)).await.unwrap();
        station.push(out.recv_async().await.unwrap());
    }
    assert!(rms(&station[5..]) > 0.02);
    drop(alert_tx);
    sup.shutdown().await;
}
