mod common;

use std::{sync::Arc, sync::atomic::Ordering, time::Duration};

use common::{DeadSource, fixed_quality_config, silence};
use radiorelay::{
    EngineError, GuildId,
    audio::{ChannelFrameSource, ChannelVoiceSink},
    monitoring::{AttemptOutcome, HealthCause, HealthState},
    pipeline::{EngineEvent, PipelineSupervisor},
    storage::MemorySettingsStore,
};

#[tokio::test(start_paused = true)]
async fn failing_reconnects_exhaust_budget_then_fail_once() {
    let sup = PipelineSupervisor::new(
        Arc::new(fixed_quality_config()),
        Arc::new(MemorySettingsStore::default()),
    );
    let events = sup.events();
    let guild = GuildId::from("300");
    let (source, reconnects) = DeadSource::new();
    let (sink, _out) = ChannelVoiceSink::pair(4);
    sup.start(guild.clone(), source, sink).await.unwrap();

    let mut seen = Vec::new();
    let wait = tokio::time::timeout(Duration::from_secs(120), async {
        while let Ok(event) = events.recv_async().await {
            let failed = matches!(event, EngineEvent::PipelineFailed { .. });
            seen.push(event);
            if failed {
                break;
            }
        }
    })
    .await;
    assert!(wait.is_ok(), "pipeline never failed");

    // Nothing else arrives once the pipeline has failed.
    tokio::time::sleep(Duration::from_secs(60)).await;
    seen.extend(events.drain());

    let delays: Vec<u64> = seen
        .iter()
        .filter_map(|e| match e {
            EngineEvent::RecoveryScheduled { delay_ms, .. } => Some(*delay_ms),
            _ => None,
        })
        .collect();
    assert_eq!(delays.len(), 3);
    assert!(delays.windows(2).all(|w| w[0] < w[1]), "{delays:?}");
    assert!(delays[0] >= 1_000 && delays[0] < 1_200);

    let failed_attempts = seen
        .iter()
        .filter(|e| {
            matches!(
                e,
                EngineEvent::RecoveryFinished {
                    outcome: AttemptOutcome::Failed,
                    ..
                }
            )
        })
        .count();
    assert_eq!(failed_attempts, 3);
    assert_eq!(reconnects.load(Ordering::SeqCst), 3);

    let terminal: Vec<_> = seen
        .iter()
        .filter(|e| matches!(e, EngineEvent::PipelineFailed { .. }))
        .collect();
    assert_eq!(terminal.len(), 1);
    assert!(matches!(
        terminal[0],
        EngineEvent::PipelineFailed {
            attempts: 3,
            cause: Some(HealthCause::StallTimeout),
            ..
        }
    ));
    assert!(seen.iter().any(|e| matches!(
        e,
        EngineEvent::HealthChanged {
            to: HealthState::Failed,
            ..
        }
    )));
    assert!(!seen
        .iter()
        .any(|e| matches!(e, EngineEvent::PipelineStopped { .. })));

    assert!(matches!(
        sup.set_volume(&guild, 0.5).await,
        Err(EngineError::PipelineFailed(_))
    ));

    // An explicit restart brings up a fresh, healthy instance.
    let handle = sup.restart(&guild).await.unwrap();
    assert_eq!(handle.health(), HealthState::Healthy);
    sup.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stall_then_successful_reconnect_recovers() {
    let sup = PipelineSupervisor::new(
        Arc::new(fixed_quality_config()),
        Arc::new(MemorySettingsStore::default()),
    );
    let events = sup.events();
    let guild = GuildId::from("301");
    let (tx, source) = ChannelFrameSource::pair(4);
    let (sink, out) = ChannelVoiceSink::pair(4);
    let handle = sup.start(guild.clone(), source, sink).await.unwrap();

    tx.send_async(silence(0)).await.unwrap();
    out.recv_async().await.unwrap();

    // The producer keeps its sender but goes quiet past the stall timeout.
    tokio::time::sleep(Duration::from_secs(7)).await;
    assert_eq!(handle.health(), HealthState::Unhealthy);

    let finished = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv_async().await {
                Ok(EngineEvent::RecoveryFinished { outcome, .. }) => break outcome,
                Ok(_) => continue,
                Err(_) => panic!("event stream closed"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(finished, AttemptOutcome::Succeeded);

    for seq in 1..20 {
        tx.send_async(silence(seq)).await.unwrap();
        assert_eq!(out.recv_async().await.unwrap().sequence(), seq);
    }
    // Clean frames for the cooldown bring the pipeline back to healthy.
    for seq in 20..1300 {
        tx.send_async(silence(seq)).await.unwrap();
        out.recv_async().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(handle.health(), HealthState::Healthy);
    sup.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_pipeline_finishes_even_when_events_pile_up() {
    let mut config = fixed_quality_config();
    config.engine.event_queue = 1;
    let sup = PipelineSupervisor::new(Arc::new(config), Arc::new(MemorySettingsStore::default()));
    let guild = GuildId::from("302");
    let (source, _reconnects) = DeadSource::new();
    let (sink, _out) = ChannelVoiceSink::pair(4);
    sup.start(guild.clone(), source, sink).await.unwrap();

    // Nobody reads events; the queue fills with the first one.
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert!(!sup.is_running(&guild));
    assert!(matches!(
        sup.handle(&guild),
        Err(EngineError::PipelineFailed(_))
    ));

    // Source and sink survive, so the guild can be brought back.
    let handle = sup.restart(&guild).await.unwrap();
    assert_eq!(handle.health(), HealthState::Healthy);
    assert!(sup.is_running(&guild));
    sup.shutdown().await;
}
