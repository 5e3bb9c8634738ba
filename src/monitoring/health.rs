//! Pipeline health classification.
//!
//! The monitor only classifies. Every move into `Unhealthy` (and every stall
//! that outlives a reconnect) is announced on a bounded channel that the
//! [`RecoveryManager`](super::recovery::RecoveryManager) drains.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::warn;

use crate::{
    common::{FaultClass, GuildId, now_ms},
    configs::HealthConfig,
    monitoring::metrics::MetricsSnapshot,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
    Failed,
}

impl HealthState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Healthy,
            1 => Self::Degraded,
            2 => Self::Unhealthy,
            _ => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HealthCause {
    StallTimeout,
    RepeatedUnderrun,
    SocketClosed,
    DecodeError,
}

impl HealthCause {
    pub fn class(self) -> FaultClass {
        match self {
            Self::StallTimeout | Self::SocketClosed => FaultClass::Connectivity,
            Self::RepeatedUnderrun => FaultClass::Degrading,
            Self::DecodeError => FaultClass::Transient,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthTransition {
    pub from: HealthState,
    pub to: HealthState,
    pub cause: Option<HealthCause>,
    pub at: Instant,
    pub at_ms: u64,
}

/// Messages from the monitor to the recovery manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthNotice {
    Unhealthy { cause: HealthCause, at: Instant },
    /// The stream stalled again after a reconnect reported success.
    StallPersisting { cause: HealthCause, at: Instant },
}

pub struct HealthMonitor {
    guild_id: GuildId,
    config: HealthConfig,
    state: HealthState,
    cause: Option<HealthCause>,
    since: Instant,
    history: VecDeque<HealthTransition>,
    notices: flume::Sender<HealthNotice>,

    last_frame_at: Instant,
    last_sequence: Option<u64>,
    closed: bool,
    gaps: u32,
    decode_faults: u32,
    decode_escalated: bool,
    clean_since: Option<Instant>,
    /// Set once the current stall has been announced.
    stall_reported: bool,
}

impl HealthMonitor {
    pub fn new(
        guild_id: GuildId,
        config: HealthConfig,
        notices: flume::Sender<HealthNotice>,
        now: Instant,
    ) -> Self {
        let history = VecDeque::with_capacity(config.history);
        Self {
            guild_id,
            config,
            state: HealthState::Healthy,
            cause: None,
            since: now,
            history,
            notices,
            last_frame_at: now,
            last_sequence: None,
            closed: false,
            gaps: 0,
            decode_faults: 0,
            decode_escalated: false,
            clean_since: None,
            stall_reported: false,
        }
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn cause(&self) -> Option<HealthCause> {
        self.cause
    }

    pub fn since(&self) -> Instant {
        self.since
    }

    pub fn history(&self) -> impl Iterator<Item = &HealthTransition> {
        self.history.iter()
    }

    pub fn on_frame(&mut self, now: Instant, sequence: u64) {
        if let Some(last) = self.last_sequence {
            if sequence > last.saturating_add(1) {
                self.gaps += 1;
            }
        }
        self.last_sequence = Some(sequence);
        self.last_frame_at = now;
        self.closed = false;
    }

    pub fn on_closed(&mut self) {
        self.closed = true;
    }

    pub fn record_decode_fault(&mut self) {
        self.decode_faults += 1;
    }

    /// Malformed frames crossed the chain's escalation threshold.
    pub fn escalate_decode_faults(&mut self) {
        self.decode_escalated = true;
    }

    /// A reconnect succeeded; the stall clock starts over.
    pub fn note_reconnected(&mut self, now: Instant) {
        self.last_frame_at = now;
        self.last_sequence = None;
        self.closed = false;
        self.stall_reported = false;
    }

    fn stall_cause(&self, now: Instant) -> Option<HealthCause> {
        if self.closed {
            Some(HealthCause::SocketClosed)
        } else if now.saturating_duration_since(self.last_frame_at) >= self.config.stall_timeout() {
            Some(HealthCause::StallTimeout)
        } else {
            None
        }
    }

    fn transition(
        &mut self,
        to: HealthState,
        cause: Option<HealthCause>,
        now: Instant,
    ) -> HealthTransition {
        let transition = HealthTransition {
            from: self.state,
            to,
            cause,
            at: now,
            at_ms: now_ms(),
        };
        self.state = to;
        self.cause = cause;
        self.since = now;
        if self.history.len() == self.config.history.max(1) {
            self.history.pop_front();
        }
        self.history.push_back(transition);
        transition
    }

    fn notify(&self, notice: HealthNotice) {
        if let Err(e) = self.notices.try_send(notice) {
            warn!("[{}] Health notice dropped: {}", self.guild_id, e);
        }
    }

    /// Classifies the pipeline from the latest metrics and liveness signals.
    /// A stall moves a healthy pipeline through `Degraded` to `Unhealthy` in one call.
    pub fn evaluate(&mut self, snapshot: &MetricsSnapshot, now: Instant) -> Vec<HealthTransition> {
        let mut transitions = Vec::new();
        if self.state == HealthState::Failed {
            return transitions;
        }

        let gaps = std::mem::take(&mut self.gaps);
        let decode_faults = std::mem::take(&mut self.decode_faults);
        let decode_escalated = std::mem::take(&mut self.decode_escalated);

        let hard = self
            .stall_cause(now)
            .or(decode_escalated.then_some(HealthCause::DecodeError));
        let soft = if snapshot.underrun_rate > self.config.underrun_soft || gaps > 0 {
            Some(HealthCause::RepeatedUnderrun)
        } else if decode_faults > 0 {
            Some(HealthCause::DecodeError)
        } else {
            None
        };

        match (self.state, hard) {
            (HealthState::Healthy | HealthState::Degraded, Some(cause)) => {
                self.clean_since = None;
                if self.state == HealthState::Healthy {
                    transitions.push(self.transition(HealthState::Degraded, Some(cause), now));
                }
                transitions.push(self.transition(HealthState::Unhealthy, Some(cause), now));
                self.stall_reported = true;
                self.notify(HealthNotice::Unhealthy { cause, at: now });
            }
            (HealthState::Unhealthy, Some(cause)) => {
                self.clean_since = None;
                if !self.stall_reported {
                    self.stall_reported = true;
                    self.notify(HealthNotice::StallPersisting { cause, at: now });
                }
            }
            (HealthState::Healthy, None) => {
                if let Some(cause) = soft {
                    transitions.push(self.transition(HealthState::Degraded, Some(cause), now));
                }
            }
            (HealthState::Degraded | HealthState::Unhealthy, None) => {
                if soft.is_some() {
                    self.clean_since = None;
                } else {
                    let since = *self.clean_since.get_or_insert(now);
                    if now.duration_since(since) >= self.config.recovery_cooldown() {
                        self.clean_since = None;
                        self.stall_reported = false;
                        transitions.push(self.transition(HealthState::Healthy, None, now));
                    }
                }
            }
            (HealthState::Failed, _) => {}
        }

        transitions
    }

    /// Recovery gave up. `Failed` is terminal for this pipeline instance.
    pub fn mark_failed(&mut self, now: Instant) -> Option<HealthTransition> {
        if self.state == HealthState::Failed {
            return None;
        }
        let cause = self.cause;
        Some(self.transition(HealthState::Failed, cause, now))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn monitor() -> (HealthMonitor, flume::Receiver<HealthNotice>, Instant) {
        let (tx, rx) = flume::bounded(8);
        let now = Instant::now();
        (
            HealthMonitor::new(GuildId::from("1"), HealthConfig::default(), tx, now),
            rx,
            now,
        )
    }

    fn clean() -> MetricsSnapshot {
        MetricsSnapshot {
            frames: 250,
            ..MetricsSnapshot::default()
        }
    }

    #[test]
    fn stall_reaches_unhealthy_in_one_evaluation() {
        let (mut health, notices, start) = monitor();
        health.on_frame(start, 0);

        let transitions = health.evaluate(&clean(), start + Duration::from_secs(6));
        let states: Vec<_> = transitions.iter().map(|t| (t.from, t.to)).collect();
        assert_eq!(
            states,
            vec![
                (HealthState::Healthy, HealthState::Degraded),
                (HealthState::Degraded, HealthState::Unhealthy)
            ]
        );
        assert!(transitions.iter().all(|t| t.cause == Some(HealthCause::StallTimeout)));
        assert_eq!(health.state(), HealthState::Unhealthy);
        assert!(matches!(
            notices.try_recv(),
            Ok(HealthNotice::Unhealthy {
                cause: HealthCause::StallTimeout,
                ..
            })
        ));
    }

    #[test]
    fn underruns_degrade_then_recover_after_cooldown() {
        let (mut health, _notices, start) = monitor();
        let lossy = MetricsSnapshot {
            frames: 90,
            underruns: 10,
            underrun_rate: 0.1,
            ..MetricsSnapshot::default()
        };

        health.on_frame(start, 0);
        let t = health.evaluate(&lossy, start);
        assert_eq!(t[0].to, HealthState::Degraded);
        assert_eq!(t[0].cause, Some(HealthCause::RepeatedUnderrun));

        let mut now = start;
        let mut seq = 1;
        let mut recovered_at = None;
        for _ in 0..60 {
            now += Duration::from_millis(250);
            health.on_frame(now, seq);
            seq += 1;
            if health.evaluate(&clean(), now).iter().any(|t| t.to == HealthState::Healthy) {
                recovered_at = Some(now);
                break;
            }
        }
        let recovered_at = recovered_at.expect("should recover");
        assert!(recovered_at.duration_since(start) >= Duration::from_secs(10));
    }

    #[test]
    fn sequence_gap_degrades() {
        let (mut health, _notices, start) = monitor();
        health.on_frame(start, 10);
        health.on_frame(start, 14);
        let t = health.evaluate(&clean(), start);
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].to, HealthState::Degraded);
    }

    #[test]
    fn closed_source_is_a_stall() {
        let (mut health, _notices, start) = monitor();
        health.on_closed();
        let t = health.evaluate(&clean(), start);
        assert_eq!(t.last().map(|t| t.to), Some(HealthState::Unhealthy));
        assert_eq!(health.cause(), Some(HealthCause::SocketClosed));
    }

    #[test]
    fn persisting_stall_is_announced_once_per_reconnect() {
        let (mut health, notices, start) = monitor();
        health.evaluate(&clean(), start + Duration::from_secs(5));
        assert!(notices.try_recv().is_ok());

        // Still stalled, no reconnect yet: nothing new
        health.evaluate(&clean(), start + Duration::from_secs(7));
        assert!(notices.try_recv().is_err());

        health.note_reconnected(start + Duration::from_secs(8));
        health.evaluate(&clean(), start + Duration::from_secs(12));
        assert!(notices.try_recv().is_err());
        health.evaluate(&clean(), start + Duration::from_secs(13));
        assert!(matches!(
            notices.try_recv(),
            Ok(HealthNotice::StallPersisting { .. })
        ));
    }

    #[test]
    fn decode_escalation_and_failure() {
        let (mut health, _notices, start) = monitor();
        health.on_frame(start, 0);
        health.record_decode_fault();
        health.escalate_decode_faults();
        let t = health.evaluate(&clean(), start);
        assert_eq!(t.last().map(|t| t.to), Some(HealthState::Unhealthy));

        let failed = health.mark_failed(start).unwrap();
        assert_eq!(failed.to, HealthState::Failed);
        assert_eq!(failed.cause, Some(HealthCause::DecodeError));
        assert!(health.mark_failed(start).is_none());
        assert!(health.evaluate(&clean(), start + Duration::from_secs(60)).is_empty());
        assert_eq!(health.history().count(), 3);
    }
}
