use std::{collections::VecDeque, time::Duration};

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{backoff::Backoff, health::HealthNotice};
use crate::{
    common::{GuildId, SourceError},
    configs::RecoveryConfig,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RecoveryAction {
    /// Ask the frame source to reconnect.
    Reconnect,
    /// Rebuild the pipeline's DSP, mixer and metrics state, then reconnect.
    Restart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AttemptOutcome {
    Pending,
    Succeeded,
    Failed,
    /// Dropped before it ran because frames came back on their own.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryAttempt {
    /// Lifetime sequence number for this pipeline.
    pub sequence: u64,
    /// Position within the current retry budget; `0` for manual refreshes.
    pub attempt: u32,
    pub action: RecoveryAction,
    pub scheduled_at: Instant,
    pub backoff: Duration,
    pub outcome: AttemptOutcome,
}

impl RecoveryAttempt {
    pub fn due_at(&self) -> Instant {
        self.scheduled_at + self.backoff
    }

    pub fn is_manual(&self) -> bool {
        self.attempt == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryDecision {
    Attempt(RecoveryAttempt),
    /// The retry budget is spent; the pipeline must fail.
    Exhausted { attempts: u32 },
}

/// Schedules bounded, backed-off reconnect and restart attempts for one guild.
pub struct RecoveryManager {
    guild_id: GuildId,
    config: RecoveryConfig,
    backoff: Backoff,
    notices: flume::Receiver<HealthNotice>,
    window_start: Option<Instant>,
    history: VecDeque<RecoveryAttempt>,
    next_sequence: u64,
    in_flight: Option<u64>,
    restart_next: bool,
    /// Set while an unhealthy episode is being worked on.
    engaged: bool,
}

impl RecoveryManager {
    pub fn new(
        guild_id: GuildId,
        config: RecoveryConfig,
        notices: flume::Receiver<HealthNotice>,
    ) -> Self {
        let backoff = Backoff::new(
            config.base_delay(),
            config.max_delay(),
            config.jitter,
            config.max_attempts,
        );
        let history = VecDeque::with_capacity(config.history);
        Self {
            guild_id,
            config,
            backoff,
            notices,
            window_start: None,
            history,
            next_sequence: 1,
            in_flight: None,
            restart_next: false,
            engaged: false,
        }
    }

    pub fn attempts_in_window(&self) -> u32 {
        self.backoff.attempt()
    }

    pub fn history(&self) -> impl Iterator<Item = &RecoveryAttempt> {
        self.history.iter()
    }

    pub fn in_flight(&self) -> Option<u64> {
        self.in_flight
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged
    }

    fn remember(&mut self, attempt: RecoveryAttempt) {
        if self.history.len() == self.config.history.max(1) {
            self.history.pop_front();
        }
        self.history.push_back(attempt);
    }

    fn set_outcome(&mut self, sequence: u64, outcome: AttemptOutcome) {
        if self.in_flight == Some(sequence) {
            self.in_flight = None;
        }
        if let Some(attempt) = self.history.iter_mut().find(|a| a.sequence == sequence) {
            attempt.outcome = outcome;
        }
    }

    /// Drains pending health notices and schedules an attempt if one is needed.
    pub fn poll_notices(&mut self, now: Instant) -> Option<RecoveryDecision> {
        let mut wanted = false;
        while let Ok(notice) = self.notices.try_recv() {
            debug!("[{}] Recovery received {:?}", self.guild_id, notice);
            wanted = true;
        }
        if !wanted {
            return None;
        }
        self.engaged = true;
        if self.in_flight.is_some() {
            return None;
        }
        Some(self.schedule(now))
    }

    /// Schedules the next attempt, or reports that the budget is exhausted.
    pub fn schedule(&mut self, now: Instant) -> RecoveryDecision {
        if let Some(start) = self.window_start {
            if now.saturating_duration_since(start) > self.config.window() {
                debug!("[{}] Recovery window elapsed, budget restored", self.guild_id);
                self.backoff.reset();
                self.window_start = None;
            }
        }

        if self.backoff.is_exhausted() {
            warn!(
                "[{}] Recovery exhausted after {} attempts",
                self.guild_id,
                self.backoff.attempt()
            );
            return RecoveryDecision::Exhausted {
                attempts: self.backoff.attempt(),
            };
        }

        let delay = self.backoff.next();
        self.window_start.get_or_insert(now);
        let action = if std::mem::take(&mut self.restart_next) {
            RecoveryAction::Restart
        } else {
            RecoveryAction::Reconnect
        };

        let attempt = RecoveryAttempt {
            sequence: self.next_sequence,
            attempt: self.backoff.attempt(),
            action,
            scheduled_at: now,
            backoff: delay,
            outcome: AttemptOutcome::Pending,
        };
        self.next_sequence += 1;
        self.in_flight = Some(attempt.sequence);
        self.remember(attempt.clone());

        info!(
            "[{}] Recovery attempt {}/{} ({:?}) in {:?}",
            self.guild_id, attempt.attempt, self.config.max_attempts, action, delay
        );
        RecoveryDecision::Attempt(attempt)
    }

    /// Immediate reconnect requested from outside. Does not consume the retry budget.
    /// Returns `None` when an attempt is already pending.
    pub fn schedule_manual(&mut self, now: Instant) -> Option<RecoveryAttempt> {
        if self.in_flight.is_some() {
            return None;
        }
        let attempt = RecoveryAttempt {
            sequence: self.next_sequence,
            attempt: 0,
            action: RecoveryAction::Reconnect,
            scheduled_at: now,
            backoff: Duration::ZERO,
            outcome: AttemptOutcome::Pending,
        };
        self.next_sequence += 1;
        self.in_flight = Some(attempt.sequence);
        self.remember(attempt.clone());
        Some(attempt)
    }

    pub fn record_success(&mut self, sequence: u64) {
        self.set_outcome(sequence, AttemptOutcome::Succeeded);
    }

    /// Marks the attempt failed and, while an unhealthy episode is open, schedules the next one.
    pub fn record_failure(
        &mut self,
        sequence: u64,
        error: &SourceError,
        now: Instant,
    ) -> Option<RecoveryDecision> {
        self.set_outcome(sequence, AttemptOutcome::Failed);
        if error.is_structural() {
            self.restart_next = true;
        }
        self.engaged.then(|| self.schedule(now))
    }

    /// The stream flows again on its own; a pending attempt is no longer needed.
    pub fn cancel_pending(&mut self) {
        if let Some(sequence) = self.in_flight {
            self.set_outcome(sequence, AttemptOutcome::Cancelled);
        }
    }

    /// Frames are flowing after a recovery: the budget and window start over.
    pub fn confirm(&mut self) {
        if self.engaged || self.backoff.attempt() > 0 {
            debug!("[{}] Recovery confirmed, counters reset", self.guild_id);
        }
        self.backoff.reset();
        self.window_start = None;
        self.restart_next = false;
        self.engaged = false;
    }
}
