pub mod backoff;
pub mod health;
pub mod metrics;
pub mod recovery;
pub mod system;

pub use health::{HealthCause, HealthMonitor, HealthNotice, HealthState, HealthTransition};
pub use metrics::{MetricsCollector, MetricsSnapshot, MetricsTotals};
pub use recovery::{
    AttemptOutcome, RecoveryAction, RecoveryAttempt, RecoveryDecision, RecoveryManager,
};
pub use system::SystemStats;
