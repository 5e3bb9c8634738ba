//! Per-guild pipelines and the supervisor that owns them.

pub mod control;
pub mod events;
pub mod guild;
pub mod supervisor;

pub use control::{AudioInfo, ControlCommand, PipelineHandle, PipelineStatus};
pub use events::{EngineEvent, EventSink, StopReason};
pub use guild::{GuildPipeline, PipelineContext, PipelineExit};
pub use supervisor::{EngineStats, PipelineSupervisor};
