pub mod audio;
pub mod common;
pub mod configs;
pub mod monitoring;
pub mod pipeline;
pub mod quality;
pub mod storage;

pub use common::{EngineError, GuildId};
pub use pipeline::{PipelineHandle, PipelineSupervisor};
