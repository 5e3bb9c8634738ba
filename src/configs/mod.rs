pub mod base;
pub mod dsp;
pub mod engine;
pub mod logging;
pub mod mixer;
pub mod monitoring;
pub mod quality;
pub mod storage;

pub use base::*;
pub use dsp::*;
pub use engine::*;
pub use logging::*;
pub use mixer::*;
pub use monitoring::*;
pub use quality::*;
pub use storage::*;
