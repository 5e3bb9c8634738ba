pub mod constants;
pub mod filters;
pub mod frame;
pub mod mix;
pub mod source;
pub mod volume;

pub use filters::{ChainOutput, DspChain, EqGains, EqPreset};
pub use frame::AudioFrame;
pub use mix::{MixMode, Mixer};
pub use source::{ChannelFrameSource, ChannelVoiceSink, FrameOutcome, FrameSource, VoiceSink};
pub use volume::{MasterVolume, SoftLimiter};
