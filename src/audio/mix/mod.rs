pub mod crossfade;
pub mod layer;
pub mod mixer;

pub use crossfade::Crossfade;
pub use layer::MixLayer;
pub use mixer::{MixMode, MixOutput, MixSource, Mixer, ModeChange};
