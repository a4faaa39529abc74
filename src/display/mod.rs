pub mod renderer;
pub mod scale;

pub use renderer::{Bitmap, ChannelRenderer, FrameRenderer, OutputSize};
pub use scale::scale_to_fit;
