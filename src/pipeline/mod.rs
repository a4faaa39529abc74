pub mod image;
pub mod transcoder;
pub mod transform;

pub use image::{Image, ImageView};
pub use transcoder::{FramePoster, FrameRecycler, TranscodeQueue, TranscodeTask};
pub use transform::display_format;
