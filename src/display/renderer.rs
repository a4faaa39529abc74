//! Hand-off of converted frames to whatever draws them

use flume::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::capture::frame::PixelFormat;

/// Size of the surface converted frames are scaled to fit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutputSize {
    pub width: u32,
    pub height: u32,
}

impl OutputSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// An unset size disables scaling
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Display-ready pixels, tightly packed, in the host display format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Bitmap {
    pub fn stride(&self) -> usize {
        self.width as usize * 4
    }
}

/// Receives every converted, scaled frame on the transcode worker thread
pub trait FrameRenderer: Send + Sync {
    fn render(&self, bitmap: Bitmap);
}

/// Renderer that forwards bitmaps over a bounded channel.
///
/// A full channel drops the bitmap so the worker never waits on the
/// consumer.
#[derive(Clone)]
pub struct ChannelRenderer {
    tx: Sender<Bitmap>,
}

impl ChannelRenderer {
    pub fn bounded(capacity: usize) -> (Self, Receiver<Bitmap>) {
        let (tx, rx) = flume::bounded(capacity);
        (Self { tx }, rx)
    }
}

impl FrameRenderer for ChannelRenderer {
    fn render(&self, bitmap: Bitmap) {
        match self.tx.try_send(bitmap) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                metrics::counter!("bitmaps_dropped").increment(1);
                trace!("Renderer channel full, bitmap dropped");
            }
            Err(TrySendError::Disconnected(_)) => trace!("Renderer channel closed"),
        }
    }
}
