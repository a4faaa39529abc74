//! Pixel buffers: borrowed views over captured frames and the owned,
//! growable conversion target

use tracing::trace;

use crate::capture::frame::{FrameMeta, PixelFormat};
use crate::error::{AcquisitionError, Result};
use crate::pipeline::transform;

/// Geometry of a packed image in a given pixel format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayout {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Bytes per line
    pub stride: usize,
}

impl ImageLayout {
    pub fn for_format(format: PixelFormat, width: u32, height: u32) -> Result<Self> {
        let invalid = || AcquisitionError::InvalidDimensions { width, height };
        if width == 0 || height == 0 {
            return Err(invalid());
        }

        let bits = u64::from(width) * u64::from(format.bits_per_pixel());
        let stride = usize::try_from(bits.div_ceil(8)).map_err(|_| invalid())?;
        stride.checked_mul(height as usize).ok_or_else(invalid)?;

        Ok(Self {
            format,
            width,
            height,
            stride,
        })
    }

    pub fn size(&self) -> usize {
        self.stride * self.height as usize
    }
}

/// Non-owning image over a frame's payload
#[derive(Debug, Clone, Copy)]
pub struct ImageView<'a> {
    layout: ImageLayout,
    data: &'a [u8],
}

impl<'a> ImageView<'a> {
    pub fn new(format: PixelFormat, width: u32, height: u32, data: &'a [u8]) -> Result<Self> {
        let layout = ImageLayout::for_format(format, width, height)?;
        if data.len() < layout.size() {
            return Err(AcquisitionError::BufferTooSmall {
                required: layout.size(),
                actual: data.len(),
            });
        }
        Ok(Self { layout, data })
    }

    pub fn from_frame(meta: &FrameMeta, payload: &'a [u8]) -> Result<Self> {
        Self::new(meta.format, meta.width, meta.height, payload)
    }

    pub fn layout(&self) -> &ImageLayout {
        &self.layout
    }

    pub fn format(&self) -> PixelFormat {
        self.layout.format
    }

    pub fn width(&self) -> u32 {
        self.layout.width
    }

    pub fn height(&self) -> u32 {
        self.layout.height
    }

    pub fn bytes_per_line(&self) -> usize {
        self.layout.stride
    }

    pub fn row(&self, y: u32) -> &'a [u8] {
        let start = y as usize * self.layout.stride;
        &self.data[start..start + self.layout.stride]
    }

    pub fn data(&self) -> &'a [u8] {
        &self.data[..self.layout.size()]
    }
}

/// Conversion target owning its pixels. The backing allocation only grows.
#[derive(Debug)]
pub struct Image {
    format: PixelFormat,
    layout: Option<ImageLayout>,
    data: Vec<u8>,
}

impl Image {
    pub fn new(format: PixelFormat) -> Self {
        Self {
            format,
            layout: None,
            data: Vec::new(),
        }
    }

    /// Empty target in the host's display format
    pub fn for_display() -> Self {
        Self::new(transform::display_format())
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.layout.map_or(0, |l| l.width)
    }

    pub fn height(&self) -> u32 {
        self.layout.map_or(0, |l| l.height)
    }

    pub fn bytes_per_line(&self) -> usize {
        self.layout.map_or(0, |l| l.stride)
    }

    /// Bytes currently allocated for pixels
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Pixels of the last conversion
    pub fn data(&self) -> &[u8] {
        let len = self.layout.map_or(0, |l| l.size());
        &self.data[..len]
    }

    pub fn view(&self) -> Option<ImageView<'_>> {
        self.layout.map(|layout| ImageView {
            layout,
            data: &self.data[..layout.size()],
        })
    }

    /// Convert `source` into this image's pixel format, growing the
    /// allocation when the source needs more room than converted before.
    pub fn convert(&mut self, source: &ImageView<'_>) -> Result<()> {
        let layout = ImageLayout::for_format(self.format, source.width(), source.height())?;
        let required = layout.size();

        if required > self.data.len() {
            let grow = required - self.data.len();
            self.data
                .try_reserve_exact(grow)
                .map_err(|_| AcquisitionError::OutOfMemory { bytes: required })?;
            self.data.resize(required, 0);
            trace!(capacity = required, "Conversion target grown");
        }
        self.layout = Some(layout);

        transform::transform(source, &layout, &mut self.data[..required])
    }
}
