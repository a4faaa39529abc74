use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgba};

use crate::display::renderer::{Bitmap, OutputSize};
use crate::error::{AcquisitionError, Result};
use crate::pipeline::image::Image;

/// Largest size with the source's aspect ratio that fits into `bounds`
pub fn fit_within(width: u32, height: u32, bounds: OutputSize) -> (u32, u32) {
    let (w, h) = (u64::from(width), u64::from(height));
    let (bw, bh) = (u64::from(bounds.width), u64::from(bounds.height));

    let mut fit_w = bw;
    let mut fit_h = h * bw / w;
    if fit_h > bh {
        fit_h = bh;
        fit_w = w * bh / h;
    }
    (fit_w.max(1) as u32, fit_h.max(1) as u32)
}

/// Scale a converted image to fit `size`, keeping its aspect ratio.
///
/// Channel order does not matter to the resampler, so the display-format
/// pixels are treated as generic 4-channel data.
pub fn scale_to_fit(image: &Image, size: OutputSize) -> Result<Bitmap> {
    let (width, height) = (image.width(), image.height());
    let unscaled = || Bitmap {
        format: image.format(),
        width,
        height,
        data: image.data().to_vec(),
    };

    if size.is_empty() || width == 0 || height == 0 {
        return Ok(unscaled());
    }

    let (fit_w, fit_h) = fit_within(width, height, size);
    if (fit_w, fit_h) == (width, height) {
        return Ok(unscaled());
    }

    let source: ImageBuffer<Rgba<u8>, &[u8]> = ImageBuffer::from_raw(width, height, image.data())
        .ok_or(AcquisitionError::BufferTooSmall {
            required: width as usize * height as usize * 4,
            actual: image.data().len(),
        })?;
    let scaled = imageops::resize(&source, fit_w, fit_h, FilterType::Triangle);

    Ok(Bitmap {
        format: image.format(),
        width: fit_w,
        height: fit_h,
        data: scaled.into_raw(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::PixelFormat;
    use crate::pipeline::image::ImageView;

    fn converted(width: u32, height: u32) -> Image {
        let pixels = vec![90u8; (width * height) as usize];
        let view = ImageView::new(PixelFormat::Mono8, width, height, &pixels).unwrap();
        let mut image = Image::new(PixelFormat::Bgra8);
        image.convert(&view).unwrap();
        image
    }

    #[test]
    fn fit_keeps_aspect_ratio() {
        assert_eq!(fit_within(640, 480, OutputSize::new(320, 320)), (320, 240));
        assert_eq!(fit_within(640, 480, OutputSize::new(800, 300)), (400, 300));
        assert_eq!(fit_within(10, 1000, OutputSize::new(5, 5)), (1, 5));
    }

    #[test]
    fn scales_down_to_fit() {
        let bitmap = scale_to_fit(&converted(64, 32), OutputSize::new(16, 16)).unwrap();
        assert_eq!((bitmap.width, bitmap.height), (16, 8));
        assert_eq!(bitmap.data.len(), 16 * 8 * 4);
        assert_eq!(&bitmap.data[..4], &[90, 90, 90, 255]);
    }

    #[test]
    fn unset_size_leaves_image_alone() {
        let image = converted(8, 4);
        let bitmap = scale_to_fit(&image, OutputSize::default()).unwrap();
        assert_eq!((bitmap.width, bitmap.height), (8, 4));
        assert_eq!(bitmap.data, image.data());
    }
}
