//! Pixel format transforms into the display formats
//!
//! Every camera format is expanded to 8-bit, 4-channel pixels. The channel
//! order follows the host byte order so a converted buffer can be read as
//! native 32-bit `0xAARRGGBB` words without further swizzling.

use crate::capture::frame::PixelFormat;
use crate::error::{AcquisitionError, Result};
use crate::pipeline::image::{ImageLayout, ImageView};

/// Display format for this host, fixed at compile time
pub const fn display_format() -> PixelFormat {
    if cfg!(target_endian = "little") {
        PixelFormat::Bgra8
    } else {
        PixelFormat::Rgba8
    }
}

#[derive(Clone, Copy)]
enum Order {
    Bgra,
    Rgba,
}

impl Order {
    #[inline]
    fn put(self, px: &mut [u8], r: u8, g: u8, b: u8, a: u8) {
        match self {
            Order::Bgra => px.copy_from_slice(&[b, g, r, a]),
            Order::Rgba => px.copy_from_slice(&[r, g, b, a]),
        }
    }
}

/// Transform `source` into `dst`, laid out as `target`
pub fn transform(source: &ImageView<'_>, target: &ImageLayout, dst: &mut [u8]) -> Result<()> {
    debug_assert_eq!(source.width(), target.width);
    debug_assert_eq!(source.height(), target.height);

    if dst.len() < target.size() {
        return Err(AcquisitionError::BufferTooSmall {
            required: target.size(),
            actual: dst.len(),
        });
    }

    if source.format() == target.format {
        for y in 0..target.height {
            let start = y as usize * target.stride;
            dst[start..start + target.stride].copy_from_slice(source.row(y));
        }
        return Ok(());
    }

    let order = match target.format {
        PixelFormat::Bgra8 => Order::Bgra,
        PixelFormat::Rgba8 => Order::Rgba,
        other => {
            return Err(AcquisitionError::UnsupportedFormat {
                from: source.format(),
                to: other,
            })
        }
    };

    if source.format() == PixelFormat::BayerRg8 {
        demosaic_rggb(source, target, dst, order);
        return Ok(());
    }

    for y in 0..target.height {
        let src = source.row(y);
        let start = y as usize * target.stride;
        let row = &mut dst[start..start + target.stride];
        convert_row(source.format(), src, row, order);
    }
    Ok(())
}

fn convert_row(format: PixelFormat, src: &[u8], dst: &mut [u8], order: Order) {
    match format {
        PixelFormat::Mono8 => {
            for (px, &v) in dst.chunks_exact_mut(4).zip(src) {
                order.put(px, v, v, v, 255);
            }
        }
        PixelFormat::Mono10 | PixelFormat::Mono12 | PixelFormat::Mono16 => {
            let shift = match format {
                PixelFormat::Mono10 => 2,
                PixelFormat::Mono12 => 4,
                _ => 8,
            };
            for (px, word) in dst.chunks_exact_mut(4).zip(src.chunks_exact(2)) {
                let v = u16::from_le_bytes([word[0], word[1]]) >> shift;
                let v = v.min(255) as u8;
                order.put(px, v, v, v, 255);
            }
        }
        PixelFormat::Rgb8 => {
            for (px, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(3)) {
                order.put(px, s[0], s[1], s[2], 255);
            }
        }
        PixelFormat::Bgr8 => {
            for (px, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(3)) {
                order.put(px, s[2], s[1], s[0], 255);
            }
        }
        PixelFormat::Rgba8 => {
            for (px, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
                order.put(px, s[0], s[1], s[2], s[3]);
            }
        }
        PixelFormat::Bgra8 => {
            for (px, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
                order.put(px, s[2], s[1], s[0], s[3]);
            }
        }
        PixelFormat::Yuv422 => yuyv_row(src, dst, order),
        PixelFormat::BayerRg8 => unreachable!("bayer is demosaiced per block"),
    }
}

/// BT.601, Y0 U Y1 V. An odd trailing pixel gets neutral chroma.
fn yuyv_row(src: &[u8], dst: &mut [u8], order: Order) {
    for (x, px) in dst.chunks_exact_mut(4).enumerate() {
        let base = (x / 2) * 4;
        let y = src[base + (x % 2) * 2] as f32;
        let (u, v) = if base + 3 < src.len() {
            (src[base + 1] as f32 - 128.0, src[base + 3] as f32 - 128.0)
        } else {
            (0.0, 0.0)
        };

        let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
        let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
        let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
        order.put(px, r, g, b, 255);
    }
}

/// Nearest-neighbour demosaic of an RGGB mosaic:
/// ```text
/// R G
/// G B
/// ```
fn demosaic_rggb(source: &ImageView<'_>, target: &ImageLayout, dst: &mut [u8], order: Order) {
    let w = target.width as usize;
    let h = target.height as usize;
    let stride = source.bytes_per_line();
    let data = source.data();
    let at = |x: usize, y: usize| data[y.min(h - 1) * stride + x.min(w - 1)];

    for y in 0..h {
        let by = y & !1;
        for x in 0..w {
            let bx = x & !1;
            let r = at(bx, by);
            let g = ((at(bx + 1, by) as u16 + at(bx, by + 1) as u16) / 2) as u8;
            let b = at(bx + 1, by + 1);
            let idx = y * target.stride + x * 4;
            order.put(&mut dst[idx..idx + 4], r, g, b, 255);
        }
    }
}
