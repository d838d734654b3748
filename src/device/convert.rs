//! Raw buffer to RGB conversion.

use anyhow::{bail, Result};
use log::warn;

use crate::device::{CaptureFrame, PixelFormat};
use crate::frame::{clamp_to_u8, FrameImage};

/// Decodes a device buffer into an RGB frame.
pub fn to_rgb(frame: &CaptureFrame) -> Result<FrameImage> {
    let width = frame.format.width;
    let height = frame.format.height;
    match frame.format.pixel {
        PixelFormat::Rgb24 => FrameImage::new(width, height, frame.data.clone()),
        PixelFormat::Yuyv => yuyv_to_rgb(&frame.data, width, height),
        PixelFormat::Mjpeg => {
            let image = FrameImage::decode_jpeg(&frame.data)?;
            if image.width() != width || image.height() != height {
                bail!(
                    "mjpeg frame is {}x{}, device reported {}x{}",
                    image.width(),
                    image.height(),
                    width,
                    height
                );
            }
            Ok(image)
        }
    }
}

/// Like [`to_rgb`], but a decode failure yields an error placard at the
/// device's nominal size so the viewer shows what went wrong instead of a
/// frozen last frame.
pub fn to_rgb_or_placard(frame: &CaptureFrame) -> FrameImage {
    match to_rgb(frame) {
        Ok(image) => image,
        Err(err) => {
            warn!("frame decode failed: {err:#}");
            FrameImage::error_frame(
                frame.format.width.max(160),
                frame.format.height.max(120),
                "decode error",
            )
        }
    }
}

/// Packed 4:2:2 to RGB. Short buffers are treated as zero-padded rather
/// than rejected; some drivers deliver a truncated final buffer when a
/// stream is torn down mid-frame.
pub fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Result<FrameImage> {
    if width % 2 != 0 {
        bail!("yuyv frame width {width} is not even");
    }
    let pixels = (width as usize) * (height as usize);
    let mut rgb = Vec::with_capacity(pixels * 3);
    let byte_at = |idx: usize| -> f32 { data.get(idx).copied().unwrap_or(0) as f32 };

    for pair in 0..pixels / 2 {
        let base = pair * 4;
        let y0 = byte_at(base);
        let u = byte_at(base + 1) - 128.0;
        let y1 = byte_at(base + 2);
        let v = byte_at(base + 3) - 128.0;
        for y in [y0, y1] {
            rgb.push(clamp_to_u8(y + 1.402 * v));
            rgb.push(clamp_to_u8(y - 0.344_136 * u - 0.714_136 * v));
            rgb.push(clamp_to_u8(y + 1.772 * u));
        }
    }
    FrameImage::new(width, height, rgb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceFormat;

    fn format(pixel: PixelFormat, width: u32, height: u32) -> DeviceFormat {
        DeviceFormat {
            pixel,
            width,
            height,
            fps: 30.0,
        }
    }

    #[test]
    fn rgb24_passes_through() {
        let frame = CaptureFrame {
            data: vec![9; 2 * 2 * 3],
            format: format(PixelFormat::Rgb24, 2, 2),
        };
        let image = to_rgb(&frame).unwrap();
        assert_eq!(image.pixel(1, 1), [9, 9, 9]);
    }

    #[test]
    fn yuyv_gray_decodes_to_gray() {
        // Y=128, U=V=128 is mid gray
        let data = vec![128u8; 2 * 2 * 2];
        let image = yuyv_to_rgb(&data, 2, 2).unwrap();
        let [r, g, b] = image.pixel(0, 0);
        assert_eq!(r, 128);
        assert_eq!(g, 128);
        assert_eq!(b, 128);
    }

    #[test]
    fn yuyv_red_chroma_pushes_red_up() {
        // high V drives red, low-ish G
        let data = vec![128, 128, 128, 255, 128, 128, 128, 255];
        let image = yuyv_to_rgb(&data, 4, 1).unwrap();
        let [r, g, _b] = image.pixel(0, 0);
        assert!(r > 200, "r = {r}");
        assert!(g < 64, "g = {g}");
    }

    #[test]
    fn short_yuyv_buffers_are_zero_padded() {
        let image = yuyv_to_rgb(&[], 2, 2).unwrap();
        // zero chroma bytes clamp blue all the way down
        let [_r, _g, b] = image.pixel(1, 1);
        assert_eq!(b, 0);
        assert_eq!(image.width(), 2);
        assert_eq!(image.height(), 2);
    }

    #[test]
    fn odd_width_yuyv_is_rejected() {
        assert!(yuyv_to_rgb(&[0; 12], 3, 2).is_err());
    }

    #[test]
    fn mjpeg_dimension_mismatch_is_an_error() {
        let jpeg = FrameImage::filled(4, 4, [1, 2, 3]).encode_jpeg(90).unwrap();
        let frame = CaptureFrame {
            data: jpeg,
            format: format(PixelFormat::Mjpeg, 8, 8),
        };
        assert!(to_rgb(&frame).is_err());
    }

    #[test]
    fn undecodable_buffers_become_a_placard() {
        let frame = CaptureFrame {
            data: vec![0xde, 0xad],
            format: format(PixelFormat::Mjpeg, 320, 240),
        };
        let image = to_rgb_or_placard(&frame);
        assert_eq!((image.width(), image.height()), (320, 240));
    }
}
