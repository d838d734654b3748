//! Owned RGB frame buffer plus the overlay drawing used by the debug HUD.
//!
//! Everything downstream of the device layer works on packed RGB24. The
//! buffer is deliberately a plain `Vec<u8>` so nodes can mutate pixels in
//! place while the capture moves through the graph by value.

use std::path::Path;

use anyhow::{anyhow, Context, Result};

/// Packed RGB24 image. `data.len() == width * height * 3` always holds.
pub struct FrameImage {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl FrameImage {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if data.len() != expected {
            return Err(anyhow!(
                "frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    pub fn filled(width: u32, height: u32, color: [u8; 3]) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize * 3);
        for _ in 0..(width as usize * height as usize) {
            data.extend_from_slice(&color);
        }
        Self {
            data,
            width,
            height,
        }
    }

    pub fn black(width: u32, height: u32) -> Self {
        Self {
            data: vec![0u8; width as usize * height as usize * 3],
            width,
            height,
        }
    }

    /// Black frame with a caption, shown on the debug stream when a device
    /// frame could not be decoded.
    pub fn error_frame(width: u32, height: u32, message: &str) -> Self {
        let mut img = Self::black(width.max(8), height.max(8));
        img.draw_rect(0, 0, img.width, img.height, [200, 0, 0]);
        img.draw_text(8, 8, message, 2, [200, 0, 0]);
        img
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn deep_copy(&self) -> FrameImage {
        FrameImage {
            data: self.data.clone(),
            width: self.width,
            height: self.height,
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        debug_assert!(x < self.width && y < self.height);
        let offset = (y as usize * self.width as usize + x as usize) * 3;
        [
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
        ]
    }

    pub fn put_pixel(&mut self, x: u32, y: u32, color: [u8; 3]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 3;
        self.data[offset..offset + 3].copy_from_slice(&color);
    }

    /// BT.601 luma plane, one byte per pixel in row-major order.
    pub fn luma_plane(&self) -> Vec<u8> {
        let mut luma = Vec::with_capacity(self.width as usize * self.height as usize);
        for px in self.data.chunks_exact(3) {
            let y = 0.299_f32 * px[0] as f32 + 0.587_f32 * px[1] as f32 + 0.114_f32 * px[2] as f32;
            luma.push(clamp_to_u8(y));
        }
        luma
    }

    // ---------------- Codecs ----------------

    pub fn decode_jpeg(bytes: &[u8]) -> Result<FrameImage> {
        let rgb = image::load_from_memory(bytes)
            .context("decode jpeg")?
            .into_rgb8();
        let (width, height) = rgb.dimensions();
        Ok(FrameImage {
            data: rgb.into_raw(),
            width,
            height,
        })
    }

    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
        encoder
            .encode(
                &self.data,
                self.width,
                self.height,
                image::ExtendedColorType::Rgb8,
            )
            .context("encode jpeg")?;
        Ok(out)
    }

    pub fn save_png(&self, path: &Path) -> Result<()> {
        image::save_buffer_with_format(
            path,
            &self.data,
            self.width,
            self.height,
            image::ExtendedColorType::Rgb8,
            image::ImageFormat::Png,
        )
        .with_context(|| format!("write png {}", path.display()))
    }

    pub fn load_png(path: &Path) -> Result<FrameImage> {
        let rgb = image::open(path)
            .with_context(|| format!("read png {}", path.display()))?
            .into_rgb8();
        let (width, height) = rgb.dimensions();
        Ok(FrameImage {
            data: rgb.into_raw(),
            width,
            height,
        })
    }

    // ---------------- Overlay drawing ----------------

    /// One-pixel rectangle outline. Coordinates outside the frame are
    /// clipped pixel by pixel.
    pub fn draw_rect(&mut self, x: u32, y: u32, w: u32, h: u32, color: [u8; 3]) {
        if w == 0 || h == 0 {
            return;
        }
        let x1 = x + w - 1;
        let y1 = y + h - 1;
        for xi in x..=x1 {
            self.put_pixel(xi, y, color);
            self.put_pixel(xi, y1, color);
        }
        for yi in y..=y1 {
            self.put_pixel(x, yi, color);
            self.put_pixel(x1, yi, color);
        }
    }

    /// Bresenham segment between two points, clipped to the frame.
    pub fn draw_line(&mut self, x0: i64, y0: i64, x1: i64, y1: i64, color: [u8; 3]) {
        let dx = (x1 - x0).abs();
        let dy = -(y1 - y0).abs();
        let sx = if x0 < x1 { 1 } else { -1 };
        let sy = if y0 < y1 { 1 } else { -1 };
        let mut err = dx + dy;
        let (mut x, mut y) = (x0, y0);
        loop {
            if x >= 0 && y >= 0 {
                self.put_pixel(x as u32, y as u32, color);
            }
            if x == x1 && y == y1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x += sx;
            }
            if e2 <= dx {
                err += dx;
                y += sy;
            }
        }
    }

    /// Small cross marker centered on a point, used for detected corners.
    pub fn draw_marker(&mut self, x: u32, y: u32, color: [u8; 3]) {
        let (xi, yi) = (x as i64, y as i64);
        self.draw_line(xi - 3, yi, xi + 3, yi, color);
        self.draw_line(xi, yi - 3, xi, yi + 3, color);
    }

    /// 5x7 bitmap text. Glyphs advance 6 * scale pixels; characters outside
    /// printable ASCII render as blanks.
    pub fn draw_text(&mut self, x: u32, y: u32, text: &str, scale: u32, color: [u8; 3]) {
        let scale = scale.max(1);
        let mut cursor = x;
        for ch in text.chars() {
            self.draw_glyph(cursor, y, ch, scale, color);
            cursor = cursor.saturating_add(6 * scale);
            if cursor >= self.width {
                break;
            }
        }
    }

    fn draw_glyph(&mut self, x: u32, y: u32, ch: char, scale: u32, color: [u8; 3]) {
        let code = ch as usize;
        if !(0x20..=0x7E).contains(&code) {
            return;
        }
        let glyph = &FONT_5X7[code - 0x20];
        for (col, bits) in glyph.iter().enumerate() {
            for row in 0..7 {
                if bits & (1 << row) == 0 {
                    continue;
                }
                let px = x + col as u32 * scale;
                let py = y + row as u32 * scale;
                for dy in 0..scale {
                    for dx in 0..scale {
                        self.put_pixel(px + dx, py + dy, color);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for FrameImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

pub(crate) fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

/// Classic 5x7 column-major bitmap font for printable ASCII (0x20..0x7E).
/// Bit 0 of each column byte is the top row.
const FONT_5X7: [[u8; 5]; 95] = [
    [0x00, 0x00, 0x00, 0x00, 0x00], // space
    [0x00, 0x00, 0x5F, 0x00, 0x00], // !
    [0x00, 0x07, 0x00, 0x07, 0x00], // "
    [0x14, 0x7F, 0x14, 0x7F, 0x14], // #
    [0x24, 0x2A, 0x7F, 0x2A, 0x12], // $
    [0x23, 0x13, 0x08, 0x64, 0x62], // %
    [0x36, 0x49, 0x55, 0x22, 0x50], // &
    [0x00, 0x05, 0x03, 0x00, 0x00], // '
    [0x00, 0x1C, 0x22, 0x41, 0x00], // (
    [0x00, 0x41, 0x22, 0x1C, 0x00], // )
    [0x08, 0x2A, 0x1C, 0x2A, 0x08], // *
    [0x08, 0x08, 0x3E, 0x08, 0x08], // +
    [0x00, 0x50, 0x30, 0x00, 0x00], // ,
    [0x08, 0x08, 0x08, 0x08, 0x08], // -
    [0x00, 0x60, 0x60, 0x00, 0x00], // .
    [0x20, 0x10, 0x08, 0x04, 0x02], // /
    [0x3E, 0x51, 0x49, 0x45, 0x3E], // 0
    [0x00, 0x42, 0x7F, 0x40, 0x00], // 1
    [0x42, 0x61, 0x51, 0x49, 0x46], // 2
    [0x21, 0x41, 0x45, 0x4B, 0x31], // 3
    [0x18, 0x14, 0x12, 0x7F, 0x10], // 4
    [0x27, 0x45, 0x45, 0x45, 0x39], // 5
    [0x3C, 0x4A, 0x49, 0x49, 0x30], // 6
    [0x01, 0x71, 0x09, 0x05, 0x03], // 7
    [0x36, 0x49, 0x49, 0x49, 0x36], // 8
    [0x06, 0x49, 0x49, 0x29, 0x1E], // 9
    [0x00, 0x36, 0x36, 0x00, 0x00], // :
    [0x00, 0x56, 0x36, 0x00, 0x00], // ;
    [0x00, 0x08, 0x14, 0x22, 0x41], // <
    [0x14, 0x14, 0x14, 0x14, 0x14], // =
    [0x41, 0x22, 0x14, 0x08, 0x00], // >
    [0x02, 0x01, 0x51, 0x09, 0x06], // ?
    [0x32, 0x49, 0x79, 0x41, 0x3E], // @
    [0x7E, 0x11, 0x11, 0x11, 0x7E], // A
    [0x7F, 0x49, 0x49, 0x49, 0x36], // B
    [0x3E, 0x41, 0x41, 0x41, 0x22], // C
    [0x7F, 0x41, 0x41, 0x22, 0x1C], // D
    [0x7F, 0x49, 0x49, 0x49, 0x41], // E
    [0x7F, 0x09, 0x09, 0x01, 0x01], // F
    [0x3E, 0x41, 0x41, 0x51, 0x32], // G
    [0x7F, 0x08, 0x08, 0x08, 0x7F], // H
    [0x00, 0x41, 0x7F, 0x41, 0x00], // I
    [0x20, 0x40, 0x41, 0x3F, 0x01], // J
    [0x7F, 0x08, 0x14, 0x22, 0x41], // K
    [0x7F, 0x40, 0x40, 0x40, 0x40], // L
    [0x7F, 0x02, 0x0C, 0x02, 0x7F], // M
    [0x7F, 0x04, 0x08, 0x10, 0x7F], // N
    [0x3E, 0x41, 0x41, 0x41, 0x3E], // O
    [0x7F, 0x09, 0x09, 0x09, 0x06], // P
    [0x3E, 0x41, 0x51, 0x21, 0x5E], // Q
    [0x7F, 0x09, 0x19, 0x29, 0x46], // R
    [0x46, 0x49, 0x49, 0x49, 0x31], // S
    [0x01, 0x01, 0x7F, 0x01, 0x01], // T
    [0x3F, 0x40, 0x40, 0x40, 0x3F], // U
    [0x1F, 0x20, 0x40, 0x20, 0x1F], // V
    [0x3F, 0x40, 0x38, 0x40, 0x3F], // W
    [0x63, 0x14, 0x08, 0x14, 0x63], // X
    [0x07, 0x08, 0x70, 0x08, 0x07], // Y
    [0x61, 0x51, 0x49, 0x45, 0x43], // Z
    [0x00, 0x7F, 0x41, 0x41, 0x00], // [
    [0x02, 0x04, 0x08, 0x10, 0x20], // backslash
    [0x00, 0x41, 0x41, 0x7F, 0x00], // ]
    [0x04, 0x02, 0x01, 0x02, 0x04], // ^
    [0x40, 0x40, 0x40, 0x40, 0x40], // _
    [0x00, 0x01, 0x02, 0x04, 0x00], // `
    [0x20, 0x54, 0x54, 0x54, 0x78], // a
    [0x7F, 0x48, 0x44, 0x44, 0x38], // b
    [0x38, 0x44, 0x44, 0x44, 0x20], // c
    [0x38, 0x44, 0x44, 0x48, 0x7F], // d
    [0x38, 0x54, 0x54, 0x54, 0x18], // e
    [0x08, 0x7E, 0x09, 0x01, 0x02], // f
    [0x0C, 0x52, 0x52, 0x52, 0x3E], // g
    [0x7F, 0x08, 0x04, 0x04, 0x78], // h
    [0x00, 0x44, 0x7D, 0x40, 0x00], // i
    [0x20, 0x40, 0x44, 0x3D, 0x00], // j
    [0x00, 0x7F, 0x10, 0x28, 0x44], // k
    [0x00, 0x41, 0x7F, 0x40, 0x00], // l
    [0x7C, 0x04, 0x18, 0x04, 0x78], // m
    [0x7C, 0x08, 0x04, 0x04, 0x78], // n
    [0x38, 0x44, 0x44, 0x44, 0x38], // o
    [0x7C, 0x14, 0x14, 0x14, 0x08], // p
    [0x08, 0x14, 0x14, 0x18, 0x7C], // q
    [0x7C, 0x08, 0x04, 0x04, 0x08], // r
    [0x48, 0x54, 0x54, 0x54, 0x20], // s
    [0x04, 0x3F, 0x44, 0x40, 0x20], // t
    [0x3C, 0x40, 0x40, 0x20, 0x7C], // u
    [0x1C, 0x20, 0x40, 0x20, 0x1C], // v
    [0x3C, 0x40, 0x30, 0x40, 0x3C], // w
    [0x44, 0x28, 0x10, 0x28, 0x44], // x
    [0x0C, 0x50, 0x50, 0x50, 0x3C], // y
    [0x44, 0x64, 0x54, 0x4C, 0x44], // z
    [0x00, 0x08, 0x36, 0x41, 0x00], // {
    [0x00, 0x00, 0x7F, 0x00, 0x00], // |
    [0x00, 0x41, 0x36, 0x08, 0x00], // }
    [0x08, 0x04, 0x08, 0x10, 0x08], // ~
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_validates_buffer_length() {
        assert!(FrameImage::new(2, 2, vec![0u8; 12]).is_ok());
        let err = FrameImage::new(2, 2, vec![0u8; 11]).unwrap_err();
        assert!(err.to_string().contains("length mismatch"));
    }

    #[test]
    fn luma_of_gray_equals_gray() {
        let img = FrameImage::filled(4, 2, [128, 128, 128]);
        assert_eq!(img.luma_plane(), vec![128u8; 8]);
    }

    #[test]
    fn jpeg_round_trip_keeps_dimensions() -> Result<()> {
        let img = FrameImage::filled(32, 16, [40, 80, 120]);
        let jpeg = img.encode_jpeg(90)?;
        let back = FrameImage::decode_jpeg(&jpeg)?;
        assert_eq!((back.width(), back.height()), (32, 16));
        Ok(())
    }

    #[test]
    fn rect_outline_leaves_interior_untouched() {
        let mut img = FrameImage::black(10, 10);
        img.draw_rect(2, 2, 6, 6, [0, 255, 0]);
        assert_eq!(img.pixel(2, 2), [0, 255, 0]);
        assert_eq!(img.pixel(7, 7), [0, 255, 0]);
        assert_eq!(img.pixel(4, 4), [0, 0, 0]);
    }

    #[test]
    fn drawing_clips_outside_frame() {
        let mut img = FrameImage::black(8, 8);
        img.draw_rect(4, 4, 100, 100, [255, 255, 255]);
        img.draw_line(-5, -5, 20, 20, [255, 255, 255]);
        img.draw_marker(0, 0, [255, 255, 255]);
        // Diagonal passes through the frame.
        assert_eq!(img.pixel(3, 3), [255, 255, 255]);
    }

    #[test]
    fn text_marks_pixels() {
        let mut img = FrameImage::black(64, 16);
        img.draw_text(1, 1, "fps 30", 1, [255, 255, 0]);
        let lit = img
            .data()
            .chunks_exact(3)
            .filter(|px| px[0] > 0 || px[1] > 0)
            .count();
        assert!(lit > 10, "expected glyph pixels, got {lit}");
    }
}
