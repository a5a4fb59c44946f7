//! Paint commands and the software canvas that executes them
//!
//! Text uses the 8x8 bitmap glyphs from `font8x8`, scaled by an integer
//! factor, so output is fully deterministic and needs no font files.

use crate::{Error, Result};
use font8x8::{UnicodeFonts, BASIC_FONTS};
use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use log::debug;

pub type Rgba8 = (u8, u8, u8, u8);

pub const WHITE: Rgba8 = (255, 255, 255, 255);
pub const BLACK: Rgba8 = (0, 0, 0, 255);

/// Largest width or height of any bitmap the pipeline allocates
pub const MAX_CANVAS_EXTENT: u32 = 16_384;
/// Largest pixel count of any bitmap the pipeline allocates
pub const MAX_CANVAS_PIXELS: u64 = 50_000_000;
const MAX_GLYPH_SCALE: u32 = 1024;

/// Reject bitmap sizes the canvas must not allocate
pub fn check_extent(width: u32, height: u32) -> Result<()> {
    if width > MAX_CANVAS_EXTENT || height > MAX_CANVAS_EXTENT || width as u64 * height as u64 > MAX_CANVAS_PIXELS {
        return Err(Error::RenderError(format!(
            "Bitmap of {}x{} exceeds the {}px / {} pixel limit",
            width, height, MAX_CANVAS_EXTENT, MAX_CANVAS_PIXELS
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextAlign {
    #[default]
    Left,
    Center,
    Right,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PaintCommand {
    SolidRect {
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        rgba: Rgba8,
    },
    /// Draw `image` scaled into the destination rectangle
    Image {
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        image: RgbaImage,
    },
    /// `x` is the anchor for `align`, `y` the top of the glyph box
    Text {
        x: i32,
        y: i32,
        text: String,
        size: f32,
        rgba: Rgba8,
        align: TextAlign,
        bold: bool,
    },
}

/// Integer glyph magnification for a font size in pixels
pub fn glyph_scale(size: f32) -> u32 {
    ((size / 8.0).round() as u32).clamp(1, MAX_GLYPH_SCALE)
}

/// Height in pixels of one line of glyphs at `size`
pub fn text_height(size: f32) -> u32 {
    8 * glyph_scale(size)
}

/// Advance width of `text` at `size`
pub fn measure_text(text: &str, size: f32) -> u32 {
    (text.chars().count() as u32).saturating_mul(8 * glyph_scale(size))
}

/// Greedy word wrap: words are appended while the line fits `max_width`.
/// A single word wider than the limit still gets its own line.
pub fn wrap_text<F>(text: &str, max_width: f32, measure: F) -> Vec<String>
where
    F: Fn(&str) -> f32,
{
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split(' ') {
        let candidate = if current.is_empty() {
            word.to_string()
        } else {
            format!("{} {}", current, word)
        };
        if measure(&candidate) > max_width {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            current = word.to_string();
        } else {
            current = candidate;
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

fn blend(dst: Rgba<u8>, src: Rgba8) -> Rgba<u8> {
    let a = src.3 as u32;
    if a == 255 {
        return Rgba([src.0, src.1, src.2, 255]);
    }
    if a == 0 {
        return dst;
    }
    let inv = 255 - a;
    let mix = |s: u8, d: u8| ((s as u32 * a + d as u32 * inv) / 255) as u8;
    let out_a = (a + dst.0[3] as u32 * inv / 255).min(255) as u8;
    Rgba([mix(src.0, dst.0[0]), mix(src.1, dst.0[1]), mix(src.2, dst.0[2]), out_a])
}

/// RGBA software canvas
pub struct Canvas {
    img: RgbaImage,
}

impl Canvas {
    pub fn new(width: u32, height: u32, background: Rgba8) -> Self {
        let (r, g, b, a) = background;
        Self {
            img: RgbaImage::from_pixel(width.max(1), height.max(1), Rgba([r, g, b, a])),
        }
    }

    pub fn width(&self) -> u32 {
        self.img.width()
    }

    pub fn height(&self) -> u32 {
        self.img.height()
    }

    pub fn fill_rect(&mut self, x: i32, y: i32, width: u32, height: u32, rgba: Rgba8) {
        let x0 = x.max(0) as u32;
        let y0 = y.max(0) as u32;
        let x1 = (x as i64 + width as i64).clamp(0, self.img.width() as i64) as u32;
        let y1 = (y as i64 + height as i64).clamp(0, self.img.height() as i64) as u32;
        for py in y0..y1 {
            for px in x0..x1 {
                let dst = *self.img.get_pixel(px, py);
                self.img.put_pixel(px, py, blend(dst, rgba));
            }
        }
    }

    pub fn draw_image(&mut self, src: &RgbaImage, x: i32, y: i32, width: u32, height: u32) {
        if width == 0 || height == 0 || src.width() == 0 || src.height() == 0 {
            return;
        }
        if check_extent(width, height).is_err() {
            debug!("Skipping {}x{} image, larger than any canvas", width, height);
            return;
        }
        let scaled;
        let src = if src.width() == width && src.height() == height {
            src
        } else {
            scaled = imageops::resize(src, width, height, FilterType::Triangle);
            &scaled
        };
        imageops::overlay(&mut self.img, src, x as i64, y as i64);
    }

    fn draw_glyphs(&mut self, text: &str, x: i32, y: i32, scale: u32, rgba: Rgba8) {
        let s = scale as i32;
        let right = self.img.width() as i32;
        let mut cursor_x = x;
        for ch in text.chars() {
            if cursor_x >= right {
                break;
            }
            if let Some(glyph) = BASIC_FONTS.get(ch).or_else(|| BASIC_FONTS.get('?')) {
                for (row_idx, row) in glyph.iter().enumerate() {
                    for col in 0..8 {
                        if (row >> col) & 1 == 0 {
                            continue;
                        }
                        let gx = cursor_x.saturating_add(col * s);
                        let gy = y.saturating_add(row_idx as i32 * s);
                        self.fill_rect(gx, gy, scale, scale, rgba);
                    }
                }
            }
            cursor_x = cursor_x.saturating_add(8 * s);
        }
    }

    pub fn draw_text(&mut self, text: &str, x: i32, y: i32, size: f32, rgba: Rgba8, align: TextAlign, bold: bool) {
        let w = measure_text(text, size).min(i32::MAX as u32) as i32;
        let left = match align {
            TextAlign::Left => x,
            TextAlign::Center => x.saturating_sub(w / 2),
            TextAlign::Right => x.saturating_sub(w),
        };
        let scale = glyph_scale(size);
        self.draw_glyphs(text, left, y, scale, rgba);
        if bold {
            self.draw_glyphs(text, left.saturating_add(1), y, scale, rgba);
        }
    }

    pub fn execute(&mut self, commands: &[PaintCommand]) {
        for cmd in commands {
            match cmd {
                PaintCommand::SolidRect { x, y, width, height, rgba } => {
                    self.fill_rect(*x, *y, *width, *height, *rgba)
                }
                PaintCommand::Image { x, y, width, height, image } => {
                    self.draw_image(image, *x, *y, *width, *height)
                }
                PaintCommand::Text { x, y, text, size, rgba, align, bold } => {
                    self.draw_text(text, *x, *y, *size, *rgba, *align, *bold)
                }
            }
        }
    }

    pub fn image(&self) -> &RgbaImage {
        &self.img
    }

    pub fn into_image(self) -> RgbaImage {
        self.img
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_bitmaps_are_rejected() {
        assert!(check_extent(1080, 1080).is_ok());
        assert!(check_extent(MAX_CANVAS_EXTENT + 1, 10).is_err());
        assert!(check_extent(10_000, 10_000).is_err());
        assert!(matches!(check_extent(4_000_000_000, 4_000_000_000), Err(Error::RenderError(_))));
    }

    #[test]
    fn extreme_geometry_is_clipped() {
        let mut c = Canvas::new(16, 16, WHITE);
        c.fill_rect(i32::MAX - 5, 0, u32::MAX, u32::MAX, BLACK);
        c.draw_text(&"W".repeat(10_000), i32::MAX - 10, i32::MAX - 10, 1.0e9, BLACK, TextAlign::Center, true);
        c.draw_image(&RgbaImage::new(2, 2), 0, 0, 1_000_000, 1_000_000);
        assert!(c.image().pixels().all(|p| p.0 == [255, 255, 255, 255]));
    }

    #[test]
    fn solid_rect_clips_to_canvas() {
        let mut c = Canvas::new(10, 10, WHITE);
        c.execute(&[PaintCommand::SolidRect {
            x: -5,
            y: 5,
            width: 100,
            height: 100,
            rgba: (255, 0, 0, 255),
        }]);
        assert_eq!(c.image().get_pixel(0, 9).0, [255, 0, 0, 255]);
        assert_eq!(c.image().get_pixel(0, 4).0, [255, 255, 255, 255]);
    }

    #[test]
    fn text_marks_pixels() {
        let mut c = Canvas::new(64, 16, WHITE);
        c.draw_text("Hi", 0, 0, 8.0, BLACK, TextAlign::Left, false);
        assert!(c.image().pixels().any(|p| p.0 == [0, 0, 0, 255]));
    }

    #[test]
    fn wrap_splits_long_names() {
        let lines = wrap_text("alpha beta gamma", 10.0, |s| s.len() as f32);
        assert_eq!(lines, vec!["alpha beta", "gamma"]);
        let one = wrap_text("short", 10.0, |s| s.len() as f32);
        assert_eq!(one, vec!["short"]);
    }

    #[test]
    fn half_alpha_blends() {
        let mut c = Canvas::new(1, 1, WHITE);
        c.fill_rect(0, 0, 1, 1, (0, 0, 0, 128));
        let p = c.image().get_pixel(0, 0).0;
        assert!(p[0] > 100 && p[0] < 150);
    }
}
