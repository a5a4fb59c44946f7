//! Legacy Canvas renderer
//!
//! Draws one structured catalogue item onto a fixed layout: the product
//! image in the top 65%, the wrapped name from 70% height, the catalogue
//! label at 92% and a watermark at the bottom.

use crate::job::{LegacyRenderItem, OutputSpec, WatermarkConfig};
use crate::rendering::paint::{self, Canvas, Rgba8, TextAlign, BLACK, WHITE};
use crate::rendering::{raster, Artifact, ItemRenderer};
use crate::{RenderConfig, Result};
use image::DynamicImage;
use log::{debug, warn};

pub use crate::rendering::paint::wrap_text;

const PADDING: u32 = 40;
const NAME_SIZE: f32 = 80.0;
const NAME_LINE_SPACING: i32 = 90;
const LABEL_SIZE: f32 = 48.0;
const LABEL_COLOR: Rgba8 = (0x66, 0x66, 0x66, 0xFF);
const WATERMARK_SIZE: f32 = 42.0;
const FIXED_WATERMARK_SIZE: f32 = 32.0;
const WATERMARK_COLOR: Rgba8 = (0, 0, 0, 0x44);

/// Where a configured watermark is anchored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkPosition {
    TopLeft,
    TopCenter,
    TopRight,
    MiddleLeft,
    MiddleCenter,
    MiddleRight,
    BottomLeft,
    BottomCenter,
    BottomRight,
}

impl WatermarkPosition {
    /// `top_left` and `TOP-LEFT` are accepted; unknown values land bottom-center
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "top-left" => Self::TopLeft,
            "top-center" => Self::TopCenter,
            "top-right" => Self::TopRight,
            "middle-left" => Self::MiddleLeft,
            "middle-center" => Self::MiddleCenter,
            "middle-right" => Self::MiddleRight,
            "bottom-left" => Self::BottomLeft,
            "bottom-right" => Self::BottomRight,
            _ => Self::BottomCenter,
        }
    }

    /// Anchor x, baseline y and alignment on a `width × height` canvas
    fn anchor(self, width: u32, height: u32, size: f32) -> (i32, i32, TextAlign) {
        let pad = PADDING as i32;
        let (w, h) = (width as i32, height as i32);
        let top = pad + size as i32;
        let (x, align) = match self {
            Self::TopLeft | Self::MiddleLeft | Self::BottomLeft => (pad, TextAlign::Left),
            Self::TopCenter | Self::MiddleCenter | Self::BottomCenter => (w / 2, TextAlign::Center),
            Self::TopRight | Self::MiddleRight | Self::BottomRight => (w - pad, TextAlign::Right),
        };
        let y = match self {
            Self::TopLeft | Self::TopCenter | Self::TopRight => top,
            Self::MiddleLeft | Self::MiddleCenter | Self::MiddleRight => h / 2,
            Self::BottomLeft | Self::BottomCenter | Self::BottomRight => h - pad,
        };
        (x, y, align)
    }
}

/// Rectangle the source image is drawn into: fit inside the padded top 65%
/// region, aspect preserved, centered horizontally
pub fn image_rect(src_w: u32, src_h: u32, width: u32, height: u32) -> Option<(i32, i32, u32, u32)> {
    if src_w == 0 || src_h == 0 {
        return None;
    }
    let avail_w = width.saturating_sub(PADDING * 2) as f32;
    let avail_h = ((height as f32 * 0.65) as u32).saturating_sub(PADDING) as f32;
    let scale = (avail_w / src_w as f32).min(avail_h / src_h as f32);
    let w = (src_w as f32 * scale) as u32;
    let h = (src_h as f32 * scale) as u32;
    if w == 0 || h == 0 {
        return None;
    }
    let left = (width as i32 - w as i32) / 2;
    let top = PADDING as i32 + (avail_h as i32 - h as i32) / 2;
    Some((left, top, w, h))
}

/// Draws legacy items and encodes them
pub struct CanvasRenderer {
    jpeg_quality: u8,
    watermark_text: String,
}

impl CanvasRenderer {
    pub fn new(config: &RenderConfig) -> Self {
        Self {
            jpeg_quality: config.jpeg_quality,
            watermark_text: config.watermark_text.clone(),
        }
    }

    /// Paint an item without encoding it
    pub fn paint_item(&self, item: &LegacyRenderItem, output: &OutputSpec, source: Option<&DynamicImage>) -> Canvas {
        let (width, height) = (output.width, output.height);
        let mut canvas = Canvas::new(width, height, WHITE);

        if let Some(src) = source {
            if let Some((x, y, w, h)) = image_rect(src.width(), src.height(), width, height) {
                canvas.draw_image(&src.to_rgba8(), x, y, w, h);
                debug!("Rendered image for: {} at rect: ({}, {}, {}, {})", item.name, x, y, w, h);
            }
        }

        let lines = wrap_text(&item.name, width as f32 * 0.9, |s| paint::measure_text(s, NAME_SIZE) as f32);
        let glyph_h = paint::text_height(NAME_SIZE) as i32;
        let mut baseline = (height as f32 * 0.70) as i32;
        for line in &lines {
            canvas.draw_text(line, width as i32 / 2, baseline - glyph_h, NAME_SIZE, BLACK, TextAlign::Center, true);
            baseline += NAME_LINE_SPACING;
        }

        if let Some(meta) = &item.render_config {
            match meta.first_catalogue_label() {
                Ok(Some(label)) => {
                    let y = (height as f32 * 0.92) as i32 - paint::text_height(LABEL_SIZE) as i32;
                    canvas.draw_text(&label.to_uppercase(), width as i32 / 2, y, LABEL_SIZE, LABEL_COLOR, TextAlign::Center, false);
                }
                Ok(None) => {}
                Err(e) => warn!("Could not render config info: {}", e),
            }
        }

        self.draw_watermark(&mut canvas, output.watermark.as_ref());
        canvas
    }

    fn draw_watermark(&self, canvas: &mut Canvas, config: Option<&WatermarkConfig>) {
        let (width, height) = (canvas.width(), canvas.height());
        match config.filter(|c| c.enabled) {
            Some(wm) => {
                let (x, baseline, align) = WatermarkPosition::parse(&wm.position).anchor(width, height, WATERMARK_SIZE);
                let y = baseline - paint::text_height(WATERMARK_SIZE) as i32;
                canvas.draw_text(&wm.text, x, y, WATERMARK_SIZE, WATERMARK_COLOR, align, false);
            }
            None => {
                if self.watermark_text.is_empty() {
                    return;
                }
                let y = (height as f32 * 0.98) as i32 - paint::text_height(FIXED_WATERMARK_SIZE) as i32;
                canvas.draw_text(&self.watermark_text, width as i32 / 2, y, FIXED_WATERMARK_SIZE, WATERMARK_COLOR, TextAlign::Center, false);
            }
        }
    }
}

impl ItemRenderer for CanvasRenderer {
    fn render_item(&self, item: &LegacyRenderItem, output: &OutputSpec) -> Result<Artifact> {
        paint::check_extent(output.width, output.height)?;
        let source = raster::decode_source(&item.image_path);
        let canvas = self.paint_item(item, output, source.as_ref());
        let bytes = raster::encode(canvas.image(), output.format, self.jpeg_quality)?;
        let (width, height) = (canvas.width(), canvas.height());
        drop(source);
        drop(canvas);
        Ok(Artifact {
            bytes,
            format: output.format,
            width,
            height,
        })
    }
}
