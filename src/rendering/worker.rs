//! Worker renderer
//!
//! A background session that receives `RENDER_IMAGE` / `CANCEL` messages and
//! answers with `PROGRESS`, `RENDER_COMPLETE`, `RENDER_ERROR` or `CANCELLED`.
//! Rendering projects a detached DOM fragment onto a canvas in three
//! independent passes (backgrounds, images, leaf text). A failure inside a
//! pass only skips the element that caused it.

use crate::job::{OutputFormat, RenderJob};
use crate::rendering::layout::{self, parse_color, Layout, LayoutNode, NodeKind, Rect};
use crate::error::catch_panic;
use crate::rendering::paint::{self, Canvas, TextAlign, WHITE};
use crate::rendering::{raster, Artifact, HtmlRenderer};
use crate::{Error, RenderConfig, Result};
use base64::Engine as _;
use image::RgbaImage;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const DEFAULT_EXTENT: u32 = 400;
const TEXT_TAGS: &[&str] = &["p", "h1", "h2", "h3", "h4", "h5", "h6", "div", "span"];

fn default_scale() -> u32 {
    3
}

fn default_background() -> String {
    "#ffffff".to_string()
}

fn default_image_timeout() -> u64 {
    5000
}

/// Options carried by a `RENDER_IMAGE` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerOptions {
    #[serde(default = "default_scale")]
    pub scale: u32,
    #[serde(default = "default_background")]
    pub background_color: String,
    /// Per-image load bound in milliseconds
    #[serde(default = "default_image_timeout")]
    pub image_timeout: u64,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            scale: default_scale(),
            background_color: default_background(),
            image_timeout: default_image_timeout(),
        }
    }
}

impl WorkerOptions {
    pub fn from_config(config: &RenderConfig) -> Self {
        Self {
            scale: config.worker_scale.max(1),
            background_color: default_background(),
            image_timeout: config.image_timeout_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderImageRequest {
    #[serde(alias = "htmlContent")]
    pub html: String,
    pub product_id: String,
    #[serde(default)]
    pub catalogue_label: String,
    #[serde(rename = "type", default)]
    pub catalogue_type: Option<String>,
    #[serde(default)]
    pub options: WorkerOptions,
}

/// Messages into a worker session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerRequest {
    RenderImage(RenderImageRequest),
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressData {
    pub status: String,
    pub product_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderComplete {
    pub product_id: String,
    pub catalogue_label: String,
    pub catalogue_type: Option<String>,
    pub base64: String,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderFailure {
    pub product_id: String,
    pub catalogue_label: String,
    pub error: String,
}

/// Messages out of a worker session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerResponse {
    Progress(ProgressData),
    RenderComplete(RenderComplete),
    RenderError(RenderFailure),
    Cancelled,
}

fn scaled(rect: &Rect, scale: u32) -> Rect {
    let s = scale.min(i32::MAX as u32) as i32;
    Rect {
        x: rect.x.saturating_mul(s),
        y: rect.y.saturating_mul(s),
        width: rect.width.saturating_mul(scale),
        height: rect.height.saturating_mul(scale),
    }
}

/// Rectangle of `idx` relative to its parent's, scaled to device pixels
fn projected_rect(layout: &Layout, idx: usize, scale: u32) -> Rect {
    let node = &layout.nodes[idx];
    let rel = match layout.parent_rect(idx) {
        Some(parent) => node.rect.relative_to(parent),
        None => node.rect.clone(),
    };
    scaled(&rel, scale)
}

fn paint_background(canvas: &mut Canvas, layout: &Layout, idx: usize, scale: u32) -> Result<()> {
    let node = &layout.nodes[idx];
    if let (NodeKind::Element, Some(rgba)) = (&node.kind, node.style.background) {
        let r = projected_rect(layout, idx, scale);
        canvas.fill_rect(r.x, r.y, r.width, r.height, rgba);
    }
    Ok(())
}

fn paint_image(canvas: &mut Canvas, layout: &Layout, idx: usize, opts: &WorkerOptions) -> Result<()> {
    let NodeKind::Image { src } = &layout.nodes[idx].kind else {
        return Ok(());
    };
    let img = raster::load_image_source(src, Duration::from_millis(opts.image_timeout))?;
    let r = projected_rect(layout, idx, opts.scale.max(1));
    canvas.draw_image(&img.to_rgba8(), r.x, r.y, r.width, r.height);
    Ok(())
}

fn paint_text(canvas: &mut Canvas, layout: &Layout, idx: usize, scale: u32) -> Result<()> {
    let node: &LayoutNode = &layout.nodes[idx];
    if !TEXT_TAGS.contains(&node.tag.as_str()) {
        return Ok(());
    }
    let Some(text) = node.leaf_text.as_deref() else {
        return Ok(());
    };
    let r = projected_rect(layout, idx, scale);
    let size = node.style.font_size * scale as f32;
    canvas.draw_text(text, r.x, r.y, size, node.style.color, TextAlign::Left, node.style.bold);
    Ok(())
}

/// Project `html` onto a bitmap
pub fn render_bitmap(html: &str, opts: &WorkerOptions) -> Result<RgbaImage> {
    if html.trim().is_empty() {
        return Err(Error::InvalidInput("Empty HTML content".into()));
    }
    let scale = opts.scale.max(1);
    let layout = layout::layout_html(html, DEFAULT_EXTENT);

    let root_width = layout
        .nodes
        .iter()
        .find(|n| n.parent.is_none())
        .map(|n| n.rect.width)
        .filter(|w| *w > 0)
        .unwrap_or(DEFAULT_EXTENT);
    let root_height = Some(layout.content_height).filter(|h| *h > 0).unwrap_or(DEFAULT_EXTENT);

    let background = parse_color(&opts.background_color).unwrap_or(WHITE);
    let (width, height) = match (root_width.checked_mul(scale), root_height.checked_mul(scale)) {
        (Some(w), Some(h)) => (w, h),
        _ => {
            return Err(Error::RenderError(format!(
                "Canvas of {}x{} at scale {} is too large",
                root_width, root_height, scale
            )))
        }
    };
    paint::check_extent(width, height)?;
    let mut canvas = Canvas::new(width, height, background);

    for idx in 0..layout.nodes.len() {
        if let Err(e) = paint_background(&mut canvas, &layout, idx, scale) {
            debug!("Background pass skipped element {}: {}", idx, e);
        }
    }
    for idx in 0..layout.nodes.len() {
        if let Err(e) = paint_image(&mut canvas, &layout, idx, opts) {
            warn!("Image pass skipped element {}: {}", idx, e);
        }
    }
    for idx in 0..layout.nodes.len() {
        if let Err(e) = paint_text(&mut canvas, &layout, idx, scale) {
            debug!("Text pass skipped element {}: {}", idx, e);
        }
    }

    Ok(canvas.into_image())
}

/// Project `html` onto a canvas and return the PNG as base64
pub fn render_html(html: &str, opts: &WorkerOptions) -> Result<String> {
    let bitmap = render_bitmap(html, opts)?;
    let png = raster::encode(&bitmap, OutputFormat::Png, 100)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(png))
}

/// Answer one render request
pub fn handle_render(req: &RenderImageRequest) -> WorkerResponse {
    match catch_panic("Render", || render_html(&req.html, &req.options)) {
        Ok(base64) => WorkerResponse::RenderComplete(RenderComplete {
            product_id: req.product_id.clone(),
            catalogue_label: req.catalogue_label.clone(),
            catalogue_type: req.catalogue_type.clone(),
            base64,
            success: true,
        }),
        Err(e) => WorkerResponse::RenderError(RenderFailure {
            product_id: req.product_id.clone(),
            catalogue_label: req.catalogue_label.clone(),
            error: e.to_string(),
        }),
    }
}

/// Progress message announced before a render starts
pub fn progress_for(req: &RenderImageRequest) -> WorkerResponse {
    WorkerResponse::Progress(ProgressData {
        status: "rendering".into(),
        product_id: req.product_id.clone(),
        message: format!("Rendering {}...", req.product_id),
    })
}

/// One worker session on its own thread
pub struct RenderWorker {
    tx: Mutex<Option<Sender<WorkerRequest>>>,
    rx: Mutex<Receiver<WorkerResponse>>,
    terminated: Arc<AtomicBool>,
}

impl RenderWorker {
    pub fn spawn() -> Result<Self> {
        let (tx, in_rx) = mpsc::channel::<WorkerRequest>();
        let (out_tx, rx) = mpsc::channel::<WorkerResponse>();
        let terminated = Arc::new(AtomicBool::new(false));
        let flag = terminated.clone();

        thread::Builder::new()
            .name("catrender-worker".into())
            .spawn(move || {
                let mut accepting = true;
                while let Ok(msg) = in_rx.recv() {
                    if flag.load(Ordering::SeqCst) {
                        break;
                    }
                    match msg {
                        WorkerRequest::RenderImage(req) => {
                            if !accepting {
                                debug!("Worker cancelled, ignoring render of {}", req.product_id);
                                continue;
                            }
                            let _ = out_tx.send(progress_for(&req));
                            let resp = handle_render(&req);
                            if flag.load(Ordering::SeqCst) {
                                break;
                            }
                            let _ = out_tx.send(resp);
                        }
                        WorkerRequest::Cancel => {
                            accepting = false;
                            let _ = out_tx.send(WorkerResponse::Cancelled);
                        }
                    }
                }
                debug!("Worker session exiting");
            })
            .map_err(|e| Error::Other(format!("Failed to spawn worker: {}", e)))?;

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
            terminated,
        })
    }

    pub fn post(&self, msg: WorkerRequest) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .map_err(|_| Error::Other("worker lock poisoned".into()))?;
        tx.as_ref()
            .ok_or_else(|| Error::Other("Worker has been terminated".into()))?
            .send(msg)
            .map_err(|_| Error::Other("Worker has been terminated".into()))
    }

    /// Next outgoing message, waiting at most `timeout`
    pub fn recv_timeout(&self, timeout: Duration) -> Option<WorkerResponse> {
        let rx = self.rx.lock().ok()?;
        match rx.recv_timeout(timeout) {
            Ok(msg) => Some(msg),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_recv(&self) -> Option<WorkerResponse> {
        self.rx.lock().ok()?.try_recv().ok()
    }

    /// Hard cancellation: no further messages are processed or delivered.
    /// An in-flight render runs to completion but its result is dropped.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        info!("Worker session terminated");
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

impl Drop for RenderWorker {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// [`HtmlRenderer`] running the projection inline on the caller's thread
pub struct WorkerRenderer {
    options: WorkerOptions,
}

impl WorkerRenderer {
    pub fn new(options: WorkerOptions) -> Self {
        Self { options }
    }
}

impl HtmlRenderer for WorkerRenderer {
    fn name(&self) -> &'static str {
        "worker"
    }

    fn render(&self, job: &RenderJob) -> Result<Artifact> {
        job.validate()?;
        let bitmap = render_bitmap(&job.html, &self.options)?;
        let bytes = raster::encode(&bitmap, OutputFormat::Png, 100)?;
        Ok(Artifact {
            bytes,
            format: OutputFormat::Png,
            width: bitmap.width(),
            height: bitmap.height(),
        })
    }
}
