//! Snapshot renderer
//!
//! HTML is loaded into an off-screen surface that only one thread may touch.
//! [`SurfaceThread`] owns the surface and runs a command loop; callers hand
//! work over a channel and block on a one-shot reply with a bounded wait.

use crate::job::{OutputFormat, RenderJob};
use crate::rendering::layout::{self, Layout, NodeKind};
use crate::rendering::paint::{self, Canvas, PaintCommand, TextAlign, WHITE};
use crate::rendering::{raster, Artifact, HtmlRenderer};
use crate::storage::Storage;
use crate::error::catch_panic;
use crate::{Error, RenderConfig, Result};
use image::{imageops, RgbaImage};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

/// An off-screen rendering surface bound to the thread that created it
pub trait SnapshotSurface {
    /// Load a document and lay it out at `width`
    fn load_html(&mut self, html: &str, width: u32) -> Result<()>;

    /// Natural height of the loaded content
    fn content_height(&self) -> u32;

    /// Rasterize the loaded document into a `width × height` bitmap
    fn rasterize(&mut self, width: u32, height: u32) -> Result<RgbaImage>;
}

/// Build the display list for a laid-out document
///
/// Images that fail to load are left out.
pub fn display_list(layout: &Layout, image_timeout: Duration) -> Vec<PaintCommand> {
    let mut commands = Vec::new();
    for node in &layout.nodes {
        match &node.kind {
            NodeKind::Element => {
                if let Some(rgba) = node.style.background {
                    commands.push(PaintCommand::SolidRect {
                        x: node.rect.x,
                        y: node.rect.y,
                        width: node.rect.width,
                        height: node.rect.height,
                        rgba,
                    });
                }
            }
            NodeKind::Image { src } => match raster::load_image_source(src, image_timeout) {
                Ok(img) => commands.push(PaintCommand::Image {
                    x: node.rect.x,
                    y: node.rect.y,
                    width: node.rect.width,
                    height: node.rect.height,
                    image: img.to_rgba8(),
                }),
                Err(e) => debug!("Skipping image {}: {}", src, e),
            },
            NodeKind::Text { lines } => {
                let size = node.style.font_size;
                let advance = (paint::text_height(size) + 2 * paint::glyph_scale(size)) as i32;
                for (i, line) in lines.iter().enumerate() {
                    commands.push(PaintCommand::Text {
                        x: node.rect.x,
                        y: node.rect.y.saturating_add((i as i32).saturating_mul(advance)),
                        text: line.clone(),
                        size,
                        rgba: node.style.color,
                        align: TextAlign::Left,
                        bold: node.style.bold,
                    });
                }
            }
        }
    }
    commands
}

/// Built-in surface backed by the block layout and the software canvas
pub struct LayoutSurface {
    layout: Option<Layout>,
    image_timeout: Duration,
}

impl LayoutSurface {
    pub fn new(image_timeout: Duration) -> Self {
        Self {
            layout: None,
            image_timeout,
        }
    }
}

impl SnapshotSurface for LayoutSurface {
    fn load_html(&mut self, html: &str, width: u32) -> Result<()> {
        self.layout = Some(layout::layout_html(html, width));
        Ok(())
    }

    fn content_height(&self) -> u32 {
        self.layout.as_ref().map(|l| l.content_height).unwrap_or(0)
    }

    fn rasterize(&mut self, width: u32, height: u32) -> Result<RgbaImage> {
        let layout = self
            .layout
            .as_ref()
            .ok_or_else(|| Error::RenderError("No document loaded".into()))?;
        let mut canvas = Canvas::new(width, height, WHITE);
        canvas.execute(&display_list(layout, self.image_timeout));
        Ok(canvas.into_image())
    }
}

/// Work handed to the surface thread
pub enum SurfaceCommand {
    Snapshot {
        html: String,
        width: u32,
        min_height: u32,
        settle: Duration,
        reply: Sender<Result<RgbaImage>>,
    },
    Shutdown,
}

fn snapshot_on_surface(surface: &mut dyn SnapshotSurface, html: &str, width: u32, min_height: u32, settle: Duration) -> Result<RgbaImage> {
    surface.load_html(html, width)?;
    // load finished; give late layout a moment before measuring
    thread::sleep(settle);
    let height = surface.content_height().max(min_height);
    paint::check_extent(width, height)?;
    let drawn = surface.rasterize(width, height)?;
    let mut bitmap = RgbaImage::from_pixel(width, height, image::Rgba([255, 255, 255, 255]));
    imageops::overlay(&mut bitmap, &drawn, 0, 0);
    Ok(bitmap)
}

/// The UI-affine thread owning one surface
pub struct SurfaceThread {
    tx: Sender<SurfaceCommand>,
}

impl SurfaceThread {
    /// Spawn the thread and build the surface on it
    pub fn spawn<F>(factory: F) -> Result<Self>
    where
        F: FnOnce() -> Result<Box<dyn SnapshotSurface>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<SurfaceCommand>();
        let (init_tx, init_rx) = mpsc::channel::<Result<()>>();

        thread::Builder::new()
            .name("catrender-surface".into())
            .spawn(move || {
                let mut surface = match factory() {
                    Ok(s) => s,
                    Err(err) => {
                        let _ = init_tx.send(Err(err));
                        return;
                    }
                };
                let _ = init_tx.send(Ok(()));

                while let Ok(cmd) = rx.recv() {
                    match cmd {
                        SurfaceCommand::Snapshot {
                            html,
                            width,
                            min_height,
                            settle,
                            reply,
                        } => {
                            let res = catch_panic("Snapshot", || {
                                snapshot_on_surface(surface.as_mut(), &html, width, min_height, settle)
                            });
                            if let Err(e) = &res {
                                warn!("Snapshot failed: {}", e);
                            }
                            // the caller may have given up waiting
                            let _ = reply.send(res);
                        }
                        SurfaceCommand::Shutdown => break,
                    }
                }
                debug!("Surface thread exiting");
            })
            .map_err(|e| Error::Other(format!("Failed to spawn surface thread: {}", e)))?;

        init_rx
            .recv()
            .map_err(|e| Error::Other(format!("Surface init canceled: {}", e)))??;

        Ok(Self { tx })
    }
}

impl Drop for SurfaceThread {
    fn drop(&mut self) {
        let _ = self.tx.send(SurfaceCommand::Shutdown);
    }
}

/// HTML → PNG through a surface thread
pub struct SnapshotRenderer {
    surface: SurfaceThread,
    width: u32,
    min_height: u32,
    settle: Duration,
    timeout: Duration,
}

impl SnapshotRenderer {
    pub fn new(surface: SurfaceThread, config: &RenderConfig) -> Self {
        Self {
            surface,
            width: config.snapshot_width,
            min_height: config.snapshot_min_height,
            settle: config.settle_delay(),
            timeout: config.snapshot_timeout(),
        }
    }

    /// Renderer over the built-in [`LayoutSurface`]
    pub fn with_layout_surface(config: &RenderConfig) -> Result<Self> {
        let image_timeout = config.image_timeout();
        let surface = SurfaceThread::spawn(move || Ok(Box::new(LayoutSurface::new(image_timeout)) as Box<dyn SnapshotSurface>))?;
        Ok(Self::new(surface, config))
    }

    /// Renderer over a headless Chrome tab
    #[cfg(feature = "cdp")]
    pub fn with_chrome_surface(config: &RenderConfig) -> Result<Self> {
        let (width, min_height) = (config.snapshot_width, config.snapshot_min_height);
        let surface = SurfaceThread::spawn(move || {
            Ok(Box::new(crate::cdp::ChromeSurface::launch(width, min_height)?) as Box<dyn SnapshotSurface>)
        })?;
        Ok(Self::new(surface, config))
    }

    /// Hand the page to the surface thread and wait for the bitmap
    pub fn snapshot(&self, html: &str) -> Result<RgbaImage> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.surface
            .tx
            .send(SurfaceCommand::Snapshot {
                html: html.to_string(),
                width: self.width,
                min_height: self.min_height,
                settle: self.settle,
                reply: reply_tx,
            })
            .map_err(|_| Error::RenderError("Surface thread is not running".into()))?;

        match reply_rx.recv_timeout(self.timeout) {
            Ok(res) => res,
            Err(RecvTimeoutError::Timeout) => {
                let ms = self.timeout.as_millis() as u64;
                warn!("Snapshot did not complete within {}ms, abandoning wait", ms);
                Err(Error::Timeout(ms))
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::RenderError("Surface thread stopped".into())),
        }
    }

    /// Render and persist under `{folderName}/{fileName}`
    pub fn render_to_storage(&self, job: &RenderJob, storage: &Storage) -> Result<PathBuf> {
        let artifact = self.render(job)?;
        if !storage.write(&job.folder_name, &job.file_name, &artifact.bytes) {
            return Err(Error::Storage(format!(
                "Failed to save {}/{}",
                job.folder_name, job.file_name
            )));
        }
        let path = storage.artifact_path(&job.folder_name, &job.file_name);
        info!("Successfully rendered: {}", path.display());
        Ok(path)
    }
}

impl HtmlRenderer for SnapshotRenderer {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    fn render(&self, job: &RenderJob) -> Result<Artifact> {
        job.validate()?;
        let bitmap = self.snapshot(&job.html)?;
        let bytes = raster::encode(&bitmap, OutputFormat::Png, 100)?;
        Ok(Artifact {
            bytes,
            format: OutputFormat::Png,
            width: bitmap.width(),
            height: bitmap.height(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> RenderConfig {
        RenderConfig {
            settle_delay_ms: 0,
            snapshot_width: 200,
            snapshot_min_height: 100,
            ..Default::default()
        }
    }

    struct SlowSurface;

    impl SnapshotSurface for SlowSurface {
        fn load_html(&mut self, _html: &str, _width: u32) -> Result<()> {
            thread::sleep(Duration::from_millis(300));
            Ok(())
        }

        fn content_height(&self) -> u32 {
            10
        }

        fn rasterize(&mut self, width: u32, height: u32) -> Result<RgbaImage> {
            Ok(RgbaImage::new(width, height))
        }
    }

    #[test]
    fn short_content_gets_minimum_height_and_white_fill() {
        let r = SnapshotRenderer::with_layout_surface(&fast_config()).unwrap();
        let bmp = r.snapshot("<p>x</p>").unwrap();
        assert_eq!(bmp.dimensions(), (200, 100));
        assert_eq!(bmp.get_pixel(199, 99).0, [255, 255, 255, 255]);
    }

    #[test]
    fn tall_content_extends_height() {
        let r = SnapshotRenderer::with_layout_surface(&fast_config()).unwrap();
        let bmp = r
            .snapshot(r#"<div style="height: 450px; background: #ff0000"></div>"#)
            .unwrap();
        assert_eq!(bmp.height(), 450);
        assert_eq!(bmp.get_pixel(10, 10).0, [255, 0, 0, 255]);
    }

    #[test]
    fn slow_surface_times_out() {
        let cfg = RenderConfig {
            snapshot_timeout_ms: 50,
            ..fast_config()
        };
        let surface = SurfaceThread::spawn(|| Ok(Box::new(SlowSurface) as Box<dyn SnapshotSurface>)).unwrap();
        let r = SnapshotRenderer::new(surface, &cfg);
        let err = r.render(&RenderJob::new("<p>x</p>", "x.png")).unwrap_err();
        assert!(matches!(err, Error::Timeout(50)));
    }

    struct PanickySurface {
        loaded: String,
    }

    impl SnapshotSurface for PanickySurface {
        fn load_html(&mut self, html: &str, _width: u32) -> Result<()> {
            self.loaded = html.to_string();
            Ok(())
        }

        fn content_height(&self) -> u32 {
            if self.loaded.contains("explode") {
                panic!("layout blew up");
            }
            20
        }

        fn rasterize(&mut self, width: u32, height: u32) -> Result<RgbaImage> {
            Ok(RgbaImage::new(width, height))
        }
    }

    #[test]
    fn oversized_page_fails_and_surface_keeps_serving() {
        let r = SnapshotRenderer::with_layout_surface(&fast_config()).unwrap();
        let err = r
            .render(&RenderJob::new(r#"<div style="margin: 3000000000px">x</div>"#, "big.png"))
            .unwrap_err();
        assert!(matches!(err, Error::RenderError(_)), "{:?}", err);
        let ok = r.render(&RenderJob::new("<p>fine</p>", "fine.png")).unwrap();
        assert_eq!(ok.width, 200);
    }

    #[test]
    fn panicking_surface_reports_error_and_survives() {
        let surface = SurfaceThread::spawn(|| {
            Ok(Box::new(PanickySurface { loaded: String::new() }) as Box<dyn SnapshotSurface>)
        })
        .unwrap();
        let r = SnapshotRenderer::new(surface, &fast_config());
        let err = r.snapshot("<p>explode</p>").unwrap_err();
        assert!(err.to_string().contains("layout blew up"), "{}", err);
        let bmp = r.snapshot("<p>calm</p>").unwrap();
        assert_eq!(bmp.dimensions(), (200, 100));
    }

    #[test]
    fn render_to_storage_writes_png() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let r = SnapshotRenderer::with_layout_surface(&fast_config()).unwrap();
        let job = RenderJob::new("<h1>Catalogue</h1>", "page.png").in_folder("renders");
        let path = r.render_to_storage(&job, &storage).unwrap();
        assert!(path.is_file());
        assert_eq!(storage.list("renders"), vec!["page.png".to_string()]);
    }
}
