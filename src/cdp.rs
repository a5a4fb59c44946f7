//! Chrome DevTools Protocol snapshot surface

use crate::rendering::snapshot::SnapshotSurface;
use crate::{Error, Result};
use base64::Engine as Base64Engine;
use headless_chrome::browser::tab::Tab;
use headless_chrome::protocol::cdp::Page;
use headless_chrome::{Browser, LaunchOptions};
use image::RgbaImage;
use log::{debug, warn};
use std::sync::Arc;

/// Snapshot surface over a headless Chrome tab (uses the `headless_chrome` crate)
///
/// The browser is launched on the thread that builds the surface and is only
/// touched from there.
pub struct ChromeSurface {
    // kept alive for the lifetime of the tab
    _browser: Browser,
    tab: Arc<Tab>,
}

impl ChromeSurface {
    pub fn launch(width: u32, height: u32) -> Result<Self> {
        let launch_options = LaunchOptions::default_builder()
            .headless(true)
            .window_size(Some((width, height)))
            .build()
            .map_err(|e| Error::RenderError(format!("Failed to build launch options: {}", e)))?;

        let browser = Browser::new(launch_options)
            .map_err(|e| Error::RenderError(format!("Failed to launch browser: {}", e)))?;

        let tab = browser
            .new_tab()
            .map_err(|e| Error::RenderError(format!("Failed to create tab: {}", e)))?;

        Ok(Self {
            _browser: browser,
            tab,
        })
    }
}

impl SnapshotSurface for ChromeSurface {
    fn load_html(&mut self, html: &str, _width: u32) -> Result<()> {
        let url = format!(
            "data:text/html;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(html.as_bytes())
        );

        self.tab
            .navigate_to(&url)
            .map_err(|e| Error::RenderError(format!("Navigation failed: {}", e)))?;

        self.tab
            .wait_until_navigated()
            .map_err(|e| Error::RenderError(format!("Wait for navigation failed: {}", e)))?;

        debug!("Loaded {} bytes of HTML into tab", html.len());
        Ok(())
    }

    fn content_height(&self) -> u32 {
        let eval = self.tab.evaluate(
            "Math.max(document.body ? document.body.scrollHeight : 0, document.documentElement.scrollHeight)",
            false,
        );
        match eval {
            Ok(obj) => obj
                .value
                .and_then(|v| v.as_f64())
                .map(|h| h.max(0.0) as u32)
                .unwrap_or(0),
            Err(e) => {
                warn!("Could not measure content height: {}", e);
                0
            }
        }
    }

    fn rasterize(&mut self, width: u32, height: u32) -> Result<RgbaImage> {
        let clip = Page::Viewport {
            x: 0.0,
            y: 0.0,
            width: width as f64,
            height: height as f64,
            scale: 1.0,
        };
        let png = self
            .tab
            .capture_screenshot(Page::CaptureScreenshotFormatOption::Png, None, Some(clip), true)
            .map_err(|e| Error::RenderError(format!("Screenshot failed: {}", e)))?;

        Ok(image::load_from_memory(&png)?.to_rgba8())
    }
}
