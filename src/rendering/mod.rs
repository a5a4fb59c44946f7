//! Rendering backends
//!
//! Three backends turn input into an encoded [`Artifact`]:
//! - [`canvas::CanvasRenderer`] draws a structured catalogue item onto a fixed
//!   layout ([`ItemRenderer`])
//! - [`snapshot::SnapshotRenderer`] loads HTML into an off-screen surface
//!   owned by a dedicated UI-affine thread ([`HtmlRenderer`])
//! - [`worker::WorkerRenderer`] projects a detached DOM onto a canvas in
//!   three best-effort passes ([`HtmlRenderer`])

pub mod canvas;
pub mod layout;
pub mod paint;
pub mod raster;
pub mod snapshot;
pub mod worker;

use crate::job::{LegacyRenderItem, OutputFormat, OutputSpec, RenderJob};
use crate::{RenderConfig, Result};
use log::info;

/// Encoded output of any backend
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    pub format: OutputFormat,
    pub width: u32,
    pub height: u32,
}

/// A backend that rasterizes an HTML render job
pub trait HtmlRenderer: Send + Sync {
    fn name(&self) -> &'static str;

    fn render(&self, job: &RenderJob) -> Result<Artifact>;
}

/// A backend that draws one structured legacy item
pub trait ItemRenderer: Send + Sync {
    fn render_item(&self, item: &LegacyRenderItem, output: &OutputSpec) -> Result<Artifact>;
}

/// What the host can offer the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCapability {
    /// A native off-screen surface can be driven from a UI-affine thread
    NativeSurface,
    /// Only a background script worker is available (web hosts)
    WorkerOnly,
}

/// Pick the HTML backend for a host
pub fn select_backend(capability: HostCapability, config: &RenderConfig) -> Result<Box<dyn HtmlRenderer>> {
    let renderer: Box<dyn HtmlRenderer> = match capability {
        HostCapability::NativeSurface => Box::new(snapshot::SnapshotRenderer::with_layout_surface(config)?),
        HostCapability::WorkerOnly => Box::new(worker::WorkerRenderer::new(worker::WorkerOptions::from_config(config))),
    };
    info!("Selected {} renderer for {:?}", renderer.name(), capability);
    Ok(renderer)
}
