//! Render job model shared by every backend

use crate::rendering::paint;
use crate::{Error, Result, DEFAULT_FOLDER};
use serde::{Deserialize, Serialize};

fn default_folder() -> String {
    DEFAULT_FOLDER.to_string()
}

/// One HTML rasterization unit
///
/// Created by the UI when a catalogue page is ready to export and consumed
/// exactly once by a backend. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderJob {
    #[serde(default)]
    pub html: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default = "default_folder")]
    pub folder_name: String,
}

impl RenderJob {
    pub fn new(html: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            file_name: file_name.into(),
            folder_name: default_folder(),
        }
    }

    pub fn in_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder_name = folder.into();
        self
    }

    /// Reject jobs whose html or file name is empty
    pub fn validate(&self) -> Result<()> {
        if self.html.trim().is_empty() || self.file_name.trim().is_empty() {
            return Err(Error::InvalidInput("html or fileName missing".into()));
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

/// Output encodings supported by the raster stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Png,
    Jpeg,
}

impl OutputFormat {
    /// Parse `png`, `jpg` or `jpeg` (case-insensitive); anything else is PNG
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => OutputFormat::Jpeg,
            _ => OutputFormat::Png,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
        }
    }
}

/// Catalogue metadata attached to a legacy item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogueMeta {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub price_field: Option<String>,
    #[serde(default)]
    pub price_unit_field: Option<String>,
    #[serde(default)]
    pub stock_field: Option<String>,
}

/// Optional structured metadata for a legacy item
///
/// Kept as raw JSON so a malformed payload only costs the cosmetic label,
/// not the whole item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RenderMeta(pub serde_json::Value);

impl RenderMeta {
    /// Label of the first catalogue, if the metadata carries one
    pub fn first_catalogue_label(&self) -> Result<Option<String>> {
        let catalogues = self
            .0
            .get("catalogues")
            .ok_or_else(|| Error::InvalidInput("renderConfig has no catalogues".into()))?;
        let list: Vec<CatalogueMeta> = serde_json::from_value(catalogues.clone())?;
        Ok(list
            .into_iter()
            .next()
            .and_then(|c| c.label)
            .filter(|l| !l.is_empty()))
    }
}

/// One item of the legacy structured-data path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyRenderItem {
    pub id: String,
    pub name: String,
    /// File path, base64 data URI, raw base64, or empty
    #[serde(default)]
    pub image_path: String,
    #[serde(default)]
    pub render_config: Option<RenderMeta>,
}

/// Watermark settings for legacy items
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatermarkConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "WatermarkConfig::default_text")]
    pub text: String,
    #[serde(default = "WatermarkConfig::default_position")]
    pub position: String,
}

impl WatermarkConfig {
    fn default_text() -> String {
        "CatShare".to_string()
    }

    fn default_position() -> String {
        "bottom-left".to_string()
    }
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            text: Self::default_text(),
            position: Self::default_position(),
        }
    }
}

/// Dimensions and encoding applied to every item of a batch
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSpec {
    pub format: OutputFormat,
    pub width: u32,
    pub height: u32,
    pub watermark: Option<WatermarkConfig>,
}

impl Default for OutputSpec {
    fn default() -> Self {
        Self {
            format: OutputFormat::Png,
            width: 1080,
            height: 1080,
            watermark: None,
        }
    }
}

#[derive(Deserialize)]
struct RawBatch {
    items: Vec<LegacyRenderItem>,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    watermark: Option<WatermarkConfig>,
}

/// Items plus the shared output spec, built from one `startRendering` payload
#[derive(Debug, Clone, PartialEq)]
pub struct RenderBatch {
    pub items: Vec<LegacyRenderItem>,
    pub output: OutputSpec,
}

impl RenderBatch {
    pub fn from_json(raw: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        Self::from_value(value)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let raw: RawBatch = serde_json::from_value(value)?;
        let width = raw.width.filter(|w| *w > 0).unwrap_or(1080);
        let height = raw.height.filter(|h| *h > 0).unwrap_or(1080);
        if paint::check_extent(width, height).is_err() {
            return Err(Error::InvalidInput(format!(
                "Output size {}x{} is out of range",
                width, height
            )));
        }
        let output = OutputSpec {
            format: raw.format.as_deref().map(OutputFormat::parse).unwrap_or_default(),
            width,
            height,
            watermark: raw.watermark,
        };
        Ok(Self {
            items: raw.items,
            output,
        })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
