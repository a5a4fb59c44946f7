//! Block layout of catalogue HTML for the software surfaces
//!
//! This is deliberately small: every element is a block stacked under its
//! previous sibling, text is greedily wrapped with the bitmap font metrics,
//! and only inline `style` declarations are honoured (width, height, margin,
//! padding, background, color, font-size, font-weight, display:none).

use crate::rendering::paint::{self, Rgba8, BLACK};
use scraper::{ElementRef, Html, Node};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    /// This rectangle with its origin expressed relative to `other`'s origin
    pub fn relative_to(&self, other: &Rect) -> Rect {
        Rect {
            x: self.x.saturating_sub(other.x),
            y: self.y.saturating_sub(other.y),
            width: self.width,
            height: self.height,
        }
    }

    pub fn bottom(&self) -> i32 {
        self.y.saturating_add(to_i32(self.height))
    }
}

/// Style values resolved for one element (inherited where CSS inherits)
#[derive(Debug, Clone, PartialEq)]
pub struct ComputedStyle {
    pub background: Option<Rgba8>,
    pub color: Rgba8,
    pub font_size: f32,
    pub bold: bool,
}

impl Default for ComputedStyle {
    fn default() -> Self {
        Self {
            background: None,
            color: BLACK,
            font_size: 16.0,
            bold: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Element,
    Image { src: String },
    /// Wrapped lines of one text run
    Text { lines: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct LayoutNode {
    pub tag: String,
    pub rect: Rect,
    pub style: ComputedStyle,
    pub kind: NodeKind,
    pub parent: Option<usize>,
    /// Trimmed text of an element that has no element children
    pub leaf_text: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Layout {
    pub nodes: Vec<LayoutNode>,
    pub content_height: u32,
}

impl Layout {
    pub fn parent_rect(&self, idx: usize) -> Option<&Rect> {
        self.nodes[idx].parent.map(|p| &self.nodes[p].rect)
    }
}

const SKIPPED: &[&str] = &[
    "head", "script", "style", "title", "meta", "link", "template", "noscript",
];
const DEFAULT_IMAGE_SIZE: u32 = 150;
/// Lengths beyond this are clamped; no box can usefully exceed it
const MAX_LENGTH: u32 = 100_000;
const MAX_FONT_SIZE: f32 = 512.0;

fn to_i32(v: u32) -> i32 {
    v.min(i32::MAX as u32) as i32
}

pub fn parse_color(value: &str) -> Option<Rgba8> {
    let c: csscolorparser::Color = value.trim().parse().ok()?;
    let [r, g, b, a] = c.to_rgba8();
    Some((r, g, b, a))
}

fn parse_declarations(style: &str) -> HashMap<String, String> {
    style
        .split(';')
        .filter_map(|decl| decl.split_once(':'))
        .map(|(k, v)| {
            let v = v.trim().trim_end_matches("!important").trim();
            (k.trim().to_ascii_lowercase(), v.to_string())
        })
        .collect()
}

/// `12px`, `12`, or a percentage of `basis`
fn parse_length(value: &str, basis: u32) -> Option<u32> {
    let v = value.trim();
    if let Some(pct) = v.strip_suffix('%') {
        let p: f32 = pct.trim().parse().ok()?;
        return Some(clamp_length(basis as f32 * p / 100.0));
    }
    let num = v.strip_suffix("px").unwrap_or(v).trim();
    num.parse::<f32>().ok().map(clamp_length)
}

fn clamp_length(n: f32) -> u32 {
    if n.is_nan() {
        return 0;
    }
    n.clamp(0.0, MAX_LENGTH as f32) as u32
}

fn default_font_size(tag: &str, inherited: f32) -> f32 {
    match tag {
        "h1" => 32.0,
        "h2" => 24.0,
        "h3" => 19.0,
        "h4" => 16.0,
        "h5" => 13.0,
        "h6" => 11.0,
        "small" => (inherited * 0.8).max(8.0),
        _ => inherited,
    }
}

fn is_bold_tag(tag: &str) -> bool {
    matches!(tag, "h1" | "h2" | "h3" | "h4" | "h5" | "h6" | "b" | "strong" | "th")
}

fn line_advance(size: f32) -> u32 {
    paint::text_height(size) + paint::glyph_scale(size) * 2
}

struct LayoutBuilder {
    nodes: Vec<LayoutNode>,
}

impl LayoutBuilder {
    /// Lay out `el` with its top-left margin edge at (x, y); returns the
    /// vertical space it consumed including margins
    fn element(&mut self, el: ElementRef<'_>, x: i32, y: i32, avail: u32, inherited: &ComputedStyle, parent: Option<usize>) -> u32 {
        let tag = el.value().name().to_ascii_lowercase();
        if SKIPPED.contains(&tag.as_str()) {
            return 0;
        }
        let decls = el
            .value()
            .attr("style")
            .map(parse_declarations)
            .unwrap_or_default();
        if decls.get("display").map(|d| d == "none").unwrap_or(false) {
            return 0;
        }

        let margin = decls.get("margin").and_then(|m| parse_length(m, avail)).unwrap_or(0);
        let padding = decls.get("padding").and_then(|p| parse_length(p, avail)).unwrap_or(0);
        let font_size = decls
            .get("font-size")
            .and_then(|f| parse_length(f, inherited.font_size as u32))
            .map(|f| f as f32)
            .unwrap_or_else(|| default_font_size(&tag, inherited.font_size))
            .min(MAX_FONT_SIZE);
        let bold = match decls.get("font-weight").map(|w| w.as_str()) {
            Some("bold") | Some("bolder") => true,
            Some(w) => w.parse::<u32>().map(|n| n >= 600).unwrap_or(inherited.bold),
            None => inherited.bold || is_bold_tag(&tag),
        };
        let background = decls
            .get("background-color")
            .or_else(|| decls.get("background"))
            .and_then(|b| parse_color(b))
            .filter(|c| c.3 > 0);
        let style = ComputedStyle {
            background,
            color: decls.get("color").and_then(|c| parse_color(c)).unwrap_or(inherited.color),
            font_size,
            bold,
        };

        let explicit_w = decls
            .get("width")
            .and_then(|w| parse_length(w, avail))
            .or_else(|| el.value().attr("width").and_then(|w| parse_length(w, avail)));
        let explicit_h = decls
            .get("height")
            .and_then(|h| parse_length(h, avail))
            .or_else(|| el.value().attr("height").and_then(|h| parse_length(h, avail)));

        let box_x = x.saturating_add(to_i32(margin));
        let box_y = y.saturating_add(to_i32(margin));
        let outer_w = avail.saturating_sub(margin.saturating_mul(2));

        if tag == "img" {
            let (w, h) = match (explicit_w, explicit_h) {
                (Some(w), Some(h)) => (w, h),
                (Some(w), None) => (w, w),
                (None, Some(h)) => (h, h),
                (None, None) => (DEFAULT_IMAGE_SIZE.min(outer_w.max(1)), DEFAULT_IMAGE_SIZE),
            };
            self.nodes.push(LayoutNode {
                tag,
                rect: Rect { x: box_x, y: box_y, width: w, height: h },
                style,
                kind: NodeKind::Image {
                    src: el.value().attr("src").unwrap_or_default().to_string(),
                },
                parent,
                leaf_text: None,
            });
            return h.saturating_add(margin.saturating_mul(2));
        }

        let width = explicit_w.unwrap_or(outer_w);
        let has_element_children = el.children().any(|c| c.value().is_element());
        let leaf_text = if has_element_children {
            None
        } else {
            let t = el.text().collect::<String>().trim().to_string();
            (!t.is_empty()).then_some(t)
        };

        let idx = self.nodes.len();
        self.nodes.push(LayoutNode {
            tag,
            rect: Rect { x: box_x, y: box_y, width, height: 0 },
            style: style.clone(),
            kind: NodeKind::Element,
            parent,
            leaf_text,
        });

        let content_x = box_x.saturating_add(to_i32(padding));
        let content_w = width.saturating_sub(padding.saturating_mul(2)).max(1);
        let mut cursor = box_y.saturating_add(to_i32(padding));
        for child in el.children() {
            match child.value() {
                Node::Element(_) => {
                    if let Some(child_el) = ElementRef::wrap(child) {
                        let used = self.element(child_el, content_x, cursor, content_w, &style, Some(idx));
                        cursor = cursor.saturating_add(to_i32(used));
                    }
                }
                Node::Text(t) => {
                    let collapsed = t.split_whitespace().collect::<Vec<_>>().join(" ");
                    if collapsed.is_empty() {
                        continue;
                    }
                    let size = style.font_size;
                    let lines = paint::wrap_text(&collapsed, content_w as f32, |s| {
                        paint::measure_text(s, size) as f32
                    });
                    let h = (lines.len() as u32).saturating_mul(line_advance(size));
                    self.nodes.push(LayoutNode {
                        tag: "#text".to_string(),
                        rect: Rect { x: content_x, y: cursor, width: content_w, height: h },
                        style: style.clone(),
                        kind: NodeKind::Text { lines },
                        parent: Some(idx),
                        leaf_text: None,
                    });
                    cursor = cursor.saturating_add(to_i32(h));
                }
                _ => {}
            }
        }

        let content_h = cursor.saturating_sub(box_y).max(0) as u32;
        let height = explicit_h.unwrap_or(content_h.saturating_add(padding));
        self.nodes[idx].rect.height = height;
        height.saturating_add(margin.saturating_mul(2))
    }
}

/// Lay out a whole document (or fragment) at a fixed viewport width
pub fn layout_html(html: &str, width: u32) -> Layout {
    let document = Html::parse_document(html);
    let body = document
        .root_element()
        .children()
        .filter_map(ElementRef::wrap)
        .find(|e| e.value().name() == "body")
        .unwrap_or_else(|| document.root_element());

    let mut builder = LayoutBuilder { nodes: Vec::new() };
    let root_style = ComputedStyle::default();
    let mut y = 0i32;
    for child in body.children() {
        match child.value() {
            Node::Element(_) => {
                if let Some(el) = ElementRef::wrap(child) {
                    let used = builder.element(el, 0, y, width, &root_style, None);
                    y = y.saturating_add(to_i32(used));
                }
            }
            Node::Text(t) => {
                let collapsed = t.split_whitespace().collect::<Vec<_>>().join(" ");
                if collapsed.is_empty() {
                    continue;
                }
                let size = root_style.font_size;
                let lines = paint::wrap_text(&collapsed, width as f32, |s| paint::measure_text(s, size) as f32);
                let h = (lines.len() as u32).saturating_mul(line_advance(size));
                builder.nodes.push(LayoutNode {
                    tag: "#text".to_string(),
                    rect: Rect { x: 0, y, width, height: h },
                    style: root_style.clone(),
                    kind: NodeKind::Text { lines },
                    parent: None,
                    leaf_text: None,
                });
                y = y.saturating_add(to_i32(h));
            }
            _ => {}
        }
    }

    let content_height = builder
        .nodes
        .iter()
        .map(|n| n.rect.bottom())
        .max()
        .unwrap_or(0)
        .max(y)
        .max(0) as u32;

    Layout {
        nodes: builder.nodes,
        content_height,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_stacks_blocks_and_images() {
        let html = r#"<div style="padding: 10px; background-color: #add8e6">
            <img src="data:image/png;base64,AAAA" style="width: 100px; height: 50px">
            <h1>Teddy</h1>
            <p>Soft toy</p>
        </div>"#;
        let layout = layout_html(html, 400);
        let img = layout
            .nodes
            .iter()
            .find(|n| matches!(n.kind, NodeKind::Image { .. }))
            .unwrap();
        assert_eq!(img.rect, Rect { x: 10, y: 10, width: 100, height: 50 });
        let h1 = layout.nodes.iter().find(|n| n.tag == "h1").unwrap();
        assert!(h1.rect.y >= 60);
        assert!(h1.style.bold);
        assert_eq!(h1.leaf_text.as_deref(), Some("Teddy"));
        let div = &layout.nodes[0];
        assert_eq!(div.style.background, Some((173, 216, 230, 255)));
        assert!(layout.content_height >= div.rect.bottom() as u32);
    }

    #[test]
    fn display_none_and_scripts_are_skipped() {
        let html = r#"<script>alert(1)</script><p style="display:none">hidden</p><p>shown</p>"#;
        let layout = layout_html(html, 200);
        let texts: Vec<_> = layout.nodes.iter().filter_map(|n| n.leaf_text.clone()).collect();
        assert_eq!(texts, vec!["shown".to_string()]);
    }

    #[test]
    fn long_text_wraps_within_width() {
        let html = "<p>one two three four five six seven eight nine ten</p>";
        let layout = layout_html(html, 120);
        let lines = layout
            .nodes
            .iter()
            .find_map(|n| match &n.kind {
                NodeKind::Text { lines } => Some(lines.clone()),
                _ => None,
            })
            .unwrap();
        assert!(lines.len() > 1);
    }

    #[test]
    fn huge_lengths_are_clamped() {
        let layout = layout_html(
            r#"<div style="margin: 3000000000px; padding: 1e30px">x</div><p style="font-size: 99999px">y</p>"#,
            1080,
        );
        let div = &layout.nodes[0];
        assert_eq!(div.rect.x, MAX_LENGTH as i32);
        assert!(layout.content_height >= MAX_LENGTH);
        let p = layout.nodes.iter().find(|n| n.tag == "p").unwrap();
        assert_eq!(p.style.font_size, MAX_FONT_SIZE);
        assert_eq!(parse_length("NaN", 10), Some(0));
        assert_eq!(parse_length("-5px", 10), Some(0));
    }

    #[test]
    fn transparent_background_is_ignored() {
        assert_eq!(parse_color("transparent").map(|c| c.3), Some(0));
        let layout = layout_html(r#"<div style="background: rgba(0,0,0,0)">x</div>"#, 100);
        assert!(layout.nodes[0].style.background.is_none());
    }
}
