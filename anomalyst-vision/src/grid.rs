//! Side-by-side image grid.
//!
//! [`ImageGrid`] is a consuming builder: images are appended in display order and
//! [`ImageGrid::generate`] renders them into one row of titled panels. Once
//! generated the builder is gone, so nothing can be appended after rendering.

use image::imageops::{self, FilterType};
use image::{GrayImage, Rgb, RgbImage};

use crate::error::{Result, VisionError};
use crate::font;
use crate::post_process::jet;

/// Side length of one square panel, in pixels.
pub const PANEL_SIZE: u32 = 300;
const TITLE_BAND: u32 = 28;
const MARGIN: u32 = 8;
const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const TITLE_COLOR: Rgb<u8> = Rgb([0, 0, 0]);

/// Color map applied to single-channel panels, with vmin = 0 and vmax = 255.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMap {
    Gray,
    Jet,
}

/// Image content of one panel.
#[derive(Debug, Clone)]
pub enum GridImage {
    Rgb(RgbImage),
    Gray(GrayImage),
}

impl From<RgbImage> for GridImage {
    fn from(image: RgbImage) -> Self {
        GridImage::Rgb(image)
    }
}

impl From<GrayImage> for GridImage {
    fn from(image: GrayImage) -> Self {
        GridImage::Gray(image)
    }
}

impl GridImage {
    fn to_rgb(&self, color_map: Option<ColorMap>) -> RgbImage {
        match self {
            GridImage::Rgb(image) => image.clone(),
            GridImage::Gray(image) => {
                let (w, h) = image.dimensions();
                RgbImage::from_fn(w, h, |x, y| {
                    let v = image.get_pixel(x, y).0[0];
                    match color_map.unwrap_or(ColorMap::Gray) {
                        ColorMap::Gray => Rgb([v, v, v]),
                        ColorMap::Jet => jet(v as f32 / 255.0),
                    }
                })
            }
        }
    }
}

#[derive(Debug, Clone)]
struct GridEntry {
    image: GridImage,
    title: Option<String>,
    color_map: Option<ColorMap>,
}

/// Builder that compiles several images into a single row.
#[derive(Debug, Clone, Default)]
pub struct ImageGrid {
    entries: Vec<GridEntry>,
}

impl ImageGrid {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an image with an optional title and color map.
    #[must_use]
    pub fn add_image(
        mut self,
        image: impl Into<GridImage>,
        title: Option<&str>,
        color_map: Option<ColorMap>,
    ) -> Self {
        self.entries.push(GridEntry {
            image: image.into(),
            title: title.map(str::to_string),
            color_map,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render all panels left to right into a `(PANEL_SIZE * n) x PANEL_SIZE` image.
    pub fn generate(self) -> Result<RgbImage> {
        if self.entries.is_empty() {
            return Err(VisionError::EmptyGrid);
        }
        let cols = self.entries.len() as u32;
        let mut canvas = RgbImage::from_pixel(PANEL_SIZE * cols, PANEL_SIZE, BACKGROUND);
        for (i, entry) in self.entries.iter().enumerate() {
            let panel = render_panel(entry);
            imageops::replace(&mut canvas, &panel, (i as u32 * PANEL_SIZE) as i64, 0);
        }
        Ok(canvas)
    }
}

fn render_panel(entry: &GridEntry) -> RgbImage {
    let mut panel = RgbImage::from_pixel(PANEL_SIZE, PANEL_SIZE, BACKGROUND);

    if let Some(title) = &entry.title {
        let max_width = PANEL_SIZE - 2 * MARGIN;
        let scale = if font::text_width(title, 2) <= max_width {
            2
        } else {
            1
        };
        let text_w = font::text_width(title, scale).min(max_width);
        let x = (PANEL_SIZE - text_w) / 2;
        let y = (TITLE_BAND - font::text_height(scale)) / 2;
        font::draw_text(&mut panel, x, y, title, TITLE_COLOR, scale);
    }

    let rgb = entry.image.to_rgb(entry.color_map);
    let (w, h) = rgb.dimensions();
    if w == 0 || h == 0 {
        return panel;
    }
    let area_w = PANEL_SIZE - 2 * MARGIN;
    let area_h = PANEL_SIZE - TITLE_BAND - MARGIN;
    let scale = (area_w as f32 / w as f32).min(area_h as f32 / h as f32);
    let new_w = ((w as f32 * scale).round() as u32).clamp(1, area_w);
    let new_h = ((h as f32 * scale).round() as u32).clamp(1, area_h);
    let resized = imageops::resize(&rgb, new_w, new_h, FilterType::Triangle);
    let x = MARGIN + (area_w - new_w) / 2;
    let y = TITLE_BAND + (area_h - new_h) / 2;
    imageops::replace(&mut panel, &resized, x as i64, y as i64);
    panel
}
