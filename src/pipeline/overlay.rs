//! Overlay drawing on rendered frames.

use ab_glyph::{FontArc, PxScale};
use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_line_segment_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::path::{Path, PathBuf};

use crate::plate::Quad;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const LABEL_TEXT: Rgb<u8> = Rgb([0, 0, 0]);
const NO_PLATE_COLOR: Rgb<u8> = Rgb([220, 30, 30]);
const BANNER_HEIGHT: u32 = 28;
const LABEL_SCALE: f32 = 20.0;

const SYSTEM_FONTS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/Library/Fonts/Arial.ttf",
];

/// What the overlay shows for one cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverlayKind {
    /// Box and label for a plate recognised this cycle.
    Fresh,
    /// Box and label reused from an unexpired cached detection.
    Cached,
    /// "No plate detected" banner.
    NoPlate,
}

/// Draws boxes, labels and banners. Text is skipped when no font is
/// available; boxes and banners are always drawn.
pub struct OverlayRenderer {
    font: Option<FontArc>,
    scale: PxScale,
}

impl OverlayRenderer {
    pub fn new(font: Option<FontArc>) -> Self {
        Self {
            font,
            scale: PxScale::from(LABEL_SCALE),
        }
    }

    /// Renderer using `path`, or the first readable system font.
    pub fn with_font_path(path: Option<&Path>) -> Self {
        let font = match path {
            Some(path) => match load_font(path) {
                Ok(font) => Some(font),
                Err(err) => {
                    log::warn!("overlay: {:#}; falling back to system fonts", err);
                    find_system_font()
                }
            },
            None => find_system_font(),
        };
        if font.is_none() {
            log::warn!("overlay: no usable font found, labels will not be drawn");
        }
        Self::new(font)
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Quad outline plus a filled label tab above it.
    pub fn draw_detection(&self, image: &mut RgbImage, geometry: &Quad, label: &str) {
        let corners = geometry.0;
        for i in 0..corners.len() {
            let a = corners[i];
            let b = corners[(i + 1) % corners.len()];
            // Two-pixel stroke.
            for offset in [0.0_f32, 1.0] {
                draw_line_segment_mut(
                    image,
                    (a.x + offset, a.y + offset),
                    (b.x + offset, b.y + offset),
                    BOX_COLOR,
                );
            }
        }

        let (min_x, min_y, _, _) = geometry.bounds();
        let Some(font) = &self.font else {
            return;
        };
        let (text_w, text_h) = text_size(self.scale, font, label);
        let tab_h = text_h + 6;
        let x = min_x.max(0.0) as i32;
        let y = (min_y as i32 - tab_h as i32).max(0);
        draw_filled_rect_mut(image, Rect::at(x, y).of_size(text_w + 8, tab_h), BOX_COLOR);
        draw_text_mut(image, LABEL_TEXT, x + 4, y + 3, self.scale, font, label);
    }

    /// Banner across the top of the frame.
    pub fn draw_no_plate(&self, image: &mut RgbImage) {
        let width = image.width().max(1);
        let height = BANNER_HEIGHT.min(image.height()).max(1);
        draw_filled_rect_mut(image, Rect::at(0, 0).of_size(width, height), NO_PLATE_COLOR);
        if let Some(font) = &self.font {
            draw_text_mut(
                image,
                Rgb([255, 255, 255]),
                8,
                4,
                self.scale,
                font,
                "No plate detected",
            );
        }
    }
}

/// Label text shown beside a detection box.
pub fn detection_label(plate: &str, confidence: f32) -> String {
    format!("{} {:.2}", plate, confidence)
}

fn load_font(path: &Path) -> Result<FontArc> {
    let bytes = std::fs::read(path).with_context(|| format!("read font {}", path.display()))?;
    FontArc::try_from_vec(bytes).map_err(|_| anyhow!("invalid font file {}", path.display()))
}

fn find_system_font() -> Option<FontArc> {
    SYSTEM_FONTS
        .iter()
        .map(PathBuf::from)
        .filter(|path| path.is_file())
        .find_map(|path| load_font(&path).ok())
}
