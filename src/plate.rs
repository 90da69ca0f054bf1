//! Plate text filtering.
//!
//! Recognition produces free-form text spans. This module reduces them to
//! plate candidates:
//!
//! - `normalize`: keep ASCII letters and digits only, uppercased
//! - `validate`: exact match against the plate grammar (4 digits, 3 letters)
//! - `select_best`: highest-confidence span that passes `validate`
//!
//! Both the live pipeline and one-shot detection go through `select_best`.

use serde::Serialize;
use std::sync::OnceLock;

/// Plate grammar applied to normalized text.
pub const PLATE_PATTERN: &str = r"^[0-9]{4}[A-Z]{3}$";

/// A point in image pixel coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Four-corner polygon around a recognized text span.
///
/// Corner order follows the recognizer (typically clockwise from top-left);
/// nothing here depends on it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct Quad(pub [Point; 4]);

impl Quad {
    /// Axis-aligned rectangle as a quad.
    pub fn from_rect(x: f32, y: f32, width: f32, height: f32) -> Self {
        Quad([
            Point::new(x, y),
            Point::new(x + width, y),
            Point::new(x + width, y + height),
            Point::new(x, y + height),
        ])
    }

    /// Bounding box as `(min_x, min_y, max_x, max_y)`.
    pub fn bounds(&self) -> (f32, f32, f32, f32) {
        let mut min_x = f32::INFINITY;
        let mut min_y = f32::INFINITY;
        let mut max_x = f32::NEG_INFINITY;
        let mut max_y = f32::NEG_INFINITY;
        for p in &self.0 {
            min_x = min_x.min(p.x);
            min_y = min_y.min(p.y);
            max_x = max_x.max(p.x);
            max_y = max_y.max(p.y);
        }
        (min_x, min_y, max_x, max_y)
    }
}

/// One text span returned by a recognizer.
#[derive(Clone, Debug, PartialEq)]
pub struct RecognitionCandidate {
    pub geometry: Quad,
    pub raw_text: String,
    /// Recognizer confidence in `[0, 1]`.
    pub confidence: f32,
}

impl RecognitionCandidate {
    pub fn new(geometry: Quad, raw_text: impl Into<String>, confidence: f32) -> Self {
        Self {
            geometry,
            raw_text: raw_text.into(),
            confidence,
        }
    }
}

/// A span whose normalized text satisfies the plate grammar.
#[derive(Clone, Debug, PartialEq)]
pub struct PlateCandidate {
    pub geometry: Quad,
    pub plate: String,
    pub confidence: f32,
}

/// Strip everything outside `[A-Za-z0-9]` and uppercase the rest.
pub fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// True when `normalized` is exactly a plate (no substring matches).
pub fn validate(normalized: &str) -> bool {
    static PLATE_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = PLATE_RE.get_or_init(|| regex::Regex::new(PLATE_PATTERN).unwrap());
    re.is_match(normalized)
}

/// Pick the highest-confidence span whose normalized text is a valid plate.
///
/// Ties keep the earliest span. `None` is the ordinary "nothing plate-like
/// in this image" outcome.
pub fn select_best<'a, I>(candidates: I) -> Option<PlateCandidate>
where
    I: IntoIterator<Item = &'a RecognitionCandidate>,
{
    let mut best: Option<PlateCandidate> = None;
    for candidate in candidates {
        let plate = normalize(&candidate.raw_text);
        if !validate(&plate) {
            continue;
        }
        let better = match &best {
            Some(current) => candidate.confidence > current.confidence,
            None => true,
        };
        if better {
            best = Some(PlateCandidate {
                geometry: candidate.geometry,
                plate,
                confidence: candidate.confidence,
            });
        }
    }
    best
}
