//! One-shot plate detection against a single uploaded image.
//!
//! Independent of the live pipeline, but shares its recognizer handle and
//! uses the same candidate filter.

use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::decode_image;
use crate::plate::select_best;
use crate::recognize::SharedRecognizer;
use crate::registry::PlateRegistry;

/// `{plate, confidence, authorized}` as sent to API callers and observers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlateDetection {
    pub plate: String,
    pub confidence: f32,
    pub authorized: bool,
}

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("No image provided")]
    NoImage,
    #[error("Invalid image: {0}")]
    InvalidImage(String),
    #[error("No valid plate found")]
    NoValidPlate,
    #[error("Recognition failed: {0}")]
    Recognition(String),
}

/// Decode `bytes` and detect the best plate in it.
pub fn detect_plate(
    recognizer: &SharedRecognizer,
    registry: &PlateRegistry,
    bytes: &[u8],
) -> Result<PlateDetection, DetectError> {
    if bytes.is_empty() {
        return Err(DetectError::NoImage);
    }
    let image = decode_image(bytes).map_err(|err| DetectError::InvalidImage(format!("{:#}", err)))?;
    detect_in_image(recognizer, registry, &image)
}

pub fn detect_in_image(
    recognizer: &SharedRecognizer,
    registry: &PlateRegistry,
    image: &RgbImage,
) -> Result<PlateDetection, DetectError> {
    let candidates = recognizer
        .recognize(image)
        .map_err(|err| DetectError::Recognition(format!("{:#}", err)))?;
    let best = select_best(&candidates).ok_or(DetectError::NoValidPlate)?;
    let authorized = registry.is_authorized(&best.plate);
    log::info!(
        "detect: {} ({:.2}) authorized={}",
        best.plate,
        best.confidence,
        authorized
    );
    Ok(PlateDetection {
        plate: best.plate,
        confidence: best.confidence,
        authorized,
    })
}
