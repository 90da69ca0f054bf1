//! Text recognition adapter.
//!
//! The recognition engine is an external capability: given an image it
//! returns text spans with geometry and confidence. Backends implement
//! `Recognizer`; the rest of the crate only sees `SharedRecognizer`, which
//! serialises calls so one engine instance never runs concurrently with
//! itself (the live pipeline and one-shot detection share it).

pub mod backends;

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::plate::RecognitionCandidate;

pub use backends::{HttpRecognizer, ScriptedRecognizer};
#[cfg(feature = "backend-tract")]
pub use backends::TractRecognizer;

/// Recognition backend.
///
/// Implementations may hold expensive state (model sessions, HTTP agents)
/// across calls. A returned error is a transient failure for that call.
pub trait Recognizer: Send {
    fn name(&self) -> &'static str;

    /// Text spans found in `image`, in recognizer order. May be empty.
    fn recognize(&mut self, image: &RgbImage) -> Result<Vec<RecognitionCandidate>>;

    /// Startup check. An error here means the process cannot run.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Cloneable, lock-serialised handle to one recognizer.
#[derive(Clone)]
pub struct SharedRecognizer {
    name: &'static str,
    inner: Arc<Mutex<Box<dyn Recognizer>>>,
}

impl SharedRecognizer {
    pub fn new<R: Recognizer + 'static>(recognizer: R) -> Self {
        Self {
            name: recognizer.name(),
            inner: Arc::new(Mutex::new(Box::new(recognizer))),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn recognize(&self, image: &RgbImage) -> Result<Vec<RecognitionCandidate>> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| anyhow!("recognizer lock poisoned"))?;
        guard.recognize(image)
    }
}

impl std::fmt::Debug for SharedRecognizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRecognizer")
            .field("name", &self.name)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RecognizerBackend {
    /// External OCR service over HTTP.
    Http,
    /// Local ONNX text-line model (feature `backend-tract`).
    Tract,
    /// Scripted results; finds nothing unless scripted.
    Stub,
}

impl std::str::FromStr for RecognizerBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "tract" => Ok(Self::Tract),
            "stub" => Ok(Self::Stub),
            other => Err(anyhow!(
                "unknown recognizer backend '{}'; expected http, tract or stub",
                other
            )),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RecognizerSettings {
    pub backend: RecognizerBackend,
    /// OCR service endpoint (`http`).
    pub url: String,
    pub timeout: Duration,
    /// JPEG quality used when shipping frames to the service.
    pub jpeg_quality: u8,
    /// ONNX model path (`tract`).
    pub model_path: Option<PathBuf>,
    /// Character dictionary, one symbol per line (`tract`).
    pub dict_path: Option<PathBuf>,
    pub input_width: u32,
    pub input_height: u32,
}

impl Default for RecognizerSettings {
    fn default() -> Self {
        Self {
            backend: RecognizerBackend::Http,
            url: "http://127.0.0.1:8868/ocr".to_string(),
            timeout: Duration::from_secs(5),
            jpeg_quality: 90,
            model_path: None,
            dict_path: None,
            input_width: 320,
            input_height: 48,
        }
    }
}

/// Build and warm up the configured backend. Errors are fatal at startup.
pub fn build_recognizer(settings: &RecognizerSettings) -> Result<SharedRecognizer> {
    let shared = match settings.backend {
        RecognizerBackend::Http => {
            let mut backend = HttpRecognizer::new(&settings.url, settings.timeout)
                .with_jpeg_quality(settings.jpeg_quality);
            backend
                .warm_up()
                .with_context(|| format!("OCR service at {} is not usable", settings.url))?;
            SharedRecognizer::new(backend)
        }
        RecognizerBackend::Tract => build_tract(settings)?,
        RecognizerBackend::Stub => {
            log::warn!("recognizer: stub backend selected, no plates will be recognized");
            SharedRecognizer::new(ScriptedRecognizer::new())
        }
    };
    log::info!("recognizer: {} ready", shared.name());
    Ok(shared)
}

#[cfg(feature = "backend-tract")]
fn build_tract(settings: &RecognizerSettings) -> Result<SharedRecognizer> {
    let model_path = settings
        .model_path
        .as_ref()
        .ok_or_else(|| anyhow!("tract recognizer requires model_path"))?;
    let dict_path = settings
        .dict_path
        .as_ref()
        .ok_or_else(|| anyhow!("tract recognizer requires dict_path"))?;
    let mut backend = TractRecognizer::new(
        model_path,
        dict_path,
        settings.input_width,
        settings.input_height,
    )?;
    backend.warm_up()?;
    Ok(SharedRecognizer::new(backend))
}

#[cfg(not(feature = "backend-tract"))]
fn build_tract(_settings: &RecognizerSettings) -> Result<SharedRecognizer> {
    Err(anyhow!(
        "tract recognizer requested but the crate was built without the backend-tract feature"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plate::Quad;

    #[test]
    fn shared_recognizer_forwards_and_reports_failures() {
        let mut scripted = ScriptedRecognizer::new();
        scripted.push_result(vec![RecognitionCandidate::new(
            Quad::from_rect(0.0, 0.0, 4.0, 2.0),
            "1234ABC",
            0.9,
        )]);
        scripted.push_failure("engine offline");
        let shared = SharedRecognizer::new(scripted);
        let image = RgbImage::new(8, 8);

        assert_eq!(shared.recognize(&image).unwrap().len(), 1);
        assert!(shared.recognize(&image).is_err());
        assert!(shared.recognize(&image).unwrap().is_empty());
        assert_eq!(shared.name(), "stub");
    }

    #[test]
    fn backend_names_parse() {
        assert_eq!("HTTP".parse::<RecognizerBackend>().unwrap(), RecognizerBackend::Http);
        assert_eq!(" stub ".parse::<RecognizerBackend>().unwrap(), RecognizerBackend::Stub);
        assert!("paddle".parse::<RecognizerBackend>().is_err());
    }

    #[cfg(not(feature = "backend-tract"))]
    #[test]
    fn tract_without_feature_is_fatal() {
        let settings = RecognizerSettings {
            backend: RecognizerBackend::Tract,
            ..RecognizerSettings::default()
        };
        assert!(build_recognizer(&settings).is_err());
    }
}
