use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};
use serde::Deserialize;
use std::time::Duration;

use crate::frame::encode_jpeg;
use crate::plate::{Point, Quad, RecognitionCandidate};
use crate::recognize::Recognizer;

/// OCR service backend.
///
/// Posts the frame as `image/jpeg` and expects
/// `{"results": [{"box": [[x, y], ...], "text": "...", "confidence": 0.9}]}`.
pub struct HttpRecognizer {
    agent: ureq::Agent,
    url: String,
    jpeg_quality: u8,
}

#[derive(Debug, Deserialize)]
struct OcrResponse {
    #[serde(default)]
    results: Vec<OcrSpan>,
}

#[derive(Debug, Deserialize)]
struct OcrSpan {
    #[serde(rename = "box", default)]
    points: Vec<[f32; 2]>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    confidence: f32,
}

impl HttpRecognizer {
    pub fn new(url: &str, timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            url: url.to_string(),
            jpeg_quality: 90,
        }
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }
}

impl Recognizer for HttpRecognizer {
    fn name(&self) -> &'static str {
        "http"
    }

    fn recognize(&mut self, image: &RgbImage) -> Result<Vec<RecognitionCandidate>> {
        let jpeg = encode_jpeg(image, self.jpeg_quality)?;
        let response = match self
            .agent
            .post(&self.url)
            .set("Content-Type", "image/jpeg")
            .send_bytes(&jpeg)
        {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => {
                return Err(anyhow!("OCR service {} answered {}", self.url, code))
            }
            Err(err) => {
                return Err(anyhow::Error::new(err).context(format!("call OCR service {}", self.url)))
            }
        };
        let body = response.into_string().context("read OCR response")?;
        parse_response(&body)
    }

    fn warm_up(&mut self) -> Result<()> {
        let sample = RgbImage::from_pixel(64, 32, Rgb([127, 127, 127]));
        self.recognize(&sample).map(|_| ())
    }
}

fn parse_response(body: &str) -> Result<Vec<RecognitionCandidate>> {
    let response: OcrResponse = serde_json::from_str(body).context("decode OCR response")?;
    Ok(response
        .results
        .into_iter()
        .filter_map(|span| {
            let geometry = quad_from_points(&span.points)?;
            Some(RecognitionCandidate::new(
                geometry,
                span.text,
                span.confidence.clamp(0.0, 1.0),
            ))
        })
        .collect())
}

/// Four points map straight through; any other non-empty set collapses to
/// its bounding rectangle.
fn quad_from_points(points: &[[f32; 2]]) -> Option<Quad> {
    if let [a, b, c, d] = points {
        return Some(Quad([
            Point::new(a[0], a[1]),
            Point::new(b[0], b[1]),
            Point::new(c[0], c[1]),
            Point::new(d[0], d[1]),
        ]));
    }
    let first = points.first()?;
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (first[0], first[1], first[0], first[1]);
    for p in points {
        min_x = min_x.min(p[0]);
        min_y = min_y.min(p[1]);
        max_x = max_x.max(p[0]);
        max_y = max_y.max(p[1]);
    }
    Some(Quad::from_rect(min_x, min_y, max_x - min_x, max_y - min_y))
}
