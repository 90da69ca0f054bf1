#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::plate::{Quad, RecognitionCandidate};
use crate::recognize::Recognizer;

/// Tract-based CTC text-line recognizer.
///
/// Loads a local ONNX recognition model (input `1x3xHxW`, output
/// `1xTxC` class probabilities, class 0 = CTC blank) and a dictionary with
/// one symbol per line. The whole frame is treated as one text line, so
/// this suits cameras framed tightly on the plate. The reported geometry is
/// the full frame.
pub struct TractRecognizer {
    model: TypedRunnableModel<TypedModel>,
    charset: Vec<char>,
    width: u32,
    height: u32,
}

impl TractRecognizer {
    /// Load the model and dictionary and prepare the model for inference.
    pub fn new<P: AsRef<Path>, D: AsRef<Path>>(
        model_path: P,
        dict_path: D,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        let dict_path = dict_path.as_ref();
        let dict = std::fs::read_to_string(dict_path)
            .with_context(|| format!("failed to read dictionary {}", dict_path.display()))?;
        let charset = parse_dictionary(&dict);
        if charset.is_empty() {
            return Err(anyhow!("dictionary {} is empty", dict_path.display()));
        }

        Ok(Self {
            model,
            charset,
            width,
            height,
        })
    }

    fn build_input(&self, image: &RgbImage) -> Tensor {
        let resized = image::imageops::resize(image, self.width, self.height, FilterType::Triangle);
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, channel, y, x)| {
                let value = resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0;
                (value - 0.5) / 0.5
            },
        );
        input.into_tensor()
    }
}

impl Recognizer for TractRecognizer {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn recognize(&mut self, image: &RgbImage) -> Result<Vec<RecognitionCandidate>> {
        let input = self.build_input(image);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let scores = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = scores.shape();
        if shape.len() != 3 {
            return Err(anyhow!("expected 1xTxC output, got shape {:?}", shape));
        }
        let (steps, classes) = (shape[1], shape[2]);
        let flat: Vec<f32> = scores.iter().copied().collect();
        let Some((text, confidence)) = ctc_greedy_decode(&flat, steps, classes, &self.charset)
        else {
            return Ok(Vec::new());
        };
        let geometry = Quad::from_rect(0.0, 0.0, image.width() as f32, image.height() as f32);
        Ok(vec![RecognitionCandidate::new(geometry, text, confidence)])
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = RgbImage::new(self.width, self.height);
        self.recognize(&blank).map(|_| ())
    }
}

fn parse_dictionary(raw: &str) -> Vec<char> {
    raw.lines()
        .filter_map(|line| line.trim_end_matches('\r').chars().next())
        .collect()
}

/// Greedy CTC decode of a row-major `steps x classes` score matrix.
///
/// Collapses repeats, drops blanks (class 0), maps class `i` to
/// `charset[i - 1]`. Confidence is the mean winning score of the kept
/// symbols. `None` when nothing survives.
fn ctc_greedy_decode(
    scores: &[f32],
    steps: usize,
    classes: usize,
    charset: &[char],
) -> Option<(String, f32)> {
    if classes == 0 || scores.len() < steps * classes {
        return None;
    }
    let mut text = String::new();
    let mut kept = Vec::new();
    let mut previous = 0usize;
    for step in scores.chunks(classes).take(steps) {
        let (index, score) = step
            .iter()
            .copied()
            .enumerate()
            .fold((0usize, f32::NEG_INFINITY), |best, (i, s)| {
                if s > best.1 {
                    (i, s)
                } else {
                    best
                }
            });
        if index != 0 && index != previous {
            if let Some(symbol) = charset.get(index - 1) {
                text.push(*symbol);
                kept.push(score);
            }
        }
        previous = index;
    }
    if kept.is_empty() {
        return None;
    }
    let confidence = kept.iter().sum::<f32>() / kept.len() as f32;
    Some((text, confidence.clamp(0.0, 1.0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_hot(index: usize, classes: usize, score: f32) -> Vec<f32> {
        let mut row = vec![0.0; classes];
        row[index] = score;
        row
    }

    #[test]
    fn decode_collapses_repeats_and_blanks() {
        let charset: Vec<char> = "0123456789ABC".chars().collect();
        let classes = charset.len() + 1;
        // "1", "1", blank, "1", "A", "A"  ->  "11A"
        let steps = [2, 2, 0, 2, 11, 11];
        let scores: Vec<f32> = steps
            .iter()
            .flat_map(|&i| one_hot(i, classes, 0.8))
            .collect();
        let (text, confidence) =
            ctc_greedy_decode(&scores, steps.len(), classes, &charset).expect("decoded");
        assert_eq!(text, "11A");
        assert!((confidence - 0.8).abs() < 1e-6);
    }

    #[test]
    fn all_blank_decodes_to_nothing() {
        let charset = vec!['A'];
        let scores: Vec<f32> = (0..4).flat_map(|_| one_hot(0, 2, 0.9)).collect();
        assert!(ctc_greedy_decode(&scores, 4, 2, &charset).is_none());
    }

    #[test]
    fn dictionary_takes_first_symbol_per_line() {
        assert_eq!(parse_dictionary("0\r\n1\nA\n\n"), vec!['0', '1', 'A']);
    }
}
