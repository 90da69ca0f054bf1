use anyhow::{anyhow, Result};
use image::RgbImage;
use std::collections::VecDeque;

use crate::plate::RecognitionCandidate;
use crate::recognize::Recognizer;

/// Stub backend for tests and dry runs.
///
/// Replays queued outcomes one call at a time, then returns no spans.
#[derive(Debug, Default)]
pub struct ScriptedRecognizer {
    script: VecDeque<Result<Vec<RecognitionCandidate>, String>>,
    calls: u64,
}

impl ScriptedRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the spans returned by the next unscripted call.
    pub fn push_result(&mut self, spans: Vec<RecognitionCandidate>) {
        self.script.push_back(Ok(spans));
    }

    /// Queue a transient failure.
    pub fn push_failure(&mut self, message: &str) {
        self.script.push_back(Err(message.to_string()));
    }

    pub fn with_result(mut self, spans: Vec<RecognitionCandidate>) -> Self {
        self.push_result(spans);
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl Recognizer for ScriptedRecognizer {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn recognize(&mut self, _image: &RgbImage) -> Result<Vec<RecognitionCandidate>> {
        self.calls += 1;
        match self.script.pop_front() {
            Some(Ok(spans)) => Ok(spans),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(Vec::new()),
        }
    }
}
