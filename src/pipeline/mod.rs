//! Real-time detection loop.
//!
//! One cycle:
//! 1. pull a frame from the active source (miss: report an idle sleep);
//! 2. run recognition when the OCR interval has elapsed since the last
//!    attempt, recording the attempt time whatever the outcome;
//! 3. a fresh candidate updates the cache, is drawn, looked up in the
//!    registry and emitted as `plate_detected`;
//! 4. otherwise an unexpired cached detection is drawn without a registry
//!    lookup or event;
//! 5. otherwise a "no plate detected" banner is drawn;
//! 6. the rendered frame is JPEG-encoded and emitted as `frame`.
//!
//! All loop state (cache, last OCR time) lives in `Pipeline`. Time is passed
//! into `run_cycle` so tests control the clock.

mod cache;
mod overlay;

pub use cache::{CachedDetection, DetectionCache};
pub use overlay::{detection_label, OverlayKind, OverlayRenderer};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::broadcast::{BroadcastEvent, Broadcaster, FrameImage};
use crate::detect::PlateDetection;
use crate::frame::{encode_jpeg, FrameSource};
use crate::plate::{select_best, PlateCandidate};
use crate::recognize::SharedRecognizer;
use crate::registry::PlateRegistry;

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    /// Minimum time between recognition attempts.
    pub ocr_interval: Duration,
    /// How long a cached detection keeps being drawn.
    pub detection_ttl: Duration,
    /// Sleep between rendered frames.
    pub frame_interval: Duration,
    /// JPEG quality of emitted frames.
    pub jpeg_quality: u8,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            ocr_interval: Duration::from_millis(500),
            detection_ttl: Duration::from_millis(1500),
            frame_interval: Duration::from_millis(30),
            jpeg_quality: 80,
        }
    }
}

/// What one cycle did.
#[derive(Clone, Debug, PartialEq)]
pub struct CycleReport {
    pub overlay: OverlayKind,
    /// Present only when a fresh candidate was accepted this cycle.
    pub detection: Option<PlateDetection>,
    pub ocr_attempted: bool,
    /// Whether the `frame` event could be produced.
    pub frame_emitted: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CycleOutcome {
    /// No frame available; sleep this long before retrying.
    Idle(Duration),
    Rendered(CycleReport),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub cycles: u64,
    pub idle_cycles: u64,
    pub ocr_attempts: u64,
    pub ocr_failures: u64,
    pub detections: u64,
}

pub struct Pipeline {
    source: Box<dyn FrameSource>,
    recognizer: SharedRecognizer,
    registry: Arc<PlateRegistry>,
    broadcaster: Broadcaster,
    renderer: OverlayRenderer,
    settings: PipelineSettings,
    cache: DetectionCache,
    last_ocr: Option<Instant>,
    stats: PipelineStats,
}

impl Pipeline {
    pub fn new(
        source: Box<dyn FrameSource>,
        recognizer: SharedRecognizer,
        registry: Arc<PlateRegistry>,
        broadcaster: Broadcaster,
        renderer: OverlayRenderer,
        settings: PipelineSettings,
    ) -> Self {
        let cache = DetectionCache::new(settings.detection_ttl);
        Self {
            source,
            recognizer,
            registry,
            broadcaster,
            renderer,
            settings,
            cache,
            last_ocr: None,
            stats: PipelineStats::default(),
        }
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn cache(&self) -> &DetectionCache {
        &self.cache
    }

    /// Run one detection cycle at time `now`.
    pub fn run_cycle(&mut self, now: Instant) -> CycleOutcome {
        let Some(frame) = self.source.next_frame() else {
            self.stats.idle_cycles += 1;
            return CycleOutcome::Idle(self.source.idle_interval());
        };
        self.stats.cycles += 1;

        let ocr_due = self
            .last_ocr
            .map_or(true, |last| now.saturating_duration_since(last) > self.settings.ocr_interval);
        let fresh = if ocr_due {
            self.last_ocr = Some(now);
            self.recognize(&frame.image)
        } else {
            None
        };

        let mut canvas = frame.image.clone();
        let mut detection = None;
        let overlay = if let Some(candidate) = fresh {
            self.cache.store(&candidate, now);
            self.renderer.draw_detection(
                &mut canvas,
                &candidate.geometry,
                &detection_label(&candidate.plate, candidate.confidence),
            );
            let authorized = self.registry.is_authorized(&candidate.plate);
            let event = PlateDetection {
                plate: candidate.plate,
                confidence: candidate.confidence,
                authorized,
            };
            log::info!(
                "pipeline: plate {} ({:.2}) authorized={}",
                event.plate,
                event.confidence,
                event.authorized
            );
            self.stats.detections += 1;
            self.broadcaster
                .publish(BroadcastEvent::PlateDetected(event.clone()));
            detection = Some(event);
            OverlayKind::Fresh
        } else if let Some(cached) = self.cache.current(now) {
            log::debug!("pipeline: drawing cached {}", cached.plate);
            self.renderer.draw_detection(
                &mut canvas,
                &cached.geometry,
                &detection_label(&cached.plate, cached.confidence),
            );
            OverlayKind::Cached
        } else {
            self.renderer.draw_no_plate(&mut canvas);
            OverlayKind::NoPlate
        };

        let frame_emitted = match encode_jpeg(&canvas, self.settings.jpeg_quality) {
            Ok(jpeg) => {
                self.broadcaster.publish(BroadcastEvent::Frame(FrameImage {
                    image: STANDARD.encode(jpeg),
                }));
                true
            }
            Err(err) => {
                log::warn!("pipeline: frame encode failed: {:#}", err);
                false
            }
        };

        CycleOutcome::Rendered(CycleReport {
            overlay,
            detection,
            ocr_attempted: ocr_due,
            frame_emitted,
        })
    }

    /// Loop until `stop` is set, then release the frame source.
    pub fn run(&mut self, stop: &AtomicBool) -> PipelineStats {
        log::info!(
            "pipeline: running on {} source with {} recognizer",
            self.source.name(),
            self.recognizer.name()
        );
        while !stop.load(Ordering::SeqCst) {
            let pause = match self.run_cycle(Instant::now()) {
                CycleOutcome::Idle(pause) => pause,
                CycleOutcome::Rendered(_) => self.settings.frame_interval,
            };
            std::thread::sleep(pause);
        }
        self.source.release();
        log::info!(
            "pipeline: stopped after {} cycles, {} detections",
            self.stats.cycles,
            self.stats.detections
        );
        self.stats
    }

    /// Recognition failures count as "no candidate" for this cycle.
    fn recognize(&mut self, image: &image::RgbImage) -> Option<PlateCandidate> {
        self.stats.ocr_attempts += 1;
        match self.recognizer.recognize(image) {
            Ok(candidates) => {
                let best = select_best(&candidates);
                log::debug!(
                    "pipeline: ocr returned {} spans, plate={:?}",
                    candidates.len(),
                    best.as_ref().map(|c| c.plate.as_str())
                );
                best
            }
            Err(err) => {
                self.stats.ocr_failures += 1;
                log::warn!("pipeline: recognition failed: {:#}", err);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::plate::{Quad, RecognitionCandidate};
    use crate::recognize::ScriptedRecognizer;
    use crate::registry::{PlateRecord, PlateStore};
    use image::RgbImage;
    use std::sync::Mutex;

    struct StaticSource {
        frames: u32,
    }

    impl FrameSource for StaticSource {
        fn name(&self) -> &'static str {
            "static"
        }

        fn next_frame(&mut self) -> Option<Arc<Frame>> {
            if self.frames == 0 {
                return None;
            }
            self.frames -= 1;
            Some(Arc::new(Frame::new(RgbImage::new(64, 48))))
        }

        fn idle_interval(&self) -> Duration {
            Duration::from_millis(7)
        }
    }

    struct VecStore(Mutex<Vec<PlateRecord>>);

    impl PlateStore for VecStore {
        fn load(&self) -> anyhow::Result<Vec<PlateRecord>> {
            Ok(self.0.lock().unwrap().clone())
        }

        fn save(&self, records: &[PlateRecord]) -> anyhow::Result<()> {
            *self.0.lock().unwrap() = records.to_vec();
            Ok(())
        }
    }

    fn pipeline(frames: u32, recognizer: ScriptedRecognizer) -> (Pipeline, Broadcaster) {
        let broadcaster = Broadcaster::new(64);
        let registry = PlateRegistry::with_store(VecStore(Mutex::new(vec![])));
        let pipeline = Pipeline::new(
            Box::new(StaticSource { frames }),
            SharedRecognizer::new(recognizer),
            Arc::new(registry),
            broadcaster.clone(),
            OverlayRenderer::new(None),
            PipelineSettings::default(),
        );
        (pipeline, broadcaster)
    }

    fn rendered(outcome: CycleOutcome) -> CycleReport {
        match outcome {
            CycleOutcome::Rendered(report) => report,
            CycleOutcome::Idle(_) => panic!("expected a rendered cycle"),
        }
    }

    #[test]
    fn missing_frame_reports_source_idle_interval() {
        let (mut pipeline, _) = pipeline(0, ScriptedRecognizer::new());
        assert_eq!(
            pipeline.run_cycle(Instant::now()),
            CycleOutcome::Idle(Duration::from_millis(7))
        );
        assert_eq!(pipeline.stats().idle_cycles, 1);
    }

    #[test]
    fn ocr_runs_only_after_interval_elapses() {
        let (mut pipeline, _) = pipeline(10, ScriptedRecognizer::new());
        let t0 = Instant::now();
        assert!(rendered(pipeline.run_cycle(t0)).ocr_attempted);
        assert!(!rendered(pipeline.run_cycle(t0 + Duration::from_millis(200))).ocr_attempted);
        assert!(!rendered(pipeline.run_cycle(t0 + Duration::from_millis(500))).ocr_attempted);
        assert!(rendered(pipeline.run_cycle(t0 + Duration::from_millis(501))).ocr_attempted);
        assert_eq!(pipeline.stats().ocr_attempts, 2);
    }

    #[test]
    fn recognition_failure_is_treated_as_no_candidate() {
        let mut scripted = ScriptedRecognizer::new();
        scripted.push_failure("engine busy");
        let (mut pipeline, _) = pipeline(1, scripted);
        let report = rendered(pipeline.run_cycle(Instant::now()));
        assert_eq!(report.overlay, OverlayKind::NoPlate);
        assert!(report.ocr_attempted);
        assert_eq!(pipeline.stats().ocr_failures, 1);
    }

    #[test]
    fn every_cycle_emits_a_frame_event() {
        let scripted = ScriptedRecognizer::new().with_result(vec![RecognitionCandidate::new(
            Quad::from_rect(5.0, 10.0, 30.0, 12.0),
            "1234ABC",
            0.9,
        )]);
        let (mut pipeline, broadcaster) = pipeline(3, scripted);
        let sub = broadcaster.subscribe();
        let t0 = Instant::now();
        for ms in [0, 30, 60] {
            rendered(pipeline.run_cycle(t0 + Duration::from_millis(ms)));
        }

        let names: Vec<&str> = std::iter::from_fn(|| sub.try_recv())
            .map(|event| event.name())
            .collect();
        assert_eq!(
            names,
            vec!["plate_detected", "frame", "frame", "frame"]
        );
    }
}
