use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::{Rgb, RgbImage};
use tempfile::TempDir;

use plate_sentry::broadcast::{BroadcastEvent, Broadcaster};
use plate_sentry::frame::{decode_image, encode_jpeg, Frame, FrameSource};
use plate_sentry::ingest::{RemoteSnapshot, SnapshotConfig, SnapshotFetch};
use plate_sentry::pipeline::{
    CycleOutcome, CycleReport, OverlayKind, OverlayRenderer, Pipeline, PipelineSettings,
};
use plate_sentry::plate::{Quad, RecognitionCandidate};
use plate_sentry::recognize::{ScriptedRecognizer, SharedRecognizer};
use plate_sentry::registry::PlateRegistry;

/// Always has a frame.
struct SteadyCamera;

impl FrameSource for SteadyCamera {
    fn name(&self) -> &'static str {
        "steady"
    }

    fn next_frame(&mut self) -> Option<Arc<Frame>> {
        Some(Arc::new(Frame::new(RgbImage::from_pixel(
            160,
            120,
            Rgb([20, 20, 20]),
        ))))
    }

    fn idle_interval(&self) -> Duration {
        Duration::from_millis(10)
    }
}

fn plate_span(text: &str, confidence: f32) -> RecognitionCandidate {
    RecognitionCandidate::new(Quad::from_rect(40.0, 50.0, 80.0, 20.0), text, confidence)
}

fn pipeline_with(
    recognizer: ScriptedRecognizer,
    registry: Arc<PlateRegistry>,
    broadcaster: &Broadcaster,
) -> Pipeline {
    Pipeline::new(
        Box::new(SteadyCamera),
        SharedRecognizer::new(recognizer),
        registry,
        broadcaster.clone(),
        OverlayRenderer::new(None),
        PipelineSettings::default(),
    )
}

fn rendered(outcome: CycleOutcome) -> CycleReport {
    match outcome {
        CycleOutcome::Rendered(report) => report,
        CycleOutcome::Idle(pause) => panic!("unexpected idle cycle ({:?})", pause),
    }
}

fn drain(sub: &plate_sentry::broadcast::Subscription) -> Vec<Arc<BroadcastEvent>> {
    std::iter::from_fn(|| sub.try_recv()).collect()
}

#[test]
fn cached_detection_suppresses_flicker_until_ttl() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(PlateRegistry::open(dir.path().join("plates.csv")));
    let broadcaster = Broadcaster::new(64);
    let sub = broadcaster.subscribe();

    // Cycle 1 finds a plate; every later recognition finds nothing.
    let scripted = ScriptedRecognizer::new().with_result(vec![plate_span("1234 ABC", 0.91)]);
    let mut pipeline = pipeline_with(scripted, registry, &broadcaster);

    let t0 = Instant::now();
    let cycle1 = rendered(pipeline.run_cycle(t0));
    let cycle2 = rendered(pipeline.run_cycle(t0 + Duration::from_millis(600)));
    let cycle3 = rendered(pipeline.run_cycle(t0 + Duration::from_millis(1200)));
    let cycle4 = rendered(pipeline.run_cycle(t0 + Duration::from_millis(1800)));

    assert_eq!(cycle1.overlay, OverlayKind::Fresh);
    assert_eq!(cycle2.overlay, OverlayKind::Cached);
    assert_eq!(cycle3.overlay, OverlayKind::Cached);
    assert_eq!(cycle4.overlay, OverlayKind::NoPlate);
    for cycle in [&cycle1, &cycle2, &cycle3, &cycle4] {
        assert!(cycle.ocr_attempted);
        assert!(cycle.frame_emitted);
    }
    assert!(cycle1.detection.is_some());
    assert!(cycle2.detection.is_none() && cycle3.detection.is_none());

    // One detection event, four frames.
    let events = drain(&sub);
    let names: Vec<&str> = events.iter().map(|e| e.name()).collect();
    assert_eq!(
        names,
        vec!["plate_detected", "frame", "frame", "frame", "frame"]
    );
}

#[test]
fn rendered_frames_carry_the_overlay() -> Result<()> {
    let dir = TempDir::new()?;
    let registry = Arc::new(PlateRegistry::open(dir.path().join("plates.csv")));
    let broadcaster = Broadcaster::new(64);
    let sub = broadcaster.subscribe();
    let scripted = ScriptedRecognizer::new().with_result(vec![plate_span("1234ABC", 0.9)]);
    let mut pipeline = pipeline_with(scripted, registry, &broadcaster);

    let t0 = Instant::now();
    rendered(pipeline.run_cycle(t0));
    rendered(pipeline.run_cycle(t0 + Duration::from_secs(5)));

    let frames: Vec<RgbImage> = drain(&sub)
        .iter()
        .filter_map(|event| match event.as_ref() {
            BroadcastEvent::Frame(frame) => Some(frame.image.clone()),
            _ => None,
        })
        .map(|b64| decode_image(&STANDARD.decode(b64).unwrap()).unwrap())
        .collect();
    assert_eq!(frames.len(), 2);

    // Box edge is drawn green on the fresh frame.
    let edge = frames[0].get_pixel(80, 50);
    assert!(edge[1] as i32 > edge[0] as i32 + 60, "edge pixel {:?}", edge);

    // The expired frame shows the red banner instead.
    let banner = frames[1].get_pixel(5, 5);
    assert!(banner[0] as i32 > banner[1] as i32 + 60, "banner pixel {:?}", banner);
    Ok(())
}

#[test]
fn authorization_is_looked_up_by_normalized_plate() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(PlateRegistry::open(dir.path().join("plates.csv")));
    registry.add("1234ABC").unwrap();
    registry.toggle("1234ABC").unwrap();

    let broadcaster = Broadcaster::new(64);
    let sub = broadcaster.subscribe();
    let scripted = ScriptedRecognizer::new()
        .with_result(vec![plate_span("1234-abc", 0.8)])
        .with_result(vec![plate_span("9999 zzz", 0.7)]);
    let mut pipeline = pipeline_with(scripted, registry, &broadcaster);

    let t0 = Instant::now();
    let first = rendered(pipeline.run_cycle(t0));
    let second = rendered(pipeline.run_cycle(t0 + Duration::from_secs(1)));

    let first = first.detection.expect("first detection");
    assert_eq!(first.plate, "1234ABC");
    assert!(first.authorized);
    let second = second.detection.expect("second detection");
    assert_eq!(second.plate, "9999ZZZ");
    assert!(!second.authorized);

    let detections: Vec<serde_json::Value> = drain(&sub)
        .iter()
        .filter(|e| e.name() == "plate_detected")
        .map(|e| serde_json::from_str(&e.data_json().unwrap()).unwrap())
        .collect();
    assert_eq!(detections.len(), 2);
    assert_eq!(detections[0]["plate"], "1234ABC");
    assert_eq!(detections[0]["authorized"], true);
    assert_eq!(detections[1]["authorized"], false);
}

#[test]
fn invalid_text_never_becomes_a_detection() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(PlateRegistry::open(dir.path().join("plates.csv")));
    let broadcaster = Broadcaster::new(64);
    let scripted = ScriptedRecognizer::new().with_result(vec![
        plate_span("STOP", 0.99),
        plate_span("12345ABC", 0.95),
        plate_span("ABC1234", 0.9),
    ]);
    let mut pipeline = pipeline_with(scripted, registry, &broadcaster);

    let report = rendered(pipeline.run_cycle(Instant::now()));
    assert_eq!(report.overlay, OverlayKind::NoPlate);
    assert!(report.detection.is_none());
}

struct FlakyCamera {
    served: bool,
    image: Vec<u8>,
}

impl SnapshotFetch for FlakyCamera {
    fn fetch(&mut self) -> Result<Vec<u8>> {
        if self.served {
            return Err(anyhow!("camera unreachable"));
        }
        self.served = true;
        Ok(self.image.clone())
    }
}

#[test]
fn remote_source_keeps_serving_last_frame_and_stops_on_flag() -> Result<()> {
    let dir = TempDir::new()?;
    let registry = Arc::new(PlateRegistry::open(dir.path().join("plates.csv")));
    let broadcaster = Broadcaster::new(256);
    let sub = broadcaster.subscribe();

    let config = SnapshotConfig {
        poll_interval: Duration::from_millis(5),
        backoff_interval: Duration::from_millis(20),
        idle_interval: Duration::from_millis(5),
        ..SnapshotConfig::default()
    };
    let camera = FlakyCamera {
        served: false,
        image: encode_jpeg(&RgbImage::from_pixel(32, 24, Rgb([90, 90, 90])), 80)?,
    };
    let source = RemoteSnapshot::spawn_with_fetcher(camera, config)?;

    let mut pipeline = Pipeline::new(
        Box::new(source),
        SharedRecognizer::new(ScriptedRecognizer::new()),
        registry,
        broadcaster.clone(),
        OverlayRenderer::new(None),
        PipelineSettings {
            frame_interval: Duration::from_millis(5),
            ..PipelineSettings::default()
        },
    );

    let stop = Arc::new(AtomicBool::new(false));
    let stop_timer = stop.clone();
    let timer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(300));
        stop_timer.store(true, Ordering::SeqCst);
    });
    let stats = pipeline.run(&stop);
    timer.join().unwrap();

    // Frames keep flowing after the camera starts failing.
    assert!(stats.cycles >= 5, "cycles: {}", stats.cycles);
    let frames = drain(&sub)
        .iter()
        .filter(|event| event.name() == "frame")
        .count();
    assert_eq!(frames as u64, stats.cycles);
    Ok(())
}
