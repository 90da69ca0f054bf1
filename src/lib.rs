//! Plate Sentry
//!
//! Live license plate recognition: frames come from a local camera or a
//! remote snapshot endpoint, a recognizer is run on them at a bounded rate,
//! plate-shaped text is checked against an authorization list, and the
//! annotated video plus detection events are pushed to observers.
//!
//! # Module Structure
//!
//! - `plate`: candidate filter (`normalize`, `validate`, `select_best`)
//! - `registry`: authorization list over a CSV store
//! - `recognize`: recognizer trait, shared handle and backends
//! - `frame` / `ingest`: frame sources (local capture, remote snapshot)
//! - `pipeline`: detection loop, detection cache, overlay rendering
//! - `broadcast`: bounded fan-out of events to observers
//! - `detect`: one-shot detection on an uploaded image
//! - `api`: HTTP control API and event stream
//! - `config`: daemon configuration

pub mod api;
pub mod broadcast;
pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod plate;
pub mod recognize;
pub mod registry;

pub use broadcast::{BroadcastEvent, Broadcaster, Subscription};
pub use config::PlatedConfig;
pub use detect::{detect_plate, DetectError, PlateDetection};
pub use frame::{Frame, FrameSlot, FrameSource};
pub use pipeline::{CycleOutcome, CycleReport, OverlayKind, Pipeline, PipelineSettings};
pub use plate::{normalize, select_best, validate, PlateCandidate, Quad, RecognitionCandidate};
pub use recognize::{build_recognizer, Recognizer, SharedRecognizer};
pub use registry::{PlateRecord, PlateRegistry, RegistryError};
