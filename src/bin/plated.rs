//! plated - live plate recognition daemon
//!
//! This daemon:
//! 1. Loads configuration (file, environment, flags)
//! 2. Opens the plate registry and warms up the recognizer
//! 3. Opens the configured frame source (local camera or remote snapshots)
//! 4. Serves the control API and event stream
//! 5. Runs the detection loop until Ctrl-C, then releases the camera

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use plate_sentry::{
    api::{ApiConfig, ApiServer, ApiState},
    build_recognizer,
    ingest::{open_source, CaptureSource},
    pipeline::OverlayRenderer,
    recognize::RecognizerBackend,
    Broadcaster, Pipeline, PlateRegistry, PlatedConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (.toml or .json). Overrides PLATED_CONFIG.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Frame source.
    #[arg(long, value_enum)]
    source: Option<CaptureSource>,
    /// Local capture device path, or stub://name for a synthetic camera.
    #[arg(long)]
    device: Option<String>,
    /// Remote camera base URL.
    #[arg(long)]
    camera_url: Option<String>,
    /// Snapshot path on the remote camera.
    #[arg(long)]
    snapshot_path: Option<String>,
    /// Control API listen address.
    #[arg(long)]
    api_addr: Option<String>,
    /// Plate registry CSV file.
    #[arg(long)]
    plates: Option<PathBuf>,
    /// Recognition backend.
    #[arg(long, value_enum)]
    recognizer: Option<RecognizerBackend>,
}

impl Args {
    fn apply(self, cfg: &mut PlatedConfig) {
        if let Some(source) = self.source {
            cfg.capture.source = source;
        }
        if let Some(device) = self.device {
            cfg.capture.local.device = device;
        }
        if let Some(url) = self.camera_url {
            cfg.capture.remote.base_url = url;
        }
        if let Some(path) = self.snapshot_path {
            cfg.capture.remote.snapshot_path = path;
        }
        if let Some(addr) = self.api_addr {
            cfg.api_addr = addr;
        }
        if let Some(path) = self.plates {
            cfg.plates_path = path;
        }
        if let Some(backend) = self.recognizer {
            cfg.recognizer.backend = backend;
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = Args::parse();
    let mut cfg = match args.config.take() {
        Some(path) => PlatedConfig::load_from(Some(path.as_path()))?,
        None => PlatedConfig::load()?,
    };
    args.apply(&mut cfg);
    cfg.validate()?;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_handler = stop.clone();
    ctrlc::set_handler(move || {
        stop_handler.store(true, Ordering::SeqCst);
    })
    .context("error setting Ctrl-C handler")?;

    let broadcaster = Broadcaster::new(cfg.queue_depth);
    let registry = Arc::new(
        PlateRegistry::open(cfg.plates_path.clone()).with_notifier(broadcaster.clone()),
    );
    let known = registry
        .list()
        .with_context(|| format!("read plate registry {}", cfg.plates_path.display()))?;
    log::info!(
        "plated: registry {} holds {} plates",
        cfg.plates_path.display(),
        known.len()
    );

    // Startup failures below are fatal: no degraded mode without
    // a recognizer or a frame source.
    let recognizer = build_recognizer(&cfg.recognizer)?;
    let source = open_source(&cfg.capture)?;

    let api_handle = ApiServer::new(
        ApiConfig {
            addr: cfg.api_addr.clone(),
            ..ApiConfig::default()
        },
        ApiState {
            registry: registry.clone(),
            recognizer: recognizer.clone(),
            broadcaster: broadcaster.clone(),
        },
    )
    .spawn()?;
    log::info!("plated: control api on http://{}", api_handle.addr);

    let renderer = OverlayRenderer::with_font_path(cfg.font_path.as_deref());
    let mut pipeline = Pipeline::new(
        source,
        recognizer,
        registry,
        broadcaster,
        renderer,
        cfg.pipeline.clone(),
    );
    log::info!("plated: running, press Ctrl-C to stop");
    let stats = pipeline.run(&stop);
    drop(pipeline);

    log::info!(
        "plated: shutdown ({} ocr attempts, {} failures), stopping api...",
        stats.ocr_attempts,
        stats.ocr_failures
    );
    api_handle.stop()?;
    Ok(())
}
