use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::broadcast::DEFAULT_QUEUE_DEPTH;
use crate::ingest::{CaptureSettings, CaptureSource, LocalCaptureConfig, SnapshotConfig};
use crate::pipeline::PipelineSettings;
use crate::recognize::{RecognizerBackend, RecognizerSettings};

const DEFAULT_PLATES_PATH: &str = "plates.csv";
const DEFAULT_API_ADDR: &str = "127.0.0.1:5001";

#[derive(Debug, Deserialize, Default)]
struct PlatedConfigFile {
    plates_path: Option<PathBuf>,
    api: Option<ApiConfigFile>,
    capture: Option<CaptureConfigFile>,
    remote: Option<RemoteConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    recognizer: Option<RecognizerConfigFile>,
    overlay: Option<OverlayConfigFile>,
    events: Option<EventsConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    source: Option<CaptureSource>,
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    idle_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RemoteConfigFile {
    url: Option<String>,
    snapshot_path: Option<String>,
    poll_ms: Option<u64>,
    backoff_ms: Option<u64>,
    timeout_ms: Option<u64>,
    idle_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    ocr_interval_ms: Option<u64>,
    detection_ttl_ms: Option<u64>,
    frame_interval_ms: Option<u64>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct RecognizerConfigFile {
    backend: Option<RecognizerBackend>,
    url: Option<String>,
    timeout_ms: Option<u64>,
    model_path: Option<PathBuf>,
    dict_path: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct OverlayConfigFile {
    font_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct EventsConfigFile {
    queue_depth: Option<usize>,
}

/// Daemon configuration: file, then environment, then validation.
#[derive(Debug, Clone)]
pub struct PlatedConfig {
    pub plates_path: PathBuf,
    pub api_addr: String,
    pub capture: CaptureSettings,
    pub pipeline: PipelineSettings,
    pub recognizer: RecognizerSettings,
    pub font_path: Option<PathBuf>,
    /// Per-observer event queue depth.
    pub queue_depth: usize,
}

impl Default for PlatedConfig {
    fn default() -> Self {
        Self {
            plates_path: PathBuf::from(DEFAULT_PLATES_PATH),
            api_addr: DEFAULT_API_ADDR.to_string(),
            capture: CaptureSettings {
                source: CaptureSource::Local,
                local: LocalCaptureConfig::default(),
                remote: SnapshotConfig::default(),
            },
            pipeline: PipelineSettings::default(),
            recognizer: RecognizerSettings::default(),
            font_path: None,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

impl PlatedConfig {
    /// Load from the file named by `PLATED_CONFIG` (if set) plus environment.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PLATED_CONFIG")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Load from an explicit file (or defaults), then environment.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => PlatedConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PlatedConfigFile) -> Self {
        let mut cfg = Self::default();
        if let Some(path) = file.plates_path {
            cfg.plates_path = path;
        }
        if let Some(addr) = file.api.and_then(|api| api.addr) {
            cfg.api_addr = addr;
        }
        if let Some(capture) = file.capture {
            let local = &mut cfg.capture.local;
            if let Some(source) = capture.source {
                cfg.capture.source = source;
            }
            if let Some(device) = capture.device {
                local.device = device;
            }
            local.width = capture.width.unwrap_or(local.width);
            local.height = capture.height.unwrap_or(local.height);
            local.fps = capture.fps.unwrap_or(local.fps);
            if let Some(ms) = capture.idle_ms {
                local.idle_interval = Duration::from_millis(ms);
            }
        }
        if let Some(remote_file) = file.remote {
            let remote = &mut cfg.capture.remote;
            if let Some(url) = remote_file.url {
                remote.base_url = url;
            }
            if let Some(path) = remote_file.snapshot_path {
                remote.snapshot_path = path;
            }
            set_millis(&mut remote.poll_interval, remote_file.poll_ms);
            set_millis(&mut remote.backoff_interval, remote_file.backoff_ms);
            set_millis(&mut remote.timeout, remote_file.timeout_ms);
            set_millis(&mut remote.idle_interval, remote_file.idle_ms);
        }
        if let Some(pipeline) = file.pipeline {
            set_millis(&mut cfg.pipeline.ocr_interval, pipeline.ocr_interval_ms);
            set_millis(&mut cfg.pipeline.detection_ttl, pipeline.detection_ttl_ms);
            set_millis(&mut cfg.pipeline.frame_interval, pipeline.frame_interval_ms);
            if let Some(quality) = pipeline.jpeg_quality {
                cfg.pipeline.jpeg_quality = quality;
            }
        }
        if let Some(recognizer) = file.recognizer {
            let settings = &mut cfg.recognizer;
            if let Some(backend) = recognizer.backend {
                settings.backend = backend;
            }
            if let Some(url) = recognizer.url {
                settings.url = url;
            }
            set_millis(&mut settings.timeout, recognizer.timeout_ms);
            settings.model_path = recognizer.model_path.or(settings.model_path.take());
            settings.dict_path = recognizer.dict_path.or(settings.dict_path.take());
            settings.input_width = recognizer.input_width.unwrap_or(settings.input_width);
            settings.input_height = recognizer.input_height.unwrap_or(settings.input_height);
        }
        cfg.font_path = file.overlay.and_then(|overlay| overlay.font_path);
        if let Some(depth) = file.events.and_then(|events| events.queue_depth) {
            cfg.queue_depth = depth;
        }
        cfg
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = env_value("PLATED_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(path) = env_value("PLATED_PLATES_PATH") {
            self.plates_path = PathBuf::from(path);
        }
        if let Some(source) = env_value("PLATED_CAPTURE_SOURCE") {
            self.capture.source = source
                .parse()
                .context("PLATED_CAPTURE_SOURCE must be local or remote")?;
        }
        if let Some(device) = env_value("PLATED_CAMERA_DEVICE") {
            self.capture.local.device = device;
        }
        if let Some(url) = env_value("PLATED_CAMERA_URL") {
            self.capture.remote.base_url = url;
        }
        if let Some(path) = env_value("PLATED_SNAPSHOT_PATH") {
            self.capture.remote.snapshot_path = path;
        }
        if let Some(ms) = env_millis("PLATED_OCR_INTERVAL_MS")? {
            self.pipeline.ocr_interval = ms;
        }
        if let Some(ms) = env_millis("PLATED_DETECTION_TTL_MS")? {
            self.pipeline.detection_ttl = ms;
        }
        if let Some(backend) = env_value("PLATED_RECOGNIZER") {
            self.recognizer.backend = backend.parse()?;
        }
        if let Some(url) = env_value("PLATED_OCR_URL") {
            self.recognizer.url = url;
        }
        if let Some(path) = env_value("PLATED_FONT_PATH") {
            self.font_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    /// Reject settings the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        validate_host_port(&self.api_addr)?;
        if self.plates_path.as_os_str().is_empty() {
            return Err(anyhow!("plates path must not be empty"));
        }

        let local = &self.capture.local;
        if local.device.trim().is_empty() {
            return Err(anyhow!("capture device must not be empty"));
        }
        if local.width == 0 || local.height == 0 {
            return Err(anyhow!("capture resolution must be non-zero"));
        }
        require_positive("capture idle interval", local.idle_interval)?;

        let remote = &self.capture.remote;
        remote.snapshot_url()?;
        if !remote.snapshot_path.starts_with('/') {
            return Err(anyhow!(
                "snapshot path '{}' must start with '/'",
                remote.snapshot_path
            ));
        }
        require_positive("remote poll interval", remote.poll_interval)?;
        require_positive("remote backoff interval", remote.backoff_interval)?;
        require_positive("remote fetch timeout", remote.timeout)?;
        require_positive("remote idle interval", remote.idle_interval)?;

        require_positive("OCR interval", self.pipeline.ocr_interval)?;
        require_positive("detection TTL", self.pipeline.detection_ttl)?;
        require_positive("frame interval", self.pipeline.frame_interval)?;
        if !(1..=100).contains(&self.pipeline.jpeg_quality) {
            return Err(anyhow!(
                "jpeg quality must be within 1..=100, got {}",
                self.pipeline.jpeg_quality
            ));
        }

        if self.recognizer.backend == RecognizerBackend::Http {
            let url = url::Url::parse(&self.recognizer.url)
                .with_context(|| format!("invalid OCR url '{}'", self.recognizer.url))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(anyhow!("OCR url must use http or https"));
            }
        }
        require_positive("recognizer timeout", self.recognizer.timeout)?;

        if self.queue_depth == 0 {
            return Err(anyhow!("event queue depth must be greater than zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<PlatedConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn set_millis(target: &mut Duration, value: Option<u64>) {
    if let Some(ms) = value {
        *target = Duration::from_millis(ms);
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_millis(key: &str) -> Result<Option<Duration>> {
    match env_value(key) {
        Some(raw) => {
            let ms: u64 = raw
                .parse()
                .map_err(|_| anyhow!("{} must be an integer number of milliseconds", key))?;
            Ok(Some(Duration::from_millis(ms)))
        }
        None => Ok(None),
    }
}

/// `host:port` where host is a name, an IPv4 address or a bracketed IPv6
/// address. Names are resolved when the listener binds.
fn validate_host_port(addr: &str) -> Result<()> {
    let invalid = || anyhow!("api address '{}' is not host:port", addr);
    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(invalid());
    }
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        return Err(invalid());
    }
    Ok(())
}

fn require_positive(name: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(anyhow!("{} must be greater than zero", name));
    }
    Ok(())
}
