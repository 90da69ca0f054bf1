//! Frame sources.
//!
//! - `LocalCapture`: pull source over a local camera device (V4L2, feature
//!   `ingest-v4l2`) or a synthetic `stub://` device.
//! - `RemoteSnapshot`: push source. A poller thread fetches single JPEG
//!   snapshots over HTTP and publishes the newest decoded frame into a
//!   `FrameSlot`; the pipeline reads that slot without blocking.
//!
//! Both implement `FrameSource`, selected once at startup from
//! `CaptureSettings`.

pub mod local;
#[cfg(feature = "ingest-v4l2")]
mod normalize;
pub mod snapshot;

use anyhow::Result;
use serde::Deserialize;

use crate::frame::FrameSource;

pub use local::{LocalCapture, LocalCaptureConfig};
pub use snapshot::{
    HttpSnapshotFetcher, PollOutcome, RemoteSnapshot, SnapshotConfig, SnapshotFetch,
    SnapshotPoller, SnapshotStats,
};

/// Which frame source the daemon runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CaptureSource {
    Local,
    Remote,
}

impl std::str::FromStr for CaptureSource {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => Err(anyhow::anyhow!(
                "unknown capture source '{}'; expected local or remote",
                other
            )),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CaptureSettings {
    pub source: CaptureSource,
    pub local: LocalCaptureConfig,
    pub remote: SnapshotConfig,
}

/// Open the configured source. Failure to open is fatal for the daemon.
pub fn open_source(settings: &CaptureSettings) -> Result<Box<dyn FrameSource>> {
    match settings.source {
        CaptureSource::Local => Ok(Box::new(LocalCapture::open(settings.local.clone())?)),
        CaptureSource::Remote => Ok(Box::new(RemoteSnapshot::spawn(settings.remote.clone())?)),
    }
}
