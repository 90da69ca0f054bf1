//! Remote snapshot source.
//!
//! A poller thread repeatedly fetches one JPEG from the camera's snapshot
//! endpoint, decodes it, and publishes it into a `FrameSlot`. The pipeline
//! reads the slot without blocking, so polling cadence is independent of
//! the pipeline cadence.
//!
//! On any failure (network error, non-success status, empty body, decode
//! error) the slot keeps its previous frame and the poller sleeps the longer
//! backoff interval before retrying. Success uses the steady poll interval.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use url::Url;

use crate::frame::{decode_image, Frame, FrameSlot, FrameSource};

const MAX_JPEG_BYTES: u64 = 5 * 1024 * 1024;
/// Granularity of stop-flag checks while the poller sleeps.
const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Configuration for a remote snapshot camera.
#[derive(Clone, Debug)]
pub struct SnapshotConfig {
    /// Camera base URL, e.g. "http://192.168.4.1".
    pub base_url: String,
    /// Snapshot path on the camera, e.g. "/capture".
    pub snapshot_path: String,
    /// Sleep between successful polls.
    pub poll_interval: Duration,
    /// Sleep after a failed poll.
    pub backoff_interval: Duration,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Pipeline sleep when no frame has arrived yet.
    pub idle_interval: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            base_url: "http://192.168.4.1".to_string(),
            snapshot_path: "/capture".to_string(),
            poll_interval: Duration::from_millis(100),
            backoff_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(3),
            idle_interval: Duration::from_millis(100),
        }
    }
}

impl SnapshotConfig {
    /// Full snapshot URL: `snapshot_path` appended to any path on `base_url`.
    pub fn snapshot_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.base_url).context("parse camera url")?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "unsupported camera scheme '{}'; expected http(s)",
                    other
                ))
            }
        }
        if url.cannot_be_a_base() {
            return Err(anyhow!("camera url '{}' cannot take a path", self.base_url));
        }
        let path = format!(
            "{}/{}",
            url.path().trim_end_matches('/'),
            self.snapshot_path.trim_start_matches('/')
        );
        url.set_path(&path);
        Ok(url)
    }
}

/// One snapshot fetch. Returns the compressed image bytes.
pub trait SnapshotFetch: Send {
    fn fetch(&mut self) -> Result<Vec<u8>>;
}

/// Single-image HTTP GET against the camera.
pub struct HttpSnapshotFetcher {
    agent: ureq::Agent,
    url: String,
}

impl HttpSnapshotFetcher {
    pub fn new(url: &Url, timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            url: url.to_string(),
        }
    }
}

impl SnapshotFetch for HttpSnapshotFetcher {
    fn fetch(&mut self) -> Result<Vec<u8>> {
        let response = match self.agent.get(&self.url).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => {
                return Err(anyhow!("snapshot {} answered {}", self.url, code))
            }
            Err(err) => {
                return Err(
                    anyhow::Error::new(err).context(format!("fetch snapshot from {}", self.url))
                )
            }
        };
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_JPEG_BYTES + 1)
            .read_to_end(&mut bytes)
            .context("read snapshot body")?;
        if bytes.is_empty() {
            return Err(anyhow!("empty snapshot body"));
        }
        if bytes.len() as u64 > MAX_JPEG_BYTES {
            return Err(anyhow!("snapshot exceeds {} bytes", MAX_JPEG_BYTES));
        }
        Ok(bytes)
    }
}

/// Counters kept by the poller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnapshotStats {
    pub frames_published: u64,
    pub failures: u64,
    pub consecutive_failures: u64,
}

/// Result of one poll and how long to sleep before the next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    Published { next_poll: Duration },
    Failed { next_poll: Duration },
}

impl PollOutcome {
    pub fn next_poll(&self) -> Duration {
        match self {
            PollOutcome::Published { next_poll } | PollOutcome::Failed { next_poll } => *next_poll,
        }
    }
}

pub struct SnapshotPoller<F: SnapshotFetch> {
    fetcher: F,
    slot: FrameSlot,
    poll_interval: Duration,
    backoff_interval: Duration,
    stats: SnapshotStats,
}

impl<F: SnapshotFetch> SnapshotPoller<F> {
    pub fn new(fetcher: F, slot: FrameSlot, config: &SnapshotConfig) -> Self {
        Self {
            fetcher,
            slot,
            poll_interval: config.poll_interval,
            backoff_interval: config.backoff_interval,
            stats: SnapshotStats::default(),
        }
    }

    pub fn stats(&self) -> SnapshotStats {
        self.stats
    }

    /// Fetch, decode and publish one snapshot.
    ///
    /// Fetching and decoding happen before the slot is touched; the slot is
    /// only written with a fully decoded frame.
    pub fn poll_once(&mut self) -> PollOutcome {
        let result = self
            .fetcher
            .fetch()
            .and_then(|bytes| decode_image(&bytes));
        match result {
            Ok(image) => {
                self.slot.publish(Frame::new(image));
                if self.stats.consecutive_failures > 0 {
                    log::info!(
                        "SnapshotPoller: recovered after {} failed polls",
                        self.stats.consecutive_failures
                    );
                }
                self.stats.frames_published += 1;
                self.stats.consecutive_failures = 0;
                PollOutcome::Published {
                    next_poll: self.poll_interval,
                }
            }
            Err(err) => {
                self.stats.failures += 1;
                self.stats.consecutive_failures += 1;
                if self.stats.consecutive_failures == 1 {
                    log::warn!("SnapshotPoller: poll failed, backing off: {:#}", err);
                } else {
                    log::debug!(
                        "SnapshotPoller: poll failed ({} in a row): {:#}",
                        self.stats.consecutive_failures,
                        err
                    );
                }
                PollOutcome::Failed {
                    next_poll: self.backoff_interval,
                }
            }
        }
    }

    /// Poll until `stop` is set.
    pub fn run(mut self, stop: &AtomicBool) -> SnapshotStats {
        while !stop.load(Ordering::SeqCst) {
            let outcome = self.poll_once();
            sleep_unless_stopped(outcome.next_poll(), stop);
        }
        self.stats
    }
}

fn sleep_unless_stopped(duration: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep((deadline - now).min(STOP_CHECK_INTERVAL));
    }
}

/// Push-style frame source backed by a snapshot poller thread.
pub struct RemoteSnapshot {
    slot: FrameSlot,
    idle_interval: Duration,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<SnapshotStats>>,
}

impl RemoteSnapshot {
    /// Start polling the configured camera over HTTP.
    pub fn spawn(config: SnapshotConfig) -> Result<Self> {
        let url = config.snapshot_url()?;
        log::info!("SnapshotPoller: polling {}", url);
        let fetcher = HttpSnapshotFetcher::new(&url, config.timeout);
        Self::spawn_with_fetcher(fetcher, config)
    }

    /// Start polling with a caller-supplied fetcher.
    pub fn spawn_with_fetcher<F: SnapshotFetch + 'static>(
        fetcher: F,
        config: SnapshotConfig,
    ) -> Result<Self> {
        let slot = FrameSlot::new();
        let stop = Arc::new(AtomicBool::new(false));
        let poller = SnapshotPoller::new(fetcher, slot.clone(), &config);
        let stop_thread = stop.clone();
        let join = std::thread::Builder::new()
            .name("snapshot-poller".to_string())
            .spawn(move || poller.run(&stop_thread))
            .context("spawn snapshot poller")?;
        Ok(Self {
            slot,
            idle_interval: config.idle_interval,
            stop,
            join: Some(join),
        })
    }

    /// Stop the poller and wait for it to exit.
    pub fn stop(&mut self) -> Option<SnapshotStats> {
        self.stop.store(true, Ordering::SeqCst);
        let join = self.join.take()?;
        match join.join() {
            Ok(stats) => Some(stats),
            Err(_) => {
                log::error!("SnapshotPoller: thread panicked");
                None
            }
        }
    }
}

impl FrameSource for RemoteSnapshot {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn next_frame(&mut self) -> Option<Arc<Frame>> {
        self.slot.latest()
    }

    fn idle_interval(&self) -> Duration {
        self.idle_interval
    }

    fn release(&mut self) {
        if let Some(stats) = self.stop() {
            log::info!(
                "SnapshotPoller: stopped after {} frames, {} failed polls",
                stats.frames_published,
                stats.failures
            );
        }
    }
}

impl Drop for RemoteSnapshot {
    fn drop(&mut self) {
        // Signal only; joining could block for a full request timeout.
        self.stop.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_jpeg;
    use image::{Rgb, RgbImage};
    use std::collections::VecDeque;

    struct ScriptedFetcher {
        responses: VecDeque<Result<Vec<u8>>>,
    }

    impl SnapshotFetch for ScriptedFetcher {
        fn fetch(&mut self) -> Result<Vec<u8>> {
            self.responses
                .pop_front()
                .unwrap_or_else(|| Err(anyhow!("connection refused")))
        }
    }

    fn jpeg(width: u32, height: u32) -> Vec<u8> {
        encode_jpeg(&RgbImage::from_pixel(width, height, Rgb([40, 80, 120])), 80).unwrap()
    }

    fn config() -> SnapshotConfig {
        SnapshotConfig {
            poll_interval: Duration::from_millis(5),
            backoff_interval: Duration::from_millis(40),
            ..SnapshotConfig::default()
        }
    }

    #[test]
    fn success_publishes_and_uses_steady_interval() {
        let slot = FrameSlot::new();
        let fetcher = ScriptedFetcher {
            responses: VecDeque::from(vec![Ok(jpeg(16, 8))]),
        };
        let mut poller = SnapshotPoller::new(fetcher, slot.clone(), &config());

        let outcome = poller.poll_once();
        assert_eq!(
            outcome,
            PollOutcome::Published {
                next_poll: Duration::from_millis(5)
            }
        );
        let frame = slot.latest().expect("frame published");
        assert_eq!((frame.width(), frame.height()), (16, 8));
    }

    #[test]
    fn failures_keep_last_good_frame_and_back_off() {
        let slot = FrameSlot::new();
        let fetcher = ScriptedFetcher {
            responses: VecDeque::from(vec![
                Ok(jpeg(16, 8)),
                Err(anyhow!("timeout")),
                Ok(Vec::new()),
                Ok(b"not a jpeg".to_vec()),
            ]),
        };
        let mut poller = SnapshotPoller::new(fetcher, slot.clone(), &config());
        poller.poll_once();
        let good = slot.latest().expect("first frame");

        for _ in 0..5 {
            let outcome = poller.poll_once();
            assert_eq!(
                outcome,
                PollOutcome::Failed {
                    next_poll: Duration::from_millis(40)
                }
            );
            let current = slot.latest().expect("frame never cleared");
            assert!(Arc::ptr_eq(&good, &current));
        }

        let stats = poller.stats();
        assert_eq!(stats.frames_published, 1);
        assert_eq!(stats.failures, 5);
        assert_eq!(stats.consecutive_failures, 5);
    }

    #[test]
    fn recovery_resets_consecutive_failures() {
        let slot = FrameSlot::new();
        let fetcher = ScriptedFetcher {
            responses: VecDeque::from(vec![Err(anyhow!("down")), Ok(jpeg(4, 4))]),
        };
        let mut poller = SnapshotPoller::new(fetcher, slot.clone(), &config());
        assert!(matches!(poller.poll_once(), PollOutcome::Failed { .. }));
        assert!(slot.latest().is_none());
        assert!(matches!(poller.poll_once(), PollOutcome::Published { .. }));
        assert_eq!(poller.stats().consecutive_failures, 0);
    }

    #[test]
    fn remote_source_serves_polled_frames_and_stops() -> Result<()> {
        let fetcher = ScriptedFetcher {
            responses: VecDeque::from(vec![Ok(jpeg(8, 8))]),
        };
        let mut source = RemoteSnapshot::spawn_with_fetcher(fetcher, config())?;

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut frame = None;
        while frame.is_none() && Instant::now() < deadline {
            frame = source.next_frame();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(frame.is_some());

        let stats = source.stop().expect("poller joined");
        assert_eq!(stats.frames_published, 1);
        assert!(source.next_frame().is_some());
        Ok(())
    }

    #[test]
    fn snapshot_url_joins_path() -> Result<()> {
        let cfg = SnapshotConfig {
            base_url: "http://10.0.0.7:8080".to_string(),
            snapshot_path: "/cam-hi.jpg".to_string(),
            ..SnapshotConfig::default()
        };
        assert_eq!(cfg.snapshot_url()?.as_str(), "http://10.0.0.7:8080/cam-hi.jpg");

        for base in ["http://10.0.0.5/cam1", "http://10.0.0.5/cam1/"] {
            let prefixed = SnapshotConfig {
                base_url: base.to_string(),
                snapshot_path: "/capture".to_string(),
                ..SnapshotConfig::default()
            };
            assert_eq!(
                prefixed.snapshot_url()?.as_str(),
                "http://10.0.0.5/cam1/capture"
            );
        }

        let bad = SnapshotConfig {
            base_url: "rtsp://10.0.0.7".to_string(),
            ..SnapshotConfig::default()
        };
        assert!(bad.snapshot_url().is_err());
        Ok(())
    }
}
