//! Local capture source.
//!
//! Opens the camera once at startup with a fixed resolution, frame rate and
//! MJPEG encoding, then reads frames synchronously on demand.
//!
//! - Open failure is fatal (`LocalCapture::open` returns the error).
//! - A failed read is a miss: `next_frame` returns `None` and the pipeline
//!   retries on its next iteration.
//! - The device handle is released on `release()` or drop.
//!
//! Device paths starting with `stub://` select a synthetic camera for tests
//! and demos.

use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};
use std::sync::Arc;
use std::time::Duration;

use crate::frame::{Frame, FrameSource};

/// Configuration for a local capture device.
#[derive(Clone, Debug)]
pub struct LocalCaptureConfig {
    /// Device path (e.g., "/dev/video0") or `stub://<name>`.
    pub device: String,
    pub width: u32,
    pub height: u32,
    /// Requested frame rate (frames per second).
    pub fps: u32,
    /// Pipeline sleep after a missed read.
    pub idle_interval: Duration,
}

impl Default for LocalCaptureConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            fps: 30,
            idle_interval: Duration::from_millis(10),
        }
    }
}

pub struct LocalCapture {
    config: LocalCaptureConfig,
    backend: Option<LocalBackend>,
    frames_captured: u64,
    misses: u64,
}

enum LocalBackend {
    Synthetic(SyntheticCamera),
    #[cfg(feature = "ingest-v4l2")]
    Device(device::DeviceCamera),
}

impl LocalCapture {
    /// Open the device. Errors mean the daemon cannot run.
    pub fn open(config: LocalCaptureConfig) -> Result<Self> {
        let backend = if config.device.starts_with("stub://") {
            log::info!("LocalCapture: connected to {} (synthetic)", config.device);
            LocalBackend::Synthetic(SyntheticCamera::new(config.width, config.height))
        } else {
            open_device(&config)?
        };
        Ok(Self {
            config,
            backend: Some(backend),
            frames_captured: 0,
            misses: 0,
        })
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames_captured
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn is_open(&self) -> bool {
        self.backend.is_some()
    }

    fn read(&mut self) -> Result<RgbImage> {
        match self.backend.as_mut() {
            Some(LocalBackend::Synthetic(camera)) => Ok(camera.next_image()),
            #[cfg(feature = "ingest-v4l2")]
            Some(LocalBackend::Device(camera)) => camera.next_image(),
            None => Err(anyhow!("capture device {} released", self.config.device)),
        }
    }
}

#[cfg(feature = "ingest-v4l2")]
fn open_device(config: &LocalCaptureConfig) -> Result<LocalBackend> {
    Ok(LocalBackend::Device(device::DeviceCamera::open(config)?))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_device(config: &LocalCaptureConfig) -> Result<LocalBackend> {
    Err(anyhow!(
        "capture device {} requires the ingest-v4l2 feature (use stub:// for a synthetic camera)",
        config.device
    ))
}

impl FrameSource for LocalCapture {
    fn name(&self) -> &'static str {
        "local"
    }

    fn next_frame(&mut self) -> Option<Arc<Frame>> {
        match self.read() {
            Ok(image) => {
                self.frames_captured += 1;
                Some(Arc::new(Frame::new(image)))
            }
            Err(err) => {
                self.misses += 1;
                log::debug!("LocalCapture: read miss on {}: {:#}", self.config.device, err);
                None
            }
        }
    }

    fn idle_interval(&self) -> Duration {
        self.config.idle_interval
    }

    fn release(&mut self) {
        if self.backend.take().is_some() {
            log::info!(
                "LocalCapture: released {} after {} frames",
                self.config.device,
                self.frames_captured
            );
        }
    }
}

impl Drop for LocalCapture {
    fn drop(&mut self) {
        self.release();
    }
}

// ----------------------------------------------------------------------------
// Synthetic camera (stub://)
// ----------------------------------------------------------------------------

struct SyntheticCamera {
    width: u32,
    height: u32,
    frame_count: u64,
}

impl SyntheticCamera {
    fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frame_count: 0,
        }
    }

    /// Moving diagonal gradient with a light "plate" rectangle in the middle.
    fn next_image(&mut self) -> RgbImage {
        self.frame_count += 1;
        let shift = self.frame_count as u32;
        let (w, h) = (self.width, self.height);
        RgbImage::from_fn(w, h, |x, y| {
            let inside = x > w / 3 && x < 2 * w / 3 && y > 2 * h / 5 && y < 3 * h / 5;
            if inside {
                Rgb([235, 235, 235])
            } else {
                let v = ((x + y + shift) % 256) as u8;
                Rgb([v / 2, v / 3, v])
            }
        })
    }
}

// ----------------------------------------------------------------------------
// V4L2 device
// ----------------------------------------------------------------------------

#[cfg(feature = "ingest-v4l2")]
mod device {
    use anyhow::{anyhow, Context, Result};
    use image::RgbImage;
    use ouroboros::self_referencing;

    use super::LocalCaptureConfig;
    use crate::ingest::normalize::{to_rgb_image, PixelFormat};

    pub(super) struct DeviceCamera {
        state: DeviceState,
        format: PixelFormat,
        width: u32,
        height: u32,
    }

    #[self_referencing]
    struct DeviceState {
        device: v4l::Device,
        #[borrows(mut device)]
        #[covariant]
        stream: v4l::prelude::MmapStream<'this, v4l::Device>,
    }

    impl DeviceCamera {
        pub(super) fn open(config: &LocalCaptureConfig) -> Result<Self> {
            use v4l::buffer::Type;
            use v4l::video::Capture;

            let mut device = v4l::Device::with_path(&config.device)
                .with_context(|| format!("open capture device {}", config.device))?;
            let mut format = device.format().context("read v4l2 format")?;
            format.width = config.width;
            format.height = config.height;
            format.fourcc = v4l::FourCC::new(b"MJPG");

            let format = match device.set_format(&format) {
                Ok(format) => format,
                Err(err) => {
                    log::warn!(
                        "LocalCapture: failed to set MJPG {}x{} on {}: {}",
                        config.width,
                        config.height,
                        config.device,
                        err
                    );
                    device
                        .format()
                        .context("read v4l2 format after set failure")?
                }
            };
            let pixel_format = PixelFormat::from_fourcc(&format.fourcc.repr).ok_or_else(|| {
                anyhow!(
                    "capture device {} negotiated unsupported format {}",
                    config.device,
                    String::from_utf8_lossy(&format.fourcc.repr)
                )
            })?;

            if config.fps > 0 {
                let params = v4l::video::capture::Parameters::with_fps(config.fps);
                if let Err(err) = device.set_params(&params) {
                    log::warn!(
                        "LocalCapture: failed to set {} fps on {}: {}",
                        config.fps,
                        config.device,
                        err
                    );
                }
            }

            let state = DeviceStateBuilder {
                device,
                stream_builder: |device| {
                    v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                        .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
                },
            }
            .try_build()?;

            log::info!(
                "LocalCapture: connected to {} ({}x{} {:?})",
                config.device,
                format.width,
                format.height,
                pixel_format
            );
            Ok(Self {
                state,
                format: pixel_format,
                width: format.width,
                height: format.height,
            })
        }

        pub(super) fn next_image(&mut self) -> Result<RgbImage> {
            use v4l::io::traits::CaptureStream;

            let (format, width, height) = (self.format, self.width, self.height);
            self.state.with_mut(|fields| {
                let (buf, meta) = fields.stream.next().context("capture v4l2 frame")?;
                let used = match meta.bytesused as usize {
                    0 => buf.len(),
                    n => n.min(buf.len()),
                };
                to_rgb_image(&buf[..used], width, height, format)
            })
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
