//! Frames and the frame-source capability.
//!
//! - `Frame`: decoded RGB image plus capture instant.
//! - `FrameSource`: what the pipeline pulls frames from. Local capture reads
//!   the device on demand; remote snapshot returns whatever its poller last
//!   published.
//! - `FrameSlot`: single-value "latest frame" cell shared between a producer
//!   thread and the pipeline. Writers swap in a whole `Arc<Frame>`, so readers
//!   never see a half-written frame.

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A decoded frame.
#[derive(Clone, Debug)]
pub struct Frame {
    pub image: RgbImage,
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(image: RgbImage) -> Self {
        Self {
            image,
            captured_at: Instant::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Source of frames for the pipeline loop.
///
/// Selected once at startup; the pipeline never branches on the variant.
pub trait FrameSource: Send {
    /// Source identifier for logs.
    fn name(&self) -> &'static str;

    /// Next frame, or `None` when nothing is available this cycle.
    ///
    /// A miss is never fatal. The pipeline sleeps `idle_interval()` and asks
    /// again.
    fn next_frame(&mut self) -> Option<Arc<Frame>>;

    /// How long the pipeline should wait after a miss.
    fn idle_interval(&self) -> Duration;

    /// Release exclusively held resources (device handles, poller threads).
    fn release(&mut self) {}
}

/// Latest-value cell shared by a frame producer and the pipeline.
///
/// The lock is held only for the pointer swap or clone, never across I/O or
/// decoding.
#[derive(Clone, Debug, Default)]
pub struct FrameSlot {
    latest: Arc<Mutex<Option<Arc<Frame>>>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored frame.
    pub fn publish(&self, frame: Frame) {
        let frame = Arc::new(frame);
        let mut guard = self.latest.lock().unwrap_or_else(|p| p.into_inner());
        *guard = Some(frame);
    }

    /// Most recently published frame, if any has ever arrived.
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.latest
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

/// Decode compressed image bytes (JPEG or PNG) into RGB.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage> {
    let image = image::load_from_memory(bytes).context("decode image")?;
    Ok(image.into_rgb8())
}

/// Encode an RGB image as JPEG.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(image.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode_image(image)
        .context("encode jpeg")?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn slot_starts_empty_and_keeps_latest() {
        let slot = FrameSlot::new();
        assert!(slot.latest().is_none());

        slot.publish(Frame::new(RgbImage::from_pixel(4, 4, Rgb([1, 2, 3]))));
        slot.publish(Frame::new(RgbImage::from_pixel(8, 2, Rgb([9, 9, 9]))));

        let latest = slot.latest().expect("frame published");
        assert_eq!((latest.width(), latest.height()), (8, 2));
    }

    #[test]
    fn slot_clones_share_the_cell() {
        let writer = FrameSlot::new();
        let reader = writer.clone();
        writer.publish(Frame::new(RgbImage::new(3, 3)));
        assert!(reader.latest().is_some());
    }

    #[test]
    fn jpeg_encode_decodes_back_to_same_dimensions() -> Result<()> {
        let image = RgbImage::from_fn(32, 16, |x, y| Rgb([(x * 8) as u8, (y * 16) as u8, 128]));
        let jpeg = encode_jpeg(&image, 80)?;
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = decode_image(&jpeg)?;
        assert_eq!(decoded.dimensions(), (32, 16));
        Ok(())
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_image(b"not an image").is_err());
    }
}
