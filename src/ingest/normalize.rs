use anyhow::{anyhow, Context, Result};
use image::{ImageFormat, RgbImage};

/// Pixel layouts a capture device may negotiate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PixelFormat {
    Mjpeg,
    Yuyv,
    Rgb24,
}

impl PixelFormat {
    pub(crate) fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"MJPG" | b"JPEG" => Some(Self::Mjpeg),
            b"YUYV" => Some(Self::Yuyv),
            b"RGB3" => Some(Self::Rgb24),
            _ => None,
        }
    }
}

pub(crate) fn to_rgb_image(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<RgbImage> {
    match format {
        PixelFormat::Mjpeg => {
            let image = image::load_from_memory_with_format(pixels, ImageFormat::Jpeg)
                .context("decode mjpeg frame")?;
            Ok(image.into_rgb8())
        }
        PixelFormat::Rgb24 => {
            let expected = width
                .checked_mul(height)
                .and_then(|v| v.checked_mul(3))
                .ok_or_else(|| anyhow!("RGB frame dimensions overflow"))? as usize;
            if pixels.len() < expected {
                return Err(anyhow!(
                    "RGB frame length mismatch: expected {}, got {}",
                    expected,
                    pixels.len()
                ));
            }
            RgbImage::from_raw(width, height, pixels[..expected].to_vec())
                .ok_or_else(|| anyhow!("RGB frame buffer too small"))
        }
        PixelFormat::Yuyv => yuyv_to_rgb(pixels, width, height),
    }
}

fn yuyv_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<RgbImage> {
    let w = width as usize;
    let h = height as usize;
    if w % 2 != 0 {
        return Err(anyhow!("YUYV frame width must be even, got {}", w));
    }
    let expected = w
        .checked_mul(h)
        .and_then(|v| v.checked_mul(2))
        .ok_or_else(|| anyhow!("YUYV frame dimensions overflow"))?;
    if pixels.len() < expected {
        return Err(anyhow!(
            "YUYV frame length mismatch: expected {}, got {}",
            expected,
            pixels.len()
        ));
    }

    let mut rgb = vec![0u8; w * h * 3];
    // Each 4-byte group carries two pixels sharing U and V.
    for (group, out) in pixels[..expected]
        .chunks_exact(4)
        .zip(rgb.chunks_exact_mut(6))
    {
        let u = group[1] as f32 - 128.0;
        let v = group[3] as f32 - 128.0;
        for (k, y) in [group[0], group[2]].into_iter().enumerate() {
            let y = y as f32;
            out[k * 3] = clamp_to_u8(y + 1.402_f32 * v);
            out[k * 3 + 1] = clamp_to_u8(y - 0.344_136_f32 * u - 0.714_136_f32 * v);
            out[k * 3 + 2] = clamp_to_u8(y + 1.772_f32 * u);
        }
    }

    RgbImage::from_raw(width, height, rgb).ok_or_else(|| anyhow!("YUYV conversion size mismatch"))
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
