//! Pure image derivation: sizing and JPEG encoding of the display and
//! compact variants.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;

use dailybrief_shared::{DailyBriefError, MediaConfig, Result};

/// Quality decrement between compact encoding attempts.
const QUALITY_STEP: u8 = 10;

/// Dimension shrinks attempted once the quality floor is reached.
const MAX_SHRINKS: u32 = 3;

/// An encoded variant ready to be written.
#[derive(Debug, Clone)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub quality: u8,
}

/// Result of the compact derivation.
#[derive(Debug, Clone)]
pub struct CompactOutcome {
    pub encoded: Encoded,
    /// False when even the smallest attempt exceeded the byte ceiling.
    pub under_ceiling: bool,
}

/// Scale `(width, height)` to fit within the bounds, keeping aspect ratio.
///
/// Never upscales and never returns a zero dimension.
pub fn fit_within(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width <= max_width && height <= max_height {
        return (width.max(1), height.max(1));
    }
    let (w, h) = (u64::from(width), u64::from(height));
    let (mw, mh) = (u64::from(max_width), u64::from(max_height));
    if w * mh >= h * mw {
        (max_width.max(1), ((h * mw / w) as u32).max(1))
    } else {
        (((w * mh / h) as u32).max(1), max_height.max(1))
    }
}

/// Encode as baseline JPEG at the given quality.
pub fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let rgb = img.to_rgb8();
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode_image(&rgb)
        .map_err(|e| DailyBriefError::Media(format!("jpeg encode failed: {e}")))?;
    Ok(buf)
}

fn resize_to(img: &DynamicImage, width: u32, height: u32) -> DynamicImage {
    if img.width() == width && img.height() == height {
        img.clone()
    } else {
        img.resize_exact(width, height, FilterType::Triangle)
    }
}

/// Derive the large display variant.
pub fn derive_display(img: &DynamicImage, config: &MediaConfig) -> Result<Encoded> {
    let (width, height) = fit_within(
        img.width(),
        img.height(),
        config.display_max_width,
        config.display_max_height,
    );
    let resized = resize_to(img, width, height);
    Ok(Encoded {
        bytes: encode_jpeg(&resized, config.display_quality)?,
        width,
        height,
        quality: config.display_quality,
    })
}

/// Derive the compact variant under the configured byte ceiling.
///
/// Quality steps down from the start quality to the floor; at the floor the
/// dimensions shrink by 20% and the quality ladder restarts, at most
/// `MAX_SHRINKS` times. The smallest attempt is kept if none fits.
pub fn derive_compact(img: &DynamicImage, config: &MediaConfig) -> Result<CompactOutcome> {
    let (mut width, mut height) = fit_within(
        img.width(),
        img.height(),
        config.compact_max_width,
        config.compact_max_height,
    );
    let floor = config.compact_min_quality.min(config.compact_start_quality);
    let mut best: Option<Encoded> = None;

    for shrink in 0..=MAX_SHRINKS {
        let resized = resize_to(img, width, height);
        let mut quality = config.compact_start_quality;
        loop {
            let bytes = encode_jpeg(&resized, quality)?;
            let attempt = Encoded {
                bytes,
                width,
                height,
                quality,
            };
            if attempt.bytes.len() <= config.compact_max_bytes {
                return Ok(CompactOutcome {
                    encoded: attempt,
                    under_ceiling: true,
                });
            }
            if best
                .as_ref()
                .is_none_or(|b| attempt.bytes.len() < b.bytes.len())
            {
                best = Some(attempt);
            }
            if quality <= floor {
                break;
            }
            quality = quality.saturating_sub(QUALITY_STEP).max(floor);
        }

        if shrink == MAX_SHRINKS || (width == 1 && height == 1) {
            break;
        }
        width = (width * 4 / 5).max(1);
        height = (height * 4 / 5).max(1);
    }

    let encoded = best.ok_or_else(|| DailyBriefError::Media("no compact attempt produced".into()))?;
    Ok(CompactOutcome {
        encoded,
        under_ceiling: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn gradient(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        }))
    }

    /// High-entropy pixels that JPEG cannot compress well.
    fn noise(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            let v = (x.wrapping_mul(2_654_435_761) ^ y.wrapping_mul(40_503)).wrapping_mul(2_246_822_519);
            Rgb([(v >> 24) as u8, (v >> 16) as u8, (v >> 8) as u8])
        }))
    }

    #[test]
    fn fit_keeps_aspect_and_never_upscales() {
        assert_eq!(fit_within(2400, 1600, 1200, 800), (1200, 800));
        assert_eq!(fit_within(3000, 1000, 1200, 800), (1200, 400));
        assert_eq!(fit_within(1000, 3000, 1200, 800), (266, 800));
        assert_eq!(fit_within(300, 200, 1200, 800), (300, 200));
        assert_eq!(fit_within(5000, 1, 480, 320), (480, 1));
    }

    #[test]
    fn display_variant_within_bounds() {
        let config = MediaConfig::default();
        let out = derive_display(&gradient(2400, 1600), &config).unwrap();
        assert_eq!((out.width, out.height), (1200, 800));
        assert_eq!(out.quality, 85);
        let decoded = image::load_from_memory(&out.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (1200, 800));
    }

    #[test]
    fn compact_fits_at_start_quality() {
        let config = MediaConfig::default();
        let out = derive_compact(&gradient(960, 640), &config).unwrap();
        assert!(out.under_ceiling);
        assert_eq!(out.encoded.quality, 80);
        assert_eq!((out.encoded.width, out.encoded.height), (480, 320));
        assert!(out.encoded.bytes.len() <= config.compact_max_bytes);
    }

    #[test]
    fn compact_keeps_best_effort_over_ceiling() {
        let config = MediaConfig {
            compact_max_bytes: 512,
            ..MediaConfig::default()
        };
        let out = derive_compact(&noise(480, 320), &config).unwrap();
        assert!(!out.under_ceiling);
        assert_eq!(out.encoded.quality, 40);
        assert!(out.encoded.width < 480);
        assert!(out.encoded.bytes.len() > config.compact_max_bytes);
    }
}
