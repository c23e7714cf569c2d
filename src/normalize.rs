//! Conversion of decoded images into the tensor layout the StarDist model
//! expects, plus the 8-bit luminance plane used by the fallback path.

use image::GrayImage;
use ndarray::Array4;
use num_traits::AsPrimitive;
use tracing::debug;

use crate::errors::{NucleiSegError, Result};
use crate::image_data::{ImageData, PixelData};
use crate::settings::SegmentationSettings;

/// Channel count of the model input.
pub const MODEL_CHANNELS: usize = 3;

const SUPPORTED_CHANNELS: [u8; 3] = [1, 3, 4];

/// Rec. 601 luma weights.
const LUMA: [f32; 3] = [0.299, 0.587, 0.114];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizeOptions {
    pub normalize_input: bool,
    pub percentile_bottom: f32,
    pub percentile_top: f32,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self::from(&SegmentationSettings::default())
    }
}

impl From<&SegmentationSettings> for NormalizeOptions {
    fn from(settings: &SegmentationSettings) -> Self {
        Self {
            normalize_input: settings.normalize_input,
            percentile_bottom: settings.percentile_bottom,
            percentile_top: settings.percentile_top,
        }
    }
}

/// Convert `image` into an NHWC tensor of shape `(1, height, width, 3)`.
///
/// Gray input is replicated to three channels and alpha is dropped. 8-bit and
/// 16-bit samples are divided by their type maximum; 32-bit float samples are
/// min-max rescaled into `[0, 1]`. With `normalize_input` the result is then
/// percentile normalized jointly over all channels.
pub fn normalize(image: &ImageData, options: &NormalizeOptions) -> Result<Array4<f32>> {
    let mut rgb = unit_rgb(image)?;

    if options.normalize_input {
        percentile_normalize(&mut rgb, options.percentile_bottom, options.percentile_top);
    }

    let (width, height) = image.dimensions();
    debug!(
        width,
        height,
        channels = image.channels(),
        bit_depth = image.bit_depth(),
        "normalized image into model tensor"
    );
    Ok(Array4::from_shape_vec(
        (1, height as usize, width as usize, MODEL_CHANNELS),
        rgb,
    )?)
}

/// 8-bit luminance of `image`, used by the classical segmenter.
pub fn to_gray8(image: &ImageData) -> Result<GrayImage> {
    let rgb = unit_rgb(image)?;
    let gray = rgb
        .chunks_exact(MODEL_CHANNELS)
        .map(|px| {
            let luma = px[0] * LUMA[0] + px[1] * LUMA[1] + px[2] * LUMA[2];
            (luma * 255.0).round().clamp(0.0, 255.0) as u8
        })
        .collect();

    GrayImage::from_raw(image.width(), image.height(), gray).ok_or_else(|| {
        NucleiSegError::UnsupportedImageFormat {
            channels: image.channels(),
            bit_depth: image.bit_depth(),
            reason: "luminance plane does not match image dimensions".to_string(),
        }
    })
}

/// Interleaved RGB samples scaled into `[0, 1]`.
fn unit_rgb(image: &ImageData) -> Result<Vec<f32>> {
    check_supported(image)?;
    let channels = image.channels() as usize;

    let rgb = match image.data() {
        PixelData::U8(samples) => scale_to_rgb(samples, channels, f32::from(u8::MAX)),
        PixelData::U16(samples) => scale_to_rgb(samples, channels, f32::from(u16::MAX)),
        PixelData::F32(samples) => {
            let mut rgb = scale_to_rgb(samples, channels, 1.0);
            min_max_rescale(&mut rgb);
            rgb
        }
    };
    Ok(rgb)
}

fn check_supported(image: &ImageData) -> Result<()> {
    let unsupported = |reason: String| NucleiSegError::UnsupportedImageFormat {
        channels: image.channels(),
        bit_depth: image.bit_depth(),
        reason,
    };

    if !SUPPORTED_CHANNELS.contains(&image.channels()) {
        return Err(unsupported(
            "expected 1 (gray), 3 (RGB) or 4 (RGBA) channels".to_string(),
        ));
    }

    if let PixelData::F32(samples) = image.data() {
        if let Some(index) = samples.iter().position(|v| !v.is_finite()) {
            return Err(unsupported(format!("non-finite sample at index {index}")));
        }
    }

    Ok(())
}

fn scale_to_rgb<T>(samples: &[T], channels: usize, max: f32) -> Vec<f32>
where
    T: AsPrimitive<f32>,
{
    let mut rgb = Vec::with_capacity(samples.len() / channels * MODEL_CHANNELS);
    for px in samples.chunks_exact(channels) {
        if channels == 1 {
            let v = px[0].as_() / max;
            rgb.extend_from_slice(&[v, v, v]);
        } else {
            rgb.extend(px[..MODEL_CHANNELS].iter().map(|c| c.as_() / max));
        }
    }
    rgb
}

fn min_max_rescale(values: &mut [f32]) {
    let (min, max) = values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = max - min;

    if range > f32::EPSILON {
        values.iter_mut().for_each(|v| *v = (*v - min) / range);
    } else {
        values.iter_mut().for_each(|v| *v = 0.0);
    }
}

/// Map the `bottom`..`top` percentile range onto `[0, 1]` without clipping.
fn percentile_normalize(values: &mut [f32], bottom: f32, top: f32) {
    let mut sorted = values.to_vec();
    sorted.sort_unstable_by(f32::total_cmp);

    let low = percentile(&sorted, bottom);
    let high = percentile(&sorted, top);
    let range = high - low;
    if range <= 1e-20 {
        debug!(low, high, "degenerate percentile range, skipping normalization");
        return;
    }

    values.iter_mut().for_each(|v| *v = (*v - low) / range);
}

/// Linear-interpolated percentile of an ascending slice.
fn percentile(sorted: &[f32], p: f32) -> f32 {
    if sorted.is_empty() {
        return 0.0;
    }
    let pos = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f32;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f32;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_options() -> NormalizeOptions {
        NormalizeOptions {
            normalize_input: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_rgb8_scaled_to_unit_range() -> Result<()> {
        let image = ImageData::from_rgb8(2, 1, vec![0, 51, 255, 255, 0, 102])?;
        let tensor = normalize(&image, &raw_options())?;

        assert_eq!(tensor.shape(), &[1, 1, 2, 3]);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        assert!((tensor[[0, 0, 0, 1]] - 0.2).abs() < 1e-6);
        assert_eq!(tensor[[0, 0, 0, 2]], 1.0);
        assert!((tensor[[0, 0, 1, 2]] - 0.4).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_gray_replicated_and_alpha_dropped() -> Result<()> {
        let gray = ImageData::from_gray8(1, 1, vec![255])?;
        let tensor = normalize(&gray, &raw_options())?;
        assert_eq!(tensor.iter().copied().collect::<Vec<_>>(), vec![1.0; 3]);

        let rgba = ImageData::new(1, 1, 4, PixelData::U8(vec![0, 255, 0, 17]))?;
        let tensor = normalize(&rgba, &raw_options())?;
        assert_eq!(tensor.iter().copied().collect::<Vec<_>>(), vec![0.0, 1.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_float_rescaled_by_min_max() -> Result<()> {
        let image = ImageData::new(2, 1, 1, PixelData::F32(vec![-2.0, 6.0]))?;
        let tensor = normalize(&image, &raw_options())?;
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        assert_eq!(tensor[[0, 0, 1, 2]], 1.0);
        Ok(())
    }

    #[test]
    fn test_flat_float_image_maps_to_zero() -> Result<()> {
        let image = ImageData::new(2, 2, 3, PixelData::F32(vec![7.5; 12]))?;
        let tensor = normalize(&image, &NormalizeOptions::default())?;
        assert!(tensor.iter().all(|v| *v == 0.0));
        Ok(())
    }

    #[test]
    fn test_unsupported_formats() -> Result<()> {
        let two_channel = ImageData::new(1, 1, 2, PixelData::U8(vec![0, 0]))?;
        assert!(matches!(
            normalize(&two_channel, &raw_options()),
            Err(NucleiSegError::UnsupportedImageFormat { channels: 2, .. })
        ));

        let nan = ImageData::new(1, 1, 1, PixelData::F32(vec![f32::NAN]))?;
        assert!(matches!(
            normalize(&nan, &raw_options()),
            Err(NucleiSegError::UnsupportedImageFormat { bit_depth: 32, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_percentile_normalization_stretches_range() -> Result<()> {
        let samples: Vec<u8> = (0..=100).collect();
        let image = ImageData::from_gray8(101, 1, samples)?;
        let options = NormalizeOptions {
            normalize_input: true,
            percentile_bottom: 0.0,
            percentile_top: 100.0,
        };
        let tensor = normalize(&image, &options)?;
        assert!(tensor[[0, 0, 0, 0]].abs() < 1e-6);
        assert!((tensor[[0, 0, 100, 0]] - 1.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_percentile_interpolates() {
        let sorted = [0.0, 1.0, 2.0, 3.0];
        assert_eq!(percentile(&sorted, 0.0), 0.0);
        assert_eq!(percentile(&sorted, 100.0), 3.0);
        assert!((percentile(&sorted, 50.0) - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_gray8_luminance() -> Result<()> {
        let image = ImageData::from_rgb8(2, 1, vec![255, 255, 255, 200, 150, 200])?;
        let gray = to_gray8(&image)?;
        assert_eq!(gray.get_pixel(0, 0).0[0], 255);
        // 0.299 * 200 + 0.587 * 150 + 0.114 * 200
        assert_eq!(gray.get_pixel(1, 0).0[0], 171);
        Ok(())
    }
}
