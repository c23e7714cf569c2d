//! Classical nucleus segmentation used when no model is available.
//!
//! Haematoxylin-stained nuclei are the darkest structures in an H&E image, so
//! the luminance plane is smoothed, thresholded from below and split into
//! 8-connected particles. Particles that are too small, too large, too
//! irregular, or cut by the image border are discarded.

use image::{GrayImage, Luma};
use imageproc::contrast::otsu_level;
use imageproc::filter::gaussian_blur_f32;
use imageproc::region_labelling::{connected_components, Connectivity};
use ndarray::Array2;
use tracing::debug;

use crate::errors::{NucleiSegError, Result};
use crate::image_data::ImageData;
use crate::normalize::to_gray8;
use crate::regions::measure_regions;
use crate::roi::{NucleusRoi, SegmentationMethod};
use crate::settings::{FallbackThreshold, SegmentationSettings};

#[derive(Debug, Clone)]
pub struct FallbackSegmenter {
    threshold: FallbackThreshold,
    blur_sigma: f32,
    min_size: f64,
    max_size: f64,
    min_circularity: f64,
}

impl FallbackSegmenter {
    pub fn new(settings: &SegmentationSettings) -> Self {
        Self {
            threshold: settings.fallback_threshold,
            blur_sigma: settings.fallback_blur_sigma,
            min_size: settings.min_nucleus_size,
            max_size: settings.max_nucleus_size,
            min_circularity: settings.fallback_min_circularity,
        }
    }

    pub fn segment(&self, image: &ImageData, image_file_name: &str) -> Result<Vec<NucleusRoi>> {
        let gray = to_gray8(image)?;
        // Every particle of an image thinner than 3 px touches the border.
        if gray.width() < 3 || gray.height() < 3 {
            return Ok(Vec::new());
        }

        let gray = if self.blur_sigma > 0.0 {
            gaussian_blur_f32(&gray, self.blur_sigma)
        } else {
            gray
        };

        let level = match self.threshold {
            FallbackThreshold::Fixed(level) => level,
            // Otsu's level belongs to the dark class.
            FallbackThreshold::Otsu => otsu_level(&gray).saturating_add(1),
        };
        let foreground = GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
            if gray.get_pixel(x, y)[0] < level {
                Luma([255u8])
            } else {
                Luma([0u8])
            }
        });

        let components = connected_components(&foreground, Connectivity::Eight, Luma([0u8]));
        let (width, height) = components.dimensions();
        let labels = Array2::from_shape_vec((height as usize, width as usize), components.into_raw())
            .map_err(|e| NucleiSegError::ImageProcessing {
                path: image_file_name.to_string(),
                operation: "connected component labelling".to_string(),
                source: Box::new(e),
            })?;

        let regions = measure_regions(labels.view(), None);
        let particles = regions.len();
        let rois: Vec<NucleusRoi> = regions
            .into_iter()
            .filter(|r| !r.touches_border && (self.min_size..=self.max_size).contains(&(r.area as f64)))
            .filter_map(|r| r.into_roi(String::new(), image_file_name, SegmentationMethod::Fallback))
            .filter(|roi| roi.circularity() >= self.min_circularity)
            .enumerate()
            .map(|(i, roi)| roi.renamed(format!("Nucleus_{}", i + 1)))
            .collect();

        debug!(
            level,
            particles,
            kept = rois.len(),
            "fallback segmentation finished"
        );
        Ok(rois)
    }
}
