use ndarray::ArrayView2;
use tracing::debug;

use crate::errors::{NucleiSegError, Result};
use crate::regions::measure_regions;
use crate::roi::{NucleusRoi, SegmentationMethod};

/// Turns a probability map and an instance label map into ROIs.
#[derive(Debug, Clone)]
pub struct ResultDecoder {
    model_id: String,
}

impl ResultDecoder {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
        }
    }

    /// Decode every labelled instance whose peak probability reaches
    /// `threshold`.
    ///
    /// Instances are ordered by the raster position of their first pixel and
    /// named `Nucleus_1..n` in that order, so relabelling the input does not
    /// change the result.
    pub fn decode(
        &self,
        probability: ArrayView2<f32>,
        labels: ArrayView2<u32>,
        threshold: f32,
        image_file_name: &str,
    ) -> Result<Vec<NucleusRoi>> {
        if probability.dim() != labels.dim() {
            return Err(NucleiSegError::model_execution(
                "decode instances",
                format!(
                    "probability map is {:?} but label map is {:?}",
                    probability.dim(),
                    labels.dim()
                ),
            ));
        }

        let regions = measure_regions(labels, Some(probability));
        let total = regions.len();
        let rois: Vec<NucleusRoi> = regions
            .into_iter()
            .filter(|r| r.max_probability.is_some_and(|p| p >= threshold))
            .enumerate()
            .filter_map(|(i, region)| {
                region.into_roi(
                    format!("Nucleus_{}", i + 1),
                    image_file_name,
                    SegmentationMethod::model(self.model_id.as_str()),
                )
            })
            .collect();

        debug!(
            instances = total,
            kept = rois.len(),
            threshold,
            "decoded model instances"
        );
        Ok(rois)
    }
}
