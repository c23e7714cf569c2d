use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::decode::ResultDecoder;
use crate::errors::{NucleiSegError, Result};
use crate::fallback::FallbackSegmenter;
use crate::image_data::ImageData;
use crate::inference::InferenceAdapter;
use crate::normalize::{normalize, NormalizeOptions};
use crate::roi::NucleusRoi;
use crate::settings::SegmentationSettings;
use crate::stats::summarize;
use crate::traits::InferenceBackend;

/// Lifecycle of a segmentation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Created,
    Ready,
    Segmenting,
    Closed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Ready => "ready",
            Self::Segmenting => "segmenting",
            Self::Closed => "closed",
        })
    }
}

/// One segmentation run over a borrowed image.
///
/// Model availability is probed once per run and decides which path every
/// call takes: all ROIs of a run come from the model, or all come from the
/// fallback segmenter. A model failure is returned as is and closes the run;
/// it never switches the run to the fallback path.
///
/// ```no_run
/// use std::sync::Arc;
/// use he_nuclei_seg::{
///     ImageData, InferenceAdapter, NuclearSegmentation, OrtStarDistModel, SegmentationSettings,
/// };
///
/// # fn main() -> he_nuclei_seg::Result<()> {
/// let settings = SegmentationSettings::default();
/// let backend = OrtStarDistModel::new("he_heavy_augment.onnx", settings.model.id(), 0);
/// let adapter = Arc::new(InferenceAdapter::new(backend, &settings));
///
/// let image = ImageData::from_dynamic(&image::open("slide.png")?)?;
/// let mut run = NuclearSegmentation::new(&image, "slide.png", settings, adapter)?;
/// let rois = run.segment_nuclei()?;
/// println!("{}", run.statistics(&rois));
/// run.close();
/// # Ok(())
/// # }
/// ```
pub struct NuclearSegmentation<'a, B: InferenceBackend> {
    image: &'a ImageData,
    image_file_name: String,
    settings: SegmentationSettings,
    adapter: Option<Arc<InferenceAdapter<B>>>,
    available: Option<bool>,
    state: RunState,
}

impl<'a, B: InferenceBackend> NuclearSegmentation<'a, B> {
    pub fn new(
        image: &'a ImageData,
        image_file_name: impl Into<String>,
        settings: SegmentationSettings,
        adapter: Arc<InferenceAdapter<B>>,
    ) -> Result<Self> {
        settings.validate()?;
        check_model_settings(&settings, adapter.settings())?;
        Ok(Self {
            image,
            image_file_name: image_file_name.into(),
            settings,
            adapter: Some(adapter),
            available: None,
            state: RunState::Created,
        })
    }

    /// Whether this run uses the model. Probed on first call, then cached.
    pub fn is_available(&mut self) -> bool {
        if let Some(available) = self.available {
            return available;
        }
        let Some(adapter) = &self.adapter else {
            return false;
        };

        let available = adapter.is_available();
        self.available = Some(available);
        if self.state == RunState::Created {
            self.state = RunState::Ready;
        }
        info!(
            image = %self.image_file_name,
            model = %adapter.model_id(),
            available,
            "model availability probed"
        );
        available
    }

    /// Segment the image with the model, or with the fallback segmenter when
    /// the model is unavailable.
    pub fn segment_nuclei(&mut self) -> Result<Vec<NucleusRoi>> {
        if self.state == RunState::Closed {
            return Err(NucleiSegError::IllegalState {
                operation: "segment nuclei".to_string(),
                state: self.state.to_string(),
            });
        }

        let available = self.is_available();
        self.state = RunState::Segmenting;
        let result = if available {
            self.segment_with_model()
        } else {
            FallbackSegmenter::new(&self.settings).segment(self.image, &self.image_file_name)
        };

        match &result {
            Ok(rois) => {
                self.state = RunState::Ready;
                info!(
                    image = %self.image_file_name,
                    nuclei = rois.len(),
                    method = if available { "model" } else { "fallback" },
                    "segmentation finished"
                );
            }
            Err(NucleiSegError::UnsupportedImageFormat { .. }) => {
                self.state = RunState::Ready;
            }
            Err(e) => {
                warn!(image = %self.image_file_name, error = %e, "segmentation failed, closing run");
                self.close();
            }
        }
        result
    }

    fn segment_with_model(&self) -> Result<Vec<NucleusRoi>> {
        let adapter = self
            .adapter
            .as_ref()
            .ok_or_else(|| NucleiSegError::ModelNotAvailable {
                model_id: self.settings.model.id().to_string(),
            })?;

        let tensor = normalize(self.image, &NormalizeOptions::from(&self.settings))?;
        let prediction = adapter.infer(tensor.view())?;
        ResultDecoder::new(adapter.model_id()).decode(
            prediction.probability.view(),
            prediction.labels.view(),
            adapter.settings().prob_thresh,
            &self.image_file_name,
        )
    }

    /// Move to `Closed` and give up the adapter handle. When this run held the
    /// last handle the backend is released.
    pub fn close(&mut self) {
        if self.state == RunState::Closed {
            return;
        }
        self.state = RunState::Closed;
        if let Some(adapter) = self.adapter.take().and_then(Arc::into_inner) {
            adapter.close();
        }
        debug!(image = %self.image_file_name, "segmentation run closed");
    }

    pub fn statistics(&self, rois: &[NucleusRoi]) -> String {
        summarize(rois)
    }

    pub const fn settings(&self) -> &SegmentationSettings {
        &self.settings
    }

    pub const fn state(&self) -> RunState {
        self.state
    }

    pub fn image_file_name(&self) -> &str {
        &self.image_file_name
    }
}

/// The model path runs with the adapter's thresholds, so a run must agree
/// with them.
fn check_model_settings(run: &SegmentationSettings, adapter: &SegmentationSettings) -> Result<()> {
    let mismatch = if run.model != adapter.model {
        Some(format!("model `{}` vs `{}`", run.model.id(), adapter.model.id()))
    } else if run.prob_thresh != adapter.prob_thresh {
        Some(format!("probability threshold {} vs {}", run.prob_thresh, adapter.prob_thresh))
    } else if run.nms_thresh != adapter.nms_thresh {
        Some(format!("NMS threshold {} vs {}", run.nms_thresh, adapter.nms_thresh))
    } else if run.exclude_boundary != adapter.exclude_boundary {
        Some(format!(
            "boundary exclusion {} vs {}",
            run.exclude_boundary, adapter.exclude_boundary
        ))
    } else {
        None
    };

    match mismatch {
        Some(detail) => Err(NucleiSegError::configuration(format!(
            "run settings differ from the inference adapter: {detail}"
        ))),
        None => Ok(()),
    }
}

impl<B: InferenceBackend> Drop for NuclearSegmentation<'_, B> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<B: InferenceBackend> fmt::Display for NuclearSegmentation<'_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NuclearSegmentation[image={}, model={}, prob_thresh={:.2}, available=",
            self.image_file_name, self.settings.model, self.settings.prob_thresh
        )?;
        match self.available {
            Some(available) => write!(f, "{available}]"),
            None => f.write_str("unknown]"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{create_mock_backend, MockStarDistBackend};

    fn image() -> ImageData {
        ImageData::from_rgb8(256, 256, vec![180; 256 * 256 * 3]).unwrap()
    }

    fn adapter(backend: MockStarDistBackend) -> Arc<InferenceAdapter<MockStarDistBackend>> {
        Arc::new(InferenceAdapter::new(backend, &SegmentationSettings::default()))
    }

    #[test]
    fn test_state_transitions() -> Result<()> {
        let image = image();
        let mut run = NuclearSegmentation::new(
            &image,
            "slide.png",
            SegmentationSettings::default(),
            adapter(create_mock_backend()),
        )?;
        assert_eq!(run.state(), RunState::Created);
        assert!(run.to_string().ends_with("available=unknown]"));

        assert!(run.is_available());
        assert_eq!(run.state(), RunState::Ready);

        let rois = run.segment_nuclei()?;
        assert_eq!(rois.len(), 3);
        assert_eq!(run.state(), RunState::Ready);

        run.close();
        assert_eq!(run.state(), RunState::Closed);
        Ok(())
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let image = image();
        let settings = SegmentationSettings {
            nms_thresh: 2.0,
            ..Default::default()
        };
        let result = NuclearSegmentation::new(&image, "slide.png", settings, adapter(create_mock_backend()));
        assert!(matches!(result, Err(NucleiSegError::Configuration { .. })));
    }

    #[test]
    fn test_settings_must_match_adapter() -> Result<()> {
        let image = image();
        let shared = adapter(create_mock_backend());
        let mismatched = [
            SegmentationSettings {
                prob_thresh: 0.7,
                ..Default::default()
            },
            SegmentationSettings {
                nms_thresh: 0.2,
                ..Default::default()
            },
            SegmentationSettings::for_model(crate::settings::ModelChoice::Dsb2018Paper),
        ];
        for settings in mismatched {
            let result = NuclearSegmentation::new(&image, "slide.png", settings, shared.clone());
            assert!(matches!(result, Err(NucleiSegError::Configuration { .. })));
        }

        // Fallback-only settings may differ per run.
        let settings = SegmentationSettings {
            max_nucleus_size: 500.0,
            ..Default::default()
        };
        let run = NuclearSegmentation::new(&image, "slide.png", settings, shared)?;
        assert!(run.to_string().contains("prob_thresh=0.50"));
        Ok(())
    }

    #[test]
    fn test_availability_probed_once() -> Result<()> {
        let image = image();
        let backend = create_mock_backend();
        let calls = backend.calls();
        let shared = adapter(backend);
        let mut run = NuclearSegmentation::new(&image, "slide.png", SegmentationSettings::default(), shared.clone())?;

        assert!(run.is_available());
        shared.close();
        // Cached for the lifetime of the run.
        assert!(run.is_available());
        assert_eq!(calls.initialize_count(), 1);
        Ok(())
    }

    #[test]
    fn test_adapter_closed_mid_run_closes_run() -> Result<()> {
        let image = image();
        let shared = adapter(create_mock_backend());
        let mut run = NuclearSegmentation::new(&image, "slide.png", SegmentationSettings::default(), shared.clone())?;
        assert!(run.is_available());

        shared.close();
        let err = run.segment_nuclei().unwrap_err();
        assert!(err.is_model_not_available());
        assert_eq!(run.state(), RunState::Closed);
        Ok(())
    }

    #[test]
    fn test_unsupported_image_keeps_run_open() -> Result<()> {
        let image = ImageData::new(4, 4, 2, crate::image_data::PixelData::U8(vec![0; 32]))?;
        let mut run = NuclearSegmentation::new(
            &image,
            "ga.png",
            SegmentationSettings::default(),
            adapter(create_mock_backend()),
        )?;

        let err = run.segment_nuclei().unwrap_err();
        assert!(matches!(err, NucleiSegError::UnsupportedImageFormat { .. }));
        assert_eq!(run.state(), RunState::Ready);
        Ok(())
    }

    #[test]
    fn test_shared_adapter_survives_one_run_closing() -> Result<()> {
        let image = image();
        let backend = create_mock_backend();
        let calls = backend.calls();
        let shared = adapter(backend);

        let mut first = NuclearSegmentation::new(&image, "a.png", SegmentationSettings::default(), shared.clone())?;
        first.segment_nuclei()?;
        first.close();
        assert_eq!(calls.release_count(), 0);

        let mut second = NuclearSegmentation::new(&image, "b.png", SegmentationSettings::default(), shared)?;
        assert_eq!(second.segment_nuclei()?.len(), 3);
        drop(second);
        assert_eq!(calls.release_count(), 1);
        Ok(())
    }
}
