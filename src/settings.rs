//! Segmentation settings and the StarDist 2D model registry.

use std::{fmt, str::FromStr};

use crate::errors::{NucleiSegError, Result};

pub const DEFAULT_PROB_THRESH: f32 = 0.5;
pub const DEFAULT_NMS_THRESH: f32 = 0.4;
pub const DEFAULT_NORMALIZE_INPUT: bool = true;
pub const DEFAULT_PERCENTILE_BOTTOM: f32 = 1.0;
pub const DEFAULT_PERCENTILE_TOP: f32 = 99.8;
pub const DEFAULT_EXCLUDE_BOUNDARY: u32 = 2;
pub const DEFAULT_MIN_NUCLEUS_SIZE: f64 = 10.0;
pub const DEFAULT_MAX_NUCLEUS_SIZE: f64 = 10_000.0;

/// Pretrained StarDist 2D models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ModelChoice {
    VersatileFluorescent,
    Dsb2018Paper,
    #[default]
    VersatileHe,
}

impl ModelChoice {
    pub const ALL: [Self; 3] = [
        Self::VersatileFluorescent,
        Self::Dsb2018Paper,
        Self::VersatileHe,
    ];

    /// Identifier used in ROI tags and model file names.
    pub const fn id(self) -> &'static str {
        match self {
            Self::VersatileFluorescent => "dsb2018_heavy_augment",
            Self::Dsb2018Paper => "dsb2018_paper",
            Self::VersatileHe => "he_heavy_augment",
        }
    }

    pub const fn display_name(self) -> &'static str {
        match self {
            Self::VersatileFluorescent => "Versatile (fluorescent nuclei)",
            Self::Dsb2018Paper => "DSB 2018 (from StarDist 2D paper)",
            Self::VersatileHe => "Versatile (H&E nuclei)",
        }
    }

    /// Probability threshold the model was calibrated with.
    pub const fn trained_prob_thresh(self) -> f32 {
        match self {
            Self::VersatileFluorescent => 0.479_071,
            Self::Dsb2018Paper => 0.417_819,
            Self::VersatileHe => 0.692_478,
        }
    }

    pub const fn trained_nms_thresh(self) -> f32 {
        match self {
            Self::VersatileFluorescent | Self::VersatileHe => 0.3,
            Self::Dsb2018Paper => 0.5,
        }
    }
}

impl fmt::Display for ModelChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for ModelChoice {
    type Err = NucleiSegError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|m| m.id().eq_ignore_ascii_case(s) || m.display_name().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                let known: Vec<_> = Self::ALL.iter().map(|m| format!("`{}`", m.id())).collect();
                NucleiSegError::configuration(format!(
                    "unknown model `{s}`, expected one of {}",
                    known.join(", ")
                ))
            })
    }
}

/// Foreground selection used by the fallback segmenter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackThreshold {
    /// Pixels darker than this 8-bit level are nuclei.
    Fixed(u8),
    Otsu,
}

impl Default for FallbackThreshold {
    fn default() -> Self {
        Self::Fixed(120)
    }
}

/// Settings for one segmentation run.
///
/// Values are checked by [`SegmentationSettings::validate`] when a run or an
/// adapter is built and are never changed afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationSettings {
    pub model: ModelChoice,
    pub prob_thresh: f32,
    pub nms_thresh: f32,
    pub normalize_input: bool,
    pub percentile_bottom: f32,
    pub percentile_top: f32,
    /// Candidates closer than this to the image border are ignored.
    pub exclude_boundary: u32,
    pub min_nucleus_size: f64,
    pub max_nucleus_size: f64,
    pub fallback_threshold: FallbackThreshold,
    pub fallback_blur_sigma: f32,
    pub fallback_min_circularity: f64,
}

impl Default for SegmentationSettings {
    fn default() -> Self {
        Self {
            model: ModelChoice::default(),
            prob_thresh: DEFAULT_PROB_THRESH,
            nms_thresh: DEFAULT_NMS_THRESH,
            normalize_input: DEFAULT_NORMALIZE_INPUT,
            percentile_bottom: DEFAULT_PERCENTILE_BOTTOM,
            percentile_top: DEFAULT_PERCENTILE_TOP,
            exclude_boundary: DEFAULT_EXCLUDE_BOUNDARY,
            min_nucleus_size: DEFAULT_MIN_NUCLEUS_SIZE,
            max_nucleus_size: DEFAULT_MAX_NUCLEUS_SIZE,
            fallback_threshold: FallbackThreshold::default(),
            fallback_blur_sigma: 1.0,
            fallback_min_circularity: 0.3,
        }
    }
}

impl SegmentationSettings {
    /// Defaults with the thresholds the chosen model was trained with.
    pub fn for_model(model: ModelChoice) -> Self {
        Self {
            model,
            prob_thresh: model.trained_prob_thresh(),
            nms_thresh: model.trained_nms_thresh(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_unit("probability threshold", self.prob_thresh)?;
        check_unit("NMS threshold", self.nms_thresh)?;

        for (name, value) in [
            ("bottom percentile", self.percentile_bottom),
            ("top percentile", self.percentile_top),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(NucleiSegError::configuration(format!(
                    "{name} must be between 0.0 and 100.0, got: {value}"
                )));
            }
        }
        if self.percentile_bottom >= self.percentile_top {
            return Err(NucleiSegError::configuration(format!(
                "bottom percentile ({}) must be less than top percentile ({})",
                self.percentile_bottom, self.percentile_top
            )));
        }

        if self.min_nucleus_size < 0.0 || self.max_nucleus_size < 0.0 {
            return Err(NucleiSegError::configuration(
                "nucleus size limits must be non-negative",
            ));
        }
        if self.min_nucleus_size >= self.max_nucleus_size {
            return Err(NucleiSegError::configuration(format!(
                "minimum nucleus size ({}) must be less than maximum nucleus size ({})",
                self.min_nucleus_size, self.max_nucleus_size
            )));
        }

        if !(self.fallback_blur_sigma.is_finite() && self.fallback_blur_sigma >= 0.0) {
            return Err(NucleiSegError::configuration(format!(
                "fallback blur sigma must be non-negative, got: {}",
                self.fallback_blur_sigma
            )));
        }
        if !(0.0..=1.0).contains(&self.fallback_min_circularity) {
            return Err(NucleiSegError::configuration(format!(
                "fallback minimum circularity must be between 0.0 and 1.0, got: {}",
                self.fallback_min_circularity
            )));
        }

        Ok(())
    }
}

fn check_unit(name: &str, value: f32) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(NucleiSegError::configuration(format!(
            "{name} must be between 0.0 and 1.0, got: {value}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = SegmentationSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.model, ModelChoice::VersatileHe);
        assert_eq!(settings.prob_thresh, 0.5);
        assert_eq!(settings.nms_thresh, 0.4);
    }

    #[test]
    fn test_for_model_uses_trained_thresholds() {
        let settings = SegmentationSettings::for_model(ModelChoice::Dsb2018Paper);
        assert_eq!(settings.nms_thresh, 0.5);
        assert!((settings.prob_thresh - 0.417_819).abs() < 1e-6);
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let cases = [
            SegmentationSettings {
                prob_thresh: 1.5,
                ..Default::default()
            },
            SegmentationSettings {
                nms_thresh: -0.1,
                ..Default::default()
            },
            SegmentationSettings {
                percentile_bottom: 99.9,
                ..Default::default()
            },
            SegmentationSettings {
                min_nucleus_size: 500.0,
                max_nucleus_size: 100.0,
                ..Default::default()
            },
            SegmentationSettings {
                prob_thresh: f32::NAN,
                ..Default::default()
            },
        ];

        for settings in cases {
            assert!(
                matches!(settings.validate(), Err(NucleiSegError::Configuration { .. })),
                "accepted {settings:?}"
            );
        }
    }

    #[test]
    fn test_model_choice_parsing() -> Result<()> {
        assert_eq!("he_heavy_augment".parse::<ModelChoice>()?, ModelChoice::VersatileHe);
        assert_eq!(
            "Versatile (fluorescent nuclei)".parse::<ModelChoice>()?,
            ModelChoice::VersatileFluorescent
        );
        assert!("unet".parse::<ModelChoice>().is_err());
        Ok(())
    }
}
