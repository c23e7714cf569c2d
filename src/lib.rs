//! Nuclear segmentation for H&E-stained microscopy images.
//!
//! A run normalizes a decoded image, feeds it to a StarDist model through an
//! [`InferenceAdapter`] and decodes the instances into [`NucleusRoi`]s. When
//! the model cannot be loaded the classical [`FallbackSegmenter`] is used
//! instead; every ROI records which of the two produced it.

pub mod config;
pub mod decode;
pub mod errors;
pub mod fallback;
pub mod image_data;
pub mod inference;
pub mod model;
pub mod normalize;
mod regions;
pub mod roi;
pub mod segmentation;
pub mod settings;
pub mod stardist;
pub mod stats;
pub mod traits;

pub mod mocks;

pub use config::Config;
pub use decode::ResultDecoder;
pub use errors::{NucleiSegError, Result};
pub use fallback::FallbackSegmenter;
pub use image_data::{ImageData, PixelData};
pub use inference::{InferenceAdapter, Prediction};
pub use model::OrtStarDistModel;
pub use normalize::{normalize, to_gray8, NormalizeOptions};
pub use roi::{BoundingBox, NucleusRoi, Point, RoiMask, SegmentationMethod};
pub use segmentation::{NuclearSegmentation, RunState};
pub use settings::{FallbackThreshold, ModelChoice, SegmentationSettings};
pub use stats::{summarize, RoiStatistics};
pub use traits::*;
