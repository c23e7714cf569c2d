use crate::errors::Result;
use ndarray::prelude::*;

/// Raw StarDist output for one image.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPrediction {
    /// Object probability per pixel, shape `(height, width)`.
    pub probability: Array2<f32>,
    /// Radial distances to the object boundary, shape `(height, width, n_rays)`.
    pub distances: Array3<f32>,
}

impl RawPrediction {
    pub fn n_rays(&self) -> usize {
        self.distances.shape()[2]
    }
}

/// Boundary to the external model runtime.
///
/// The adapter calls [`initialize`](Self::initialize) at most once, and
/// [`predict`](Self::predict) and [`release`](Self::release) only after it
/// succeeded. `release` runs exactly once per successful initialization, so
/// implementations never need to guard against use after release themselves.
pub trait InferenceBackend: Send {
    /// Identifier of the loaded model, used in ROI provenance tags.
    fn model_id(&self) -> &str;

    /// Locate the model and acquire the execution session.
    fn initialize(&mut self) -> Result<()>;

    /// Run the forward pass on an NHWC tensor of shape `(1, height, width, 3)`.
    fn predict(&mut self, tensor: ArrayView4<f32>) -> Result<RawPrediction>;

    /// Drop the session and any native resources.
    fn release(&mut self);
}
