use std::fmt;

use ndarray::{Array2, ArrayView4};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::errors::{NucleiSegError, Result};
use crate::settings::SegmentationSettings;
use crate::stardist::{self, NmsParams};
use crate::traits::InferenceBackend;

/// Decoded model output for one image.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// Object probability per pixel, shape `(height, width)`.
    pub probability: Array2<f32>,
    /// Instance labels after non-maximum suppression, 0 = background.
    pub labels: Array2<u32>,
}

enum AdapterState<B> {
    Uninitialized(B),
    Ready(B),
    Unavailable,
    Closed,
}

impl<B> AdapterState<B> {
    const fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized(_) => "uninitialized",
            Self::Ready(_) => "ready",
            Self::Unavailable => "unavailable",
            Self::Closed => "closed",
        }
    }
}

/// Owns one inference backend and serializes access to it.
///
/// The backend is initialized lazily by the first [`is_available`] call and
/// released by [`close`] or on drop. Thresholds are captured at construction;
/// a different configuration needs a new adapter.
///
/// [`is_available`]: Self::is_available
/// [`close`]: Self::close
pub struct InferenceAdapter<B: InferenceBackend> {
    model_id: String,
    settings: SegmentationSettings,
    nms: NmsParams,
    state: Mutex<AdapterState<B>>,
}

impl<B: InferenceBackend> InferenceAdapter<B> {
    pub fn new(backend: B, settings: &SegmentationSettings) -> Self {
        Self {
            model_id: backend.model_id().to_string(),
            settings: settings.clone(),
            nms: NmsParams::from(settings),
            state: Mutex::new(AdapterState::Uninitialized(backend)),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub const fn settings(&self) -> &SegmentationSettings {
        &self.settings
    }

    /// Whether a loaded session is ready. Initializes the backend on first
    /// call; a failure is logged and remembered, never returned.
    pub fn is_available(&self) -> bool {
        let mut state = self.state.lock();
        if let AdapterState::Uninitialized(_) = &*state {
            *state = match std::mem::replace(&mut *state, AdapterState::Closed) {
                AdapterState::Uninitialized(mut backend) => match backend.initialize() {
                    Ok(()) => {
                        info!(model = %self.model_id, "inference backend initialized");
                        AdapterState::Ready(backend)
                    }
                    Err(e) => {
                        warn!(model = %self.model_id, error = %e, "inference backend unavailable");
                        AdapterState::Unavailable
                    }
                },
                other => other,
            };
        }
        matches!(*state, AdapterState::Ready(_))
    }

    /// Run the model on an NHWC tensor and turn its output into instances.
    ///
    /// Calls on a shared adapter queue on the internal lock.
    pub fn infer(&self, tensor: ArrayView4<f32>) -> Result<Prediction> {
        if !self.is_available() {
            return Err(self.not_available());
        }

        let raw = {
            let mut state = self.state.lock();
            match &mut *state {
                AdapterState::Ready(backend) => backend.predict(tensor)?,
                _ => return Err(self.not_available()),
            }
        };
        debug!(
            model = %self.model_id,
            height = raw.probability.nrows(),
            width = raw.probability.ncols(),
            rays = raw.n_rays(),
            "forward pass finished"
        );

        let labels = stardist::instance_labels(&raw, &self.nms)?;
        Ok(Prediction {
            probability: raw.probability,
            labels,
        })
    }

    /// Release the backend. Safe to call any number of times.
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), AdapterState::Closed);
        if let AdapterState::Ready(mut backend) = previous {
            backend.release();
            info!(model = %self.model_id, "inference backend released");
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.state.lock(), AdapterState::Closed)
    }

    fn not_available(&self) -> NucleiSegError {
        NucleiSegError::ModelNotAvailable {
            model_id: self.model_id.clone(),
        }
    }
}

impl<B: InferenceBackend> Drop for InferenceAdapter<B> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<B: InferenceBackend> fmt::Debug for InferenceAdapter<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceAdapter")
            .field("model_id", &self.model_id)
            .field("state", &self.state.lock().name())
            .finish()
    }
}
