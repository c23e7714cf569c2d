use std::f32::consts::PI;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{NucleiSegError, Result};
use crate::traits::{InferenceBackend, RawPrediction};
use ndarray::prelude::*;

/// Ray count of the pretrained StarDist 2D models.
pub const MOCK_RAYS: usize = 32;

/// テスト用のモデルID
pub const MOCK_MODEL_ID: &str = "mock_stardist";

/// Shared call counters, readable after the backend moved into an adapter.
#[derive(Debug, Clone, Default)]
pub struct BackendCalls {
    initialize: Arc<AtomicUsize>,
    predict: Arc<AtomicUsize>,
    release: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl BackendCalls {
    pub fn initialize_count(&self) -> usize {
        self.initialize.load(Ordering::SeqCst)
    }

    pub fn predict_count(&self) -> usize {
        self.predict.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.release.load(Ordering::SeqCst)
    }

    /// Most forward passes ever running at the same time.
    pub fn max_concurrent_predictions(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MockBehavior {
    Working,
    FailInitialize,
    FailPredict,
}

/// テスト用のモックStarDistバックエンド
///
/// Predicts perfect disks at fixed positions regardless of the tensor content.
#[derive(Debug, Clone)]
pub struct MockStarDistBackend {
    model_id: String,
    disks: Vec<(usize, usize, f32)>,
    behavior: MockBehavior,
    predict_delay: Option<Duration>,
    calls: BackendCalls,
}

impl MockStarDistBackend {
    /// `disks` are `(center_y, center_x, radius)`.
    pub fn new(disks: Vec<(usize, usize, f32)>) -> Self {
        Self {
            model_id: MOCK_MODEL_ID.to_string(),
            disks,
            behavior: MockBehavior::Working,
            predict_delay: None,
            calls: BackendCalls::default(),
        }
    }

    /// Backend whose initialization always fails.
    pub fn unavailable() -> Self {
        Self {
            behavior: MockBehavior::FailInitialize,
            ..Self::new(Vec::new())
        }
    }

    /// Backend that initializes but fails every forward pass.
    pub fn failing() -> Self {
        Self {
            behavior: MockBehavior::FailPredict,
            ..Self::new(Vec::new())
        }
    }

    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    /// Make every forward pass take at least `delay`.
    pub fn with_predict_delay(mut self, delay: Duration) -> Self {
        self.predict_delay = Some(delay);
        self
    }

    pub fn calls(&self) -> BackendCalls {
        self.calls.clone()
    }
}

impl InferenceBackend for MockStarDistBackend {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn initialize(&mut self) -> Result<()> {
        self.calls.initialize.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            MockBehavior::FailInitialize => Err(NucleiSegError::ModelNotAvailable {
                model_id: self.model_id.clone(),
            }),
            _ => Ok(()),
        }
    }

    fn predict(&mut self, tensor: ArrayView4<f32>) -> Result<RawPrediction> {
        self.calls.predict.fetch_add(1, Ordering::SeqCst);
        let running = self.calls.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.calls.max_in_flight.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.predict_delay {
            std::thread::sleep(delay);
        }
        self.calls.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.behavior == MockBehavior::FailPredict {
            return Err(NucleiSegError::model_execution(
                "mock forward pass",
                "simulated device failure",
            ));
        }

        let shape = tensor.shape();
        Ok(disk_prediction(shape[1], shape[2], &self.disks, MOCK_RAYS))
    }

    fn release(&mut self) {
        self.calls.release.fetch_add(1, Ordering::SeqCst);
    }
}

/// テスト用のファクトリー関数
pub fn create_mock_backend() -> MockStarDistBackend {
    MockStarDistBackend::new(vec![(64, 64, 20.0), (64, 192, 25.0), (192, 128, 18.0)])
}

/// StarDist-style output for perfect disks `(center_y, center_x, radius)`.
///
/// Probability falls linearly from 1 at the centre to 0 at the rim, and every
/// ray holds the exact distance to the rim, so all proposals inside one disk
/// span nearly the same polygon.
pub fn disk_prediction(
    height: usize,
    width: usize,
    disks: &[(usize, usize, f32)],
    n_rays: usize,
) -> RawPrediction {
    let mut probability = Array2::<f32>::zeros((height, width));
    let mut distances = Array3::<f32>::zeros((height, width, n_rays));

    for &(cy, cx, r) in disks {
        for y in 0..height {
            for x in 0..width {
                let (vy, vx) = (y as f32 - cy as f32, x as f32 - cx as f32);
                let d2 = vy * vy + vx * vx;
                if d2 >= r * r {
                    continue;
                }
                let p = 1.0 - d2.sqrt() / r;
                if p <= probability[[y, x]] {
                    continue;
                }
                probability[[y, x]] = p;
                for k in 0..n_rays {
                    let phi = 2.0 * PI * k as f32 / n_rays as f32;
                    let b = vy * phi.sin() + vx * phi.cos();
                    distances[[y, x, k]] = -b + (b * b - (d2 - r * r)).sqrt();
                }
            }
        }
    }

    RawPrediction {
        probability,
        distances,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_backend_counts_calls() -> Result<()> {
        let mut mock = create_mock_backend();
        let calls = mock.calls();

        mock.initialize()?;
        let tensor = Array4::<f32>::zeros((1, 256, 256, 3));
        let raw = mock.predict(tensor.view())?;
        mock.release();

        assert_eq!(raw.probability.dim(), (256, 256));
        assert_eq!(raw.n_rays(), MOCK_RAYS);
        assert_eq!(calls.initialize_count(), 1);
        assert_eq!(calls.predict_count(), 1);
        assert_eq!(calls.release_count(), 1);
        Ok(())
    }

    #[test]
    fn test_disk_rays_reach_rim() {
        let raw = disk_prediction(40, 40, &[(20, 20, 10.0)], 8);
        assert_eq!(raw.probability[[20, 20]], 1.0);
        assert!(raw.distances.slice(s![20, 20, ..]).iter().all(|d| (d - 10.0).abs() < 1e-4));
        // Off-centre: the ray pointing right (k = 0) is shorter.
        assert!((raw.distances[[20, 25, 0]] - 5.0).abs() < 1e-4);
        assert_eq!(raw.probability[[0, 0]], 0.0);
    }

    #[test]
    fn test_failure_modes() {
        let mut unavailable = MockStarDistBackend::unavailable();
        assert!(unavailable.initialize().is_err());

        let mut failing = MockStarDistBackend::failing();
        assert!(failing.initialize().is_ok());
        let tensor = Array4::<f32>::zeros((1, 8, 8, 3));
        assert!(matches!(
            failing.predict(tensor.view()),
            Err(NucleiSegError::ModelExecution { .. })
        ));
    }
}
