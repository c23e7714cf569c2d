use std::path::{Path, PathBuf};

use crate::{
    errors::{NucleiSegError, Result},
    traits::{InferenceBackend, RawPrediction},
};
use ndarray::prelude::*;
use ort::value::TensorRef;
use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::SessionBuilder, Session},
};
use tracing::debug;

/// StarDist 2D networks need spatial sizes divisible by this.
const SIZE_DIVISOR: usize = 16;

/// StarDist 2D model exported to ONNX and run on ONNX Runtime.
///
/// The graph takes an NHWC image and returns the object probability map as
/// its first output and the radial distances as its second. Models trained
/// with a coarser output grid are upsampled back to the input resolution.
pub struct OrtStarDistModel {
    model_path: PathBuf,
    model_id: String,
    device_id: i32,
    session: Option<Session>,
}

impl OrtStarDistModel {
    pub fn new(model_path: impl Into<PathBuf>, model_id: impl Into<String>, device_id: i32) -> Self {
        Self {
            model_path: model_path.into(),
            model_id: model_id.into(),
            device_id,
            session: None,
        }
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    fn build_session(&self) -> Result<Session> {
        let session = SessionBuilder::new()
            .map_err(|e| NucleiSegError::model_execution("セッションビルダー初期化", e))?
            .with_execution_providers([
                TensorRTExecutionProvider::default()
                    .with_device_id(self.device_id)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(self.device_id)
                    .build(),
            ])
            .map_err(|e| NucleiSegError::model_execution("実行プロバイダー設定", e))?
            .with_memory_pattern(true)
            .map_err(|e| NucleiSegError::model_execution("メモリパターン設定", e))?
            .commit_from_file(&self.model_path)
            .map_err(|e| {
                NucleiSegError::model_execution(
                    format!("モデルファイル読み込み: {}", self.model_path.display()),
                    e,
                )
            })?;
        Ok(session)
    }
}

impl InferenceBackend for OrtStarDistModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn initialize(&mut self) -> Result<()> {
        if !self.model_path.is_file() {
            return Err(NucleiSegError::ModelNotAvailable {
                model_id: format!("{} ({})", self.model_id, self.model_path.display()),
            });
        }

        let session = self.build_session()?;
        if session.inputs.is_empty() || session.outputs.len() < 2 {
            return Err(NucleiSegError::model_execution(
                "モデル入出力確認",
                format!(
                    "expected 1 input and 2 outputs, found {} and {}",
                    session.inputs.len(),
                    session.outputs.len()
                ),
            ));
        }
        self.session = Some(session);
        Ok(())
    }

    fn predict(&mut self, tensor: ArrayView4<f32>) -> Result<RawPrediction> {
        let session = self.session.as_mut().ok_or_else(|| NucleiSegError::ModelNotAvailable {
            model_id: self.model_id.clone(),
        })?;

        let (_, height, width, _) = tensor.dim();
        let padded = pad_to_divisor(tensor, SIZE_DIVISOR);
        let (_, padded_h, padded_w, _) = padded.dim();

        let input_name = session.inputs[0].name.clone();
        let prob_name = session.outputs[0].name.clone();
        let dist_name = session.outputs[1].name.clone();

        let outputs = session.run(
            ort::inputs![input_name.as_str() => TensorRef::from_array_view(&padded)?],
        )?;
        let prob = outputs[prob_name.as_str()].try_extract_array::<f32>()?;
        let dist = outputs[dist_name.as_str()].try_extract_array::<f32>()?;

        // prob: (1, h, w[, 1]), dist: (1, h, w, rays)
        let dist_shape = dist.shape().to_vec();
        if dist_shape.len() != 4 || dist_shape[0] != 1 {
            return Err(NucleiSegError::model_execution(
                "出力形状確認",
                format!("unexpected distance output shape {dist_shape:?}"),
            ));
        }
        let (grid_h, grid_w, n_rays) = (dist_shape[1], dist_shape[2], dist_shape[3]);
        if grid_h == 0 || grid_w == 0 || padded_h % grid_h != 0 || padded_w % grid_w != 0 {
            return Err(NucleiSegError::model_execution(
                "出力形状確認",
                format!("output grid {grid_h}x{grid_w} does not divide input {padded_h}x{padded_w}"),
            ));
        }
        let grid = padded_h / grid_h;
        if padded_w / grid_w != grid {
            return Err(NucleiSegError::model_execution(
                "出力形状確認",
                "anisotropic output grid is not supported",
            ));
        }

        let prob = prob
            .to_owned()
            .into_shape_with_order((grid_h, grid_w))?;
        let dist = dist
            .to_owned()
            .into_shape_with_order((grid_h, grid_w, n_rays))?;
        debug!(grid, n_rays, "model output decoded");

        let probability = Array2::from_shape_fn((height, width), |(y, x)| prob[[y / grid, x / grid]]);
        let distances = Array3::from_shape_fn((height, width, n_rays), |(y, x, k)| {
            dist[[y / grid, x / grid, k]] * grid as f32
        });

        Ok(RawPrediction {
            probability,
            distances,
        })
    }

    fn release(&mut self) {
        self.session = None;
    }
}

/// Zero-pad height and width up to the next multiple of `divisor`.
fn pad_to_divisor(tensor: ArrayView4<f32>, divisor: usize) -> Array4<f32> {
    let (n, h, w, c) = tensor.dim();
    let (ph, pw) = (h.div_ceil(divisor) * divisor, w.div_ceil(divisor) * divisor);
    let mut padded = Array4::<f32>::zeros((n, ph, pw, c));
    padded.slice_mut(s![.., ..h, ..w, ..]).assign(&tensor);
    padded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_model_is_unavailable() {
        let mut model = OrtStarDistModel::new("/nonexistent/he_heavy_augment.onnx", "he_heavy_augment", 0);
        let err = model.initialize().unwrap_err();
        assert!(err.is_model_not_available());
        assert_eq!(model.model_id(), "he_heavy_augment");
    }

    #[test]
    fn test_predict_before_initialize_fails() {
        let mut model = OrtStarDistModel::new("model.onnx", "he_heavy_augment", 0);
        let tensor = Array4::<f32>::zeros((1, 16, 16, 3));
        assert!(model.predict(tensor.view()).is_err());
    }

    #[test]
    fn test_pad_to_divisor() {
        let tensor = Array4::<f32>::ones((1, 20, 33, 3));
        let padded = pad_to_divisor(tensor.view(), 16);
        assert_eq!(padded.dim(), (1, 32, 48, 3));
        assert_eq!(padded[[0, 19, 32, 2]], 1.0);
        assert_eq!(padded[[0, 20, 0, 0]], 0.0);
        assert_eq!(padded[[0, 0, 33, 0]], 0.0);
    }
}
