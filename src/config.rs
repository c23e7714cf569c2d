use clap::Parser;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::errors::{NucleiSegError, Result};
use crate::settings::{
    FallbackThreshold, ModelChoice, SegmentationSettings, DEFAULT_EXCLUDE_BOUNDARY,
    DEFAULT_MAX_NUCLEUS_SIZE, DEFAULT_MIN_NUCLEUS_SIZE, DEFAULT_NMS_THRESH,
    DEFAULT_PERCENTILE_BOTTOM, DEFAULT_PERCENTILE_TOP, DEFAULT_PROB_THRESH,
};

/// Segment cell nuclei in H&E images with StarDist, falling back to a
/// classical threshold pipeline when no model can be loaded.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Image file or directory (searched recursively)
    pub input: PathBuf,

    /// StarDist model exported to ONNX; without it the fallback segmenter is used
    #[arg(short, long)]
    pub model_path: Option<PathBuf>,

    #[arg(long, default_value = "he_heavy_augment", value_parser = parse_model)]
    pub model: ModelChoice,

    #[arg(long, default_value_t = DEFAULT_PROB_THRESH)]
    pub prob_thresh: f32,

    #[arg(long, default_value_t = DEFAULT_NMS_THRESH)]
    pub nms_thresh: f32,

    /// Use the thresholds the selected model was trained with
    #[arg(long, conflicts_with_all = ["prob_thresh", "nms_thresh"])]
    pub trained_thresholds: bool,

    /// Skip percentile normalization of the model input
    #[arg(long)]
    pub no_normalize: bool,

    #[arg(long, default_value_t = DEFAULT_PERCENTILE_BOTTOM)]
    pub percentile_bottom: f32,

    #[arg(long, default_value_t = DEFAULT_PERCENTILE_TOP)]
    pub percentile_top: f32,

    /// Ignore detections closer than this many pixels to the border
    #[arg(long, default_value_t = DEFAULT_EXCLUDE_BOUNDARY)]
    pub exclude_boundary: u32,

    /// Minimum nucleus area in pixels (fallback segmenter)
    #[arg(long, default_value_t = DEFAULT_MIN_NUCLEUS_SIZE)]
    pub min_size: f64,

    /// Maximum nucleus area in pixels (fallback segmenter)
    #[arg(long, default_value_t = DEFAULT_MAX_NUCLEUS_SIZE)]
    pub max_size: f64,

    /// Use Otsu's threshold instead of the fixed level in the fallback segmenter
    #[arg(long)]
    pub otsu: bool,

    #[arg(short, long, default_value_t = 0)]
    pub device_id: i32,

    #[arg(short, long)]
    pub num_threads: Option<usize>,

    /// Print every nucleus and enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Config {
    /// Validated settings for every run started by the CLI.
    pub fn to_settings(&self) -> Result<SegmentationSettings> {
        let base = if self.trained_thresholds {
            SegmentationSettings::for_model(self.model)
        } else {
            SegmentationSettings {
                model: self.model,
                prob_thresh: self.prob_thresh,
                nms_thresh: self.nms_thresh,
                ..SegmentationSettings::default()
            }
        };
        let settings = SegmentationSettings {
            normalize_input: !self.no_normalize,
            percentile_bottom: self.percentile_bottom,
            percentile_top: self.percentile_top,
            exclude_boundary: self.exclude_boundary,
            min_nucleus_size: self.min_size,
            max_nucleus_size: self.max_size,
            fallback_threshold: if self.otsu {
                FallbackThreshold::Otsu
            } else {
                FallbackThreshold::default()
            },
            ..base
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Image files under `input`, sorted by path.
    pub fn collect_inputs(&self) -> Result<Vec<PathBuf>> {
        if !self.input.exists() {
            return Err(NucleiSegError::FileSystem {
                path: self.input.clone(),
                operation: "入力パス存在確認".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "入力パスが存在しません",
                ),
            });
        }
        if self.input.is_file() {
            return Ok(vec![self.input.clone()]);
        }

        let mut image_files: Vec<PathBuf> = WalkDir::new(&self.input)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && is_supported_image_format(e.path()))
            .map(|e| e.into_path())
            .collect();
        image_files.sort();
        Ok(image_files)
    }
}

pub fn is_supported_image_format(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            matches!(
                ext.to_lowercase().as_str(),
                "jpg" | "jpeg" | "png" | "tif" | "tiff" | "bmp" | "webp"
            )
        })
}

fn parse_model(s: &str) -> std::result::Result<ModelChoice, String> {
    s.parse().map_err(|e: NucleiSegError| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("he-nuclei-seg").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults_match_settings() -> Result<()> {
        let settings = parse(&["slides"]).to_settings()?;
        assert_eq!(settings, SegmentationSettings::default());
        Ok(())
    }

    #[test]
    fn test_flags_map_to_settings() -> Result<()> {
        let config = parse(&[
            "slides",
            "--model",
            "dsb2018_paper",
            "--trained-thresholds",
            "--no-normalize",
            "--otsu",
            "--max-size",
            "2500",
        ]);
        let settings = config.to_settings()?;

        assert_eq!(settings.model, ModelChoice::Dsb2018Paper);
        assert_eq!(settings.nms_thresh, 0.5);
        assert!(!settings.normalize_input);
        assert_eq!(settings.fallback_threshold, FallbackThreshold::Otsu);
        assert_eq!(settings.max_nucleus_size, 2500.0);
        Ok(())
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Config::try_parse_from(["he-nuclei-seg", "x", "--model", "unet"]).is_err());
        assert!(parse(&["x", "--prob-thresh", "1.5"]).to_settings().is_err());
    }

    #[test]
    fn test_collect_inputs() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let subdir = temp_dir.path().join("case_01");
        fs::create_dir_all(&subdir)?;
        for name in ["b.png", "a.TIF", "notes.txt"] {
            fs::write(subdir.join(name), b"")?;
        }

        let config = parse(&[temp_dir.path().to_str().unwrap()]);
        let inputs = config.collect_inputs()?;
        assert_eq!(inputs, vec![subdir.join("a.TIF"), subdir.join("b.png")]);

        let single = parse(&[subdir.join("b.png").to_str().unwrap()]);
        assert_eq!(single.collect_inputs()?, vec![subdir.join("b.png")]);

        let missing = parse(&["/nonexistent/input"]);
        assert!(matches!(
            missing.collect_inputs(),
            Err(NucleiSegError::FileSystem { .. })
        ));
        Ok(())
    }
}
