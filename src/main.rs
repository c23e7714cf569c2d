use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use rayon::{prelude::*, ThreadPoolBuilder};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use he_nuclei_seg::{
    summarize, Config, ImageData, InferenceAdapter, NuclearSegmentation, NucleusRoi,
    OrtStarDistModel,
};

fn main() -> Result<()> {
    let config = Config::parse();
    init_tracing(config.verbose);

    let settings = config.to_settings()?;
    let image_paths = config.collect_inputs()?;
    if let Some(num_threads) = config.num_threads {
        ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build_global()?;
    }

    let backend = OrtStarDistModel::new(
        config.model_path.clone().unwrap_or_default(),
        settings.model.id(),
        config.device_id,
    );
    let adapter = Arc::new(InferenceAdapter::new(backend, &settings));
    if adapter.is_available() {
        info!(model = %settings.model, "using StarDist model");
    } else {
        warn!("model unavailable, using the fallback segmenter");
    }

    if image_paths.is_empty() {
        println!("No images found in {}", config.input.display());
        return Ok(());
    }

    let progress_bar = ProgressBar::new(image_paths.len() as u64);
    progress_bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec} {eta})",
        )?
        .progress_chars("#>-"),
    );

    let results = image_paths
        .par_iter()
        .progress_with(progress_bar.clone())
        .map(|path| -> Result<(PathBuf, Vec<NucleusRoi>)> {
            let decoded = image::open(path)
                .with_context(|| format!("Failed to open image: {}", path.display()))?;
            let image = ImageData::from_dynamic(&decoded)
                .with_context(|| format!("Unsupported image: {}", path.display()))?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let mut run = NuclearSegmentation::new(&image, file_name, settings.clone(), adapter.clone())?;
            let rois = run
                .segment_nuclei()
                .with_context(|| format!("Failed to segment image: {}", path.display()))?;
            Ok((path.clone(), rois))
        })
        .collect::<Result<Vec<_>>>()?;

    progress_bar.finish();

    for (path, rois) in &results {
        println!("{}: {}", path.display(), summarize(rois));
        if config.verbose {
            for roi in rois {
                println!("  {roi}");
            }
        }
    }

    adapter.close();
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
