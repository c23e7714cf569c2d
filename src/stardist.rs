//! Star-convex polygon non-maximum suppression.
//!
//! StarDist predicts, for every pixel, the probability of being inside a
//! nucleus and the distance to the nucleus boundary along `n_rays` equally
//! spaced rays. Each pixel above the probability threshold proposes the
//! polygon spanned by its rays; overlapping proposals are suppressed greedily
//! in order of decreasing probability and the survivors are painted into an
//! instance label map.

use std::f32::consts::PI;

use ndarray::{Array2, ArrayView1};
use tracing::debug;

use crate::errors::{NucleiSegError, Result};
use crate::settings::SegmentationSettings;
use crate::traits::RawPrediction;

/// Rays shorter than this do not span a polygon.
const MIN_RAY_LENGTH: f32 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NmsParams {
    pub prob_thresh: f32,
    /// Maximum IoU with an already kept polygon.
    pub nms_thresh: f32,
    /// Candidates closer than this to any border are ignored.
    pub exclude_boundary: u32,
}

impl From<&SegmentationSettings> for NmsParams {
    fn from(settings: &SegmentationSettings) -> Self {
        Self {
            prob_thresh: settings.prob_thresh,
            nms_thresh: settings.nms_thresh,
            exclude_boundary: settings.exclude_boundary,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    prob: f32,
    y: usize,
    x: usize,
}

/// Turn a raw prediction into an instance label map (0 = background).
pub fn instance_labels(raw: &RawPrediction, params: &NmsParams) -> Result<Array2<u32>> {
    let (height, width) = raw.probability.dim();
    let (dh, dw, n_rays) = raw.distances.dim();
    if (dh, dw) != (height, width) {
        return Err(NucleiSegError::model_execution(
            "validate prediction shape",
            format!("probability map is {height}x{width} but distances are {dh}x{dw}"),
        ));
    }
    if n_rays < 3 {
        return Err(NucleiSegError::model_execution(
            "validate prediction shape",
            format!("need at least 3 rays, got {n_rays}"),
        ));
    }

    let candidates = collect_candidates(raw, params);
    let mut labels = Array2::<u32>::zeros((height, width));
    let mut kept_areas: Vec<usize> = Vec::new();
    let mut overlap: Vec<usize> = Vec::new();
    let mut suppressed = 0usize;

    for c in &candidates {
        let dist = raw.distances.slice(ndarray::s![c.y, c.x, ..]);
        if dist.iter().all(|d| *d < MIN_RAY_LENGTH) {
            continue;
        }
        let polygon = star_polygon(c.y as f32, c.x as f32, dist);
        let pixels = rasterize_polygon(&polygon, height, width);
        if pixels.is_empty() {
            continue;
        }

        overlap.clear();
        overlap.resize(kept_areas.len(), 0);
        for &(y, x) in &pixels {
            let label = labels[[y, x]];
            if label != 0 {
                overlap[label as usize - 1] += 1;
            }
        }

        let area = pixels.len();
        let too_close = overlap.iter().zip(&kept_areas).any(|(&inter, &kept)| {
            inter > 0 && (inter as f32 / (area + kept - inter) as f32) > params.nms_thresh
        });
        if too_close {
            suppressed += 1;
            continue;
        }

        kept_areas.push(area);
        let label = kept_areas.len() as u32;
        for (y, x) in pixels {
            let slot = &mut labels[[y, x]];
            if *slot == 0 {
                *slot = label;
            }
        }
    }

    debug!(
        candidates = candidates.len(),
        kept = kept_areas.len(),
        suppressed,
        "star-convex non-maximum suppression finished"
    );
    Ok(labels)
}

fn collect_candidates(raw: &RawPrediction, params: &NmsParams) -> Vec<Candidate> {
    let (height, width) = raw.probability.dim();
    let b = params.exclude_boundary as usize;
    if 2 * b >= height || 2 * b >= width {
        return Vec::new();
    }

    let mut candidates: Vec<Candidate> = raw
        .probability
        .indexed_iter()
        .filter(|&((y, x), &p)| {
            p > params.prob_thresh && y >= b && x >= b && y < height - b && x < width - b
        })
        .map(|((y, x), &prob)| Candidate { prob, y, x })
        .collect();

    // Highest probability first; raster order breaks ties.
    candidates.sort_by(|a, b| {
        b.prob
            .total_cmp(&a.prob)
            .then_with(|| (a.y, a.x).cmp(&(b.y, b.x)))
    });
    candidates
}

/// Vertices `(y, x)` of the polygon spanned by the rays at `(cy, cx)`.
fn star_polygon(cy: f32, cx: f32, dist: ArrayView1<f32>) -> Vec<(f32, f32)> {
    let n = dist.len() as f32;
    dist.iter()
        .enumerate()
        .map(|(k, &d)| {
            let phi = 2.0 * PI * k as f32 / n;
            (cy + d * phi.sin(), cx + d * phi.cos())
        })
        .collect()
}

/// Pixels whose centres lie inside the polygon, clipped to the image.
fn rasterize_polygon(polygon: &[(f32, f32)], height: usize, width: usize) -> Vec<(usize, usize)> {
    let (min_y, max_y) = polygon
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &(y, _)| {
            (lo.min(y), hi.max(y))
        });
    let y0 = min_y.ceil().max(0.0) as usize;
    let y1 = max_y.floor().min(height as f32 - 1.0);
    if y1 < 0.0 {
        return Vec::new();
    }
    let y1 = y1 as usize;

    let mut pixels = Vec::new();
    let mut crossings: Vec<f32> = Vec::with_capacity(polygon.len());
    for py in y0..=y1 {
        let fy = py as f32;
        crossings.clear();
        for (i, &(ay, ax)) in polygon.iter().enumerate() {
            let (by, bx) = polygon[(i + 1) % polygon.len()];
            // Half-open so a vertex on the scanline is counted once.
            if (ay <= fy && fy < by) || (by <= fy && fy < ay) {
                crossings.push(ax + (fy - ay) * (bx - ax) / (by - ay));
            }
        }
        crossings.sort_unstable_by(f32::total_cmp);

        for pair in crossings.chunks_exact(2) {
            let x0 = pair[0].ceil().max(0.0);
            let x1 = pair[1].floor().min(width as f32 - 1.0);
            if x1 < x0 {
                continue;
            }
            pixels.extend((x0 as usize..=x1 as usize).map(|px| (py, px)));
        }
    }
    pixels
}
