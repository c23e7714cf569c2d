//! Measurement of labelled regions shared by the decoder and the fallback
//! segmenter.

use std::collections::HashMap;

use image::{GrayImage, Luma};
use imageproc::contours::{find_contours, BorderType};
use ndarray::ArrayView2;

use crate::roi::{BoundingBox, NucleusRoi, Point, RoiMask, SegmentationMethod};

/// One labelled region, before it becomes a [`NucleusRoi`].
#[derive(Debug, Clone)]
pub(crate) struct Region {
    pub label: u32,
    pub area: usize,
    pub bbox: BoundingBox,
    /// Highest probability inside the region, when a probability map was given.
    pub max_probability: Option<f32>,
    pub touches_border: bool,
    mask: Vec<bool>,
}

impl Region {
    /// Build the ROI; `None` if the region is empty.
    pub fn into_roi(
        self,
        name: String,
        image_file_name: &str,
        method: SegmentationMethod,
    ) -> Option<NucleusRoi> {
        let polygon = outer_contour(&self.mask, self.bbox);
        let score = self.max_probability;
        let mask = RoiMask::new(self.bbox, self.mask);
        NucleusRoi::new(name, image_file_name, method, polygon, mask, score)
    }
}

#[derive(Debug)]
struct Accumulator {
    label: u32,
    area: usize,
    min_x: usize,
    min_y: usize,
    max_x: usize,
    max_y: usize,
    max_probability: f32,
}

/// Collect every non-zero label of `labels`, ordered by the raster position
/// of each label's first pixel.
///
/// The order only depends on where instances are, not on how they are
/// numbered, so two label maps that differ by a permutation of label values
/// yield the same sequence.
pub(crate) fn measure_regions(
    labels: ArrayView2<u32>,
    probability: Option<ArrayView2<f32>>,
) -> Vec<Region> {
    let (height, width) = labels.dim();
    let mut index_of: HashMap<u32, usize> = HashMap::new();
    let mut acc: Vec<Accumulator> = Vec::new();

    for ((y, x), &label) in labels.indexed_iter() {
        if label == 0 {
            continue;
        }
        let p = probability.as_ref().map_or(f32::NEG_INFINITY, |p| p[[y, x]]);
        let idx = *index_of.entry(label).or_insert_with(|| {
            acc.push(Accumulator {
                label,
                area: 0,
                min_x: x,
                min_y: y,
                max_x: x,
                max_y: y,
                max_probability: f32::NEG_INFINITY,
            });
            acc.len() - 1
        });

        let a = &mut acc[idx];
        a.area += 1;
        a.min_x = a.min_x.min(x);
        a.max_x = a.max_x.max(x);
        a.max_y = y;
        a.max_probability = a.max_probability.max(p);
    }

    let mut regions: Vec<Region> = acc
        .into_iter()
        .map(|a| {
            let bbox = BoundingBox {
                x: a.min_x as u32,
                y: a.min_y as u32,
                width: (a.max_x - a.min_x + 1) as u32,
                height: (a.max_y - a.min_y + 1) as u32,
            };
            Region {
                label: a.label,
                area: a.area,
                bbox,
                max_probability: probability.as_ref().map(|_| a.max_probability),
                touches_border: a.min_x == 0
                    || a.min_y == 0
                    || a.max_x + 1 == width
                    || a.max_y + 1 == height,
                mask: vec![false; bbox.width as usize * bbox.height as usize],
            }
        })
        .collect();

    for (i, region) in regions.iter_mut().enumerate() {
        debug_assert_eq!(index_of[&region.label], i);
        let BoundingBox { x, y, width, height } = region.bbox;
        let (x, y, width, height) = (x as usize, y as usize, width as usize, height as usize);
        for dy in 0..height {
            for dx in 0..width {
                if labels[[y + dy, x + dx]] == region.label {
                    region.mask[dy * width + dx] = true;
                }
            }
        }
    }

    regions
}

/// Outer boundary of the mask in image coordinates.
///
/// When the mask has several pieces the longest outer contour is used.
fn outer_contour(mask: &[bool], bbox: BoundingBox) -> Vec<Point> {
    // One pixel of padding so that regions on the bbox edge still close.
    let (w, h) = (bbox.width, bbox.height);
    let mut padded = GrayImage::new(w + 2, h + 2);
    for (i, _) in mask.iter().enumerate().filter(|(_, m)| **m) {
        let (x, y) = (i as u32 % w, i as u32 / w);
        padded.put_pixel(x + 1, y + 1, Luma([255]));
    }

    find_contours::<i32>(&padded)
        .into_iter()
        .filter(|c| matches!(c.border_type, BorderType::Outer))
        .max_by_key(|c| c.points.len())
        .map(|c| {
            c.points
                .into_iter()
                .map(|p| {
                    Point::new(
                        (p.x - 1 + bbox.x as i32) as f64,
                        (p.y - 1 + bbox.y as i32) as f64,
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}
