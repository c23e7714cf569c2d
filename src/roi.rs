use std::fmt;

use imageproc::geometry::{arc_length, contour_area, convex_hull};
use imageproc::point::Point as ImagePoint;

/// Which path produced a nucleus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SegmentationMethod {
    ModelBased { model_id: String },
    Fallback,
}

impl SegmentationMethod {
    pub fn model(model_id: impl Into<String>) -> Self {
        Self::ModelBased {
            model_id: model_id.into(),
        }
    }

    pub const fn is_model_based(&self) -> bool {
        matches!(self, Self::ModelBased { .. })
    }

    pub const fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback)
    }

    pub fn model_id(&self) -> Option<&str> {
        match self {
            Self::ModelBased { model_id } => Some(model_id),
            Self::Fallback => None,
        }
    }
}

impl fmt::Display for SegmentationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ModelBased { model_id } => write!(f, "model:{model_id}"),
            Self::Fallback => f.write_str("fallback"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Pixel-aligned box; `width` and `height` are at least 1 for a non-empty mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub const fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && y >= self.y && x - self.x < self.width && y - self.y < self.height
    }
}

/// Binary mask of a nucleus, stored over its bounding box.
#[derive(Debug, Clone, PartialEq)]
pub struct RoiMask {
    bbox: BoundingBox,
    bits: Vec<bool>,
}

impl RoiMask {
    pub(crate) fn new(bbox: BoundingBox, bits: Vec<bool>) -> Self {
        debug_assert_eq!(bits.len(), bbox.width as usize * bbox.height as usize);
        Self { bbox, bits }
    }

    pub const fn bbox(&self) -> BoundingBox {
        self.bbox
    }

    /// Whether image pixel `(x, y)` belongs to the nucleus.
    pub fn contains(&self, x: u32, y: u32) -> bool {
        if !self.bbox.contains(x, y) {
            return false;
        }
        let idx = (y - self.bbox.y) as usize * self.bbox.width as usize + (x - self.bbox.x) as usize;
        self.bits[idx]
    }

    pub fn pixel_count(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }

    /// Image coordinates of every pixel in the mask, in raster order.
    pub fn pixels(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let BoundingBox { x, y, width, .. } = self.bbox;
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, b)| **b)
            .map(move |(i, _)| (x + (i as u32 % width), y + (i as u32 / width)))
    }
}

/// One detected nucleus.
///
/// Only the decoder and the fallback segmenter create these; every field is
/// fixed at creation and the area is always strictly positive.
#[derive(Debug, Clone, PartialEq)]
pub struct NucleusRoi {
    name: String,
    image_file_name: String,
    method: SegmentationMethod,
    polygon: Vec<Point>,
    mask: RoiMask,
    area: f64,
    perimeter: f64,
    circularity: f64,
    aspect_ratio: f64,
    solidity: f64,
    centroid: Point,
    score: Option<f32>,
}

impl NucleusRoi {
    /// Returns `None` for an empty mask.
    pub(crate) fn new(
        name: String,
        image_file_name: &str,
        method: SegmentationMethod,
        polygon: Vec<Point>,
        mask: RoiMask,
        score: Option<f32>,
    ) -> Option<Self> {
        let count = mask.pixel_count();
        if count == 0 {
            return None;
        }
        let area = count as f64;

        let (sum_x, sum_y) = mask
            .pixels()
            .fold((0.0, 0.0), |(sx, sy), (x, y)| (sx + x as f64, sy + y as f64));
        let centroid = Point::new(sum_x / area, sum_y / area);

        let perimeter = polygon_perimeter(&polygon);
        let circularity = if perimeter > 0.0 {
            (4.0 * std::f64::consts::PI * area / (perimeter * perimeter)).min(1.0)
        } else {
            0.0
        };

        let bbox = mask.bbox();
        let aspect_ratio = bbox.width as f64 / bbox.height as f64;

        let hull_area = pixel_hull_area(&polygon);
        let solidity = if hull_area > 0.0 {
            (area / hull_area).min(1.0)
        } else {
            1.0
        };

        Some(Self {
            name,
            image_file_name: image_file_name.to_string(),
            method,
            polygon,
            mask,
            area,
            perimeter,
            circularity,
            aspect_ratio,
            solidity,
            centroid,
            score,
        })
    }

    /// Names are assigned after filtering, so they stay contiguous.
    pub(crate) fn renamed(mut self, name: String) -> Self {
        self.name = name;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image_file_name(&self) -> &str {
        &self.image_file_name
    }

    pub const fn segmentation_method(&self) -> &SegmentationMethod {
        &self.method
    }

    /// Outer boundary through the centres of the boundary pixels.
    pub fn polygon(&self) -> &[Point] {
        &self.polygon
    }

    pub const fn mask(&self) -> &RoiMask {
        &self.mask
    }

    pub const fn bbox(&self) -> BoundingBox {
        self.mask.bbox()
    }

    /// Pixel count of the nucleus.
    pub const fn area(&self) -> f64 {
        self.area
    }

    pub const fn perimeter(&self) -> f64 {
        self.perimeter
    }

    pub const fn circularity(&self) -> f64 {
        self.circularity
    }

    pub const fn aspect_ratio(&self) -> f64 {
        self.aspect_ratio
    }

    pub const fn solidity(&self) -> f64 {
        self.solidity
    }

    pub const fn centroid(&self) -> Point {
        self.centroid
    }

    /// Model confidence; `None` for fallback nuclei.
    pub const fn score(&self) -> Option<f32> {
        self.score
    }

    /// Number parsed from names like `Nucleus_5`.
    pub fn nucleus_number(&self) -> Option<u32> {
        self.name.rsplit_once('_')?.1.parse().ok()
    }

    pub fn morphology_summary(&self) -> String {
        format!(
            "Area: {:.1} px, Perimeter: {:.1} px, Circularity: {:.3}, Aspect Ratio: {:.2}, Solidity: {:.3}",
            self.area, self.perimeter, self.circularity, self.aspect_ratio, self.solidity
        )
    }
}

impl fmt::Display for NucleusRoi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NucleusROI[{}] - {} - Method: {}",
            self.name,
            self.morphology_summary(),
            self.method
        )
    }
}

/// Length of the closed polygon.
fn polygon_perimeter(points: &[Point]) -> f64 {
    let points: Vec<ImagePoint<f64>> = points.iter().map(|p| ImagePoint::new(p.x, p.y)).collect();
    match points.len() {
        0 | 1 => 0.0,
        // A two-vertex outline is walked there and back.
        2 => 2.0 * arc_length(&points, false),
        _ => arc_length(&points, true),
    }
}

/// Area of the convex hull over the pixel corners of every vertex, so the
/// hull always covers the pixel area. Vertices lie on the pixel grid.
fn pixel_hull_area(points: &[Point]) -> f64 {
    let mut corners: Vec<ImagePoint<i64>> = points
        .iter()
        .flat_map(|p| {
            let (x, y) = (p.x.round() as i64, p.y.round() as i64);
            [
                ImagePoint::new(x, y),
                ImagePoint::new(x + 1, y),
                ImagePoint::new(x, y + 1),
                ImagePoint::new(x + 1, y + 1),
            ]
        })
        .collect();
    // The hull scan needs distinct points.
    corners.sort_unstable_by_key(|p| (p.y, p.x));
    corners.dedup();
    contour_area(&convex_hull(corners))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_mask(size: u32) -> RoiMask {
        RoiMask::new(
            BoundingBox {
                x: 10,
                y: 20,
                width: size,
                height: size,
            },
            vec![true; (size * size) as usize],
        )
    }

    fn square_polygon(x: f64, y: f64, side: f64) -> Vec<Point> {
        vec![
            Point::new(x, y),
            Point::new(x + side, y),
            Point::new(x + side, y + side),
            Point::new(x, y + side),
        ]
    }

    #[test]
    fn test_method_tags() {
        assert_eq!(SegmentationMethod::model("he_heavy_augment").to_string(), "model:he_heavy_augment");
        assert_eq!(SegmentationMethod::Fallback.to_string(), "fallback");
        assert_eq!(SegmentationMethod::Fallback.model_id(), None);
    }

    #[test]
    fn test_empty_mask_is_rejected() {
        let mask = RoiMask::new(
            BoundingBox {
                x: 0,
                y: 0,
                width: 2,
                height: 1,
            },
            vec![false, false],
        );
        let roi = NucleusRoi::new(
            "Nucleus_1".into(),
            "a.png",
            SegmentationMethod::Fallback,
            vec![],
            mask,
            None,
        );
        assert!(roi.is_none());
    }

    #[test]
    fn test_square_morphology() {
        let roi = NucleusRoi::new(
            "Nucleus_7".into(),
            "slide.tif",
            SegmentationMethod::model("he_heavy_augment"),
            square_polygon(10.0, 20.0, 3.0),
            square_mask(4),
            Some(0.9),
        )
        .unwrap();

        assert_eq!(roi.area(), 16.0);
        assert_eq!(roi.perimeter(), 12.0);
        assert_eq!(roi.aspect_ratio(), 1.0);
        assert_eq!(roi.solidity(), 1.0);
        assert_eq!(roi.centroid(), Point::new(11.5, 21.5));
        assert_eq!(roi.nucleus_number(), Some(7));
        assert!(roi.circularity() > 0.0 && roi.circularity() <= 1.0);
        assert!(roi.mask().contains(13, 23));
        assert!(!roi.mask().contains(14, 23));
        assert!(roi.to_string().contains("Method: model:he_heavy_augment"));
    }

    #[test]
    fn test_concave_outline_morphology() {
        // L-shape: a 4x4 square missing its lower-right 2x2 quarter.
        let mut pixels = vec![true; 16];
        for (x, y) in [(2, 2), (3, 2), (2, 3), (3, 3)] {
            pixels[y * 4 + x] = false;
        }
        let mask = RoiMask::new(
            BoundingBox {
                x: 0,
                y: 0,
                width: 4,
                height: 4,
            },
            pixels,
        );
        let polygon = vec![
            Point::new(0.0, 0.0),
            Point::new(3.0, 0.0),
            Point::new(3.0, 1.0),
            Point::new(1.0, 1.0),
            Point::new(1.0, 3.0),
            Point::new(0.0, 3.0),
        ];
        let roi = NucleusRoi::new("Nucleus_1".into(), "l.png", SegmentationMethod::Fallback, polygon, mask, None)
            .unwrap();

        assert_eq!(roi.area(), 12.0);
        assert_eq!(roi.perimeter(), 12.0);
        // Hull over the pixel corners: the 4x4 square minus the cut corner triangle.
        assert_eq!(roi.solidity(), 12.0 / 14.0);
    }

    #[test]
    fn test_degenerate_outlines() {
        let pixel = NucleusRoi::new(
            "Nucleus_1".into(),
            "a.png",
            SegmentationMethod::Fallback,
            vec![Point::new(5.0, 5.0)],
            RoiMask::new(
                BoundingBox {
                    x: 5,
                    y: 5,
                    width: 1,
                    height: 1,
                },
                vec![true],
            ),
            None,
        )
        .unwrap();
        assert_eq!(pixel.perimeter(), 0.0);
        assert_eq!(pixel.circularity(), 0.0);
        assert_eq!(pixel.solidity(), 1.0);

        let bar = NucleusRoi::new(
            "Nucleus_2".into(),
            "a.png",
            SegmentationMethod::Fallback,
            vec![Point::new(0.0, 0.0), Point::new(2.0, 0.0)],
            RoiMask::new(
                BoundingBox {
                    x: 0,
                    y: 0,
                    width: 3,
                    height: 1,
                },
                vec![true; 3],
            ),
            None,
        )
        .unwrap();
        assert_eq!(bar.perimeter(), 4.0);
        assert_eq!(bar.solidity(), 1.0);
    }
}
