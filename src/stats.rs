use std::collections::BTreeMap;
use std::fmt;

use crate::roi::NucleusRoi;

/// Aggregate numbers over one run's ROIs.
#[derive(Debug, Clone, PartialEq)]
pub struct RoiStatistics {
    pub count: usize,
    pub total_area: f64,
    pub mean_area: f64,
    pub min_area: f64,
    pub max_area: f64,
    /// ROI count per method tag, ordered by tag.
    pub methods: BTreeMap<String, usize>,
}

impl RoiStatistics {
    /// `None` when there are no ROIs.
    pub fn from_rois(rois: &[NucleusRoi]) -> Option<Self> {
        if rois.is_empty() {
            return None;
        }

        let mut methods = BTreeMap::new();
        for roi in rois {
            *methods
                .entry(roi.segmentation_method().to_string())
                .or_insert(0) += 1;
        }

        let areas = rois.iter().map(NucleusRoi::area);
        let total_area: f64 = areas.clone().sum();
        Some(Self {
            count: rois.len(),
            total_area,
            mean_area: total_area / rois.len() as f64,
            min_area: areas.clone().fold(f64::INFINITY, f64::min),
            max_area: areas.fold(f64::NEG_INFINITY, f64::max),
            methods,
        })
    }
}

impl fmt::Display for RoiStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Nuclei: {}, Total area: {:.1} px, Avg area: {:.1} px (range: {:.1}-{:.1}), Methods: ",
            self.count, self.total_area, self.mean_area, self.min_area, self.max_area
        )?;
        for (i, (method, count)) in self.methods.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{method}={count}")?;
        }
        Ok(())
    }
}

/// One-line summary of a run's ROIs.
pub fn summarize(rois: &[NucleusRoi]) -> String {
    RoiStatistics::from_rois(rois).map_or_else(|| "No nuclei detected".to_string(), |s| s.to_string())
}
