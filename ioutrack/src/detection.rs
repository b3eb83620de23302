//! Boundary value types shared by the tracker and its callers

use crate::bbox::Bbox;
use anyhow::{bail, Result};
use ndarray::ArrayView2;
use num::cast;

/// Width of a raw detection row: [x1, y1, x2, y2, confidence, class_id]
pub const DETECTION_ROW_LEN: usize = 6;

/// One object reported by the detector for one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub bbox: Bbox<f32>,
    pub confidence: f32,
    pub class_id: u32,
}

impl Detection {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32, class_id: u32) -> Self {
        Self {
            bbox: Bbox::new(x1, y1, x2, y2),
            confidence,
            class_id,
        }
    }

    /// Reject values no detector should produce: non-finite coordinates,
    /// inverted boxes, or a confidence outside [0, 1].
    pub fn validate(&self) -> Result<()> {
        if !self.bbox.is_finite() {
            bail!("non-finite box coordinates: {}", self.bbox);
        }
        if self.bbox.xmax < self.bbox.xmin || self.bbox.ymax < self.bbox.ymin {
            bail!("inverted box: {}", self.bbox);
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            bail!("confidence {} outside [0, 1]", self.confidence);
        }
        Ok(())
    }

    /// Parse one raw row `[x1, y1, x2, y2, confidence, class_id]`
    pub fn from_row(row: &[f32]) -> Result<Self> {
        if row.len() != DETECTION_ROW_LEN {
            bail!(
                "expected {} values per detection, got {}",
                DETECTION_ROW_LEN,
                row.len()
            );
        }
        let class_id: u32 = match cast(row[5]) {
            Some(id) if row[5].fract() == 0.0 => id,
            _ => bail!("invalid class id {}", row[5]),
        };

        let detection = Self::new(row[0], row[1], row[2], row[3], row[4], class_id);
        detection.validate()?;
        Ok(detection)
    }
}

/// Parse an Nx6 detection array. Any malformed row fails the whole frame.
pub fn parse_detection_rows(rows: ArrayView2<f32>) -> Result<Vec<Detection>> {
    if rows.nrows() > 0 && rows.ncols() != DETECTION_ROW_LEN {
        bail!(
            "detection array has {} columns, expected {}",
            rows.ncols(),
            DETECTION_ROW_LEN
        );
    }

    rows.outer_iter()
        .map(|row| Detection::from_row(&row.to_vec()))
        .collect()
}

/// One track reported by the tracker for one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackedObject {
    pub track_id: u32,
    pub bbox: Bbox<f32>,
    pub confidence: f32,
    pub class_id: u32,
}
