//! Bounding box operations and IoU calculations

use ndarray::prelude::*;
use rayon::prelude::*;
use std::fmt;

/// Guards divisions by box heights and IoU unions
pub const EPSILON: f32 = 1e-6;

/// IoU value used for detection/track pairs that must never be matched
/// (different class ids)
pub const INVALID_IOU: f32 = -1.0;

/// Axis-aligned bounding box in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bbox<T = f32> {
    pub xmin: T,
    pub ymin: T,
    pub xmax: T,
    pub ymax: T,
}

impl Bbox<f32> {
    pub fn new(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
        }
    }

    pub fn width(&self) -> f32 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f32 {
        self.ymax - self.ymin
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center_x(&self) -> f32 {
        (self.xmin + self.xmax) / 2.0
    }

    pub fn center_y(&self) -> f32 {
        (self.ymin + self.ymax) / 2.0
    }

    pub fn center(&self) -> (f32, f32) {
        (self.center_x(), self.center_y())
    }

    /// All four coordinates are finite numbers
    pub fn is_finite(&self) -> bool {
        self.to_bounds().iter().all(|v| v.is_finite())
    }

    /// Convert to bounds array [xmin, ymin, xmax, ymax]
    pub fn to_bounds(&self) -> [f32; 4] {
        [self.xmin, self.ymin, self.xmax, self.ymax]
    }

    /// Convert to measurement form [center_x, center_y, area, aspect_ratio]
    ///
    /// Zero-height boxes do not divide by zero: the height is padded by [`EPSILON`].
    pub fn to_z(&self) -> [f32; 4] {
        let w = self.width();
        let h = self.height();
        [self.center_x(), self.center_y(), w * h, w / (h + EPSILON)]
    }

    /// Create from measurement form [center_x, center_y, area, aspect_ratio]
    pub fn from_z(z: &[f32; 4]) -> Self {
        let (cx, cy, area, aspect_ratio) = (z[0], z[1], z[2], z[3]);

        let w = (area * aspect_ratio).max(0.0).sqrt();
        let h = area / (w + EPSILON);

        Self {
            xmin: cx - w / 2.0,
            ymin: cy - h / 2.0,
            xmax: cx + w / 2.0,
            ymax: cy + h / 2.0,
        }
    }
}

impl<T: fmt::Display> fmt::Display for Bbox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bbox({}, {}, {}, {})",
            self.xmin, self.ymin, self.xmax, self.ymax
        )
    }
}

/// Calculate IoU between two bounding boxes.
///
/// Degenerate (zero-area) boxes yield 0.0 rather than NaN.
pub fn calculate_iou(bbox1: &Bbox<f32>, bbox2: &Bbox<f32>) -> f32 {
    let x1 = bbox1.xmin.max(bbox2.xmin);
    let y1 = bbox1.ymin.max(bbox2.ymin);
    let x2 = bbox1.xmax.min(bbox2.xmax);
    let y2 = bbox1.ymax.min(bbox2.ymax);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = bbox1.area() + bbox2.area() - intersection;

    intersection / (union + EPSILON)
}

/// Compute the class-constrained IoU matrix between detections and tracks.
///
/// Entry `(i, j)` is the IoU of detection `i` and track `j` when both carry the
/// same class id, and [`INVALID_IOU`] otherwise.
/// Returns: (n_detections, n_tracks) matrix
pub fn class_ious(detections: &[(Bbox<f32>, u32)], tracks: &[(Bbox<f32>, u32)]) -> Array2<f32> {
    let n_dets = detections.len();
    let n_tracks = tracks.len();

    if n_dets == 0 || n_tracks == 0 {
        return Array2::zeros((n_dets, n_tracks));
    }

    let iou_data: Vec<f32> = detections
        .par_iter()
        .flat_map_iter(|(det_box, det_class)| {
            tracks.iter().map(move |(track_box, track_class)| {
                if det_class == track_class {
                    calculate_iou(det_box, track_box)
                } else {
                    INVALID_IOU
                }
            })
        })
        .collect();

    Array2::from_shape_vec((n_dets, n_tracks), iou_data)
        .unwrap_or_else(|_| Array2::from_elem((n_dets, n_tracks), INVALID_IOU))
}
