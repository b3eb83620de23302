//! Single bounding box track driven by a constant-velocity Kalman filter

use crate::bbox::Bbox;
use crate::detection::{Detection, TrackedObject};
use crate::kalman::{KalmanFilter, KalmanFilterParams};
use anyhow::Result;
use nalgebra::{SMatrix, SVector};

/// Filter over [cx, cy, area, aspect_ratio, dcx, dcy, darea, daspect]
/// observing [cx, cy, area, aspect_ratio]
type BoxFilter = KalmanFilter<8, 4>;

#[derive(Debug, Clone)]
pub struct KalmanBoxTrackerParams {
    pub id: u32,
    pub detection: Detection,
    /// Diagonal of the measurement noise covariance matrix
    /// i.e. uncertainties of (cx, cy, area, aspect) measurements
    /// default = [1., 1., 1., 1.]
    pub meas_var: Option<[f32; 4]>,
    /// Diagonal of the process noise covariance matrix
    /// default = [1., 1., 1., 1., 0.01, 0.01, 0.01, 0.01]
    pub proc_var: Option<[f32; 8]>,
}

#[derive(Debug, Clone)]
pub struct KalmanBoxTracker {
    /// track id
    pub id: u32,
    pub class_id: u32,
    /// confidence of the last matched detection
    pub confidence: f32,
    /// box reported for the current frame: the matched detection, or the
    /// filter prediction while unmatched
    pub bbox: Bbox<f32>,
    kf: BoxFilter,
    /// number of frames the track has existed
    pub age: u32,
    /// number of frames with a matching detection
    pub hits: u32,
    /// number of consecutive frames without a matching detection
    pub time_since_update: u32,
}

impl KalmanBoxTracker {
    pub fn new(p: KalmanBoxTrackerParams) -> Self {
        let meas_var = p.meas_var.unwrap_or([1.0; 4]);
        let proc_var = p
            .proc_var
            .unwrap_or([1.0, 1.0, 1.0, 1.0, 0.01, 0.01, 0.01, 0.01]);

        let z = p.detection.bbox.to_z();
        let x = SVector::<f32, 8>::from([z[0], z[1], z[2], z[3], 0.0, 0.0, 0.0, 0.0]);

        // Position-like terms += their velocity every frame
        let mut f = SMatrix::<f32, 8, 8>::identity();
        for i in 0..4 {
            f[(i, i + 4)] = 1.0;
        }

        // Velocities start unknown
        let mut p0 = SMatrix::<f32, 8, 8>::identity();
        for i in 4..8 {
            p0[(i, i)] = 1000.0;
        }

        let params = KalmanFilterParams {
            x,
            p: p0,
            f,
            h: SMatrix::<f32, 4, 8>::from_fn(|r, c| if r == c { 1.0 } else { 0.0 }),
            r: SMatrix::from_diagonal(&SVector::from(meas_var)),
            q: SMatrix::from_diagonal(&SVector::from(proc_var)),
        };

        KalmanBoxTracker {
            id: p.id,
            class_id: p.detection.class_id,
            confidence: p.detection.confidence,
            bbox: p.detection.bbox,
            kf: KalmanFilter::new(params),
            age: 1,
            hits: 1,
            time_since_update: 0,
        }
    }

    /// Advance the filter one frame and adopt the prediction as the track box
    pub fn predict(&mut self) -> Bbox<f32> {
        // Keep the predicted area from going negative
        if self.kf.x[6] + self.kf.x[2] <= 0.0 {
            self.kf.x[6] = 0.0;
        }

        self.kf.predict();
        self.bbox = self.filter_bbox();
        self.bbox
    }

    /// Correct the filter with a matched detection
    pub fn update(&mut self, detection: &Detection) -> Result<()> {
        let z = SVector::<f32, 4>::from(detection.bbox.to_z());
        self.kf.update(z)?;

        self.bbox = detection.bbox;
        self.confidence = detection.confidence;
        self.class_id = detection.class_id;
        self.hits += 1;
        self.age += 1;
        self.time_since_update = 0;
        Ok(())
    }

    /// Account for a frame without a matching detection
    pub fn mark_missed(&mut self) {
        self.age += 1;
        self.time_since_update += 1;
    }

    /// Box implied by the current filter state
    pub fn filter_bbox(&self) -> Bbox<f32> {
        let state = self.kf.state();
        Bbox::from_z(&[state[0], state[1], state[2], state[3]])
    }

    pub fn to_tracked_object(&self) -> TrackedObject {
        TrackedObject {
            track_id: self.id,
            bbox: self.bbox,
            confidence: self.confidence,
            class_id: self.class_id,
        }
    }
}
