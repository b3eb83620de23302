//! Class-aware SORT (Simple Online Real-time Tracking)
//!
//! Detections are only ever associated with tracks of the same class id.

use crate::bbox::{class_ious, Bbox};
use crate::box_tracker::{KalmanBoxTracker, KalmanBoxTrackerParams};
use crate::detection::{parse_detection_rows, Detection, TrackedObject};
use crate::hungarian::HungarianSolver;
use anyhow::Result;
use ndarray::ArrayView2;
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Tracker tuning
#[derive(Debug, Clone)]
pub struct SortConfig {
    /// Frames a track survives without a matching detection
    pub max_age: u32,
    /// Hits before a track is reported once its grace period is over
    pub min_hits: u32,
    /// Minimum IoU for a detection/track match
    pub iou_threshold: f32,
    /// Measurement noise covariance diagonal
    pub measurement_noise: [f32; 4],
    /// Process noise covariance diagonal
    pub process_noise: [f32; 8],
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            max_age: 15,
            min_hits: 3,
            iou_threshold: 0.3,
            measurement_noise: [1.0, 1.0, 1.0, 1.0],
            process_noise: [1.0, 1.0, 1.0, 1.0, 0.01, 0.01, 0.01, 0.01],
        }
    }
}

/// Snapshot of tracker counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerStatistics {
    pub total_tracks_created: u32,
    pub active_tracks: usize,
    pub frame_count: u64,
}

/// Matches of one frame: (track_id, detection index), plus unmatched detections
type Association = (Vec<(u32, usize)>, Vec<usize>);

/// SORT tracker with per-class association
#[derive(Debug, Clone)]
pub struct SortTracker {
    config: SortConfig,
    next_track_id: u32,
    pub tracklets: BTreeMap<u32, KalmanBoxTracker>,
    pub frame_count: u64,
}

impl SortTracker {
    pub fn new(config: SortConfig) -> Self {
        log::info!(
            "Creating SortTracker: max_age={}, min_hits={}, iou_threshold={:.3}",
            config.max_age,
            config.min_hits,
            config.iou_threshold
        );
        SortTracker {
            config,
            next_track_id: 1,
            tracklets: BTreeMap::new(),
            frame_count: 0,
        }
    }

    pub fn config(&self) -> &SortConfig {
        &self.config
    }

    /// Predict new positions for all tracklets and drop any whose prediction
    /// is no longer a finite box
    fn predict_and_cleanup(&mut self) {
        let invalid: Vec<u32> = self
            .tracklets
            .par_iter_mut()
            .filter_map(|(track_id, tracklet)| {
                let b = tracklet.predict();
                if b.is_finite() {
                    None
                } else {
                    Some(*track_id)
                }
            })
            .collect();

        for track_id in invalid {
            log::warn!("Dropping track {} with non-finite prediction", track_id);
            self.tracklets.remove(&track_id);
        }
    }

    /// Associate detections with predicted tracks of the same class
    fn associate(&self, detections: &[Detection]) -> Association {
        if detections.is_empty() || self.tracklets.is_empty() {
            return (Vec::new(), (0..detections.len()).collect());
        }

        let track_ids: Vec<u32> = self.tracklets.keys().copied().collect();
        let track_boxes: Vec<(Bbox<f32>, u32)> = self
            .tracklets
            .values()
            .map(|t| (t.bbox, t.class_id))
            .collect();
        let det_boxes: Vec<(Bbox<f32>, u32)> =
            detections.iter().map(|d| (d.bbox, d.class_id)).collect();

        let ious = class_ious(&det_boxes, &track_boxes);
        let result = HungarianSolver::solve_iou(ious.view(), self.config.iou_threshold);

        let matches = result
            .assignments
            .iter()
            .map(|&(det_idx, track_idx)| (track_ids[track_idx], det_idx))
            .collect();

        (matches, result.unassigned_detections)
    }

    /// Correct matched tracklets; a tracklet whose filter cannot be corrected is dropped
    fn update_tracklets(&mut self, matches: &[(u32, usize)], detections: &[Detection]) {
        for &(track_id, det_idx) in matches {
            if let Some(tracklet) = self.tracklets.get_mut(&track_id) {
                if let Err(e) = tracklet.update(&detections[det_idx]) {
                    log::warn!("Failed to update track {}: {}", track_id, e);
                    self.tracklets.remove(&track_id);
                }
            }
        }
    }

    /// Create new tracklets from unmatched detections
    fn create_tracklets(&mut self, detections: &[Detection], unmatched: &[usize]) {
        for &det_idx in unmatched {
            let id = self.next_track_id;
            self.next_track_id += 1;
            self.tracklets.insert(
                id,
                KalmanBoxTracker::new(KalmanBoxTrackerParams {
                    id,
                    detection: detections[det_idx],
                    meas_var: Some(self.config.measurement_noise),
                    proc_var: Some(self.config.process_noise),
                }),
            );
            log::debug!(
                "New track {} (class {}) at {}",
                id,
                detections[det_idx].class_id,
                detections[det_idx].bbox
            );
        }
    }

    /// Remove tracklets that have gone unmatched for more than `max_age` frames
    fn remove_stale_tracklets(&mut self) {
        let max_age = self.config.max_age;
        self.tracklets
            .retain(|_, tracklet| tracklet.time_since_update <= max_age);
    }

    /// Tracks confirmed by enough hits, plus young tracks still in their grace period
    fn reported_tracks(&self) -> Vec<TrackedObject> {
        let min_hits = self.config.min_hits;
        self.tracklets
            .values()
            .filter(|t| t.hits >= min_hits || t.age < min_hits)
            .map(KalmanBoxTracker::to_tracked_object)
            .collect()
    }

    /// Main update function - one call per frame
    pub fn update(&mut self, detections: &[Detection]) -> Vec<TrackedObject> {
        self.frame_count += 1;

        let detections: &[Detection] = match detections.iter().try_for_each(Detection::validate) {
            Ok(()) => detections,
            Err(e) => {
                log::warn!(
                    "Frame {}: malformed detections ({}), continuing on prediction only",
                    self.frame_count,
                    e
                );
                &[]
            }
        };

        // Step 1: Predict new positions for all tracklets
        self.predict_and_cleanup();

        // Step 2: Class-constrained association
        let (matches, unmatched_detections) = self.associate(detections);

        // Step 3: Correct matched tracklets
        let matched_ids: Vec<u32> = matches.iter().map(|&(id, _)| id).collect();
        self.update_tracklets(&matches, detections);

        // Step 4: Age unmatched tracklets
        for (track_id, tracklet) in self.tracklets.iter_mut() {
            if !matched_ids.contains(track_id) {
                tracklet.mark_missed();
            }
        }

        // Step 5: Create new tracklets from unmatched detections
        self.create_tracklets(detections, &unmatched_detections);

        // Step 6: Evict stale tracklets
        self.remove_stale_tracklets();

        self.reported_tracks()
    }

    /// Update from a raw Nx6 array of `[x1, y1, x2, y2, confidence, class_id]` rows.
    /// An unparseable frame counts as a frame without detections.
    pub fn update_rows(&mut self, rows: ArrayView2<f32>) -> Vec<TrackedObject> {
        let detections = parse_detections_or_empty(rows, self.frame_count + 1);
        self.update(&detections)
    }

    /// Drop every track. Track ids keep increasing afterwards.
    pub fn clear_tracks(&mut self) {
        self.tracklets.clear();
    }

    /// Remove a single track by id
    pub fn remove_track(&mut self, track_id: u32) {
        self.tracklets.remove(&track_id);
    }

    pub fn num_tracks(&self) -> usize {
        self.tracklets.len()
    }

    pub fn statistics(&self) -> TrackerStatistics {
        TrackerStatistics {
            total_tracks_created: self.next_track_id - 1,
            active_tracks: self.tracklets.len(),
            frame_count: self.frame_count,
        }
    }
}

fn parse_detections_or_empty(rows: ArrayView2<f32>, frame: u64) -> Vec<Detection> {
    let parsed: Result<Vec<Detection>> = parse_detection_rows(rows);
    parsed.unwrap_or_else(|e| {
        log::warn!(
            "Frame {}: unparseable detection array ({}), treating as empty",
            frame,
            e
        );
        Vec::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn det(x: f32, y: f32, class_id: u32) -> Detection {
        Detection::new(x, y, x + 40.0, y + 40.0, 0.9, class_id)
    }

    fn ids(tracks: &[TrackedObject]) -> Vec<u32> {
        tracks.iter().map(|t| t.track_id).collect()
    }

    #[test]
    fn test_first_update_reports_new_tracks() {
        let mut tracker = SortTracker::new(SortConfig::default());
        let tracks = tracker.update(&[det(10.0, 10.0, 0), det(200.0, 200.0, 1)]);

        assert_eq!(ids(&tracks), vec![1, 2]);
        assert_eq!(tracks[1].class_id, 1);
    }

    #[test]
    fn test_identity_is_stable_across_frames() {
        let mut tracker = SortTracker::new(SortConfig::default());
        tracker.update(&[det(10.0, 10.0, 0)]);

        for step in 1..10 {
            let y = 10.0 + step as f32 * 4.0;
            let tracks = tracker.update(&[det(10.0, y, 0)]);
            assert_eq!(ids(&tracks), vec![1]);
        }
        assert_eq!(tracker.statistics().total_tracks_created, 1);
    }

    #[test]
    fn test_overlapping_detections_of_different_classes_stay_separate() {
        let mut tracker = SortTracker::new(SortConfig::default());
        tracker.update(&[det(10.0, 10.0, 0)]);

        // Same box, different class: must not continue track 1
        let tracks = tracker.update(&[det(10.0, 10.0, 1)]);
        let new_track = tracks.iter().find(|t| t.class_id == 1).unwrap();
        assert_eq!(new_track.track_id, 2);

        // Both classes present together keep their own ids
        let tracks = tracker.update(&[det(10.0, 10.0, 0), det(10.0, 10.0, 1)]);
        let mut pairs: Vec<(u32, u32)> = tracks.iter().map(|t| (t.track_id, t.class_id)).collect();
        pairs.sort();
        assert_eq!(pairs, vec![(1, 0), (2, 1)]);
    }

    #[test]
    fn test_low_iou_match_creates_new_track() {
        let mut tracker = SortTracker::new(SortConfig::default());
        tracker.update(&[det(10.0, 10.0, 0)]);
        let tracks = tracker.update(&[det(300.0, 300.0, 0)]);
        assert!(tracks.iter().any(|t| t.track_id == 2));
    }

    #[test]
    fn test_track_evicted_after_max_age() {
        let config = SortConfig {
            max_age: 2,
            ..SortConfig::default()
        };
        let mut tracker = SortTracker::new(config);
        tracker.update(&[det(10.0, 10.0, 0)]);

        tracker.update(&[]);
        tracker.update(&[]);
        assert_eq!(tracker.num_tracks(), 1); // time_since_update == 2
        tracker.update(&[]);
        assert_eq!(tracker.num_tracks(), 0); // time_since_update == 3 > max_age
    }

    #[test]
    fn test_unconfirmed_track_disappears_after_grace_period() {
        let mut tracker = SortTracker::new(SortConfig::default());
        tracker.update(&[det(10.0, 10.0, 0)]);

        // age 2 < min_hits: still reported on prediction
        assert_eq!(ids(&tracker.update(&[])), vec![1]);
        // age 3, hits 1: hidden but kept alive
        assert!(tracker.update(&[]).is_empty());
        assert_eq!(tracker.num_tracks(), 1);
    }

    #[test]
    fn test_confirmed_track_keeps_reporting_prediction() {
        let mut tracker = SortTracker::new(SortConfig::default());
        for _ in 0..3 {
            tracker.update(&[det(10.0, 10.0, 0)]);
        }
        let tracks = tracker.update(&[]);
        assert_eq!(ids(&tracks), vec![1]);
        assert!(tracks[0].bbox.is_finite());
    }

    #[test]
    fn test_malformed_frame_is_treated_as_empty() {
        let mut tracker = SortTracker::new(SortConfig::default());
        tracker.update(&[det(10.0, 10.0, 0)]);

        let bad = Detection::new(f32::NAN, 0.0, 10.0, 10.0, 0.9, 0);
        let tracks = tracker.update(&[det(10.0, 10.0, 0), bad]);

        // No new track was created and track 1 went unmatched
        assert_eq!(tracker.statistics().total_tracks_created, 1);
        assert_eq!(ids(&tracks), vec![1]);
        assert_eq!(tracker.tracklets[&1].time_since_update, 1);
    }

    #[test]
    fn test_update_rows() {
        let mut tracker = SortTracker::new(SortConfig::default());
        let rows = array![[10.0, 10.0, 50.0, 50.0, 0.9, 4.0]];
        let tracks = tracker.update_rows(rows.view());
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].class_id, 4);

        let narrow = array![[10.0, 10.0, 50.0, 50.0, 0.9]];
        tracker.update_rows(narrow.view());
        assert_eq!(tracker.statistics().total_tracks_created, 1);
    }

    #[test]
    fn test_ids_are_not_reused_after_clear() {
        let mut tracker = SortTracker::new(SortConfig::default());
        tracker.update(&[det(10.0, 10.0, 0)]);
        tracker.clear_tracks();
        assert_eq!(tracker.num_tracks(), 0);

        let tracks = tracker.update(&[det(10.0, 10.0, 0)]);
        assert_eq!(ids(&tracks), vec![2]);
    }

    #[test]
    fn test_empty_frames_on_empty_tracker() {
        let mut tracker = SortTracker::new(SortConfig::default());
        assert!(tracker.update(&[]).is_empty());
        assert_eq!(tracker.statistics().frame_count, 1);
    }
}
