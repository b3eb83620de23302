//! Multi-object tracking implementations
//!
//! Callers that only need per-frame tracks program against [`MultiObjectTracker`].

use crate::detection::{Detection, TrackedObject};

mod sorttrack;

pub use sorttrack::{SortConfig, SortTracker, TrackerStatistics};

/// Common interface for multi-object trackers
pub trait MultiObjectTracker: Send {
    /// Update tracker with the detections of one frame
    ///
    /// # Returns
    /// Tracks to report for this frame, in ascending track id order
    fn update(&mut self, detections: &[Detection]) -> Vec<TrackedObject>;

    /// Drop all tracks
    fn clear_tracks(&mut self);

    /// Remove specific track by ID
    fn remove_track(&mut self, track_id: u32);

    /// Get number of live tracks
    fn num_tracks(&self) -> usize;

    /// Get number of frames processed
    fn frame_count(&self) -> u64;
}

impl MultiObjectTracker for SortTracker {
    fn update(&mut self, detections: &[Detection]) -> Vec<TrackedObject> {
        self.update(detections)
    }

    fn clear_tracks(&mut self) {
        self.clear_tracks()
    }

    fn remove_track(&mut self, track_id: u32) {
        self.remove_track(track_id)
    }

    fn num_tracks(&self) -> usize {
        self.tracklets.len()
    }

    fn frame_count(&self) -> u64 {
        self.frame_count
    }
}
