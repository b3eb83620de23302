//! Pure Rust IoU-based tracking library
//!
//! Class-aware SORT: every track owns a constant-velocity Kalman filter over
//! its box, and detections are assigned to tracks of the same class by
//! Hungarian matching on IoU.
//!
//! ```rust,ignore
//! use ioutrack::{Detection, MultiObjectTracker, SortConfig, SortTracker};
//!
//! let tracker = SortTracker::new(SortConfig::default());
//! let mut tracker: Box<dyn MultiObjectTracker> = Box::new(tracker);
//!
//! let detections = [Detection::new(10.0, 10.0, 50.0, 50.0, 0.9, 0)];
//! let tracks = tracker.update(&detections);
//! ```

pub mod bbox;
pub mod box_tracker;
pub mod detection;
pub mod hungarian; // Hungarian algorithm for optimal assignment
pub mod kalman;
pub mod trackers;

pub use bbox::Bbox;
pub use box_tracker::KalmanBoxTracker;
pub use detection::{parse_detection_rows, Detection, TrackedObject};
pub use hungarian::{AssignmentResult, HungarianSolver};
pub use trackers::{MultiObjectTracker, SortConfig, SortTracker, TrackerStatistics};
