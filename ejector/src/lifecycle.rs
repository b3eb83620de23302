//! Per-track zone and stability state
//!
//! The field of view is split into three horizontal bands by image row:
//! objects enter at the top (Entry), may fire while centered (Trigger), and are
//! forgotten once they pass below the trigger band (Exit).

use crate::config::EjectorConfig;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

/// Number of sightings kept per track for the stability checks
pub const HISTORY_LEN: usize = 3;

/// Zone a center row falls into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Zone {
    Entry,
    Trigger,
    Exit,
}

/// Trigger band in pixel rows: Entry [0, top), Trigger [top, bottom], Exit (bottom, h]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoneBoundaries {
    pub image_height: f32,
    pub trigger_top: f32,
    pub trigger_bottom: f32,
}

impl ZoneBoundaries {
    pub fn new(image_height: u32, top_ratio: f32, bottom_ratio: f32) -> Self {
        let image_height = image_height as f32;
        Self {
            image_height,
            trigger_top: image_height * top_ratio,
            trigger_bottom: image_height * bottom_ratio,
        }
    }

    pub fn zone_of(&self, center_y: f32) -> Zone {
        if center_y < self.trigger_top {
            Zone::Entry
        } else if center_y <= self.trigger_bottom {
            Zone::Trigger
        } else {
            Zone::Exit
        }
    }
}

/// Why a lifecycle record was deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RemovalReason {
    ExitZone,
    Timeout,
}

/// Why a track did not fire this frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum SkipReason {
    NoRecord,
    NotInTriggerZone,
    AlreadyTriggered,
    LowConfidence,
    CenterDrift,
    ConfidenceUnstable,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NoRecord => "no_record",
            SkipReason::NotInTriggerZone => "not_in_trigger_zone",
            SkipReason::AlreadyTriggered => "already_triggered",
            SkipReason::LowConfidence => "low_confidence",
            SkipReason::CenterDrift => "center_drift",
            SkipReason::ConfidenceUnstable => "confidence_unstable",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Skip(SkipReason),
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }
}

/// Everything remembered about one physical object
#[derive(Debug, Clone)]
pub struct TrackLifecycleRecord {
    pub track_id: u32,
    /// Set once a command for this track was sent; never cleared
    pub triggered: bool,
    pub missing_frames: u32,
    pub last_center: (f32, f32),
    pub center_history: VecDeque<(f32, f32)>,
    pub confidence_history: VecDeque<f32>,
    pub class_id: u32,
    pub first_seen_frame: u64,
    pub last_seen_frame: u64,
}

impl TrackLifecycleRecord {
    fn new(track_id: u32, center: (f32, f32), class_id: u32, frame: u64) -> Self {
        Self {
            track_id,
            triggered: false,
            missing_frames: 0,
            last_center: center,
            center_history: VecDeque::with_capacity(HISTORY_LEN),
            confidence_history: VecDeque::with_capacity(HISTORY_LEN),
            class_id,
            first_seen_frame: frame,
            last_seen_frame: frame,
        }
    }

    pub fn last_confidence(&self) -> f32 {
        self.confidence_history.back().copied().unwrap_or(0.0)
    }

    /// Frames between the first and the latest sighting
    pub fn lifetime_frames(&self) -> u64 {
        self.last_seen_frame - self.first_seen_frame
    }
}

fn push_bounded<T>(history: &mut VecDeque<T>, value: T) {
    if history.len() == HISTORY_LEN {
        history.pop_front();
    }
    history.push_back(value);
}

/// Read-only view of a record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackInfo {
    pub track_id: u32,
    pub center: (f32, f32),
    pub confidence: f32,
    pub class_id: u32,
    pub triggered: bool,
    pub frames: u64,
}

/// Owns the lifecycle records and answers "may this track fire now?"
#[derive(Debug)]
pub struct TrackLifecycleManager {
    records: BTreeMap<u32, TrackLifecycleRecord>,
    zones: ZoneBoundaries,
    confidence_threshold: f32,
    drift_threshold: f32,
    tracking_timeout_frames: u32,
    current_frame: u64,
}

impl TrackLifecycleManager {
    pub fn new(config: &EjectorConfig) -> Self {
        let zones = ZoneBoundaries::new(
            config.image.height,
            config.zone.trigger_top_ratio,
            config.zone.trigger_bottom_ratio,
        );

        log::info!(
            "Trigger zone rows {:.1}..={:.1} of {} ({:?} lens, drift threshold {:.1}px)",
            zones.trigger_top,
            zones.trigger_bottom,
            config.image.height,
            config.lens,
            config.drift_threshold()
        );

        Self {
            records: BTreeMap::new(),
            zones,
            confidence_threshold: config.confidence_threshold,
            drift_threshold: config.drift_threshold(),
            tracking_timeout_frames: config.tracking.tracking_timeout_frames,
            current_frame: 0,
        }
    }

    pub fn zones(&self) -> &ZoneBoundaries {
        &self.zones
    }

    pub fn increment_frame(&mut self) {
        self.current_frame += 1;
    }

    pub fn current_frame(&self) -> u64 {
        self.current_frame
    }

    /// Record a sighting, creating the record on first sight
    pub fn update_track(
        &mut self,
        track_id: u32,
        center: (f32, f32),
        confidence: f32,
        class_id: u32,
    ) {
        let frame = self.current_frame;
        let record = self.records.entry(track_id).or_insert_with(|| {
            log::debug!("Track {} first seen at frame {}", track_id, frame);
            TrackLifecycleRecord::new(track_id, center, class_id, frame)
        });

        record.missing_frames = 0;
        record.last_center = center;
        record.last_seen_frame = frame;
        record.class_id = class_id;
        push_bounded(&mut record.center_history, center);
        push_bounded(&mut record.confidence_history, confidence);
    }

    pub fn mark_missing(&mut self, track_id: u32) {
        if let Some(record) = self.records.get_mut(&track_id) {
            record.missing_frames += 1;
        }
    }

    fn removal_reason(&self, record: &TrackLifecycleRecord) -> Option<RemovalReason> {
        if self.zones.zone_of(record.last_center.1) == Zone::Exit {
            Some(RemovalReason::ExitZone)
        } else if record.missing_frames > self.tracking_timeout_frames {
            Some(RemovalReason::Timeout)
        } else {
            None
        }
    }

    pub fn should_remove(&self, track_id: u32) -> bool {
        self.records
            .get(&track_id)
            .is_some_and(|record| self.removal_reason(record).is_some())
    }

    /// Delete a record, reporting why it was due for removal
    pub fn remove_track(&mut self, track_id: u32) -> Option<RemovalReason> {
        let record = self.records.remove(&track_id)?;
        let reason = self.removal_reason(&record).unwrap_or(RemovalReason::Timeout);

        log::debug!(
            "Track {} removed ({:?}) after {} frames, triggered={}",
            track_id,
            reason,
            record.lifetime_frames(),
            record.triggered
        );
        Some(reason)
    }

    pub fn is_in_trigger_zone(&self, center_y: f32) -> bool {
        self.zones.zone_of(center_y) == Zone::Trigger
    }

    pub fn zone_of(&self, center_y: f32) -> Zone {
        self.zones.zone_of(center_y)
    }

    /// False when any two consecutive recorded centers are further apart than
    /// the drift threshold
    pub fn check_center_drift(&self, track_id: u32) -> bool {
        let Some(record) = self.records.get(&track_id) else {
            return true;
        };

        record
            .center_history
            .iter()
            .zip(record.center_history.iter().skip(1))
            .all(|(prev, curr)| {
                let drift = (curr.0 - prev.0).hypot(curr.1 - prev.1);
                drift <= self.drift_threshold
            })
    }

    /// Current confidence and the one from the preceding sighting must both
    /// meet the threshold
    pub fn check_confidence_stable(&self, track_id: u32, current_confidence: f32) -> bool {
        if current_confidence < self.confidence_threshold {
            return false;
        }

        let Some(record) = self.records.get(&track_id) else {
            return true;
        };

        let history = &record.confidence_history;
        // The history already holds this frame's value once the track was updated
        let previous = if record.last_seen_frame == self.current_frame {
            history.len().checked_sub(2).map(|i| history[i])
        } else {
            history.back().copied()
        };

        previous.map_or(true, |conf| conf >= self.confidence_threshold)
    }

    /// Decide whether a track may fire this frame
    pub fn evaluate(&self, track_id: u32, center: (f32, f32), confidence: f32) -> Eligibility {
        let Some(record) = self.records.get(&track_id) else {
            return Eligibility::Skip(SkipReason::NoRecord);
        };

        if !self.is_in_trigger_zone(center.1) {
            return Eligibility::Skip(SkipReason::NotInTriggerZone);
        }
        if record.triggered {
            return Eligibility::Skip(SkipReason::AlreadyTriggered);
        }
        if confidence < self.confidence_threshold {
            return Eligibility::Skip(SkipReason::LowConfidence);
        }
        if !self.check_center_drift(track_id) {
            return Eligibility::Skip(SkipReason::CenterDrift);
        }
        if !self.check_confidence_stable(track_id, confidence) {
            return Eligibility::Skip(SkipReason::ConfidenceUnstable);
        }

        Eligibility::Eligible
    }

    /// Latch the triggered flag. Returns false if the track has no record.
    pub fn mark_triggered(&mut self, track_id: u32) -> bool {
        match self.records.get_mut(&track_id) {
            Some(record) => {
                record.triggered = true;
                true
            }
            None => false,
        }
    }

    pub fn record(&self, track_id: u32) -> Option<&TrackLifecycleRecord> {
        self.records.get(&track_id)
    }

    pub fn track_info(&self, track_id: u32) -> Option<TrackInfo> {
        self.records.get(&track_id).map(|record| TrackInfo {
            track_id,
            center: record.last_center,
            confidence: record.last_confidence(),
            class_id: record.class_id,
            triggered: record.triggered,
            frames: record.lifetime_frames(),
        })
    }

    /// Ids with a live record, ascending
    pub fn track_ids(&self) -> Vec<u32> {
        self.records.keys().copied().collect()
    }

    pub fn active_count(&self) -> usize {
        self.records.len()
    }

    pub fn triggered_count(&self) -> usize {
        self.records.values().filter(|r| r.triggered).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn manager(height: u32) -> TrackLifecycleManager {
        let mut config = EjectorConfig::default();
        config.image.height = height;
        TrackLifecycleManager::new(&config)
    }

    fn sight(m: &mut TrackLifecycleManager, id: u32, cy: f32, conf: f32) -> Eligibility {
        m.increment_frame();
        m.update_track(id, (100.0, cy), conf, 0);
        m.evaluate(id, (100.0, cy), conf)
    }

    #[test]
    fn test_zone_boundaries() {
        let zones = ZoneBoundaries::new(1000, 0.375, 0.625);
        assert_abs_diff_eq!(zones.trigger_top, 375.0);
        assert_abs_diff_eq!(zones.trigger_bottom, 625.0);

        assert_eq!(zones.zone_of(0.0), Zone::Entry);
        assert_eq!(zones.zone_of(374.9), Zone::Entry);
        assert_eq!(zones.zone_of(375.0), Zone::Trigger);
        assert_eq!(zones.zone_of(625.0), Zone::Trigger);
        assert_eq!(zones.zone_of(625.1), Zone::Exit);
        assert_eq!(zones.zone_of(1000.0), Zone::Exit);
    }

    #[test]
    fn test_fractional_boundaries_are_not_truncated() {
        let zones = ZoneBoundaries::new(1023, 0.375, 0.625);
        assert_abs_diff_eq!(zones.trigger_top, 383.625, epsilon = 1e-3);
        assert_eq!(zones.zone_of(383.5), Zone::Entry);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut m = manager(1000);
        for i in 0..5 {
            m.update_track(1, (0.0, i as f32), 0.8, 2);
        }
        let record = m.record(1).unwrap();
        assert_eq!(record.center_history.len(), HISTORY_LEN);
        assert_eq!(record.center_history.front(), Some(&(0.0, 2.0)));
        assert_eq!(record.confidence_history.len(), HISTORY_LEN);
    }

    #[test]
    fn test_exit_zone_removes_immediately() {
        let mut m = manager(1000);
        m.update_track(1, (0.0, 700.0), 0.9, 0);
        assert!(m.should_remove(1));
        assert_eq!(m.remove_track(1), Some(RemovalReason::ExitZone));
        assert_eq!(m.active_count(), 0);
        assert_eq!(m.remove_track(1), None);
    }

    #[test]
    fn test_timeout_after_missing_frames() {
        let mut m = manager(1000);
        m.update_track(1, (0.0, 100.0), 0.9, 0);

        for _ in 0..15 {
            m.mark_missing(1);
        }
        assert!(!m.should_remove(1));

        m.mark_missing(1);
        assert!(m.should_remove(1));
        assert_eq!(m.remove_track(1), Some(RemovalReason::Timeout));
    }

    #[test]
    fn test_sighting_resets_missing_frames() {
        let mut m = manager(1000);
        m.update_track(1, (0.0, 100.0), 0.9, 0);
        m.mark_missing(1);
        m.mark_missing(1);
        m.update_track(1, (0.0, 110.0), 0.9, 0);
        assert_eq!(m.record(1).unwrap().missing_frames, 0);
    }

    #[test]
    fn test_unknown_track() {
        let mut m = manager(1000);
        m.mark_missing(9);
        assert!(!m.should_remove(9));
        assert!(!m.mark_triggered(9));
        assert!(m.track_info(9).is_none());
        assert_eq!(m.evaluate(9, (0.0, 500.0), 0.9), Eligibility::Skip(SkipReason::NoRecord));
    }

    #[test]
    fn test_drift_gating() {
        let mut m = manager(1000);
        m.update_track(1, (100.0, 450.0), 0.9, 0);
        m.update_track(1, (100.0, 480.0), 0.9, 0);
        assert!(!m.check_center_drift(1));

        // Once the jump leaves the history the track is stable again
        m.update_track(1, (100.0, 482.0), 0.9, 0);
        assert!(!m.check_center_drift(1));
        m.update_track(1, (100.0, 484.0), 0.9, 0);
        assert!(m.check_center_drift(1));
    }

    #[test]
    fn test_drift_threshold_depends_on_lens() {
        let mut config = EjectorConfig::default();
        config.lens = crate::config::LensType::Wide8mm;
        let mut m = TrackLifecycleManager::new(&config);

        // 15px steps: above 5*2, within 8*2
        m.update_track(1, (0.0, 400.0), 0.9, 0);
        m.update_track(1, (0.0, 415.0), 0.9, 0);
        m.update_track(1, (0.0, 430.0), 0.9, 0);
        assert!(m.check_center_drift(1));
    }

    #[test]
    fn test_eligibility_order() {
        let mut m = manager(1000);

        assert_eq!(sight(&mut m, 1, 100.0, 0.9), Eligibility::Skip(SkipReason::NotInTriggerZone));
        // Zone is checked before confidence
        assert_eq!(sight(&mut m, 2, 100.0, 0.1), Eligibility::Skip(SkipReason::NotInTriggerZone));

        assert_eq!(sight(&mut m, 3, 500.0, 0.5), Eligibility::Skip(SkipReason::LowConfidence));

        m.update_track(4, (100.0, 500.0), 0.9, 0);
        m.mark_triggered(4);
        // Already triggered wins over low confidence
        assert_eq!(
            m.evaluate(4, (100.0, 500.0), 0.1),
            Eligibility::Skip(SkipReason::AlreadyTriggered)
        );
    }

    #[test]
    fn test_confidence_must_be_stable_across_sightings() {
        let mut m = manager(1000);
        assert_eq!(sight(&mut m, 1, 500.0, 0.5), Eligibility::Skip(SkipReason::LowConfidence));
        assert_eq!(sight(&mut m, 1, 500.0, 0.9), Eligibility::Skip(SkipReason::ConfidenceUnstable));
        assert!(sight(&mut m, 1, 500.0, 0.9).is_eligible());
    }

    #[test]
    fn test_confidence_stability_before_update() {
        let mut m = manager(1000);
        m.update_track(1, (0.0, 500.0), 0.6, 0);
        m.increment_frame();

        // Not yet updated this frame: the last stored value is the previous sighting
        assert!(!m.check_confidence_stable(1, 0.9));
        assert!(!m.check_confidence_stable(1, 0.5));
    }

    #[test]
    fn test_first_sighting_in_zone_is_eligible() {
        let mut m = manager(1000);
        assert!(sight(&mut m, 1, 500.0, 0.9).is_eligible());
    }

    #[test]
    fn test_track_info_and_counts() {
        let mut m = manager(1000);
        m.increment_frame();
        m.update_track(1, (10.0, 500.0), 0.8, 3);
        m.update_track(2, (20.0, 100.0), 0.7, 1);
        m.increment_frame();
        m.increment_frame();
        m.update_track(1, (12.0, 505.0), 0.85, 3);
        m.mark_triggered(1);

        let info = m.track_info(1).unwrap();
        assert_eq!(info.center, (12.0, 505.0));
        assert_abs_diff_eq!(info.confidence, 0.85);
        assert_eq!(info.class_id, 3);
        assert!(info.triggered);
        assert_eq!(info.frames, 2);

        assert_eq!(m.active_count(), 2);
        assert_eq!(m.triggered_count(), 1);
        assert_eq!(m.track_ids(), vec![1, 2]);
    }
}
