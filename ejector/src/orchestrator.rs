//! Per-frame integration of tracking, trigger decisions and command dispatch

use crate::channel::MessageChannel;
use crate::config::EjectorConfig;
use crate::error::{EjectorError, Result};
use crate::lifecycle::{Eligibility, SkipReason, TrackLifecycleManager};
use crate::reliability::{AckSender, CommandReliabilityLayer, CommandStatistics};
use ioutrack::{Bbox, Detection, MultiObjectTracker, SortTracker, TrackedObject};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

/// One tracked object handed to [`TriggerOrchestrator::process_frame`].
///
/// Confidence and class may be missing when the tracker does not carry them;
/// they are then recovered from the frame's raw detections.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackInput {
    pub track_id: u32,
    pub bbox: Bbox<f32>,
    pub confidence: Option<f32>,
    pub class_id: Option<u32>,
}

impl TrackInput {
    /// Track with a box only
    pub fn bare(track_id: u32, bbox: Bbox<f32>) -> Self {
        Self {
            track_id,
            bbox,
            confidence: None,
            class_id: None,
        }
    }
}

impl From<TrackedObject> for TrackInput {
    fn from(track: TrackedObject) -> Self {
        Self {
            track_id: track.track_id,
            bbox: track.bbox,
            confidence: Some(track.confidence),
            class_id: Some(track.class_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerEvent {
    pub track_id: u32,
    pub command_id: String,
    pub center: (f32, f32),
    pub class_id: u32,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameSummary {
    pub frame_index: u64,
    pub active_track_count: usize,
    pub triggered_track_count: usize,
    pub triggered_this_frame: Vec<TriggerEvent>,
    pub timed_out_this_frame: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestratorStatistics {
    pub frame_count: u64,
    pub trigger_count: u64,
    /// Skipped decisions, not counting tracks that already fired
    pub skip_count: u64,
    /// Every skipped decision by reason
    pub skip_reasons: BTreeMap<SkipReason, u64>,
    pub active_tracks: usize,
    pub triggered_tracks: usize,
    pub commands: CommandStatistics,
}

/// Owns the tracker, the lifecycle records and the command layer of one session
pub struct TriggerOrchestrator<T: MultiObjectTracker = SortTracker> {
    config: EjectorConfig,
    tracker: T,
    lifecycle: TrackLifecycleManager,
    commands: CommandReliabilityLayer,
    frame_count: u64,
    trigger_count: u64,
    skip_count: u64,
    skip_reasons: BTreeMap<SkipReason, u64>,
}

impl TriggerOrchestrator<SortTracker> {
    pub fn new(config: EjectorConfig) -> Result<Self> {
        let tracker = SortTracker::new(config.tracker.to_sort_config());
        Self::with_tracker(config, tracker)
    }
}

impl<T: MultiObjectTracker> TriggerOrchestrator<T> {
    pub fn with_tracker(config: EjectorConfig, tracker: T) -> Result<Self> {
        config.validate()?;

        log::info!(
            "Ejection core ready: image {}x{}, confidence >= {:.2}, ack timeout {}ms",
            config.image.width,
            config.image.height,
            config.confidence_threshold,
            config.command.ack_timeout_ms
        );

        Ok(Self {
            lifecycle: TrackLifecycleManager::new(&config),
            commands: CommandReliabilityLayer::new(config.command.ack_timeout_ms)
                .with_history_capacity(config.command.history_capacity),
            config,
            tracker,
            frame_count: 0,
            trigger_count: 0,
            skip_count: 0,
            skip_reasons: BTreeMap::new(),
        })
    }

    pub fn config(&self) -> &EjectorConfig {
        &self.config
    }

    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    pub fn lifecycle(&self) -> &TrackLifecycleManager {
        &self.lifecycle
    }

    pub fn commands(&self) -> &CommandReliabilityLayer {
        &self.commands
    }

    pub fn attach_channel(&mut self, channel: Box<dyn MessageChannel>) {
        self.commands.attach_channel(channel);
    }

    pub fn detach_channel(&mut self) -> Option<Box<dyn MessageChannel>> {
        self.commands.detach_channel()
    }

    /// Handle for delivering acks from a reader task
    pub fn ack_sender(&self) -> AckSender {
        self.commands.ack_sender()
    }

    /// Run the owned tracker on raw detections, then process its output
    pub fn process_detections(&mut self, detections: &[Detection]) -> FrameSummary {
        let tracks: Vec<TrackInput> = self
            .tracker
            .update(detections)
            .into_iter()
            .map(TrackInput::from)
            .collect();

        self.process_frame(&tracks, detections)
    }

    /// Process one frame of tracker output
    pub fn process_frame(
        &mut self,
        tracks: &[TrackInput],
        raw_detections: &[Detection],
    ) -> FrameSummary {
        self.commands.drain_acks();

        self.frame_count += 1;
        self.lifecycle.increment_frame();

        let mut seen = HashSet::with_capacity(tracks.len());
        let mut triggered_this_frame = Vec::new();

        for input in tracks {
            match self.process_track(input, raw_detections) {
                Ok(event) => {
                    seen.insert(input.track_id);
                    triggered_this_frame.extend(event);
                }
                Err(e) => log::warn!("Frame {}: skipping track: {}", self.frame_count, e),
            }
        }

        for track_id in self.lifecycle.track_ids() {
            if !seen.contains(&track_id) {
                self.lifecycle.mark_missing(track_id);
                if self.lifecycle.should_remove(track_id) {
                    self.lifecycle.remove_track(track_id);
                }
            }
        }

        let timed_out_this_frame = self.commands.check_timeouts();

        if self.frame_count % self.config.monitoring.stats_interval_frames == 0 {
            self.log_statistics();
        }

        FrameSummary {
            frame_index: self.frame_count,
            active_track_count: self.lifecycle.active_count(),
            triggered_track_count: self.lifecycle.triggered_count(),
            triggered_this_frame,
            timed_out_this_frame,
        }
    }

    fn process_track(
        &mut self,
        input: &TrackInput,
        raw_detections: &[Detection],
    ) -> Result<Option<TriggerEvent>> {
        let track_id = input.track_id;
        if !input.bbox.is_finite() {
            return Err(EjectorError::invalid_track(
                track_id,
                format!("non-finite box {}", input.bbox),
            ));
        }

        let center = input.bbox.center();
        let (confidence, class_id) = self.resolve_detection_info(input, center, raw_detections);

        self.lifecycle.update_track(track_id, center, confidence, class_id);
        if self.lifecycle.should_remove(track_id) {
            self.lifecycle.remove_track(track_id);
            return Ok(None);
        }

        if let Eligibility::Skip(reason) = self.lifecycle.evaluate(track_id, center, confidence) {
            self.record_skip(track_id, reason);
            return Ok(None);
        }

        let frame_dims = (self.config.image.width, self.config.image.height);
        match self
            .commands
            .dispatch(center, class_id, track_id, confidence, frame_dims)
        {
            Ok(command_id) => {
                self.lifecycle.mark_triggered(track_id);
                self.trigger_count += 1;
                Ok(Some(TriggerEvent {
                    track_id,
                    command_id,
                    center,
                    class_id,
                    confidence,
                }))
            }
            Err(e) => {
                // The track stays untriggered and may fire on a later frame
                log::warn!("Track {} eligible but no command sent: {}", track_id, e);
                Ok(None)
            }
        }
    }

    /// Fill in confidence/class missing from the tracker output using the
    /// nearest raw detection within the fallback distance
    fn resolve_detection_info(
        &self,
        input: &TrackInput,
        center: (f32, f32),
        raw_detections: &[Detection],
    ) -> (f32, u32) {
        if let (Some(confidence), Some(class_id)) = (input.confidence, input.class_id) {
            return (confidence, class_id);
        }

        let max_distance = self.config.tracking.fallback_match_distance_px;
        let nearest = raw_detections
            .iter()
            .map(|det| {
                let (cx, cy) = det.bbox.center();
                ((cx - center.0).hypot(cy - center.1), det)
            })
            .filter(|(distance, _)| *distance <= max_distance)
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, det)| det);

        if nearest.is_none() {
            log::debug!(
                "Track {}: no detection within {:.0}px, using defaults",
                input.track_id,
                max_distance
            );
        }

        (
            input
                .confidence
                .unwrap_or_else(|| nearest.map_or(0.0, |d| d.confidence)),
            input
                .class_id
                .unwrap_or_else(|| nearest.map_or(0, |d| d.class_id)),
        )
    }

    fn record_skip(&mut self, track_id: u32, reason: SkipReason) {
        *self.skip_reasons.entry(reason).or_insert(0) += 1;
        if reason != SkipReason::AlreadyTriggered {
            self.skip_count += 1;
            log::debug!("Track {} skipped: {}", track_id, reason);
        }
    }

    pub fn statistics(&self) -> OrchestratorStatistics {
        OrchestratorStatistics {
            frame_count: self.frame_count,
            trigger_count: self.trigger_count,
            skip_count: self.skip_count,
            skip_reasons: self.skip_reasons.clone(),
            active_tracks: self.lifecycle.active_count(),
            triggered_tracks: self.lifecycle.triggered_count(),
            commands: self.commands.statistics(),
        }
    }

    pub fn reset_statistics(&mut self) {
        self.frame_count = 0;
        self.trigger_count = 0;
        self.skip_count = 0;
        self.skip_reasons.clear();
        self.commands.reset_statistics();
        log::info!("Statistics reset");
    }

    pub fn log_statistics(&self) {
        let stats = self.statistics();
        log::info!(
            "Frame {}: triggers={}, skips={}, active={}",
            stats.frame_count,
            stats.trigger_count,
            stats.skip_count,
            stats.active_tracks
        );
        log::info!(
            "Commands: sent={} acked={} failed={} pending={} send_failures={}",
            stats.commands.total,
            stats.commands.successful,
            stats.commands.failed,
            stats.commands.pending,
            stats.commands.send_failures
        );

        let min_rate = f64::from(self.config.monitoring.min_success_rate) * 100.0;
        let settled = stats.commands.successful + stats.commands.failed;
        if settled > 0 && stats.commands.success_rate < min_rate {
            log::warn!(
                "Command success rate {:.1}% below {:.1}%",
                stats.commands.success_rate,
                min_rate
            );
        }
    }

    /// Discard pending commands and detach the channel
    pub fn shutdown(&mut self) -> Vec<String> {
        log::info!("Shutting down after {} frames", self.frame_count);
        self.commands.shutdown()
    }
}
