//! Vision-guided ejection core
//!
//! Turns per-frame object detections into exactly one acknowledged actuation
//! command per physical object, fired while the object crosses the trigger band
//! of the camera's field of view.
//!
//! ```rust,ignore
//! use ejector::{EjectorConfig, QueueChannel, TriggerOrchestrator};
//! use std::time::Duration;
//!
//! let mut orchestrator = TriggerOrchestrator::new(EjectorConfig::default())?;
//! let (channel, peer) = QueueChannel::new(64, Duration::from_millis(5));
//! orchestrator.attach_channel(Box::new(channel));
//!
//! let summary = orchestrator.process_detections(&detections);
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod orchestrator;
pub mod protocol;
pub mod reliability;

pub use channel::{ChannelPeer, MessageChannel, QueueChannel};
pub use config::{EjectorConfig, LensType, Scenario};
pub use error::{EjectorError, Result};
pub use ioutrack::{Bbox, Detection, TrackedObject};
pub use lifecycle::{Eligibility, SkipReason, TrackLifecycleManager, Zone, ZoneBoundaries};
pub use orchestrator::{
    FrameSummary, OrchestratorStatistics, TrackInput, TriggerEvent, TriggerOrchestrator,
};
pub use protocol::{parse_ack, CommandMessage, DetectionReport};
pub use reliability::{AckSender, CommandReliabilityLayer, CommandStatistics, FailureReason};
