//! One-shot command dispatch with acknowledgement deadlines
//!
//! Every command is written once. It then either receives its ack before
//! `ack_timeout_ms` elapses, or it is moved to the failed list for offline
//! reconciliation. Nothing is ever retried: by the time a timeout is noticed the
//! object has already passed the actuator.
//!
//! Acks may arrive on any thread through an [`AckSender`]; they are queued and
//! applied by the single owner of the layer in [`CommandReliabilityLayer::drain_acks`].
//! An ack names either the command id or the sequence number written on the wire.
//!
//! Counters and latency aggregates cover every command; only the most recent
//! `history_capacity` settled commands are kept as records.

use crate::channel::MessageChannel;
use crate::error::{EjectorError, Result};
use crate::protocol::{parse_ack, CommandMessage};
use chrono::Local;
use crossbeam::channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

/// A dispatched actuation request
#[derive(Debug, Clone)]
pub struct Command {
    pub command_id: String,
    /// Sequence number written into the message
    pub sequence: u64,
    pub track_id: u32,
    pub center: (f32, f32),
    pub class_id: u32,
    pub confidence: f32,
    pub created_at: Instant,
    pub ack_received: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureReason {
    AckTimeout,
    Shutdown,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::AckTimeout => f.write_str("ACK_TIMEOUT"),
            FailureReason::Shutdown => f.write_str("SHUTDOWN"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FailedCommand {
    pub command: Command,
    pub reason: FailureReason,
    pub elapsed_ms: f64,
}

#[derive(Debug, Clone)]
pub struct AcknowledgedCommand {
    pub command: Command,
    pub latency_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommandStatistics {
    /// Commands successfully written to the channel
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub pending: usize,
    /// Commands that could not be written at all
    pub send_failures: u64,
    /// successful / total x 100, 0 when nothing was sent
    pub success_rate: f64,
    pub mean_ack_latency_ms: f64,
    pub max_ack_latency_ms: f64,
}

/// Cloneable handle for delivering acks from a reader task
#[derive(Debug, Clone)]
pub struct AckSender {
    tx: Sender<String>,
}

impl AckSender {
    /// Queue an ack for a command id or wire sequence number. Returns false
    /// once the layer is gone.
    pub fn send<S: Into<String>>(&self, command_ref: S) -> bool {
        self.tx.send(command_ref.into()).is_ok()
    }

    /// Queue an ack from a raw protocol line; blank lines are ignored
    pub fn send_line(&self, line: &str) -> bool {
        match parse_ack(line) {
            Some(id) => self.send(id),
            None => false,
        }
    }
}

/// Settled commands kept for inspection unless configured otherwise
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

pub struct CommandReliabilityLayer {
    channel: Option<Box<dyn MessageChannel>>,
    ack_timeout: Duration,
    pending: HashMap<String, Command>,
    /// Wire sequence number -> pending command id
    by_sequence: HashMap<u64, String>,
    successful: VecDeque<AcknowledgedCommand>,
    failed: VecDeque<FailedCommand>,
    history_capacity: usize,
    sequence: u64,
    total: u64,
    acknowledged: u64,
    failures: u64,
    send_failures: u64,
    latency_sum_ms: f64,
    latency_max_ms: f64,
    ack_tx: Sender<String>,
    ack_rx: Receiver<String>,
}

fn generate_command_id(sequence: u64) -> String {
    format!("CMD_{}_{}", Local::now().format("%Y%m%d_%H%M%S_%6f"), sequence)
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn push_bounded<T>(history: &mut VecDeque<T>, capacity: usize, item: T) {
    if capacity == 0 {
        return;
    }
    if history.len() == capacity {
        history.pop_front();
    }
    history.push_back(item);
}

impl CommandReliabilityLayer {
    pub fn new(ack_timeout_ms: u64) -> Self {
        let (ack_tx, ack_rx) = unbounded();
        Self {
            channel: None,
            ack_timeout: Duration::from_millis(ack_timeout_ms),
            pending: HashMap::new(),
            by_sequence: HashMap::new(),
            successful: VecDeque::new(),
            failed: VecDeque::new(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            sequence: 0,
            total: 0,
            acknowledged: 0,
            failures: 0,
            send_failures: 0,
            latency_sum_ms: 0.0,
            latency_max_ms: 0.0,
            ack_tx,
            ack_rx,
        }
    }

    pub fn with_channel(ack_timeout_ms: u64, channel: Box<dyn MessageChannel>) -> Self {
        let mut layer = Self::new(ack_timeout_ms);
        layer.attach_channel(channel);
        layer
    }

    /// Keep at most `capacity` acknowledged and `capacity` failed records
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        while self.successful.len() > capacity {
            self.successful.pop_front();
        }
        while self.failed.len() > capacity {
            self.failed.pop_front();
        }
        self.history_capacity = capacity;
        self
    }

    pub fn attach_channel(&mut self, channel: Box<dyn MessageChannel>) {
        self.channel = Some(channel);
        log::info!("Command channel attached");
    }

    pub fn detach_channel(&mut self) -> Option<Box<dyn MessageChannel>> {
        let channel = self.channel.take();
        if channel.is_some() {
            log::info!("Command channel detached");
        }
        channel
    }

    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    pub fn ack_sender(&self) -> AckSender {
        AckSender {
            tx: self.ack_tx.clone(),
        }
    }

    /// Encode and write one command, registering it as pending on success.
    ///
    /// Returns the command id. Nothing is registered when the write fails.
    pub fn dispatch(
        &mut self,
        center: (f32, f32),
        class_id: u32,
        track_id: u32,
        confidence: f32,
        frame_dims: (u32, u32),
    ) -> Result<String> {
        let channel = match self.channel.as_ref() {
            Some(channel) if channel.is_connected() => channel,
            _ => {
                self.send_failures += 1;
                return Err(EjectorError::ChannelUnavailable);
            }
        };

        self.sequence += 1;
        let sequence = self.sequence;
        let command_id = generate_command_id(sequence);
        let message = CommandMessage {
            trigger_count: sequence,
            image_width: frame_dims.0,
            image_height: frame_dims.1,
            class_id,
            center,
        };

        if let Err(e) = channel.send(&message.encode()) {
            self.send_failures += 1;
            return Err(e);
        }

        self.total += 1;
        self.by_sequence.insert(sequence, command_id.clone());
        self.pending.insert(
            command_id.clone(),
            Command {
                command_id: command_id.clone(),
                sequence,
                track_id,
                center,
                class_id,
                confidence,
                created_at: Instant::now(),
                ack_received: false,
            },
        );

        log::info!(
            "Command #{}: track={}, class={}, pos=({:.1},{:.1}), conf={:.2}",
            sequence,
            track_id,
            class_id,
            center.0,
            center.1,
            confidence
        );
        Ok(command_id)
    }

    /// Send a command; false when no channel is usable or the write failed
    pub fn send_command(
        &mut self,
        center: (f32, f32),
        class_id: u32,
        track_id: u32,
        confidence: f32,
        frame_dims: (u32, u32),
    ) -> bool {
        match self.dispatch(center, class_id, track_id, confidence, frame_dims) {
            Ok(_) => true,
            Err(EjectorError::ChannelUnavailable) => {
                log::warn!("Command channel unavailable, track {} not ejected", track_id);
                false
            }
            Err(e) => {
                log::error!("Failed to send command for track {}: {}", track_id, e);
                false
            }
        }
    }

    /// Remove a pending command by id, keeping the sequence index in step
    fn take_pending(&mut self, command_id: &str) -> Option<Command> {
        let command = self.pending.remove(command_id)?;
        self.by_sequence.remove(&command.sequence);
        Some(command)
    }

    /// Mark a pending command acknowledged. `command_ref` is a command id or the
    /// sequence number carried by the outbound message. Unknown, acknowledged or
    /// failed commands are ignored. Returns whether the ack was applied.
    pub fn receive_ack(&mut self, command_ref: &str) -> bool {
        let command_id = if self.pending.contains_key(command_ref) {
            Some(command_ref.to_owned())
        } else {
            command_ref
                .parse::<u64>()
                .ok()
                .and_then(|sequence| self.by_sequence.get(&sequence).cloned())
        };

        let Some(mut command) = command_id.and_then(|id| self.take_pending(&id)) else {
            log::debug!("Ignoring ack for unknown command {}", command_ref);
            return false;
        };

        command.ack_received = true;
        let latency_ms = millis(command.created_at.elapsed());
        log::debug!("Ack for {} after {:.1}ms", command.command_id, latency_ms);

        self.acknowledged += 1;
        self.latency_sum_ms += latency_ms;
        self.latency_max_ms = self.latency_max_ms.max(latency_ms);
        push_bounded(
            &mut self.successful,
            self.history_capacity,
            AcknowledgedCommand {
                command,
                latency_ms,
            },
        );
        true
    }

    /// Apply every queued ack in arrival order. Returns how many matched a
    /// pending command.
    pub fn drain_acks(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(command_id) = self.ack_rx.try_recv() {
            if self.receive_ack(&command_id) {
                applied += 1;
            }
        }
        applied
    }

    pub fn check_timeouts(&mut self) -> Vec<String> {
        self.check_timeouts_at(Instant::now())
    }

    /// Fail every pending command older than the ack timeout at `now`.
    /// Returns the failed ids in dispatch order.
    pub fn check_timeouts_at(&mut self, now: Instant) -> Vec<String> {
        let mut expired: Vec<(u64, String)> = self
            .pending
            .values()
            .filter(|c| now.saturating_duration_since(c.created_at) > self.ack_timeout)
            .map(|c| (c.sequence, c.command_id.clone()))
            .collect();
        expired.sort_unstable();

        expired
            .into_iter()
            .filter_map(|(_, command_id)| {
                let command = self.take_pending(&command_id)?;
                let elapsed_ms = millis(now.saturating_duration_since(command.created_at));
                log::warn!(
                    "Command timeout: {}, track={}, elapsed={:.1}ms > {}ms",
                    command_id,
                    command.track_id,
                    elapsed_ms,
                    self.ack_timeout.as_millis()
                );
                self.record_failure(FailedCommand {
                    command,
                    reason: FailureReason::AckTimeout,
                    elapsed_ms,
                });
                Some(command_id)
            })
            .collect()
    }

    fn record_failure(&mut self, failed: FailedCommand) {
        self.failures += 1;
        push_bounded(&mut self.failed, self.history_capacity, failed);
    }

    /// Fail all pending commands and detach the channel. Never blocks.
    pub fn shutdown(&mut self) -> Vec<String> {
        let now = Instant::now();
        self.by_sequence.clear();
        let mut discarded: Vec<Command> = self.pending.drain().map(|(_, c)| c).collect();
        discarded.sort_unstable_by_key(|c| c.sequence);

        let ids: Vec<String> = discarded.iter().map(|c| c.command_id.clone()).collect();
        for command in discarded {
            let elapsed_ms = millis(now.saturating_duration_since(command.created_at));
            self.record_failure(FailedCommand {
                command,
                reason: FailureReason::Shutdown,
                elapsed_ms,
            });
        }

        self.detach_channel();
        if !ids.is_empty() {
            log::warn!("Shutdown discarded {} pending commands", ids.len());
        }
        ids
    }

    pub fn pending_commands(&self) -> impl Iterator<Item = &Command> {
        self.pending.values()
    }

    pub fn pending_command(&self, command_id: &str) -> Option<&Command> {
        self.pending.get(command_id)
    }

    /// Most recent acknowledged commands, oldest first
    pub fn successful_commands(&self) -> impl Iterator<Item = &AcknowledgedCommand> {
        self.successful.iter()
    }

    /// Most recent failed commands, oldest first
    pub fn failed_commands(&self) -> impl Iterator<Item = &FailedCommand> {
        self.failed.iter()
    }

    pub fn statistics(&self) -> CommandStatistics {
        let success_rate = if self.total > 0 {
            self.acknowledged as f64 / self.total as f64 * 100.0
        } else {
            0.0
        };

        let mean_ack_latency_ms = if self.acknowledged > 0 {
            self.latency_sum_ms / self.acknowledged as f64
        } else {
            0.0
        };

        CommandStatistics {
            total: self.total,
            successful: self.acknowledged,
            failed: self.failures,
            pending: self.pending.len(),
            send_failures: self.send_failures,
            success_rate,
            mean_ack_latency_ms,
            max_ack_latency_ms: self.latency_max_ms,
        }
    }

    /// Clear completed history and counters. Pending commands stay counted.
    pub fn reset_statistics(&mut self) {
        self.successful.clear();
        self.failed.clear();
        self.total = self.pending.len() as u64;
        self.acknowledged = 0;
        self.failures = 0;
        self.send_failures = 0;
        self.latency_sum_ms = 0.0;
        self.latency_max_ms = 0.0;
        log::info!("Command statistics reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelPeer, QueueChannel};
    use approx::assert_abs_diff_eq;
    use std::thread;

    const DIMS: (u32, u32) = (1280, 1024);

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn connected_layer() -> (CommandReliabilityLayer, ChannelPeer) {
        init_logger();
        let (channel, peer) = QueueChannel::new(16, Duration::from_millis(5));
        (CommandReliabilityLayer::with_channel(200, Box::new(channel)), peer)
    }

    fn only_pending(layer: &CommandReliabilityLayer) -> Command {
        let pending: Vec<&Command> = layer.pending_commands().collect();
        assert_eq!(pending.len(), 1);
        pending[0].clone()
    }

    struct BrokenChannel;

    impl MessageChannel for BrokenChannel {
        fn send(&self, _message: &str) -> Result<()> {
            Err(EjectorError::send_failed("socket closed"))
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_send_without_channel_fails() {
        let mut layer = CommandReliabilityLayer::new(200);
        assert!(!layer.send_command((10.0, 10.0), 0, 1, 0.9, DIMS));

        let stats = layer.statistics();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.send_failures, 1);
        assert_eq!(stats.success_rate, 0.0);
    }

    #[test]
    fn test_send_on_disconnected_channel_fails() {
        let (mut layer, peer) = connected_layer();
        peer.set_connected(false);

        assert!(!layer.send_command((10.0, 10.0), 0, 1, 0.9, DIMS));
        assert_eq!(layer.statistics().pending, 0);
        assert_eq!(layer.statistics().send_failures, 1);
        assert_eq!(peer.pending(), 0);
    }

    #[test]
    fn test_write_failure_registers_nothing() {
        let mut layer = CommandReliabilityLayer::with_channel(200, Box::new(BrokenChannel));
        assert!(matches!(
            layer.dispatch((10.0, 10.0), 0, 1, 0.9, DIMS),
            Err(EjectorError::SendFailed(_))
        ));

        let stats = layer.statistics();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.send_failures, 1);
    }

    #[test]
    fn test_send_writes_message_and_registers_pending() {
        let (mut layer, peer) = connected_layer();
        assert!(layer.send_command((640.7, 500.2), 2, 9, 0.88, DIMS));

        assert_eq!(peer.drain(), vec![";,1,1280,1024,1,2,640,500,0,0,0,0,0,0\n".to_string()]);

        let command = only_pending(&layer);
        assert_eq!(command.track_id, 9);
        assert_eq!(command.sequence, 1);
        assert!(!command.ack_received);
        assert_eq!(layer.statistics().total, 1);
    }

    #[test]
    fn test_command_ids_are_unique_and_well_formed() {
        let (mut layer, _peer) = connected_layer();
        let a = layer.dispatch((1.0, 1.0), 0, 1, 0.9, DIMS).unwrap();
        let b = layer.dispatch((1.0, 1.0), 0, 2, 0.9, DIMS).unwrap();

        assert_ne!(a, b);
        assert!(a.starts_with("CMD_") && a.ends_with("_1"));
        assert!(b.ends_with("_2"));
        // CMD_ + YYYYmmdd_HHMMSS_micros + _1
        assert_eq!(a.len(), 4 + 22 + 2);
    }

    #[test]
    fn test_ack_moves_command_to_successful_once() {
        let (mut layer, _peer) = connected_layer();
        let id = layer.dispatch((1.0, 1.0), 0, 1, 0.9, DIMS).unwrap();

        assert!(layer.receive_ack(&id));
        assert!(!layer.receive_ack(&id));
        assert!(!layer.receive_ack("CMD_unknown"));

        let stats = layer.statistics();
        assert_eq!(stats.successful, 1);
        assert_eq!(stats.pending, 0);
        assert_abs_diff_eq!(stats.success_rate, 100.0);
        assert!(layer.successful_commands().all(|c| c.command.ack_received));
    }

    #[test]
    fn test_late_ack_after_timeout_is_ignored() {
        let (mut layer, _peer) = connected_layer();
        let id = layer.dispatch((1.0, 1.0), 0, 1, 0.9, DIMS).unwrap();
        let t0 = only_pending(&layer).created_at;

        assert!(layer.check_timeouts_at(t0 + Duration::from_millis(150)).is_empty());
        assert_eq!(layer.check_timeouts_at(t0 + Duration::from_millis(250)), vec![id.clone()]);

        assert!(!layer.receive_ack(&id));

        let stats = layer.statistics();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.successful, 0);
        assert_eq!(stats.pending, 0);
        assert_eq!(layer.failed_commands().next().unwrap().reason, FailureReason::AckTimeout);
    }

    #[test]
    fn test_timeout_reported_exactly_once() {
        let (mut layer, _peer) = connected_layer();
        let first = layer.dispatch((1.0, 1.0), 0, 1, 0.9, DIMS).unwrap();
        let second = layer.dispatch((1.0, 1.0), 0, 2, 0.9, DIMS).unwrap();
        let latest = layer
            .pending_commands()
            .map(|c| c.created_at)
            .max()
            .unwrap();

        let later = latest + Duration::from_millis(500);
        assert_eq!(layer.check_timeouts_at(later), vec![first, second]);
        assert!(layer.check_timeouts_at(later).is_empty());
        assert_eq!(layer.statistics().failed, 2);
    }

    #[test]
    fn test_acks_from_other_threads_are_queued() {
        let (mut layer, _peer) = connected_layer();
        let id = layer.dispatch((1.0, 1.0), 0, 1, 0.9, DIMS).unwrap();
        let acks = layer.ack_sender();

        let line = format!("ACK,{}\n", id);
        thread::spawn(move || {
            assert!(acks.send_line(&line));
            assert!(acks.send("CMD_unknown"));
        })
        .join()
        .unwrap();

        // Nothing is applied until the owner drains the queue
        assert_eq!(layer.statistics().pending, 1);
        assert_eq!(layer.drain_acks(), 1);
        assert_eq!(layer.statistics().successful, 1);
    }

    #[test]
    fn test_ack_built_from_received_line() {
        let (mut layer, peer) = connected_layer();
        let acks = layer.ack_sender();
        layer.dispatch((500.0, 500.0), 1, 7, 0.9, DIMS).unwrap();
        layer.dispatch((300.0, 500.0), 1, 8, 0.9, DIMS).unwrap();

        // The actuator only sees the lines; it echoes back the trigger count
        let actuator = thread::spawn(move || {
            for line in peer.drain().into_iter().rev() {
                let sequence = line.split(',').nth(1).unwrap().to_string();
                assert!(acks.send_line(&format!("ACK,{}\r\n", sequence)));
            }
        });
        actuator.join().unwrap();

        assert_eq!(layer.drain_acks(), 2);
        let stats = layer.statistics();
        assert_eq!(stats.successful, 2);
        assert_eq!(stats.pending, 0);

        let mut tracks: Vec<u32> = layer
            .successful_commands()
            .map(|c| c.command.track_id)
            .collect();
        tracks.sort_unstable();
        assert_eq!(tracks, vec![7, 8]);

        // Same sequence again is a duplicate
        assert!(!layer.receive_ack("1"));
    }

    #[test]
    fn test_sequence_ack_after_timeout_is_ignored() {
        let (mut layer, _peer) = connected_layer();
        layer.dispatch((1.0, 1.0), 0, 1, 0.9, DIMS).unwrap();
        let t0 = only_pending(&layer).created_at;

        assert_eq!(layer.check_timeouts_at(t0 + Duration::from_millis(250)).len(), 1);
        assert!(!layer.receive_ack("1"));
        assert_eq!(layer.statistics().successful, 0);
    }

    #[test]
    fn test_history_is_bounded_but_counts_are_exact() {
        let (channel, _peer) = QueueChannel::new(64, Duration::from_millis(5));
        let mut layer = CommandReliabilityLayer::with_channel(200, Box::new(channel))
            .with_history_capacity(3);

        for track_id in 0..10 {
            let id = layer.dispatch((1.0, 1.0), 0, track_id, 0.9, DIMS).unwrap();
            layer.receive_ack(&id);
        }
        for track_id in 10..15 {
            layer.dispatch((1.0, 1.0), 0, track_id, 0.9, DIMS).unwrap();
        }
        let latest = layer.pending_commands().map(|c| c.created_at).max().unwrap();
        assert_eq!(layer.check_timeouts_at(latest + Duration::from_millis(500)).len(), 5);

        assert_eq!(layer.successful_commands().count(), 3);
        assert_eq!(layer.failed_commands().count(), 3);
        let kept: Vec<u32> = layer.successful_commands().map(|c| c.command.track_id).collect();
        assert_eq!(kept, vec![7, 8, 9]);

        let stats = layer.statistics();
        assert_eq!(stats.total, 15);
        assert_eq!(stats.successful, 10);
        assert_eq!(stats.failed, 5);
        assert_abs_diff_eq!(stats.success_rate, 10.0 / 15.0 * 100.0, epsilon = 1e-9);
        assert!(stats.max_ack_latency_ms >= stats.mean_ack_latency_ms);
    }

    #[test]
    fn test_shutdown_discards_pending() {
        let (mut layer, _peer) = connected_layer();
        let id = layer.dispatch((1.0, 1.0), 0, 1, 0.9, DIMS).unwrap();

        assert_eq!(layer.shutdown(), vec![id.clone()]);
        assert_eq!(layer.failed_commands().next().unwrap().reason, FailureReason::Shutdown);
        assert!(!layer.receive_ack(&id));
        assert!(!layer.send_command((1.0, 1.0), 0, 2, 0.9, DIMS));
    }

    #[test]
    fn test_reset_statistics_keeps_pending() {
        let (mut layer, _peer) = connected_layer();
        let acked = layer.dispatch((1.0, 1.0), 0, 1, 0.9, DIMS).unwrap();
        layer.receive_ack(&acked);
        let open = layer.dispatch((1.0, 1.0), 0, 2, 0.9, DIMS).unwrap();

        layer.reset_statistics();
        let stats = layer.statistics();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.successful, 0);
        assert_eq!(stats.pending, 1);

        assert!(layer.receive_ack(&open));
        assert_abs_diff_eq!(layer.statistics().success_rate, 100.0);
    }
}
