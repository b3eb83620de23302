/// Synthetic conveyor driven through the full ejection pipeline
///
/// Objects of three classes enter at the top of the frame and move down at a
/// constant speed. A simulated actuator thread reads command lines and acks
/// most of them by trigger count after a short delay; every tenth ack is lost
/// so the timeout path shows up in the statistics.
///
/// Usage:
///   cargo run --example simulate_line [config.json]
use ejector::{Detection, EjectorConfig, QueueChannel, TriggerOrchestrator};
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const FRAMES: u64 = 600;
const FRAME_INTERVAL: Duration = Duration::from_millis(10);
const SPEED_PX_PER_FRAME: f32 = 6.0;
const SPAWN_EVERY: u64 = 40;
const OBJECT_SIZE: f32 = 70.0;

/// Detections for every object on the belt at `frame`
fn synthetic_detections(frame: u64, image_height: f32) -> Vec<Detection> {
    (0..=frame / SPAWN_EVERY)
        .filter_map(|n| {
            let age = frame.checked_sub(n * SPAWN_EVERY)? as f32;
            let cy = age * SPEED_PX_PER_FRAME;
            if cy - OBJECT_SIZE / 2.0 > image_height {
                return None;
            }
            let cx = 200.0 + ((n * 37) % 800) as f32;
            // Confidence ramps up as the object comes into full view
            let confidence = (0.55 + age * 0.01).min(0.93);
            let half = OBJECT_SIZE / 2.0;
            Some(Detection::new(
                cx - half,
                cy - half,
                cx + half,
                cy + half,
                confidence,
                (n % 3) as u32,
            ))
        })
        .collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match env::args().nth(1) {
        Some(path) => EjectorConfig::load(path)?,
        None => EjectorConfig::default(),
    };
    let image_height = config.image.height as f32;
    let send_timeout = Duration::from_millis(config.command.send_timeout_ms);

    let mut orchestrator = TriggerOrchestrator::new(config)?;
    let (channel, peer) = QueueChannel::new(64, send_timeout);
    orchestrator.attach_channel(Box::new(channel));

    // Simulated actuator: consume lines, ack by trigger count after a delay
    let acks = orchestrator.ack_sender();
    let running = Arc::new(AtomicBool::new(true));
    let actuator_running = Arc::clone(&running);
    let actuator = thread::spawn(move || {
        let mut handled = 0u64;
        while actuator_running.load(Ordering::Acquire) || peer.pending() > 0 {
            let Some(line) = peer.recv_timeout(Duration::from_millis(20)) else {
                continue;
            };
            log::debug!("Actuator received: {}", line.trim_end());
            let Some(trigger_count) = line.split(',').nth(1) else {
                continue;
            };
            handled += 1;
            if handled % 10 == 0 {
                log::info!("Actuator drops ack for trigger {}", trigger_count);
                continue;
            }
            thread::sleep(Duration::from_millis(15));
            acks.send_line(&format!("ACK,{}\n", trigger_count));
        }
        handled
    });

    let start = Instant::now();
    for frame in 0..FRAMES {
        let detections = synthetic_detections(frame, image_height);
        let summary = orchestrator.process_detections(&detections);

        for event in &summary.triggered_this_frame {
            println!(
                "frame {:>4}: eject track {} (class {}) at ({:.0}, {:.0}) conf {:.2}",
                summary.frame_index,
                event.track_id,
                event.class_id,
                event.center.0,
                event.center.1,
                event.confidence
            );
        }
        for command_id in &summary.timed_out_this_frame {
            println!("frame {:>4}: no ack for {}", summary.frame_index, command_id);
        }

        thread::sleep(FRAME_INTERVAL);
    }

    // Give outstanding acks a chance to land before shutting down
    running.store(false, Ordering::Release);
    let handled = actuator.join().map_err(|_| "actuator thread panicked")?;
    thread::sleep(Duration::from_millis(250));
    orchestrator.process_frame(&[], &[]);
    let discarded = orchestrator.shutdown();

    let stats = orchestrator.statistics();
    println!("\n📊 Results after {:.1}s:", start.elapsed().as_secs_f32());
    println!("{}", serde_json::to_string_pretty(&stats)?);
    println!(
        "Actuator handled {} commands, {} discarded at shutdown",
        handled,
        discarded.len()
    );

    Ok(())
}
