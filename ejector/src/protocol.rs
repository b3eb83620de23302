//! Line-oriented text protocol spoken with the actuator controller
//!
//! Outbound messages start with `;`, are comma separated, end with four zero
//! fields and a newline. Pixel coordinates are written as integers truncated
//! toward zero.

use ioutrack::Detection;
use std::fmt;

/// Prefix of an acknowledgement line
pub const ACK_PREFIX: &str = "ACK,";

/// One-shot actuation request for a single object
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandMessage {
    pub trigger_count: u64,
    pub image_width: u32,
    pub image_height: u32,
    pub class_id: u32,
    pub center: (f32, f32),
}

impl fmt::Display for CommandMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ;,count,w,h,object_count,class,cx,cy,width,height,0,0,0,0
        writeln!(
            f,
            ";,{},{},{},1,{},{},{},0,0,0,0,0,0",
            self.trigger_count,
            self.image_width,
            self.image_height,
            self.class_id,
            self.center.0 as i64,
            self.center.1 as i64
        )
    }
}

impl CommandMessage {
    pub fn encode(&self) -> String {
        self.to_string()
    }
}

/// Multi-object report of every detection in a frame
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionReport<'a> {
    pub trigger_num: u64,
    pub image_width: u32,
    pub image_height: u32,
    pub detections: &'a [Detection],
}

fn clamp_pixel(value: f32, dim: u32) -> i64 {
    (value as i64).clamp(0, i64::from(dim.max(1)) - 1)
}

impl fmt::Display for DetectionReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            ";,{},{},{},{}",
            self.trigger_num,
            self.image_width,
            self.image_height,
            self.detections.len()
        )?;

        for det in self.detections {
            let [x1, y1, x2, y2] = det.bbox.to_bounds();
            write!(
                f,
                ",{},{},{},{},{}",
                det.class_id,
                clamp_pixel(x1, self.image_width),
                clamp_pixel(y1, self.image_height),
                clamp_pixel(x2, self.image_width),
                clamp_pixel(y2, self.image_height)
            )?;
        }

        writeln!(f, ",0,0,0,0")
    }
}

impl DetectionReport<'_> {
    pub fn encode(&self) -> String {
        self.to_string()
    }
}

/// Extract the command reference from an acknowledgement line.
///
/// Accepts `ACK,<ref>` or a bare `<ref>`, where `<ref>` is either a command id or
/// the trigger count of the acknowledged message. Blank lines yield `None`.
pub fn parse_ack(line: &str) -> Option<&str> {
    let line = line.trim();
    let id = line.strip_prefix(ACK_PREFIX).unwrap_or(line).trim();
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}
