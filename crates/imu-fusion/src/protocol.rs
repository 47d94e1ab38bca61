use crate::types::ImuSample;
use nalgebra::Vector3;
use std::collections::VecDeque;
use thiserror::Error;

/// Frame layout: START, accel x/y/z, gyro x/y/z (little-endian f32), END.
const FRAME_START: u8 = 0xAA;
const FRAME_END: u8 = 0x55;
/// Six f32 values.
const PAYLOAD_LEN: usize = 24;
pub const FRAME_LEN: usize = PAYLOAD_LEN + 2;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("Frame end marker was {0:#04x}, expected 0x55")]
    BadEndMarker(u8),
}

/// One decoded frame, not yet timestamped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawFrame {
    pub accel: Vector3<f64>,
    pub gyro: Vector3<f64>,
}

impl RawFrame {
    pub fn into_sample(self, timestamp_us: u64) -> ImuSample {
        ImuSample::new(timestamp_us, self.accel, self.gyro)
    }

    /// Negate the x axis of both sensors.
    pub fn mirror_x(self) -> Self {
        Self {
            accel: Vector3::new(-self.accel.x, self.accel.y, self.accel.z),
            gyro: Vector3::new(-self.gyro.x, self.gyro.y, self.gyro.z),
        }
    }
}

/// Streaming decoder for the sensor board's binary frames.
///
/// Feed raw bytes via `push_data`, then drain frames via `next_frame`.
pub struct ProtocolParser {
    buffer: VecDeque<u8>,
    skipped: u64,
}

impl ProtocolParser {
    pub fn new() -> Self {
        Self {
            buffer: VecDeque::with_capacity(4096),
            skipped: 0,
        }
    }

    pub fn push_data(&mut self, data: &[u8]) {
        self.buffer.extend(data);
    }

    /// Bytes discarded while hunting for a frame start.
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped
    }

    /// Try to extract the next frame from the buffer.
    /// Returns `None` until a complete candidate frame is buffered.
    pub fn next_frame(&mut self) -> Option<Result<RawFrame, ProtocolError>> {
        // Anything before a start marker is noise.
        let start = match self.buffer.iter().position(|&b| b == FRAME_START) {
            Some(pos) => pos,
            None => {
                self.skipped += self.buffer.len() as u64;
                self.buffer.clear();
                return None;
            }
        };
        self.skipped += start as u64;
        self.buffer.drain(..start);

        if self.buffer.len() < FRAME_LEN {
            return None;
        }

        let end = self.buffer[FRAME_LEN - 1];
        if end != FRAME_END {
            // Not a real frame start; resync from the next byte.
            self.buffer.pop_front();
            self.skipped += 1;
            return Some(Err(ProtocolError::BadEndMarker(end)));
        }

        let frame: Vec<u8> = self.buffer.drain(..FRAME_LEN).collect();
        Some(Ok(decode_payload(&frame[1..FRAME_LEN - 1])))
    }
}

impl Default for ProtocolParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Layout: [ax, ay, az, gx, gy, gz]
fn decode_payload(payload: &[u8]) -> RawFrame {
    let f = |index: usize| -> f64 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&payload[index * 4..index * 4 + 4]);
        f64::from(f32::from_le_bytes(bytes))
    };

    RawFrame {
        accel: Vector3::new(f(0), f(1), f(2)),
        gyro: Vector3::new(f(3), f(4), f(5)),
    }
}

/// Encode one frame, as the sensor board sends it.
pub fn encode_frame(accel: &Vector3<f32>, gyro: &Vector3<f32>) -> [u8; FRAME_LEN] {
    let mut frame = [0u8; FRAME_LEN];
    frame[0] = FRAME_START;
    for (i, value) in accel.iter().chain(gyro.iter()).enumerate() {
        frame[1 + i * 4..5 + i * 4].copy_from_slice(&value.to_le_bytes());
    }
    frame[FRAME_LEN - 1] = FRAME_END;
    frame
}
