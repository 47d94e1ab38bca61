use crate::fusion::SensorFusion;
use crate::protocol::{ProtocolParser, RawFrame};
use crate::types::ImuSample;
use std::time::Instant;

/// Frame spacing at the board's 100 Hz output rate.
pub const SAMPLE_PERIOD_US: u64 = 10_000;

/// Microseconds since `started`, saturating.
pub fn elapsed_us(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX)
}

/// Axis convention of the link a frame arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisMap {
    /// Frames are already in the sensor frame (serial).
    Identity,
    /// The WiFi firmware reports x inverted.
    MirrorX,
}

impl AxisMap {
    fn apply(self, frame: RawFrame) -> RawFrame {
        match self {
            Self::Identity => frame,
            Self::MirrorX => frame.mirror_x(),
        }
    }
}

/// Receive-side timestamps, strictly increasing by at least one board period.
///
/// A single read often carries several frames; stamping them all with the
/// read time would make the pipeline drop every frame after the first.
#[derive(Debug)]
pub struct FrameClock {
    started: Instant,
    last: Option<u64>,
}

impl FrameClock {
    pub fn new(started: Instant) -> Self {
        Self {
            started,
            last: None,
        }
    }

    pub fn stamp(&mut self) -> u64 {
        self.stamp_at(elapsed_us(self.started))
    }

    fn stamp_at(&mut self, now_us: u64) -> u64 {
        let stamp = match self.last {
            Some(last) => now_us.max(last.saturating_add(SAMPLE_PERIOD_US)),
            None => now_us,
        };
        self.last = Some(stamp);
        stamp
    }
}

/// Turns a transport's byte stream into timestamped samples.
pub struct FrameStream {
    parser: ProtocolParser,
    clock: FrameClock,
    axes: AxisMap,
    frame_count: u64,
}

impl FrameStream {
    pub fn new(started: Instant, axes: AxisMap) -> Self {
        Self {
            parser: ProtocolParser::new(),
            clock: FrameClock::new(started),
            axes,
            frame_count: 0,
        }
    }

    /// Drop buffered bytes from a previous connection. The clock keeps running
    /// so stamps stay increasing across reconnects.
    pub fn reset(&mut self) {
        self.parser = ProtocolParser::new();
    }

    pub fn push_data(&mut self, data: &[u8]) {
        self.parser.push_data(data);
    }

    /// Next complete frame as a sample, skipping over resync errors.
    pub fn next_sample(&mut self) -> Option<ImuSample> {
        while let Some(result) = self.parser.next_frame() {
            match result {
                Ok(frame) => {
                    self.frame_count += 1;
                    if self.frame_count % 1000 == 0 {
                        tracing::debug!(
                            frame_count = self.frame_count,
                            skipped_bytes = self.parser.skipped_bytes(),
                            "IMU frames received"
                        );
                    }
                    let timestamp_us = self.clock.stamp();
                    return Some(self.axes.apply(frame).into_sample(timestamp_us));
                }
                Err(e) => tracing::trace!(?e, "Resyncing IMU stream"),
            }
        }
        None
    }

    /// Push `data` and run every complete frame through `fusion`.
    /// Returns the number of frames decoded.
    pub fn feed(&mut self, data: &[u8], fusion: &SensorFusion) -> usize {
        self.push_data(data);
        let mut frames = 0;
        while let Some(sample) = self.next_sample() {
            // Failures are already reported as pipeline events.
            let _ = fusion.process_sample(&sample);
            frames += 1;
        }
        frames
    }
}
