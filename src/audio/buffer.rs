//! Raw audio frames and frame-size accumulation
//!
//! Capture callbacks deliver sample blocks of whatever size the device
//! chooses; the encoder needs exact frames. [`SampleAccumulator`] re-slices
//! the former into the latter.

use std::collections::VecDeque;

/// Audio frame containing interleaved samples
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Interleaved audio samples (f32)
    pub samples: Vec<f32>,
    /// Number of channels
    pub channels: u16,
    /// Timestamp in microseconds
    pub timestamp: u64,
    /// Frame sequence number
    pub sequence: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, channels: u16, timestamp: u64, sequence: u32) -> Self {
        Self {
            samples,
            channels,
            timestamp,
            sequence,
        }
    }

    /// Get number of samples per channel
    pub fn samples_per_channel(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Get frame duration in microseconds
    pub fn duration_us(&self, sample_rate: u32) -> u64 {
        (self.samples_per_channel() as u64 * 1_000_000) / sample_rate as u64
    }
}

/// Collects arbitrary sample blocks and hands out fixed-size frames
#[derive(Debug, Default)]
pub struct SampleAccumulator {
    pending: VecDeque<f32>,
    /// Upper bound on buffered samples; older samples are discarded past it
    limit: usize,
    discarded: u64,
}

impl SampleAccumulator {
    /// `limit` is the most samples kept while waiting for a consumer
    pub fn new(limit: usize) -> Self {
        Self {
            pending: VecDeque::with_capacity(limit),
            limit,
            discarded: 0,
        }
    }

    pub fn extend(&mut self, samples: &[f32]) {
        self.pending.extend(samples.iter().copied());
        if self.limit > 0 && self.pending.len() > self.limit {
            let excess = self.pending.len() - self.limit;
            self.pending.drain(..excess);
            self.discarded += excess as u64;
        }
    }

    /// Fill `frame` completely if enough samples are buffered
    pub fn take_frame(&mut self, frame: &mut [f32]) -> bool {
        if self.pending.len() < frame.len() {
            return false;
        }
        let len = frame.len();
        for (slot, sample) in frame.iter_mut().zip(self.pending.drain(..len)) {
            *slot = sample;
        }
        true
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Samples thrown away because the consumer fell behind
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_frame_duration() {
        let frame = AudioFrame::new(vec![0.0; 640], 2, 0, 0);
        assert_eq!(frame.samples_per_channel(), 320);
        assert_eq!(frame.duration_us(16_000), 20_000);
    }

    #[test]
    fn test_accumulator_reslices() {
        let mut acc = SampleAccumulator::new(0);
        let mut frame = [0.0f32; 4];

        acc.extend(&[1.0, 2.0, 3.0]);
        assert!(!acc.take_frame(&mut frame));

        acc.extend(&[4.0, 5.0]);
        assert!(acc.take_frame(&mut frame));
        assert_eq!(frame, [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(acc.len(), 1);
    }

    #[test]
    fn test_accumulator_limit_discards_oldest() {
        let mut acc = SampleAccumulator::new(4);
        acc.extend(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        assert_eq!(acc.len(), 4);
        assert_eq!(acc.discarded(), 2);

        let mut frame = [0.0f32; 4];
        assert!(acc.take_frame(&mut frame));
        assert_eq!(frame, [3.0, 4.0, 5.0, 6.0]);
    }
}
