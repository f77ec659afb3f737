//! Encoded media units exchanged between encoder and packetizer stages

use bytes::Bytes;

/// One encoder-emitted access unit (an Opus packet, an encoded picture)
///
/// Owned by exactly one stage at a time; ownership moves through the
/// [`FrameQueue`](crate::queue::FrameQueue) on enqueue/dequeue.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// Compressed payload
    pub data: Bytes,
    /// Capture timestamp in microseconds since the pipeline started
    pub timestamp_us: u64,
    /// Frame sequence number
    pub sequence: u32,
    /// Whether the unit can be decoded on its own
    pub key_frame: bool,
}

impl EncodedFrame {
    pub fn new(data: Bytes, timestamp_us: u64, sequence: u32) -> Self {
        Self {
            data,
            timestamp_us,
            sequence,
            key_frame: true,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Timestamp expressed in ticks of a media clock
    pub fn media_timestamp(&self, clock_rate: u32) -> u32 {
        ((self.timestamp_us as u128 * clock_rate as u128) / 1_000_000) as u32
    }
}

/// Lifecycle shared by the encoder pipelines
///
/// `Idle → Prepared → Running → Prepared → … → Released`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Prepared,
    Running,
    Released,
}
