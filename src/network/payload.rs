//! RTP payload formats
//!
//! A [`PayloadFormat`] turns one encoded access unit into the payloads of one
//! or more RTP packets and knows the SDP attributes describing them. The
//! fixed RTP header is added by the packetizer.

use bytes::Bytes;

use crate::error::NetworkError;
use crate::media::EncodedFrame;

/// Dynamic payload type used for Opus
pub const OPUS_PAYLOAD_TYPE: u8 = 111;

/// One RTP payload and whether it ends the access unit
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub payload: Bytes,
    pub marker: bool,
}

pub trait PayloadFormat: Send {
    fn payload_type(&self) -> u8;

    /// RTP media clock in Hz
    fn clock_rate(&self) -> u32;

    /// Encoding name used in `a=rtpmap`
    fn encoding_name(&self) -> &'static str;

    /// Split `frame` into payloads of at most `max_payload` bytes
    fn fragment(&mut self, frame: &EncodedFrame, max_payload: usize) -> Result<Vec<Fragment>, NetworkError>;
}

/// Opus over RTP: one encoded frame per packet
#[derive(Debug, Clone)]
pub struct OpusPayload {
    clock_rate: u32,
}

impl OpusPayload {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            clock_rate: sample_rate,
        }
    }
}

impl PayloadFormat for OpusPayload {
    fn payload_type(&self) -> u8 {
        OPUS_PAYLOAD_TYPE
    }

    fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    fn encoding_name(&self) -> &'static str {
        "opus"
    }

    fn fragment(&mut self, frame: &EncodedFrame, max_payload: usize) -> Result<Vec<Fragment>, NetworkError> {
        if frame.len() > max_payload {
            return Err(NetworkError::PacketTooLarge(frame.len()));
        }
        Ok(vec![Fragment {
            payload: frame.data.clone(),
            marker: false,
        }])
    }
}
