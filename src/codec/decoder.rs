//! Opus decoder wrapper
//!
//! Used by the `probe` receiver to check that streamed packets decode.

use opus::{Channels, Decoder};

use crate::error::CodecError;

/// Opus decoder wrapper
pub struct OpusDecoder {
    decoder: Decoder,
    channels: u16,
    /// Decoding buffer (reused to avoid allocations)
    decode_buffer: Vec<f32>,
    /// Frames decoded
    frames_decoded: u64,
    /// Frames lost (PLC used)
    frames_lost: u64,
}

impl OpusDecoder {
    /// Create a new Opus decoder
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self, CodecError> {
        let opus_channels = match channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            _ => {
                return Err(CodecError::DecoderInit(format!(
                    "Unsupported channel count: {}",
                    channels
                )))
            }
        };

        let decoder = Decoder::new(sample_rate, opus_channels)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        // Max frame is 120 ms
        let decode_buffer = vec![0.0f32; sample_rate as usize * channels as usize * 120 / 1000];

        Ok(Self {
            decoder,
            channels,
            decode_buffer,
            frames_decoded: 0,
            frames_lost: 0,
        })
    }

    /// Decode an Opus packet to interleaved samples
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<f32>, CodecError> {
        let samples = self
            .decoder
            .decode_float(data, &mut self.decode_buffer, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        self.frames_decoded += 1;
        Ok(self.decode_buffer[..samples * self.channels as usize].to_vec())
    }

    /// Generate packet loss concealment samples for a missing packet
    pub fn decode_plc(&mut self) -> Result<Vec<f32>, CodecError> {
        let samples = self
            .decoder
            .decode_float(&[], &mut self.decode_buffer, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        self.frames_lost += 1;
        Ok(self.decode_buffer[..samples * self.channels as usize].to_vec())
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn frames_lost(&self) -> u64 {
        self.frames_lost
    }
}
