//! Opus encoder wrapper
//!
//! Variable bit-rate Opus encoding configured from a validated [`AudioQuality`].

use bytes::Bytes;
use opus::{Application, Channels, Encoder};

use crate::config::{AudioQuality, OpusApplication};
use crate::error::CodecError;

/// Largest packet Opus produces for one frame is about 1275 bytes
const MAX_OPUS_PACKET: usize = 4000;

/// Opus encoder wrapper with streaming settings
pub struct OpusEncoder {
    encoder: Encoder,
    quality: AudioQuality,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
    /// Frame counter for statistics
    frames_encoded: u64,
    /// Total bytes produced
    bytes_produced: u64,
}

impl OpusEncoder {
    /// Create a new Opus encoder for `quality`
    pub fn new(quality: &AudioQuality) -> Result<Self, CodecError> {
        let channels = match quality.channels() {
            1 => Channels::Mono,
            _ => Channels::Stereo,
        };

        let application = match quality.application() {
            OpusApplication::Voip => Application::Voip,
            OpusApplication::Audio => Application::Audio,
            OpusApplication::LowDelay => Application::LowDelay,
        };

        let mut encoder = Encoder::new(quality.sample_rate().hz(), channels, application)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        Self::configure_encoder(&mut encoder, quality)?;

        Ok(Self {
            encoder,
            quality: *quality,
            encode_buffer: vec![0u8; MAX_OPUS_PACKET],
            frames_encoded: 0,
            bytes_produced: 0,
        })
    }

    fn configure_encoder(encoder: &mut Encoder, quality: &AudioQuality) -> Result<(), CodecError> {
        encoder
            .set_bitrate(opus::Bitrate::Bits(quality.bitrate() as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;

        encoder
            .set_vbr(true)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set VBR: {}", e)))?;

        // Matches `useinbandfec=1` in the session description
        encoder
            .set_inband_fec(true)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set FEC: {}", e)))?;
        encoder
            .set_packet_loss_perc(5)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set packet loss: {}", e)))?;

        Ok(())
    }

    /// Encode one frame of interleaved samples
    ///
    /// Input length must equal `quality.samples_per_frame()`.
    pub fn encode(&mut self, samples: &[f32]) -> Result<Bytes, CodecError> {
        if samples.len() != self.quality.samples_per_frame() {
            return Err(CodecError::InvalidFrameSize(samples.len()));
        }

        let size = self
            .encoder
            .encode_float(samples, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        self.frames_encoded += 1;
        self.bytes_produced += size as u64;

        Ok(Bytes::copy_from_slice(&self.encode_buffer[..size]))
    }

    pub fn quality(&self) -> &AudioQuality {
        &self.quality
    }

    /// Get expected total samples per frame (including all channels)
    pub fn samples_per_frame(&self) -> usize {
        self.quality.samples_per_frame()
    }

    /// Get statistics
    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            frames_encoded: self.frames_encoded,
            bytes_produced: self.bytes_produced,
            average_frame_size: if self.frames_encoded > 0 {
                self.bytes_produced as f32 / self.frames_encoded as f32
            } else {
                0.0
            },
        }
    }
}

/// Encoder statistics
#[derive(Debug, Clone)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_produced: u64,
    pub average_frame_size: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voice_encoding() {
        let quality = AudioQuality::voice();
        let mut encoder = OpusEncoder::new(&quality).unwrap();
        assert_eq!(encoder.samples_per_frame(), 320);

        let samples = vec![0.0f32; 320];
        let encoded = encoder.encode(&samples).unwrap();
        assert!(!encoded.is_empty());
        assert!(encoded.len() < 320 * 4);
        assert_eq!(encoder.stats().frames_encoded, 1);
    }

    #[test]
    fn test_stereo_low_delay() {
        let quality = AudioQuality::new(48_000, 2.5, 2, 128_000)
            .unwrap()
            .with_application(OpusApplication::LowDelay);
        let mut encoder = OpusEncoder::new(&quality).unwrap();

        // 2.5 ms at 48 kHz stereo = 120 * 2 samples
        assert_eq!(encoder.samples_per_frame(), 240);
        assert!(encoder.encode(&vec![0.0f32; 240]).is_ok());
    }

    #[test]
    fn test_wrong_frame_size() {
        let mut encoder = OpusEncoder::new(&AudioQuality::voice()).unwrap();
        assert!(matches!(
            encoder.encode(&[0.0f32; 100]),
            Err(CodecError::InvalidFrameSize(100))
        ));
    }
}
