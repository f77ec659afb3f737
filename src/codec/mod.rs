//! Opus codec wrapper
//!
//! Encoding for the audio capture pipeline and decoding for receivers.

pub mod decoder;
pub mod encoder;

pub use decoder::OpusDecoder;
pub use encoder::{EncoderStats, OpusEncoder};
