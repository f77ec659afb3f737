//! Error types for the media streaming core

use std::time::Duration;
use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Unsupported or incomplete configuration, raised before any resource is allocated
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Unsupported sample rate: {0} Hz")]
    UnsupportedSampleRate(u32),

    #[error("Unsupported frame duration: {0} ms")]
    UnsupportedFrameDuration(f32),

    #[error("Unsupported channel count: {0}")]
    UnsupportedChannels(u16),

    #[error("Unsupported bitrate: {0} bps")]
    UnsupportedBitrate(u32),

    #[error("Unsupported resolution: {width}x{height}")]
    UnsupportedResolution { width: u32, height: u32 },

    #[error("Unsupported frame rate: {0} fps")]
    UnsupportedFrameRate(u32),

    #[error("No destination set")]
    MissingDestination,

    #[error("Invalid configuration file: {0}")]
    Parse(String),
}

/// Audio capture errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Capture source is not open")]
    NotOpen,

    #[error("Capture source unavailable")]
    SourceUnavailable,
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),

    #[error("Codec is not configured")]
    NotConfigured,

    #[error("Codec is not started")]
    NotStarted,

    #[error("Codec has been released")]
    Released,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Rendering (graphics context / surface) errors
#[derive(Error, Debug, Clone)]
pub enum RenderError {
    #[error("Failed to create graphics context: {0}")]
    ContextCreation(String),

    #[error("Surface lost: {0}")]
    SurfaceLost(String),

    #[error("No image within {0:?}")]
    Timeout(Duration),

    #[error("Image feed closed")]
    FeedClosed,
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),

    #[error("Invalid packet format")]
    InvalidPacket,

    #[error("Unsupported payload: {0}")]
    UnsupportedPayload(String),
}

/// Lifecycle errors of pipelines, streams and sessions
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Not configured yet")]
    NotConfigured,

    #[error("prepare() has not succeeded")]
    NotPrepared,

    #[error("Already started")]
    AlreadyStarted,

    #[error("A stream is already bound to this session")]
    AlreadyBound,

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Encoder not ready within {0:?}")]
    NotReady(Duration),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Network(#[from] NetworkError),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
