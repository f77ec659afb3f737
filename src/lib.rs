//! # LAN Media Streamer
//!
//! Low-latency media streaming core: capture, encode, RTP packetize and
//! multiplex one encoder to every admitted client.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                           StreamingServer (server)                       │
//! │  accept thread ──► admission check ──► ClientRegistry (one lock)         │
//! │                                         │  clients ─ liveness monitors   │
//! │                           first attach  │  last detach                   │
//! │                                         ▼                                │
//! │  ┌────────────────────────── StreamSession (session) ─────────────────┐  │
//! │  │                                                                    │  │
//! │  │  AudioStream                         VideoStream                   │  │
//! │  │  ┌─────────────┐                     ┌──────────────────────┐      │  │
//! │  │  │ AudioSource │                     │ SurfaceDrawingPipeline│     │  │
//! │  │  └──────┬──────┘                     │   (draw thread)       │     │  │
//! │  │         ▼                            └──────────┬───────────┘      │  │
//! │  │  ┌─────────────┐                     ┌──────────▼───────────┐      │  │
//! │  │  │ Opus encode │ capture thread      │ VideoEncoder (drain) │      │  │
//! │  │  └──────┬──────┘                     └──────────┬───────────┘      │  │
//! │  │         ▼ FrameQueue                            ▼ FrameQueue       │  │
//! │  │  ┌─────────────┐                     ┌──────────────────────┐      │  │
//! │  │  │ Packetizer  │ rtp-send thread     │ Packetizer           │      │  │
//! │  │  └──────┬──────┘                     └──────────┬───────────┘      │  │
//! │  └─────────┼───────────────────────────────────────┼──────────────────┘  │
//! └────────────┼───────────────────────────────────────┼─────────────────────┘
//!              ▼ RTP/UDP to every attached client      ▼
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod network;
pub mod queue;
pub mod render;
pub mod server;
pub mod session;
pub mod stream;
pub mod util;
pub mod video;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate for audio capture
    pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

    /// Default channel count (mono)
    pub const DEFAULT_CHANNELS: u16 = 1;

    /// Default Opus bitrate in bits per second
    pub const DEFAULT_BITRATE: u32 = 32_000;

    /// Default frame duration in milliseconds
    pub const DEFAULT_FRAME_DURATION_MS: f32 = 20.0;

    /// Opus bitrate bounds
    pub const MIN_OPUS_BITRATE: u32 = 6_000;
    pub const MAX_OPUS_BITRATE: u32 = 510_000;

    /// Video bounds
    pub const MIN_VIDEO_DIMENSION: u32 = 16;
    pub const MAX_VIDEO_DIMENSION: u32 = 4096;
    pub const MAX_FRAME_RATE: u32 = 120;
    pub const MIN_VIDEO_BITRATE: u32 = 64_000;
    pub const MAX_VIDEO_BITRATE: u32 = 50_000_000;

    /// Default presence (TCP) port of the streaming server
    pub const DEFAULT_SERVER_PORT: u16 = 8554;

    /// Default admission limit
    pub const DEFAULT_MAX_CLIENTS: usize = 10;

    /// Liveness monitor poll interval
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

    /// Accept loop poll interval
    pub const DEFAULT_ACCEPT_POLL_INTERVAL_MS: u64 = 50;

    /// Undelivered application events kept per channel
    pub const EVENT_QUEUE_CAPACITY: usize = 256;

    /// Bounded join when stopping threads
    pub const DEFAULT_JOIN_TIMEOUT_MS: u64 = 200;

    /// Default RTP ports (RTCP uses port + 1)
    pub const DEFAULT_AUDIO_RTP_PORT: u16 = 5004;
    pub const DEFAULT_VIDEO_RTP_PORT: u16 = 5006;

    /// Render timeout of the drawing pipeline
    pub const DEFAULT_RENDER_TIMEOUT_MS: u64 = 10_000;

    /// Maximum RTP packet size (header included)
    pub const MAX_PACKET_SIZE: usize = 1400;

    /// Encoded frame queue capacity
    pub const FRAME_QUEUE_CAPACITY: usize = 64;
}
