//! Configuration: validated codec qualities and the TOML application config
//!
//! Codec parameters come from fixed, validated sets. A value outside a set is
//! rejected at construction with a distinguishable [`ConfigError`] variant;
//! nothing is clamped.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::ConfigError;

/// Opus sample rates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleRate {
    Hz8000,
    Hz12000,
    Hz16000,
    Hz24000,
    Hz48000,
}

impl SampleRate {
    pub fn hz(self) -> u32 {
        match self {
            SampleRate::Hz8000 => 8_000,
            SampleRate::Hz12000 => 12_000,
            SampleRate::Hz16000 => 16_000,
            SampleRate::Hz24000 => 24_000,
            SampleRate::Hz48000 => 48_000,
        }
    }
}

impl TryFrom<u32> for SampleRate {
    type Error = ConfigError;

    fn try_from(hz: u32) -> Result<Self, Self::Error> {
        match hz {
            8_000 => Ok(SampleRate::Hz8000),
            12_000 => Ok(SampleRate::Hz12000),
            16_000 => Ok(SampleRate::Hz16000),
            24_000 => Ok(SampleRate::Hz24000),
            48_000 => Ok(SampleRate::Hz48000),
            other => Err(ConfigError::UnsupportedSampleRate(other)),
        }
    }
}

/// Opus frame durations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameDuration {
    Ms2_5,
    Ms5,
    Ms10,
    Ms20,
    Ms40,
}

impl FrameDuration {
    const ALL: [FrameDuration; 5] = [
        FrameDuration::Ms2_5,
        FrameDuration::Ms5,
        FrameDuration::Ms10,
        FrameDuration::Ms20,
        FrameDuration::Ms40,
    ];

    /// Duration in tenths of a millisecond
    pub fn tenths_ms(self) -> u32 {
        match self {
            FrameDuration::Ms2_5 => 25,
            FrameDuration::Ms5 => 50,
            FrameDuration::Ms10 => 100,
            FrameDuration::Ms20 => 200,
            FrameDuration::Ms40 => 400,
        }
    }

    pub fn as_millis_f32(self) -> f32 {
        self.tenths_ms() as f32 / 10.0
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_micros(self.tenths_ms() as u64 * 100)
    }

    /// Samples per channel in one frame at `rate`
    pub fn samples(self, rate: SampleRate) -> usize {
        (rate.hz() * self.tenths_ms() / 10_000) as usize
    }
}

impl TryFrom<f32> for FrameDuration {
    type Error = ConfigError;

    fn try_from(ms: f32) -> Result<Self, Self::Error> {
        FrameDuration::ALL
            .into_iter()
            .find(|d| (d.as_millis_f32() - ms).abs() < 1e-3)
            .ok_or(ConfigError::UnsupportedFrameDuration(ms))
    }
}

/// Opus encoder application mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpusApplication {
    #[default]
    Voip,
    Audio,
    LowDelay,
}

/// Immutable audio encoding parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioQuality {
    sample_rate: SampleRate,
    frame_duration: FrameDuration,
    channels: u16,
    bitrate: u32,
    application: OpusApplication,
}

impl AudioQuality {
    /// Validate and build an audio quality
    pub fn new(
        sample_rate: u32,
        frame_duration_ms: f32,
        channels: u16,
        bitrate: u32,
    ) -> Result<Self, ConfigError> {
        let sample_rate = SampleRate::try_from(sample_rate)?;
        let frame_duration = FrameDuration::try_from(frame_duration_ms)?;
        if !(1..=2).contains(&channels) {
            return Err(ConfigError::UnsupportedChannels(channels));
        }
        if !(MIN_OPUS_BITRATE..=MAX_OPUS_BITRATE).contains(&bitrate) {
            return Err(ConfigError::UnsupportedBitrate(bitrate));
        }

        Ok(Self {
            sample_rate,
            frame_duration,
            channels,
            bitrate,
            application: OpusApplication::default(),
        })
    }

    /// 16 kHz mono speech, 20 ms frames
    pub fn voice() -> Self {
        Self {
            sample_rate: SampleRate::Hz16000,
            frame_duration: FrameDuration::Ms20,
            channels: 1,
            bitrate: 32_000,
            application: OpusApplication::Voip,
        }
    }

    pub fn with_application(mut self, application: OpusApplication) -> Self {
        self.application = application;
        self
    }

    pub fn sample_rate(&self) -> SampleRate {
        self.sample_rate
    }

    pub fn frame_duration(&self) -> FrameDuration {
        self.frame_duration
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }

    pub fn application(&self) -> OpusApplication {
        self.application
    }

    /// Samples per channel in one frame
    pub fn samples_per_channel(&self) -> usize {
        self.frame_duration.samples(self.sample_rate)
    }

    /// Interleaved samples in one frame
    pub fn samples_per_frame(&self) -> usize {
        self.samples_per_channel() * self.channels as usize
    }
}

/// Immutable video encoding parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoQuality {
    width: u32,
    height: u32,
    frame_rate: u32,
    bitrate: u32,
    jpeg_quality: u8,
}

impl VideoQuality {
    pub fn new(width: u32, height: u32, frame_rate: u32, bitrate: u32) -> Result<Self, ConfigError> {
        let valid_dim = |d: u32| (MIN_VIDEO_DIMENSION..=MAX_VIDEO_DIMENSION).contains(&d) && d % 2 == 0;
        if !valid_dim(width) || !valid_dim(height) {
            return Err(ConfigError::UnsupportedResolution { width, height });
        }
        if !(1..=MAX_FRAME_RATE).contains(&frame_rate) {
            return Err(ConfigError::UnsupportedFrameRate(frame_rate));
        }
        if !(MIN_VIDEO_BITRATE..=MAX_VIDEO_BITRATE).contains(&bitrate) {
            return Err(ConfigError::UnsupportedBitrate(bitrate));
        }

        Ok(Self {
            width,
            height,
            frame_rate,
            bitrate,
            jpeg_quality: 80,
        })
    }

    /// JPEG quality (1-100) used by software codecs
    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }

    pub fn jpeg_quality(&self) -> u8 {
        self.jpeg_quality
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.frame_rate as u64)
    }
}

/// Streaming server section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    pub max_clients: usize,
    pub poll_interval_ms: u64,
    pub accept_poll_interval_ms: u64,
    pub join_timeout_ms: u64,
}

impl ServerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn accept_poll_interval(&self) -> Duration {
        Duration::from_millis(self.accept_poll_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_SERVER_PORT,
            max_clients: DEFAULT_MAX_CLIENTS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            accept_poll_interval_ms: DEFAULT_ACCEPT_POLL_INTERVAL_MS,
            join_timeout_ms: DEFAULT_JOIN_TIMEOUT_MS,
        }
    }
}

/// Where the audio pipeline reads samples from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioSourceKind {
    /// Synthetic sine tone
    #[default]
    Tone,
    /// Input device through cpal
    Device,
}

/// Audio stream section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub enabled: bool,
    pub source: AudioSourceKind,
    /// Device identifier (`input:<name>`), default input when empty
    pub device: Option<String>,
    pub tone_hz: f32,
    pub sample_rate: u32,
    pub frame_duration_ms: f32,
    pub channels: u16,
    pub bitrate: u32,
    pub application: OpusApplication,
    pub rtp_port: u16,
    pub rtcp_port: u16,
    pub start_muted: bool,
}

impl AudioConfig {
    pub fn quality(&self) -> Result<AudioQuality, ConfigError> {
        Ok(
            AudioQuality::new(self.sample_rate, self.frame_duration_ms, self.channels, self.bitrate)?
                .with_application(self.application),
        )
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            source: AudioSourceKind::Tone,
            device: None,
            tone_hz: 440.0,
            sample_rate: DEFAULT_SAMPLE_RATE,
            frame_duration_ms: DEFAULT_FRAME_DURATION_MS,
            channels: DEFAULT_CHANNELS,
            bitrate: DEFAULT_BITRATE,
            application: OpusApplication::Voip,
            rtp_port: DEFAULT_AUDIO_RTP_PORT,
            rtcp_port: DEFAULT_AUDIO_RTP_PORT + 1,
            start_muted: false,
        }
    }
}

/// Video stream section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub enabled: bool,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bitrate: u32,
    pub jpeg_quality: u8,
    pub rtp_port: u16,
    pub rtcp_port: u16,
    /// 0 disables the render timeout
    pub render_timeout_ms: u64,
}

impl VideoConfig {
    pub fn quality(&self) -> Result<VideoQuality, ConfigError> {
        Ok(VideoQuality::new(self.width, self.height, self.frame_rate, self.bitrate)?
            .with_jpeg_quality(self.jpeg_quality))
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            width: 640,
            height: 480,
            frame_rate: 15,
            bitrate: 2_000_000,
            jpeg_quality: 80,
            rtp_port: DEFAULT_VIDEO_RTP_PORT,
            rtcp_port: DEFAULT_VIDEO_RTP_PORT + 1,
            render_timeout_ms: DEFAULT_RENDER_TIMEOUT_MS,
        }
    }
}

/// Whole application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub video: VideoConfig,
}

impl AppConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file
    pub fn load(path: &Path) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_toml_str(&text)?)
    }

    /// Load the file at [`AppConfig::default_path`], falling back to defaults when absent
    pub fn load_or_default() -> crate::Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading configuration from {}", path.display());
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// `config.toml` inside the per-user configuration directory
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("net", "lan-media", "lan-media-streamer")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Check every enabled section
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.audio.enabled {
            self.audio.quality()?;
        }
        if self.video.enabled {
            self.video.quality()?;
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}
