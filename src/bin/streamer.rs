//! Media Streamer Application
//!
//! Serves Opus audio (and optionally a Motion JPEG test pattern) to every
//! client that connects to the presence port.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_media_streamer::{
    audio::{AudioSource, ToneSource},
    config::{AppConfig, AudioConfig, AudioSourceKind, VideoConfig},
    error::{AudioError, StreamError},
    events::{self, EventReceiver, EventSender, StreamEvent},
    render::{SoftwareGraphics, SurfaceDrawingPipeline},
    server::{ClientRegistry, SessionHandler, StreamingServer},
    session::StreamSession,
    stream::{AudioStream, MediaStream, VideoStream},
    video::SoftwareJpegCodec,
};

/// Binds the configured streams into every new session
struct MediaHandler {
    audio: AudioConfig,
    video: VideoConfig,
    events: EventSender,
}

impl MediaHandler {
    fn audio_source(&self) -> Result<Box<dyn AudioSource>, AudioError> {
        match self.audio.source {
            AudioSourceKind::Tone => Ok(Box::new(ToneSource::new(self.audio.tone_hz))),
            #[cfg(feature = "device-capture")]
            AudioSourceKind::Device => Ok(Box::new(lan_media_streamer::audio::DeviceSource::new(
                self.audio.device.clone(),
            ))),
            #[cfg(not(feature = "device-capture"))]
            AudioSourceKind::Device => {
                tracing::error!("Built without the device-capture feature");
                Err(AudioError::SourceUnavailable)
            }
        }
    }

    fn audio_stream(&self) -> Result<AudioStream, StreamError> {
        let stream = AudioStream::new(
            self.audio_source()?,
            self.audio.quality()?,
            self.audio.rtp_port,
            self.audio.rtcp_port,
        )
        .with_events(self.events.clone());
        if self.audio.start_muted {
            stream.mute();
        }
        Ok(stream)
    }

    fn video_stream(&self) -> Result<VideoStream, StreamError> {
        let quality = self.video.quality()?;
        let graphics = SoftwareGraphics::test_pattern(quality.frame_rate());
        let drawing = SurfaceDrawingPipeline::new(Arc::new(graphics), quality.width(), quality.height())
            .with_render_timeout(Duration::from_millis(self.video.render_timeout_ms));

        Ok(VideoStream::new(
            Box::new(SoftwareJpegCodec::new()),
            Arc::new(drawing),
            quality,
            self.video.rtp_port,
            self.video.rtcp_port,
        )
        .with_events(self.events.clone()))
    }
}

impl SessionHandler for MediaHandler {
    fn on_session_created(&self, session: &mut StreamSession) -> Result<(), StreamError> {
        if self.audio.enabled {
            session.bind(Box::new(self.audio_stream()?))?;
        }
        if self.video.enabled {
            session.bind(Box::new(self.video_stream()?))?;
        }
        Ok(())
    }

    fn on_session_released(&self, session: &StreamSession) {
        let lifetime = chrono::Utc::now() - session.created_at();
        tracing::info!(
            "Session {} ended after {}s",
            session.id(),
            lifetime.num_seconds()
        );
    }
}

fn report_events(events: EventReceiver, registry: Arc<ClientRegistry>) {
    for event in events.iter() {
        match event {
            StreamEvent::SessionCreated(id) => {
                let description = registry.with_session(|session| session.session_description());
                if let Some(Ok(description)) = description {
                    println!("\n=== Session {} ===\n{}", id, description);
                }
            }
            StreamEvent::ClientAttached { peer, clients } => {
                println!("  + {} ({} attached)", peer, clients);
            }
            StreamEvent::ClientDetached { peer, clients } => {
                println!("  - {} ({} attached)", peer, clients);
            }
            StreamEvent::ClientRejected { peer } => {
                println!("  ! {} rejected, server full", peer);
            }
            StreamEvent::SessionReleased(id) => println!("=== Session {} released ===", id),
            StreamEvent::SessionFailed(message) => println!("Session failed: {}", message),
            StreamEvent::EncoderError { source, message } => {
                println!("{} encoder error: {}", source, message);
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting LAN Media Streamer");

    let config = match std::env::args().nth(1) {
        Some(path) => AppConfig::load(Path::new(&path))?,
        None => AppConfig::load_or_default()?,
    };
    config.validate()?;

    println!("\n=== Streams ===");
    if config.audio.enabled {
        let quality = config.audio.quality()?;
        println!(
            "  Audio: Opus {} Hz, {} ch, {} bps, {} ms → RTP {}{}",
            quality.sample_rate().hz(),
            quality.channels(),
            quality.bitrate(),
            quality.frame_duration().as_millis_f32(),
            config.audio.rtp_port,
            if config.audio.start_muted { " (muted)" } else { "" }
        );
    }
    if config.video.enabled {
        println!(
            "  Video: JPEG {}x{} @ {} fps → RTP {}",
            config.video.width, config.video.height, config.video.frame_rate, config.video.rtp_port
        );
    }
    println!();

    let (sender, receiver) = events::channel();
    let handler = Arc::new(MediaHandler {
        audio: config.audio.clone(),
        video: config.video.clone(),
        events: sender.clone(),
    });
    let mut server = StreamingServer::with_events(config.server.clone(), handler, sender, receiver);
    server.start()?;

    if let Some(addr) = server.local_addr() {
        tracing::info!("Clients connect to tcp://{} (max {})", addr, config.server.max_clients);
    }

    let registry = server.registry().clone();
    let events = server.events();
    thread::Builder::new()
        .name("event-report".to_string())
        .spawn(move || report_events(events, registry))?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    if let Ok(status) = serde_json::to_string_pretty(&server.status()) {
        tracing::debug!("Final status: {}", status);
    }
    server.stop();

    Ok(())
}
