//! Opus audio stream

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::audio::{AudioCapturePipeline, AudioSource, CaptureStats};
use crate::config::AudioQuality;
use crate::constants::FRAME_QUEUE_CAPACITY;
use crate::error::StreamError;
use crate::events::EventSender;
use crate::media::EncodedFrame;
use crate::network::{Destination, OpusPayload, Packetizer, PacketizerStats};
use crate::queue::{FrameQueue, OverflowPolicy};
use crate::stream::{MediaKind, MediaStream};

pub struct AudioStream {
    quality: AudioQuality,
    pipeline: AudioCapturePipeline,
    packetizer: Packetizer,
    rtp_port: u16,
    rtcp_port: u16,
    description: Option<String>,
}

impl AudioStream {
    pub fn new(source: Box<dyn AudioSource>, quality: AudioQuality, rtp_port: u16, rtcp_port: u16) -> Self {
        let queue = Arc::new(FrameQueue::<EncodedFrame>::new(
            FRAME_QUEUE_CAPACITY,
            OverflowPolicy::DropOldest,
        ));
        let pipeline = AudioCapturePipeline::new(source, quality, queue.clone());
        let packetizer = Packetizer::new(Box::new(OpusPayload::new(quality.sample_rate().hz())), queue);

        Self {
            quality,
            pipeline,
            packetizer,
            rtp_port,
            rtcp_port,
            description: None,
        }
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.pipeline.events = Some(events);
        self
    }

    /// Local address media is sent from
    pub fn with_bind_address(mut self, bind_address: SocketAddr) -> Self {
        self.packetizer.bind_address = bind_address;
        self
    }

    pub fn quality(&self) -> &AudioQuality {
        &self.quality
    }

    pub fn capture_stats(&self) -> CaptureStats {
        self.pipeline.stats()
    }

    pub fn packetizer_stats(&self) -> PacketizerStats {
        self.packetizer.stats()
    }

    pub fn packetizer(&self) -> &Packetizer {
        &self.packetizer
    }

    fn describe(&self) -> String {
        let rate = self.quality.sample_rate().hz();
        let channels = self.quality.channels();
        let pt = self.packetizer.payload_type();
        format!(
            "m=audio {port} RTP/AVP {pt}\r\n\
             a=rtpmap:{pt} opus/{rate}/{channels}\r\n\
             a=fmtp:{pt} maxplaybackrate={rate}; sprop-maxcapturerate={rate}; maxaveragebitrate={bitrate}; stereo={stereo}; useinbandfec=1; usedtx=0\r\n\
             a=ptime:{ptime}\r\n",
            port = self.rtp_port,
            bitrate = self.quality.bitrate(),
            stereo = u8::from(channels == 2),
            ptime = self.quality.frame_duration().as_millis_f32(),
        )
    }
}

impl MediaStream for AudioStream {
    fn kind(&self) -> MediaKind {
        MediaKind::Audio
    }

    fn configure(&mut self) -> Result<(), StreamError> {
        if self.is_streaming() {
            return Err(StreamError::AlreadyStarted);
        }
        self.pipeline.prepare()?;
        self.description = Some(self.describe());
        Ok(())
    }

    fn start(&mut self) -> Result<(), StreamError> {
        if self.description.is_none() {
            return Err(StreamError::NotConfigured);
        }
        // Fail on a missing destination before the device is started
        if self.packetizer.destinations().is_empty() {
            return Err(crate::error::ConfigError::MissingDestination.into());
        }
        self.pipeline.start()?;
        if let Err(e) = self.packetizer.start() {
            self.pipeline.stop();
            return Err(e);
        }
        tracing::info!(
            "Audio stream started ({} Hz, {} ch, {} bps)",
            self.quality.sample_rate().hz(),
            self.quality.channels(),
            self.quality.bitrate()
        );
        Ok(())
    }

    fn stop(&mut self) {
        self.packetizer.stop();
        self.pipeline.stop();
    }

    fn release(&mut self) {
        self.stop();
        self.pipeline.release();
        self.description = None;
    }

    fn is_streaming(&self) -> bool {
        self.packetizer.is_running() && self.pipeline.is_running()
    }

    fn session_description(&self) -> Result<String, StreamError> {
        self.description.clone().ok_or(StreamError::NotConfigured)
    }

    fn rtp_port(&self) -> u16 {
        self.rtp_port
    }

    fn rtcp_port(&self) -> u16 {
        self.rtcp_port
    }

    fn set_destination(&self, ip: IpAddr, rtp_port: u16, rtcp_port: u16) {
        self.packetizer.set_destination(ip, rtp_port, rtcp_port);
    }

    fn add_destination(&self, destination: Destination) {
        self.packetizer.add_destination(destination);
    }

    fn remove_destination(&self, destination: &Destination) -> bool {
        self.packetizer.remove_destination(destination)
    }

    fn mute(&self) {
        self.packetizer.mute();
    }

    fn unmute(&self) {
        self.packetizer.unmute();
    }

    fn is_muted(&self) -> bool {
        self.packetizer.is_muted()
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        self.release();
    }
}
