//! Surface-encoded video stream

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crate::config::VideoQuality;
use crate::constants::FRAME_QUEUE_CAPACITY;
use crate::error::{ConfigError, StreamError};
use crate::events::EventSender;
use crate::media::EncodedFrame;
use crate::network::{Destination, Packetizer, PacketizerStats};
use crate::queue::{FrameQueue, OverflowPolicy};
use crate::render::SurfaceDrawingPipeline;
use crate::stream::{MediaKind, MediaStream};
use crate::video::{VideoCodec, VideoEncoder};

const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(5);

pub struct VideoStream {
    encoder: VideoEncoder,
    packetizer: Packetizer,
    rtp_port: u16,
    rtcp_port: u16,
    start_timeout: Duration,
    description: Option<String>,
}

impl VideoStream {
    pub fn new(
        codec: Box<dyn VideoCodec>,
        drawing: Arc<SurfaceDrawingPipeline>,
        quality: VideoQuality,
        rtp_port: u16,
        rtcp_port: u16,
    ) -> Self {
        let queue = Arc::new(FrameQueue::<EncodedFrame>::new(
            FRAME_QUEUE_CAPACITY,
            OverflowPolicy::DropOldest,
        ));
        let packetizer = Packetizer::new(codec.payload_format(), queue.clone());
        let encoder = VideoEncoder::new(codec, drawing, quality, queue);

        Self {
            encoder,
            packetizer,
            rtp_port,
            rtcp_port,
            start_timeout: DEFAULT_START_TIMEOUT,
            description: None,
        }
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.encoder.events = Some(events);
        self
    }

    pub fn with_bind_address(mut self, bind_address: SocketAddr) -> Self {
        self.packetizer.bind_address = bind_address;
        self
    }

    /// How long `start` waits for the first drawn frame to reach the codec
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self.encoder.ready_timeout = timeout;
        self
    }

    pub fn quality(&self) -> &VideoQuality {
        self.encoder.quality()
    }

    pub fn encoder(&self) -> &VideoEncoder {
        &self.encoder
    }

    pub fn packetizer_stats(&self) -> PacketizerStats {
        self.packetizer.stats()
    }

    fn describe(&self) -> String {
        let mut description = format!(
            "m=video {} RTP/AVP {}\r\n",
            self.rtp_port,
            self.packetizer.payload_type()
        );
        for attribute in self.encoder.sdp_attributes() {
            description.push_str(&attribute);
            description.push_str("\r\n");
        }
        description
    }
}

impl MediaStream for VideoStream {
    fn kind(&self) -> MediaKind {
        MediaKind::Video
    }

    fn configure(&mut self) -> Result<(), StreamError> {
        if self.is_streaming() {
            return Err(StreamError::AlreadyStarted);
        }
        self.encoder.prepare()?;
        self.description = Some(self.describe());
        Ok(())
    }

    fn start(&mut self) -> Result<(), StreamError> {
        if self.description.is_none() {
            return Err(StreamError::NotConfigured);
        }
        if self.packetizer.destinations().is_empty() {
            return Err(ConfigError::MissingDestination.into());
        }

        self.encoder.start()?;
        if let Err(e) = self.encoder.wait_ready(self.start_timeout) {
            self.encoder.stop();
            return Err(e);
        }
        if let Err(e) = self.packetizer.start() {
            self.encoder.stop();
            return Err(e);
        }
        let quality = self.encoder.quality();
        tracing::info!(
            "Video stream started ({}x{} @ {} fps)",
            quality.width(),
            quality.height(),
            quality.frame_rate()
        );
        Ok(())
    }

    fn stop(&mut self) {
        self.packetizer.stop();
        self.encoder.stop();
    }

    fn release(&mut self) {
        self.stop();
        self.encoder.release();
        self.description = None;
    }

    fn is_streaming(&self) -> bool {
        self.packetizer.is_running() && self.encoder.is_running()
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

impl Drop for VideoStream {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::SoftwareGraphics;
    use crate::video::SoftwareJpegCodec;
    use std::net::UdpSocket;

    fn stream() -> VideoStream {
        let drawing = Arc::new(SurfaceDrawingPipeline::new(
            Arc::new(SoftwareGraphics::test_pattern(30)),
            64,
            48,
        ));
        VideoStream::new(
            Box::new(SoftwareJpegCodec::new()),
            drawing,
            VideoQuality::new(64, 48, 30, 500_000).unwrap(),
            5006,
            5007,
        )
        .with_bind_address("127.0.0.1:0".parse().unwrap())
    }

    #[test]
    fn test_description() {
        let mut stream = stream();
        assert!(stream.session_description().is_err());
        stream.configure().unwrap();
        assert_eq!(
            stream.session_description().unwrap(),
            "m=video 5006 RTP/AVP 26\r\n\
             a=rtpmap:26 JPEG/90000\r\n\
             a=framerate:30\r\n\
             a=x-dimensions:64,48\r\n"
        );
    }

    #[test]
    fn test_streams_jpeg_packets() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let port = receiver.local_addr().unwrap().port();

        let mut stream = stream();
        stream.set_destination("127.0.0.1".parse().unwrap(), port, port + 1);
        stream.configure().unwrap();
        stream.start().unwrap();
        assert!(stream.is_streaming());

        let mut buf = [0u8; 2048];
        let len = receiver.recv(&mut buf).unwrap();
        assert!(len > 12);
        assert_eq!(buf[1] & 0x7f, 26);

        stream.stop();
        assert!(!stream.is_streaming());
        assert!(!stream.encoder().drawing().is_running());
    }
}
