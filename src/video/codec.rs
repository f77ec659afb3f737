//! Surface-fed video codecs

use bytes::Bytes;
use jpeg_encoder::{ColorType, Encoder, SamplingFactor};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::VideoQuality;
use crate::error::{CodecError, ConfigError, RenderError};
use crate::media::EncodedFrame;
use crate::network::jpeg::{JpegPayload, JPEG_PAYLOAD_TYPE, MAX_DIMENSION};
use crate::network::PayloadFormat;
use crate::queue::{FrameQueue, OverflowPolicy, PopError};
use crate::render::software::{ResourceCounter, ResourceGuard};
use crate::render::{RenderTarget, SurfaceId, VideoImage};

/// A codec whose input is a render target
///
/// Call order: `configure` → `create_input_surface` → `start` →
/// `dequeue_output`… → `stop` → (`start` …) → `release`.
pub trait VideoCodec: Send {
    fn configure(&mut self, quality: &VideoQuality) -> Result<(), CodecError>;

    /// Surface the drawing pipeline renders into
    fn create_input_surface(&mut self) -> Result<Box<dyn RenderTarget>, CodecError>;

    fn start(&mut self) -> Result<(), CodecError>;

    /// Wait up to `timeout` for the next encoded access unit
    fn dequeue_output(&mut self, timeout: Duration) -> Result<Option<EncodedFrame>, CodecError>;

    fn stop(&mut self);

    fn release(&mut self);

    /// RTP payload format matching the encoder output
    fn payload_format(&self) -> Box<dyn PayloadFormat>;

    /// Media-level session description attributes, after `configure`
    fn sdp_attributes(&self) -> Vec<String>;
}

/// Pictures waiting for the encoder; older ones are dropped when it lags
const INPUT_DEPTH: usize = 2;

/// Motion JPEG encoder running on the CPU
pub struct SoftwareJpegCodec {
    quality: Option<VideoQuality>,
    input: Arc<FrameQueue<VideoImage>>,
    accepting: Arc<AtomicBool>,
    started: bool,
    released: bool,
    sequence: u32,
    codecs: ResourceCounter,
    surfaces: ResourceCounter,
    instance: Option<ResourceGuard>,
}

impl SoftwareJpegCodec {
    pub fn new() -> Self {
        Self {
            quality: None,
            input: Arc::new(FrameQueue::new(INPUT_DEPTH, OverflowPolicy::DropOldest)),
            accepting: Arc::new(AtomicBool::new(false)),
            started: false,
            released: false,
            sequence: 0,
            codecs: ResourceCounter::new(),
            surfaces: ResourceCounter::new(),
            instance: None,
        }
    }

    /// Configured codec instances alive
    pub fn codec_counter(&self) -> ResourceCounter {
        self.codecs.clone()
    }

    /// Input surfaces alive
    pub fn surface_counter(&self) -> ResourceCounter {
        self.surfaces.clone()
    }

    fn encode(&mut self, image: &VideoImage, quality: &VideoQuality) -> Result<EncodedFrame, CodecError> {
        let mut data = Vec::with_capacity(image.data.len() / 8);
        let mut encoder = Encoder::new(&mut data, quality.jpeg_quality());
        encoder.set_sampling_factor(SamplingFactor::F_2_2);
        encoder
            .encode(&image.data, image.width as u16, image.height as u16, ColorType::Rgb)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        let frame = EncodedFrame::new(Bytes::from(data), image.timestamp_us, self.sequence);
        self.sequence = self.sequence.wrapping_add(1);
        Ok(frame)
    }
}

impl Default for SoftwareJpegCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoCodec for SoftwareJpegCodec {
    fn configure(&mut self, quality: &VideoQuality) -> Result<(), CodecError> {
        if self.released {
            return Err(CodecError::Released);
        }
        if self.started {
            return Err(CodecError::EncoderInit("cannot configure a started codec".to_string()));
        }
        // RTP/JPEG headers cannot describe larger pictures
        let limit = u32::from(MAX_DIMENSION);
        if quality.width() > limit || quality.height() > limit {
            return Err(ConfigError::UnsupportedResolution {
                width: quality.width(),
                height: quality.height(),
            }
            .into());
        }
        self.quality = Some(*quality);
        if self.instance.is_none() {
            self.instance = Some(self.codecs.acquire());
        }
        Ok(())
    }

    fn create_input_surface(&mut self) -> Result<Box<dyn RenderTarget>, CodecError> {
        if self.released {
            return Err(CodecError::Released);
        }
        let quality = self.quality.ok_or(CodecError::NotConfigured)?;
        Ok(Box::new(JpegInputSurface {
            id: SurfaceId::next(),
            width: quality.width(),
            height: quality.height(),
            input: self.input.clone(),
            accepting: self.accepting.clone(),
            _guard: self.surfaces.acquire(),
        }))
    }

    fn start(&mut self) -> Result<(), CodecError> {
        if self.released {
            return Err(CodecError::Released);
        }
        if self.quality.is_none() {
            return Err(CodecError::NotConfigured);
        }
        self.input.clear();
        self.input.reopen();
        self.accepting.store(true, Ordering::SeqCst);
        self.started = true;
        Ok(())
    }

    fn dequeue_output(&mut self, timeout: Duration) -> Result<Option<EncodedFrame>, CodecError> {
        if self.released {
            return Err(CodecError::Released);
        }
        if !self.started {
            return Err(CodecError::NotStarted);
        }
        let quality = self.quality.ok_or(CodecError::NotConfigured)?;

        match self.input.pop_timeout(timeout) {
            Ok(image) => self.encode(&image, &quality).map(Some),
            Err(PopError::Timeout) => Ok(None),
            Err(PopError::Closed) => Err(CodecError::Released),
        }
    }

    fn stop(&mut self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.started = false;
        self.input.clear();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.stop();
        self.input.close();
        self.instance = None;
        self.released = true;
    }

    fn payload_format(&self) -> Box<dyn PayloadFormat> {
        Box::new(JpegPayload::new())
    }

    fn sdp_attributes(&self) -> Vec<String> {
        match &self.quality {
            Some(quality) => vec![
                format!("a=rtpmap:{} JPEG/90000", JPEG_PAYLOAD_TYPE),
                format!("a=framerate:{}", quality.frame_rate()),
                format!("a=x-dimensions:{},{}", quality.width(), quality.height()),
            ],
            None => Vec::new(),
        }
    }
}

impl Drop for SoftwareJpegCodec {
    fn drop(&mut self) {
        self.release();
    }
}

struct JpegInputSurface {
    id: SurfaceId,
    width: u32,
    height: u32,
    input: Arc<FrameQueue<VideoImage>>,
    accepting: Arc<AtomicBool>,
    _guard: ResourceGuard,
}

impl RenderTarget for JpegInputSurface {
    fn id(&self) -> SurfaceId {
        self.id
    }

    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn render(&mut self, image: &VideoImage) -> Result<(), RenderError> {
        if !self.accepting.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.input
            .push(image.scaled(self.width, self.height))
            .map_err(|_| RenderError::SurfaceLost("codec input closed".to_string()))
    }
}
