//! Surface-backed video encoder
//!
//! The encoder owns a [`VideoCodec`] and feeds it from a shared
//! [`SurfaceDrawingPipeline`]. The `video-encoder` drain thread waits for
//! the pipeline to report `Started`, attaches the codec input surface, and
//! then moves encoded access units into the output [`FrameQueue`].

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::VideoQuality;
use crate::error::{CodecError, StreamError};
use crate::events::{self, DrawingEvent, EventSender, StreamEvent};
use crate::media::{EncodedFrame, PipelineState};
use crate::network::PayloadFormat;
use crate::queue::{FrameQueue, PushError};
use crate::render::{RenderTarget, SurfaceDrawingPipeline};
use crate::util::join_with_timeout;
use crate::video::codec::VideoCodec;

const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(5);
const OUTPUT_POLL: Duration = Duration::from_millis(100);
const JOIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Default)]
struct ReadyState {
    ready: bool,
    /// The drain thread ended before or after becoming ready
    finished: bool,
}

#[derive(Default)]
struct Readiness {
    state: Mutex<ReadyState>,
    changed: Condvar,
}

impl Readiness {
    fn reset(&self) {
        *self.state.lock() = ReadyState::default();
    }

    fn set_ready(&self) {
        self.state.lock().ready = true;
        self.changed.notify_all();
    }

    fn set_finished(&self) {
        let mut state = self.state.lock();
        state.ready = false;
        state.finished = true;
        self.changed.notify_all();
    }

    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.ready && !state.finished {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.ready
    }
}

pub struct VideoEncoder {
    quality: VideoQuality,
    drawing: Arc<SurfaceDrawingPipeline>,
    /// Present whenever the drain thread is not running
    codec: Option<Box<dyn VideoCodec>>,
    /// Codec input surface between `prepare` and `start`
    surface: Option<Box<dyn RenderTarget>>,
    /// Encoded access units for the packetizer
    output: Arc<FrameQueue<EncodedFrame>>,
    pub(crate) events: Option<EventSender>,
    /// Upper bound of `wait_ready`
    pub(crate) ready_timeout: Duration,
    running: Arc<AtomicBool>,
    /// Set by the drain thread once the drawing pipeline reports `Started`
    readiness: Arc<Readiness>,
    /// Drain thread; joining it hands the codec back
    thread: Option<JoinHandle<Box<dyn VideoCodec>>>,
    state: PipelineState,
}

impl VideoEncoder {
    pub fn new(
        codec: Box<dyn VideoCodec>,
        drawing: Arc<SurfaceDrawingPipeline>,
        quality: VideoQuality,
        output: Arc<FrameQueue<EncodedFrame>>,
    ) -> Self {
        Self {
            quality,
            drawing,
            codec: Some(codec),
            surface: None,
            output,
            events: None,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            running: Arc::new(AtomicBool::new(false)),
            readiness: Arc::new(Readiness::default()),
            thread: None,
            state: PipelineState::Idle,
        }
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// How long the drain thread waits for the drawing pipeline to start
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn quality(&self) -> &VideoQuality {
        &self.quality
    }

    pub fn drawing(&self) -> &Arc<SurfaceDrawingPipeline> {
        &self.drawing
    }

    pub fn is_running(&self) -> bool {
        self.state == PipelineState::Running && self.running.load(Ordering::SeqCst)
    }

    /// Whether the input surface is attached and output is being drained
    pub fn is_ready(&self) -> bool {
        self.readiness.state.lock().ready
    }

    /// Block until the encoder is ready, the drain thread gave up, or `timeout`
    pub fn wait_ready(&self, timeout: Duration) -> Result<(), StreamError> {
        if self.state != PipelineState::Running {
            return Err(StreamError::InvalidState("encoder not started"));
        }
        if self.readiness.wait(timeout) {
            Ok(())
        } else {
            Err(StreamError::NotReady(timeout))
        }
    }

    /// RTP payload format of the codec output
    pub fn payload_format(&self) -> Option<Box<dyn PayloadFormat>> {
        self.codec.as_ref().map(|codec| codec.payload_format())
    }

    pub fn sdp_attributes(&self) -> Vec<String> {
        self.codec
            .as_ref()
            .map(|codec| codec.sdp_attributes())
            .unwrap_or_default()
    }

    /// Configure the codec and create its input surface
    pub fn prepare(&mut self) -> Result<(), StreamError> {
        match self.state {
            PipelineState::Prepared => return Ok(()),
            PipelineState::Running => return Err(StreamError::AlreadyStarted),
            PipelineState::Released => return Err(StreamError::InvalidState("encoder released")),
            PipelineState::Idle => {}
        }
        let codec = self.codec.as_mut().ok_or(CodecError::Released)?;
        codec.configure(&self.quality)?;
        self.surface = Some(codec.create_input_surface()?);
        self.state = PipelineState::Prepared;
        tracing::debug!(
            "Video encoder prepared ({}x{} @ {} fps)",
            self.quality.width(),
            self.quality.height(),
            self.quality.frame_rate()
        );
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), StreamError> {
        match self.state {
            PipelineState::Running => return Err(StreamError::AlreadyStarted),
            PipelineState::Prepared => {}
            _ => return Err(StreamError::NotPrepared),
        }
        let mut codec = self.codec.take().ok_or(StreamError::NotPrepared)?;

        let surface = match self.surface.take() {
            Some(surface) => Ok(surface),
            None => codec.create_input_surface(),
        }
        .and_then(|surface| codec.start().map(|_| surface));
        let surface = match surface {
            Ok(surface) => surface,
            Err(e) => {
                self.codec = Some(codec);
                return Err(e.into());
            }
        };

        // Subscribe before starting so Started cannot be missed
        let drawing_events = self.drawing.subscribe();
        if let Err(e) = self.drawing.start() {
            codec.stop();
            self.codec = Some(codec);
            self.surface = Some(surface);
            return Err(e.into());
        }

        self.readiness.reset();
        self.output.reopen();
        self.running.store(true, Ordering::SeqCst);

        let drain = Drain {
            drawing: self.drawing.clone(),
            drawing_events,
            output: self.output.clone(),
            events: self.events.clone(),
            running: self.running.clone(),
            readiness: self.readiness.clone(),
            ready_timeout: self.ready_timeout,
        };
        let handle = thread::Builder::new()
            .name("video-encoder".to_string())
            .spawn(move || drain.run(codec, surface))
            .map_err(|e| CodecError::EncoderInit(format!("failed to spawn drain thread: {}", e)))?;

        self.thread = Some(handle);
        self.state = PipelineState::Running;
        tracing::info!("Video encoder started");
        Ok(())
    }

    /// Stop draining; a no-op unless running
    pub fn stop(&mut self) {
        if self.state != PipelineState::Running {
            return;
        }
        self.running.store(false, Ordering::SeqCst);

        match self.thread.take().and_then(|h| join_with_timeout(h, JOIN_TIMEOUT)) {
            Some(mut codec) => {
                codec.stop();
                self.codec = Some(codec);
                self.state = PipelineState::Prepared;
            }
            None => {
                tracing::warn!("Video drain thread lost, encoder must be recreated");
                self.state = PipelineState::Idle;
            }
        }

        // Keeps drawing for other surfaces
        self.drawing.stop(false);
        tracing::info!("Video encoder stopped");
    }

    /// Free the codec and its surface; safe in any state
    pub fn release(&mut self) {
        if self.state == PipelineState::Released {
            return;
        }
        self.stop();
        self.surface = None;
        if let Some(mut codec) = self.codec.take() {
            codec.release();
        }
        self.state = PipelineState::Released;
        tracing::debug!("Video encoder released");
    }

    /// Change the quality of an encoder that is not running
    pub fn set_quality(&mut self, quality: VideoQuality) -> Result<(), StreamError> {
        match self.state {
            PipelineState::Running => Err(StreamError::InvalidState("cannot change quality while running")),
            PipelineState::Released => Err(StreamError::InvalidState("encoder released")),
            PipelineState::Idle => {
                self.quality = quality;
                Ok(())
            }
            PipelineState::Prepared => {
                self.surface = None;
                self.quality = quality;
                self.state = PipelineState::Idle;
                self.prepare()
            }
        }
    }
}

impl Drop for VideoEncoder {
    fn drop(&mut self) {
        self.release();
    }
}

struct Drain {
    drawing: Arc<SurfaceDrawingPipeline>,
    drawing_events: Receiver<DrawingEvent>,
    output: Arc<FrameQueue<EncodedFrame>>,
    events: Option<EventSender>,
    running: Arc<AtomicBool>,
    readiness: Arc<Readiness>,
    ready_timeout: Duration,
}

impl Drain {
    fn run(self, mut codec: Box<dyn VideoCodec>, surface: Box<dyn RenderTarget>) -> Box<dyn VideoCodec> {
        if let Err(message) = self.wait_started() {
            self.fail(message);
            self.readiness.set_finished();
            return codec;
        }

        let surface_id = self.drawing.add_surface(surface);
        self.readiness.set_ready();
        tracing::debug!("Video encoder attached to drawing pipeline");

        while self.running.load(Ordering::Relaxed) {
            match self.drawing_events.try_recv() {
                Ok(DrawingEvent::Error(message)) => {
                    self.fail(format!("drawing failed: {}", message));
                    break;
                }
                Ok(DrawingEvent::Stopped) => {
                    self.fail("drawing pipeline stopped".to_string());
                    break;
                }
                Ok(DrawingEvent::Started) | Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => break,
            }

            match codec.dequeue_output(OUTPUT_POLL) {
                Ok(Some(frame)) => match self.output.push(frame) {
                    Ok(()) | Err(PushError::Full(_)) => {}
                    Err(PushError::Closed(_)) => break,
                },
                Ok(None) => {}
                Err(e) => {
                    self.fail(format!("codec failed: {}", e));
                    break;
                }
            }
        }

        self.drawing.remove_surface(surface_id);
        self.readiness.set_finished();
        codec
    }

    fn wait_started(&self) -> Result<(), String> {
        let deadline = Instant::now() + self.ready_timeout;
        loop {
            if !self.running.load(Ordering::Relaxed) {
                return Err("stopped before the drawing pipeline started".to_string());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(format!("drawing pipeline did not start within {:?}", self.ready_timeout));
            }
            match self.drawing_events.recv_timeout(remaining.min(OUTPUT_POLL)) {
                Ok(DrawingEvent::Started) => return Ok(()),
                Ok(DrawingEvent::Error(message)) => return Err(format!("drawing failed: {}", message)),
                Ok(DrawingEvent::Stopped) => return Err("drawing pipeline stopped".to_string()),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err("drawing pipeline dropped".to_string()),
            }
        }
    }

    /// Report unless the failure comes from a requested stop
    fn fail(&self, message: String) {
        if !self.running.swap(false, Ordering::SeqCst) {
            tracing::debug!("Video encoder exiting during stop: {}", message);
            return;
        }
        tracing::error!("Video encoder: {}", message);
        events::emit(
            self.events.as_ref(),
            StreamEvent::EncoderError {
                source: "video",
                message,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RenderError;
    use crate::queue::OverflowPolicy;
    use crate::render::{GraphicsBackend, GraphicsContext, SoftwareGraphics};
    use crate::video::codec::SoftwareJpegCodec;

    fn quality() -> VideoQuality {
        VideoQuality::new(64, 48, 30, 500_000).unwrap()
    }

    fn queue() -> Arc<FrameQueue<EncodedFrame>> {
        Arc::new(FrameQueue::new(16, OverflowPolicy::DropOldest))
    }

    fn drawing(graphics: SoftwareGraphics) -> Arc<SurfaceDrawingPipeline> {
        Arc::new(SurfaceDrawingPipeline::new(Arc::new(graphics), 64, 48))
    }

    #[test]
    fn test_lifecycle_errors() {
        let mut encoder = VideoEncoder::new(
            Box::new(SoftwareJpegCodec::new()),
            drawing(SoftwareGraphics::test_pattern(30)),
            quality(),
            queue(),
        );
        encoder.stop();
        assert!(matches!(encoder.start(), Err(StreamError::NotPrepared)));

        encoder.prepare().unwrap();
        encoder.start().unwrap();
        assert!(matches!(encoder.start(), Err(StreamError::AlreadyStarted)));
        assert!(matches!(
            encoder.set_quality(quality()),
            Err(StreamError::InvalidState(_))
        ));
        encoder.release();
        encoder.release();
        assert_eq!(encoder.state(), PipelineState::Released);
    }

    #[test]
    fn test_encodes_drawn_frames() {
        let output = queue();
        let mut encoder = VideoEncoder::new(
            Box::new(SoftwareJpegCodec::new()),
            drawing(SoftwareGraphics::test_pattern(30)),
            quality(),
            output.clone(),
        );
        encoder.prepare().unwrap();
        encoder.start().unwrap();
        encoder.wait_ready(Duration::from_secs(1)).unwrap();

        let frame = output.pop_timeout(Duration::from_secs(1)).unwrap();
        assert!(frame.data.starts_with(&[0xff, 0xd8]));
        encoder.stop();
        assert_eq!(encoder.state(), PipelineState::Prepared);
        assert!(!encoder.drawing().is_running());
    }

    #[test]
    fn test_release_frees_every_resource() {
        let graphics = SoftwareGraphics::test_pattern(30);
        let contexts = graphics.contexts();
        let codec = SoftwareJpegCodec::new();
        let codecs = codec.codec_counter();
        let surfaces = codec.surface_counter();

        let mut encoder = VideoEncoder::new(Box::new(codec), drawing(graphics), quality(), queue());
        encoder.prepare().unwrap();
        encoder.start().unwrap();
        encoder.wait_ready(Duration::from_secs(1)).unwrap();
        assert_eq!((contexts.live(), codecs.live(), surfaces.live()), (1, 1, 1));

        encoder.release();
        assert_eq!((contexts.live(), codecs.live(), surfaces.live()), (0, 0, 0));
    }

    #[test]
    fn test_restart_creates_new_surface() {
        let output = queue();
        let mut encoder = VideoEncoder::new(
            Box::new(SoftwareJpegCodec::new()),
            drawing(SoftwareGraphics::test_pattern(30)),
            quality(),
            output.clone(),
        );
        encoder.prepare().unwrap();
        for _ in 0..2 {
            encoder.start().unwrap();
            encoder.wait_ready(Duration::from_secs(1)).unwrap();
            assert!(output.pop_timeout(Duration::from_secs(1)).is_ok());
            encoder.stop();
            output.clear();
        }
    }

    struct BrokenBackend;

    impl GraphicsBackend for BrokenBackend {
        fn create_context(&self, _: u32, _: u32) -> Result<Box<dyn GraphicsContext>, RenderError> {
            Err(RenderError::ContextCreation("no display".to_string()))
        }
    }

    #[test]
    fn test_prepare_rejects_resolution_the_payload_cannot_carry() {
        let qhd = VideoQuality::new(2560, 1440, 30, 4_000_000).unwrap();
        let mut encoder = VideoEncoder::new(
            Box::new(SoftwareJpegCodec::new()),
            Arc::new(SurfaceDrawingPipeline::new(Arc::new(SoftwareGraphics::test_pattern(30)), 2560, 1440)),
            qhd,
            queue(),
        );
        assert!(matches!(
            encoder.prepare(),
            Err(StreamError::Codec(CodecError::Config(_)))
        ));
        assert_eq!(encoder.state(), PipelineState::Idle);
        encoder.release();
    }

    #[test]
    fn test_drawing_failure_is_reported() {
        let (tx, rx) = events::channel();
        let mut encoder = VideoEncoder::new(
            Box::new(SoftwareJpegCodec::new()),
            Arc::new(SurfaceDrawingPipeline::new(Arc::new(BrokenBackend), 64, 48)),
            quality(),
            queue(),
        )
        .with_events(tx);
        encoder.prepare().unwrap();
        encoder.start().unwrap();

        assert!(matches!(
            encoder.wait_ready(Duration::from_secs(1)),
            Err(StreamError::NotReady(_))
        ));
        let event = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(event, StreamEvent::EncoderError { source: "video", .. }));
        encoder.release();
    }
}
