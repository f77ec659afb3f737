//! Audio capture → Opus encode pipeline
//!
//! One `audio-capture` thread reads exact frames from an [`AudioSource`],
//! encodes them and pushes the packets into the output [`FrameQueue`]. The
//! source and encoder move into the thread on `start()` and come back on
//! `stop()`, so a stopped pipeline can be started again without reopening
//! the device.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::buffer::AudioFrame;
use crate::audio::source::AudioSource;
use crate::codec::OpusEncoder;
use crate::config::AudioQuality;
use crate::error::{AudioError, StreamError};
use crate::events::{self, EventSender, StreamEvent};
use crate::media::{EncodedFrame, PipelineState};
use crate::queue::{FrameQueue, PushError};
use crate::util::join_with_timeout;

/// Upper bound of one blocking read; the stop flag is checked in between
const READ_TIMEOUT: Duration = Duration::from_millis(100);

const JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Everything the capture thread owns while running
struct CaptureStage {
    source: Box<dyn AudioSource>,
    encoder: OpusEncoder,
    /// Sequence number of the next captured frame
    next_sequence: u32,
    /// Media timestamp of the next captured frame
    next_timestamp_us: u64,
    /// Wall-clock time of the first start
    epoch: Option<Instant>,
}

impl CaptureStage {
    fn new(source: Box<dyn AudioSource>, encoder: OpusEncoder) -> Self {
        Self {
            source,
            encoder,
            next_sequence: 0,
            next_timestamp_us: 0,
            epoch: None,
        }
    }

    /// Move the media clock past the time spent stopped
    ///
    /// Timestamps stay monotonic across restarts and track wall-clock time
    /// since the first start, rounded down to whole frames.
    fn resume(&mut self, frame_us: u64) {
        match self.epoch {
            None => self.epoch = Some(Instant::now()),
            Some(epoch) => {
                let elapsed = epoch.elapsed().as_micros() as u64;
                let aligned = elapsed / frame_us * frame_us;
                self.next_timestamp_us = self.next_timestamp_us.max(aligned);
                self.source.resume();
            }
        }
    }
}

#[derive(Default)]
struct Counters {
    frames_captured: AtomicU64,
    frames_encoded: AtomicU64,
    bytes_encoded: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Capture pipeline statistics
#[derive(Debug, Clone, Default)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub frames_encoded: u64,
    pub bytes_encoded: u64,
    pub frames_dropped: u64,
}

/// Source → Opus encoder on a dedicated capture thread
pub struct AudioCapturePipeline {
    quality: AudioQuality,
    /// Lifecycle position; `stage` is present only while `Prepared`
    state: PipelineState,
    /// Source and encoder while not running
    stage: Option<CaptureStage>,
    /// Source waiting for `prepare()`
    idle_source: Option<Box<dyn AudioSource>>,
    /// Encoded packets for the packetizer
    output: Arc<FrameQueue<EncodedFrame>>,
    pub(crate) events: Option<EventSender>,
    /// Cleared to stop the capture thread, or by the thread itself on failure
    running: Arc<AtomicBool>,
    /// Capture thread; joining it hands the stage back
    thread: Option<JoinHandle<CaptureStage>>,
    counters: Arc<Counters>,
}

impl AudioCapturePipeline {
    pub fn new(
        source: Box<dyn AudioSource>,
        quality: AudioQuality,
        output: Arc<FrameQueue<EncodedFrame>>,
    ) -> Self {
        Self {
            quality,
            state: PipelineState::Idle,
            stage: None,
            idle_source: Some(source),
            output,
            events: None,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Report asynchronous capture/encode failures on `events`
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn quality(&self) -> &AudioQuality {
        &self.quality
    }

    /// Whether the capture thread is alive
    ///
    /// Turns false on its own when the thread stopped after an error.
    pub fn is_running(&self) -> bool {
        self.state == PipelineState::Running && self.running.load(Ordering::SeqCst)
    }

    /// Open the source and create the encoder
    pub fn prepare(&mut self) -> Result<(), StreamError> {
        match self.state {
            PipelineState::Prepared => return Ok(()),
            PipelineState::Running => return Err(StreamError::AlreadyStarted),
            PipelineState::Released => return Err(StreamError::InvalidState("pipeline released")),
            PipelineState::Idle => {}
        }

        let mut source = self.idle_source.take().ok_or(AudioError::SourceUnavailable)?;
        let encoder = match OpusEncoder::new(&self.quality) {
            Ok(encoder) => encoder,
            Err(e) => {
                self.idle_source = Some(source);
                return Err(e.into());
            }
        };
        if let Err(e) = source.open(&self.quality) {
            self.idle_source = Some(source);
            return Err(e.into());
        }

        tracing::debug!(
            "Audio pipeline prepared: source {}, {} Hz, {} ms, {} ch",
            source.name(),
            self.quality.sample_rate().hz(),
            self.quality.frame_duration().as_millis_f32(),
            self.quality.channels()
        );

        self.stage = Some(CaptureStage::new(source, encoder));
        self.state = PipelineState::Prepared;
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), StreamError> {
        match self.state {
            PipelineState::Running => return Err(StreamError::AlreadyStarted),
            PipelineState::Prepared => {}
            _ => return Err(StreamError::NotPrepared),
        }
        let mut stage = self.stage.take().ok_or(StreamError::NotPrepared)?;
        stage.resume(frame_us(&self.quality));

        self.output.reopen();
        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let output = self.output.clone();
        let counters = self.counters.clone();
        let events = self.events.clone();
        let quality = self.quality;

        let spawned = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || capture_loop(stage, quality, running, output, counters, events));

        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                self.state = PipelineState::Running;
                tracing::info!("Audio capture pipeline started");
                Ok(())
            }
            Err(e) => {
                // The stage moved into the closure and is gone with it
                self.running.store(false, Ordering::SeqCst);
                self.state = PipelineState::Idle;
                Err(AudioError::StreamError(format!("failed to spawn capture thread: {}", e)).into())
            }
        }
    }

    /// Stop capturing; a no-op unless running
    pub fn stop(&mut self) {
        if self.state != PipelineState::Running {
            return;
        }
        self.running.store(false, Ordering::SeqCst);

        let stage = self
            .thread
            .take()
            .and_then(|handle| join_with_timeout(handle, JOIN_TIMEOUT));
        match stage {
            Some(stage) => {
                self.stage = Some(stage);
                self.state = PipelineState::Prepared;
            }
            None => {
                tracing::warn!("Audio capture thread lost, pipeline must be recreated");
                self.state = PipelineState::Idle;
            }
        }
        tracing::info!("Audio capture pipeline stopped");
    }

    /// Close the source and drop the encoder; safe in any state
    pub fn release(&mut self) {
        if self.state == PipelineState::Released {
            return;
        }
        self.stop();
        if let Some(mut stage) = self.stage.take() {
            stage.source.close();
        }
        self.idle_source = None;
        self.state = PipelineState::Released;
        tracing::debug!("Audio capture pipeline released");
    }

    /// Change the quality of a pipeline that is not running
    ///
    /// A prepared pipeline is re-prepared with the new quality.
    pub fn set_quality(&mut self, quality: AudioQuality) -> Result<(), StreamError> {
        match self.state {
            PipelineState::Running => Err(StreamError::InvalidState("cannot change quality while running")),
            PipelineState::Released => Err(StreamError::InvalidState("pipeline released")),
            PipelineState::Idle => {
                self.quality = quality;
                Ok(())
            }
            PipelineState::Prepared => {
                let mut clock = None;
                if let Some(mut stage) = self.stage.take() {
                    stage.source.close();
                    clock = Some((stage.next_sequence, stage.next_timestamp_us, stage.epoch));
                    self.idle_source = Some(stage.source);
                }
                self.state = PipelineState::Idle;
                self.quality = quality;
                self.prepare()?;
                // Timestamps keep running across the re-prepare
                if let (Some(stage), Some((sequence, timestamp_us, epoch))) = (self.stage.as_mut(), clock) {
                    stage.next_sequence = sequence;
                    stage.next_timestamp_us = timestamp_us;
                    stage.epoch = epoch;
                }
                Ok(())
            }
        }
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.counters.frames_captured.load(Ordering::Relaxed),
            frames_encoded: self.counters.frames_encoded.load(Ordering::Relaxed),
            bytes_encoded: self.counters.bytes_encoded.load(Ordering::Relaxed),
            frames_dropped: self.counters.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Drop for AudioCapturePipeline {
    fn drop(&mut self) {
        self.release();
    }
}

fn capture_loop(
    mut stage: CaptureStage,
    quality: AudioQuality,
    running: Arc<AtomicBool>,
    output: Arc<FrameQueue<EncodedFrame>>,
    counters: Arc<Counters>,
    events: Option<EventSender>,
) -> CaptureStage {
    let frame_us = frame_us(&quality);
    let mut buffer = vec![0.0f32; quality.samples_per_frame()];

    while running.load(Ordering::Relaxed) {
        match stage.source.read_frame(&mut buffer, READ_TIMEOUT) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                report_failure(&running, events.as_ref(), format!("capture failed: {}", e));
                break;
            }
        }
        counters.frames_captured.fetch_add(1, Ordering::Relaxed);

        let frame = AudioFrame::new(
            buffer.clone(),
            quality.channels(),
            stage.next_timestamp_us,
            stage.next_sequence,
        );
        stage.next_sequence = stage.next_sequence.wrapping_add(1);
        stage.next_timestamp_us += frame_us;

        let packet = match stage.encoder.encode(&frame.samples) {
            Ok(packet) => packet,
            Err(e) => {
                report_failure(&running, events.as_ref(), format!("encoding failed: {}", e));
                break;
            }
        };
        counters.frames_encoded.fetch_add(1, Ordering::Relaxed);
        counters.bytes_encoded.fetch_add(packet.len() as u64, Ordering::Relaxed);

        match output.push(EncodedFrame::new(packet, frame.timestamp, frame.sequence)) {
            Ok(()) => {}
            Err(PushError::Full(_)) => {
                counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Output queue full, dropped audio frame {}", frame.sequence);
            }
            Err(PushError::Closed(_)) => break,
        }
    }

    stage
}

fn frame_us(quality: &AudioQuality) -> u64 {
    quality.frame_duration().tenths_ms() as u64 * 100
}

fn report_failure(running: &AtomicBool, events: Option<&EventSender>, message: String) {
    tracing::error!("Audio pipeline: {}", message);
    running.store(false, Ordering::SeqCst);
    events::emit(
        events,
        StreamEvent::EncoderError {
            source: "audio",
            message,
        },
    );
}
