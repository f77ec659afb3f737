//! Audio sources feeding the capture pipeline

use std::f32::consts::TAU;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::AudioQuality;
use crate::error::AudioError;

/// A producer of interleaved PCM frames
///
/// `read_frame` blocks for at most `timeout`; the capture thread relies on
/// that bound to notice a stop request.
pub trait AudioSource: Send {
    /// Prepare to deliver frames of `quality.samples_per_frame()` samples
    fn open(&mut self, quality: &AudioQuality) -> Result<(), AudioError>;

    /// Fill `frame` with the next frame. Returns `Ok(false)` on timeout.
    fn read_frame(&mut self, frame: &mut [f32], timeout: Duration) -> Result<bool, AudioError>;

    /// Called before capture resumes after a stop
    ///
    /// Sources drop whatever accumulated while nobody was reading, so the
    /// first frames after a restart are current rather than a backlog.
    fn resume(&mut self) {}

    /// Release the underlying capture resources
    fn close(&mut self);

    fn name(&self) -> &str;
}

/// Real-time paced sine generator
///
/// Produces the first frame immediately after `open` and then one frame per
/// frame duration, like a capture device would.
pub struct ToneSource {
    frequency: f32,
    amplitude: f32,
    phase: f32,
    sample_rate: u32,
    channels: usize,
    frame_interval: Duration,
    next_deadline: Option<Instant>,
}

impl ToneSource {
    pub fn new(frequency: f32) -> Self {
        Self {
            frequency,
            amplitude: 0.25,
            phase: 0.0,
            sample_rate: 0,
            channels: 1,
            frame_interval: Duration::ZERO,
            next_deadline: None,
        }
    }

    pub fn with_amplitude(mut self, amplitude: f32) -> Self {
        self.amplitude = amplitude.clamp(0.0, 1.0);
        self
    }

    fn fill(&mut self, frame: &mut [f32]) {
        let step = TAU * self.frequency / self.sample_rate as f32;
        for chunk in frame.chunks_mut(self.channels) {
            let value = self.phase.sin() * self.amplitude;
            chunk.fill(value);
            self.phase = (self.phase + step) % TAU;
        }
    }
}

impl AudioSource for ToneSource {
    fn open(&mut self, quality: &AudioQuality) -> Result<(), AudioError> {
        self.sample_rate = quality.sample_rate().hz();
        self.channels = quality.channels() as usize;
        self.frame_interval = quality.frame_duration().as_duration();
        self.phase = 0.0;
        self.next_deadline = Some(Instant::now());
        Ok(())
    }

    fn read_frame(&mut self, frame: &mut [f32], timeout: Duration) -> Result<bool, AudioError> {
        let deadline = self.next_deadline.ok_or(AudioError::NotOpen)?;

        let now = Instant::now();
        if deadline > now {
            let wait = deadline - now;
            if wait > timeout {
                thread::sleep(timeout);
                return Ok(false);
            }
            thread::sleep(wait);
        }

        self.fill(frame);
        self.next_deadline = Some(deadline + self.frame_interval);
        Ok(true)
    }

    fn resume(&mut self) {
        if self.next_deadline.is_some() {
            self.next_deadline = Some(Instant::now());
        }
    }

    fn close(&mut self) {
        self.next_deadline = None;
    }

    fn name(&self) -> &str {
        "tone"
    }
}
