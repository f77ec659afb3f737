//! Microphone capture through cpal
//!
//! The cpal stream lives on its own thread (streams are not `Send` on every
//! host); its callback feeds a shared [`SampleAccumulator`] from which the
//! capture pipeline reads exact frames.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Receiver};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::buffer::SampleAccumulator;
use crate::audio::device::get_input_device;
use crate::audio::source::AudioSource;
use crate::config::AudioQuality;
use crate::error::AudioError;
use crate::util::join_with_timeout;

/// Buffered audio kept while the encoder lags behind
const MAX_BUFFERED: Duration = Duration::from_millis(500);

struct Shared {
    samples: Mutex<SampleAccumulator>,
    available: Condvar,
}

/// Input device source
pub struct DeviceSource {
    /// Device identifier, default input when `None`
    device_id: Option<String>,

    /// Whether the stream thread should keep running
    running: Arc<AtomicBool>,

    shared: Arc<Shared>,

    /// Stream thread handle
    thread_handle: Option<JoinHandle<()>>,

    /// Channel for stream errors
    error_rx: Option<Receiver<AudioError>>,

    /// Total samples captured
    samples_captured: Arc<AtomicU64>,
}

impl DeviceSource {
    pub fn new(device_id: Option<String>) -> Self {
        Self {
            device_id,
            running: Arc::new(AtomicBool::new(false)),
            shared: Arc::new(Shared {
                samples: Mutex::new(SampleAccumulator::new(0)),
                available: Condvar::new(),
            }),
            thread_handle: None,
            error_rx: None,
            samples_captured: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Get total samples captured
    pub fn samples_captured(&self) -> u64 {
        self.samples_captured.load(Ordering::Relaxed)
    }

    /// Check for errors
    fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl AudioSource for DeviceSource {
    fn open(&mut self, quality: &AudioQuality) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let device = get_input_device(self.device_id.as_deref())?;
        let config = StreamConfig {
            channels: quality.channels(),
            sample_rate: cpal::SampleRate(quality.sample_rate().hz()),
            buffer_size: cpal::BufferSize::Default,
        };

        let limit = (quality.sample_rate().hz() as u128 * MAX_BUFFERED.as_millis() / 1000) as usize
            * quality.channels() as usize;
        *self.shared.samples.lock() = SampleAccumulator::new(limit);

        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        self.error_rx = Some(error_rx);

        let running = self.running.clone();
        let shared = self.shared.clone();
        let samples_captured = self.samples_captured.clone();
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("audio-device".to_string())
            .spawn(move || {
                let callback_shared = shared.clone();
                let stream = device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        samples_captured.fetch_add(data.len() as u64, Ordering::Relaxed);
                        callback_shared.samples.lock().extend(data);
                        callback_shared.available.notify_one();
                    },
                    move |err| {
                        let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                    },
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Keep thread alive while running; dropping the stream stops capture
                while running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.thread_handle = Some(handle);

        match ready_rx.recv_timeout(Duration::from_secs(2)) {
            Ok(Ok(())) => {
                tracing::info!("Audio capture started ({} Hz, {} ch)", config.sample_rate.0, config.channels);
                Ok(())
            }
            Ok(Err(e)) => {
                self.close();
                Err(e)
            }
            Err(_) => {
                self.close();
                Err(AudioError::StreamError("capture stream did not start".to_string()))
            }
        }
    }

    fn read_frame(&mut self, frame: &mut [f32], timeout: Duration) -> Result<bool, AudioError> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(AudioError::NotOpen);
        }
        if let Some(err) = self.check_errors() {
            return Err(err);
        }

        let deadline = Instant::now() + timeout;
        let mut samples = self.shared.samples.lock();
        loop {
            if samples.take_frame(frame) {
                return Ok(true);
            }
            if self.shared.available.wait_until(&mut samples, deadline).timed_out() {
                return Ok(samples.take_frame(frame));
            }
        }
    }

    fn resume(&mut self) {
        self.shared.samples.lock().clear();
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            join_with_timeout(handle, Duration::from_millis(500));
        }
        self.shared.samples.lock().clear();
    }

    fn name(&self) -> &str {
        self.device_id.as_deref().unwrap_or("default-input")
    }
}

impl Drop for DeviceSource {
    fn drop(&mut self) {
        self.close();
    }
}
