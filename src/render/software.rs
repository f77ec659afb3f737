//! CPU implementation of the graphics seam
//!
//! Images either come from a [`FrameQueue`] fed by the application or are
//! generated as a moving colour-bar test pattern.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::RenderError;
use crate::queue::{FrameQueue, PopError};
use crate::render::{GraphicsBackend, GraphicsContext, VideoImage};

/// Live/total counter for native-like resources
#[derive(Debug, Clone, Default)]
pub struct ResourceCounter {
    live: Arc<AtomicUsize>,
    total: Arc<AtomicUsize>,
}

impl ResourceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one allocation until the guard is dropped
    pub fn acquire(&self) -> ResourceGuard {
        self.live.fetch_add(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        ResourceGuard {
            live: self.live.clone(),
        }
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct ResourceGuard {
    live: Arc<AtomicUsize>,
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Where a software context gets its pictures
#[derive(Clone)]
pub enum ImageFeed {
    /// Generated colour bars at the given rate
    Pattern { frame_rate: u32 },
    /// Images pushed by the application
    Queue(Arc<FrameQueue<VideoImage>>),
}

pub struct SoftwareGraphics {
    feed: ImageFeed,
    contexts: ResourceCounter,
}

impl SoftwareGraphics {
    pub fn new(feed: ImageFeed) -> Self {
        Self {
            feed,
            contexts: ResourceCounter::new(),
        }
    }

    pub fn test_pattern(frame_rate: u32) -> Self {
        Self::new(ImageFeed::Pattern {
            frame_rate: frame_rate.max(1),
        })
    }

    /// Counter of contexts created by this backend
    pub fn contexts(&self) -> ResourceCounter {
        self.contexts.clone()
    }
}

impl GraphicsBackend for SoftwareGraphics {
    fn create_context(&self, width: u32, height: u32) -> Result<Box<dyn GraphicsContext>, RenderError> {
        if width == 0 || height == 0 {
            return Err(RenderError::ContextCreation(format!("invalid size {}x{}", width, height)));
        }
        let guard = self.contexts.acquire();

        let context: Box<dyn GraphicsContext> = match &self.feed {
            ImageFeed::Pattern { frame_rate } => Box::new(PatternContext {
                width,
                height,
                interval: Duration::from_secs(1) / *frame_rate,
                started: Instant::now(),
                frame: 0,
                _guard: guard,
            }),
            ImageFeed::Queue(queue) => Box::new(QueueContext {
                queue: queue.clone(),
                _guard: guard,
            }),
        };
        Ok(context)
    }
}

struct PatternContext {
    width: u32,
    height: u32,
    interval: Duration,
    started: Instant,
    frame: u64,
    _guard: ResourceGuard,
}

impl PatternContext {
    fn draw(&self) -> VideoImage {
        const BARS: [[u8; 3]; 8] = [
            [235, 235, 235],
            [235, 235, 16],
            [16, 235, 235],
            [16, 235, 16],
            [235, 16, 235],
            [235, 16, 16],
            [16, 16, 235],
            [16, 16, 16],
        ];
        let width = self.width as usize;
        let shift = (self.frame as usize * 4) % width;
        let mut data = Vec::with_capacity(width * self.height as usize * 3);
        for _ in 0..self.height {
            for x in 0..width {
                let bar = ((x + shift) % width) * BARS.len() / width;
                data.extend_from_slice(&BARS[bar]);
            }
        }
        let timestamp_us = self.frame * self.interval.as_micros() as u64;
        VideoImage::new(self.width, self.height, data, timestamp_us)
    }
}

impl GraphicsContext for PatternContext {
    fn next_image(&mut self, timeout: Duration) -> Result<Option<VideoImage>, RenderError> {
        let due = self.started + self.interval * self.frame as u32;
        let now = Instant::now();
        if due > now {
            let wait = due - now;
            if wait > timeout {
                thread::sleep(timeout);
                return Ok(None);
            }
            thread::sleep(wait);
        }
        let image = self.draw();
        self.frame += 1;
        Ok(Some(image))
    }
}

struct QueueContext {
    queue: Arc<FrameQueue<VideoImage>>,
    _guard: ResourceGuard,
}

impl GraphicsContext for QueueContext {
    fn next_image(&mut self, timeout: Duration) -> Result<Option<VideoImage>, RenderError> {
        match self.queue.pop_timeout(timeout) {
            Ok(image) => Ok(Some(image)),
            Err(PopError::Timeout) => Ok(None),
            Err(PopError::Closed) => Err(RenderError::FeedClosed),
        }
    }
}
