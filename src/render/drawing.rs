//! Draw thread owning one graphics context
//!
//! Lifecycle as seen by subscribers:
//!
//! ```text
//! start() ─► context created ─► Started ─► draw loop ─┬─► targets released
//!                  │                                  │   context released
//!                  └── failure ─► Error ──────────────┴─► Stopped
//! ```

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::RenderError;
use crate::events::DrawingEvent;
use crate::render::{GraphicsBackend, RenderTarget, SurfaceId};
use crate::util::join_with_timeout;

const JOIN_TIMEOUT: Duration = Duration::from_millis(500);
/// Longest single wait for an image, so stop requests are noticed
const IMAGE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrawState {
    Idle,
    Starting,
    Running,
    Stopping,
}

struct Observers {
    state: DrawState,
    subscribers: Vec<Sender<DrawingEvent>>,
}

impl Observers {
    fn notify(&mut self, event: DrawingEvent) {
        self.subscribers.retain(|s| s.send(event.clone()).is_ok());
    }

    fn notify_started(&mut self) {
        self.state = DrawState::Running;
        self.notify(DrawingEvent::Started);
    }
}

struct Shared {
    observers: Mutex<Observers>,
    targets: Mutex<Vec<Box<dyn RenderTarget>>>,
    stop: AtomicBool,
    frames_drawn: AtomicU64,
}

pub struct SurfaceDrawingPipeline {
    backend: Arc<dyn GraphicsBackend>,
    width: u32,
    height: u32,
    render_timeout: Duration,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SurfaceDrawingPipeline {
    pub fn new(backend: Arc<dyn GraphicsBackend>, width: u32, height: u32) -> Self {
        Self {
            backend,
            width,
            height,
            render_timeout: Duration::from_millis(crate::constants::DEFAULT_RENDER_TIMEOUT_MS),
            shared: Arc::new(Shared {
                observers: Mutex::new(Observers {
                    state: DrawState::Idle,
                    subscribers: Vec::new(),
                }),
                targets: Mutex::new(Vec::new()),
                stop: AtomicBool::new(false),
                frames_drawn: AtomicU64::new(0),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Fail when no image arrives for `timeout`; zero disables the check
    pub fn with_render_timeout(mut self, timeout: Duration) -> Self {
        self.render_timeout = timeout;
        self
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Receive lifecycle events
    ///
    /// Subscribing to a pipeline that is already drawing delivers `Started`
    /// right away. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> Receiver<DrawingEvent> {
        let (tx, rx) = unbounded();
        let mut observers = self.shared.observers.lock();
        if observers.state == DrawState::Running {
            let _ = tx.send(DrawingEvent::Started);
        }
        observers.subscribers.push(tx);
        rx
    }

    /// Attach a target; it is drawn from the next image on
    pub fn add_surface(&self, target: Box<dyn RenderTarget>) -> SurfaceId {
        let id = target.id();
        self.shared.targets.lock().push(target);
        tracing::debug!("Surface {:?} added", id);
        id
    }

    /// Detach and release a target
    pub fn remove_surface(&self, id: SurfaceId) -> bool {
        let removed = {
            let mut targets = self.shared.targets.lock();
            targets
                .iter()
                .position(|t| t.id() == id)
                .map(|index| targets.remove(index))
        };
        match removed {
            Some(target) => {
                drop(target);
                tracing::debug!("Surface {:?} removed", id);
                true
            }
            None => false,
        }
    }

    pub fn surface_count(&self) -> usize {
        self.shared.targets.lock().len()
    }

    /// Whether the draw thread exists and has not been asked to stop
    pub fn is_running(&self) -> bool {
        matches!(
            self.shared.observers.lock().state,
            DrawState::Starting | DrawState::Running
        )
    }

    /// Whether the context is up and images are being drawn
    pub fn is_drawing(&self) -> bool {
        self.shared.observers.lock().state == DrawState::Running
    }

    pub fn frames_drawn(&self) -> u64 {
        self.shared.frames_drawn.load(Ordering::Relaxed)
    }

    /// Spawn the draw thread; a no-op while it is running
    pub fn start(&self) -> Result<(), RenderError> {
        let mut thread_slot = self.thread.lock();
        {
            let mut observers = self.shared.observers.lock();
            if matches!(observers.state, DrawState::Starting | DrawState::Running) {
                return Ok(());
            }
            observers.state = DrawState::Starting;
        }

        // A previous thread that already reported Stopped
        if let Some(previous) = thread_slot.take() {
            join_with_timeout(previous, JOIN_TIMEOUT);
        }

        self.shared.stop.store(false, Ordering::SeqCst);
        let shared = self.shared.clone();
        let backend = self.backend.clone();
        let (width, height, render_timeout) = (self.width, self.height, self.render_timeout);

        let spawned = thread::Builder::new()
            .name("surface-drawing".to_string())
            .spawn(move || draw_loop(shared, backend, width, height, render_timeout));
        match spawned {
            Ok(handle) => {
                *thread_slot = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.observers.lock().state = DrawState::Idle;
                Err(RenderError::ContextCreation(format!("failed to spawn draw thread: {}", e)))
            }
        }
    }

    /// Stop the draw thread
    ///
    /// Without `force` the thread keeps running while targets are attached.
    /// Returns whether a stop was performed.
    pub fn stop(&self, force: bool) -> bool {
        let mut thread_slot = self.thread.lock();
        if thread_slot.is_none() {
            return false;
        }
        if !force && self.surface_count() > 0 {
            tracing::debug!("Drawing pipeline still has surfaces, not stopping");
            return false;
        }

        {
            let mut observers = self.shared.observers.lock();
            if observers.state != DrawState::Idle {
                observers.state = DrawState::Stopping;
            }
        }
        self.shared.stop.store(true, Ordering::SeqCst);

        if let Some(handle) = thread_slot.take() {
            join_with_timeout(handle, JOIN_TIMEOUT);
        }
        true
    }
}

impl Drop for SurfaceDrawingPipeline {
    fn drop(&mut self) {
        self.stop(true);
    }
}

fn draw_loop(
    shared: Arc<Shared>,
    backend: Arc<dyn GraphicsBackend>,
    width: u32,
    height: u32,
    render_timeout: Duration,
) {
    let failure = match backend.create_context(width, height) {
        Ok(mut context) => {
            shared.observers.lock().notify_started();
            tracing::info!("Drawing pipeline started ({}x{})", width, height);

            let mut last_image = Instant::now();
            let failure = loop {
                if shared.stop.load(Ordering::SeqCst) {
                    break None;
                }
                match context.next_image(IMAGE_POLL) {
                    Ok(Some(image)) => {
                        last_image = Instant::now();
                        let mut targets = shared.targets.lock();
                        let result = targets.iter_mut().try_for_each(|t| t.render(&image));
                        if let Err(e) = result {
                            break Some(e);
                        }
                        if !targets.is_empty() {
                            shared.frames_drawn.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Ok(None) => {
                        if !render_timeout.is_zero() && last_image.elapsed() >= render_timeout {
                            break Some(RenderError::Timeout(render_timeout));
                        }
                    }
                    Err(e) => break Some(e),
                }
            };

            // Targets first, then the context
            shared.targets.lock().clear();
            drop(context);
            failure
        }
        Err(e) => {
            shared.targets.lock().clear();
            Some(e)
        }
    };

    let mut observers = shared.observers.lock();
    if let Some(e) = failure {
        if shared.stop.load(Ordering::SeqCst) {
            tracing::debug!("Ignoring drawing error during stop: {}", e);
        } else {
            tracing::error!("Drawing pipeline failed: {}", e);
            observers.notify(DrawingEvent::Error(e.to_string()));
        }
    }
    observers.state = DrawState::Idle;
    observers.notify(DrawingEvent::Stopped);
    tracing::info!("Drawing pipeline stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{FrameQueue, OverflowPolicy};
    use crate::render::software::{ImageFeed, ResourceCounter, ResourceGuard, SoftwareGraphics};
    use crate::render::{GraphicsContext, VideoImage};

    /// Target that counts renders and holds a resource guard
    struct CountingTarget {
        id: SurfaceId,
        rendered: Arc<AtomicU64>,
        fail: bool,
        _guard: ResourceGuard,
    }

    impl CountingTarget {
        fn boxed(counter: &ResourceCounter, rendered: Arc<AtomicU64>) -> Box<dyn RenderTarget> {
            Box::new(CountingTarget {
                id: SurfaceId::next(),
                rendered,
                fail: false,
                _guard: counter.acquire(),
            })
        }
    }

    impl RenderTarget for CountingTarget {
        fn id(&self) -> SurfaceId {
            self.id
        }

        fn size(&self) -> (u32, u32) {
            (16, 16)
        }

        fn render(&mut self, _image: &VideoImage) -> Result<(), RenderError> {
            if self.fail {
                return Err(RenderError::SurfaceLost("gone".to_string()));
            }
            self.rendered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct BrokenBackend;

    impl GraphicsBackend for BrokenBackend {
        fn create_context(&self, _: u32, _: u32) -> Result<Box<dyn GraphicsContext>, RenderError> {
            Err(RenderError::ContextCreation("no display".to_string()))
        }
    }

    fn expect(rx: &Receiver<DrawingEvent>) -> DrawingEvent {
        rx.recv_timeout(Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_start_renders_to_targets() {
        let graphics = Arc::new(SoftwareGraphics::test_pattern(100));
        let contexts = graphics.contexts();
        let pipeline = SurfaceDrawingPipeline::new(graphics, 16, 16);
        let surfaces = ResourceCounter::new();
        let rendered = Arc::new(AtomicU64::new(0));

        let events = pipeline.subscribe();
        pipeline.add_surface(CountingTarget::boxed(&surfaces, rendered.clone()));
        pipeline.start().unwrap();
        assert_eq!(expect(&events), DrawingEvent::Started);

        thread::sleep(Duration::from_millis(60));
        assert!(rendered.load(Ordering::SeqCst) > 0);
        assert_eq!(contexts.live(), 1);

        assert!(pipeline.stop(true));
        assert_eq!(expect(&events), DrawingEvent::Stopped);
        assert_eq!(contexts.live(), 0);
        assert_eq!(surfaces.live(), 0);
        assert!(!pipeline.is_running());
    }

    #[test]
    fn test_late_subscriber_gets_started() {
        let pipeline = SurfaceDrawingPipeline::new(Arc::new(SoftwareGraphics::test_pattern(30)), 16, 16);
        let early = pipeline.subscribe();
        pipeline.start().unwrap();
        assert_eq!(expect(&early), DrawingEvent::Started);

        let late = pipeline.subscribe();
        assert_eq!(late.try_recv().unwrap(), DrawingEvent::Started);
        pipeline.stop(true);
    }

    #[test]
    fn test_soft_stop_waits_for_surfaces() {
        let pipeline = SurfaceDrawingPipeline::new(Arc::new(SoftwareGraphics::test_pattern(30)), 16, 16);
        let surfaces = ResourceCounter::new();
        let events = pipeline.subscribe();
        pipeline.start().unwrap();
        assert_eq!(expect(&events), DrawingEvent::Started);

        let id = pipeline.add_surface(CountingTarget::boxed(&surfaces, Arc::new(AtomicU64::new(0))));
        assert!(!pipeline.stop(false));
        assert!(pipeline.is_running());

        assert!(pipeline.remove_surface(id));
        assert_eq!(surfaces.live(), 0);
        assert!(pipeline.stop(false));
        assert_eq!(expect(&events), DrawingEvent::Stopped);
    }

    #[test]
    fn test_context_failure_reports_error_then_stopped() {
        let pipeline = SurfaceDrawingPipeline::new(Arc::new(BrokenBackend), 16, 16);
        let events = pipeline.subscribe();
        pipeline.start().unwrap();

        assert!(matches!(expect(&events), DrawingEvent::Error(_)));
        assert_eq!(expect(&events), DrawingEvent::Stopped);
        assert!(!pipeline.is_running());
    }

    #[test]
    fn test_render_timeout() {
        let feed = Arc::new(FrameQueue::new(2, OverflowPolicy::DropOldest));
        let graphics = Arc::new(SoftwareGraphics::new(ImageFeed::Queue(feed)));
        let pipeline =
            SurfaceDrawingPipeline::new(graphics, 16, 16).with_render_timeout(Duration::from_millis(150));
        let events = pipeline.subscribe();
        pipeline.start().unwrap();

        assert_eq!(expect(&events), DrawingEvent::Started);
        match expect(&events) {
            DrawingEvent::Error(message) => assert!(message.contains("No image")),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(expect(&events), DrawingEvent::Stopped);
    }

    #[test]
    fn test_target_failure_releases_everything() {
        let graphics = Arc::new(SoftwareGraphics::test_pattern(100));
        let contexts = graphics.contexts();
        let pipeline = SurfaceDrawingPipeline::new(graphics, 16, 16);
        let surfaces = ResourceCounter::new();
        let events = pipeline.subscribe();

        pipeline.add_surface(Box::new(CountingTarget {
            id: SurfaceId::next(),
            rendered: Arc::new(AtomicU64::new(0)),
            fail: true,
            _guard: surfaces.acquire(),
        }));
        pipeline.start().unwrap();

        assert_eq!(expect(&events), DrawingEvent::Started);
        assert!(matches!(expect(&events), DrawingEvent::Error(_)));
        assert_eq!(expect(&events), DrawingEvent::Stopped);
        assert_eq!(surfaces.live(), 0);
        assert_eq!(contexts.live(), 0);
        assert_eq!(pipeline.surface_count(), 0);
    }

    #[test]
    fn test_restart() {
        let pipeline = SurfaceDrawingPipeline::new(Arc::new(SoftwareGraphics::test_pattern(30)), 16, 16);
        let events = pipeline.subscribe();
        for _ in 0..2 {
            pipeline.start().unwrap();
            assert_eq!(expect(&events), DrawingEvent::Started);
            pipeline.stop(true);
            assert_eq!(expect(&events), DrawingEvent::Stopped);
        }
    }
}
