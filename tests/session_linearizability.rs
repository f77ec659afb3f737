//! Concurrent attach/detach churn: one session per 0→1…1→0 cycle

use std::net::{IpAddr, Ipv4Addr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lan_media_streamer::config::ServerConfig;
use lan_media_streamer::error::StreamError;
use lan_media_streamer::events::StreamEvent;
use lan_media_streamer::network::Destination;
use lan_media_streamer::server::{SessionHandler, StreamingServer};
use lan_media_streamer::session::StreamSession;
use lan_media_streamer::stream::{MediaKind, MediaStream};

/// Stream with no media behind it
struct SilentStream {
    streaming: AtomicBool,
}

impl MediaStream for SilentStream {
    fn kind(&self) -> MediaKind {
        MediaKind::Audio
    }
    fn configure(&mut self) -> Result<(), StreamError> {
        Ok(())
    }
    fn start(&mut self) -> Result<(), StreamError> {
        self.streaming.store(true, Ordering::SeqCst);
        Ok(())
    }
    fn stop(&mut self) {
        self.streaming.store(false, Ordering::SeqCst);
    }
    fn release(&mut self) {}
    fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }
    fn session_description(&self) -> Result<String, StreamError> {
        Ok(String::new())
    }
    fn rtp_port(&self) -> u16 {
        9
    }
    fn rtcp_port(&self) -> u16 {
        10
    }
    fn set_destination(&self, _: IpAddr, _: u16, _: u16) {}
    fn add_destination(&self, _: Destination) {}
    fn remove_destination(&self, _: &Destination) -> bool {
        true
    }
    fn mute(&self) {}
    fn unmute(&self) {}
    fn is_muted(&self) -> bool {
        false
    }
}

#[derive(Default)]
struct CountingHandler {
    live: AtomicUsize,
    created: AtomicUsize,
    released: AtomicUsize,
    overlaps: AtomicUsize,
}

impl SessionHandler for CountingHandler {
    fn on_session_created(&self, session: &mut StreamSession) -> Result<(), StreamError> {
        if self.live.fetch_add(1, Ordering::SeqCst) != 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        session.bind(Box::new(SilentStream {
            streaming: AtomicBool::new(false),
        }))
    }

    fn on_session_released(&self, _session: &StreamSession) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

fn config(max_clients: usize) -> ServerConfig {
    ServerConfig {
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        max_clients,
        poll_interval_ms: 2,
        accept_poll_interval_ms: 1,
        join_timeout_ms: 200,
    }
}

#[test]
fn create_and_release_fire_once_per_cycle() {
    let handler = Arc::new(CountingHandler::default());
    let mut server = StreamingServer::new(config(10), handler.clone());
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let workers: Vec<_> = (0..6)
        .map(|worker| {
            thread::spawn(move || {
                for round in 0..15 {
                    let client = TcpStream::connect(addr).unwrap();
                    thread::sleep(Duration::from_millis(((worker * 7 + round * 3) % 11) as u64));
                    drop(client);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while (server.client_count() > 0 || server.session_id().is_some()) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(server.client_count(), 0);
    assert!(server.session_id().is_none());

    let created = handler.created.load(Ordering::SeqCst);
    assert!(created >= 1);
    assert_eq!(created, handler.released.load(Ordering::SeqCst));
    assert_eq!(handler.overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(handler.live.load(Ordering::SeqCst), 0);

    server.stop();
}

#[test]
fn churn_at_the_limit_never_over_admits() {
    const LIMIT: usize = 3;

    let handler = Arc::new(CountingHandler::default());
    let mut server = StreamingServer::new(config(LIMIT), handler.clone());
    let events = server.events();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();
    let registry = server.registry().clone();

    let done = Arc::new(AtomicBool::new(false));
    let sampler = {
        let done = done.clone();
        thread::spawn(move || {
            let (mut peak, mut attached, mut rejected) = (0, 0, 0);
            while !done.load(Ordering::SeqCst) {
                peak = peak.max(registry.client_count());
                while let Ok(event) = events.try_recv() {
                    match event {
                        StreamEvent::ClientAttached { clients, .. } => {
                            assert!(clients <= LIMIT, "{} clients attached", clients);
                            attached += 1;
                        }
                        StreamEvent::ClientRejected { .. } => rejected += 1,
                        _ => {}
                    }
                }
                thread::sleep(Duration::from_micros(200));
            }
            (peak, attached, rejected)
        })
    };

    let workers: Vec<_> = (0..10)
        .map(|worker| {
            thread::spawn(move || {
                for round in 0..20 {
                    let client = TcpStream::connect(addr).unwrap();
                    thread::sleep(Duration::from_millis(3 + ((worker * 5 + round * 7) % 6) as u64));
                    drop(client);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while server.client_count() > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    done.store(true, Ordering::SeqCst);
    let (peak, attached, rejected) = sampler.join().unwrap();

    assert!(peak <= LIMIT, "peak of {} clients", peak);
    assert!(attached > 0);
    assert!(rejected > 0);
    assert_eq!(server.client_count(), 0);
    assert_eq!(handler.overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(
        handler.created.load(Ordering::SeqCst),
        handler.released.load(Ordering::SeqCst)
    );

    server.stop();
}
