//! Admission limit and lazy session lifecycle over real loopback sockets

use std::io::Read;
use std::net::{IpAddr, Ipv4Addr, TcpStream, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lan_media_streamer::audio::ToneSource;
use lan_media_streamer::config::{AudioQuality, ServerConfig};
use lan_media_streamer::constants::EVENT_QUEUE_CAPACITY;
use lan_media_streamer::error::StreamError;
use lan_media_streamer::events::{EventReceiver, StreamEvent};
use lan_media_streamer::server::{SessionHandler, StreamingServer};
use lan_media_streamer::session::StreamSession;
use lan_media_streamer::stream::AudioStream;

struct ToneHandler {
    rtp_port: u16,
}

impl SessionHandler for ToneHandler {
    fn on_session_created(&self, session: &mut StreamSession) -> Result<(), StreamError> {
        let stream = AudioStream::new(
            Box::new(ToneSource::new(440.0)),
            AudioQuality::voice(),
            self.rtp_port,
            self.rtp_port + 1,
        )
        .with_bind_address("127.0.0.1:0".parse().unwrap());
        session.bind(Box::new(stream))
    }
}

fn config(max_clients: usize) -> ServerConfig {
    ServerConfig {
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        max_clients,
        poll_interval_ms: 10,
        accept_poll_interval_ms: 5,
        join_timeout_ms: 200,
    }
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn next_event(events: &EventReceiver, mut matches: impl FnMut(&StreamEvent) -> bool) -> StreamEvent {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = events.recv_timeout(remaining).expect("event not received in time");
        if matches(&event) {
            return event;
        }
    }
}

#[test]
fn admits_up_to_limit_and_rejects_the_next() {
    let media = UdpSocket::bind("127.0.0.1:0").unwrap();
    let rtp_port = media.local_addr().unwrap().port();

    let mut server = StreamingServer::new(config(3), Arc::new(ToneHandler { rtp_port }));
    let events = server.events();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let clients: Vec<TcpStream> = (0..3).map(|_| TcpStream::connect(addr).unwrap()).collect();
    assert!(wait_for(|| server.client_count() == 3));
    let session = server.session_id().expect("session created on first attach");

    let mut rejected = TcpStream::connect(addr).unwrap();
    next_event(&events, |e| matches!(e, StreamEvent::ClientRejected { .. }));
    rejected.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = [0u8; 8];
    assert!(matches!(rejected.read(&mut buf), Ok(0) | Err(_)));

    // No side effects on the session
    assert_eq!(server.client_count(), 3);
    assert_eq!(server.session_id(), Some(session));

    media.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut packet = [0u8; 1500];
    assert!(media.recv(&mut packet).unwrap() > 12);

    drop(clients);
    next_event(&events, |e| *e == StreamEvent::SessionReleased(session));
    assert_eq!(server.client_count(), 0);
    assert!(server.session_id().is_none());

    server.stop();
}

#[test]
fn session_is_recreated_after_teardown() {
    let mut server = StreamingServer::new(config(2), Arc::new(ToneHandler { rtp_port: 45_004 }));
    let events = server.events();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let first = TcpStream::connect(addr).unwrap();
    let StreamEvent::SessionCreated(first_id) = next_event(&events, |e| matches!(e, StreamEvent::SessionCreated(_)))
    else {
        unreachable!()
    };
    assert!(server.session_description().unwrap().contains("m=audio 45004 RTP/AVP 111"));

    drop(first);
    next_event(&events, |e| *e == StreamEvent::SessionReleased(first_id));
    assert!(matches!(server.session_description(), Err(StreamError::NotConfigured)));

    let _second = TcpStream::connect(addr).unwrap();
    let StreamEvent::SessionCreated(second_id) = next_event(&events, |e| matches!(e, StreamEvent::SessionCreated(_)))
    else {
        unreachable!()
    };
    assert_ne!(first_id, second_id);
    server.stop();
}

#[test]
fn stop_closes_clients_and_releases_session() {
    let mut server = StreamingServer::new(config(4), Arc::new(ToneHandler { rtp_port: 45_104 }));
    let events = server.events();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let mut clients: Vec<TcpStream> = (0..2).map(|_| TcpStream::connect(addr).unwrap()).collect();
    assert!(wait_for(|| server.client_count() == 2));
    let session = server.session_id().unwrap();

    let started = Instant::now();
    server.stop();
    assert!(started.elapsed() < Duration::from_secs(2));
    next_event(&events, |e| *e == StreamEvent::SessionReleased(session));

    for client in &mut clients {
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = [0u8; 8];
        assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));
    }
    assert!(TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_err());
}

#[test]
fn rejected_flood_does_not_grow_event_queue() {
    let mut server = StreamingServer::new(config(1), Arc::new(ToneHandler { rtp_port: 45_204 }));
    let events = server.events();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let _held = TcpStream::connect(addr).unwrap();
    assert!(wait_for(|| server.client_count() == 1));

    // Nobody drains the receiver while the flood is admitted
    // Paced so the listen backlog never overflows
    for _ in 0..EVENT_QUEUE_CAPACITY + 50 {
        let _ = TcpStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(1));
    }
    assert!(wait_for(|| events.len() == EVENT_QUEUE_CAPACITY));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(events.len(), EVENT_QUEUE_CAPACITY);
    assert_eq!(server.client_count(), 1);

    // Still serving once the receiver catches up
    while events.try_recv().is_ok() {}
    let _late = TcpStream::connect(addr).unwrap();
    next_event(&events, |e| matches!(e, StreamEvent::ClientRejected { .. }));
    assert_eq!(server.client_count(), 1);
    server.stop();
}
