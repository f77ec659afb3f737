//! Stream session: bound media streams plus the clients they are sent to

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use uuid::Uuid;

use crate::error::StreamError;
use crate::stream::{client_destination, MediaKind, MediaStream};

const SESSION_NAME: &str = "lan-media-streamer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    /// At least one stream is bound and configured
    Configured,
    Streaming,
    Stopped,
}

/// Media streams shared by every attached client
pub struct StreamSession {
    id: Uuid,
    created_at: DateTime<Utc>,
    state: SessionState,
    /// Address announced in the `o=` and `c=` lines
    origin: IpAddr,
    /// At most one stream per media kind
    streams: Vec<Box<dyn MediaStream>>,
    /// Receivers; every bound stream sends to each of them
    clients: Vec<SocketAddr>,
}

impl StreamSession {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            state: SessionState::Created,
            origin: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            streams: Vec::new(),
            clients: Vec::new(),
        }
    }

    /// Address advertised in the `o=` and `c=` lines
    pub fn with_origin(mut self, origin: IpAddr) -> Self {
        self.origin = origin;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_streaming(&self) -> bool {
        self.state == SessionState::Streaming
    }

    pub fn clients(&self) -> &[SocketAddr] {
        &self.clients
    }

    pub fn kinds(&self) -> Vec<MediaKind> {
        self.streams.iter().map(|s| s.kind()).collect()
    }

    /// Bind and configure a stream; one stream per media kind
    pub fn bind(&mut self, mut stream: Box<dyn MediaStream>) -> Result<(), StreamError> {
        match self.state {
            SessionState::Created | SessionState::Configured => {}
            SessionState::Streaming => return Err(StreamError::AlreadyStarted),
            SessionState::Stopped => return Err(StreamError::InvalidState("session stopped")),
        }
        if self.streams.iter().any(|s| s.kind() == stream.kind()) {
            return Err(StreamError::AlreadyBound);
        }

        if let Err(e) = stream.configure() {
            stream.release();
            return Err(e);
        }
        for client in &self.clients {
            stream.add_destination(client_destination(stream.as_ref(), client.ip()));
        }

        tracing::debug!("Session {} bound {:?} stream", self.id, stream.kind());
        self.streams.push(stream);
        self.state = SessionState::Configured;
        Ok(())
    }

    /// Start every bound stream; returns once each encoder is ready
    pub fn start(&mut self) -> Result<(), StreamError> {
        match self.state {
            SessionState::Configured => {}
            SessionState::Created => return Err(StreamError::NotConfigured),
            SessionState::Streaming => return Err(StreamError::AlreadyStarted),
            SessionState::Stopped => return Err(StreamError::InvalidState("session stopped")),
        }

        for index in 0..self.streams.len() {
            if let Err(e) = self.streams[index].start() {
                for started in &mut self.streams[..index] {
                    started.stop();
                }
                tracing::warn!("Session {} failed to start: {}", self.id, e);
                return Err(e);
            }
        }

        self.state = SessionState::Streaming;
        tracing::info!("Session {} streaming to {} client(s)", self.id, self.clients.len());
        Ok(())
    }

    /// Stop and release every stream; idempotent
    pub fn stop(&mut self) {
        if self.state == SessionState::Stopped {
            return;
        }
        for stream in &mut self.streams {
            stream.stop();
            stream.release();
        }
        self.state = SessionState::Stopped;
        tracing::info!("Session {} stopped", self.id);
    }

    /// Send media to `peer`'s address on each stream's ports
    pub fn add_client(&mut self, peer: SocketAddr) {
        for stream in &self.streams {
            stream.add_destination(client_destination(stream.as_ref(), peer.ip()));
        }
        self.clients.push(peer);
        tracing::debug!("Session {} added client {}", self.id, peer);
    }

    pub fn remove_client(&mut self, peer: SocketAddr) -> bool {
        let Some(index) = self.clients.iter().position(|c| *c == peer) else {
            return false;
        };
        self.clients.remove(index);
        for stream in &self.streams {
            stream.remove_destination(&client_destination(stream.as_ref(), peer.ip()));
        }
        tracing::debug!("Session {} removed client {}", self.id, peer);
        true
    }

    pub fn session_description(&self) -> Result<String, StreamError> {
        if self.streams.is_empty() {
            return Err(StreamError::NotConfigured);
        }
        let family = match self.origin {
            IpAddr::V4(_) => "IP4",
            IpAddr::V6(_) => "IP6",
        };
        let mut description = format!(
            "v=0\r\n\
             o=- {session} {version} IN {family} {origin}\r\n\
             s={name}\r\n\
             c=IN {family} {origin}\r\n\
             t=0 0\r\n",
            session = self.created_at.timestamp(),
            version = self.created_at.timestamp_subsec_millis(),
            origin = self.origin,
            name = SESSION_NAME,
        );
        for stream in &self.streams {
            description.push_str(&stream.session_description()?);
        }
        Ok(description)
    }

    pub fn mute(&self) {
        for stream in &self.streams {
            stream.mute();
        }
    }

    pub fn unmute(&self) {
        for stream in &self.streams {
            stream.unmute();
        }
    }

    pub fn is_muted(&self) -> bool {
        !self.streams.is_empty() && self.streams.iter().all(|s| s.is_muted())
    }
}

impl Default for StreamSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Destination;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Calls {
        log: Vec<&'static str>,
        destinations: Vec<Destination>,
        muted: bool,
    }

    struct FakeStream {
        kind: MediaKind,
        calls: Arc<Mutex<Calls>>,
        fail_start: bool,
    }

    impl FakeStream {
        fn new(kind: MediaKind) -> (Self, Arc<Mutex<Calls>>) {
            let calls = Arc::new(Mutex::new(Calls::default()));
            let stream = Self {
                kind,
                calls: calls.clone(),
                fail_start: false,
            };
            (stream, calls)
        }
    }

    impl MediaStream for FakeStream {
        fn kind(&self) -> MediaKind {
            self.kind
        }
        fn configure(&mut self) -> Result<(), StreamError> {
            self.calls.lock().log.push("configure");
            Ok(())
        }
        fn start(&mut self) -> Result<(), StreamError> {
            if self.fail_start {
                return Err(StreamError::NotReady(std::time::Duration::ZERO));
            }
            self.calls.lock().log.push("start");
            Ok(())
        }
        fn stop(&mut self) {
            self.calls.lock().log.push("stop");
        }
        fn release(&mut self) {
            self.calls.lock().log.push("release");
        }
        fn is_streaming(&self) -> bool {
            false
        }
        fn session_description(&self) -> Result<String, StreamError> {
            Ok("m=audio 5004 RTP/AVP 111\r\n".to_string())
        }
        fn rtp_port(&self) -> u16 {
            5004
        }
        fn rtcp_port(&self) -> u16 {
            5005
        }
        fn set_destination(&self, ip: IpAddr, rtp_port: u16, rtcp_port: u16) {
            self.calls.lock().destinations = vec![Destination::new(ip, rtp_port, rtcp_port)];
        }
        fn add_destination(&self, destination: Destination) {
            self.calls.lock().destinations.push(destination);
        }
        fn remove_destination(&self, destination: &Destination) -> bool {
            let mut calls = self.calls.lock();
            match calls.destinations.iter().position(|d| d == destination) {
                Some(index) => {
                    calls.destinations.remove(index);
                    true
                }
                None => false,
            }
        }
        fn mute(&self) {
            self.calls.lock().muted = true;
        }
        fn unmute(&self) {
            self.calls.lock().muted = false;
        }
        fn is_muted(&self) -> bool {
            self.calls.lock().muted
        }
    }

    fn peer(last: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, last)), port)
    }

    #[test]
    fn test_state_machine() {
        let mut session = StreamSession::new();
        assert_eq!(session.state(), SessionState::Created);
        assert!(matches!(session.start(), Err(StreamError::NotConfigured)));
        assert!(matches!(session.session_description(), Err(StreamError::NotConfigured)));

        let (stream, calls) = FakeStream::new(MediaKind::Audio);
        session.bind(Box::new(stream)).unwrap();
        assert_eq!(session.state(), SessionState::Configured);

        session.start().unwrap();
        assert_eq!(session.state(), SessionState::Streaming);
        assert!(matches!(session.start(), Err(StreamError::AlreadyStarted)));

        session.stop();
        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(calls.lock().log, vec!["configure", "start", "stop", "release"]);
    }

    #[test]
    fn test_bind_twice() {
        let mut session = StreamSession::new();
        let (first, _) = FakeStream::new(MediaKind::Audio);
        let (second, _) = FakeStream::new(MediaKind::Audio);
        let (video, _) = FakeStream::new(MediaKind::Video);

        session.bind(Box::new(first)).unwrap();
        assert!(matches!(session.bind(Box::new(second)), Err(StreamError::AlreadyBound)));
        session.bind(Box::new(video)).unwrap();
        assert_eq!(session.kinds(), vec![MediaKind::Audio, MediaKind::Video]);
    }

    #[test]
    fn test_failed_start_stops_started_streams() {
        let mut session = StreamSession::new();
        let (audio, audio_calls) = FakeStream::new(MediaKind::Audio);
        let (mut video, _) = FakeStream::new(MediaKind::Video);
        video.fail_start = true;

        session.bind(Box::new(audio)).unwrap();
        session.bind(Box::new(video)).unwrap();
        assert!(matches!(session.start(), Err(StreamError::NotReady(_))));
        assert_eq!(session.state(), SessionState::Configured);
        assert_eq!(audio_calls.lock().log, vec!["configure", "start", "stop"]);
    }

    #[test]
    fn test_clients_become_destinations() {
        let mut session = StreamSession::new();
        session.add_client(peer(10, 40000));

        let (stream, calls) = FakeStream::new(MediaKind::Audio);
        session.bind(Box::new(stream)).unwrap();
        session.add_client(peer(11, 40001));

        let ip = |last| IpAddr::V4(Ipv4Addr::new(192, 168, 1, last));
        assert_eq!(
            calls.lock().destinations,
            vec![Destination::new(ip(10), 5004, 5005), Destination::new(ip(11), 5004, 5005)]
        );

        assert!(session.remove_client(peer(10, 40000)));
        assert!(!session.remove_client(peer(10, 40000)));
        assert_eq!(calls.lock().destinations, vec![Destination::new(ip(11), 5004, 5005)]);
        assert_eq!(session.clients(), &[peer(11, 40001)]);
    }

    #[test]
    fn test_session_description() {
        let mut session = StreamSession::new().with_origin(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        let (stream, _) = FakeStream::new(MediaKind::Audio);
        session.bind(Box::new(stream)).unwrap();

        let description = session.session_description().unwrap();
        assert!(description.starts_with("v=0\r\no=- "));
        assert!(description.contains(" IN IP4 10.0.0.2\r\n"));
        assert!(description.contains("c=IN IP4 10.0.0.2\r\nt=0 0\r\n"));
        assert!(description.ends_with("m=audio 5004 RTP/AVP 111\r\n"));
    }

    #[test]
    fn test_mute_forwards() {
        let mut session = StreamSession::new();
        assert!(!session.is_muted());
        let (stream, calls) = FakeStream::new(MediaKind::Audio);
        session.bind(Box::new(stream)).unwrap();

        session.mute();
        assert!(session.is_muted());
        assert!(calls.lock().muted);
        session.unmute();
        assert!(!session.is_muted());
    }
}
