//! Presence server: admission, liveness monitors and the shared session
//!
//! Clients connect over TCP only to announce themselves; media flows to
//! their address over RTP/UDP. The first admitted client creates the
//! [`StreamSession`] and the last one to leave releases it. Every attach and
//! detach runs inside one [`ClientRegistry`] critical section, so each
//! 0→1 and 1→0 transition fires exactly once.

use parking_lot::Mutex;
use serde::Serialize;
use std::io::{ErrorKind, Read};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use uuid::Uuid;

use chrono::{DateTime, Utc};

use crate::config::ServerConfig;
use crate::error::{NetworkError, StreamError};
use crate::events::{self, EventReceiver, EventSender, StreamEvent};
use crate::network::create_listener;
use crate::session::{SessionState, StreamSession};
use crate::util::join_with_timeout;

const LISTEN_BACKLOG: i32 = 32;

/// Application seam that binds media streams into a new session
///
/// Both callbacks run on the accept or monitor thread while the registry
/// lock is held. They must not call back into [`StreamingServer`] or
/// [`ClientRegistry`] (`client_count`, `with_session`, `stop`, ...) or
/// they deadlock; hand work to another thread instead. Admission of other
/// clients waits until the callback returns.
pub trait SessionHandler: Send + Sync {
    /// Bind streams before the session starts; an error aborts the attach
    ///
    /// Runs under the registry lock.
    fn on_session_created(&self, session: &mut StreamSession) -> Result<(), StreamError>;

    /// Called after the session stopped, before it is dropped
    ///
    /// Runs under the registry lock, except during [`ClientRegistry::shutdown`].
    fn on_session_released(&self, _session: &StreamSession) {}
}

struct ClientConnection {
    peer: SocketAddr,
    /// Presence socket; shut down to disconnect the client
    stream: TcpStream,
    /// Tells the monitor thread to exit without detaching
    shutdown: Arc<AtomicBool>,
    /// Liveness monitor, joined on shutdown
    monitor: Option<JoinHandle<()>>,
}

impl ClientConnection {
    fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            if e.kind() != ErrorKind::NotConnected {
                tracing::debug!("Closing client {} failed: {}", self.peer, e);
            }
        }
    }
}

#[derive(Default)]
struct RegistryState {
    clients: Vec<(u64, ClientConnection)>,
    session: Option<StreamSession>,
    next_id: u64,
}

/// Attached clients and the active session, behind a single lock
pub struct ClientRegistry {
    /// Clients and session change together under this lock
    state: Mutex<RegistryState>,
    handler: Arc<dyn SessionHandler>,
    events: EventSender,
    /// Admission limit; the next client past it is rejected
    max_clients: usize,
    /// How often monitors check their client for EOF
    poll_interval: Duration,
}

impl ClientRegistry {
    pub fn new(
        handler: Arc<dyn SessionHandler>,
        events: EventSender,
        max_clients: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            handler,
            events,
            max_clients,
            poll_interval,
        }
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().clients.len()
    }

    pub fn client_addresses(&self) -> Vec<SocketAddr> {
        self.state.lock().clients.iter().map(|(_, c)| c.peer).collect()
    }

    pub fn has_session(&self) -> bool {
        self.state.lock().session.is_some()
    }

    /// Run `f` against the active session, if any
    pub fn with_session<R>(&self, f: impl FnOnce(&mut StreamSession) -> R) -> Option<R> {
        self.state.lock().session.as_mut().map(f)
    }

    /// Admit `stream` or close it
    ///
    /// Returns whether the client was attached. The admission check, the
    /// session creation on first attach and the insertion happen under the
    /// registry lock.
    pub fn attach(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) -> bool {
        let mut state = self.state.lock();

        if state.clients.len() >= self.max_clients {
            let _ = stream.shutdown(Shutdown::Both);
            tracing::info!("Rejected {} ({} clients attached)", peer, state.clients.len());
            events::emit(Some(&self.events), StreamEvent::ClientRejected { peer });
            return false;
        }

        let id = state.next_id;
        state.next_id += 1;

        let shutdown = Arc::new(AtomicBool::new(false));
        let monitor = match self.spawn_monitor(id, &stream, shutdown.clone()) {
            Ok(monitor) => monitor,
            Err(e) => {
                tracing::warn!("Could not watch client {}: {}", peer, e);
                let _ = stream.shutdown(Shutdown::Both);
                return false;
            }
        };
        let connection = ClientConnection {
            peer,
            stream,
            shutdown,
            monitor: Some(monitor),
        };

        match state.session.as_mut() {
            Some(session) => session.add_client(peer),
            None => {
                let origin = connection
                    .stream
                    .local_addr()
                    .map(|addr| addr.ip())
                    .unwrap_or(IpAddr::from([0, 0, 0, 0]));
                match self.create_session(origin, peer) {
                    Ok(session) => {
                        events::emit(Some(&self.events), StreamEvent::SessionCreated(session.id()));
                        state.session = Some(session);
                    }
                    Err(e) => {
                        tracing::error!("Session for {} failed: {}", peer, e);
                        // The monitor may already be waiting on the lock; its detach finds nothing
                        connection.close();
                        events::emit(Some(&self.events), StreamEvent::SessionFailed(e.to_string()));
                        return false;
                    }
                }
            }
        }

        state.clients.push((id, connection));
        let clients = state.clients.len();
        tracing::info!("Client {} attached ({} total)", peer, clients);
        events::emit(Some(&self.events), StreamEvent::ClientAttached { peer, clients });
        true
    }

    /// Remove client `id`; releases the session when it was the last one
    ///
    /// Returns false when `id` is not attached.
    pub fn detach(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        let Some(index) = state.clients.iter().position(|(client, _)| *client == id) else {
            return false;
        };
        let (_, mut connection) = state.clients.remove(index);
        connection.close();
        // Called from the monitor itself, so the handle is only detached
        connection.monitor.take();

        if let Some(session) = state.session.as_mut() {
            session.remove_client(connection.peer);
        }
        let clients = state.clients.len();
        tracing::info!("Client {} detached ({} remaining)", connection.peer, clients);
        events::emit(
            Some(&self.events),
            StreamEvent::ClientDetached {
                peer: connection.peer,
                clients,
            },
        );

        if clients == 0 {
            if let Some(session) = state.session.take() {
                self.release_session(session);
            }
        }
        true
    }

    /// Close every client and release the session; idempotent
    pub fn shutdown(&self, join_timeout: Duration) {
        let (clients, session) = {
            let mut state = self.state.lock();
            (std::mem::take(&mut state.clients), state.session.take())
        };

        // One failing close must not stop the rest
        for (_, connection) in &clients {
            connection.close();
        }
        if let Some(session) = session {
            self.release_session(session);
        }

        for (_, mut connection) in clients {
            if let Some(monitor) = connection.monitor.take() {
                join_with_timeout(monitor, join_timeout);
            }
            events::emit(
                Some(&self.events),
                StreamEvent::ClientDetached {
                    peer: connection.peer,
                    clients: 0,
                },
            );
        }
    }

    fn create_session(&self, origin: IpAddr, peer: SocketAddr) -> Result<StreamSession, StreamError> {
        let mut session = StreamSession::new().with_origin(origin);
        self.handler.on_session_created(&mut session)?;
        session.add_client(peer);
        session.start()?;
        tracing::info!("Session {} created for {}", session.id(), peer);
        Ok(session)
    }

    fn release_session(&self, mut session: StreamSession) {
        session.stop();
        self.handler.on_session_released(&session);
        tracing::info!("Session {} released", session.id());
        events::emit(Some(&self.events), StreamEvent::SessionReleased(session.id()));
    }

    fn spawn_monitor(
        self: &Arc<Self>,
        id: u64,
        stream: &TcpStream,
        shutdown: Arc<AtomicBool>,
    ) -> std::io::Result<JoinHandle<()>> {
        let stream = stream.try_clone()?;
        stream.set_nonblocking(true)?;
        let registry = Arc::clone(self);
        let poll_interval = self.poll_interval;

        thread::Builder::new()
            .name(format!("stream-client-{}", id))
            .spawn(move || {
                if watch(stream, &shutdown, poll_interval) {
                    registry.detach(id);
                }
            })
    }
}

/// Poll until the peer goes away; false when interrupted
fn watch(mut stream: TcpStream, shutdown: &AtomicBool, poll_interval: Duration) -> bool {
    let mut discard = [0u8; 256];
    while !shutdown.load(Ordering::Relaxed) {
        match stream.read(&mut discard) {
            Ok(0) => return true,
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(poll_interval),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::debug!("Client connection error: {}", e);
                return true;
            }
        }
    }
    false
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub state: SessionState,
    pub muted: bool,
}

/// Serializable snapshot of the server
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub running: bool,
    pub local_addr: Option<SocketAddr>,
    pub max_clients: usize,
    pub clients: Vec<SocketAddr>,
    pub session: Option<SessionStatus>,
}

pub struct StreamingServer {
    config: ServerConfig,
    registry: Arc<ClientRegistry>,
    /// Receiving end handed out by `events()`
    events: EventReceiver,
    /// Cleared by `stop()`, or by the accept loop on a fatal error
    running: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
    /// Bound listener address while running
    local_addr: Option<SocketAddr>,
}

impl StreamingServer {
    pub fn new(config: ServerConfig, handler: Arc<dyn SessionHandler>) -> Self {
        let (sender, events) = events::channel();
        Self::with_events(config, handler, sender, events)
    }

    /// Use an existing event channel, shared with the application's streams
    pub fn with_events(
        config: ServerConfig,
        handler: Arc<dyn SessionHandler>,
        sender: EventSender,
        events: EventReceiver,
    ) -> Self {
        let registry = Arc::new(ClientRegistry::new(
            handler,
            sender,
            config.max_clients,
            config.poll_interval(),
        ));
        Self {
            config,
            registry,
            events,
            running: Arc::new(AtomicBool::new(false)),
            accept_thread: None,
            local_addr: None,
        }
    }

    pub fn events(&self) -> EventReceiver {
        self.events.clone()
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Bind the listener and spawn the accept thread; a no-op when running
    pub fn start(&mut self) -> Result<(), NetworkError> {
        if self.is_running() {
            return Ok(());
        }
        // The accept thread may have fail-stopped on its own
        if let Some(handle) = self.accept_thread.take() {
            join_with_timeout(handle, self.config.join_timeout());
        }

        let bind = SocketAddr::new(self.config.bind_address, self.config.port);
        let listener = create_listener(bind, LISTEN_BACKLOG)?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        self.running.store(true, Ordering::SeqCst);
        let acceptor = Acceptor {
            listener,
            registry: self.registry.clone(),
            running: self.running.clone(),
            poll_interval: self.config.accept_poll_interval(),
            join_timeout: self.config.join_timeout(),
        };
        let handle = thread::Builder::new()
            .name("stream-accept".to_string())
            .spawn(move || acceptor.run())
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                NetworkError::BindFailed(format!("failed to spawn accept thread: {}", e))
            })?;

        self.accept_thread = Some(handle);
        self.local_addr = Some(local_addr);
        tracing::info!(
            "Streaming server listening on {} (max {} clients)",
            local_addr,
            self.config.max_clients
        );
        Ok(())
    }

    /// Close the listener and every client, release the session; idempotent
    pub fn stop(&mut self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.take() {
            join_with_timeout(handle, self.config.join_timeout());
        }
        self.registry.shutdown(self.config.join_timeout());
        self.local_addr = None;
        if was_running {
            tracing::info!("Streaming server stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn client_count(&self) -> usize {
        self.registry.client_count()
    }

    pub fn client_addresses(&self) -> Vec<SocketAddr> {
        self.registry.client_addresses()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.registry.with_session(|session| session.id())
    }

    pub fn session_description(&self) -> Result<String, StreamError> {
        self.registry
            .with_session(|session| session.session_description())
            .unwrap_or(Err(StreamError::NotConfigured))
    }

    pub fn mute(&self) {
        self.registry.with_session(|session| session.mute());
    }

    pub fn unmute(&self) {
        self.registry.with_session(|session| session.unmute());
    }

    pub fn status(&self) -> ServerStatus {
        let session = self.registry.with_session(|session| SessionStatus {
            id: session.id(),
            created_at: session.created_at(),
            state: session.state(),
            muted: session.is_muted(),
        });
        ServerStatus {
            running: self.is_running(),
            local_addr: self.local_addr,
            max_clients: self.registry.max_clients(),
            clients: self.registry.client_addresses(),
            session,
        }
    }
}

impl Drop for StreamingServer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Acceptor {
    listener: TcpListener,
    registry: Arc<ClientRegistry>,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
    join_timeout: Duration,
}

impl Acceptor {
    fn run(self) {
        while self.running.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    tracing::debug!("Connection from {}", peer);
                    self.registry.attach(stream, peer);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(self.poll_interval),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::error!("Accept failed, stopping server: {}", e);
                    self.running.store(false, Ordering::SeqCst);
                    self.registry.shutdown(self.join_timeout);
                    break;
                }
            }
        }
        tracing::debug!("Accept loop exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct Unbound;

    impl SessionHandler for Unbound {
        fn on_session_created(&self, _: &mut StreamSession) -> Result<(), StreamError> {
            Err(StreamError::NotConfigured)
        }
    }

    fn config(max_clients: usize) -> ServerConfig {
        ServerConfig {
            bind_address: IpAddr::from([127, 0, 0, 1]),
            port: 0,
            max_clients,
            poll_interval_ms: 10,
            accept_poll_interval_ms: 5,
            join_timeout_ms: 200,
        }
    }

    #[test]
    fn test_start_is_idempotent() {
        let mut server = StreamingServer::new(config(2), Arc::new(Unbound));
        server.start().unwrap();
        let addr = server.local_addr().unwrap();
        server.start().unwrap();
        assert_eq!(server.local_addr(), Some(addr));

        server.stop();
        server.stop();
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());
    }

    #[test]
    fn test_failed_session_closes_connection() {
        let mut server = StreamingServer::new(config(2), Arc::new(Unbound));
        let events = server.events();
        server.start().unwrap();

        let mut client = TcpStream::connect(server.local_addr().unwrap()).unwrap();
        let event = events.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(event, StreamEvent::SessionFailed(_)));
        assert_eq!(server.client_count(), 0);
        assert!(server.session_id().is_none());

        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let _ = client.write_all(b"x");
        let mut buf = [0u8; 1];
        assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));
    }

    #[test]
    fn test_status_serializes() {
        let mut server = StreamingServer::new(config(3), Arc::new(Unbound));
        server.start().unwrap();
        let status = serde_json::to_value(server.status()).unwrap();
        assert_eq!(status["running"], true);
        assert_eq!(status["max_clients"], 3);
        assert!(status["session"].is_null());
    }

    #[test]
    fn test_description_without_session() {
        let server = StreamingServer::new(config(1), Arc::new(Unbound));
        assert!(matches!(server.session_description(), Err(StreamError::NotConfigured)));
    }
}
