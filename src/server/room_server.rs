//! Room server: listener, readiness loop and session lifecycle
//!
//! One thread polls the listener and every accepted socket. A second thread,
//! the [`RegistrationPusher`], walks the same session set on a timer. Both
//! take the single session-set lock, so per-session push state is never
//! touched concurrently.

use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{Result, RoomError};
use crate::protocol::frame::{MESSAGE_ID_SIZE, RECEIVE_BUFFER_SIZE};
use crate::server::client_session::{ClientSession, CloseReason, SessionStatus};
use crate::server::pusher::{RegistrationPusher, SessionSet};
use crate::server::room_manager::RoomRegistry;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_SESSION_TOKEN: usize = 2;

/// Readiness events handled per poll call
const EVENTS_CAPACITY: usize = 1024;

/// Default listen port
pub const DEFAULT_PORT: u16 = 37520;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: IpAddr,
    /// Port to listen on, 0 picks a free port
    pub port: u16,
    /// Maximum concurrent client connections
    pub max_connections: usize,
    /// Upper bound on a single poll wait
    pub poll_interval: Duration,
    /// Delay between registration push rounds
    pub push_interval: Duration,
    /// Per-session receive buffer capacity in bytes
    pub receive_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            max_connections: 10000,
            poll_interval: Duration::from_secs(1),
            push_interval: Duration::from_millis(100),
            receive_buffer_size: RECEIVE_BUFFER_SIZE,
        }
    }
}

impl ServerConfig {
    /// Socket address the listener binds to
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(RoomError::config("max_connections must be at least 1"));
        }
        if self.poll_interval.is_zero() {
            return Err(RoomError::config("poll_interval must be non-zero"));
        }
        if self.push_interval.is_zero() {
            return Err(RoomError::config("push_interval must be non-zero"));
        }
        if self.receive_buffer_size < MESSAGE_ID_SIZE {
            return Err(RoomError::config(format!(
                "receive_buffer_size must hold at least a message id ({} bytes)",
                MESSAGE_ID_SIZE
            )));
        }
        Ok(())
    }
}

/// Stops a running server from any thread
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!("Failed to wake event loop for shutdown: {}", e);
        }
    }
}

/// Room server owning the listener and the live session set
pub struct RoomServer {
    config: ServerConfig,
    poll: Poll,
    listener: TcpListener,
    waker: Arc<Waker>,
    registry: Arc<RoomRegistry>,
    sessions: SessionSet,
    shutdown: Arc<AtomicBool>,
    next_token: usize,
}

impl RoomServer {
    /// Bind the listener and prepare the event loop
    pub fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        let mut listener = TcpListener::bind(config.listen_addr()).map_err(|e| {
            error!("bind() failed on {}: {}", config.listen_addr(), e);
            e
        })?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        info!("Room server listening on {}", listener.local_addr()?);

        Ok(Self {
            config,
            poll,
            listener,
            waker,
            registry: Arc::new(RoomRegistry::new()),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            shutdown: Arc::new(AtomicBool::new(false)),
            next_token: FIRST_SESSION_TOKEN,
        })
    }

    /// Bind and run the server on its own thread
    pub fn spawn(config: ServerConfig) -> Result<ServerHandle> {
        let server = Self::bind(config)?;
        let local_addr = server.local_addr()?;
        let registry = server.registry();
        let sessions = Arc::clone(&server.sessions);
        let shutdown = server.shutdown_handle();

        let thread = thread::Builder::new()
            .name("room-server".to_string())
            .spawn(move || server.run())?;

        Ok(ServerHandle {
            local_addr,
            registry,
            sessions,
            shutdown,
            thread,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<RoomRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Run until shut down or a listener-level failure
    ///
    /// Every session is torn down, and its room released, before returning.
    pub fn run(mut self) -> Result<()> {
        let pusher = RegistrationPusher::spawn(
            Arc::clone(&self.sessions),
            self.config.push_interval,
            Arc::clone(&self.shutdown),
        )?;

        let result = self.event_loop();
        if let Err(e) = &result {
            error!("Room server stopping on error: {}", e);
        }

        self.shutdown.store(true, Ordering::Release);
        pusher.join();
        self.close_all_sessions();

        info!("Room server stopped");
        result
    }

    fn event_loop(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        while !self.shutdown.load(Ordering::Acquire) {
            if let Err(e) = self
                .poll
                .poll(&mut events, Some(self.config.poll_interval))
            {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!("poll() failed: {}", e);
                return Err(e.into());
            }

            for event in events.iter() {
                let token = event.token();

                if token == WAKER {
                    continue;
                }

                // Resets and hang-ups arrive with read or write readiness and are
                // surfaced by the session's own socket calls
                let routable = event.is_readable() || event.is_writable();
                if event.is_error() && (token == LISTENER || !routable) {
                    error!("Unexpected readiness on {:?}: {:?}", token, event);
                    return Err(RoomError::Network(io::Error::other(format!(
                        "error readiness on {:?}",
                        token
                    ))));
                }

                if token == LISTENER {
                    self.accept_connections()?;
                } else {
                    self.process_session(token);
                }
            }
        }

        Ok(())
    }

    /// Accept every queued connection
    fn accept_connections(&mut self) -> Result<()> {
        debug!("Listening socket is readable");

        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => self.add_session(stream, peer_addr)?,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset
                    ) =>
                {
                    warn!("Transient accept error: {}", e);
                }
                Err(e) => {
                    error!("accept() failed: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    fn add_session(&mut self, mut stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        let sessions = Arc::clone(&self.sessions);
        let mut sessions = sessions.lock();

        if sessions.len() >= self.config.max_connections {
            let err = RoomError::resource_limit(format!(
                "{} connections open",
                self.config.max_connections
            ));
            warn!("Rejecting {}: {}", peer_addr, err);
            return Ok(());
        }

        let token = Token(self.next_token);
        self.next_token += 1;

        self.poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)?;
        sessions.insert(
            token,
            ClientSession::new(
                token,
                stream,
                Arc::clone(&self.registry),
                self.config.receive_buffer_size,
            ),
        );

        info!("New connection {:?} from {}", token, peer_addr);
        Ok(())
    }

    /// Flush and drain a ready session, tearing it down if it asks to close
    fn process_session(&mut self, token: Token) {
        let mut sessions = self.sessions.lock();

        let status = match sessions.get_mut(&token) {
            Some(session) => match session.process_stream() {
                SessionStatus::Open => match session.sync_interest(self.poll.registry()) {
                    Ok(()) => SessionStatus::Open,
                    Err(e) => {
                        error!("Failed to reregister {:?}: {}", token, e);
                        SessionStatus::Closed(CloseReason::Failed(e.into()))
                    }
                },
                closed => closed,
            },
            None => {
                warn!("Readiness on unknown connection {:?}", token);
                return;
            }
        };

        if let SessionStatus::Closed(reason) = status {
            if let Some(mut session) = sessions.remove(&token) {
                if let Err(e) = self.poll.registry().deregister(session.stream_mut()) {
                    warn!("Failed to deregister {:?}: {}", token, e);
                }
            }
            info!("Connection {:?} closed: {:?}", token, reason);
        }
    }

    fn close_all_sessions(&mut self) {
        let mut sessions = self.sessions.lock();
        for (token, mut session) in sessions.drain() {
            if let Err(e) = self.poll.registry().deregister(session.stream_mut()) {
                debug!("Failed to deregister {:?}: {}", token, e);
            }
        }
    }
}

/// Handle to a server running on its own thread
pub struct ServerHandle {
    local_addr: SocketAddr,
    registry: Arc<RoomRegistry>,
    sessions: SessionSet,
    shutdown: ShutdownHandle,
    thread: JoinHandle<Result<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<RoomRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Wait for the server thread to exit
    pub fn join(self) -> Result<()> {
        self.thread
            .join()
            .map_err(|_| RoomError::Network(io::Error::other("room server thread panicked")))?
    }

    /// Shut down and wait for the server thread
    pub fn stop(self) -> Result<()> {
        self.shutdown.shutdown();
        self.join()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{RoomClient, accept_room_push};
    use crate::protocol::codec::{decode, encode};
    use crate::protocol::messages::*;
    use std::net::{Ipv4Addr, TcpListener as StdListener};
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(3);

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            poll_interval: Duration::from_millis(100),
            push_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    fn start(config: ServerConfig) -> ServerHandle {
        RoomServer::spawn(config).unwrap()
    }

    fn connect(server: &ServerHandle) -> RoomClient {
        RoomClient::connect(server.local_addr(), WAIT).unwrap()
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(ServerConfig::default().validate().is_ok());
        assert!(
            ServerConfig {
                max_connections: 0,
                ..Default::default()
            }
            .validate()
            .is_err()
        );
        assert!(
            ServerConfig {
                receive_buffer_size: 3,
                ..Default::default()
            }
            .validate()
            .is_err()
        );
        assert!(
            ServerConfig {
                push_interval: Duration::ZERO,
                ..Default::default()
            }
            .validate()
            .is_err()
        );
    }

    #[test]
    fn test_end_to_end_registration() {
        let server = start(test_config());
        let game_listener = StdListener::bind("127.0.0.1:0").unwrap();
        let game_port = game_listener.local_addr().unwrap().port();

        // Host registers its game server
        let mut host = connect(&server);
        assert!(host.init_session().unwrap());
        host.register_server(game_port).unwrap();

        let room_id = accept_room_push(&game_listener, WAIT).unwrap();
        assert_eq!(
            server.registry().get(room_id),
            Some(crate::server::Room::new("127.0.0.1", game_port))
        );

        // Joining client looks the room up
        let mut joiner = connect(&server);
        assert!(joiner.init_session().unwrap());
        let response = joiner.request_registration(room_id).unwrap();
        assert_eq!(response.host(), Some(("127.0.0.1", game_port)));

        // Same session keeps answering
        let missing = joiner.request_registration(room_id.wrapping_add(1)).unwrap();
        assert_eq!(missing.host(), None);

        server.stop().unwrap();
    }

    #[test]
    fn test_game_started_teardown() {
        let server = start(test_config());
        let game_listener = StdListener::bind("127.0.0.1:0").unwrap();
        let game_port = game_listener.local_addr().unwrap().port();

        let mut host = connect(&server);
        assert!(host.init_session().unwrap());
        host.register_server(game_port).unwrap();
        let room_id = accept_room_push(&game_listener, WAIT).unwrap();

        host.game_started().unwrap();
        assert!(host.wait_closed().unwrap());

        let mut joiner = connect(&server);
        assert!(joiner.init_session().unwrap());
        let response = joiner.request_registration(room_id).unwrap();
        assert_eq!(response.host(), None);
        assert_eq!(response.port, ROOM_NOT_FOUND_PORT);

        server.stop().unwrap();
    }

    #[test]
    fn test_host_disconnect_releases_room() {
        let server = start(test_config());
        let game_listener = StdListener::bind("127.0.0.1:0").unwrap();
        let game_port = game_listener.local_addr().unwrap().port();

        let mut host = connect(&server);
        assert!(host.init_session().unwrap());
        host.register_server(game_port).unwrap();
        let room_id = accept_room_push(&game_listener, WAIT).unwrap();

        drop(host);
        let registry = server.registry();
        wait_until(|| !registry.contains(room_id));
        wait_until(|| server.session_count() == 0);

        server.stop().unwrap();
    }

    #[test]
    fn test_split_requests() {
        let server = start(test_config());
        let registry = server.registry();
        let room_id = registry.create("::ffff:10.2.3.4", 5555);

        let mut client = connect(&server);
        let mut data = encode(&InitSession::default()).to_vec();
        data.extend_from_slice(&encode(&ClientRequestRegistration { room_id }));
        for chunk in data.chunks(3) {
            client.send_raw(chunk).unwrap();
            thread::sleep(Duration::from_millis(5));
        }

        let init: InitSessionResponse = client.receive().unwrap();
        assert!(init.accepted);
        let response: ClientRequestRegistrationResponse = client.receive().unwrap();
        assert_eq!(response.host(), Some(("::ffff:10.2.3.4", 5555)));

        server.stop().unwrap();
    }

    #[test]
    fn test_pipelined_requests() {
        let server = start(test_config());
        let room_id = server.registry().create("10.9.9.9", 4242);

        let mut client = connect(&server);
        let mut data = encode(&InitSession::default()).to_vec();
        for _ in 0..5 {
            data.extend_from_slice(&encode(&ClientRequestRegistration { room_id }));
        }
        client.send_raw(&data).unwrap();

        let init: InitSessionResponse = client.receive().unwrap();
        assert!(init.accepted);
        for _ in 0..5 {
            let response: ClientRequestRegistrationResponse = client.receive().unwrap();
            assert_eq!(response.host(), Some(("10.9.9.9", 4242)));
        }

        server.stop().unwrap();
    }

    #[test]
    fn test_unknown_message_closes_connection() {
        let server = start(test_config());

        let mut client = connect(&server);
        client.send_raw(&[0, 0, 0, 42]).unwrap();
        assert!(client.wait_closed().unwrap());

        // Server keeps serving others
        let mut other = connect(&server);
        assert!(other.init_session().unwrap());

        server.stop().unwrap();
    }

    #[test]
    fn test_oversized_message_closes_connection() {
        let server = start(ServerConfig {
            receive_buffer_size: 6,
            ..test_config()
        });

        let mut client = connect(&server);
        client.send(&InitSession::default()).unwrap();
        assert!(client.wait_closed().unwrap());

        server.stop().unwrap();
    }

    #[test]
    fn test_version_mismatch() {
        let server = start(test_config());

        let mut client = connect(&server);
        assert!(!client.init_session_with_version(PROTOCOL_VERSION + 1).unwrap());
        assert!(client.wait_closed().unwrap());

        server.stop().unwrap();
    }

    #[test]
    fn test_uninitialized_requests_rejected() {
        let server = start(test_config());
        let game_listener = StdListener::bind("127.0.0.1:0").unwrap();
        let game_port = game_listener.local_addr().unwrap().port();

        let mut host = connect(&server);
        host.register_server(game_port).unwrap();
        assert!(host.wait_closed().unwrap());
        assert!(server.registry().is_empty());

        let mut joiner = connect(&server);
        joiner
            .send(&ClientRequestRegistration { room_id: 1 })
            .unwrap();
        assert!(joiner.wait_closed().unwrap());

        server.stop().unwrap();
    }

    #[test]
    fn test_connection_limit() {
        let server = start(ServerConfig {
            max_connections: 1,
            ..test_config()
        });

        let mut first = connect(&server);
        assert!(first.init_session().unwrap());
        wait_until(|| server.session_count() == 1);

        let mut second = connect(&server);
        assert!(second.wait_closed().unwrap());
        assert_eq!(server.session_count(), 1);

        // The admitted client is unaffected
        let response = first.request_registration(7).unwrap();
        assert_eq!(response.host(), None);

        // A slot frees up once the first client leaves
        drop(first);
        wait_until(|| server.session_count() == 0);
        let mut third = connect(&server);
        assert!(third.init_session().unwrap());

        server.stop().unwrap();
    }

    #[test]
    fn test_shutdown_releases_rooms() {
        let server = start(test_config());
        let game_listener = StdListener::bind("127.0.0.1:0").unwrap();
        let game_port = game_listener.local_addr().unwrap().port();

        let mut host = connect(&server);
        assert!(host.init_session().unwrap());
        host.register_server(game_port).unwrap();
        let _room_id = accept_room_push(&game_listener, WAIT).unwrap();

        let registry = server.registry();
        server.stop().unwrap();

        assert!(registry.is_empty());
        assert!(host.wait_closed().unwrap());
    }

    #[test]
    fn test_slow_reader_does_not_stall_server() {
        use std::io::{Read, Write};
        use std::net::TcpStream as StdStream;

        const REQUESTS: usize = 100_000;

        let server = start(test_config());
        let room_id = server.registry().create("10.7.7.7", 7777);

        let mut slow = StdStream::connect(server.local_addr()).unwrap();
        slow.set_read_timeout(Some(WAIT)).unwrap();
        let mut data = encode(&InitSession::default()).to_vec();
        let request = encode(&ClientRequestRegistration { room_id });
        for _ in 0..REQUESTS {
            data.extend_from_slice(&request);
        }
        let mut writer_side = slow.try_clone().unwrap();
        let writer = thread::spawn(move || writer_side.write_all(&data).unwrap());

        // Let responses back up while nobody reads them
        thread::sleep(Duration::from_millis(300));

        let mut other = connect(&server);
        let started = Instant::now();
        assert!(other.init_session().unwrap());
        assert_eq!(
            other.request_registration(room_id).unwrap().host(),
            Some(("10.7.7.7", 7777))
        );
        assert!(started.elapsed() < Duration::from_secs(1));

        // Every queued response still arrives
        let mut init = [0u8; 8];
        slow.read_exact(&mut init).unwrap();
        let init: InitSessionResponse = decode(&init).unwrap();
        assert!(init.accepted);

        let mut responses = vec![0u8; REQUESTS * 54];
        slow.read_exact(&mut responses).unwrap();
        let last: ClientRequestRegistrationResponse =
            decode(&responses[responses.len() - 54..]).unwrap();
        assert_eq!(last.host(), Some(("10.7.7.7", 7777)));

        writer.join().unwrap();
        assert_eq!(server.session_count(), 2);

        server.stop().unwrap();
    }

    #[test]
    fn test_bind_conflict_is_error() {
        let taken = StdListener::bind("127.0.0.1:0").unwrap();
        let result = RoomServer::bind(ServerConfig {
            port: taken.local_addr().unwrap().port(),
            ..test_config()
        });
        assert!(matches!(result, Err(RoomError::Network(_))));
    }
}
