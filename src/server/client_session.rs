//! Per-connection protocol state machine
//!
//! A session owns one accepted socket. It reassembles requests from whatever
//! the socket delivers, dispatches them one at a time in arrival order, and,
//! for a game host that registered, owns the secondary outbound socket over
//! which the assigned room id is pushed.
//!
//! Responses that do not fit in the socket's send buffer are queued and
//! flushed when the socket reports writable. While too much output is queued
//! the session stops reading requests, so a client that is slow to read is
//! throttled instead of dropped.

use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::{debug, error, info, warn};

use crate::error::{Result, RoomError};
use crate::protocol::codec::{Encodable, decode_request};
use crate::protocol::frame::{Frame, FrameAssembler};
use crate::protocol::messages::*;
use crate::server::room_manager::RoomRegistry;

/// Queued response bytes above which the session stops reading requests
pub const OUTPUT_HIGH_WATER: usize = 16 * 1024;

/// Result of processing readiness on a session
#[derive(Debug)]
pub enum SessionStatus {
    /// Socket drained, session stays open
    Open,
    /// Session must be torn down
    Closed(CloseReason),
}

impl SessionStatus {
    pub fn is_closed(&self) -> bool {
        matches!(self, SessionStatus::Closed(_))
    }
}

/// Why a session asked to be closed
#[derive(Debug)]
pub enum CloseReason {
    /// Zero-length read
    PeerClosed,
    /// Game host reported its game started
    GameStarted,
    /// Protocol violation or socket failure
    Failed(RoomError),
}

/// Delivery state of the room id push over the secondary socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
    /// Session never registered a game server
    NoSecondary,
    /// Outbound connect still in progress
    Connecting,
    /// Connected, payload not fully sent
    PushPending,
    /// Payload fully sent
    PushComplete,
    /// Connect or send failed, no further attempts
    Abandoned,
}

/// Fixed payload written over as many attempts as the socket needs
#[derive(Debug)]
struct PushPayload {
    bytes: Bytes,
    sent: usize,
}

impl PushPayload {
    fn new(bytes: Bytes) -> Self {
        Self { bytes, sent: 0 }
    }

    fn is_complete(&self) -> bool {
        self.sent == self.bytes.len()
    }

    /// Make one write of the unsent tail, true once everything went out
    fn write_to<W: Write>(&mut self, writer: &mut W) -> io::Result<bool> {
        if self.is_complete() {
            return Ok(true);
        }
        match writer.write(&self.bytes[self.sent..]) {
            Ok(0) => Err(ErrorKind::WriteZero.into()),
            Ok(n) => {
                self.sent += n;
                Ok(self.is_complete())
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

/// Pending push of a RegisterServerResponse to a game host
#[derive(Debug)]
struct RegistrationPush {
    stream: Option<TcpStream>,
    target: SocketAddr,
    payload: PushPayload,
    state: PushState,
}

impl RegistrationPush {
    fn new(stream: TcpStream, target: SocketAddr, room_id: RoomId) -> Self {
        Self {
            stream: Some(stream),
            target,
            payload: PushPayload::new(RegisterServerResponse { room_id }.encode_to_bytes()),
            state: PushState::Connecting,
        }
    }

    /// Make one non-blocking delivery attempt
    fn attempt(&mut self, token: Token) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };

        if self.state == PushState::Connecting {
            match stream.take_error() {
                Ok(None) => {}
                Ok(Some(err)) | Err(err) => {
                    self.abandon(token, err);
                    return;
                }
            }
            match stream.peer_addr() {
                Ok(_) => {
                    debug!("Secondary connection to {} established for {:?}", self.target, token);
                    self.state = PushState::PushPending;
                }
                Err(err) if err.kind() == ErrorKind::NotConnected => return,
                Err(err) => {
                    self.abandon(token, err);
                    return;
                }
            }
        }

        if self.state != PushState::PushPending {
            return;
        }

        match self.payload.write_to(stream) {
            Ok(true) => {
                info!("Pushed room registration to {} for {:?}", self.target, token);
                self.state = PushState::PushComplete;
            }
            Ok(false) => debug!(
                "Room registration push to {} at {}/{} bytes",
                self.target,
                self.payload.sent,
                self.payload.bytes.len()
            ),
            Err(err) => self.abandon(token, err),
        }
    }

    fn abandon(&mut self, token: Token, err: io::Error) {
        warn!(
            "Giving up room registration push to {} for {:?}: {}",
            self.target, token, err
        );
        self.stream = None;
        self.state = PushState::Abandoned;
    }
}

/// Flow control returned by request handlers
enum Flow {
    Continue,
    Close(CloseReason),
}

/// Server-side state for one accepted client connection
pub struct ClientSession {
    token: Token,
    stream: TcpStream,
    interest: Interest,
    registry: Arc<RoomRegistry>,
    assembler: FrameAssembler,
    read_buf: Box<[u8]>,
    send_buf: BytesMut,
    bytes_received: u64,
    initialized: bool,
    room_id: Option<RoomId>,
    push: Option<RegistrationPush>,
}

impl ClientSession {
    /// Create a session for an accepted, non-blocking socket
    ///
    /// The socket is expected to be registered for readable interest only.
    pub fn new(
        token: Token,
        stream: TcpStream,
        registry: Arc<RoomRegistry>,
        receive_buffer_size: usize,
    ) -> Self {
        Self {
            token,
            stream,
            interest: Interest::READABLE,
            registry,
            assembler: FrameAssembler::with_capacity(receive_buffer_size),
            read_buf: vec![0u8; receive_buffer_size].into_boxed_slice(),
            send_buf: BytesMut::new(),
            bytes_received: 0,
            initialized: false,
            room_id: None,
            push: None,
        }
    }

    /// Inbound socket, for registering with the poller
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// True once a matching InitSession has been handled
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Room this session registered, if any
    pub fn room_id(&self) -> Option<RoomId> {
        self.room_id
    }

    /// Total bytes read from the inbound socket
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Bytes of a partially received message waiting for the rest
    pub fn buffered_len(&self) -> usize {
        self.assembler.buffered_len()
    }

    /// Response bytes queued until the socket accepts them
    pub fn pending_output(&self) -> usize {
        self.send_buf.len()
    }

    pub fn push_state(&self) -> PushState {
        self.push
            .as_ref()
            .map(|push| push.state)
            .unwrap_or(PushState::NoSecondary)
    }

    /// Flush queued output, then read and dispatch everything the socket has
    ///
    /// Returns once a read would block, once queued output passes
    /// [`OUTPUT_HIGH_WATER`], or as soon as the session must close.
    pub fn process_stream(&mut self) -> SessionStatus {
        if let Err(e) = self.flush_output() {
            return self.fail(e);
        }

        loop {
            if self.send_buf.len() >= OUTPUT_HIGH_WATER {
                debug!(
                    "{:?} has {} response bytes queued, pausing reads",
                    self.token,
                    self.send_buf.len()
                );
                return SessionStatus::Open;
            }

            let spare = self.assembler.spare_capacity();
            if spare == 0 {
                return SessionStatus::Closed(CloseReason::Failed(RoomError::protocol(
                    "Receive buffer full without a complete message",
                )));
            }

            match self.stream.read(&mut self.read_buf[..spare]) {
                Ok(0) => {
                    info!("Connection closed by peer on {:?}", self.token);
                    return SessionStatus::Closed(CloseReason::PeerClosed);
                }
                Ok(n) => {
                    self.bytes_received += n as u64;
                    if let Err(e) = self.assembler.feed(&self.read_buf[..n]) {
                        return self.fail(e);
                    }
                    if let Some(reason) = self.dispatch_buffered() {
                        return SessionStatus::Closed(reason);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return SessionStatus::Open,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("recv failed on {:?}: {}", self.token, e);
                    return SessionStatus::Closed(CloseReason::Failed(e.into()));
                }
            }
        }
    }

    /// Match the poller registration to the queued output
    ///
    /// Writable interest is held exactly while responses are queued.
    pub fn sync_interest(&mut self, registry: &Registry) -> io::Result<()> {
        let wanted = if self.send_buf.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        if wanted != self.interest {
            registry.reregister(&mut self.stream, self.token, wanted)?;
            self.interest = wanted;
        }
        Ok(())
    }

    /// Attempt to deliver the pending room id push, if any
    ///
    /// Called periodically by the registration pusher.
    pub fn push_registration(&mut self) {
        if let Some(push) = self.push.as_mut() {
            push.attempt(self.token);
        }
    }

    /// Dispatch every complete message in the buffer
    fn dispatch_buffered(&mut self) -> Option<CloseReason> {
        loop {
            match self.assembler.next_frame() {
                Ok(Some(frame)) => match self.dispatch(frame) {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Close(reason)) => return Some(reason),
                    Err(e) => return Some(self.log_failure(e)),
                },
                Ok(None) => return None,
                Err(e) => return Some(self.log_failure(e)),
            }
        }
    }

    fn fail(&self, err: RoomError) -> SessionStatus {
        SessionStatus::Closed(self.log_failure(err))
    }

    fn log_failure(&self, err: RoomError) -> CloseReason {
        if err.is_protocol_violation() {
            warn!("Protocol violation on {:?} (code {}): {}", self.token, err.code(), err);
        } else {
            error!("Session {:?} failed (code {}): {}", self.token, err.code(), err);
        }
        CloseReason::Failed(err)
    }

    fn dispatch(&mut self, frame: Frame) -> Result<Flow> {
        let request = decode_request(&frame)?;
        debug!("Received {} on {:?}", request.name(), self.token);

        if !self.initialized && !matches!(request, Request::InitSession(_)) {
            return Err(RoomError::NotInitialized(request.name()));
        }

        match request {
            Request::InitSession(msg) => self.handle_init_session(msg),
            Request::RegisterServer(msg) => self.handle_register_server(msg),
            Request::ServerGameStarted(_) => self.handle_server_game_started(),
            Request::ClientRequestRegistration(msg) => {
                self.handle_client_request_registration(msg)
            }
        }
    }

    fn handle_init_session(&mut self, msg: InitSession) -> Result<Flow> {
        let accepted = msg.version == PROTOCOL_VERSION;
        self.initialized = accepted;

        self.send_response(&InitSessionResponse { accepted })?;

        if !accepted {
            return Err(RoomError::VersionMismatch {
                got: msg.version,
                expected: PROTOCOL_VERSION,
            });
        }

        debug!("Session {:?} initialized", self.token);
        Ok(Flow::Continue)
    }

    fn handle_register_server(&mut self, msg: RegisterServer) -> Result<Flow> {
        let peer = self.stream.peer_addr()?;
        let address = peer.ip().to_string();

        // A host registering twice replaces its previous room
        if let Some(previous) = self.room_id.take() {
            self.registry.remove(previous);
            self.push = None;
        }

        let room_id = self.registry.create(address.clone(), msg.port);
        self.room_id = Some(room_id);
        info!(
            "Registered room {} for {}:{} on {:?}",
            room_id, address, msg.port, self.token
        );

        let target = SocketAddr::new(peer.ip(), msg.port);
        let stream = TcpStream::connect(target)?;
        self.push = Some(RegistrationPush::new(stream, target, room_id));

        Ok(Flow::Continue)
    }

    fn handle_server_game_started(&mut self) -> Result<Flow> {
        if let Some(room_id) = self.room_id.take() {
            self.registry.remove(room_id);
            info!("Game started in room {}, closing {:?}", room_id, self.token);
        }
        Ok(Flow::Close(CloseReason::GameStarted))
    }

    fn handle_client_request_registration(
        &mut self,
        msg: ClientRequestRegistration,
    ) -> Result<Flow> {
        let response = match self.registry.get(msg.room_id) {
            Some(room) => ClientRequestRegistrationResponse::found(room.address, room.port),
            None => {
                debug!("Room {} not found for {:?}", msg.room_id, self.token);
                ClientRequestRegistrationResponse::not_found()
            }
        };

        self.send_response(&response)?;
        Ok(Flow::Continue)
    }

    /// Queue a response and write as much queued output as the socket takes
    fn send_response<T: Encodable>(&mut self, msg: &T) -> Result<()> {
        self.send_buf.extend_from_slice(&msg.encode_to_bytes());
        self.flush_output()
    }

    /// Write queued output until it is empty or the socket would block
    fn flush_output(&mut self) -> Result<()> {
        while !self.send_buf.is_empty() {
            match self.stream.write(&self.send_buf) {
                Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero).into()),
                Ok(n) => self.send_buf.advance(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    debug!(
                        "{:?} send buffer full, {} bytes queued",
                        self.token,
                        self.send_buf.len()
                    );
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if let Some(room_id) = self.room_id.take() {
            self.registry.remove(room_id);
            debug!("Room {} released by {:?}", room_id, self.token);
        }
    }
}
