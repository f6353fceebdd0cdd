//! Blocking room server client
//!
//! Speaks the same fixed-size framing as the server over a plain std socket.
//! Used by the demo subcommand and by the end-to-end tests.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{Result, RoomError};
use crate::protocol::codec::{Decodable, Encodable, decode};
use crate::protocol::frame::{MESSAGE_ID_SIZE, MessageId};
use crate::protocol::messages::*;

/// Blocking client for one room server connection
pub struct RoomClient {
    stream: TcpStream,
    timeout: Duration,
}

impl RoomClient {
    /// Connect to a room server
    pub fn connect(addr: impl ToSocketAddrs, timeout: Duration) -> Result<Self> {
        let mut last_err = None;
        for addr in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(timeout))?;
                    stream.set_write_timeout(Some(timeout))?;
                    stream.set_nodelay(true)?;
                    debug!("Connected to room server at {}", addr);
                    return Ok(Self { stream, timeout });
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| ErrorKind::AddrNotAvailable.into())
            .into())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    /// Open the session with the current protocol version
    pub fn init_session(&mut self) -> Result<bool> {
        self.init_session_with_version(PROTOCOL_VERSION)
    }

    /// Open the session announcing `version`, returns whether it was accepted
    pub fn init_session_with_version(&mut self, version: u32) -> Result<bool> {
        self.send(&InitSession { version })?;
        let response: InitSessionResponse = self.receive()?;
        Ok(response.accepted)
    }

    /// Register a game server listening on `port`
    ///
    /// No reply comes back on this connection. The room id is pushed to the
    /// game port instead, see [`accept_room_push`].
    pub fn register_server(&mut self, port: u16) -> Result<()> {
        self.send(&RegisterServer { port })
    }

    /// Tell the server the hosted game started, the server then closes the session
    pub fn game_started(&mut self) -> Result<()> {
        self.send(&ServerGameStarted)
    }

    /// Look up the game host behind a room id
    pub fn request_registration(
        &mut self,
        room_id: RoomId,
    ) -> Result<ClientRequestRegistrationResponse> {
        self.send(&ClientRequestRegistration { room_id })?;
        self.receive()
    }

    pub fn send<T: Encodable>(&mut self, msg: &T) -> Result<()> {
        self.send_raw(&msg.encode_to_bytes())
    }

    /// Write raw bytes, framing is up to the caller
    pub fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Read one response of type `T`
    pub fn receive<T: Decodable>(&mut self) -> Result<T> {
        let mut header = [0u8; MESSAGE_ID_SIZE];
        self.read_exact(&mut header)?;

        let raw_id = u32::from_be_bytes(header);
        let message_id = MessageId::from_u32(raw_id).ok_or(RoomError::UnknownMessage(raw_id))?;

        let mut data = vec![0u8; message_id.message_size()];
        data[..MESSAGE_ID_SIZE].copy_from_slice(&header);
        self.read_exact(&mut data[MESSAGE_ID_SIZE..])?;

        decode(&data)
    }

    /// Wait until the server closes this connection
    ///
    /// Unread response bytes are discarded. Returns false if the connection
    /// is still open after the client timeout.
    pub fn wait_closed(&mut self) -> Result<bool> {
        let deadline = Instant::now() + self.timeout;
        let mut scratch = [0u8; 256];

        while Instant::now() < deadline {
            match self.stream.read(&mut scratch) {
                Ok(0) => return Ok(true),
                Ok(_) => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::ConnectionReset
                            | ErrorKind::ConnectionAborted
                            | ErrorKind::BrokenPipe
                    ) =>
                {
                    return Ok(true);
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(false)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream.read_exact(buf).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset => RoomError::PeerClosed,
            _ => RoomError::Network(e),
        })
    }
}

/// Accept the room server's push on a game listener and return the room id
pub fn accept_room_push(listener: &TcpListener, timeout: Duration) -> Result<RoomId> {
    listener.set_nonblocking(true)?;
    let deadline = Instant::now() + timeout;

    let (mut stream, peer) = loop {
        match listener.accept() {
            Ok(accepted) => break accepted,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    listener.set_nonblocking(false)?;
                    return Err(RoomError::Network(ErrorKind::TimedOut.into()));
                }
                thread::sleep(Duration::from_millis(5));
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                listener.set_nonblocking(false)?;
                return Err(e.into());
            }
        }
    };
    listener.set_nonblocking(false)?;

    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(timeout))?;

    let mut data = [0u8; MessageId::RegisterServerResponse.message_size()];
    stream.read_exact(&mut data).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => RoomError::PeerClosed,
        _ => RoomError::Network(e),
    })?;

    let response: RegisterServerResponse = decode(&data)?;
    info!("Room {} pushed by {}", response.room_id, peer);
    Ok(response.room_id)
}
