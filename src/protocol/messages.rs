//! Protocol message types for the room server
//!
//! Every message has a fixed size. Integers are big-endian.

/// Randomly issued room identifier
pub type RoomId = u32;

/// Protocol version the server accepts in InitSession
pub const PROTOCOL_VERSION: u32 = 2;

/// Port value sent back when a requested room does not exist
pub const ROOM_NOT_FOUND_PORT: u32 = u32::MAX;

// =============================================================================
// Requests (client -> server)
// =============================================================================

/// Version handshake, must precede every other request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitSession {
    pub version: u32,
}

impl Default for InitSession {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
        }
    }
}

/// A game host announces the port its game server listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterServer {
    pub port: u16,
}

/// The game host has started its game, ending the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerGameStarted;

/// A joining client asks for the host behind a room id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientRequestRegistration {
    pub room_id: RoomId,
}

/// Any request the server dispatches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    InitSession(InitSession),
    RegisterServer(RegisterServer),
    ServerGameStarted(ServerGameStarted),
    ClientRequestRegistration(ClientRequestRegistration),
}

impl Request {
    /// Name used in logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Request::InitSession(_) => "InitSession",
            Request::RegisterServer(_) => "RegisterServer",
            Request::ServerGameStarted(_) => "ServerGameStarted",
            Request::ClientRequestRegistration(_) => "ClientRequestRegistration",
        }
    }
}

// =============================================================================
// Responses (server -> client)
// =============================================================================

/// Answer to InitSession
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitSessionResponse {
    pub accepted: bool,
}

/// Room id pushed to a registered game host over the secondary connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterServerResponse {
    pub room_id: RoomId,
}

/// Host address and port for a requested room
///
/// A missing room is sent as an empty address with [`ROOM_NOT_FOUND_PORT`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequestRegistrationResponse {
    pub address: String,
    pub port: u32,
}

impl ClientRequestRegistrationResponse {
    pub fn found(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port: u32::from(port),
        }
    }

    pub fn not_found() -> Self {
        Self {
            address: String::new(),
            port: ROOM_NOT_FOUND_PORT,
        }
    }

    /// The host address and port, or None when the room was not found
    pub fn host(&self) -> Option<(&str, u16)> {
        if self.address.is_empty() {
            return None;
        }
        u16::try_from(self.port)
            .ok()
            .map(|port| (self.address.as_str(), port))
    }
}
