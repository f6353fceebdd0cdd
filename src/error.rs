//! Error handling for the room server

use std::io;

use thiserror::Error;

/// Result type alias for room server operations
pub type Result<T> = std::result::Result<T, RoomError>;

/// Room server error types
#[derive(Debug, Error)]
pub enum RoomError {
    /// Socket-level failure (read, write, accept, connect, poll)
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// Malformed or unexpected bytes on the wire
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Message id not part of the protocol
    #[error("Unknown message id {0}")]
    UnknownMessage(u32),

    /// Message size larger than the receive buffer can hold
    #[error("Message id {message_id} needs {size} bytes, receive buffer holds {capacity}")]
    MessageTooLarge {
        message_id: u32,
        size: usize,
        capacity: usize,
    },

    /// Client presented an unsupported protocol version
    #[error("Unsupported protocol version {got} (expected {expected})")]
    VersionMismatch { got: u32, expected: u32 },

    /// Request received before a successful InitSession
    #[error("Session not initialized, rejecting {0}")]
    NotInitialized(&'static str),

    /// Peer closed the inbound connection
    #[error("Connection closed by peer")]
    PeerClosed,

    /// Invalid server configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection ceiling reached
    #[error("Resource limit exceeded: {0}")]
    ResourceLimit(String),
}

impl RoomError {
    /// Get error code for this error type
    pub fn code(&self) -> u32 {
        match self {
            RoomError::Network(_) => 1000,
            RoomError::Protocol(_) => 1003,
            RoomError::UnknownMessage(_) => 1004,
            RoomError::MessageTooLarge { .. } => 1005,
            RoomError::VersionMismatch { .. } => 1006,
            RoomError::NotInitialized(_) => 1008,
            RoomError::PeerClosed => 1009,
            RoomError::Config(_) => 1010,
            RoomError::ResourceLimit(_) => 1012,
        }
    }

    /// True for errors caused by the peer misbehaving rather than by local I/O
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            RoomError::Protocol(_)
                | RoomError::UnknownMessage(_)
                | RoomError::MessageTooLarge { .. }
                | RoomError::VersionMismatch { .. }
                | RoomError::NotInitialized(_)
        )
    }

    /// Create a protocol error
    pub fn protocol<T: Into<String>>(msg: T) -> Self {
        RoomError::Protocol(msg.into())
    }

    /// Create a configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        RoomError::Config(msg.into())
    }

    /// Create a resource limit error
    pub fn resource_limit<T: Into<String>>(msg: T) -> Self {
        RoomError::ResourceLimit(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_violation_classification() {
        assert!(RoomError::UnknownMessage(7).is_protocol_violation());
        assert!(RoomError::NotInitialized("RegisterServer").is_protocol_violation());
        assert!(
            RoomError::VersionMismatch {
                got: 1,
                expected: 2
            }
            .is_protocol_violation()
        );
        assert!(!RoomError::PeerClosed.is_protocol_violation());
        assert!(!RoomError::from(io::Error::from(io::ErrorKind::BrokenPipe)).is_protocol_violation());
    }

    #[test]
    fn test_error_display() {
        let err = RoomError::MessageTooLarge {
            message_id: 1,
            size: 8,
            capacity: 6,
        };
        assert_eq!(
            err.to_string(),
            "Message id 1 needs 8 bytes, receive buffer holds 6"
        );
        assert_eq!(err.code(), 1005);
    }
}
