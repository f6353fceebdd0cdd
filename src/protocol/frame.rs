//! Fixed-size binary frames keyed by message id
//!
//! Frame format:
//! ```text
//! +----------------------+---------------------------+
//! | message id           | payload                   |
//! | (4 bytes, BE)        | (size fixed per id)       |
//! +----------------------+---------------------------+
//! ```
//!
//! There is no length field on the wire. The total size of every message is
//! implied by its id, see [`MessageId::message_size`].

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Result, RoomError};

/// Size of the message id that prefixes every message
pub const MESSAGE_ID_SIZE: usize = 4;

/// Default capacity of a session's receive buffer
pub const RECEIVE_BUFFER_SIZE: usize = 100;

/// Width of the zero-padded textual address field (INET6_ADDRSTRLEN)
pub const ADDRESS_FIELD_SIZE: usize = 46;

/// Message ids understood by the room server
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    // Client -> server requests
    InitSession = 0,
    RegisterServer = 1,
    ServerGameStarted = 2,
    ClientRequestRegistration = 3,

    // Server -> client responses
    InitSessionResponse = 100,
    RegisterServerResponse = 101,
    ClientRequestRegistrationResponse = 103,
}

impl MessageId {
    /// Convert from the wire value, returns None for unknown ids
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(MessageId::InitSession),
            1 => Some(MessageId::RegisterServer),
            2 => Some(MessageId::ServerGameStarted),
            3 => Some(MessageId::ClientRequestRegistration),

            100 => Some(MessageId::InitSessionResponse),
            101 => Some(MessageId::RegisterServerResponse),
            103 => Some(MessageId::ClientRequestRegistrationResponse),
            _ => None,
        }
    }

    /// Look up a request id, the only ids a client may send to the server
    pub fn request_from_u32(value: u32) -> Option<Self> {
        Self::from_u32(value).filter(|id| id.is_request())
    }

    /// Check if this message travels from client to server
    pub fn is_request(&self) -> bool {
        (*self as u32) < 100
    }

    /// Total encoded size of the message including the id
    pub const fn message_size(&self) -> usize {
        match self {
            MessageId::InitSession => 8,
            MessageId::RegisterServer => 8,
            MessageId::ServerGameStarted => 4,
            MessageId::ClientRequestRegistration => 8,

            MessageId::InitSessionResponse => 8,
            MessageId::RegisterServerResponse => 8,
            MessageId::ClientRequestRegistrationResponse => {
                MESSAGE_ID_SIZE + ADDRESS_FIELD_SIZE + 4
            }
        }
    }

    /// Size of the payload that follows the id
    pub const fn payload_size(&self) -> usize {
        self.message_size() - MESSAGE_ID_SIZE
    }
}

/// A single complete message with the id already split off
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_id: MessageId,
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame with the given id and payload
    pub fn new(message_id: MessageId, payload: impl Into<Bytes>) -> Self {
        Self {
            message_id,
            payload: payload.into(),
        }
    }
}

/// Reassembles request frames from a byte stream into a bounded buffer
///
/// Bytes belonging to a following message stay at the front of the buffer
/// after a frame is taken, so several requests written back to back are all
/// decoded in order.
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: BytesMut,
    capacity: usize,
    expected_size: Option<usize>,
}

impl FrameAssembler {
    /// Create an assembler holding at most `capacity` buffered bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            capacity,
            expected_size: None,
        }
    }

    /// Number of bytes currently buffered
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Number of bytes that can still be fed before the buffer is full
    pub fn spare_capacity(&self) -> usize {
        self.capacity - self.buffer.len()
    }

    /// Size of the message at the front of the buffer, once its id is known
    pub fn expected_size(&self) -> Option<usize> {
        self.expected_size
    }

    /// Feed received bytes, never more than [`Self::spare_capacity`]
    pub fn feed(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.spare_capacity() {
            return Err(RoomError::protocol(format!(
                "Receive buffer overflow: {} bytes fed, {} free",
                data.len(),
                self.spare_capacity()
            )));
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// Try to take the next complete frame
    /// Returns Ok(None) if more data is needed
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.buffer.len() < MESSAGE_ID_SIZE {
            self.expected_size = None;
            return Ok(None);
        }

        let raw_id = (&self.buffer[..MESSAGE_ID_SIZE]).get_u32();
        let message_id =
            MessageId::request_from_u32(raw_id).ok_or(RoomError::UnknownMessage(raw_id))?;

        let size = message_id.message_size();
        if size > self.capacity {
            return Err(RoomError::MessageTooLarge {
                message_id: raw_id,
                size,
                capacity: self.capacity,
            });
        }
        self.expected_size = Some(size);

        if self.buffer.len() < size {
            return Ok(None);
        }

        let mut message = self.buffer.split_to(size);
        message.advance(MESSAGE_ID_SIZE);
        self.expected_size = None;

        Ok(Some(Frame::new(message_id, message.freeze())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn request(id: u32, value: Option<u32>) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u32(id);
        if let Some(value) = value {
            buf.put_u32(value);
        }
        buf
    }

    #[test]
    fn test_message_sizes() {
        assert_eq!(MessageId::InitSession.message_size(), 8);
        assert_eq!(MessageId::RegisterServer.message_size(), 8);
        assert_eq!(MessageId::ServerGameStarted.message_size(), 4);
        assert_eq!(MessageId::ClientRequestRegistration.message_size(), 8);
        assert_eq!(MessageId::InitSessionResponse.message_size(), 8);
        assert_eq!(MessageId::RegisterServerResponse.message_size(), 8);
        assert_eq!(MessageId::ClientRequestRegistrationResponse.message_size(), 54);
        assert_eq!(MessageId::ServerGameStarted.payload_size(), 0);
    }

    #[test]
    fn test_request_ids() {
        assert_eq!(MessageId::request_from_u32(1), Some(MessageId::RegisterServer));
        assert_eq!(MessageId::from_u32(101), Some(MessageId::RegisterServerResponse));
        assert_eq!(MessageId::request_from_u32(101), None);
        assert_eq!(MessageId::from_u32(4), None);
        assert!(!MessageId::InitSessionResponse.is_request());
    }

    #[test]
    fn test_assembler_waits_for_full_message() {
        let mut assembler = FrameAssembler::with_capacity(RECEIVE_BUFFER_SIZE);
        let data = request(0, Some(2));

        assembler.feed(&data[..3]).unwrap();
        assert!(assembler.next_frame().unwrap().is_none());
        assert_eq!(assembler.expected_size(), None);

        assembler.feed(&data[3..6]).unwrap();
        assert!(assembler.next_frame().unwrap().is_none());
        assert_eq!(assembler.expected_size(), Some(8));

        assembler.feed(&data[6..]).unwrap();
        let frame = assembler.next_frame().unwrap().unwrap();
        assert_eq!(frame.message_id, MessageId::InitSession);
        assert_eq!(&frame.payload[..], &[0, 0, 0, 2]);
        assert_eq!(assembler.buffered_len(), 0);
    }

    #[test]
    fn test_assembler_keeps_pipelined_tail() {
        let mut assembler = FrameAssembler::with_capacity(RECEIVE_BUFFER_SIZE);
        let mut data = request(0, Some(2));
        data.extend(request(2, None));
        data.extend(request(3, Some(0xDEAD_BEEF)));

        // Last message arrives split
        assembler.feed(&data[..18]).unwrap();

        let first = assembler.next_frame().unwrap().unwrap();
        assert_eq!(first.message_id, MessageId::InitSession);
        let second = assembler.next_frame().unwrap().unwrap();
        assert_eq!(second.message_id, MessageId::ServerGameStarted);
        assert!(second.payload.is_empty());
        assert!(assembler.next_frame().unwrap().is_none());
        assert_eq!(assembler.buffered_len(), 6);

        assembler.feed(&data[18..]).unwrap();
        let third = assembler.next_frame().unwrap().unwrap();
        assert_eq!(third.message_id, MessageId::ClientRequestRegistration);
        assert_eq!(&third.payload[..], &0xDEAD_BEEFu32.to_be_bytes());
    }

    #[test]
    fn test_unknown_id_rejected() {
        let mut assembler = FrameAssembler::with_capacity(RECEIVE_BUFFER_SIZE);
        assembler.feed(&request(42, None)).unwrap();
        assert!(matches!(
            assembler.next_frame(),
            Err(RoomError::UnknownMessage(42))
        ));
    }

    #[test]
    fn test_response_id_rejected_as_request() {
        let mut assembler = FrameAssembler::with_capacity(RECEIVE_BUFFER_SIZE);
        assembler.feed(&request(100, Some(1))).unwrap();
        assert!(matches!(
            assembler.next_frame(),
            Err(RoomError::UnknownMessage(100))
        ));
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut assembler = FrameAssembler::with_capacity(6);
        assembler.feed(&request(1, None)).unwrap();
        assert!(matches!(
            assembler.next_frame(),
            Err(RoomError::MessageTooLarge {
                message_id: 1,
                size: 8,
                capacity: 6
            })
        ));
    }

    #[test]
    fn test_feed_past_capacity_rejected() {
        let mut assembler = FrameAssembler::with_capacity(6);
        assert!(assembler.feed(&[0u8; 7]).is_err());
        assembler.feed(&[0u8; 6]).unwrap();
        assert_eq!(assembler.spare_capacity(), 0);
    }
}
