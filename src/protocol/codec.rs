//! Codec for encoding/decoding protocol messages to/from frames
//!
//! Every payload is a fixed layout of big-endian integers and, for the
//! registration lookup response, one zero-padded address field.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::frame::{ADDRESS_FIELD_SIZE, Frame, MESSAGE_ID_SIZE, MessageId};
use super::messages::*;
use crate::error::{Result, RoomError};

/// Trait for messages that can be encoded to frames
pub trait Encodable {
    /// Get the message id for this message
    fn message_id(&self) -> MessageId;

    /// Write the payload, exactly `message_id().payload_size()` bytes
    fn encode_payload(&self, buf: &mut BytesMut);

    /// Encode the complete message, id included
    fn encode_to_bytes(&self) -> Bytes {
        let message_id = self.message_id();
        let mut buf = BytesMut::with_capacity(message_id.message_size());
        buf.put_u32(message_id as u32);
        self.encode_payload(&mut buf);
        debug_assert_eq!(buf.len(), message_id.message_size());
        buf.freeze()
    }
}

/// Trait for messages that can be decoded from frames
pub trait Decodable: Sized {
    /// Expected message id for this message
    fn expected_message_id() -> MessageId;

    /// Decode the message from a payload of the expected size
    fn decode_payload(payload: &mut &[u8]) -> Result<Self>;

    /// Decode from a complete frame, validating id and payload size
    fn decode_frame(frame: &Frame) -> Result<Self> {
        let expected = Self::expected_message_id();
        if frame.message_id != expected {
            return Err(RoomError::protocol(format!(
                "Expected message {:?}, got {:?}",
                expected, frame.message_id
            )));
        }
        if frame.payload.len() != expected.payload_size() {
            return Err(RoomError::protocol(format!(
                "{:?} payload must be {} bytes, got {}",
                expected,
                expected.payload_size(),
                frame.payload.len()
            )));
        }
        let mut payload = &frame.payload[..];
        Self::decode_payload(&mut payload)
    }
}

impl Encodable for InitSession {
    fn message_id(&self) -> MessageId {
        MessageId::InitSession
    }

    fn encode_payload(&self, buf: &mut BytesMut) {
        buf.put_u32(self.version);
    }
}

impl Decodable for InitSession {
    fn expected_message_id() -> MessageId {
        MessageId::InitSession
    }

    fn decode_payload(payload: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            version: payload.get_u32(),
        })
    }
}

impl Encodable for RegisterServer {
    fn message_id(&self) -> MessageId {
        MessageId::RegisterServer
    }

    fn encode_payload(&self, buf: &mut BytesMut) {
        buf.put_u32(u32::from(self.port));
    }
}

impl Decodable for RegisterServer {
    fn expected_message_id() -> MessageId {
        MessageId::RegisterServer
    }

    fn decode_payload(payload: &mut &[u8]) -> Result<Self> {
        let raw = payload.get_u32();
        let port = u16::try_from(raw)
            .map_err(|_| RoomError::protocol(format!("Game server port {} out of range", raw)))?;
        Ok(Self { port })
    }
}

impl Encodable for ServerGameStarted {
    fn message_id(&self) -> MessageId {
        MessageId::ServerGameStarted
    }

    fn encode_payload(&self, _buf: &mut BytesMut) {}
}

impl Decodable for ServerGameStarted {
    fn expected_message_id() -> MessageId {
        MessageId::ServerGameStarted
    }

    fn decode_payload(_payload: &mut &[u8]) -> Result<Self> {
        Ok(Self)
    }
}

impl Encodable for ClientRequestRegistration {
    fn message_id(&self) -> MessageId {
        MessageId::ClientRequestRegistration
    }

    fn encode_payload(&self, buf: &mut BytesMut) {
        buf.put_u32(self.room_id);
    }
}

impl Decodable for ClientRequestRegistration {
    fn expected_message_id() -> MessageId {
        MessageId::ClientRequestRegistration
    }

    fn decode_payload(payload: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            room_id: payload.get_u32(),
        })
    }
}

impl Encodable for InitSessionResponse {
    fn message_id(&self) -> MessageId {
        MessageId::InitSessionResponse
    }

    fn encode_payload(&self, buf: &mut BytesMut) {
        buf.put_u32(u32::from(self.accepted));
    }
}

impl Decodable for InitSessionResponse {
    fn expected_message_id() -> MessageId {
        MessageId::InitSessionResponse
    }

    fn decode_payload(payload: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            accepted: payload.get_u32() != 0,
        })
    }
}

impl Encodable for RegisterServerResponse {
    fn message_id(&self) -> MessageId {
        MessageId::RegisterServerResponse
    }

    fn encode_payload(&self, buf: &mut BytesMut) {
        buf.put_u32(self.room_id);
    }
}

impl Decodable for RegisterServerResponse {
    fn expected_message_id() -> MessageId {
        MessageId::RegisterServerResponse
    }

    fn decode_payload(payload: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            room_id: payload.get_u32(),
        })
    }
}

impl Encodable for ClientRequestRegistrationResponse {
    fn message_id(&self) -> MessageId {
        MessageId::ClientRequestRegistrationResponse
    }

    fn encode_payload(&self, buf: &mut BytesMut) {
        put_address(buf, &self.address);
        buf.put_u32(self.port);
    }
}

impl Decodable for ClientRequestRegistrationResponse {
    fn expected_message_id() -> MessageId {
        MessageId::ClientRequestRegistrationResponse
    }

    fn decode_payload(payload: &mut &[u8]) -> Result<Self> {
        let address = get_address(payload)?;
        let port = payload.get_u32();
        Ok(Self { address, port })
    }
}

/// Write `address` into a fixed-width field, truncated and zero-padded
fn put_address(buf: &mut BytesMut, address: &str) {
    let bytes = address.as_bytes();
    let len = bytes.len().min(ADDRESS_FIELD_SIZE);
    buf.put_slice(&bytes[..len]);
    buf.put_bytes(0, ADDRESS_FIELD_SIZE - len);
}

/// Read a fixed-width address field, stopping at the first zero byte
fn get_address(payload: &mut &[u8]) -> Result<String> {
    let field = &payload[..ADDRESS_FIELD_SIZE];
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let address = std::str::from_utf8(&field[..end])
        .map_err(|e| RoomError::protocol(format!("Address field is not valid text: {}", e)))?
        .to_string();
    payload.advance(ADDRESS_FIELD_SIZE);
    Ok(address)
}

/// Decode a request frame into the typed request enum
pub fn decode_request(frame: &Frame) -> Result<Request> {
    match frame.message_id {
        MessageId::InitSession => Ok(Request::InitSession(InitSession::decode_frame(frame)?)),
        MessageId::RegisterServer => {
            Ok(Request::RegisterServer(RegisterServer::decode_frame(frame)?))
        }
        MessageId::ServerGameStarted => Ok(Request::ServerGameStarted(
            ServerGameStarted::decode_frame(frame)?,
        )),
        MessageId::ClientRequestRegistration => Ok(Request::ClientRequestRegistration(
            ClientRequestRegistration::decode_frame(frame)?,
        )),
        other => Err(RoomError::protocol(format!(
            "{:?} is not a request",
            other
        ))),
    }
}

/// Split a complete encoded message into a frame
pub fn split_frame(data: &[u8]) -> Result<Frame> {
    if data.len() < MESSAGE_ID_SIZE {
        return Err(RoomError::protocol("Incomplete message id"));
    }
    let raw_id = (&data[..MESSAGE_ID_SIZE]).get_u32();
    let message_id = MessageId::from_u32(raw_id).ok_or(RoomError::UnknownMessage(raw_id))?;
    if data.len() != message_id.message_size() {
        return Err(RoomError::protocol(format!(
            "{:?} must be {} bytes, got {}",
            message_id,
            message_id.message_size(),
            data.len()
        )));
    }
    Ok(Frame::new(
        message_id,
        Bytes::copy_from_slice(&data[MESSAGE_ID_SIZE..]),
    ))
}

/// Encode a message directly to bytes (convenience function)
pub fn encode<T: Encodable>(msg: &T) -> Bytes {
    msg.encode_to_bytes()
}

/// Decode a complete encoded message to a specific type (convenience function)
pub fn decode<T: Decodable>(data: &[u8]) -> Result<T> {
    T::decode_frame(&split_frame(data)?)
}
