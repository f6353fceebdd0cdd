//! Protocol layer for the room server
//!
//! This module provides:
//! - Message ids and the fixed per-id size table
//! - Stream reassembly into frames
//! - Typed messages and their big-endian codecs

pub mod codec;
pub mod frame;
pub mod messages;

// Re-export commonly used types
pub use codec::{Decodable, Encodable, decode, decode_request, encode, split_frame};
pub use frame::{
    ADDRESS_FIELD_SIZE, Frame, FrameAssembler, MESSAGE_ID_SIZE, MessageId, RECEIVE_BUFFER_SIZE,
};
pub use messages::*;
