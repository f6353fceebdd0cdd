//! Netplay room server
//!
//! A rendezvous service for peer-to-peer games. A game host registers the
//! port its game server listens on and is handed a random room id, pushed to
//! that port over a fresh connection. Joining players trade the room id for
//! the host's address and port.
//!
//! The wire protocol is fixed-size big-endian messages over TCP, see
//! [`protocol`].

pub mod client;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod server;

pub use client::{RoomClient, accept_room_push};
pub use error::{Result, RoomError};
pub use server::{RoomRegistry, RoomServer, ServerConfig, ServerHandle, ShutdownHandle};
