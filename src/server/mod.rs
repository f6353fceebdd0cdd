//! Room server implementation
//!
//! ## Threads
//!
//! - **Event loop** (`room-server`): accepts connections and drains readable sessions
//! - **Registration pusher** (`registration-pusher`): delivers room ids to game hosts
//!
//! Both share the session set behind one lock. The room registry has its own.

pub mod client_session;
pub mod pusher;
pub mod room_manager;
pub mod room_server;

pub use client_session::{ClientSession, CloseReason, PushState, SessionStatus};
pub use pusher::{RegistrationPusher, SessionSet};
pub use room_manager::{Room, RoomRegistry};
pub use room_server::{DEFAULT_PORT, RoomServer, ServerConfig, ServerHandle, ShutdownHandle};
