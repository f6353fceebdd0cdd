//! Room registry for the room server
//!
//! Maps randomly issued room ids to the address and port of the game host
//! that registered them. Shared by every session and safe to call from any
//! thread.

use std::collections::HashMap;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::debug;

use crate::protocol::messages::RoomId;

/// A registered game host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    /// Textual host address as observed on the registering connection
    pub address: String,
    /// Port the game server listens on
    pub port: u16,
}

impl Room {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

struct RegistryState {
    rooms: HashMap<RoomId, Room>,
    rng: Box<dyn RngCore + Send>,
}

/// Registry of all live rooms
///
/// A single lock serializes every operation; call volume is one create and
/// one remove per hosted game plus one lookup per joining client.
pub struct RoomRegistry {
    state: Mutex<RegistryState>,
}

impl RoomRegistry {
    /// Create a registry seeded from OS entropy
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Create a registry with a deterministic id sequence
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    /// Create a registry drawing room ids from `rng`
    pub fn with_rng(rng: impl RngCore + Send + 'static) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                rooms: HashMap::new(),
                rng: Box::new(rng),
            }),
        }
    }

    /// Create a room for the given host and return its id
    ///
    /// Ids are uniform over the whole u32 range and re-rolled until unused.
    pub fn create(&self, address: impl Into<String>, port: u16) -> RoomId {
        let room = Room::new(address, port);
        let mut state = self.state.lock();

        let mut room_id: RoomId = state.rng.next_u32();
        while state.rooms.contains_key(&room_id) {
            debug!("Room id {} already taken, drawing again", room_id);
            room_id = state.rng.next_u32();
        }

        debug!("Created room {} for {}:{}", room_id, room.address, room.port);
        state.rooms.insert(room_id, room);
        room_id
    }

    /// Get a room by id, None if it was never issued or already removed
    pub fn get(&self, room_id: RoomId) -> Option<Room> {
        self.state.lock().rooms.get(&room_id).cloned()
    }

    /// Remove a room, no-op for unknown ids
    pub fn remove(&self, room_id: RoomId) {
        if self.state.lock().rooms.remove(&room_id).is_some() {
            debug!("Removed room {}", room_id);
        }
    }

    /// Check if a room exists
    pub fn contains(&self, room_id: RoomId) -> bool {
        self.state.lock().rooms.contains_key(&room_id)
    }

    /// Get room count
    pub fn len(&self) -> usize {
        self.state.lock().rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}
