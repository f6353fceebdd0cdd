//! Background delivery of room ids to registered game hosts

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::Token;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::server::client_session::ClientSession;

/// Live sessions keyed by poll token, shared between the event loop and the pusher
pub type SessionSet = Arc<Mutex<HashMap<Token, ClientSession>>>;

/// Periodically asks every session to push its pending registration
pub struct RegistrationPusher {
    handle: JoinHandle<()>,
}

impl RegistrationPusher {
    /// Start the pusher thread, it runs until `shutdown` is set
    pub fn spawn(
        sessions: SessionSet,
        interval: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let handle = thread::Builder::new()
            .name("registration-pusher".to_string())
            .spawn(move || {
                debug!("Registration pusher started, interval {:?}", interval);
                while !shutdown.load(Ordering::Acquire) {
                    push_all(&sessions);
                    thread::sleep(interval);
                }
                debug!("Registration pusher stopped");
            })?;

        Ok(Self { handle })
    }

    /// Wait for the pusher thread to exit
    pub fn join(self) {
        if self.handle.join().is_err() {
            error!("Registration pusher panicked");
        }
    }
}

/// Run one delivery attempt on every live session
pub fn push_all(sessions: &SessionSet) {
    let mut sessions = sessions.lock();
    for session in sessions.values_mut() {
        session.push_registration();
    }
}
