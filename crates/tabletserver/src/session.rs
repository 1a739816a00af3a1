use crate::errors::{Result, retry};
use crate::types::SessionId;

/// Holds the activation token for the current serving period.
///
/// A fresh token is generated every time the service starts serving, clients
/// echo it on each request. A mismatch means the client is talking to a stale
/// activation and needs to re-resolve the tablet.
#[derive(Debug, Default)]
pub struct SessionGuard {
    current: SessionId,
}

impl SessionGuard {
    /// Generate a new token, replacing the current one.
    pub fn activate(&mut self) -> SessionId {
        let previous = self.current;
        self.current = loop {
            let id = new_session_id();
            if id != previous {
                break id;
            }
        };
        self.current
    }

    pub fn clear(&mut self) {
        self.current = 0;
    }

    /// The current token, zero if not serving.
    pub fn current(&self) -> SessionId {
        self.current
    }

    pub fn validate(&self, session_id: SessionId) -> Result<()> {
        if session_id == 0 || session_id != self.current {
            return Err(retry!("Invalid session Id {session_id}"));
        }
        Ok(())
    }
}

/// Random non-zero 63-bit id.
fn new_session_id() -> SessionId {
    loop {
        let id = (rand::random::<u64>() >> 1) as SessionId;
        if id != 0 {
            return id;
        }
    }
}
