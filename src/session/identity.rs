//! Session identity: one [`SessionId`] per completed handshake.
//!
//! Ids are never reused, even across different radios, so comparing two ids
//! tells whether anything reconnected in between. The device id carried by the
//! [`SessionHandle`] tells whether it was the same radio.
use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

use crate::transport::DeviceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SessionId(u64);

impl SessionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// A live session episode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub id: SessionId,
    pub device: DeviceId,
    pub started_at: DateTime<Utc>,
}

/// Mints session ids and tracks the current episode.
pub struct SessionIdentity {
    next: AtomicU64,
    current: watch::Sender<Option<SessionHandle>>,
}

impl SessionIdentity {
    pub fn new() -> Self {
        let (current, _) = watch::channel(None);
        Self {
            next: AtomicU64::new(1),
            current,
        }
    }

    /// Start a new episode for `device`. Call once per successful handshake.
    pub fn mint(&self, device: &DeviceId) -> SessionHandle {
        let id = SessionId(self.next.fetch_add(1, Ordering::SeqCst));
        let handle = SessionHandle {
            id,
            device: device.clone(),
            started_at: Utc::now(),
        };
        debug!("Session {} started for {}", id, device);
        self.current.send_replace(Some(handle.clone()));
        handle
    }

    /// End the current episode (link dropped). The id is retired, not reused.
    pub fn end(&self) -> Option<SessionHandle> {
        let ended = self.current.send_replace(None);
        if let Some(ref h) = ended {
            debug!("Session {} ended for {}", h.id, h.device);
        }
        ended
    }

    pub fn current(&self) -> Option<SessionHandle> {
        self.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<SessionHandle>> {
        self.current.subscribe()
    }
}

impl Default for SessionIdentity {
    fn default() -> Self {
        Self::new()
    }
}
