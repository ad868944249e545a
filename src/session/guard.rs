//! Connection intent guard.
//!
//! Single source of truth for who may drive the transport. A human-initiated
//! connect always wins: [`ConnectionIntentGuard::begin_manual_connect`] may be
//! called at any time, and every background step re-checks
//! [`ConnectionIntentGuard::is_background_allowed`] before touching the link.
//!
//! All transitions are compare-and-set on a `watch` channel, which also gives
//! observers a cheap subscription. Setting the state back to `Idle` is the
//! cooperative cancellation signal for in-flight background loops.
use log::{debug, info};
use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::watch;

use crate::transport::{DeviceId, TargetDevice};

/// Background reconnection progress (not the transport state itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionSessionState {
    Idle,
    ManualConnecting,
    Scanning,
    Connecting,
    Failed,
    Success,
}

impl ConnectionSessionState {
    /// States owned by a background reconnect loop.
    pub fn is_background(self) -> bool {
        matches!(
            self,
            ConnectionSessionState::Scanning | ConnectionSessionState::Connecting
        )
    }
}

#[derive(Debug, Default)]
struct Intent {
    manual_device: Option<DeviceId>,
    user_disconnected: bool,
}

pub struct ConnectionIntentGuard {
    state: watch::Sender<ConnectionSessionState>,
    intent: Mutex<Intent>,
}

impl ConnectionIntentGuard {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionSessionState::Idle);
        Self {
            state,
            intent: Mutex::new(Intent::default()),
        }
    }

    pub fn state(&self) -> ConnectionSessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionSessionState> {
        self.state.subscribe()
    }

    /// Claim the transport for a user-initiated connect. Always succeeds, even
    /// while a background attempt is running; that attempt notices on its next
    /// poll and stands down.
    pub fn begin_manual_connect(&self, device: &TargetDevice) {
        {
            let mut intent = self.intent.lock().unwrap_or_else(|e| e.into_inner());
            intent.manual_device = Some(device.id.clone());
            intent.user_disconnected = false;
        }
        let prev = self.state.send_replace(ConnectionSessionState::ManualConnecting);
        if prev.is_background() {
            info!(
                "Manual connect to {} preempts background reconnect ({:?})",
                device.id, prev
            );
        } else {
            debug!("Manual connect to {} (was {:?})", device.id, prev);
        }
    }

    /// Return to `Idle` after a manual attempt concludes, unless something else
    /// has claimed the state since.
    pub fn clear_manual(&self) -> bool {
        {
            let mut intent = self.intent.lock().unwrap_or_else(|e| e.into_inner());
            intent.manual_device = None;
        }
        self.transition(
            ConnectionSessionState::ManualConnecting,
            ConnectionSessionState::Idle,
        )
    }

    pub fn is_background_allowed(&self) -> bool {
        self.state() != ConnectionSessionState::ManualConnecting
    }

    /// Device of the manual attempt in flight, if any.
    pub fn manual_device(&self) -> Option<DeviceId> {
        self.intent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .manual_device
            .clone()
    }

    /// Claim `Scanning` for a new background loop. Only one loop can hold the
    /// claim; it is granted from `Idle` or `Success` only.
    pub fn try_begin_background(&self) -> bool {
        self.state.send_if_modified(|s| match *s {
            ConnectionSessionState::Idle | ConnectionSessionState::Success => {
                *s = ConnectionSessionState::Scanning;
                true
            }
            _ => false,
        })
    }

    /// Compare-and-set. Returns false (and changes nothing) when the current
    /// state is not `from`.
    pub fn transition(&self, from: ConnectionSessionState, to: ConnectionSessionState) -> bool {
        self.state.send_if_modified(|s| {
            if *s == from {
                *s = to;
                true
            } else {
                false
            }
        })
    }

    /// Force `Idle`. In-flight loops treat this as cancellation.
    pub fn reset_to_idle(&self) {
        self.state.send_replace(ConnectionSessionState::Idle);
    }

    /// Record that the user explicitly disconnected; background loops abort.
    pub fn mark_user_disconnect(&self) {
        self.intent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .user_disconnected = true;
    }

    pub fn user_disconnected(&self) -> bool {
        self.intent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .user_disconnected
    }
}

impl Default for ConnectionIntentGuard {
    fn default() -> Self {
        Self::new()
    }
}
