//! Pairing validity for the currently paired radio.
use log::{debug, warn};
use serde::Serialize;
use std::sync::Mutex;

use crate::transport::{DeviceId, LinkEvent, LinkState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DevicePairingState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// Terminal: the radio dropped our bond. Only a fresh pairing clears it.
    Invalidated,
}

#[derive(Debug)]
struct Pairing {
    device: Option<DeviceId>,
    state: DevicePairingState,
}

/// Tracks [`DevicePairingState`] for one paired device, fed by transport events.
pub struct PairingTracker {
    inner: Mutex<Pairing>,
}

impl PairingTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Pairing {
                device: None,
                state: DevicePairingState::Disconnected,
            }),
        }
    }

    /// Start tracking `device`. A new pairing clears a previous invalidation.
    pub fn pair(&self, device: &DeviceId) {
        let mut p = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if p.device.as_ref() != Some(device) || p.state == DevicePairingState::Invalidated {
            p.state = DevicePairingState::Disconnected;
        }
        p.device = Some(device.clone());
    }

    pub fn forget(&self) {
        let mut p = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        p.device = None;
        p.state = DevicePairingState::Disconnected;
    }

    pub fn device(&self) -> Option<DeviceId> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .device
            .clone()
    }

    pub fn state(&self) -> DevicePairingState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    pub fn is_invalidated(&self) -> bool {
        self.state() == DevicePairingState::Invalidated
    }

    /// User asked to disconnect; the next `Disconnected` event completes it.
    pub fn begin_disconnect(&self) {
        let mut p = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(
            p.state,
            DevicePairingState::Connected | DevicePairingState::Connecting
        ) {
            p.state = DevicePairingState::Disconnecting;
        }
    }

    /// Fold a transport event into the pairing state. Events for other devices
    /// are ignored; `Invalidated` is sticky. Returns the new state when it changed.
    pub fn apply(&self, event: &LinkEvent) -> Option<DevicePairingState> {
        let mut p = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if p.state == DevicePairingState::Invalidated {
            return None;
        }
        let next = match event {
            LinkEvent::PairingInvalidated { device } => {
                if p.device.as_ref() != Some(device) {
                    return None;
                }
                warn!("Pairing with {} invalidated by the radio; re-pair required", device);
                DevicePairingState::Invalidated
            }
            LinkEvent::StateChanged { state, device } => {
                // A disconnect may arrive without a device id.
                if let (Some(ours), Some(theirs)) = (p.device.as_ref(), device.as_ref()) {
                    if ours != theirs {
                        return None;
                    }
                }
                if p.device.is_none() {
                    return None;
                }
                match state {
                    LinkState::Disconnected => DevicePairingState::Disconnected,
                    LinkState::Connecting => DevicePairingState::Connecting,
                    LinkState::Connected => DevicePairingState::Connected,
                }
            }
        };
        if next == p.state {
            return None;
        }
        debug!("Pairing state {:?} -> {:?}", p.state, next);
        p.state = next;
        Some(next)
    }
}

impl Default for PairingTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changed(state: LinkState, device: &str) -> LinkEvent {
        LinkEvent::StateChanged {
            state,
            device: Some(DeviceId::new(device)),
        }
    }

    #[test]
    fn follows_own_device_only() {
        let tracker = PairingTracker::new();
        tracker.pair(&DeviceId::new("A"));
        assert_eq!(
            tracker.apply(&changed(LinkState::Connecting, "A")),
            Some(DevicePairingState::Connecting)
        );
        assert_eq!(tracker.apply(&changed(LinkState::Connected, "B")), None);
        assert_eq!(
            tracker.apply(&changed(LinkState::Connected, "A")),
            Some(DevicePairingState::Connected)
        );
        let anonymous_drop = LinkEvent::StateChanged {
            state: LinkState::Disconnected,
            device: None,
        };
        assert_eq!(
            tracker.apply(&anonymous_drop),
            Some(DevicePairingState::Disconnected)
        );
    }

    #[test]
    fn invalidation_is_terminal_until_repaired() {
        let tracker = PairingTracker::new();
        let a = DeviceId::new("A");
        tracker.pair(&a);
        tracker.apply(&changed(LinkState::Connected, "A"));
        tracker.apply(&LinkEvent::PairingInvalidated { device: a.clone() });
        assert!(tracker.is_invalidated());
        assert_eq!(tracker.apply(&changed(LinkState::Connected, "A")), None);
        assert!(tracker.is_invalidated());
        tracker.pair(&a);
        assert_eq!(tracker.state(), DevicePairingState::Disconnected);
    }

    #[test]
    fn begin_disconnect_marks_disconnecting() {
        let tracker = PairingTracker::new();
        tracker.pair(&DeviceId::new("A"));
        tracker.apply(&changed(LinkState::Connected, "A"));
        tracker.begin_disconnect();
        assert_eq!(tracker.state(), DevicePairingState::Disconnecting);
        tracker.apply(&changed(LinkState::Disconnected, "A"));
        assert_eq!(tracker.state(), DevicePairingState::Disconnected);
    }

    #[test]
    fn unpaired_tracker_ignores_events() {
        let tracker = PairingTracker::new();
        assert_eq!(tracker.apply(&changed(LinkState::Connected, "A")), None);
        assert_eq!(tracker.state(), DevicePairingState::Disconnected);
    }
}
