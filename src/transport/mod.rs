//! # Transport Link Interface
//!
//! Physical connectivity to the radio (BLE GATT or USB serial) is provided by a
//! platform driver outside this crate. The rest of the crate only sees the
//! [`TransportLink`] trait defined here plus the value types that flow across it.
//!
//! ## Events
//!
//! A transport publishes [`LinkEvent`]s on a broadcast channel. Every observer
//! (reconnect trigger, region coordinator, pairing tracker) takes its own
//! receiver via [`TransportLink::subscribe`], so a slow observer never hides a
//! transition from another one.
//!
//! ## Discovery
//!
//! [`TransportLink::scan`] returns an mpsc receiver that yields
//! [`DiscoveredDevice`] results until the scan window closes. Callers are free
//! to drop the receiver early once they find what they were looking for.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Duration;

use crate::error::LinkError;

/// Physical link state as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl LinkState {
    /// True while the transport is owned by some connect attempt or session.
    pub fn is_busy(self) -> bool {
        matches!(self, LinkState::Connecting | LinkState::Connected)
    }
}

/// How the phone reaches the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolKind {
    Ble,
    Serial,
}

/// Stable identifier of a physical radio (BLE address or serial port path).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        DeviceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The radio the user paired with. Persisted so background reconnection knows
/// what to look for after a drop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDevice {
    pub id: DeviceId,
    pub last_known_name: String,
    pub protocol_kind: ProtocolKind,
}

impl TargetDevice {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: ProtocolKind) -> Self {
        Self {
            id: DeviceId::new(id),
            last_known_name: name.into(),
            protocol_kind: kind,
        }
    }
}

/// One advertisement seen during a discovery scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub id: DeviceId,
    pub name: String,
    /// RSSI in dBm, typically -40 to -110.
    pub rssi: i16,
}

/// Restricts which advertisements a scan reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// GATT service UUID the radio advertises (ignored by serial transports).
    pub service_uuid: Option<String>,
    /// Only report this device when set.
    pub device_id: Option<DeviceId>,
}

impl ScanFilter {
    pub fn for_device(service_uuid: Option<String>, device: &DeviceId) -> Self {
        Self {
            service_uuid,
            device_id: Some(device.clone()),
        }
    }

    pub fn matches(&self, found: &DiscoveredDevice) -> bool {
        match &self.device_id {
            Some(id) => id == &found.id,
            None => true,
        }
    }
}

/// Transport notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    StateChanged {
        state: LinkState,
        device: Option<DeviceId>,
    },
    /// The radio rejected our bond (e.g. it was factory reset). Terminal.
    PairingInvalidated { device: DeviceId },
}

/// Physical connectivity abstraction implemented by platform drivers.
///
/// Implementations must be single-writer safe: `connect` while already
/// connecting or connected returns [`LinkError::Busy`].
#[async_trait]
pub trait TransportLink: Send + Sync {
    /// Current link state.
    fn state(&self) -> LinkState;

    /// Device the link is attached to (connecting or connected).
    fn connected_device(&self) -> Option<DeviceId>;

    /// Subscribe to state changes. Each call returns an independent receiver.
    fn subscribe(&self) -> broadcast::Receiver<LinkEvent>;

    async fn connect(&self, device: &TargetDevice) -> Result<(), LinkError>;

    async fn disconnect(&self) -> Result<(), LinkError>;

    /// Start a time-boxed discovery scan. The returned channel closes when the
    /// scan window ends.
    async fn scan(
        &self,
        timeout: Duration,
        filter: &ScanFilter,
    ) -> Result<mpsc::UnboundedReceiver<DiscoveredDevice>, LinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_states() {
        assert!(!LinkState::Disconnected.is_busy());
        assert!(LinkState::Connecting.is_busy());
        assert!(LinkState::Connected.is_busy());
    }

    #[test]
    fn filter_matches_only_requested_device() {
        let wanted = DeviceId::new("C4:DE:E2:10:22:01");
        let filter = ScanFilter::for_device(None, &wanted);
        let hit = DiscoveredDevice {
            id: wanted.clone(),
            name: "Meshtastic_2201".into(),
            rssi: -61,
        };
        let miss = DiscoveredDevice {
            id: DeviceId::new("C4:DE:E2:10:99:99"),
            name: "Meshtastic_9999".into(),
            rssi: -70,
        };
        assert!(filter.matches(&hit));
        assert!(!filter.matches(&miss));
        assert!(ScanFilter::default().matches(&miss));
    }

    #[test]
    fn target_device_serde() {
        let target = TargetDevice::new("/dev/ttyACM0", "T-Beam", ProtocolKind::Serial);
        let json = serde_json::to_string(&target).unwrap();
        let back: TargetDevice = serde_json::from_str(&json).unwrap();
        assert_eq!(back, target);
    }
}
