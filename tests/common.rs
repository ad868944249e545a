//! Shared fixtures for the integration tests: a simulated radio wired to a
//! link manager with millisecond timings.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use meshlink::link::{LinkManager, LinkNotice, LinkSettings};
use meshlink::sim::SimRadio;
use meshlink::storage::{MemoryStore, PairingStore};
use meshlink::transport::{ProtocolKind, TargetDevice};
use tokio::sync::broadcast;

pub fn fast_settings() -> LinkSettings {
    let mut settings = LinkSettings::default();
    let r = &mut settings.reconnect;
    r.max_attempts = 3;
    r.scan_timeout = Duration::from_millis(40);
    r.settle_delay = Duration::from_millis(10);
    r.backoff = Duration::from_millis(5);
    r.post_connect_settle = Duration::from_millis(10);
    r.handshake_timeout = Duration::from_millis(200);
    r.failed_reset_delay = Duration::from_millis(50);
    r.poll_interval = Duration::from_millis(5);
    settings.region.confirm_timeout = Duration::from_secs(2);
    settings.region.poll_interval = Duration::from_millis(5);
    settings.ack_ttl = Duration::from_millis(100);
    settings
}

pub fn radio_a() -> TargetDevice {
    TargetDevice::new("C4:DE:E2:10:22:01", "Meshtastic_2201", ProtocolKind::Ble)
}

pub fn radio_b() -> TargetDevice {
    TargetDevice::new("C4:DE:E2:10:33:02", "Meshtastic_3302", ProtocolKind::Ble)
}

pub struct Rig {
    pub radio: Arc<SimRadio>,
    pub store: Arc<MemoryStore>,
    pub link: LinkManager,
}

pub fn rig_with_store(settings: LinkSettings, store: Arc<dyn PairingStore>) -> (Arc<SimRadio>, LinkManager) {
    let radio = Arc::new(SimRadio::new());
    radio.add_device(&radio_a());
    let link = LinkManager::new(radio.clone(), radio.clone(), store, settings);
    (radio, link)
}

/// Started manager with radio A known to the simulator but not connected.
pub async fn started_rig(settings: LinkSettings) -> Rig {
    let store = Arc::new(MemoryStore::new());
    let (radio, link) = rig_with_store(settings, store.clone());
    link.start().await.expect("start");
    Rig { radio, store, link }
}

/// Started manager with a live, handshaken session to radio A.
pub async fn connected_rig(settings: LinkSettings) -> Rig {
    let rig = started_rig(settings).await;
    rig.link.connect_manual(radio_a()).await.expect("manual connect");
    rig
}

/// Receive notices until one matches `pred` or `wait` elapses.
pub async fn wait_for_notice<F>(
    rx: &mut broadcast::Receiver<LinkNotice>,
    wait: Duration,
    mut pred: F,
) -> Option<LinkNotice>
where
    F: FnMut(&LinkNotice) -> bool,
{
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let left = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(left, rx.recv()).await {
            Ok(Ok(notice)) if pred(&notice) => return Some(notice),
            Ok(Ok(_)) => continue,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return None,
        }
    }
}

/// Everything already queued on `rx`, without waiting.
pub fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}

/// Poll `cond` every few milliseconds until it holds or `wait` elapses.
pub async fn eventually<F: FnMut() -> bool>(wait: Duration, mut cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
