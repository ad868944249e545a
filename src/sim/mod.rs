//! In-process radio model implementing both [`TransportLink`] and
//! [`ProtocolSession`].
//!
//! Used by the `simulate` CLI command and the integration tests. The model
//! covers the behaviours the link core has to cope with:
//!
//! - radios that stop advertising (out of range, powered off)
//! - the host adapter being switched off, so scans fail outright
//! - connect attempts that fail or drop straight away
//! - slow or failing handshakes
//! - region writes that reboot the radio for a configurable downtime
//! - the radio forgetting the bond (pairing invalidation)
//! - inbound messages and delivery acks
//!
//! All knobs are plain setters so tests can script a scenario up front.
use async_trait::async_trait;
use log::{debug, trace};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, Duration, Instant};

use crate::error::{LinkError, ProtocolError};
use crate::protocol::{
    DeliveryAck, InboundMessage, OutgoingText, ProtocolSession, RegionCode,
};
use crate::transport::{
    DeviceId, DiscoveredDevice, LinkEvent, LinkState, ScanFilter, TargetDevice, TransportLink,
};

#[derive(Debug, Clone)]
struct SimDevice {
    name: String,
    rssi: i16,
    discoverable: bool,
    /// Rebooting radios are unreachable until this instant.
    back_at: Option<Instant>,
    invalidate_on_connect: bool,
}

impl SimDevice {
    fn reachable(&self, now: Instant) -> bool {
        self.discoverable && self.back_at.map_or(true, |t| now >= t)
    }
}

#[derive(Debug)]
struct SimState {
    link: LinkState,
    connected: Option<DeviceId>,
    devices: HashMap<DeviceId, SimDevice>,
    region: RegionCode,
    fail_connects: u32,
    fail_handshakes: u32,
    handshake_delay: Duration,
    reboot_on_region: Option<Duration>,
    report_region: bool,
    auto_ack: Option<Duration>,
    adapter_enabled: bool,
}

/// Operation counters, read with [`SimRadio::counters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimCounters {
    pub scans: u32,
    pub connects: u32,
    pub handshakes: u32,
    pub region_writes: u32,
    pub sends: u32,
    pub max_concurrent_scans: u32,
}

pub struct SimRadio {
    state: Arc<Mutex<SimState>>,
    handshake: Arc<AtomicBool>,
    link_tx: broadcast::Sender<LinkEvent>,
    message_tx: broadcast::Sender<InboundMessage>,
    ack_tx: broadcast::Sender<DeliveryAck>,
    region_tx: broadcast::Sender<RegionCode>,
    scans: AtomicU32,
    connects: AtomicU32,
    handshakes: AtomicU32,
    region_writes: AtomicU32,
    sends: AtomicU32,
    active_scans: Arc<AtomicU32>,
    max_concurrent_scans: Arc<AtomicU32>,
}

impl SimRadio {
    pub fn new() -> Self {
        let (link_tx, _) = broadcast::channel(64);
        let (message_tx, _) = broadcast::channel(256);
        let (ack_tx, _) = broadcast::channel(64);
        let (region_tx, _) = broadcast::channel(16);
        Self {
            state: Arc::new(Mutex::new(SimState {
                link: LinkState::Disconnected,
                connected: None,
                devices: HashMap::new(),
                region: RegionCode::Unset,
                fail_connects: 0,
                fail_handshakes: 0,
                handshake_delay: Duration::from_millis(1),
                reboot_on_region: None,
                report_region: true,
                auto_ack: None,
                adapter_enabled: true,
            })),
            handshake: Arc::new(AtomicBool::new(false)),
            link_tx,
            message_tx,
            ack_tx,
            region_tx,
            scans: AtomicU32::new(0),
            connects: AtomicU32::new(0),
            handshakes: AtomicU32::new(0),
            region_writes: AtomicU32::new(0),
            sends: AtomicU32::new(0),
            active_scans: Arc::new(AtomicU32::new(0)),
            max_concurrent_scans: Arc::new(AtomicU32::new(0)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make a radio available for discovery and connects.
    pub fn add_device(&self, device: &TargetDevice) {
        self.lock().devices.insert(
            device.id.clone(),
            SimDevice {
                name: device.last_known_name.clone(),
                rssi: -60,
                discoverable: true,
                back_at: None,
                invalidate_on_connect: false,
            },
        );
    }

    pub fn set_discoverable(&self, id: &DeviceId, discoverable: bool) {
        if let Some(d) = self.lock().devices.get_mut(id) {
            d.discoverable = discoverable;
        }
    }

    /// Next connect to `id` reports that the radio forgot the bond.
    pub fn invalidate_on_connect(&self, id: &DeviceId) {
        if let Some(d) = self.lock().devices.get_mut(id) {
            d.invalidate_on_connect = true;
        }
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.lock().fail_connects = n;
    }

    pub fn fail_next_handshakes(&self, n: u32) {
        self.lock().fail_handshakes = n;
    }

    pub fn set_handshake_delay(&self, delay: Duration) {
        self.lock().handshake_delay = delay;
    }

    /// Region writes reboot the radio for `downtime` (None: apply in place).
    pub fn set_reboot_on_region(&self, downtime: Option<Duration>) {
        self.lock().reboot_on_region = downtime;
    }

    /// Whether the radio reports its region on the region stream.
    pub fn set_region_reports(&self, report: bool) {
        self.lock().report_region = report;
    }

    /// Host adapter power. While off every scan fails.
    pub fn set_adapter_enabled(&self, enabled: bool) {
        self.lock().adapter_enabled = enabled;
    }

    /// Ack every send after `delay` (None: never ack).
    pub fn set_auto_ack(&self, delay: Option<Duration>) {
        self.lock().auto_ack = delay;
    }

    pub fn region(&self) -> RegionCode {
        self.lock().region
    }

    pub fn counters(&self) -> SimCounters {
        SimCounters {
            scans: self.scans.load(Ordering::SeqCst),
            connects: self.connects.load(Ordering::SeqCst),
            handshakes: self.handshakes.load(Ordering::SeqCst),
            region_writes: self.region_writes.load(Ordering::SeqCst),
            sends: self.sends.load(Ordering::SeqCst),
            max_concurrent_scans: self.max_concurrent_scans.load(Ordering::SeqCst),
        }
    }

    /// Unexpected link loss (radio walked out of range).
    pub fn drop_link(&self) {
        let dropped = {
            let mut s = self.lock();
            let dropped = s.connected.take();
            s.link = LinkState::Disconnected;
            dropped
        };
        self.handshake.store(false, Ordering::SeqCst);
        if let Some(device) = dropped {
            debug!("sim: link to {} dropped", device);
            let _ = self.link_tx.send(LinkEvent::StateChanged {
                state: LinkState::Disconnected,
                device: Some(device),
            });
        }
    }

    /// Radio forgets the bond while connected.
    pub fn invalidate_pairing(&self, id: &DeviceId) {
        let _ = self.link_tx.send(LinkEvent::PairingInvalidated { device: id.clone() });
        if self.lock().connected.as_ref() == Some(id) {
            self.drop_link();
        }
    }

    /// Deliver a message as if it arrived over the radio.
    pub fn inject_message(&self, msg: InboundMessage) {
        let _ = self.message_tx.send(msg);
    }

    pub fn ack(&self, packet_id: u32) {
        let _ = self.ack_tx.send(DeliveryAck { packet_id });
    }

    fn emit(&self, state: LinkState, device: Option<DeviceId>) {
        let _ = self.link_tx.send(LinkEvent::StateChanged { state, device });
    }

    fn ready(&self) -> Result<(), ProtocolError> {
        if self.lock().link == LinkState::Connected && self.handshake.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProtocolError::NotReady)
        }
    }

    fn reboot(&self, downtime: Duration) {
        let state = self.state.clone();
        let handshake = self.handshake.clone();
        let link_tx = self.link_tx.clone();
        tokio::spawn(async move {
            // The radio acks the write before it goes down.
            sleep(Duration::from_millis(1)).await;
            let dropped = {
                let mut s = state.lock().unwrap_or_else(|e| e.into_inner());
                let dropped = s.connected.take();
                s.link = LinkState::Disconnected;
                if let Some(id) = &dropped {
                    if let Some(d) = s.devices.get_mut(id) {
                        d.back_at = Some(Instant::now() + downtime);
                    }
                }
                dropped
            };
            handshake.store(false, Ordering::SeqCst);
            if let Some(device) = dropped {
                debug!("sim: {} rebooting for {:?}", device, downtime);
                let _ = link_tx.send(LinkEvent::StateChanged {
                    state: LinkState::Disconnected,
                    device: Some(device),
                });
            }
        });
    }
}

impl Default for SimRadio {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportLink for SimRadio {
    fn state(&self) -> LinkState {
        self.lock().link
    }

    fn connected_device(&self) -> Option<DeviceId> {
        self.lock().connected.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.link_tx.subscribe()
    }

    async fn connect(&self, device: &TargetDevice) -> Result<(), LinkError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        {
            let mut s = self.lock();
            if s.link.is_busy() {
                return Err(LinkError::Busy);
            }
            s.link = LinkState::Connecting;
        }
        self.emit(LinkState::Connecting, Some(device.id.clone()));
        sleep(Duration::from_millis(1)).await;

        let result = {
            let mut s = self.lock();
            let now = Instant::now();
            let reachable = s.devices.get(&device.id).map(|d| d.reachable(now));
            let invalidated = s
                .devices
                .get(&device.id)
                .map_or(false, |d| d.invalidate_on_connect);
            if reachable.is_none() {
                s.link = LinkState::Disconnected;
                Err(LinkError::NotFound(device.id.to_string()))
            } else if invalidated {
                s.link = LinkState::Disconnected;
                Err(LinkError::PairingInvalidated(device.id.to_string()))
            } else if reachable == Some(false) {
                s.link = LinkState::Disconnected;
                Err(LinkError::ConnectFailed(format!("{} unreachable", device.id)))
            } else if s.fail_connects > 0 {
                s.fail_connects -= 1;
                s.link = LinkState::Disconnected;
                Err(LinkError::ConnectFailed("gatt error 133".into()))
            } else {
                s.link = LinkState::Connected;
                s.connected = Some(device.id.clone());
                Ok(())
            }
        };
        self.handshake.store(false, Ordering::SeqCst);
        match &result {
            Ok(()) => self.emit(LinkState::Connected, Some(device.id.clone())),
            Err(LinkError::PairingInvalidated(_)) => {
                let _ = self.link_tx.send(LinkEvent::PairingInvalidated {
                    device: device.id.clone(),
                });
                self.emit(LinkState::Disconnected, Some(device.id.clone()));
            }
            Err(_) => self.emit(LinkState::Disconnected, Some(device.id.clone())),
        }
        result
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        let dropped = {
            let mut s = self.lock();
            let dropped = s.connected.take();
            s.link = LinkState::Disconnected;
            dropped
        };
        self.handshake.store(false, Ordering::SeqCst);
        if dropped.is_some() {
            self.emit(LinkState::Disconnected, dropped);
        }
        Ok(())
    }

    async fn scan(
        &self,
        timeout: Duration,
        filter: &ScanFilter,
    ) -> Result<mpsc::UnboundedReceiver<DiscoveredDevice>, LinkError> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        if !self.lock().adapter_enabled {
            return Err(LinkError::ScanFailed("adapter off".into()));
        }
        let active = self.active_scans.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_scans.fetch_max(active, Ordering::SeqCst);

        let now = Instant::now();
        let visible: Vec<DiscoveredDevice> = self
            .lock()
            .devices
            .iter()
            .filter(|(_, d)| d.reachable(now))
            .map(|(id, d)| DiscoveredDevice {
                id: id.clone(),
                name: d.name.clone(),
                rssi: d.rssi,
            })
            .filter(|d| filter.matches(d))
            .collect();
        trace!("sim: scan sees {} device(s)", visible.len());

        let (tx, rx) = mpsc::unbounded_channel();
        let active_scans = self.active_scans.clone();
        tokio::spawn(async move {
            if visible.is_empty() {
                sleep(timeout).await;
                active_scans.fetch_sub(1, Ordering::SeqCst);
                return;
            }
            // Window closes once results are out.
            active_scans.fetch_sub(1, Ordering::SeqCst);
            for d in visible {
                let _ = tx.send(d);
            }
        });
        Ok(rx)
    }
}

#[async_trait]
impl ProtocolSession for SimRadio {
    async fn start(&self) -> Result<(), ProtocolError> {
        let delay = {
            let s = self.lock();
            if s.link != LinkState::Connected {
                return Err(ProtocolError::NotReady);
            }
            s.handshake_delay
        };
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        sleep(delay).await;
        let (region, report) = {
            let mut s = self.lock();
            if s.link != LinkState::Connected {
                return Err(ProtocolError::HandshakeFailed("link dropped".into()));
            }
            if s.fail_handshakes > 0 {
                s.fail_handshakes -= 1;
                return Err(ProtocolError::HandshakeFailed("config timeout".into()));
            }
            (s.region, s.report_region)
        };
        self.handshake.store(true, Ordering::SeqCst);
        if report {
            let _ = self.region_tx.send(region);
        }
        Ok(())
    }

    fn handshake_complete(&self) -> bool {
        self.handshake.load(Ordering::SeqCst)
    }

    fn subscribe_messages(&self) -> broadcast::Receiver<InboundMessage> {
        self.message_tx.subscribe()
    }

    fn subscribe_acks(&self) -> broadcast::Receiver<DeliveryAck> {
        self.ack_tx.subscribe()
    }

    fn subscribe_region(&self) -> broadcast::Receiver<RegionCode> {
        self.region_tx.subscribe()
    }

    async fn set_region(&self, region: RegionCode) -> Result<(), ProtocolError> {
        self.ready()?;
        self.region_writes.fetch_add(1, Ordering::SeqCst);
        let (reboot, report) = {
            let mut s = self.lock();
            s.region = region;
            (s.reboot_on_region, s.report_region)
        };
        match reboot {
            Some(downtime) => self.reboot(downtime),
            None if report => {
                let _ = self.region_tx.send(region);
            }
            None => {}
        }
        Ok(())
    }

    async fn send_text(&self, msg: OutgoingText) -> Result<u32, ProtocolError> {
        self.ready()?;
        self.sends.fetch_add(1, Ordering::SeqCst);
        let packet_id = rand::random::<u32>().max(1);
        trace!(
            "sim: sent packet 0x{:08x} on channel {} ({} bytes)",
            packet_id,
            msg.channel,
            msg.content.len()
        );
        let auto_ack = self.lock().auto_ack;
        if let (Some(delay), true) = (auto_ack, msg.want_ack) {
            let ack_tx = self.ack_tx.clone();
            tokio::spawn(async move {
                sleep(delay).await;
                let _ = ack_tx.send(DeliveryAck { packet_id });
            });
        }
        Ok(packet_id)
    }
}
