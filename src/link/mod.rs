//! # Link Manager
//!
//! [`LinkManager`] is the explicit session handle the application holds. It
//! owns one of each core component and wires them together:
//!
//! ```text
//!   UI intents ──► LinkManager ──► ConnectionIntentGuard
//!                      │                 │
//!                      ├──► TransportLink / ProtocolSession (collaborators)
//!                      ├──► ReconnectOrchestrator (on unexpected drops)
//!                      ├──► RegionApplyCoordinator (region changes)
//!                      └──► DeliveryDeduplicator ◄── device stream + push relay
//! ```
//!
//! Background listeners are [`SubscriptionHandle`]s held here and cancelled on
//! [`LinkManager::shutdown`]. Several managers can coexist in one process;
//! nothing is global apart from the metrics counters.
//!
//! Presentation code observes [`LinkNotice`]s and [`LinkStatus`]; admitted
//! inbound messages are published on [`LinkManager::subscribe_admitted`].
use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant};

use crate::config::{Config, DEFAULT_ACK_TTL_SECS};
use crate::dedup::{DedupTuning, DedupVerdict, DeliveryDeduplicator, MessageFingerprint};
use crate::error::{ConnectError, ProtocolError, RegionError};
use crate::logutil::preview;
use crate::metrics;
use crate::protocol::{
    DeliveryAck, DeliveryPath, InboundMessage, OutgoingText, ProtocolSession, Recipient,
    RegionCode,
};
use crate::reconnect::{
    ReconnectOrchestrator, ReconnectOutcome, ReconnectTuning, TriggerContext,
};
use crate::region::{RegionApplyCoordinator, RegionApplyStatus, RegionTuning};
use crate::session::{
    ConnectionIntentGuard, ConnectionSessionState, DevicePairingState, PairingTracker,
    SessionHandle, SessionIdentity, SubscriptionHandle,
};
use crate::storage::{self, PairingStore, PersistedLink};
use crate::transport::{DeviceId, LinkEvent, LinkState, TargetDevice, TransportLink};

/// Single user-facing connection status, derived from the three independent
/// state machines plus protocol readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Reconnecting,
    ReconnectFailed,
    NeedsRepair,
}

impl LinkStatus {
    pub fn derive(
        pairing: DevicePairingState,
        session: ConnectionSessionState,
        transport: LinkState,
        handshake_complete: bool,
    ) -> Self {
        if pairing == DevicePairingState::Invalidated {
            return LinkStatus::NeedsRepair;
        }
        match session {
            ConnectionSessionState::Failed => return LinkStatus::ReconnectFailed,
            ConnectionSessionState::Scanning | ConnectionSessionState::Connecting => {
                return LinkStatus::Reconnecting
            }
            _ => {}
        }
        match transport {
            LinkState::Connected if handshake_complete => LinkStatus::Ready,
            LinkState::Connected => LinkStatus::Handshaking,
            LinkState::Connecting => LinkStatus::Connecting,
            LinkState::Disconnected if session == ConnectionSessionState::ManualConnecting => {
                LinkStatus::Connecting
            }
            LinkState::Disconnected => LinkStatus::Disconnected,
        }
    }
}

/// Events for presentation collaborators (notifications, banners).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkNotice {
    /// Unexpected drop. Not raised while a region apply expects the reboot.
    ConnectionLost { device: DeviceId },
    Reconnecting { device: DeviceId },
    Recovered { session: SessionHandle },
    ReconnectFailed { attempts: u32 },
    PairingInvalidated { device: DeviceId },
    RegionApplied { region: RegionCode },
    RegionFailed { region: RegionCode, reason: String },
    MessageDelivered { app_id: String },
}

/// Result of [`LinkManager::send_text`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub app_id: String,
    pub packet_id: u32,
}

#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub reconnect: ReconnectTuning,
    pub region: RegionTuning,
    pub dedup: DedupTuning,
    /// Pending sends without an ack are dropped after this long.
    pub ack_ttl: Duration,
    /// Our own node number, folded into outgoing application ids.
    pub local_node: u32,
    /// Default for the persisted auto-reconnect flag when nothing is stored yet.
    pub auto_reconnect_default: bool,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            reconnect: ReconnectTuning::default(),
            region: RegionTuning::default(),
            dedup: DedupTuning::default(),
            ack_ttl: Duration::from_secs(DEFAULT_ACK_TTL_SECS),
            local_node: 0,
            auto_reconnect_default: true,
        }
    }
}

impl LinkSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            reconnect: config.reconnect_tuning(),
            region: config.region_tuning(),
            dedup: config.dedup_tuning(),
            ack_ttl: config.ack_ttl(),
            local_node: config.link.local_node.unwrap_or(0),
            auto_reconnect_default: config.link.auto_reconnect,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingSend {
    app_id: String,
    sent_at: Instant,
}

#[derive(Default)]
struct Pumps {
    events: Option<SubscriptionHandle>,
    inbound: Option<SubscriptionHandle>,
    acks: Option<SubscriptionHandle>,
}

struct Inner {
    transport: Arc<dyn TransportLink>,
    protocol: Arc<dyn ProtocolSession>,
    store: Arc<dyn PairingStore>,
    guard: Arc<ConnectionIntentGuard>,
    identity: Arc<SessionIdentity>,
    pairing: Arc<PairingTracker>,
    reconnect: Arc<ReconnectOrchestrator>,
    region: Arc<RegionApplyCoordinator>,
    dedup: Mutex<DeliveryDeduplicator>,
    pending: Mutex<HashMap<u32, PendingSend>>,
    notices: broadcast::Sender<LinkNotice>,
    admitted: broadcast::Sender<InboundMessage>,
    pumps: Mutex<Pumps>,
    recovery: Mutex<Option<JoinHandle<()>>>,
    stream_restarts: std::sync::atomic::AtomicU32,
    settings: LinkSettings,
}

pub struct LinkManager {
    inner: Arc<Inner>,
}

impl LinkManager {
    pub fn new(
        transport: Arc<dyn TransportLink>,
        protocol: Arc<dyn ProtocolSession>,
        store: Arc<dyn PairingStore>,
        settings: LinkSettings,
    ) -> Self {
        let guard = Arc::new(ConnectionIntentGuard::new());
        let identity = Arc::new(SessionIdentity::new());
        let pairing = Arc::new(PairingTracker::new());
        let reconnect = Arc::new(ReconnectOrchestrator::new(
            transport.clone(),
            protocol.clone(),
            guard.clone(),
            identity.clone(),
            pairing.clone(),
            settings.reconnect.clone(),
        ));
        let region = Arc::new(RegionApplyCoordinator::new(
            transport.clone(),
            protocol.clone(),
            identity.clone(),
            pairing.clone(),
            store.clone(),
            settings.region.clone(),
        ));
        let (notices, _) = broadcast::channel(128);
        let (admitted, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                transport,
                protocol,
                store,
                guard,
                identity,
                pairing,
                reconnect,
                region,
                dedup: Mutex::new(DeliveryDeduplicator::new(settings.dedup.clone())),
                pending: Mutex::new(HashMap::new()),
                notices,
                admitted,
                pumps: Mutex::new(Pumps::default()),
                recovery: Mutex::new(None),
                stream_restarts: std::sync::atomic::AtomicU32::new(0),
                settings,
            }),
        }
    }

    /// Load persisted pairing state and start the background listeners.
    pub async fn start(&self) -> Result<PersistedLink, ConnectError> {
        let mut persisted = self.inner.store.load().await?;
        if persisted == PersistedLink::default()
            && persisted.auto_reconnect != self.inner.settings.auto_reconnect_default
        {
            // First run: seed the flag from config.
            persisted.auto_reconnect = self.inner.settings.auto_reconnect_default;
            self.inner.store.save(&persisted).await?;
        }
        if let Some(target) = &persisted.target {
            self.inner.pairing.pair(&target.id);
            info!(
                "Paired radio: {} ({}) auto_reconnect={}",
                target.last_known_name, target.id, persisted.auto_reconnect
            );
        }
        let mut pumps = lock(&self.inner.pumps);
        if pumps.events.is_none() {
            pumps.events = Some(spawn_event_pump(&self.inner));
        }
        if pumps.inbound.is_none() {
            pumps.inbound = Some(spawn_inbound_pump(&self.inner));
        }
        if pumps.acks.is_none() {
            pumps.acks = Some(spawn_ack_pump(&self.inner));
        }
        Ok(persisted)
    }

    /// Stop every background listener and any reconnect loop.
    pub async fn shutdown(&self) {
        self.inner.reconnect.cancel_reset();
        if self.inner.guard.state().is_background() {
            self.inner.guard.reset_to_idle();
        }
        let recovery = lock(&self.inner.recovery).take();
        if let Some(task) = recovery {
            if timeout(Duration::from_secs(2), task).await.is_err() {
                warn!("Reconnect task did not stop within 2s");
            }
        }
        let pumps = std::mem::take(&mut *lock(&self.inner.pumps));
        for handle in [pumps.events, pumps.inbound, pumps.acks].into_iter().flatten() {
            handle.cancel().await;
        }
        info!("Link manager stopped");
    }

    /// User-initiated connect. Preempts any background reconnect loop.
    pub async fn connect_manual(&self, target: TargetDevice) -> Result<SessionHandle, ConnectError> {
        let inner = &self.inner;
        inner.guard.begin_manual_connect(&target);
        inner.pairing.pair(&target.id);

        let result = self.manual_attempt(&target).await;
        inner.guard.clear_manual();
        match &result {
            Ok(handle) => info!("Connected to {} as session {}", target.id, handle.id),
            Err(e) => warn!("Manual connect to {} failed: {}", target.id, e),
        }
        result
    }

    /// Manual retry against the persisted radio, e.g. after the background
    /// loop gave up.
    pub async fn reconnect_paired(&self) -> Result<SessionHandle, ConnectError> {
        let persisted = self.inner.store.load().await?;
        match persisted.target {
            Some(target) => self.connect_manual(target).await,
            None => Err(ConnectError::NoTarget),
        }
    }

    async fn manual_attempt(&self, target: &TargetDevice) -> Result<SessionHandle, ConnectError> {
        let inner = &self.inner;
        if inner.transport.state().is_busy() {
            if inner.transport.connected_device().as_ref() == Some(&target.id)
                && inner.protocol.handshake_complete()
            {
                if let Some(current) = inner.identity.current() {
                    debug!("Already connected to {}", target.id);
                    return Ok(current);
                }
            }
            debug!("Releasing transport before manual connect to {}", target.id);
            inner.transport.disconnect().await?;
        }

        if let Err(e) = inner.transport.connect(target).await {
            if e.is_terminal() {
                inner.note_pairing_event(&LinkEvent::PairingInvalidated {
                    device: target.id.clone(),
                });
            }
            return Err(e.into());
        }

        let handshake_timeout = inner.settings.reconnect.handshake_timeout;
        match timeout(handshake_timeout, inner.protocol.start()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = inner.transport.disconnect().await;
                return Err(e.into());
            }
            Err(_) => {
                let _ = inner.transport.disconnect().await;
                return Err(ProtocolError::HandshakeTimeout(handshake_timeout.as_millis() as u64).into());
            }
        }

        let handle = inner.identity.mint(&target.id);
        inner.region.on_session_changed(&handle);

        let target = target.clone();
        storage::update(inner.store.as_ref(), move |p| {
            if p.target.as_ref().map(|t| &t.id) != Some(&target.id) {
                // Region configuration belongs to the previous radio.
                p.region_configured = false;
                p.region = None;
            }
            p.target = Some(target);
        })
        .await?;
        Ok(handle)
    }

    /// User-initiated disconnect. Cancels any background loop and suppresses
    /// reconnection until the next manual connect.
    pub async fn disconnect(&self) -> Result<(), ConnectError> {
        let inner = &self.inner;
        inner.guard.mark_user_disconnect();
        inner.pairing.begin_disconnect();
        inner.region.abandon();
        if inner.guard.state().is_background() {
            inner.guard.reset_to_idle();
        }
        inner.transport.disconnect().await?;
        inner.identity.end();
        info!("Disconnected by user");
        Ok(())
    }

    /// Disconnect and drop the persisted pairing entirely.
    pub async fn forget_device(&self) -> Result<(), ConnectError> {
        self.disconnect().await?;
        storage::update(self.inner.store.as_ref(), |p| {
            p.target = None;
            p.region_configured = false;
            p.region = None;
        })
        .await?;
        self.inner.pairing.forget();
        self.inner.region.reset();
        info!("Paired radio forgotten");
        Ok(())
    }

    pub async fn set_auto_reconnect(&self, enabled: bool) -> Result<(), ConnectError> {
        storage::update(self.inner.store.as_ref(), |p| p.auto_reconnect = enabled).await?;
        info!("Auto-reconnect {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Change the radio's LoRa region and wait for the reboot cycle.
    pub async fn apply_region(&self, region: RegionCode) -> Result<RegionApplyStatus, RegionError> {
        let result = self.inner.region.apply_region(region).await;
        match &result {
            Ok(RegionApplyStatus::Applied) => {
                self.inner.notify(LinkNotice::RegionApplied { region });
            }
            Ok(_) => {}
            Err(RegionError::NotConnected) | Err(RegionError::Busy(_)) => {}
            Err(e) => self.inner.notify(LinkNotice::RegionFailed {
                region,
                reason: e.to_string(),
            }),
        }
        result
    }

    /// Entry point for messages delivered by the out-of-band push relay.
    pub fn ingest_relayed(&self, mut msg: InboundMessage) -> DedupVerdict {
        msg.path = DeliveryPath::PushRelay;
        self.inner.ingest(msg)
    }

    /// Send text over the current session and track its delivery ack.
    pub async fn send_text(&self, msg: OutgoingText) -> Result<SentMessage, ConnectError> {
        let inner = &self.inner;
        if inner.identity.current().is_none() || !inner.protocol.handshake_complete() {
            return Err(ProtocolError::NotReady.into());
        }
        let recipient = msg.to_node.map_or(Recipient::Broadcast, Recipient::from_dest);
        let app_id = MessageFingerprint::new(
            inner.settings.local_node,
            recipient,
            msg.channel,
            &msg.content,
            Utc::now(),
            inner.settings.dedup.bucket,
        )
        .app_id();
        let want_ack = msg.want_ack;
        let text = preview(&msg.content, 40);
        let packet_id = inner.protocol.send_text(msg).await?;
        if want_ack {
            lock(&inner.pending).insert(
                packet_id,
                PendingSend {
                    app_id: app_id.clone(),
                    sent_at: Instant::now(),
                },
            );
        }
        debug!("Sent id={} packet=0x{:08x} ({})", app_id, packet_id, text);
        Ok(SentMessage { app_id, packet_id })
    }

    pub fn status(&self) -> LinkStatus {
        let inner = &self.inner;
        LinkStatus::derive(
            inner.pairing.state(),
            inner.guard.state(),
            inner.transport.state(),
            inner.protocol.handshake_complete(),
        )
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<LinkNotice> {
        self.inner.notices.subscribe()
    }

    /// Inbound messages that passed deduplication, from either path.
    pub fn subscribe_admitted(&self) -> broadcast::Receiver<InboundMessage> {
        self.inner.admitted.subscribe()
    }

    pub fn current_session(&self) -> Option<SessionHandle> {
        self.inner.identity.current()
    }

    pub fn guard(&self) -> &Arc<ConnectionIntentGuard> {
        &self.inner.guard
    }

    pub fn pairing(&self) -> &Arc<PairingTracker> {
        &self.inner.pairing
    }

    pub fn reconnect(&self) -> &Arc<ReconnectOrchestrator> {
        &self.inner.reconnect
    }

    pub fn region(&self) -> &Arc<RegionApplyCoordinator> {
        &self.inner.region
    }

    pub fn held_messages(&self) -> usize {
        lock(&self.inner.dedup).held_count()
    }

    pub fn pending_acks(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// How many times the inbound streams were restarted after a recovery.
    pub fn stream_restarts(&self) -> u32 {
        self.inner
            .stream_restarts
            .load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Inner {
    fn notify(&self, notice: LinkNotice) {
        let _ = self.notices.send(notice);
    }

    fn note_pairing_event(&self, event: &LinkEvent) {
        if let Some(DevicePairingState::Invalidated) = self.pairing.apply(event) {
            if let LinkEvent::PairingInvalidated { device } = event {
                self.notify(LinkNotice::PairingInvalidated {
                    device: device.clone(),
                });
            }
        }
    }

    fn ingest(&self, msg: InboundMessage) -> DedupVerdict {
        let verdict = lock(&self.dedup).admit(&msg);
        if let DedupVerdict::Admitted { app_id } = &verdict {
            let mut admitted = msg;
            admitted.app_id = Some(app_id.clone());
            let _ = self.admitted.send(admitted);
        }
        verdict
    }

    fn resolve_ack(&self, ack: DeliveryAck) {
        let resolved = lock(&self.pending).remove(&ack.packet_id);
        match resolved {
            Some(p) => {
                metrics::inc_send_acked();
                debug!(
                    "Delivered id={} packet=0x{:08x} latency_ms={}",
                    p.app_id,
                    ack.packet_id,
                    p.sent_at.elapsed().as_millis()
                );
                self.notify(LinkNotice::MessageDelivered { app_id: p.app_id });
            }
            None => debug!("Ack for packet 0x{:08x} (no pending entry)", ack.packet_id),
        }
    }

    fn expire_pending(&self) {
        let ttl = self.settings.ack_ttl;
        let mut pending = lock(&self.pending);
        let before = pending.len();
        pending.retain(|id, p| {
            let keep = p.sent_at.elapsed() < ttl;
            if !keep {
                debug!("Packet 0x{:08x} (id={}) expired without ack", id, p.app_id);
            }
            keep
        });
        for _ in pending.len()..before {
            metrics::inc_send_expired();
        }
    }

    /// Transport reported a Connected→Disconnected edge.
    async fn on_link_lost(self: &Arc<Self>, device: Option<DeviceId>) {
        if self.transport.state() == LinkState::Connected {
            debug!("Stale disconnect for {:?}; link already re-established", device);
            return;
        }
        if self.guard.state().is_background() {
            // The running loop tears down its own failed attempts.
            debug!("Disconnect of {:?} during reconnect attempt", device);
            return;
        }
        self.identity.end();
        let user_initiated = self.guard.user_disconnected();
        let expecting_reboot = self.region.expecting_reboot();
        let manual = self.guard.state() == ConnectionSessionState::ManualConnecting;
        if !user_initiated && !expecting_reboot && !manual {
            if let Some(device) = device.clone().or_else(|| self.pairing.device()) {
                warn!("Connection to {} lost", device);
                self.notify(LinkNotice::ConnectionLost { device });
            }
        } else if expecting_reboot {
            debug!("Link dropped during region apply; expected reboot");
        }

        let persisted = match self.store.load().await {
            Ok(p) => p,
            Err(e) => {
                warn!("Could not read pairing state: {}", e);
                return;
            }
        };
        let ctx = TriggerContext {
            auto_reconnect: persisted.auto_reconnect,
            expecting_reboot,
            target: persisted.target,
        };
        let target = match self.reconnect.evaluate_trigger(&ctx) {
            Ok(t) => t,
            Err(reason) => {
                debug!("No background reconnect: {:?}", reason);
                return;
            }
        };

        let me = self.clone();
        let task = tokio::spawn(async move {
            me.notify(LinkNotice::Reconnecting {
                device: target.id.clone(),
            });
            let outcome = me.reconnect.run_recovery(target).await;
            me.finish_recovery(outcome).await;
        });
        if let Some(previous) = lock(&self.recovery).replace(task) {
            // Previous loop already finished; the guard admits only one.
            previous.abort();
        }
    }

    async fn finish_recovery(self: &Arc<Self>, outcome: ReconnectOutcome) {
        match outcome {
            ReconnectOutcome::Recovered(id) => {
                if let Some(session) = self.identity.current().filter(|s| s.id == id) {
                    self.region.on_session_changed(&session);
                    self.restart_streams();
                    self.notify(LinkNotice::Recovered { session });
                }
            }
            ReconnectOutcome::Exhausted { attempts } => {
                self.region.abandon();
                self.notify(LinkNotice::ReconnectFailed { attempts });
            }
            ReconnectOutcome::Invalidated => {
                if let Some(device) = self.pairing.device() {
                    self.note_pairing_event(&LinkEvent::PairingInvalidated { device });
                }
            }
            ReconnectOutcome::Aborted(reason) => debug!("Reconnect aborted: {:?}", reason),
            ReconnectOutcome::NotStarted(reason) => debug!("Reconnect not started: {:?}", reason),
        }
    }

    /// Resubscribe the inbound and ack streams once per recovered session.
    fn restart_streams(self: &Arc<Self>) {
        let (old_inbound, old_acks) = {
            let mut pumps = lock(&self.pumps);
            if pumps.events.is_none() {
                // Manager is shut down.
                return;
            }
            let old = (pumps.inbound.take(), pumps.acks.take());
            pumps.inbound = Some(spawn_inbound_pump(self));
            pumps.acks = Some(spawn_ack_pump(self));
            old
        };
        drop(old_inbound);
        drop(old_acks);
        self.stream_restarts
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        debug!("Inbound streams restarted after recovery");
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn spawn_event_pump(inner: &Arc<Inner>) -> SubscriptionHandle {
    let inner = inner.clone();
    let mut events = inner.transport.subscribe();
    SubscriptionHandle::spawn("link-events", move |mut shutdown| async move {
        let mut last = inner.transport.state();
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = events.recv() => match event {
                    Ok(event) => {
                        inner.note_pairing_event(&event);
                        if let LinkEvent::StateChanged { state, device } = event {
                            let was = last;
                            last = state;
                            if was == LinkState::Connected && state == LinkState::Disconnected {
                                inner.on_link_lost(device).await;
                            }
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!("Link event stream lagged by {}; resyncing state", n);
                        last = inner.transport.state();
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}

fn spawn_inbound_pump(inner: &Arc<Inner>) -> SubscriptionHandle {
    let inner = inner.clone();
    let mut messages = inner.protocol.subscribe_messages();
    SubscriptionHandle::spawn("inbound", move |mut shutdown| async move {
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                msg = messages.recv() => match msg {
                    Ok(mut msg) => {
                        msg.path = DeliveryPath::Device;
                        inner.ingest(msg);
                    }
                    Err(RecvError::Lagged(n)) => warn!("Inbound stream lagged; {} message(s) skipped", n),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}

fn spawn_ack_pump(inner: &Arc<Inner>) -> SubscriptionHandle {
    let inner = inner.clone();
    let mut acks = inner.protocol.subscribe_acks();
    let sweep = (inner.settings.ack_ttl / 4).max(Duration::from_millis(10));
    SubscriptionHandle::spawn("acks", move |mut shutdown| async move {
        let mut expiry = tokio::time::interval(sweep);
        expiry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                ack = acks.recv() => match ack {
                    Ok(ack) => inner.resolve_ack(ack),
                    Err(RecvError::Lagged(n)) => warn!("Ack stream lagged by {}", n),
                    Err(RecvError::Closed) => break,
                },
                _ = expiry.tick() => inner.expire_pending(),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_take_ack_ttl_and_node_from_config() {
        let mut config = Config::default();
        config.link.ack_ttl_secs = Some(30);
        config.link.local_node = Some(0x0a0b_0c0d);
        config.link.auto_reconnect = false;
        let settings = LinkSettings::from_config(&config);
        assert_eq!(settings.ack_ttl, Duration::from_secs(30));
        assert_eq!(settings.local_node, 0x0a0b_0c0d);
        assert!(!settings.auto_reconnect_default);

        let defaults = LinkSettings::from_config(&Config::default());
        assert_eq!(defaults.ack_ttl, LinkSettings::default().ack_ttl);
        assert_eq!(defaults.local_node, 0);
    }

    #[test]
    fn status_derivation() {
        use ConnectionSessionState as S;
        use DevicePairingState as P;
        assert_eq!(
            LinkStatus::derive(P::Invalidated, S::Scanning, LinkState::Connected, true),
            LinkStatus::NeedsRepair
        );
        assert_eq!(
            LinkStatus::derive(P::Disconnected, S::Failed, LinkState::Disconnected, false),
            LinkStatus::ReconnectFailed
        );
        assert_eq!(
            LinkStatus::derive(P::Connecting, S::Connecting, LinkState::Connecting, false),
            LinkStatus::Reconnecting
        );
        assert_eq!(
            LinkStatus::derive(P::Connected, S::Idle, LinkState::Connected, false),
            LinkStatus::Handshaking
        );
        assert_eq!(
            LinkStatus::derive(P::Connected, S::Idle, LinkState::Connected, true),
            LinkStatus::Ready
        );
        assert_eq!(
            LinkStatus::derive(P::Disconnected, S::ManualConnecting, LinkState::Disconnected, false),
            LinkStatus::Connecting
        );
        assert_eq!(
            LinkStatus::derive(P::Disconnected, S::Idle, LinkState::Disconnected, false),
            LinkStatus::Disconnected
        );
    }
}
