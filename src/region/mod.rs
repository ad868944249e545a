//! # LoRa Region Apply
//!
//! Meshtastic radios only take a new LoRa region by rebooting. The write is
//! accepted, the link drops, and the radio comes back a few seconds later with
//! the new value. [`RegionApplyCoordinator`] drives one such cycle and decides
//! success purely from what it observes afterwards:
//!
//! - the region stream reporting the requested value (radios that apply
//!   without a reboot end here)
//! - a new session for the same radio (the reboot completed)
//!
//! and failure from:
//!
//! - the link coming back as a different radio
//! - the link being given up on: background recovery exhausted, or the user
//!   disconnected ([`RegionApplyCoordinator::abandon`])
//! - the transport event stream ending
//! - pairing invalidation
//! - no confirmation within the configured timeout
//!
//! Disconnects after the write are expected and are not errors; recovery may
//! take several attempts before the radio is back.
//! While an apply is in flight [`RegionApplyCoordinator::expecting_reboot`]
//! is true so other observers can keep quiet about the drop.
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::watch;
use tokio::time::{sleep, Duration, Instant};

use crate::error::RegionError;
use crate::metrics;
use crate::protocol::{ProtocolSession, RegionCode};
use crate::session::{PairingTracker, SessionHandle, SessionId, SessionIdentity};
use crate::storage::{self, PairingStore};
use crate::transport::{DeviceId, LinkEvent, LinkState, TransportLink};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionTuning {
    pub confirm_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for RegionTuning {
    fn default() -> Self {
        Self {
            confirm_timeout: Duration::from_secs(90),
            poll_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RegionApplyStatus {
    Idle,
    Applying,
    Applied,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionApplyState {
    pub chosen_value: Option<RegionCode>,
    pub status: RegionApplyStatus,
    pub last_attempt: Option<DateTime<Utc>>,
    pub session_id_at_attempt: Option<SessionId>,
    pub target_device_id: Option<DeviceId>,
}

impl Default for RegionApplyState {
    fn default() -> Self {
        Self {
            chosen_value: None,
            status: RegionApplyStatus::Idle,
            last_attempt: None,
            session_id_at_attempt: None,
            target_device_id: None,
        }
    }
}

enum Claim {
    /// Nothing to do; resolve with this status.
    Noop(RegionApplyStatus),
    Start,
}

pub struct RegionApplyCoordinator {
    transport: Arc<dyn TransportLink>,
    protocol: Arc<dyn ProtocolSession>,
    identity: Arc<SessionIdentity>,
    pairing: Arc<PairingTracker>,
    store: Arc<dyn PairingStore>,
    tuning: RegionTuning,
    state: watch::Sender<RegionApplyState>,
    abandoned: AtomicBool,
}

impl RegionApplyCoordinator {
    pub fn new(
        transport: Arc<dyn TransportLink>,
        protocol: Arc<dyn ProtocolSession>,
        identity: Arc<SessionIdentity>,
        pairing: Arc<PairingTracker>,
        store: Arc<dyn PairingStore>,
        tuning: RegionTuning,
    ) -> Self {
        let (state, _) = watch::channel(RegionApplyState::default());
        Self {
            transport,
            protocol,
            identity,
            pairing,
            store,
            tuning,
            state,
            abandoned: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> RegionApplyState {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> RegionApplyStatus {
        self.state.borrow().status
    }

    pub fn subscribe(&self) -> watch::Receiver<RegionApplyState> {
        self.state.subscribe()
    }

    /// A region write is out and the radio is expected to reboot.
    pub fn expecting_reboot(&self) -> bool {
        self.status() == RegionApplyStatus::Applying
    }

    /// The radio will not come back on its own (recovery gave up or the user
    /// disconnected). An apply in flight fails with [`RegionError::LinkLost`]
    /// within one poll interval.
    pub fn abandon(&self) {
        if self.expecting_reboot() {
            info!("Link given up while a region apply was waiting for the radio");
            self.abandoned.store(true, Ordering::SeqCst);
        }
    }

    /// Change the radio's region and wait for the reboot cycle to confirm it.
    ///
    /// Returns immediately with the current status when `region` is already
    /// applied or already being applied. Fails synchronously with
    /// [`RegionError::NotConnected`] when there is no live session, and with
    /// [`RegionError::Busy`] when a different value is still being applied.
    pub async fn apply_region(&self, region: RegionCode) -> Result<RegionApplyStatus, RegionError> {
        if let Some(status) = self.noop_status(region)? {
            debug!("Region {} already {:?}; nothing to write", region, status);
            return Ok(status);
        }

        let session = match self.identity.current() {
            Some(s)
                if self.transport.state() == LinkState::Connected
                    && self.protocol.handshake_complete() =>
            {
                s
            }
            _ => return Err(RegionError::NotConnected),
        };

        // Subscribe before the write so nothing the radio does afterwards is missed.
        let mut link_rx = self.transport.subscribe();
        let mut region_rx = self.protocol.subscribe_region();
        let mut session_rx = self.identity.subscribe();
        let _ = session_rx.borrow_and_update();

        match self.claim(region, &session)? {
            Claim::Noop(status) => return Ok(status),
            Claim::Start => self.abandoned.store(false, Ordering::SeqCst),
        }
        info!(
            "Applying region {} to {} (session {})",
            region, session.device, session.id
        );

        if let Err(e) = self.protocol.set_region(region).await {
            warn!("Region write to {} rejected: {}", session.device, e);
            return Err(self.fail(region, RegionError::WriteRejected(e)));
        }

        let deadline = Instant::now() + self.tuning.confirm_timeout;
        let mut saw_disconnect = false;
        let mut region_stream_open = true;
        loop {
            let slice = self
                .tuning
                .poll_interval
                .min(deadline.saturating_duration_since(Instant::now()));
            tokio::select! {
                reported = region_rx.recv(), if region_stream_open => match reported {
                    Ok(value) if value == region => {
                        debug!("Radio reports region {}", value);
                        return Ok(self.succeed(region).await);
                    }
                    Ok(other) => debug!("Radio reports region {} while waiting for {}", other, region),
                    Err(RecvError::Lagged(n)) => debug!("Region stream lagged by {}", n),
                    Err(RecvError::Closed) => region_stream_open = false,
                },
                event = link_rx.recv() => match event {
                    Ok(LinkEvent::StateChanged { state: LinkState::Disconnected, .. }) => {
                        // Drops are expected while the radio reboots and recovery
                        // may need several tries; only the deadline ends the wait.
                        if !saw_disconnect {
                            info!("Radio {} disconnected for region reboot", session.device);
                        }
                        saw_disconnect = true;
                    }
                    Ok(LinkEvent::StateChanged { state: LinkState::Connected, device: Some(found) }) => {
                        if found != session.device {
                            return Err(self.fail(region, mismatch(&session.device, &found)));
                        }
                    }
                    Ok(LinkEvent::PairingInvalidated { device }) if device == session.device => {
                        return Err(self.fail(region, RegionError::PairingInvalidated));
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => debug!("Link event stream lagged by {}", n),
                    Err(RecvError::Closed) => {
                        return Err(self.fail(region, RegionError::LinkLost));
                    }
                },
                changed = session_rx.changed() => {
                    if changed.is_ok() {
                        let current = session_rx.borrow_and_update().clone();
                        if let Some(outcome) = self.judge_session(region, &session, current).await {
                            return outcome;
                        }
                    }
                },
                _ = sleep(slice) => {}
            }

            if self.pairing.is_invalidated() {
                return Err(self.fail(region, RegionError::PairingInvalidated));
            }
            if self.abandoned.swap(false, Ordering::SeqCst) {
                return Err(self.fail(region, RegionError::LinkLost));
            }
            if Instant::now() >= deadline {
                break;
            }
        }

        // One last look before giving up: a value or session may have just landed.
        loop {
            match region_rx.try_recv() {
                Ok(value) if value == region => return Ok(self.succeed(region).await),
                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        if let Some(outcome) = self.judge_session(region, &session, self.identity.current()).await {
            return outcome;
        }
        let waited = self.tuning.confirm_timeout;
        warn!(
            "No confirmation of region {} from {} within {:?} (saw_disconnect={})",
            region, session.device, waited, saw_disconnect
        );
        Err(self.fail(region, RegionError::Timeout(waited)))
    }

    /// Apply the reset rules when a new session starts. A new session for the
    /// radio an apply is bound to keeps the state; any other change clears it.
    /// An attempt still in flight is left for its own wait to resolve.
    pub fn on_session_changed(&self, session: &SessionHandle) {
        self.state.send_if_modified(|s| {
            let same_device = s.target_device_id.as_ref() == Some(&session.device);
            let keep = match s.status {
                RegionApplyStatus::Applying => true,
                RegionApplyStatus::Applied => same_device,
                RegionApplyStatus::Idle => s.target_device_id.is_none(),
                RegionApplyStatus::Failed => false,
            };
            if keep {
                return false;
            }
            debug!(
                "Session {} on {} resets region apply state ({:?})",
                session.id, session.device, s.status
            );
            *s = RegionApplyState::default();
            true
        });
    }

    /// Forget any apply bound to the current radio (device forgotten).
    pub fn reset(&self) {
        self.state.send_replace(RegionApplyState::default());
    }

    fn noop_status(&self, region: RegionCode) -> Result<Option<RegionApplyStatus>, RegionError> {
        let s = self.state.borrow();
        match s.status {
            RegionApplyStatus::Applied | RegionApplyStatus::Applying
                if s.chosen_value == Some(region) =>
            {
                Ok(Some(s.status))
            }
            RegionApplyStatus::Applying => Err(RegionError::Busy(
                s.chosen_value.map(|r| r.to_string()).unwrap_or_default(),
            )),
            _ => Ok(None),
        }
    }

    /// Atomically move to `Applying` for `region`.
    fn claim(&self, region: RegionCode, session: &SessionHandle) -> Result<Claim, RegionError> {
        let mut outcome = Ok(Claim::Start);
        self.state.send_if_modified(|s| {
            match s.status {
                RegionApplyStatus::Applying if s.chosen_value == Some(region) => {
                    outcome = Ok(Claim::Noop(RegionApplyStatus::Applying));
                    return false;
                }
                RegionApplyStatus::Applying => {
                    outcome = Err(RegionError::Busy(
                        s.chosen_value.map(|r| r.to_string()).unwrap_or_default(),
                    ));
                    return false;
                }
                RegionApplyStatus::Applied if s.chosen_value == Some(region) => {
                    outcome = Ok(Claim::Noop(RegionApplyStatus::Applied));
                    return false;
                }
                _ => {}
            }
            *s = RegionApplyState {
                chosen_value: Some(region),
                status: RegionApplyStatus::Applying,
                last_attempt: Some(Utc::now()),
                session_id_at_attempt: Some(session.id),
                target_device_id: Some(session.device.clone()),
            };
            true
        });
        outcome
    }

    /// Compare a session observed after the write with the attempt.
    async fn judge_session(
        &self,
        region: RegionCode,
        attempt: &SessionHandle,
        current: Option<SessionHandle>,
    ) -> Option<Result<RegionApplyStatus, RegionError>> {
        let current = current?;
        if current.id <= attempt.id {
            return None;
        }
        if current.device != attempt.device {
            return Some(Err(self.fail(region, mismatch(&attempt.device, &current.device))));
        }
        info!(
            "Radio {} back as session {} after region write",
            current.device, current.id
        );
        Some(Ok(self.succeed(region).await))
    }

    async fn succeed(&self, region: RegionCode) -> RegionApplyStatus {
        self.state.send_modify(|s| s.status = RegionApplyStatus::Applied);
        metrics::inc_region_applied();
        info!("Region {} applied", region);
        if let Err(e) = storage::update(self.store.as_ref(), |p| {
            p.region_configured = true;
            p.region = Some(region);
        })
        .await
        {
            warn!("Failed to persist region {}: {}", region, e);
        }
        RegionApplyStatus::Applied
    }

    fn fail(&self, region: RegionCode, err: RegionError) -> RegionError {
        self.state.send_modify(|s| s.status = RegionApplyStatus::Failed);
        metrics::inc_region_failed();
        warn!("Region {} apply failed: {}", region, err);
        err
    }
}

fn mismatch(expected: &DeviceId, found: &DeviceId) -> RegionError {
    RegionError::DeviceMismatch {
        expected: expected.to_string(),
        found: found.to_string(),
    }
}
