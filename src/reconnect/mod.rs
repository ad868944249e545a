//! # Background Reconnection
//!
//! [`ReconnectOrchestrator`] recovers a previously paired radio after an
//! unexpected drop: it waits for the radio to settle, then runs a bounded
//! number of scan → connect → handshake attempts until the session is back.
//!
//! ## Arbitration
//!
//! The orchestrator never owns the transport outright. It claims `Scanning` on
//! the [`ConnectionIntentGuard`] (only one loop can hold that claim) and moves
//! through `Connecting` → `Success` → `Idle` with compare-and-set transitions.
//! Before every step it re-reads:
//!
//! - whether the user explicitly disconnected
//! - whether the guard still holds the loop's own state (a manual connect, or an
//!   external reset to `Idle`, means stand down)
//! - whether the transport is already connected or connecting (another path won)
//! - whether the pairing has been invalidated by the radio
//!
//! Every wait is sliced by the poll interval and also wakes on guard changes,
//! so a manual connect stops the loop within one poll interval and before any
//! further `connect` call.
//!
//! ## Outcomes
//!
//! Transient failures (nothing found, immediate drop, stalled handshake) are
//! retried within the attempt budget. Exhausting the budget leaves the guard in
//! `Failed` for a short while before it resets to `Idle`; the paired device is
//! kept for a later manual retry. Pairing invalidation stops the loop at once.
use log::{debug, info, warn};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration, Instant};

use crate::config::MESHTASTIC_SERVICE_UUID;
use crate::logutil::escape_log;
use crate::metrics;
use crate::protocol::ProtocolSession;
use crate::session::{
    ConnectionIntentGuard, ConnectionSessionState, PairingTracker, SessionHandle, SessionId,
    SessionIdentity,
};
use crate::transport::{DeviceId, LinkState, ScanFilter, TargetDevice, TransportLink};

/// Timings for the reconnect loop. Built from `[link]` config via
/// [`crate::config::Config::reconnect_tuning`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectTuning {
    pub max_attempts: u32,
    pub scan_timeout: Duration,
    pub settle_delay: Duration,
    pub backoff: Duration,
    pub post_connect_settle: Duration,
    pub handshake_timeout: Duration,
    pub failed_reset_delay: Duration,
    pub poll_interval: Duration,
    pub service_filter: Option<String>,
}

impl Default for ReconnectTuning {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            scan_timeout: Duration::from_secs(15),
            settle_delay: Duration::from_secs(10),
            backoff: Duration::from_secs(4),
            post_connect_settle: Duration::from_millis(1500),
            handshake_timeout: Duration::from_secs(20),
            failed_reset_delay: Duration::from_secs(5),
            poll_interval: Duration::from_millis(250),
            service_filter: Some(MESHTASTIC_SERVICE_UUID.to_string()),
        }
    }
}

/// Why a running loop stood down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AbortReason {
    UserDisconnected,
    ManualConnect,
    /// Guard left the loop's state for something other than a manual connect.
    Cancelled,
    /// Transport became busy through another path.
    TransportBusy,
}

/// Why a loop was never started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NotStartedReason {
    AutoReconnectDisabled,
    UserDisconnected,
    NoTarget,
    PairingInvalidated,
    /// Guard was not `Idle`/`Success` (another loop or a manual connect holds it).
    GuardBusy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ReconnectOutcome {
    Recovered(SessionId),
    Aborted(AbortReason),
    Exhausted { attempts: u32 },
    Invalidated,
    NotStarted(NotStartedReason),
}

/// Progress published while a loop runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectEvent {
    Started { device: DeviceId },
    Attempt { attempt: u32, max_attempts: u32 },
    Recovered(SessionHandle),
    Failed { attempts: u32 },
    Aborted(AbortReason),
    Invalidated { device: DeviceId },
}

/// Inputs to the trigger decision that live outside the orchestrator
/// (persisted flags, region coordinator).
#[derive(Debug, Clone, Default)]
pub struct TriggerContext {
    pub auto_reconnect: bool,
    /// A region apply is waiting for the reboot cycle.
    pub expecting_reboot: bool,
    pub target: Option<TargetDevice>,
}

enum Stop {
    Aborted(AbortReason),
    Invalidated,
}

enum AttemptError {
    Transient(String),
    Stop(Stop),
}

impl From<Stop> for AttemptError {
    fn from(stop: Stop) -> Self {
        AttemptError::Stop(stop)
    }
}

pub struct ReconnectOrchestrator {
    transport: Arc<dyn TransportLink>,
    protocol: Arc<dyn ProtocolSession>,
    guard: Arc<ConnectionIntentGuard>,
    identity: Arc<SessionIdentity>,
    pairing: Arc<PairingTracker>,
    tuning: ReconnectTuning,
    events: broadcast::Sender<ReconnectEvent>,
    /// Pending `Failed` -> `Idle` reset after exhaustion.
    reset: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectOrchestrator {
    pub fn new(
        transport: Arc<dyn TransportLink>,
        protocol: Arc<dyn ProtocolSession>,
        guard: Arc<ConnectionIntentGuard>,
        identity: Arc<SessionIdentity>,
        pairing: Arc<PairingTracker>,
        tuning: ReconnectTuning,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            transport,
            protocol,
            guard,
            identity,
            pairing,
            tuning,
            events,
            reset: Mutex::new(None),
        }
    }

    pub fn tuning(&self) -> &ReconnectTuning {
        &self.tuning
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReconnectEvent> {
        self.events.subscribe()
    }

    /// Abort a pending post-exhaustion reset. The guard stays where it is.
    pub fn cancel_reset(&self) {
        let pending = self.reset.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = pending {
            handle.abort();
            debug!("Pending reconnect reset cancelled");
        }
    }

    /// True while a loop holds the guard.
    pub fn is_running(&self) -> bool {
        self.guard.state().is_background()
    }

    /// Decide whether an observed drop should start a loop.
    pub fn evaluate_trigger(&self, ctx: &TriggerContext) -> Result<TargetDevice, NotStartedReason> {
        if self.guard.user_disconnected() {
            return Err(NotStartedReason::UserDisconnected);
        }
        if !ctx.auto_reconnect && !ctx.expecting_reboot {
            return Err(NotStartedReason::AutoReconnectDisabled);
        }
        if !matches!(
            self.guard.state(),
            ConnectionSessionState::Idle | ConnectionSessionState::Success
        ) {
            return Err(NotStartedReason::GuardBusy);
        }
        if self.pairing.is_invalidated() {
            return Err(NotStartedReason::PairingInvalidated);
        }
        ctx.target.clone().ok_or(NotStartedReason::NoTarget)
    }

    /// Evaluate the trigger and, when it holds, run one recovery loop.
    pub async fn run(&self, ctx: TriggerContext) -> ReconnectOutcome {
        match self.evaluate_trigger(&ctx) {
            Ok(target) => self.run_recovery(target).await,
            Err(reason) => {
                debug!("Reconnect not started: {:?}", reason);
                ReconnectOutcome::NotStarted(reason)
            }
        }
    }

    /// Run a recovery loop for `target` unconditionally (subject only to the
    /// single-loop claim on the guard).
    pub async fn run_recovery(&self, target: TargetDevice) -> ReconnectOutcome {
        if !self.guard.try_begin_background() {
            debug!(
                "Reconnect for {} not started; guard is {:?}",
                target.id,
                self.guard.state()
            );
            return ReconnectOutcome::NotStarted(NotStartedReason::GuardBusy);
        }
        let started_at = Instant::now();
        metrics::inc_reconnect_started();
        info!(
            "Link to {} ({}) lost; reconnecting (up to {} attempts)",
            target.last_known_name, target.id, self.tuning.max_attempts
        );
        let _ = self.events.send(ReconnectEvent::Started {
            device: target.id.clone(),
        });

        let outcome = match self.recovery_loop(&target, started_at).await {
            Ok(outcome) => outcome,
            Err(Stop::Aborted(reason)) => {
                self.stand_down(reason);
                ReconnectOutcome::Aborted(reason)
            }
            Err(Stop::Invalidated) => {
                warn!(
                    "Pairing with {} invalidated; reconnect abandoned, re-pair required",
                    target.id
                );
                metrics::inc_reconnect_aborted();
                self.release_claim();
                let _ = self.events.send(ReconnectEvent::Invalidated {
                    device: target.id.clone(),
                });
                ReconnectOutcome::Invalidated
            }
        };
        debug!("Reconnect loop for {} finished: {:?}", target.id, outcome);
        outcome
    }

    async fn recovery_loop(
        &self,
        target: &TargetDevice,
        started_at: Instant,
    ) -> Result<ReconnectOutcome, Stop> {
        use ConnectionSessionState::*;

        // Give a rebooting radio time to come back before the first scan.
        self.wait(self.tuning.settle_delay, Scanning, true).await?;

        let max = self.tuning.max_attempts;
        for attempt in 1..=max {
            metrics::inc_reconnect_attempts();
            let _ = self.events.send(ReconnectEvent::Attempt {
                attempt,
                max_attempts: max,
            });
            debug!("Reconnect attempt {}/{} for {}", attempt, max, target.id);

            match self.attempt(target).await {
                Ok(handle) => {
                    metrics::observe_recovered(started_at.elapsed());
                    info!(
                        "Reconnected to {} after {} attempt(s) as session {}",
                        target.id, attempt, handle.id
                    );
                    let id = handle.id;
                    let _ = self.events.send(ReconnectEvent::Recovered(handle));
                    self.guard.transition(Success, Idle);
                    return Ok(ReconnectOutcome::Recovered(id));
                }
                Err(AttemptError::Stop(stop)) => return Err(stop),
                Err(AttemptError::Transient(reason)) => {
                    debug!(
                        "Reconnect attempt {}/{} for {} failed: {}",
                        attempt, max, target.id, reason
                    );
                    // Failed attempts fall back to Scanning for the next one.
                    if self.guard.state() == Connecting
                        && !self.guard.transition(Connecting, Scanning)
                    {
                        return Err(self.lost_claim(Connecting));
                    }
                    if attempt < max {
                        self.wait(self.tuning.backoff, Scanning, true).await?;
                    }
                }
            }
        }

        self.exhausted(target, max);
        Ok(ReconnectOutcome::Exhausted { attempts: max })
    }

    /// One scan → connect → handshake → settle pass.
    async fn attempt(&self, target: &TargetDevice) -> Result<SessionHandle, AttemptError> {
        use ConnectionSessionState::*;

        self.check(Scanning, true)?;
        if !self.scan_for(target).await? {
            return Err(AttemptError::Transient(format!("{} not seen during scan", target.id)));
        }

        self.check(Scanning, true)?;
        if !self.guard.transition(Scanning, Connecting) {
            return Err(self.lost_claim(Scanning).into());
        }
        // Single writer: last look before touching the transport.
        self.check(Connecting, true)?;
        if let Err(e) = self.transport.connect(target).await {
            if e.is_terminal() {
                return Err(Stop::Invalidated.into());
            }
            return Err(AttemptError::Transient(e.to_string()));
        }

        let handshake = self
            .guarded(Connecting, timeout(self.tuning.handshake_timeout, self.protocol.start()))
            .await?;
        match handshake {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = self.transport.disconnect().await;
                return Err(AttemptError::Transient(format!("handshake: {}", e)));
            }
            Err(_) => {
                let _ = self.transport.disconnect().await;
                return Err(AttemptError::Transient(format!(
                    "handshake timed out after {:?}",
                    self.tuning.handshake_timeout
                )));
            }
        }

        // A link that drops again straight away does not count as recovered.
        self.wait(self.tuning.post_connect_settle, Connecting, false).await?;
        if self.transport.state() != LinkState::Connected
            || self.transport.connected_device().as_ref() != Some(&target.id)
            || !self.protocol.handshake_complete()
        {
            if self.transport.connected_device().as_ref() == Some(&target.id) {
                let _ = self.transport.disconnect().await;
            }
            return Err(AttemptError::Transient("link dropped during settle".into()));
        }

        if !self.guard.transition(Connecting, Success) {
            return Err(self.lost_claim(Connecting).into());
        }
        Ok(self.identity.mint(&target.id))
    }

    /// Scan until `target` shows up or the scan window closes.
    async fn scan_for(&self, target: &TargetDevice) -> Result<bool, AttemptError> {
        let filter = ScanFilter::for_device(self.tuning.service_filter.clone(), &target.id);
        let mut results = match self.transport.scan(self.tuning.scan_timeout, &filter).await {
            Ok(rx) => rx,
            Err(e) if e.is_terminal() => return Err(Stop::Invalidated.into()),
            Err(e) => return Err(AttemptError::Transient(e.to_string())),
        };
        // Let the driver close the window; the extra poll slice only guards a stuck driver.
        let deadline = Instant::now() + self.tuning.scan_timeout + self.tuning.poll_interval;
        let mut guard_rx = self.guard.subscribe();
        loop {
            let slice = self
                .tuning
                .poll_interval
                .min(deadline.saturating_duration_since(Instant::now()));
            tokio::select! {
                found = results.recv() => match found {
                    Some(device) if filter.matches(&device) => {
                        debug!(
                            "Found {} ({}) rssi={}",
                            escape_log(&device.name),
                            device.id,
                            device.rssi
                        );
                        return Ok(true);
                    }
                    Some(_) => {}
                    None => return Ok(false),
                },
                _ = guard_rx.changed() => {}
                _ = sleep(slice) => {}
            }
            self.check(ConnectionSessionState::Scanning, true)?;
            if Instant::now() >= deadline {
                return Ok(false);
            }
        }
    }

    /// Cancellable sleep: sliced by the poll interval, wakes on guard changes.
    async fn wait(
        &self,
        total: Duration,
        own: ConnectionSessionState,
        transport_must_be_idle: bool,
    ) -> Result<(), Stop> {
        let deadline = Instant::now() + total;
        let mut guard_rx = self.guard.subscribe();
        loop {
            if let Some(stop) = self.abort_reason(own, transport_must_be_idle) {
                return Err(stop);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let slice = self.tuning.poll_interval.min(deadline - now);
            tokio::select! {
                _ = guard_rx.changed() => {}
                _ = sleep(slice) => {}
            }
        }
    }

    /// Drive `fut` while polling the abort conditions.
    async fn guarded<F, T>(&self, own: ConnectionSessionState, fut: F) -> Result<T, Stop>
    where
        F: Future<Output = T>,
    {
        tokio::pin!(fut);
        let mut guard_rx = self.guard.subscribe();
        loop {
            tokio::select! {
                out = &mut fut => return Ok(out),
                _ = guard_rx.changed() => {}
                _ = sleep(self.tuning.poll_interval) => {}
            }
            if let Some(stop) = self.abort_reason(own, false) {
                return Err(stop);
            }
        }
    }

    fn check(&self, own: ConnectionSessionState, transport_must_be_idle: bool) -> Result<(), Stop> {
        match self.abort_reason(own, transport_must_be_idle) {
            Some(stop) => Err(stop),
            None => Ok(()),
        }
    }

    fn abort_reason(&self, own: ConnectionSessionState, transport_must_be_idle: bool) -> Option<Stop> {
        if self.pairing.is_invalidated() {
            return Some(Stop::Invalidated);
        }
        if self.guard.user_disconnected() {
            return Some(Stop::Aborted(AbortReason::UserDisconnected));
        }
        match self.guard.state() {
            ConnectionSessionState::ManualConnecting => {
                return Some(Stop::Aborted(AbortReason::ManualConnect))
            }
            s if s != own => return Some(Stop::Aborted(AbortReason::Cancelled)),
            _ => {}
        }
        if transport_must_be_idle && self.transport.state().is_busy() {
            return Some(Stop::Aborted(AbortReason::TransportBusy));
        }
        None
    }

    /// A compare-and-set from `own` failed; work out who took the guard.
    fn lost_claim(&self, own: ConnectionSessionState) -> Stop {
        self.abort_reason(own, false)
            .unwrap_or(Stop::Aborted(AbortReason::Cancelled))
    }

    /// Race lost or cancelled: release our claim (if still ours) and go quiet.
    fn stand_down(&self, reason: AbortReason) {
        debug!("Reconnect loop aborted: {:?}", reason);
        metrics::inc_reconnect_aborted();
        self.release_claim();
        let _ = self.events.send(ReconnectEvent::Aborted(reason));
    }

    fn release_claim(&self) {
        use ConnectionSessionState::*;
        for own in [Scanning, Connecting, Success] {
            if self.guard.transition(own, Idle) {
                break;
            }
        }
    }

    fn exhausted(&self, target: &TargetDevice, attempts: u32) {
        use ConnectionSessionState::*;
        metrics::inc_reconnect_exhausted();
        warn!(
            "Could not reconnect to {} after {} attempts; manual reconnect required",
            target.id, attempts
        );
        if !(self.guard.transition(Scanning, Failed) || self.guard.transition(Connecting, Failed)) {
            debug!("Guard moved on before exhaustion was recorded");
            return;
        }
        let _ = self.events.send(ReconnectEvent::Failed { attempts });

        let guard = self.guard.clone();
        let delay = self.tuning.failed_reset_delay;
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            if guard.transition(Failed, Idle) {
                debug!("Reconnect state reset to Idle after failure");
            }
        });
        let previous = self
            .reset
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

/// Follow a guard receiver until it reports `state`. Returns false if the
/// guard was dropped first.
pub async fn wait_for_state(
    rx: &mut watch::Receiver<ConnectionSessionState>,
    state: ConnectionSessionState,
) -> bool {
    loop {
        if *rx.borrow_and_update() == state {
            return true;
        }
        if rx.changed().await.is_err() {
            return false;
        }
    }
}
